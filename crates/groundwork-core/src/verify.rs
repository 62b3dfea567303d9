//! Citation-grounding verifier.
//!
//! Decides, for every candidate claim, whether it may reach the user. A
//! claim survives only if at least one of its citations names a segment in
//! the evidence set under consideration **and** the claim's vocabulary is
//! sufficiently contained in that segment.
//!
//! # Overlap score
//!
//! ```text
//! overlap(claim, segment) = |words(claim) ∩ words(segment)| / |words(claim)|
//! ```
//!
//! where `words` is the set of distinct, lowercased, whitespace-separated
//! tokens. The score is `0.0` for a claim with no words.
//!
//! Verification is a pure function of its inputs.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::models::{CandidateClaim, Citation, Claim, Segment};

/// Default minimum overlap score for a citation to count.
pub const DEFAULT_OVERLAP_THRESHOLD: f64 = 0.3;

pub const REASON_NO_CITATIONS: &str = "No citations provided";
pub const REASON_UNGROUNDED: &str = "All citations invalid or below overlap threshold";

/// The supported/dropped partition produced by [`verify`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Verification {
    pub supported: Vec<Claim>,
    pub dropped: Vec<Claim>,
}

impl Verification {
    /// Supported claim texts joined by a single space.
    pub fn message_text(&self) -> String {
        self.supported
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// One warning line per dropped claim.
    pub fn warnings(&self) -> Vec<String> {
        self.dropped
            .iter()
            .map(|c| {
                format!(
                    "Dropped claim: '{}' - {}",
                    c.text,
                    c.reason.as_deref().unwrap_or_default()
                )
            })
            .collect()
    }
}

/// Partition `claims` into supported and dropped against `available`.
///
/// Citations are resolved by segment id only. Invalid or weak citations
/// are pruned from otherwise-supported claims.
pub fn verify(claims: &[CandidateClaim], available: &[Segment], threshold: f64) -> Verification {
    let by_id: HashMap<&str, &Segment> = available.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut result = Verification::default();

    for claim in claims {
        if claim.citations.is_empty() {
            result
                .dropped
                .push(Claim::dropped(&claim.text, REASON_NO_CITATIONS));
            continue;
        }

        let kept: Vec<Citation> = claim
            .citations
            .iter()
            .filter(|cit| match by_id.get(cit.segment_id.as_str()) {
                Some(segment) => overlap_score(&claim.text, &segment.content) >= threshold,
                None => false,
            })
            .cloned()
            .collect();

        if kept.is_empty() {
            result
                .dropped
                .push(Claim::dropped(&claim.text, REASON_UNGROUNDED));
        } else {
            result.supported.push(Claim::supported(&claim.text, kept));
        }
    }

    result
}

/// Fraction of the claim's distinct words that also occur in the segment.
pub fn overlap_score(claim_text: &str, segment_text: &str) -> f64 {
    let claim_words = word_set(claim_text);
    if claim_words.is_empty() {
        return 0.0;
    }
    let segment_words = word_set(segment_text);
    let shared = claim_words.intersection(&segment_words).count();
    shared as f64 / claim_words.len() as f64
}

fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(|w| w.to_lowercase()).collect()
}
