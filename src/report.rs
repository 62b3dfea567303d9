//! Grounding report for the latest version of a message.

use anyhow::{anyhow, Result};
use serde::Serialize;

use groundwork_core::models::{ClaimStatus, MessageDetail};

#[derive(Debug, Clone, Serialize)]
pub struct ClaimFailure {
    pub claim_text: String,
    pub status: ClaimStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroundingReport {
    pub message_id: String,
    pub version: i64,
    /// `true` when no claim was dropped.
    pub pass: bool,
    pub total_claims: usize,
    pub supported: usize,
    pub dropped: usize,
    pub support_rate: f64,
    pub failures: Vec<ClaimFailure>,
}

/// Evaluate the highest-numbered version of `detail`.
///
/// Fails when the message has no versions.
pub fn evaluate(detail: &MessageDetail) -> Result<GroundingReport> {
    let latest = detail
        .versions
        .iter()
        .max_by_key(|v| v.version_number)
        .ok_or_else(|| anyhow!("Message {} has no versions", detail.id))?;

    let supported = latest.claims.len();
    let dropped = latest.dropped_claims.len();
    let total = supported + dropped;

    let support_rate = if total == 0 {
        1.0
    } else {
        (supported as f64 / total as f64 * 10_000.0).round() / 10_000.0
    };

    Ok(GroundingReport {
        message_id: detail.id.clone(),
        version: latest.version_number,
        pass: dropped == 0,
        total_claims: total,
        supported,
        dropped,
        support_rate,
        failures: latest
            .dropped_claims
            .iter()
            .map(|c| ClaimFailure {
                claim_text: c.text.clone(),
                status: c.status,
                reason: c.reason.clone(),
            })
            .collect(),
    })
}
