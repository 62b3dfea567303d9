//! Core data models used throughout Groundwork.
//!
//! These types represent the evidence (documents and their segments) and
//! the drafted output (messages, versions, claims, citations) that flow
//! through the generation-verification-versioning pipeline.

use serde::{Deserialize, Serialize};

/// Lifecycle flag on an evidence document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Active,
    Archived,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Active => "active",
            DocumentStatus::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(DocumentStatus::Active),
            "archived" => Some(DocumentStatus::Archived),
            _ => None,
        }
    }
}

/// An evidence source stored in the evidence store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Identifier in an external bibliographic service (e.g. a PMID).
    pub external_id: Option<String>,
    pub title: String,
    /// Where the document came from (`upload`, `pubmed`, ...).
    pub source: String,
    pub body: String,
    pub status: DocumentStatus,
    /// SHA-256 over title and body, used to detect re-ingestion.
    pub dedup_hash: String,
    pub created_at: i64,
}

/// One retrievable, citable slice of a document body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub document_id: String,
    /// Zero-based position within the document.
    pub chunk_index: i64,
    pub content: String,
}

/// A document together with the number of segments it was split into.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub id: String,
    pub external_id: Option<String>,
    pub title: String,
    pub source: String,
    pub status: DocumentStatus,
    pub segment_count: i64,
}

/// Coarse lifecycle status of a drafted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Draft,
    Finalized,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Draft => "draft",
            MessageStatus::Finalized => "finalized",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(MessageStatus::Draft),
            "finalized" => Some(MessageStatus::Finalized),
            _ => None,
        }
    }
}

/// Which operation produced a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSource {
    Generated,
    Refined,
    Edited,
}

impl VersionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionSource::Generated => "generated",
            VersionSource::Refined => "refined",
            VersionSource::Edited => "edited",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "generated" => Some(VersionSource::Generated),
            "refined" => Some(VersionSource::Refined),
            "edited" => Some(VersionSource::Edited),
            _ => None,
        }
    }

    /// Only drafts may be refined; edits are accepted in any status.
    pub fn requires_draft(&self) -> bool {
        matches!(self, VersionSource::Refined)
    }
}

/// Outcome of grounding verification for a single claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Supported,
    Dropped,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Supported => "supported",
            ClaimStatus::Dropped => "dropped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "supported" => Some(ClaimStatus::Supported),
            "dropped" => Some(ClaimStatus::Dropped),
            _ => None,
        }
    }
}

/// A reference from a claim to one segment of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub document_id: String,
    pub segment_id: String,
}

/// A claim as proposed by the generation backend, before verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateClaim {
    pub text: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

/// A verified claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    pub citations: Vec<Citation>,
    pub status: ClaimStatus,
    /// Human-readable reason, set only when the claim was dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Claim {
    pub fn supported(text: impl Into<String>, citations: Vec<Citation>) -> Self {
        Self {
            text: text.into(),
            citations,
            status: ClaimStatus::Supported,
            reason: None,
        }
    }

    pub fn dropped(text: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            citations: Vec::new(),
            status: ClaimStatus::Dropped,
            reason: Some(reason.into()),
        }
    }
}

/// Immutable snapshot of a message at one point in its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub message_id: String,
    /// 1-based, gapless per message.
    pub version_number: i64,
    /// Prompt, refinement instruction, or `"direct edit"`.
    pub instruction: String,
    pub text: String,
    pub claims: Vec<Claim>,
    pub dropped_claims: Vec<Claim>,
    pub source: VersionSource,
    pub created_at: i64,
}

impl Version {
    /// Every citation carried by the supported claims of this version.
    pub fn citations(&self) -> impl Iterator<Item = &Citation> {
        self.claims.iter().flat_map(|c| c.citations.iter())
    }
}

/// Version content handed to the store; the store assigns the number.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub instruction: String,
    pub text: String,
    pub claims: Vec<Claim>,
    pub dropped_claims: Vec<Claim>,
    pub source: VersionSource,
}

/// A drafted message row (without its versions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub status: MessageStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// List projection: a message with only its highest-numbered version.
#[derive(Debug, Clone, Serialize)]
pub struct MessageSummary {
    pub id: String,
    pub status: MessageStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub latest_version: Version,
}

/// Full projection: a message with its ordered version history.
#[derive(Debug, Clone, Serialize)]
pub struct MessageDetail {
    pub id: String,
    pub status: MessageStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub versions: Vec<Version>,
}
