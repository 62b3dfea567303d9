//! Storage abstraction for Groundwork.
//!
//! The [`Store`] trait defines every persistence operation the retrieval,
//! ingestion, and version-ledger layers need, enabling pluggable backends
//! (SQLite in the application crate, in-memory here).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Atomicity
//!
//! - [`insert_document`](Store::insert_document) writes a document and all
//!   of its segments in one unit; readers never observe a document with a
//!   partial segment list.
//! - [`create_message`](Store::create_message) and
//!   [`append_version`](Store::append_version) write a version row together
//!   with all of its claims and citations, or nothing.
//! - `append_version` computes the next version number from the current
//!   maximum at the instant of insertion. Two concurrent appends to the
//!   same message never receive the same number.
//! - A [`Refined`](crate::models::VersionSource::Refined) version is
//!   only appended while the message is a draft. The status is checked
//!   in the same unit as the write, so a message finalized
//!   mid-refinement rejects the append with [`AppendRejected::Finalized`].

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    Document, DocumentSummary, Message, MessageStatus, MessageSummary, NewVersion, Segment,
    Version,
};

/// Why [`Store::append_version`] refused to write.
///
/// Implementations return it inside the `anyhow::Error`; callers recover
/// it with `downcast_ref`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppendRejected {
    #[error("unknown message {0}")]
    UnknownMessage(String),
    #[error("message {0} is finalized")]
    Finalized(String),
}

/// Abstract storage backend for Groundwork.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_document`](Store::insert_document) | Store a document and its segments |
/// | [`get_document`](Store::get_document) | Look up a document by id |
/// | [`find_document_by_external_id`](Store::find_document_by_external_id) | Look up by external identifier |
/// | [`find_document_by_hash`](Store::find_document_by_hash) | Look up by content hash |
/// | [`delete_document`](Store::delete_document) | Delete a document, cascading to segments |
/// | [`list_documents`](Store::list_documents) | Documents with segment counts |
/// | [`segments_by_ids`](Store::segments_by_ids) | Resolve segments by id |
/// | [`phrase_search`](Store::phrase_search) | Ranked full-text phrase match |
/// | [`segments_in_order`](Store::segments_in_order) | Positional listing used as retrieval fallback |
/// | [`add_to_working_set`](Store::add_to_working_set) | Activate a document |
/// | [`remove_from_working_set`](Store::remove_from_working_set) | Deactivate a document |
/// | [`working_set`](Store::working_set) | Active document ids |
/// | [`create_message`](Store::create_message) | New draft message with version 1 |
/// | [`append_version`](Store::append_version) | Next version of an existing message |
/// | [`get_message`](Store::get_message) | Message row by id |
/// | [`set_message_status`](Store::set_message_status) | Assign draft/finalized |
/// | [`latest_version`](Store::latest_version) | Highest-numbered version |
/// | [`versions`](Store::versions) | Full ordered history |
/// | [`list_messages`](Store::list_messages) | One summary per message |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a document together with its segments.
    async fn insert_document(&self, doc: &Document, segments: &[Segment]) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn find_document_by_external_id(&self, external_id: &str) -> Result<Option<Document>>;

    async fn find_document_by_hash(&self, dedup_hash: &str) -> Result<Option<Document>>;

    /// Delete a document and everything it owns. Returns `false` if unknown.
    async fn delete_document(&self, id: &str) -> Result<bool>;

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>>;

    /// Resolve segments by id; unknown ids are skipped.
    async fn segments_by_ids(&self, ids: &[String]) -> Result<Vec<Segment>>;

    /// Full-text phrase match restricted to `document_ids`, best first.
    ///
    /// `phrase` has already been stripped of search-syntax characters.
    async fn phrase_search(
        &self,
        phrase: &str,
        document_ids: &[String],
        limit: i64,
    ) -> Result<Vec<Segment>>;

    /// Segments of `document_ids` ordered by `(document_id, chunk_index)`.
    async fn segments_in_order(&self, document_ids: &[String], limit: i64)
        -> Result<Vec<Segment>>;

    async fn add_to_working_set(&self, document_id: &str) -> Result<()>;

    async fn remove_from_working_set(&self, document_id: &str) -> Result<bool>;

    async fn working_set(&self) -> Result<Vec<String>>;

    /// Create a `draft` message whose version 1 is `first`.
    async fn create_message(&self, first: &NewVersion) -> Result<(Message, Version)>;

    /// Append the next version to an existing message.
    ///
    /// Fails with [`AppendRejected`] when the message is unknown, or when
    /// `version.source` requires a draft and the message is finalized.
    async fn append_version(&self, message_id: &str, version: &NewVersion) -> Result<Version>;

    async fn get_message(&self, id: &str) -> Result<Option<Message>>;

    /// Assign a status. Returns `None` if the message does not exist.
    async fn set_message_status(&self, id: &str, status: MessageStatus)
        -> Result<Option<Message>>;

    async fn latest_version(&self, message_id: &str) -> Result<Option<Version>>;

    /// All versions of a message in ascending version order.
    async fn versions(&self, message_id: &str) -> Result<Vec<Version>>;

    async fn list_messages(&self) -> Result<Vec<MessageSummary>>;
}
