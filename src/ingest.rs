//! Document ingestion and evidence-store management.
//!
//! Ingestion normalizes a new document, splits it into segments, stores
//! both in one unit, and adds the document to the working set. A document
//! that is already present (same external id, or same title and body) is
//! not stored twice: the existing one is returned and re-activated.

use std::collections::HashSet;

use anyhow::{bail, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use groundwork_core::models::{Document, DocumentStatus, DocumentSummary};
use groundwork_core::segment::split_segments;
use groundwork_core::store::Store;

/// A document as supplied by the caller.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    pub body: String,
    /// Identifier in an external bibliographic service, e.g. a PMID.
    pub external_id: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub document: Document,
    pub segment_count: usize,
    /// `false` when an existing document was returned instead.
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentListing {
    #[serde(flatten)]
    pub summary: DocumentSummary,
    pub in_working_set: bool,
}

/// SHA-256 over title and body, hex encoded.
pub fn dedup_hash(title: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

pub async fn ingest_document(
    store: &dyn Store,
    new: NewDocument,
    max_chars: usize,
) -> Result<IngestOutcome> {
    let title = new.title.trim().to_string();
    let body = new.body.trim().to_string();
    if title.is_empty() {
        bail!("document title is empty");
    }
    if body.is_empty() {
        bail!("document body is empty");
    }
    let external_id = new
        .external_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());
    let hash = dedup_hash(&title, &body);

    let existing = match &external_id {
        Some(ext) => store.find_document_by_external_id(ext).await?,
        None => None,
    };
    let existing = match existing {
        Some(doc) => Some(doc),
        None => store.find_document_by_hash(&hash).await?,
    };

    if let Some(document) = existing {
        store.add_to_working_set(&document.id).await?;
        let segment_count = store
            .list_documents()
            .await?
            .into_iter()
            .find(|d| d.id == document.id)
            .map(|d| d.segment_count as usize)
            .unwrap_or(0);
        info!(document_id = %document.id, "document already ingested");
        return Ok(IngestOutcome {
            document,
            segment_count,
            created: false,
        });
    }

    let document = Document {
        id: Uuid::new_v4().to_string(),
        external_id,
        title,
        source: new.source,
        body,
        status: DocumentStatus::Active,
        dedup_hash: hash,
        created_at: chrono::Utc::now().timestamp(),
    };
    let segments = split_segments(&document.id, &document.body, max_chars);

    store.insert_document(&document, &segments).await?;
    store.add_to_working_set(&document.id).await?;

    info!(
        document_id = %document.id,
        segments = segments.len(),
        "ingested document"
    );

    Ok(IngestOutcome {
        document,
        segment_count: segments.len(),
        created: true,
    })
}

/// Delete a document, its segments, and its working-set membership.
/// Returns `false` if the document did not exist.
pub async fn remove_document(store: &dyn Store, document_id: &str) -> Result<bool> {
    let removed = store.delete_document(document_id).await?;
    if removed {
        info!(document_id, "removed document");
    }
    Ok(removed)
}

/// Every document with its segment count and working-set membership.
pub async fn list_documents(store: &dyn Store) -> Result<Vec<DocumentListing>> {
    let active: HashSet<String> = store.working_set().await?.into_iter().collect();
    Ok(store
        .list_documents()
        .await?
        .into_iter()
        .map(|summary| DocumentListing {
            in_working_set: active.contains(&summary.id),
            summary,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use groundwork_core::store::memory::InMemoryStore;

    fn new_doc(title: &str, body: &str, external_id: Option<&str>) -> NewDocument {
        NewDocument {
            title: title.to_string(),
            body: body.to_string(),
            external_id: external_id.map(str::to_string),
            source: "upload".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ingest_splits_and_activates() {
        let store = InMemoryStore::new();
        let outcome = ingest_document(
            &store,
            new_doc("Trial", "First sentence. Second sentence. Third sentence.", None),
            20,
        )
        .await
        .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.segment_count, 3);
        assert_eq!(store.working_set().await.unwrap(), vec![outcome.document.id]);
    }

    #[tokio::test]
    async fn test_existing_external_id_returns_existing() {
        let store = InMemoryStore::new();
        let first = ingest_document(&store, new_doc("A", "Body one.", Some("12345")), 500)
            .await
            .unwrap();
        store
            .remove_from_working_set(&first.document.id)
            .await
            .unwrap();

        let second = ingest_document(&store, new_doc("A v2", "Body two.", Some("12345")), 500)
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.document.id, first.document.id);
        assert_eq!(second.segment_count, 1);
        assert_eq!(store.working_set().await.unwrap().len(), 1);
        assert_eq!(store.list_documents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_identical_content_deduplicated() {
        let store = InMemoryStore::new();
        let a = ingest_document(&store, new_doc("T", "Same body.", None), 500)
            .await
            .unwrap();
        let b = ingest_document(&store, new_doc("T", "  Same body.  ", None), 500)
            .await
            .unwrap();
        assert_eq!(a.document.id, b.document.id);
        assert!(!b.created);
    }

    #[tokio::test]
    async fn test_rejects_empty_body() {
        let store = InMemoryStore::new();
        assert!(ingest_document(&store, new_doc("T", "   ", None), 500)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let store = InMemoryStore::new();
        let a = ingest_document(&store, new_doc("A", "Alpha.", None), 500)
            .await
            .unwrap();
        let b = ingest_document(&store, new_doc("B", "Beta.", None), 500)
            .await
            .unwrap();
        store.remove_from_working_set(&b.document.id).await.unwrap();

        let listing = list_documents(&store).await.unwrap();
        assert_eq!(listing.len(), 2);
        assert!(listing.iter().any(|d| d.summary.id == a.document.id && d.in_working_set));
        assert!(listing.iter().any(|d| d.summary.id == b.document.id && !d.in_working_set));

        assert!(remove_document(&store, &a.document.id).await.unwrap());
        assert!(!remove_document(&store, &a.document.id).await.unwrap());
        assert_eq!(list_documents(&store).await.unwrap().len(), 1);
    }

    #[test]
    fn test_dedup_hash_separates_title_and_body() {
        assert_ne!(dedup_hash("ab", "c"), dedup_hash("a", "bc"));
        assert_eq!(dedup_hash("a", "b").len(), 64);
    }
}
