//! Evidence retrieval with positional fallback.
//!
//! The retriever operates entirely through the [`Store`] trait. Given a
//! query and the set of documents that may be cited, it returns at most
//! `top_k` segments:
//!
//! 1. No documents → no segments. The whole corpus is never searched.
//! 2. Strip search-syntax characters from the query. If nothing is left,
//!    skip straight to the fallback.
//! 3. Run a phrase-anchored full-text match restricted to the documents,
//!    ranked by the store's relevance score.
//! 4. If the match errors or returns nothing, fall back to the documents'
//!    segments ordered by `(document_id, chunk_index)`.
//!
//! A failing lexical search is logged and recovered; only a failing
//! fallback query is reported to the caller.

use anyhow::Result;
use tracing::{debug, warn};

use crate::models::Segment;
use crate::store::Store;

/// Default number of segments handed to the generation backend.
pub const DEFAULT_TOP_K: i64 = 5;

/// Remove characters that carry meaning in the full-text query syntax.
///
/// The query is used as a single quoted phrase, so only the quote
/// character can break out of it.
pub fn sanitize_query(query: &str) -> String {
    query
        .chars()
        .filter(|c| *c != '"')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Retrieve up to `top_k` evidence segments for `query` from `document_ids`.
pub async fn retrieve(
    store: &dyn Store,
    query: &str,
    document_ids: &[String],
    top_k: i64,
) -> Result<Vec<Segment>> {
    if document_ids.is_empty() || top_k <= 0 {
        return Ok(Vec::new());
    }

    let phrase = sanitize_query(query);
    if phrase.is_empty() {
        debug!("blank query, using positional evidence");
        return store.segments_in_order(document_ids, top_k).await;
    }

    match store.phrase_search(&phrase, document_ids, top_k).await {
        Ok(hits) if !hits.is_empty() => Ok(hits),
        Ok(_) => {
            debug!(%phrase, "no lexical match, using positional evidence");
            store.segments_in_order(document_ids, top_k).await
        }
        Err(e) => {
            warn!(error = %e, "full-text search failed, using positional evidence");
            store.segments_in_order(document_ids, top_k).await
        }
    }
}
