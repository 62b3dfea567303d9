use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use groundwork::config::Config;
use groundwork::db;
use groundwork::error::LedgerError;
use groundwork::generation::{
    BackendError, FixedBackend, Generation, GenerationBackend, GenerationRequest,
};
use groundwork::ingest::{ingest_document, remove_document, NewDocument};
use groundwork::ledger::{Ledger, LedgerSettings};
use groundwork::migrate;
use groundwork::sqlite_store::SqliteStore;
use groundwork::stream::{stream_generate, StreamEvent};
use groundwork_core::models::{CandidateClaim, Citation, MessageStatus, VersionSource};
use groundwork_core::store::Store;

const INSULIN_BODY: &str = "Insulin therapy reduces HbA1c in type 2 diabetes. \
    Basal insulin is typically dosed once daily. \
    Hypoglycemia is the most common adverse event.";

struct Harness {
    _tmp: TempDir,
    store: Arc<SqliteStore>,
    document_id: String,
    segment_ids: Vec<String>,
}

async fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = Config::minimal(tmp.path().join("gw.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let store = Arc::new(SqliteStore::new(pool));

    let outcome = ingest_document(
        store.as_ref(),
        NewDocument {
            title: "Insulin review".to_string(),
            body: INSULIN_BODY.to_string(),
            external_id: Some("27182818".to_string()),
            source: "pubmed".to_string(),
        },
        60,
    )
    .await
    .unwrap();

    let segments = store
        .segments_in_order(&[outcome.document.id.clone()], 10)
        .await
        .unwrap();

    Harness {
        _tmp: tmp,
        store,
        document_id: outcome.document.id,
        segment_ids: segments.into_iter().map(|s| s.id).collect(),
    }
}

impl Harness {
    fn claim(&self, text: &str, segment: usize) -> CandidateClaim {
        CandidateClaim {
            text: text.to_string(),
            citations: vec![Citation {
                document_id: self.document_id.clone(),
                segment_id: self.segment_ids[segment].clone(),
            }],
        }
    }

    fn ledger(&self, claims: Vec<CandidateClaim>) -> Ledger {
        Ledger::new(
            self.store.clone(),
            Arc::new(FixedBackend::new(claims)),
            LedgerSettings::default(),
        )
    }

    fn docs(&self) -> Vec<String> {
        vec![self.document_id.clone()]
    }
}

#[tokio::test]
async fn test_insulin_scenario_supported_and_dropped() {
    let h = harness().await;
    assert_eq!(h.segment_ids.len(), 3);

    let ledger = h.ledger(vec![
        h.claim("Insulin therapy reduces HbA1c", 0),
        h.claim("Insulin cures diabetes completely", 2),
    ]);

    let outcome = ledger
        .generate("insulin therapy", &h.docs(), None)
        .await
        .unwrap();
    assert_eq!(outcome.text, "Insulin therapy reduces HbA1c");
    assert_eq!(outcome.claims.len(), 1);
    assert_eq!(outcome.claims[0].citations[0].segment_id, h.segment_ids[0]);
    assert_eq!(outcome.warnings.len(), 1);

    let detail = ledger.get(outcome.message_id.as_deref().unwrap()).await.unwrap();
    assert_eq!(detail.versions.len(), 1);
    assert_eq!(detail.versions[0].dropped_claims.len(), 1);
    assert_eq!(
        detail.versions[0].dropped_claims[0].reason.as_deref(),
        Some("All citations invalid or below overlap threshold")
    );
}

#[tokio::test]
async fn test_generate_edit_finalize_refine_conflicts() {
    let h = harness().await;
    let ledger = h.ledger(vec![h.claim("Basal insulin is dosed once daily", 1)]);

    let id = ledger
        .generate("basal insulin", &h.docs(), None)
        .await
        .unwrap()
        .message_id
        .unwrap();
    ledger.edit(&id, "Basal insulin is dosed daily").await.unwrap();
    ledger.set_status(&id, MessageStatus::Finalized).await.unwrap();

    let err = ledger.refine(&id, "shorter", &[], None).await.unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)));

    let detail = ledger.get(&id).await.unwrap();
    assert_eq!(detail.status, MessageStatus::Finalized);
    let sources: Vec<VersionSource> = detail.versions.iter().map(|v| v.source).collect();
    assert_eq!(sources, vec![VersionSource::Generated, VersionSource::Edited]);
}

/// Answers like `FixedBackend`, but only after `delay`.
struct SlowBackend {
    inner: FixedBackend,
    delay: Duration,
}

#[async_trait]
impl GenerationBackend for SlowBackend {
    fn name(&self) -> &str {
        "slow"
    }

    async fn generate_claims(
        &self,
        request: &GenerationRequest,
    ) -> Result<Generation, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.generate_claims(request).await
    }

    async fn stream_claims(
        &self,
        request: &GenerationRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<Generation, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.stream_claims(request, deltas).await
    }
}

#[tokio::test]
async fn test_finalize_while_refining_leaves_history_untouched() {
    let h = harness().await;
    let claims = vec![h.claim("Basal insulin is dosed once daily", 1)];
    let ledger = h.ledger(claims.clone());
    let id = ledger
        .generate("basal insulin", &h.docs(), None)
        .await
        .unwrap()
        .message_id
        .unwrap();

    let slow = Ledger::new(
        h.store.clone(),
        Arc::new(SlowBackend {
            inner: FixedBackend::new(claims),
            delay: Duration::from_millis(200),
        }),
        LedgerSettings::default(),
    );
    let docs = h.docs();
    let task_id = id.clone();
    let refine =
        tokio::spawn(async move { slow.refine(&task_id, "basal insulin", &docs, None).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    ledger.set_status(&id, MessageStatus::Finalized).await.unwrap();

    let err = refine.await.unwrap().unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)));

    let detail = ledger.get(&id).await.unwrap();
    assert_eq!(detail.status, MessageStatus::Finalized);
    assert_eq!(detail.versions.len(), 1);
}

#[tokio::test]
async fn test_concurrent_edits_get_gapless_numbers() {
    let h = harness().await;
    let ledger = h.ledger(vec![h.claim("Hypoglycemia is the most common adverse event", 2)]);
    let id = ledger
        .generate("hypoglycemia", &h.docs(), None)
        .await
        .unwrap()
        .message_id
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..10 {
        let ledger = ledger.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            ledger.edit(&id, &format!("edit number {}", i)).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let numbers: Vec<i64> = ledger
        .get(&id)
        .await
        .unwrap()
        .versions
        .iter()
        .map(|v| v.version_number)
        .collect();
    assert_eq!(numbers, (1..=11).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_citations_survive_document_removal() {
    let h = harness().await;
    let ledger = h.ledger(vec![h.claim("Insulin therapy reduces HbA1c", 0)]);
    let id = ledger
        .generate("insulin therapy", &h.docs(), None)
        .await
        .unwrap()
        .message_id
        .unwrap();

    assert!(remove_document(h.store.as_ref(), &h.document_id).await.unwrap());
    assert!(h.store.working_set().await.unwrap().is_empty());

    let detail = ledger.get(&id).await.unwrap();
    assert_eq!(
        detail.versions[0].claims[0].citations[0].document_id,
        h.document_id
    );

    // No previous segments resolve any more, so the edit is flagged.
    let edit = ledger.edit(&id, "Insulin therapy reduces HbA1c").await.unwrap();
    assert_eq!(edit.warnings.len(), 1);
}

#[tokio::test]
async fn test_stream_persists_exactly_one_version() {
    let h = harness().await;
    let ledger = h.ledger(vec![h.claim("Insulin therapy reduces HbA1c", 0)]);

    let mut rx = stream_generate(ledger.clone(), "insulin therapy".to_string(), h.docs(), None);
    let mut message_id = None;
    let mut deltas = 0;
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Delta { .. } => deltas += 1,
            StreamEvent::Final(outcome) => message_id = outcome.message_id,
            StreamEvent::Error { message } => panic!("stream failed: {}", message),
            StreamEvent::Status { .. } => {}
        }
    }
    assert!(deltas > 0);

    let id = message_id.expect("final event with a message id");
    let detail = ledger.get(&id).await.unwrap();
    assert_eq!(detail.versions.len(), 1);
    assert_eq!(ledger.list().await.unwrap().len(), 1);
}
