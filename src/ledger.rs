//! Version ledger: generate, refine, edit, and status transitions.
//!
//! A [`Ledger`] ties the evidence store, the generation backend, and the
//! grounding verifier together. Each operation that produces text runs
//! the same pipeline:
//!
//! ```text
//! retrieve evidence → backend call → verify claims → persist one version
//! ```
//!
//! # State machine
//!
//! Messages start as `draft`. Refinement requires `draft`; edits and
//! status changes only require the message to exist. `finalized → draft`
//! is permitted.
//!
//! # Zero evidence
//!
//! Generate with no evidence returns `message_id = None` and persists
//! nothing. Refine with no evidence still appends an empty version so the
//! history records the attempt.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument, warn};

use groundwork_core::models::{
    CandidateClaim, Citation, Claim, MessageDetail, MessageStatus, MessageSummary, NewVersion,
    Segment, VersionSource,
};
use groundwork_core::retrieve::retrieve;
use groundwork_core::store::Store;
use groundwork_core::verify::{verify, Verification};

use crate::config::Config;
use crate::error::{LedgerError, REFINE_FINALIZED};
use crate::generation::{
    call_deadline, create_backend, refine_prompt, with_timeout, GenerationBackend,
    GenerationRequest, GENERATION_SYSTEM_PROMPT, REFINE_SYSTEM_PROMPT,
};
use crate::sqlite_store::SqliteStore;
use crate::{db, migrate};

pub const INSUFFICIENT_EVIDENCE: &str =
    "Insufficient evidence: no relevant chunks found for the given references.";
pub const EDIT_UNGROUNDED: &str =
    "Edited text could not be grounded against previous version's evidence. Review for accuracy.";
pub const EDIT_UNVERIFIED: &str =
    "Direct edit bypasses grounding verification. No previous evidence to check against.";
pub const DIRECT_EDIT_INSTRUCTION: &str = "direct edit";

/// Tunables shared by every ledger operation.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub top_k: i64,
    pub overlap_threshold: f64,
    /// Bound on one backend call, retries included.
    pub backend_timeout: Duration,
}

impl LedgerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            overlap_threshold: config.grounding.overlap_threshold,
            backend_timeout: call_deadline(&config.generation),
        }
    }
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self::from_config(&Config::minimal(""))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateOutcome {
    pub message_id: Option<String>,
    pub text: String,
    pub claims: Vec<Claim>,
    pub warnings: Vec<String>,
}

impl GenerateOutcome {
    pub(crate) fn insufficient_evidence() -> Self {
        Self {
            message_id: None,
            text: String::new(),
            claims: Vec::new(),
            warnings: vec![INSUFFICIENT_EVIDENCE.to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefineOutcome {
    pub message_id: String,
    pub version_number: i64,
    pub text: String,
    pub claims: Vec<Claim>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EditOutcome {
    pub message_id: String,
    pub version_number: i64,
    pub text: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusOutcome {
    pub id: String,
    pub status: MessageStatus,
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
    backend: Arc<dyn GenerationBackend>,
    settings: LedgerSettings,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn GenerationBackend>,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            store,
            backend,
            settings,
        }
    }

    /// Connect to the configured database, apply migrations, and create
    /// the configured backend.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let backend = create_backend(&config.generation)?;
        Ok(Self::new(
            Arc::new(SqliteStore::new(pool)),
            backend,
            LedgerSettings::from_config(config),
        ))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn GenerationBackend> {
        &self.backend
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    /// Generate a new draft message from evidence in `document_ids`.
    #[instrument(skip(self, prompt), fields(documents = document_ids.len()))]
    pub async fn generate(
        &self,
        prompt: &str,
        document_ids: &[String],
        top_k: Option<i64>,
    ) -> Result<GenerateOutcome, LedgerError> {
        let top_k = top_k.unwrap_or(self.settings.top_k);
        let evidence = retrieve(self.store.as_ref(), prompt, document_ids, top_k).await?;
        if evidence.is_empty() {
            info!("no evidence retrieved, nothing persisted");
            return Ok(GenerateOutcome::insufficient_evidence());
        }

        let request = GenerationRequest::new(GENERATION_SYSTEM_PROMPT, prompt, evidence);
        let generation = with_timeout(
            self.settings.backend_timeout,
            self.backend.generate_claims(&request),
        )
        .await?;

        let verification = self.verify(&generation.claims, &request.evidence);
        self.persist_generated(prompt, verification).await
    }

    /// Append a refined version to a draft message.
    #[instrument(skip(self, instruction), fields(documents = document_ids.len()))]
    pub async fn refine(
        &self,
        message_id: &str,
        instruction: &str,
        document_ids: &[String],
        top_k: Option<i64>,
    ) -> Result<RefineOutcome, LedgerError> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| LedgerError::message_not_found(message_id))?;
        // Fails fast here; the store re-checks when the version is written.
        if message.status != MessageStatus::Draft {
            return Err(LedgerError::Conflict(REFINE_FINALIZED.to_string()));
        }

        let document_ids = if document_ids.is_empty() {
            self.store.working_set().await?
        } else {
            document_ids.to_vec()
        };

        let top_k = top_k.unwrap_or(self.settings.top_k);
        let evidence = retrieve(self.store.as_ref(), instruction, &document_ids, top_k).await?;
        if evidence.is_empty() {
            warn!("no evidence for refinement, recording empty version");
            let version = self
                .store
                .append_version(
                    message_id,
                    &NewVersion {
                        instruction: instruction.to_string(),
                        text: String::new(),
                        claims: Vec::new(),
                        dropped_claims: Vec::new(),
                        source: VersionSource::Refined,
                    },
                )
                .await?;
            return Ok(RefineOutcome {
                message_id: message_id.to_string(),
                version_number: version.version_number,
                text: String::new(),
                claims: Vec::new(),
                warnings: vec![INSUFFICIENT_EVIDENCE.to_string()],
            });
        }

        let previous_text = self
            .store
            .latest_version(message_id)
            .await?
            .map(|v| v.text)
            .unwrap_or_default();

        let request = GenerationRequest::new(
            REFINE_SYSTEM_PROMPT,
            refine_prompt(&previous_text, instruction),
            evidence,
        );
        let generation = with_timeout(
            self.settings.backend_timeout,
            self.backend.generate_claims(&request),
        )
        .await?;

        let verification = self.verify(&generation.claims, &request.evidence);
        let text = verification.message_text();
        let warnings = verification.warnings();

        let version = self
            .store
            .append_version(
                message_id,
                &NewVersion {
                    instruction: instruction.to_string(),
                    text: text.clone(),
                    claims: verification.supported.clone(),
                    dropped_claims: verification.dropped,
                    source: VersionSource::Refined,
                },
            )
            .await?;

        info!(
            version = version.version_number,
            supported = verification.supported.len(),
            dropped = warnings.len(),
            "refined message"
        );

        Ok(RefineOutcome {
            message_id: message_id.to_string(),
            version_number: version.version_number,
            text,
            claims: verification.supported,
            warnings,
        })
    }

    /// Replace the message text directly. Never blocked; ungrounded text
    /// is flagged with a warning.
    #[instrument(skip(self, text))]
    pub async fn edit(&self, message_id: &str, text: &str) -> Result<EditOutcome, LedgerError> {
        if self.store.get_message(message_id).await?.is_none() {
            return Err(LedgerError::message_not_found(message_id));
        }

        let segment_ids: Vec<String> = match self.store.latest_version(message_id).await? {
            Some(previous) => {
                let mut ids: Vec<String> =
                    previous.citations().map(|c| c.segment_id.clone()).collect();
                ids.sort();
                ids.dedup();
                ids
            }
            None => Vec::new(),
        };

        let mut warnings = Vec::new();
        if segment_ids.is_empty() {
            warnings.push(EDIT_UNVERIFIED.to_string());
        } else {
            let available = self.store.segments_by_ids(&segment_ids).await?;
            // Citing every previously cited segment lets the verifier
            // accept the edit if any one of them still grounds it.
            let candidate = CandidateClaim {
                text: text.to_string(),
                citations: available
                    .iter()
                    .map(|s| Citation {
                        document_id: s.document_id.clone(),
                        segment_id: s.id.clone(),
                    })
                    .collect(),
            };
            let verification = self.verify(std::slice::from_ref(&candidate), &available);
            if verification.supported.is_empty() {
                warnings.push(EDIT_UNGROUNDED.to_string());
            }
        }

        let version = self
            .store
            .append_version(
                message_id,
                &NewVersion {
                    instruction: DIRECT_EDIT_INSTRUCTION.to_string(),
                    text: text.to_string(),
                    claims: vec![Claim::supported(text, Vec::new())],
                    dropped_claims: Vec::new(),
                    source: VersionSource::Edited,
                },
            )
            .await?;

        info!(version = version.version_number, "edited message");

        Ok(EditOutcome {
            message_id: message_id.to_string(),
            version_number: version.version_number,
            text: text.to_string(),
            warnings,
        })
    }

    pub async fn set_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<StatusOutcome, LedgerError> {
        let message = self
            .store
            .set_message_status(message_id, status)
            .await?
            .ok_or_else(|| LedgerError::message_not_found(message_id))?;
        info!(message_id, status = status.as_str(), "status updated");
        Ok(StatusOutcome {
            id: message.id,
            status: message.status,
        })
    }

    pub async fn get(&self, message_id: &str) -> Result<MessageDetail, LedgerError> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| LedgerError::message_not_found(message_id))?;
        let versions = self.store.versions(message_id).await?;
        Ok(MessageDetail {
            id: message.id,
            status: message.status,
            created_at: message.created_at,
            updated_at: message.updated_at,
            versions,
        })
    }

    pub async fn list(&self) -> Result<Vec<MessageSummary>, LedgerError> {
        Ok(self.store.list_messages().await?)
    }

    pub(crate) fn verify(&self, claims: &[CandidateClaim], evidence: &[Segment]) -> Verification {
        verify(claims, evidence, self.settings.overlap_threshold)
    }

    /// Create the message and its first version from a verification.
    pub(crate) async fn persist_generated(
        &self,
        prompt: &str,
        verification: Verification,
    ) -> Result<GenerateOutcome, LedgerError> {
        let text = verification.message_text();
        let warnings = verification.warnings();

        let (message, _) = self
            .store
            .create_message(&NewVersion {
                instruction: prompt.to_string(),
                text: text.clone(),
                claims: verification.supported.clone(),
                dropped_claims: verification.dropped,
                source: VersionSource::Generated,
            })
            .await?;

        info!(
            message_id = %message.id,
            supported = verification.supported.len(),
            dropped = warnings.len(),
            "generated message"
        );

        Ok(GenerateOutcome {
            message_id: Some(message.id),
            text,
            claims: verification.supported,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::FixedBackend;
    use groundwork_core::models::{Citation, Document, DocumentStatus};
    use groundwork_core::store::memory::InMemoryStore;

    async fn seeded_store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let doc = Document {
            id: "d1".to_string(),
            external_id: None,
            title: "Insulin".to_string(),
            source: "upload".to_string(),
            body: "Insulin therapy reduces HbA1c levels.".to_string(),
            status: DocumentStatus::Active,
            dedup_hash: "h".to_string(),
            created_at: 0,
        };
        let segment = Segment {
            id: "s1".to_string(),
            document_id: "d1".to_string(),
            chunk_index: 0,
            content: "Insulin therapy reduces HbA1c levels.".to_string(),
        };
        store.insert_document(&doc, &[segment]).await.unwrap();
        store.add_to_working_set("d1").await.unwrap();
        store
    }

    fn cited(text: &str, segment_id: &str) -> CandidateClaim {
        CandidateClaim {
            text: text.to_string(),
            citations: vec![Citation {
                document_id: "d1".to_string(),
                segment_id: segment_id.to_string(),
            }],
        }
    }

    fn ledger(
        store: Arc<InMemoryStore>,
        claims: Vec<CandidateClaim>,
    ) -> (Ledger, Arc<FixedBackend>) {
        let backend = Arc::new(FixedBackend::new(claims));
        (
            Ledger::new(store, backend.clone(), LedgerSettings::default()),
            backend,
        )
    }

    fn docs() -> Vec<String> {
        vec!["d1".to_string()]
    }

    #[tokio::test]
    async fn test_generate_without_documents_persists_nothing() {
        let store = seeded_store().await;
        let (ledger, backend) = ledger(store.clone(), vec![cited("Insulin therapy", "s1")]);
        let outcome = ledger.generate("insulin", &[], None).await.unwrap();
        assert!(outcome.message_id.is_none());
        assert_eq!(outcome.warnings, vec![INSUFFICIENT_EVIDENCE.to_string()]);
        assert!(ledger.list().await.unwrap().is_empty());
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_generate_partitions_claims() {
        let store = seeded_store().await;
        let (ledger, _) = ledger(
            store,
            vec![
                cited("Insulin therapy reduces HbA1c", "s1"),
                cited("Aspirin cures cancer", "s1"),
                CandidateClaim {
                    text: "Uncited".to_string(),
                    citations: Vec::new(),
                },
            ],
        );
        let outcome = ledger.generate("insulin therapy", &docs(), None).await.unwrap();
        assert!(outcome.message_id.is_some());
        assert_eq!(outcome.text, "Insulin therapy reduces HbA1c");
        assert_eq!(outcome.claims.len(), 1);
        assert_eq!(outcome.warnings.len(), 2);
        assert!(outcome.warnings[1]
            .starts_with("Dropped claim: 'Uncited' - No citations provided"));

        let detail = ledger.get(outcome.message_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(detail.status, MessageStatus::Draft);
        assert_eq!(detail.versions.len(), 1);
        assert_eq!(detail.versions[0].source, VersionSource::Generated);
        assert_eq!(detail.versions[0].dropped_claims.len(), 2);
    }

    #[tokio::test]
    async fn test_refine_finalized_conflicts_without_new_version() {
        let store = seeded_store().await;
        let (ledger, _) = ledger(store, vec![cited("Insulin therapy reduces HbA1c", "s1")]);
        let id = ledger
            .generate("insulin", &docs(), None)
            .await
            .unwrap()
            .message_id
            .unwrap();
        ledger.set_status(&id, MessageStatus::Finalized).await.unwrap();

        let err = ledger.refine(&id, "shorter", &[], None).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
        assert_eq!(ledger.get(&id).await.unwrap().versions.len(), 1);
    }

    /// Holds every generation call for `delay` before answering.
    struct DelayedBackend {
        inner: FixedBackend,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl GenerationBackend for DelayedBackend {
        fn name(&self) -> &str {
            "delayed"
        }

        async fn generate_claims(
            &self,
            request: &GenerationRequest,
        ) -> Result<crate::generation::Generation, crate::generation::BackendError> {
            tokio::time::sleep(self.delay).await;
            self.inner.generate_claims(request).await
        }

        async fn stream_claims(
            &self,
            request: &GenerationRequest,
            deltas: tokio::sync::mpsc::Sender<String>,
        ) -> Result<crate::generation::Generation, crate::generation::BackendError> {
            tokio::time::sleep(self.delay).await;
            self.inner.stream_claims(request, deltas).await
        }
    }

    #[tokio::test]
    async fn test_finalize_during_refine_rejects_the_version() {
        let store = seeded_store().await;
        let claims = vec![cited("Insulin therapy reduces HbA1c", "s1")];
        let (ledger, _) = ledger(store.clone(), claims.clone());
        let id = ledger
            .generate("insulin", &docs(), None)
            .await
            .unwrap()
            .message_id
            .unwrap();

        let slow = Ledger::new(
            store,
            Arc::new(DelayedBackend {
                inner: FixedBackend::new(claims),
                delay: Duration::from_millis(200),
            }),
            LedgerSettings::default(),
        );
        let refine = {
            let slow = slow.clone();
            let id = id.clone();
            tokio::spawn(async move { slow.refine(&id, "shorter", &docs(), None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        ledger.set_status(&id, MessageStatus::Finalized).await.unwrap();

        let err = refine.await.unwrap().unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(ref m) if m == REFINE_FINALIZED));
        let detail = ledger.get(&id).await.unwrap();
        assert_eq!(detail.status, MessageStatus::Finalized);
        assert_eq!(detail.versions.len(), 1);
    }

    #[tokio::test]
    async fn test_refine_defaults_to_working_set_and_delimits_prompt() {
        let store = seeded_store().await;
        let (ledger, backend) = ledger(store, vec![cited("Insulin therapy reduces HbA1c", "s1")]);
        let id = ledger
            .generate("insulin", &docs(), None)
            .await
            .unwrap()
            .message_id
            .unwrap();

        let outcome = ledger.refine(&id, "make it concise", &[], None).await.unwrap();
        assert_eq!(outcome.version_number, 2);
        assert_eq!(outcome.claims.len(), 1);

        let requests = backend.requests();
        let refine = &requests[1];
        assert_eq!(refine.system_prompt, REFINE_SYSTEM_PROMPT);
        assert!(refine
            .prompt
            .contains("Insulin therapy reduces HbA1c\n=== END PREVIOUS MESSAGE ==="));
        assert!(refine.prompt.contains("make it concise"));
    }

    #[tokio::test]
    async fn test_refine_without_evidence_still_appends() {
        let store = seeded_store().await;
        let (ledger, _) = ledger(store.clone(), vec![cited("Insulin therapy reduces HbA1c", "s1")]);
        let id = ledger
            .generate("insulin", &docs(), None)
            .await
            .unwrap()
            .message_id
            .unwrap();
        store.remove_from_working_set("d1").await.unwrap();

        let outcome = ledger.refine(&id, "anything", &[], None).await.unwrap();
        assert_eq!(outcome.version_number, 2);
        assert!(outcome.text.is_empty());
        assert_eq!(outcome.warnings, vec![INSUFFICIENT_EVIDENCE.to_string()]);
        let detail = ledger.get(&id).await.unwrap();
        assert_eq!(detail.versions.len(), 2);
        assert_eq!(detail.versions[1].source, VersionSource::Refined);
    }

    #[tokio::test]
    async fn test_edit_warnings_and_finalized_messages() {
        let store = seeded_store().await;
        let (ledger, _) = ledger(store, vec![cited("Insulin therapy reduces HbA1c", "s1")]);
        let id = ledger
            .generate("insulin", &docs(), None)
            .await
            .unwrap()
            .message_id
            .unwrap();
        ledger.set_status(&id, MessageStatus::Finalized).await.unwrap();

        let grounded = ledger.edit(&id, "Insulin therapy reduces HbA1c levels").await.unwrap();
        assert_eq!(grounded.version_number, 2);
        assert!(grounded.warnings.is_empty());

        // Version 2 has no citations, so the next edit cannot be checked.
        let unchecked = ledger.edit(&id, "Something else entirely").await.unwrap();
        assert_eq!(unchecked.version_number, 3);
        assert_eq!(unchecked.warnings, vec![EDIT_UNVERIFIED.to_string()]);

        let detail = ledger.get(&id).await.unwrap();
        assert_eq!(detail.versions[2].instruction, DIRECT_EDIT_INSTRUCTION);
        assert_eq!(detail.versions[2].source, VersionSource::Edited);
        assert_eq!(detail.versions[2].claims.len(), 1);
        assert!(detail.versions[2].claims[0].citations.is_empty());
    }

    #[tokio::test]
    async fn test_edit_ungrounded_text_is_flagged_but_saved() {
        let store = seeded_store().await;
        let (ledger, _) = ledger(store, vec![cited("Insulin therapy reduces HbA1c", "s1")]);
        let id = ledger
            .generate("insulin", &docs(), None)
            .await
            .unwrap()
            .message_id
            .unwrap();
        let outcome = ledger.edit(&id, "Aspirin cures every cancer quickly").await.unwrap();
        assert_eq!(outcome.warnings, vec![EDIT_UNGROUNDED.to_string()]);
        assert_eq!(outcome.version_number, 2);
    }

    #[tokio::test]
    async fn test_unknown_message_is_not_found() {
        let store = seeded_store().await;
        let (ledger, _) = ledger(store, Vec::new());
        assert!(matches!(
            ledger.edit("missing", "x").await,
            Err(LedgerError::NotFound { .. })
        ));
        assert!(matches!(
            ledger.refine("missing", "x", &[], None).await,
            Err(LedgerError::NotFound { .. })
        ));
        assert!(matches!(
            ledger.set_status("missing", MessageStatus::Draft).await,
            Err(LedgerError::NotFound { .. })
        ));
        assert!(matches!(ledger.get("missing").await, Err(LedgerError::NotFound { .. })));
    }

    #[test]
    fn test_settings_timeout_spans_retries() {
        let mut config = Config::minimal("gw.sqlite");
        config.generation.timeout_secs = 5;
        config.generation.max_retries = 2;
        let settings = LedgerSettings::from_config(&config);
        // Three 5s attempts with 1s and 2s backoff in between.
        assert_eq!(settings.backend_timeout, Duration::from_secs(18));
    }

    #[tokio::test]
    async fn test_reopen_finalized_message() {
        let store = seeded_store().await;
        let (ledger, _) = ledger(store, vec![cited("Insulin therapy reduces HbA1c", "s1")]);
        let id = ledger
            .generate("insulin", &docs(), None)
            .await
            .unwrap()
            .message_id
            .unwrap();
        ledger.set_status(&id, MessageStatus::Finalized).await.unwrap();
        let reopened = ledger.set_status(&id, MessageStatus::Draft).await.unwrap();
        assert_eq!(reopened.status, MessageStatus::Draft);
        assert!(ledger.refine(&id, "again", &docs(), None).await.is_ok());
    }
}
