//! Streaming generation pipeline.
//!
//! [`stream_generate`] runs the same pipeline as [`Ledger::generate`] on a
//! background task and reports progress over an `mpsc` channel:
//!
//! ```text
//! status(retrieving) → status(generating) → delta* → status(verifying)
//!     → status(persisting) → final → status(done)
//! ```
//!
//! With no evidence the pipeline goes straight from `retrieving` to a
//! `final` event carrying the insufficient-evidence warning, then `done`.
//! An `error` event is terminal.
//!
//! Retrieval runs on a spawned task and verification on the blocking
//! pool, so neither holds up delta forwarding. Exactly one version is
//! written per invocation, after verification. Dropping the receiver
//! cancels the pipeline at its next emission; nothing is persisted if
//! that happens before the `persisting` stage.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use groundwork_core::retrieve::retrieve;
use groundwork_core::verify::verify;

use crate::generation::{with_timeout, GenerationRequest, GENERATION_SYSTEM_PROMPT};
use crate::ledger::{GenerateOutcome, Ledger};

const EVENT_BUFFER: usize = 64;
const DELTA_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Retrieving,
    Generating,
    Verifying,
    Persisting,
    Done,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Status { stage: Stage },
    Delta { text: String },
    Final(GenerateOutcome),
    Error { message: String },
}

enum Halt {
    /// The receiver went away.
    Cancelled,
    Failed(String),
}

async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Result<(), Halt> {
    tx.send(event).await.map_err(|_| Halt::Cancelled)
}

async fn status(tx: &mpsc::Sender<StreamEvent>, stage: Stage) -> Result<(), Halt> {
    emit(tx, StreamEvent::Status { stage }).await
}

/// Start a streaming generation and return the event receiver.
///
/// Must be called from within a tokio runtime.
pub fn stream_generate(
    ledger: Ledger,
    prompt: String,
    document_ids: Vec<String>,
    top_k: Option<i64>,
) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);

    tokio::spawn(async move {
        match run(&ledger, prompt, document_ids, top_k, &tx).await {
            Ok(()) => {}
            Err(Halt::Cancelled) => debug!("stream receiver dropped, pipeline cancelled"),
            Err(Halt::Failed(message)) => {
                warn!(error = %message, "streaming generation failed");
                let _ = tx.send(StreamEvent::Error { message }).await;
            }
        }
    });

    rx
}

async fn run(
    ledger: &Ledger,
    prompt: String,
    document_ids: Vec<String>,
    top_k: Option<i64>,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<(), Halt> {
    let settings = ledger.settings().clone();
    let top_k = top_k.unwrap_or(settings.top_k);

    status(tx, Stage::Retrieving).await?;

    let store = ledger.store().clone();
    let query = prompt.clone();
    let evidence = tokio::spawn(async move {
        retrieve(store.as_ref(), &query, &document_ids, top_k).await
    })
    .await
    .map_err(|e| Halt::Failed(e.to_string()))?
    .map_err(|e| Halt::Failed(e.to_string()))?;

    if evidence.is_empty() {
        emit(tx, StreamEvent::Final(GenerateOutcome::insufficient_evidence())).await?;
        return status(tx, Stage::Done).await;
    }

    status(tx, Stage::Generating).await?;

    let (delta_tx, mut delta_rx) = mpsc::channel::<String>(DELTA_BUFFER);
    let backend = ledger.backend().clone();
    let request =
        GenerationRequest::new(GENERATION_SYSTEM_PROMPT, prompt.clone(), evidence.clone());
    let limit = settings.backend_timeout;
    let mut generation_task = tokio::spawn(async move {
        with_timeout(limit, backend.stream_claims(&request, delta_tx)).await
    });

    let joined = loop {
        tokio::select! {
            Some(text) = delta_rx.recv() => {
                if let Err(halt) = emit(tx, StreamEvent::Delta { text }).await {
                    generation_task.abort();
                    return Err(halt);
                }
            }
            joined = &mut generation_task => break joined,
        }
    };
    while let Ok(text) = delta_rx.try_recv() {
        emit(tx, StreamEvent::Delta { text }).await?;
    }

    let generation = joined
        .map_err(|e| Halt::Failed(e.to_string()))?
        .map_err(|e| Halt::Failed(e.to_string()))?;

    status(tx, Stage::Verifying).await?;

    let threshold = settings.overlap_threshold;
    let claims = generation.claims;
    let verification = tokio::task::spawn_blocking(move || verify(&claims, &evidence, threshold))
        .await
        .map_err(|e| Halt::Failed(e.to_string()))?;

    status(tx, Stage::Persisting).await?;

    let outcome = ledger
        .persist_generated(&prompt, verification)
        .await
        .map_err(|e| Halt::Failed(e.to_string()))?;

    emit(tx, StreamEvent::Final(outcome)).await?;
    status(tx, Stage::Done).await
}
