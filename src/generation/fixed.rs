//! Fixed-response backend.
//!
//! Returns the same claim list for every request and records each request
//! it receives, so tests can inspect exactly what the ledger sent.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use groundwork_core::models::CandidateClaim;

use super::{BackendError, Generation, GenerationBackend, GenerationRequest};

/// Characters per fake streaming delta.
const DELTA_CHARS: usize = 24;

pub struct FixedBackend {
    result: Generation,
    seen: Mutex<Vec<GenerationRequest>>,
}

impl FixedBackend {
    pub fn new(claims: Vec<CandidateClaim>) -> Self {
        Self {
            result: Generation { claims },
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Load the claim list from a JSON file holding either
    /// `{"claims": [...]}` or a bare array.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixed claims file: {}", path.display()))?;
        let claims = match serde_json::from_str::<Generation>(&raw) {
            Ok(generation) => generation.claims,
            Err(_) => serde_json::from_str::<Vec<CandidateClaim>>(&raw)
                .with_context(|| format!("Invalid fixed claims file: {}", path.display()))?,
        };
        Ok(Self::new(claims))
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.seen
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }

    fn record(&self, request: &GenerationRequest) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.clone());
        }
    }
}

#[async_trait]
impl GenerationBackend for FixedBackend {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn generate_claims(
        &self,
        request: &GenerationRequest,
    ) -> Result<Generation, BackendError> {
        self.record(request);
        Ok(self.result.clone())
    }

    async fn stream_claims(
        &self,
        request: &GenerationRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<Generation, BackendError> {
        self.record(request);

        let serialized = serde_json::to_string(&self.result)
            .map_err(|e| BackendError::Unparsable(e.to_string()))?;
        let chars: Vec<char> = serialized.chars().collect();
        for piece in chars.chunks(DELTA_CHARS) {
            let _ = deltas.send(piece.iter().collect()).await;
        }

        Ok(self.result.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groundwork_core::models::Citation;
    use std::io::Write;

    fn claim(text: &str) -> CandidateClaim {
        CandidateClaim {
            text: text.to_string(),
            citations: vec![Citation {
                document_id: "d1".to_string(),
                segment_id: "s1".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_stream_deltas_reassemble_to_result() {
        let backend = FixedBackend::new(vec![claim("Metformin lowers glucose in adults.")]);
        let (tx, mut rx) = mpsc::channel(64);
        let request = GenerationRequest::new("system", "prompt", Vec::new());

        let result = backend.stream_claims(&request, tx).await.unwrap();

        let mut joined = String::new();
        let mut count = 0;
        while let Some(piece) = rx.recv().await {
            joined.push_str(&piece);
            count += 1;
        }
        assert!(count > 1);
        let reparsed: Generation = serde_json::from_str(&joined).unwrap();
        assert_eq!(reparsed, result);
    }

    #[tokio::test]
    async fn test_stream_survives_closed_receiver() {
        let backend = FixedBackend::new(vec![claim("A")]);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let request = GenerationRequest::new("system", "prompt", Vec::new());
        let result = backend.stream_claims(&request, tx).await.unwrap();
        assert_eq!(result.claims.len(), 1);
    }

    #[tokio::test]
    async fn test_records_requests() {
        let backend = FixedBackend::new(Vec::new());
        let request = GenerationRequest::new("system", "first", Vec::new());
        backend.generate_claims(&request).await.unwrap();
        let seen = backend.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].prompt, "first");
    }

    #[test]
    fn test_from_file_accepts_both_shapes() {
        let mut wrapped = tempfile::NamedTempFile::new().unwrap();
        write!(wrapped, r#"{{"claims":[{{"text":"A","citations":[]}}]}}"#).unwrap();
        assert_eq!(FixedBackend::from_file(wrapped.path()).unwrap().result.claims.len(), 1);

        let mut bare = tempfile::NamedTempFile::new().unwrap();
        write!(bare, r#"[{{"text":"A"}},{{"text":"B"}}]"#).unwrap();
        assert_eq!(FixedBackend::from_file(bare.path()).unwrap().result.claims.len(), 2);
    }
}
