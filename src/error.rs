//! Errors surfaced by ledger operations.

use thiserror::Error;

use groundwork_core::store::AppendRejected;

use crate::generation::BackendError;

pub const REFINE_FINALIZED: &str = "Cannot refine a finalized message";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Store(anyhow::Error),
}

/// Store rejections that carry ledger meaning keep it; the rest are
/// storage failures.
impl From<anyhow::Error> for LedgerError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<AppendRejected>() {
            Some(AppendRejected::Finalized(_)) => {
                LedgerError::Conflict(REFINE_FINALIZED.to_string())
            }
            Some(AppendRejected::UnknownMessage(id)) => LedgerError::message_not_found(id),
            None => LedgerError::Store(err),
        }
    }
}

impl LedgerError {
    pub fn message_not_found(id: &str) -> Self {
        LedgerError::NotFound {
            kind: "message",
            id: id.to_string(),
        }
    }

    pub fn document_not_found(id: &str) -> Self {
        LedgerError::NotFound {
            kind: "document",
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            LedgerError::message_not_found("m1").to_string(),
            "message not found: m1"
        );
        assert_eq!(
            LedgerError::Conflict(REFINE_FINALIZED.into()).to_string(),
            "Cannot refine a finalized message"
        );
    }

    #[test]
    fn test_append_rejections_map_to_ledger_errors() {
        let finalized: LedgerError =
            anyhow::Error::from(AppendRejected::Finalized("m1".into())).into();
        assert!(matches!(finalized, LedgerError::Conflict(ref m) if m == REFINE_FINALIZED));

        let unknown: LedgerError =
            anyhow::Error::from(AppendRejected::UnknownMessage("m2".into())).into();
        assert!(matches!(
            unknown,
            LedgerError::NotFound { kind: "message", ref id } if id == "m2"
        ));

        let other: LedgerError = anyhow::anyhow!("disk full").into();
        assert!(matches!(other, LedgerError::Store(_)));
    }
}
