//! Error types shared across the pipeline.

use thiserror::Error;

use crate::models::{ErrorType, SyncStatus};

/// A single field-level problem found while validating a feed record.
///
/// Used both for rejections and for repair notes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Joins field errors into one message for a run's error log.
pub fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A failure confined to one feed file. The run continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("malformed record: {0}")]
    Parse(String),
    #[error("rejected: {0}")]
    Validation(String),
    #[error("unresolved reference: {0}")]
    Reference(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl RecordError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            RecordError::Fetch(_) => ErrorType::Fetch,
            RecordError::Parse(_) => ErrorType::Parse,
            RecordError::Validation(_) => ErrorType::Validation,
            RecordError::Reference(_) => ErrorType::Reference,
            RecordError::Storage(_) => ErrorType::Storage,
        }
    }

    /// Message without the variant prefix, as stored in `SyncError`.
    pub fn detail(&self) -> &str {
        match self {
            RecordError::Fetch(m)
            | RecordError::Parse(m)
            | RecordError::Validation(m)
            | RecordError::Reference(m)
            | RecordError::Storage(m) => m,
        }
    }

    pub fn storage(err: anyhow::Error) -> Self {
        RecordError::Storage(format!("{err:#}"))
    }
}

/// An illegal sync run transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunStateError {
    #[error("run {run_id} is already {status}")]
    Terminal { run_id: String, status: SyncStatus },
    #[error("a run can only be finished with a terminal status")]
    NotTerminal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_joins_field_errors() {
        let errors = vec![
            FieldError::new("voyage_id", "missing"),
            FieldError::new("ship.id", "missing"),
        ];
        assert_eq!(summarize(&errors), "voyage_id: missing; ship.id: missing");
    }

    #[test]
    fn record_error_classifies() {
        let err = RecordError::Reference("itinerary day 2 has no port id".into());
        assert_eq!(err.error_type(), ErrorType::Reference);
        assert_eq!(err.detail(), "itinerary day 2 has no port id");
    }

    #[test]
    fn detail_drops_the_variant_prefix() {
        let cases = [
            (RecordError::Fetch("HTTP 404".into()), ErrorType::Fetch),
            (RecordError::Parse("$: expected value".into()), ErrorType::Parse),
            (RecordError::Validation("sail_date: missing".into()), ErrorType::Validation),
        ];
        for (err, expected) in cases {
            assert_eq!(err.error_type(), expected);
            assert!(err.to_string().ends_with(err.detail()));
            assert_ne!(err.to_string(), err.detail());
        }
    }
}
