use crate::time::Timestamp;
use chrono::Utc;
use std::fmt::Display;
use thiserror::Error;

/// Why an exist failed verification. The rendered message is persisted as
/// the exist's `fail_reason`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Couldn't find {object_type} using {params}")]
    NotFound {
        object_type: &'static str,
        params: String,
    },

    #[error("Ambiguous results for {object_type} using {params}")]
    AmbiguousResults {
        object_type: &'static str,
        params: String,
    },

    #[error("Failed at {at} UTC for {uuid}: Expected {field} to be '{expected}' got '{actual}'")]
    FieldMismatch {
        field: String,
        expected: String,
        actual: String,
        uuid: String,
        at: String,
    },

    #[error("Failed at {at} UTC for {uuid}: {field} field was null for exist id {exist_id}")]
    NullField {
        field: &'static str,
        exist_id: i64,
        uuid: String,
        at: String,
    },

    #[error("Failed at {at} UTC for {uuid}: {{{field}: {value}}} was of incorrect type for exist id {exist_id}")]
    WrongType {
        field: &'static str,
        value: String,
        exist_id: i64,
        uuid: String,
        at: String,
    },

    #[error("{0}")]
    Verification(String),
}

fn failure_time() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Renders an optional field the way failure reasons show it.
pub fn show<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| "None".to_string(), |v| v.to_string())
}

pub fn search_params(params: &[(&str, String)]) -> String {
    let inner = params
        .iter()
        .map(|(key, value)| format!("{key}: {value}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{inner}}}")
}

impl VerificationError {
    pub fn not_found(object_type: &'static str, params: &[(&str, String)]) -> Self {
        VerificationError::NotFound {
            object_type,
            params: search_params(params),
        }
    }

    pub fn ambiguous(object_type: &'static str, params: &[(&str, String)]) -> Self {
        VerificationError::AmbiguousResults {
            object_type,
            params: search_params(params),
        }
    }

    pub fn mismatch(
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
        uuid: &str,
    ) -> Self {
        VerificationError::FieldMismatch {
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
            uuid: uuid.to_string(),
            at: failure_time(),
        }
    }

    pub fn timestamp_mismatch(
        field: &str,
        expected: Option<Timestamp>,
        actual: Option<Timestamp>,
        uuid: &str,
    ) -> Self {
        Self::mismatch(field, show(expected), show(actual), uuid)
    }

    pub fn null_field(field: &'static str, exist_id: i64, uuid: &str) -> Self {
        VerificationError::NullField {
            field,
            exist_id,
            uuid: uuid.to_string(),
            at: failure_time(),
        }
    }

    pub fn wrong_type(field: &'static str, value: &str, exist_id: i64, uuid: &str) -> Self {
        VerificationError::WrongType {
            field,
            value: value.to_string(),
            exist_id,
            uuid: uuid.to_string(),
            at: failure_time(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VerificationError::NotFound { .. })
    }
}
