use thiserror::Error;

/// Errors from typed reads of stored values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// The key holds no value.
    #[error("key '{key}' not found")]
    NotFound { key: String },

    /// A read that requires exactly one match found several.
    ///
    /// This indicates a namespace invariant violation, not a caller error.
    #[error("incorrect number of {key} keys: {count}")]
    IncorrectKeyCount { key: String, count: usize },

    /// The stored bytes did not decode as the expected type.
    #[error("value for '{key}' failed to decode: {reason}")]
    Decode { key: String, reason: String },
}
