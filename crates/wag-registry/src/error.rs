use thiserror::Error;
use wag_core::ValueError;
use wag_store::StoreError;

/// Errors from repository operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{entity} '{id}' was not found")]
    NotFound { entity: &'static str, id: String },

    /// A lookup through a reference key found no reference.
    #[error("no reference found for '{id}'")]
    NoReferenceFound { id: String },

    /// A reference resolved but its primary is gone. This is an invariant
    /// violation and is reported, never silently ignored.
    #[error("reference for '{id}' points at missing primary '{key}'")]
    DanglingReference { id: String, key: String },

    /// A read that requires exactly one key found several.
    #[error("incorrect number of {key} keys: {count}")]
    IncorrectKeyCount { key: String, count: usize },

    #[error("value for '{key}' failed to decode: {reason}")]
    Decode { key: String, reason: String },

    #[error("{entity} '{id}' already exists")]
    AlreadyExists { entity: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    /// Authorisation refused: lockout exceeded, account locked, or MFA not
    /// configured. The enrolment web surface renders this generically to
    /// avoid user enumeration.
    #[error("authorisation denied: {reason}")]
    AuthDenied { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ValueError> for RegistryError {
    fn from(err: ValueError) -> Self {
        match err {
            ValueError::NotFound { key } => RegistryError::NotFound {
                entity: "key",
                id: key,
            },
            ValueError::IncorrectKeyCount { key, count } => RegistryError::IncorrectKeyCount { key, count },
            ValueError::Decode { key, reason } => RegistryError::Decode { key, reason },
        }
    }
}

impl From<wag_core::settings::SettingsError> for RegistryError {
    fn from(err: wag_core::settings::SettingsError) -> Self {
        RegistryError::Validation(err.to_string())
    }
}
