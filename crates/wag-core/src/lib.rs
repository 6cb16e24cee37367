//! Core types for the wag control plane.
//!
//! This crate defines the domain entities stored in the replicated
//! configuration plane, the key namespace they live under, the tunable
//! settings with their validation rules, and the node configuration file
//! model. It carries no I/O; every other crate builds on these types.

pub mod config;
pub mod entities;
pub mod keys;
pub mod settings;

mod error;

pub use config::ClusteringConfig;
pub use config::Config;
pub use entities::Acl;
pub use entities::AdminUser;
pub use entities::Device;
pub use entities::MfaType;
pub use entities::RegistrationToken;
pub use entities::User;
pub use error::ValueError;
pub use settings::AllSettings;
pub use settings::GeneralSettings;
pub use settings::LoginSettings;
pub use settings::Oidc;
pub use settings::Pam;
pub use settings::Webauthn;

/// Decode exactly one JSON value from a set of matched entries.
///
/// Reads that require exactly-one match fail with a distinct error for
/// "missing" versus "multiple keys" so callers can tell an absent entity
/// apart from an invariant violation.
pub fn decode_one<T: serde::de::DeserializeOwned>(key: &str, values: &[String]) -> Result<T, ValueError> {
    match values.len() {
        0 => Err(ValueError::NotFound { key: key.to_string() }),
        1 => serde_json::from_str(&values[0]).map_err(|err| ValueError::Decode {
            key: key.to_string(),
            reason: err.to_string(),
        }),
        count => Err(ValueError::IncorrectKeyCount {
            key: key.to_string(),
            count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_one_missing_is_not_found() {
        let result: Result<u32, _> = decode_one("wag-config-authentication-lockout", &[]);
        assert!(matches!(result, Err(ValueError::NotFound { .. })));
    }

    #[test]
    fn decode_one_multiple_is_incorrect_count() {
        let values = vec!["1".to_string(), "2".to_string()];
        let result: Result<u32, _> = decode_one("wag-config-authentication-lockout", &values);
        assert!(matches!(result, Err(ValueError::IncorrectKeyCount { count: 2, .. })));
    }

    #[test]
    fn decode_one_single_value() {
        let values = vec!["5".to_string()];
        let result: u32 = decode_one("wag-config-authentication-lockout", &values).unwrap();
        assert_eq!(result, 5);
    }

    #[test]
    fn decode_one_garbage_is_decode_error() {
        let values = vec!["{not json".to_string()];
        let result: Result<u32, _> = decode_one("k", &values);
        assert!(matches!(result, Err(ValueError::Decode { .. })));
    }
}
