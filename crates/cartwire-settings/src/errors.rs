//! Settings errors.

use std::path::PathBuf;

use thiserror::Error;

/// Why settings could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// The settings file is not JSON.
    #[error("{} is not valid JSON: {source}", path.display())]
    Parse {
        /// File that was being parsed.
        path: PathBuf,
        /// Parser failure.
        source: serde_json::Error,
    },
    /// The merged document does not fit the settings schema.
    #[error("settings do not match the schema: {0}")]
    Schema(#[from] serde_json::Error),
    /// A field holds a value the server cannot run with.
    #[error("{field}: {reason}")]
    Invalid {
        /// camelCase path of the offending field, e.g. `cart.taxRate`.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl SettingsError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Settings result.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_error_names_the_file() {
        let err = SettingsError::Read {
            path: PathBuf::from("/etc/cartwire/settings.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let text = err.to_string();
        assert!(text.contains("/etc/cartwire/settings.json"));
        assert!(text.contains("denied"));
    }

    #[test]
    fn schema_error_converts_from_serde() {
        let json_err = serde_json::from_str::<u16>("\"eighty\"").unwrap_err();
        let err: SettingsError = json_err.into();
        assert!(matches!(err, SettingsError::Schema(_)));
    }

    #[test]
    fn invalid_names_the_field() {
        let err = SettingsError::invalid("cart.taxRate", "must be within 0..=1");
        assert_eq!(err.to_string(), "cart.taxRate: must be within 0..=1");
    }
}
