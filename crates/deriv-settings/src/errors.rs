//! Settings error types.

use thiserror::Error;

/// Errors that can occur when loading settings or building the endpoint URL.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the settings file.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// No application id configured.
    #[error("An app_id is required to connect to the API")]
    MissingAppId,
    /// The endpoint does not name a usable host.
    #[error("Invalid URL:{0}")]
    InvalidUrl(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_error_display() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err = SettingsError::Json(json_err);
        assert!(err.to_string().contains("parse settings JSON"));
    }

    #[test]
    fn construction_messages() {
        assert_eq!(
            SettingsError::MissingAppId.to_string(),
            "An app_id is required to connect to the API"
        );
        assert_eq!(
            SettingsError::InvalidUrl("local123host".into()).to_string(),
            "Invalid URL:local123host"
        );
    }

    #[test]
    fn io_error_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: SettingsError = io_err.into();
        assert!(matches!(err, SettingsError::Io(_)));
    }
}
