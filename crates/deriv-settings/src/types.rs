//! Settings types.

use serde::{Deserialize, Serialize};

use crate::endpoint::endpoint_url;
use crate::errors::{Result, SettingsError};

/// Connection and engine settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DerivSettings {
    /// Server endpoint, with or without a `ws://`/`wss://` scheme.
    pub endpoint: String,
    /// Registered application id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<u32>,
    /// Response language.
    pub lang: String,
    /// Brand name sent with the connection.
    pub brand: String,
    /// Per-subscription broadcast capacity.
    pub stream_buffer: usize,
    /// Error channel broadcast capacity.
    pub error_buffer: usize,
    /// Lifecycle event broadcast capacity.
    pub event_buffer: usize,
}

impl Default for DerivSettings {
    fn default() -> Self {
        Self {
            endpoint: "ws.derivws.com".to_string(),
            app_id: None,
            lang: "EN".to_string(),
            brand: "deriv".to_string(),
            stream_buffer: 256,
            error_buffer: 64,
            event_buffer: 256,
        }
    }
}

impl DerivSettings {
    /// Full WebSocket URL for these settings.
    ///
    /// `<endpoint>/websockets/v3?app_id=<id>&l=<lang>&brand=<brand>`
    pub fn api_url(&self) -> Result<String> {
        let app_id = self.app_id.ok_or(SettingsError::MissingAppId)?;
        let base = endpoint_url(&self.endpoint)?;
        Ok(format!(
            "{base}/websockets/v3?app_id={app_id}&l={}&brand={}",
            self.lang, self.brand
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults() {
        let s = DerivSettings::default();
        assert_eq!(s.endpoint, "ws.derivws.com");
        assert_eq!(s.app_id, None);
        assert_eq!(s.lang, "EN");
        assert_eq!(s.stream_buffer, 256);
    }

    #[test]
    fn api_url_requires_app_id() {
        let s = DerivSettings::default();
        assert_matches!(s.api_url(), Err(SettingsError::MissingAppId));
    }

    #[test]
    fn api_url_formats_query() {
        let s = DerivSettings {
            app_id: Some(1234),
            endpoint: "localhost".into(),
            ..DerivSettings::default()
        };
        assert_eq!(
            s.api_url().unwrap(),
            "wss://localhost/websockets/v3?app_id=1234&l=EN&brand=deriv"
        );
    }

    #[test]
    fn api_url_rejects_bad_endpoint() {
        let s = DerivSettings {
            app_id: Some(1234),
            endpoint: "local123host".into(),
            ..DerivSettings::default()
        };
        assert_matches!(s.api_url(), Err(SettingsError::InvalidUrl(e)) if e == "local123host");
    }

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let s: DerivSettings =
            serde_json::from_str(r#"{"appId": 99, "streamBuffer": 8}"#).unwrap();
        assert_eq!(s.app_id, Some(99));
        assert_eq!(s.stream_buffer, 8);
        assert_eq!(s.lang, "EN");
    }
}
