//! Engine-side configuration.

use std::fmt;
use std::sync::Arc;

use deriv_settings::DerivSettings;

use crate::subscription::{ContractReusePolicy, SecondaryKeyPolicy};

/// Buffer sizes and policies the engine is built with.
#[derive(Clone)]
pub struct EngineConfig {
    /// Per-consumer capacity of every subscription stream.
    pub stream_buffer: usize,
    /// Error channel capacity.
    pub error_buffer: usize,
    /// Lifecycle event channel capacity.
    pub event_buffer: usize,
    /// How stream reuse keys are derived from first responses.
    pub secondary_keys: Arc<dyn SecondaryKeyPolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&DerivSettings::default())
    }
}

impl From<&DerivSettings> for EngineConfig {
    fn from(settings: &DerivSettings) -> Self {
        Self {
            stream_buffer: settings.stream_buffer,
            error_buffer: settings.error_buffer,
            event_buffer: settings.event_buffer,
            secondary_keys: Arc::new(ContractReusePolicy),
        }
    }
}

impl EngineConfig {
    /// Replace the secondary key policy.
    #[must_use]
    pub fn with_secondary_keys(mut self, policy: impl SecondaryKeyPolicy) -> Self {
        self.secondary_keys = Arc::new(policy);
        self
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("stream_buffer", &self.stream_buffer)
            .field("error_buffer", &self.error_buffer)
            .field("event_buffer", &self.event_buffer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_follow_settings() {
        let settings = DerivSettings {
            stream_buffer: 8,
            error_buffer: 4,
            ..DerivSettings::default()
        };
        let config = EngineConfig::from(&settings);
        assert_eq!(config.stream_buffer, 8);
        assert_eq!(config.error_buffer, 4);
        assert_eq!(config.event_buffer, 256);
    }
}
