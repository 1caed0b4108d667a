//! # deriv-settings
//!
//! Configuration for the Deriv API client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`DerivSettings::default()`]
//! 2. **User file**: `~/.deriv/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `DERIV_*` overrides (highest priority)
//!
//! The [`endpoint`] module turns a configured endpoint into a validated
//! WebSocket URL; invalid endpoints and a missing app id surface as
//! [`SettingsError`] values the engine reports as construction errors.

#![deny(unsafe_code)]

pub mod endpoint;
pub mod errors;
pub mod loader;
pub mod types;

pub use endpoint::endpoint_url;
pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::DerivSettings;
