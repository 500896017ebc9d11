//! # trirpc-settings
//!
//! Configuration for a trirpc node, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RpcSettings::default()`]
//! 2. **JSON file**: optional, passed by the caller
//! 3. **Environment variables**: `TRIRPC_*`, nested keys split on `__`
//!    (e.g. `TRIRPC_WEBSOCKET__PING_PERIOD_MS=5000`)
//!
//! Loaded settings are validated before they are returned.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{ENV_PREFIX, figment, load_settings};
pub use types::*;
