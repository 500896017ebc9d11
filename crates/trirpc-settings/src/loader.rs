//! Layered settings loading.
//!
//! Loading flow:
//! 1. Start with compiled [`RpcSettings::default()`]
//! 2. If a JSON file is given, merge its values over the defaults
//! 3. Merge `TRIRPC_*` environment variables (highest priority)
//! 4. Validate

use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::RpcSettings;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TRIRPC_";

/// The provider stack, before extraction.
pub fn figment(path: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(RpcSettings::default()));
    if let Some(path) = path {
        figment = figment.merge(Json::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load and validate settings.
///
/// An explicitly given file must exist.
pub fn load_settings(path: Option<&Path>) -> Result<RpcSettings> {
    if let Some(path) = path {
        if !path.exists() {
            return Err(SettingsError::NotFound(path.to_path_buf()));
        }
        debug!(?path, "loading settings from file");
    }
    let settings: RpcSettings = figment(path).extract()?;
    settings.validate()?;
    Ok(settings)
}
