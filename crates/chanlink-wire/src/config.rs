//! Configuration loading from TOML files.

use crate::error::{WireError, WireResult};
use chanlink_types::EngineConfig;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable naming the config file when no path is given.
pub const CONFIG_ENV: &str = "CHANLINK_CONFIG";

/// Load configuration from `path`, `$CHANLINK_CONFIG`, or `./chanlink.toml`.
///
/// A missing or unreadable file is not an error: defaults are used and the
/// problem is logged.
pub fn load_config(path: Option<&Path>) -> EngineConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        debug!(path = %config_path.display(), "Config file not found, using defaults");
        return EngineConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match parse_config(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                EngineConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            EngineConfig::default()
        }
    }
}

/// Parse a TOML document. Unnamed fields take their defaults.
pub fn parse_config(contents: &str) -> WireResult<EngineConfig> {
    toml::from_str(contents).map_err(|e| WireError::Decode(format!("config: {e}")))
}

fn default_config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("chanlink.toml"))
}
