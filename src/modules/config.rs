use std::fs;
use std::path::Path;

use crate::error::ProxyError;
use crate::proxy::ProxyConfig;

pub const DEFAULT_CONFIG_FILE: &str = "api_buddy.json";

/// Load configuration from an explicit path. Missing or malformed files
/// are startup errors.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ProxyError> {
    let content = fs::read_to_string(path)
        .map_err(|e| ProxyError::Config(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| ProxyError::Config(format!("failed to parse {}: {e}", path.display())))
}

/// Load from the default location, writing defaults back when absent.
pub fn load_or_init_config(path: &Path) -> Result<ProxyConfig, ProxyError> {
    if !path.exists() {
        let config = ProxyConfig::default();
        let _ = save_config(&config, path);
        return Ok(config);
    }
    load_config(path)
}

pub fn save_config(config: &ProxyConfig, path: &Path) -> Result<(), ProxyError> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ProxyError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, content)
        .map_err(|e| ProxyError::Config(format!("failed to write {}: {e}", path.display())))
}
