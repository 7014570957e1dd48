use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

const CONFIG_FILE_NAME: &str = "config.json";
const VALID_LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR"];

/// Process-wide configuration, loaded once at startup from `<base>/config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            log_level: "INFO".to_string(),
        }
    }
}

pub fn config_path(base_path: &Path) -> PathBuf {
    base_path.join(CONFIG_FILE_NAME)
}

/// Loads the config file, defaulting per-field on any individual parse or
/// range failure rather than discarding the whole file for one bad field.
pub fn load_config(base_path: &Path) -> ServerConfig {
    let path = config_path(base_path);
    let default = ServerConfig::default();

    let Ok(content) = fs::read_to_string(&path) else {
        return default;
    };

    let Ok(Value::Object(data)) = serde_json::from_str::<Value>(&content) else {
        warn!(path = %path.display(), "config file unparseable, using defaults");
        return default;
    };

    let host = data
        .get("host")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or(default.host);

    let port = data
        .get("port")
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
        .and_then(|v| u16::try_from(v).ok())
        .filter(|p| *p >= 1)
        .unwrap_or(default.port);

    let log_level = data
        .get("log_level")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_uppercase())
        .filter(|s| VALID_LOG_LEVELS.contains(&s.as_str()))
        .unwrap_or(default.log_level);

    ServerConfig {
        host,
        port,
        log_level,
    }
}

/// Writes the config atomically (temp file + rename), pretty-printed with a
/// trailing newline.
pub fn save_config(base_path: &Path, config: &ServerConfig) -> std::io::Result<()> {
    fs::create_dir_all(base_path)?;
    let path = config_path(base_path);
    let tmp_path = base_path.join("config.json.tmp");

    let mut json = serde_json::to_string_pretty(config).expect("ServerConfig always serializes");
    json.push('\n');

    fs::write(&tmp_path, &json)?;
    fs::rename(&tmp_path, &path)?;
    info!(path = %path.display(), "config saved");
    Ok(())
}
