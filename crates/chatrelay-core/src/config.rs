//! Configuration resolution for `ChatRelay`.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/chatrelay/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`CHATRELAY_*`)
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete `ChatRelay` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener and storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub database_path: Option<PathBuf>,
    /// Allowed CORS origins. Empty means any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_path: None,
            cors_origins: Vec::new(),
        }
    }
}

/// Streaming relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// TTL shared by the registry keys and the event log of a turn (seconds).
    pub turn_ttl_secs: i64,
    /// Idle time after which a keep-alive comment is sent to a reader (seconds).
    pub heartbeat_interval_secs: u64,
    /// Upper bound for one blocking read on the event log (milliseconds).
    pub read_block_ms: u64,
    /// Interval of the expired-row sweep (seconds).
    pub cleanup_interval_secs: u64,
    /// Agent stage whose text chunks are relayed to readers.
    pub answer_stage: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            turn_ttl_secs: 3600, // 1 hour
            heartbeat_interval_secs: 20,
            read_block_ms: 5000,
            cleanup_interval_secs: 300,
            answer_stage: "agent".to_string(),
        }
    }
}

impl RelayConfig {
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub const fn read_block(&self) -> Duration {
        Duration::from_millis(self.read_block_ms)
    }

    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Upstream OpenAI-compatible completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub base_url: String,
    pub model: String,
    /// Bearer token. Normally supplied through `CHATRELAY_AGENT_API_KEY`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub system_prompt: String,
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            system_prompt: "You are a helpful assistant. Answer clearly and concisely.".to_string(),
            request_timeout_secs: 300,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set.
    pub filter: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "chatrelay_server=info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(path) = explicit {
        // An explicitly requested file must exist.
        let file = load_config_file(path)?;
        merge_config(&mut config, file);
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;

    Ok(config)
}

/// Reject relay timings that would make readers spin.
fn validate(config: &Config) -> Result<()> {
    if config.relay.heartbeat_interval_secs == 0 {
        return Err(Error::Config("relay.heartbeat_interval_secs must be greater than 0".into()));
    }
    if config.relay.read_block_ms == 0 {
        return Err(Error::Config("relay.read_block_ms must be greater than 0".into()));
    }
    Ok(())
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.json"))
}

/// Get the default database path for the relay.
pub fn database_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("relay.db"))
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".chatrelay"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/chatrelay"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("chatrelay"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    // Optional values only replace when the overlay sets them.
    if overlay.server.database_path.is_some() {
        base.server.database_path = overlay.server.database_path;
    }
    if !overlay.server.cors_origins.is_empty() {
        base.server.cors_origins = overlay.server.cors_origins;
    }
    base.server.addr = overlay.server.addr;

    base.relay = overlay.relay;

    let api_key = overlay.agent.api_key.clone().or_else(|| base.agent.api_key.take());
    base.agent = AgentConfig {
        api_key,
        ..overlay.agent
    };

    base.logging = overlay.logging;
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(addr) = var("CHATRELAY_ADDR").and_then(|v| v.parse().ok()) {
        config.server.addr = addr;
    }
    if let Some(path) = var("CHATRELAY_DB_PATH") {
        config.server.database_path = Some(PathBuf::from(path));
    }
    if let Some(ttl) = var("CHATRELAY_TURN_TTL_SECS").and_then(|v| v.parse().ok()) {
        config.relay.turn_ttl_secs = ttl;
    }
    if let Some(secs) = var("CHATRELAY_HEARTBEAT_SECS").and_then(|v| v.parse().ok()) {
        config.relay.heartbeat_interval_secs = secs;
    }
    if let Some(url) = var("CHATRELAY_AGENT_BASE_URL") {
        config.agent.base_url = url;
    }
    if let Some(model) = var("CHATRELAY_AGENT_MODEL") {
        config.agent.model = model;
    }
    if let Some(key) = var("CHATRELAY_AGENT_API_KEY") {
        config.agent.api_key = Some(key);
    }
    if let Some(json) = var("CHATRELAY_LOG_JSON") {
        config.logging.json = matches!(json.as_str(), "1" | "true" | "yes");
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn default_config_has_20s_heartbeat() {
        let config = Config::default();
        assert_eq!(config.relay.heartbeat_interval(), Duration::from_secs(20));
    }

    #[test]
    fn default_config_has_1h_turn_ttl() {
        let config = Config::default();
        assert_eq!(config.relay.turn_ttl_secs, 3600);
        assert_eq!(config.relay.answer_stage, "agent");
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"relay": {{"turn_ttl_secs": 60, "heartbeat_interval_secs": 5}}, "agent": {{"model": "local-llm"}}}}"#
        )
        .unwrap();

        let mut config = Config::default();
        merge_config(&mut config, load_config_file(file.path()).unwrap());

        assert_eq!(config.relay.turn_ttl_secs, 60);
        assert_eq!(config.relay.heartbeat_interval_secs, 5);
        // Unset fields in a section fall back to their defaults.
        assert_eq!(config.relay.read_block_ms, 5000);
        assert_eq!(config.agent.model, "local-llm");
        assert_eq!(config.agent.base_url, "https://api.openai.com");
    }

    #[test]
    fn merge_keeps_api_key_when_overlay_has_none() {
        let mut config = Config::default();
        config.agent.api_key = Some("sk-env".into());
        merge_config(&mut config, Config::default());
        assert_eq!(config.agent.api_key.as_deref(), Some("sk-env"));
    }

    #[test]
    fn invalid_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = load_config_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("Failed to parse")));
    }

    #[test]
    fn missing_explicit_file_is_config_error() {
        let err = load_config(Some(Path::new("/nonexistent/chatrelay.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CHATRELAY_ADDR", "127.0.0.1:9999"),
            ("CHATRELAY_TURN_TTL_SECS", "120"),
            ("CHATRELAY_AGENT_API_KEY", "sk-test"),
            ("CHATRELAY_LOG_JSON", "true"),
            ("CHATRELAY_HEARTBEAT_SECS", "not-a-number"),
        ]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.server.addr.port(), 9999);
        assert_eq!(config.relay.turn_ttl_secs, 120);
        assert_eq!(config.agent.api_key.as_deref(), Some("sk-test"));
        assert!(config.logging.json);
        // Unparseable values are ignored.
        assert_eq!(config.relay.heartbeat_interval_secs, 20);
    }

    #[test]
    fn zero_relay_timings_are_rejected() {
        assert!(validate(&Config::default()).is_ok());

        let mut config = Config::default();
        config.relay.heartbeat_interval_secs = 0;
        let err = validate(&config).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("heartbeat_interval_secs")));

        let mut config = Config::default();
        config.relay.read_block_ms = 0;
        let err = validate(&config).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("read_block_ms")));
    }

    #[test]
    fn zero_heartbeat_in_file_fails_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"relay": {{"heartbeat_interval_secs": 0}}}}"#).unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("heartbeat_interval_secs")));
    }

    #[test]
    fn api_key_is_never_serialized() {
        let mut config = Config::default();
        config.agent.api_key = Some("sk-secret".into());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
    }
}
