use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
}

/// The channel endpoint and bearer credential are opaque inputs supplied
/// by the authentication layer; the engine never interprets them.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base websocket URL, e.g. "ws://localhost:8000/ws/support".
    /// The conversation id is appended as a trailing path segment.
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Fixed delay before each reconnect attempt. Constant on purpose:
    /// losing contact mid-conversation is worse than a wasted retry, so
    /// reconnection stays responsive instead of backing off.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// Liveness frame content sent immediately after the handshake.
    #[serde(default = "default_greeting")]
    pub greeting: String,
    /// Identifier placed in the `sender` field of outbound frames.
    #[serde(default = "default_local_user_id")]
    pub local_user_id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay_secs(),
            greeting: default_greeting(),
            local_user_id: default_local_user_id(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_topic_capacity")]
    pub topic_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            topic_capacity: 1024,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    server_url: Option<String>,
    auth_token: Option<String>,
    log_level: Option<String>,
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_greeting() -> String {
    "Hello".to_string()
}

fn default_local_user_id() -> String {
    "default".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_topic_capacity() -> usize {
    1024
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[server]
url = ""
# auth_token = "bearer-token"

[channel]
reconnect_delay_secs = 5
greeting = "Hello"
local_user_id = "default"

[logging]
level = "info"

[event_bus]
topic_capacity = 1024

[storage]
# path = "~/.local/share/haven/haven.db"
"#;

/// Return the resolved platform-appropriate configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("chat", "haven", "haven") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides. Returns a validated Config or a descriptive error.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load configuration from a specific path. Used by `load_config()` and tests.
pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path, config_overrides_from_env())
}

/// Parse configuration from a TOML string directly (for testing).
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: PathBuf,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(&path)?;
            return Err(ConfigError::MissingRequiredFields {
                fields: vec!["server.url".to_string()],
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        server_url: std::env::var("HAVEN_SERVER_URL").ok(),
        auth_token: std::env::var("HAVEN_AUTH_TOKEN").ok(),
        log_level: std::env::var("HAVEN_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(url) = overrides.server_url {
        config.server.url = url;
    }
    if let Some(token) = overrides.auth_token {
        config.server.auth_token = Some(token);
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.server.url.is_empty() {
        return Err(ConfigError::MissingRequiredFields {
            fields: vec!["server.url".to_string()],
        });
    }

    if !config.server.url.starts_with("ws://") && !config.server.url.starts_with("wss://") {
        return Err(ConfigError::InvalidValue {
            field: "server.url".to_string(),
            message: "must start with ws:// or wss://".to_string(),
        });
    }

    if config.channel.reconnect_delay_secs == 0 {
        return Err(ConfigError::InvalidValue {
            field: "channel.reconnect_delay_secs".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    Ok(())
}

fn create_default_config(path: &PathBuf) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_without_env(toml_str: &str) -> Result<Config, ConfigError> {
        load_config_from_str_with_overrides(toml_str, ConfigOverrides::default())
    }

    fn minimal_toml() -> &'static str {
        r#"
[server]
url = "ws://localhost:8000/ws/support"
"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = parse_without_env(minimal_toml()).unwrap();
        assert_eq!(config.server.url, "ws://localhost:8000/ws/support");
        assert!(config.server.auth_token.is_none());
        assert_eq!(config.channel.reconnect_delay_secs, 5);
        assert_eq!(config.channel.greeting, "Hello");
        assert_eq!(config.channel.local_user_id, "default");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.event_bus.topic_capacity, 1024);
        assert!(config.storage.path.is_none());
    }

    #[test]
    fn parses_full_config() {
        let toml = r#"
[server]
url = "wss://support.example.com/ws/support"
auth_token = "secret-bearer"

[channel]
reconnect_delay_secs = 10
greeting = "Hi"
local_user_id = "client-7"

[storage]
path = "/data/haven.db"

[logging]
level = "debug"

[event_bus]
topic_capacity = 64
"#;
        let config = parse_without_env(toml).unwrap();
        assert_eq!(config.server.auth_token.as_deref(), Some("secret-bearer"));
        assert_eq!(config.channel.reconnect_delay_secs, 10);
        assert_eq!(config.channel.greeting, "Hi");
        assert_eq!(config.channel.local_user_id, "client-7");
        assert_eq!(config.storage.path.as_deref(), Some("/data/haven.db"));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.event_bus.topic_capacity, 64);
    }

    #[test]
    fn rejects_missing_url() {
        let toml = r#"
[server]
url = ""
"#;
        let err = parse_without_env(toml).unwrap_err();
        match err {
            ConfigError::MissingRequiredFields { fields } => {
                assert_eq!(fields, vec!["server.url".to_string()]);
            }
            other => panic!("expected MissingRequiredFields, got: {other}"),
        }
    }

    #[test]
    fn rejects_non_websocket_url() {
        let toml = r#"
[server]
url = "http://localhost:8000/ws/support"
"#;
        let err = parse_without_env(toml).unwrap_err();
        match err {
            ConfigError::InvalidValue { field, .. } => assert_eq!(field, "server.url"),
            other => panic!("expected InvalidValue, got: {other}"),
        }
    }

    #[test]
    fn rejects_zero_reconnect_delay() {
        let toml = r#"
[server]
url = "ws://localhost:8000/ws/support"

[channel]
reconnect_delay_secs = 0
"#;
        let err = parse_without_env(toml).unwrap_err();
        match err {
            ConfigError::InvalidValue { field, .. } => {
                assert_eq!(field, "channel.reconnect_delay_secs");
            }
            other => panic!("expected InvalidValue, got: {other}"),
        }
    }

    #[test]
    fn rejects_invalid_log_level() {
        let toml = r#"
[server]
url = "ws://localhost:8000/ws/support"

[logging]
level = "verbose"
"#;
        let err = parse_without_env(toml).unwrap_err();
        match err {
            ConfigError::InvalidValue { field, .. } => assert_eq!(field, "logging.level"),
            other => panic!("expected InvalidValue, got: {other}"),
        }
    }

    #[test]
    fn accepts_all_valid_log_levels() {
        for level in VALID_LOG_LEVELS {
            let toml = format!(
                r#"
[server]
url = "ws://localhost:8000/ws/support"

[logging]
level = "{level}"
"#
            );
            parse_without_env(&toml).unwrap();
        }
    }

    #[test]
    fn rejects_invalid_toml_syntax() {
        let toml = r#"
[server
url = "broken"
"#;
        let err = parse_without_env(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidToml { .. }));
    }

    #[test]
    fn invalid_toml_reports_position() {
        let toml = r#"
[server]
url = "ws://localhost:8000/ws/support"
bad_line ===
"#;
        let err = parse_without_env(toml).unwrap_err();
        match err {
            ConfigError::InvalidToml { line, .. } => {
                assert!(line > 0, "line should be > 0, got {line}");
            }
            other => panic!("expected InvalidToml, got: {other}"),
        }
    }

    #[test]
    fn env_override_url() {
        let overrides = ConfigOverrides {
            server_url: Some("wss://override.example.com/ws/support".to_string()),
            ..Default::default()
        };
        let config = load_config_from_str_with_overrides(minimal_toml(), overrides).unwrap();
        assert_eq!(config.server.url, "wss://override.example.com/ws/support");
    }

    #[test]
    fn env_override_auth_token() {
        let overrides = ConfigOverrides {
            auth_token: Some("env-token".to_string()),
            ..Default::default()
        };
        let config = load_config_from_str_with_overrides(minimal_toml(), overrides).unwrap();
        assert_eq!(config.server.auth_token.as_deref(), Some("env-token"));
    }

    #[test]
    fn env_override_invalid_log_level_rejected() {
        let overrides = ConfigOverrides {
            log_level: Some("invalid".to_string()),
            ..Default::default()
        };
        let err = load_config_from_str_with_overrides(minimal_toml(), overrides).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, minimal_toml()).unwrap();

        let config = load_config_from_with_overrides(path, ConfigOverrides::default()).unwrap();
        assert_eq!(config.server.url, "ws://localhost:8000/ws/support");
    }

    #[test]
    fn missing_file_creates_default_and_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subdir").join("config.toml");

        let err =
            load_config_from_with_overrides(path.clone(), ConfigOverrides::default()).unwrap_err();
        match err {
            ConfigError::MissingRequiredFields { fields } => {
                assert!(fields.contains(&"server.url".to_string()));
            }
            other => panic!("expected MissingRequiredFields, got: {other}"),
        }

        assert!(path.exists(), "default config should have been created");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[server]"));
    }

    #[test]
    fn config_path_ends_with_config_toml() {
        let path = config_path();
        assert!(
            path.ends_with("config.toml"),
            "config_path should end with config.toml, got: {path:?}"
        );
    }
}
