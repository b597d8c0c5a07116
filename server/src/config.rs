use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use system::EngineConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Everything the server binary can be told from its TOML file.
///
/// ```toml
/// bind_addr = "0.0.0.0:9000"
/// max_sessions = 64
///
/// [engine]
/// cursor_interval_ms = 50
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Connections that have not joined a session by then are closed.
    pub handshake_timeout_ms: u64,
    /// Per connection. Overflow drops presence first, then the connection.
    pub outbound_queue_capacity: usize,
    pub session_queue_capacity: usize,
    pub registry_queue_capacity: usize,
    pub max_sessions: usize,
    pub tick_interval_ms: u64,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            handshake_timeout_ms: 10_000,
            outbound_queue_capacity: 256,
            session_queue_capacity: 256,
            registry_queue_capacity: 1024,
            max_sessions: 1024,
            tick_interval_ms: 10,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Channel capacities of zero would make tokio panic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Zero("outbound_queue_capacity"));
        }
        if self.session_queue_capacity == 0 {
            return Err(ConfigError::Zero("session_queue_capacity"));
        }
        if self.registry_queue_capacity == 0 {
            return Err(ConfigError::Zero("registry_queue_capacity"));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Zero("tick_interval_ms"));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn it_fills_missing_fields_with_defaults() {
        let config = ServerConfig::from_toml(
            r#"
            bind_addr = "0.0.0.0:9000"

            [engine]
            cursor_interval_ms = 50
            "#,
        )
        .expect("valid config");
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.handshake_timeout_ms, 10_000);
        assert_eq!(config.engine.cursor_interval_ms, 50);
        assert_eq!(config.engine.reconnect_grace_ms, 30_000);
    }

    #[test]
    fn it_loads_from_a_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "max_sessions = 2").expect("write");
        let config = ServerConfig::load(file.path()).expect("loads");
        assert_eq!(config.max_sessions, 2);
    }

    #[test]
    fn it_reports_bad_files() {
        assert!(matches!(
            ServerConfig::load("/definitely/not/here.toml"),
            Err(ConfigError::Io(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml("max_sessions = \"many\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml("session_queue_capacity = 0"),
            Err(ConfigError::Zero("session_queue_capacity"))
        ));
    }
}
