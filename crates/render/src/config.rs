//! Top-level service configuration, loaded from TOML.

use fetch::BridgeConfig;
use pool::PoolConfig;
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Seconds a caller waits for a render result.
    pub timeout_secs: u64,
    /// Application bundle evaluated once per execution unit.
    pub bundle_path: String,
    /// Render entry script; empty uses the built-in template.
    pub script_path: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            bundle_path: String::new(),
            script_path: String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub pool: PoolConfig,
    pub fetch: BridgeConfig,
    pub render: RenderConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ServerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let config = ServerConfig::from_toml_str(
            r#"
            [pool]
            max_units = 8
            unit_lifetime_secs = 600
            dev_mode = true

            [fetch]
            worker_threads = 16
            api_hosts = ["app.internal"]
            api_targets = ["http://10.0.0.5:8080"]

            [render]
            timeout_secs = 3
            bundle_path = "dist/server.js"
            "#,
        )
        .expect("config");
        assert_eq!(config.pool.max_units, 8);
        assert!(config.pool.dev_mode);
        assert_eq!(config.fetch.worker_threads, 16);
        assert_eq!(config.fetch.api_hosts, vec!["app.internal".to_string()]);
        assert_eq!(config.render.timeout_secs, 3);
        assert_eq!(config.render.bundle_path, "dist/server.js");
    }

    #[test]
    fn empty_config_falls_back_to_defaults() {
        let config = ServerConfig::from_toml_str("").expect("config");
        assert_eq!(config.render.timeout_secs, 10);
        assert!(config.fetch.api_hosts.is_empty());
        assert!(config.pool.max_units >= 1);
    }

    #[test]
    fn malformed_config_is_rejected() {
        assert!(matches!(
            ServerConfig::from_toml_str("pool = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
