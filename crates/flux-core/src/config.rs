//! Layered configuration: compiled defaults, an optional TOML file at
//! the project root, then `FLUX_`-prefixed environment overrides,
//! highest precedence last. Built once at process start and passed down
//! by reference (spec.md §9's "global configuration" design note).

use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_log_level() -> String {
    "info".into()
}

fn default_server_host() -> String {
    "0.0.0.0".into()
}

fn default_server_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub debug: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    pub api_url: String,
    pub home: String,
    pub cache_path: String,
    pub local_storage_path: String,
    pub serializer: String,
    pub database_url: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            debug: false,
            log_level: default_log_level(),
            server_host: default_server_host(),
            server_port: default_server_port(),
            api_url: "http://localhost:8080".into(),
            home: ".flux".into(),
            cache_path: ".flux/cache".into(),
            local_storage_path: ".flux/storage".into(),
            serializer: "json".into(),
            database_url: "postgres://localhost/flux".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_workers: u32,
    pub default_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: f64,
    pub retry_backoff: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            default_timeout_secs: 300,
            retry_attempts: 3,
            retry_delay_secs: 1.0,
            retry_backoff: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub bootstrap_token: String,
    pub server_url: String,
    pub default_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: f64,
    pub retry_backoff: f64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            bootstrap_token: String::new(),
            server_url: "http://localhost:8080".into(),
            default_timeout_secs: 300,
            retry_attempts: 3,
            retry_delay_secs: 1.0,
            retry_backoff: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub encryption_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CatalogConfig {
    pub auto_register: bool,
}

/// The full recognized configuration surface (spec.md §6.2), grouped
/// exactly as the spec groups it so the `FLUX_<GROUP>__<KEY>` env
/// overlay maps one-to-one onto these fields.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FluxConfig {
    pub core: CoreConfig,
    pub executor: ExecutorConfig,
    pub workers: WorkersConfig,
    pub security: SecurityConfig,
    pub catalog: CatalogConfig,
}

impl FluxConfig {
    /// Load compiled defaults, then overlay `flux.toml` if present at
    /// `path` (or the project root's `flux.toml` if `path` is `None`),
    /// then overlay `FLUX_*`/`FLUX_<GROUP>__<KEY>` environment
    /// variables, in that precedence order.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = FluxConfig::default();

        let toml_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| Path::new("flux.toml").to_path_buf());
        if toml_path.exists() {
            let contents = std::fs::read_to_string(&toml_path)
                .map_err(|e| ConfigError::Io(toml_path.display().to_string(), e))?;
            config = toml::from_str(&contents).map_err(ConfigError::Toml)?;
        }

        apply_env_overlay(&mut config)?;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Io(String, std::io::Error),
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {message}")]
    InvalidEnvValue { key: String, message: String },
}

/// Walk `FLUX_*` environment variables and apply them over `config` as
/// a JSON merge patch. `FLUX_DEBUG=true` sets `core.debug`;
/// `FLUX_EXECUTOR__RETRY_ATTEMPTS=5` sets `executor.retry_attempts`; an
/// unprefixed key with no `__` separator is treated as belonging to
/// `core`, matching spec.md §6.2's flat top-level options
/// (`FLUX_DEBUG`, `FLUX_LOG_LEVEL`, ...).
fn apply_env_overlay(config: &mut FluxConfig) -> Result<(), ConfigError> {
    let mut value = serde_json::to_value(&*config).expect("FluxConfig always serializes");

    for (raw_key, raw_val) in std::env::vars() {
        let Some(rest) = raw_key.strip_prefix("FLUX_") else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        let (group, key) = match rest.split_once("__") {
            Some((g, k)) => (g.to_lowercase(), k.to_lowercase()),
            None => ("core".to_string(), rest.to_lowercase()),
        };

        let Some(obj) = value.as_object_mut() else {
            continue;
        };
        let Some(group_obj) = obj.get_mut(&group).and_then(|g| g.as_object_mut()) else {
            continue;
        };
        let Some(existing) = group_obj.get(&key) else {
            continue;
        };
        let parsed = parse_env_value(&raw_key, raw_val, existing)?;
        group_obj.insert(key, parsed);
    }

    *config = serde_json::from_value(value).map_err(|e| ConfigError::InvalidEnvValue {
        key: "FLUX_*".into(),
        message: e.to_string(),
    })?;
    Ok(())
}

fn parse_env_value(
    key: &str,
    raw: String,
    existing: &serde_json::Value,
) -> Result<serde_json::Value, ConfigError> {
    let parsed = match existing {
        serde_json::Value::Bool(_) => raw
            .parse::<bool>()
            .map(serde_json::Value::Bool)
            .map_err(|e| ConfigError::InvalidEnvValue {
                key: key.to_string(),
                message: e.to_string(),
            })?,
        serde_json::Value::Number(n) if n.is_u64() => raw
            .parse::<u64>()
            .map(|v| serde_json::Value::Number(v.into()))
            .map_err(|e| ConfigError::InvalidEnvValue {
                key: key.to_string(),
                message: e.to_string(),
            })?,
        serde_json::Value::Number(_) => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .ok_or_else(|| ConfigError::InvalidEnvValue {
                key: key.to_string(),
                message: "not a number".into(),
            })?,
        _ => serde_json::Value::String(raw),
    };
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = FluxConfig::default();
        assert_eq!(config.core.server_port, 8080);
        assert_eq!(config.executor.retry_attempts, 3);
    }

    #[test]
    fn env_overlay_applies_nested_group() {
        std::env::set_var("FLUX_EXECUTOR__RETRY_ATTEMPTS", "9");
        let mut config = FluxConfig::default();
        apply_env_overlay(&mut config).unwrap();
        std::env::remove_var("FLUX_EXECUTOR__RETRY_ATTEMPTS");
        assert_eq!(config.executor.retry_attempts, 9);
    }

    #[test]
    fn env_overlay_applies_flat_core_key() {
        std::env::set_var("FLUX_LOG_LEVEL", "debug");
        let mut config = FluxConfig::default();
        apply_env_overlay(&mut config).unwrap();
        std::env::remove_var("FLUX_LOG_LEVEL");
        assert_eq!(config.core.log_level, "debug");
    }
}
