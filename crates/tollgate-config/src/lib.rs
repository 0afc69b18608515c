use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    #[serde(default)]
    pub gate: Gate,
    #[serde(default)]
    pub rate_limit: RateLimit,
    #[serde(default)]
    pub autonomy: Autonomy,
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Gate {
    #[serde(default)]
    pub consent_required_actions: Vec<String>,
    #[serde(default)]
    pub outbound_actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_min_gap_ms")]
    pub min_gap_ms: u64,
    #[serde(default = "default_max_per_key")]
    pub max_per_key: usize,
    #[serde(default = "default_max_global")]
    pub max_global: usize,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            min_gap_ms: default_min_gap_ms(),
            max_per_key: default_max_per_key(),
            max_global: default_max_global(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Autonomy {
    #[serde(default = "default_sensitive_actions")]
    pub default_sensitive_actions: Vec<String>,
}

impl Default for Autonomy {
    fn default() -> Self {
        Self {
            default_sensitive_actions: default_sensitive_actions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    #[serde(default = "default_audit_max_events")]
    pub max_events: usize,
    pub jsonl_path: String,
    #[serde(default)]
    pub immutable_mirror_path: Option<String>,
}

fn default_window_ms() -> u64 {
    60 * 60 * 1000
}

fn default_min_gap_ms() -> u64 {
    60 * 1000
}

fn default_max_per_key() -> usize {
    5
}

fn default_max_global() -> usize {
    20
}

fn default_audit_max_events() -> usize {
    500
}

pub fn default_sensitive_actions() -> Vec<String> {
    [
        "sandbox_exec",
        "file_manager",
        "telegram_bridge",
        "communication_hub",
        "task_automation",
    ]
    .iter()
    .map(|v| v.to_string())
    .collect()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

const MAX_WINDOW_MS: u64 = 365 * 24 * 60 * 60 * 1000;

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.rate_limit.window_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "rate_limit.window_ms must be >= 1".to_string(),
        ));
    }
    if cfg.rate_limit.window_ms > MAX_WINDOW_MS {
        return Err(ConfigError::UnsupportedConfig(
            "rate_limit.window_ms must not exceed 365 days".to_string(),
        ));
    }
    if cfg.rate_limit.min_gap_ms > cfg.rate_limit.window_ms {
        return Err(ConfigError::UnsupportedConfig(
            "rate_limit.min_gap_ms must not exceed rate_limit.window_ms".to_string(),
        ));
    }
    if cfg.rate_limit.max_per_key == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "rate_limit.max_per_key must be >= 1".to_string(),
        ));
    }
    if cfg.rate_limit.max_global == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "rate_limit.max_global must be >= 1".to_string(),
        ));
    }
    if cfg.audit.max_events == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "audit.max_events must be >= 1".to_string(),
        ));
    }
    let sensitive = &cfg.autonomy.default_sensitive_actions;
    if sensitive.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "autonomy.default_sensitive_actions must list at least one action".to_string(),
        ));
    }
    if sensitive.iter().any(|v| v.trim().is_empty() || v.contains('*')) {
        return Err(ConfigError::UnsupportedConfig(
            "autonomy.default_sensitive_actions must be explicit ids (no blanks or wildcards)"
                .to_string(),
        ));
    }
    Ok(())
}
