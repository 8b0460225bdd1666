//! Configuration persistence for the launcher.
//!
//! Configuration is loaded with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/tandem/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tandem_core::distributed::RemainderPolicy;
use tandem_core::engine::{AttnFfnMode, ExecutionStrategy, KvDataType};
use tandem_core::layers::{MlpProjection, NormKind, QuantKind};
use tandem_core::loader::WeightDataType;

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;
pub const DEFAULT_MAX_NEW_TOKENS: usize = 16;

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Directory holding `config.json` and the weight files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_dir: Option<PathBuf>,

    /// Total number of ranks (tensor × pipeline).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_size: Option<usize>,

    /// Number of pipeline stages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_stages: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_addr: Option<String>,

    /// Base port of the TCP mesh; rank `r` listens on `master_port + r`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub attn_ffn: Option<AttnFfnMode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub norm: Option<NormKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub quant: Option<QuantKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mlp_projection: Option<MlpProjection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kv_dtype: Option<KvDataType>,

    /// Element type of the weight files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_dtype: Option<WeightDataType>,

    /// Where leftover layers go when stages do not divide the layer count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remainder: Option<RemainderPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<usize>,

    /// Log level used when `RUST_LOG` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl LauncherConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tandem").join("config.toml"))
    }

    /// Load configuration from the default path, or defaults if absent.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &LauncherConfig) {
        if other.model_dir.is_some() {
            self.model_dir = other.model_dir.clone();
        }
        if other.world_size.is_some() {
            self.world_size = other.world_size;
        }
        if other.pipeline_stages.is_some() {
            self.pipeline_stages = other.pipeline_stages;
        }
        if other.master_addr.is_some() {
            self.master_addr = other.master_addr.clone();
        }
        if other.master_port.is_some() {
            self.master_port = other.master_port;
        }
        if other.attn_ffn.is_some() {
            self.attn_ffn = other.attn_ffn;
        }
        if other.norm.is_some() {
            self.norm = other.norm;
        }
        if other.quant.is_some() {
            self.quant = other.quant;
        }
        if other.mlp_projection.is_some() {
            self.mlp_projection = other.mlp_projection;
        }
        if other.kv_dtype.is_some() {
            self.kv_dtype = other.kv_dtype;
        }
        if other.weight_dtype.is_some() {
            self.weight_dtype = other.weight_dtype;
        }
        if other.remainder.is_some() {
            self.remainder = other.remainder;
        }
        if other.max_new_tokens.is_some() {
            self.max_new_tokens = other.max_new_tokens;
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level.clone();
        }
    }

    /// Execution strategy with every unset field at its default. The
    /// activation comes from the model config and is filled in later.
    pub fn strategy(&self) -> ExecutionStrategy {
        let mut strategy = ExecutionStrategy::default();
        if let Some(mode) = self.attn_ffn {
            strategy = strategy.with_attn_ffn(mode);
        }
        if let Some(norm) = self.norm {
            strategy = strategy.with_norm(norm);
        }
        if let Some(quant) = self.quant {
            strategy = strategy.with_quant(quant);
        }
        if let Some(projection) = self.mlp_projection {
            strategy = strategy.with_projection(projection);
        }
        if let Some(kv_dtype) = self.kv_dtype {
            strategy = strategy.with_kv_dtype(kv_dtype);
        }
        if let Some(remainder) = self.remainder {
            strategy = strategy.with_remainder(remainder);
        }
        strategy.weight_dtype = self.weight_dtype.unwrap_or_default();
        strategy
    }

    pub fn master_addr(&self) -> String {
        self.master_addr
            .clone()
            .unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string())
    }

    pub fn master_port(&self) -> u16 {
        self.master_port.unwrap_or(DEFAULT_MASTER_PORT)
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
    /// No config directory available.
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No config directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = LauncherConfig {
            model_dir: Some(PathBuf::from("/models/tiny")),
            world_size: Some(4),
            pipeline_stages: Some(2),
            attn_ffn: Some(AttnFfnMode::Parallel),
            kv_dtype: Some(KvDataType::Bf16),
            remainder: Some(RemainderPolicy::LastStage),
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        let loaded = LauncherConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_toml_uses_snake_case_values() {
        let config: LauncherConfig = toml::from_str(
            r#"
            attn_ffn = "parallel"
            norm = "layer_norm"
            weight_dtype = "f16"
            master_port = 30000
            "#,
        )
        .unwrap();
        assert_eq!(config.attn_ffn, Some(AttnFfnMode::Parallel));
        assert_eq!(config.norm, Some(NormKind::LayerNorm));
        assert_eq!(config.weight_dtype, Some(WeightDataType::F16));
        assert_eq!(config.master_port(), 30000);
    }

    #[test]
    fn test_merge_prefers_other() {
        let mut base = LauncherConfig {
            world_size: Some(2),
            master_port: Some(1234),
            log_level: Some("debug".into()),
            ..Default::default()
        };
        let cli = LauncherConfig {
            world_size: Some(4),
            pipeline_stages: Some(2),
            ..Default::default()
        };
        base.merge(&cli);
        assert_eq!(base.world_size, Some(4));
        assert_eq!(base.pipeline_stages, Some(2));
        assert_eq!(base.master_port, Some(1234));
        assert_eq!(base.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_strategy_defaults() {
        let strategy = LauncherConfig::default().strategy();
        assert_eq!(strategy, ExecutionStrategy::default());
        let strategy = LauncherConfig {
            quant: Some(QuantKind::Int8),
            ..Default::default()
        }
        .strategy();
        assert_eq!(strategy.layer.quant, QuantKind::Int8);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let err = LauncherConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
        assert!(err.to_string().starts_with("IO error"));
    }
}
