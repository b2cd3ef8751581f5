use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{flow_table::FlowTableConfig, ring::RingGeometry};

pub const ENV_PREFIX: &str = "FLOWTAP_";

/// Everything `FlowCapture::start` needs.
///
/// Layered as defaults, then an optional YAML file, then `FLOWTAP_*`
/// variables with `__` separating nested keys, e.g.
/// `FLOWTAP_RING__BLOCK_SIZE=131072` or `FLOWTAP_FLOW_TABLE__MODE=software`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub interface: String,
    pub ring: RingGeometry,
    pub promiscuous: bool,
    pub flow_table: FlowTableConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {} does not exist", .0.display())]
    NoConfigFile(PathBuf),

    #[error("path '{}' is not a valid file", .0.display())]
    InvalidConfigPath(PathBuf),

    #[error("invalid file extension '.{0}', expected yaml or yml")]
    InvalidExtension(String),

    #[error("configuration error: {0}")]
    Extraction(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Extraction(Box::new(err))
    }
}

impl CaptureConfig {
    pub fn for_interface(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            ..Self::default()
        }
    }

    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(CaptureConfig::default()));
        if let Some(path) = path {
            validate_config_path(path)?;
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .ignore(&["log", "config", "ebpf"])
                    .split("__"),
            )
            .extract()?;
        Ok(config)
    }
}

fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NoConfigFile(path.to_path_buf()));
    }
    if !path.is_file() {
        return Err(ConfigError::InvalidConfigPath(path.to_path_buf()));
    }
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml" | "yml") => Ok(()),
        Some(ext) => Err(ConfigError::InvalidExtension(ext.to_string())),
        None => Err(ConfigError::InvalidExtension("none".to_string())),
    }
}
