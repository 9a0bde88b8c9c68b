//! # 配置文件
//!
//! 配置结构由各自的 crate 定义（均派生 `Serialize` / `Deserialize` 并带
//! `#[serde(default)]`），这里只负责定位、读取和写回 TOML 文件。
//!
//! 默认路径：
//! - Linux: `~/.config/gaitwatch/<app>.toml`
//! - macOS: `~/Library/Application Support/gaitwatch/<app>.toml`
//! - Windows: `%APPDATA%\gaitwatch\<app>.toml`

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// 应用默认配置文件路径
///
/// 平台没有配置目录时返回 `None`。
pub fn default_config_path(app: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("gaitwatch").join(format!("{}.toml", app)))
}

/// 从 TOML 文件加载配置
pub fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// 加载配置，文件不存在时返回默认值
///
/// 显式给出的路径必须存在；未给出路径时查找默认路径，找不到则使用默认配置。
pub fn load_or_default<T: DeserializeOwned + Default>(
    explicit: Option<&Path>,
    app: &str,
) -> Result<T, ConfigError> {
    if let Some(path) = explicit {
        return load_toml(path);
    }

    match default_config_path(app) {
        Some(path) if path.exists() => {
            info!("Using config file {}", path.display());
            load_toml(&path)
        },
        _ => {
            debug!("No config file for '{}', using defaults", app);
            Ok(T::default())
        },
    }
}

/// 将配置写回 TOML 文件（自动创建父目录）
pub fn save_toml<T: Serialize>(config: &T, path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, content).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}
