//! # gaitwatch Tools - 共享配置与统计工具
//!
//! **依赖原则**: 不依赖任何 IO 运行时，只提供纯函数和文件级配置加载
//!
//! ## 包含模块
//!
//! - `config` - TOML 配置文件加载（任意 `serde` 配置结构）
//! - `statistics` - 均值、标准差、差分（纯函数）

pub mod config;
pub mod statistics;

pub use config::{ConfigError, default_config_path, load_or_default, load_toml, save_toml};
pub use statistics::{diffs, mean, mean_std, std_dev};
