//! 配置管理模块
//!
//! - `types` - 配置结构、默认值与校验
//! - `builtin` - 内置模型目录与默认降级链

mod builtin;
mod types;

pub use builtin::{builtin_chains, builtin_endpoints};
pub use types::{
    LoggingConfig, PolicyConfig, ProviderConfig, RoleConfig, RoutecastConfig,
    DEFAULT_ACQUIRE_TIMEOUT_SECS, DEFAULT_CAPACITY_STALE_SECS, DEFAULT_COOLDOWN_SECS,
    DEFAULT_MAX_CONCURRENT, DEFAULT_PROACTIVE_THRESHOLD, DEFAULT_SHORT_WAIT_THRESHOLD_SECS,
};

use std::path::PathBuf;

/// 默认配置文件路径：`~/.routecast/config.yaml`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".routecast")
        .join("config.yaml")
}
