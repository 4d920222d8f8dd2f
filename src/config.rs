//! 配置文件读写
//!
//! 配置为 YAML 格式，默认位于 `~/.routecast/config.yaml`。
//! 文件不存在时使用内置配置。

use anyhow::Context;
pub use routecast_core::config::{
    default_config_path, LoggingConfig, PolicyConfig, ProviderConfig, RoleConfig, RoutecastConfig,
};
use std::path::Path;

/// 读取并校验配置文件
pub fn load_config(path: &Path) -> anyhow::Result<RoutecastConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
    let config = RoutecastConfig::from_yaml_str(&content)
        .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
    tracing::info!(
        "[Config] 已加载配置: {} ({} 个端点, {} 条降级链)",
        path.display(),
        config.endpoints.len(),
        config.chains.len()
    );
    Ok(config)
}

/// 读取配置，未指定路径时使用默认路径；文件不存在时回退到内置配置
pub fn load_or_builtin(path: Option<&Path>) -> anyhow::Result<RoutecastConfig> {
    let default_path = default_config_path();
    let path = path.unwrap_or(&default_path);
    if path.exists() {
        load_config(path)
    } else {
        tracing::info!("[Config] 配置文件不存在，使用内置配置: {}", path.display());
        Ok(RoutecastConfig::builtin())
    }
}

/// 保存配置
pub fn save_config(config: &RoutecastConfig, path: &Path) -> anyhow::Result<()> {
    config.validate().context("配置校验失败")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("创建配置目录失败: {}", parent.display()))?;
    }
    let content = config.to_yaml()?;
    std::fs::write(path, content)
        .with_context(|| format!("写入配置文件失败: {}", path.display()))?;
    Ok(())
}
