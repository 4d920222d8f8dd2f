//! 配置类型定义

use crate::errors::ConfigError;
use crate::models::{Endpoint, WorkloadClass};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// 默认主动切换阈值（剩余 20% 时切换）
pub const DEFAULT_PROACTIVE_THRESHOLD: f64 = 0.20;
/// 默认冷却时长（秒）
pub const DEFAULT_COOLDOWN_SECS: u64 = 300;
/// 默认短等待阈值（秒），达到该值直接降级而非等待
pub const DEFAULT_SHORT_WAIT_THRESHOLD_SECS: u64 = 10;
/// 默认容量数据过期时长（秒）
pub const DEFAULT_CAPACITY_STALE_SECS: u64 = 600;
/// 默认并发槽位获取超时（秒）
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 60;
/// 未配置角色的默认并发上限
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// 根配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutecastConfig {
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
    /// 路由策略
    #[serde(default)]
    pub policy: PolicyConfig,
    /// 模型目录
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// 负载类型 -> 降级链
    #[serde(default)]
    pub chains: IndexMap<WorkloadClass, Vec<String>>,
    /// Provider 级配置（预算、策略覆盖）
    #[serde(default)]
    pub providers: IndexMap<String, ProviderConfig>,
    /// 角色并发配置
    #[serde(default)]
    pub roles: IndexMap<String, RoleConfig>,
    /// 凭证类型 -> 环境变量名
    #[serde(default)]
    pub credentials: IndexMap<String, String>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别（trace/debug/info/warn/error）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 是否输出 target
    #[serde(default)]
    pub show_target: bool,
    /// 是否启用 ANSI 颜色
    #[serde(default = "default_true")]
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            show_target: false,
            ansi: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// 路由策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// 主动切换阈值（剩余容量比例）
    pub proactive_threshold: f64,
    /// 硬失败冷却时长（秒）
    pub cooldown_secs: u64,
    /// 短等待阈值（秒）
    pub short_wait_threshold_secs: u64,
    /// 容量数据过期时长（秒）
    pub capacity_stale_after_secs: u64,
    /// 槽位获取超时（秒）
    pub acquire_timeout_secs: u64,
    /// 未配置角色的并发上限
    pub default_max_concurrent: usize,
    /// 单个端点的最大预算等待次数
    pub max_budget_waits: u32,
    /// 降级链耗尽后的最大等待次数
    pub max_exhausted_waits: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            proactive_threshold: DEFAULT_PROACTIVE_THRESHOLD,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            short_wait_threshold_secs: DEFAULT_SHORT_WAIT_THRESHOLD_SECS,
            capacity_stale_after_secs: DEFAULT_CAPACITY_STALE_SECS,
            acquire_timeout_secs: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            default_max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_budget_waits: 3,
            max_exhausted_waits: 1,
        }
    }
}

impl PolicyConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn short_wait_threshold(&self) -> Duration {
        Duration::from_secs(self.short_wait_threshold_secs)
    }

    pub fn capacity_stale_after(&self) -> Duration {
        Duration::from_secs(self.capacity_stale_after_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Provider 级配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// 每分钟 tokens 上限（默认取成员端点标称值的最大值）
    pub tokens_per_minute: Option<u64>,
    /// 每日 tokens 上限
    pub tokens_per_day: Option<u64>,
    /// 覆盖全局主动切换阈值
    pub proactive_threshold: Option<f64>,
    /// 覆盖全局冷却时长（秒）
    pub cooldown_secs: Option<u64>,
}

/// 角色并发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// 最大并发数
    pub max_concurrent: usize,
    /// 覆盖全局获取超时（秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_secs: Option<u64>,
}

impl RoleConfig {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            acquire_timeout_secs: None,
        }
    }
}

impl RoutecastConfig {
    /// 从 YAML 字符串解析并校验
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: RoutecastConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// 序列化为 YAML
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// 校验配置
    ///
    /// - 端点 ID 唯一
    /// - 每条降级链非空、无重复、只引用已知端点
    /// - 阈值在 [0, 1]
    /// - 角色并发上限 >= 1
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for endpoint in &self.endpoints {
            if !ids.insert(endpoint.id.as_str()) {
                return Err(ConfigError::DuplicateEndpoint(endpoint.id.clone()));
            }
        }

        for (workload, chain) in &self.chains {
            if chain.is_empty() {
                return Err(ConfigError::EmptyChain(*workload));
            }
            let mut seen = HashSet::new();
            for id in chain {
                if !ids.contains(id.as_str()) {
                    return Err(ConfigError::UnknownEndpointInChain {
                        workload: *workload,
                        endpoint_id: id.clone(),
                    });
                }
                if !seen.insert(id.as_str()) {
                    return Err(ConfigError::DuplicateInChain {
                        workload: *workload,
                        endpoint_id: id.clone(),
                    });
                }
            }
        }

        check_threshold("policy.proactive_threshold", self.policy.proactive_threshold)?;
        for (name, provider) in &self.providers {
            if let Some(threshold) = provider.proactive_threshold {
                check_threshold(&format!("providers.{name}.proactive_threshold"), threshold)?;
            }
        }

        if self.policy.default_max_concurrent == 0 {
            return Err(ConfigError::InvalidRoleLimit("<default>".to_string()));
        }
        for (role, config) in &self.roles {
            if config.max_concurrent == 0 {
                return Err(ConfigError::InvalidRoleLimit(role.clone()));
            }
        }

        Ok(())
    }

    /// Provider 的预算上限 (每分钟, 每日)
    ///
    /// 未显式配置时取成员端点标称值的最大值。
    pub fn provider_limits(&self, provider: &str) -> (u64, u64) {
        let members = self.endpoints.iter().filter(|e| e.provider == provider);
        let (nominal_minute, nominal_day) = members.fold((0u64, 0u64), |(m, d), e| {
            (m.max(e.tokens_per_minute), d.max(e.tokens_per_day))
        });
        let config = self.providers.get(provider);
        (
            config
                .and_then(|c| c.tokens_per_minute)
                .unwrap_or(nominal_minute),
            config.and_then(|c| c.tokens_per_day).unwrap_or(nominal_day),
        )
    }

    /// Provider 的冷却时长
    pub fn provider_cooldown(&self, provider: &str) -> Duration {
        self.providers
            .get(provider)
            .and_then(|c| c.cooldown_secs)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.policy.cooldown())
    }

    /// Provider 的主动切换阈值
    pub fn provider_threshold(&self, provider: &str) -> f64 {
        self.providers
            .get(provider)
            .and_then(|c| c.proactive_threshold)
            .unwrap_or(self.policy.proactive_threshold)
    }

    /// 所有出现过的 Provider（按端点顺序去重）
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for endpoint in &self.endpoints {
            if !names.contains(&endpoint.provider) {
                names.push(endpoint.provider.clone());
            }
        }
        for name in self.providers.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// 角色的获取超时
    pub fn role_acquire_timeout(&self, role: &str) -> Duration {
        self.roles
            .get(role)
            .and_then(|r| r.acquire_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.policy.acquire_timeout())
    }
}

fn check_threshold(name: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        return Err(ConfigError::ThresholdOutOfRange {
            name: name.to_string(),
            value,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RoutecastConfig {
        RoutecastConfig {
            endpoints: vec![
                Endpoint::new("a", "p1", 1).with_limits(1_000, 10_000),
                Endpoint::new("b", "p1", 1).with_limits(5_000, 8_000),
                Endpoint::new("c", "p2", 2),
            ],
            chains: IndexMap::from([(
                WorkloadClass::General,
                vec!["a".to_string(), "b".to_string(), "c".to_string()],
            )]),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_chains() {
        let mut config = sample();
        config
            .chains
            .insert(WorkloadClass::Lookup, vec!["a".to_string(), "a".to_string()]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateInChain { .. })
        ));

        let mut config = sample();
        config.chains.insert(WorkloadClass::Lookup, vec![]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::EmptyChain(WorkloadClass::Lookup))
        );

        let mut config = sample();
        config
            .chains
            .insert(WorkloadClass::Lookup, vec!["missing".to_string()]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownEndpointInChain { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let mut config = sample();
        config.policy.proactive_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdOutOfRange { .. })
        ));

        let mut config = sample();
        config.roles.insert("coder".to_string(), RoleConfig::new(0));
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidRoleLimit("coder".to_string()))
        );
    }

    #[test]
    fn test_provider_limits_default_to_member_max() {
        let mut config = sample();
        assert_eq!(config.provider_limits("p1"), (5_000, 10_000));

        config.providers.insert(
            "p1".to_string(),
            ProviderConfig {
                tokens_per_minute: Some(2_000),
                ..Default::default()
            },
        );
        assert_eq!(config.provider_limits("p1"), (2_000, 10_000));
        assert_eq!(config.provider_limits("unknown"), (0, 0));
    }

    #[test]
    fn test_provider_overrides() {
        let mut config = sample();
        config.providers.insert(
            "p2".to_string(),
            ProviderConfig {
                proactive_threshold: Some(0.5),
                cooldown_secs: Some(30),
                ..Default::default()
            },
        );
        assert_eq!(config.provider_threshold("p1"), DEFAULT_PROACTIVE_THRESHOLD);
        assert_eq!(config.provider_threshold("p2"), 0.5);
        assert_eq!(
            config.provider_cooldown("p1"),
            Duration::from_secs(DEFAULT_COOLDOWN_SECS)
        );
        assert_eq!(config.provider_cooldown("p2"), Duration::from_secs(30));
    }

    #[test]
    fn test_yaml_roundtrip_with_defaults() {
        let yaml = r#"
policy:
  cooldown_secs: 60
endpoints:
  - id: a
    provider: p1
    credential_kind: p1
    tier: 1
    context_limit: 1000
    max_output_tokens: 100
    tokens_per_minute: 1000
    tokens_per_day: 10000
chains:
  lookup: [a]
roles:
  coder:
    max_concurrent: 2
"#;
        let config = RoutecastConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.policy.cooldown_secs, 60);
        assert_eq!(config.policy.proactive_threshold, DEFAULT_PROACTIVE_THRESHOLD);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.chains[&WorkloadClass::Lookup], vec!["a".to_string()]);
        assert_eq!(config.roles["coder"].max_concurrent, 2);
        assert_eq!(
            config.role_acquire_timeout("coder"),
            Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS)
        );
    }
}
