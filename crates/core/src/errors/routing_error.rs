//! 路由相关错误类型
//!
//! 定义路由核心中的错误类型，包括：
//! - ConfigError（配置错误）
//! - RoutingError（路由解析错误）
//!
//! ## 设计原则
//! - 使用 thiserror 派生 Error trait
//! - 实现 Serialize（序列化为错误消息）以便状态快照/上层返回

use crate::models::WorkloadClass;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// 配置错误
// ============================================================================

/// 配置校验错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// 端点 ID 重复
    #[error("端点 ID 重复: {0}")]
    DuplicateEndpoint(String),

    /// 降级链为空
    #[error("负载类型 {0} 的降级链为空")]
    EmptyChain(WorkloadClass),

    /// 降级链中出现重复端点
    #[error("负载类型 {workload} 的降级链中端点重复: {endpoint_id}")]
    DuplicateInChain {
        workload: WorkloadClass,
        endpoint_id: String,
    },

    /// 降级链引用了未知端点
    #[error("负载类型 {workload} 的降级链引用了未知端点: {endpoint_id}")]
    UnknownEndpointInChain {
        workload: WorkloadClass,
        endpoint_id: String,
    },

    /// 阈值越界
    #[error("配置项 {name} 的取值 {value} 超出范围 [0, 1]")]
    ThresholdOutOfRange { name: String, value: f64 },

    /// 角色并发上限非法
    #[error("角色 {0} 的 max_concurrent 必须大于 0")]
    InvalidRoleLimit(String),

    /// 解析失败
    #[error("配置解析失败: {0}")]
    Parse(String),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

impl From<ConfigError> for String {
    fn from(err: ConfigError) -> Self {
        err.to_string()
    }
}

impl serde::Serialize for ConfigError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

// ============================================================================
// 路由错误
// ============================================================================

/// 路由解析错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    /// 负载类型未配置降级链
    #[error("负载类型未配置降级链: {0}")]
    UnknownWorkload(WorkloadClass),

    /// 端点不存在
    #[error("端点不存在: {0}")]
    UnknownEndpoint(String),

    /// 降级链全部不可用
    #[error("负载类型 {workload} 的降级链已耗尽{}", format_wait(.best_wait))]
    ChainExhausted {
        workload: WorkloadClass,
        /// 最短的已知等待时间；None 表示等待也无法恢复（如缺少凭证）
        best_wait: Option<Duration>,
    },
}

impl RoutingError {
    /// 建议的等待时间
    pub fn suggested_wait(&self) -> Option<Duration> {
        match self {
            RoutingError::ChainExhausted { best_wait, .. } => *best_wait,
            _ => None,
        }
    }
}

fn format_wait(wait: &Option<Duration>) -> String {
    match wait {
        Some(wait) => format!("，建议等待 {:.1} 秒", wait.as_secs_f64()),
        None => String::new(),
    }
}

impl From<RoutingError> for String {
    fn from(err: RoutingError) -> Self {
        err.to_string()
    }
}

impl serde::Serialize for RoutingError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
