//! 派发错误
//!
//! 只有调用方能处理的错误才会传到派发层之外：准入超时、降级链耗尽、
//! 取消、已提交后的中断。软失败与硬失败在派发循环内部通过降级恢复。

use routecast_core::errors::{ConfigError, RoutingError};
use routecast_core::models::{OutcomeKind, WorkloadClass};
use routecast_scheduler::AdmissionError;
use std::time::Duration;
use thiserror::Error;

/// 派发错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// 在超时时间内未获取到并发槽位
    #[error("角色 {role} 获取并发槽位超时 ({:.1} 秒)", .waited.as_secs_f64())]
    AdmissionTimeout { role: String, waited: Duration },

    /// 降级链上所有端点都不可用
    #[error("负载类型 {workload} 的降级链已耗尽 (已尝试 {attempts} 次)")]
    ChainExhausted {
        workload: WorkloadClass,
        /// 最短的已知等待时间
        best_wait: Option<Duration>,
        attempts: u32,
    },

    /// 调用方取消
    #[error("派发已取消")]
    Cancelled,

    /// 已交付部分输出后失败，不再重试
    #[error("端点 {endpoint_id} 在交付部分输出后失败 ({kind}): {message}")]
    Interrupted {
        endpoint_id: String,
        kind: OutcomeKind,
        message: String,
    },

    /// 负载类型未配置降级链
    #[error("负载类型未配置降级链: {0}")]
    UnknownWorkload(WorkloadClass),

    /// 查询的 Provider 不存在
    #[error("Provider 不存在: {0}")]
    UnknownProvider(String),

    /// Governor 已关闭
    #[error("派发器已关闭")]
    Shutdown,

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),
}

impl DispatchError {
    /// 稳定的错误码
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::AdmissionTimeout { .. } => "ADMISSION_TIMEOUT",
            DispatchError::ChainExhausted { .. } => "CHAIN_EXHAUSTED",
            DispatchError::Cancelled => "CANCELLED",
            DispatchError::Interrupted { .. } => "INTERRUPTED",
            DispatchError::UnknownWorkload(_) => "UNKNOWN_WORKLOAD",
            DispatchError::UnknownProvider(_) => "UNKNOWN_PROVIDER",
            DispatchError::Shutdown => "SHUTDOWN",
            DispatchError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// 调用方稍后重试是否可能成功
    pub fn retryable(&self) -> bool {
        match self {
            DispatchError::AdmissionTimeout { .. } | DispatchError::Interrupted { .. } => true,
            // 没有可等待的候选（如缺少凭证）时重试无意义
            DispatchError::ChainExhausted { best_wait, .. } => best_wait.is_some(),
            _ => false,
        }
    }

    /// 建议的等待时间
    pub fn suggested_wait(&self) -> Option<Duration> {
        match self {
            DispatchError::ChainExhausted { best_wait, .. } => *best_wait,
            _ => None,
        }
    }
}

impl From<AdmissionError> for DispatchError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Timeout { role, waited } => {
                DispatchError::AdmissionTimeout { role, waited }
            }
            AdmissionError::Cancelled { .. } => DispatchError::Cancelled,
            AdmissionError::Closed { .. } => DispatchError::Shutdown,
        }
    }
}

impl From<RoutingError> for DispatchError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::UnknownWorkload(workload) => DispatchError::UnknownWorkload(workload),
            RoutingError::ChainExhausted {
                workload,
                best_wait,
            } => DispatchError::ChainExhausted {
                workload,
                best_wait,
                attempts: 0,
            },
            other => DispatchError::Config(other.to_string()),
        }
    }
}

impl From<ConfigError> for DispatchError {
    fn from(err: ConfigError) -> Self {
        DispatchError::Config(err.to_string())
    }
}

impl From<DispatchError> for String {
    fn from(err: DispatchError) -> Self {
        err.to_string()
    }
}

impl serde::Serialize for DispatchError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_errors_map() {
        let err: DispatchError = AdmissionError::Timeout {
            role: "coder".to_string(),
            waited: Duration::from_secs(60),
        }
        .into();
        assert_eq!(err.code(), "ADMISSION_TIMEOUT");
        assert!(err.retryable());

        let err: DispatchError = AdmissionError::Cancelled {
            role: "coder".to_string(),
        }
        .into();
        assert_eq!(err, DispatchError::Cancelled);
        assert!(!err.retryable());
    }

    #[test]
    fn test_exhausted_retryable_only_with_wait() {
        let waitable = DispatchError::ChainExhausted {
            workload: WorkloadClass::Lookup,
            best_wait: Some(Duration::from_secs(30)),
            attempts: 2,
        };
        assert!(waitable.retryable());
        assert_eq!(waitable.suggested_wait(), Some(Duration::from_secs(30)));

        let hopeless = DispatchError::ChainExhausted {
            workload: WorkloadClass::Lookup,
            best_wait: None,
            attempts: 0,
        };
        assert!(!hopeless.retryable());
        assert_eq!(
            serde_json::to_string(&hopeless).unwrap(),
            format!("\"{}\"", hopeless)
        );
    }
}
