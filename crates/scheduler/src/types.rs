//! Governor 类型定义

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// 准入控制错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// 在超时时间内未获取到槽位
    #[error("角色 {role} 获取并发槽位超时 ({:.1} 秒)", .waited.as_secs_f64())]
    Timeout { role: String, waited: Duration },

    /// 等待期间被调用方取消
    #[error("角色 {role} 等待并发槽位时被取消")]
    Cancelled { role: String },

    /// Governor 已关闭
    #[error("Governor 已关闭，拒绝角色 {role} 的请求")]
    Closed { role: String },
}

impl AdmissionError {
    /// 出错的角色
    pub fn role(&self) -> &str {
        match self {
            AdmissionError::Timeout { role, .. }
            | AdmissionError::Cancelled { role }
            | AdmissionError::Closed { role } => role,
        }
    }
}

impl From<AdmissionError> for String {
    fn from(err: AdmissionError) -> Self {
        err.to_string()
    }
}

impl Serialize for AdmissionError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// 角色并发统计快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleStats {
    /// 角色名
    pub role: String,
    /// 最大并发数
    pub max_concurrent: usize,
    /// 当前活跃槽位
    pub active: usize,
    /// 当前排队等待数
    pub waiting: usize,
    /// 历史峰值
    pub peak: usize,
    /// 累计获取次数
    pub total_acquired: u64,
    /// 累计释放次数
    pub total_released: u64,
    /// 累计超时次数
    pub timeouts: u64,
    /// 累计取消次数
    pub cancelled: u64,
}

impl RoleStats {
    /// 剩余可用槽位
    pub fn available(&self) -> usize {
        self.max_concurrent.saturating_sub(self.active)
    }
}

/// 角色限额
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleLimit {
    /// 最大并发数
    pub max_concurrent: usize,
    /// 获取超时
    pub acquire_timeout: Duration,
}
