//! 执行遥测类型
//!
//! 每次执行产生一条 `AttemptRecord`，立即被容量登记表、预算账本和冷却追踪器消费，
//! 本身不做持久化。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 执行结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// 成功
    Success,
    /// 被限流（软失败）
    RateLimited,
    /// 响应格式错误
    Malformed,
    /// 连接中断/超时
    Connection,
    /// 请求被校验拒绝
    Validation,
    /// 上游服务错误
    Upstream,
    /// 调用方取消（不计入端点健康度）
    Cancelled,
}

impl OutcomeKind {
    /// 是否成功
    pub fn is_success(self) -> bool {
        matches!(self, OutcomeKind::Success)
    }

    /// 软失败：由预算等待/降级处理，不触发冷却
    pub fn is_soft_failure(self) -> bool {
        matches!(self, OutcomeKind::RateLimited)
    }

    /// 硬失败：触发冷却
    pub fn is_hard_failure(self) -> bool {
        matches!(
            self,
            OutcomeKind::Malformed
                | OutcomeKind::Connection
                | OutcomeKind::Validation
                | OutcomeKind::Upstream
        )
    }

    /// 标识字符串
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::RateLimited => "rate_limited",
            OutcomeKind::Malformed => "malformed",
            OutcomeKind::Connection => "connection",
            OutcomeKind::Validation => "validation",
            OutcomeKind::Upstream => "upstream",
            OutcomeKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 容量数据来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacitySource {
    /// 来自响应头
    Observed,
    /// 根据预算窗口估算
    Estimated,
}

/// 单次执行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 端点 ID
    pub endpoint_id: String,
    /// 结果分类
    pub outcome: OutcomeKind,
    /// 输入 tokens
    pub input_tokens: u64,
    /// 输出 tokens
    pub output_tokens: u64,
    /// 延迟（毫秒）
    pub latency_ms: u64,
    /// 派生成本
    pub cost: f64,
    /// Provider 报告的剩余容量比例
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_fraction: Option<f64>,
    /// Provider 报告的重试等待（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// 记录时间
    pub recorded_at: DateTime<Utc>,
}

impl AttemptRecord {
    /// 创建记录，成本稍后由目录价格填充
    pub fn new(endpoint_id: &str, outcome: OutcomeKind) -> Self {
        Self {
            endpoint_id: endpoint_id.to_string(),
            outcome,
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            cost: 0.0,
            remaining_fraction: None,
            retry_after_ms: None,
            recorded_at: Utc::now(),
        }
    }

    /// 设置 token 用量
    pub fn with_tokens(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    /// 设置延迟
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// 设置观测到的剩余容量
    pub fn with_remaining(mut self, fraction: Option<f64>) -> Self {
        self.remaining_fraction = fraction;
        self
    }

    /// 设置重试等待
    pub fn with_retry_after(mut self, retry_after: Option<std::time::Duration>) -> Self {
        self.retry_after_ms = retry_after.map(|d| d.as_millis() as u64);
        self
    }

    /// 总 tokens
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// 重试等待
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        self.retry_after_ms.map(std::time::Duration::from_millis)
    }
}
