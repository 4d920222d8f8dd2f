//! 执行层接口
//!
//! Dispatcher 通过 `Executor` 把工作单元交给真正与后端通信的执行层。
//! 每次尝试附带一个 `AttemptHandle`：执行层一旦向调用方交付了部分输出，
//! 必须调用 `commit()`，此后该次尝试的失败不再重试或降级。

use crate::classify::classify;
use crate::rate_limit::{extract_retry_delay, RateLimitHeaders};
use async_trait::async_trait;
use routecast_core::models::{AttemptRecord, Endpoint, OutcomeKind};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 工作单元
///
/// 载荷对路由核心不透明，只有预估用量参与预算与上下文检查。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: Uuid,
    pub payload: serde_json::Value,
    /// 预估输入 tokens
    #[serde(default)]
    pub estimated_input_tokens: u64,
    /// 预估输出 tokens
    #[serde(default)]
    pub estimated_output_tokens: u64,
}

impl WorkUnit {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            estimated_input_tokens: 0,
            estimated_output_tokens: 0,
        }
    }

    /// 设置预估用量
    pub fn with_estimate(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.estimated_input_tokens = input_tokens;
        self.estimated_output_tokens = output_tokens;
        self
    }

    /// 预估总用量
    pub fn estimated_tokens(&self) -> u64 {
        self.estimated_input_tokens
            .saturating_add(self.estimated_output_tokens)
    }
}

/// 单次尝试的句柄
#[derive(Debug, Clone)]
pub struct AttemptHandle {
    id: Uuid,
    endpoint_id: String,
    attempt: u32,
    committed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl AttemptHandle {
    pub fn new(endpoint_id: &str, attempt: u32, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint_id: endpoint_id.to_string(),
            attempt,
            committed: Arc::new(AtomicBool::new(false)),
            cancel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// 第几次尝试（从 1 开始）
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// 标记已向调用方交付部分输出；返回是否为首次标记
    pub fn commit(&self) -> bool {
        let first = !self.committed.swap(true, Ordering::SeqCst);
        if first {
            tracing::debug!(
                "[AttemptHandle] {} 已提交部分输出 (attempt {})",
                self.endpoint_id,
                self.attempt
            );
        }
        first
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    /// 执行层应监听的取消信号
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// 成功执行的报告
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// 执行输出
    pub output: serde_json::Value,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// 响应头报告的剩余容量
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_fraction: Option<f64>,
}

impl ExecutionReport {
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            ..Default::default()
        }
    }

    pub fn with_tokens(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    /// 读取响应头中的限流信息
    pub fn with_headers(mut self, headers: &RateLimitHeaders) -> Self {
        self.remaining_fraction = headers.remaining_fraction();
        self
    }

    /// 转为执行记录
    pub fn to_record(&self, endpoint_id: &str, latency: Duration) -> AttemptRecord {
        AttemptRecord::new(endpoint_id, OutcomeKind::Success)
            .with_tokens(self.input_tokens, self.output_tokens)
            .with_latency(latency.as_millis() as u64)
            .with_remaining(self.remaining_fraction)
    }
}

/// 执行失败
#[derive(Error, Debug, Clone)]
#[error("执行失败 ({kind}): {message}")]
pub struct ExecutionFailure {
    /// 失败分类
    pub kind: OutcomeKind,
    /// 错误消息
    pub message: String,
    /// HTTP 状态码
    pub status: Option<u16>,
    /// 失败前已消耗的 tokens
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// 响应头报告的剩余容量
    pub remaining_fraction: Option<f64>,
    /// Provider 建议的重试等待
    pub retry_after: Option<Duration>,
}

impl ExecutionFailure {
    pub fn new(kind: OutcomeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            input_tokens: 0,
            output_tokens: 0,
            remaining_fraction: None,
            retry_after: None,
        }
    }

    /// 根据 HTTP 响应构造：分类、剩余容量与重试等待一并解析
    pub fn from_response(
        status: u16,
        message: impl Into<String>,
        headers: &RateLimitHeaders,
    ) -> Self {
        let message = message.into();
        let kind = classify(Some(status), &message);
        let retry_after = headers
            .retry_delay()
            .or_else(|| extract_retry_delay(&message));
        Self {
            status: Some(status),
            remaining_fraction: headers.remaining_fraction(),
            retry_after,
            ..Self::new(kind, message)
        }
    }

    /// 传输层失败（无响应）
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Connection, message)
    }

    /// 响应无法解析
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Malformed, message)
    }

    /// 被限流
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(OutcomeKind::RateLimited, message)
        }
    }

    /// 执行被取消
    pub fn cancelled() -> Self {
        Self::new(OutcomeKind::Cancelled, "执行已取消")
    }

    pub fn with_tokens(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    /// 转为执行记录
    pub fn to_record(&self, endpoint_id: &str, latency: Duration) -> AttemptRecord {
        AttemptRecord::new(endpoint_id, self.kind)
            .with_tokens(self.input_tokens, self.output_tokens)
            .with_latency(latency.as_millis() as u64)
            .with_remaining(self.remaining_fraction)
            .with_retry_after(self.retry_after)
    }
}

/// 执行层
#[async_trait]
pub trait Executor: Send + Sync {
    /// 在指定端点上执行工作单元
    ///
    /// 实现方应在开始向调用方交付输出时调用 `attempt.commit()`，
    /// 并在 `attempt.cancel_token()` 触发时尽快返回。
    async fn execute(
        &self,
        endpoint: &Endpoint,
        work: &WorkUnit,
        attempt: &AttemptHandle,
    ) -> Result<ExecutionReport, ExecutionFailure>;
}
