//! 执行层接口
//!
//! 包含 Executor trait、尝试句柄、结果分类与限流响应头解析。

pub mod classify;
pub mod executor;
pub mod rate_limit;

pub use classify::{classify, classify_status};
pub use executor::{AttemptHandle, ExecutionFailure, ExecutionReport, Executor, WorkUnit};
pub use rate_limit::{extract_retry_delay, parse_duration_string, parse_retry_after, RateLimitHeaders};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
