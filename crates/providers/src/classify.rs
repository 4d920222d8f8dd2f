//! 执行结果分类
//!
//! 根据状态码和错误消息推断 `OutcomeKind`。消息特征优先于状态码，
//! 因为部分 Provider 会用 400/500 包装限流或超时。

use routecast_core::models::OutcomeKind;

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "quota exceeded",
    "resource_exhausted",
    "overloaded",
    "请求过于频繁",
];

const CONNECTION_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "unexpected eof",
    "超时",
];

const MALFORMED_MARKERS: &[&str] = &[
    "malformed",
    "invalid json",
    "failed to parse",
    "parse error",
    "unexpected end of",
    "missing field",
];

/// 推断结果分类
///
/// `status` 为 None 表示没有收到 HTTP 响应（传输层失败）。
pub fn classify(status: Option<u16>, message: &str) -> OutcomeKind {
    let normalized = message.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|m| normalized.contains(m));

    if contains_any(RATE_LIMIT_MARKERS) {
        return OutcomeKind::RateLimited;
    }
    if contains_any(CONNECTION_MARKERS) {
        return OutcomeKind::Connection;
    }
    if contains_any(MALFORMED_MARKERS) {
        return OutcomeKind::Malformed;
    }

    match status {
        None => OutcomeKind::Connection,
        Some(200..=299) => OutcomeKind::Success,
        Some(429 | 529) => OutcomeKind::RateLimited,
        Some(400 | 401 | 403 | 404 | 413 | 422) => OutcomeKind::Validation,
        Some(408 | 504) => OutcomeKind::Connection,
        Some(499) => OutcomeKind::Cancelled,
        Some(_) => OutcomeKind::Upstream,
    }
}

/// 状态码对应的结果分类（无消息时）
pub fn classify_status(status: u16) -> OutcomeKind {
    classify(Some(status), "")
}
