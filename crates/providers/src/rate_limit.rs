//! 限流信息解析
//!
//! 从 Provider 响应头中提取剩余容量比例与重试等待，
//! 并支持从错误消息里提取重试延迟（如 `retry in 1m30s`）。
//!
//! 支持的响应头：
//! - `x-ratelimit-{remaining,limit}-{tokens,requests}`（OpenAI 兼容）
//! - `anthropic-ratelimit-{tokens,requests}-{remaining,limit}`
//! - `x-ratelimit-reset-{tokens,requests}`（Go 风格时长）
//! - `anthropic-ratelimit-{tokens,requests}-reset`（RFC 3339 时间）
//! - `retry-after`（秒数 / 时长字符串 / HTTP 日期）、`retry-after-ms`

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

static DURATION_TOKEN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)(ms|us|µs|ns|h|m|s)").ok());

static RETRY_DELAY_FIELD: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"(?i)"?retry_?delay"?\s*[:=]\s*"?([0-9][0-9.a-zµ]*)"?"#).ok());

static RETRY_PHRASE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)(?:retry|try again)\s+(?:after|in)\s+([0-9][0-9.a-zµ]*)(?:\s*(?:seconds?|secs?)\b)?")
        .ok()
});

/// 解析时长字符串
///
/// 支持纯数字（秒）以及 Go 风格组合，如 `1h2m3s`、`1m30s`、`250ms`、`0.5s`。
pub fn parse_duration_string(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<f64>() {
        return secs_to_duration(secs);
    }

    let re = (*DURATION_TOKEN).as_ref()?;
    let mut total = 0.0;
    let mut end = 0;
    for caps in re.captures_iter(s) {
        let whole = caps.get(0)?;
        if whole.start() != end {
            return None;
        }
        end = whole.end();
        let value: f64 = caps[1].parse().ok()?;
        let factor = match &caps[2] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            _ => return None,
        };
        total += value * factor;
    }
    if end == 0 || end != s.len() {
        return None;
    }
    secs_to_duration(total)
}

fn secs_to_duration(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

/// 解析 `retry-after` 值：秒数、时长字符串或 HTTP 日期
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(duration) = parse_duration_string(value) {
        return Some(duration);
    }
    let at = DateTime::parse_from_rfc2822(value.trim()).ok()?;
    Some(until(at.with_timezone(&Utc), now))
}

fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

/// 从错误消息中提取重试延迟
///
/// 识别 `"retryDelay": "30s"`、`retry after 20 seconds`、`try again in 1m30s` 等写法。
pub fn extract_retry_delay(message: &str) -> Option<Duration> {
    let patterns: [&Option<Regex>; 2] = [&RETRY_DELAY_FIELD, &RETRY_PHRASE];
    patterns
        .into_iter()
        .filter_map(Option::as_ref)
        .find_map(|re| {
            let caps = re.captures(message)?;
            parse_duration_string(caps[1].trim_end_matches('.'))
        })
}

/// 响应头中的限流信息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub remaining_tokens: Option<u64>,
    pub limit_tokens: Option<u64>,
    pub remaining_requests: Option<u64>,
    pub limit_requests: Option<u64>,
    /// `retry-after` / `retry-after-ms`
    pub retry_after: Option<Duration>,
    /// tokens 窗口重置时间
    pub reset_tokens: Option<Duration>,
    /// requests 窗口重置时间
    pub reset_requests: Option<Duration>,
}

impl RateLimitHeaders {
    /// 从响应头键值对解析（名称不区分大小写）
    pub fn from_pairs<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self::from_pairs_at(headers, Utc::now())
    }

    /// 以指定时间为基准解析（绝对时间类响应头需要）
    pub fn from_pairs_at<I, K, V>(headers: I, now: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut parsed = Self::default();
        let mut retry_after_ms = None;
        for (name, value) in headers {
            let name = name.as_ref().trim().to_ascii_lowercase();
            let value = value.as_ref().trim();
            match name.as_str() {
                "x-ratelimit-remaining-tokens" | "anthropic-ratelimit-tokens-remaining" => {
                    parsed.remaining_tokens = value.parse().ok()
                }
                "x-ratelimit-limit-tokens" | "anthropic-ratelimit-tokens-limit" => {
                    parsed.limit_tokens = value.parse().ok()
                }
                "x-ratelimit-remaining-requests" | "anthropic-ratelimit-requests-remaining" => {
                    parsed.remaining_requests = value.parse().ok()
                }
                "x-ratelimit-limit-requests" | "anthropic-ratelimit-requests-limit" => {
                    parsed.limit_requests = value.parse().ok()
                }
                "retry-after" => parsed.retry_after = parse_retry_after(value, now),
                "retry-after-ms" => {
                    retry_after_ms = value
                        .parse::<f64>()
                        .ok()
                        .and_then(|ms| secs_to_duration(ms / 1000.0))
                }
                "x-ratelimit-reset-tokens" => parsed.reset_tokens = parse_duration_string(value),
                "x-ratelimit-reset-requests" => {
                    parsed.reset_requests = parse_duration_string(value)
                }
                "anthropic-ratelimit-tokens-reset" => {
                    parsed.reset_tokens = parse_reset_timestamp(value, now)
                }
                "anthropic-ratelimit-requests-reset" => {
                    parsed.reset_requests = parse_reset_timestamp(value, now)
                }
                _ => {}
            }
        }
        if retry_after_ms.is_some() {
            parsed.retry_after = retry_after_ms;
        }
        parsed
    }

    /// 剩余容量比例，取 tokens 与 requests 中更紧张的一项
    pub fn remaining_fraction(&self) -> Option<f64> {
        let tokens = fraction(self.remaining_tokens, self.limit_tokens);
        let requests = fraction(self.remaining_requests, self.limit_requests);
        match (tokens, requests) {
            (Some(t), Some(r)) => Some(t.min(r)),
            (t, r) => t.or(r),
        }
    }

    /// 建议的重试等待
    ///
    /// 优先使用 `retry-after`；额度已经耗尽时退回到窗口重置时间。
    pub fn retry_delay(&self) -> Option<Duration> {
        if self.retry_after.is_some() {
            return self.retry_after;
        }
        let exhausted = |remaining: Option<u64>| remaining == Some(0);
        let mut resets = Vec::new();
        if exhausted(self.remaining_tokens) {
            resets.extend(self.reset_tokens);
        }
        if exhausted(self.remaining_requests) {
            resets.extend(self.reset_requests);
        }
        resets.into_iter().max()
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn fraction(remaining: Option<u64>, limit: Option<u64>) -> Option<f64> {
    match (remaining, limit) {
        (Some(remaining), Some(limit)) if limit > 0 => {
            Some((remaining as f64 / limit as f64).clamp(0.0, 1.0))
        }
        _ => None,
    }
}

fn parse_reset_timestamp(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let at = DateTime::parse_from_rfc3339(value).ok()?;
    Some(until(at.with_timezone(&Utc), now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn test_parse_duration_string() {
        assert_eq!(parse_duration_string("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration_string("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration_string("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration_string("1h2m3s"), Some(Duration::from_secs(3723)));
        assert_eq!(parse_duration_string("0.5s"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration_string("6m0s"), Some(Duration::from_secs(360)));
        assert_eq!(parse_duration_string(""), None);
        assert_eq!(parse_duration_string("soon"), None);
        assert_eq!(parse_duration_string("5s later"), None);
        assert_eq!(parse_duration_string("-3"), None);
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 30).unwrap();
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_extract_retry_delay() {
        assert_eq!(
            extract_retry_delay(r#"{"error": {"details": [{"retryDelay": "45s"}]}}"#),
            Some(Duration::from_secs(45))
        );
        assert_eq!(
            extract_retry_delay("Rate limit reached. Please try again in 1m30s."),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            extract_retry_delay("Too many requests, retry after 20 seconds"),
            Some(Duration::from_secs(20))
        );
        assert_eq!(extract_retry_delay("internal server error"), None);
    }

    #[test]
    fn test_openai_headers() {
        let headers = RateLimitHeaders::from_pairs([
            ("X-RateLimit-Remaining-Tokens", "15000"),
            ("x-ratelimit-limit-tokens", "100000"),
            ("x-ratelimit-remaining-requests", "90"),
            ("x-ratelimit-limit-requests", "100"),
            ("x-ratelimit-reset-tokens", "6m0s"),
        ]);
        assert_eq!(headers.remaining_fraction(), Some(0.15));
        assert_eq!(headers.retry_delay(), None);
        assert!(!headers.is_empty());
    }

    #[test]
    fn test_anthropic_headers() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let headers = RateLimitHeaders::from_pairs_at(
            [
                ("anthropic-ratelimit-tokens-remaining", "0"),
                ("anthropic-ratelimit-tokens-limit", "80000"),
                ("anthropic-ratelimit-tokens-reset", "2026-01-01T00:00:42Z"),
            ],
            now,
        );
        assert_eq!(headers.remaining_fraction(), Some(0.0));
        assert_eq!(headers.retry_delay(), Some(Duration::from_secs(42)));
    }

    #[test]
    fn test_retry_after_ms_takes_precedence() {
        let headers =
            RateLimitHeaders::from_pairs([("retry-after-ms", "1500"), ("retry-after", "2")]);
        assert_eq!(headers.retry_delay(), Some(Duration::from_millis(1500)));
        assert!(RateLimitHeaders::from_pairs(Vec::<(&str, &str)>::new()).is_empty());
    }

    proptest! {
        #[test]
        fn prop_go_duration_components(h in 0u64..48, m in 0u64..60, s in 0u64..60) {
            let text = format!("{h}h{m}m{s}s");
            prop_assert_eq!(
                parse_duration_string(&text),
                Some(Duration::from_secs(h * 3600 + m * 60 + s))
            );
        }
    }
}
