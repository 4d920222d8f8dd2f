//! 日志初始化与脱敏
//!
//! 使用 tracing-subscriber 的 fmt 层输出日志，重复初始化时静默忽略。
//! 凭证相关字段在写入日志前需经过 `sanitize` 脱敏。

use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use routecast_core::config::LoggingConfig;
use std::str::FromStr;
use tracing::Level;

static INITIALIZED: OnceCell<bool> = OnceCell::new();

static SENSITIVE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"Bearer\s+[A-Za-z0-9._-]+", "Bearer ***"),
        (r"sk-(?:ant-)?[A-Za-z0-9_-]{8,}", "sk-***"),
        (r"AIza[0-9A-Za-z_-]{16,}", "AIza***"),
        (r"gsk_[A-Za-z0-9]{8,}", "gsk_***"),
        (
            r#"api[_-]?key["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#,
            "api_key: ***",
        ),
        (
            r#"[Aa]uthorization["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#,
            "authorization: ***",
        ),
        (
            r#"secret["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#,
            "secret: ***",
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

/// 解析日志级别，无法识别时使用 INFO
pub fn parse_level(level: &str) -> Level {
    Level::from_str(level.trim()).unwrap_or(Level::INFO)
}

/// 初始化全局日志
///
/// 返回本次调用是否完成了初始化。已有全局 subscriber 时返回 false。
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let mut installed = false;
    INITIALIZED.get_or_init(|| {
        let level = parse_level(&config.level);
        installed = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(config.show_target)
            .with_ansi(config.ansi)
            .try_init()
            .is_ok();
        if installed {
            tracing::info!("[Logger] 日志已初始化: level={}", level);
        }
        installed
    });
    installed
}

/// 屏蔽消息中的凭证
pub fn sanitize(message: &str) -> String {
    SENSITIVE_PATTERNS
        .iter()
        .fold(message.to_string(), |text, (re, replacement)| {
            re.replace_all(&text, *replacement).into_owned()
        })
}
