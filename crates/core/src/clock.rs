//! 时钟抽象
//!
//! 冷却期、预算窗口和容量新鲜度都依赖"当前时间"。
//! 生产环境使用 `SystemClock`，测试使用 `ManualClock` 精确控制边界时刻。

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// 时钟 trait
pub trait Clock: Send + Sync {
    /// 当前 UTC 时间
    fn now(&self) -> DateTime<Utc>;
}

/// 共享时钟句柄
pub type SharedClock = Arc<dyn Clock>;

/// 系统时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 系统时钟的共享句柄
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// 手动时钟
///
/// 只有显式调用 `advance` / `set` 才会改变时间。
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// 从指定时刻开始
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// 从当前系统时间开始
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// 时间前进
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock();
        *now += delta;
    }

    /// 直接设置时间
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// chrono::Duration 转 std Duration（负值截断为 0）
pub fn to_std(delta: Duration) -> std::time::Duration {
    delta.to_std().unwrap_or_default()
}

/// std Duration 转 chrono::Duration（溢出时按一百年截断）
pub fn from_std(delta: std::time::Duration) -> Duration {
    Duration::from_std(delta).unwrap_or_else(|_| Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));
    }

    #[test]
    fn test_negative_duration_to_std_is_zero() {
        assert_eq!(to_std(Duration::seconds(-5)), std::time::Duration::ZERO);
        assert_eq!(
            to_std(Duration::milliseconds(1500)),
            std::time::Duration::from_millis(1500)
        );
    }
}
