//! 冷却追踪器（熔断）
//!
//! 硬失败后端点进入固定时长的冷却期，期间不会作为候选返回。
//! 过期条目在读取时惰性清理，不需要后台任务。
//! 冷却期内再次失败只刷新时间戳，不叠加、不指数延长。

use crate::clock::{from_std, to_std, SharedClock};
use crate::models::OutcomeKind;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// 冷却条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownEntry {
    /// 失败时间
    pub failed_at: DateTime<Utc>,
    /// 冷却截止时间
    pub cooldown_until: DateTime<Utc>,
    /// 触发冷却的结果分类
    pub reason: OutcomeKind,
    /// 冷却期内的连续失败次数（仅用于观测）
    pub consecutive_failures: u32,
}

/// 冷却追踪器
pub struct CooldownTracker {
    entries: DashMap<String, CooldownEntry>,
    durations: DashMap<String, Duration>,
    default_duration: Duration,
    clock: SharedClock,
}

impl CooldownTracker {
    pub fn new(clock: SharedClock, default_duration: std::time::Duration) -> Self {
        Self {
            entries: DashMap::new(),
            durations: DashMap::new(),
            default_duration: from_std(default_duration),
            clock,
        }
    }

    /// 为单个端点设置冷却时长
    pub fn set_duration(&self, endpoint_id: &str, duration: std::time::Duration) {
        self.durations
            .insert(endpoint_id.to_string(), from_std(duration));
    }

    fn duration_for(&self, endpoint_id: &str) -> Duration {
        self.durations
            .get(endpoint_id)
            .map(|d| *d)
            .unwrap_or(self.default_duration)
    }

    /// 记录硬失败，从当前时间开始冷却
    pub fn record_failure(&self, endpoint_id: &str) -> CooldownEntry {
        self.record_failure_with(endpoint_id, OutcomeKind::Connection)
    }

    fn record_failure_with(&self, endpoint_id: &str, reason: OutcomeKind) -> CooldownEntry {
        let now = self.clock.now();
        let cooldown_until = now + self.duration_for(endpoint_id);
        let mut entry = self
            .entries
            .entry(endpoint_id.to_string())
            .or_insert_with(|| CooldownEntry {
                failed_at: now,
                cooldown_until,
                reason,
                consecutive_failures: 0,
            });
        if now >= entry.cooldown_until {
            entry.consecutive_failures = 0;
        }
        entry.failed_at = now;
        entry.cooldown_until = cooldown_until;
        entry.reason = reason;
        entry.consecutive_failures += 1;
        let snapshot = entry.clone();
        drop(entry);

        tracing::info!(
            "[CooldownTracker] {} 进入冷却 ({}), 截止 {}",
            endpoint_id,
            reason,
            snapshot.cooldown_until
        );
        snapshot
    }

    /// 按结果分类记录；只有硬失败会触发冷却
    pub fn record_outcome(&self, endpoint_id: &str, outcome: OutcomeKind) -> bool {
        if !outcome.is_hard_failure() {
            return false;
        }
        self.record_failure_with(endpoint_id, outcome);
        true
    }

    /// 是否处于冷却期（`now >= cooldown_until` 时视为已过期）
    pub fn in_cooldown(&self, endpoint_id: &str) -> bool {
        self.remaining(endpoint_id).is_some()
    }

    /// 剩余冷却时间
    pub fn remaining(&self, endpoint_id: &str) -> Option<std::time::Duration> {
        let now = self.clock.now();
        let until = self.entries.get(endpoint_id)?.cooldown_until;
        if now >= until {
            self.entries
                .remove_if(endpoint_id, |_, entry| now >= entry.cooldown_until);
            return None;
        }
        Some(to_std(until - now))
    }

    /// 当前冷却条目
    pub fn entry(&self, endpoint_id: &str) -> Option<CooldownEntry> {
        if !self.in_cooldown(endpoint_id) {
            return None;
        }
        self.entries.get(endpoint_id).map(|e| e.clone())
    }

    /// 手动解除冷却
    pub fn clear(&self, endpoint_id: &str) -> bool {
        self.entries.remove(endpoint_id).is_some()
    }

    /// 所有生效中的冷却条目（顺带清理过期条目）
    pub fn active(&self) -> Vec<(String, CooldownEntry)> {
        let now = self.clock.now();
        self.entries.retain(|_, entry| now < entry.cooldown_until);
        let mut active: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));
        active
    }

    /// 条目总数（含尚未清理的过期条目）
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for CooldownTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooldownTracker")
            .field("entries", &self.entries.len())
            .field("default_duration", &self.default_duration)
            .finish()
    }
}
