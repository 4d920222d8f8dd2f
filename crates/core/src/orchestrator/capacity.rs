//! 容量登记表
//!
//! 记录每个端点的剩余容量比例。数据只由执行遥测写入，消费者只读。
//! 从未观测过或已过期的端点视为"健康"，冷启动不会阻塞派发。

use crate::clock::{from_std, SharedClock};
use crate::models::CapacitySource;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// 端点容量事实
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacityFact {
    /// 剩余容量比例 (0.0 - 1.0)
    pub remaining_fraction: f64,
    /// 最近更新时间
    pub last_updated: DateTime<Utc>,
    /// 数据来源
    pub source: CapacitySource,
}

/// 容量登记表
pub struct CapacityRegistry {
    facts: DashMap<String, CapacityFact>,
    stale_after: Duration,
    clock: SharedClock,
}

impl CapacityRegistry {
    pub fn new(clock: SharedClock, stale_after: std::time::Duration) -> Self {
        Self {
            facts: DashMap::new(),
            stale_after: from_std(stale_after),
            clock,
        }
    }

    /// 记录一次观测，覆盖旧值
    ///
    /// 比例会被截断到 [0, 1]；NaN 被忽略。
    pub fn observe(&self, endpoint_id: &str, remaining_fraction: f64, source: CapacitySource) {
        if remaining_fraction.is_nan() {
            tracing::warn!("[CapacityRegistry] 忽略非法容量值: {}", endpoint_id);
            return;
        }
        let fact = CapacityFact {
            remaining_fraction: remaining_fraction.clamp(0.0, 1.0),
            last_updated: self.clock.now(),
            source,
        };
        tracing::debug!(
            "[CapacityRegistry] {} 剩余容量 {:.0}% ({:?})",
            endpoint_id,
            fact.remaining_fraction * 100.0,
            source
        );
        self.facts.insert(endpoint_id.to_string(), fact);
    }

    /// 剩余容量比例；未知或已过期时返回 None
    pub fn remaining(&self, endpoint_id: &str) -> Option<f64> {
        self.fact(endpoint_id).map(|f| f.remaining_fraction)
    }

    /// 未过期的容量事实
    pub fn fact(&self, endpoint_id: &str) -> Option<CapacityFact> {
        let fact = *self.facts.get(endpoint_id)?;
        if self.clock.now() - fact.last_updated > self.stale_after {
            return None;
        }
        Some(fact)
    }

    /// 是否低于阈值（未知视为健康）
    pub fn is_below(&self, endpoint_id: &str, threshold: f64) -> bool {
        self.remaining(endpoint_id)
            .map(|remaining| remaining < threshold)
            .unwrap_or(false)
    }

    /// 所有未过期事实
    pub fn snapshot(&self) -> Vec<(String, CapacityFact)> {
        let now = self.clock.now();
        let mut facts: Vec<_> = self
            .facts
            .iter()
            .filter(|entry| now - entry.value().last_updated <= self.stale_after)
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        facts.sort_by(|a, b| a.0.cmp(&b.0));
        facts
    }
}

impl std::fmt::Debug for CapacityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityRegistry")
            .field("facts", &self.facts.len())
            .field("stale_after", &self.stale_after)
            .finish()
    }
}
