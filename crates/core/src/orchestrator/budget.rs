//! 预算账本
//!
//! 按 Provider 统计分钟窗口与自然日窗口内的 tokens 用量，并累计成本。
//!
//! - 每个 Provider 一把锁，检查与预留在同一临界区内完成
//! - 窗口边界到达后，由第一个进入临界区的调用者比较并推进 `*_reset_at`，
//!   用量清零恰好一次；后到者看到的已是新的重置时间
//! - 限额为 0 表示不限制
//! - 成本只做统计，不参与准入判断

use crate::clock::{from_std, to_std, SharedClock};
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 限制来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLimit {
    /// 分钟窗口
    Minute,
    /// 自然日窗口
    Day,
    /// Provider 返回限流后的封禁期
    Blocked,
}

/// Provider 预算窗口
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetWindow {
    pub minute_used: u64,
    pub minute_limit: u64,
    pub minute_reset_at: DateTime<Utc>,
    pub day_used: u64,
    pub day_limit: u64,
    pub day_reset_at: DateTime<Utc>,
    pub accumulated_cost: f64,
    /// 限流封禁截止时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<DateTime<Utc>>,
    /// 分钟窗口重置次数
    pub minute_resets: u64,
    /// 日窗口重置次数
    pub day_resets: u64,
}

impl BudgetWindow {
    fn new(minute_limit: u64, day_limit: u64, now: DateTime<Utc>) -> Self {
        Self {
            minute_used: 0,
            minute_limit,
            minute_reset_at: next_minute_boundary(now),
            day_used: 0,
            day_limit,
            day_reset_at: next_day_boundary(now),
            accumulated_cost: 0.0,
            blocked_until: None,
            minute_resets: 0,
            day_resets: 0,
        }
    }

    /// 到达边界时重置窗口
    ///
    /// 调用方必须持有 Provider 锁；重置后 `*_reset_at` 前移，
    /// 同一边界上的后续调用者不会再次清零。
    fn roll(&mut self, now: DateTime<Utc>) {
        if now >= self.minute_reset_at {
            self.minute_reset_at = next_minute_boundary(now);
            self.minute_used = 0;
            self.minute_resets += 1;
        }
        if now >= self.day_reset_at {
            self.day_reset_at = next_day_boundary(now);
            self.day_used = 0;
            self.day_resets += 1;
        }
        if matches!(self.blocked_until, Some(until) if now >= until) {
            self.blocked_until = None;
        }
    }

    /// 计算需要等待的时间及原因；None 表示可以立即放行
    fn pending_wait(&self, tokens: u64, now: DateTime<Utc>) -> Option<(Duration, BudgetLimit)> {
        let mut waits: Vec<(Duration, BudgetLimit)> = Vec::new();
        if let Some(until) = self.blocked_until {
            waits.push((until - now, BudgetLimit::Blocked));
        }
        if !fits(self.minute_used, self.minute_limit, tokens) {
            waits.push((self.minute_reset_at - now, BudgetLimit::Minute));
        }
        if !fits(self.day_used, self.day_limit, tokens) {
            waits.push((self.day_reset_at - now, BudgetLimit::Day));
        }
        waits.into_iter().max_by_key(|(wait, _)| *wait)
    }

    fn charge(&mut self, tokens: u64) {
        self.minute_used = self.minute_used.saturating_add(tokens);
        self.day_used = self.day_used.saturating_add(tokens);
    }

    /// 分钟窗口剩余比例；不限额时为 None
    pub fn minute_headroom(&self) -> Option<f64> {
        if self.minute_limit == 0 {
            return None;
        }
        let left = self.minute_limit.saturating_sub(self.minute_used);
        Some(left as f64 / self.minute_limit as f64)
    }
}

/// 用量能否放入窗口
///
/// 至少需要 1 个 token 的余量；超过整个窗口的请求只允许进入空窗口。
fn fits(used: u64, limit: u64, tokens: u64) -> bool {
    if limit == 0 {
        return true;
    }
    if tokens > limit {
        return used == 0;
    }
    used.saturating_add(tokens.max(1)) <= limit
}

fn next_minute_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = now.timestamp();
    let start = secs - secs.rem_euclid(60);
    Utc.timestamp_opt(start + 60, 0)
        .single()
        .unwrap_or(now + Duration::seconds(60))
}

fn next_day_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    match now.date_naive().succ_opt() {
        Some(tomorrow) => Utc.from_utc_datetime(&tomorrow.and_time(NaiveTime::MIN)),
        None => now + Duration::days(1),
    }
}

/// 预算检查结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetDecision {
    /// Provider
    pub provider: String,
    /// 是否放行
    pub allowed: bool,
    /// 需要等待的时间（放行时为 0）
    pub wait: std::time::Duration,
    /// 限制来源
    pub limited_by: Option<BudgetLimit>,
    /// 等待时间达到阈值，应直接降级
    pub should_failover: bool,
    /// 建议降级到的 Provider
    pub failover_suggestion: Option<String>,
    /// 成功预留时的凭据
    #[serde(skip)]
    pub reservation: Option<Reservation>,
}

impl BudgetDecision {
    /// 需要短暂等待（低于阈值）
    pub fn is_short_wait(&self) -> bool {
        !self.allowed && !self.should_failover
    }
}

/// 预留凭据，执行完成后用实际用量结算
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub provider: String,
    pub tokens: u64,
    pub reserved_at: DateTime<Utc>,
}

struct ProviderBudget {
    window: Mutex<BudgetWindow>,
    probes: AtomicU64,
}

/// 预算账本
pub struct BudgetLedger {
    providers: DashMap<String, Arc<ProviderBudget>>,
    short_wait_threshold: std::time::Duration,
    clock: SharedClock,
}

impl BudgetLedger {
    pub fn new(clock: SharedClock, short_wait_threshold: std::time::Duration) -> Self {
        Self {
            providers: DashMap::new(),
            short_wait_threshold,
            clock,
        }
    }

    /// 注册 Provider 限额（已存在时只更新限额）
    pub fn register(&self, provider: &str, minute_limit: u64, day_limit: u64) {
        let now = self.clock.now();
        let entry = self
            .providers
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(ProviderBudget {
                    window: Mutex::new(BudgetWindow::new(minute_limit, day_limit, now)),
                    probes: AtomicU64::new(0),
                })
            })
            .clone();
        let mut window = entry.window.lock();
        window.minute_limit = minute_limit;
        window.day_limit = day_limit;
        tracing::debug!(
            "[BudgetLedger] 注册 Provider {}: {}/min, {}/day",
            provider,
            minute_limit,
            day_limit
        );
    }

    fn budget(&self, provider: &str) -> Arc<ProviderBudget> {
        if let Some(entry) = self.providers.get(provider) {
            return entry.clone();
        }
        let now = self.clock.now();
        self.providers
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(ProviderBudget {
                    window: Mutex::new(BudgetWindow::new(0, 0, now)),
                    probes: AtomicU64::new(0),
                })
            })
            .clone()
    }

    /// 只检查不预留
    pub fn check(&self, provider: &str, estimated_tokens: u64) -> BudgetDecision {
        let budget = self.budget(provider);
        budget.probes.fetch_add(1, Ordering::Relaxed);
        let pending = {
            let now = self.clock.now();
            let mut window = budget.window.lock();
            window.roll(now);
            window.pending_wait(estimated_tokens, now)
        };
        self.decide(provider, estimated_tokens, pending, None)
    }

    /// 检查并预留
    ///
    /// 放行时立即计入用量并返回预留凭据；否则返回等待时间，
    /// 同时给出降级建议，由调用方选择等待还是切换。
    pub fn check_and_reserve(&self, provider: &str, estimated_tokens: u64) -> BudgetDecision {
        let budget = self.budget(provider);
        let (pending, reservation) = {
            let now = self.clock.now();
            let mut window = budget.window.lock();
            window.roll(now);
            match window.pending_wait(estimated_tokens, now) {
                Some(pending) => (Some(pending), None),
                None => {
                    window.charge(estimated_tokens);
                    let reservation = Reservation {
                        provider: provider.to_string(),
                        tokens: estimated_tokens,
                        reserved_at: now,
                    };
                    (None, Some(reservation))
                }
            }
        };
        self.decide(provider, estimated_tokens, pending, reservation)
    }

    fn decide(
        &self,
        provider: &str,
        estimated_tokens: u64,
        pending: Option<(Duration, BudgetLimit)>,
        reservation: Option<Reservation>,
    ) -> BudgetDecision {
        match pending {
            None => BudgetDecision {
                provider: provider.to_string(),
                allowed: true,
                wait: std::time::Duration::ZERO,
                limited_by: None,
                should_failover: false,
                failover_suggestion: None,
                reservation,
            },
            Some((wait, limit)) => {
                let wait = to_std(wait);
                let should_failover = wait >= self.short_wait_threshold;
                BudgetDecision {
                    provider: provider.to_string(),
                    allowed: false,
                    wait,
                    limited_by: Some(limit),
                    should_failover,
                    failover_suggestion: self.suggest_failover(provider, estimated_tokens),
                    reservation: None,
                }
            }
        }
    }

    /// 选出分钟余量最大且能容纳本次请求的其他 Provider
    fn suggest_failover(&self, exclude: &str, estimated_tokens: u64) -> Option<String> {
        let candidates: Vec<(String, Arc<ProviderBudget>)> = self
            .providers
            .iter()
            .filter(|entry| entry.key() != exclude)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let now = self.clock.now();
        candidates
            .into_iter()
            .filter_map(|(name, budget)| {
                let mut window = budget.window.lock();
                window.roll(now);
                if window.pending_wait(estimated_tokens, now).is_some() {
                    return None;
                }
                Some((name, window.minute_headroom().unwrap_or(1.0)))
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(name, _)| name)
    }

    /// 用实际用量结算预留
    ///
    /// 只补记超出预留的部分，已计入的用量不会回退。
    pub fn settle(&self, reservation: &Reservation, actual_tokens: u64, cost: f64) {
        let budget = self.budget(&reservation.provider);
        let now = self.clock.now();
        let mut window = budget.window.lock();
        window.roll(now);
        window.charge(actual_tokens.saturating_sub(reservation.tokens));
        window.accumulated_cost += cost;
    }

    /// 记录未经预留的用量（外部执行层上报）
    pub fn record_usage(&self, provider: &str, tokens: u64, cost: f64) {
        let budget = self.budget(provider);
        let now = self.clock.now();
        let mut window = budget.window.lock();
        window.roll(now);
        window.charge(tokens);
        window.accumulated_cost += cost;
    }

    /// Provider 返回限流：封禁 Provider
    ///
    /// 封禁到 retry-after 指定的时间；没有 retry-after 时封禁到下一个分钟边界，
    /// 不限额的 Provider 同样生效。
    pub fn penalize(&self, provider: &str, retry_after: Option<std::time::Duration>) {
        let budget = self.budget(provider);
        let now = self.clock.now();
        let mut window = budget.window.lock();
        window.roll(now);
        let until = match retry_after {
            Some(retry_after) => now + from_std(retry_after),
            None => window.minute_reset_at,
        };
        window.blocked_until = Some(window.blocked_until.map_or(until, |u| u.max(until)));
        tracing::info!(
            "[BudgetLedger] Provider {} 被限流, 封禁至 {:?}",
            provider,
            window.blocked_until
        );
    }

    /// 当前窗口快照
    pub fn snapshot(&self, provider: &str) -> Option<BudgetWindow> {
        let budget = self.providers.get(provider)?.clone();
        let now = self.clock.now();
        let mut window = budget.window.lock();
        window.roll(now);
        Some(window.clone())
    }

    /// 所有 Provider 的快照
    pub fn snapshots(&self) -> Vec<(String, BudgetWindow)> {
        let names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        let mut all: Vec<_> = names
            .into_iter()
            .filter_map(|name| self.snapshot(&name).map(|w| (name, w)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// 分钟窗口剩余比例，用于估算容量
    pub fn minute_headroom(&self, provider: &str) -> Option<f64> {
        self.snapshot(provider)?.minute_headroom()
    }

    /// `check` 被调用的次数
    pub fn probe_count(&self, provider: &str) -> u64 {
        self.providers
            .get(provider)
            .map(|b| b.probes.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn short_wait_threshold(&self) -> std::time::Duration {
        self.short_wait_threshold
    }
}

impl std::fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("providers", &self.providers.len())
            .field("short_wait_threshold", &self.short_wait_threshold)
            .finish()
    }
}
