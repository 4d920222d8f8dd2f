//! 并发准入控制（Governor）
//!
//! 按角色限制同时执行的工作单元数量：
//!
//! - 每个角色一个 FIFO 信号量，角色之间互不阻塞
//! - 获取槽位可超时、可取消；超时以错误形式返回，不会静默丢弃
//! - `Slot` 在 Drop 时释放，且只释放一次，覆盖错误、取消与 panic 路径

use crate::types::{AdmissionError, RoleLimit, RoleStats};
use dashmap::DashMap;
use routecast_core::config::{RoutecastConfig, DEFAULT_ACQUIRE_TIMEOUT_SECS, DEFAULT_MAX_CONCURRENT};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct RoleGate {
    role: String,
    limit: RoleLimit,
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    waiting: AtomicUsize,
    peak: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
}

impl RoleGate {
    fn new(role: &str, limit: RoleLimit) -> Self {
        Self {
            role: role.to_string(),
            limit,
            semaphore: Arc::new(Semaphore::new(limit.max_concurrent)),
            active: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    fn on_acquired(&self) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn on_released(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn stats(&self) -> RoleStats {
        RoleStats {
            role: self.role.clone(),
            max_concurrent: self.limit.max_concurrent,
            active: self.active.load(Ordering::SeqCst),
            waiting: self.waiting.load(Ordering::SeqCst),
            peak: self.peak.load(Ordering::SeqCst),
            total_acquired: self.acquired.load(Ordering::SeqCst),
            total_released: self.released.load(Ordering::SeqCst),
            timeouts: self.timeouts.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
        }
    }
}

/// 排队计数，离开等待（获取、超时、取消或 future 被丢弃）时自动减一
struct WaitingGuard<'a>(&'a RoleGate);

impl<'a> WaitingGuard<'a> {
    fn enter(gate: &'a RoleGate) -> Self {
        gate.waiting.fetch_add(1, Ordering::SeqCst);
        Self(gate)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 并发槽位
///
/// 持有期间占用角色的一个并发名额；Drop 时归还。
pub struct Slot {
    id: Uuid,
    gate: Arc<RoleGate>,
    permit: Option<OwnedSemaphorePermit>,
    acquired_at: Instant,
}

impl Slot {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> &str {
        &self.gate.role
    }

    /// 已持有时长
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// 显式释放（等价于 drop）
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            // 先减计数再归还名额，保证 active 不会超过上限
            self.gate.on_released();
            drop(permit);
            tracing::debug!(
                "[Governor] 释放槽位: role={}, slot={}, held={:?}",
                self.gate.role,
                self.id,
                self.acquired_at.elapsed()
            );
        }
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("role", &self.gate.role)
            .finish()
    }
}

/// 并发准入控制器
pub struct Governor {
    roles: DashMap<String, Arc<RoleGate>>,
    configured: HashMap<String, RoleLimit>,
    default_limit: RoleLimit,
    closed: AtomicBool,
}

impl Default for Governor {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_CONCURRENT,
            Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        )
    }
}

impl Governor {
    /// 创建 Governor；未配置的角色使用默认上限
    pub fn new(default_max: usize, default_timeout: Duration) -> Self {
        Self {
            roles: DashMap::new(),
            configured: HashMap::new(),
            default_limit: RoleLimit {
                max_concurrent: default_max.max(1),
                acquire_timeout: default_timeout,
            },
            closed: AtomicBool::new(false),
        }
    }

    /// 配置角色上限
    pub fn with_role(mut self, role: &str, max_concurrent: usize, timeout: Option<Duration>) -> Self {
        self.configured.insert(
            role.to_string(),
            RoleLimit {
                max_concurrent: max_concurrent.max(1),
                acquire_timeout: timeout.unwrap_or(self.default_limit.acquire_timeout),
            },
        );
        self
    }

    /// 从配置构建
    pub fn from_config(config: &RoutecastConfig) -> Self {
        let governor = Self::new(
            config.policy.default_max_concurrent,
            config.policy.acquire_timeout(),
        );
        let governor = config.roles.iter().fold(governor, |governor, (role, role_config)| {
            governor.with_role(
                role,
                role_config.max_concurrent,
                Some(config.role_acquire_timeout(role)),
            )
        });
        tracing::info!(
            "[Governor] 初始化完成: {} 个角色, 默认上限 {}",
            governor.configured.len(),
            governor.default_limit.max_concurrent
        );
        governor
    }

    /// 角色限额
    pub fn limit(&self, role: &str) -> RoleLimit {
        self.configured
            .get(role)
            .copied()
            .unwrap_or(self.default_limit)
    }

    fn gate(&self, role: &str) -> Arc<RoleGate> {
        if let Some(gate) = self.roles.get(role) {
            return gate.clone();
        }
        let limit = self.limit(role);
        self.roles
            .entry(role.to_string())
            .or_insert_with(|| Arc::new(RoleGate::new(role, limit)))
            .clone()
    }

    /// 获取槽位，使用角色配置的超时
    pub async fn acquire(
        &self,
        role: &str,
        cancel: &CancellationToken,
    ) -> Result<Slot, AdmissionError> {
        let timeout = self.limit(role).acquire_timeout;
        self.acquire_with_timeout(role, timeout, cancel).await
    }

    /// 获取槽位
    ///
    /// 角色已满时按 FIFO 排队，直到有槽位释放、超时或被取消。
    pub async fn acquire_with_timeout(
        &self,
        role: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Slot, AdmissionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdmissionError::Closed {
                role: role.to_string(),
            });
        }

        let gate = self.gate(role);
        let started = Instant::now();
        let acquired = {
            let _waiting = WaitingGuard::enter(&gate);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AdmissionError::Cancelled {
                    role: role.to_string(),
                }),
                result = tokio::time::timeout(timeout, gate.semaphore.clone().acquire_owned()) => {
                    match result {
                        Ok(Ok(permit)) => Ok(permit),
                        Ok(Err(_)) => Err(AdmissionError::Closed {
                            role: role.to_string(),
                        }),
                        Err(_) => Err(AdmissionError::Timeout {
                            role: role.to_string(),
                            waited: started.elapsed(),
                        }),
                    }
                }
            }
        };

        match acquired {
            Ok(permit) => {
                gate.on_acquired();
                let slot = Slot {
                    id: Uuid::new_v4(),
                    gate: gate.clone(),
                    permit: Some(permit),
                    acquired_at: Instant::now(),
                };
                tracing::debug!(
                    "[Governor] 获取槽位: role={}, slot={}, active={}/{}, waited={:?}",
                    role,
                    slot.id,
                    gate.active.load(Ordering::SeqCst),
                    gate.limit.max_concurrent,
                    started.elapsed()
                );
                Ok(slot)
            }
            Err(err) => {
                match &err {
                    AdmissionError::Timeout { .. } => {
                        gate.timeouts.fetch_add(1, Ordering::SeqCst);
                        tracing::warn!("[Governor] {}", err);
                    }
                    AdmissionError::Cancelled { .. } => {
                        gate.cancelled.fetch_add(1, Ordering::SeqCst);
                        tracing::info!("[Governor] {}", err);
                    }
                    AdmissionError::Closed { .. } => {
                        tracing::warn!("[Governor] {}", err);
                    }
                }
                Err(err)
            }
        }
    }

    /// 不等待地尝试获取槽位
    pub fn try_acquire(&self, role: &str) -> Option<Slot> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let gate = self.gate(role);
        let permit = gate.semaphore.clone().try_acquire_owned().ok()?;
        gate.on_acquired();
        Some(Slot {
            id: Uuid::new_v4(),
            gate,
            permit: Some(permit),
            acquired_at: Instant::now(),
        })
    }

    /// 释放槽位（等价于 drop）
    pub fn release(&self, slot: Slot) {
        slot.release();
    }

    /// 在槽位保护下执行 future，无论结果如何都会释放
    pub async fn run<F, T>(
        &self,
        role: &str,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T, AdmissionError>
    where
        F: Future<Output = T>,
    {
        let slot = self.acquire(role, cancel).await?;
        let output = work.await;
        drop(slot);
        Ok(output)
    }

    /// 角色统计；未使用过的角色返回零值快照
    pub fn stats(&self, role: &str) -> RoleStats {
        match self.roles.get(role) {
            Some(gate) => gate.stats(),
            None => RoleStats {
                role: role.to_string(),
                max_concurrent: self.limit(role).max_concurrent,
                active: 0,
                waiting: 0,
                peak: 0,
                total_acquired: 0,
                total_released: 0,
                timeouts: 0,
                cancelled: 0,
            },
        }
    }

    /// 所有已配置或已使用角色的统计
    pub fn all_stats(&self) -> Vec<RoleStats> {
        let mut names: Vec<String> = self.configured.keys().cloned().collect();
        for entry in self.roles.iter() {
            if !names.contains(entry.key()) {
                names.push(entry.key().clone());
            }
        }
        names.sort();
        names.iter().map(|role| self.stats(role)).collect()
    }

    /// 关闭 Governor：正在等待的请求立即返回 `Closed`，已持有的槽位不受影响
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for entry in self.roles.iter() {
            entry.value().semaphore.close();
        }
        tracing::info!("[Governor] 已关闭");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("roles", &self.roles.len())
            .field("default_limit", &self.default_limit)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use routecast_core::config::RoleConfig;
    use std::sync::Mutex;

    fn governor(max: usize) -> Arc<Governor> {
        Arc::new(Governor::new(4, Duration::from_secs(5)).with_role("worker", max, None))
    }

    #[test]
    fn test_try_acquire_respects_limit() {
        let governor = governor(2);
        let a = governor.try_acquire("worker").unwrap();
        let _b = governor.try_acquire("worker").unwrap();
        assert!(governor.try_acquire("worker").is_none());

        governor.release(a);
        assert!(governor.try_acquire("worker").is_some());
        let stats = governor.stats("worker");
        assert_eq!(stats.total_acquired, 3);
        assert_eq!(stats.total_released, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.peak, 2);
    }

    #[test]
    fn test_unknown_role_uses_default_limit() {
        let governor = governor(1);
        assert_eq!(governor.limit("other").max_concurrent, 4);
        assert_eq!(governor.stats("other").max_concurrent, 4);
        let slots: Vec<_> = (0..4).filter_map(|_| governor.try_acquire("other")).collect();
        assert_eq!(slots.len(), 4);
        assert!(governor.try_acquire("other").is_none());
        // 角色之间互不影响
        assert!(governor.try_acquire("worker").is_some());
    }

    #[test]
    fn test_from_config() {
        let mut config = RoutecastConfig::default();
        config.policy.default_max_concurrent = 3;
        config.roles.insert(
            "orchestrator".to_string(),
            RoleConfig {
                max_concurrent: 1,
                acquire_timeout_secs: Some(2),
            },
        );
        let governor = Governor::from_config(&config);
        assert_eq!(
            governor.limit("orchestrator"),
            RoleLimit {
                max_concurrent: 1,
                acquire_timeout: Duration::from_secs(2),
            }
        );
        assert_eq!(governor.limit("coder").max_concurrent, 3);
        assert_eq!(governor.all_stats().len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_timeout_is_surfaced() {
        let governor = governor(1);
        let cancel = CancellationToken::new();
        let _held = governor.acquire("worker", &cancel).await.unwrap();

        let err = governor
            .acquire_with_timeout("worker", Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Timeout { ref role, .. } if role == "worker"));

        let stats = governor.stats("worker");
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.active, 1);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let governor = governor(1);
        let cancel = CancellationToken::new();
        let held = governor.acquire("worker", &cancel).await.unwrap();

        let waiter = {
            let governor = governor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { governor.acquire("worker", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(governor.stats("worker").waiting, 1);

        cancel.cancel();
        let result = waiter.await.unwrap();
        assert_eq!(
            result.unwrap_err(),
            AdmissionError::Cancelled {
                role: "worker".to_string()
            }
        );

        drop(held);
        let stats = governor.stats("worker");
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total_acquired, stats.total_released);
    }

    #[tokio::test]
    async fn test_waiters_are_served_fifo() {
        let governor = governor(1);
        let cancel = CancellationToken::new();
        let held = governor.acquire("worker", &cancel).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..3 {
            let governor = governor.clone();
            let cancel = cancel.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let slot = governor.acquire("worker", &cancel).await.unwrap();
                order.lock().unwrap().push(id);
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(slot);
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_active_never_exceeds_max_under_load() {
        let governor = governor(3);
        let cancel = CancellationToken::new();
        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let governor = governor.clone();
                let cancel = cancel.clone();
                let current = current.clone();
                let max_seen = max_seen.clone();
                tokio::spawn(async move {
                    let slot = governor.acquire("worker", &cancel).await.unwrap();
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    drop(slot);
                })
            })
            .collect();
        futures::future::join_all(handles).await;

        let stats = governor.stats("worker");
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert!(stats.peak <= 3);
        assert_eq!(stats.total_acquired, 32);
        assert_eq!(stats.total_released, 32);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_slot_released_when_work_panics() {
        let governor = governor(1);
        let handle = {
            let governor = governor.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                governor
                    .run("worker", &cancel, async {
                        panic!("injected failure");
                    })
                    .await
            })
        };
        assert!(handle.await.unwrap_err().is_panic());

        let stats = governor.stats("worker");
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total_acquired, 1);
        assert_eq!(stats.total_released, 1);
        assert!(governor.try_acquire("worker").is_some());
    }

    #[tokio::test]
    async fn test_slot_released_when_work_fails() {
        let governor = governor(1);
        let cancel = CancellationToken::new();
        let result: Result<Result<(), String>, _> = governor
            .run("worker", &cancel, async { Err("boom".to_string()) })
            .await;
        assert!(result.unwrap().is_err());
        assert_eq!(governor.stats("worker").active, 0);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let governor = governor(1);
        let cancel = CancellationToken::new();
        let _held = governor.acquire("worker", &cancel).await.unwrap();

        let waiter = {
            let governor = governor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { governor.acquire("worker", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        governor.close();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(AdmissionError::Closed { .. })
        ));
        assert!(governor.try_acquire("worker").is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_active_bounded(max in 1usize..5, tasks in 1usize..24) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();
            let stats = runtime.block_on(async {
                let governor = governor(max);
                let handles: Vec<_> = (0..tasks)
                    .map(|i| {
                        let governor = governor.clone();
                        tokio::spawn(async move {
                            let cancel = CancellationToken::new();
                            governor
                                .run("worker", &cancel, async move {
                                    tokio::time::sleep(Duration::from_micros((i % 3) as u64 * 200)).await;
                                })
                                .await
                        })
                    })
                    .collect();
                for handle in futures::future::join_all(handles).await {
                    handle.unwrap().unwrap();
                }
                governor.stats("worker")
            });

            prop_assert!(stats.peak <= max);
            prop_assert_eq!(stats.active, 0);
            prop_assert_eq!(stats.total_acquired, tasks as u64);
            prop_assert_eq!(stats.total_released, tasks as u64);
        }
    }
}
