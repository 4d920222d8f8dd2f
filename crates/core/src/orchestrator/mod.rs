//! 路由编排模块
//!
//! 执行遥测 -> 共享状态 -> 重新决策 的反馈回路。
//!
//! ## 模块结构
//!
//! - `capacity` - 端点剩余容量登记表
//! - `budget` - Provider 预算账本（分钟/自然日窗口）
//! - `cooldown` - 硬失败冷却追踪（熔断）
//! - `resolver` - 按负载类型的降级链解析
//!
//! `RoutingCore` 把以上组件与模型目录、凭证闸门组装在一起，
//! 并负责把每条 `AttemptRecord` 分发给对应的组件。

mod budget;
mod capacity;
mod cooldown;
mod resolver;

pub use budget::{BudgetDecision, BudgetLedger, BudgetLimit, BudgetWindow, Reservation};
pub use capacity::{CapacityFact, CapacityRegistry};
pub use cooldown::{CooldownEntry, CooldownTracker};
pub use resolver::{
    CandidateVerdict, ChainResolver, Rejection, Resolution, ResolutionReport, ResolveRequest,
    ResolverPolicy,
};

use crate::catalog::ModelCatalog;
use crate::clock::SharedClock;
use crate::config::RoutecastConfig;
use crate::credential::{CredentialGate, CredentialSource};
use crate::errors::{ConfigError, RoutingError};
use crate::models::{AttemptRecord, CapacitySource, OutcomeKind};
use std::sync::Arc;

/// 路由核心
///
/// 各组件内部按实体加锁，`RoutingCore` 本身无锁，可在任务间共享。
pub struct RoutingCore {
    catalog: Arc<ModelCatalog>,
    gate: CredentialGate,
    capacity: Arc<CapacityRegistry>,
    budget: Arc<BudgetLedger>,
    cooldown: Arc<CooldownTracker>,
    resolver: ChainResolver,
    clock: SharedClock,
}

impl RoutingCore {
    /// 从配置组装
    ///
    /// 按 Provider 注册预算限额，并为其成员端点设置冷却时长。
    pub fn from_config(
        config: &RoutecastConfig,
        credentials: Arc<dyn CredentialSource>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        let catalog = Arc::new(ModelCatalog::from_config(config)?);
        let gate = CredentialGate::new(catalog.clone(), credentials);
        let capacity = Arc::new(CapacityRegistry::new(
            clock.clone(),
            config.policy.capacity_stale_after(),
        ));
        let budget = Arc::new(BudgetLedger::new(
            clock.clone(),
            config.policy.short_wait_threshold(),
        ));
        let cooldown = Arc::new(CooldownTracker::new(clock.clone(), config.policy.cooldown()));

        let mut policy = ResolverPolicy {
            proactive_threshold: config.policy.proactive_threshold,
            ..Default::default()
        };
        for provider in config.provider_names() {
            let (minute, day) = config.provider_limits(&provider);
            budget.register(&provider, minute, day);

            let provider_cooldown = config.provider_cooldown(&provider);
            if provider_cooldown != config.policy.cooldown() {
                for endpoint in catalog.members_of(&provider) {
                    cooldown.set_duration(&endpoint.id, provider_cooldown);
                }
            }

            let threshold = config.provider_threshold(&provider);
            if threshold != config.policy.proactive_threshold {
                policy.provider_thresholds.insert(provider.clone(), threshold);
            }
        }

        let resolver = ChainResolver::new(
            catalog.clone(),
            gate.clone(),
            capacity.clone(),
            budget.clone(),
            cooldown.clone(),
            policy,
        );

        tracing::info!(
            "[RoutingCore] 初始化完成: {} 个端点, {} 个 Provider",
            catalog.len(),
            budget.snapshots().len()
        );

        Ok(Self {
            catalog,
            gate,
            capacity,
            budget,
            cooldown,
            resolver,
            clock,
        })
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn gate(&self) -> &CredentialGate {
        &self.gate
    }

    pub fn capacity(&self) -> &Arc<CapacityRegistry> {
        &self.capacity
    }

    pub fn budget(&self) -> &Arc<BudgetLedger> {
        &self.budget
    }

    pub fn cooldown(&self) -> &Arc<CooldownTracker> {
        &self.cooldown
    }

    pub fn resolver(&self) -> &ChainResolver {
        &self.resolver
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// 消费一条执行记录
    ///
    /// - 成功：结算用量；有响应头时记录观测容量，否则按预算余量估算
    /// - 限流：计入用量并按 retry-after 封禁 Provider，不触发冷却
    /// - 硬失败：计入用量并进入冷却
    /// - 取消：不修改任何状态
    ///
    /// 返回填充了成本的记录。
    pub fn record_attempt(
        &self,
        record: &AttemptRecord,
        reservation: Option<&Reservation>,
    ) -> Result<AttemptRecord, RoutingError> {
        let endpoint = self
            .catalog
            .get(&record.endpoint_id)
            .ok_or_else(|| RoutingError::UnknownEndpoint(record.endpoint_id.clone()))?;

        let mut record = record.clone();
        if record.outcome == OutcomeKind::Cancelled {
            tracing::debug!("[RoutingCore] {} 已取消, 不记录遥测", endpoint.id);
            return Ok(record);
        }

        record.cost = endpoint.cost(record.input_tokens, record.output_tokens);
        let provider = endpoint.provider.as_str();
        match reservation {
            Some(reservation) => {
                self.budget
                    .settle(reservation, record.total_tokens(), record.cost)
            }
            None => self
                .budget
                .record_usage(provider, record.total_tokens(), record.cost),
        }

        match record.outcome {
            OutcomeKind::Success => match record.remaining_fraction {
                Some(fraction) => {
                    self.capacity
                        .observe(&endpoint.id, fraction, CapacitySource::Observed)
                }
                None => {
                    if let Some(headroom) = self.budget.minute_headroom(provider) {
                        self.capacity
                            .observe(&endpoint.id, headroom, CapacitySource::Estimated);
                    }
                }
            },
            OutcomeKind::RateLimited => {
                self.budget.penalize(provider, record.retry_after());
                // 没有响应头时不写入容量，封禁由预算账本负责
                if let Some(fraction) = record.remaining_fraction {
                    self.capacity
                        .observe(&endpoint.id, fraction, CapacitySource::Observed);
                }
                tracing::warn!(
                    "[RoutingCore] {} 被限流 (retry-after: {:?})",
                    endpoint.id,
                    record.retry_after()
                );
            }
            outcome => {
                self.cooldown.record_outcome(&endpoint.id, outcome);
                tracing::warn!("[RoutingCore] {} 执行失败: {}", endpoint.id, outcome);
            }
        }

        Ok(record)
    }
}

impl std::fmt::Debug for RoutingCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingCore")
            .field("catalog", &self.catalog.len())
            .field("budget", &self.budget)
            .field("cooldown", &self.cooldown)
            .field("resolver", &self.resolver)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ProviderConfig;
    use crate::credential::StaticCredentialSource;
    use crate::models::{Endpoint, WorkloadClass};
    use chrono::{Duration, TimeZone, Utc};
    use indexmap::IndexMap;
    use std::collections::HashSet;

    fn config() -> RoutecastConfig {
        let mut config = RoutecastConfig {
            endpoints: vec![
                Endpoint::new("a", "p1", 1)
                    .with_limits(10_000, 0)
                    .with_pricing(3.0, 15.0),
                Endpoint::new("b", "p2", 1).with_limits(10_000, 0),
            ],
            chains: IndexMap::from([(WorkloadClass::General, vec!["a".into(), "b".into()])]),
            ..Default::default()
        };
        config.providers.insert(
            "p2".to_string(),
            ProviderConfig {
                cooldown_secs: Some(30),
                proactive_threshold: Some(0.5),
                ..Default::default()
            },
        );
        config
    }

    fn core() -> (Arc<ManualClock>, RoutingCore) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 7, 1, 8, 0, 0).unwrap(),
        ));
        let credentials = Arc::new(StaticCredentialSource::new(["p1", "p2"]));
        let core = RoutingCore::from_config(&config(), credentials, clock.clone()).unwrap();
        (clock, core)
    }

    #[test]
    fn test_success_settles_and_estimates_capacity() {
        let (_, core) = core();
        let reservation = core
            .budget()
            .check_and_reserve("p1", 1_000)
            .reservation
            .unwrap();
        let record = AttemptRecord::new("a", OutcomeKind::Success).with_tokens(2_000, 500);
        let record = core.record_attempt(&record, Some(&reservation)).unwrap();

        assert!((record.cost - (2_000.0 * 3.0 + 500.0 * 15.0) / 1e6).abs() < 1e-12);
        let window = core.budget().snapshot("p1").unwrap();
        assert_eq!(window.minute_used, 2_500);
        let fact = core.capacity().fact("a").unwrap();
        assert_eq!(fact.source, CapacitySource::Estimated);
        assert!((fact.remaining_fraction - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_observed_header_wins() {
        let (_, core) = core();
        let record = AttemptRecord::new("a", OutcomeKind::Success)
            .with_tokens(10, 10)
            .with_remaining(Some(0.15));
        core.record_attempt(&record, None).unwrap();

        assert_eq!(core.capacity().remaining("a"), Some(0.15));
        let resolution = core
            .resolver()
            .resolve(WorkloadClass::General, &HashSet::new())
            .unwrap();
        assert_eq!(resolution.endpoint_id(), Some("b"));
    }

    #[test]
    fn test_rate_limited_never_cools_down() {
        let (_, core) = core();
        let record = AttemptRecord::new("a", OutcomeKind::RateLimited)
            .with_retry_after(Some(std::time::Duration::from_secs(45)));
        core.record_attempt(&record, None).unwrap();

        assert!(!core.cooldown().in_cooldown("a"));
        let decision = core.budget().check("p1", 1);
        assert_eq!(decision.limited_by, Some(BudgetLimit::Blocked));
        assert_eq!(decision.wait, std::time::Duration::from_secs(45));
        assert!(core.capacity().fact("a").is_none());
    }

    #[test]
    fn test_rate_limited_capacity_only_from_header() {
        let (_, core) = core();
        let record = AttemptRecord::new("a", OutcomeKind::RateLimited).with_remaining(Some(0.05));
        core.record_attempt(&record, None).unwrap();

        let fact = core.capacity().fact("a").unwrap();
        assert_eq!(fact.source, CapacitySource::Observed);
        assert!((fact.remaining_fraction - 0.05).abs() < 1e-9);

        // 无 retry-after 时封禁到下一个分钟边界 (08:00:00 -> 08:01:00)
        let decision = core.budget().check("p1", 1);
        assert_eq!(decision.limited_by, Some(BudgetLimit::Blocked));
        assert_eq!(decision.wait, std::time::Duration::from_secs(60));
    }

    #[test]
    fn test_hard_failure_uses_provider_cooldown() {
        let (clock, core) = core();
        for id in ["a", "b"] {
            core.record_attempt(&AttemptRecord::new(id, OutcomeKind::Upstream), None)
                .unwrap();
        }
        clock.advance(Duration::seconds(30));
        assert!(core.cooldown().in_cooldown("a"));
        assert!(!core.cooldown().in_cooldown("b"));
    }

    #[test]
    fn test_cancelled_mutates_nothing() {
        let (_, core) = core();
        let record = AttemptRecord::new("a", OutcomeKind::Cancelled).with_tokens(500, 500);
        core.record_attempt(&record, None).unwrap();

        assert!(core.cooldown().is_empty());
        assert_eq!(core.budget().snapshot("p1").unwrap().minute_used, 0);
        assert!(core.capacity().fact("a").is_none());
    }

    #[test]
    fn test_unknown_endpoint_is_error() {
        let (_, core) = core();
        let err = core
            .record_attempt(&AttemptRecord::new("zzz", OutcomeKind::Success), None)
            .unwrap_err();
        assert_eq!(err, RoutingError::UnknownEndpoint("zzz".to_string()));
    }
}
