//! 降级链解析器
//!
//! 按负载类型的降级链顺序逐个检查候选端点：
//!
//! 1. 凭证不可用 -> 跳过
//! 2. 冷却中 -> 跳过
//! 3. Provider 预算耗尽且没有可接受的短等待 -> 跳过，
//!    同一解析轮次内该 Provider 的其余端点直接跳过，不再逐个探测
//! 4. 剩余容量低于主动切换阈值，且链中后面还有同等级的可用端点 -> 跳过
//! 5. 第一个通过的候选胜出
//!
//! 全部不可用时返回耗尽，并附带已知的最短等待时间。

use super::budget::{BudgetLedger, BudgetLimit};
use super::capacity::CapacityRegistry;
use super::cooldown::CooldownTracker;
use crate::catalog::ModelCatalog;
use crate::credential::CredentialGate;
use crate::errors::RoutingError;
use crate::models::{Endpoint, WorkloadClass};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// 候选被拒绝的原因
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    /// 调用方排除
    Excluded,
    /// 凭证未配置
    NoCredential,
    /// 请求超出上下文长度
    ContextExceeded { context_limit: u32 },
    /// 冷却中
    Cooldown { remaining: Duration },
    /// Provider 预算耗尽
    BudgetExhausted { wait: Duration, limit: BudgetLimit },
    /// 同轮次内该 Provider 已被判定耗尽
    ProviderExhausted { provider: String },
    /// 剩余容量低于阈值，让位给后面的同等级端点
    LowCapacity {
        remaining: f64,
        threshold: f64,
        alternative: String,
    },
}

impl Rejection {
    /// 等待多久后该候选可能恢复
    fn recover_after(&self) -> Option<Duration> {
        match self {
            Rejection::Cooldown { remaining } => Some(*remaining),
            Rejection::BudgetExhausted { wait, .. } => Some(*wait),
            _ => None,
        }
    }
}

/// 单个候选的判定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateVerdict {
    pub endpoint_id: String,
    pub provider: String,
    pub tier: u8,
    /// 被拒绝的原因；None 表示可用
    pub rejection: Option<Rejection>,
    /// 可用但需短暂等待预算
    pub budget_wait: Option<Duration>,
    /// 观测到的剩余容量
    pub remaining_fraction: Option<f64>,
}

impl CandidateVerdict {
    pub fn is_eligible(&self) -> bool {
        self.rejection.is_none()
    }
}

/// 解析结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    /// 选中端点；`wait` 为需要先等待的预算时间
    Selected {
        endpoint_id: String,
        wait: Option<Duration>,
    },
    /// 整条链不可用
    Exhausted { best_wait: Option<Duration> },
}

impl Resolution {
    pub fn endpoint_id(&self) -> Option<&str> {
        match self {
            Resolution::Selected { endpoint_id, .. } => Some(endpoint_id),
            Resolution::Exhausted { .. } => None,
        }
    }
}

/// 带明细的解析报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionReport {
    pub workload: WorkloadClass,
    pub verdicts: Vec<CandidateVerdict>,
    pub resolution: Resolution,
}

/// 解析器策略
#[derive(Debug, Clone)]
pub struct ResolverPolicy {
    /// 全局主动切换阈值
    pub proactive_threshold: f64,
    /// Provider 级阈值覆盖
    pub provider_thresholds: HashMap<String, f64>,
}

impl Default for ResolverPolicy {
    fn default() -> Self {
        Self {
            proactive_threshold: crate::config::DEFAULT_PROACTIVE_THRESHOLD,
            provider_thresholds: HashMap::new(),
        }
    }
}

impl ResolverPolicy {
    fn threshold_for(&self, provider: &str) -> f64 {
        self.provider_thresholds
            .get(provider)
            .copied()
            .unwrap_or(self.proactive_threshold)
    }
}

/// 解析请求
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest<'a> {
    /// 排除的端点
    pub exclude: Option<&'a HashSet<String>>,
    /// 预估 tokens（用于预算与上下文检查）
    pub estimated_tokens: u64,
}

/// 降级链解析器
pub struct ChainResolver {
    catalog: Arc<ModelCatalog>,
    gate: CredentialGate,
    capacity: Arc<CapacityRegistry>,
    budget: Arc<BudgetLedger>,
    cooldown: Arc<CooldownTracker>,
    policy: ResolverPolicy,
}

/// 第 1-3 步的判定结果
enum BaseVerdict {
    Eligible { budget_wait: Option<Duration> },
    Rejected(Rejection),
}

impl ChainResolver {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        gate: CredentialGate,
        capacity: Arc<CapacityRegistry>,
        budget: Arc<BudgetLedger>,
        cooldown: Arc<CooldownTracker>,
        policy: ResolverPolicy,
    ) -> Self {
        Self {
            catalog,
            gate,
            capacity,
            budget,
            cooldown,
            policy,
        }
    }

    /// 解析下一个可用端点
    pub fn resolve(
        &self,
        workload: WorkloadClass,
        exclude: &HashSet<String>,
    ) -> Result<Resolution, RoutingError> {
        self.resolve_with(
            workload,
            &ResolveRequest {
                exclude: Some(exclude),
                estimated_tokens: 0,
            },
        )
    }

    /// 带预估用量的解析
    pub fn resolve_with(
        &self,
        workload: WorkloadClass,
        request: &ResolveRequest<'_>,
    ) -> Result<Resolution, RoutingError> {
        Ok(self.report(workload, request)?.resolution)
    }

    /// 解析并返回每个候选的判定明细
    pub fn report(
        &self,
        workload: WorkloadClass,
        request: &ResolveRequest<'_>,
    ) -> Result<ResolutionReport, RoutingError> {
        let chain = self
            .catalog
            .chain(workload)
            .ok_or(RoutingError::UnknownWorkload(workload))?;

        let candidates: Vec<&Endpoint> = chain
            .iter()
            .map(|id| {
                self.catalog
                    .get(id)
                    .ok_or_else(|| RoutingError::UnknownEndpoint(id.clone()))
            })
            .collect::<Result<_, _>>()?;

        let mut exhausted_providers: HashMap<String, (Duration, BudgetLimit)> = HashMap::new();
        let base: Vec<BaseVerdict> = candidates
            .iter()
            .map(|endpoint| self.base_verdict(endpoint, request, &mut exhausted_providers))
            .collect();

        let mut verdicts = Vec::with_capacity(candidates.len());
        let mut selected: Option<(String, Option<Duration>)> = None;

        for (index, endpoint) in candidates.iter().enumerate() {
            let remaining_fraction = self.capacity.remaining(&endpoint.id);
            let (rejection, budget_wait) = match &base[index] {
                BaseVerdict::Rejected(rejection) => (Some(rejection.clone()), None),
                BaseVerdict::Eligible { budget_wait } => {
                    let threshold = self.policy.threshold_for(&endpoint.provider);
                    let low = remaining_fraction.filter(|remaining| *remaining < threshold);
                    match low.and_then(|remaining| {
                        self.same_tier_alternative(&candidates, &base, index)
                            .map(|alt| (remaining, alt))
                    }) {
                        Some((remaining, alternative)) => (
                            Some(Rejection::LowCapacity {
                                remaining,
                                threshold,
                                alternative,
                            }),
                            None,
                        ),
                        None => (None, *budget_wait),
                    }
                }
            };

            if let Some(rejection) = &rejection {
                tracing::debug!(
                    "[ChainResolver] {} 跳过 {}: {:?}",
                    workload,
                    endpoint.id,
                    rejection
                );
                if let Rejection::LowCapacity {
                    remaining,
                    alternative,
                    ..
                } = rejection
                {
                    if selected.is_none() {
                        tracing::info!(
                            "[ChainResolver] {} 剩余容量 {:.0}%，主动切换到 {}",
                            endpoint.id,
                            remaining * 100.0,
                            alternative
                        );
                    }
                }
            } else if selected.is_none() {
                selected = Some((endpoint.id.clone(), budget_wait));
            }

            verdicts.push(CandidateVerdict {
                endpoint_id: endpoint.id.clone(),
                provider: endpoint.provider.clone(),
                tier: endpoint.tier,
                rejection,
                budget_wait,
                remaining_fraction,
            });
        }

        let resolution = match selected {
            Some((endpoint_id, wait)) => {
                tracing::debug!("[ChainResolver] {} 选中 {}", workload, endpoint_id);
                Resolution::Selected { endpoint_id, wait }
            }
            None => {
                let best_wait = verdicts
                    .iter()
                    .filter_map(|v| v.rejection.as_ref().and_then(Rejection::recover_after))
                    .chain(verdicts.iter().filter_map(|v| match &v.rejection {
                        Some(Rejection::ProviderExhausted { provider }) => {
                            exhausted_providers.get(provider).map(|(wait, _)| *wait)
                        }
                        _ => None,
                    }))
                    .min();
                tracing::warn!(
                    "[ChainResolver] 负载类型 {} 的降级链已耗尽, 最短等待 {:?}",
                    workload,
                    best_wait
                );
                Resolution::Exhausted { best_wait }
            }
        };

        Ok(ResolutionReport {
            workload,
            verdicts,
            resolution,
        })
    }

    /// 第 1-3 步：排除、凭证、上下文、冷却、预算
    fn base_verdict(
        &self,
        endpoint: &Endpoint,
        request: &ResolveRequest<'_>,
        exhausted_providers: &mut HashMap<String, (Duration, BudgetLimit)>,
    ) -> BaseVerdict {
        if request
            .exclude
            .is_some_and(|exclude| exclude.contains(&endpoint.id))
        {
            return BaseVerdict::Rejected(Rejection::Excluded);
        }
        if !self.gate.is_usable(&endpoint.id) {
            return BaseVerdict::Rejected(Rejection::NoCredential);
        }
        if request.estimated_tokens > endpoint.context_limit as u64 {
            return BaseVerdict::Rejected(Rejection::ContextExceeded {
                context_limit: endpoint.context_limit,
            });
        }
        if let Some(remaining) = self.cooldown.remaining(&endpoint.id) {
            return BaseVerdict::Rejected(Rejection::Cooldown { remaining });
        }
        if exhausted_providers.contains_key(&endpoint.provider) {
            return BaseVerdict::Rejected(Rejection::ProviderExhausted {
                provider: endpoint.provider.clone(),
            });
        }

        let decision = self
            .budget
            .check(&endpoint.provider, request.estimated_tokens);
        if decision.allowed {
            return BaseVerdict::Eligible { budget_wait: None };
        }
        if decision.should_failover {
            let limit = decision.limited_by.unwrap_or(BudgetLimit::Minute);
            exhausted_providers.insert(endpoint.provider.clone(), (decision.wait, limit));
            return BaseVerdict::Rejected(Rejection::BudgetExhausted {
                wait: decision.wait,
                limit,
            });
        }
        BaseVerdict::Eligible {
            budget_wait: Some(decision.wait),
        }
    }

    /// 链中 `index` 之后第一个同等级、通过 1-3 步的端点
    fn same_tier_alternative(
        &self,
        candidates: &[&Endpoint],
        base: &[BaseVerdict],
        index: usize,
    ) -> Option<String> {
        let tier = candidates[index].tier;
        candidates
            .iter()
            .zip(base.iter())
            .skip(index + 1)
            .find(|(endpoint, verdict)| {
                endpoint.tier == tier && matches!(verdict, BaseVerdict::Eligible { .. })
            })
            .map(|(endpoint, _)| endpoint.id.clone())
    }
}

impl std::fmt::Debug for ChainResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainResolver")
            .field("policy", &self.policy)
            .finish()
    }
}
