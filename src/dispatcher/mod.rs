//! 派发器
//!
//! 每个工作单元独立执行：获取槽位 -> 解析端点 -> 执行 -> 记录遥测 -> 释放槽位。
//!
//! - 软失败（限流）与硬失败都把失败端点加入排除集后重新解析
//! - 预算短等待（低于阈值）原地等待，长等待直接降级
//! - 降级链耗尽时，最短等待在阈值内则等待一次，否则返回 `ChainExhausted`
//! - 已提交部分输出的尝试失败后直接返回 `Interrupted`，不再降级
//! - 取消不记录任何端点失败
//! - 槽位由 `Slot` 的 Drop 保证释放

mod error;
mod status;

pub use error::DispatchError;
pub use status::{EndpointStatus, ProviderStatus, StatusQuery, StatusSnapshot, WorkloadStatus};

use routecast_core::clock::SharedClock;
use routecast_core::config::RoutecastConfig;
use routecast_core::credential::CredentialSource;
use routecast_core::errors::ConfigError;
use routecast_core::models::{AttemptRecord, Endpoint, OutcomeKind, WorkloadClass};
use routecast_core::orchestrator::{Reservation, Resolution, ResolveRequest, RoutingCore};
use routecast_providers::{AttemptHandle, ExecutionFailure, Executor, WorkUnit};
use routecast_scheduler::Governor;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 派发策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPolicy {
    /// 短等待阈值，预算或降级链等待达到该值不再原地等待
    pub short_wait_threshold: Duration,
    /// 同一端点的最大预算等待次数
    pub max_budget_waits: u32,
    /// 降级链耗尽后的最大等待次数
    pub max_exhausted_waits: u32,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from_config(&RoutecastConfig::default())
    }
}

impl DispatchPolicy {
    pub fn from_config(config: &RoutecastConfig) -> Self {
        Self {
            short_wait_threshold: config.policy.short_wait_threshold(),
            max_budget_waits: config.policy.max_budget_waits,
            max_exhausted_waits: config.policy.max_exhausted_waits,
        }
    }
}

/// 单次尝试摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub endpoint_id: String,
    pub outcome: OutcomeKind,
    pub latency_ms: u64,
}

impl AttemptSummary {
    fn from_record(record: &AttemptRecord) -> Self {
        Self {
            endpoint_id: record.endpoint_id.clone(),
            outcome: record.outcome,
            latency_ms: record.latency_ms,
        }
    }
}

/// 派发成功的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub work_id: Uuid,
    /// 最终执行的端点
    pub endpoint_id: String,
    /// 执行输出
    pub output: serde_json::Value,
    /// 成功那次尝试的记录（含成本）
    pub record: AttemptRecord,
    /// 全部尝试，按时间顺序
    pub attempts: Vec<AttemptSummary>,
}

/// 单次尝试的结果
enum AttemptResult {
    Succeeded(DispatchOutcome),
    /// 预算需要长等待，直接降级
    BudgetDeferred,
    /// 执行失败，可降级
    Failed,
}

/// 派发器
pub struct Dispatcher {
    core: Arc<RoutingCore>,
    governor: Arc<Governor>,
    executor: Arc<dyn Executor>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(
        core: Arc<RoutingCore>,
        governor: Arc<Governor>,
        executor: Arc<dyn Executor>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            core,
            governor,
            executor,
            policy,
        }
    }

    /// 从配置组装路由核心、Governor 与派发器
    pub fn from_config(
        config: &RoutecastConfig,
        credentials: Arc<dyn CredentialSource>,
        executor: Arc<dyn Executor>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        let core = RoutingCore::from_config(config, credentials, clock)?;
        Ok(Self::new(
            Arc::new(core),
            Arc::new(Governor::from_config(config)),
            executor,
            DispatchPolicy::from_config(config),
        ))
    }

    pub fn core(&self) -> &Arc<RoutingCore> {
        &self.core
    }

    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// 派发一个工作单元
    pub async fn dispatch(
        &self,
        work: &WorkUnit,
        role: &str,
        workload: WorkloadClass,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        let slot = self.governor.acquire(role, cancel).await?;
        tracing::debug!(
            "[Dispatcher] 工作单元 {} 开始派发: role={}, workload={}",
            work.id,
            role,
            workload
        );

        let result = self.run_chain(work, workload, cancel).await;
        slot.release();

        match &result {
            Ok(outcome) => tracing::info!(
                "[Dispatcher] 工作单元 {} 完成: endpoint={}, attempts={}",
                work.id,
                outcome.endpoint_id,
                outcome.attempts.len()
            ),
            Err(err) => tracing::warn!("[Dispatcher] 工作单元 {} 失败: {}", work.id, err),
        }
        result
    }

    async fn run_chain(
        &self,
        work: &WorkUnit,
        workload: WorkloadClass,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        let estimated_tokens = work.estimated_tokens();
        let mut exclude: HashSet<String> = HashSet::new();
        let mut attempts: Vec<AttemptSummary> = Vec::new();
        let mut exhausted_waits = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            let resolution = self.core.resolver().resolve_with(
                workload,
                &ResolveRequest {
                    exclude: Some(&exclude),
                    estimated_tokens,
                },
            )?;

            let endpoint_id = match resolution {
                Resolution::Selected { endpoint_id, .. } => endpoint_id,
                Resolution::Exhausted { best_wait } => match self.actual_wait(
                    workload,
                    estimated_tokens,
                    &exclude,
                    best_wait,
                )? {
                    Some(wait)
                        if wait < self.policy.short_wait_threshold
                            && exhausted_waits < self.policy.max_exhausted_waits =>
                    {
                        exhausted_waits += 1;
                        tracing::info!(
                            "[Dispatcher] {} 降级链暂时耗尽, 等待 {:?} 后重试",
                            workload,
                            wait
                        );
                        sleep_or_cancel(wait, cancel).await?;
                        exclude.clear();
                        continue;
                    }
                    best_wait => {
                        return Err(DispatchError::ChainExhausted {
                            workload,
                            best_wait,
                            attempts: attempts.len() as u32,
                        })
                    }
                },
            };

            let endpoint = self
                .core
                .catalog()
                .get(&endpoint_id)
                .ok_or_else(|| DispatchError::Config(format!("端点不存在: {endpoint_id}")))?;

            match self
                .attempt(endpoint, work, estimated_tokens, &mut attempts, cancel)
                .await?
            {
                AttemptResult::Succeeded(outcome) => return Ok(outcome),
                AttemptResult::BudgetDeferred | AttemptResult::Failed => {
                    exclude.insert(endpoint_id);
                }
            }
        }
    }

    /// 降级链耗尽时的真实等待
    ///
    /// 已尝试的端点被排除后没有恢复时间，需去掉排除集重新解析，
    /// 才能得到冷却或预算窗口的剩余时间。重新选中且无需等待的端点
    /// 不提供等待时间，避免立即重试刚失败的端点。
    fn actual_wait(
        &self,
        workload: WorkloadClass,
        estimated_tokens: u64,
        exclude: &HashSet<String>,
        best_wait: Option<Duration>,
    ) -> Result<Option<Duration>, DispatchError> {
        if exclude.is_empty() {
            return Ok(best_wait);
        }
        let resolution = self.core.resolver().resolve_with(
            workload,
            &ResolveRequest {
                exclude: None,
                estimated_tokens,
            },
        )?;
        Ok(match resolution {
            Resolution::Selected { wait, .. } => wait.filter(|wait| !wait.is_zero()),
            Resolution::Exhausted { best_wait } => best_wait,
        })
    }

    /// 在选中的端点上执行一次尝试
    async fn attempt(
        &self,
        endpoint: &Endpoint,
        work: &WorkUnit,
        estimated_tokens: u64,
        attempts: &mut Vec<AttemptSummary>,
        cancel: &CancellationToken,
    ) -> Result<AttemptResult, DispatchError> {
        let reservation = match self.reserve(endpoint, estimated_tokens, cancel).await? {
            Some(reservation) => reservation,
            None => return Ok(AttemptResult::BudgetDeferred),
        };

        let handle = AttemptHandle::new(
            &endpoint.id,
            attempts.len() as u32 + 1,
            cancel.child_token(),
        );
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecutionFailure::cancelled()),
            result = self.executor.execute(endpoint, work, &handle) => result,
        };
        let latency = started.elapsed();

        match result {
            Ok(report) => {
                let record = self
                    .core
                    .record_attempt(&report.to_record(&endpoint.id, latency), Some(&reservation))?;
                attempts.push(AttemptSummary::from_record(&record));
                Ok(AttemptResult::Succeeded(DispatchOutcome {
                    work_id: work.id,
                    endpoint_id: endpoint.id.clone(),
                    output: report.output,
                    record,
                    attempts: std::mem::take(attempts),
                }))
            }
            Err(failure) if failure.kind == OutcomeKind::Cancelled || cancel.is_cancelled() => {
                tracing::info!("[Dispatcher] {} 执行被取消", endpoint.id);
                Err(DispatchError::Cancelled)
            }
            Err(failure) => {
                let record = self
                    .core
                    .record_attempt(&failure.to_record(&endpoint.id, latency), Some(&reservation))?;
                attempts.push(AttemptSummary::from_record(&record));

                if handle.is_committed() {
                    tracing::warn!(
                        "[Dispatcher] {} 已提交部分输出后失败, 不再降级: {}",
                        endpoint.id,
                        failure
                    );
                    return Err(DispatchError::Interrupted {
                        endpoint_id: endpoint.id.clone(),
                        kind: failure.kind,
                        message: failure.message,
                    });
                }

                tracing::warn!(
                    "[Dispatcher] {} 执行失败, 尝试降级: {}",
                    endpoint.id,
                    failure
                );
                Ok(AttemptResult::Failed)
            }
        }
    }

    /// 预留预算；需要长等待时返回 None
    async fn reserve(
        &self,
        endpoint: &Endpoint,
        estimated_tokens: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<Reservation>, DispatchError> {
        let mut waits = 0;
        loop {
            let decision = self
                .core
                .budget()
                .check_and_reserve(&endpoint.provider, estimated_tokens);
            if let Some(reservation) = decision.reservation {
                return Ok(Some(reservation));
            }
            if decision.should_failover || waits >= self.policy.max_budget_waits {
                tracing::info!(
                    "[Dispatcher] {} 预算需等待 {:?}, 跳过 (建议 Provider: {:?})",
                    endpoint.id,
                    decision.wait,
                    decision.failover_suggestion
                );
                return Ok(None);
            }
            waits += 1;
            tracing::debug!(
                "[Dispatcher] {} 预算短等待 {:?} ({}/{})",
                endpoint.id,
                decision.wait,
                waits,
                self.policy.max_budget_waits
            );
            sleep_or_cancel(decision.wait, cancel).await?;
        }
    }

    /// 执行层上报遥测
    pub fn report_outcome(
        &self,
        endpoint_id: &str,
        outcome: OutcomeKind,
        input_tokens: u64,
        output_tokens: u64,
        latency_ms: u64,
    ) -> Result<AttemptRecord, DispatchError> {
        let record = AttemptRecord::new(endpoint_id, outcome)
            .with_tokens(input_tokens, output_tokens)
            .with_latency(latency_ms);
        self.report_attempt(&record)
    }

    /// 上报完整的执行记录（含响应头信息）
    pub fn report_attempt(&self, record: &AttemptRecord) -> Result<AttemptRecord, DispatchError> {
        Ok(self.core.record_attempt(record, None)?)
    }

    /// 状态查询
    pub fn status(&self, query: &StatusQuery) -> Result<StatusSnapshot, DispatchError> {
        match query {
            StatusQuery::Workload(workload) => {
                let report = self
                    .core
                    .resolver()
                    .report(*workload, &ResolveRequest::default())?;
                Ok(StatusSnapshot::Workload(WorkloadStatus::new(
                    *workload,
                    report.verdicts,
                    report.resolution,
                )))
            }
            StatusQuery::Provider(provider) => {
                let window = self
                    .core
                    .budget()
                    .snapshot(provider)
                    .ok_or_else(|| DispatchError::UnknownProvider(provider.clone()))?;
                let endpoints = self
                    .core
                    .catalog()
                    .members_of(provider)
                    .map(|endpoint| EndpointStatus {
                        endpoint_id: endpoint.id.clone(),
                        usable: self.core.gate().is_usable(&endpoint.id),
                        capacity: self.core.capacity().fact(&endpoint.id),
                        cooldown: self.core.cooldown().entry(&endpoint.id),
                    })
                    .collect();
                Ok(StatusSnapshot::Provider(ProviderStatus {
                    provider: provider.clone(),
                    window,
                    endpoints,
                }))
            }
            StatusQuery::Role(role) => Ok(StatusSnapshot::Role(self.governor.stats(role))),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("core", &self.core)
            .field("governor", &self.governor)
            .field("policy", &self.policy)
            .finish()
    }
}

async fn sleep_or_cancel(wait: Duration, cancel: &CancellationToken) -> Result<(), DispatchError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DispatchError::Cancelled),
        _ = tokio::time::sleep(wait) => Ok(()),
    }
}
