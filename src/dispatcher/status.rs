//! 状态快照
//!
//! 按负载类型、Provider 或角色查询当前路由状态，结果可直接序列化输出。

use routecast_core::models::WorkloadClass;
use routecast_core::orchestrator::{
    BudgetWindow, CandidateVerdict, CapacityFact, CooldownEntry, Resolution,
};
use routecast_scheduler::RoleStats;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 状态查询
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum StatusQuery {
    Workload(WorkloadClass),
    Provider(String),
    Role(String),
}

/// 状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusSnapshot {
    Workload(WorkloadStatus),
    Provider(ProviderStatus),
    Role(RoleStats),
}

/// 负载类型状态：每个候选的判定与下一个将被选中的端点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub workload: WorkloadClass,
    pub candidates: Vec<CandidateVerdict>,
    /// 下一个将被选中的端点
    pub next: Option<String>,
    /// 全部不可用时的最短等待
    pub best_wait: Option<Duration>,
}

impl WorkloadStatus {
    pub(crate) fn new(
        workload: WorkloadClass,
        candidates: Vec<CandidateVerdict>,
        resolution: Resolution,
    ) -> Self {
        let (next, best_wait) = match resolution {
            Resolution::Selected { endpoint_id, .. } => (Some(endpoint_id), None),
            Resolution::Exhausted { best_wait } => (None, best_wait),
        };
        Self {
            workload,
            candidates,
            next,
            best_wait,
        }
    }

    /// 可用候选数
    pub fn eligible_count(&self) -> usize {
        self.candidates.iter().filter(|c| c.is_eligible()).count()
    }
}

/// 端点状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub endpoint_id: String,
    /// 凭证是否可用
    pub usable: bool,
    pub capacity: Option<CapacityFact>,
    pub cooldown: Option<CooldownEntry>,
}

/// Provider 状态：预算窗口、累计成本与成员端点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub provider: String,
    pub window: BudgetWindow,
    pub endpoints: Vec<EndpointStatus>,
}

impl ProviderStatus {
    /// 处于冷却中的成员端点
    pub fn cooling_down(&self) -> Vec<&str> {
        self.endpoints
            .iter()
            .filter(|e| e.cooldown.is_some())
            .map(|e| e.endpoint_id.as_str())
            .collect()
    }
}
