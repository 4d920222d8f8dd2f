//! Routecast - 面向负载类型的多后端模型路由
//!
//! ## Workspace 结构
//!
//! - routecast-core：模型目录、凭证、容量、预算、冷却与降级链解析
//! - routecast-scheduler：按角色的并发准入（Governor）
//! - routecast-providers：执行层接口、结果分类与限流头解析
//! - 主 crate：派发器、配置文件读写、日志初始化

pub use routecast_core::{
    catalog, clock, credential, errors, models, orchestrator, AttemptRecord, CapacitySource, Clock,
    ConfigError, CredentialGate, CredentialSource, Endpoint, EnvCredentialSource, ManualClock,
    ModelCatalog, OutcomeKind, RoutecastConfig, RoutingCore, RoutingError, SharedClock,
    StaticCredentialSource, WorkloadClass,
};
pub use routecast_providers::{
    classify, AttemptHandle, ExecutionFailure, ExecutionReport, Executor, RateLimitHeaders,
    WorkUnit,
};
pub use routecast_scheduler::{AdmissionError, Governor, RoleLimit, RoleStats, Slot};

pub mod config;
pub mod dispatcher;
pub mod logger;

pub use dispatcher::{
    AttemptSummary, DispatchError, DispatchOutcome, DispatchPolicy, Dispatcher, StatusQuery,
    StatusSnapshot,
};
