//! 路由核心类型和组件
//!
//! 包含模型目录、凭证闸门、容量登记表、预算账本、冷却追踪、降级链解析，
//! 以及配置、错误、时钟等基础功能。

pub mod catalog;
pub mod clock;
pub mod config;
pub mod credential;
pub mod errors;
pub mod models;
pub mod orchestrator;

pub use catalog::ModelCatalog;
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::RoutecastConfig;
pub use credential::{CredentialGate, CredentialSource, EnvCredentialSource, StaticCredentialSource};
pub use errors::{ConfigError, RoutingError};
pub use models::{AttemptRecord, CapacitySource, Endpoint, OutcomeKind, WorkloadClass};
pub use orchestrator::RoutingCore;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
