//! 数据模型
//!
//! - `endpoint` - 端点与负载类型
//! - `telemetry` - 执行记录与结果分类

mod endpoint;
mod telemetry;

pub use endpoint::{Endpoint, WorkloadClass};
pub use telemetry::{AttemptRecord, CapacitySource, OutcomeKind};
