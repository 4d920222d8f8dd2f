//! 并发准入控制
//!
//! 提供按角色限制并发工作单元数量的 Governor。

pub mod governor;
pub mod types;

pub use governor::{Governor, Slot};
pub use types::{AdmissionError, RoleLimit, RoleStats};
