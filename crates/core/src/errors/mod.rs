//! 错误类型模块
//!
//! ## 模块结构
//! - `routing_error`: 配置与路由解析错误（ConfigError, RoutingError）

pub mod routing_error;

pub use routing_error::{ConfigError, RoutingError};
