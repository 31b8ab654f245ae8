//! 核心模块
//!
//! 包含类型描述符、错误定义和日志初始化

pub mod error;
pub mod logging;
pub mod types;

pub use error::*;
pub use logging::*;
pub use types::*;
