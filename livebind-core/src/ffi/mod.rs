//! 绑定桥模块
//!
//! 原生实例与托管代理之间的句柄、描述符、类型转换、异常与生命周期

pub mod bridge;
pub mod descriptor;
pub mod exception_handler;
pub mod handle_registry;
pub mod lifecycle;
pub mod trampoline;
pub mod type_converter;

pub use bridge::*;
pub use descriptor::*;
pub use exception_handler::*;
pub use handle_registry::*;
pub use lifecycle::*;
pub use trampoline::*;
pub use type_converter::*;
