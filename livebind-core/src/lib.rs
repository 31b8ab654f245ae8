//! # Livebind
//!
//! 原生对象与托管（垃圾回收）代理之间的绑定桥
//!
//! ## 架构概述
//!
//! - **runtime**: 托管运行时抽象 [`ManagedRuntime`] 及进程内参考实现 [`Heap`]
//! - **ffi**: 句柄注册表、调用描述符、类型转换、异常桥、super 跳板与生命周期控制
//! - **config / core**: 配置、错误、类型描述符与日志

pub mod config;
pub mod core;
pub mod ffi;
pub mod runtime;

pub use crate::config::{load_config, load_default_config, Settings};
pub use crate::core::error::{BridgeError, BridgeResult, ErrorSeverity};
pub use crate::core::logging::Logger;
pub use crate::core::types::{MethodSignature, ValueType};
pub use crate::ffi::*;
pub use crate::runtime::{GlobalRef, Heap, ManagedClass, ManagedRuntime, ManagedValue, ObjectId, Throwable};
