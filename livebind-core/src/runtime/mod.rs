//! 托管运行时模块
//!
//! 桥接层只通过 [`ManagedRuntime`] 与托管侧交互：分配、调用、字段访问、
//! 抛出/捕获以及回收时终结。[`Heap`] 是进程内的参考实现。

pub mod class;
pub mod heap;
pub mod reference;

pub use class::*;
pub use heap::*;
pub use reference::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::core::types::ValueType;

/// 内置异常类名
pub mod classes {
    pub const THROWABLE: &str = "core/Throwable";
    pub const EXCEPTION: &str = "core/Exception";
    pub const RUNTIME_EXCEPTION: &str = "core/RuntimeException";
    pub const ILLEGAL_STATE: &str = "core/IllegalStateException";
    pub const ILLEGAL_ARGUMENT: &str = "core/IllegalArgumentException";
    pub const CLASS_CAST: &str = "core/ClassCastException";
    pub const NULL_POINTER: &str = "core/NullPointerException";
    pub const INSTANTIATION: &str = "core/InstantiationException";
    pub const ERROR: &str = "core/Error";
    pub const LINKAGE_ERROR: &str = "core/LinkageError";
    pub const UNSATISFIED_LINK: &str = "core/UnsatisfiedLinkError";
    pub const NO_SUCH_METHOD: &str = "core/NoSuchMethodError";
    pub const NO_SUCH_FIELD: &str = "core/NoSuchFieldError";
    pub const ABSTRACT_METHOD: &str = "core/AbstractMethodError";
}

/// 托管对象标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub(crate) u64);

impl ObjectId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 托管侧值表示
///
/// 引用以 [`GlobalRef`] 持有，克隆即 pin，释放即 unpin
#[derive(Debug, Clone, PartialEq)]
pub enum ManagedValue {
    Void,
    /// 托管布尔值只允许 0/1
    Boolean(u8),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Ref(Option<GlobalRef>),
}

impl ManagedValue {
    pub fn null() -> Self {
        ManagedValue::Ref(None)
    }

    pub fn bool(value: bool) -> Self {
        ManagedValue::Boolean(value as u8)
    }

    pub fn object(object: &GlobalRef) -> Self {
        ManagedValue::Ref(Some(object.clone()))
    }

    /// 字段与数组元素的零值
    pub fn default_for(ty: &ValueType) -> Self {
        match ty {
            ValueType::Void => ManagedValue::Void,
            ValueType::Boolean => ManagedValue::Boolean(0),
            ValueType::Byte => ManagedValue::Byte(0),
            ValueType::Char => ManagedValue::Char(0),
            ValueType::Short => ManagedValue::Short(0),
            ValueType::Int => ManagedValue::Int(0),
            ValueType::Long => ManagedValue::Long(0),
            ValueType::Float => ManagedValue::Float(0.0),
            ValueType::Double => ManagedValue::Double(0.0),
            ValueType::Object(_) | ValueType::Array(_) => ManagedValue::Ref(None),
        }
    }

    /// 值的种类是否与声明类型一致（引用只检查种类）
    pub fn matches(&self, ty: &ValueType) -> bool {
        matches!(
            (self, ty),
            (ManagedValue::Void, ValueType::Void)
                | (ManagedValue::Boolean(_), ValueType::Boolean)
                | (ManagedValue::Byte(_), ValueType::Byte)
                | (ManagedValue::Char(_), ValueType::Char)
                | (ManagedValue::Short(_), ValueType::Short)
                | (ManagedValue::Int(_), ValueType::Int)
                | (ManagedValue::Long(_), ValueType::Long)
                | (ManagedValue::Float(_), ValueType::Float)
                | (ManagedValue::Double(_), ValueType::Double)
                | (ManagedValue::Ref(_), ValueType::Object(_))
                | (ManagedValue::Ref(_), ValueType::Array(_))
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ManagedValue::Void => "void",
            ManagedValue::Boolean(_) => "boolean",
            ManagedValue::Byte(_) => "byte",
            ManagedValue::Char(_) => "char",
            ManagedValue::Short(_) => "short",
            ManagedValue::Int(_) => "int",
            ManagedValue::Long(_) => "long",
            ManagedValue::Float(_) => "float",
            ManagedValue::Double(_) => "double",
            ManagedValue::Ref(_) => "reference",
        }
    }

    pub fn as_object(&self) -> Option<&GlobalRef> {
        match self {
            ManagedValue::Ref(Some(object)) => Some(object),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ManagedValue::Ref(None))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ManagedValue::Boolean(value) => Some(*value != 0),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            ManagedValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            ManagedValue::Long(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            ManagedValue::Double(value) => Some(*value),
            _ => None,
        }
    }
}

/// 托管侧异常
///
/// 托管代码以 `Err(Throwable)` 表示 throw，调用方匹配 `Err` 即 catch
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{class_name}: {message}")]
pub struct Throwable {
    pub class_name: String,
    pub message: String,
    pub code: Option<i32>,
}

impl Throwable {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(classes::RUNTIME_EXCEPTION, message)
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::new(classes::ILLEGAL_STATE, message)
    }

    pub fn illegal_argument(message: impl Into<String>) -> Self {
        Self::new(classes::ILLEGAL_ARGUMENT, message)
    }

    pub fn null_pointer(message: impl Into<String>) -> Self {
        Self::new(classes::NULL_POINTER, message)
    }

    /// 按类层次判断，供托管代码按类捕获
    pub fn is_instance_of(&self, runtime: &dyn ManagedRuntime, class: &str) -> bool {
        runtime.is_assignable(&self.class_name, class)
    }
}

/// 方法调用方式
#[derive(Debug, Clone, Copy)]
pub enum Invocation<'a> {
    /// 静态调用
    Static,
    /// 虚调用：从接收者的实际类开始选择覆写
    Virtual(&'a GlobalRef),
    /// 精确调用：执行解析到的那一个实现，不做覆写选择
    Exact(&'a GlobalRef),
}

impl<'a> Invocation<'a> {
    pub fn receiver(&self) -> Option<&'a GlobalRef> {
        match self {
            Invocation::Static => None,
            Invocation::Virtual(object) | Invocation::Exact(object) => Some(object),
        }
    }
}

/// 注册到托管类上的原生方法入口
pub type NativeMethod =
    Arc<dyn Fn(Option<&GlobalRef>, &[ManagedValue]) -> Result<ManagedValue, Throwable> + Send + Sync>;

/// 一次回收的统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionStats {
    /// 扫描的对象数
    pub scanned: usize,
    /// 直接释放的对象数
    pub freed: usize,
    /// 执行了终结器的对象数
    pub finalized: usize,
}

impl CollectionStats {
    pub fn is_empty(&self) -> bool {
        self.freed == 0 && self.finalized == 0
    }
}

/// 托管运行时服务
pub trait ManagedRuntime: Send + Sync {
    /// 查找类定义
    fn find_class(&self, name: &str) -> Option<Arc<ManagedClass>>;

    /// `class` 是否是 `target` 或其子类
    fn is_assignable(&self, class: &str, target: &str) -> bool;

    /// 对象的实际类名
    fn class_of(&self, object: ObjectId) -> Option<String>;

    /// 分配对象（字段为零值），返回已 pin 的引用
    fn allocate(&self, class: &str) -> Result<GlobalRef, Throwable>;

    /// 调用 `class` 上按名称与描述符解析到的方法
    fn invoke(
        &self,
        class: &str,
        name: &str,
        descriptor: &str,
        invocation: Invocation<'_>,
        args: &[ManagedValue],
    ) -> Result<ManagedValue, Throwable>;

    /// 读取字段；`target` 为 `None` 时读取静态字段
    fn get_field(&self, class: &str, name: &str, target: Option<&GlobalRef>) -> Result<ManagedValue, Throwable>;

    /// 写入字段；`target` 为 `None` 时写入静态字段
    fn set_field(
        &self,
        class: &str,
        name: &str,
        target: Option<&GlobalRef>,
        value: ManagedValue,
    ) -> Result<(), Throwable>;

    /// 为声明为 native 的方法绑定实现
    fn register_native(&self, class: &str, name: &str, descriptor: &str, entry: NativeMethod) -> Result<(), Throwable>;

    fn new_string(&self, value: &str) -> Result<GlobalRef, Throwable>;

    fn string_value(&self, object: &GlobalRef) -> Option<String>;

    /// 新建一维数组
    fn new_array(&self, element: &ValueType, items: Vec<ManagedValue>) -> Result<GlobalRef, Throwable>;

    /// 复制数组内容；非数组返回 `None`
    fn array_items(&self, object: &GlobalRef) -> Option<Vec<ManagedValue>>;

    /// 覆盖写入已有数组，长度必须一致
    fn write_array(&self, object: &GlobalRef, items: Vec<ManagedValue>) -> Result<(), Throwable>;

    /// 读取对象的句柄槽
    fn handle_slot(&self, object: ObjectId) -> u64;

    /// 写入对象的句柄槽；对象已释放时忽略
    fn set_handle_slot(&self, object: ObjectId, raw: u64);

    fn pin(&self, object: ObjectId);

    fn unpin(&self, object: ObjectId);

    /// 执行一次回收，对不可达且定义了 `finalize()V` 的对象调用终结器
    fn collect(&self) -> CollectionStats;

    fn superclass_of(&self, class: &str) -> Option<String> {
        self.find_class(class).and_then(|c| c.superclass.clone())
    }

    fn is_instance_of(&self, object: &GlobalRef, class: &str) -> bool {
        self.class_of(object.id())
            .map(|actual| self.is_assignable(&actual, class))
            .unwrap_or(false)
    }

    /// 从 `class` 向上查找方法，返回声明类与方法下标
    fn resolve_method(&self, class: &str, name: &str, descriptor: &str) -> Option<(Arc<ManagedClass>, usize)> {
        let mut current = self.find_class(class);
        while let Some(candidate) = current {
            if let Some(index) = candidate.method_index(name, descriptor) {
                return Some((candidate, index));
            }
            current = candidate
                .superclass
                .as_deref()
                .and_then(|parent| self.find_class(parent));
        }
        None
    }

    /// 从 `class` 向上查找字段，返回声明类与字段下标
    fn resolve_field(&self, class: &str, name: &str) -> Option<(Arc<ManagedClass>, usize)> {
        let mut current = self.find_class(class);
        while let Some(candidate) = current {
            if let Some(index) = candidate.field_index(name) {
                return Some((candidate, index));
            }
            current = candidate
                .superclass
                .as_deref()
                .and_then(|parent| self.find_class(parent));
        }
        None
    }
}
