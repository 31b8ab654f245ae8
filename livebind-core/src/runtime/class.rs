//! 托管类定义
//!
//! 托管方法体以闭包表示；声明为 native 的方法由桥接层在绑定时注册实现。

use std::fmt;
use std::sync::Arc;

use super::heap::ManagedCall;
use super::{classes, ManagedValue, Throwable};
use crate::core::types::{MethodSignature, ValueType, OBJECT_CLASS};

/// 构造器方法名
pub const CONSTRUCTOR: &str = "<init>";

/// 托管方法体
pub type ManagedFn = Arc<dyn Fn(&ManagedCall<'_>) -> Result<ManagedValue, Throwable> + Send + Sync>;

/// 方法实现
#[derive(Clone)]
pub enum MethodBody {
    /// 托管实现
    Managed(ManagedFn),
    /// 由原生侧提供
    Native,
    /// 无实现
    Abstract,
}

impl fmt::Debug for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodBody::Managed(_) => f.write_str("Managed"),
            MethodBody::Native => f.write_str("Native"),
            MethodBody::Abstract => f.write_str("Abstract"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagedMethod {
    pub name: String,
    pub descriptor: String,
    pub signature: MethodSignature,
    pub is_static: bool,
    /// 私有方法不参与虚分派
    pub is_private: bool,
    pub body: MethodBody,
}

impl ManagedMethod {
    pub fn is_native(&self) -> bool {
        matches!(self.body, MethodBody::Native)
    }

    /// 是否可被子类覆写
    pub fn is_virtual(&self) -> bool {
        !self.is_static && !self.is_private && self.name != CONSTRUCTOR
    }
}

#[derive(Debug, Clone)]
pub struct ManagedField {
    pub name: String,
    pub ty: ValueType,
    pub is_static: bool,
}

/// 托管类
#[derive(Debug, Clone)]
pub struct ManagedClass {
    pub name: String,
    pub superclass: Option<String>,
    pub methods: Vec<ManagedMethod>,
    pub fields: Vec<ManagedField>,
}

impl ManagedClass {
    pub fn builder(name: impl Into<String>) -> ClassBuilder {
        ClassBuilder::new(name)
    }

    pub fn method_index(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods
            .iter()
            .position(|m| m.name == name && m.descriptor == descriptor)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn declared_method(&self, name: &str, descriptor: &str) -> Option<&ManagedMethod> {
        self.method_index(name, descriptor).map(|index| &self.methods[index])
    }

    pub fn declared_field(&self, name: &str) -> Option<&ManagedField> {
        self.field_index(name).map(|index| &self.fields[index])
    }
}

/// 类构建器
///
/// 描述符在 `build` 时统一校验
pub struct ClassBuilder {
    class: ManagedClass,
    errors: Vec<String>,
}

impl ClassBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let superclass = if name == OBJECT_CLASS {
            None
        } else {
            Some(OBJECT_CLASS.to_string())
        };
        Self {
            class: ManagedClass {
                name,
                superclass,
                methods: Vec::new(),
                fields: Vec::new(),
            },
            errors: Vec::new(),
        }
    }

    pub fn extends(mut self, superclass: impl Into<String>) -> Self {
        self.class.superclass = Some(superclass.into());
        self
    }

    pub fn field(self, name: &str, descriptor: &str) -> Self {
        self.push_field(name, descriptor, false)
    }

    pub fn static_field(self, name: &str, descriptor: &str) -> Self {
        self.push_field(name, descriptor, true)
    }

    pub fn method<F>(self, name: &str, descriptor: &str, body: F) -> Self
    where
        F: Fn(&ManagedCall<'_>) -> Result<ManagedValue, Throwable> + Send + Sync + 'static,
    {
        self.push_method(name, descriptor, false, false, MethodBody::Managed(Arc::new(body)))
    }

    pub fn static_method<F>(self, name: &str, descriptor: &str, body: F) -> Self
    where
        F: Fn(&ManagedCall<'_>) -> Result<ManagedValue, Throwable> + Send + Sync + 'static,
    {
        self.push_method(name, descriptor, true, false, MethodBody::Managed(Arc::new(body)))
    }

    /// 私有方法：只能被精确调用
    pub fn private_method<F>(self, name: &str, descriptor: &str, body: F) -> Self
    where
        F: Fn(&ManagedCall<'_>) -> Result<ManagedValue, Throwable> + Send + Sync + 'static,
    {
        self.push_method(name, descriptor, false, true, MethodBody::Managed(Arc::new(body)))
    }

    pub fn constructor<F>(self, descriptor: &str, body: F) -> Self
    where
        F: Fn(&ManagedCall<'_>) -> Result<ManagedValue, Throwable> + Send + Sync + 'static,
    {
        self.push_method(CONSTRUCTOR, descriptor, false, false, MethodBody::Managed(Arc::new(body)))
    }

    pub fn native_method(self, name: &str, descriptor: &str) -> Self {
        self.push_method(name, descriptor, false, false, MethodBody::Native)
    }

    pub fn static_native_method(self, name: &str, descriptor: &str) -> Self {
        self.push_method(name, descriptor, true, false, MethodBody::Native)
    }

    pub fn abstract_method(self, name: &str, descriptor: &str) -> Self {
        self.push_method(name, descriptor, false, false, MethodBody::Abstract)
    }

    pub fn build(self) -> Result<ManagedClass, Throwable> {
        if let Some(first) = self.errors.into_iter().next() {
            return Err(Throwable::new(classes::LINKAGE_ERROR, first));
        }
        Ok(self.class)
    }

    fn push_field(mut self, name: &str, descriptor: &str, is_static: bool) -> Self {
        match ValueType::parse(descriptor) {
            Ok(ValueType::Void) => self
                .errors
                .push(format!("{}.{}: field cannot be void", self.class.name, name)),
            Ok(ty) => {
                if self.class.field_index(name).is_some() {
                    self.errors
                        .push(format!("{}.{}: duplicate field", self.class.name, name));
                } else {
                    self.class.fields.push(ManagedField {
                        name: name.to_string(),
                        ty,
                        is_static,
                    });
                }
            }
            Err(e) => self
                .errors
                .push(format!("{}.{}: {}", self.class.name, name, e.message())),
        }
        self
    }

    fn push_method(
        mut self,
        name: &str,
        descriptor: &str,
        is_static: bool,
        is_private: bool,
        body: MethodBody,
    ) -> Self {
        match MethodSignature::parse(descriptor) {
            Ok(signature) => {
                if self.class.method_index(name, descriptor).is_some() {
                    self.errors.push(format!(
                        "{}.{}{}: duplicate method",
                        self.class.name, name, descriptor
                    ));
                } else {
                    self.class.methods.push(ManagedMethod {
                        name: name.to_string(),
                        descriptor: descriptor.to_string(),
                        signature,
                        is_static,
                        is_private,
                        body,
                    });
                }
            }
            Err(e) => self.errors.push(format!(
                "{}.{}{}: {}",
                self.class.name,
                name,
                descriptor,
                e.message()
            )),
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_members() {
        let class = ManagedClass::builder("Checkpoint")
            .field("time", "J")
            .field("data", "Lcore/Object;")
            .static_field("count", "I")
            .native_method("play", "()V")
            .private_method("helper", "()I", |_| Ok(ManagedValue::Int(1)))
            .build()
            .unwrap();

        assert_eq!(class.superclass.as_deref(), Some(OBJECT_CLASS));
        assert_eq!(class.fields.len(), 3);
        assert!(class.declared_field("count").unwrap().is_static);
        assert!(class.declared_method("play", "()V").unwrap().is_native());
        assert!(!class.declared_method("helper", "()I").unwrap().is_virtual());
    }

    #[test]
    fn test_builder_reports_malformed_descriptor() {
        let err = ManagedClass::builder("Broken")
            .native_method("play", "(Lcore/String)V")
            .build()
            .unwrap_err();
        assert_eq!(err.class_name, classes::LINKAGE_ERROR);
        assert!(err.message.contains("Broken.play"));
    }

    #[test]
    fn test_overloads_by_descriptor() {
        let class = ManagedClass::builder("Callee")
            .method("value", "()I", |_| Ok(ManagedValue::Int(1)))
            .method("value", "()D", |_| Ok(ManagedValue::Double(1.0)))
            .build()
            .unwrap();
        assert_ne!(class.method_index("value", "()I"), class.method_index("value", "()D"));
    }
}
