//! 调用描述符
//!
//! 类绑定在标签下声明要使用的成员，绑定时一次性解析并缓存。
//! 成员缺失或类型不符立即失败，不会留到第一次调用时才发现。

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::error::{BridgeError, BridgeResult};
use crate::core::types::{MethodSignature, ValueType};
use crate::runtime::{ManagedRuntime, CONSTRUCTOR};

/// 静态成员名前缀
pub const STATIC_PREFIX: char = '+';

const DESCRIPTOR_HINT: &str =
    "hint: qualify object types as Lpkg/Name; and prefix static members with '+'";

/// 调用目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    Static,
    Instance,
}

/// 分派方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatchKind {
    /// 从接收者实际类选择覆写
    Virtual,
    /// 只执行解析到的实现（super 调用）
    Exact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberKind {
    Method,
    Constructor,
    FieldGet,
    FieldSet,
}

/// 已解析的调用描述符，解析后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDescriptor {
    /// 绑定时使用的标签
    pub tag: String,
    /// 解析起点类
    pub class: String,
    /// 成员名（不含 `+`）
    pub name: String,
    /// 方法描述符；字段为类型描述符
    pub descriptor: String,
    pub signature: MethodSignature,
    pub target: TargetKind,
    pub dispatch: DispatchKind,
    pub member: MemberKind,
}

impl CallDescriptor {
    /// 穿越点名称，用于日志与异常记录
    pub fn site(&self) -> String {
        match self.member {
            MemberKind::FieldGet | MemberKind::FieldSet => format!("{}.{}", self.class, self.name),
            MemberKind::Method | MemberKind::Constructor => {
                format!("{}.{}{}", self.class, self.name, self.descriptor)
            }
        }
    }

    pub fn is_static(&self) -> bool {
        self.target == TargetKind::Static
    }
}

/// 字段读写描述符对
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldAccessor {
    pub getter: CallDescriptor,
    pub setter: CallDescriptor,
}

impl FieldAccessor {
    pub fn value_type(&self) -> &ValueType {
        &self.getter.signature.ret
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MemberDecl {
    Method {
        name: String,
        descriptor: String,
        exact_in: Option<String>,
    },
    Constructor {
        descriptor: String,
    },
    Field {
        name: String,
        type_descriptor: String,
    },
}

/// 未解析的类绑定
#[derive(Debug, Clone)]
pub struct ClassBinding {
    class: String,
    members: Vec<(String, MemberDecl)>,
}

impl ClassBinding {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            members: Vec::new(),
        }
    }

    /// 方法；`+name` 表示静态方法
    pub fn method(mut self, tag: &str, name: &str, descriptor: &str) -> Self {
        self.members.push((
            tag.to_string(),
            MemberDecl::Method {
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                exact_in: None,
            },
        ));
        self
    }

    /// 在 `class` 上精确调用的方法（不做覆写选择）
    pub fn exact_method(mut self, tag: &str, class: &str, name: &str, descriptor: &str) -> Self {
        self.members.push((
            tag.to_string(),
            MemberDecl::Method {
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                exact_in: Some(class.to_string()),
            },
        ));
        self
    }

    pub fn constructor(mut self, tag: &str, descriptor: &str) -> Self {
        self.members.push((
            tag.to_string(),
            MemberDecl::Constructor {
                descriptor: descriptor.to_string(),
            },
        ));
        self
    }

    /// 字段；`+name` 表示静态字段
    pub fn field(mut self, tag: &str, name: &str, type_descriptor: &str) -> Self {
        self.members.push((
            tag.to_string(),
            MemberDecl::Field {
                name: name.to_string(),
                type_descriptor: type_descriptor.to_string(),
            },
        ));
        self
    }

    pub fn class_name(&self) -> &str {
        &self.class
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.members.iter().any(|(t, _)| t == tag)
    }

    /// 缓存键：类名加全部成员声明
    fn fingerprint(&self) -> String {
        let mut parts: Vec<String> = self
            .members
            .iter()
            .map(|(tag, decl)| format!("{}={:?}", tag, decl))
            .collect();
        parts.sort();
        format!("{}|{}", self.class, parts.join("|"))
    }
}

/// 解析完成的类绑定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundClass {
    pub class: String,
    methods: HashMap<String, CallDescriptor>,
    fields: HashMap<String, FieldAccessor>,
}

impl BoundClass {
    pub fn method(&self, tag: &str) -> BridgeResult<&CallDescriptor> {
        self.methods
            .get(tag)
            .ok_or_else(|| BridgeError::binding(&self.class, tag, "no method or constructor bound under this tag"))
    }

    pub fn field(&self, tag: &str) -> BridgeResult<&FieldAccessor> {
        self.fields
            .get(tag)
            .ok_or_else(|| BridgeError::binding(&self.class, tag, "no field bound under this tag"))
    }

    pub fn methods(&self) -> impl Iterator<Item = &CallDescriptor> {
        self.methods.values()
    }

    pub fn member_count(&self) -> usize {
        self.methods.len() + self.fields.len()
    }
}

/// 描述符缓存统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DescriptorStats {
    pub bound_classes: usize,
    pub resolved_members: u64,
    pub cache_hits: u64,
    pub failures: u64,
}

/// 描述符缓存，进程生命周期内有效
pub struct DescriptorCache {
    bound: RwLock<HashMap<String, Arc<BoundClass>>>,
    stats: Mutex<DescriptorStats>,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self {
            bound: RwLock::new(HashMap::new()),
            stats: Mutex::new(DescriptorStats::default()),
        }
    }

    /// 解析类绑定；同一绑定只解析一次
    pub fn resolve(&self, runtime: &dyn ManagedRuntime, binding: &ClassBinding) -> BridgeResult<Arc<BoundClass>> {
        let key = binding.fingerprint();
        if let Some(bound) = self.bound.read().get(&key) {
            self.stats.lock().cache_hits += 1;
            return Ok(Arc::clone(bound));
        }

        let bound = match resolve_binding(runtime, binding) {
            Ok(bound) => Arc::new(bound),
            Err(error) => {
                self.stats.lock().failures += 1;
                tracing::error!("Binding {} failed: {}", binding.class, error);
                return Err(error);
            }
        };

        let mut table = self.bound.write();
        let entry = Arc::clone(table.entry(key).or_insert_with(|| Arc::clone(&bound)));
        let mut stats = self.stats.lock();
        stats.bound_classes = table.len();
        stats.resolved_members += bound.member_count() as u64;
        tracing::debug!("Bound {} with {} members", binding.class, bound.member_count());
        Ok(entry)
    }

    pub fn stats(&self) -> DescriptorStats {
        self.stats.lock().clone()
    }
}

impl Default for DescriptorCache {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_binding(runtime: &dyn ManagedRuntime, binding: &ClassBinding) -> BridgeResult<BoundClass> {
    if runtime.find_class(&binding.class).is_none() {
        return Err(BridgeError::binding(&binding.class, "<class>", "class is not defined"));
    }

    let mut bound = BoundClass {
        class: binding.class.clone(),
        methods: HashMap::new(),
        fields: HashMap::new(),
    };
    for (tag, decl) in &binding.members {
        if bound.methods.contains_key(tag) || bound.fields.contains_key(tag) {
            return Err(BridgeError::binding(&binding.class, tag, "tag is bound twice"));
        }
        match decl {
            MemberDecl::Method {
                name,
                descriptor,
                exact_in,
            } => {
                let resolved = resolve_method(runtime, &binding.class, tag, name, descriptor, exact_in.as_deref())?;
                bound.methods.insert(tag.clone(), resolved);
            }
            MemberDecl::Constructor { descriptor } => {
                let resolved = resolve_constructor(runtime, &binding.class, tag, descriptor)?;
                bound.methods.insert(tag.clone(), resolved);
            }
            MemberDecl::Field { name, type_descriptor } => {
                let resolved = resolve_field(runtime, &binding.class, tag, name, type_descriptor)?;
                bound.fields.insert(tag.clone(), resolved);
            }
        }
    }
    Ok(bound)
}

fn split_static(name: &str) -> (&str, bool) {
    match name.strip_prefix(STATIC_PREFIX) {
        Some(stripped) => (stripped, true),
        None => (name, false),
    }
}

fn parse_signature(class: &str, member: &str, descriptor: &str) -> BridgeResult<MethodSignature> {
    MethodSignature::parse(descriptor).map_err(|e| {
        BridgeError::binding(class, member, format!("{} ({})", e.message(), DESCRIPTOR_HINT))
    })
}

fn resolve_method(
    runtime: &dyn ManagedRuntime,
    class: &str,
    tag: &str,
    name: &str,
    descriptor: &str,
    exact_in: Option<&str>,
) -> BridgeResult<CallDescriptor> {
    let (name, is_static) = split_static(name);
    let member = format!("{}{}", name, descriptor);
    let signature = parse_signature(class, &member, descriptor)?;

    let lookup = exact_in.unwrap_or(class);
    if exact_in.is_some() && !runtime.is_assignable(class, lookup) {
        return Err(BridgeError::binding(
            class,
            &member,
            format!("{} is not an ancestor of {}", lookup, class),
        ));
    }
    let (declaring, index) = runtime.resolve_method(lookup, name, descriptor).ok_or_else(|| {
        BridgeError::binding(
            lookup,
            &member,
            format!("no such method ({})", DESCRIPTOR_HINT),
        )
    })?;
    let method = &declaring.methods[index];

    if method.is_static != is_static {
        let message = if method.is_static {
            "method is static but bound without the '+' prefix"
        } else {
            "method is an instance method but bound with the '+' prefix"
        };
        return Err(BridgeError::binding(lookup, &member, message));
    }

    let dispatch = if is_static || exact_in.is_some() || !method.is_virtual() {
        DispatchKind::Exact
    } else {
        DispatchKind::Virtual
    };

    Ok(CallDescriptor {
        tag: tag.to_string(),
        class: lookup.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        signature,
        target: if is_static { TargetKind::Static } else { TargetKind::Instance },
        dispatch,
        member: MemberKind::Method,
    })
}

fn resolve_constructor(
    runtime: &dyn ManagedRuntime,
    class: &str,
    tag: &str,
    descriptor: &str,
) -> BridgeResult<CallDescriptor> {
    let member = format!("{}{}", CONSTRUCTOR, descriptor);
    let signature = parse_signature(class, &member, descriptor)?;
    if signature.ret != ValueType::Void {
        return Err(BridgeError::binding(class, &member, "constructors must return V"));
    }
    let declared = runtime
        .find_class(class)
        .map(|c| c.declared_method(CONSTRUCTOR, descriptor).is_some())
        .unwrap_or(false);
    if !declared {
        return Err(BridgeError::binding(
            class,
            &member,
            format!("no such constructor ({})", DESCRIPTOR_HINT),
        ));
    }
    Ok(CallDescriptor {
        tag: tag.to_string(),
        class: class.to_string(),
        name: CONSTRUCTOR.to_string(),
        descriptor: descriptor.to_string(),
        signature,
        target: TargetKind::Instance,
        dispatch: DispatchKind::Exact,
        member: MemberKind::Constructor,
    })
}

fn resolve_field(
    runtime: &dyn ManagedRuntime,
    class: &str,
    tag: &str,
    name: &str,
    type_descriptor: &str,
) -> BridgeResult<FieldAccessor> {
    let (name, is_static) = split_static(name);
    let ty = ValueType::parse(type_descriptor).map_err(|e| {
        BridgeError::binding(class, name, format!("{} ({})", e.message(), DESCRIPTOR_HINT))
    })?;
    let (declaring, index) = runtime
        .resolve_field(class, name)
        .ok_or_else(|| BridgeError::binding(class, name, "no such field"))?;
    let field = &declaring.fields[index];

    if field.ty != ty {
        return Err(BridgeError::binding(
            class,
            name,
            format!("field has type {} but is bound as {}", field.ty, ty),
        ));
    }
    if field.is_static != is_static {
        let message = if field.is_static {
            "field is static but bound without the '+' prefix"
        } else {
            "field is an instance field but bound with the '+' prefix"
        };
        return Err(BridgeError::binding(class, name, message));
    }

    let target = if is_static { TargetKind::Static } else { TargetKind::Instance };
    let accessor = |member: MemberKind, signature: MethodSignature| CallDescriptor {
        tag: tag.to_string(),
        class: class.to_string(),
        name: name.to_string(),
        descriptor: type_descriptor.to_string(),
        signature,
        target,
        dispatch: DispatchKind::Exact,
        member,
    };
    Ok(FieldAccessor {
        getter: accessor(MemberKind::FieldGet, MethodSignature::getter(&ty)),
        setter: accessor(MemberKind::FieldSet, MethodSignature::setter(&ty)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Heap, ManagedClass, ManagedValue};

    fn heap() -> Arc<Heap> {
        let heap = Heap::new();
        heap.define_class(
            ManagedClass::builder("Base")
                .method("draw", "(I)V", |_| Ok(ManagedValue::Void))
                .build()
                .unwrap(),
        )
        .unwrap();
        heap.define_class(
            ManagedClass::builder("Callee")
                .extends("Base")
                .constructor("()V", |_| Ok(ManagedValue::Void))
                .field("intField", "I")
                .static_field("staticInt", "I")
                .method("select", "()I", |_| Ok(ManagedValue::Int(1)))
                .method("select", "()D", |_| Ok(ManagedValue::Double(1.0)))
                .static_method("getStaticInt", "()I", |_| Ok(ManagedValue::Int(0)))
                .private_method("superDraw", "(I)V", |_| Ok(ManagedValue::Void))
                .build()
                .unwrap(),
        )
        .unwrap();
        heap
    }

    #[test]
    fn test_resolve_members() {
        let heap = heap();
        let cache = DescriptorCache::new();
        let binding = ClassBinding::new("Callee")
            .constructor("new", "()V")
            .method("selectInt", "select", "()I")
            .method("selectDouble", "select", "()D")
            .method("getStaticInt", "+getStaticInt", "()I")
            .method("draw", "draw", "(I)V")
            .method("superDraw", "superDraw", "(I)V")
            .exact_method("baseDraw", "Base", "draw", "(I)V")
            .field("intField", "intField", "I")
            .field("staticInt", "+staticInt", "I");
        let bound = cache.resolve(&*heap, &binding).unwrap();

        let select_int = bound.method("selectInt").unwrap();
        let select_double = bound.method("selectDouble").unwrap();
        assert_eq!(select_int.signature.ret, ValueType::Int);
        assert_eq!(select_double.signature.ret, ValueType::Double);

        let get_static = bound.method("getStaticInt").unwrap();
        assert_eq!(get_static.target, TargetKind::Static);
        assert_eq!(get_static.name, "getStaticInt");

        assert_eq!(bound.method("draw").unwrap().dispatch, DispatchKind::Virtual);
        assert_eq!(bound.method("superDraw").unwrap().dispatch, DispatchKind::Exact);
        let base_draw = bound.method("baseDraw").unwrap();
        assert_eq!(base_draw.dispatch, DispatchKind::Exact);
        assert_eq!(base_draw.class, "Base");
        assert_eq!(base_draw.site(), "Base.draw(I)V");

        let field = bound.field("staticInt").unwrap();
        assert_eq!(field.getter.signature.descriptor(), "()I");
        assert_eq!(field.setter.signature.descriptor(), "(I)V");
        assert!(field.getter.is_static());

        assert!(bound.method("missing").is_err());
    }

    #[test]
    fn test_cache_returns_same_binding() {
        let heap = heap();
        let cache = DescriptorCache::new();
        let binding = ClassBinding::new("Callee").method("selectInt", "select", "()I");
        let first = cache.resolve(&*heap, &binding).unwrap();
        let second = cache.resolve(&*heap, &binding).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().cache_hits, 1);
    }

    #[test]
    fn test_descriptor_drift_fails_fast() {
        let heap = heap();
        let cache = DescriptorCache::new();

        let cases = vec![
            ClassBinding::new("Callee").method("x", "select", "()J"),
            ClassBinding::new("Callee").method("x", "getStaticInt", "()I"),
            ClassBinding::new("Callee").method("x", "+select", "()I"),
            ClassBinding::new("Callee").method("x", "select", "(Lcore/String)I"),
            ClassBinding::new("Callee").field("x", "intField", "J"),
            ClassBinding::new("Callee").field("x", "staticInt", "I"),
            ClassBinding::new("Callee").constructor("x", "(I)V"),
            ClassBinding::new("Callee").exact_method("x", "core/String", "select", "()I"),
            ClassBinding::new("Missing").method("x", "select", "()I"),
        ];
        for binding in cases {
            let err = cache.resolve(&*heap, &binding).unwrap_err();
            assert!(err.is_fatal(), "expected binding error, got {:?}", err);
        }
        assert_eq!(cache.stats().failures, 9);
        assert_eq!(cache.stats().bound_classes, 0);
    }

    #[test]
    fn test_hint_mentions_prefix() {
        let heap = heap();
        let cache = DescriptorCache::new();
        let err = cache
            .resolve(&*heap, &ClassBinding::new("Callee").method("x", "nothing", "()V"))
            .unwrap_err();
        assert!(err.message().contains("'+'"));
    }
}
