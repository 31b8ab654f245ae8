//! 托管到原生的入口与 super 跳板
//!
//! 活类的 native 方法在绑定时注册为闭包，每次调用依次执行：
//! resolve、参数编组、类型化回调、结果编组，整体包在异常桥里。
//!
//! 覆写方法通过 super 选择器回到托管默认实现。选择器总是精确分派，
//! 不会再次进入原生覆写；线程局部的记录在 super 调用期间拦截对同一
//! (代理, 方法) 的重入。

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use super::bridge::{Bridge, BridgeInner};
use super::descriptor::{BoundClass, ClassBinding, DispatchKind};
use super::handle_registry::NativeObject;
use super::type_converter::NativeValue;
use crate::core::error::{BridgeError, BridgeResult};
use crate::core::types::{MethodSignature, ValueType, STRING_CLASS};
use crate::runtime::{GlobalRef, Invocation, ManagedRuntime, ManagedValue, NativeMethod, ObjectId, Throwable};

thread_local! {
    /// 正在执行 super 调用的 (代理, 方法)
    static SUPER_CALLS: RefCell<Vec<(ObjectId, String)>> = RefCell::new(Vec::new());
}

/// 实例回调
pub type InstanceCallback<T> =
    Arc<dyn Fn(&T, &CallContext<'_>, &[NativeValue]) -> BridgeResult<NativeValue> + Send + Sync>;

/// 静态回调
pub type StaticCallback = Arc<dyn Fn(&CallContext<'_>, &[NativeValue]) -> BridgeResult<NativeValue> + Send + Sync>;

/// super 选择器
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuperSelector {
    /// 在指定祖先类上精确调用同名同签名方法
    Exact { class: String },
    /// 调用代理类上另一个不可覆写的入口，例如 `superOnDraw`
    Method { name: String },
}

impl SuperSelector {
    pub fn exact(class: impl Into<String>) -> Self {
        SuperSelector::Exact { class: class.into() }
    }

    pub fn method(name: impl Into<String>) -> Self {
        SuperSelector::Method { name: name.into() }
    }
}

/// 覆写点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideSite {
    /// 被覆写方法的 `name + descriptor`
    pub method: String,
    /// super 描述符的标签
    pub super_tag: String,
}

enum NativeEntry<T> {
    Callback {
        name: String,
        descriptor: String,
        callback: InstanceCallback<T>,
    },
    Static {
        name: String,
        descriptor: String,
        callback: StaticCallback,
    },
    Constructor {
        name: String,
        descriptor: String,
    },
    Override {
        name: String,
        descriptor: String,
        super_tag: String,
        handler: Option<InstanceCallback<T>>,
    },
}

impl<T> NativeEntry<T> {
    fn name_and_descriptor(&self) -> (&str, &str) {
        match self {
            NativeEntry::Callback { name, descriptor, .. }
            | NativeEntry::Static { name, descriptor, .. }
            | NativeEntry::Constructor { name, descriptor }
            | NativeEntry::Override { name, descriptor, .. } => (name, descriptor),
        }
    }

    fn is_static(&self) -> bool {
        matches!(self, NativeEntry::Static { .. })
    }
}

/// 活类绑定：原生类型 `T` 与托管代理类
///
/// 除 native 入口外，还可以像 [`ClassBinding`] 一样声明原生代码要调用的托管成员
pub struct LiveClassBinding<T: NativeObject> {
    wrapper: ClassBinding,
    entries: Vec<NativeEntry<T>>,
    super_tags: Vec<String>,
}

impl<T: NativeObject> LiveClassBinding<T> {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            wrapper: ClassBinding::new(class),
            entries: Vec::new(),
            super_tags: Vec::new(),
        }
    }

    pub fn class_name(&self) -> &str {
        self.wrapper.class_name()
    }

    /// 实例 native 方法
    pub fn callback<F>(mut self, name: &str, descriptor: &str, callback: F) -> Self
    where
        F: Fn(&T, &CallContext<'_>, &[NativeValue]) -> BridgeResult<NativeValue> + Send + Sync + 'static,
    {
        self.entries.push(NativeEntry::Callback {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            callback: Arc::new(callback),
        });
        self
    }

    /// 静态 native 方法
    pub fn static_callback<F>(mut self, name: &str, descriptor: &str, callback: F) -> Self
    where
        F: Fn(&CallContext<'_>, &[NativeValue]) -> BridgeResult<NativeValue> + Send + Sync + 'static,
    {
        self.entries.push(NativeEntry::Static {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            callback: Arc::new(callback),
        });
        self
    }

    /// 构造入口：第一个参数是原生标签，其余参数交给工厂
    pub fn constructor_callback(mut self, name: &str, descriptor: &str) -> Self {
        self.entries.push(NativeEntry::Constructor {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        });
        self
    }

    /// 原生覆写，处理函数可以通过 [`CallContext::call_super`] 回到默认实现
    pub fn override_method<F>(self, name: &str, descriptor: &str, selector: SuperSelector, handler: F) -> Self
    where
        F: Fn(&T, &CallContext<'_>, &[NativeValue]) -> BridgeResult<NativeValue> + Send + Sync + 'static,
    {
        self.push_override(name, descriptor, selector, Some(Arc::new(handler)))
    }

    /// 没有原生处理函数的覆写，直接调用 super
    pub fn default_override(self, name: &str, descriptor: &str, selector: SuperSelector) -> Self {
        self.push_override(name, descriptor, selector, None)
    }

    pub fn method(mut self, tag: &str, name: &str, descriptor: &str) -> Self {
        self.wrapper = self.wrapper.method(tag, name, descriptor);
        self
    }

    pub fn exact_method(mut self, tag: &str, class: &str, name: &str, descriptor: &str) -> Self {
        self.wrapper = self.wrapper.exact_method(tag, class, name, descriptor);
        self
    }

    pub fn constructor(mut self, tag: &str, descriptor: &str) -> Self {
        self.wrapper = self.wrapper.constructor(tag, descriptor);
        self
    }

    pub fn field(mut self, tag: &str, name: &str, type_descriptor: &str) -> Self {
        self.wrapper = self.wrapper.field(tag, name, type_descriptor);
        self
    }

    fn push_override(
        mut self,
        name: &str,
        descriptor: &str,
        selector: SuperSelector,
        handler: Option<InstanceCallback<T>>,
    ) -> Self {
        let super_tag = format!("super:{}{}", name, descriptor);
        self.wrapper = match selector {
            SuperSelector::Exact { class } => self.wrapper.exact_method(&super_tag, &class, name, descriptor),
            SuperSelector::Method { name: entry } => self.wrapper.method(&super_tag, &entry, descriptor),
        };
        self.super_tags.push(super_tag.clone());
        self.entries.push(NativeEntry::Override {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            super_tag,
            handler,
        });
        self
    }
}

/// 回调执行上下文
pub struct CallContext<'a> {
    bridge: &'a Bridge,
    class: &'a BoundClass,
    this: Option<&'a GlobalRef>,
    site: Option<&'a OverrideSite>,
}

impl<'a> CallContext<'a> {
    pub fn new(
        bridge: &'a Bridge,
        class: &'a BoundClass,
        this: Option<&'a GlobalRef>,
        site: Option<&'a OverrideSite>,
    ) -> Self {
        Self {
            bridge,
            class,
            this,
            site,
        }
    }

    pub fn bridge(&self) -> &'a Bridge {
        self.bridge
    }

    pub fn class(&self) -> &'a BoundClass {
        self.class
    }

    /// 当前代理
    pub fn this(&self) -> BridgeResult<&'a GlobalRef> {
        self.this
            .ok_or_else(|| BridgeError::argument(format!("{}: no receiver in a static callback", self.class.class)))
    }

    pub fn site(&self) -> Option<&'a OverrideSite> {
        self.site
    }

    /// 在当前代理上调用绑定的方法
    pub fn call_this(&self, tag: &str, args: &[NativeValue]) -> BridgeResult<NativeValue> {
        self.bridge.call(self.class, tag, Some(self.this()?), args)
    }

    pub fn call_static(&self, tag: &str, args: &[NativeValue]) -> BridgeResult<NativeValue> {
        self.bridge.call_static(self.class, tag, args)
    }

    pub fn get_this_field(&self, tag: &str) -> BridgeResult<NativeValue> {
        self.bridge.get_field(self.class, tag, self.this()?)
    }

    pub fn set_this_field(&self, tag: &str, value: NativeValue) -> BridgeResult<()> {
        self.bridge.set_field(self.class, tag, self.this()?, value)
    }

    /// 调用被覆写方法的默认实现
    pub fn call_super(&self, args: &[NativeValue]) -> BridgeResult<NativeValue> {
        let site = self
            .site
            .ok_or_else(|| BridgeError::binding(&self.class.class, "<super>", "call_super used outside an override"))?;
        let this = self.this()?;
        let _scope = SuperScope::enter(this.id(), &site.method);
        self.bridge.call(self.class, &site.super_tag, Some(this), args)
    }
}

/// super 调用期间的线程局部记录
struct SuperScope {
    key: (ObjectId, String),
}

impl SuperScope {
    fn enter(proxy: ObjectId, method: &str) -> Self {
        let key = (proxy, method.to_string());
        let _ = SUPER_CALLS.try_with(|calls| calls.borrow_mut().push(key.clone()));
        Self { key }
    }

    fn is_active(proxy: ObjectId, method: &str) -> bool {
        SUPER_CALLS
            .try_with(|calls| calls.borrow().iter().any(|(p, m)| *p == proxy && m == method))
            .unwrap_or(false)
    }
}

impl Drop for SuperScope {
    fn drop(&mut self) {
        let _ = SUPER_CALLS.try_with(|calls| {
            let mut calls = calls.borrow_mut();
            if let Some(position) = calls.iter().rposition(|k| *k == self.key) {
                calls.remove(position);
            }
        });
    }
}

/// 校验并注册活类的全部 native 入口
///
/// 先校验所有入口再注册，任何一项不符都不会安装绑定
pub(crate) fn install<T: NativeObject>(
    bridge: &Bridge,
    binding: LiveClassBinding<T>,
) -> BridgeResult<Arc<BoundClass>> {
    let runtime = Arc::clone(bridge.runtime());
    let bound = bridge.bind_wrapper(&binding.wrapper)?;
    let class_name = bound.class.clone();

    for tag in &binding.super_tags {
        let descriptor = bound.method(tag)?;
        if descriptor.dispatch != DispatchKind::Exact {
            return Err(fail(BridgeError::binding(
                &class_name,
                tag,
                format!(
                    "super selector {}{} is virtual and would re-enter the override",
                    descriptor.name, descriptor.descriptor
                ),
            )));
        }
    }

    let class = runtime
        .find_class(&class_name)
        .ok_or_else(|| fail(BridgeError::binding(&class_name, "<class>", "class is not defined")))?;
    let mut signatures = Vec::with_capacity(binding.entries.len());
    for entry in &binding.entries {
        let (name, descriptor) = entry.name_and_descriptor();
        let member = format!("{}{}", name, descriptor);
        let method = class.declared_method(name, descriptor).ok_or_else(|| {
            fail(BridgeError::binding(&class_name, &member, "no native method declared with this descriptor"))
        })?;
        if !method.is_native() {
            return Err(fail(BridgeError::binding(&class_name, &member, "method is not declared native")));
        }
        if method.is_static != entry.is_static() {
            return Err(fail(BridgeError::binding(
                &class_name,
                &member,
                "callback kind does not match the declared staticness",
            )));
        }
        if let NativeEntry::Constructor { .. } = entry {
            let takes_tag = method.signature.params.first() == Some(&ValueType::object(STRING_CLASS));
            if !takes_tag || method.signature.ret != ValueType::Void {
                return Err(fail(BridgeError::binding(
                    &class_name,
                    &member,
                    "construct entries must take the native tag as Lcore/String; and return V",
                )));
            }
        }
        signatures.push(method.signature.clone());
    }

    let mut natives = Vec::with_capacity(signatures.len() + 1);
    for (entry, signature) in binding.entries.into_iter().zip(signatures) {
        let (name, descriptor) = entry.name_and_descriptor();
        let (name, descriptor) = (name.to_string(), descriptor.to_string());
        let site = format!("{}.{}{}", class_name, name, descriptor);
        let native = entry_closure(bridge.downgrade(), Arc::clone(&bound), entry, signature, site);
        natives.push((name, descriptor, native));
    }
    if let Some(finalizer) = finalizer_entry(bridge, &runtime, &bound) {
        natives.push(("finalize".to_string(), "()V".to_string(), finalizer));
    }

    // register_native 只在类缺失或方法未声明 native 时失败，上面已按同一个类定义校验，
    // 类定义之后不再变化，所以这里不会注册到一半
    for (name, descriptor, native) in natives {
        runtime
            .register_native(&class_name, &name, &descriptor, native)
            .map_err(|thrown| fail(BridgeError::binding(&class_name, format!("{}{}", name, descriptor), thrown.message)))?;
    }
    tracing::info!("Bound live class {} to {}", class_name, std::any::type_name::<T>());
    Ok(bound)
}

fn fail(error: BridgeError) -> BridgeError {
    tracing::error!("{}", error);
    error
}

/// 代理类声明了 native `finalize()V` 时，构造生命周期 finalize 加父类终结器
fn finalizer_entry(bridge: &Bridge, runtime: &Arc<dyn ManagedRuntime>, bound: &Arc<BoundClass>) -> Option<NativeMethod> {
    let class_name = bound.class.clone();
    let declares_finalizer = runtime
        .find_class(&class_name)
        .and_then(|c| c.declared_method("finalize", "()V").map(|m| m.is_native()))
        .unwrap_or(false);
    if !declares_finalizer {
        tracing::warn!(
            "{} declares no native finalize()V; its instances are only released explicitly",
            class_name
        );
        return None;
    }

    let weak = bridge.downgrade();
    let site = format!("{}.finalize()V", class_name);
    let owner = class_name.clone();
    let finalizer: NativeMethod = Arc::new(move |this: Option<&GlobalRef>, _args: &[ManagedValue]| {
        let bridge = upgrade(&weak)?;
        let this = this.ok_or_else(|| Throwable::null_pointer("finalize called without receiver"))?;
        bridge.exceptions().guard(&site, || {
            bridge.lifecycle().finalize(&bridge, this);
            Ok(())
        })?;

        // 原生销毁之后再执行父类终结器
        let runtime = bridge.runtime();
        if let Some(parent) = runtime.superclass_of(&owner) {
            if runtime.resolve_method(&parent, "finalize", "()V").is_some() {
                return runtime.invoke(&parent, "finalize", "()V", Invocation::Exact(this), &[]);
            }
        }
        Ok(ManagedValue::Void)
    });
    Some(finalizer)
}

fn upgrade(weak: &Weak<BridgeInner>) -> Result<Bridge, Throwable> {
    weak.upgrade()
        .map(Bridge::from_inner)
        .ok_or_else(|| Throwable::illegal_state("bridge has been shut down"))
}

fn entry_closure<T: NativeObject>(
    weak: Weak<BridgeInner>,
    class: Arc<BoundClass>,
    entry: NativeEntry<T>,
    signature: MethodSignature,
    site: String,
) -> NativeMethod {
    match entry {
        NativeEntry::Callback { callback, .. } => Arc::new(move |this: Option<&GlobalRef>, args: &[ManagedValue]| {
            let bridge = upgrade(&weak)?;
            bridge.exceptions().guard(&site, || {
                let this = this.ok_or_else(|| BridgeError::argument("instance callback invoked without receiver"))?;
                let resolved = bridge.resolve(this)?;
                let instance = downcast::<T>(&resolved, &class.class)?;
                let native_args = bridge.marshal_to_native(&signature.params, args)?;
                let ctx = CallContext::new(&bridge, &class, Some(this), None);
                let result = callback(instance, &ctx, &native_args)?;
                bridge.marshal_result(&result, &signature.ret)
            })
        }),
        NativeEntry::Static { callback, .. } => Arc::new(move |_this: Option<&GlobalRef>, args: &[ManagedValue]| {
            let bridge = upgrade(&weak)?;
            bridge.exceptions().guard(&site, || {
                let native_args = bridge.marshal_to_native(&signature.params, args)?;
                let ctx = CallContext::new(&bridge, &class, None, None);
                let result = callback(&ctx, &native_args)?;
                bridge.marshal_result(&result, &signature.ret)
            })
        }),
        NativeEntry::Constructor { .. } => Arc::new(move |this: Option<&GlobalRef>, args: &[ManagedValue]| {
            let bridge = upgrade(&weak)?;
            bridge.exceptions().guard(&site, || {
                let this = this.ok_or_else(|| BridgeError::argument("construct invoked without receiver"))?;
                let native_args = bridge.marshal_to_native(&signature.params, args)?;
                let tag = match native_args.first() {
                    Some(value) => bridge.string_value(value)?.unwrap_or_default(),
                    None => String::new(),
                };
                bridge.construct(this, &tag, native_args.get(1..).unwrap_or(&[]))?;
                Ok(ManagedValue::Void)
            })
        }),
        NativeEntry::Override {
            name,
            descriptor,
            super_tag,
            handler,
        } => {
            let override_site = OverrideSite {
                method: format!("{}{}", name, descriptor),
                super_tag,
            };
            Arc::new(move |this: Option<&GlobalRef>, args: &[ManagedValue]| {
                let bridge = upgrade(&weak)?;
                bridge.exceptions().guard(&site, || {
                    let this = this.ok_or_else(|| BridgeError::argument("override invoked without receiver"))?;
                    if SuperScope::is_active(this.id(), &override_site.method) {
                        return Err(BridgeError::binding(
                            &class.class,
                            &override_site.method,
                            "super selector re-entered the override",
                        ));
                    }
                    let resolved = bridge.resolve(this)?;
                    let native_args = bridge.marshal_to_native(&signature.params, args)?;
                    let ctx = CallContext::new(&bridge, &class, Some(this), Some(&override_site));
                    let result = match &handler {
                        Some(handler) => handler(downcast::<T>(&resolved, &class.class)?, &ctx, &native_args)?,
                        None => ctx.call_super(&native_args)?,
                    };
                    bridge.marshal_result(&result, &signature.ret)
                })
            })
        }
    }
}

fn downcast<'r, T: NativeObject>(resolved: &'r super::handle_registry::Resolved<'_>, class: &str) -> BridgeResult<&'r T> {
    resolved.downcast::<T>().ok_or_else(|| {
        BridgeError::binding(
            class,
            "<instance>",
            format!(
                "handle {} holds a {} instance, not {}",
                resolved.handle(),
                resolved.class_name(),
                std::any::type_name::<T>()
            ),
        )
    })
}
