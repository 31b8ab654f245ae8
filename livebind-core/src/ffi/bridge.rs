//! 绑定桥
//!
//! [`Bridge`] 把句柄注册表、描述符缓存、类型转换、异常桥和生命周期控制
//! 组合在同一个运行时之上，是原生代码调用托管代码的唯一入口。
//! 克隆开销很小，所有克隆共享同一份状态。

use serde::{Deserialize, Serialize};
use std::any::{type_name, TypeId};
use std::sync::{Arc, Weak};

use super::descriptor::{BoundClass, CallDescriptor, ClassBinding, DescriptorCache, DescriptorStats, MemberKind};
use super::exception_handler::{ExceptionBridge, ExceptionStats};
use super::handle_registry::{Handle, HandleRegistry, NativeObject, RegistryStats, Resolved};
use super::lifecycle::{LifecycleController, LifecycleState, LifecycleStats};
use super::trampoline::{self, LiveClassBinding};
use super::type_converter::{ConversionStats, NativeArray, NativeValue, TypeConverter};
use crate::config::BridgeSettings;
use crate::core::error::{BridgeError, BridgeResult};
use crate::core::types::ValueType;
use crate::runtime::{classes, GlobalRef, Invocation, ManagedRuntime, ManagedValue, Throwable};

/// 桥的聚合统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeStats {
    pub registry: RegistryStats,
    pub descriptors: DescriptorStats,
    pub conversions: ConversionStats,
    pub exceptions: ExceptionStats,
    pub lifecycle: LifecycleStats,
}

pub(crate) struct BridgeInner {
    runtime: Arc<dyn ManagedRuntime>,
    registry: HandleRegistry,
    descriptors: DescriptorCache,
    converter: TypeConverter,
    exceptions: ExceptionBridge,
    lifecycle: LifecycleController,
    settings: BridgeSettings,
}

/// 原生与托管之间的绑定桥
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    pub fn new(runtime: Arc<dyn ManagedRuntime>, settings: BridgeSettings) -> Self {
        tracing::info!(
            "Creating bridge (exception_history={}, catch_native_panics={})",
            settings.exception_history,
            settings.catch_native_panics
        );
        Self {
            inner: Arc::new(BridgeInner {
                registry: HandleRegistry::new(Arc::clone(&runtime)),
                descriptors: DescriptorCache::new(),
                converter: TypeConverter::new(),
                exceptions: ExceptionBridge::new(&settings),
                lifecycle: LifecycleController::new(),
                runtime,
                settings,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<BridgeInner>) -> Self {
        Self { inner }
    }

    /// 注册到运行时里的闭包只持有弱引用，避免桥与运行时互相持有
    pub(crate) fn downgrade(&self) -> Weak<BridgeInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn runtime(&self) -> &Arc<dyn ManagedRuntime> {
        &self.inner.runtime
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.inner.registry
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.inner.lifecycle
    }

    pub fn exceptions(&self) -> &ExceptionBridge {
        &self.inner.exceptions
    }

    pub fn converter(&self) -> &TypeConverter {
        &self.inner.converter
    }

    pub fn descriptors(&self) -> &DescriptorCache {
        &self.inner.descriptors
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.inner.settings
    }

    // ---- 绑定 ----

    /// 解析只供原生调用的包装绑定
    pub fn bind_wrapper(&self, binding: &ClassBinding) -> BridgeResult<Arc<BoundClass>> {
        self.inner.descriptors.resolve(self.runtime().as_ref(), binding)
    }

    /// 安装活类：校验并注册 native 入口，登记原生类型
    pub fn bind_live<T: NativeObject>(&self, binding: LiveClassBinding<T>) -> BridgeResult<Arc<BoundClass>> {
        let class_name = binding.class_name().to_string();
        let bound = trampoline::install(self, binding)?;
        self.inner.converter.register_live_class(&class_name);
        self.inner.lifecycle.register_class_type::<T>(&class_name);
        Ok(bound)
    }

    // ---- 原生 -> 托管 ----

    /// 调用绑定的方法；`target` 为实例方法的接收者
    pub fn call(
        &self,
        class: &BoundClass,
        tag: &str,
        target: Option<&GlobalRef>,
        args: &[NativeValue],
    ) -> BridgeResult<NativeValue> {
        let descriptor = class.method(tag)?;
        if descriptor.member == MemberKind::Constructor {
            return Err(BridgeError::argument(format!(
                "{} is a constructor; use new_object",
                descriptor.site()
            )));
        }
        self.dispatch(descriptor, target, args)
    }

    pub fn call_static(&self, class: &BoundClass, tag: &str, args: &[NativeValue]) -> BridgeResult<NativeValue> {
        self.call(class, tag, None, args)
    }

    /// 分配对象并执行绑定的构造器
    pub fn new_object(&self, class: &BoundClass, ctor_tag: &str, args: &[NativeValue]) -> BridgeResult<GlobalRef> {
        let descriptor = class.method(ctor_tag)?;
        if descriptor.member != MemberKind::Constructor {
            return Err(BridgeError::argument(format!("{} is not a constructor", descriptor.site())));
        }
        let site = descriptor.site();
        let object = self
            .runtime()
            .allocate(&descriptor.class)
            .map_err(|thrown| self.inner.exceptions.from_managed(thrown, &site))?;
        self.dispatch(descriptor, Some(&object), args)?;
        Ok(object)
    }

    /// 原生先创建实例，再构造托管代理并绑定
    pub fn new_live<T: NativeObject>(
        &self,
        class: &BoundClass,
        ctor_tag: &str,
        args: &[NativeValue],
        instance: T,
    ) -> BridgeResult<GlobalRef> {
        let proxy = self.new_object(class, ctor_tag, args)?;
        self.attach_native(&proxy, instance)?;
        Ok(proxy)
    }

    pub fn get_field(&self, class: &BoundClass, tag: &str, target: &GlobalRef) -> BridgeResult<NativeValue> {
        self.read_field(class, tag, Some(target))
    }

    pub fn set_field(&self, class: &BoundClass, tag: &str, target: &GlobalRef, value: NativeValue) -> BridgeResult<()> {
        self.write_field(class, tag, Some(target), value)
    }

    pub fn get_static_field(&self, class: &BoundClass, tag: &str) -> BridgeResult<NativeValue> {
        self.read_field(class, tag, None)
    }

    pub fn set_static_field(&self, class: &BoundClass, tag: &str, value: NativeValue) -> BridgeResult<()> {
        self.write_field(class, tag, None, value)
    }

    // ---- 实例 ----

    /// 按标签构造原生实例并绑定到代理
    pub fn construct(&self, proxy: &GlobalRef, tag: &str, args: &[NativeValue]) -> BridgeResult<Handle> {
        self.inner.lifecycle.construct(self, proxy, tag, args)
    }

    /// 绑定已构造好的原生实例
    pub fn attach_native<T: NativeObject>(&self, proxy: &GlobalRef, instance: T) -> BridgeResult<Handle> {
        self.inner.lifecycle.attach_instance(
            self,
            proxy,
            Arc::new(instance),
            (TypeId::of::<T>(), type_name::<T>()),
        )
    }

    pub fn resolve(&self, proxy: &GlobalRef) -> BridgeResult<Resolved<'_>> {
        self.inner.registry.resolve(proxy.id())
    }

    /// 在解析期间以具体类型访问原生实例
    pub fn with_instance<T, R, F>(&self, proxy: &GlobalRef, f: F) -> BridgeResult<R>
    where
        T: NativeObject,
        F: FnOnce(&T) -> BridgeResult<R>,
    {
        let resolved = self.resolve(proxy)?;
        let instance = resolved.downcast::<T>().ok_or_else(|| {
            BridgeError::binding(
                resolved.class_name(),
                "<instance>",
                format!("native instance is not a {}", type_name::<T>()),
            )
        })?;
        f(instance)
    }

    pub fn release(&self, proxy: &GlobalRef) -> bool {
        self.inner.lifecycle.release(self, proxy)
    }

    pub fn state(&self, proxy: &GlobalRef) -> LifecycleState {
        self.inner.lifecycle.state(self, proxy)
    }

    /// 销毁所有仍存活的实例，返回销毁数量
    pub fn shutdown(&self) -> usize {
        let released = self.inner.registry.detach_all();
        tracing::info!("Bridge shutdown released {} native instances", released);
        released
    }

    // ---- 引用与字符串 ----

    pub fn is_instance_of(&self, object: &GlobalRef, class: &str) -> bool {
        self.runtime().is_instance_of(object, class)
    }

    /// 检查后的向下转换，失败时是类转换异常
    pub fn cast(&self, object: &GlobalRef, class: &str) -> BridgeResult<GlobalRef> {
        if self.is_instance_of(object, class) {
            return Ok(object.clone());
        }
        let thrown = Throwable::new(classes::CLASS_CAST, class);
        Err(self.inner.exceptions.from_managed(thrown, &format!("cast {} to {}", object.id(), class)))
    }

    pub fn new_string(&self, value: &str) -> BridgeResult<NativeValue> {
        let object = self
            .runtime()
            .new_string(value)
            .map_err(|thrown| self.inner.exceptions.from_managed(thrown, "new_string"))?;
        Ok(NativeValue::object(&object))
    }

    /// 读取字符串；空引用为 `None`
    pub fn string_value(&self, value: &NativeValue) -> BridgeResult<Option<String>> {
        match value {
            NativeValue::Object(None) => Ok(None),
            NativeValue::Object(Some(reference)) => self
                .runtime()
                .string_value(reference.object())
                .map(Some)
                .ok_or_else(|| BridgeError::argument(format!("object {} is not a string", reference.object().id()))),
            other => Err(BridgeError::argument(format!("expected a string, got {}", other.kind_name()))),
        }
    }

    /// 新建托管数组
    pub fn new_array(&self, array: &NativeArray) -> BridgeResult<GlobalRef> {
        let ty = ValueType::array_of(array.element().clone());
        match self.inner.converter.to_managed(self.runtime().as_ref(), &NativeValue::from(array.clone()), &ty)? {
            ManagedValue::Ref(Some(object)) => Ok(object),
            _ => Err(BridgeError::argument("array conversion produced no object")),
        }
    }

    /// 把原生数组写回已有的托管数组
    pub fn write_array(&self, array: &GlobalRef, source: &NativeArray) -> BridgeResult<()> {
        self.inner
            .converter
            .write_managed_array(self.runtime().as_ref(), array, source)
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            registry: self.inner.registry.stats(),
            descriptors: self.inner.descriptors.stats(),
            conversions: self.inner.converter.stats(),
            exceptions: self.inner.exceptions.stats(),
            lifecycle: self.inner.lifecycle.stats(),
        }
    }

    // ---- 内部 ----

    fn dispatch(
        &self,
        descriptor: &CallDescriptor,
        target: Option<&GlobalRef>,
        args: &[NativeValue],
    ) -> BridgeResult<NativeValue> {
        let site = descriptor.site();
        let signature = &descriptor.signature;
        if args.len() != signature.arity() {
            return Err(BridgeError::argument(format!(
                "{} expects {} arguments, got {}",
                site,
                signature.arity(),
                args.len()
            )));
        }
        let invocation = match (descriptor.is_static(), target) {
            (true, None) => Invocation::Static,
            (false, Some(object)) => match descriptor.dispatch {
                super::descriptor::DispatchKind::Virtual => Invocation::Virtual(object),
                super::descriptor::DispatchKind::Exact => Invocation::Exact(object),
            },
            (true, Some(_)) => {
                return Err(BridgeError::argument(format!("{} is static and takes no target", site)))
            }
            (false, None) => return Err(BridgeError::argument(format!("{} needs a target object", site))),
        };

        let runtime = self.runtime().as_ref();
        let managed_args = signature
            .params
            .iter()
            .zip(args)
            .map(|(ty, value)| self.inner.converter.to_managed(runtime, value, ty))
            .collect::<BridgeResult<Vec<_>>>()?;

        tracing::debug!("Dispatching {}", site);
        let result = runtime
            .invoke(&descriptor.class, &descriptor.name, &descriptor.descriptor, invocation, &managed_args)
            .map_err(|thrown| self.inner.exceptions.from_managed(thrown, &site))?;
        self.inner.converter.to_native(runtime, &result, &signature.ret)
    }

    fn read_field(&self, class: &BoundClass, tag: &str, target: Option<&GlobalRef>) -> BridgeResult<NativeValue> {
        let accessor = class.field(tag)?;
        let getter = &accessor.getter;
        check_field_target(getter, target)?;
        let runtime = self.runtime().as_ref();
        let value = runtime
            .get_field(&getter.class, &getter.name, target)
            .map_err(|thrown| self.inner.exceptions.from_managed(thrown, &getter.site()))?;
        self.inner.converter.to_native(runtime, &value, accessor.value_type())
    }

    fn write_field(
        &self,
        class: &BoundClass,
        tag: &str,
        target: Option<&GlobalRef>,
        value: NativeValue,
    ) -> BridgeResult<()> {
        let accessor = class.field(tag)?;
        let setter = &accessor.setter;
        check_field_target(setter, target)?;
        let runtime = self.runtime().as_ref();
        let managed = self.inner.converter.to_managed(runtime, &value, accessor.value_type())?;
        runtime
            .set_field(&setter.class, &setter.name, target, managed)
            .map_err(|thrown| self.inner.exceptions.from_managed(thrown, &setter.site()))
    }

    /// 托管参数 -> 原生参数，供 native 入口使用
    pub(crate) fn marshal_to_native(&self, params: &[ValueType], args: &[ManagedValue]) -> BridgeResult<Vec<NativeValue>> {
        if params.len() != args.len() {
            return Err(BridgeError::argument(format!(
                "expected {} arguments, got {}",
                params.len(),
                args.len()
            )));
        }
        let runtime = self.runtime().as_ref();
        params
            .iter()
            .zip(args)
            .map(|(ty, value)| self.inner.converter.to_native(runtime, value, ty))
            .collect()
    }

    pub(crate) fn marshal_result(&self, value: &NativeValue, ret: &ValueType) -> BridgeResult<ManagedValue> {
        self.inner.converter.to_managed(self.runtime().as_ref(), value, ret)
    }
}

fn check_field_target(descriptor: &CallDescriptor, target: Option<&GlobalRef>) -> BridgeResult<()> {
    match (descriptor.is_static(), target.is_some()) {
        (true, true) => Err(BridgeError::argument(format!(
            "{} is a static field and takes no target",
            descriptor.site()
        ))),
        (false, false) => Err(BridgeError::argument(format!("{} needs a target object", descriptor.site()))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Heap, ManagedClass};

    fn setup() -> (Arc<Heap>, Bridge, Arc<BoundClass>) {
        let heap = Heap::new();
        heap.define_class(
            ManagedClass::builder("Point")
                .field("x", "I")
                .static_field("origin", "Lcore/String;")
                .constructor("(I)V", |call| {
                    call.set_field("x", ManagedValue::Int(call.int_arg(0)?))?;
                    Ok(ManagedValue::Void)
                })
                .method("scaled", "(I)I", |call| {
                    Ok(ManagedValue::Int(call.field("x")?.as_int().unwrap_or(0) * call.int_arg(0)?))
                })
                .method("scaled", "(D)D", |call| {
                    let x = call.field("x")?.as_int().unwrap_or(0) as f64;
                    Ok(ManagedValue::Double(x * call.arg(0)?.as_double().unwrap_or(0.0)))
                })
                .method("fail", "()V", |_| Err(Throwable::illegal_state("point is frozen")))
                .static_method("describe", "(I)Lcore/String;", |call| {
                    call.new_string(&format!("point {}", call.int_arg(0)?))
                })
                .build()
                .unwrap(),
        )
        .unwrap();
        let bridge = Bridge::new(heap.runtime().unwrap(), BridgeSettings::default());
        let bound = bridge
            .bind_wrapper(
                &ClassBinding::new("Point")
                    .constructor("new", "(I)V")
                    .method("scaledInt", "scaled", "(I)I")
                    .method("scaledDouble", "scaled", "(D)D")
                    .method("fail", "fail", "()V")
                    .method("describe", "+describe", "(I)Lcore/String;")
                    .field("x", "x", "I")
                    .field("origin", "+origin", "Lcore/String;"),
            )
            .unwrap();
        (heap, bridge, bound)
    }

    #[test]
    fn test_calls_route_by_descriptor() {
        let (_heap, bridge, point) = setup();
        let p = bridge.new_object(&point, "new", &[NativeValue::Int(3)]).unwrap();

        let int = bridge.call(&point, "scaledInt", Some(&p), &[NativeValue::Int(2)]).unwrap();
        assert_eq!(int, NativeValue::Int(6));
        let double = bridge.call(&point, "scaledDouble", Some(&p), &[NativeValue::Double(0.5)]).unwrap();
        assert_eq!(double, NativeValue::Double(1.5));

        let text = bridge.call_static(&point, "describe", &[NativeValue::Int(7)]).unwrap();
        assert_eq!(bridge.string_value(&text).unwrap().as_deref(), Some("point 7"));
    }

    #[test]
    fn test_fields() {
        let (_heap, bridge, point) = setup();
        let p = bridge.new_object(&point, "new", &[NativeValue::Int(1)]).unwrap();

        bridge.set_field(&point, "x", &p, NativeValue::Int(9)).unwrap();
        assert_eq!(bridge.get_field(&point, "x", &p).unwrap(), NativeValue::Int(9));

        assert!(bridge.get_static_field(&point, "origin").unwrap().is_null());
        let origin = bridge.new_string("zero").unwrap();
        bridge.set_static_field(&point, "origin", origin).unwrap();
        let origin = bridge.get_static_field(&point, "origin").unwrap();
        assert_eq!(bridge.string_value(&origin).unwrap().as_deref(), Some("zero"));
    }

    #[test]
    fn test_argument_checks() {
        let (_heap, bridge, point) = setup();
        let p = bridge.new_object(&point, "new", &[NativeValue::Int(1)]).unwrap();

        let err = bridge.call(&point, "scaledInt", Some(&p), &[]).unwrap_err();
        assert!(matches!(err, BridgeError::Argument { .. }));
        let err = bridge.call(&point, "scaledInt", None, &[NativeValue::Int(1)]).unwrap_err();
        assert!(matches!(err, BridgeError::Argument { .. }));
        let err = bridge.call(&point, "describe", Some(&p), &[NativeValue::Int(1)]).unwrap_err();
        assert!(matches!(err, BridgeError::Argument { .. }));
        let err = bridge.call(&point, "new", Some(&p), &[NativeValue::Int(1)]).unwrap_err();
        assert!(matches!(err, BridgeError::Argument { .. }));
        assert!(bridge.get_static_field(&point, "x").is_err());
    }

    #[test]
    fn test_managed_throw_becomes_crossing() {
        let (_heap, bridge, point) = setup();
        let p = bridge.new_object(&point, "new", &[NativeValue::Int(1)]).unwrap();

        match bridge.call(&point, "fail", Some(&p), &[]).unwrap_err() {
            BridgeError::Crossing(record) => {
                assert_eq!(record.class_name.as_deref(), Some(classes::ILLEGAL_STATE));
                assert_eq!(record.message, "point is frozen");
                assert_eq!(record.site, "Point.fail()V");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(bridge.stats().exceptions.managed_to_native, 1);
    }

    #[test]
    fn test_cast() {
        let (_heap, bridge, point) = setup();
        let p = bridge.new_object(&point, "new", &[NativeValue::Int(1)]).unwrap();

        assert!(bridge.is_instance_of(&p, crate::core::types::OBJECT_CLASS));
        assert!(bridge.cast(&p, "Point").is_ok());
        match bridge.cast(&p, crate::core::types::STRING_CLASS).unwrap_err() {
            BridgeError::Crossing(record) => {
                assert_eq!(record.class_name.as_deref(), Some(classes::CLASS_CAST));
                assert_eq!(record.message, crate::core::types::STRING_CLASS);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
