//! 生命周期控制
//!
//! `UNATTACHED -> LIVE -> DESTROYED`，DESTROYED 不可逆。
//! 原生实例按标签 `scheme[:argument]` 选择工厂构造；
//! 回收通知（finalize）与显式释放都走同一个幂等的 detach。

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use super::bridge::Bridge;
use super::handle_registry::{CellPhase, Handle, NativeObject};
use super::type_converter::NativeValue;
use crate::core::error::{BridgeError, BridgeResult};
use crate::runtime::{GlobalRef, ManagedRuntime};

/// 代理的生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Unattached,
    Live,
    Destroyed,
}

/// 一次构造请求
pub struct ConstructRequest<'a> {
    /// 完整标签
    pub tag: &'a str,
    pub scheme: &'a str,
    /// `:` 之后的部分
    pub argument: Option<&'a str>,
    /// 标签之后的其余参数
    pub args: &'a [NativeValue],
    pub proxy: &'a GlobalRef,
    pub bridge: &'a Bridge,
}

type FactoryFn = dyn Fn(&ConstructRequest<'_>) -> BridgeResult<Arc<dyn NativeObject>> + Send + Sync;

#[derive(Clone)]
struct Factory {
    type_id: TypeId,
    type_name: &'static str,
    build: Arc<FactoryFn>,
}

/// 生命周期统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleStats {
    pub constructions: u64,
    pub construction_failures: u64,
    pub explicit_releases: u64,
    pub finalizations: u64,
}

/// 生命周期控制器
pub struct LifecycleController {
    factories: RwLock<HashMap<String, Factory>>,
    /// 活类期望的原生类型
    class_types: RwLock<HashMap<String, (TypeId, &'static str)>>,
    stats: Mutex<LifecycleStats>,
}

impl LifecycleController {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            class_types: RwLock::new(HashMap::new()),
            stats: Mutex::new(LifecycleStats::default()),
        }
    }

    /// 为 scheme 注册工厂；重复注册会替换旧工厂
    pub fn register_factory<T, F>(&self, scheme: &str, factory: F)
    where
        T: NativeObject,
        F: Fn(&ConstructRequest<'_>) -> BridgeResult<T> + Send + Sync + 'static,
    {
        let build: Arc<FactoryFn> = Arc::new(move |request: &ConstructRequest<'_>| {
            factory(request).map(|instance| Arc::new(instance) as Arc<dyn NativeObject>)
        });
        let previous = self.factories.write().insert(
            scheme.to_string(),
            Factory {
                type_id: TypeId::of::<T>(),
                type_name: type_name::<T>(),
                build,
            },
        );
        if previous.is_some() {
            tracing::warn!("Replaced native factory for scheme '{}'", scheme);
        } else {
            tracing::debug!("Registered native factory '{}' -> {}", scheme, type_name::<T>());
        }
    }

    pub fn has_factory(&self, scheme: &str) -> bool {
        self.factories.read().contains_key(scheme)
    }

    /// 记录活类期望的原生类型
    pub fn register_class_type<T: NativeObject>(&self, class: &str) {
        self.class_types
            .write()
            .insert(class.to_string(), (TypeId::of::<T>(), type_name::<T>()));
    }

    /// 按标签构造原生实例并绑定到代理
    pub fn construct(
        &self,
        bridge: &Bridge,
        proxy: &GlobalRef,
        tag: &str,
        args: &[NativeValue],
    ) -> BridgeResult<Handle> {
        let result = self.try_construct(bridge, proxy, tag, args);
        let mut stats = self.stats.lock();
        match &result {
            Ok(handle) => {
                stats.constructions += 1;
                tracing::info!("Constructed native instance '{}' as handle {}", tag, handle);
            }
            Err(error) => {
                stats.construction_failures += 1;
                tracing::debug!("Construction of '{}' failed: {}", tag, error);
            }
        }
        result
    }

    /// 绑定已经构造好的实例（原生侧先创建）
    pub fn attach_instance(
        &self,
        bridge: &Bridge,
        proxy: &GlobalRef,
        instance: Arc<dyn NativeObject>,
        instance_type: (TypeId, &'static str),
    ) -> BridgeResult<Handle> {
        let class_name = live_class_name(proxy)?;
        self.check_type(bridge.runtime().as_ref(), &class_name, instance_type, None)?;
        let handle = bridge.registry().attach_instance(proxy.id(), &class_name, instance)?;
        self.stats.lock().constructions += 1;
        Ok(handle)
    }

    /// 显式释放
    pub fn release(&self, bridge: &Bridge, proxy: &GlobalRef) -> bool {
        let released = bridge.registry().detach(proxy.id());
        if released {
            self.stats.lock().explicit_releases += 1;
            tracing::info!("Released native instance of proxy {}", proxy.id());
        }
        released
    }

    /// 回收通知
    pub fn finalize(&self, bridge: &Bridge, proxy: &GlobalRef) -> bool {
        let released = bridge.registry().detach(proxy.id());
        if released {
            self.stats.lock().finalizations += 1;
            tracing::debug!("Finalized native instance of proxy {}", proxy.id());
        }
        released
    }

    pub fn state(&self, bridge: &Bridge, proxy: &GlobalRef) -> LifecycleState {
        let registry = bridge.registry();
        match registry.handle_of(proxy.id()) {
            Handle::NONE => LifecycleState::Unattached,
            Handle::RETIRED => LifecycleState::Destroyed,
            handle => match registry.phase(handle) {
                Some(CellPhase::Live) => LifecycleState::Live,
                _ => LifecycleState::Destroyed,
            },
        }
    }

    pub fn stats(&self) -> LifecycleStats {
        self.stats.lock().clone()
    }

    fn try_construct(
        &self,
        bridge: &Bridge,
        proxy: &GlobalRef,
        tag: &str,
        args: &[NativeValue],
    ) -> BridgeResult<Handle> {
        if tag.is_empty() {
            return Err(BridgeError::construction("missing native tag", Some(tag)));
        }
        let (scheme, argument) = match tag.split_once(':') {
            Some((scheme, argument)) => (scheme, Some(argument)),
            None => (tag, None),
        };
        let factory = self.factories.read().get(scheme).cloned().ok_or_else(|| {
            BridgeError::construction(
                format!("no native factory registered for scheme '{}'", scheme),
                Some(tag),
            )
        })?;

        let class_name = live_class_name(proxy)?;
        self.check_type(
            bridge.runtime().as_ref(),
            &class_name,
            (factory.type_id, factory.type_name),
            Some(tag),
        )?;

        let request = ConstructRequest {
            tag,
            scheme,
            argument,
            args,
            proxy,
            bridge,
        };
        bridge
            .registry()
            .attach(proxy.id(), &class_name, || (factory.build)(&request))
            .map_err(|e| e.into_construction(Some(tag)))
    }

    /// 从代理类向上找到登记的原生类型并比较
    fn check_type(
        &self,
        runtime: &dyn ManagedRuntime,
        class: &str,
        (type_id, type_name): (TypeId, &'static str),
        tag: Option<&str>,
    ) -> BridgeResult<()> {
        let class_types = self.class_types.read();
        let mut current = Some(class.to_string());
        while let Some(name) = current {
            if let Some((expected, expected_name)) = class_types.get(&name) {
                if *expected != type_id {
                    return Err(BridgeError::construction(
                        format!("{} expects a {} instance but got {}", name, expected_name, type_name),
                        tag,
                    ));
                }
                return Ok(());
            }
            current = runtime.superclass_of(&name);
        }
        Ok(())
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

fn live_class_name(proxy: &GlobalRef) -> BridgeResult<String> {
    proxy
        .class_name()
        .ok_or_else(|| BridgeError::construction(format!("proxy {} is no longer alive", proxy.id()), None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeSettings;
    use crate::ffi::exception_handler::managed_class_for;
    use crate::runtime::{Heap, ManagedClass};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tone {
        label: String,
        destroyed: Arc<AtomicUsize>,
    }

    impl NativeObject for Tone {
        fn on_destroy(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Noise;

    impl NativeObject for Noise {}

    fn setup() -> (Arc<Heap>, Bridge, Arc<AtomicUsize>) {
        let heap = Heap::new();
        heap.define_class(ManagedClass::builder("Tone").build().unwrap())
            .unwrap();
        let bridge = Bridge::new(heap.runtime().unwrap(), BridgeSettings::default());
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&destroyed);
        bridge.lifecycle().register_factory("tone", move |request| {
            let label = request.argument.unwrap_or_default();
            if label.is_empty() {
                return Err(BridgeError::thrown("ToneException", "Can't open file."));
            }
            Ok(Tone {
                label: label.to_string(),
                destroyed: Arc::clone(&counter),
            })
        });
        bridge.lifecycle().register_factory("noise", |_| Ok(Noise));
        bridge.lifecycle().register_class_type::<Tone>("Tone");
        (heap, bridge, destroyed)
    }

    #[test]
    fn test_construct_by_tag() {
        let (heap, bridge, destroyed) = setup();
        let proxy = heap.allocate("Tone").unwrap();
        let lifecycle = bridge.lifecycle();

        assert_eq!(lifecycle.state(&bridge, &proxy), LifecycleState::Unattached);
        lifecycle.construct(&bridge, &proxy, "tone:a440", &[]).unwrap();
        assert_eq!(lifecycle.state(&bridge, &proxy), LifecycleState::Live);

        let label = bridge
            .with_instance(&proxy, |tone: &Tone| Ok(tone.label.clone()))
            .unwrap();
        assert_eq!(label, "a440");

        assert!(lifecycle.release(&bridge, &proxy));
        assert!(!lifecycle.finalize(&bridge, &proxy));
        assert_eq!(lifecycle.state(&bridge, &proxy), LifecycleState::Destroyed);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);

        let stats = lifecycle.stats();
        assert_eq!(stats.constructions, 1);
        assert_eq!(stats.explicit_releases, 1);
        assert_eq!(stats.finalizations, 0);
    }

    #[test]
    fn test_construction_failures_name_the_tag() {
        let (heap, bridge, _) = setup();
        let proxy = heap.allocate("Tone").unwrap();
        let lifecycle = bridge.lifecycle();

        for tag in ["", "unknown:x", "tone:", "noise"] {
            let err = lifecycle.construct(&bridge, &proxy, tag, &[]).unwrap_err();
            match err {
                BridgeError::Construction { tag: Some(t), .. } => assert_eq!(t, tag),
                other => panic!("unexpected error for '{}': {:?}", tag, other),
            }
            assert_eq!(lifecycle.state(&bridge, &proxy), LifecycleState::Unattached);
        }

        let err = lifecycle.construct(&bridge, &proxy, "tone:", &[]).unwrap_err();
        assert_eq!(err.message(), "Can't open file.");
        // 工厂抛出的异常类随构造错误到达托管侧
        assert_eq!(managed_class_for(&err), "ToneException");
        assert_eq!(lifecycle.stats().construction_failures, 5);
    }
}
