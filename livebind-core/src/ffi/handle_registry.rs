//! 句柄注册表
//!
//! 代理对象只保存一个 `u64` 句柄；原生实例存放在注册表中。
//! 每个实例单元有自己的阶段与在途调用计数：
//!
//! - `resolve` 返回 RAII 守卫，存在期间实例不会被销毁
//! - `detach` 先切换到 `Destroying` 拒绝新的 resolve，再等待在途调用结束后销毁
//! - 当前线程持有任何守卫时（处在某个回调中），不等待，销毁推迟到最后一个守卫释放

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::error::{BridgeError, BridgeResult};
use crate::log_lifecycle;
use crate::runtime::{ManagedRuntime, ObjectId};

thread_local! {
    /// 当前线程持有守卫的句柄
    static ACTIVE_HANDLES: RefCell<Vec<Handle>> = RefCell::new(Vec::new());
}

/// 句柄：注册表索引，单调分配且不复用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(u64);

impl Handle {
    /// 从未绑定，或构造失败
    pub const NONE: Handle = Handle(0);
    /// 实例已销毁
    pub const RETIRED: Handle = Handle(u64::MAX);

    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// 是否是一个注册表索引（不是哨兵值）
    pub fn is_index(self) -> bool {
        self != Handle::NONE && self != Handle::RETIRED
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Handle::NONE => f.write_str("none"),
            Handle::RETIRED => f.write_str("retired"),
            Handle(raw) => write!(f, "{:#x}", raw),
        }
    }
}

pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 原生实例
///
/// 回调只拿到 `&Self`，可变状态需要内部可变性
pub trait NativeObject: AsAny + Send + Sync {
    /// 销毁时调用且只调用一次，在句柄失效之前完成
    fn on_destroy(&self) {}
}

impl dyn NativeObject {
    pub fn downcast_ref<T: NativeObject>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: NativeObject>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// 实例单元的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellPhase {
    Live,
    Destroying,
    Destroyed,
}

struct CellState {
    phase: CellPhase,
    in_flight: usize,
    deferred: bool,
}

struct InstanceCell {
    handle: Handle,
    proxy: ObjectId,
    class_name: String,
    instance: Arc<dyn NativeObject>,
    state: Mutex<CellState>,
    drained: Condvar,
}

/// 注册表统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub attached: u64,
    pub detached: u64,
    /// 推迟到回调返回后的销毁
    pub deferred: u64,
    /// 被拒绝的 resolve
    pub rejected_resolves: u64,
    /// 尚未完成销毁的实例
    pub live: usize,
}

/// 句柄注册表
pub struct HandleRegistry {
    runtime: Arc<dyn ManagedRuntime>,
    cells: RwLock<HashMap<Handle, Arc<InstanceCell>>>,
    next_handle: AtomicU64,
    stats: Mutex<RegistryStats>,
}

impl HandleRegistry {
    pub fn new(runtime: Arc<dyn ManagedRuntime>) -> Self {
        Self {
            runtime,
            cells: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            stats: Mutex::new(RegistryStats::default()),
        }
    }

    /// 构造原生实例并绑定到代理
    ///
    /// 构造器在锁外执行；失败时句柄槽保持 `Handle::NONE`
    pub fn attach<F>(&self, proxy: ObjectId, class_name: &str, construct: F) -> BridgeResult<Handle>
    where
        F: FnOnce() -> BridgeResult<Arc<dyn NativeObject>>,
    {
        self.check_unattached(proxy)?;
        let instance = construct().map_err(|e| e.into_construction(None))?;
        self.insert(proxy, class_name, instance)
    }

    /// 绑定已经构造好的实例
    pub fn attach_instance(
        &self,
        proxy: ObjectId,
        class_name: &str,
        instance: Arc<dyn NativeObject>,
    ) -> BridgeResult<Handle> {
        self.check_unattached(proxy)?;
        self.insert(proxy, class_name, instance)
    }

    /// 解析代理当前的实例
    pub fn resolve(&self, proxy: ObjectId) -> BridgeResult<Resolved<'_>> {
        let handle = Handle::from_raw(self.runtime.handle_slot(proxy));
        let resolved = self.resolve_handle(handle)?;
        if resolved.cell.proxy != proxy {
            return Err(BridgeError::invalid_handle(handle.raw()));
        }
        Ok(resolved)
    }

    /// 按原始句柄值解析
    pub fn resolve_handle(&self, handle: Handle) -> BridgeResult<Resolved<'_>> {
        let cell = self.cells.read().get(&handle).cloned();
        let cell = match cell {
            Some(cell) => cell,
            None => return Err(self.reject(handle)),
        };
        {
            let mut state = cell.state.lock();
            if state.phase != CellPhase::Live {
                drop(state);
                return Err(self.reject(handle));
            }
            state.in_flight += 1;
        }
        // 线程退出阶段访问失败时不影响解析
        let _ = ACTIVE_HANDLES.try_with(|active| active.borrow_mut().push(handle));
        Ok(Resolved {
            registry: self,
            cell,
            _not_send: PhantomData,
        })
    }

    /// 销毁代理的实例；重复调用是空操作
    ///
    /// 返回本次调用是否启动了销毁
    pub fn detach(&self, proxy: ObjectId) -> bool {
        let handle = Handle::from_raw(self.runtime.handle_slot(proxy));
        if !handle.is_index() {
            return false;
        }
        let cell = match self.cells.read().get(&handle).cloned() {
            Some(cell) => cell,
            None => return false,
        };

        {
            let mut state = cell.state.lock();
            if state.phase != CellPhase::Live {
                return false;
            }
            state.phase = CellPhase::Destroying;

            // 持有守卫的线程不能等待：对方可能正等着它的守卫
            if state.in_flight > 0 && holds_any_guard() {
                state.deferred = true;
                self.stats.lock().deferred += 1;
                tracing::debug!(
                    "Deferred teardown of handle {} until its in-flight calls return",
                    handle
                );
                return true;
            }

            while state.in_flight > 0 {
                cell.drained.wait(&mut state);
            }
        }

        self.teardown(&cell);
        true
    }

    /// 销毁所有仍存活的实例，返回启动销毁的数量
    pub fn detach_all(&self) -> usize {
        let proxies: Vec<ObjectId> = self.cells.read().values().map(|cell| cell.proxy).collect();
        proxies.into_iter().filter(|proxy| self.detach(*proxy)).count()
    }

    /// 句柄当前阶段；不在表中返回 `None`
    pub fn phase(&self, handle: Handle) -> Option<CellPhase> {
        let cell = self.cells.read().get(&handle).cloned()?;
        let phase = cell.state.lock().phase;
        Some(phase)
    }

    pub fn handle_of(&self, proxy: ObjectId) -> Handle {
        Handle::from_raw(self.runtime.handle_slot(proxy))
    }

    /// 尚未完成销毁的实例数
    pub fn live_count(&self) -> usize {
        self.cells.read().len()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = self.stats.lock().clone();
        stats.live = self.live_count();
        stats
    }

    fn check_unattached(&self, proxy: ObjectId) -> BridgeResult<()> {
        match Handle::from_raw(self.runtime.handle_slot(proxy)) {
            Handle::NONE => Ok(()),
            Handle::RETIRED => Err(BridgeError::construction(
                format!("proxy {} was already destroyed", proxy),
                None,
            )),
            existing => Err(BridgeError::construction(
                format!("proxy {} already has native instance {}", proxy, existing),
                None,
            )),
        }
    }

    fn insert(&self, proxy: ObjectId, class_name: &str, instance: Arc<dyn NativeObject>) -> BridgeResult<Handle> {
        let handle = Handle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let cell = Arc::new(InstanceCell {
            handle,
            proxy,
            class_name: class_name.to_string(),
            instance: Arc::clone(&instance),
            state: Mutex::new(CellState {
                phase: CellPhase::Live,
                in_flight: 0,
                deferred: false,
            }),
            drained: Condvar::new(),
        });

        {
            let mut cells = self.cells.write();
            // 持锁复查，并发绑定时只有一个成功
            if Handle::from_raw(self.runtime.handle_slot(proxy)) != Handle::NONE {
                drop(cells);
                drop(cell);
                run_on_destroy(handle, instance.as_ref());
                return Err(BridgeError::construction(
                    format!("proxy {} was attached concurrently", proxy),
                    None,
                ));
            }
            cells.insert(handle, cell);
            self.runtime.set_handle_slot(proxy, handle.raw());
        }

        self.stats.lock().attached += 1;
        log_lifecycle!("attached", handle, proxy);
        tracing::debug!("Attached {} instance to proxy {} as handle {}", class_name, proxy, handle);
        Ok(handle)
    }

    fn reject(&self, handle: Handle) -> BridgeError {
        self.stats.lock().rejected_resolves += 1;
        BridgeError::invalid_handle(handle.raw())
    }

    /// 销毁：先执行 `on_destroy`，再移除单元并写入 `Handle::RETIRED`
    fn teardown(&self, cell: &Arc<InstanceCell>) {
        run_on_destroy(cell.handle, cell.instance.as_ref());
        cell.state.lock().phase = CellPhase::Destroyed;
        cell.drained.notify_all();

        self.cells.write().remove(&cell.handle);
        self.runtime.set_handle_slot(cell.proxy, Handle::RETIRED.raw());

        self.stats.lock().detached += 1;
        log_lifecycle!("destroyed", cell.handle, cell.proxy);
        tracing::debug!("Destroyed {} instance behind handle {}", cell.class_name, cell.handle);
    }
}

fn run_on_destroy(handle: Handle, instance: &dyn NativeObject) {
    if panic::catch_unwind(AssertUnwindSafe(|| instance.on_destroy())).is_err() {
        tracing::error!("on_destroy panicked for handle {}", handle);
    }
}

fn holds_any_guard() -> bool {
    ACTIVE_HANDLES
        .try_with(|active| !active.borrow().is_empty())
        .unwrap_or(false)
}

/// 已解析的实例
///
/// 存在期间实例不会被销毁；不能跨线程转移
pub struct Resolved<'a> {
    registry: &'a HandleRegistry,
    cell: Arc<InstanceCell>,
    _not_send: PhantomData<*const ()>,
}

impl<'a> Resolved<'a> {
    pub fn handle(&self) -> Handle {
        self.cell.handle
    }

    pub fn proxy(&self) -> ObjectId {
        self.cell.proxy
    }

    pub fn class_name(&self) -> &str {
        &self.cell.class_name
    }

    pub fn instance(&self) -> &dyn NativeObject {
        self.cell.instance.as_ref()
    }

    pub fn downcast<T: NativeObject>(&self) -> Option<&T> {
        self.instance().downcast_ref::<T>()
    }
}

impl Drop for Resolved<'_> {
    fn drop(&mut self) {
        let handle = self.cell.handle;
        let _ = ACTIVE_HANDLES.try_with(|active| {
            let mut active = active.borrow_mut();
            if let Some(position) = active.iter().rposition(|h| *h == handle) {
                active.remove(position);
            }
        });

        let run_teardown = {
            let mut state = self.cell.state.lock();
            state.in_flight -= 1;
            if state.in_flight > 0 {
                false
            } else if state.deferred {
                state.deferred = false;
                true
            } else {
                self.cell.drained.notify_all();
                false
            }
        };
        if run_teardown {
            self.registry.teardown(&self.cell);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{GlobalRef, Heap, ManagedClass};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{mpsc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Tracked {
        destroyed: AtomicUsize,
    }

    impl NativeObject for Tracked {
        fn on_destroy(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Other;

    impl NativeObject for Other {}

    fn setup() -> (Arc<Heap>, Arc<HandleRegistry>, GlobalRef) {
        let heap = Heap::new();
        heap.define_class(ManagedClass::builder("Proxy").build().unwrap())
            .unwrap();
        let registry = Arc::new(HandleRegistry::new(heap.runtime().unwrap()));
        let proxy = heap.allocate("Proxy").unwrap();
        (heap, registry, proxy)
    }

    #[test]
    fn test_attach_resolve_detach() {
        let (heap, registry, proxy) = setup();
        let tracked = Arc::new(Tracked::default());
        let instance: Arc<dyn NativeObject> = tracked.clone();

        let handle = registry.attach(proxy.id(), "Proxy", || Ok(instance)).unwrap();
        assert!(handle.is_index());
        assert_eq!(heap.handle_slot(proxy.id()), handle.raw());

        {
            let resolved = registry.resolve(proxy.id()).unwrap();
            assert!(resolved.downcast::<Tracked>().is_some());
            assert!(resolved.downcast::<Other>().is_none());
            assert_eq!(resolved.handle(), handle);
        }

        assert!(registry.detach(proxy.id()));
        assert_eq!(tracked.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.handle_of(proxy.id()), Handle::RETIRED);

        // 重复 detach 是空操作
        assert!(!registry.detach(proxy.id()));
        assert_eq!(tracked.destroyed.load(Ordering::SeqCst), 1);

        let err = registry.resolve(proxy.id()).err().unwrap();
        assert!(matches!(err, BridgeError::InvalidHandle { .. }));
        assert!(registry.resolve_handle(handle).is_err());
        assert_eq!(registry.stats().rejected_resolves, 2);
    }

    #[test]
    fn test_failed_construction_leaves_sentinel() {
        let (_heap, registry, proxy) = setup();
        let err = registry
            .attach(proxy.id(), "Proxy", || Err(BridgeError::argument("Can't open file.")))
            .unwrap_err();
        match err {
            BridgeError::Construction { message, .. } => assert_eq!(message, "Can't open file."),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(registry.handle_of(proxy.id()), Handle::NONE);
        assert!(registry.resolve(proxy.id()).is_err());
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_double_attach_and_reattach_rejected() {
        let (_heap, registry, proxy) = setup();
        registry
            .attach_instance(proxy.id(), "Proxy", Arc::new(Tracked::default()))
            .unwrap();
        assert!(registry
            .attach_instance(proxy.id(), "Proxy", Arc::new(Tracked::default()))
            .is_err());

        registry.detach(proxy.id());
        // 已销毁的代理不能重新绑定
        assert!(registry
            .attach_instance(proxy.id(), "Proxy", Arc::new(Tracked::default()))
            .is_err());
    }

    #[test]
    fn test_handles_are_not_reused() {
        let (heap, registry, first) = setup();
        let a = registry
            .attach_instance(first.id(), "Proxy", Arc::new(Tracked::default()))
            .unwrap();
        registry.detach(first.id());

        let second = heap.allocate("Proxy").unwrap();
        let b = registry
            .attach_instance(second.id(), "Proxy", Arc::new(Tracked::default()))
            .unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_reentrant_detach_is_deferred() {
        let (_heap, registry, proxy) = setup();
        let tracked = Arc::new(Tracked::default());
        registry.attach_instance(proxy.id(), "Proxy", tracked.clone()).unwrap();

        let guard = registry.resolve(proxy.id()).unwrap();
        // 在回调内释放自身
        assert!(registry.detach(proxy.id()));
        assert_eq!(tracked.destroyed.load(Ordering::SeqCst), 0);
        assert!(registry.resolve(proxy.id()).is_err());
        assert_eq!(registry.phase(guard.handle()), Some(CellPhase::Destroying));

        drop(guard);
        assert_eq!(tracked.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.handle_of(proxy.id()), Handle::RETIRED);
        assert_eq!(registry.stats().deferred, 1);
    }

    #[test]
    fn test_detach_waits_for_in_flight_calls() {
        let (_heap, registry, proxy) = setup();
        let tracked = Arc::new(Tracked::default());
        registry.attach_instance(proxy.id(), "Proxy", tracked.clone()).unwrap();

        let (entered_tx, entered_rx) = mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));
        let worker = {
            let registry = Arc::clone(&registry);
            let tracked = Arc::clone(&tracked);
            let finished = Arc::clone(&finished);
            let proxy_id = proxy.id();
            thread::spawn(move || {
                let guard = registry.resolve(proxy_id).unwrap();
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                // 调用期间实例仍然有效
                assert_eq!(tracked.destroyed.load(Ordering::SeqCst), 0);
                finished.store(true, Ordering::SeqCst);
                drop(guard);
            })
        };

        entered_rx.recv().unwrap();
        assert!(registry.detach(proxy.id()));
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(tracked.destroyed.load(Ordering::SeqCst), 1);
        worker.join().unwrap();
    }

    #[test]
    fn test_cross_detach_from_two_callbacks_completes() {
        let (heap, registry, first) = setup();
        let second = heap.allocate("Proxy").unwrap();
        let tracked = [Arc::new(Tracked::default()), Arc::new(Tracked::default())];
        registry.attach_instance(first.id(), "Proxy", tracked[0].clone()).unwrap();
        registry.attach_instance(second.id(), "Proxy", tracked[1].clone()).unwrap();

        // 两个线程各在自己对象的回调中，互相释放对方
        let barrier = Arc::new(Barrier::new(2));
        let (done_tx, done_rx) = mpsc::channel();
        let pairs = [(first.id(), second.id()), (second.id(), first.id())];
        let workers: Vec<_> = pairs
            .into_iter()
            .map(|(mine, other)| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                let done_tx = done_tx.clone();
                thread::spawn(move || {
                    let guard = registry.resolve(mine).unwrap();
                    barrier.wait();
                    assert!(registry.detach(other));
                    drop(guard);
                    done_tx.send(()).unwrap();
                })
            })
            .collect();

        for _ in 0..2 {
            done_rx
                .recv_timeout(Duration::from_secs(3))
                .expect("cross detach did not complete");
        }
        for worker in workers {
            worker.join().unwrap();
        }
        for instance in &tracked {
            assert_eq!(instance.destroyed.load(Ordering::SeqCst), 1);
        }
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.handle_of(first.id()), Handle::RETIRED);
        assert_eq!(registry.handle_of(second.id()), Handle::RETIRED);
    }

    #[test]
    fn test_detach_all() {
        let (heap, registry, first) = setup();
        let second = heap.allocate("Proxy").unwrap();
        registry
            .attach_instance(first.id(), "Proxy", Arc::new(Tracked::default()))
            .unwrap();
        registry
            .attach_instance(second.id(), "Proxy", Arc::new(Tracked::default()))
            .unwrap();
        assert_eq!(registry.detach_all(), 2);
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.stats().detached, 2);
    }
}
