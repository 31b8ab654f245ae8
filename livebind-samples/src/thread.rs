//! `core/Thread` 与原生覆写 `run` 的 `LiveThread`
//!
//! 原生先创建 [`Worker`]，再构造托管代理；无论通过 `LiveThread` 还是
//! 基类 `core/Thread` 的绑定调用 `run`，都会经托管虚分派到达原生实现。

use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use livebind_core::core::types::STRING_CLASS;
use livebind_core::ffi::{BoundClass, Bridge, ClassBinding, LiveClassBinding, NativeObject, NativeValue};
use livebind_core::runtime::{GlobalRef, Heap, ManagedCall, ManagedClass, ManagedValue, ObjectId, Throwable};
use livebind_core::BridgeResult;

pub const THREAD_CLASS: &str = "core/Thread";
pub const LIVE_THREAD_CLASS: &str = "LiveThread";

type RunResult = Result<ManagedValue, Throwable>;

/// 对象 ID 只在单个堆内唯一，键里带上堆地址
type ThreadKey = (usize, ObjectId);

lazy_static! {
    /// `start` 之后尚未 `join` 的线程
    static ref RUNNING: Mutex<HashMap<ThreadKey, JoinHandle<RunResult>>> = Mutex::new(HashMap::new());
}

fn thread_key(call: &ManagedCall<'_>) -> Result<ThreadKey, Throwable> {
    Ok((call.heap() as *const Heap as usize, call.this()?.id()))
}

static THREAD_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

/// 原生线程体：按名字输出工作记录
pub struct Worker {
    iterations: usize,
    completed: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl Worker {
    pub fn new(iterations: usize) -> Self {
        Self {
            iterations,
            completed: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn run(&self, name: &str) {
        for _ in 0..self.iterations {
            self.log.lock().push(format!("{}: working...", name));
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
        self.log.lock().push(format!("{}: done", name));
    }
}

impl NativeObject for Worker {}

#[derive(Clone)]
pub struct ThreadClasses {
    /// 基类包装绑定
    pub thread: Arc<BoundClass>,
    pub live: Arc<BoundClass>,
}

impl ThreadClasses {
    /// 原生先创建，再构造托管 `LiveThread(name)`
    pub fn spawn_live(&self, bridge: &Bridge, name: &str, worker: Worker) -> BridgeResult<GlobalRef> {
        let name = bridge.new_string(name)?;
        bridge.new_live(&self.live, "new", &[name], worker)
    }

    pub fn start(&self, bridge: &Bridge, thread: &GlobalRef) -> BridgeResult<()> {
        bridge.call(&self.thread, "start", Some(thread), &[]).map(|_| ())
    }

    pub fn join(&self, bridge: &Bridge, thread: &GlobalRef) -> BridgeResult<()> {
        bridge.call(&self.thread, "join", Some(thread), &[]).map(|_| ())
    }

    pub fn name(&self, bridge: &Bridge, thread: &GlobalRef) -> BridgeResult<Option<String>> {
        let name = bridge.call(&self.thread, "getName", Some(thread), &[])?;
        bridge.string_value(&name)
    }
}

pub fn define_classes(heap: &Heap) -> anyhow::Result<()> {
    let string = format!("L{};", STRING_CLASS);
    heap.define_class(
        ManagedClass::builder(THREAD_CLASS)
            .field("name", &string)
            .constructor("()V", |call| {
                let sequence = THREAD_SEQUENCE.fetch_add(1, Ordering::SeqCst);
                call.set_field("name", call.new_string(&format!("Thread-{}", sequence))?)?;
                Ok(ManagedValue::Void)
            })
            .constructor(&format!("({})V", string), |call| {
                call.set_field("name", call.arg(0)?.clone())?;
                Ok(ManagedValue::Void)
            })
            .method("getName", &format!("(){}", string), |call| call.field("name"))
            .method("run", "()V", |_| Ok(ManagedValue::Void))
            .method("start", "()V", |call| {
                let this = call.this()?.clone();
                let heap = call
                    .heap()
                    .shared()
                    .ok_or_else(|| Throwable::illegal_state("heap is shutting down"))?;
                let key = thread_key(call)?;
                let mut running = RUNNING.lock();
                if running.contains_key(&key) {
                    return Err(Throwable::illegal_state(format!("thread {} already started", this.id())));
                }
                let handle = std::thread::spawn(move || heap.call_virtual(&this, "run", "()V", &[]));
                running.insert(key, handle);
                Ok(ManagedValue::Void)
            })
            .method("join", "()V", |call| {
                let key = thread_key(call)?;
                let id = key.1;
                let handle = RUNNING.lock().remove(&key);
                match handle {
                    Some(handle) => handle
                        .join()
                        .map_err(|_| Throwable::runtime(format!("thread {} panicked", id)))?
                        .map(|_| ManagedValue::Void),
                    None => Ok(ManagedValue::Void),
                }
            })
            .build()?,
    )?;
    heap.define_class(
        ManagedClass::builder(LIVE_THREAD_CLASS)
            .extends(THREAD_CLASS)
            .constructor(&format!("({})V", string), |call| {
                call.call_super("<init>", &format!("(L{};)V", STRING_CLASS), &[call.arg(0)?.clone()])
            })
            .native_method("run", "()V")
            .native_method("finalize", "()V")
            .build()?,
    )?;
    Ok(())
}

pub fn install(heap: &Heap, bridge: &Bridge) -> anyhow::Result<ThreadClasses> {
    define_classes(heap)?;
    let string = format!("L{};", STRING_CLASS);

    let thread = bridge.bind_wrapper(
        &ClassBinding::new(THREAD_CLASS)
            .constructor("new", &format!("({})V", string))
            .method("getName", "getName", &format!("(){}", string))
            .method("run", "run", "()V")
            .method("start", "start", "()V")
            .method("join", "join", "()V"),
    )?;
    let live = bridge.bind_live(
        LiveClassBinding::<Worker>::new(LIVE_THREAD_CLASS)
            .constructor("new", &format!("({})V", string))
            .method("getName", "getName", &format!("(){}", string))
            .callback("run", "()V", |worker, ctx, _| {
                let name = ctx.call_this("getName", &[])?;
                let name = ctx.bridge().string_value(&name)?.unwrap_or_default();
                worker.run(&name);
                Ok(NativeValue::Void)
            }),
    )?;
    Ok(ThreadClasses { thread, live })
}

#[cfg(test)]
mod tests {
    use super::*;
    use livebind_core::config::BridgeSettings;

    #[test]
    fn test_run_reaches_native_override() {
        let heap = Heap::new();
        let bridge = Bridge::new(heap.runtime().unwrap(), BridgeSettings::default());
        let classes = install(&heap, &bridge).unwrap();

        let thread = classes.spawn_live(&bridge, "MyThread", Worker::new(3)).unwrap();
        assert_eq!(classes.name(&bridge, &thread).unwrap().as_deref(), Some("MyThread"));

        // 经过基类绑定的虚调用
        bridge.call(&classes.thread, "run", Some(&thread), &[]).unwrap();
        let completed = bridge.with_instance(&thread, |worker: &Worker| Ok(worker.completed())).unwrap();
        assert_eq!(completed, 3);

        let log = bridge.with_instance(&thread, |worker: &Worker| Ok(worker.log())).unwrap();
        assert_eq!(log.last().map(String::as_str), Some("MyThread: done"));
    }

    #[test]
    fn test_start_and_join() {
        let heap = Heap::new();
        let bridge = Bridge::new(heap.runtime().unwrap(), BridgeSettings::default());
        let classes = install(&heap, &bridge).unwrap();

        let thread = classes.spawn_live(&bridge, "Background", Worker::new(5)).unwrap();
        classes.start(&bridge, &thread).unwrap();
        classes.join(&bridge, &thread).unwrap();

        let completed = bridge.with_instance(&thread, |worker: &Worker| Ok(worker.completed())).unwrap();
        assert_eq!(completed, 5);
    }
}
