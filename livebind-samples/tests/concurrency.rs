//! 并发测试
//!
//! - 多线程调用与显式释放竞争时，回调永远看不到已销毁的实例
//! - 多线程并发创建代理，句柄互不相同
//! - 托管线程回调原生覆写

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use livebind_core::config::BridgeSettings;
use livebind_core::ffi::{Bridge, LiveClassBinding, NativeObject, NativeValue};
use livebind_core::runtime::{classes, Heap, ManagedClass, ManagedRuntime};
use livebind_core::BridgeError;
use livebind_samples::install_all;
use livebind_samples::thread::Worker;

const USE_AFTER_DESTROY: &str = "test/UseAfterDestroy";

/// 销毁后仍被回调即报错
#[derive(Default)]
struct Guarded {
    destroyed: AtomicBool,
    calls: AtomicUsize,
}

impl NativeObject for Guarded {
    fn on_destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

fn guarded_bridge() -> (Arc<Heap>, Bridge) {
    let heap = Heap::new();
    heap.define_class(
        ManagedClass::builder("Guarded")
            .native_method("touch", "()I")
            .build()
            .unwrap(),
    )
    .unwrap();
    let bridge = Bridge::new(heap.runtime().unwrap(), BridgeSettings::default());
    bridge
        .bind_live(
            LiveClassBinding::<Guarded>::new("Guarded").callback("touch", "()I", |guarded, _, _| {
                if guarded.destroyed.load(Ordering::SeqCst) {
                    return Err(BridgeError::thrown(USE_AFTER_DESTROY, "instance used after destroy"));
                }
                // 拉长在途窗口
                if fastrand::u8(..) < 16 {
                    thread::yield_now();
                }
                let calls = guarded.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if guarded.destroyed.load(Ordering::SeqCst) {
                    return Err(BridgeError::thrown(USE_AFTER_DESTROY, "destroyed during a call"));
                }
                Ok(NativeValue::Int(calls as i32))
            }),
        )
        .unwrap();
    (heap, bridge)
}

/// resolve 与 detach 竞争
#[test]
fn test_release_races_with_calls() {
    let (heap, bridge) = guarded_bridge();
    let proxy = heap.allocate("Guarded").unwrap();
    bridge.attach_native(&proxy, Guarded::default()).unwrap();

    let ok = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let heap = Arc::clone(&heap);
            let proxy = proxy.clone();
            let ok = Arc::clone(&ok);
            let rejected = Arc::clone(&rejected);
            thread::spawn(move || {
                for _ in 0..500 {
                    match heap.call_virtual(&proxy, "touch", "()I", &[]) {
                        Ok(_) => {
                            ok.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(thrown) => {
                            assert_eq!(thrown.class_name, classes::ILLEGAL_STATE, "{}", thrown.message);
                            rejected.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(2));
    assert!(bridge.release(&proxy));
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(ok.load(Ordering::SeqCst) + rejected.load(Ordering::SeqCst), 8 * 500);
    assert_eq!(bridge.registry().live_count(), 0);
    let stats = bridge.registry().stats();
    assert!(stats.rejected_resolves as usize >= rejected.load(Ordering::SeqCst));
    assert!(serde_json::to_string(&stats).unwrap().contains("rejected_resolves"));
}

/// 并发 attach 分配不同句柄
#[test]
fn test_concurrent_construction_yields_distinct_handles() {
    let heap = Heap::new();
    let bridge = Bridge::new(heap.runtime().unwrap(), BridgeSettings::default());
    let samples = install_all(&heap, &bridge).unwrap();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let bridge = bridge.clone();
            let conformance = samples.conformance.clone();
            thread::spawn(move || {
                (0..25)
                    .map(|_| {
                        let live = conformance.new_live(&bridge).unwrap();
                        let handle = bridge.registry().handle_of(live.id());
                        (live, handle)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let proxies: Vec<_> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
    let handles: HashSet<_> = proxies.iter().map(|(_, handle)| *handle).collect();
    assert_eq!(handles.len(), 200);
    assert_eq!(bridge.registry().live_count(), 200);
    assert_eq!(samples.conformance.native_instances.load(Ordering::SeqCst), 200);

    drop(proxies);
    heap.collect_fully();
    assert_eq!(bridge.registry().live_count(), 0);
    assert_eq!(samples.conformance.native_instances.load(Ordering::SeqCst), 0);
}

/// 托管线程执行原生 run
#[test]
fn test_threads_run_native_overrides() {
    let heap = Heap::new();
    let bridge = Bridge::new(heap.runtime().unwrap(), BridgeSettings::default());
    let samples = install_all(&heap, &bridge).unwrap();
    let threads = &samples.thread;

    let proxies: Vec<_> = (0..4)
        .map(|i| {
            threads
                .spawn_live(&bridge, &format!("worker-{}", i), Worker::new(100 * (i + 1)))
                .unwrap()
        })
        .collect();
    for proxy in &proxies {
        threads.start(&bridge, proxy).unwrap();
    }
    for proxy in &proxies {
        threads.join(&bridge, proxy).unwrap();
    }

    for (i, proxy) in proxies.iter().enumerate() {
        let completed = bridge.with_instance(proxy, |w: &Worker| Ok(w.completed())).unwrap();
        assert_eq!(completed, 100 * (i + 1));
    }
}
