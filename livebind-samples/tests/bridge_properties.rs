//! 异常对称、super 跳板与生命周期

use std::sync::atomic::Ordering;
use std::sync::Arc;

use livebind_core::config::BridgeSettings;
use livebind_core::core::types::STRING_CLASS;
use livebind_core::ffi::{Bridge, LifecycleState, LiveClassBinding, NativeObject, NativeValue};
use livebind_core::runtime::{classes, Heap, ManagedClass, ManagedRuntime};
use livebind_core::BridgeError;
use livebind_samples::conformance::{
    LiveInstance, TEST_BOOL, TEST_BYTE, TEST_CHAR, TEST_DOUBLE, TEST_FLOAT, TEST_INT, TEST_LONG, TEST_SHORT, TEST_STRING,
};
use livebind_samples::sound::{NativeSound, SOUND_EXCEPTION};
use livebind_samples::view::{NativeView, DEFAULT_BACKGROUND, VIEW_CLASS};
use livebind_samples::{install_all, Samples};

fn setup() -> (Arc<Heap>, Bridge, Samples) {
    let heap = Heap::new();
    let bridge = Bridge::new(heap.runtime().unwrap(), BridgeSettings::default());
    let samples = install_all(&heap, &bridge).unwrap();
    (heap, bridge, samples)
}

// ---- 异常对称 ----

#[test]
fn test_managed_exception_reaches_native_with_message() {
    let (_heap, bridge, samples) = setup();
    let proxy = samples.sound.new_sound(&bridge, "sound:/props/stop.wav").unwrap();

    let err = bridge.call(&samples.sound.sound, "stop", Some(&proxy), &[]).unwrap_err();
    match err {
        BridgeError::Crossing(record) => {
            assert_eq!(record.class_name.as_deref(), Some(SOUND_EXCEPTION));
            assert_eq!(record.message, "Sound is not playing.");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_native_error_reaches_managed_with_message() {
    let (_heap, bridge, samples) = setup();
    let c = &samples.conformance;
    let live = c.new_live(&bridge).unwrap();
    let caller = c.caller_of(&bridge, &live).unwrap();

    let message = bridge.new_string("Exception from native code").unwrap();
    let caught = bridge
        .call(&c.caller, "callExceptionCallback", Some(&caller), &[message])
        .unwrap();
    assert_eq!(
        bridge.string_value(&caught).unwrap().as_deref(),
        Some("Exception from native code")
    );
    assert!(bridge.with_instance(&live, |l: &LiveInstance| Ok(l.has_event("exceptionCallback"))).unwrap());

    let history = bridge.exceptions().history();
    assert!(history.iter().all(|record| record.message == "Exception from native code"));
}

#[test]
fn test_native_panic_becomes_runtime_exception() {
    struct Fuse;
    impl NativeObject for Fuse {}

    let heap = Heap::new();
    heap.define_class(
        ManagedClass::builder("Fuse")
            .native_method("blow", "()V")
            .native_method("blowOpaque", "()V")
            .build()
            .unwrap(),
    )
    .unwrap();
    let bridge = Bridge::new(heap.runtime().unwrap(), BridgeSettings::default());
    bridge
        .bind_live(
            LiveClassBinding::<Fuse>::new("Fuse")
                .callback("blow", "()V", |_, _, _| panic!("fuse blown"))
                .callback("blowOpaque", "()V", |_, _, _| std::panic::panic_any(42)),
        )
        .unwrap();
    let fuse = heap.allocate("Fuse").unwrap();
    bridge.attach_native(&fuse, Fuse).unwrap();

    let thrown = heap.call_virtual(&fuse, "blow", "()V", &[]).unwrap_err();
    assert_eq!(thrown.class_name, classes::RUNTIME_EXCEPTION);
    assert_eq!(thrown.message, "fuse blown");

    let thrown = heap.call_virtual(&fuse, "blowOpaque", "()V", &[]).unwrap_err();
    assert_eq!(thrown.message, "Unknown native panic.");
    assert_eq!(bridge.exceptions().stats().panics, 2);

    // panic 之后实例仍然可用
    assert_eq!(bridge.state(&fuse), LifecycleState::Live);
}

#[test]
fn test_callbacks_of_every_shape() {
    let (heap, bridge, samples) = setup();
    let c = &samples.conformance;
    let live = c.new_live(&bridge).unwrap();
    let caller = c.caller_of(&bridge, &live).unwrap();

    bridge.call(&c.caller, "callSimpleCallback", Some(&caller), &[]).unwrap();
    bridge.call(&c.caller, "callNonStaticCallback", Some(&caller), &[]).unwrap();

    let result = bridge
        .call(
            &c.caller,
            "callPrimitiveCallback",
            Some(&caller),
            &[
                NativeValue::Bool(TEST_BOOL),
                NativeValue::Double(TEST_DOUBLE),
                NativeValue::Char(TEST_CHAR),
                NativeValue::Byte(TEST_BYTE),
                NativeValue::Short(TEST_SHORT),
                NativeValue::Int(TEST_INT),
                NativeValue::Long(TEST_LONG),
                NativeValue::Float(TEST_FLOAT),
            ],
        )
        .unwrap();
    assert_eq!(result, NativeValue::Long(TEST_LONG));

    let text = bridge.call(&c.caller, "callObjectCallback", Some(&caller), &[]).unwrap();
    assert_eq!(bridge.string_value(&text).unwrap().as_deref(), Some(TEST_STRING));

    bridge.call_static(&c.caller, "callStaticSimpleCallback", &[]).unwrap();
    assert_eq!(c.static_calls.load(Ordering::SeqCst), 1);

    let events = bridge
        .with_instance(&live, |l: &LiveInstance| Ok(l.events()))
        .unwrap();
    assert_eq!(
        events,
        vec!["simpleCallback", "nonStaticCallback", "primitiveCallback", "objectCallback"]
    );

    // objectCallback 创建的对象回收后计数归零
    drop(text);
    heap.collect_fully();
    assert_eq!(c.counted_instances(&bridge).unwrap(), 0);
}

// ---- super 跳板 ----

#[test]
fn test_super_equals_direct_managed_call() {
    let (heap, bridge, samples) = setup();
    let views = &samples.view;

    let plain = views.new_live_view(&bridge, Some("plain")).unwrap();
    let through_native = views.new_canvas(&bridge).unwrap();
    views.draw(&bridge, &plain, &through_native).unwrap();

    let managed_view = heap.new_object(VIEW_CLASS, "()V", &[]).unwrap();
    let direct = views.new_canvas(&bridge).unwrap();
    views.draw(&bridge, &managed_view, &direct).unwrap();

    assert_eq!(
        views.canvas_state(&bridge, &through_native).unwrap(),
        views.canvas_state(&bridge, &direct).unwrap()
    );
    assert_eq!(views.canvas_state(&bridge, &direct).unwrap(), (1, DEFAULT_BACKGROUND));
}

#[test]
fn test_override_reached_through_base_descriptor() {
    let (_heap, bridge, samples) = setup();
    let views = &samples.view;
    let custom = views.new_live_view(&bridge, Some("custom:ff0000")).unwrap();
    let canvas = views.new_canvas(&bridge).unwrap();

    bridge
        .call(&views.view, "onDraw", Some(&custom), &[NativeValue::object(&canvas)])
        .unwrap();
    assert_eq!(views.canvas_state(&bridge, &canvas).unwrap(), (2, 0xff0000));
    let draws = bridge.with_instance(&custom, |v: &NativeView| Ok(v.draws())).unwrap();
    assert_eq!(draws, 1);
}

// ---- 生命周期 ----

#[test]
fn test_missing_or_unknown_tag_is_instantiation_error() {
    let (_heap, bridge, samples) = setup();
    for tag in [None, Some("unknown:1"), Some("custom:not-a-color")] {
        match samples.view.new_live_view(&bridge, tag).unwrap_err() {
            BridgeError::Crossing(record) => {
                assert_eq!(record.class_name.as_deref(), Some(classes::INSTANTIATION), "tag {:?}", tag)
            }
            other => panic!("unexpected error for {:?}: {:?}", tag, other),
        }
    }
    assert_eq!(bridge.registry().live_count(), 0);
}

#[test]
fn test_release_then_resolve_fails() {
    let (_heap, bridge, samples) = setup();
    let proxy = samples.sound.new_sound(&bridge, "sound:/props/release.wav").unwrap();
    assert!(bridge.resolve(&proxy).is_ok());

    assert!(bridge.release(&proxy));
    assert!(!bridge.release(&proxy));
    assert!(matches!(bridge.resolve(&proxy), Err(BridgeError::InvalidHandle { .. })));
    assert_eq!(bridge.state(&proxy), LifecycleState::Destroyed);

    // 托管侧调用得到 IllegalStateException
    match bridge.call(&samples.sound.sound, "play", Some(&proxy), &[]).unwrap_err() {
        BridgeError::Crossing(record) => assert_eq!(record.class_name.as_deref(), Some(classes::ILLEGAL_STATE)),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(bridge.with_instance(&proxy, |_: &NativeSound| Ok(())).is_err());
}

#[test]
fn test_finalizer_chain_counts_instances() {
    let (heap, bridge, samples) = setup();
    let c = &samples.conformance;

    let first = c.new_live(&bridge).unwrap();
    let second = c.new_live(&bridge).unwrap();
    assert_eq!(c.managed_instances(&bridge).unwrap(), 2);
    assert_eq!(c.native_instances.load(Ordering::SeqCst), 2);

    drop(first);
    heap.collect_fully();
    assert_eq!(c.managed_instances(&bridge).unwrap(), 1);
    assert_eq!(c.native_instances.load(Ordering::SeqCst), 1);

    // 显式释放后终结器只执行父类部分
    assert!(bridge.release(&second));
    assert_eq!(c.native_instances.load(Ordering::SeqCst), 0);
    drop(second);
    heap.collect_fully();
    assert_eq!(c.managed_instances(&bridge).unwrap(), 0);
    assert_eq!(bridge.lifecycle().stats().finalizations, 1);
}

#[test]
fn test_string_arguments_cross_unchanged() {
    let (heap, bridge, _samples) = setup();
    let text = "Grüße, 世界";
    let value = bridge.new_string(text).unwrap();
    assert_eq!(bridge.string_value(&value).unwrap().as_deref(), Some(text));
    assert!(heap.find_class(STRING_CLASS).is_some());
}
