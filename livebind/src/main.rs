//! Livebind - 演示程序入口
//!
//! 在进程内托管堆上安装全部示例，依次运行声音、线程、视图与一致性场景，
//! 最后输出桥与堆的统计信息。

use anyhow::Context;
use livebind_core::config::{load_config, Settings};
use livebind_core::ffi::{Bridge, NativeArray, NativeValue};
use livebind_core::runtime::Heap;
use livebind_core::{Logger, ValueType};
use livebind_samples::sound::{self, NativeSound, CHECKPOINT_CLASS};
use livebind_samples::thread::Worker;
use livebind_samples::{install_all, Samples};
use serde::Serialize;

const DEFAULT_CONFIG: &str = "livebind.toml";

#[derive(Serialize)]
struct Report {
    bridge: livebind_core::ffi::BridgeStats,
    heap: livebind_core::runtime::HeapStats,
}

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let settings = load_config(&config_path).unwrap_or_else(|e| {
        eprintln!("Failed to load {}: {}, using defaults", config_path, e);
        Settings::default()
    });

    Logger::init(&settings.logging).map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!("Starting livebind demo");
    tracing::debug!("Loaded configuration: {:?}", settings);

    let heap = Heap::with_settings(settings.heap.clone());
    let bridge = Bridge::new(heap.runtime()?, settings.bridge.clone());
    let samples = install_all(&heap, &bridge).context("installing samples")?;

    sound_scenario(&heap, &bridge, &samples)?;
    checkpoint_scenario(&bridge, &samples)?;
    thread_scenario(&bridge, &samples)?;
    view_scenario(&bridge, &samples)?;
    conformance_scenario(&heap, &bridge, &samples)?;

    if settings.heap.collect_on_shutdown {
        let stats = heap.collect_fully();
        tracing::info!("Final collection: {} freed, {} finalized", stats.freed, stats.finalized);
    }
    tracing::debug!("Exception history: {}", bridge.exceptions().history_json()?);
    let destroyed = bridge.shutdown();
    tracing::info!("Shutdown destroyed {} remaining native instances", destroyed);

    let report = Report {
        bridge: bridge.stats(),
        heap: heap.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// 播放后丢弃，回收时停止
fn sound_scenario(heap: &Heap, bridge: &Bridge, samples: &Samples) -> anyhow::Result<()> {
    let path = "/path/to/file";
    let proxy = samples.sound.new_sound(bridge, &format!("{}:{}", sound::SCHEME, path))?;
    bridge.call(&samples.sound.sound, "play", Some(&proxy), &[])?;
    tracing::info!("Playing {}: {}", path, sound::is_playing(path));

    drop(proxy);
    heap.collect_fully();
    tracing::info!("After collection {} is playing: {}", path, sound::is_playing(path));

    // 空路径构造失败，托管侧可以捕获
    if let Err(e) = samples.sound.new_sound(bridge, "sound:") {
        tracing::info!("Empty path rejected: {}", e);
    }
    Ok(())
}

fn checkpoint_scenario(bridge: &Bridge, samples: &Samples) -> anyhow::Result<()> {
    let proxy = samples.sound.new_sound(bridge, "sound:/demo/checkpoints.wav")?;
    let checkpoint = samples.sound.new_checkpoint(bridge, 0, None)?;
    let array = NativeArray::from_items(
        ValueType::object(CHECKPOINT_CLASS),
        vec![NativeValue::object(&checkpoint)],
    )?;
    bridge.call(&samples.sound.sound, "setCheckpoints", Some(&proxy), &[NativeValue::from(array)])?;

    let checkpoints = bridge.with_instance(&proxy, |sound: &NativeSound| Ok(sound.checkpoints()))?;
    tracing::info!("Native side sees {} checkpoint(s): {:?}", checkpoints.len(), checkpoints);
    bridge.release(&proxy);
    Ok(())
}

fn thread_scenario(bridge: &Bridge, samples: &Samples) -> anyhow::Result<()> {
    let threads = &samples.thread;
    let proxy = threads.spawn_live(bridge, "demo-worker", Worker::new(1000))?;
    threads.start(bridge, &proxy)?;
    threads.join(bridge, &proxy)?;

    let completed = bridge.with_instance(&proxy, |worker: &Worker| Ok(worker.completed()))?;
    tracing::info!(
        "Thread {:?} completed {} iterations",
        threads.name(bridge, &proxy)?,
        completed
    );
    Ok(())
}

fn view_scenario(bridge: &Bridge, samples: &Samples) -> anyhow::Result<()> {
    let views = &samples.view;
    for tag in ["plain", "custom:#3366cc"] {
        let view = views.new_live_view(bridge, Some(tag))?;
        let canvas = views.new_canvas(bridge)?;
        views.draw(bridge, &view, &canvas)?;
        let (layers, color) = views.canvas_state(bridge, &canvas)?;
        tracing::info!("View '{}' drew {} layer(s), last color {:#08x}", tag, layers, color);
    }
    Ok(())
}

fn conformance_scenario(heap: &Heap, bridge: &Bridge, samples: &Samples) -> anyhow::Result<()> {
    let c = &samples.conformance;

    bridge.call_static(&c.callee, "setStaticInt", &[NativeValue::Int(42)])?;
    let value = bridge.call_static(&c.callee, "getStaticInt", &[])?.get::<i32>()?;
    tracing::info!("Callee.staticInt = {}", value);

    let live = c.new_live(bridge)?;
    let caller = c.caller_of(bridge, &live)?;
    bridge.call(&c.caller, "callSimpleCallback", Some(&caller), &[])?;
    let text = bridge.call(&c.caller, "callObjectCallback", Some(&caller), &[])?;
    tracing::info!("objectCallback produced {:?}", bridge.string_value(&text)?);

    let message = bridge.new_string("Exception from native code")?;
    let caught = bridge.call(&c.caller, "callExceptionCallback", Some(&caller), &[message])?;
    tracing::info!("Managed caller caught {:?}", bridge.string_value(&caught)?);

    drop((text, caller, live));
    heap.collect_fully();
    tracing::info!(
        "LiveClass instances after collection: managed {}, native {}",
        c.managed_instances(bridge)?,
        c.native_instances.load(std::sync::atomic::Ordering::SeqCst)
    );
    Ok(())
}
