//! # Livebind 示例
//!
//! 每个模块同时给出托管侧的类定义（在进程内 [`Heap`] 上）和原生侧的绑定：
//!
//! - [`sound`]: 完全由原生实现的 `NativeSound`，按标签构造
//! - [`thread`]: 原生覆写 `run` 的 `LiveThread`
//! - [`view`]: 通过 super 选择器回到默认绘制的 `ui/LiveView`
//! - [`conformance`]: 类型、数组与回调的一致性用例

pub mod conformance;
pub mod sound;
pub mod thread;
pub mod view;

use livebind_core::ffi::Bridge;
use livebind_core::runtime::Heap;

/// 全部示例绑定后的类
#[derive(Clone)]
pub struct Samples {
    pub sound: sound::SoundClasses,
    pub thread: thread::ThreadClasses,
    pub view: view::ViewClasses,
    pub conformance: conformance::Conformance,
}

/// 定义并绑定所有示例类
pub fn install_all(heap: &Heap, bridge: &Bridge) -> anyhow::Result<Samples> {
    let samples = Samples {
        sound: sound::install(heap, bridge)?,
        thread: thread::install(heap, bridge)?,
        view: view::install(heap, bridge)?,
        conformance: conformance::install(heap, bridge)?,
    };
    let stats = bridge.descriptors().stats();
    tracing::info!(
        "Installed samples: {} classes, {} members bound",
        stats.bound_classes,
        stats.resolved_members
    );
    Ok(samples)
}
