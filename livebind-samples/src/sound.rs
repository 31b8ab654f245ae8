//! 完全由原生实现的托管类 `NativeSound`
//!
//! 托管构造器把标签交给 native `construct`，工厂 `sound` 创建实例；
//! 代理被回收时 `finalize` 销毁实例并停止播放。

use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use livebind_core::core::types::{OBJECT_CLASS, STRING_CLASS};
use livebind_core::ffi::{
    BoundClass, Bridge, CallContext, ClassBinding, ConstructRequest, LiveClassBinding, NativeObject, NativeValue,
};
use livebind_core::runtime::{classes, GlobalRef, Heap, ManagedClass, ManagedValue};
use livebind_core::{BridgeError, BridgeResult};

pub const SOUND_CLASS: &str = "NativeSound";
pub const CHECKPOINT_CLASS: &str = "NativeSound$Checkpoint";
pub const SOUND_EXCEPTION: &str = "NativeSoundException";
pub const SCHEME: &str = "sound";

lazy_static! {
    /// 正在播放的路径
    static ref ACTIVE_PLAYBACKS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

pub fn active_playbacks() -> usize {
    ACTIVE_PLAYBACKS.lock().len()
}

pub fn is_playing(path: &str) -> bool {
    ACTIVE_PLAYBACKS.lock().contains(path)
}

/// 原生侧读取到的检查点
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub time: i64,
    pub data: Option<GlobalRef>,
}

pub struct NativeSound {
    path: String,
    playing: AtomicBool,
    checkpoints: Mutex<Vec<Checkpoint>>,
}

impl NativeSound {
    fn open(request: &ConstructRequest<'_>) -> BridgeResult<Self> {
        let path = request.argument.unwrap_or_default();
        if path.is_empty() {
            return Err(BridgeError::thrown(SOUND_EXCEPTION, "Can't open file."));
        }
        Ok(Self {
            path: path.to_string(),
            playing: AtomicBool::new(false),
            checkpoints: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.lock().clone()
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn play(&self) {
        if !self.playing.swap(true, Ordering::SeqCst) {
            ACTIVE_PLAYBACKS.lock().insert(self.path.clone());
            tracing::info!("Playing {}", self.path);
        }
    }

    fn stop(&self) -> BridgeResult<()> {
        if !self.playing.swap(false, Ordering::SeqCst) {
            return Err(BridgeError::thrown(SOUND_EXCEPTION, "Sound is not playing."));
        }
        ACTIVE_PLAYBACKS.lock().remove(&self.path);
        tracing::info!("Stopped {}", self.path);
        Ok(())
    }

    fn set_checkpoints(&self, ctx: &CallContext<'_>, checkpoint: &BoundClass, value: &NativeValue) -> BridgeResult<()> {
        let mut collected = Vec::new();
        if let Some(array) = value.as_array() {
            for item in array.items() {
                let object = item
                    .as_object()
                    .ok_or_else(|| BridgeError::argument("checkpoint array contains null"))?;
                let time = ctx.bridge().get_field(checkpoint, "time", object)?.get::<i64>()?;
                let data = ctx.bridge().get_field(checkpoint, "data", object)?.as_object().cloned();
                collected.push(Checkpoint { time, data });
            }
        }
        tracing::debug!("{} checkpoints registered for {}", collected.len(), self.path);
        *self.checkpoints.lock() = collected;
        Ok(())
    }
}

impl NativeObject for NativeSound {
    fn on_destroy(&self) {
        if self.playing.swap(false, Ordering::SeqCst) {
            ACTIVE_PLAYBACKS.lock().remove(&self.path);
            tracing::info!("Playback of {} stopped by teardown", self.path);
        }
    }
}

/// 绑定后的类
#[derive(Clone)]
pub struct SoundClasses {
    pub sound: Arc<BoundClass>,
    pub checkpoint: Arc<BoundClass>,
}

impl SoundClasses {
    /// 像托管代码一样 `new NativeSound(tag)`
    pub fn new_sound(&self, bridge: &Bridge, tag: &str) -> BridgeResult<GlobalRef> {
        let tag = bridge.new_string(tag)?;
        bridge.new_object(&self.sound, "new", &[tag])
    }

    pub fn new_checkpoint(&self, bridge: &Bridge, time: i64, data: Option<&GlobalRef>) -> BridgeResult<GlobalRef> {
        let data = data.map(NativeValue::object).unwrap_or_else(NativeValue::null);
        bridge.new_object(&self.checkpoint, "new", &[NativeValue::Long(time), data])
    }
}

/// 托管侧类定义
pub fn define_classes(heap: &Heap) -> anyhow::Result<()> {
    heap.define_class(ManagedClass::builder(SOUND_EXCEPTION).extends(classes::EXCEPTION).build()?)?;
    heap.define_class(
        ManagedClass::builder(CHECKPOINT_CLASS)
            .field("time", "J")
            .field("data", &format!("L{};", OBJECT_CLASS))
            .constructor("()V", |_| Ok(ManagedValue::Void))
            .constructor(&format!("(JL{};)V", OBJECT_CLASS), |call| {
                call.set_field("time", call.arg(0)?.clone())?;
                call.set_field("data", call.arg(1)?.clone())?;
                Ok(ManagedValue::Void)
            })
            .build()?,
    )?;

    let string = format!("L{};", STRING_CLASS);
    heap.define_class(
        ManagedClass::builder(SOUND_CLASS)
            .constructor(&format!("({})V", string), |call| {
                // 构造器不能是 native，由 construct 创建原生实例
                call.call_this("construct", &format!("(L{};)V", STRING_CLASS), &[call.arg(0)?.clone()])?;
                Ok(ManagedValue::Void)
            })
            .native_method("construct", &format!("({})V", string))
            .native_method("getPath", &format!("(){}", string))
            .native_method("play", "()V")
            .native_method("stop", "()V")
            .native_method("setCheckpoints", &format!("([L{};)V", CHECKPOINT_CLASS))
            .native_method("finalize", "()V")
            .static_method("test", &format!("({})V", string), |call| {
                let heap = call.heap();
                match heap.new_object(SOUND_CLASS, &format!("(L{};)V", STRING_CLASS), &[call.arg(0)?.clone()]) {
                    Ok(sound) => {
                        heap.call_virtual(&sound, "play", "()V", &[])?;
                    }
                    Err(thrown) if thrown.is_instance_of(heap, SOUND_EXCEPTION) => {
                        tracing::warn!("NativeSound.test: {}", thrown);
                        return Ok(ManagedValue::Void);
                    }
                    Err(thrown) => return Err(thrown),
                }
                // 最后一个引用已经丢弃，回收后播放停止
                heap.collect_fully();
                Ok(ManagedValue::Void)
            })
            .build()?,
    )?;
    Ok(())
}

/// 注册工厂并绑定活类
pub fn install(heap: &Heap, bridge: &Bridge) -> anyhow::Result<SoundClasses> {
    define_classes(heap)?;
    bridge.lifecycle().register_factory(SCHEME, NativeSound::open);

    let checkpoint = bridge.bind_wrapper(
        &ClassBinding::new(CHECKPOINT_CLASS)
            .constructor("new", &format!("(JL{};)V", OBJECT_CLASS))
            .field("time", "time", "J")
            .field("data", "data", &format!("L{};", OBJECT_CLASS)),
    )?;

    let string = format!("L{};", STRING_CLASS);
    let checkpoints_class = Arc::clone(&checkpoint);
    let sound = bridge.bind_live(
        LiveClassBinding::<NativeSound>::new(SOUND_CLASS)
            .constructor("new", &format!("({})V", string))
            .method("play", "play", "()V")
            .method("stop", "stop", "()V")
            .method("getPath", "getPath", &format!("(){}", string))
            .method("setCheckpoints", "setCheckpoints", &format!("([L{};)V", CHECKPOINT_CLASS))
            .constructor_callback("construct", &format!("({})V", string))
            .callback("getPath", &format!("(){}", string), |sound, ctx, _| {
                ctx.bridge().new_string(sound.path())
            })
            .callback("play", "()V", |sound, _, _| {
                sound.play();
                Ok(NativeValue::Void)
            })
            .callback("stop", "()V", |sound, _, _| {
                sound.stop()?;
                Ok(NativeValue::Void)
            })
            .callback(
                "setCheckpoints",
                &format!("([L{};)V", CHECKPOINT_CLASS),
                move |sound, ctx, args| {
                    sound.set_checkpoints(ctx, &checkpoints_class, &args[0])?;
                    Ok(NativeValue::Void)
                },
            ),
    )?;
    Ok(SoundClasses { sound, checkpoint })
}

#[cfg(test)]
mod tests {
    use super::*;
    use livebind_core::config::BridgeSettings;
    use livebind_core::ffi::LifecycleState;
    use livebind_core::runtime::ManagedRuntime;

    fn setup() -> (Arc<Heap>, Bridge, SoundClasses) {
        let heap = Heap::new();
        let bridge = Bridge::new(heap.runtime().unwrap(), BridgeSettings::default());
        let classes = install(&heap, &bridge).unwrap();
        (heap, bridge, classes)
    }

    #[test]
    fn test_path_and_stop_without_play() {
        let (_heap, bridge, classes) = setup();
        let sound = classes.new_sound(&bridge, "sound:/unit/path.wav").unwrap();

        let path = bridge.call(&classes.sound, "getPath", Some(&sound), &[]).unwrap();
        assert_eq!(bridge.string_value(&path).unwrap().as_deref(), Some("/unit/path.wav"));

        // 未播放时 stop 抛出 NativeSoundException
        match bridge.call(&classes.sound, "stop", Some(&sound), &[]).unwrap_err() {
            BridgeError::Crossing(record) => {
                assert_eq!(record.class_name.as_deref(), Some(SOUND_EXCEPTION));
                assert_eq!(record.message, "Sound is not playing.");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_empty_path_cannot_open() {
        let (_heap, bridge, sounds) = setup();
        match sounds.new_sound(&bridge, "sound:").unwrap_err() {
            BridgeError::Crossing(record) => {
                assert_eq!(record.class_name.as_deref(), Some(SOUND_EXCEPTION));
                assert_eq!(record.message, "Can't open file.");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(bridge.registry().live_count(), 0);
        assert_eq!(bridge.lifecycle().stats().construction_failures, 1);
    }

    #[test]
    fn test_open_failure_is_catchable_as_sound_exception() {
        let (heap, _bridge, _sounds) = setup();
        let tag = heap.new_string("sound:").unwrap();
        let thrown = heap
            .new_object(SOUND_CLASS, &format!("(L{};)V", STRING_CLASS), &[ManagedValue::object(&tag)])
            .unwrap_err();
        assert_eq!(thrown.class_name, SOUND_EXCEPTION);
        assert_eq!(thrown.message, "Can't open file.");
        assert!(thrown.is_instance_of(&*heap, SOUND_EXCEPTION));
        assert!(thrown.is_instance_of(&*heap, classes::EXCEPTION));

        // 托管 test 方法捕获 NativeSoundException 后正常返回
        heap.call_static(
            SOUND_CLASS,
            "test",
            &format!("(L{};)V", STRING_CLASS),
            &[ManagedValue::object(&tag)],
        )
        .unwrap();
    }

    #[test]
    fn test_release_stops_playback() {
        let (_heap, bridge, classes) = setup();
        let sound = classes.new_sound(&bridge, "sound:/unit/release.wav").unwrap();
        bridge.call(&classes.sound, "play", Some(&sound), &[]).unwrap();
        assert!(is_playing("/unit/release.wav"));

        assert!(bridge.release(&sound));
        assert!(!is_playing("/unit/release.wav"));
        assert_eq!(bridge.state(&sound), LifecycleState::Destroyed);
    }
}
