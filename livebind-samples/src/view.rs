//! 可覆写绘制的 `ui/LiveView`
//!
//! 托管 `ui/View.onDraw` 绘制默认背景。`ui/LiveView` 把 `onDraw` 声明为 native，
//! 私有的 `superOnDraw` 是回到默认实现的 super 选择器。
//! 原生实例由标签选择：`custom:<rgb>` 先调用 super 再填充颜色，`plain` 不覆写。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use livebind_core::core::types::STRING_CLASS;
use livebind_core::ffi::{
    BoundClass, Bridge, CallContext, ClassBinding, ConstructRequest, LiveClassBinding, NativeObject, NativeValue,
    SuperSelector,
};
use livebind_core::runtime::{GlobalRef, Heap, ManagedClass, ManagedValue};
use livebind_core::{BridgeError, BridgeResult};

pub const CANVAS_CLASS: &str = "ui/Canvas";
pub const VIEW_CLASS: &str = "ui/View";
pub const LIVE_VIEW_CLASS: &str = "ui/LiveView";

/// `ui/View` 的默认背景色
pub const DEFAULT_BACKGROUND: i32 = 0x00FF_FFFF;

const ON_DRAW: &str = "(Lui/Canvas;)V";

/// 原生侧的画布包装
pub struct Canvas<'a> {
    bridge: &'a Bridge,
    class: &'a BoundClass,
    object: &'a GlobalRef,
}

impl<'a> Canvas<'a> {
    pub fn object(&self) -> &'a GlobalRef {
        self.object
    }

    pub fn draw_color(&self, color: i32) -> BridgeResult<()> {
        self.bridge
            .call(self.class, "drawColor", Some(self.object), &[NativeValue::Int(color)])
            .map(|_| ())
    }
}

/// 视图的原生行为
pub trait ViewBehavior: Send + Sync {
    /// 默认回到托管实现
    fn on_draw(&self, ctx: &CallContext<'_>, canvas: &Canvas<'_>) -> BridgeResult<()> {
        ctx.call_super(&[NativeValue::object(canvas.object())]).map(|_| ())
    }
}

/// 先画背景再填充自己的颜色
pub struct CustomView {
    pub color: i32,
}

impl ViewBehavior for CustomView {
    fn on_draw(&self, ctx: &CallContext<'_>, canvas: &Canvas<'_>) -> BridgeResult<()> {
        ctx.call_super(&[NativeValue::object(canvas.object())])?;
        canvas.draw_color(self.color)
    }
}

/// 没有覆写的视图
pub struct PlainView;

impl ViewBehavior for PlainView {}

/// `ui/LiveView` 的原生实例
pub struct NativeView {
    behavior: Box<dyn ViewBehavior>,
    draws: AtomicUsize,
}

impl NativeView {
    pub fn new(behavior: Box<dyn ViewBehavior>) -> Self {
        Self {
            behavior,
            draws: AtomicUsize::new(0),
        }
    }

    pub fn draws(&self) -> usize {
        self.draws.load(Ordering::SeqCst)
    }

    fn from_tag(request: &ConstructRequest<'_>) -> BridgeResult<Self> {
        let behavior: Box<dyn ViewBehavior> = match request.scheme {
            "plain" => Box::new(PlainView),
            _ => {
                let color = request.argument.unwrap_or_default().trim_start_matches('#');
                let color = i32::from_str_radix(color, 16)
                    .map_err(|_| BridgeError::argument(format!("'{}' is not a hex color", color)))?;
                Box::new(CustomView { color })
            }
        };
        Ok(Self::new(behavior))
    }
}

impl NativeObject for NativeView {}

#[derive(Clone)]
pub struct ViewClasses {
    pub canvas: Arc<BoundClass>,
    pub view: Arc<BoundClass>,
    pub live: Arc<BoundClass>,
}

impl ViewClasses {
    pub fn new_canvas(&self, bridge: &Bridge) -> BridgeResult<GlobalRef> {
        bridge.new_object(&self.canvas, "new", &[])
    }

    /// `new LiveView(tag)`，标签缺失或未知时构造失败
    pub fn new_live_view(&self, bridge: &Bridge, tag: Option<&str>) -> BridgeResult<GlobalRef> {
        let tag = match tag {
            Some(tag) => bridge.new_string(tag)?,
            None => NativeValue::null(),
        };
        bridge.new_object(&self.live, "new", &[tag])
    }

    /// 通过基类 `ui/View` 的绑定绘制
    pub fn draw(&self, bridge: &Bridge, view: &GlobalRef, canvas: &GlobalRef) -> BridgeResult<()> {
        bridge
            .call(&self.view, "draw", Some(view), &[NativeValue::object(canvas)])
            .map(|_| ())
    }

    /// 画布上的 (层数, 最后一次颜色)
    pub fn canvas_state(&self, bridge: &Bridge, canvas: &GlobalRef) -> BridgeResult<(i32, i32)> {
        let layers = bridge.get_field(&self.canvas, "layers", canvas)?.get::<i32>()?;
        let color = bridge.get_field(&self.canvas, "color", canvas)?.get::<i32>()?;
        Ok((layers, color))
    }
}

pub fn define_classes(heap: &Heap) -> anyhow::Result<()> {
    heap.define_class(
        ManagedClass::builder(CANVAS_CLASS)
            .field("layers", "I")
            .field("color", "I")
            .constructor("()V", |_| Ok(ManagedValue::Void))
            .method("drawColor", "(I)V", |call| {
                let layers = call.field("layers")?.as_int().unwrap_or(0);
                call.set_field("layers", ManagedValue::Int(layers + 1))?;
                call.set_field("color", ManagedValue::Int(call.int_arg(0)?))?;
                Ok(ManagedValue::Void)
            })
            .build()?,
    )?;
    heap.define_class(
        ManagedClass::builder(VIEW_CLASS)
            .field("background", "I")
            .constructor("()V", |call| {
                call.set_field("background", ManagedValue::Int(DEFAULT_BACKGROUND))?;
                Ok(ManagedValue::Void)
            })
            .method("onDraw", ON_DRAW, |call| {
                let canvas = call
                    .object_arg(0)?
                    .ok_or_else(|| livebind_core::Throwable::null_pointer("canvas is null"))?;
                let background = call.field("background")?;
                call.heap().call_virtual(canvas, "drawColor", "(I)V", &[background])
            })
            .method("draw", ON_DRAW, |call| call.call_this("onDraw", ON_DRAW, &[call.arg(0)?.clone()]))
            .build()?,
    )?;

    let string = format!("L{};", STRING_CLASS);
    heap.define_class(
        ManagedClass::builder(LIVE_VIEW_CLASS)
            .extends(VIEW_CLASS)
            .constructor(&format!("({})V", string), |call| {
                call.call_super("<init>", "()V", &[])?;
                call.call_this("setNativeInstance", &format!("(L{};)V", STRING_CLASS), &[call.arg(0)?.clone()])
            })
            .native_method("setNativeInstance", &format!("({})V", string))
            .native_method("onDraw", ON_DRAW)
            // onDraw 的原生默认实现通过它回到父类
            .private_method("superOnDraw", ON_DRAW, |call| {
                call.call_super("onDraw", ON_DRAW, &[call.arg(0)?.clone()])
            })
            .native_method("finalize", "()V")
            .build()?,
    )?;
    Ok(())
}

pub fn install(heap: &Heap, bridge: &Bridge) -> anyhow::Result<ViewClasses> {
    define_classes(heap)?;
    bridge.lifecycle().register_factory("custom", NativeView::from_tag);
    bridge.lifecycle().register_factory("plain", NativeView::from_tag);

    let canvas = bridge.bind_wrapper(
        &ClassBinding::new(CANVAS_CLASS)
            .constructor("new", "()V")
            .method("drawColor", "drawColor", "(I)V")
            .field("layers", "layers", "I")
            .field("color", "color", "I"),
    )?;
    let view = bridge.bind_wrapper(
        &ClassBinding::new(VIEW_CLASS)
            .method("draw", "draw", ON_DRAW)
            .method("onDraw", "onDraw", ON_DRAW),
    )?;

    let string = format!("L{};", STRING_CLASS);
    let canvas_class = Arc::clone(&canvas);
    let live = bridge.bind_live(
        LiveClassBinding::<NativeView>::new(LIVE_VIEW_CLASS)
            .constructor("new", &format!("({})V", string))
            .constructor_callback("setNativeInstance", &format!("({})V", string))
            .override_method(
                "onDraw",
                ON_DRAW,
                SuperSelector::method("superOnDraw"),
                move |view, ctx, args| {
                    let object = args[0]
                        .as_object()
                        .ok_or_else(|| BridgeError::argument("canvas is null"))?;
                    let canvas = Canvas {
                        bridge: ctx.bridge(),
                        class: &canvas_class,
                        object,
                    };
                    view.draws.fetch_add(1, Ordering::SeqCst);
                    view.behavior.on_draw(ctx, &canvas)?;
                    Ok(NativeValue::Void)
                },
            ),
    )?;
    Ok(ViewClasses { canvas, view, live })
}
