//! 一致性用例
//!
//! - `Callee`: 每种基本类型及 `Object` 的静态/实例 get/set，以及 `select*` 重载
//! - `Array`: 数组的往返
//! - `LiveClass`: 各种形态的回调，以及经父类终结器链完成的实例计数

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use livebind_core::core::types::{OBJECT_CLASS, STRING_CLASS};
use livebind_core::ffi::{BoundClass, Bridge, ClassBinding, LiveClassBinding, NativeObject, NativeValue};
use livebind_core::runtime::{GlobalRef, Heap, ManagedClass, ManagedRuntime, ManagedValue, Throwable};
use livebind_core::{BridgeError, BridgeResult, ValueType};

pub const CALLEE_CLASS: &str = "Callee";
pub const ARRAY_CLASS: &str = "Array";
pub const LIVE_BASE_CLASS: &str = "LiveClassBase";
pub const LIVE_CLASS: &str = "LiveClass";
pub const CALLER_CLASS: &str = "LiveClass$Caller";
pub const COUNTED_CLASS: &str = "LiveClass$Counted";

pub const TEST_BOOL: bool = true;
pub const TEST_BYTE: i8 = 0xFAu8 as i8;
pub const TEST_CHAR: u16 = 0x1022;
pub const TEST_SHORT: i16 = 0x551E;
pub const TEST_INT: i32 = 0xFEFE_1111u32 as i32;
pub const TEST_LONG: i64 = 0xF0FF_FFFA_AFFF_FF1Fu64 as i64;
pub const TEST_FLOAT: f32 = 232323.222e22;
pub const TEST_DOUBLE: f64 = 982.343e-159;
pub const TEST_STRING: &str = "Raz, raz, raz.";

/// `select*` 的参数顺序
pub const SELECT_SIGNATURE: &str = "(IZSCJFDLcore/Object;B)";
pub const PRIMITIVE_CALLBACK: &str = "(ZDCBSIJF)J";

/// (名称, 描述符, 在 select 参数中的位置)
const KINDS: [(&str, &str, usize); 9] = [
    ("Boolean", "Z", 1),
    ("Byte", "B", 8),
    ("Char", "C", 3),
    ("Short", "S", 2),
    ("Int", "I", 0),
    ("Long", "J", 4),
    ("Float", "F", 5),
    ("Double", "D", 6),
    ("Object", "Lcore/Object;", 7),
];

fn string_type() -> String {
    format!("L{};", STRING_CLASS)
}

// ---- Callee ----

fn define_callee(heap: &Heap) -> anyhow::Result<()> {
    let mut builder = ManagedClass::builder(CALLEE_CLASS);
    for (name, desc, position) in KINDS {
        let static_field = format!("static{}Field", name);
        let field = format!("{}Field", name.to_lowercase());
        builder = builder.static_field(&static_field, desc).field(&field, desc);

        let get = static_field.clone();
        builder = builder.static_method(&format!("getStatic{}", name), &format!("(){}", desc), move |call| {
            call.static_field(&get)
        });
        let set = static_field;
        builder = builder.static_method(&format!("setStatic{}", name), &format!("({})V", desc), move |call| {
            call.set_static_field(&set, call.arg(0)?.clone())?;
            Ok(ManagedValue::Void)
        });

        let get = field.clone();
        builder = builder.method(&format!("get{}", name), &format!("(){}", desc), move |call| call.field(&get));
        let set = field;
        builder = builder.method(&format!("set{}", name), &format!("({})V", desc), move |call| {
            call.set_field(&set, call.arg(0)?.clone())?;
            Ok(ManagedValue::Void)
        });

        builder = builder.static_method(
            &format!("select{}", name),
            &format!("{}{}", SELECT_SIGNATURE, desc),
            move |call| Ok(call.arg(position)?.clone()),
        );
    }
    heap.define_class(builder.constructor("()V", |_| Ok(ManagedValue::Void)).build()?)?;
    Ok(())
}

fn callee_binding() -> ClassBinding {
    let mut binding = ClassBinding::new(CALLEE_CLASS).constructor("new", "()V");
    for (name, desc, _) in KINDS {
        let getter = format!("getStatic{}", name);
        let setter = format!("setStatic{}", name);
        binding = binding
            .method(&getter, &format!("+{}", getter), &format!("(){}", desc))
            .method(&setter, &format!("+{}", setter), &format!("({})V", desc));
        let getter = format!("get{}", name);
        let setter = format!("set{}", name);
        binding = binding
            .method(&getter, &getter, &format!("(){}", desc))
            .method(&setter, &setter, &format!("({})V", desc));
        let select = format!("select{}", name);
        binding = binding.method(&select, &format!("+{}", select), &format!("{}{}", SELECT_SIGNATURE, desc));
    }
    binding
}

// ---- Array ----

fn define_array(heap: &Heap) -> anyhow::Result<()> {
    heap.define_class(
        ManagedClass::builder(ARRAY_CLASS)
            .static_method("factorial", "(I)[J", |call| {
                let length = call.int_arg(0)?;
                if length < 0 {
                    return Err(Throwable::illegal_argument(format!("negative array length {}", length)));
                }
                let mut f: i64 = 1;
                let items = (0..length as i64)
                    .map(|i| {
                        f = f.wrapping_mul(i + 1);
                        ManagedValue::Long(f)
                    })
                    .collect();
                Ok(ManagedValue::Ref(Some(call.heap().new_array(&ValueType::Long, items)?)))
            })
            .static_method("int2bits", "(I)[Z", |call| {
                let value = call.int_arg(0)?;
                let items = (0..32).map(|i| ManagedValue::bool(value & (1 << i) != 0)).collect();
                Ok(ManagedValue::Ref(Some(call.heap().new_array(&ValueType::Boolean, items)?)))
            })
            .static_method("bits2int", "([Z)I", |call| {
                let bits = call
                    .object_arg(0)?
                    .ok_or_else(|| Throwable::null_pointer("bits is null"))?;
                let items = call
                    .heap()
                    .array_items(bits)
                    .ok_or_else(|| Throwable::illegal_argument("bits is not an array"))?;
                let value = items
                    .iter()
                    .take(32)
                    .enumerate()
                    .filter(|(_, bit)| bit.as_bool() == Some(true))
                    .fold(0i32, |value, (i, _)| value | (1 << i));
                Ok(ManagedValue::Int(value))
            })
            .build()?,
    )?;
    Ok(())
}

// ---- LiveClass ----

/// `LiveClass` 的原生实例
pub struct LiveInstance {
    instances: Arc<AtomicI32>,
    events: Mutex<Vec<String>>,
}

impl LiveInstance {
    pub fn new(instances: Arc<AtomicI32>) -> Self {
        instances.fetch_add(1, Ordering::SeqCst);
        Self {
            instances,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn has_event(&self, event: &str) -> bool {
        self.events.lock().iter().any(|e| e == event)
    }

    fn record(&self, event: &str) {
        self.events.lock().push(event.to_string());
    }
}

impl NativeObject for LiveInstance {
    fn on_destroy(&self) {
        self.instances.fetch_sub(1, Ordering::SeqCst);
    }
}

fn test_field(call: &livebind_core::runtime::ManagedCall<'_>) -> Result<GlobalRef, Throwable> {
    call.field("test")?
        .as_object()
        .cloned()
        .ok_or_else(|| Throwable::null_pointer("caller has no test object"))
}

fn define_live(heap: &Heap) -> anyhow::Result<()> {
    let string = string_type();
    let live = format!("L{};", LIVE_CLASS);

    heap.define_class(
        ManagedClass::builder(LIVE_BASE_CLASS)
            .abstract_method("onFinalize", "()V")
            .method("finalize", "()V", |call| call.call_this("onFinalize", "()V", &[]))
            .build()?,
    )?;

    heap.define_class(
        ManagedClass::builder(COUNTED_CLASS)
            .field("message", &string)
            .static_field("instanceCount", "I")
            .constructor(&format!("({})V", string), |call| {
                call.set_field("message", call.arg(0)?.clone())?;
                let count = call.static_field("instanceCount")?.as_int().unwrap_or(0);
                call.set_static_field("instanceCount", ManagedValue::Int(count + 1))?;
                Ok(ManagedValue::Void)
            })
            .method("toString", &format!("(){}", string), |call| call.field("message"))
            .method("finalize", "()V", |call| {
                let count = call.static_field("instanceCount")?.as_int().unwrap_or(0);
                call.set_static_field("instanceCount", ManagedValue::Int(count - 1))?;
                Ok(ManagedValue::Void)
            })
            .build()?,
    )?;

    let object_to_string = format!("(){}", string);
    heap.define_class(
        ManagedClass::builder(CALLER_CLASS)
            .field("test", &live)
            .constructor("()V", |_| Ok(ManagedValue::Void))
            .method("callSimpleCallback", "()V", |call| {
                call.heap().call_virtual(&test_field(call)?, "simpleCallback", "()V", &[])
            })
            .method("callPrimitiveCallback", PRIMITIVE_CALLBACK, |call| {
                call.heap()
                    .call_virtual(&test_field(call)?, "primitiveCallback", PRIMITIVE_CALLBACK, call.args())
            })
            .method("callObjectCallback", &object_to_string, |call| {
                let heap = call.heap();
                let object = heap.call_virtual(&test_field(call)?, "objectCallback", &format!("()L{};", OBJECT_CLASS), &[])?;
                let object = object
                    .as_object()
                    .ok_or_else(|| Throwable::null_pointer("objectCallback returned null"))?;
                heap.call_virtual(object, "toString", &format!("()L{};", STRING_CLASS), &[])
            })
            .method("callExceptionCallback", &format!("({}){}", string, string), |call| {
                let test = test_field(call)?;
                let descriptor = format!("(L{};)V", STRING_CLASS);
                match call.heap().call_virtual(&test, "exceptionCallback", &descriptor, &[call.arg(0)?.clone()]) {
                    Ok(_) => Ok(ManagedValue::null()),
                    Err(thrown) => call.new_string(&thrown.message),
                }
            })
            .method("callNonStaticCallback", "()V", |call| {
                let test = test_field(call)?;
                call.heap().call_virtual(
                    &test,
                    "nonStaticCallback",
                    &format!("(L{};)V", LIVE_CLASS),
                    &[ManagedValue::object(&test)],
                )
            })
            .static_method("callStaticSimpleCallback", "()V", |call| {
                call.heap().call_static(LIVE_CLASS, "staticSimpleCallback", "()V", &[])
            })
            .build()?,
    )?;

    heap.define_class(
        ManagedClass::builder(LIVE_CLASS)
            .extends(LIVE_BASE_CLASS)
            .static_field("instanceCount", "I")
            .constructor("()V", |call| {
                let count = call.static_field("instanceCount")?.as_int().unwrap_or(0);
                call.set_static_field("instanceCount", ManagedValue::Int(count + 1))?;
                Ok(ManagedValue::Void)
            })
            .method("getCaller", &format!("()L{};", CALLER_CLASS), |call| {
                let heap = call.heap();
                let caller = heap.new_object(CALLER_CLASS, "()V", &[])?;
                heap.set_field_value(&caller, "test", ManagedValue::object(call.this()?))?;
                Ok(ManagedValue::object(&caller))
            })
            .private_method("throwException", &format!("({})V", string), |call| {
                let message = call.string_arg(0)?.unwrap_or_default();
                Err(Throwable::runtime(message))
            })
            .method("onFinalize", "()V", |call| {
                let count = call.static_field("instanceCount")?.as_int().unwrap_or(0);
                call.set_static_field("instanceCount", ManagedValue::Int(count - 1))?;
                Ok(ManagedValue::Void)
            })
            .native_method("simpleCallback", "()V")
            .native_method("primitiveCallback", PRIMITIVE_CALLBACK)
            .native_method("objectCallback", &format!("()L{};", OBJECT_CLASS))
            .native_method("exceptionCallback", &format!("({})V", string))
            .native_method("nonStaticCallback", &format!("({})V", live))
            .static_native_method("staticSimpleCallback", "()V")
            .native_method("finalize", "()V")
            .build()?,
    )?;
    Ok(())
}

fn check_primitives(args: &[NativeValue]) -> BridgeResult<()> {
    let matches = args[0].get::<bool>()? == TEST_BOOL
        && args[1].get::<f64>()? == TEST_DOUBLE
        && args[2].get::<u16>()? == TEST_CHAR
        && args[3].get::<i8>()? == TEST_BYTE
        && args[4].get::<i16>()? == TEST_SHORT
        && args[5].get::<i32>()? == TEST_INT
        && args[6].get::<i64>()? == TEST_LONG
        && args[7].get::<f32>()? == TEST_FLOAT;
    if matches {
        Ok(())
    } else {
        Err(BridgeError::argument("primitive callback received unexpected values"))
    }
}

/// 绑定后的一致性类
#[derive(Clone)]
pub struct Conformance {
    pub callee: Arc<BoundClass>,
    pub array: Arc<BoundClass>,
    pub live: Arc<BoundClass>,
    pub caller: Arc<BoundClass>,
    pub counted: Arc<BoundClass>,
    /// 静态回调的调用次数
    pub static_calls: Arc<AtomicUsize>,
    /// 存活的原生 `LiveInstance` 数
    pub native_instances: Arc<AtomicI32>,
}

impl Conformance {
    /// 原生先创建的 `LiveClass`
    pub fn new_live(&self, bridge: &Bridge) -> BridgeResult<GlobalRef> {
        let instance = LiveInstance::new(Arc::clone(&self.native_instances));
        bridge.new_live(&self.live, "new", &[], instance)
    }

    pub fn caller_of(&self, bridge: &Bridge, live: &GlobalRef) -> BridgeResult<GlobalRef> {
        let caller = bridge.call(&self.live, "getCaller", Some(live), &[])?;
        caller
            .as_object()
            .cloned()
            .ok_or_else(|| BridgeError::argument("getCaller returned null"))
    }

    /// 托管侧的 `LiveClass.instanceCount`
    pub fn managed_instances(&self, bridge: &Bridge) -> BridgeResult<i32> {
        bridge.get_static_field(&self.live, "instanceCount")?.get::<i32>()
    }

    pub fn counted_instances(&self, bridge: &Bridge) -> BridgeResult<i32> {
        bridge.get_static_field(&self.counted, "instanceCount")?.get::<i32>()
    }
}

pub fn define_classes(heap: &Heap) -> anyhow::Result<()> {
    define_callee(heap)?;
    define_array(heap)?;
    define_live(heap)
}

pub fn install(heap: &Heap, bridge: &Bridge) -> anyhow::Result<Conformance> {
    define_classes(heap)?;
    let string = string_type();

    let callee = bridge.bind_wrapper(&callee_binding())?;
    let array = bridge.bind_wrapper(
        &ClassBinding::new(ARRAY_CLASS)
            .method("factorial", "+factorial", "(I)[J")
            .method("int2bits", "+int2bits", "(I)[Z")
            .method("bits2int", "+bits2int", "([Z)I"),
    )?;
    let counted = bridge.bind_wrapper(
        &ClassBinding::new(COUNTED_CLASS)
            .constructor("new", &format!("({})V", string))
            .field("instanceCount", "+instanceCount", "I"),
    )?;
    let caller = bridge.bind_wrapper(
        &ClassBinding::new(CALLER_CLASS)
            .method("callSimpleCallback", "callSimpleCallback", "()V")
            .method("callPrimitiveCallback", "callPrimitiveCallback", PRIMITIVE_CALLBACK)
            .method("callObjectCallback", "callObjectCallback", &format!("(){}", string))
            .method("callExceptionCallback", "callExceptionCallback", &format!("({}){}", string, string))
            .method("callNonStaticCallback", "callNonStaticCallback", "()V")
            .method("callStaticSimpleCallback", "+callStaticSimpleCallback", "()V"),
    )?;

    let static_calls = Arc::new(AtomicUsize::new(0));
    let static_counter = Arc::clone(&static_calls);
    let counted_class = Arc::clone(&counted);
    let live = bridge.bind_live(
        LiveClassBinding::<LiveInstance>::new(LIVE_CLASS)
            .constructor("new", "()V")
            .method("getCaller", "getCaller", &format!("()L{};", CALLER_CLASS))
            .method("throwException", "throwException", &format!("({})V", string))
            .field("instanceCount", "+instanceCount", "I")
            .callback("simpleCallback", "()V", |live, _, _| {
                live.record("simpleCallback");
                Ok(NativeValue::Void)
            })
            .callback("primitiveCallback", PRIMITIVE_CALLBACK, |live, _, args| {
                check_primitives(args)?;
                live.record("primitiveCallback");
                Ok(NativeValue::Long(TEST_LONG))
            })
            .callback("objectCallback", &format!("()L{};", OBJECT_CLASS), move |live, ctx, _| {
                let message = ctx.bridge().new_string(TEST_STRING)?;
                let counted = ctx.bridge().new_object(&counted_class, "new", &[message])?;
                live.record("objectCallback");
                Ok(NativeValue::object(&counted))
            })
            .callback("exceptionCallback", &format!("({})V", string), |live, ctx, args| {
                live.record("exceptionCallback");
                // 托管异常原样穿回托管调用方
                ctx.call_this("throwException", args)
            })
            .callback("nonStaticCallback", &format!("(L{};)V", LIVE_CLASS), |live, ctx, args| {
                let other = args[0]
                    .as_object()
                    .ok_or_else(|| BridgeError::argument("other is null"))?;
                if !other.same_object(ctx.this()?) {
                    return Err(BridgeError::argument("nonStaticCallback expects the receiver itself"));
                }
                live.record("nonStaticCallback");
                Ok(NativeValue::Void)
            })
            .static_callback("staticSimpleCallback", "()V", move |_, _| {
                static_counter.fetch_add(1, Ordering::SeqCst);
                Ok(NativeValue::Void)
            }),
    )?;

    Ok(Conformance {
        callee,
        array,
        live,
        caller,
        counted,
        static_calls,
        native_instances: Arc::new(AtomicI32::new(0)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use livebind_core::config::BridgeSettings;
    use livebind_core::ffi::NativeArray;

    fn setup() -> (Arc<Heap>, Bridge, Conformance) {
        let heap = Heap::new();
        let bridge = Bridge::new(heap.runtime().unwrap(), BridgeSettings::default());
        let conformance = install(&heap, &bridge).unwrap();
        (heap, bridge, conformance)
    }

    #[test]
    fn test_static_int_round_trip() {
        let (_heap, bridge, c) = setup();
        bridge.call_static(&c.callee, "setStaticInt", &[NativeValue::Int(42)]).unwrap();
        assert_eq!(bridge.call_static(&c.callee, "getStaticInt", &[]).unwrap(), NativeValue::Int(42));
    }

    #[test]
    fn test_select_routes_by_return_type() {
        let (heap, bridge, c) = setup();
        let marker = heap.new_string("marker").unwrap();
        let args = [
            NativeValue::Int(TEST_INT),
            NativeValue::Bool(TEST_BOOL),
            NativeValue::Short(TEST_SHORT),
            NativeValue::Char(TEST_CHAR),
            NativeValue::Long(TEST_LONG),
            NativeValue::Float(TEST_FLOAT),
            NativeValue::Double(TEST_DOUBLE),
            NativeValue::object(&marker),
            NativeValue::Byte(TEST_BYTE),
        ];
        assert_eq!(bridge.call_static(&c.callee, "selectByte", &args).unwrap(), NativeValue::Byte(TEST_BYTE));
        assert_eq!(bridge.call_static(&c.callee, "selectLong", &args).unwrap(), NativeValue::Long(TEST_LONG));
        let object = bridge.call_static(&c.callee, "selectObject", &args).unwrap();
        assert!(object.as_object().unwrap().same_object(&marker));
    }

    #[test]
    fn test_arrays() {
        let (_heap, bridge, c) = setup();
        let factorial = bridge.call_static(&c.array, "factorial", &[NativeValue::Int(5)]).unwrap();
        assert_eq!(factorial.as_array().unwrap().to_vec::<i64>().unwrap(), vec![1, 2, 6, 24, 120]);

        let bits = bridge.call_static(&c.array, "int2bits", &[NativeValue::Int(TEST_INT)]).unwrap();
        assert_eq!(bits.as_array().unwrap().len(), 32);
        let back = bridge.call_static(&c.array, "bits2int", &[bits]).unwrap();
        assert_eq!(back, NativeValue::Int(TEST_INT));

        let empty = bridge.call_static(&c.array, "factorial", &[NativeValue::Int(0)]).unwrap();
        assert!(empty.as_array().unwrap().is_empty());

        let manual = NativeArray::from_slice(&[true, false, true]);
        let value = bridge.call_static(&c.array, "bits2int", &[NativeValue::from(manual)]).unwrap();
        assert_eq!(value, NativeValue::Int(0b101));
    }
}
