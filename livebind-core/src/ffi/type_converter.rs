//! 类型转换模块
//!
//! 原生值 [`NativeValue`] 与托管值 [`ManagedValue`] 之间按声明类型做无损转换。
//! 引用保持对象身份；数组逐元素复制到新分配的缓冲区。

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::handle_registry::Handle;
use crate::core::error::{BridgeError, BridgeResult};
use crate::core::types::ValueType;
use crate::runtime::{GlobalRef, ManagedRuntime, ManagedValue};

/// 原生侧看到的对象引用
#[derive(Debug, Clone, PartialEq)]
pub enum NativeRef {
    /// 活类实例：带句柄的代理
    Proxy { object: GlobalRef, handle: Handle },
    /// 其他托管对象
    Opaque(GlobalRef),
}

impl NativeRef {
    pub fn object(&self) -> &GlobalRef {
        match self {
            NativeRef::Proxy { object, .. } | NativeRef::Opaque(object) => object,
        }
    }

    pub fn handle(&self) -> Option<Handle> {
        match self {
            NativeRef::Proxy { handle, .. } => Some(*handle),
            NativeRef::Opaque(_) => None,
        }
    }

    pub fn into_object(self) -> GlobalRef {
        match self {
            NativeRef::Proxy { object, .. } | NativeRef::Opaque(object) => object,
        }
    }
}

/// 原生侧的值
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Void,
    Bool(bool),
    Byte(i8),
    /// UTF-16 code unit
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(Option<NativeRef>),
    Array(Option<NativeArray>),
}

impl NativeValue {
    pub fn null() -> Self {
        NativeValue::Object(None)
    }

    /// 不透明对象引用
    pub fn object(object: &GlobalRef) -> Self {
        NativeValue::Object(Some(NativeRef::Opaque(object.clone())))
    }

    pub fn default_for(ty: &ValueType) -> Self {
        match ty {
            ValueType::Void => NativeValue::Void,
            ValueType::Boolean => NativeValue::Bool(false),
            ValueType::Byte => NativeValue::Byte(0),
            ValueType::Char => NativeValue::Char(0),
            ValueType::Short => NativeValue::Short(0),
            ValueType::Int => NativeValue::Int(0),
            ValueType::Long => NativeValue::Long(0),
            ValueType::Float => NativeValue::Float(0.0),
            ValueType::Double => NativeValue::Double(0.0),
            ValueType::Object(_) => NativeValue::Object(None),
            ValueType::Array(_) => NativeValue::Array(None),
        }
    }

    /// 种类是否与声明类型一致
    pub fn matches(&self, ty: &ValueType) -> bool {
        match (self, ty) {
            (NativeValue::Array(Some(array)), ValueType::Array(element)) => array.element == **element,
            (NativeValue::Object(Some(_)), ValueType::Array(_)) => true,
            (NativeValue::Object(None) | NativeValue::Array(None), ValueType::Object(_) | ValueType::Array(_)) => {
                true
            }
            (NativeValue::Object(Some(_)), ValueType::Object(_)) => true,
            (NativeValue::Void, ValueType::Void)
            | (NativeValue::Bool(_), ValueType::Boolean)
            | (NativeValue::Byte(_), ValueType::Byte)
            | (NativeValue::Char(_), ValueType::Char)
            | (NativeValue::Short(_), ValueType::Short)
            | (NativeValue::Int(_), ValueType::Int)
            | (NativeValue::Long(_), ValueType::Long)
            | (NativeValue::Float(_), ValueType::Float)
            | (NativeValue::Double(_), ValueType::Double) => true,
            _ => false,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            NativeValue::Void => "void",
            NativeValue::Bool(_) => "boolean",
            NativeValue::Byte(_) => "byte",
            NativeValue::Char(_) => "char",
            NativeValue::Short(_) => "short",
            NativeValue::Int(_) => "int",
            NativeValue::Long(_) => "long",
            NativeValue::Float(_) => "float",
            NativeValue::Double(_) => "double",
            NativeValue::Object(_) => "object",
            NativeValue::Array(_) => "array",
        }
    }

    /// 类型化读取，例如 `value.get::<i64>()?`
    pub fn get<T: NativeType>(&self) -> BridgeResult<T> {
        T::from_native(self).ok_or_else(|| {
            BridgeError::argument(format!(
                "expected {} but got {}",
                T::value_type(),
                self.kind_name()
            ))
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, NativeValue::Object(None) | NativeValue::Array(None))
    }

    pub fn as_ref_object(&self) -> Option<&NativeRef> {
        match self {
            NativeValue::Object(Some(native)) => Some(native),
            _ => None,
        }
    }

    /// 对象或数组引用背后的托管对象
    pub fn as_object(&self) -> Option<&GlobalRef> {
        self.as_ref_object().map(NativeRef::object)
    }

    pub fn as_array(&self) -> Option<&NativeArray> {
        match self {
            NativeValue::Array(Some(array)) => Some(array),
            _ => None,
        }
    }
}

/// 带元素类型的一维数组
#[derive(Debug, Clone, PartialEq)]
pub struct NativeArray {
    element: ValueType,
    items: Vec<NativeValue>,
}

impl NativeArray {
    /// 按长度创建，元素为零值
    pub fn with_len(element: ValueType, len: usize) -> BridgeResult<Self> {
        check_element_type(&element)?;
        let items = vec![NativeValue::default_for(&element); len];
        Ok(Self { element, items })
    }

    pub fn from_items(element: ValueType, items: Vec<NativeValue>) -> BridgeResult<Self> {
        check_element_type(&element)?;
        if let Some((index, bad)) = items.iter().enumerate().find(|(_, item)| !item.matches(&element)) {
            return Err(BridgeError::argument(format!(
                "array element {} is a {}, expected {}",
                index,
                bad.kind_name(),
                element
            )));
        }
        Ok(Self { element, items })
    }

    pub fn from_slice<T: NativeType>(values: &[T]) -> Self {
        Self {
            element: T::value_type(),
            items: values.iter().map(|v| v.into_native()).collect(),
        }
    }

    pub fn to_vec<T: NativeType>(&self) -> BridgeResult<Vec<T>> {
        self.items.iter().map(NativeValue::get::<T>).collect()
    }

    pub fn element(&self) -> &ValueType {
        &self.element
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[NativeValue] {
        &self.items
    }

    pub fn into_items(self) -> Vec<NativeValue> {
        self.items
    }

    pub fn get(&self, index: usize) -> BridgeResult<&NativeValue> {
        self.items.get(index).ok_or_else(|| {
            BridgeError::argument(format!("index {} out of bounds for length {}", index, self.items.len()))
        })
    }

    pub fn set(&mut self, index: usize, value: NativeValue) -> BridgeResult<()> {
        if !value.matches(&self.element) {
            return Err(BridgeError::argument(format!(
                "cannot store {} into {} array",
                value.kind_name(),
                self.element
            )));
        }
        let len = self.items.len();
        let slot = self
            .items
            .get_mut(index)
            .ok_or_else(|| BridgeError::argument(format!("index {} out of bounds for length {}", index, len)))?;
        *slot = value;
        Ok(())
    }

    /// 整体覆盖，长度必须一致
    pub fn copy_from(&mut self, values: &[NativeValue]) -> BridgeResult<()> {
        if values.len() != self.items.len() {
            return Err(BridgeError::argument(format!(
                "array length mismatch: expected {}, got {}",
                self.items.len(),
                values.len()
            )));
        }
        if let Some(bad) = values.iter().find(|v| !v.matches(&self.element)) {
            return Err(BridgeError::argument(format!(
                "cannot store {} into {} array",
                bad.kind_name(),
                self.element
            )));
        }
        self.items.clone_from_slice(values);
        Ok(())
    }

    pub fn region(&self, start: usize, len: usize) -> BridgeResult<&[NativeValue]> {
        start
            .checked_add(len)
            .and_then(|end| self.items.get(start..end))
            .ok_or_else(|| {
                BridgeError::argument(format!(
                    "region {}..+{} out of bounds for length {}",
                    start,
                    len,
                    self.items.len()
                ))
            })
    }
}

fn check_element_type(element: &ValueType) -> BridgeResult<()> {
    match element {
        ValueType::Void | ValueType::Array(_) => Err(BridgeError::argument(format!(
            "unsupported array element type {}",
            element
        ))),
        _ => Ok(()),
    }
}

/// 可直接与 [`NativeValue`] 互转的标量类型
pub trait NativeType: Sized + Copy {
    fn value_type() -> ValueType;
    fn into_native(self) -> NativeValue;
    fn from_native(value: &NativeValue) -> Option<Self>;
}

macro_rules! native_type {
    ($ty:ty, $variant:ident, $value_type:expr) => {
        impl NativeType for $ty {
            fn value_type() -> ValueType {
                $value_type
            }

            fn into_native(self) -> NativeValue {
                NativeValue::$variant(self)
            }

            fn from_native(value: &NativeValue) -> Option<Self> {
                match value {
                    NativeValue::$variant(v) => Some(*v),
                    _ => None,
                }
            }
        }

        impl From<$ty> for NativeValue {
            fn from(value: $ty) -> Self {
                NativeValue::$variant(value)
            }
        }
    };
}

native_type!(bool, Bool, ValueType::Boolean);
native_type!(i8, Byte, ValueType::Byte);
native_type!(u16, Char, ValueType::Char);
native_type!(i16, Short, ValueType::Short);
native_type!(i32, Int, ValueType::Int);
native_type!(i64, Long, ValueType::Long);
native_type!(f32, Float, ValueType::Float);
native_type!(f64, Double, ValueType::Double);

impl From<NativeRef> for NativeValue {
    fn from(value: NativeRef) -> Self {
        NativeValue::Object(Some(value))
    }
}

impl From<NativeArray> for NativeValue {
    fn from(value: NativeArray) -> Self {
        NativeValue::Array(Some(value))
    }
}

/// 转换统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionStats {
    /// 托管到原生的转换次数
    pub to_native: u64,
    /// 原生到托管的转换次数
    pub to_managed: u64,
    /// 复制的数组元素数
    pub array_elements: u64,
    /// 失败次数
    pub failures: u64,
}

/// 类型转换器
pub struct TypeConverter {
    /// 转换统计
    stats: Mutex<ConversionStats>,
    /// 活类：其引用转换为带句柄的代理
    live_classes: RwLock<HashSet<String>>,
}

impl TypeConverter {
    /// 创建新的类型转换器
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(ConversionStats::default()),
            live_classes: RwLock::new(HashSet::new()),
        }
    }

    pub fn register_live_class(&self, class: &str) {
        self.live_classes.write().insert(class.to_string());
    }

    /// `class` 或其祖先是否是活类
    pub fn is_live_class(&self, runtime: &dyn ManagedRuntime, class: &str) -> bool {
        let live = self.live_classes.read();
        let mut current = Some(class.to_string());
        while let Some(name) = current {
            if live.contains(&name) {
                return true;
            }
            current = runtime.superclass_of(&name);
        }
        false
    }

    /// 托管值 -> 原生值
    pub fn to_native(
        &self,
        runtime: &dyn ManagedRuntime,
        value: &ManagedValue,
        ty: &ValueType,
    ) -> BridgeResult<NativeValue> {
        let result = self.convert_to_native(runtime, value, ty);
        let mut stats = self.stats.lock();
        match &result {
            Ok(_) => stats.to_native += 1,
            Err(_) => stats.failures += 1,
        }
        result
    }

    /// 原生值 -> 托管值
    pub fn to_managed(
        &self,
        runtime: &dyn ManagedRuntime,
        value: &NativeValue,
        ty: &ValueType,
    ) -> BridgeResult<ManagedValue> {
        let result = self.convert_to_managed(runtime, value, ty);
        let mut stats = self.stats.lock();
        match &result {
            Ok(_) => stats.to_managed += 1,
            Err(_) => stats.failures += 1,
        }
        result
    }

    /// 把托管数组复制进已分配的原生数组，长度必须一致
    pub fn copy_array_into(
        &self,
        runtime: &dyn ManagedRuntime,
        value: &ManagedValue,
        target: &mut NativeArray,
    ) -> BridgeResult<()> {
        let ty = ValueType::array_of(target.element().clone());
        match self.to_native(runtime, value, &ty)? {
            NativeValue::Array(Some(source)) => target.copy_from(source.items()),
            _ => Err(BridgeError::argument("cannot copy a null array")),
        }
    }

    /// 把原生数组写回已有的托管数组，长度必须一致
    pub fn write_managed_array(
        &self,
        runtime: &dyn ManagedRuntime,
        array: &GlobalRef,
        source: &NativeArray,
    ) -> BridgeResult<()> {
        let items = source
            .items()
            .iter()
            .map(|item| self.to_managed(runtime, item, source.element()))
            .collect::<BridgeResult<Vec<_>>>()?;
        runtime
            .write_array(array, items)
            .map_err(|thrown| BridgeError::argument(thrown.message))
    }

    pub fn stats(&self) -> ConversionStats {
        self.stats.lock().clone()
    }

    fn convert_to_native(
        &self,
        runtime: &dyn ManagedRuntime,
        value: &ManagedValue,
        ty: &ValueType,
    ) -> BridgeResult<NativeValue> {
        let converted = match (ty, value) {
            (ValueType::Void, ManagedValue::Void) => NativeValue::Void,
            (ValueType::Boolean, ManagedValue::Boolean(raw)) => match raw {
                0 => NativeValue::Bool(false),
                1 => NativeValue::Bool(true),
                other => {
                    return Err(BridgeError::argument(format!(
                        "managed boolean {} is neither 0 nor 1",
                        other
                    )))
                }
            },
            (ValueType::Byte, ManagedValue::Byte(v)) => NativeValue::Byte(*v),
            (ValueType::Char, ManagedValue::Char(v)) => NativeValue::Char(*v),
            (ValueType::Short, ManagedValue::Short(v)) => NativeValue::Short(*v),
            (ValueType::Int, ManagedValue::Int(v)) => NativeValue::Int(*v),
            (ValueType::Long, ManagedValue::Long(v)) => NativeValue::Long(*v),
            (ValueType::Float, ManagedValue::Float(v)) => NativeValue::Float(*v),
            (ValueType::Double, ManagedValue::Double(v)) => NativeValue::Double(*v),
            (ValueType::Object(_), ManagedValue::Ref(None)) => NativeValue::Object(None),
            (ValueType::Array(_), ManagedValue::Ref(None)) => NativeValue::Array(None),
            (ValueType::Object(class), ManagedValue::Ref(Some(object))) => {
                check_instance(runtime, object, class)?;
                if self.is_live_class(runtime, class) {
                    NativeValue::Object(Some(NativeRef::Proxy {
                        object: object.clone(),
                        handle: Handle::from_raw(runtime.handle_slot(object.id())),
                    }))
                } else {
                    NativeValue::Object(Some(NativeRef::Opaque(object.clone())))
                }
            }
            (ValueType::Array(element), ManagedValue::Ref(Some(object))) => {
                check_instance(runtime, object, &ty.descriptor())?;
                let items = runtime
                    .array_items(object)
                    .ok_or_else(|| BridgeError::argument(format!("{} is not an array", object.id())))?;
                let natives = items
                    .iter()
                    .map(|item| self.convert_to_native(runtime, item, element))
                    .collect::<BridgeResult<Vec<_>>>()?;
                self.stats.lock().array_elements += natives.len() as u64;
                NativeValue::Array(Some(NativeArray {
                    element: (**element).clone(),
                    items: natives,
                }))
            }
            (ty, value) => {
                return Err(BridgeError::argument(format!(
                    "expected {} but got {}",
                    ty,
                    value.kind_name()
                )))
            }
        };
        Ok(converted)
    }

    fn convert_to_managed(
        &self,
        runtime: &dyn ManagedRuntime,
        value: &NativeValue,
        ty: &ValueType,
    ) -> BridgeResult<ManagedValue> {
        let converted = match (ty, value) {
            (ValueType::Void, NativeValue::Void) => ManagedValue::Void,
            (ValueType::Boolean, NativeValue::Bool(v)) => ManagedValue::bool(*v),
            (ValueType::Byte, NativeValue::Byte(v)) => ManagedValue::Byte(*v),
            (ValueType::Char, NativeValue::Char(v)) => ManagedValue::Char(*v),
            (ValueType::Short, NativeValue::Short(v)) => ManagedValue::Short(*v),
            (ValueType::Int, NativeValue::Int(v)) => ManagedValue::Int(*v),
            (ValueType::Long, NativeValue::Long(v)) => ManagedValue::Long(*v),
            (ValueType::Float, NativeValue::Float(v)) => ManagedValue::Float(*v),
            (ValueType::Double, NativeValue::Double(v)) => ManagedValue::Double(*v),
            (ValueType::Object(_) | ValueType::Array(_), NativeValue::Object(None) | NativeValue::Array(None)) => {
                ManagedValue::Ref(None)
            }
            (ValueType::Object(class), NativeValue::Object(Some(native))) => {
                check_instance(runtime, native.object(), class)?;
                ManagedValue::Ref(Some(native.object().clone()))
            }
            // 已经是托管数组的引用，保持身份
            (ValueType::Array(_), NativeValue::Object(Some(native))) => {
                check_instance(runtime, native.object(), &ty.descriptor())?;
                ManagedValue::Ref(Some(native.object().clone()))
            }
            (ValueType::Array(element), NativeValue::Array(Some(array))) => {
                if array.element() != element.as_ref() {
                    return Err(BridgeError::argument(format!(
                        "expected {} but got an array of {}",
                        ty,
                        array.element()
                    )));
                }
                let items = array
                    .items()
                    .iter()
                    .map(|item| self.convert_to_managed(runtime, item, element))
                    .collect::<BridgeResult<Vec<_>>>()?;
                self.stats.lock().array_elements += items.len() as u64;
                let object = runtime
                    .new_array(element, items)
                    .map_err(|thrown| BridgeError::argument(thrown.message))?;
                ManagedValue::Ref(Some(object))
            }
            (ty, value) => {
                return Err(BridgeError::argument(format!(
                    "expected {} but got {}",
                    ty,
                    value.kind_name()
                )))
            }
        };
        Ok(converted)
    }
}

impl Default for TypeConverter {
    fn default() -> Self {
        Self::new()
    }
}

fn check_instance(runtime: &dyn ManagedRuntime, object: &GlobalRef, class: &str) -> BridgeResult<()> {
    if runtime.is_instance_of(object, class) {
        return Ok(());
    }
    let actual = runtime
        .class_of(object.id())
        .unwrap_or_else(|| "<collected>".to_string());
    Err(BridgeError::argument(format!("expected {} but got {}", class, actual)))
}
