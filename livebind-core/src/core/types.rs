//! 核心类型定义
//!
//! 跨边界使用的紧凑类型描述符：
//! `Z` boolean、`B` byte、`C` char、`S` short、`I` int、`J` long、
//! `F` float、`D` double、`V` void、`Lpkg/Name;` 对象、`[T` 一维数组

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::error::{BridgeError, BridgeResult};

/// 所有对象类型的根类
pub const OBJECT_CLASS: &str = "core/Object";
/// 托管字符串类
pub const STRING_CLASS: &str = "core/String";

/// 声明类型
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Void,
    Boolean,
    Byte,
    /// 16 位 UTF-16 code unit
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// 对象引用，携带声明类名
    Object(String),
    /// 一维数组
    Array(Box<ValueType>),
}

impl ValueType {
    /// 对象类型
    pub fn object(class: impl Into<String>) -> Self {
        ValueType::Object(class.into())
    }

    /// 数组类型
    pub fn array_of(element: ValueType) -> Self {
        ValueType::Array(Box::new(element))
    }

    /// 解析单个完整的类型描述符
    pub fn parse(text: &str) -> BridgeResult<Self> {
        let bytes = text.as_bytes();
        let mut pos = 0;
        let ty = parse_type(text, bytes, &mut pos, true)?;
        if pos != bytes.len() {
            return Err(malformed(text, "trailing characters"));
        }
        Ok(ty)
    }

    /// 生成描述符文本
    pub fn descriptor(&self) -> String {
        match self {
            ValueType::Void => "V".to_string(),
            ValueType::Boolean => "Z".to_string(),
            ValueType::Byte => "B".to_string(),
            ValueType::Char => "C".to_string(),
            ValueType::Short => "S".to_string(),
            ValueType::Int => "I".to_string(),
            ValueType::Long => "J".to_string(),
            ValueType::Float => "F".to_string(),
            ValueType::Double => "D".to_string(),
            ValueType::Object(class) => format!("L{};", class),
            ValueType::Array(element) => format!("[{}", element.descriptor()),
        }
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(self, ValueType::Object(_) | ValueType::Array(_) | ValueType::Void)
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, ValueType::Object(_) | ValueType::Array(_))
    }

    /// 用于错误信息的类型名
    pub fn kind_name(&self) -> &'static str {
        match self {
            ValueType::Void => "void",
            ValueType::Boolean => "boolean",
            ValueType::Byte => "byte",
            ValueType::Char => "char",
            ValueType::Short => "short",
            ValueType::Int => "int",
            ValueType::Long => "long",
            ValueType::Float => "float",
            ValueType::Double => "double",
            ValueType::Object(_) => "object",
            ValueType::Array(_) => "array",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descriptor())
    }
}

/// 方法签名：有序参数类型 + 返回类型
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodSignature {
    pub params: Vec<ValueType>,
    pub ret: ValueType,
}

impl MethodSignature {
    pub fn new(params: Vec<ValueType>, ret: ValueType) -> Self {
        Self { params, ret }
    }

    /// 解析形如 `(ZDCBSIJF)J` 的方法描述符
    pub fn parse(text: &str) -> BridgeResult<Self> {
        let bytes = text.as_bytes();
        if bytes.first() != Some(&b'(') {
            return Err(malformed(text, "expected '('"));
        }
        let mut pos = 1;
        let mut params = Vec::new();
        loop {
            match bytes.get(pos) {
                Some(b')') => {
                    pos += 1;
                    break;
                }
                Some(_) => params.push(parse_type(text, bytes, &mut pos, false)?),
                None => return Err(malformed(text, "unterminated parameter list")),
            }
        }
        let ret = parse_type(text, bytes, &mut pos, true)?;
        if pos != bytes.len() {
            return Err(malformed(text, "trailing characters"));
        }
        Ok(Self { params, ret })
    }

    /// 字段读取器签名 `()T`
    pub fn getter(ty: &ValueType) -> Self {
        Self::new(Vec::new(), ty.clone())
    }

    /// 字段写入器签名 `(T)V`
    pub fn setter(ty: &ValueType) -> Self {
        Self::new(vec![ty.clone()], ValueType::Void)
    }

    pub fn descriptor(&self) -> String {
        let params: String = self.params.iter().map(ValueType::descriptor).collect();
        format!("({}){}", params, self.ret.descriptor())
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descriptor())
    }
}

fn parse_type(text: &str, bytes: &[u8], pos: &mut usize, allow_void: bool) -> BridgeResult<ValueType> {
    let tag = *bytes
        .get(*pos)
        .ok_or_else(|| malformed(text, "unexpected end of descriptor"))?;
    *pos += 1;
    let ty = match tag {
        b'Z' => ValueType::Boolean,
        b'B' => ValueType::Byte,
        b'C' => ValueType::Char,
        b'S' => ValueType::Short,
        b'I' => ValueType::Int,
        b'J' => ValueType::Long,
        b'F' => ValueType::Float,
        b'D' => ValueType::Double,
        b'V' if allow_void => ValueType::Void,
        b'V' => return Err(malformed(text, "void is only valid as a return type")),
        b'L' => {
            let start = *pos;
            let end = bytes[start..]
                .iter()
                .position(|b| *b == b';')
                .map(|offset| start + offset)
                .ok_or_else(|| malformed(text, "class name is missing its ';'"))?;
            if end == start {
                return Err(malformed(text, "empty class name"));
            }
            *pos = end + 1;
            ValueType::Object(text[start..end].to_string())
        }
        b'[' => {
            if bytes.get(*pos) == Some(&b'[') {
                return Err(malformed(text, "only one-dimensional arrays are supported"));
            }
            let element = parse_type(text, bytes, pos, false)?;
            ValueType::Array(Box::new(element))
        }
        other => {
            return Err(malformed(
                text,
                &format!("unknown type tag '{}'", other as char),
            ))
        }
    };
    Ok(ty)
}

fn malformed(text: &str, reason: &str) -> BridgeError {
    BridgeError::argument(format!("malformed descriptor '{}': {}", text, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_primitive_signature() {
        let sig = MethodSignature::parse("(ZDCBSIJF)J").unwrap();
        assert_eq!(
            sig.params,
            vec![
                ValueType::Boolean,
                ValueType::Double,
                ValueType::Char,
                ValueType::Byte,
                ValueType::Short,
                ValueType::Int,
                ValueType::Long,
                ValueType::Float,
            ]
        );
        assert_eq!(sig.ret, ValueType::Long);
        assert_eq!(sig.descriptor(), "(ZDCBSIJF)J");
    }

    #[test]
    fn test_parse_object_and_array() {
        let sig = MethodSignature::parse("([LNativeSound$Checkpoint;Lcore/String;)[J").unwrap();
        assert_eq!(
            sig.params[0],
            ValueType::array_of(ValueType::object("NativeSound$Checkpoint"))
        );
        assert_eq!(sig.params[1], ValueType::object("core/String"));
        assert_eq!(sig.ret, ValueType::array_of(ValueType::Long));
    }

    #[test]
    fn test_reject_malformed() {
        // 缺少结尾分号
        assert!(MethodSignature::parse("(Lcore/String)V").is_err());
        // 参数中出现 void
        assert!(MethodSignature::parse("(V)V").is_err());
        // 多维数组
        assert!(ValueType::parse("[[I").is_err());
        assert!(MethodSignature::parse("I").is_err());
        assert!(MethodSignature::parse("()IJ").is_err());
    }

    #[test]
    fn test_accessor_signatures() {
        let ty = ValueType::Long;
        assert_eq!(MethodSignature::getter(&ty).descriptor(), "()J");
        assert_eq!(MethodSignature::setter(&ty).descriptor(), "(J)V");
    }
}
