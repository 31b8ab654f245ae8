//! 错误处理定义

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ffi::exception_handler::ExceptionRecord;

/// 桥接层错误类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BridgeError {
    /// 原生实例无法创建
    #[error("Construction error: {message}")]
    Construction {
        message: String,
        tag: Option<String>,
        /// 工厂抛出的托管异常类；为空时按实例化异常处理
        #[serde(default)]
        class_name: Option<String>,
    },

    /// 对未绑定或已销毁的代理进行操作
    #[error("Invalid handle: {handle:#x}")]
    InvalidHandle { handle: u64 },

    /// 参数无法编组（长度不匹配、不可表示的值、类型不符）
    #[error("Argument error: {message}")]
    Argument { message: String },

    /// 一侧在执行另一侧发起的调用时抛出
    #[error("Crossing error: {}", .0.message)]
    Crossing(Box<ExceptionRecord>),

    /// 原生代码要求在托管侧抛出指定类的异常
    #[error("{class_name}: {message}")]
    Thrown { class_name: String, message: String },

    /// 描述符与实际绑定的成员不一致
    #[error("Binding error for {class}.{member}: {message}")]
    Binding {
        class: String,
        member: String,
        message: String,
    },
}

/// 错误严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl BridgeError {
    pub fn construction(message: impl Into<String>, tag: Option<&str>) -> Self {
        BridgeError::Construction {
            message: message.into(),
            tag: tag.map(str::to_string),
            class_name: None,
        }
    }

    pub fn invalid_handle(handle: u64) -> Self {
        BridgeError::InvalidHandle { handle }
    }

    pub fn argument(message: impl Into<String>) -> Self {
        BridgeError::Argument {
            message: message.into(),
        }
    }

    pub fn thrown(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::Thrown {
            class_name: class_name.into(),
            message: message.into(),
        }
    }

    pub fn binding(class: impl Into<String>, member: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::Binding {
            class: class.into(),
            member: member.into(),
            message: message.into(),
        }
    }

    /// 跨边界携带的分类码
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::Construction { .. } => 1,
            BridgeError::InvalidHandle { .. } => 2,
            BridgeError::Argument { .. } => 3,
            BridgeError::Crossing(_) => 4,
            BridgeError::Thrown { .. } => 5,
            BridgeError::Binding { .. } => 6,
        }
    }

    /// 不带前缀的人类可读信息，跨边界时保持不变
    pub fn message(&self) -> String {
        match self {
            BridgeError::Construction { message, .. } => message.clone(),
            BridgeError::InvalidHandle { handle } => {
                format!("native instance for handle {:#x} is not attached", handle)
            }
            BridgeError::Argument { message } => message.clone(),
            BridgeError::Crossing(record) => record.message.clone(),
            BridgeError::Thrown { message, .. } => message.clone(),
            BridgeError::Binding { message, .. } => message.clone(),
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            BridgeError::Binding { .. } => ErrorSeverity::Critical,
            BridgeError::InvalidHandle { .. } | BridgeError::Construction { .. } => ErrorSeverity::High,
            BridgeError::Crossing(_) | BridgeError::Thrown { .. } => ErrorSeverity::Medium,
            BridgeError::Argument { .. } => ErrorSeverity::Low,
        }
    }

    /// 描述符漂移属于编程错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Binding { .. })
    }

    /// 转换为构造错误，保留原始信息与抛出的异常类
    pub fn into_construction(self, tag: Option<&str>) -> Self {
        let class_name = match &self {
            BridgeError::Construction { class_name, .. } => class_name.clone(),
            BridgeError::Thrown { class_name, .. } => Some(class_name.clone()),
            BridgeError::Crossing(record) => record.class_name.clone(),
            _ => None,
        };
        match self {
            BridgeError::Construction { message, tag: existing, .. } => BridgeError::Construction {
                message,
                tag: existing.or_else(|| tag.map(str::to_string)),
                class_name,
            },
            other => BridgeError::Construction {
                message: other.message(),
                tag: tag.map(str::to_string),
                class_name,
            },
        }
    }
}

/// 桥接层结果类型
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct() {
        let errors = vec![
            BridgeError::construction("x", None),
            BridgeError::invalid_handle(1),
            BridgeError::argument("x"),
            BridgeError::thrown("core/RuntimeException", "x"),
            BridgeError::binding("A", "b", "x"),
        ];
        let mut codes: Vec<i32> = errors.iter().map(BridgeError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_into_construction_keeps_message() {
        let err = BridgeError::thrown("NativeSoundException", "Can't open file.")
            .into_construction(Some("sound:"));
        match err {
            BridgeError::Construction { message, tag, class_name } => {
                assert_eq!(message, "Can't open file.");
                assert_eq!(tag.as_deref(), Some("sound:"));
                assert_eq!(class_name.as_deref(), Some("NativeSoundException"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // 二次转换不丢失异常类，非抛出类错误没有异常类
        let again = BridgeError::thrown("NativeSoundException", "x")
            .into_construction(None)
            .into_construction(Some("sound:"));
        assert!(matches!(
            again,
            BridgeError::Construction { class_name: Some(ref c), tag: Some(_), .. } if c == "NativeSoundException"
        ));
        let plain = BridgeError::argument("bad tag").into_construction(None);
        assert!(matches!(plain, BridgeError::Construction { class_name: None, .. }));
    }

    #[test]
    fn test_serialize_tagged() {
        let err = BridgeError::invalid_handle(7);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "InvalidHandle");
        assert_eq!(json["data"]["handle"], 7);
        assert!(err.to_string().contains("0x7"));
    }
}
