//! 配置结构体定义

use serde::{Deserialize, Serialize};

/// 应用程序配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 桥接层配置
    pub bridge: BridgeSettings,
    /// 托管堆配置
    pub heap: HeapSettings,
    /// 日志配置
    pub logging: LoggingSettings,
}

/// 桥接层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// 保留的异常记录条数
    pub exception_history: usize,
    /// 是否在边界捕获原生 panic 并翻译为托管异常
    pub catch_native_panics: bool,
    /// 是否记录每一次异常穿越
    pub log_crossings: bool,
}

/// 托管堆配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapSettings {
    /// 关闭时执行一次完整回收
    pub collect_on_shutdown: bool,
    /// 完整回收的最大轮数（终结器可能释放更多对象）
    pub max_finalizer_passes: usize,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// 日志级别
    pub level: String,
    /// 日志格式
    pub format: LogFormat,
    /// 日志文件路径
    pub file_path: Option<String>,
    /// 是否输出到控制台
    pub console_output: bool,
}

/// 日志格式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            exception_history: 64,
            catch_native_panics: true,
            log_crossings: true,
        }
    }
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            collect_on_shutdown: true,
            max_finalizer_passes: 4,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file_path: None,
            console_output: true,
        }
    }
}
