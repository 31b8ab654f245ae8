//! 异常处理模块
//!
//! 在边界两侧捕获、翻译并记录异常：
//! 托管侧抛出的 [`Throwable`] 变为 [`BridgeError::Crossing`]，
//! 原生侧返回的 [`BridgeError`] 或 panic 变为对应类的 [`Throwable`]。
//! 跨越边界时只保证消息文本不变。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::config::BridgeSettings;
use crate::core::error::{BridgeError, BridgeResult};
use crate::log_crossing;
use crate::runtime::{classes, Throwable};

/// 非字符串 panic 负载的消息
pub const UNKNOWN_PANIC_MESSAGE: &str = "Unknown native panic.";

/// 异常穿越方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrossingDirection {
    /// 原生失败被抛入托管侧
    NativeToManaged,
    /// 托管异常返回给原生调用方
    ManagedToNative,
}

impl fmt::Display for CrossingDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrossingDirection::NativeToManaged => f.write_str("native->managed"),
            CrossingDirection::ManagedToNative => f.write_str("managed->native"),
        }
    }
}

/// 异常记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    /// 记录 ID
    pub id: uuid::Uuid,
    /// 穿越方向
    pub direction: CrossingDirection,
    /// 消息，跨越边界保持不变
    pub message: String,
    /// 托管异常类名
    pub class_name: Option<String>,
    /// 原生错误分类码
    pub code: Option<i32>,
    /// 穿越点（描述符标签）
    pub site: String,
    /// 时间戳
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ExceptionRecord {
    pub fn new(
        direction: CrossingDirection,
        message: impl Into<String>,
        class_name: Option<String>,
        code: Option<i32>,
        site: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            direction,
            message: message.into(),
            class_name,
            code,
            site: site.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// 异常统计信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExceptionStats {
    /// 总穿越次数
    pub total: u64,
    /// 原生到托管
    pub native_to_managed: u64,
    /// 托管到原生
    pub managed_to_native: u64,
    /// 捕获的 panic 数
    pub panics: u64,
}

/// 异常桥
pub struct ExceptionBridge {
    /// 最近的异常记录
    history: Mutex<VecDeque<ExceptionRecord>>,
    /// 统计信息
    stats: Mutex<ExceptionStats>,
    capacity: usize,
    catch_panics: bool,
    log_crossings: bool,
}

impl ExceptionBridge {
    /// 创建新的异常桥
    pub fn new(settings: &BridgeSettings) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(settings.exception_history)),
            stats: Mutex::new(ExceptionStats::default()),
            capacity: settings.exception_history,
            catch_panics: settings.catch_native_panics,
            log_crossings: settings.log_crossings,
        }
    }

    /// 托管异常 -> 原生错误
    pub fn from_managed(&self, thrown: Throwable, site: &str) -> BridgeError {
        let record = ExceptionRecord::new(
            CrossingDirection::ManagedToNative,
            thrown.message,
            Some(thrown.class_name),
            thrown.code,
            site,
        );
        self.record(record.clone());
        BridgeError::Crossing(Box::new(record))
    }

    /// 原生错误 -> 托管异常
    pub fn to_managed(&self, error: BridgeError, site: &str) -> Throwable {
        let class_name = managed_class_for(&error);
        let code = match &error {
            // 往返穿越时保留原始分类码
            BridgeError::Crossing(record) => record.code.unwrap_or_else(|| error.code()),
            other => other.code(),
        };
        let message = error.message();

        self.record(ExceptionRecord::new(
            CrossingDirection::NativeToManaged,
            message.clone(),
            Some(class_name.clone()),
            Some(code),
            site,
        ));
        Throwable::new(class_name, message).with_code(code)
    }

    /// 在边界上执行原生代码：错误与 panic 都转换为托管异常
    pub fn guard<R, F>(&self, site: &str, f: F) -> Result<R, Throwable>
    where
        F: FnOnce() -> BridgeResult<R>,
    {
        if !self.catch_panics {
            return f().map_err(|error| self.to_managed(error, site));
        }
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(self.to_managed(error, site)),
            Err(payload) => {
                self.stats.lock().panics += 1;
                let message = panic_message(payload.as_ref());
                tracing::error!("Native panic at {}: {}", site, message);
                Err(self.to_managed(BridgeError::thrown(classes::RUNTIME_EXCEPTION, message), site))
            }
        }
    }

    /// 最近的异常记录，从旧到新
    pub fn history(&self) -> Vec<ExceptionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// 最近一条记录
    pub fn last(&self) -> Option<ExceptionRecord> {
        self.history.lock().back().cloned()
    }

    pub fn stats(&self) -> ExceptionStats {
        self.stats.lock().clone()
    }

    /// 以 JSON 数组导出历史记录
    pub fn history_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&*self.history.lock())
    }

    /// 清空历史，返回清理条数
    pub fn clear_history(&self) -> usize {
        let mut history = self.history.lock();
        let removed = history.len();
        history.clear();
        tracing::debug!("Cleared {} exception records", removed);
        removed
    }

    fn record(&self, record: ExceptionRecord) {
        if self.log_crossings {
            log_crossing!(record.direction, record.site, record.message);
        }

        {
            let mut stats = self.stats.lock();
            stats.total += 1;
            match record.direction {
                CrossingDirection::NativeToManaged => stats.native_to_managed += 1,
                CrossingDirection::ManagedToNative => stats.managed_to_native += 1,
            }
        }

        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(record);
    }
}

impl Default for ExceptionBridge {
    fn default() -> Self {
        Self::new(&BridgeSettings::default())
    }
}

/// 错误种类对应的托管异常类
pub fn managed_class_for(error: &BridgeError) -> String {
    match error {
        BridgeError::Construction { class_name, .. } => class_name
            .clone()
            .unwrap_or_else(|| classes::INSTANTIATION.to_string()),
        BridgeError::InvalidHandle { .. } => classes::ILLEGAL_STATE.to_string(),
        BridgeError::Argument { .. } => classes::ILLEGAL_ARGUMENT.to_string(),
        BridgeError::Binding { .. } => classes::LINKAGE_ERROR.to_string(),
        BridgeError::Thrown { class_name, .. } => class_name.clone(),
        BridgeError::Crossing(record) => record
            .class_name
            .clone()
            .unwrap_or_else(|| classes::RUNTIME_EXCEPTION.to_string()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        UNKNOWN_PANIC_MESSAGE.to_string()
    }
}
