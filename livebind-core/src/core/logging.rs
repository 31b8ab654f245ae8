//! 日志系统配置和结构化日志

use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingSettings};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// 日志初始化器
pub struct Logger;

impl Logger {
    /// 初始化日志系统
    ///
    /// `RUST_LOG` 优先于配置中的级别；重复初始化返回错误而不是 panic
    pub fn init(settings: &LoggingSettings) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut layers: Vec<BoxedLayer> = Vec::new();

        // 创建过滤器
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&settings.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        // 控制台输出层
        if settings.console_output {
            match settings.format {
                LogFormat::Json => layers.push(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(false)
                        .with_span_list(false)
                        .boxed(),
                ),
                LogFormat::Text => layers.push(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_thread_names(true)
                        .compact()
                        .boxed(),
                ),
            }
        }

        // 文件输出层
        if let Some(file_path) = &settings.file_path {
            let path = Path::new(file_path);
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "livebind.log".to_string());

            // 确保日志目录存在
            std::fs::create_dir_all(directory)?;

            let file_appender = RollingFileAppender::new(Rotation::DAILY, directory, file_name);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);

            match settings.format {
                LogFormat::Json => layers.push(file_layer.json().boxed()),
                LogFormat::Text => layers.push(file_layer.boxed()),
            }
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(filter)
            .try_init()?;

        tracing::info!("Logger initialized with level: {}", settings.level);
        if let Some(file_path) = &settings.file_path {
            tracing::info!("File output: {}", file_path);
        }

        Ok(())
    }
}

/// 结构化记录一次异常穿越
#[macro_export]
macro_rules! log_crossing {
    ($direction:expr, $site:expr, $message:expr) => {
        tracing::warn!(
            direction = %$direction,
            site = %$site,
            message = %$message,
            "Exception crossed the bridge"
        );
    };
}

/// 结构化记录一次生命周期迁移
#[macro_export]
macro_rules! log_lifecycle {
    ($event:expr, $handle:expr, $proxy:expr) => {
        tracing::debug!(
            event = $event,
            handle = %$handle,
            proxy = %$proxy,
            "Lifecycle transition"
        );
    };
}
