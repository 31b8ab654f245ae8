//! 配置管理模块

pub mod settings;

pub use settings::*;

use std::path::Path;

/// 环境变量前缀，例如 `LIVEBIND__BRIDGE__EXCEPTION_HISTORY=16`
pub const ENV_PREFIX: &str = "LIVEBIND";

/// 加载配置文件
///
/// 文件不存在时只使用默认值和环境变量
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Settings, config::ConfigError> {
    // 如果存在 .env 文件，先把它注入进程环境
    dotenvy::dotenv().ok();

    config::Config::builder()
        .add_source(config::File::from(path.as_ref()).required(false))
        .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?
        .try_deserialize()
}

/// 加载默认配置
pub fn load_default_config() -> Result<Settings, config::ConfigError> {
    dotenvy::dotenv().ok();

    config::Config::builder()
        .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?
        .try_deserialize()
}
