pub mod error;
pub mod config;
pub mod cli;
pub mod ingestion;
pub mod app;

// Re-export key components
pub use error::AppError;
pub use crate::config::{AppConfig, EngineConfig, IngestionConfig, LoggingConfig, StoreBackend, StoreConfig};
pub use cli::{CliArgs, Command, RangeArgs, parse_cli_args};
pub use ingestion::{IngestionSource, NotificationStats};
pub use app::{App, AppServices};

use tracing_subscriber::EnvFilter;

/// 初始化日志
///
/// 优先使用配置中的级别，配置无法解析时退回 `RUST_LOG`。日志写到标准错误，
/// 标准输出留给查询结果。
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(logging.level.as_ref())
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(crate::config::DEFAULT_LOG_LEVEL));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
