//! 统一配置管理模块
//!
//! 提供通过配置文件（YAML）和环境变量管理存储、引擎、接入和日志配置的功能

use std::borrow::Cow;
use std::sync::{Arc, LazyLock};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use market_data_engine::{MarketDataEngineConfig, RedisConfig};

// 静态默认值常量
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";
pub const DEFAULT_INGESTION_SOURCE: &str = "-";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// 环境变量前缀，例如 `STOCK_SUMMARY__STORE__REDIS_URL`
pub const ENV_PREFIX: &str = "STOCK_SUMMARY";

/// 按优先级查找的配置文件
pub const CONFIG_FILE_PATHS: [&str; 4] = [
    "config.yml",
    "config.yaml",
    "config/app.yml",
    "config/app.yaml",
];

// 预分配的 Arc<str> 用于常用默认值
static DEFAULT_REDIS_URL_ARC: LazyLock<Arc<str>> = LazyLock::new(|| DEFAULT_REDIS_URL.into());
static DEFAULT_INGESTION_SOURCE_ARC: LazyLock<Arc<str>> = LazyLock::new(|| DEFAULT_INGESTION_SOURCE.into());
static DEFAULT_LOG_LEVEL_ARC: LazyLock<Arc<str>> = LazyLock::new(|| DEFAULT_LOG_LEVEL.into());

/// 应用程序统一配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 存储配置
    #[serde(default)]
    pub store: StoreConfig,
    /// 汇总引擎配置
    #[serde(default)]
    pub market_data_engine: EngineConfig,
    /// 消息接入配置
    #[serde(default)]
    pub ingestion: IngestionConfig,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

// 默认值函数
fn default_redis_url() -> Arc<str> {
    DEFAULT_REDIS_URL_ARC.clone()
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_ingest_buffer_size() -> usize {
    1000
}

fn default_notification_buffer_size() -> usize {
    1000
}

fn default_stock_task_buffer_size() -> usize {
    100
}

fn default_shutdown_grace_millis() -> u64 {
    5000
}

fn default_stock_task_idle_millis() -> u64 {
    60_000
}

fn default_ingestion_source() -> Arc<str> {
    DEFAULT_INGESTION_SOURCE_ARC.clone()
}

fn default_log_level() -> Arc<str> {
    DEFAULT_LOG_LEVEL_ARC.clone()
}

/// 存储后端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Redis 有序集合
    #[default]
    Redis,
    /// 进程内有序集合，进程退出后数据丢失
    Memory,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// 存储后端
    #[serde(default)]
    pub backend: StoreBackend,
    /// Redis 连接URL
    #[serde(default = "default_redis_url")]
    pub redis_url: Arc<str>,
    /// 连接超时时间（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// 汇总引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 接入消息缓冲区大小
    #[serde(default = "default_ingest_buffer_size")]
    pub ingest_buffer_size: usize,
    /// 处理结果通知缓冲区大小
    #[serde(default = "default_notification_buffer_size")]
    pub notification_buffer_size: usize,
    /// 单只股票任务的缓冲区大小
    #[serde(default = "default_stock_task_buffer_size")]
    pub stock_task_buffer_size: usize,
    /// 停止时等待排空的时间（毫秒）
    #[serde(default = "default_shutdown_grace_millis")]
    pub shutdown_grace_millis: u64,
    /// 股票任务空闲多久后回收（毫秒）
    #[serde(default = "default_stock_task_idle_millis")]
    pub stock_task_idle_millis: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ingest_buffer_size: default_ingest_buffer_size(),
            notification_buffer_size: default_notification_buffer_size(),
            stock_task_buffer_size: default_stock_task_buffer_size(),
            shutdown_grace_millis: default_shutdown_grace_millis(),
            stock_task_idle_millis: default_stock_task_idle_millis(),
        }
    }
}

/// 消息接入配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// 消息来源：`-` 表示标准输入，否则为每行一条JSON消息的文件路径
    #[serde(default = "default_ingestion_source")]
    pub source: Arc<str>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            source: default_ingestion_source(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别或过滤指令，例如 `info`、`market_data_engine=debug`
    #[serde(default = "default_log_level")]
    pub level: Arc<str>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 从配置文件加载配置
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// 只从环境变量加载，未设置的字段使用默认值
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// 从默认位置加载配置
    pub fn load() -> Result<Self, ConfigError> {
        for path in &CONFIG_FILE_PATHS {
            if std::path::Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        // 如果没有找到配置文件，使用默认配置
        Self::from_env()
    }

    /// 指定了路径时只读该文件，否则按默认位置查找
    pub fn load_from(path: Option<&str>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::load(),
        }
    }

    /// 保存配置到文件
    pub fn save_to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// 转换为引擎配置
    pub fn engine_config(&self) -> MarketDataEngineConfig {
        MarketDataEngineConfig {
            ingest_buffer_size: self.market_data_engine.ingest_buffer_size,
            notification_buffer_size: self.market_data_engine.notification_buffer_size,
            stock_task_buffer_size: self.market_data_engine.stock_task_buffer_size,
            shutdown_grace_millis: self.market_data_engine.shutdown_grace_millis,
            stock_task_idle_millis: self.market_data_engine.stock_task_idle_millis,
        }
    }

    /// 转换为 Redis 配置
    pub fn redis_config(&self) -> RedisConfig {
        RedisConfig {
            redis_url: Cow::Owned(self.store.redis_url.to_string()),
            connect_timeout_secs: self.store.connect_timeout_secs,
        }
    }
}
