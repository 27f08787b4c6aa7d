use thiserror::Error;
use market_data_engine::{DatabaseError, MarketDataEngineError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    #[error("存储错误: {0}")]
    Database(#[from] DatabaseError),

    #[error("汇总引擎错误: {0}")]
    Engine(#[from] MarketDataEngineError),

    #[error("JSON序列化错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("通道发送错误: {0}")]
    ChannelSend(String),

    #[error("任务等待错误: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("服务未初始化")]
    NotInitialized,

    #[error("应用错误: {0}")]
    Application(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// 创建一个应用层错误，包含源错误信息用于传播
    ///
    /// anyhow 会保留错误链，显示时带上下文信息。
    pub fn application_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: String,
        source: E,
    ) -> Self {
        Self::Other(anyhow::Error::new(source).context(message))
    }
}
