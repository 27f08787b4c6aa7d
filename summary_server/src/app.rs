use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use market_data_engine::{
    InMemorySortedSet, MarketDataEngine, MarketDataEngineBuilder, RedisSortedSet, ScoredSummaryRepository,
    StockSummary, StockSummaryService, SummaryNotification, SummaryQuery, SummaryQueryRequest, SummaryRepository,
};

use crate::config::{AppConfig, StoreBackend};
use crate::error::AppError;
use crate::ingestion::{IngestionSource, NotificationStats, report_notifications, run_ingestion};

/// 应用程序服务
pub struct AppServices {
    /// 汇总引擎实例
    pub market_data_engine: Arc<MarketDataEngine>,
    /// 引擎的消息发送端，消费开始时交给接入适配器
    payload_tx: Option<mpsc::Sender<Vec<u8>>>,
    /// 引擎的通知接收端，消费开始时交给汇报任务
    notification_rx: Option<mpsc::Receiver<SummaryNotification>>,
}

/// 应用程序主入口，负责管理各种服务的生命周期
pub struct App {
    /// 应用配置
    config: AppConfig,
    /// 已初始化的服务
    services: Option<AppServices>,
}

impl App {
    /// 创建新的应用程序实例
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            services: None,
        }
    }

    /// 按配置创建汇总存储
    async fn create_repository(&self) -> Result<Arc<dyn SummaryRepository>, AppError> {
        match self.config.store.backend {
            StoreBackend::Redis => {
                let backend = RedisSortedSet::new(self.config.redis_config())
                    .await
                    .map_err(|e| AppError::application_with_source("创建Redis存储失败".to_string(), e))?;
                Ok(Arc::new(ScoredSummaryRepository::new(backend)))
            }
            StoreBackend::Memory => {
                warn!("使用进程内存储，进程退出后汇总数据不会保留");
                Ok(Arc::new(ScoredSummaryRepository::new(InMemorySortedSet::new())))
            }
        }
    }

    /// 初始化所有服务
    pub async fn initialize_services(&mut self) -> Result<(), AppError> {
        info!("开始初始化应用服务");

        let repository = self.create_repository().await?;
        info!("汇总存储初始化完成");

        let engine_config = self.config.engine_config();
        let (payload_tx, payload_rx) = mpsc::channel::<Vec<u8>>(engine_config.ingest_buffer_size);
        let (notification_tx, notification_rx) =
            mpsc::channel::<SummaryNotification>(engine_config.notification_buffer_size);

        let market_data_engine = MarketDataEngineBuilder::new()
            .with_config(engine_config)
            .with_repository(repository)
            .build(payload_rx, notification_tx)
            .map_err(|e| AppError::application_with_source("创建汇总引擎失败".to_string(), e))?;
        info!("汇总引擎初始化完成");

        self.services = Some(AppServices {
            market_data_engine: Arc::new(market_data_engine),
            payload_tx: Some(payload_tx),
            notification_rx: Some(notification_rx),
        });

        info!("所有服务初始化完成");
        Ok(())
    }

    /// 启动所有服务
    pub async fn start_services(&mut self) -> Result<(), AppError> {
        let services = self.services.as_ref().ok_or(AppError::NotInitialized)?;

        services
            .market_data_engine
            .start()
            .await
            .map_err(|e| AppError::Application(format!("汇总引擎启动失败: {}", e)))?;
        info!("汇总引擎已启动");
        Ok(())
    }

    async fn ensure_initialized(&mut self) -> Result<&AppServices, AppError> {
        if self.services.is_none() {
            self.initialize_services().await?;
        }
        self.services.as_ref().ok_or(AppError::NotInitialized)
    }

    /// 运行消费服务，直到消息来源读完或收到中断信号
    pub async fn run(&mut self, source: Option<&str>) -> Result<NotificationStats, AppError> {
        self.ensure_initialized().await?;
        self.start_services().await?;

        let source = IngestionSource::parse(source.unwrap_or(self.config.ingestion.source.as_ref()));

        let services = self.services.as_mut().ok_or(AppError::NotInitialized)?;
        let payload_tx = services
            .payload_tx
            .take()
            .ok_or(AppError::Application("消息通道已被使用".to_string()))?;
        let notification_rx = services
            .notification_rx
            .take()
            .ok_or(AppError::Application("通知通道已被使用".to_string()))?;

        let reporter = tokio::spawn(report_notifications(notification_rx));

        // 接入结束或被中断时发送端随之释放，引擎开始排空
        let ingestion_result = tokio::select! {
            result = run_ingestion(&source, payload_tx) => result,
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("收到中断信号，停止接收消息"),
                    Err(e) => error!("监听中断信号失败: {}", e),
                }
                Ok(0)
            }
        };

        match &ingestion_result {
            Ok(count) => info!("消息接入结束，本次读取 {} 条", count),
            Err(e) => error!("消息接入出错: {}", e),
        }

        self.shutdown().await?;

        let stats = reporter.await?;
        info!(
            updated = stats.updated,
            unchanged = stats.unchanged,
            rejected = stats.rejected,
            "处理结果统计"
        );

        ingestion_result?;
        Ok(stats)
    }

    /// 按日期区间查询汇总
    pub async fn query(&mut self, request: &SummaryQueryRequest) -> Result<Vec<StockSummary>, AppError> {
        let services = self.ensure_initialized().await?;
        Ok(services.market_data_engine.query_summary(request).await?)
    }

    /// 清理日期区间内的重复汇总记录
    pub async fn reconcile(&mut self, request: &SummaryQueryRequest) -> Result<usize, AppError> {
        let query: SummaryQuery = request
            .validate()
            .map_err(|e| AppError::application_with_source("查询参数无效".to_string(), e))?;

        let services = self.ensure_initialized().await?;
        let removed = services
            .market_data_engine
            .service()
            .reconcile(&query)
            .await
            .map_err(|e| AppError::application_with_source("清理重复记录失败".to_string(), e))?;

        info!("股票 {} 在 {} 至 {} 间清理了 {} 条重复记录", query.stock_code, query.from_date, query.to_date, removed);
        Ok(removed)
    }

    /// 获取服务引用（用于测试或外部访问）
    pub fn services(&self) -> Option<&AppServices> {
        self.services.as_ref()
    }

    /// 优雅关闭
    pub async fn shutdown(&mut self) -> Result<(), AppError> {
        info!("开始应用程序优雅关闭");

        if let Some(services) = &mut self.services {
            // 释放未交出的发送端，让引擎主循环可以退出
            services.payload_tx.take();

            if let Err(e) = services.market_data_engine.stop().await {
                error!("汇总引擎关闭失败: {}", e);
            } else {
                info!("汇总引擎正常关闭");
            }
        }

        info!("应用程序关闭完成");
        Ok(())
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.store.backend = StoreBackend::Memory;
        config.market_data_engine.shutdown_grace_millis = 1000;
        config
    }

    #[tokio::test]
    async fn test_start_requires_initialization() {
        let mut app = App::new(memory_config());
        assert!(matches!(app.start_services().await, Err(AppError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_initialize_memory_backend() {
        let mut app = App::new(memory_config());
        app.initialize_services().await.unwrap();

        let services = app.services().unwrap();
        assert!(!services.market_data_engine.is_running().await);

        app.start_services().await.unwrap();
        assert!(app.services().unwrap().market_data_engine.is_running().await);

        app.shutdown().await.unwrap();
        assert!(!app.services().unwrap().market_data_engine.is_running().await);
    }

    #[tokio::test]
    async fn test_query_validation_error() {
        let mut app = App::new(memory_config());
        let result = app
            .query(&SummaryQueryRequest::new("BBCA", "2023-08-31", "2023-08-01"))
            .await;
        assert!(matches!(result, Err(AppError::Engine(_))));
    }

    #[tokio::test]
    async fn test_reconcile_rejects_invalid_range() {
        let mut app = App::new(memory_config());
        let result = app.reconcile(&SummaryQueryRequest::new("", "2023-08-01", "2023-08-31")).await;
        assert!(matches!(result, Err(AppError::Other(_))));
        // 参数无效时不初始化服务
        assert!(app.services().is_none());
    }
}
