//! 日线汇总引擎核心实现
//!
//! 引擎从接入通道接收原始消息，解析后按股票代码路由到各自的任务。
//! 每只股票只有一个任务在写，保证同一股票的读改写串行执行，
//! 不同股票之间并行处理。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use core_entities::{Transaction, TransactionRecord};

use crate::data_types::{StockSummary, SummaryNotification, SummaryQueryRequest};
use crate::database::SummaryRepository;
use crate::service::{ApplyOutcome, ServiceError, StockSummaryService, SummaryAggregator};

/// 日线汇总引擎配置
#[derive(Debug, Clone)]
pub struct MarketDataEngineConfig {
    /// 接入消息缓冲区大小
    pub ingest_buffer_size: usize,
    /// 处理结果通知缓冲区大小
    pub notification_buffer_size: usize,
    /// 单只股票任务的缓冲区大小
    pub stock_task_buffer_size: usize,
    /// 停止时等待排空的时间（毫秒）
    pub shutdown_grace_millis: u64,
    /// 股票任务空闲多久后回收（毫秒）
    pub stock_task_idle_millis: u64,
}

impl Default for MarketDataEngineConfig {
    fn default() -> Self {
        Self {
            ingest_buffer_size: 1000,
            notification_buffer_size: 1000,
            stock_task_buffer_size: 100,
            shutdown_grace_millis: 5000,
            stock_task_idle_millis: 60_000,
        }
    }
}

/// 日线汇总引擎错误类型
#[derive(Debug, thiserror::Error)]
pub enum MarketDataEngineError {
    #[error("汇总服务错误: {0}")]
    ServiceError(#[from] ServiceError),

    #[error("配置错误: {0}")]
    ConfigError(String),
}

/// 引擎内部可变状态
struct MarketDataEngineInner {
    /// 原始消息接收器
    payload_rx: Option<mpsc::Receiver<Vec<u8>>>,
    /// 处理结果通知发送器，启动后交给主循环，排空后随之关闭
    notification_tx: Option<mpsc::Sender<SummaryNotification>>,
    /// 主任务句柄
    main_task_handle: Option<JoinHandle<()>>,
    /// 是否正在运行
    is_running: bool,
}

/// 日线汇总引擎
#[derive(Clone)]
pub struct MarketDataEngine {
    /// 配置
    config: Arc<MarketDataEngineConfig>,
    /// 汇总服务
    service: Arc<dyn StockSummaryService>,
    /// 每只股票最近一次应用的交易日
    last_applied_dates: Arc<DashMap<Arc<str>, NaiveDate>>,
    /// 内部可变状态
    inner: Arc<RwLock<MarketDataEngineInner>>,
}

impl MarketDataEngine {
    /// 创建新的日线汇总引擎
    pub fn new(
        config: Arc<MarketDataEngineConfig>,
        service: Arc<dyn StockSummaryService>,
        payload_rx: mpsc::Receiver<Vec<u8>>,
        notification_tx: mpsc::Sender<SummaryNotification>,
    ) -> Self {
        let inner = MarketDataEngineInner {
            payload_rx: Some(payload_rx),
            notification_tx: Some(notification_tx),
            main_task_handle: None,
            is_running: false,
        };

        Self {
            config,
            service,
            last_applied_dates: Arc::new(DashMap::new()),
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    /// 启动引擎
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), MarketDataEngineError> {
        info!("正在启动日线汇总引擎...");

        let mut inner = self.inner.write().await;

        if inner.is_running {
            warn!("日线汇总引擎已经在运行");
            return Err(MarketDataEngineError::ConfigError("引擎已在运行".to_string()));
        }

        let payload_rx = inner
            .payload_rx
            .take()
            .ok_or(MarketDataEngineError::ConfigError("消息接收器未初始化".to_string()))?;

        let notification_tx = inner
            .notification_tx
            .take()
            .ok_or(MarketDataEngineError::ConfigError("通知发送器未初始化".to_string()))?;

        let router = StockTaskRouter::new(
            Arc::clone(&self.service),
            Arc::clone(&self.last_applied_dates),
            notification_tx,
            self.config.stock_task_buffer_size,
            Duration::from_millis(self.config.stock_task_idle_millis),
        );

        let handle = tokio::spawn(async move {
            Self::run_engine_loop(payload_rx, router).await;
        });

        inner.main_task_handle = Some(handle);
        inner.is_running = true;

        info!("日线汇总引擎启动完成");
        Ok(())
    }

    /// 停止引擎
    ///
    /// 所有消息发送端关闭后主循环会排空各股票任务后自行退出；
    /// 超过等待时间仍未退出则中止主任务。
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), MarketDataEngineError> {
        let mut inner = self.inner.write().await;

        if !inner.is_running {
            return Ok(());
        }

        info!("正在停止日线汇总引擎...");

        if let Some(mut handle) = inner.main_task_handle.take() {
            let grace = Duration::from_millis(self.config.shutdown_grace_millis);
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => info!("日线汇总引擎主任务已排空并正常停止"),
                Ok(Err(e)) => warn!("日线汇总引擎主任务停止时出错: {}", e),
                Err(_) => {
                    warn!("等待 {:?} 后主任务仍未退出，强制中止", grace);
                    handle.abort();
                    match handle.await {
                        Ok(_) => info!("日线汇总引擎主任务正常停止"),
                        Err(e) if e.is_cancelled() => info!("日线汇总引擎主任务被取消"),
                        Err(e) => warn!("日线汇总引擎主任务停止时出错: {}", e),
                    }
                }
            }
        }

        inner.is_running = false;
        info!("日线汇总引擎已停止");
        Ok(())
    }

    /// 检查引擎是否正在运行
    pub async fn is_running(&self) -> bool {
        self.inner.read().await.is_running
    }

    /// 按日期区间查询汇总
    pub async fn query_summary(&self, request: &SummaryQueryRequest) -> Result<Vec<StockSummary>, MarketDataEngineError> {
        Ok(self.service.query_summary(request).await?)
    }

    /// 查询单日汇总
    pub async fn get_summary(&self, stock_code: &str, date: NaiveDate) -> Result<Option<StockSummary>, MarketDataEngineError> {
        Ok(self.service.get_summary(stock_code, date).await?)
    }

    /// 某只股票最近一次成功应用的交易日
    pub fn last_applied_date(&self, stock_code: &str) -> Option<NaiveDate> {
        self.last_applied_dates.get(stock_code).map(|entry| *entry.value())
    }

    /// 获取汇总服务
    pub fn service(&self) -> Arc<dyn StockSummaryService> {
        Arc::clone(&self.service)
    }

    /// 引擎主循环（静态方法，在独立任务中运行）
    ///
    /// 路由时如果某只股票的队列已满，主循环会在这里等待，其他股票的消息也随之暂停，
    /// 背压由此传回接入端。
    async fn run_engine_loop(mut payload_rx: mpsc::Receiver<Vec<u8>>, mut router: StockTaskRouter) {
        info!("日线汇总引擎主循环开始运行");

        let mut reap_interval = tokio::time::interval(router.idle_timeout.max(Duration::from_millis(1)));
        reap_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let payload = tokio::select! {
                payload = payload_rx.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
                _ = reap_interval.tick() => {
                    router.reap_idle_tasks();
                    continue;
                }
            };

            match Self::decode_payload(&payload) {
                Ok(transaction) => router.route(transaction).await,
                Err((stock_code, e)) => {
                    warn!(stock_code = stock_code.as_deref().unwrap_or(""), "丢弃无法解析的消息: {}", e);
                    Self::notify(&router.notification_tx, SummaryNotification::rejected(stock_code, e.to_string()))
                        .await;
                }
            }
        }

        router.shutdown().await;
        info!("日线汇总引擎主循环结束");
    }

    /// 解析原始消息，失败时尽量带上股票代码
    fn decode_payload(payload: &[u8]) -> Result<Transaction, (Option<Arc<str>>, ServiceError)> {
        let record = TransactionRecord::from_slice(payload).map_err(|e| (None, e.into()))?;
        record.to_transaction().map_err(|e| {
            let stock_code = (!record.stock_code.is_empty()).then(|| Arc::from(record.stock_code.as_str()));
            (stock_code, e.into())
        })
    }

    async fn notify(notification_tx: &mpsc::Sender<SummaryNotification>, notification: SummaryNotification) {
        if let Err(e) = notification_tx.send(notification).await {
            debug!("通知接收端已关闭，丢弃通知: {:?}", e.0);
        }
    }
}

impl Drop for MarketDataEngine {
    fn drop(&mut self) {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            let inner = inner.get_mut();
            if inner.is_running {
                if let Some(handle) = &inner.main_task_handle {
                    info!("日线汇总引擎被释放，中止主任务");
                    handle.abort();
                }
            }
        }
    }
}

/// 按股票代码分派成交记录的路由表
///
/// 每只股票同一时刻最多只有一个任务在写。空闲的任务会自行退出，
/// 再次出现该股票时，等旧任务结束后才启动新任务。
struct StockTaskRouter {
    service: Arc<dyn StockSummaryService>,
    last_applied_dates: Arc<DashMap<Arc<str>, NaiveDate>>,
    notification_tx: mpsc::Sender<SummaryNotification>,
    buffer_size: usize,
    idle_timeout: Duration,
    senders: HashMap<Arc<str>, mpsc::Sender<Transaction>>,
    handles: HashMap<Arc<str>, JoinHandle<()>>,
}

impl StockTaskRouter {
    fn new(
        service: Arc<dyn StockSummaryService>,
        last_applied_dates: Arc<DashMap<Arc<str>, NaiveDate>>,
        notification_tx: mpsc::Sender<SummaryNotification>,
        buffer_size: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            service,
            last_applied_dates,
            notification_tx,
            buffer_size,
            idle_timeout,
            senders: HashMap::new(),
            handles: HashMap::new(),
        }
    }

    /// 当前存活的股票任务数
    fn task_count(&self) -> usize {
        self.handles.len()
    }

    async fn route(&mut self, transaction: Transaction) {
        let stock_code = Arc::clone(&transaction.stock_code);

        let existing = self.senders.get(&stock_code).filter(|sender| !sender.is_closed()).cloned();
        let sender = match existing {
            Some(sender) => sender,
            None => self.spawn_task(&stock_code).await,
        };

        // 任务可能恰好在检查之后因空闲退出，此时换一个新任务重发一次
        let transaction = match sender.send(transaction).await {
            Ok(()) => return,
            Err(mpsc::error::SendError(transaction)) => transaction,
        };
        let sender = self.spawn_task(&stock_code).await;
        if let Err(e) = sender.send(transaction).await {
            error!("发送成交记录到股票 {} 的任务失败: {}，任务可能已退出", stock_code, e);
            self.senders.remove(&stock_code);
            if let Some(handle) = self.handles.remove(&stock_code) {
                handle.abort();
            }
            MarketDataEngine::notify(
                &self.notification_tx,
                SummaryNotification::rejected(Some(stock_code), "股票任务已退出"),
            )
            .await;
        }
    }

    /// 启动某只股票的新任务，先等待该股票的旧任务处理完剩余记录
    async fn spawn_task(&mut self, stock_code: &Arc<str>) -> mpsc::Sender<Transaction> {
        self.senders.remove(stock_code);
        if let Some(previous) = self.handles.remove(stock_code) {
            if let Err(e) = previous.await {
                warn!("股票 {} 的任务异常退出: {}", stock_code, e);
            }
        }

        let (stock_tx, stock_rx) = mpsc::channel::<Transaction>(self.buffer_size);
        let handle = tokio::spawn(run_stock_summary_task(
            Arc::clone(stock_code),
            stock_rx,
            Arc::clone(&self.service),
            Arc::clone(&self.last_applied_dates),
            self.notification_tx.clone(),
            self.idle_timeout,
        ));

        self.senders.insert(Arc::clone(stock_code), stock_tx.clone());
        self.handles.insert(Arc::clone(stock_code), handle);
        debug!("启动股票 {} 的汇总任务，当前任务数 {}", stock_code, self.task_count());
        stock_tx
    }

    /// 清理已因空闲退出的任务
    fn reap_idle_tasks(&mut self) {
        self.senders.retain(|_, sender| !sender.is_closed());
        let before = self.handles.len();
        self.handles.retain(|_, handle| !handle.is_finished());

        let reaped = before - self.handles.len();
        if reaped > 0 {
            info!("回收 {} 个空闲股票任务，剩余 {} 个", reaped, self.handles.len());
        }
    }

    /// 关闭各股票任务的输入，等待它们处理完队列后退出
    async fn shutdown(mut self) {
        info!("消息通道已关闭，等待 {} 个股票任务处理完剩余记录", self.task_count());

        self.senders.clear();
        for (stock_code, handle) in self.handles.drain() {
            if let Err(e) = handle.await {
                warn!("股票 {} 的任务异常退出: {}", stock_code, e);
            }
        }
    }
}

/// 单只股票的汇总任务，串行应用该股票的成交记录
///
/// 超过 `idle_timeout` 没有新记录时关闭输入，处理完已排队的记录后退出。
#[instrument(skip(transaction_rx, service, last_applied_dates, notification_tx))]
async fn run_stock_summary_task(
    stock_code: Arc<str>,
    mut transaction_rx: mpsc::Receiver<Transaction>,
    service: Arc<dyn StockSummaryService>,
    last_applied_dates: Arc<DashMap<Arc<str>, NaiveDate>>,
    notification_tx: mpsc::Sender<SummaryNotification>,
    idle_timeout: Duration,
) {
    debug!("股票汇总任务启动");

    loop {
        let transaction = match tokio::time::timeout(idle_timeout, transaction_rx.recv()).await {
            Ok(Some(transaction)) => transaction,
            Ok(None) => break,
            Err(_) => {
                debug!("股票汇总任务空闲，准备退出");
                transaction_rx.close();
                while let Some(transaction) = transaction_rx.recv().await {
                    apply_stock_transaction(&stock_code, &transaction, &service, &last_applied_dates, &notification_tx)
                        .await;
                }
                break;
            }
        };

        apply_stock_transaction(&stock_code, &transaction, &service, &last_applied_dates, &notification_tx).await;
    }

    debug!("股票汇总任务结束");
}

async fn apply_stock_transaction(
    stock_code: &Arc<str>,
    transaction: &Transaction,
    service: &Arc<dyn StockSummaryService>,
    last_applied_dates: &DashMap<Arc<str>, NaiveDate>,
    notification_tx: &mpsc::Sender<SummaryNotification>,
) {
    if let Some(last_date) = last_applied_dates.get(stock_code).map(|entry| *entry.value()) {
        if transaction.date < last_date {
            warn!(
                stock_code = %stock_code,
                date = %transaction.date,
                last_date = %last_date,
                "成交记录日期早于最近应用的交易日"
            );
        }
    }

    let notification = match service.apply_transaction(transaction).await {
        Ok(outcome) => {
            last_applied_dates
                .entry(Arc::clone(stock_code))
                .and_modify(|date| {
                    if *date < transaction.date {
                        *date = transaction.date;
                    }
                })
                .or_insert(transaction.date);

            match outcome {
                ApplyOutcome::Updated(summary) => SummaryNotification::SummaryUpdated {
                    summary,
                    timestamp: Utc::now(),
                },
                ApplyOutcome::Unchanged(summary) => SummaryNotification::SummaryUnchanged {
                    stock_code: summary.stock_code,
                    date: summary.date,
                    timestamp: Utc::now(),
                },
            }
        }
        Err(e) => {
            error!(
                stock_code = %stock_code,
                date = %transaction.date,
                transaction_type = %transaction.transaction_type,
                "应用成交记录失败: {}", e
            );
            SummaryNotification::rejected(Some(Arc::clone(stock_code)), e.to_string())
        }
    };

    MarketDataEngine::notify(notification_tx, notification).await;
}

/// 日线汇总引擎构建器
pub struct MarketDataEngineBuilder {
    config: MarketDataEngineConfig,
    service: Option<Arc<dyn StockSummaryService>>,
}

impl MarketDataEngineBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: MarketDataEngineConfig::default(),
            service: None,
        }
    }

    /// 设置配置
    pub fn with_config(mut self, config: MarketDataEngineConfig) -> Self {
        self.config = config;
        self
    }

    /// 设置停止时的等待时间
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace_millis = grace.as_millis() as u64;
        self
    }

    /// 设置股票任务的空闲回收时间
    pub fn with_stock_task_idle(mut self, idle: Duration) -> Self {
        self.config.stock_task_idle_millis = idle.as_millis() as u64;
        self
    }

    /// 设置汇总服务
    pub fn with_service(mut self, service: Arc<dyn StockSummaryService>) -> Self {
        self.service = Some(service);
        self
    }

    /// 使用默认服务实现包装汇总存储
    pub fn with_repository(mut self, repository: Arc<dyn SummaryRepository>) -> Self {
        self.service = Some(Arc::new(SummaryAggregator::new(repository)));
        self
    }

    /// 构建引擎
    pub fn build(
        self,
        payload_rx: mpsc::Receiver<Vec<u8>>,
        notification_tx: mpsc::Sender<SummaryNotification>,
    ) -> Result<MarketDataEngine, MarketDataEngineError> {
        if self.config.stock_task_buffer_size == 0 {
            return Err(MarketDataEngineError::ConfigError("股票任务缓冲区大小必须大于0".to_string()));
        }
        if self.config.stock_task_idle_millis == 0 {
            return Err(MarketDataEngineError::ConfigError("股票任务空闲回收时间必须大于0".to_string()));
        }

        let service = self
            .service
            .ok_or(MarketDataEngineError::ConfigError("汇总服务未设置".to_string()))?;

        Ok(MarketDataEngine::new(Arc::new(self.config), service, payload_rx, notification_tx))
    }
}

impl Default for MarketDataEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{InMemorySortedSet, ScoredSummaryRepository};

    fn trade_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 8, 29).unwrap()
    }

    fn payload(kind: &str, stock_code: &str, order_number: &str, price: i64, quantity: i64) -> Vec<u8> {
        format!(
            r#"{{"type":"{}","stock_code":"{}","order_number":"{}","price":"{}","quantity":"{}"}}"#,
            kind, stock_code, order_number, price, quantity
        )
        .into_bytes()
    }

    fn setup() -> (
        MarketDataEngine,
        mpsc::Sender<Vec<u8>>,
        mpsc::Receiver<SummaryNotification>,
    ) {
        let (payload_tx, payload_rx) = mpsc::channel(100);
        let (notification_tx, notification_rx) = mpsc::channel(100);
        let repository = Arc::new(ScoredSummaryRepository::new(InMemorySortedSet::new()));

        let engine = MarketDataEngineBuilder::new()
            .with_repository(repository)
            .with_shutdown_grace(Duration::from_millis(1000))
            .build(payload_rx, notification_tx)
            .unwrap();

        (engine, payload_tx, notification_rx)
    }

    #[tokio::test]
    async fn test_builder_requires_service() {
        let (_, payload_rx) = mpsc::channel(1);
        let (notification_tx, _) = mpsc::channel(1);
        let result = MarketDataEngineBuilder::new().build(payload_rx, notification_tx);
        assert!(matches!(result, Err(MarketDataEngineError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_builder_rejects_zero_idle_timeout() {
        let (_, payload_rx) = mpsc::channel(1);
        let (notification_tx, _) = mpsc::channel(1);
        let repository = Arc::new(ScoredSummaryRepository::new(InMemorySortedSet::new()));
        let result = MarketDataEngineBuilder::new()
            .with_repository(repository)
            .with_stock_task_idle(Duration::ZERO)
            .build(payload_rx, notification_tx);
        assert!(matches!(result, Err(MarketDataEngineError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_idle_stock_task_is_replaced() {
        let (payload_tx, payload_rx) = mpsc::channel(100);
        let (notification_tx, mut notification_rx) = mpsc::channel(100);
        let repository = Arc::new(ScoredSummaryRepository::new(InMemorySortedSet::new()));
        let engine = MarketDataEngineBuilder::new()
            .with_repository(repository)
            .with_shutdown_grace(Duration::from_millis(1000))
            .with_stock_task_idle(Duration::from_millis(20))
            .build(payload_rx, notification_tx)
            .unwrap();
        engine.start().await.unwrap();

        payload_tx.send(payload("E", "BBCA", "20230829001", 8000, 10)).await.unwrap();
        assert!(matches!(
            notification_rx.recv().await.unwrap(),
            SummaryNotification::SummaryUpdated { .. }
        ));

        // 等待任务空闲退出并被回收
        tokio::time::sleep(Duration::from_millis(150)).await;

        payload_tx.send(payload("E", "BBCA", "20230829002", 8100, 5)).await.unwrap();
        payload_tx.send(payload("E", "GARBAGE", "20230829003", 1, 1)).await.unwrap();
        drop(payload_tx);
        engine.stop().await.unwrap();

        let summary = engine.get_summary("BBCA", trade_date()).await.unwrap().unwrap();
        assert_eq!(summary.open, Some(8000));
        assert_eq!(summary.close, 8100);
        assert_eq!(summary.volume, 15);
        assert_eq!(summary.value, 120_500);

        let mut updated = 0;
        while let Some(notification) = notification_rx.recv().await {
            if matches!(notification, SummaryNotification::SummaryUpdated { .. }) {
                updated += 1;
            }
        }
        assert_eq!(updated, 2);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (engine, _payload_tx, _notification_rx) = setup();
        engine.start().await.unwrap();
        assert!(engine.is_running().await);
        assert!(engine.start().await.is_err());
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_drains_on_sender_close() {
        let (engine, payload_tx, mut notification_rx) = setup();
        engine.start().await.unwrap();

        payload_tx.send(payload("P", "BBCA", "20230829001", 8050, 100)).await.unwrap();
        payload_tx.send(payload("P", "BBCA", "20230829002", 7950, 500)).await.unwrap();
        payload_tx.send(payload("A", "BBCA", "20230829003", 8200, 100)).await.unwrap();
        payload_tx.send(payload("A", "BBCA", "20230829004", 8000, 0)).await.unwrap();
        drop(payload_tx);

        engine.stop().await.unwrap();
        assert!(!engine.is_running().await);

        let summary = engine.get_summary("BBCA", trade_date()).await.unwrap().unwrap();
        assert_eq!(summary.prev, 8000);
        assert_eq!(summary.open, Some(8050));
        assert_eq!(summary.high, Some(8200));
        assert_eq!(summary.low, Some(7950));
        assert_eq!(summary.close, 8200);
        assert_eq!(summary.volume, 600);
        assert_eq!(summary.value, 4_780_000);
        assert_eq!(summary.average, 7966);
        assert_eq!(engine.last_applied_date("BBCA"), Some(trade_date()));

        // 排空后通知通道随之关闭
        let mut updated = 0;
        while let Some(notification) = notification_rx.recv().await {
            if matches!(notification, SummaryNotification::SummaryUpdated { .. }) {
                updated += 1;
            }
        }
        assert_eq!(updated, 4);
    }

    #[tokio::test]
    async fn test_stocks_are_processed_independently() {
        let (engine, payload_tx, _notification_rx) = setup();
        engine.start().await.unwrap();

        for i in 1..=20 {
            payload_tx.send(payload("E", "BBCA", "20230829", 8000 + i, 10)).await.unwrap();
            payload_tx.send(payload("E", "TLKM", "20230829", 3000 + i, 5)).await.unwrap();
        }
        drop(payload_tx);
        engine.stop().await.unwrap();

        let bbca = engine.get_summary("BBCA", trade_date()).await.unwrap().unwrap();
        assert_eq!(bbca.open, Some(8001));
        assert_eq!(bbca.close, 8020);
        assert_eq!(bbca.volume, 200);

        let tlkm = engine.get_summary("TLKM", trade_date()).await.unwrap().unwrap();
        assert_eq!(tlkm.open, Some(3001));
        assert_eq!(tlkm.close, 3020);
        assert_eq!(tlkm.volume, 100);
    }

    #[tokio::test]
    async fn test_rejected_payloads_are_reported() {
        let (engine, payload_tx, mut notification_rx) = setup();
        engine.start().await.unwrap();

        payload_tx.send(b"not json".to_vec()).await.unwrap();
        payload_tx.send(payload("X", "BBCA", "20230829", 8000, 1)).await.unwrap();
        payload_tx.send(payload("E", "BBCA", "20230829", 8000, 0)).await.unwrap();

        let first = notification_rx.recv().await.unwrap();
        assert!(matches!(first, SummaryNotification::TransactionRejected { stock_code: None, .. }));

        let second = notification_rx.recv().await.unwrap();
        match second {
            SummaryNotification::TransactionRejected { stock_code, .. } => {
                assert_eq!(stock_code.as_deref(), Some("BBCA"));
            }
            other => panic!("期望拒绝通知，实际: {:?}", other),
        }

        // 首笔0数量成交无法计算均价
        let third = notification_rx.recv().await.unwrap();
        assert!(matches!(third, SummaryNotification::TransactionRejected { .. }));
        assert_eq!(engine.last_applied_date("BBCA"), None);

        drop(payload_tx);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_backward_date_is_still_applied() {
        let (engine, payload_tx, _notification_rx) = setup();
        engine.start().await.unwrap();

        payload_tx.send(payload("E", "BBCA", "20230830", 8100, 10)).await.unwrap();
        payload_tx.send(payload("E", "BBCA", "20230829", 8000, 10)).await.unwrap();
        drop(payload_tx);
        engine.stop().await.unwrap();

        assert!(engine.get_summary("BBCA", trade_date()).await.unwrap().is_some());
        assert_eq!(
            engine.last_applied_date("BBCA"),
            Some(NaiveDate::from_ymd_opt(2023, 8, 30).unwrap())
        );
    }

    #[tokio::test]
    async fn test_stop_aborts_after_grace_period() {
        let (engine, payload_tx, _notification_rx) = setup();
        engine.start().await.unwrap();

        // 发送端未关闭，主循环不会自行退出
        engine.stop().await.unwrap();
        assert!(!engine.is_running().await);
        assert!(payload_tx.is_closed());
    }

    #[tokio::test]
    async fn test_query_through_engine() {
        let (engine, payload_tx, _notification_rx) = setup();
        engine.start().await.unwrap();

        payload_tx.send(payload("A", "BBCA", "20230828", 7900, 0)).await.unwrap();
        payload_tx.send(payload("A", "BBCA", "20230829", 8000, 0)).await.unwrap();
        drop(payload_tx);
        engine.stop().await.unwrap();

        let summaries = engine
            .query_summary(&SummaryQueryRequest::new("BBCA", "2023-08-28", "2023-08-29"))
            .await
            .unwrap();
        let prevs: Vec<i64> = summaries.iter().map(|s| s.prev).collect();
        assert_eq!(prevs, vec![7900, 8000]);

        let invalid = engine
            .query_summary(&SummaryQueryRequest::new("BBCA", "2023-08-29", "2023-08-28"))
            .await;
        assert!(matches!(invalid, Err(MarketDataEngineError::ServiceError(ServiceError::Validation(_)))));
    }
}
