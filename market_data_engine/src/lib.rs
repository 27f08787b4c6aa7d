//! # 日线汇总包 (Market Data Engine)
//!
//! 本模块根据逐笔成交记录维护每只股票每个交易日的汇总行情。
//!
//! ## 功能特性
//!
//! - **汇总计算**: 根据集合竞价、开盘前撮合和连续竞价成交更新前收、开高低收、成交量、成交额和均价
//! - **有序集合存储**: 每只股票一个有序集合，以交易日为分值，支持Redis和进程内两种后端
//! - **写入保护**: 写入失败时恢复旧记录，并提供重复记录清理
//! - **按股票路由**: 同一股票的成交记录串行应用，不同股票并行处理
//!
//! ## 模块结构
//!
//! ```text
//! market_data_engine/
//! ├── engine.rs       - 汇总引擎（消息路由、按股票的任务）
//! ├── data_types.rs   - 汇总数据类型和计算规则
//! ├── database.rs     - 有序集合存储接口
//! ├── service.rs      - 汇总服务接口
//! └── lib.rs          - 模块入口和重导出
//! ```

pub mod engine;
pub mod data_types;
pub mod database;
pub mod service;

// 重新导出主要类型
pub use engine::{MarketDataEngine, MarketDataEngineBuilder, MarketDataEngineConfig, MarketDataEngineError};
pub use data_types::{
    StockSummary, SummaryError, SummaryNotification, SummaryQuery, SummaryQueryRequest,
    ValidationError, QUERY_DATE_FORMAT,
};
pub use database::{
    DatabaseError, InMemorySortedSet, RedisConfig, RedisSortedSet, ScoredMember,
    ScoredSummaryRepository, SortedSetBackend, SummaryRepository, date_score, summary_key,
};
pub use service::{ApplyOutcome, ServiceError, StockSummaryService, SummaryAggregator};

// 重新导出核心实体类型
pub use core_entities::{ParseError, Timestamp, Transaction, TransactionType};
