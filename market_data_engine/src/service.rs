//! 日线汇总服务接口定义

use std::sync::Arc;
use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, instrument};
use core_entities::{ParseError, Transaction, parse_transaction};

use crate::data_types::{StockSummary, SummaryError, SummaryQuery, SummaryQueryRequest, ValidationError};
use crate::database::{DatabaseError, SummaryRepository};

/// 汇总服务错误类型
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("消息解析失败: {0}")]
    Parse(#[from] ParseError),

    #[error("查询参数无效: {0}")]
    Validation(#[from] ValidationError),

    #[error("汇总计算失败: {0}")]
    Summary(#[from] SummaryError),

    #[error("存储错误: {0}")]
    Database(#[from] DatabaseError),
}

/// 应用一条成交记录的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// 汇总有变化并已写入
    Updated(StockSummary),
    /// 汇总无变化，未写入
    Unchanged(StockSummary),
}

impl ApplyOutcome {
    pub fn summary(&self) -> &StockSummary {
        match self {
            ApplyOutcome::Updated(summary) | ApplyOutcome::Unchanged(summary) => summary,
        }
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, ApplyOutcome::Updated(_))
    }
}

/// 日线汇总服务接口
///
/// 接入方（消息消费者、查询接口）通过这个接口更新和读取汇总。
/// 同一股票的成交记录必须按日期顺序、由同一个调用方依次应用。
#[async_trait]
pub trait StockSummaryService: Send + Sync {
    /// 应用一条标准化的成交记录
    async fn apply_transaction(&self, transaction: &Transaction) -> Result<ApplyOutcome, ServiceError>;

    /// 解析原始消息并应用
    async fn apply_payload(&self, payload: &[u8]) -> Result<ApplyOutcome, ServiceError> {
        let transaction = parse_transaction(payload)?;
        self.apply_transaction(&transaction).await
    }

    /// 按日期区间查询汇总，区间内没有数据时返回空列表
    async fn query_summary(&self, request: &SummaryQueryRequest) -> Result<Vec<StockSummary>, ServiceError>;

    /// 查询单日汇总
    async fn get_summary(&self, stock_code: &str, date: NaiveDate) -> Result<Option<StockSummary>, ServiceError>;

    /// 清理区间内的重复记录
    async fn reconcile(&self, query: &SummaryQuery) -> Result<usize, ServiceError>;
}

/// 基于汇总存储的服务实现
#[derive(Clone)]
pub struct SummaryAggregator {
    repository: Arc<dyn SummaryRepository>,
}

impl SummaryAggregator {
    pub fn new(repository: Arc<dyn SummaryRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl StockSummaryService for SummaryAggregator {
    #[instrument(skip(self, transaction), fields(stock_code = %transaction.stock_code, date = %transaction.date))]
    async fn apply_transaction(&self, transaction: &Transaction) -> Result<ApplyOutcome, ServiceError> {
        let existing = self
            .repository
            .get_summary(&transaction.stock_code, transaction.date)
            .await?
            .unwrap_or_else(|| StockSummary::empty(Arc::clone(&transaction.stock_code), transaction.date));

        let (changed, next) = existing.apply_transaction(transaction)?;
        if !changed {
            debug!("成交记录未改变汇总，跳过写入");
            return Ok(ApplyOutcome::Unchanged(next));
        }

        self.repository.upsert_summary(&next).await?;
        Ok(ApplyOutcome::Updated(next))
    }

    #[instrument(skip(self))]
    async fn query_summary(&self, request: &SummaryQueryRequest) -> Result<Vec<StockSummary>, ServiceError> {
        let query = request.validate()?;
        let summaries = self
            .repository
            .get_summary_range(&query.stock_code, query.from_date, query.to_date)
            .await?;
        Ok(summaries)
    }

    #[instrument(skip(self))]
    async fn get_summary(&self, stock_code: &str, date: NaiveDate) -> Result<Option<StockSummary>, ServiceError> {
        let query = SummaryQuery::single_day(stock_code, date)?;
        Ok(self.repository.get_summary(&query.stock_code, query.from_date).await?)
    }

    #[instrument(skip(self))]
    async fn reconcile(&self, query: &SummaryQuery) -> Result<usize, ServiceError> {
        Ok(self
            .repository
            .reconcile_duplicates(&query.stock_code, query.from_date, query.to_date)
            .await?)
    }
}
