//! 日线汇总数据类型定义

use std::sync::Arc;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use core_entities::{Timestamp, Transaction, TransactionType};

/// 查询接口使用的日期格式
pub const QUERY_DATE_FORMAT: &str = "%Y-%m-%d";

/// 汇总计算错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SummaryError {
    #[error("股票 {stock_code} 的成交类型未定义")]
    UndefinedTransactionType { stock_code: String },

    #[error("股票 {stock_code} 在 {date} 的累计成交量为0，无法计算均价")]
    ZeroVolume { stock_code: String, date: NaiveDate },

    #[error("股票 {stock_code} 在 {date} 的成交额或成交量溢出")]
    ArithmeticOverflow { stock_code: String, date: NaiveDate },
}

/// 查询参数校验错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("股票代码不能为空")]
    EmptyStockCode,

    #[error("{field} 不能为空")]
    EmptyDate { field: &'static str },

    #[error("{field} 日期格式无效: {raw}")]
    InvalidDateFormat { field: &'static str, raw: String },

    #[error("开始日期 {from_date} 晚于结束日期 {to_date}")]
    InvertedRange { from_date: NaiveDate, to_date: NaiveDate },
}

/// 单只股票单日的汇总数据
///
/// `open`/`high`/`low` 为 `None` 表示当日尚未出现对应价格，
/// 与真实的0价格区分开。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSummary {
    /// 股票代码
    pub stock_code: Arc<str>,
    /// 交易日期
    pub date: NaiveDate,
    /// 参考价（前收）
    pub prev: i64,
    /// 开盘价
    pub open: Option<i64>,
    /// 最高价
    pub high: Option<i64>,
    /// 最低价
    pub low: Option<i64>,
    /// 现价（最近一次价格）
    pub close: i64,
    /// 累计成交量
    pub volume: i64,
    /// 累计成交额
    pub value: i64,
    /// 均价
    pub average: i64,
}

impl StockSummary {
    /// 创建某股票某日的空汇总
    pub fn empty(stock_code: impl Into<Arc<str>>, date: NaiveDate) -> Self {
        Self {
            stock_code: stock_code.into(),
            date,
            ..Default::default()
        }
    }

    /// 是否为完全未初始化的零值
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// 将一条成交记录应用到汇总上，返回（是否变化，新汇总）
    ///
    /// 调用方保证同一股票的记录按日期顺序、单线程地应用。
    /// 只有数量为0的集合竞价会更新 `prev`；数量大于0的集合竞价只走
    /// 高低收价格更新，不计入成交量和成交额。
    pub fn apply_transaction(&self, transaction: &Transaction) -> Result<(bool, StockSummary), SummaryError> {
        let mut updated = self.clone();

        if self.is_zero() {
            updated.stock_code = Arc::clone(&transaction.stock_code);
            updated.date = transaction.date;
        }

        match transaction.transaction_type {
            TransactionType::Auction if transaction.quantity == 0 => {
                updated.prev = transaction.price;
            }
            TransactionType::Execution | TransactionType::PreOpening => {
                updated.accumulate(transaction)?;
                updated.update_price_range(transaction);
            }
            TransactionType::Auction => {
                updated.update_price_range(transaction);
            }
            TransactionType::Undefined => {
                return Err(SummaryError::UndefinedTransactionType {
                    stock_code: transaction.stock_code.to_string(),
                });
            }
        }

        let changed = updated != *self;
        Ok((changed, updated))
    }

    /// 累计成交额、成交量并重新计算均价
    fn accumulate(&mut self, transaction: &Transaction) -> Result<(), SummaryError> {
        let overflow = || SummaryError::ArithmeticOverflow {
            stock_code: transaction.stock_code.to_string(),
            date: transaction.date,
        };

        let value = transaction
            .quantity
            .checked_mul(transaction.price)
            .and_then(|amount| self.value.checked_add(amount))
            .ok_or_else(overflow)?;
        let volume = self.volume.checked_add(transaction.quantity).ok_or_else(overflow)?;

        if volume == 0 {
            return Err(SummaryError::ZeroVolume {
                stock_code: transaction.stock_code.to_string(),
                date: transaction.date,
            });
        }

        self.value = value;
        self.volume = volume;
        self.average = value / volume;
        Ok(())
    }

    /// 更新开高低收
    fn update_price_range(&mut self, transaction: &Transaction) {
        let price = transaction.price;

        if self.open.is_none() && transaction.quantity > 0 {
            self.open = Some(price);
        }

        if self.high.is_none_or(|high| high < price) {
            self.high = Some(price);
        }

        if self.low.is_none_or(|low| low > price) {
            self.low = Some(price);
        }

        self.close = price;
    }
}

/// 汇总查询请求（查询接口的原始参数）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryQueryRequest {
    pub stock_code: String,
    pub from_date: String,
    pub to_date: String,
}

impl SummaryQueryRequest {
    pub fn new(stock_code: impl Into<String>, from_date: impl Into<String>, to_date: impl Into<String>) -> Self {
        Self {
            stock_code: stock_code.into(),
            from_date: from_date.into(),
            to_date: to_date.into(),
        }
    }

    /// 校验并转换为查询条件，不访问存储
    pub fn validate(&self) -> Result<SummaryQuery, ValidationError> {
        if self.stock_code.is_empty() {
            return Err(ValidationError::EmptyStockCode);
        }

        let from_date = parse_query_date("from_date", &self.from_date)?;
        let to_date = parse_query_date("to_date", &self.to_date)?;

        SummaryQuery::new(self.stock_code.as_str(), from_date, to_date)
    }
}

fn parse_query_date(field: &'static str, raw: &str) -> Result<NaiveDate, ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::EmptyDate { field });
    }

    NaiveDate::parse_from_str(raw, QUERY_DATE_FORMAT).map_err(|_| ValidationError::InvalidDateFormat {
        field,
        raw: raw.to_string(),
    })
}

/// 校验通过的查询条件，日期区间两端都包含
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryQuery {
    pub stock_code: Arc<str>,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
}

impl SummaryQuery {
    pub fn new(stock_code: impl Into<Arc<str>>, from_date: NaiveDate, to_date: NaiveDate) -> Result<Self, ValidationError> {
        let stock_code = stock_code.into();
        if stock_code.is_empty() {
            return Err(ValidationError::EmptyStockCode);
        }
        if from_date > to_date {
            return Err(ValidationError::InvertedRange { from_date, to_date });
        }

        Ok(Self { stock_code, from_date, to_date })
    }

    /// 单日查询
    pub fn single_day(stock_code: impl Into<Arc<str>>, date: NaiveDate) -> Result<Self, ValidationError> {
        Self::new(stock_code, date, date)
    }
}

/// 引擎发出的处理结果通知，交由接入方决定重试或跳过
#[derive(Debug, Clone)]
pub enum SummaryNotification {
    /// 汇总已更新并写入存储
    SummaryUpdated {
        summary: StockSummary,
        timestamp: Timestamp,
    },
    /// 成交记录未改变汇总，未写入
    SummaryUnchanged {
        stock_code: Arc<str>,
        date: NaiveDate,
        timestamp: Timestamp,
    },
    /// 消息被拒绝（解析失败、计算失败或存储失败）
    TransactionRejected {
        stock_code: Option<Arc<str>>,
        error_message: String,
        timestamp: Timestamp,
    },
}

impl SummaryNotification {
    pub fn rejected(stock_code: Option<Arc<str>>, error_message: impl Into<String>) -> Self {
        SummaryNotification::TransactionRejected {
            stock_code,
            error_message: error_message.into(),
            timestamp: Utc::now(),
        }
    }
}
