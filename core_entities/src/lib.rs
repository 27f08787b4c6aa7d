// Core domain entities and shared types
use std::fmt::Display;
use std::sync::Arc;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Timestamp = DateTime<Utc>;

/// 订单编号中日期部分的格式（yyyyMMdd）
pub const ORDER_NUMBER_DATE_FORMAT: &str = "%Y%m%d";

/// 订单编号中日期部分的长度
const ORDER_NUMBER_DATE_LEN: usize = 8;

/// 成交记录类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    /// 集合竞价（数量为0时表示参考价）
    Auction,
    /// 开盘前撮合
    PreOpening,
    /// 连续竞价成交
    Execution,
    /// 无法识别的类型，只作为解析失败的标记
    Undefined,
}

impl TransactionType {
    /// 从行情消息中的类型代码转换
    pub fn from_code(code: &str) -> Self {
        match code {
            "A" => TransactionType::Auction,
            "P" => TransactionType::PreOpening,
            "E" => TransactionType::Execution,
            _ => TransactionType::Undefined,
        }
    }

    /// 类型代码
    pub fn code(&self) -> &'static str {
        match self {
            TransactionType::Auction => "A",
            TransactionType::PreOpening => "P",
            TransactionType::Execution => "E",
            TransactionType::Undefined => "",
        }
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self, TransactionType::Undefined)
    }
}

impl Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionType::Auction => write!(f, "Auction"),
            TransactionType::PreOpening => write!(f, "PreOpening"),
            TransactionType::Execution => write!(f, "Execution"),
            TransactionType::Undefined => write!(f, "Undefined"),
        }
    }
}

/// 标准化后的成交记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// 股票代码
    pub stock_code: Arc<str>,
    /// 成交类型
    pub transaction_type: TransactionType,
    /// 价格（整数货币单位）
    pub price: i64,
    /// 数量
    pub quantity: i64,
    /// 交易日期，只保留日期部分。同一股票的记录按日期顺序到达
    pub date: NaiveDate,
}

impl Transaction {
    pub fn new(
        stock_code: impl Into<Arc<str>>,
        transaction_type: TransactionType,
        price: i64,
        quantity: i64,
        date: NaiveDate,
    ) -> Self {
        Self {
            stock_code: stock_code.into(),
            transaction_type,
            price,
            quantity,
            date,
        }
    }

    /// 是否为只更新参考价的集合竞价记录
    pub fn is_reference_price(&self) -> bool {
        self.transaction_type == TransactionType::Auction && self.quantity == 0
    }
}

/// 成交记录解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("消息格式错误: {0}")]
    MalformedPayload(String),

    #[error("无效的成交类型: {raw:?}")]
    InvalidType { raw: String },

    #[error("无效的价格: {raw:?}")]
    InvalidPrice { raw: String },

    #[error("无效的数量: {raw:?}")]
    InvalidQuantity { raw: String },

    #[error("无效的订单编号: {raw:?}")]
    InvalidOrderNumber { raw: String },

    #[error("股票代码不能为空")]
    MissingStockCode,
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::MalformedPayload(err.to_string())
    }
}

/// 消息队列中的原始成交记录
///
/// 不同类型的记录字段名不同：竞价类记录使用 `price`/`quantity`，
/// 成交回报使用 `execution_price`/`executed_quantity`。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    #[serde(rename = "type", default)]
    pub transaction_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub order_book: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub order_number: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub order_verb: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub quantity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub price: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stock_code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub executed_quantity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub execution_price: String,
}

impl TransactionRecord {
    /// 从消息字节解码
    pub fn from_slice(payload: &[u8]) -> Result<Self, ParseError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// 转换为标准化的成交记录
    pub fn to_transaction(&self) -> Result<Transaction, ParseError> {
        let transaction_type = TransactionType::from_code(&self.transaction_type);
        if !transaction_type.is_defined() {
            return Err(ParseError::InvalidType { raw: self.transaction_type.clone() });
        }

        let price = first_non_empty(&self.price, &self.execution_price);
        let price = price
            .parse::<i64>()
            .map_err(|_| ParseError::InvalidPrice { raw: price.to_string() })?;

        // 两个字段都没有时视为只带参考价的记录
        let quantity = first_non_empty(&self.quantity, &self.executed_quantity);
        let quantity = if quantity.is_empty() {
            0
        } else {
            match quantity.parse::<i64>() {
                Ok(q) if q >= 0 => q,
                _ => return Err(ParseError::InvalidQuantity { raw: quantity.to_string() }),
            }
        };

        if self.stock_code.is_empty() {
            return Err(ParseError::MissingStockCode);
        }

        let date = date_from_order_number(&self.order_number)?;

        Ok(Transaction {
            stock_code: self.stock_code.as_str().into(),
            transaction_type,
            price,
            quantity,
            date,
        })
    }
}

/// 解析并转换一条消息
pub fn parse_transaction(payload: &[u8]) -> Result<Transaction, ParseError> {
    TransactionRecord::from_slice(payload)?.to_transaction()
}

fn first_non_empty<'a>(primary: &'a str, fallback: &'a str) -> &'a str {
    if primary.is_empty() { fallback } else { primary }
}

/// 订单编号以 yyyyMMdd 开头，之后的时间部分被丢弃
pub fn date_from_order_number(order_number: &str) -> Result<NaiveDate, ParseError> {
    let date_part = match order_number.char_indices().nth(ORDER_NUMBER_DATE_LEN) {
        Some((idx, _)) => &order_number[..idx],
        None => order_number,
    };

    // chrono 允许一位数的月/日，这里要求严格的8位数字
    if date_part.len() != ORDER_NUMBER_DATE_LEN || !date_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidOrderNumber { raw: order_number.to_string() });
    }

    NaiveDate::parse_from_str(date_part, ORDER_NUMBER_DATE_FORMAT)
        .map_err(|_| ParseError::InvalidOrderNumber { raw: order_number.to_string() })
}
