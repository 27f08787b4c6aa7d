//! 日线汇总存储接口
//!
//! 每只股票一个有序集合，键为 `stocksummary-<股票代码>`，成员为汇总的JSON，
//! 分值为交易日UTC零点的时间戳（秒）。

use std::{borrow::Cow, collections::{BTreeMap, BTreeSet, HashMap}, time::Duration};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use parking_lot::Mutex;
use redis::{AsyncCommands, aio::MultiplexedConnection};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::data_types::StockSummary;

/// 有序集合键前缀
pub const SUMMARY_KEY_PREFIX: &str = "stocksummary-";

/// 股票代码对应的有序集合键
pub fn summary_key(stock_code: &str) -> String {
    format!("{}{}", SUMMARY_KEY_PREFIX, stock_code)
}

/// 交易日对应的分值：UTC零点的秒级时间戳
pub fn date_score(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Redis 配置
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// 连接URL
    pub redis_url: Cow<'static, str>,
    /// 连接超时时间（秒）
    pub connect_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            redis_url: Cow::Borrowed("redis://127.0.0.1:6379/0"),
            connect_timeout_secs: 5,
        }
    }
}

/// 存储操作错误类型
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Redis错误: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("连接存储超时（{0}秒）")]
    ConnectionTimeout(u64),

    #[error("存储后端错误: {0}")]
    Backend(String),

    #[error("存储配置错误: {0}")]
    ConfigError(String),
}

/// 带分值的有序集合成员
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredMember {
    pub member: String,
    pub score: i64,
}

/// 有序集合后端
///
/// 区间查询两端都包含，结果按分值升序（同分值按成员字典序）。
#[async_trait]
pub trait SortedSetBackend: Send + Sync {
    /// 查询分值区间内的成员
    async fn range_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<ScoredMember>, DatabaseError>;

    /// 删除分值区间内的成员，返回删除数量
    async fn remove_by_score(&self, key: &str, min: i64, max: i64) -> Result<usize, DatabaseError>;

    /// 添加成员，已存在的成员只更新分值
    async fn add(&self, key: &str, member: &str, score: i64) -> Result<(), DatabaseError>;

    /// 删除指定成员，返回删除数量
    async fn remove_member(&self, key: &str, member: &str) -> Result<usize, DatabaseError>;
}

/// Redis 有序集合实现
pub struct RedisSortedSet {
    connection: MultiplexedConnection,
}

impl RedisSortedSet {
    /// 连接 Redis 并验证连通性
    pub async fn new(config: RedisConfig) -> Result<Self, DatabaseError> {
        if config.redis_url.is_empty() {
            return Err(DatabaseError::ConfigError("Redis连接URL不能为空".to_string()));
        }

        info!("正在连接Redis: {}", config.redis_url);

        let client = redis::Client::open(config.redis_url.as_ref())?;
        let timeout = Duration::from_secs(config.connect_timeout_secs);
        let mut connection = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| DatabaseError::ConnectionTimeout(config.connect_timeout_secs))??;

        let _: String = redis::cmd("PING").query_async(&mut connection).await?;

        info!("成功连接到Redis");
        Ok(Self { connection })
    }
}

#[async_trait]
impl SortedSetBackend for RedisSortedSet {
    async fn range_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<ScoredMember>, DatabaseError> {
        let mut conn = self.connection.clone();
        let entries: Vec<(String, f64)> = conn.zrangebyscore_withscores(key, min, max).await?;

        Ok(entries
            .into_iter()
            .map(|(member, score)| ScoredMember { member, score: score as i64 })
            .collect())
    }

    async fn remove_by_score(&self, key: &str, min: i64, max: i64) -> Result<usize, DatabaseError> {
        let mut conn = self.connection.clone();
        let removed: usize = conn.zrembyscore(key, min, max).await?;
        Ok(removed)
    }

    async fn add(&self, key: &str, member: &str, score: i64) -> Result<(), DatabaseError> {
        let mut conn = self.connection.clone();
        let _: usize = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<usize, DatabaseError> {
        let mut conn = self.connection.clone();
        let removed: usize = conn.zrem(key, member).await?;
        Ok(removed)
    }
}

/// 进程内有序集合实现，用于本地运行和测试
#[derive(Default)]
pub struct InMemorySortedSet {
    sets: Mutex<HashMap<String, BTreeSet<(i64, String)>>>,
}

impl InMemorySortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 某个键下的成员数量
    pub fn len(&self, key: &str) -> usize {
        self.sets.lock().get(key).map_or(0, |set| set.len())
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    /// 按分数顺序取出 [min, max] 内的成员，不扫描区间外的部分
    fn scored_range(set: &BTreeSet<(i64, String)>, min: i64, max: i64) -> impl Iterator<Item = &(i64, String)> {
        set.range((min, String::new())..).take_while(move |(score, _)| *score <= max)
    }
}

#[async_trait]
impl SortedSetBackend for InMemorySortedSet {
    async fn range_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<ScoredMember>, DatabaseError> {
        let sets = self.sets.lock();
        let Some(set) = sets.get(key) else {
            return Ok(Vec::new());
        };

        Ok(Self::scored_range(set, min, max)
            .map(|(score, member)| ScoredMember { member: member.clone(), score: *score })
            .collect())
    }

    async fn remove_by_score(&self, key: &str, min: i64, max: i64) -> Result<usize, DatabaseError> {
        let mut sets = self.sets.lock();
        let Some(set) = sets.get_mut(key) else {
            return Ok(0);
        };

        let removed: Vec<(i64, String)> = Self::scored_range(set, min, max).cloned().collect();
        for entry in &removed {
            set.remove(entry);
        }
        Ok(removed.len())
    }

    async fn add(&self, key: &str, member: &str, score: i64) -> Result<(), DatabaseError> {
        let mut sets = self.sets.lock();
        let set = sets.entry(key.to_string()).or_default();
        set.retain(|(_, existing)| existing != member);
        set.insert((score, member.to_string()));
        Ok(())
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<usize, DatabaseError> {
        let mut sets = self.sets.lock();
        let Some(set) = sets.get_mut(key) else {
            return Ok(0);
        };

        let before = set.len();
        set.retain(|(_, existing)| existing != member);
        Ok(before - set.len())
    }
}

/// 日线汇总存储接口
#[async_trait]
pub trait SummaryRepository: Send + Sync {
    /// 获取某股票某日的汇总
    async fn get_summary(&self, stock_code: &str, date: NaiveDate) -> Result<Option<StockSummary>, DatabaseError>;

    /// 获取日期区间内的汇总，按日期升序
    async fn get_summary_range(
        &self,
        stock_code: &str,
        from_date: NaiveDate,
        to_date: NaiveDate,
    ) -> Result<Vec<StockSummary>, DatabaseError>;

    /// 写入汇总，保证该股票该日只留一条记录
    ///
    /// 非原子操作，调用方需保证同一股票同一时刻只有一个写入者。
    async fn upsert_summary(&self, summary: &StockSummary) -> Result<(), DatabaseError>;

    /// 清理区间内同一日期的重复记录，返回删除数量
    async fn reconcile_duplicates(
        &self,
        stock_code: &str,
        from_date: NaiveDate,
        to_date: NaiveDate,
    ) -> Result<usize, DatabaseError>;
}

/// 同一分值下的候选记录
struct Candidate {
    member: String,
    summary: Option<StockSummary>,
}

impl Candidate {
    fn parse(member: String) -> Self {
        let summary = serde_json::from_str(&member).ok();
        Self { member, summary }
    }

    /// 进度排序键：成交量、成交额、成员原文；无法解析的记录排在最后
    fn rank(&self) -> (bool, i64, i64, &str) {
        match &self.summary {
            Some(summary) => (true, summary.volume, summary.value, self.member.as_str()),
            None => (false, 0, 0, self.member.as_str()),
        }
    }
}

/// 按分值分组
fn group_by_score(entries: Vec<ScoredMember>) -> BTreeMap<i64, Vec<Candidate>> {
    let mut groups: BTreeMap<i64, Vec<Candidate>> = BTreeMap::new();
    for entry in entries {
        groups.entry(entry.score).or_default().push(Candidate::parse(entry.member));
    }
    groups
}

/// 组内进度最靠前的记录下标
fn keeper_index(candidates: &[Candidate]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.rank().cmp(&b.rank()))
        .map(|(index, _)| index)
}

/// 基于有序集合的汇总存储
pub struct ScoredSummaryRepository<B> {
    backend: B,
}

impl<B: SortedSetBackend> ScoredSummaryRepository<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn read_range(&self, stock_code: &str, from_date: NaiveDate, to_date: NaiveDate) -> Result<Vec<StockSummary>, DatabaseError> {
        let key = summary_key(stock_code);
        let entries = self.backend.range_by_score(&key, date_score(from_date), date_score(to_date)).await?;

        let mut summaries = Vec::new();
        for (score, mut candidates) in group_by_score(entries) {
            if candidates.len() > 1 {
                warn!(stock_code, score, count = candidates.len(), "同一交易日存在重复汇总记录");
            }

            let Some(index) = keeper_index(&candidates) else {
                continue;
            };
            let candidate = candidates.swap_remove(index);
            match candidate.summary {
                Some(summary) => summaries.push(summary),
                None => {
                    // 重新解析以返回具体错误
                    let summary: StockSummary = serde_json::from_str(&candidate.member)?;
                    summaries.push(summary);
                }
            }
        }

        Ok(summaries)
    }
}

#[async_trait]
impl<B: SortedSetBackend> SummaryRepository for ScoredSummaryRepository<B> {
    #[instrument(skip(self))]
    async fn get_summary(&self, stock_code: &str, date: NaiveDate) -> Result<Option<StockSummary>, DatabaseError> {
        Ok(self.read_range(stock_code, date, date).await?.into_iter().next())
    }

    #[instrument(skip(self))]
    async fn get_summary_range(
        &self,
        stock_code: &str,
        from_date: NaiveDate,
        to_date: NaiveDate,
    ) -> Result<Vec<StockSummary>, DatabaseError> {
        self.read_range(stock_code, from_date, to_date).await
    }

    #[instrument(skip(self, summary), fields(stock_code = %summary.stock_code, date = %summary.date))]
    async fn upsert_summary(&self, summary: &StockSummary) -> Result<(), DatabaseError> {
        // 先序列化，避免删除旧记录后才发现无法写入
        let member = serde_json::to_string(summary)?;
        let key = summary_key(&summary.stock_code);
        let score = date_score(summary.date);

        let existing = self.backend.range_by_score(&key, score, score).await?;
        if !existing.is_empty() {
            self.backend.remove_by_score(&key, score, score).await?;
        }

        if let Err(e) = self.backend.add(&key, &member, score).await {
            for previous in &existing {
                if let Err(restore_err) = self.backend.add(&key, &previous.member, previous.score).await {
                    error!(
                        stock_code = %summary.stock_code,
                        date = %summary.date,
                        "恢复旧汇总记录失败: {}", restore_err
                    );
                }
            }
            return Err(e);
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn reconcile_duplicates(
        &self,
        stock_code: &str,
        from_date: NaiveDate,
        to_date: NaiveDate,
    ) -> Result<usize, DatabaseError> {
        let key = summary_key(stock_code);
        let entries = self.backend.range_by_score(&key, date_score(from_date), date_score(to_date)).await?;

        let mut removed = 0;
        for (_, candidates) in group_by_score(entries) {
            if candidates.len() < 2 {
                continue;
            }
            let Some(keep) = keeper_index(&candidates) else {
                continue;
            };

            for (index, candidate) in candidates.iter().enumerate() {
                if index != keep {
                    removed += self.backend.remove_member(&key, &candidate.member).await?;
                }
            }
        }

        if removed > 0 {
            info!("清理了股票 {} 的 {} 条重复汇总记录", stock_code, removed);
        }
        Ok(removed)
    }
}
