//! 消息接入适配器
//!
//! 每行一条JSON成交消息，逐行送入汇总引擎；引擎的处理结果通过通知通道汇报。
//! 解析或处理失败的消息只记录日志，继续处理下一条。

use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use market_data_engine::SummaryNotification;

use crate::error::AppError;

/// 消息来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionSource {
    Stdin,
    File(PathBuf),
}

impl IngestionSource {
    pub fn parse(source: &str) -> Self {
        match source {
            "" | "-" => IngestionSource::Stdin,
            path => IngestionSource::File(PathBuf::from(path)),
        }
    }
}

/// 从来源读取消息并发送给引擎，返回发送的消息数
pub async fn run_ingestion(source: &IngestionSource, payload_tx: mpsc::Sender<Vec<u8>>) -> Result<usize, AppError> {
    match source {
        IngestionSource::Stdin => {
            info!("从标准输入读取成交消息");
            forward_lines(BufReader::new(tokio::io::stdin()), payload_tx).await
        }
        IngestionSource::File(path) => {
            info!("从文件读取成交消息: {}", path.display());
            let file = tokio::fs::File::open(path).await?;
            forward_lines(BufReader::new(file), payload_tx).await
        }
    }
}

/// 逐行转发原始字节，跳过空行
///
/// 不要求每行是合法的UTF-8，格式错误的消息交给引擎解析时拒绝。
pub async fn forward_lines<R>(reader: R, payload_tx: mpsc::Sender<Vec<u8>>) -> Result<usize, AppError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.split(b'\n');
    let mut forwarded = 0;

    while let Some(line) = lines.next_segment().await? {
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }

        payload_tx
            .send(line.to_vec())
            .await
            .map_err(|_| AppError::ChannelSend("汇总引擎已停止接收消息".to_string()))?;
        forwarded += 1;
    }

    debug!("消息来源读取完毕，共 {} 条", forwarded);
    Ok(forwarded)
}

/// 通知统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationStats {
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
}

/// 汇报引擎的处理结果，通道关闭后返回统计
pub async fn report_notifications(mut notification_rx: mpsc::Receiver<SummaryNotification>) -> NotificationStats {
    let mut stats = NotificationStats::default();

    while let Some(notification) = notification_rx.recv().await {
        match notification {
            SummaryNotification::SummaryUpdated { summary, .. } => {
                stats.updated += 1;
                debug!(
                    stock_code = %summary.stock_code,
                    date = %summary.date,
                    close = summary.close,
                    volume = summary.volume,
                    "汇总已更新"
                );
            }
            SummaryNotification::SummaryUnchanged { stock_code, date, .. } => {
                stats.unchanged += 1;
                debug!(stock_code = %stock_code, date = %date, "汇总无变化");
            }
            SummaryNotification::TransactionRejected { stock_code, error_message, .. } => {
                stats.rejected += 1;
                warn!(
                    stock_code = stock_code.as_deref().unwrap_or(""),
                    "成交消息被拒绝: {}", error_message
                );
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use chrono::NaiveDate;
    use market_data_engine::StockSummary;
    use tempfile::NamedTempFile;

    #[test]
    fn test_source_parsing() {
        assert_eq!(IngestionSource::parse("-"), IngestionSource::Stdin);
        assert_eq!(IngestionSource::parse(""), IngestionSource::Stdin);
        assert_eq!(
            IngestionSource::parse("data/feed.jsonl"),
            IngestionSource::File(PathBuf::from("data/feed.jsonl"))
        );
    }

    #[tokio::test]
    async fn test_forward_lines_skips_blank_lines() {
        let input: &[u8] = b"{\"type\":\"A\"}\n\n   \n{\"type\":\"E\"}\n";
        let (payload_tx, mut payload_rx) = mpsc::channel(10);

        let forwarded = forward_lines(input, payload_tx).await.unwrap();
        assert_eq!(forwarded, 2);
        assert_eq!(payload_rx.recv().await.unwrap(), b"{\"type\":\"A\"}".to_vec());
        assert_eq!(payload_rx.recv().await.unwrap(), b"{\"type\":\"E\"}".to_vec());
        assert!(payload_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_forward_lines_passes_non_utf8_line_through() {
        let input: &[u8] = b"\xff\xfe\r\n{\"type\":\"A\"}\n";
        let (payload_tx, mut payload_rx) = mpsc::channel(10);

        let forwarded = forward_lines(input, payload_tx).await.unwrap();
        assert_eq!(forwarded, 2);
        assert_eq!(payload_rx.recv().await.unwrap(), vec![0xff, 0xfe]);
        assert_eq!(payload_rx.recv().await.unwrap(), b"{\"type\":\"A\"}".to_vec());
        assert!(payload_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_forward_lines_fails_when_engine_gone() {
        let input: &[u8] = b"{}\n";
        let (payload_tx, payload_rx) = mpsc::channel(10);
        drop(payload_rx);

        let result = forward_lines(input, payload_tx).await;
        assert!(matches!(result, Err(AppError::ChannelSend(_))));
    }

    #[tokio::test]
    async fn test_run_ingestion_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{\"type\":\"A\",\"stock_code\":\"BBCA\"}}").unwrap();
        writeln!(file, "{{\"type\":\"E\",\"stock_code\":\"BBCA\"}}").unwrap();

        let (payload_tx, _payload_rx) = mpsc::channel(10);
        let source = IngestionSource::File(file.path().to_path_buf());
        assert_eq!(run_ingestion(&source, payload_tx).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_run_ingestion_missing_file() {
        let (payload_tx, _payload_rx) = mpsc::channel(10);
        let source = IngestionSource::File(PathBuf::from("/nonexistent/feed.jsonl"));
        assert!(matches!(run_ingestion(&source, payload_tx).await, Err(AppError::Io(_))));
    }

    #[tokio::test]
    async fn test_report_notifications_counts() {
        let (notification_tx, notification_rx) = mpsc::channel(10);
        let date = NaiveDate::from_ymd_opt(2023, 8, 29).unwrap();

        notification_tx
            .send(SummaryNotification::SummaryUpdated {
                summary: StockSummary::empty("BBCA", date),
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();
        notification_tx
            .send(SummaryNotification::SummaryUnchanged {
                stock_code: "BBCA".into(),
                date,
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();
        notification_tx
            .send(SummaryNotification::rejected(None, "消息格式错误"))
            .await
            .unwrap();
        drop(notification_tx);

        let stats = report_notifications(notification_rx).await;
        assert_eq!(stats, NotificationStats { updated: 1, unchanged: 1, rejected: 1 });
    }
}
