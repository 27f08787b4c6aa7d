use std::io::Write;
use market_data_engine::SummaryQueryRequest;
use summary_server::{App, AppConfig, StoreBackend};
use tempfile::NamedTempFile;

fn memory_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.store.backend = StoreBackend::Memory;
    config.market_data_engine.shutdown_grace_millis = 2000;
    config
}

#[tokio::test]
async fn test_serve_file_then_query() {
    let mut feed = NamedTempFile::new().unwrap();
    let lines = [
        r#"{"type":"A","order_number":"20230829000001","price":"8000","stock_code":"BBCA"}"#,
        r#"{"type":"P","order_number":"20230829000002","quantity":"100","price":"8050","stock_code":"BBCA"}"#,
        "",
        r#"{"type":"P","order_number":"20230829000003","quantity":"500","price":"7950","stock_code":"BBCA"}"#,
        r#"{"type":"E","order_number":"20230829000004","executed_quantity":"200","execution_price":"8100","stock_code":"BBCA"}"#,
        r#"not a message"#,
        r#"{"type":"A","order_number":"20230829000005","price":"8000","stock_code":"BBCA"}"#,
    ];
    for line in lines {
        writeln!(feed, "{}", line).unwrap();
    }

    let mut app = App::new(memory_config());
    app.initialize_services().await.unwrap();

    let stats = app.run(feed.path().to_str()).await.unwrap();
    assert_eq!(stats.updated, 4);
    assert_eq!(stats.unchanged, 1);
    assert_eq!(stats.rejected, 1);

    let summaries = app
        .query(&SummaryQueryRequest::new("BBCA", "2023-08-29", "2023-08-29"))
        .await
        .unwrap();
    assert_eq!(summaries.len(), 1);

    let summary = &summaries[0];
    assert_eq!(summary.prev, 8000);
    assert_eq!(summary.open, Some(8050));
    assert_eq!(summary.high, Some(8100));
    assert_eq!(summary.low, Some(7950));
    assert_eq!(summary.close, 8100);
    assert_eq!(summary.volume, 800);
    assert_eq!(summary.value, 6_400_000);
    assert_eq!(summary.average, 8000);

    assert_eq!(
        app.reconcile(&SummaryQueryRequest::new("BBCA", "2023-08-01", "2023-08-31")).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_serve_missing_file_reports_error() {
    let mut app = App::new(memory_config());
    let result = app.run(Some("/nonexistent/feed.jsonl")).await;
    assert!(result.is_err());

    // 出错后引擎也已停止
    let services = app.services().unwrap();
    assert!(!services.market_data_engine.is_running().await);
}

#[tokio::test]
async fn test_serve_continues_after_non_utf8_line() {
    let mut feed = NamedTempFile::new().unwrap();
    feed.write_all(b"\xff\xfe{\"type\":\"A\"}\n").unwrap();
    writeln!(
        feed,
        r#"{{"type":"E","order_number":"20230829000001","executed_quantity":"10","execution_price":"8000","stock_code":"BBCA"}}"#
    )
    .unwrap();

    let mut app = App::new(memory_config());
    let stats = app.run(feed.path().to_str()).await.unwrap();
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.updated, 1);

    let summaries = app
        .query(&SummaryQueryRequest::new("BBCA", "2023-08-29", "2023-08-29"))
        .await
        .unwrap();
    assert_eq!(summaries[0].volume, 10);
}
