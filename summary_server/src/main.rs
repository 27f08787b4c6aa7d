use summary_server::{App, AppConfig, Command, init_tracing, parse_cli_args};
use market_data_engine::SummaryQueryRequest;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_cli_args();

    // 加载配置
    let config = match AppConfig::load_from(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) if args.config.is_some() => {
            eprintln!("加载配置文件失败: {}", e);
            return Err(e.into());
        }
        Err(e) => {
            eprintln!("加载配置失败，使用默认配置: {}", e);
            AppConfig::default()
        }
    };

    // 初始化日志
    init_tracing(&config.logging);

    info!(
        "配置信息: 存储后端={:?}, Redis={}",
        config.store.backend, config.store.redis_url
    );

    let mut app = App::new(config);

    match args.command() {
        Command::Serve { source } => {
            info!("启动股票日线汇总服务");
            app.initialize_services().await?;

            match app.run(source.as_deref()).await {
                Ok(stats) if stats.rejected > 0 => warn!("有 {} 条消息被拒绝", stats.rejected),
                Ok(_) => {}
                Err(e) => {
                    error!("服务运行出错: {}", e);
                    return Err(e.into());
                }
            }
            info!("服务正常关闭");
        }
        Command::Query(range) => {
            let request = SummaryQueryRequest::new(range.stock_code, range.from, range.to);
            let summaries = app.query(&request).await?;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        Command::Reconcile(range) => {
            let request = SummaryQueryRequest::new(range.stock_code, range.from, range.to);
            let removed = app.reconcile(&request).await?;
            println!("{}", removed);
        }
    }

    Ok(())
}
