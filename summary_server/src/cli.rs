//! 命令行参数处理
//!
//! ```text
//! $ summary_server --config config.yml serve --source feed.jsonl
//! $ summary_server query --stock-code BBCA --from 2023-08-01 --to 2023-08-31
//! ```

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(author, version, about = "股票日线汇总服务：消费逐笔成交消息并提供汇总查询", long_about = None)]
pub struct CliArgs {
    /// 配置文件路径，未指定时按默认位置查找
    #[clap(short, long, global = true)]
    pub config: Option<String>,

    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 消费成交消息并更新汇总（默认命令）
    Serve {
        /// 消息来源，`-` 为标准输入，覆盖配置文件中的 ingestion.source
        #[clap(short, long)]
        source: Option<String>,
    },
    /// 按日期区间查询汇总，以JSON输出
    Query(RangeArgs),
    /// 清理日期区间内的重复汇总记录
    Reconcile(RangeArgs),
}

/// 股票代码和日期区间（yyyy-mm-dd，两端都包含）
#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct RangeArgs {
    #[clap(long)]
    pub stock_code: String,
    #[clap(long)]
    pub from: String,
    #[clap(long)]
    pub to: String,
}

impl CliArgs {
    /// 未指定子命令时运行消费服务
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve { source: None })
    }
}

/// 解析命令行参数
pub fn parse_cli_args() -> CliArgs {
    CliArgs::parse()
}
