//! drive-migrate 命令行入口
//!
//! 用法：`drive-migrate [配置文件]`。其余设置见 `DRIVE_MIGRATE__*` 环境变量。
//! 迁移事件逐行以 JSON 输出到 stderr，最终报告以 JSON 输出到 stdout。

use std::path::PathBuf;
use std::sync::Arc;

use drive_migrate::logging::init_tracing;
use drive_migrate::migration::ChannelSink;
use drive_migrate::{MigrationConfig, MigrationPipeline};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_file = std::env::args_os().nth(1).map(PathBuf::from);
    let config = MigrationConfig::load(config_file.as_deref())?;
    init_tracing(&config.log_filter);

    let request = config.request()?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                eprintln!("{}", line);
            }
        }
    });

    let result = MigrationPipeline::new(request)
        .with_options(config.options())
        .with_event_sink(Arc::new(ChannelSink::new(tx)))
        .run()
        .await;
    // 管线结束后 sink 已释放，通道关闭
    printer.await?;

    let report = result?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
