use anyhow::{Context, Result};
use clap::Parser;
use manga_downloader_rust::{
    config::AppConfig, logging, ChapterRequest, DownloadEvent, DownloadManager, DownloadStatus,
    HttpSource,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 漫画章节下载器
///
/// 读取任务文件中的章节列表，全部下载完成（或 Ctrl-C）后退出。
#[derive(Debug, Parser)]
#[command(name = "manga-downloader-rust", version, about)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// 任务文件（JSON 数组，元素为章节请求）
    #[arg(short, long)]
    jobs: PathBuf,

    /// 覆盖配置中的最大并行下载数
    #[arg(short, long)]
    parallel: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config).await?;
    let _log_guard = logging::init_logging(&config.log);

    let source = HttpSource::new(
        config.source.name.clone(),
        &config.source.user_agent,
        config.source.timeout_secs,
    )
    .context("创建 HTTP 源失败")?;

    let manager = Arc::new(DownloadManager::new(Arc::new(source), &config.download));
    if let Some(parallel) = cli.parallel {
        manager.set_parallel_downloads(parallel);
    }

    // 事件流打印（订阅必须在入队前建立，避免错过队列事件）
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DownloadEvent::PageReady { page_index, .. } => {
                    info!("页面 #{} 完成", page_index);
                }
                DownloadEvent::PageFailed {
                    page_index, error, ..
                } => {
                    warn!("页面 #{} 失败: {}", page_index, error);
                }
                DownloadEvent::Completed { task_id } => {
                    info!("任务完成: {}", task_id);
                }
                DownloadEvent::Failed { task_id, error } => {
                    error!("任务失败: {} ({})", task_id, error);
                }
                _ => {}
            }
        }
    });

    let requests = load_jobs(&cli.jobs).await?;
    let total = requests.len();
    let added = manager.enqueue(requests).await;
    info!("任务文件共 {} 个章节，实际入队 {} 个", total, added);

    if !manager.start().await {
        info!("没有需要下载的章节，退出");
        return Ok(());
    }

    // 等待队列处理完毕或用户中断
    let mut running = manager.running_state();
    loop {
        tokio::select! {
            changed = running.changed() => {
                if changed.is_err() || !*running.borrow() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("收到中断信号，正在停止下载引擎...");
                manager.stop().await;
                break;
            }
        }
    }

    // 退出摘要：留在队列里的都是未完成的任务
    let remaining = manager.queue_snapshot().await;
    let completed = added.saturating_sub(remaining.len());
    info!("下载结束: 完成 {} 个章节, 未完成 {} 个", completed, remaining.len());
    for task in &remaining {
        let status = match task.status {
            DownloadStatus::Error => "失败",
            DownloadStatus::Queued => "未开始",
            _ => "未完成",
        };
        warn!(
            "  [{}] {} / {} ({}/{} 页)",
            status,
            task.manga_title,
            task.chapter.name,
            task.downloaded_count(),
            task.page_count()
        );
    }

    Ok(())
}

/// 读取任务文件
async fn load_jobs(path: &PathBuf) -> Result<Vec<ChapterRequest>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("读取任务文件失败: {:?}", path))?;
    let requests: Vec<ChapterRequest> =
        serde_json::from_str(&content).with_context(|| format!("解析任务文件失败: {:?}", path))?;
    Ok(requests)
}
