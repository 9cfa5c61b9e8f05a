use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::pipeline::ChapterPipeline;
use super::queue::DownloadQueue;
use super::scheduler::DownloadScheduler;
use super::task::{ChapterRequest, DownloadStatus, DownloadTask};
use crate::config::DownloadConfig;
use crate::downloader::Page;
use crate::events::{DownloadEvent, EventBus};
use crate::persistence::store::ChapterStore;
use crate::source::Source;

/// 下载管理器
///
/// 引擎的对外门面：入队、启动、停止、只读查询与事件订阅。
/// 宿主服务（连通性/电源管理）只通过 `start`/`stop`/`running_state`
/// 与引擎交互；阅读层只使用只读查询。
pub struct DownloadManager {
    /// 下载队列
    queue: Arc<DownloadQueue>,
    /// 动态并发调度器
    scheduler: DownloadScheduler,
    /// 远端源
    source: Arc<dyn Source>,
    /// 章节存储
    store: Arc<ChapterStore>,
    /// 事件总线
    bus: Arc<EventBus>,
    /// 运行状态广播（true = 引擎正在下载）
    running_tx: Arc<watch::Sender<bool>>,
    /// 并行下载数偏好流的发送端
    limit_tx: watch::Sender<usize>,
    /// 本轮运行的取消令牌（每次 start 换新）
    cancel: parking_lot::Mutex<CancellationToken>,
    /// 单页失败后的额外重试次数
    max_retries: u32,
    /// 单页重试间隔
    retry_delay: Duration,
}

impl DownloadManager {
    pub fn new(source: Arc<dyn Source>, config: &DownloadConfig) -> Self {
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(DownloadQueue::new(bus.clone()));
        let store = Arc::new(ChapterStore::new(config.download_dir.clone()));

        let (limit_tx, limit_rx) = watch::channel(config.max_concurrent_chapters.max(1));
        let scheduler = DownloadScheduler::new(limit_rx);
        let (running_tx, _) = watch::channel(false);

        info!(
            "创建下载管理器: 根目录={:?}, 最大并行数={}, 单页重试={}",
            config.download_dir, config.max_concurrent_chapters, config.max_retries
        );

        let manager = Self {
            queue,
            scheduler,
            source,
            store,
            bus,
            running_tx: Arc::new(running_tx),
            limit_tx,
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        };

        manager.start_idle_monitor();
        manager
    }

    /// 启动空闲监控：队列被调度器消费完后自动回落运行状态
    fn start_idle_monitor(&self) {
        let running_tx = self.running_tx.clone();
        let mut idle_rx = self.scheduler.idle_state();

        tokio::spawn(async move {
            while idle_rx.changed().await.is_ok() {
                let idle = *idle_rx.borrow();
                if idle {
                    let transitioned = running_tx.send_if_modified(|running| {
                        if *running {
                            *running = false;
                            true
                        } else {
                            false
                        }
                    });
                    if transitioned {
                        info!("队列已处理完毕，下载引擎进入空闲");
                    }
                }
            }
        });
    }

    /// 批量入队章节
    ///
    /// 已在队列中或磁盘上已完整下载的章节被跳过；引擎正在运行时，
    /// 新任务直接进入调度器。返回实际入队的数量。
    pub async fn enqueue(&self, requests: Vec<ChapterRequest>) -> usize {
        let mut added = 0;

        for request in requests {
            let directory = self.store.chapter_dir(&request);
            if self.store.is_chapter_downloaded(&directory) {
                debug!("章节 {} 已完整下载，跳过入队", request.chapter.id);
                continue;
            }

            let task = DownloadTask::new(request, directory);
            let Some(handle) = self.queue.add(task).await else {
                continue;
            };
            added += 1;

            if self.is_running() {
                self.mark_queued_and_submit(handle).await;
            }
        }

        if added > 0 {
            info!("已入队 {} 个章节任务", added);
        }
        added
    }

    /// 启动引擎
    ///
    /// 队列为空或引擎已在运行时返回 false；否则把所有未完成任务
    /// 标记为等待并交给调度器，返回是否有任务被提交。
    pub async fn start(&self) -> bool {
        if self.is_running() {
            debug!("引擎已在运行，忽略重复启动");
            return false;
        }
        if self.queue.is_empty().await {
            debug!("队列为空，无任务可启动");
            return false;
        }

        // 每轮运行使用新的取消令牌，避免上一轮 stop 的影响
        *self.cancel.lock() = CancellationToken::new();

        let mut pending = Vec::new();
        for handle in self.queue.snapshot().await {
            let unfinished = {
                let task = handle.lock().await;
                task.status != DownloadStatus::Downloaded
            };
            if unfinished {
                pending.push(handle);
            }
        }
        if pending.is_empty() {
            return false;
        }

        // 先置运行标志再提交：任务可能在提交后立刻完成，
        // 空闲监控必须能观察到 true -> false 的回落
        self.set_running(true);
        let submitted = pending.len();
        for handle in pending {
            self.mark_queued_and_submit(handle).await;
        }

        info!("🚀 下载引擎启动: 提交 {} 个任务", submitted);
        true
    }

    /// 停止引擎
    ///
    /// 丢弃未启动的积压任务（任务本身留在队列中），取消令牌让在途
    /// 流水线在页面边界退出；下载中的任务标记为失败。已写入的文件
    /// 不回滚，下次 start 时按清单与文件存在性续传。
    pub async fn stop(&self) {
        self.cancel.lock().cancel();
        let dropped = self.scheduler.clear_backlog();

        for handle in self.queue.snapshot().await {
            let failed = {
                let mut task = handle.lock().await;
                if task.status == DownloadStatus::Downloading {
                    task.mark_failed("下载已停止".to_string());
                    Some(task.id.clone())
                } else {
                    None
                }
            };
            if let Some(task_id) = failed {
                self.bus.publish(DownloadEvent::StatusChanged {
                    task_id: task_id.clone(),
                    old_status: DownloadStatus::Downloading,
                    new_status: DownloadStatus::Error,
                });
                self.bus.publish(DownloadEvent::Failed {
                    task_id,
                    error: "下载已停止".to_string(),
                });
            }
        }

        self.set_running(false);
        info!("⏹ 下载引擎已停止 (丢弃未启动任务 {} 个)", dropped);
    }

    /// 标记任务为等待并提交到调度器
    async fn mark_queued_and_submit(&self, handle: Arc<Mutex<DownloadTask>>) {
        let (task_id, old_status) = {
            let mut task = handle.lock().await;
            let old = task.status;
            task.mark_queued();
            (task.id.clone(), old)
        };
        if old_status != DownloadStatus::Queued {
            self.bus.publish(DownloadEvent::StatusChanged {
                task_id,
                old_status,
                new_status: DownloadStatus::Queued,
            });
        }

        let pipeline = ChapterPipeline::new(
            handle,
            self.source.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.bus.clone(),
            self.cancel.lock().clone(),
            self.max_retries,
            self.retry_delay,
        );
        self.scheduler.submit(pipeline.run());
    }

    fn set_running(&self, running: bool) {
        self.running_tx.send_if_modified(|current| {
            if *current != running {
                *current = running;
                true
            } else {
                false
            }
        });
    }

    // ========================================================================
    // 只读查询（独立于引擎运行状态，阅读层可直接使用）
    // ========================================================================

    /// 章节是否已完整下载（目录 + 清单 + 文件计数判定）
    pub fn is_chapter_downloaded(&self, request: &ChapterRequest) -> bool {
        let directory = self.store.chapter_dir(request);
        self.store.is_chapter_downloaded(&directory)
    }

    /// 读取已保存的页面列表
    pub fn saved_page_list(&self, request: &ChapterRequest) -> Option<Vec<Page>> {
        self.store.saved_page_list(request)
    }

    /// 章节目录
    pub fn chapter_directory(&self, request: &ChapterRequest) -> PathBuf {
        self.store.chapter_dir(request)
    }

    // ========================================================================
    // 状态与事件
    // ========================================================================

    /// 引擎是否正在运行
    pub fn is_running(&self) -> bool {
        *self.running_tx.borrow()
    }

    /// 订阅运行状态变化（宿主服务用于管理唤醒锁等系统资源）
    pub fn running_state(&self) -> watch::Receiver<bool> {
        self.running_tx.subscribe()
    }

    /// 订阅下载事件流
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        self.bus.subscribe()
    }

    /// 调整最大并行下载数（运行期间随时生效，不取消在途任务）
    pub fn set_parallel_downloads(&self, limit: usize) {
        let _ = self.limit_tx.send(limit.max(1));
    }

    /// 当前并发上限
    pub fn parallel_downloads(&self) -> usize {
        self.scheduler.limit()
    }

    /// 队列快照
    pub async fn queue_snapshot(&self) -> Vec<DownloadTask> {
        let mut tasks = Vec::new();
        for handle in self.queue.snapshot().await {
            tasks.push(handle.lock().await.clone());
        }
        tasks
    }

    /// 队列长度
    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }
}
