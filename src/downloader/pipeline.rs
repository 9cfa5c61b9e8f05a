use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::page::{Page, PageStatus};
use super::queue::DownloadQueue;
use super::task::{DownloadStatus, DownloadTask};
use crate::events::{DownloadEvent, EventBus};
use crate::persistence::{manifest, store};
use crate::persistence::store::ChapterStore;
use crate::source::Source;

/// 章节下载流水线
///
/// 每个任务由独立的流水线实例驱动，流水线是任务可变字段的唯一写入方：
/// 1. 解析页面列表（内存 -> 磁盘清单 -> 网络，网络结果立即落盘）
/// 2. 创建章节目录
/// 3. 按索引顺序逐页下载：已存在的文件直接复用（断点续传），
///    失败的页面有限重试后跳过，不中断整章
/// 4. 收尾：写入终态清单，校验文件计数，计算章节终态
pub struct ChapterPipeline {
    task: Arc<Mutex<DownloadTask>>,
    source: Arc<dyn Source>,
    store: Arc<ChapterStore>,
    queue: Arc<DownloadQueue>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
    /// 单页失败后的额外重试次数
    max_retries: u32,
    /// 重试间隔
    retry_delay: Duration,
}

impl ChapterPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task: Arc<Mutex<DownloadTask>>,
        source: Arc<dyn Source>,
        store: Arc<ChapterStore>,
        queue: Arc<DownloadQueue>,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            task,
            source,
            store,
            queue,
            bus,
            cancel,
            max_retries,
            retry_delay,
        }
    }

    /// 执行流水线
    ///
    /// 所有失败路径都收敛为任务状态与事件，不向调度器传播错误。
    pub async fn run(self) {
        // 引擎在任务启动前已停止：保持 Queued 状态，等待下次 start
        if self.cancel.is_cancelled() {
            return;
        }

        let (task_id, directory) = {
            let mut task = self.task.lock().await;
            let old_status = task.status;
            task.mark_downloading();
            let info = (task.id.clone(), task.directory.clone());
            drop(task);
            self.bus.publish(DownloadEvent::StatusChanged {
                task_id: info.0.clone(),
                old_status,
                new_status: DownloadStatus::Downloading,
            });
            info
        };

        // 1. 解析页面列表（失败对整章是致命的）
        let mut pages = match self.resolve_page_list(&directory).await {
            Ok(pages) => pages,
            Err(e) => {
                self.fail(format!("获取页面列表失败: {:#}", e)).await;
                return;
            }
        };

        // 2. 创建章节目录
        if let Err(e) = tokio::fs::create_dir_all(&directory).await {
            self.fail(format!("创建章节目录失败 {:?}: {}", directory, e))
                .await;
            return;
        }
        cleanup_temp_files(&directory).await;

        {
            let mut task = self.task.lock().await;
            task.pages = Some(pages.clone());
        }

        // 3. 按索引顺序逐页下载
        let total = pages.len();
        for index in 0..total {
            if self.cancel.is_cancelled() {
                self.abort_on_stop(&pages, &directory).await;
                return;
            }

            let mut page = pages[index].clone();
            match self.download_page_with_retry(&mut page, &directory).await {
                Ok(()) => {
                    if let Some(path) = &page.local_path {
                        self.bus.publish(DownloadEvent::PageReady {
                            task_id: task_id.clone(),
                            page_index: page.index,
                            local_path: path.to_string_lossy().into_owned(),
                        });
                    }
                }
                Err(e) => {
                    // 单页失败只影响本页，继续处理剩余页面
                    warn!(
                        "页面 #{} 重试耗尽，跳过: {:#} (任务 {})",
                        page.index, e, task_id
                    );
                    page.mark_error();
                    self.bus.publish(DownloadEvent::PageFailed {
                        task_id: task_id.clone(),
                        page_index: page.index,
                        error: format!("{:#}", e),
                    });
                }
            }

            pages[index] = page.clone();
            self.update_task_page(index, page, &pages).await;
        }

        // 4. 收尾
        self.finalize(&pages, &directory).await;
    }

    /// 解析页面列表
    ///
    /// 优先级：任务内存中已有 -> 磁盘清单（完整章节）-> 网络。
    /// 网络结果立即写入清单，保证中途断电后可恢复。
    async fn resolve_page_list(&self, directory: &Path) -> Result<Vec<Page>> {
        if let Some(pages) = self.task.lock().await.pages.clone() {
            debug!("复用任务已解析的页面列表 ({} 页)", pages.len());
            return Ok(pages);
        }

        if self.store.is_chapter_downloaded(directory) {
            if let Some(pages) = manifest::load_manifest(directory) {
                info!("从磁盘清单恢复页面列表: {:?} ({} 页)", directory, pages.len());
                return Ok(pages);
            }
        }

        let chapter = self.task.lock().await.chapter.clone();
        let pages = self
            .source
            .fetch_page_list(&chapter)
            .await
            .context("源解析失败")?;

        if pages.is_empty() {
            anyhow::bail!("页面列表为空");
        }

        if let Err(e) = manifest::save_manifest(directory, &pages) {
            warn!("首次写入章节清单失败 {:?}: {}", directory, e);
        }

        Ok(pages)
    }

    /// 带重试的单页下载
    async fn download_page_with_retry(&self, page: &mut Page, directory: &Path) -> Result<()> {
        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                anyhow::bail!("下载已停止");
            }

            match self.download_page(page, directory).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    warn!(
                        "页面 #{} 下载失败，重试 {}/{}: {:#}",
                        page.index, attempt, self.max_retries, e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// 下载单个页面
    ///
    /// 文件已存在时直接复用（断点续传语义）；写入走临时文件 + 原子重命名。
    async fn download_page(&self, page: &mut Page, directory: &Path) -> Result<()> {
        // 懒解析图片地址
        if page.remote_url.is_none() {
            page.status = PageStatus::FetchingUrl;
            let url = self
                .source
                .fetch_image_url(page)
                .await
                .context("解析图片地址失败")?;
            page.remote_url = Some(url);
        }
        let Some(url) = page.remote_url.clone() else {
            anyhow::bail!("页面 {} 缺少图片地址", page.index);
        };

        let filename = store::page_filename(page.index, &url);
        let path = directory.join(&filename);

        if path.is_file() {
            debug!("页面 #{} 已存在，跳过下载: {:?}", page.index, path);
            page.mark_ready(path);
            return Ok(());
        }

        page.status = PageStatus::Downloading;
        let bytes = self.source.fetch_image(page).await.context("下载图片失败")?;

        let temp_path = directory.join(format!("{}.tmp", filename));
        tokio::fs::write(&temp_path, &bytes)
            .await
            .context("写入临时文件失败")?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .context("重命名图片文件失败")?;

        page.mark_ready(path);
        Ok(())
    }

    /// 回写单页结果并广播进度
    async fn update_task_page(&self, index: usize, page: Page, pages: &[Page]) {
        let (task_id, downloaded) = {
            let mut task = self.task.lock().await;
            if let Some(list) = task.pages.as_mut() {
                if index < list.len() {
                    list[index] = page;
                }
            }
            (task.id.clone(), task.downloaded_count())
        };

        let total = pages.len();
        let progress_sum: u32 = pages.iter().map(|p| p.progress as u32).sum();
        let progress = if total == 0 {
            0
        } else {
            (progress_sum / total as u32) as u8
        };

        self.bus.publish(DownloadEvent::Progress {
            task_id,
            downloaded_pages: downloaded,
            total_pages: total,
            progress,
        });
    }

    /// 收尾：写终态清单，校验完整性，计算章节终态
    async fn finalize(&self, pages: &[Page], directory: &Path) {
        if self.cancel.is_cancelled() {
            self.abort_on_stop(pages, directory).await;
            return;
        }

        if let Err(e) = manifest::save_manifest(directory, pages) {
            warn!("写入终态清单失败 {:?}: {}", directory, e);
        }

        let all_ready = pages.iter().all(|p| p.is_ready());
        let count = store::file_count(directory);
        let expected = pages.len() + 1;

        if all_ready && count == expected {
            let (task_id, chapter_id, title) = {
                let mut task = self.task.lock().await;
                task.mark_downloaded();
                (
                    task.id.clone(),
                    task.chapter.id.clone(),
                    format!("{} / {}", task.manga_title, task.chapter.name),
                )
            };

            self.bus.publish(DownloadEvent::StatusChanged {
                task_id: task_id.clone(),
                old_status: DownloadStatus::Downloading,
                new_status: DownloadStatus::Downloaded,
            });
            self.bus.publish(DownloadEvent::Completed {
                task_id: task_id.clone(),
            });

            // 完成的任务从队列移除
            self.queue.remove(&chapter_id).await;

            info!("✓ 章节下载完成: {} ({} 页)", title, pages.len());
        } else if all_ready {
            self.fail(format!(
                "目录文件数校验失败 (实际 {}, 期望 {})",
                count, expected
            ))
            .await;
        } else {
            let failed = pages
                .iter()
                .filter(|p| p.status == PageStatus::Error)
                .count();
            self.fail(format!("{} 页下载失败", failed)).await;
        }
    }

    /// 引擎停止时的退出路径：保留进度清单，必要时标记失败
    ///
    /// 管理器在 stop 时会先把下载中的任务标记为失败，这里只兜底
    /// 尚未被标记的情况，避免重复事件。
    async fn abort_on_stop(&self, pages: &[Page], directory: &Path) {
        if let Err(e) = manifest::save_manifest(directory, pages) {
            warn!("停止时写入清单失败 {:?}: {}", directory, e);
        }

        let pending = {
            let task = self.task.lock().await;
            task.status == DownloadStatus::Downloading
        };
        if pending {
            self.fail("下载已停止".to_string()).await;
        }
    }

    /// 标记任务失败并广播
    async fn fail(&self, error: String) {
        let (task_id, old_status) = {
            let mut task = self.task.lock().await;
            let old = task.status;
            task.mark_failed(error.clone());
            (task.id.clone(), old)
        };

        error!("任务 {} 失败: {}", task_id, error);

        if old_status != DownloadStatus::Error {
            self.bus.publish(DownloadEvent::StatusChanged {
                task_id: task_id.clone(),
                old_status,
                new_status: DownloadStatus::Error,
            });
        }
        self.bus.publish(DownloadEvent::Failed { task_id, error });
    }
}

/// 清理上次中断遗留的临时文件
///
/// 残留的 .tmp 会污染目录文件计数，导致完整性校验永远失败。
async fn cleanup_temp_files(directory: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(directory).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().map(|e| e == "tmp").unwrap_or(false) {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("清理临时文件失败 {:?}: {}", path, e);
            } else {
                debug!("已清理遗留临时文件: {:?}", path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{ChapterRef, ChapterRequest};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// 受控测试源：固定页面列表，可让指定 URL 持续失败
    struct MockSource {
        urls: Vec<String>,
        failing: parking_lot::Mutex<HashSet<String>>,
        page_list_calls: AtomicUsize,
        image_calls: AtomicUsize,
        fail_page_list: bool,
    }

    impl MockSource {
        fn new(page_count: usize) -> Self {
            Self {
                urls: (0..page_count)
                    .map(|i| format!("https://img.example.com/{}.jpg", i + 1))
                    .collect(),
                failing: parking_lot::Mutex::new(HashSet::new()),
                page_list_calls: AtomicUsize::new(0),
                image_calls: AtomicUsize::new(0),
                fail_page_list: false,
            }
        }

        fn with_failing_page(self, index: usize) -> Self {
            self.failing.lock().insert(self.urls[index].clone());
            self
        }

        fn heal_page(&self, index: usize) {
            self.failing.lock().remove(&self.urls[index]);
        }
    }

    #[async_trait]
    impl Source for MockSource {
        fn name(&self) -> &str {
            "mock"
        }

        async fn fetch_page_list(
            &self,
            _chapter: &ChapterRef,
        ) -> Result<Vec<Page>, crate::source::SourceError> {
            self.page_list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_page_list {
                return Err(crate::source::SourceError::InvalidPageList(
                    "boom".to_string(),
                ));
            }
            Ok(self
                .urls
                .iter()
                .enumerate()
                .map(|(i, url)| Page::new(i, Some(url.clone())))
                .collect())
        }

        async fn fetch_image(&self, page: &Page) -> Result<Vec<u8>, crate::source::SourceError> {
            self.image_calls.fetch_add(1, Ordering::SeqCst);
            let url = page.remote_url.as_deref().unwrap_or_default();
            if self.failing.lock().contains(url) {
                return Err(crate::source::SourceError::InvalidPageList(
                    "simulated network error".to_string(),
                ));
            }
            Ok(vec![0xFF, 0xD8, 0xFF])
        }
    }

    struct Fixture {
        source: Arc<MockSource>,
        store: Arc<ChapterStore>,
        queue: Arc<DownloadQueue>,
        bus: Arc<EventBus>,
        task: Arc<Mutex<DownloadTask>>,
        directory: PathBuf,
        _temp: TempDir,
    }

    async fn setup(source: MockSource) -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(ChapterStore::new(temp.path().to_path_buf()));
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(DownloadQueue::new(bus.clone()));

        let request = ChapterRequest {
            source_name: "mock".to_string(),
            manga_title: "Manga".to_string(),
            chapter: ChapterRef {
                id: "ch-1".to_string(),
                name: "Chapter 1".to_string(),
                url: "https://example.com/ch-1".to_string(),
            },
        };
        let directory = store.chapter_dir(&request);
        let mut task = DownloadTask::new(request, directory.clone());
        task.mark_queued();
        let task = queue.add(task).await.unwrap();

        Fixture {
            source: Arc::new(source),
            store,
            queue,
            bus,
            task,
            directory,
            _temp: temp,
        }
    }

    fn pipeline(f: &Fixture, cancel: CancellationToken) -> ChapterPipeline {
        ChapterPipeline::new(
            f.task.clone(),
            f.source.clone(),
            f.store.clone(),
            f.queue.clone(),
            f.bus.clone(),
            cancel,
            2,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_end_to_end_success() {
        let f = setup(MockSource::new(3)).await;
        let mut rx = f.bus.subscribe();

        pipeline(&f, CancellationToken::new()).run().await;

        // 磁盘布局：3 张图片 + 清单
        for i in 1..=3 {
            assert!(f.directory.join(format!("{}.jpg", i)).is_file());
        }
        assert!(f.directory.join("index.json").is_file());
        assert_eq!(store::file_count(&f.directory), 4);

        // 任务终态 + 出队
        assert_eq!(f.task.lock().await.status, DownloadStatus::Downloaded);
        assert!(f.queue.is_empty().await);

        // 事件顺序：进入下载 -> 页面按索引递增完成 -> 完成 -> 出队
        let mut page_order = Vec::new();
        let mut saw_downloading = false;
        let mut saw_completed = false;
        let mut saw_removed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                DownloadEvent::StatusChanged { new_status, .. } => {
                    if new_status == DownloadStatus::Downloading {
                        assert!(page_order.is_empty());
                        saw_downloading = true;
                    }
                }
                DownloadEvent::PageReady { page_index, .. } => page_order.push(page_index),
                DownloadEvent::Completed { .. } => saw_completed = true,
                DownloadEvent::Removed { .. } => saw_removed = true,
                _ => {}
            }
        }
        assert!(saw_downloading && saw_completed && saw_removed);
        assert_eq!(page_order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_resume_downloads_only_missing_pages() {
        let f = setup(MockSource::new(4)).await;

        // 磁盘上已有前 3 页
        tokio::fs::create_dir_all(&f.directory).await.unwrap();
        for i in 1..=3 {
            tokio::fs::write(f.directory.join(format!("{}.jpg", i)), b"img")
                .await
                .unwrap();
        }

        pipeline(&f, CancellationToken::new()).run().await;

        assert_eq!(f.task.lock().await.status, DownloadStatus::Downloaded);
        // 只有缺失的第 4 页触发了网络下载
        assert_eq!(f.source.image_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store::file_count(&f.directory), 5);
    }

    #[tokio::test]
    async fn test_partial_failure_isolation() {
        let f = setup(MockSource::new(5).with_failing_page(1)).await;
        let mut rx = f.bus.subscribe();

        pipeline(&f, CancellationToken::new()).run().await;

        // 章节失败，但其余 4 页保留
        {
            let task = f.task.lock().await;
            assert_eq!(task.status, DownloadStatus::Error);
            let pages = task.pages.as_ref().unwrap();
            assert_eq!(pages[1].status, PageStatus::Error);
            for i in [0usize, 2, 3, 4] {
                assert_eq!(pages[i].status, PageStatus::Ready, "page {}", i);
            }
            assert_eq!(task.downloaded_count(), 4);
        }

        // 失败页重试了 1 + 2 次，其余各 1 次
        assert_eq!(f.source.image_calls.load(Ordering::SeqCst), 4 + 3);

        // 任务留在队列中等待手动重试
        assert!(!f.queue.is_empty().await);

        let mut saw_page_failed = false;
        while let Ok(event) = rx.try_recv() {
            if let DownloadEvent::PageFailed { page_index, .. } = event {
                assert_eq!(page_index, 1);
                saw_page_failed = true;
            }
        }
        assert!(saw_page_failed);

        // 第二次运行：源恢复后只重试失败页
        f.source.heal_page(1);
        f.source.image_calls.store(0, Ordering::SeqCst);
        {
            let mut task = f.task.lock().await;
            task.mark_queued();
        }

        pipeline(&f, CancellationToken::new()).run().await;

        assert_eq!(f.task.lock().await.status, DownloadStatus::Downloaded);
        assert_eq!(f.source.image_calls.load(Ordering::SeqCst), 1);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_page_list_failure_is_fatal() {
        let mut source = MockSource::new(3);
        source.fail_page_list = true;
        let f = setup(source).await;

        pipeline(&f, CancellationToken::new()).run().await;

        let task = f.task.lock().await;
        assert_eq!(task.status, DownloadStatus::Error);
        // 未尝试任何页面
        assert_eq!(f.source.image_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_directory_creation_failure_is_fatal() {
        let f = setup(MockSource::new(2)).await;

        // 在目录路径上放一个普通文件，使 create_dir_all 失败
        tokio::fs::create_dir_all(f.directory.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&f.directory, b"not a dir").await.unwrap();

        pipeline(&f, CancellationToken::new()).run().await;

        assert_eq!(f.task.lock().await.status, DownloadStatus::Error);
        assert_eq!(f.source.image_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_keeps_queued() {
        let f = setup(MockSource::new(2)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        pipeline(&f, cancel).run().await;

        // 未启动的任务保持等待状态，不产生错误
        assert_eq!(f.task.lock().await.status, DownloadStatus::Queued);
        assert_eq!(f.source.page_list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_manifest_written_after_page_list_resolution() {
        let f = setup(MockSource::new(2).with_failing_page(0).with_failing_page(1)).await;

        pipeline(&f, CancellationToken::new()).run().await;

        // 全部页面失败，但清单已写入，记录了解析到的页面列表
        let pages = manifest::load_manifest(&f.directory).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(f.task.lock().await.status, DownloadStatus::Error);
    }

    #[tokio::test]
    async fn test_leftover_temp_files_cleaned() {
        let f = setup(MockSource::new(2)).await;

        tokio::fs::create_dir_all(&f.directory).await.unwrap();
        tokio::fs::write(f.directory.join("1.jpg.tmp"), b"partial")
            .await
            .unwrap();

        pipeline(&f, CancellationToken::new()).run().await;

        assert_eq!(f.task.lock().await.status, DownloadStatus::Downloaded);
        assert_eq!(store::file_count(&f.directory), 3);
        assert!(!f.directory.join("1.jpg.tmp").exists());
    }
}
