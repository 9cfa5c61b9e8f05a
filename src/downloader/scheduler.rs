use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

/// 待执行的章节流水线
type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// 动态并发调度器
///
/// 同时执行最多 N 条章节流水线，N 来自外部偏好流（watch 通道），
/// 运行期间可随时调整：
/// 1. 新任务到达：有空位立即启动，否则进入 FIFO 积压队列
/// 2. 任务结束（成功或失败）：释放空位并继续消费积压队列
/// 3. N 调大：立即按新上限补齐
/// 4. N 调小：绝不取消在途任务，只是暂停启动新任务，
///    直到活跃数自然降到新上限以下
///
/// 启动顺序严格按提交顺序（FIFO）；任何时刻启动新任务时
/// 活跃数都不会超过当时的上限。
pub struct DownloadScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    /// 积压队列（未启动的任务）
    backlog: parking_lot::Mutex<VecDeque<Job>>,
    /// 当前活跃任务数
    active: AtomicUsize,
    /// 最大并发数（动态可调整）
    limit: AtomicUsize,
    /// 调度循环唤醒信号（提交 / 完成 / 上限变化）
    notify: Notify,
    /// 调度循环是否存活
    running: AtomicBool,
    /// 空闲状态广播（活跃数为 0 且积压为空）
    idle_tx: watch::Sender<bool>,
}

impl SchedulerInner {
    /// 空闲判定并广播
    fn maybe_mark_idle(&self) {
        if self.active.load(Ordering::SeqCst) == 0 && self.backlog.lock().is_empty() {
            self.idle_tx.send_if_modified(|idle| {
                if *idle {
                    false
                } else {
                    *idle = true;
                    true
                }
            });
        }
    }

    fn mark_busy(&self) {
        self.idle_tx.send_if_modified(|idle| {
            if *idle {
                *idle = false;
                true
            } else {
                false
            }
        });
    }
}

impl DownloadScheduler {
    /// 创建调度器并启动调度循环
    ///
    /// `limit_rx` 是"最大并行下载数"偏好流；初始上限取通道当前值。
    pub fn new(limit_rx: watch::Receiver<usize>) -> Self {
        let initial_limit = (*limit_rx.borrow()).max(1);
        let (idle_tx, _) = watch::channel(true);

        let inner = Arc::new(SchedulerInner {
            backlog: parking_lot::Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            limit: AtomicUsize::new(initial_limit),
            notify: Notify::new(),
            running: AtomicBool::new(true),
            idle_tx,
        });

        info!("创建下载调度器: 最大并行数={}", initial_limit);

        let scheduler = Self { inner };
        scheduler.start_dispatch_loop();
        scheduler.start_limit_watcher(limit_rx);
        scheduler
    }

    /// 提交一条章节流水线
    ///
    /// 只入积压队列并唤醒调度循环；真正的启动由循环统一执行，
    /// 保证提交顺序即启动顺序。
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.backlog.lock().push_back(Box::pin(job));
        self.inner.mark_busy();
        self.inner.notify.notify_one();
    }

    /// 清空积压队列（引擎停止时调用），返回被丢弃的任务数
    ///
    /// 在途任务不受影响。
    pub fn clear_backlog(&self) -> usize {
        let dropped = {
            let mut backlog = self.inner.backlog.lock();
            let n = backlog.len();
            backlog.clear();
            n
        };
        if dropped > 0 {
            debug!("已清空积压队列: 丢弃 {} 个未启动任务", dropped);
        }
        self.inner.maybe_mark_idle();
        dropped
    }

    /// 当前活跃任务数
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// 积压任务数
    pub fn backlog_len(&self) -> usize {
        self.inner.backlog.lock().len()
    }

    /// 当前并发上限
    pub fn limit(&self) -> usize {
        self.inner.limit.load(Ordering::SeqCst)
    }

    /// 是否空闲（无活跃任务且无积压）
    pub fn is_idle(&self) -> bool {
        self.active_count() == 0 && self.backlog_len() == 0
    }

    /// 订阅空闲状态变化
    pub fn idle_state(&self) -> watch::Receiver<bool> {
        self.inner.idle_tx.subscribe()
    }

    /// 停止调度循环（不影响在途任务）
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    /// 启动调度循环
    ///
    /// 单消费者模型：只有本循环会从积压队列取任务并增加活跃计数，
    /// 因此"检查上限 + 启动"不需要额外加锁；完成方只做递减和唤醒。
    fn start_dispatch_loop(&self) {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            loop {
                if !inner.running.load(Ordering::SeqCst) {
                    break;
                }

                // 在上限内尽量消费积压队列
                loop {
                    let limit = inner.limit.load(Ordering::SeqCst).max(1);
                    if inner.active.load(Ordering::SeqCst) >= limit {
                        break;
                    }

                    let job = inner.backlog.lock().pop_front();
                    let Some(job) = job else { break };

                    let active_now = inner.active.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!("调度器启动任务 (活跃: {}/{})", active_now, limit);

                    let inner2 = inner.clone();
                    tokio::spawn(async move {
                        job.await;
                        inner2.active.fetch_sub(1, Ordering::SeqCst);
                        inner2.maybe_mark_idle();
                        inner2.notify.notify_one();
                    });
                }

                inner.notify.notified().await;
            }

            debug!("调度循环已退出");
        });
    }

    /// 监听并发上限偏好流
    fn start_limit_watcher(&self, mut limit_rx: watch::Receiver<usize>) {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            while limit_rx.changed().await.is_ok() {
                if !inner.running.load(Ordering::SeqCst) {
                    break;
                }
                let new_limit = (*limit_rx.borrow()).max(1);
                let old_limit = inner.limit.swap(new_limit, Ordering::SeqCst);
                if old_limit != new_limit {
                    info!("🔧 动态调整最大并行下载数: {} -> {}", old_limit, new_limit);
                }
                // 上限调大时立即补齐；调小由循环自然收敛
                inner.notify.notify_one();
            }
        });
    }
}

impl Drop for DownloadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
