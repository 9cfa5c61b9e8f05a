//! 下载事件定义与事件总线
//!
//! 引擎内部产生的所有状态变化都通过事件总线对外广播，
//! 消费方（UI 层、宿主服务）只读事件，不直接读写任务字段。

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::downloader::DownloadStatus;

/// 下载任务事件
///
/// 同一任务的事件按流水线产生顺序投递；不同任务之间无顺序保证。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// 任务入队
    Added {
        task_id: String,
        chapter_id: String,
    },
    /// 任务出队（下载完成后从队列移除）
    Removed {
        task_id: String,
        chapter_id: String,
    },
    /// 状态变更
    StatusChanged {
        task_id: String,
        old_status: DownloadStatus,
        new_status: DownloadStatus,
    },
    /// 单页下载完成
    PageReady {
        task_id: String,
        page_index: usize,
        local_path: String,
    },
    /// 单页下载失败（重试耗尽）
    PageFailed {
        task_id: String,
        page_index: usize,
        error: String,
    },
    /// 进度更新
    Progress {
        task_id: String,
        downloaded_pages: usize,
        total_pages: usize,
        progress: u8,
    },
    /// 任务完成
    Completed {
        task_id: String,
    },
    /// 任务失败
    Failed {
        task_id: String,
        error: String,
    },
}

impl DownloadEvent {
    /// 事件所属的任务 ID
    pub fn task_id(&self) -> &str {
        match self {
            DownloadEvent::Added { task_id, .. }
            | DownloadEvent::Removed { task_id, .. }
            | DownloadEvent::StatusChanged { task_id, .. }
            | DownloadEvent::PageReady { task_id, .. }
            | DownloadEvent::PageFailed { task_id, .. }
            | DownloadEvent::Progress { task_id, .. }
            | DownloadEvent::Completed { task_id }
            | DownloadEvent::Failed { task_id, .. } => task_id,
        }
    }
}

/// 事件总线
///
/// 每个订阅者持有独立的无界通道：消费慢于生产时事件会缓冲而不是丢弃，
/// 保证进度事件不丢失。发送失败（接收端已关闭）的订阅者在下次广播时被清理。
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: parking_lot::Mutex<Vec<mpsc::UnboundedSender<DownloadEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// 广播事件到所有订阅者
    pub fn publish(&self, event: DownloadEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
