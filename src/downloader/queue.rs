use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::task::DownloadTask;
use crate::events::{DownloadEvent, EventBus};

/// 下载队列
///
/// 有序任务序列，按章节 ID 去重。调度器与外部调用方（入队/移除）
/// 并发访问，迭代一律通过 `snapshot` 拿副本，互不阻塞。
#[derive(Debug)]
pub struct DownloadQueue {
    /// (章节 ID, 任务) 列表；章节 ID 在入队时缓存，避免查重时逐个锁任务
    entries: RwLock<Vec<(String, Arc<Mutex<DownloadTask>>)>>,
    /// 事件总线
    bus: Arc<EventBus>,
}

impl DownloadQueue {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            bus,
        }
    }

    /// 入队（幂等）
    ///
    /// 章节已在队列中时返回 None，否则返回持有任务的共享引用。
    pub async fn add(&self, task: DownloadTask) -> Option<Arc<Mutex<DownloadTask>>> {
        let chapter_id = task.chapter_id().to_string();
        let task_id = task.id.clone();

        let mut entries = self.entries.write().await;
        if entries.iter().any(|(id, _)| *id == chapter_id) {
            debug!("章节 {} 已在队列中，忽略重复入队", chapter_id);
            return None;
        }

        let handle = Arc::new(Mutex::new(task));
        entries.push((chapter_id.clone(), handle.clone()));
        drop(entries);

        self.bus.publish(DownloadEvent::Added {
            task_id,
            chapter_id,
        });

        Some(handle)
    }

    /// 出队（幂等）
    pub async fn remove(&self, chapter_id: &str) -> bool {
        let removed = {
            let mut entries = self.entries.write().await;
            match entries.iter().position(|(id, _)| id == chapter_id) {
                Some(pos) => Some(entries.remove(pos).1),
                None => None,
            }
        };

        match removed {
            Some(handle) => {
                let task_id = handle.lock().await.id.clone();
                self.bus.publish(DownloadEvent::Removed {
                    task_id,
                    chapter_id: chapter_id.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// 章节是否在队列中
    pub async fn contains(&self, chapter_id: &str) -> bool {
        self.entries
            .read()
            .await
            .iter()
            .any(|(id, _)| id == chapter_id)
    }

    /// 查找章节对应的任务
    pub async fn find(&self, chapter_id: &str) -> Option<Arc<Mutex<DownloadTask>>> {
        self.entries
            .read()
            .await
            .iter()
            .find(|(id, _)| id == chapter_id)
            .map(|(_, task)| task.clone())
    }

    /// 队列快照（复制引用列表，迭代期间的并发修改不影响快照）
    pub async fn snapshot(&self) -> Vec<Arc<Mutex<DownloadTask>>> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(_, task)| task.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
