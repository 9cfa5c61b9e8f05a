use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use super::page::Page;

/// 章节任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// 未下载
    NotDownloaded,
    /// 等待中
    Queued,
    /// 下载中
    Downloading,
    /// 已完成
    Downloaded,
    /// 失败
    Error,
}

/// 章节引用（在任务生命周期内不可变）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChapterRef {
    /// 章节 ID（队列去重的唯一键）
    pub id: String,
    /// 章节名称（用于目录命名）
    pub name: String,
    /// 章节地址（源解析页面列表的入口）
    pub url: String,
}

/// 外部下载请求：定位一个章节所需的全部信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterRequest {
    /// 源名称
    pub source_name: String,
    /// 漫画标题
    pub manga_title: String,
    /// 章节引用
    pub chapter: ChapterRef,
}

/// 章节下载任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// 任务ID
    pub id: String,
    /// 源名称
    pub source_name: String,
    /// 漫画标题
    pub manga_title: String,
    /// 章节引用
    pub chapter: ChapterRef,
    /// 页面列表（首次解析（网络或磁盘）之前为 None）
    pub pages: Option<Vec<Page>>,
    /// 章节目录
    pub directory: PathBuf,
    /// 任务状态
    pub status: DownloadStatus,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 错误信息
    pub error: Option<String>,
}

impl DownloadTask {
    pub fn new(request: ChapterRequest, directory: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_name: request.source_name,
            manga_title: request.manga_title,
            chapter: request.chapter,
            pages: None,
            directory,
            status: DownloadStatus::NotDownloaded,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// 章节 ID（队列唯一键）
    pub fn chapter_id(&self) -> &str {
        &self.chapter.id
    }

    /// 已完成的页面数量
    pub fn downloaded_count(&self) -> usize {
        self.pages
            .as_ref()
            .map(|pages| pages.iter().filter(|p| p.is_ready()).count())
            .unwrap_or(0)
    }

    /// 页面总数（未解析时为 0）
    pub fn page_count(&self) -> usize {
        self.pages.as_ref().map(|p| p.len()).unwrap_or(0)
    }

    /// 聚合进度百分比 (0-100)
    pub fn total_progress(&self) -> u8 {
        let Some(pages) = &self.pages else {
            return 0;
        };
        if pages.is_empty() {
            return 0;
        }
        let sum: u32 = pages.iter().map(|p| p.progress as u32).sum();
        (sum / pages.len() as u32) as u8
    }

    /// 标记为等待中（重新入队时清除上一轮的错误）
    pub fn mark_queued(&mut self) {
        self.status = DownloadStatus::Queued;
        self.error = None;
    }

    /// 标记为下载中
    pub fn mark_downloading(&mut self) {
        self.status = DownloadStatus::Downloading;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为已完成
    pub fn mark_downloaded(&mut self) {
        self.status = DownloadStatus::Downloaded;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = DownloadStatus::Error;
        self.error = Some(error);
    }
}
