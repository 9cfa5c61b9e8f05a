use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 页面下载状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageStatus {
    /// 等待中
    Queued,
    /// 正在解析图片地址
    FetchingUrl,
    /// 下载中
    Downloading,
    /// 已完成
    Ready,
    /// 失败
    Error,
}

/// 单个页面（章节内的一张图片）
///
/// 页面是下载的最小单元：状态与本地路径满足不变量
/// `local_path.is_some()` 当且仅当 `status == Ready`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// 页面索引（0 起始，决定下载与阅读顺序）
    pub index: usize,
    /// 远端图片地址（懒解析，源尚未解析时为 None）
    pub remote_url: Option<String>,
    /// 页面状态
    pub status: PageStatus,
    /// 本地文件路径（仅在 Ready 时存在）
    pub local_path: Option<PathBuf>,
    /// 下载进度 (0-100)
    pub progress: u8,
}

impl Page {
    pub fn new(index: usize, remote_url: Option<String>) -> Self {
        Self {
            index,
            remote_url,
            status: PageStatus::Queued,
            local_path: None,
            progress: 0,
        }
    }

    /// 标记为已完成，并记录本地路径
    pub fn mark_ready(&mut self, local_path: PathBuf) {
        self.status = PageStatus::Ready;
        self.local_path = Some(local_path);
        self.progress = 100;
    }

    /// 标记为失败（清除本地路径，维持不变量）
    pub fn mark_error(&mut self) {
        self.status = PageStatus::Error;
        self.local_path = None;
    }

    /// 是否已完成
    pub fn is_ready(&self) -> bool {
        self.status == PageStatus::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_creation() {
        let page = Page::new(0, Some("https://img.example.com/1.jpg".to_string()));
        assert_eq!(page.index, 0);
        assert_eq!(page.status, PageStatus::Queued);
        assert!(page.local_path.is_none());
        assert_eq!(page.progress, 0);
    }

    #[test]
    fn test_ready_invariant() {
        let mut page = Page::new(2, None);

        page.mark_ready(PathBuf::from("/library/3.jpg"));
        assert!(page.is_ready());
        assert_eq!(page.local_path, Some(PathBuf::from("/library/3.jpg")));
        assert_eq!(page.progress, 100);

        // 失败后本地路径必须被清除
        page.mark_error();
        assert_eq!(page.status, PageStatus::Error);
        assert!(page.local_path.is_none());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&PageStatus::FetchingUrl).unwrap();
        assert_eq!(json, "\"FETCHING_URL\"");
        let json = serde_json::to_string(&PageStatus::Ready).unwrap();
        assert_eq!(json, "\"READY\"");
    }
}
