//! 章节清单文件操作
//!
//! 实现章节目录下 `index.json` 清单的读写，清单是断点续传的依据：
//! 进程重启后依靠它恢复页面列表与各页的完成状态。
//!
//! ## 文件格式
//!
//! JSON 数组，每页一条记录：
//! ```json
//! [
//!   {"index": 0, "url": "https://...", "status": "READY", "path": "/library/.../1.jpg"},
//!   {"index": 1, "url": "https://...", "status": "ERROR", "path": null}
//! ]
//! ```

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::downloader::{Page, PageStatus};

/// 清单文件名
pub const MANIFEST_FILENAME: &str = "index.json";

/// 清单中的单页记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub index: usize,
    pub url: Option<String>,
    pub status: PageStatus,
    pub path: Option<PathBuf>,
}

impl From<&Page> for PageRecord {
    fn from(page: &Page) -> Self {
        Self {
            index: page.index,
            url: page.remote_url.clone(),
            status: page.status,
            path: page.local_path.clone(),
        }
    }
}

impl PageRecord {
    /// 还原为运行时页面
    ///
    /// 只有 READY 记录是可信的；其余状态一律重置为 Queued，
    /// 由流水线按磁盘上的实际文件重新判定。
    pub fn into_page(self) -> Page {
        let mut page = Page::new(self.index, self.url);
        if self.status == PageStatus::Ready {
            if let Some(path) = self.path {
                page.mark_ready(path);
            }
        }
        page
    }
}

/// 获取清单文件路径
pub fn manifest_path(chapter_dir: &Path) -> PathBuf {
    chapter_dir.join(MANIFEST_FILENAME)
}

/// 检查清单文件是否存在
pub fn manifest_exists(chapter_dir: &Path) -> bool {
    manifest_path(chapter_dir).is_file()
}

/// 保存清单到章节目录
///
/// 先写入临时文件，再原子重命名（防止写入中断导致文件损坏）
pub fn save_manifest(chapter_dir: &Path, pages: &[Page]) -> io::Result<()> {
    if !chapter_dir.exists() {
        fs::create_dir_all(chapter_dir)?;
    }

    let path = manifest_path(chapter_dir);
    let temp_path = path.with_extension("json.tmp");

    let records: Vec<PageRecord> = pages.iter().map(PageRecord::from).collect();

    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);

    serde_json::to_writer_pretty(&mut writer, &records).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialize manifest: {}", e),
        )
    })?;

    writer.flush()?;
    drop(writer);

    fs::rename(&temp_path, &path)?;

    debug!("已保存章节清单: {:?} ({} 页)", path, records.len());

    Ok(())
}

/// 从章节目录加载清单
///
/// 文件不存在或内容损坏时返回 None（损坏时记录告警，由上层决定重新抓取）
pub fn load_manifest(chapter_dir: &Path) -> Option<Vec<Page>> {
    let path = manifest_path(chapter_dir);

    if !path.exists() {
        return None;
    }

    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            warn!("打开章节清单失败 {:?}: {}", path, e);
            return None;
        }
    };

    let reader = BufReader::new(file);
    let records: Vec<PageRecord> = match serde_json::from_reader(reader) {
        Ok(r) => r,
        Err(e) => {
            warn!("解析章节清单失败 {:?}: {}", path, e);
            return None;
        }
    };

    debug!("已加载章节清单: {:?} ({} 页)", path, records.len());

    Some(records.into_iter().map(PageRecord::into_page).collect())
}
