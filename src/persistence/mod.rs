//! 持久化模块
//!
//! 章节目录布局与 `index.json` 清单读写，是断点续传的磁盘契约。

pub mod manifest;
pub mod store;

pub use manifest::{load_manifest, manifest_exists, manifest_path, save_manifest, PageRecord, MANIFEST_FILENAME};
pub use store::{file_count, page_filename, sanitize_name, ChapterStore};
