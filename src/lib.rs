// Manga Downloader Rust Library
// 漫画章节下载引擎核心库

// 配置管理模块
pub mod config;

// 下载引擎模块
pub mod downloader;

// 事件模块
pub mod events;

// 日志模块
pub mod logging;

// 持久化模块
pub mod persistence;

// 远端源模块
pub mod source;

// 导出常用类型
pub use config::AppConfig;
pub use downloader::{
    ChapterRef, ChapterRequest, DownloadManager, DownloadQueue, DownloadScheduler, DownloadStatus,
    DownloadTask, Page, PageStatus,
};
pub use events::{DownloadEvent, EventBus};
pub use persistence::ChapterStore;
pub use source::{HttpSource, Source, SourceError};
