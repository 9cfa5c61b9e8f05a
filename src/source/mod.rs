//! 远端源抽象
//!
//! 源负责两件事：把章节引用解析成页面列表，把页面解析成图片字节。
//! 下载引擎只依赖本模块的 trait，不关心具体站点协议。

pub mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::downloader::{ChapterRef, Page};

/// 源操作错误
#[derive(Debug, Error)]
pub enum SourceError {
    /// 网络请求失败
    #[error("网络请求失败: {0}")]
    Network(#[from] reqwest::Error),
    /// 页面列表响应格式不符合预期
    #[error("页面列表格式错误: {0}")]
    InvalidPageList(String),
    /// 页面缺少可用的图片地址
    #[error("页面 {0} 缺少图片地址")]
    MissingImageUrl(usize),
}

/// 远端源
///
/// 实现方提供页面列表与图片字节；图片地址懒解析的源可以覆写
/// `fetch_image_url`，在页面入队后再换取真实地址。
#[async_trait]
pub trait Source: Send + Sync {
    /// 源名称（参与目录布局）
    fn name(&self) -> &str;

    /// 解析章节的页面列表
    async fn fetch_page_list(&self, chapter: &ChapterRef) -> Result<Vec<Page>, SourceError>;

    /// 解析单页的图片地址
    ///
    /// 默认实现直接返回页面自带的地址；页面列表阶段拿不到图片地址的
    /// 源需要覆写本方法。
    async fn fetch_image_url(&self, page: &Page) -> Result<String, SourceError> {
        page.remote_url
            .clone()
            .ok_or(SourceError::MissingImageUrl(page.index))
    }

    /// 下载单页图片字节
    async fn fetch_image(&self, page: &Page) -> Result<Vec<u8>, SourceError>;
}

pub use http::HttpSource;
