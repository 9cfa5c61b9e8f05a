//! 通用 HTTP 源
//!
//! 适配"章节地址返回 JSON 页面列表"的源：章节 URL 的响应是一个
//! JSON 数组（元素为图片地址字符串或 `{"url": ...}` 对象），或带
//! `pages` 字段的包装对象。站点目录解析不在本层职责内。

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{Source, SourceError};
use crate::downloader::{ChapterRef, Page};

/// 默认请求超时（秒）
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// 通用 JSON-over-HTTP 源
#[derive(Debug, Clone)]
pub struct HttpSource {
    name: String,
    client: reqwest::Client,
}

impl HttpSource {
    /// 创建源
    pub fn new(name: impl Into<String>, user_agent: &str, timeout_secs: u64) -> Result<Self, SourceError> {
        let timeout = if timeout_secs == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            timeout_secs
        };
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            name: name.into(),
            client,
        })
    }

    /// 从 JSON 响应中提取页面列表
    ///
    /// 兼容三种形态：
    /// - `["https://.../1.jpg", ...]`
    /// - `[{"url": "https://.../1.jpg"}, ...]`
    /// - `{"pages": [...]}`（递归按前两种解析）
    fn parse_page_list(value: &Value) -> Result<Vec<Page>, SourceError> {
        let entries = match value {
            Value::Array(entries) => entries,
            Value::Object(map) => match map.get("pages") {
                Some(Value::Array(entries)) => entries,
                _ => {
                    return Err(SourceError::InvalidPageList(
                        "期望数组或带 pages 字段的对象".to_string(),
                    ))
                }
            },
            _ => {
                return Err(SourceError::InvalidPageList(
                    "期望数组或带 pages 字段的对象".to_string(),
                ))
            }
        };

        let mut pages = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let url = match entry {
                Value::String(url) => Some(url.clone()),
                Value::Object(map) => map.get("url").and_then(|v| v.as_str()).map(String::from),
                _ => None,
            };

            match url {
                Some(url) if !url.is_empty() => pages.push(Page::new(index, Some(url))),
                _ => {
                    return Err(SourceError::InvalidPageList(format!(
                        "第 {} 项缺少图片地址",
                        index
                    )))
                }
            }
        }

        Ok(pages)
    }
}

#[async_trait]
impl Source for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_page_list(&self, chapter: &ChapterRef) -> Result<Vec<Page>, SourceError> {
        debug!("抓取页面列表: {} ({})", chapter.name, chapter.url);

        let value: Value = self
            .client
            .get(&chapter.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let pages = Self::parse_page_list(&value)?;
        debug!("章节 {} 解析到 {} 页", chapter.id, pages.len());

        Ok(pages)
    }

    async fn fetch_image(&self, page: &Page) -> Result<Vec<u8>, SourceError> {
        let url = page
            .remote_url
            .as_deref()
            .ok_or(SourceError::MissingImageUrl(page.index))?;

        let resp = self.client.get(url).send().await?.error_for_status()?;

        // 流式读取，避免一次性分配超大缓冲
        let capacity = resp.content_length().unwrap_or(0) as usize;
        let mut buffer = Vec::with_capacity(capacity);
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }

        debug!("页面 #{} 下载完成，大小: {} bytes", page.index, buffer.len());

        Ok(buffer)
    }
}
