//! 章节目录布局
//!
//! 负责把（源名称、漫画标题、章节名称）映射为确定的磁盘目录，
//! 以及基于目录 + 清单 + 文件计数的"已下载"判定。
//!
//! 目录布局：`{root}/{源名称}/{漫画标题}/{章节名称}/`，
//! 目录内为 `{1..N}.{ext}` 图片文件和一个 `index.json` 清单。

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::manifest;
use crate::downloader::{ChapterRequest, Page};

/// 已知的图片扩展名（用于从 URL 推断文件名）
const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];

/// 目录/文件名中不允许出现的字符
fn invalid_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[\\/:*?"<>|\x00-\x1f]+"#).expect("invalid sanitize regex"))
}

/// 清洗目录/文件名
///
/// 替换文件系统保留字符，去掉首尾的空白和点号，截断超长名称。
/// 清洗后为空的名称回退为 "unnamed"。
pub fn sanitize_name(name: &str) -> String {
    let replaced = invalid_chars().replace_all(name, "_");
    let trimmed = replaced.trim().trim_matches('.').trim();

    let mut result: String = trimmed.chars().take(120).collect();
    result = result.trim().to_string();

    if result.is_empty() {
        "unnamed".to_string()
    } else {
        result
    }
}

/// 推导页面文件名：`{index+1}.{ext}`
///
/// 扩展名优先取 URL 末段的已知图片扩展名（jpg/jpeg/png/gif），
/// 否则退回到清洗后的 URL 末段；末段为空时用 jpg 兜底。
pub fn page_filename(index: usize, url: &str) -> String {
    // 去掉查询串和锚点
    let path_part = url.split(['?', '#']).next().unwrap_or(url);
    let raw_segment = path_part.rsplit('/').next().unwrap_or("");
    let segment = urlencoding::decode(raw_segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw_segment.to_string());

    let number = index + 1;

    if let Some((_, ext)) = segment.rsplit_once('.') {
        let ext = ext.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            return format!("{}.{}", number, ext);
        }
    }

    if segment.is_empty() {
        format!("{}.jpg", number)
    } else {
        format!("{}.{}", number, sanitize_name(&segment))
    }
}

/// 统计目录内的条目数量
///
/// 目录不存在时为 0。清单文件也计入，因此完整章节的计数为 页数 + 1。
pub fn file_count(dir: &Path) -> usize {
    match fs::read_dir(dir) {
        Ok(entries) => entries.filter(|e| e.is_ok()).count(),
        Err(_) => 0,
    }
}

/// 章节存储
///
/// 持有下载根目录，提供布局计算与只读检查。不持有任何运行期状态，
/// 可以被引擎和阅读层同时使用。
#[derive(Debug, Clone)]
pub struct ChapterStore {
    root: PathBuf,
}

impl ChapterStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// 下载根目录
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 章节目录：`{root}/{源名称}/{漫画标题}/{章节名称}/`
    pub fn chapter_dir(&self, request: &ChapterRequest) -> PathBuf {
        self.root
            .join(sanitize_name(&request.source_name))
            .join(sanitize_name(&request.manga_title))
            .join(sanitize_name(&request.chapter.name))
    }

    /// 章节是否已完整下载
    ///
    /// 判定条件：目录存在、清单可读、目录条目数 == 页数 + 1。
    pub fn is_chapter_downloaded(&self, chapter_dir: &Path) -> bool {
        if !chapter_dir.is_dir() {
            return false;
        }

        let Some(pages) = manifest::load_manifest(chapter_dir) else {
            return false;
        };

        let count = file_count(chapter_dir);
        let expected = pages.len() + 1;
        if count != expected {
            debug!(
                "章节目录文件数不匹配: {:?} (实际 {}, 期望 {})",
                chapter_dir, count, expected
            );
            return false;
        }

        true
    }

    /// 读取已保存的页面列表（阅读层使用，不触发任何下载）
    pub fn saved_page_list(&self, request: &ChapterRequest) -> Option<Vec<Page>> {
        manifest::load_manifest(&self.chapter_dir(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::ChapterRef;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn sample_request() -> ChapterRequest {
        ChapterRequest {
            source_name: "My Source".to_string(),
            manga_title: "Some: Manga?".to_string(),
            chapter: ChapterRef {
                id: "ch-1".to_string(),
                name: "Chapter 1".to_string(),
                url: "https://example.com/ch-1".to_string(),
            },
        }
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Chapter 1"), "Chapter 1");
        assert_eq!(sanitize_name("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_name("  .hidden.  "), "hidden");
        assert_eq!(sanitize_name("???"), "_");
        assert_eq!(sanitize_name(""), "unnamed");
        assert_eq!(sanitize_name(" . "), "unnamed");
    }

    #[test]
    fn test_chapter_dir_layout() {
        let store = ChapterStore::new(PathBuf::from("/library"));
        let dir = store.chapter_dir(&sample_request());
        assert_eq!(dir, PathBuf::from("/library/My Source/Some_ Manga_/Chapter 1"));
    }

    #[test]
    fn test_page_filename_known_extensions() {
        assert_eq!(page_filename(0, "https://img.example.com/a/b/page.jpg"), "1.jpg");
        assert_eq!(page_filename(1, "https://img.example.com/x.PNG?token=abc"), "2.png");
        assert_eq!(page_filename(2, "https://img.example.com/x.jpeg#frag"), "3.jpeg");
        assert_eq!(page_filename(9, "https://img.example.com/anim.gif"), "10.gif");
    }

    #[test]
    fn test_page_filename_fallback() {
        // 未知扩展名时退回清洗后的末段
        assert_eq!(page_filename(0, "https://img.example.com/img.webp"), "1.img.webp");
        // 无末段时用 jpg 兜底
        assert_eq!(page_filename(0, "https://img.example.com/"), "1.jpg");
        // 百分号编码的末段先解码
        assert_eq!(page_filename(0, "https://img.example.com/p%20age.jpg"), "1.jpg");
    }

    #[test]
    fn test_file_count() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(file_count(temp_dir.path()), 0);
        assert_eq!(file_count(&temp_dir.path().join("missing")), 0);

        fs::write(temp_dir.path().join("1.jpg"), b"x").unwrap();
        fs::write(temp_dir.path().join("index.json"), b"[]").unwrap();
        assert_eq!(file_count(temp_dir.path()), 2);
    }

    #[test]
    fn test_is_chapter_downloaded() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChapterStore::new(temp_dir.path().to_path_buf());
        let request = sample_request();
        let dir = store.chapter_dir(&request);

        // 目录不存在
        assert!(!store.is_chapter_downloaded(&dir));

        // 目录存在但无清单
        fs::create_dir_all(&dir).unwrap();
        assert!(!store.is_chapter_downloaded(&dir));

        // 清单 + 全部图片齐备
        let mut pages: Vec<Page> = (0..2)
            .map(|i| Page::new(i, Some(format!("https://img.example.com/{}.jpg", i + 1))))
            .collect();
        for (i, page) in pages.iter_mut().enumerate() {
            let path = dir.join(format!("{}.jpg", i + 1));
            fs::write(&path, b"img").unwrap();
            page.mark_ready(path);
        }
        manifest::save_manifest(&dir, &pages).unwrap();
        assert!(store.is_chapter_downloaded(&dir));

        // 少一个文件则不算已下载
        fs::remove_file(dir.join("2.jpg")).unwrap();
        assert!(!store.is_chapter_downloaded(&dir));

        // 多出的文件同样破坏计数判定
        fs::write(dir.join("2.jpg"), b"img").unwrap();
        fs::write(dir.join("stray.txt"), b"x").unwrap();
        assert!(!store.is_chapter_downloaded(&dir));
    }

    #[test]
    fn test_saved_page_list() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChapterStore::new(temp_dir.path().to_path_buf());
        let request = sample_request();

        assert!(store.saved_page_list(&request).is_none());

        let dir = store.chapter_dir(&request);
        let pages = vec![Page::new(0, Some("https://img.example.com/1.jpg".to_string()))];
        manifest::save_manifest(&dir, &pages).unwrap();

        let loaded = store.saved_page_list(&request).unwrap();
        assert_eq!(loaded.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_sanitize_never_contains_reserved_chars(name in ".*") {
            let cleaned = sanitize_name(&name);
            prop_assert!(!cleaned.is_empty());
            prop_assert!(cleaned.len() <= 480); // 120 个字符的 UTF-8 上限
            for c in cleaned.chars() {
                prop_assert!(!"\\/:*?\"<>|".contains(c));
                prop_assert!(!c.is_control());
            }
        }

        #[test]
        fn prop_page_filename_ordering_prefix(index in 0usize..10_000, url in "[a-z0-9./:%-]*") {
            let filename = page_filename(index, &url);
            let expected_prefix = format!("{}.", index + 1);
            prop_assert!(filename.starts_with(&expected_prefix));
        }
    }
}
