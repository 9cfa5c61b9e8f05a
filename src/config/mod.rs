// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 源配置
    #[serde(default)]
    pub source: SourceConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 下载根目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 最大并行下载章节数（运行期间可动态调整）
    #[serde(default = "default_max_concurrent_chapters")]
    pub max_concurrent_chapters: usize,
    /// 单页失败后的额外重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 单页重试间隔（毫秒）
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_max_concurrent_chapters() -> usize {
    2
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_chapters: default_max_concurrent_chapters(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// 源配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// 源名称（参与目录布局）
    #[serde(default = "default_source_name")]
    pub name: String,
    /// 请求 User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_source_name() -> String {
    "default".to_string()
}

fn default_user_agent() -> String {
    format!("manga-downloader-rust/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: default_source_name(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 加载配置文件
    ///
    /// 文件不存在时写出一份默认配置并返回默认值。
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path).await?;
            info!("配置文件不存在，已生成默认配置: {:?}", path);
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))?;
        Ok(config)
    }

    /// 保存配置文件
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
            }
        }

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.download.download_dir, PathBuf::from("downloads"));
        assert_eq!(config.download.max_concurrent_chapters, 2);
        assert_eq!(config.download.max_retries, 2);
        assert!(config.log.enabled);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [download]
            max_concurrent_chapters = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.download.max_concurrent_chapters, 5);
        // 未给出的字段落到默认值
        assert_eq!(config.download.max_retries, 2);
        assert_eq!(config.source.timeout_secs, 30);
    }

    #[tokio::test]
    async fn test_load_creates_default_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let config = AppConfig::load(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(config.download.max_concurrent_chapters, 2);
    }

    #[tokio::test]
    async fn test_save_and_reload_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/config.toml");

        let mut config = AppConfig::default();
        config.download.max_concurrent_chapters = 7;
        config.source.name = "my-source".to_string();
        config.save(&path).await.unwrap();

        let loaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(loaded.download.max_concurrent_chapters, 7);
        assert_eq!(loaded.source.name, "my-source");
    }
}
