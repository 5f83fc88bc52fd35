// 配置管理模块

use crate::api::MULTIPART_START_URL;
use crate::security::Security;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传服务配置
    #[serde(default)]
    pub api: ApiConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 上传服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// 应用 API Key
    #[serde(default)]
    pub apikey: String,
    /// multipart/start 地址
    #[serde(default = "default_start_url")]
    pub start_url: String,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 签名策略（可选）
    #[serde(default)]
    pub security: Option<SecurityConfig>,
}

/// 签名策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// 策略 JSON 文本，如 `{"expiry": 1562763146, "call": ["store"]}`
    pub policy: String,
    /// 应用密钥
    pub secret: String,
}

impl SecurityConfig {
    /// 生成签名
    pub fn to_security(&self) -> Result<Security> {
        let policy: serde_json::Value =
            serde_json::from_str(&self.policy).context("解析签名策略 JSON 失败")?;
        Ok(Security::new(&policy, &self.secret))
    }
}

fn default_start_url() -> String {
    MULTIPART_START_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            apikey: String::new(),
            start_url: default_start_url(),
            request_timeout_secs: default_request_timeout_secs(),
            security: None,
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 存储后端（s3、gcs、azure、rackspace、dropbox）
    #[serde(default = "default_storage")]
    pub storage: String,
    /// 是否默认使用智能上传（逐 part 提交）
    #[serde(default)]
    pub intelligent: bool,
    /// part 大小（字节，默认 8MB）
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    /// 初始分片大小（字节，默认 8MB）
    #[serde(default = "default_initial_chunk_size")]
    pub initial_chunk_size: u64,
    /// 分片大小下限（字节，默认 32KB）
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    /// 单个分片累计等待上限（时间单位数）
    #[serde(default = "default_max_delay_units")]
    pub max_delay_units: u32,
    /// 一个时间单位对应的毫秒数
    #[serde(default = "default_time_unit_ms")]
    pub time_unit_ms: u64,
    /// 并发上传数，0 表示使用 CPU 核数
    #[serde(default)]
    pub concurrency: usize,
    /// complete 返回 202 时的等待序列（时间单位数）
    #[serde(default = "default_complete_schedule")]
    pub complete_schedule: Vec<u32>,
}

fn default_storage() -> String {
    "s3".to_string()
}

fn default_part_size() -> u64 {
    8 * 1024 * 1024
}

fn default_initial_chunk_size() -> u64 {
    8 * 1024 * 1024
}

fn default_min_chunk_size() -> u64 {
    32 * 1024
}

fn default_max_delay_units() -> u32 {
    4
}

fn default_time_unit_ms() -> u64 {
    1000
}

fn default_complete_schedule() -> Vec<u32> {
    vec![0, 1, 2, 3, 5]
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            intelligent: false,
            part_size: default_part_size(),
            initial_chunk_size: default_initial_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            max_delay_units: default_max_delay_units(),
            time_unit_ms: default_time_unit_ms(),
            concurrency: 0,
            complete_schedule: default_complete_schedule(),
        }
    }
}

impl UploadConfig {
    /// 实际并发数
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency > 0 {
            return self.concurrency;
        }
        host_concurrency()
    }

    /// 时间单位
    pub fn time_unit(&self) -> Duration {
        Duration::from_millis(self.time_unit_ms)
    }

    /// 校验配置的一致性
    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 {
            anyhow::bail!("part_size 不能为 0");
        }
        if self.min_chunk_size == 0 {
            anyhow::bail!("min_chunk_size 不能为 0");
        }
        if self.initial_chunk_size < self.min_chunk_size {
            anyhow::bail!(
                "initial_chunk_size ({}) 不能小于 min_chunk_size ({})",
                self.initial_chunk_size,
                self.min_chunk_size
            );
        }
        if self.complete_schedule.is_empty() {
            anyhow::bail!("complete_schedule 至少需要一项");
        }
        if self.storage.trim().is_empty() {
            anyhow::bail!("storage 不能为空");
        }
        Ok(())
    }
}

/// 主机并行度，未配置并发数时使用
pub fn host_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default)]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传参数验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload
            .validate()
            .context("保存配置失败：上传参数无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("配置已保存: {}", path);
        Ok(())
    }
}
