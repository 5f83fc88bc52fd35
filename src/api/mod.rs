// 上传服务 API 模块
//
// UploadApi 是上传会话与协调服务之间的唯一边界：
// 生产环境使用基于 reqwest 的 FilestackApi，测试使用脚本化的假实现

pub mod client;
pub mod types;

pub use client::FilestackApi;
pub use types::*;

use async_trait::async_trait;
use thiserror::Error;

/// 默认的 multipart/start 地址
pub const MULTIPART_START_URL: &str = "https://upload.filestackapi.com/multipart/start";

/// 单次 HTTP 调用的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// 服务端返回非 2xx 状态
    #[error("HTTP {status}: {body}")]
    Status {
        status: u16,
        body: String,
        /// Retry-After 头（时间单位数）
        retry_after: Option<u32>,
    },

    /// 请求超时
    #[error("请求超时: {0}")]
    Timeout(String),

    /// 连接、DNS 等网络层错误
    #[error("网络错误: {0}")]
    Transport(String),

    /// 响应体无法解析
    #[error("响应解析失败: {0}")]
    Decode(String),

    /// 存储后端响应缺少 ETag
    #[error("存储后端响应缺少 ETag")]
    MissingEtag,
}

impl ApiError {
    /// 错误分类
    pub fn kind(&self) -> UploadErrorKind {
        match self {
            ApiError::Status { status, .. } => UploadErrorKind::from_status(*status),
            ApiError::Timeout(_) => UploadErrorKind::Timeout,
            ApiError::Transport(_) => UploadErrorKind::Network,
            ApiError::Decode(_) | ApiError::MissingEtag => UploadErrorKind::Malformed,
        }
    }

    /// HTTP 状态码（仅 Status 错误有）
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 服务端要求的等待时间
    pub fn retry_after(&self) -> Option<u32> {
        match self {
            ApiError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(err.to_string())
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

/// 上传错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    /// 网络错误
    Network,
    /// 超时
    Timeout,
    /// 限流（服务端要求等待）
    RateLimited,
    /// 服务器错误
    ServerError,
    /// 权限不足
    Forbidden,
    /// 参数错误
    BadRequest,
    /// 响应格式错误
    Malformed,
    /// 未知错误
    Unknown,
}

impl UploadErrorKind {
    /// 从 HTTP 状态码转换
    pub fn from_status(status: u16) -> Self {
        match status {
            429 | 503 => UploadErrorKind::RateLimited,
            401 | 403 => UploadErrorKind::Forbidden,
            400..=499 => UploadErrorKind::BadRequest,
            500..=599 => UploadErrorKind::ServerError,
            _ => UploadErrorKind::Unknown,
        }
    }

    /// 是否为服务端主动要求的延迟
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, UploadErrorKind::RateLimited)
    }

    /// 是否为网络层错误
    pub fn is_transport(&self) -> bool {
        matches!(self, UploadErrorKind::Network | UploadErrorKind::Timeout)
    }
}

/// 协调服务与存储后端的调用接口
#[async_trait]
pub trait UploadApi: Send + Sync {
    /// multipart/start
    async fn start(&self, request: &StartRequest) -> Result<SessionHandle, ApiError>;

    /// multipart/upload：为一个分片申请上传地址
    async fn request_upload(
        &self,
        base_url: &str,
        request: &UploadRequest,
    ) -> Result<UploadSlot, ApiError>;

    /// 将分片字节 PUT 到存储后端，返回 ETag
    async fn put_chunk(&self, slot: &UploadSlot, data: Vec<u8>) -> Result<String, ApiError>;

    /// multipart/commit
    async fn commit(&self, base_url: &str, request: &CommitRequest) -> Result<(), ApiError>;

    /// multipart/complete
    async fn complete(
        &self,
        base_url: &str,
        request: &CompleteRequest,
    ) -> Result<CompleteReply, ApiError>;
}
