// 分片上传工作者
//
// 一次 upload 调用：读取分片字节 -> multipart/upload 申请地址 -> PUT 到存储后端。
// 工作者不重试、不修改分片大小，所有失败都原样上报给会话

use crate::api::{
    ApiError, CommitRequest, SessionHandle, StoreLocation, UploadApi, UploadRequest,
};
use crate::uploader::chunk::Chunk;
use crate::uploader::error::UploadError;
use crate::uploader::source::ChunkSource;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// 服务端未给出 Retry-After 时的等待（时间单位数）
pub const DEFAULT_THROTTLE_UNITS: u32 = 1;

/// 分片传输的两个步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    /// multipart/upload
    Slot,
    /// PUT 到存储后端
    Put,
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStage::Slot => write!(f, "multipart/upload"),
            TransferStage::Put => write!(f, "PUT"),
        }
    }
}

/// 分片失败的分类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkFailure {
    /// 连接、超时等网络错误
    Network { stage: TransferStage, message: String },
    /// 非 2xx 响应
    BadStatus {
        stage: TransferStage,
        status: u16,
        message: String,
    },
    /// 服务端要求等待后重试
    Throttled { stage: TransferStage, delay_units: u32 },
    /// 响应无法解析或缺少 ETag
    Malformed { stage: TransferStage, message: String },
}

impl ChunkFailure {
    /// 对单次调用错误分类
    pub fn classify(stage: TransferStage, err: ApiError) -> Self {
        if err.kind().is_rate_limited() {
            return ChunkFailure::Throttled {
                stage,
                delay_units: err.retry_after().unwrap_or(DEFAULT_THROTTLE_UNITS),
            };
        }

        match err {
            ApiError::Status { status, body, .. } => ChunkFailure::BadStatus {
                stage,
                status,
                message: body,
            },
            ApiError::Timeout(message) | ApiError::Transport(message) => {
                ChunkFailure::Network { stage, message }
            }
            other => ChunkFailure::Malformed {
                stage,
                message: other.to_string(),
            },
        }
    }

    /// 服务端要求的等待，仅限流时有
    pub fn requested_delay(&self) -> Option<u32> {
        match self {
            ChunkFailure::Throttled { delay_units, .. } => Some(*delay_units),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkFailure::Network { stage, message } => {
                write!(f, "{} 网络错误: {}", stage, message)
            }
            ChunkFailure::BadStatus {
                stage,
                status,
                message,
            } => write!(f, "{} 返回 HTTP {}: {}", stage, status, message),
            ChunkFailure::Throttled { stage, delay_units } => {
                write!(f, "{} 被限流，等待 {} 个时间单位", stage, delay_units)
            }
            ChunkFailure::Malformed { stage, message } => {
                write!(f, "{} 响应异常: {}", stage, message)
            }
        }
    }
}

/// 单个分片的上传结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Uploaded { etag: String },
    Failed(ChunkFailure),
}

/// 工作者共享的会话信息（只读）
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub apikey: String,
    pub handle: SessionHandle,
    /// upload/commit/complete 的基础地址
    pub base_url: String,
    pub store: StoreLocation,
    /// 是否为智能上传
    pub intelligent: bool,
    /// 文件总大小
    pub total_size: u64,
}

/// 分片上传工作者
#[derive(Clone)]
pub struct UploadWorker {
    api: Arc<dyn UploadApi>,
    source: ChunkSource,
    context: Arc<WorkerContext>,
}

impl UploadWorker {
    pub fn new(api: Arc<dyn UploadApi>, source: ChunkSource, context: WorkerContext) -> Self {
        Self {
            api,
            source,
            context: Arc::new(context),
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    /// 上传一个分片
    ///
    /// # 参数
    /// * `chunk` - 分片
    /// * `absolute_offset` - 分片在文件中的偏移
    ///
    /// # 返回
    /// 只有读取上传源失败才返回 Err，网络与服务端错误以 `ChunkOutcome::Failed` 上报
    pub async fn upload(
        &self,
        chunk: &Chunk,
        absolute_offset: u64,
    ) -> Result<ChunkOutcome, UploadError> {
        let data = self.source.read_range(absolute_offset, chunk.size).await?;
        let md5 = STANDARD.encode(md5::compute(&data).0);

        let ctx = &self.context;
        let request = UploadRequest {
            apikey: ctx.apikey.clone(),
            uri: ctx.handle.uri.clone(),
            region: ctx.handle.region.clone(),
            upload_id: ctx.handle.upload_id.clone(),
            store: ctx.store.clone(),
            part: chunk.part,
            size: chunk.size,
            md5,
            offset: ctx.intelligent.then_some(chunk.offset),
            fii: ctx.intelligent.then_some(true),
        };

        let slot = match self.api.request_upload(&ctx.base_url, &request).await {
            Ok(slot) => slot,
            Err(e) => {
                let failure = ChunkFailure::classify(TransferStage::Slot, e);
                warn!(
                    "申请上传地址失败: part={}, offset={}, size={}, {}",
                    chunk.part, chunk.offset, chunk.size, failure
                );
                return Ok(ChunkOutcome::Failed(failure));
            }
        };

        match self.api.put_chunk(&slot, data).await {
            Ok(etag) => {
                debug!(
                    "分片上传成功: part={}, offset={}, size={}, etag={}",
                    chunk.part, chunk.offset, chunk.size, etag
                );
                Ok(ChunkOutcome::Uploaded { etag })
            }
            Err(e) => {
                let failure = ChunkFailure::classify(TransferStage::Put, e);
                warn!(
                    "分片 PUT 失败: part={}, offset={}, size={}, {}",
                    chunk.part, chunk.offset, chunk.size, failure
                );
                Ok(ChunkOutcome::Failed(failure))
            }
        }
    }

    /// 提交一个 part（智能上传），size 为文件总大小
    pub async fn commit(&self, part: u32) -> Result<(), ApiError> {
        let ctx = &self.context;
        let request = CommitRequest {
            apikey: ctx.apikey.clone(),
            uri: ctx.handle.uri.clone(),
            region: ctx.handle.region.clone(),
            upload_id: ctx.handle.upload_id.clone(),
            store: ctx.store.clone(),
            part,
            size: ctx.total_size,
        };
        self.api.commit(&ctx.base_url, &request).await
    }
}
