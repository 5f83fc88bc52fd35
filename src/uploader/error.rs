//! 上传会话的终止错误

use crate::api::ApiError;
use thiserror::Error;

/// 失败所在阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    /// 准备上传源与 multipart/start
    Setup,
    /// 分片上传
    Uploading,
    /// 逐 part 提交（智能上传）
    Committing,
    /// multipart/complete
    Completing,
}

/// 上传失败
///
/// 调用方只会收到一个终止错误，不存在部分成功的返回值
#[derive(Error, Debug)]
pub enum UploadError {
    /// 读取本地文件或内存缓冲区失败
    #[error("读取上传源失败: {0}")]
    Source(#[from] std::io::Error),

    /// 上传参数无效
    #[error("上传参数无效: {0}")]
    InvalidTarget(String),

    /// multipart/start 失败（不重试）
    #[error("multipart/start 失败: {0}")]
    Start(#[source] ApiError),

    /// 分片大小已降到下限以下
    #[error(
        "Minimal chunk size failed: part={part}, offset={offset}, size={size}, 下限={floor} bytes"
    )]
    MinChunkSizeExceeded {
        part: u32,
        offset: u64,
        size: u64,
        floor: u64,
    },

    /// 单个分片累计等待超过上限
    #[error("分片等待超过上限: part={part}, offset={offset}, 累计={spent}, 上限={budget}")]
    MaxDelayExceeded {
        part: u32,
        offset: u64,
        spent: u32,
        budget: u32,
    },

    /// multipart/commit 失败
    #[error("part {part} 提交失败: {source}")]
    Commit {
        part: u32,
        #[source]
        source: ApiError,
    },

    /// multipart/complete 返回非 200/202 或网络错误
    #[error("multipart/complete 失败: {0}")]
    Complete(#[source] ApiError),

    /// 等待序列耗尽仍未收到 200
    #[error("multipart/complete 在 {attempts} 次尝试后仍未就绪")]
    CompleteNotReady { attempts: usize },

    /// 会话被取消
    #[error("上传已取消")]
    Cancelled,

    /// 任务异常或内部状态不一致
    #[error("上传任务异常: {0}")]
    Internal(String),
}

impl UploadError {
    /// 失败所在阶段
    pub fn stage(&self) -> UploadStage {
        match self {
            UploadError::Source(_) | UploadError::InvalidTarget(_) | UploadError::Start(_) => {
                UploadStage::Setup
            }
            UploadError::MinChunkSizeExceeded { .. }
            | UploadError::MaxDelayExceeded { .. }
            | UploadError::Cancelled
            | UploadError::Internal(_) => UploadStage::Uploading,
            UploadError::Commit { .. } => UploadStage::Committing,
            UploadError::Complete(_) | UploadError::CompleteNotReady { .. } => {
                UploadStage::Completing
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_mapping() {
        let err = UploadError::Start(ApiError::Transport("down".to_string()));
        assert_eq!(err.stage(), UploadStage::Setup);

        let err = UploadError::MinChunkSizeExceeded {
            part: 1,
            offset: 0,
            size: 40_000,
            floor: 32_768,
        };
        assert_eq!(err.stage(), UploadStage::Uploading);
        assert!(err.to_string().contains("Minimal chunk size failed"));

        let err = UploadError::CompleteNotReady { attempts: 5 };
        assert_eq!(err.stage(), UploadStage::Completing);
    }
}
