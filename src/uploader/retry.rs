// 分片失败后的重试决策
//
// 会话收到失败结果后统一交给 RetryController 决定：
// - 限流：等待服务端要求的时间后原样重试，累计等待受上限约束
// - 智能上传的其他失败：减半会话分片大小并拆分失败分片
// - 普通模式的其他失败：part 不能拆分，等待一个时间单位后重试

use crate::uploader::chunk::Chunk;
use crate::uploader::error::UploadError;
use crate::uploader::worker::ChunkFailure;
use parking_lot::Mutex;
use tracing::{info, warn};

/// 会话级分片大小，只会减小
#[derive(Debug)]
pub struct ChunkSizeGovernor {
    current: Mutex<u64>,
    floor: u64,
}

/// 一次缩小请求的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shrink {
    /// 已减半
    Halved { from: u64, to: u64 },
    /// 其他失败已经减半过，沿用当前大小
    Unchanged(u64),
    /// 减半后低于下限
    BelowFloor { attempted: u64 },
}

impl ChunkSizeGovernor {
    pub fn new(initial: u64, floor: u64) -> Self {
        Self {
            current: Mutex::new(initial),
            floor,
        }
    }

    /// 当前分片大小
    pub fn current(&self) -> u64 {
        *self.current.lock()
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// 因 `failed_size` 大小的分片失败而请求缩小
    ///
    /// 只有当前大小仍不小于失败分片时才减半，
    /// 同一大小的并发失败最多触发一次减半
    pub fn shrink_for(&self, failed_size: u64) -> Shrink {
        let mut current = self.current.lock();
        if *current < failed_size {
            return Shrink::Unchanged(*current);
        }

        let next = *current / 2;
        if next < self.floor {
            return Shrink::BelowFloor { attempted: next };
        }

        let from = *current;
        *current = next;
        Shrink::Halved { from, to: next }
    }
}

/// 重试策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 单个分片累计等待上限（时间单位数）
    pub max_delay_units: u32,
    /// 失败时是否拆分分片（仅智能上传）
    pub split_on_failure: bool,
}

/// 重试决策
#[derive(Debug)]
pub enum RetryDecision {
    /// 等待后原样重新提交
    Resubmit { chunk: Chunk, delay_units: u32 },
    /// 拆分后重新提交
    Resplit(Vec<Chunk>),
    /// 终止会话
    Abort(UploadError),
}

/// 重试控制器
#[derive(Debug)]
pub struct RetryController<'a> {
    policy: RetryPolicy,
    governor: &'a ChunkSizeGovernor,
}

impl<'a> RetryController<'a> {
    pub fn new(policy: RetryPolicy, governor: &'a ChunkSizeGovernor) -> Self {
        Self { policy, governor }
    }

    /// 对一次分片失败做出决策
    pub fn decide(&self, chunk: Chunk, failure: &ChunkFailure) -> RetryDecision {
        if let Some(delay) = failure.requested_delay() {
            return self.charge(chunk, delay);
        }

        if !self.policy.split_on_failure {
            return self.charge(chunk, 1);
        }

        let chunk_size = match self.governor.shrink_for(chunk.size) {
            Shrink::Halved { from, to } => {
                info!("分片大小减半: {} -> {} bytes (part={})", from, to, chunk.part);
                to
            }
            Shrink::Unchanged(current) => current,
            Shrink::BelowFloor { attempted } => {
                warn!(
                    "分片大小 {} 低于下限 {}: part={}, offset={}",
                    attempted,
                    self.governor.floor(),
                    chunk.part,
                    chunk.offset
                );
                return RetryDecision::Abort(UploadError::MinChunkSizeExceeded {
                    part: chunk.part,
                    offset: chunk.offset,
                    size: chunk.size,
                    floor: self.governor.floor(),
                });
            }
        };

        RetryDecision::Resplit(chunk.split(chunk_size))
    }

    /// 记入等待并检查上限
    fn charge(&self, mut chunk: Chunk, delay_units: u32) -> RetryDecision {
        let spent = chunk.delay_spent.saturating_add(delay_units);
        if spent > self.policy.max_delay_units {
            warn!(
                "分片累计等待 {} 超过上限 {}: part={}, offset={}",
                spent, self.policy.max_delay_units, chunk.part, chunk.offset
            );
            return RetryDecision::Abort(UploadError::MaxDelayExceeded {
                part: chunk.part,
                offset: chunk.offset,
                spent,
                budget: self.policy.max_delay_units,
            });
        }

        chunk.delay_spent = spent;
        RetryDecision::Resubmit { chunk, delay_units }
    }
}
