// 分片上传模块
//
// - chunk: part / 分片规划
// - source: 按范围读取上传源
// - worker: 单个分片的 upload + PUT
// - retry: 失败后的等待、拆分与终止决策
// - gate: complete 前的汇合点
// - session: 会话编排

pub mod chunk;
pub mod error;
pub mod gate;
pub mod retry;
pub mod session;
pub mod source;
pub mod target;
pub mod worker;

#[cfg(test)]
pub(crate) mod mock;

pub use chunk::{
    Chunk, Part, PartPlanner, DEFAULT_CHUNK_SIZE, DEFAULT_PART_SIZE, MIN_CHUNK_SIZE,
};
pub use error::{UploadError, UploadStage};
pub use gate::{CompletionGate, GateMode};
pub use retry::{ChunkSizeGovernor, RetryController, RetryDecision, RetryPolicy, Shrink};
pub use session::{SessionOptions, SessionState, UploadMode, UploadSession};
pub use source::ChunkSource;
pub use target::{guess_mimetype, StoreOptions, UploadTarget};
pub use worker::{ChunkFailure, ChunkOutcome, TransferStage, UploadWorker, WorkerContext};
