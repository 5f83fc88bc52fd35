// 上传会话
//
// Created -> Started -> Uploading -> Committing（智能上传）-> Completing -> Done，
// 任何致命错误直接进入 Failed。
//
// 会话是唯一的决策点：
// - 使用 Semaphore 控制并发数，JoinSet 管理分片与提交任务
// - 任务结果回到会话，失败交给 RetryController 决定重试、拆分或终止
// - 终止时中止所有任务，已上传到存储后端的数据不会回滚

use crate::api::{CompleteReply, CompleteRequest, StartRequest, StoredFile, UploadApi};
use crate::config::{host_concurrency, UploadConfig};
use crate::uploader::chunk::{Chunk, PartPlanner, DEFAULT_CHUNK_SIZE, DEFAULT_PART_SIZE, MIN_CHUNK_SIZE};
use crate::uploader::error::UploadError;
use crate::uploader::gate::{CompletionGate, GateMode};
use crate::uploader::retry::{ChunkSizeGovernor, RetryController, RetryDecision, RetryPolicy};
use crate::uploader::target::UploadTarget;
use crate::uploader::worker::{ChunkOutcome, UploadWorker, WorkerContext};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// 上传模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// 所有 part 上传完成后一次 complete，携带每个 part 的 ETag
    Standard,
    /// 智能上传：part 完成后立即提交，失败分片可拆分
    Intelligent,
}

impl UploadMode {
    pub fn from_flag(intelligent: bool) -> Self {
        if intelligent {
            UploadMode::Intelligent
        } else {
            UploadMode::Standard
        }
    }

    pub fn is_intelligent(&self) -> bool {
        matches!(self, UploadMode::Intelligent)
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Uploading,
    Committing,
    Completing,
    Done,
    Failed,
}

/// 会话参数
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub mode: UploadMode,
    pub part_size: u64,
    pub initial_chunk_size: u64,
    pub min_chunk_size: u64,
    pub max_delay_units: u32,
    pub time_unit: Duration,
    pub concurrency: usize,
    pub complete_schedule: Vec<u32>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mode: UploadMode::Standard,
            part_size: DEFAULT_PART_SIZE,
            initial_chunk_size: DEFAULT_CHUNK_SIZE,
            min_chunk_size: MIN_CHUNK_SIZE,
            max_delay_units: 4,
            time_unit: Duration::from_secs(1),
            concurrency: host_concurrency(),
            complete_schedule: vec![0, 1, 2, 3, 5],
        }
    }
}

impl SessionOptions {
    /// 从上传配置创建
    pub fn from_config(config: &UploadConfig, mode: UploadMode) -> Self {
        Self {
            mode,
            part_size: config.part_size,
            initial_chunk_size: config.initial_chunk_size,
            min_chunk_size: config.min_chunk_size,
            max_delay_units: config.max_delay_units,
            time_unit: config.time_unit(),
            concurrency: config.effective_concurrency(),
            complete_schedule: config.complete_schedule.clone(),
        }
    }

    /// 校验参数，分片大小为 0 或并发为 0 时调度无法推进
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.part_size == 0 {
            return Err(UploadError::InvalidTarget("part_size 不能为 0".to_string()));
        }
        if self.min_chunk_size == 0 {
            return Err(UploadError::InvalidTarget(
                "min_chunk_size 不能为 0".to_string(),
            ));
        }
        if self.initial_chunk_size < self.min_chunk_size {
            return Err(UploadError::InvalidTarget(format!(
                "initial_chunk_size ({}) 不能小于 min_chunk_size ({})",
                self.initial_chunk_size, self.min_chunk_size
            )));
        }
        if self.concurrency == 0 {
            return Err(UploadError::InvalidTarget("concurrency 不能为 0".to_string()));
        }
        if self.complete_schedule.is_empty() {
            return Err(UploadError::InvalidTarget(
                "complete_schedule 至少需要一项".to_string(),
            ));
        }
        Ok(())
    }
}

/// 待调度的任务
#[derive(Debug)]
enum Job {
    Upload { chunk: Chunk, delay_units: u32 },
    Commit { part: u32 },
}

/// 任务结果
#[derive(Debug)]
enum TaskOutput {
    Chunk { chunk: Chunk, outcome: ChunkOutcome },
    Committed { part: u32 },
}

type TaskResult = Result<TaskOutput, UploadError>;

/// 一次分片传输过程中的状态
struct Transfer {
    planner: PartPlanner,
    gate: Arc<CompletionGate>,
    worker: UploadWorker,
    semaphore: Arc<Semaphore>,
    join_set: JoinSet<TaskResult>,
    queue: VecDeque<Job>,
}

/// 上传会话
pub struct UploadSession {
    id: Uuid,
    api: Arc<dyn UploadApi>,
    apikey: String,
    target: UploadTarget,
    options: SessionOptions,
    state: SessionState,
    governor: ChunkSizeGovernor,
    uploaded_bytes: Arc<AtomicU64>,
    cancel_token: CancellationToken,
}

impl UploadSession {
    pub fn new(
        api: Arc<dyn UploadApi>,
        apikey: impl Into<String>,
        target: UploadTarget,
        options: SessionOptions,
    ) -> Self {
        let governor = ChunkSizeGovernor::new(options.initial_chunk_size, options.min_chunk_size);
        Self {
            id: Uuid::new_v4(),
            api,
            apikey: apikey.into(),
            target,
            options,
            state: SessionState::Created,
            governor,
            uploaded_bytes: Arc::new(AtomicU64::new(0)),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 已成功上传的字节数
    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::SeqCst)
    }

    /// 进度计数器，可在会话运行时从其他任务读取
    pub fn progress(&self) -> Arc<AtomicU64> {
        self.uploaded_bytes.clone()
    }

    /// 当前会话分片大小
    pub fn chunk_size(&self) -> u64 {
        self.governor.current()
    }

    /// 取消令牌，取消后会话以 `UploadError::Cancelled` 结束
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 执行上传
    ///
    /// 成功返回服务端的文件信息；任何致命错误都会中止所有任务并返回唯一的错误
    pub async fn run(&mut self) -> Result<StoredFile, UploadError> {
        if self.state != SessionState::Created {
            return Err(UploadError::Internal(format!(
                "会话只能运行一次，当前状态 {:?}",
                self.state
            )));
        }

        if let Err(e) = self.options.validate() {
            self.state = SessionState::Failed;
            error!("会话参数无效: session={}, 错误={}", self.id, e);
            return Err(e);
        }

        let span = info_span!("upload", session = %self.id, mode = ?self.options.mode);
        let result = self.run_inner().instrument(span).await;

        match &result {
            Ok(file) => {
                self.state = SessionState::Done;
                info!(
                    "上传完成: session={}, handle={}, url={}",
                    self.id,
                    file.handle,
                    file.cdn_url()
                );
            }
            Err(e) => {
                self.state = SessionState::Failed;
                error!(
                    "上传失败: session={}, 阶段={:?}, 错误={}",
                    self.id,
                    e.stage(),
                    e
                );
            }
        }
        result
    }

    async fn run_inner(&mut self) -> Result<StoredFile, UploadError> {
        let intelligent = self.options.mode.is_intelligent();
        info!(
            "开始上传: filename={}, size={}, storage={}, 并发={}",
            self.target.filename,
            self.target.size,
            self.target.storage,
            self.options.concurrency
        );

        // multipart/start，失败不重试
        let start = StartRequest {
            apikey: self.apikey.clone(),
            filename: self.target.filename.clone(),
            mimetype: self.target.mimetype.clone(),
            size: self.target.size,
            store: self.target.store_params(false),
            fii: intelligent.then_some(true),
            security: self.target.security.as_ref().map(|s| s.fields()),
        };
        let handle = self.api.start(&start).await.map_err(UploadError::Start)?;
        self.state = SessionState::Started;

        let base_url = handle.base_url(intelligent);
        debug!("会话已创建: upload_id={}, base_url={}", handle.upload_id, base_url);

        let planner = PartPlanner::new(self.target.size, self.options.part_size);
        let gate_mode = if intelligent {
            GateMode::PartsCommitted
        } else {
            GateMode::PartsDone
        };
        let gate = Arc::new(CompletionGate::new(gate_mode, planner.part_count()));
        let worker = UploadWorker::new(
            self.api.clone(),
            self.target.source.clone(),
            WorkerContext {
                apikey: self.apikey.clone(),
                handle,
                base_url,
                store: self.target.store_location(),
                intelligent,
                total_size: self.target.size,
            },
        );

        let queue = planner
            .initial_chunks()
            .into_iter()
            .map(|chunk| Job::Upload {
                chunk,
                delay_units: 0,
            })
            .collect();
        let mut transfer = Transfer {
            planner,
            gate,
            worker,
            semaphore: Arc::new(Semaphore::new(self.options.concurrency.max(1))),
            join_set: JoinSet::new(),
            queue,
        };

        self.state = SessionState::Uploading;
        let pumped = self.pump(&mut transfer).await;
        if pumped.is_err() {
            transfer.join_set.abort_all();
            while transfer.join_set.join_next().await.is_some() {}
        }
        pumped?;

        if !transfer.planner.is_complete() {
            return Err(UploadError::Internal("仍有未完成的分片".to_string()));
        }
        tokio::select! {
            _ = self.cancel_token.cancelled() => return Err(UploadError::Cancelled),
            _ = transfer.gate.wait() => {}
        }

        self.complete(&transfer).await
    }

    /// 调度循环：派发任务并处理结果，直到队列与任务都为空
    async fn pump(&mut self, transfer: &mut Transfer) -> Result<(), UploadError> {
        loop {
            if self.cancel_token.is_cancelled() {
                warn!("上传已取消");
                return Err(UploadError::Cancelled);
            }

            // 非阻塞处理已完成的任务
            while let Some(result) = transfer.join_set.try_join_next() {
                self.handle_task_result(transfer, result)?;
            }

            let job = match transfer.queue.pop_front() {
                Some(job) => job,
                None => {
                    if transfer.join_set.is_empty() {
                        return Ok(());
                    }
                    if let Some(result) = self.next_result(&mut transfer.join_set).await? {
                        self.handle_task_result(transfer, result)?;
                    }
                    continue;
                }
            };

            // 智能上传：分片大于会话分片大小时先拆分
            let job = match job {
                Job::Upload { chunk, delay_units }
                    if self.options.mode.is_intelligent()
                        && chunk.size > self.governor.current() =>
                {
                    let pieces = chunk.split(self.governor.current());
                    if pieces.len() < 2 {
                        return Err(UploadError::Internal(format!(
                            "分片无法按 {} bytes 拆分: part={}, offset={}",
                            self.governor.current(),
                            chunk.part,
                            chunk.offset
                        )));
                    }
                    transfer.planner.replace(&chunk, &pieces)?;
                    for piece in pieces.into_iter().rev() {
                        transfer.queue.push_front(Job::Upload {
                            chunk: piece,
                            delay_units,
                        });
                    }
                    continue;
                }
                job => job,
            };

            // 需要等待的分片在任务内部等待后再申请许可
            let delayed = matches!(job, Job::Upload { delay_units, .. } if delay_units > 0);
            let permit = if delayed {
                None
            } else {
                match transfer.semaphore.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        // 并发已满，等待一个任务完成
                        transfer.queue.push_front(job);
                        if let Some(result) = self.next_result(&mut transfer.join_set).await? {
                            self.handle_task_result(transfer, result)?;
                        }
                        continue;
                    }
                }
            };

            self.spawn_job(transfer, job, permit)?;
        }
    }

    fn spawn_job(
        &self,
        transfer: &mut Transfer,
        job: Job,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<(), UploadError> {
        match job {
            Job::Upload { chunk, delay_units } => {
                let offset = transfer.planner.absolute_offset(&chunk).ok_or_else(|| {
                    UploadError::Internal(format!("part {} 不存在", chunk.part))
                })?;
                let worker = transfer.worker.clone();
                let semaphore = transfer.semaphore.clone();
                let cancel_token = self.cancel_token.clone();
                let wait = self.options.time_unit * delay_units;

                debug!(
                    "派发分片: part={}, offset={}, size={}, 等待={:?}",
                    chunk.part, chunk.offset, chunk.size, wait
                );

                transfer.join_set.spawn(run_upload_job(
                    worker,
                    chunk,
                    offset,
                    permit,
                    semaphore,
                    wait,
                    cancel_token,
                ));
            }
            Job::Commit { part } => {
                let worker = transfer.worker.clone();
                let gate = transfer.gate.clone();

                transfer
                    .join_set
                    .spawn(run_commit_job(worker, part, gate, permit));
            }
        }
        Ok(())
    }

    /// 等待下一个任务结果，期间响应取消
    async fn next_result(
        &self,
        join_set: &mut JoinSet<TaskResult>,
    ) -> Result<Option<Result<TaskResult, JoinError>>, UploadError> {
        tokio::select! {
            _ = self.cancel_token.cancelled() => Err(UploadError::Cancelled),
            result = join_set.join_next() => Ok(result),
        }
    }

    /// 处理任务结果
    fn handle_task_result(
        &mut self,
        transfer: &mut Transfer,
        result: Result<TaskResult, JoinError>,
    ) -> Result<(), UploadError> {
        let output = match result {
            Ok(output) => output?,
            Err(e) => return Err(UploadError::Internal(format!("任务异常: {}", e))),
        };

        match output {
            TaskOutput::Chunk {
                chunk,
                outcome: ChunkOutcome::Uploaded { etag },
            } => {
                let part_done = transfer.planner.mark_done(&chunk, etag)?;
                let uploaded = self.uploaded_bytes.fetch_add(chunk.size, Ordering::SeqCst)
                    + chunk.size;

                // 以规划器中当前的分片集合为准
                if part_done && transfer.planner.is_part_done(chunk.part) {
                    info!(
                        "part {}/{} 上传完成, 进度 {}/{} bytes",
                        chunk.part,
                        transfer.planner.part_count(),
                        uploaded,
                        transfer.planner.total_size()
                    );
                    if self.options.mode.is_intelligent() {
                        transfer.queue.push_front(Job::Commit { part: chunk.part });
                        if transfer.planner.is_complete() {
                            self.state = SessionState::Committing;
                        }
                    } else {
                        transfer.gate.signal(chunk.part);
                    }
                }
            }
            TaskOutput::Chunk {
                chunk,
                outcome: ChunkOutcome::Failed(failure),
            } => {
                let policy = RetryPolicy {
                    max_delay_units: self.options.max_delay_units,
                    split_on_failure: self.options.mode.is_intelligent(),
                };
                let decision = RetryController::new(policy, &self.governor)
                    .decide(chunk.clone(), &failure);

                match decision {
                    RetryDecision::Resubmit { chunk, delay_units } => {
                        warn!(
                            "分片将在 {} 个时间单位后重试: part={}, offset={}, 累计等待={}",
                            delay_units, chunk.part, chunk.offset, chunk.delay_spent
                        );
                        transfer
                            .queue
                            .push_back(Job::Upload { chunk, delay_units });
                    }
                    RetryDecision::Resplit(pieces) => {
                        warn!(
                            "分片拆分重试: part={}, offset={}, size={} -> {} 片",
                            chunk.part,
                            chunk.offset,
                            chunk.size,
                            pieces.len()
                        );
                        transfer.planner.replace(&chunk, &pieces)?;
                        transfer
                            .queue
                            .extend(pieces.into_iter().map(|piece| Job::Upload {
                                chunk: piece,
                                delay_units: 0,
                            }));
                    }
                    RetryDecision::Abort(e) => return Err(e),
                }
            }
            TaskOutput::Committed { part } => {
                transfer.planner.mark_committed(part)?;
                info!("part {} 已提交", part);
            }
        }
        Ok(())
    }

    /// multipart/complete，返回 202 时按等待序列重试
    async fn complete(&mut self, transfer: &Transfer) -> Result<StoredFile, UploadError> {
        self.state = SessionState::Completing;

        let intelligent = self.options.mode.is_intelligent();
        let context = transfer.worker.context();
        let parts = if intelligent {
            None
        } else {
            Some(transfer.planner.etags()?)
        };

        let request = CompleteRequest {
            apikey: self.apikey.clone(),
            filename: self.target.filename.clone(),
            mimetype: self.target.mimetype.clone(),
            size: self.target.size,
            uri: context.handle.uri.clone(),
            region: context.handle.region.clone(),
            upload_id: context.handle.upload_id.clone(),
            store: self.target.store_params(true),
            parts,
            fii: intelligent.then_some(true),
            upload_tags: self.target.options.upload_tags.clone(),
            security: self.target.security.as_ref().map(|s| s.fields()),
        };

        let schedule = self.options.complete_schedule.clone();
        for (attempt, wait_units) in schedule.iter().enumerate() {
            if *wait_units > 0 {
                let wait = self.options.time_unit * *wait_units;
                tokio::select! {
                    _ = self.cancel_token.cancelled() => return Err(UploadError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            match self
                .api
                .complete(&context.base_url, &request)
                .await
                .map_err(UploadError::Complete)?
            {
                CompleteReply::Stored(file) => return Ok(file),
                CompleteReply::Pending => {
                    debug!(
                        "multipart/complete 返回 202 (第 {}/{} 次)",
                        attempt + 1,
                        schedule.len()
                    );
                }
            }
        }

        Err(UploadError::CompleteNotReady {
            attempts: schedule.len(),
        })
    }
}

/// 上传一个分片
///
/// 没有许可时先等待 `wait` 再申请，等待期间响应取消
async fn run_upload_job(
    worker: UploadWorker,
    mut chunk: Chunk,
    offset: u64,
    permit: Option<OwnedSemaphorePermit>,
    semaphore: Arc<Semaphore>,
    wait: Duration,
    cancel_token: CancellationToken,
) -> TaskResult {
    let _permit = match permit {
        Some(permit) => permit,
        None => {
            tokio::select! {
                _ = cancel_token.cancelled() => return Err(UploadError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
            semaphore
                .acquire_owned()
                .await
                .map_err(|e| UploadError::Internal(e.to_string()))?
        }
    };

    chunk.attempts += 1;
    let outcome = worker.upload(&chunk, offset).await?;
    Ok(TaskOutput::Chunk { chunk, outcome })
}

/// 提交一个 part 并通知汇合点
async fn run_commit_job(
    worker: UploadWorker,
    part: u32,
    gate: Arc<CompletionGate>,
    _permit: Option<OwnedSemaphorePermit>,
) -> TaskResult {
    worker
        .commit(part)
        .await
        .map_err(|source| UploadError::Commit { part, source })?;
    gate.signal(part);
    Ok(TaskOutput::Committed { part })
}
