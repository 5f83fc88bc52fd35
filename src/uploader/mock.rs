// 测试用的脚本化上传服务
//
// 按脚本返回 PUT / commit / complete 结果，并记录所有调用

use crate::api::{
    ApiError, CommitRequest, CompleteReply, CompleteRequest, SessionHandle, StartRequest,
    StoredFile, UploadApi, UploadRequest, UploadSlot,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

const STORAGE_URL: &str = "https://storage.test/";

/// 记录的调用
#[derive(Debug, Clone)]
pub enum ApiCall {
    Start(StartRequest),
    Upload(UploadRequest),
    Put { url: String, size: u64 },
    Commit(CommitRequest),
    Complete(CompleteRequest),
}

/// 一次脚本化的响应
#[derive(Debug, Clone)]
pub enum Reply {
    /// 成功（PUT 返回 ETag，complete 返回 200）
    Ok,
    /// complete 返回 202
    Accepted,
    /// 非 2xx
    Status { status: u16, retry_after: Option<u32> },
    /// 网络错误
    Transport,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Reply::Status {
            status,
            retry_after: None,
        }
    }

    fn into_error(self) -> Option<ApiError> {
        match self {
            Reply::Ok | Reply::Accepted => None,
            Reply::Status {
                status,
                retry_after,
            } => Some(ApiError::Status {
                status,
                body: format!("scripted {}", status),
                retry_after,
            }),
            Reply::Transport => Some(ApiError::Transport("connection reset".to_string())),
        }
    }
}

#[derive(Default)]
struct Script {
    start: Option<ApiError>,
    slots: VecDeque<Reply>,
    puts: VecDeque<Reply>,
    /// PUT 脚本用完后的默认响应
    put_fallback: Option<Reply>,
    commits: VecDeque<Reply>,
    completes: VecDeque<Reply>,
}

/// 脚本化的上传服务
#[derive(Default)]
pub struct ScriptedApi {
    script: Mutex<Script>,
    calls: Mutex<Vec<ApiCall>>,
    put_delay: Option<Duration>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// start 返回的会话
    pub fn session_handle() -> SessionHandle {
        SessionHandle {
            uri: "upload-uri".to_string(),
            region: "upload-region".to_string(),
            upload_id: "upload-id".to_string(),
            location_url: "fs-upload.com".to_string(),
            upload_type: None,
            secure_upload_url: None,
        }
    }

    pub fn with_start_error(self, error: ApiError) -> Self {
        self.script.lock().start = Some(error);
        self
    }

    pub fn with_slot_replies(self, replies: Vec<Reply>) -> Self {
        self.script.lock().slots = replies.into();
        self
    }

    pub fn with_put_replies(self, replies: Vec<Reply>) -> Self {
        self.script.lock().puts = replies.into();
        self
    }

    /// 依次返回给定状态码（200 表示成功）
    pub fn with_put_statuses(self, statuses: Vec<u16>) -> Self {
        let replies = statuses
            .into_iter()
            .map(|status| {
                if status == 200 {
                    Reply::Ok
                } else {
                    Reply::status(status)
                }
            })
            .collect();
        self.with_put_replies(replies)
    }

    /// 脚本用完后所有 PUT 都返回该响应
    pub fn with_put_fallback(self, reply: Reply) -> Self {
        self.script.lock().put_fallback = Some(reply);
        self
    }

    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = Some(delay);
        self
    }

    pub fn with_commit_replies(self, replies: Vec<Reply>) -> Self {
        self.script.lock().commits = replies.into();
        self
    }

    pub fn with_complete_replies(self, replies: Vec<Reply>) -> Self {
        self.script.lock().completes = replies.into();
        self
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().clone()
    }

    pub fn start_requests(&self) -> Vec<StartRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ApiCall::Start(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn upload_requests(&self) -> Vec<UploadRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ApiCall::Upload(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn commit_requests(&self) -> Vec<CommitRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ApiCall::Commit(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn complete_requests(&self) -> Vec<CompleteRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ApiCall::Complete(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    /// 所有 PUT 的字节数（按调用顺序）
    pub fn put_sizes(&self) -> Vec<u64> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ApiCall::Put { size, .. } => Some(*size),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl UploadApi for ScriptedApi {
    async fn start(&self, request: &StartRequest) -> Result<SessionHandle, ApiError> {
        self.record(ApiCall::Start(request.clone()));
        match self.script.lock().start.clone() {
            Some(error) => Err(error),
            None => Ok(Self::session_handle()),
        }
    }

    async fn request_upload(
        &self,
        _base_url: &str,
        request: &UploadRequest,
    ) -> Result<UploadSlot, ApiError> {
        self.record(ApiCall::Upload(request.clone()));
        let reply = self.script.lock().slots.pop_front().unwrap_or(Reply::Ok);
        if let Some(error) = reply.into_error() {
            return Err(error);
        }

        let mut headers = HashMap::new();
        headers.insert("x-upload".to_string(), "headers".to_string());
        Ok(UploadSlot {
            url: format!(
                "{}part-{}/{}",
                STORAGE_URL,
                request.part,
                request.offset.unwrap_or(0)
            ),
            headers,
        })
    }

    async fn put_chunk(&self, slot: &UploadSlot, data: Vec<u8>) -> Result<String, ApiError> {
        self.record(ApiCall::Put {
            url: slot.url.clone(),
            size: data.len() as u64,
        });
        if let Some(delay) = self.put_delay {
            tokio::time::sleep(delay).await;
        }

        let reply = {
            let mut script = self.script.lock();
            script
                .puts
                .pop_front()
                .or_else(|| script.put_fallback.clone())
                .unwrap_or(Reply::Ok)
        };
        match reply.into_error() {
            Some(error) => Err(error),
            None => Ok(format!(
                "etag-{}",
                slot.url.trim_start_matches(STORAGE_URL)
            )),
        }
    }

    async fn commit(&self, _base_url: &str, request: &CommitRequest) -> Result<(), ApiError> {
        self.record(ApiCall::Commit(request.clone()));
        let reply = self.script.lock().commits.pop_front().unwrap_or(Reply::Ok);
        match reply.into_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn complete(
        &self,
        _base_url: &str,
        request: &CompleteRequest,
    ) -> Result<CompleteReply, ApiError> {
        self.record(ApiCall::Complete(request.clone()));
        let reply = self
            .script
            .lock()
            .completes
            .pop_front()
            .unwrap_or(Reply::Ok);
        match reply {
            Reply::Ok => Ok(CompleteReply::Stored(StoredFile {
                handle: "HANDLE".to_string(),
                url: Some("https://cdn.filestackcontent.com/HANDLE".to_string()),
                filename: Some(request.filename.clone()),
                size: Some(request.size),
                mimetype: Some(request.mimetype.clone()),
                status: Some("Stored".to_string()),
            })),
            Reply::Accepted => Ok(CompleteReply::Pending),
            other => Err(other
                .into_error()
                .unwrap_or_else(|| ApiError::Decode("unreachable".to_string()))),
        }
    }
}
