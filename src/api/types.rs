// 上传服务 API 数据类型
//
// 所有请求体均以 JSON 发送，字段名与服务端保持一致

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// CDN 基础地址
pub const CDN_URL: &str = "https://cdn.filestackcontent.com";

/// 签名字段（policy + signature）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFields {
    /// base64 编码后的策略
    pub policy: String,
    /// 策略签名
    pub signature: String,
}

/// 仅包含存储位置的 store 对象（分片上传与 commit 使用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLocation {
    pub location: String,
}

/// 完整的 store 对象（start 与 complete 使用）
///
/// `None` 表示字段不出现在请求体中
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreParams {
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64decode: Option<bool>,
    /// 工作流 ID 列表，仅在 complete 请求中出现
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflows: Option<Vec<String>>,
}

/// multipart/start 请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartRequest {
    pub apikey: String,
    pub filename: String,
    pub mimetype: String,
    pub size: u64,
    pub store: StoreParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fii: Option<bool>,
    #[serde(flatten)]
    pub security: Option<SecurityFields>,
}

/// multipart/start 响应，整个上传会话期间只读
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub uri: String,
    pub region: String,
    pub upload_id: String,
    /// 本次会话的上传主机（不带协议）
    #[serde(default)]
    pub location_url: String,
    #[serde(default)]
    pub upload_type: Option<String>,
    /// 智能上传模式下服务端可能下发的安全上传地址
    #[serde(default)]
    pub secure_upload_url: Option<String>,
}

impl SessionHandle {
    /// 后续 upload/commit/complete 请求的基础地址
    pub fn base_url(&self, intelligent: bool) -> String {
        if intelligent {
            if let Some(url) = self.secure_upload_url.as_deref().filter(|u| !u.is_empty()) {
                return url.trim_end_matches('/').to_string();
            }
        }

        let host = self.location_url.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        }
    }
}

/// multipart/upload 请求（每个分片一次）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadRequest {
    pub apikey: String,
    pub uri: String,
    pub region: String,
    pub upload_id: String,
    pub store: StoreLocation,
    pub part: u32,
    pub size: u64,
    /// 分片内容 MD5（base64）
    pub md5: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fii: Option<bool>,
}

/// multipart/upload 响应：存储后端的预签名 PUT 地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSlot {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// multipart/commit 请求（智能上传模式，每个 part 一次）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitRequest {
    pub apikey: String,
    pub uri: String,
    pub region: String,
    pub upload_id: String,
    pub store: StoreLocation,
    pub part: u32,
    /// 文件总大小
    pub size: u64,
}

/// 已上传 part 的 ETag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartEtag {
    pub part_number: u32,
    pub etag: String,
}

/// multipart/complete 请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompleteRequest {
    pub apikey: String,
    pub filename: String,
    pub mimetype: String,
    pub size: u64,
    pub uri: String,
    pub region: String,
    pub upload_id: String,
    pub store: StoreParams,
    /// 普通模式：每个 part 的 ETag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<PartEtag>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fii: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_tags: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub security: Option<SecurityFields>,
}

/// 上传完成后服务端返回的文件信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub handle: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl StoredFile {
    /// 文件访问地址，服务端未返回 url 时按 handle 拼接 CDN 地址
    pub fn cdn_url(&self) -> String {
        match self.url.as_deref() {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => format!("{}/{}", CDN_URL, self.handle),
        }
    }
}

/// multipart/complete 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompleteReply {
    /// HTTP 200：文件已组装完成
    Stored(StoredFile),
    /// HTTP 202：服务端仍在处理，稍后重试
    Pending,
}
