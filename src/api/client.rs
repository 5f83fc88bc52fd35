// 上传服务 HTTP 客户端实现

use crate::api::{
    ApiError, CommitRequest, CompleteReply, CompleteRequest, SessionHandle, StartRequest,
    StoredFile, UploadApi, UploadRequest, UploadSlot,
};
use crate::config::ApiConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ETAG, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info};

/// 客户端版本号（写入 User-Agent 与 Filestack-Source）
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Filestack 上传服务客户端
#[derive(Debug, Clone)]
pub struct FilestackApi {
    /// HTTP客户端
    client: Client,
    /// multipart/start 地址
    start_url: String,
}

impl FilestackApi {
    /// 创建新的上传服务客户端
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("filestack-rust {}", CLIENT_VERSION))
                .context("构造 User-Agent 失败")?,
        );
        headers.insert(
            HeaderName::from_static("filestack-source"),
            HeaderValue::from_str(&format!("Rust-{}", CLIENT_VERSION))
                .context("构造 Filestack-Source 失败")?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        info!(
            "初始化上传客户端成功, start_url={}, timeout={}s",
            config.start_url, config.request_timeout_secs
        );

        Ok(Self {
            client,
            start_url: config.start_url.clone(),
        })
    }

    /// POST JSON，非 2xx 转换为 ApiError::Status
    async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<Response, ApiError> {
        let response = self.client.post(url).json(body).send().await?;
        ensure_success(response).await
    }

    /// POST JSON 并解析响应体
    async fn post_for<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<R, ApiError> {
        let response = self.post_json(url, body).await?;
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::Decode(format!("{}: body={}", e, text)))
    }
}

/// 检查响应状态，失败时读取响应体作为错误信息
async fn ensure_success(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
        retry_after,
    })
}

/// 解析 Retry-After 头（仅支持整数秒）
fn parse_retry_after(headers: &HeaderMap) -> Option<u32> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u32>().ok())
}

#[async_trait]
impl UploadApi for FilestackApi {
    async fn start(&self, request: &StartRequest) -> Result<SessionHandle, ApiError> {
        info!(
            "multipart/start: filename={}, size={}, fii={:?}",
            request.filename, request.size, request.fii
        );

        let handle: SessionHandle = self.post_for(&self.start_url, request).await.map_err(|e| {
            error!("multipart/start 失败: {}", e);
            e
        })?;

        debug!(
            "multipart/start 成功: upload_id={}, region={}, location_url={}",
            handle.upload_id, handle.region, handle.location_url
        );
        Ok(handle)
    }

    async fn request_upload(
        &self,
        base_url: &str,
        request: &UploadRequest,
    ) -> Result<UploadSlot, ApiError> {
        let url = format!("{}/multipart/upload", base_url);
        debug!(
            "multipart/upload: part={}, size={}, offset={:?}",
            request.part, request.size, request.offset
        );
        self.post_for(&url, request).await
    }

    async fn put_chunk(&self, slot: &UploadSlot, data: Vec<u8>) -> Result<String, ApiError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &slot.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ApiError::Decode(format!("非法的上传头 {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ApiError::Decode(format!("非法的上传头值: {}", e)))?;
            headers.insert(name, value);
        }

        let size = data.len();
        let response = self
            .client
            .put(&slot.url)
            .headers(headers)
            .body(data)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or(ApiError::MissingEtag)?;

        debug!("PUT 成功: size={}, etag={}", size, etag);
        Ok(etag)
    }

    async fn commit(&self, base_url: &str, request: &CommitRequest) -> Result<(), ApiError> {
        let url = format!("{}/multipart/commit", base_url);
        self.post_json(&url, request).await?;
        debug!("multipart/commit 成功: part={}", request.part);
        Ok(())
    }

    async fn complete(
        &self,
        base_url: &str,
        request: &CompleteRequest,
    ) -> Result<CompleteReply, ApiError> {
        let url = format!("{}/multipart/complete", base_url);
        let response = self.client.post(&url).json(request).send().await?;

        if response.status() == StatusCode::ACCEPTED {
            debug!("multipart/complete 返回 202，服务端仍在处理");
            return Ok(CompleteReply::Pending);
        }

        let response = ensure_success(response).await?;
        let text = response.text().await?;
        let file: StoredFile = serde_json::from_str(&text)
            .map_err(|e| ApiError::Decode(format!("{}: body={}", e, text)))?;

        info!("multipart/complete 成功: handle={}", file.handle);
        Ok(CompleteReply::Stored(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{StoreLocation, StoreParams};
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// 构造一个完整的 HTTP/1.1 响应
    fn http_response(status_line: &str, headers: &[(&str, &str)], body: &str) -> String {
        let mut response = format!("HTTP/1.1 {}\r\n", status_line);
        for (name, value) in headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }
        response.push_str(&format!(
            "content-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        ));
        response
    }

    /// 本地单次应答服务：返回基础地址和收到的原始请求
    async fn serve_once(response: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);

                let head_end = request.windows(4).position(|w| w == b"\r\n\r\n");
                if let Some(pos) = head_end {
                    let head = String::from_utf8_lossy(&request[..pos]).to_lowercase();
                    let body_len = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= pos + 4 + body_len {
                        break;
                    }
                }
            }

            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
            String::from_utf8_lossy(&request).to_string()
        });

        (format!("http://{}", addr), handle)
    }

    fn api(start_url: &str) -> FilestackApi {
        FilestackApi::new(&ApiConfig {
            start_url: start_url.to_string(),
            request_timeout_secs: 5,
            ..ApiConfig::default()
        })
        .unwrap()
    }

    fn slot(base: &str) -> UploadSlot {
        let mut headers = HashMap::new();
        headers.insert("x-amz-meta-part".to_string(), "1".to_string());
        UploadSlot {
            url: format!("{}/bucket/key?partNumber=1", base),
            headers,
        }
    }

    fn complete_request() -> CompleteRequest {
        CompleteRequest {
            apikey: "APIKEY".to_string(),
            filename: "a.bin".to_string(),
            mimetype: "application/octet-stream".to_string(),
            size: 3,
            uri: "/bucket/key".to_string(),
            region: "us-east-1".to_string(),
            upload_id: "upload-id".to_string(),
            store: StoreParams {
                location: "s3".to_string(),
                ..StoreParams::default()
            },
            parts: None,
            fii: Some(true),
            upload_tags: None,
            security: None,
        }
    }

    #[test]
    fn test_client_creation() {
        let api = FilestackApi::new(&ApiConfig::default());
        assert!(api.is_ok());
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(parse_retry_after(&headers), Some(3));

        // HTTP 日期格式不支持
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[tokio::test]
    async fn test_start_sends_client_headers() {
        let body = r#"{"uri":"/bucket/key","region":"us-east-1","upload_id":"id-1","location_url":"upload-eu.filestackapi.com"}"#;
        let (base, server) = serve_once(http_response("200 OK", &[], body)).await;

        let request = StartRequest {
            apikey: "APIKEY".to_string(),
            filename: "a.bin".to_string(),
            mimetype: "application/octet-stream".to_string(),
            size: 3,
            store: StoreParams {
                location: "s3".to_string(),
                ..StoreParams::default()
            },
            fii: None,
            security: None,
        };
        let handle = api(&format!("{}/multipart/start", base))
            .start(&request)
            .await
            .unwrap();
        assert_eq!(handle.upload_id, "id-1");
        assert_eq!(handle.location_url, "upload-eu.filestackapi.com");

        let raw = server.await.unwrap();
        let lower = raw.to_lowercase();
        assert!(lower.starts_with("post /multipart/start "));
        assert!(lower.contains(&format!("user-agent: filestack-rust {}", CLIENT_VERSION)));
        assert!(lower.contains(&format!("filestack-source: rust-{}", CLIENT_VERSION)));
        assert!(raw.contains(r#""apikey":"APIKEY""#));
        assert!(!raw.contains("fii"));
    }

    #[tokio::test]
    async fn test_put_chunk_returns_etag() {
        let response = http_response("200 OK", &[("etag", "\"d41d8cd9\"")], "");
        let (base, server) = serve_once(response).await;

        let etag = api("http://unused")
            .put_chunk(&slot(&base), b"abc".to_vec())
            .await
            .unwrap();
        assert_eq!(etag, "\"d41d8cd9\"");

        let raw = server.await.unwrap();
        let lower = raw.to_lowercase();
        assert!(lower.starts_with("put /bucket/key?partnumber=1 "));
        assert!(lower.contains("x-amz-meta-part: 1"));
        assert!(lower.contains("content-length: 3"));
        assert!(raw.ends_with("abc"));
    }

    #[tokio::test]
    async fn test_put_chunk_without_etag() {
        let (base, server) = serve_once(http_response("200 OK", &[], "")).await;

        let err = api("http://unused")
            .put_chunk(&slot(&base), b"abc".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::MissingEtag);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limited_carries_retry_after() {
        let response = http_response("429 Too Many Requests", &[("retry-after", "2")], "slow down");
        let (base, server) = serve_once(response).await;

        let request = UploadRequest {
            apikey: "APIKEY".to_string(),
            uri: "/bucket/key".to_string(),
            region: "us-east-1".to_string(),
            upload_id: "upload-id".to_string(),
            store: StoreLocation {
                location: "s3".to_string(),
            },
            part: 1,
            size: 3,
            md5: "kAFQmDzST7DWlj99KOF/cg==".to_string(),
            offset: Some(0),
            fii: Some(true),
        };
        let err = api("http://unused")
            .request_upload(&base, &request)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ApiError::Status {
                status: 429,
                body: "slow down".to_string(),
                retry_after: Some(2),
            }
        );
        assert!(err.kind().is_rate_limited());

        let raw = server.await.unwrap();
        assert!(raw.to_lowercase().starts_with("post /multipart/upload "));
        assert!(raw.contains(r#""fii":true"#));
    }

    #[tokio::test]
    async fn test_complete_status_mapping() {
        let (base, server) = serve_once(http_response("202 Accepted", &[], "{}")).await;
        let reply = api("http://unused")
            .complete(&base, &complete_request())
            .await
            .unwrap();
        assert_eq!(reply, CompleteReply::Pending);
        assert!(server
            .await
            .unwrap()
            .to_lowercase()
            .starts_with("post /multipart/complete "));

        let body = r#"{"handle":"HANDLE","url":"https://cdn.filestackcontent.com/HANDLE","size":3}"#;
        let (base, server) = serve_once(http_response("200 OK", &[], body)).await;
        match api("http://unused")
            .complete(&base, &complete_request())
            .await
            .unwrap()
        {
            CompleteReply::Stored(file) => {
                assert_eq!(file.handle, "HANDLE");
                assert_eq!(file.size, Some(3));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        server.await.unwrap();

        let (base, server) =
            serve_once(http_response("500 Internal Server Error", &[], "boom")).await;
        let err = api("http://unused")
            .complete(&base, &complete_request())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert!(matches!(err, ApiError::Status { ref body, .. } if body == "boom"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = api("http://unused")
            .commit(
                &base,
                &CommitRequest {
                    apikey: "APIKEY".to_string(),
                    uri: "/bucket/key".to_string(),
                    region: "us-east-1".to_string(),
                    upload_id: "upload-id".to_string(),
                    store: StoreLocation {
                        location: "s3".to_string(),
                    },
                    part: 1,
                    size: 3,
                },
            )
            .await
            .unwrap_err();
        assert!(err.kind().is_transport());
    }
}
