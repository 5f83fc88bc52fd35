// Filestack 客户端
//
// 持有 apikey、默认存储后端与签名，为每次上传构建 UploadTarget 并运行会话

use crate::api::{FilestackApi, StoredFile, UploadApi};
use crate::config::{AppConfig, UploadConfig};
use crate::security::Security;
use crate::uploader::{
    SessionOptions, StoreOptions, UploadError, UploadMode, UploadSession, UploadTarget,
};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Filestack 客户端
#[derive(Clone)]
pub struct FilestackClient {
    apikey: String,
    /// 默认存储后端
    storage: String,
    security: Option<Security>,
    upload: UploadConfig,
    api: Arc<dyn UploadApi>,
}

impl FilestackClient {
    /// 根据配置创建客户端
    pub fn new(config: &AppConfig) -> Result<Self> {
        if config.api.apikey.trim().is_empty() {
            anyhow::bail!("未配置 apikey");
        }
        config
            .upload
            .validate()
            .context("上传参数验证失败")?;

        let security = match &config.api.security {
            Some(security) => Some(security.to_security()?),
            None => None,
        };
        let api = FilestackApi::new(&config.api).context("创建上传服务客户端失败")?;

        info!(
            "创建 Filestack 客户端: storage={}, 签名={}",
            config.upload.storage,
            security.is_some()
        );

        Ok(Self {
            apikey: config.api.apikey.clone(),
            storage: config.upload.storage.clone(),
            security,
            upload: config.upload.clone(),
            api: Arc::new(api),
        })
    }

    /// 使用自定义的上传服务实现
    pub fn with_api(apikey: impl Into<String>, api: Arc<dyn UploadApi>, upload: UploadConfig) -> Self {
        Self {
            apikey: apikey.into(),
            storage: upload.storage.clone(),
            security: None,
            upload,
            api,
        }
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = Some(security);
        self
    }

    pub fn with_storage(mut self, storage: impl Into<String>) -> Self {
        self.storage = storage.into();
        self
    }

    pub fn apikey(&self) -> &str {
        &self.apikey
    }

    pub fn storage(&self) -> &str {
        &self.storage
    }

    pub fn security(&self) -> Option<&Security> {
        self.security.as_ref()
    }

    /// 为上传目标创建会话（需要读取进度或取消时使用）
    pub fn session(&self, target: UploadTarget, intelligent: bool) -> UploadSession {
        let options = SessionOptions::from_config(&self.upload, UploadMode::from_flag(intelligent));
        UploadSession::new(self.api.clone(), self.apikey.clone(), target, options)
    }

    /// 上传本地文件
    pub async fn upload_file(
        &self,
        path: impl AsRef<Path>,
        options: StoreOptions,
        intelligent: bool,
    ) -> Result<StoredFile, UploadError> {
        let target =
            UploadTarget::from_file(path, &self.storage, options, self.security.clone()).await?;
        self.session(target, intelligent).run().await
    }

    /// 上传内存中的数据
    pub async fn upload_bytes(
        &self,
        data: Vec<u8>,
        options: StoreOptions,
        intelligent: bool,
    ) -> Result<StoredFile, UploadError> {
        let target = UploadTarget::from_bytes(data, &self.storage, options, self.security.clone())?;
        self.session(target, intelligent).run().await
    }
}
