// 上传目标描述
//
// 每次上传调用创建一次，之后只读

use crate::api::{StoreLocation, StoreParams};
use crate::security::Security;
use crate::uploader::error::UploadError;
use crate::uploader::source::ChunkSource;
use std::collections::BTreeMap;
use std::path::Path;

/// 内存上传未指定文件名时使用
pub const DEFAULT_FILENAME: &str = "unnamed_file";

/// 无法识别扩展名时的 MIME 类型
pub const DEFAULT_MIMETYPE: &str = "application/octet-stream";

/// 支持的存储后端
pub const STORAGE_LOCATIONS: &[&str] = &["s3", "gcs", "azure", "rackspace", "dropbox"];

/// 支持的访问权限
pub const ACCESS_VALUES: &[&str] = &["public", "private"];

/// 常见扩展名对应的 MIME 类型
const MIME_TABLE: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("csv", "text/csv"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("doc", "application/msword"),
    (
        "docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    ("xls", "application/vnd.ms-excel"),
    (
        "xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("ico", "image/x-icon"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/x-wav"),
    ("ogg", "audio/ogg"),
    ("mp4", "video/mp4"),
    ("m4v", "video/x-m4v"),
    ("mov", "video/quicktime"),
    ("avi", "video/x-msvideo"),
    ("webm", "video/webm"),
    ("mkv", "video/x-matroska"),
];

/// 根据文件扩展名猜测 MIME 类型
pub fn guess_mimetype(filename: &str) -> &'static str {
    let ext = match Path::new(filename).extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.to_ascii_lowercase(),
        None => return DEFAULT_MIMETYPE,
    };
    MIME_TABLE
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
        .unwrap_or(DEFAULT_MIMETYPE)
}

/// 调用方可指定的上传参数
///
/// `None` 表示不出现在请求中
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreOptions {
    pub filename: Option<String>,
    pub mimetype: Option<String>,
    /// 存储后端，覆盖客户端默认值
    pub location: Option<String>,
    pub path: Option<String>,
    pub container: Option<String>,
    pub region: Option<String>,
    pub access: Option<String>,
    pub base64decode: Option<bool>,
    /// 上传完成后触发的工作流 ID（保持顺序）
    pub workflows: Option<Vec<String>>,
    pub upload_tags: Option<BTreeMap<String, String>>,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = Some(mimetype.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_access(mut self, access: impl Into<String>) -> Self {
        self.access = Some(access.into());
        self
    }

    pub fn with_base64decode(mut self, base64decode: bool) -> Self {
        self.base64decode = Some(base64decode);
        self
    }

    pub fn with_workflows<I, S>(mut self, workflows: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.workflows = Some(workflows.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_upload_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.upload_tags
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// 校验取值范围
    pub fn validate(&self) -> Result<(), UploadError> {
        if let Some(location) = &self.location {
            validate_location(location)?;
        }
        if let Some(access) = &self.access {
            if !ACCESS_VALUES.contains(&access.as_str()) {
                return Err(UploadError::InvalidTarget(format!(
                    "access 只能是 public 或 private: {}",
                    access
                )));
            }
        }
        if let Some(filename) = &self.filename {
            if filename.trim().is_empty() {
                return Err(UploadError::InvalidTarget("filename 不能为空".to_string()));
            }
        }
        Ok(())
    }
}

fn validate_location(location: &str) -> Result<(), UploadError> {
    if STORAGE_LOCATIONS.contains(&location.to_ascii_lowercase().as_str()) {
        Ok(())
    } else {
        Err(UploadError::InvalidTarget(format!(
            "不支持的存储后端: {}",
            location
        )))
    }
}

/// 上传目标
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub source: ChunkSource,
    /// 文件总大小
    pub size: u64,
    pub filename: String,
    pub mimetype: String,
    /// 存储后端
    pub storage: String,
    pub options: StoreOptions,
    pub security: Option<Security>,
}

impl UploadTarget {
    /// 上传本地文件
    ///
    /// 文件名默认取路径中的文件名，大小取自文件元数据
    pub async fn from_file(
        path: impl AsRef<Path>,
        storage: &str,
        options: StoreOptions,
        security: Option<Security>,
    ) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(UploadError::InvalidTarget(format!(
                "不是普通文件: {:?}",
                path
            )));
        }

        let default_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(DEFAULT_FILENAME)
            .to_string();

        let guessed = guess_mimetype(&path.to_string_lossy());

        Self::build(
            ChunkSource::from_path(path),
            metadata.len(),
            default_name,
            guessed,
            storage,
            options,
            security,
        )
    }

    /// 上传内存中的数据
    pub fn from_bytes(
        data: Vec<u8>,
        storage: &str,
        options: StoreOptions,
        security: Option<Security>,
    ) -> Result<Self, UploadError> {
        let size = data.len() as u64;
        Self::build(
            ChunkSource::from_bytes(data),
            size,
            DEFAULT_FILENAME.to_string(),
            DEFAULT_MIMETYPE,
            storage,
            options,
            security,
        )
    }

    fn build(
        source: ChunkSource,
        size: u64,
        default_name: String,
        default_mimetype: &str,
        storage: &str,
        options: StoreOptions,
        security: Option<Security>,
    ) -> Result<Self, UploadError> {
        options.validate()?;

        let storage = options
            .location
            .clone()
            .unwrap_or_else(|| storage.to_string());
        validate_location(&storage)?;

        let filename = options.filename.clone().unwrap_or(default_name);
        let mimetype = options
            .mimetype
            .clone()
            .unwrap_or_else(|| default_mimetype.to_string());

        Ok(Self {
            source,
            size,
            filename,
            mimetype,
            storage,
            options,
            security,
        })
    }

    /// start / complete 请求中的 store 对象
    ///
    /// 工作流只在 complete 中出现
    pub fn store_params(&self, include_workflows: bool) -> StoreParams {
        StoreParams {
            location: self.storage.clone(),
            path: self.options.path.clone(),
            container: self.options.container.clone(),
            region: self.options.region.clone(),
            access: self.options.access.clone(),
            base64decode: self.options.base64decode,
            workflows: if include_workflows {
                self.options.workflows.clone()
            } else {
                None
            },
        }
    }

    /// 分片与 commit 请求中的 store 对象
    pub fn store_location(&self) -> StoreLocation {
        StoreLocation {
            location: self.storage.clone(),
        }
    }
}
