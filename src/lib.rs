// Filestack Rust Library
// Filestack 分片上传客户端核心库

// 上传服务 API 模块
pub mod api;

// Filestack 客户端
pub mod client;

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 签名模块
pub mod security;

// 分片上传模块
pub mod uploader;

// 导出常用类型
pub use api::{ApiError, FilestackApi, StoredFile, UploadApi};
pub use client::FilestackClient;
pub use config::AppConfig;
pub use security::Security;
pub use uploader::{
    SessionOptions, SessionState, StoreOptions, UploadError, UploadMode, UploadSession,
    UploadStage, UploadTarget,
};
