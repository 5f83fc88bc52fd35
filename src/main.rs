use anyhow::Context;
use clap::Parser;
use filestack_uploader::{config::AppConfig, logging, FilestackClient, StoreOptions};
use std::path::{Path, PathBuf};
use tracing::info;

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 覆盖配置文件中 apikey 的环境变量
const APIKEY_ENV: &str = "FILESTACK_APIKEY";

/// Filestack 分片上传工具
#[derive(Debug, Parser)]
#[command(name = "filestack-uploader", version, about = "Filestack 分片上传工具")]
struct Args {
    /// 要上传的文件
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// 使用智能上传（FII）
    #[arg(long)]
    intelligent: bool,

    /// 配置文件路径
    #[arg(long, value_name = "PATH")]
    config: Option<String>,
}

/// 加载配置，未指定且默认文件不存在时使用默认配置
async fn load_config(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let mut config = match path {
        Some(path) => AppConfig::load_from_file(path)
            .await
            .with_context(|| format!("加载配置文件失败: {}", path))?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            AppConfig::load_from_file(DEFAULT_CONFIG_PATH).await?
        }
        None => AppConfig::default(),
    };

    if let Ok(apikey) = std::env::var(APIKEY_ENV) {
        if !apikey.trim().is_empty() {
            config.api.apikey = apikey;
        }
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref()).await?;

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!(
        "filestack-uploader v{} 启动: file={:?}, intelligent={}",
        env!("CARGO_PKG_VERSION"),
        args.file,
        args.intelligent
    );

    let intelligent = args.intelligent || config.upload.intelligent;
    if intelligent && !args.intelligent {
        info!("配置文件启用了智能上传");
    }

    let client = FilestackClient::new(&config)?;
    let file = client
        .upload_file(&args.file, StoreOptions::new(), intelligent)
        .await
        .with_context(|| format!("上传失败: {:?}", args.file))?;

    println!("{}", file.cdn_url());
    Ok(())
}
