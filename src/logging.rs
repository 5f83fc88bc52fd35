//! 日志系统配置
//!
//! 控制台输出 + 可选的按天滚动日志文件，自动清理过期日志

use crate::config::LogConfig;
use chrono::Local;
use std::fs;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀，滚动后的文件名为 `filestack-uploader.log.YYYY-MM-DD`
const LOG_FILE_PREFIX: &str = "filestack-uploader.log";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// 环境变量 `RUST_LOG` 优先于配置中的级别；重复初始化时保留已有的订阅器
///
/// # Arguments
/// * `config` - 日志配置
///
/// # Returns
/// * `LogGuard` - 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(true);

    if !config.enabled {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    }

    if let Err(e) = fs::create_dir_all(&config.log_dir) {
        eprintln!("创建日志目录失败: {:?}, 错误: {}", config.log_dir, e);
        // 回退到只使用控制台输出
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init();
        return LogGuard { _file_guard: None };
    }

    let appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
    let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);

    // 文件输出层（不带 ANSI 颜色）
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}",
        config.log_dir, config.retention_days, config.level
    );

    let deleted = cleanup_old_logs(&config.log_dir, config.retention_days);
    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 清理过期日志文件，返回删除的文件数
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(i64::from(retention_days));

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let date = match path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(extract_date_from_filename)
        {
            Some(date) => date,
            None => continue,
        };

        if today.signed_duration_since(date) > retention {
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    tracing::debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }
    deleted
}

/// 从 `filestack-uploader.log.YYYY-MM-DD` 中提取日期
fn extract_date_from_filename(filename: &str) -> Option<chrono::NaiveDate> {
    let date = filename.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}
