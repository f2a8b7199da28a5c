use crate::config::lake_config::LoggingSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "clinic-lake-etl.log";

fn build_filter(level: &str, verbose: bool) -> EnvFilter {
    let default_directive = if verbose {
        "clinic_lake_etl=debug,info".to_string()
    } else {
        format!("clinic_lake_etl={},warn", level)
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// 初始化日誌：終端機 compact 輸出，可選每日輪替的 JSON 檔案
///
/// 回傳的 guard 必須存活到程式結束，否則檔案日誌不會 flush。
pub fn init_logging(settings: &LoggingSettings, verbose: bool) -> Option<WorkerGuard> {
    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let (file_layer, guard) = if settings.file_logging {
        if let Err(e) = std::fs::create_dir_all(&settings.log_dir) {
            eprintln!("⚠️ Cannot create log directory {}: {}", settings.log_dir, e);
            (None, None)
        } else {
            let appender = tracing_appender::rolling::daily(&settings.log_dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
    } else {
        (None, None)
    };

    let result = tracing_subscriber::registry()
        .with(build_filter(&settings.level, verbose))
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if let Err(e) = result {
        eprintln!("⚠️ Logger already initialised: {}", e);
    }

    guard
}

/// 只有終端機輸出，給小工具用
pub fn init_cli_logger(verbose: bool) {
    let settings = LoggingSettings {
        file_logging: false,
        ..LoggingSettings::default()
    };
    let _ = init_logging(&settings, verbose);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging_returns_guard() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = LoggingSettings {
            level: "info".to_string(),
            log_dir: dir.path().join("logs").to_string_lossy().to_string(),
            file_logging: true,
        };
        let guard = init_logging(&settings, false);
        assert!(guard.is_some());
        assert!(dir.path().join("logs").exists());
    }
}
