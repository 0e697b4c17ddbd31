use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{env_bool, env_string};

/// Keeps the non-blocking file writer flushing until the process exits.
pub struct FileLogGuard {
    _guard: WorkerGuard,
}

pub fn file_logging_enabled() -> bool {
    env_bool("ENABLE_FILE_LOGS")
}

/// Installs the global subscriber. `process_name` picks the rolling file so
/// the API server and the AI worker never interleave in one log.
pub fn init_tracing(log_level: &str, process_name: &str) -> Option<FileLogGuard> {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(true);

    if file_logging_enabled() {
        let log_dir = env_string("LOG_DIR").unwrap_or_else(|| "./logs".to_string());
        match std::fs::create_dir_all(&log_dir) {
            Ok(()) => {
                let file_name = format!("{process_name}.log");
                let appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let file_layer = fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(stdout_layer)
                    .with(file_layer)
                    .init();

                return Some(FileLogGuard { _guard: guard });
            }
            Err(err) => eprintln!("cannot create log directory {log_dir}: {err}"),
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();

    None
}
