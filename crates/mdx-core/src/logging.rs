//! Logging initialization using the `tracing` ecosystem.
//!
//! Console output is always on. When a log directory is given, a second layer
//! writes plain-text lines to a daily-rotating file through the non-blocking
//! appender worker. `RUST_LOG` overrides the level passed in.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
///
/// Call once at program start. The returned guard flushes the file writer when
/// dropped, so the caller keeps it alive until shutdown.
///
/// # Parameters
///
/// - `log_level`: default filter if `RUST_LOG` is not set (e.g. `"info"`)
/// - `log_dir`: optional directory for daily-rotating log files
/// - `module_name`: log file prefix (e.g. `"mdx_pub"`)
pub fn init_logging(log_level: &str, log_dir: Option<&str>, module_name: &str) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let console_layer = fmt::layer().with_target(true).with_thread_names(true).with_ansi(true);

    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, format!("{module_name}.log"));
            let (writer, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer =
                fmt::layer().with_writer(writer).with_ansi(false).with_target(true).with_thread_names(true);

            tracing_subscriber::registry().with(env_filter).with(console_layer).with(file_layer).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(env_filter).with(console_layer).init();
            None
        }
    }
}
