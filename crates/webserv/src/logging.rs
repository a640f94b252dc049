//! Logging initialization.
//!
//! Lines are formatted on the calling thread and handed to a dedicated
//! writer thread through a bounded queue. When the queue is full new lines
//! are dropped, so a slow disk or terminal never stalls a worker.
//!
//! The level is taken from `RUST_LOG` when set, else from [`LogConfig::level`]:
//!
//! ```bash
//! RUST_LOG=webserv=debug webserv --port 9006
//! ```

use crate::config::LogConfig;
use crate::error::{ServerError, ServerResult};
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_PREFIX: &str = "webserv.log";

/// Install the global subscriber.
///
/// The returned guard flushes queued lines when dropped; keep it alive for
/// as long as the process logs. Calling this twice is an error.
pub fn init_logging(config: &LogConfig) -> ServerResult<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ServerError::Config(format!("invalid log level `{}`: {}", config.level, e)))?;

    let builder = NonBlockingBuilder::default()
        .lossy(true)
        .buffered_lines_limit(config.queue_capacity.max(1))
        .thread_name("webserv-log");

    let (writer, guard, to_file) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = builder.finish(appender);
            (writer, guard, true)
        }
        None => {
            let (writer, guard) = builder.finish(std::io::stdout());
            (writer, guard, false)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(!to_file)
                .with_thread_names(true)
                .with_target(true),
        )
        .try_init()
        .map_err(|e| ServerError::Config(format!("logging already initialized: {}", e)))?;

    Ok(guard)
}
