//! Bootstrap utilities for the channel-transfer binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogType, LOG_ENV_VAR};

/// Initialize tracing with the `CHANNEL_TRANSFER_LOG` environment variable.
///
/// Falls back to `default_level` (the configured `log_level`) when the
/// variable is not set. `LogType::Json` emits one JSON object per event.
pub fn init_tracing(default_level: &str, log_type: LogType) {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    match log_type {
        LogType::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogType::Console => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Config path from `--config <path>` / `-c <path>` command line arguments.
pub fn parse_config_path() -> Option<String> {
    config_path_from_args(std::env::args().skip(1))
}

fn config_path_from_args(args: impl IntoIterator<Item = String>) -> Option<String> {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}
