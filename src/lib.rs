pub mod aggregator;
pub mod alerts;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod instrument;
pub mod metrics;
pub mod monitor;
pub mod progress;
pub mod retry;
pub mod store;

pub use error::{MonitorError, Result};
pub use monitor::{Monitor, MonitorOptions, MonitorStatus};

use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Handle used to change the active log filter at runtime
pub type LogLevelHandle = reload::Handle<EnvFilter, Registry>;

/// Initialize tracing/logging
///
/// `RUST_LOG` wins over `level` when set. The returned handle lets the
/// monitor follow `logLevel` changes on config reload. Only the first call
/// installs the global subscriber; later calls still return a working handle
/// for a subscriber that is simply not installed.
pub fn init_tracing(level: &str, json: bool) -> LogLevelHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter, handle) = reload::Layer::new(filter);

    let text_layer = (!json).then(|| fmt::layer().with_target(true));
    let json_layer = json.then(|| fmt::layer().json().with_target(true));

    if tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }

    handle
}

/// Swap the active log filter, e.g. `"debug"` or `"callwatch=trace,info"`
pub fn set_log_level(handle: &LogLevelHandle, level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| MonitorError::ConfigValidation(format!("invalid logLevel '{}': {}", level, e)))?;
    handle
        .reload(filter)
        .map_err(|e| MonitorError::ConfigValidation(format!("cannot apply logLevel: {}", e)))?;
    Ok(())
}
