//! Bootstrap utilities for ridewire binaries.
//!
//! Shared initialization code: logging, config path, broker connection.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bus::{connect_bus, MessageBus};
use crate::config::{MessagingConfig, LOG_ENV_VAR};
use crate::delivery::RetryPolicy;

/// Initialize tracing with the RIDEWIRE_LOG environment variable.
///
/// Defaults to "info" level if RIDEWIRE_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Value of `--config <path>` or `--config=<path>` on the command line.
pub fn parse_config_path() -> Option<String> {
    config_path_from_args(std::env::args().skip(1))
}

fn config_path_from_args(args: impl IntoIterator<Item = String>) -> Option<String> {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

/// Backoff for reaching the broker at startup.
///
/// - Initial delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Connect to the configured broker, retrying with `connection_backoff`.
///
/// Running out of attempts is fatal for the caller.
pub async fn connect_bus_with_retry(
    config: &MessagingConfig,
    policy: RetryPolicy,
) -> Result<Arc<dyn MessageBus>, Box<dyn std::error::Error + Send + Sync>> {
    let bus = (|| connect_bus(config, policy))
        .retry(connection_backoff())
        .notify(|err: &Box<dyn std::error::Error + Send + Sync>, dur: Duration| {
            warn!(error = %err, delay = ?dur, "Broker connection failed, retrying");
        })
        .await
        .inspect_err(|e| error!(error = %e, "Giving up on broker connection"))?;

    info!(messaging_type = ?config.messaging_type, "Connected to message bus");
    Ok(bus)
}
