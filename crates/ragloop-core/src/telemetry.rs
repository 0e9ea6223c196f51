use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt};

use crate::RagLoopError;

static TELEMETRY_GUARD: OnceLock<()> = OnceLock::new();

/// Configuration options when initialising telemetry.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    pub env_filter: Option<String>,
    pub with_ansi: bool,
    pub with_target: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            env_filter: None,
            with_ansi: true,
            with_target: false,
        }
    }
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured filter. Safe to call multiple times;
/// only the first invocation installs the subscriber.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), RagLoopError> {
    if TELEMETRY_GUARD.get().is_some() {
        return Ok(());
    }

    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or(options.env_filter)
        .unwrap_or_else(|| "info".to_string());

    fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_ansi(options.with_ansi)
        .with_target(options.with_target)
        .try_init()
        .map_err(|err| RagLoopError::InvalidConfiguration(format!("telemetry init failed: {err}")))?;

    TELEMETRY_GUARD.get_or_init(|| ());
    Ok(())
}
