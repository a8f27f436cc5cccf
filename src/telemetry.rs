//! Telemetry initialization.
//!
//! Controlled by `JVS_LOG`:
//! - unset → no-op (tracing disabled, zero overhead)
//! - `"json"` → JSON events to stderr
//! - any other value → human-readable compact output to stderr
//!
//! Event filtering follows the standard `RUST_LOG` syntax via `EnvFilter`,
//! defaulting to `info`.

use tracing_subscriber::EnvFilter;

/// Opaque guard returned by [`init`]. Hold it in the host program until
/// exit; dropping it is currently a no-op but keeps the door open for a
/// flushing exporter.
#[derive(Debug)]
pub struct TelemetryGuard {
    _private: (),
}

/// Initialize telemetry based on `JVS_LOG`.
///
/// Safe to call once per process; a second call leaves the first
/// subscriber installed.
#[must_use]
pub fn init() -> TelemetryGuard {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let mode = std::env::var("JVS_LOG").ok();
    let guard = TelemetryGuard { _private: () };

    let Some(mode) = mode.filter(|m| !m.is_empty()) else {
        return guard;
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if mode == "json" {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .try_init();
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_without_env_is_a_noop() {
        // JVS_LOG is not set in the test environment; init must not panic
        // and must not install a global subscriber.
        let _guard = init();
    }
}
