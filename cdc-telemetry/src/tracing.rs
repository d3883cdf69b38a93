use std::sync::Once;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static INIT_TEST_TRACING: Once = Once::new();

/// Installs the global tracing subscriber for an application.
///
/// The filter is read from `RUST_LOG` and falls back to `<app_name>=info` when the variable
/// is unset or invalid. Returns an error if a global subscriber was already installed.
pub fn init_tracing(app_name: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}=info", app_name.replace('-', "_"))));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
}

/// Installs a subscriber that writes through the test harness capture.
///
/// Safe to call from every test; only the first call installs the subscriber. Nothing is
/// logged unless `RUST_LOG` is set.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_test_tracing_is_idempotent() {
        init_test_tracing();
        init_test_tracing();
        ::tracing::info!("still alive");
    }
}
