use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Directive used when neither `RUST_LOG` nor an explicit filter is given.
pub const DEFAULT_FILTER: &str = "reclaim=info,reclaim_runtime=info";

/// Install the process-wide tracing subscriber.
///
/// `RUST_LOG` wins over `filter`, which wins over [`DEFAULT_FILTER`]. Only the
/// first call has any effect; later calls are ignored so tests and the CLI can
/// both call this unconditionally.
pub fn init_logging(filter: Option<&str>) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(filter.unwrap_or(DEFAULT_FILTER)));

        // try_init: a test harness may already have installed a subscriber
        let _ = fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_names(true)
            .compact()
            .try_init();
    });
}

/// Whether [`init_logging`] has run in this process.
pub fn is_initialized() -> bool {
    INIT.is_completed()
}
