//! Cross-cutting observability: tracing setup and metrics.

pub mod metrics;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `debug` widens the default filter so every emitted HAR datapoint is
/// logged; `RUST_LOG` still overrides everything.
pub fn init_tracing(debug: bool) {
    let default_filter = if debug {
        "har_proxy=debug,tower_http=debug"
    } else {
        "har_proxy=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
