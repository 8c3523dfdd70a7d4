//! Process-wide logging setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "spdkctrl=info";

/// Install a `tracing` subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over `default_filter`. SPDK's own output
/// forwarded with `LogOutput::Tracing` uses the `spdk` target, so
/// `RUST_LOG=spdkctrl=info,spdk=info` shows both.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .is_ok()
}
