//! Log setup for the `shipgate` binary.
//!
//! Everything is written to stderr; stdout is reserved for the attempt
//! record that `shipgate run` prints. Only the first [`init_tracing`] call
//! installs a subscriber.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter directives read before `RUST_LOG`, e.g. `shipgate_core=debug`.
pub const LOG_ENV: &str = "SHIPGATE_LOG";

/// Pick the filter directives: `SHIPGATE_LOG`, then `RUST_LOG`, then the
/// CLI level. Blank variables count as unset.
fn directives(shipgate_log: Option<String>, rust_log: Option<String>, level: Level) -> String {
    [shipgate_log, rust_log]
        .into_iter()
        .flatten()
        .find(|d| !d.trim().is_empty())
        .unwrap_or_else(|| level.as_str().to_ascii_lowercase())
}

/// Install the global subscriber, with line-delimited JSON output when `json`
/// is set. Unparseable directives fall back to `level`.
pub fn init_tracing(json: bool, level: Level) {
    let wanted = directives(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
        level,
    );
    let filter = EnvFilter::try_new(&wanted).unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    // A second call finds a subscriber already set.
    installed.ok();
}
