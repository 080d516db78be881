//! Tracing setup for processes embedding the scheduler.

use tracing_subscriber::EnvFilter;

/// Installs a global `fmt` subscriber driven by `filter` (e.g. `"kvscheduler=debug"`).
///
/// `RUST_LOG` takes precedence when set. Returns false if a global subscriber
/// was already installed, which makes the call safe to repeat from tests.
pub fn init_tracing(filter: &str, json: bool) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    if json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}
