//! tracing subscriber setup

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` is honoured; `meshkvd=info` (or `debug` when verbose) is added
/// on top. Returns false if a subscriber was already installed, which lets
/// embedders and tests call this repeatedly.
pub fn init_logging(format: &str, verbose: bool) -> bool {
    let level = if verbose { "debug" } else { "info" };
    let mut filter = EnvFilter::from_default_env();
    for crate_name in ["meshkvd", "meshkv_net", "meshkv_core"] {
        if let Ok(directive) = format!("{}={}", crate_name, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    let registry = tracing_subscriber::registry().with(filter);
    let result = if format == "json" {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    result.is_ok()
}
