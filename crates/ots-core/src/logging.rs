//! Tracing setup shared by the binaries

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Resolve the filter directive: `RUST_LOG` wins, `--foreground` forces debug
pub fn filter_directive(log_level: &str, foreground: bool) -> String {
    let level = if foreground { "debug" } else { log_level };
    std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string())
}

/// Initialize logging to stderr
///
/// Stdout is left untouched so the public key line printed at startup can
/// be captured by scripts.
pub fn init_logging(log_level: &str, foreground: bool) {
    let directive = filter_directive(log_level, foreground);

    let result = tracing_subscriber::registry()
        .with(EnvFilter::new(directive))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();

    if let Err(e) = result {
        eprintln!("logging already initialized: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreground_forces_debug() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert_eq!(filter_directive("warn", true), "debug");
        assert_eq!(filter_directive("warn", false), "warn");
    }
}
