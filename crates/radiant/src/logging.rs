//! Logging setup for the `radiant` binary.
//!
//! Logs go to stderr so stdout stays free for epoch reports and AUCs.
//! `RUST_LOG` overrides the configured level.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber at `level` (`error` .. `trace`), pretty or
/// JSON.
pub fn init(level: &str, json_format: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Initialize from the `[logging]` section; `--verbose` raises the level to
/// at least debug and `--json-logs` forces JSON.
pub fn init_from_config(config: &radiant_core::Config, verbose: bool, json_logs: bool) {
    init(
        effective_level(&config.logging.level, verbose),
        json_logs || config.logging.format == "json",
    );
}

fn effective_level(configured: &str, verbose: bool) -> &str {
    match (verbose, configured) {
        (true, "trace") => "trace",
        (true, _) => "debug",
        (false, level) => level,
    }
}
