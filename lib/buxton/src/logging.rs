//! Thin wrapper around slog so call-sites read `logging::debug!(...)` and
//! logger construction stays in one place.

use sloggers::{Config, LoggerConfig};

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

/// Construct the root terminal logger for a process. The `level` must be
/// one of the sloggers severity names (`trace`, `debug`, `info`, ...).
pub fn init(level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("logger config must parse");

    config.build_logger().expect("logger construction failed")
}

/// A logger that discards everything. Components take `Option<&Logger>`
/// and fall back to this when run without logging, e.g. in tests.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Resolve an optional parent logger into a child or a discard logger.
pub fn child<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => discard(),
    }
}
