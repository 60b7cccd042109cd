//! Thin facade over the `slog` ecosystem so downstream crates can say
//! `use flint::logging;` and get the full vocabulary in one place.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

/// Builds the process-wide terminal logger.
///
/// The configuration is kept inline for now; services that want their own
/// sink can build one with `sloggers` directly and hand it down.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Embedded logger configuration must parse");

    config.build_logger().expect("Error building terminal logger")
}

/// A logger that swallows everything. Used by tests and as the fallback when
/// a component is constructed without a parent logger.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
