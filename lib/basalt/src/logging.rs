pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the default terminal logger. Binaries and long-running examples
/// should pass the result down to the streaming objects they create.
pub fn terminal() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building terminal logger")
}

/// Logger that drops every record. Used whenever the caller does not supply
/// a logger of their own.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
