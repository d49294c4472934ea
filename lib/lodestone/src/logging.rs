pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Level, Logger};

/// Builds the default terminal logger. Output goes to stderr so the wire
/// protocol stream stays clean when the server is run under a pipe.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "info"
destination = "stderr"
"#,
    )
    .expect("Error parsing the default logging config");

    config
        .build_logger()
        .expect("Error constructing the terminal logger")
}

/// Root logger for tests. Swallows everything.
pub fn test() -> Logger {
    Logger::root(Discard, o!())
}
