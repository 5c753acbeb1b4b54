pub mod correct;
pub mod eta;
pub mod run;
pub mod sidecar;

use serde_json::Value;

/// Log to stderr at `info` unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();
}

/// Parse a command-line value as JSON, or keep it as a string when it is not
/// valid JSON (`j-` stays a string, `0.05` becomes a number, `[]` a list).
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Print an error and exit with status 1.
pub fn fail(context: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("Error: {context}: {err}");
    std::process::exit(1);
}
