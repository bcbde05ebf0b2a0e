//! Logging initialization for the CLI.
//!
//! Library crates only emit `tracing` events; the binary decides where they
//! go. Both formats write to stderr so stdout stays free for command output.

use tracing::Level;
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber.
///
/// # Arguments
/// * `verbosity` - 0 = INFO, 1 = DEBUG, 2+ = TRACE
/// * `json` - If true, output JSON lines to stderr
///
/// JSON output format:
/// ```json
/// {"timestamp":"...","level":"INFO","fields":{"message":"...","url":"/src/main.js"},"target":"hotwire_core::session"}
/// ```
pub fn init(verbosity: u8, json: bool) {
    let level = level_for(verbosity);

    // RUST_LOG wins for everything the flag does not name
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    for directive in crate_directives(level) {
        filter = filter.add_directive(directive);
    }

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn crate_directives(level: Level) -> Vec<Directive> {
    ["hotwire", "hotwire_core", "hotwire_cli"]
        .iter()
        .filter_map(|target| format!("{target}={level}").parse().ok())
        .collect()
}
