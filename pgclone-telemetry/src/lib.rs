//! Tracing initialization for pgclone binaries.

use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber.
///
/// Log levels come from `RUST_LOG` when set, otherwise from the `verbosity`
/// count mapped to info/debug/trace. Output is human-readable on a terminal
/// and compact single-line otherwise, so the tool stays greppable when its
/// stderr is redirected to a file.
pub fn init_tracing(verbosity: u8) {
    let default_directive = match verbosity {
        0 => "pgclone=info,warn",
        1 => "pgclone=debug,info",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if std::io::stderr().is_terminal() {
        builder.init();
    } else {
        builder.with_ansi(false).init();
    }
}
