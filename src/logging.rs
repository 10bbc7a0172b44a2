//! Wire-level tracing for the receiver.
//!
//! Sessions emit one `tracing` event per protocol line under the
//! `mailslot::wire` target (`<<` for lines read, `>>` for replies written),
//! plus lifecycle events under `mailslot::session` and listener events under
//! `mailslot::server`, each carrying the peer address as a field. None of it
//! is load-bearing: the library behaves the same whether or not a subscriber
//! is installed.

use std::str::FromStr;

use tracing::Level;

/// Install a process-wide subscriber for the receiver's events.
///
/// The `MAILSLOT_LOG` environment variable selects the maximum level
/// (`error`, `warn`, `info`, `debug`, or `trace`); full wire transcripts
/// appear at `trace`. Embedders with their own subscriber should skip this
/// and filter on the `mailslot::` targets instead.
pub fn init() {
    let level = std::env::var("MAILSLOT_LOG")
        .ok()
        .and_then(|value| Level::from_str(value.trim()).ok())
        .unwrap_or(if cfg!(debug_assertions) {
            Level::DEBUG
        } else {
            Level::INFO
        });

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .compact()
        .init();
}
