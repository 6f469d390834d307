// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tracing subscriber setup for the binaries.

use tracing_subscriber::EnvFilter;

/// Filter directive for a repeatable `--verbose` count.
pub fn verbosity_directive(verbose: u8) -> String {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    format!("beat_core={level},beat_protocol={level}")
}

/// Initialise logging to stderr. `RUST_LOG` wins over `verbose`.
///
/// Job processes write their outcome to stdout, so logs never go there.
pub fn init(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_directive(verbose)));
    // Ignore a subscriber installed earlier (tests).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(verbosity_directive(0), "beat_core=warn,beat_protocol=warn");
        assert_eq!(verbosity_directive(1), "beat_core=info,beat_protocol=info");
        assert_eq!(verbosity_directive(2), "beat_core=debug,beat_protocol=debug");
        assert_eq!(verbosity_directive(7), "beat_core=trace,beat_protocol=trace");
    }
}
