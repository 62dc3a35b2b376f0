// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! tracing setup for the CLI. Log lines go to stderr so they never mix with
//! the progress display on stdout.

use tracing::Level;

/// Parse a level name, falling back to `WARN` for anything unrecognised.
pub fn parse_level(name: &str) -> Level {
    name.trim().parse::<Level>().unwrap_or(Level::WARN)
}

/// Install the global fmt subscriber. Later calls are ignored.
pub fn init_logging(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level(" INFO "), Level::INFO);
        assert_eq!(parse_level("loud"), Level::WARN);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging("info");
        init_logging("trace");
    }
}
