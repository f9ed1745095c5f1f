// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Console logger behind the `log` facade.
//!
//! The crate logs exclusively through `log::debug!`/`warn!`/... with a
//! `[Component::method]` prefix; this module provides the minimal sink so
//! binaries, benches and examples can see that output without pulling in
//! a heavier subscriber. Initialization is one-shot; later calls are
//! ignored.

use log::{Level, LevelFilter, Metadata, Record};
use std::io::Write;
use std::sync::OnceLock;

static LOGGER: OnceLock<ConsoleLogger> = OnceLock::new();

/// Minimal stderr logger with a level filter.
struct ConsoleLogger {
    level: Level,
}

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Single write per record so concurrent workers do not interleave.
        let mut line = String::with_capacity(96);
        use std::fmt::Write as _;
        let _ = write!(
            line,
            "[{:5}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
        let _ = std::io::stderr().write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the console logger at the given maximum level.
///
/// Call early in startup, before the first log macro. Only the first call
/// has any effect; subsequent calls (including from parallel tests) are
/// no-ops.
pub fn init(level: Level) {
    let logger = LOGGER.get_or_init(|| ConsoleLogger { level });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(level.to_level_filter());
    }
}
