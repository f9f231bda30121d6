//! Test-only helpers shared across module test suites.

use slog::{Discard, Logger};

pub fn null_logger() -> Logger {
    Logger::root(Discard, slog::o!())
}
