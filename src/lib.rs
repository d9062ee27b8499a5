// Copyright (c) 2026 The io-plumbing Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Build and run process pipelines as first-class values.
//!
//! A pipeline is a graph of [`Stage`]s: external commands, in-process
//! code, and non-forking fittings (plug, vent, bucket, hose, prng)
//! linked through input, output and stderr slots. Nothing happens at
//! link time; the first observing call (`execute`, `wait`, `ok`,
//! `contents`, `getline`) acquires the pipes, forks the children and
//! collects the results.
//!
//! ```no_run
//! use io_plumbing::{plumb, Stage};
//!
//! # fn main() -> io_plumbing::Result<()> {
//! let sed = plumb("sed s/cat/dog/")?;
//! sed.input(Stage::bucket_from("one cat\n"))?;
//! let out = sed.terminus().contents()?;
//! assert_eq!(out, b"one dog\n".to_vec());
//! # Ok(())
//! # }
//! ```
//!
//! The library orchestrates from a single thread in the parent;
//! concurrency between stages comes from the kernel scheduling the
//! children and from pipe buffering. Stages are reference-counted
//! handles and deliberately not `Send`.

#[macro_use]
extern crate lazy_static;

use slog::{o, Drain};

mod error;
mod executor;
mod fitting;
mod pipestream;
mod plumbing;
mod shellwords;
mod stage;

pub use error::{Error, Result};
pub use executor::reap;
pub use nix::sys::signal::Signal;
pub use shellwords::{quote, unquote};
pub use stage::{Callable, Connector, Stage, Status};

/// Debug tracing knob: unset or 0 is silent, 1 prints fork and plumb
/// events to stderr, 2 and up adds per-descriptor events.
pub const DEBUG_ENV: &str = "IO_PLUMBING_DEBUG";

/// The current value of [`DEBUG_ENV`].
pub fn debug_level() -> u32 {
    std::env::var(DEBUG_ENV)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

lazy_static! {
    static ref ROOT_LOGGER: slog::Logger = default_logger();
}

pub(crate) fn root_logger() -> slog::Logger {
    ROOT_LOGGER.clone()
}

fn default_logger() -> slog::Logger {
    let level = match debug_level() {
        0 => return slog::Logger::root(slog::Discard, o!()),
        1 => slog::Level::Debug,
        _ => slog::Level::Trace,
    };
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    slog::Logger::root(drain, o!("lib" => "io-plumbing"))
}

/// Shortcut constructor: an external-command stage from a command line.
pub fn plumb(line: &str) -> Result<Stage> {
    Stage::command(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_level_defaults_off() {
        // The test environment does not set the knob.
        if std::env::var(DEBUG_ENV).is_err() {
            assert_eq!(debug_level(), 0);
        }
    }

    #[test]
    fn test_plumb_shortcut() {
        let s = plumb("cat -e").unwrap();
        assert_eq!(s.name(), "`cat -e`");
    }
}
