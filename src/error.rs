// Copyright (c) 2026 The io-plumbing Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Error taxonomy for the plumbing library.
//!
//! Only faults of the *parent* are surfaced as `Err`. A child that exits
//! non-zero or dies on a signal is not an error here: it is reported
//! through `Stage::rc()` / `Stage::error()` once the stage is reaped, and
//! a child that vanished under a foreign wait is reported as status
//! `Lost`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A link would violate a fitting's orientation rule, an option is
    /// out of range, or an unquotable byte appeared in a would-be argv
    /// entry.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// `unquote` was given malformed input.
    #[error("parse error: {0}")]
    Parse(String),

    /// fork, pipe, or a device open failed.
    #[error("{context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: nix::Error,
    },

    /// A file operation on behalf of a stage failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A user-supplied hook refused to let execution proceed.
    #[error("{context} hook failed: {cause:#}")]
    Hook {
        context: &'static str,
        cause: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
