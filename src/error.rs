// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Error kinds surfaced by the aggregation/caching layer.
///
/// Nothing in this crate retries a failed upstream call; retry policy
/// belongs to the `Transport` implementation.
#[derive(Debug, Error)]
pub enum Error {
    /// A request was missing required fields, carried an empty
    /// consumer/operation identity, or named a service the facade was
    /// not configured for.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The upstream `Transport` call failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A lifecycle method was called from a state that forbids it (e.g.
    /// `stop()` on an already-stopped facade).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The scheduler's background thread was interrupted and the
    /// facade transitioned to `Stopped`.
    #[error("interrupted")]
    Interrupted,
}

/// Convenience alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, Error>;
