/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - RANDCALL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use randcall_protocol::DecodeError;
use thiserror::Error;

/// Error taxonomy surfaced to the embedding UI. Errors with a documented
/// fallback (transport failover, candidate buffering, token refresh, backend
/// fallback) are recovered internally and never reach this type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Capture denied or absent. Fatal to call creation; recoverable by
    /// retrying after the permission grant.
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),

    /// `create_call` was issued before a local media handle was attached.
    #[error("local media must be attached before creating a call")]
    MediaRequired,

    /// Push/poll channel failure that had no remaining fallback.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Malformed signaling payload. Dropped and logged where possible; only
    /// surfaced when a caller handed the bad payload in directly.
    #[error("signal decode failed: {0}")]
    Decode(String),

    /// SDP or ICE application failure reported by the media capability.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// A negotiation call arrived after `teardown()`. Caller bug, not retried.
    #[error("negotiation engine is closed")]
    EngineClosed,

    /// Token refresh failed; local credentials were invalidated and the user
    /// must register again.
    #[error("credentials expired, re-registration required")]
    AuthExpired,

    /// Network failure on a REST call after the alternate backend address was
    /// also tried.
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    /// Backend answered with a non-retriable error status.
    #[error("backend rejected request: {status} {message}")]
    Rejected { status: u16, message: String },

    /// The core task is gone; every pending and future intent fails.
    #[error("call core is stopped")]
    CoreStopped,

    /// Intent issued in a session phase that does not permit it.
    #[error("operation {op} is not valid in phase {phase}")]
    InvalidTransition { op: &'static str, phase: &'static str },
}

impl From<DecodeError> for CoreError {
    fn from(e: DecodeError) -> Self {
        CoreError::Decode(e.to_string())
    }
}
