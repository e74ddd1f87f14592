/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - RANDCALL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Serialize;

use crate::error::CoreError;
use crate::negotiation::ConnectionState;
use crate::session::SessionPhase;
use crate::transport::TransportMode;

fn now_ms_u64() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Actions the core can ask the UI to confirm before executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmAction {
    Skip,
}

/// What the core tells the embedding UI. Broadcast; slow subscribers lose
/// old events, never new ones.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallEventKind {
    Phase { phase: &'static str },
    MatchFound { username: String, match_type: Option<String> },
    TransportOpen { mode: &'static str },
    TransportDegraded,
    Connection { state: &'static str },
    ChatAppended { id: String },
    ChatConfirmed { id: String },
    ChatCleared,
    PeerLeft,
    ConfirmationRequired { action: ConfirmAction },
    Error { message: String },
    ErrorCleared,
}

#[derive(Clone, Debug, Serialize)]
pub struct CallEvent {
    #[serde(flatten)]
    pub kind: CallEventKind,
    pub ts_ms: u64,
}

impl CallEvent {
    pub fn new(kind: CallEventKind) -> Self {
        Self { kind, ts_ms: now_ms_u64() }
    }

    pub fn phase(phase: SessionPhase) -> Self {
        Self::new(CallEventKind::Phase { phase: phase.as_str() })
    }

    pub fn connection(state: ConnectionState) -> Self {
        Self::new(CallEventKind::Connection { state: state.as_str() })
    }

    pub fn transport_open(mode: TransportMode) -> Self {
        Self::new(CallEventKind::TransportOpen { mode: mode.as_str() })
    }

    pub fn error(e: &CoreError) -> Self {
        Self::new(CallEventKind::Error { message: e.to_string() })
    }
}
