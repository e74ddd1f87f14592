/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - RANDCALL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rand::rngs::OsRng;
use rand::RngCore;
use randcall_protocol::ChatMessage;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// What an inbound message did to the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAppend {
    Appended,
    /// Echo of our own pending message; it is now confirmed.
    Confirmed,
    Duplicate,
}

/// One message in the call-scoped history, with its delivery status.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatEntry {
    pub message: ChatMessage,
    /// True until the backend (or the push channel) acknowledged delivery.
    pub pending: bool,
}

/// In-memory chat history for the current call. Ordered by arrival, keyed by
/// message id for confirmation and echo merging. Cleared wholesale whenever
/// the call ends.
#[derive(Debug, Default)]
pub struct ChatRelay {
    entries: Vec<ChatEntry>,
}

impl ChatRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    /// Records an outbound message as pending and returns it for dispatch.
    pub fn append_local(&mut self, sender: &str, content: &str) -> ChatMessage {
        let message = ChatMessage {
            id: random_id(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: now_rfc3339(),
        };
        self.entries.push(ChatEntry { message: message.clone(), pending: true });
        message
    }

    /// Marks a pending message delivered. True only when the entry actually
    /// flipped; unknown ids and already-confirmed entries return false.
    pub fn confirm(&mut self, id: &str) -> bool {
        for entry in self.entries.iter_mut() {
            if entry.message.id == id {
                let was_pending = entry.pending;
                entry.pending = false;
                return was_pending;
            }
        }
        false
    }

    /// Appends a message received from the peer or from a history poll.
    /// An echo of our own pending message confirms it instead of duplicating.
    pub fn append_remote(&mut self, message: ChatMessage) -> RemoteAppend {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.message.id == message.id) {
            if entry.pending {
                entry.pending = false;
                return RemoteAppend::Confirmed;
            }
            return RemoteAppend::Duplicate;
        }
        self.entries.push(ChatEntry { message, pending: false });
        RemoteAppend::Appended
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

fn random_id() -> String {
    format!("{:016x}", OsRng.next_u64())
}
