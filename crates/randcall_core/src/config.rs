/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - RANDCALL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;

/// Startup configuration for one call core. Deserializable from JSON so the
/// FFI entry point can take a single config string.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CoreConfig {
    /// REST backend base, e.g. `https://calls.example`.
    #[serde(default, alias = "base_url")]
    pub api_base_url: String,
    /// Alternate backend base tried once when the primary is unreachable.
    #[serde(default)]
    pub fallback_api_base_url: Option<String>,
    /// Signaling websocket base. Inferred from `api_base_url` when unset.
    #[serde(default)]
    pub ws_base_url: Option<String>,
    /// Matchmaking/signal poll cadence (seconds).
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    /// How long the push channel may take to confirm open before the
    /// transport degrades to polling (seconds).
    #[serde(default)]
    pub failover_timeout_secs: Option<u64>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    /// STUN/TURN servers handed to the media capability.
    #[serde(default)]
    pub ice_urls: Option<Vec<String>>,
    #[serde(default)]
    pub ice_username: Option<String>,
    #[serde(default)]
    pub ice_credential: Option<String>,
    /// When true, `skip()` first returns a structured confirmation request
    /// instead of tearing the call down immediately.
    #[serde(default)]
    pub confirm_skip: Option<bool>,
    /// Bound on ICE candidates buffered before a remote description exists.
    #[serde(default)]
    pub candidate_buffer: Option<usize>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000".to_string(),
            fallback_api_base_url: None,
            ws_base_url: None,
            poll_interval_secs: None,
            failover_timeout_secs: None,
            http_timeout_secs: None,
            ice_urls: Some(vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ]),
            ice_username: None,
            ice_credential: None,
            confirm_skip: None,
            candidate_buffer: None,
        }
    }
}

impl CoreConfig {
    pub fn api_base(&self) -> String {
        self.api_base_url.trim_end_matches('/').to_string()
    }

    pub fn ws_base(&self) -> String {
        if let Some(ws) = self.ws_base_url.as_ref().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            return ws.trim_end_matches('/').to_string();
        }
        infer_ws_from_base(&self.api_base_url).unwrap_or_else(|| "ws://127.0.0.1:8000".to_string())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.unwrap_or(2).clamp(1, 30))
    }

    pub fn failover_timeout(&self) -> Duration {
        Duration::from_secs(self.failover_timeout_secs.unwrap_or(5).clamp(1, 60))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.unwrap_or(10).clamp(2, 120))
    }

    pub fn confirm_skip(&self) -> bool {
        self.confirm_skip.unwrap_or(false)
    }

    pub fn candidate_buffer(&self) -> usize {
        self.candidate_buffer.unwrap_or(32).clamp(4, 256)
    }
}

pub fn infer_ws_from_base(base: &str) -> Option<String> {
    let base = base.trim();
    if base.is_empty() {
        return None;
    }
    if let Some(rest) = base.strip_prefix("https://") {
        return Some(format!("wss://{}", rest.trim_end_matches('/')));
    }
    if let Some(rest) = base.strip_prefix("http://") {
        return Some(format!("ws://{}", rest.trim_end_matches('/')));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_base_inferred_from_api_base() {
        let cfg = CoreConfig {
            api_base_url: "https://calls.example/".to_string(),
            ..CoreConfig::default()
        };
        assert_eq!(cfg.ws_base(), "wss://calls.example");
    }

    #[test]
    fn explicit_ws_base_wins() {
        let cfg = CoreConfig {
            api_base_url: "https://calls.example".to_string(),
            ws_base_url: Some("wss://push.example/".to_string()),
            ..CoreConfig::default()
        };
        assert_eq!(cfg.ws_base(), "wss://push.example");
    }

    #[test]
    fn intervals_are_clamped() {
        let cfg = CoreConfig {
            poll_interval_secs: Some(0),
            failover_timeout_secs: Some(600),
            ..CoreConfig::default()
        };
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.failover_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn config_deserializes_from_minimal_json() {
        let cfg: CoreConfig = serde_json::from_str(r#"{"base_url":"http://10.0.0.2:8000"}"#).unwrap();
        assert_eq!(cfg.api_base(), "http://10.0.0.2:8000");
        assert_eq!(cfg.ws_base(), "ws://10.0.0.2:8000");
    }
}
