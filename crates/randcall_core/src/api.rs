/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - RANDCALL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Context;
use randcall_protocol::{
    CallInfo, ChatMessage, MatchResult, RefreshResponse, RegisterResponse, SignalEnvelope, User,
};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::http_retry::send_with_retry;

const RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
struct Tokens {
    access: String,
    refresh: String,
}

/// Backend REST client. Owns the credential pair; every authenticated call
/// carries the bearer token and recovers from exactly one 401 by refreshing
/// the access token and retrying. A second 401, or a failed refresh, clears
/// the credentials and surfaces `AuthExpired`.
pub struct ApiClient {
    http: reqwest::Client,
    bases: Vec<String>,
    ws_base: String,
    tokens: Mutex<Option<Tokens>>,
}

impl ApiClient {
    pub fn new(cfg: &CoreConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout())
            .build()
            .context("build http client")?;
        let mut bases = vec![cfg.api_base()];
        if let Some(fb) = cfg.fallback_api_base_url.as_ref() {
            let fb = fb.trim_end_matches('/').to_string();
            if !fb.is_empty() && fb != bases[0] {
                bases.push(fb);
            }
        }
        Ok(Self { http, bases, ws_base: cfg.ws_base(), tokens: Mutex::new(None) })
    }

    pub fn has_credentials(&self) -> bool {
        self.tokens.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    fn access_token(&self) -> Option<String> {
        self.tokens.lock().ok()?.as_ref().map(|t| t.access.clone())
    }

    fn refresh_token(&self) -> Option<String> {
        self.tokens.lock().ok()?.as_ref().map(|t| t.refresh.clone())
    }

    fn clear_tokens(&self) {
        if let Ok(mut guard) = self.tokens.lock() {
            *guard = None;
        }
    }

    fn set_access(&self, access: String) {
        if let Ok(mut guard) = self.tokens.lock() {
            if let Some(t) = guard.as_mut() {
                t.access = access;
            }
        }
    }

    /// Signaling websocket URL for one call, username escaped into the query.
    pub fn ws_url(&self, call_id: &str, username: &str) -> String {
        format!(
            "{}/ws/video_call/{}/?username={}",
            self.ws_base,
            call_id,
            urlencoding::encode(username)
        )
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        authed: bool,
    ) -> Result<T, CoreError> {
        let mut refreshed = false;
        let mut last_unreachable = String::new();
        loop {
            let bearer = if authed { self.access_token() } else { None };
            let mut sent = None;
            for (i, base) in self.bases.iter().enumerate() {
                let url = format!("{base}{path}");
                let result = send_with_retry(
                    || {
                        let mut req = self.http.request(method.clone(), &url);
                        if let Some(token) = bearer.as_ref() {
                            req = req.bearer_auth(token);
                        }
                        if let Some(b) = body.as_ref() {
                            req = req.json(b);
                        }
                        req
                    },
                    RETRY_ATTEMPTS,
                )
                .await;
                match result {
                    Ok(resp) => {
                        sent = Some(resp);
                        break;
                    }
                    Err(e) => {
                        if i + 1 < self.bases.len() {
                            warn!("{url} unreachable, trying fallback base: {e:#}");
                        }
                        last_unreachable = format!("{e:#}");
                    }
                }
            }
            let resp = match sent {
                Some(r) => r,
                None => return Err(CoreError::BackendUnreachable(last_unreachable)),
            };
            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && authed {
                if refreshed {
                    self.clear_tokens();
                    return Err(CoreError::AuthExpired);
                }
                self.refresh_access().await?;
                refreshed = true;
                continue;
            }
            if !status.is_success() {
                let message = resp.text().await.unwrap_or_default();
                let message = message.chars().take(300).collect();
                return Err(CoreError::Rejected { status: status.as_u16(), message });
            }
            return resp
                .json::<T>()
                .await
                .map_err(|e| CoreError::Decode(format!("response body: {e}")));
        }
    }

    /// Trades the refresh token for a new access token. On any failure the
    /// credential pair is dropped so the caller re-registers. Issues the
    /// request directly rather than through `request_json`, which calls back
    /// in here on a 401.
    async fn refresh_access(&self) -> Result<(), CoreError> {
        let refresh = match self.refresh_token() {
            Some(r) => r,
            None => return Err(CoreError::AuthExpired),
        };
        debug!("access token rejected, refreshing");
        let body = serde_json::json!({ "refresh": refresh });
        let mut failure = String::new();
        for base in &self.bases {
            let url = format!("{base}/api/token/refresh");
            let result =
                send_with_retry(|| self.http.post(&url).json(&body), RETRY_ATTEMPTS).await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    match resp.json::<RefreshResponse>().await {
                        Ok(r) => {
                            self.set_access(r.access);
                            return Ok(());
                        }
                        Err(e) => {
                            failure = format!("refresh body: {e}");
                            break;
                        }
                    }
                }
                Ok(resp) => {
                    failure = format!("refresh rejected: {}", resp.status());
                    break;
                }
                Err(e) => failure = format!("{e:#}"),
            }
        }
        warn!("token refresh failed: {failure}");
        self.clear_tokens();
        Err(CoreError::AuthExpired)
    }

    pub async fn register(&self, username: &str) -> Result<User, CoreError> {
        let out: RegisterResponse = self
            .request_json(
                Method::POST,
                "/api/v1/register",
                Some(serde_json::json!({ "username": username })),
                false,
            )
            .await?;
        if let Ok(mut guard) = self.tokens.lock() {
            *guard = Some(Tokens { access: out.access_token, refresh: out.refresh_token });
        }
        Ok(out.user)
    }

    pub async fn create_call(&self) -> Result<CallInfo, CoreError> {
        self.request_json(Method::POST, "/api/v1/call/create", Some(serde_json::json!({})), true)
            .await
    }

    pub async fn find_match(&self) -> Result<MatchResult, CoreError> {
        self.request_json(
            Method::POST,
            "/api/v1/call/find-match",
            Some(serde_json::json!({})),
            true,
        )
        .await
    }

    pub async fn skip_call(&self, call_id: &str) -> Result<(), CoreError> {
        let _: serde_json::Value = self
            .request_json(
                Method::POST,
                "/api/v1/call/skip",
                Some(serde_json::json!({ "call_id": call_id })),
                true,
            )
            .await?;
        Ok(())
    }

    pub async fn end_call(&self, call_id: &str) -> Result<(), CoreError> {
        let _: serde_json::Value = self
            .request_json(
                Method::POST,
                "/api/v1/call/end",
                Some(serde_json::json!({ "call_id": call_id })),
                true,
            )
            .await?;
        Ok(())
    }

    pub async fn send_message(&self, call_id: &str, message: &ChatMessage) -> Result<(), CoreError> {
        let body = serde_json::to_value(message)
            .map_err(|e| CoreError::Decode(format!("serialize chat message: {e}")))?;
        let _: serde_json::Value = self
            .request_json(
                Method::POST,
                &format!("/api/v1/call/{call_id}/messages/send"),
                Some(body),
                true,
            )
            .await?;
        Ok(())
    }

    pub async fn fetch_messages(&self, call_id: &str) -> Result<Vec<ChatMessage>, CoreError> {
        self.request_json(Method::GET, &format!("/api/v1/call/{call_id}/messages"), None, true)
            .await
    }

    pub async fn clear_messages(&self, call_id: &str) -> Result<(), CoreError> {
        let _: serde_json::Value = self
            .request_json(
                Method::POST,
                &format!("/api/v1/call/{call_id}/messages/clear"),
                Some(serde_json::json!({})),
                true,
            )
            .await?;
        Ok(())
    }

    pub async fn send_signal(
        &self,
        call_id: &str,
        envelope: &SignalEnvelope,
    ) -> Result<(), CoreError> {
        let body = serde_json::to_value(envelope)
            .map_err(|e| CoreError::Decode(format!("serialize signal: {e}")))?;
        let _: serde_json::Value = self
            .request_json(
                Method::POST,
                &format!("/api/v1/call/{call_id}/signal/send"),
                Some(body),
                true,
            )
            .await?;
        Ok(())
    }

    /// Drains the server-side signal queue for this call. The backend hands
    /// each envelope out once; re-polling returns only new arrivals.
    pub async fn poll_signals(&self, call_id: &str) -> Result<Vec<SignalEnvelope>, CoreError> {
        self.request_json(Method::GET, &format!("/api/v1/call/{call_id}/signal"), None, true)
            .await
    }
}
