/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - RANDCALL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use rand::{thread_rng, Rng};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;

const BASE_BACKOFF: Duration = Duration::from_millis(150);
const MAX_BACKOFF: Duration = Duration::from_secs(3);

/// Sends a request, retrying transient failures (connect errors, 429, 5xx)
/// with exponential backoff and jitter. Non-retriable statuses are returned
/// to the caller untouched; auth handling lives a layer above.
pub async fn send_with_retry<F>(mut build: F, attempts: u32) -> Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let max_attempts = attempts.clamp(1, 5);
    let mut backoff = BASE_BACKOFF;
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=max_attempts {
        match build().send().await {
            Ok(resp) if should_retry_status(resp.status()) && attempt < max_attempts => {
                sleep_with_jitter(backoff).await;
                backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
            }
            Ok(resp) => return Ok(resp),
            Err(e) => {
                if attempt == max_attempts {
                    return Err(e.into());
                }
                last_err = Some(e.into());
                sleep_with_jitter(backoff).await;
                backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("retry attempts exhausted")))
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

async fn sleep_with_jitter(base: Duration) {
    let jitter = Duration::from_millis(thread_rng().gen_range(0..=150));
    tokio::time::sleep(base + jitter).await;
}
