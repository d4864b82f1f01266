//! Retry policy for LLM transport.
//!
//! Transport failures and 5xx responses retry with exponential backoff and
//! jitter; 429 additionally honors `Retry-After`. 4xx other than 408/429 is
//! terminal. The abort signal short-circuits waits.

use crate::config::RetrySettings;
use crate::error::{DbError, Result};
use crate::types::AbortSignal;
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

fn backoff_delay(attempt: u32, settings: &RetrySettings) -> Duration {
    let factor = settings.factor.max(1.0);
    let scaled = settings.base_delay.as_millis() as f64 * factor.powi(attempt as i32);
    let capped = scaled.min(settings.cap.as_millis() as f64) as u64;
    // Nanosecond-derived jitter avoids thundering herd without a rand dependency.
    let jitter = u64::from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    ) % 250;
    Duration::from_millis(capped.saturating_add(jitter))
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || matches!(
            status,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT
        )
}

/// Send a request (built fresh per attempt by `build`) until it succeeds,
/// exhausts the retry budget, or hits a terminal status.
pub async fn send_with_retry<F, Fut>(
    build: F,
    settings: &RetrySettings,
    signal: &AbortSignal,
) -> Result<reqwest::Response>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
{
    let mut attempt: u32 = 0;
    loop {
        if signal.aborted() {
            return Err(DbError::Cancelled);
        }

        let outcome = tokio::select! {
            outcome = build() => outcome,
            () = signal.cancelled() => return Err(DbError::Cancelled),
        };

        let (delay, last_error) = match outcome {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                if !retryable_status(status) {
                    let body = response.text().await.unwrap_or_default();
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(DbError::Auth(format!("{status}: {body}")));
                    }
                    return Err(DbError::LlmTransport(format!("{status}: {body}")));
                }
                let header_delay = retry_after(&response);
                let status_text = status.to_string();
                let body = response.text().await.unwrap_or_default();
                if attempt >= settings.max_attempts {
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        return Err(DbError::RateLimit(body));
                    }
                    return Err(DbError::LlmTransport(format!("{status_text}: {body}")));
                }
                (
                    header_delay.unwrap_or_else(|| backoff_delay(attempt, settings)),
                    status_text,
                )
            }
            Err(e) => {
                if attempt >= settings.max_attempts {
                    return Err(DbError::LlmTransport(e.to_string()));
                }
                (backoff_delay(attempt, settings), e.to_string())
            }
        };

        attempt += 1;
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %last_error,
            "LLM request failed, retrying after backoff"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = signal.cancelled() => return Err(DbError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_attempts: u32) -> RetrySettings {
        RetrySettings {
            base_delay: Duration::from_millis(1),
            factor: 2.0,
            cap: Duration::from_millis(10),
            max_attempts,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let s = settings(5);
        let first = backoff_delay(0, &s);
        let late = backoff_delay(10, &s);
        assert!(first >= Duration::from_millis(1));
        // Capped at 10ms plus bounded jitter.
        assert!(late <= Duration::from_millis(10 + 250));
    }

    #[test]
    fn retryable_statuses() {
        assert!(retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(retryable_status(StatusCode::BAD_GATEWAY));
        assert!(retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!retryable_status(StatusCode::BAD_REQUEST));
        assert!(!retryable_status(StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn transport_errors_exhaust_the_budget() {
        let client = reqwest::Client::new();
        // Unroutable address: connection fails fast.
        let err = send_with_retry(
            || client.get("http://127.0.0.1:1/unreachable").send(),
            &settings(1),
            &AbortSignal::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "LLMTransportError");
    }

    #[tokio::test]
    async fn aborted_signal_cancels_immediately() {
        let client = reqwest::Client::new();
        let signal = AbortSignal::new();
        signal.abort();
        let err = send_with_retry(
            || client.get("http://127.0.0.1:1/unreachable").send(),
            &settings(5),
            &signal,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "CancelledError");
    }
}
