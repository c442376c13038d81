//! Shared HTTP plumbing for the provider clients.

use std::time::Duration;

use reqwest::{Response, StatusCode};

use crate::error::LlmError;

/// Build the shared reqwest client with a request timeout.
pub(crate) fn build_client(provider: &str, timeout: Duration) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: format!("Failed to build HTTP client: {e}"),
        })
}

/// Turn a non-2xx response into the matching `LlmError`.
pub(crate) async fn check_status(provider: &str, response: Response) -> Result<Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(LlmError::AuthFailed {
            provider: provider.to_string(),
        }),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            Err(LlmError::RateLimited {
                provider: provider.to_string(),
                retry_after,
            })
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(LlmError::RequestFailed {
                provider: provider.to_string(),
                reason: format!("HTTP {status}: {}", truncate(&body, 300)),
            })
        }
    }
}

/// Map a transport-level reqwest failure.
pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> LlmError {
    LlmError::RequestFailed {
        provider: provider.to_string(),
        reason: err.to_string(),
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
    }

    #[test]
    fn retry_after_http_date_is_ignored() {
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn truncate_respects_char_boundary() {
        let s = "héllo";
        assert_eq!(truncate(s, 2), "h");
        assert_eq!(truncate(s, 100), "héllo");
    }
}
