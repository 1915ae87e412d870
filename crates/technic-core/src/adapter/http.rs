//! Shared plumbing for the HTTP/JSON backends.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};

use crate::config::HttpBackendConfig;
use crate::error::{Result, TechnicError};

use super::DispatchResult;

/// How much of an error body is kept in `last_error`.
const BODY_SNIPPET: usize = 200;

pub(crate) struct HttpBackend {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpBackend {
    pub(crate) fn new(cfg: &HttpBackendConfig, timeout: Duration) -> Result<Self> {
        let base = Url::parse(&cfg.base_url)
            .map_err(|e| TechnicError::Config(format!("invalid URL '{}': {e}", cfg.base_url)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TechnicError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base,
            token: cfg.token(),
        })
    }

    /// `base` plus percent-encoded path segments.
    pub(crate) fn url(&self, segments: &[&str]) -> std::result::Result<Url, DispatchResult> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| DispatchResult::permanent(format!("base URL {} cannot take a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub(crate) fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send and fold transport errors into a `DispatchResult`.
    pub(crate) async fn send(
        &self,
        builder: RequestBuilder,
    ) -> std::result::Result<Response, DispatchResult> {
        builder.send().await.map_err(|e| classify_transport(&e))
    }
}

pub(crate) fn classify_transport(e: &reqwest::Error) -> DispatchResult {
    if e.is_builder() {
        DispatchResult::permanent(format!("malformed request: {e}"))
    } else if e.is_timeout() {
        DispatchResult::transient(format!("request timed out: {e}"))
    } else {
        DispatchResult::transient(format!("transport error: {e}"))
    }
}

/// Classify a status the caller did not treat as success.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> DispatchResult {
    let snippet: String = body.chars().take(BODY_SNIPPET).collect();
    let reason = if snippet.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", snippet.trim())
    };
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        DispatchResult::TransientFailure(reason)
    } else {
        DispatchResult::PermanentFailure(reason)
    }
}

/// Read the body (best effort) and classify.
pub(crate) async fn failure_from(response: Response) -> DispatchResult {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(base: &str) -> HttpBackend {
        HttpBackend::new(
            &HttpBackendConfig {
                base_url: base.to_string(),
                token_env: None,
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn url_encodes_segments_and_drops_trailing_slash() {
        let b = backend("https://gw.example/api/");
        let url = b.url(&["groups", "Finance Readers", "members", "jdoe"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://gw.example/api/groups/Finance%20Readers/members/jdoe"
        );
    }

    #[test]
    fn url_segment_cannot_escape_path() {
        let b = backend("https://gw.example/api");
        let url = b.url(&["groups", "../admin"]).unwrap();
        assert!(url.as_str().ends_with("/api/groups/..%2Fadmin"));
    }

    #[test]
    fn status_classification() {
        for code in [408u16, 429, 500, 502, 503] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(
                matches!(classify_status(status, ""), DispatchResult::TransientFailure(_)),
                "{code} should be transient"
            );
        }
        for code in [400u16, 401, 403, 404, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(
                matches!(classify_status(status, ""), DispatchResult::PermanentFailure(_)),
                "{code} should be permanent"
            );
        }
    }

    #[test]
    fn body_is_truncated_into_reason() {
        let body = "x".repeat(1000);
        let DispatchResult::PermanentFailure(reason) = classify_status(StatusCode::FORBIDDEN, &body)
        else {
            panic!("expected permanent")
        };
        assert!(reason.starts_with("HTTP 403 Forbidden: "));
        assert!(reason.len() < 300);
    }
}
