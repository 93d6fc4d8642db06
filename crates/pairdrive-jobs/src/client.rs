//! HTTP client for the drive API
//!
//! Thin wrapper over `reqwest` that owns the base URL and the access token,
//! maps HTTP failures to `(ExitCode, ExitCause)` pairs and feeds the timeout
//! detector. Token refresh happens here: a 401 triggers one refresh attempt
//! and surfaces as `TokenRefreshed` (replay the request) or `InvalidToken`.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use pairdrive_core::domain::{ExitCause, ExitCode};

use crate::spec::JobOutcome;
use crate::timeout;

/// Authenticated client for one drive endpoint
pub struct DriveClient {
    http: reqwest::Client,
    base_url: Url,
    token: RwLock<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

impl DriveClient {
    pub fn new(base_url: &str, token: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        // Url::join drops the last segment of slash-less bases
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            token: RwLock::new(token.into()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn token(&self) -> String {
        self.token.read().expect("token lock poisoned").clone()
    }

    /// Builds a request against a path relative to the base URL.
    pub fn request(&self, method: Method, path: &str) -> anyhow::Result<RequestBuilder> {
        let url = self.base_url.join(path.trim_start_matches('/'))?;
        Ok(self.http.request(method, url).bearer_auth(self.token()))
    }

    /// Builds a request against an absolute URL (upload session endpoints).
    pub fn request_absolute(&self, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(self.token())
    }

    /// Sends a request, recording its duration for timeout detection.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, JobOutcome> {
        let started = Instant::now();
        let result = builder.send().await;
        let elapsed = started.elapsed();
        if let Some(detector) = timeout::instance() {
            detector.record(elapsed);
        }

        match result {
            Ok(response) => Ok(response),
            Err(err) => Err(self.outcome_from_transport(&err)),
        }
    }

    fn outcome_from_transport(&self, err: &reqwest::Error) -> JobOutcome {
        let timing_out = timeout::instance().map(|d| d.is_timing_out()).unwrap_or(false);
        let cause = if err.is_timeout() || timing_out {
            ExitCause::NetworkTimeout
        } else if err.is_connect() {
            ExitCause::SocketsDefuncted
        } else {
            ExitCause::Unknown
        };
        warn!(error = %err, ?cause, "Transport failure");
        JobOutcome::failed(ExitCode::NetworkError, cause)
    }

    /// Maps a non-success HTTP status to an outcome, refreshing the token on
    /// a 401.
    pub async fn outcome_from_status(&self, response: &Response) -> JobOutcome {
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED => self.refresh_token().await,
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                let mut outcome = JobOutcome::failed(ExitCode::RateLimited, ExitCause::ApiErr);
                if let Some(delay) = retry_after {
                    outcome = outcome.with_retry_after(delay);
                }
                outcome
            }
            StatusCode::NOT_FOUND => JobOutcome::failed(ExitCode::BackError, ExitCause::NotFound),
            StatusCode::CONFLICT => {
                JobOutcome::failed(ExitCode::BackError, ExitCause::FileAlreadyExist)
            }
            StatusCode::PAYLOAD_TOO_LARGE => {
                JobOutcome::failed(ExitCode::BackError, ExitCause::FileTooBig)
            }
            StatusCode::INSUFFICIENT_STORAGE => {
                JobOutcome::failed(ExitCode::BackError, ExitCause::QuotaExceeded)
            }
            StatusCode::BAD_REQUEST => {
                JobOutcome::failed(ExitCode::BackError, ExitCause::InvalidName)
            }
            status if status.is_server_error() => {
                JobOutcome::failed(ExitCode::BackError, ExitCause::ApiErr)
            }
            _ => JobOutcome::failed(ExitCode::BackError, ExitCause::ApiErr),
        }
    }

    /// One refresh attempt against the token endpoint.
    async fn refresh_token(&self) -> JobOutcome {
        debug!("Access token rejected, attempting refresh");

        let builder = match self.request(Method::POST, "token/refresh") {
            Ok(builder) => builder,
            Err(_) => return JobOutcome::failed(ExitCode::InvalidToken, ExitCause::Unknown),
        };

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => return self.outcome_from_transport(&err),
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), "Token refresh rejected");
            return JobOutcome::failed(ExitCode::InvalidToken, ExitCause::Unknown);
        }

        match response.json::<TokenResponse>().await {
            Ok(refreshed) => {
                *self.token.write().expect("token lock poisoned") = refreshed.token;
                debug!("Access token refreshed");
                JobOutcome::failed(ExitCode::TokenRefreshed, ExitCause::Unknown)
            }
            Err(_) => JobOutcome::failed(ExitCode::InvalidToken, ExitCause::Unknown),
        }
    }
}
