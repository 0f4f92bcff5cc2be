use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::auth::{AuthError, CredentialRenewer};
use crate::stream::{ByteStream, StreamAcquirer, TransportError};

/// Production API base URL.
pub const API_BASE_URL: &str = "https://api.pulsefeed.io";
/// Local development API base URL.
pub const LOCAL_API_BASE_URL: &str = "http://localhost:8080";

const REFRESH_PATH: &str = "/v1/auth/refresh";
const EVENTS_PATH: &str = "/v1/events";

/// Transport construction options.
#[derive(Clone, Debug)]
pub struct HttpTransportOptions {
    pub connect_timeout: Duration,
    /// Per-attempt timeout for the short-lived renewal call. The event
    /// stream itself carries no timeout; it is inherently long-lived.
    pub refresh_timeout: Duration,
}

impl Default for HttpTransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            refresh_timeout: Duration::from_secs(10),
        }
    }
}

/// reqwest-backed implementation of the credential-renewal and
/// stream-acquisition collaborators.
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    refresh_timeout: Duration,
    local: bool,
    base_override: Option<String>,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_options(HttpTransportOptions::default())
    }

    pub fn with_options(options: HttpTransportOptions) -> Result<Self, TransportError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|err| TransportError::Connection(err.to_string()))?;

        Ok(Self {
            http,
            refresh_timeout: options.refresh_timeout,
            local: false,
            base_override: None,
        })
    }

    /// Enables or disables local mode endpoint routing.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit base URL override.
    ///
    /// The override takes precedence over local mode when set.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_override = Some(base_url.trim_end().trim_end_matches('/').to_string());
        self
    }

    fn base_url(&self) -> &str {
        if let Some(base) = self.base_override.as_deref() {
            return base;
        }
        if self.local {
            LOCAL_API_BASE_URL
        } else {
            API_BASE_URL
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }
}

#[async_trait]
impl CredentialRenewer for HttpTransport {
    async fn renew(&self) -> Result<SecretString, AuthError> {
        let response = self
            .http
            .post(self.endpoint(REFRESH_PATH))
            .timeout(self.refresh_timeout)
            .send()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;
        parse_token_response(&body)
    }
}

#[async_trait]
impl StreamAcquirer for HttpTransport {
    async fn acquire(&self, credential: SecretString) -> Result<ByteStream, TransportError> {
        let response = self
            .http
            .get(self.endpoint(EVENTS_PATH))
            .bearer_auth(credential.expose_secret())
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|err| TransportError::Connection(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized);
        }
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
            });
        }

        Ok(response
            .bytes_stream()
            .map_err(|err| TransportError::Connection(err.to_string()))
            .boxed())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

fn parse_token_response(body: &str) -> Result<SecretString, AuthError> {
    let parsed: TokenResponse = serde_json::from_str(body)
        .map_err(|err| AuthError::MalformedResponse(err.to_string()))?;

    let token = parsed
        .token
        .or(parsed.access_token)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AuthError::MalformedResponse("response carried no token".to_string()))?;

    Ok(SecretString::new(token))
}
