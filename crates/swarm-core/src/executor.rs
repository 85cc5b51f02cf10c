use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::error::AuthError;
use crate::user::Credentials;

pub const CLIENT_API_ENDPOINT: &str = "/api/Client";
pub const AUTHENTICATION_API_ENDPOINT: &str = "/users";

pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a request ended, from the load generator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    Success,
    ClientError,
    ServerError,
    NetworkError,
}

impl StatusCategory {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=399 => StatusCategory::Success,
            400..=499 => StatusCategory::ClientError,
            _ => StatusCategory::ServerError,
        }
    }

    pub fn is_success(self) -> bool {
        self == StatusCategory::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub method: Method,
    /// Concrete path appended to the host base URL
    pub path: String,
    /// Path template used to group statistics
    pub name: String,
    pub headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub status: StatusCategory,
    pub latency: Duration,
}

/// Issues one HTTP call. Error statuses are outcomes, not `Err`.
pub trait RequestExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute<'a>(&'a self, request: &'a RequestSpec) -> BoxFuture<'a, Result<ExecOutcome>>;
}

pub trait AuthClient: Send + Sync {
    fn register<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<(), AuthError>>;

    fn login<'a>(&'a self, credentials: &'a Credentials)
        -> BoxFuture<'a, Result<String, AuthError>>;
}

/// Mock executor for testing: fixed latency and a fixed status for every call.
pub struct MockExecutor {
    delay: Duration,
    status: StatusCategory,
    reject_auth: bool,
    calls: AtomicU64,
    auth_calls: AtomicU64,
}

impl MockExecutor {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            status: StatusCategory::Success,
            reject_auth: false,
            calls: AtomicU64::new(0),
            auth_calls: AtomicU64::new(0),
        }
    }

    /// Every request, including register and login, ends with `status`.
    pub fn with_status(mut self, status: StatusCategory) -> Self {
        self.status = status;
        self.reject_auth = !status.is_success();
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn auth_calls(&self) -> u64 {
        self.auth_calls.load(Ordering::Relaxed)
    }

    async fn auth_round_trip(&self) -> Result<(), AuthError> {
        self.auth_calls.fetch_add(1, Ordering::Relaxed);
        sleep(self.delay).await;
        match self.status {
            _ if !self.reject_auth => Ok(()),
            StatusCategory::NetworkError => Err(AuthError::Transport("connection refused".into())),
            StatusCategory::ClientError => Err(AuthError::Rejected(400)),
            _ => Err(AuthError::Rejected(500)),
        }
    }
}

impl RequestExecutor for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn execute<'a>(&'a self, _request: &'a RequestSpec) -> BoxFuture<'a, Result<ExecOutcome>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::Relaxed);
            sleep(self.delay).await;

            Ok(ExecOutcome {
                status: self.status,
                latency: self.delay,
            })
        })
    }
}

impl AuthClient for MockExecutor {
    fn register<'a>(
        &'a self,
        _credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<(), AuthError>> {
        Box::pin(self.auth_round_trip())
    }

    fn login<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<String, AuthError>> {
        Box::pin(async move {
            self.auth_round_trip().await?;
            Ok(format!("mock-token-{}", credentials.user_name))
        })
    }
}

/// HTTP/JSON executor for the leaderboard service.
pub struct HttpJsonExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpJsonExecutor {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_credentials(
        &self,
        action: &str,
        credentials: &Credentials,
    ) -> Result<reqwest::Response, AuthError> {
        let endpoint = self.url(&format!("{AUTHENTICATION_API_ENDPOINT}/{action}"));
        let response = self
            .client
            .post(&endpoint)
            .json(credentials)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::Rejected(response.status().as_u16()));
        }
        Ok(response)
    }
}

impl RequestExecutor for HttpJsonExecutor {
    fn name(&self) -> &'static str {
        "http"
    }

    fn execute<'a>(&'a self, request: &'a RequestSpec) -> BoxFuture<'a, Result<ExecOutcome>> {
        Box::pin(async move {
            let start = Instant::now();
            let url = self.url(&request.path);

            let mut builder = match request.method {
                Method::Get => self.client.get(&url),
                Method::Post => self.client.post(&url),
                Method::Put => self.client.put(&url),
                Method::Delete => self.client.delete(&url),
            };
            for (key, value) in &request.headers {
                builder = builder.header(key.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let status = match builder.send().await {
                Ok(response) => StatusCategory::from_status(response.status().as_u16()),
                // Timeouts, refused connections and DNS failures all land here.
                Err(e) if e.is_builder() => return Err(e.into()),
                Err(_) => StatusCategory::NetworkError,
            };

            Ok(ExecOutcome {
                status,
                latency: start.elapsed(),
            })
        })
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    token: Option<String>,
}

impl AuthClient for HttpJsonExecutor {
    fn register<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<(), AuthError>> {
        Box::pin(async move {
            self.post_credentials("register", credentials).await?;
            Ok(())
        })
    }

    fn login<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<String, AuthError>> {
        Box::pin(async move {
            let response = self.post_credentials("login", credentials).await?;
            let body: LoginResponse = response
                .json()
                .await
                .map_err(|e| AuthError::Transport(e.to_string()))?;
            body.token
                .filter(|t| !t.is_empty())
                .ok_or(AuthError::MissingToken)
        })
    }
}
