use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use url::Url;

use crate::{
    backoff::{Backoff, BackoffPolicy},
    error::ClientError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            query: Vec::new(),
            headers: Vec::new(),
            form: Vec::new(),
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(name, value)| (name.into(), value.into())));
        self
    }

    pub fn with_form(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.form.push((key.into(), value.to_string()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            body: body.to_string().into_bytes(),
        }
    }
}

/// Performs exactly one HTTP attempt. Connection-level failures come back as
/// `ClientError::Transport`; any received response, whatever its status, is `Ok`.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: &HttpRequest) -> Result<RawResponse, ClientError>;
}

pub struct ReqwestExecutor {
    http: Client,
}

impl ReqwestExecutor {
    pub fn new(request_timeout: Duration) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| ClientError::Transport(format!("failed to build http client: {err}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, request: &HttpRequest) -> Result<RawResponse, ClientError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.http.get(request.url.clone()),
            HttpMethod::Post => self.http.post(request.url.clone()),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.form.is_empty() {
            builder = builder.form(&request.form);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| ClientError::Transport(format!("{} {}: {err}", method_name(request.method), request.url)))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| ClientError::Transport(format!("failed to read response body: {err}")))?;

        Ok(RawResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Appends `path` to `base`, keeping any path prefix the base already has.
pub fn join_path(base: &Url, path: &str) -> Result<Url, ClientError> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|err| ClientError::Protocol(format!("invalid endpoint url `{joined}`: {err}")))
}

fn method_name(method: HttpMethod) -> &'static str {
    match method {
        HttpMethod::Get => "GET",
        HttpMethod::Post => "POST",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(4)),
            request_timeout: Duration::from_secs(20),
        }
    }
}

pub struct Transport {
    executor: Arc<dyn HttpExecutor>,
    policy: RetryPolicy,
}

impl Transport {
    pub fn new(executor: Arc<dyn HttpExecutor>, policy: RetryPolicy) -> Self {
        Self { executor, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Sends with timeout and retry, then requires a 2xx JSON response.
    pub async fn send(&self, request: &HttpRequest) -> Result<Value, ClientError> {
        let response = self.send_raw(request).await?;
        if !(200..300).contains(&response.status) {
            return Err(ClientError::HttpStatus {
                status: response.status,
                url: request.url.to_string(),
            });
        }
        serde_json::from_slice(&response.body).map_err(|err| ClientError::Decode(err.to_string()))
    }

    /// Retries only transport failures; the first received response ends the call.
    pub async fn send_raw(&self, request: &HttpRequest) -> Result<RawResponse, ClientError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = Backoff::new(self.policy.backoff);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                method = method_name(request.method),
                url = %request.url,
                attempt,
                "transport: sending request"
            );

            let outcome = match timeout(self.policy.request_timeout, self.executor.execute(request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ClientError::Transport(format!(
                    "request to {} timed out after {:?}",
                    request.url, self.policy.request_timeout
                ))),
            };

            match outcome {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        url = %request.url,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transport: attempt failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
