//! HTTP plumbing shared by the session manager and the node client.
//!
//! Status codes are mapped onto the error taxonomy here, once:
//! 401 rejects the session, 404 is `NotFound`, 429 and 5xx are
//! network-class (retryable), any other non-success is `Remote`.

use std::time::Duration;

use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::{json, Value};

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct Transport {
    http: Client,
    base_url: String,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Transport {
    pub fn new(base_url: &str, timeout: Duration, accept_invalid_certs: bool) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .user_agent(concat!("jobkeeper/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(base_url, http))
    }

    /// Uses a pre-built client (tests point this at a mock server).
    pub fn with_client(base_url: &str, http: Client) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Posts credentials to `/sessions` and returns the cookie header to
    /// replay on later calls.
    pub async fn login(&self, email: &str, password: &str) -> Result<String> {
        let response = self
            .http
            .post(self.url("/sessions"))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;

        let status = response.status();
        match status {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::BAD_REQUEST
            | StatusCode::UNPROCESSABLE_ENTITY => {
                return Err(Error::Authentication {
                    node: self.base_url.clone(),
                    reason: format!("login rejected with {status}"),
                })
            }
            s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
                return Err(Error::Network(format!("login returned {status}")))
            }
            _ => return Err(Error::Remote(format!("login returned {status}"))),
        }

        let cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .collect::<Vec<_>>()
            .join("; ");

        if cookie.is_empty() {
            return Err(Error::Authentication {
                node: self.base_url.clone(),
                reason: "login succeeded but no session cookie was issued".into(),
            });
        }
        Ok(cookie)
    }

    /// Runs a GraphQL document and returns its `data` member.
    pub async fn graphql(&self, cookie: &str, query: &str, variables: Value) -> Result<Value> {
        let body = json!({ "query": query, "variables": variables });
        let response = self
            .http
            .post(self.url("/query"))
            .header(COOKIE, cookie)
            .json(&body)
            .send()
            .await?;
        let value = read_json(check_status(response).await?).await?;

        if let Some(errors) = value.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                let messages: Vec<&str> = errors
                    .iter()
                    .filter_map(|e| e.get("message").and_then(Value::as_str))
                    .collect();
                return Err(Error::Remote(format!("GraphQL error: {}", messages.join("; "))));
            }
        }
        Ok(value.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Plain REST call; an empty body yields `Value::Null`.
    pub async fn rest(
        &self,
        cookie: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let mut request = self.http.request(method, self.url(path)).header(COOKIE, cookie);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        read_json(check_status(response).await?).await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{url} returned {status}: {}", body.trim());
    Err(match status {
        StatusCode::UNAUTHORIZED => Error::Unauthorized(detail),
        StatusCode::NOT_FOUND => Error::NotFound(detail),
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => Error::Network(detail),
        _ => Error::Remote(detail),
    })
}

async fn read_json(response: Response) -> Result<Value> {
    let text = response.text().await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| Error::Remote(format!("malformed response: {e}")))
}
