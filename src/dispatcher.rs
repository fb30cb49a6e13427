//! Sending tracking requests to the tracker.
//!
//! The engine only depends on the [`Dispatcher`] trait, so simulations can be run
//! against anything that accepts a [`TrackingRequest`]. [`HttpDispatcher`] sends them
//! to a real tracker endpoint with a shared [`reqwest::Client`] and its connection pool.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use strum_macros::{Display, EnumString};

use crate::action::TrackingRequest;
use crate::TrackloadError;

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// How a tracker responded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchResponse {
    pub status_code: u16,
    /// From sending the request until the response body was received.
    pub latency: Duration,
    /// The response body, empty unless requested.
    pub body: String,
}
impl DispatchResponse {
    /// Any 2xx status code.
    pub fn is_success(&self) -> bool {
        http::StatusCode::from_u16(self.status_code).is_ok_and(|status| status.is_success())
    }
}

/// A request that got no response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// No response within the request timeout.
    Timeout { latency: Duration },
    /// Connecting, sending or receiving failed.
    Transport { latency: Duration, detail: String },
}
impl DispatchError {
    /// How long the request took to fail.
    pub fn latency(&self) -> Duration {
        match self {
            DispatchError::Timeout { latency } | DispatchError::Transport { latency, .. } => {
                *latency
            }
        }
    }

    fn from_reqwest(error: reqwest::Error, latency: Duration) -> Self {
        if error.is_timeout() {
            DispatchError::Timeout { latency }
        } else {
            DispatchError::Transport {
                latency,
                detail: error.to_string(),
            }
        }
    }
}
impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DispatchError::Timeout { latency } => {
                write!(f, "request timed out after {}ms", latency.as_millis())
            }
            DispatchError::Transport { detail, .. } => write!(f, "request failed: {}", detail),
        }
    }
}
impl std::error::Error for DispatchError {}

/// Sends tracking requests. Implementations are shared by all virtual users.
///
/// A dispatcher must always resolve, either with a response or an error, and never
/// retries.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send(&self, request: &TrackingRequest) -> Result<DispatchResponse, DispatchError>;
}

/// The HTTP method tracking requests are sent with.
#[derive(Clone, Copy, Debug, Default, Display, EnumString, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum RequestMethod {
    /// Parameters in the query string.
    #[default]
    Get,
    /// Parameters form encoded in the request body.
    Post,
}

/// Sends tracking requests to an HTTP tracker endpoint, such as `https://host/matomo.php`.
#[derive(Clone, Debug)]
pub struct HttpDispatcher {
    client: Client,
    endpoint: String,
    method: RequestMethod,
    read_body: bool,
}
impl HttpDispatcher {
    /// Build a dispatcher, `read_body` keeps the response body for checks.
    pub fn new(
        endpoint: &str,
        method: RequestMethod,
        timeout: Duration,
        read_body: bool,
    ) -> Result<Self, TrackloadError> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(HttpDispatcher {
            client,
            endpoint: endpoint.to_string(),
            method,
            read_body,
        })
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn send(&self, request: &TrackingRequest) -> Result<DispatchResponse, DispatchError> {
        let builder = match self.method {
            RequestMethod::Get => self.client.get(&self.endpoint).query(&request.params),
            RequestMethod::Post => self.client.post(&self.endpoint).form(&request.params),
        }
        .header(reqwest::header::USER_AGENT, &request.user_agent);

        let started = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| DispatchError::from_reqwest(e, started.elapsed()))?;
        let status_code = response.status().as_u16();
        // Always drain the body so the connection can be reused.
        let body = response
            .text()
            .await
            .map_err(|e| DispatchError::from_reqwest(e, started.elapsed()))?;
        let latency = started.elapsed();
        trace!("{}: {} in {}ms", request.tag, status_code, latency.as_millis());

        Ok(DispatchResponse {
            status_code,
            latency,
            body: if self.read_body { body } else { String::new() },
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use httpmock::prelude::*;
    use std::collections::BTreeMap;
    use std::str::FromStr;

    fn request() -> TrackingRequest {
        let mut params = BTreeMap::new();
        params.insert("idsite".to_string(), "3".to_string());
        params.insert("_id".to_string(), "0123456789abcdef".to_string());
        params.insert("action_name".to_string(), "Category: News".to_string());
        TrackingRequest {
            params,
            user_agent: "TestBrowser/2.0".to_string(),
            tag: "page_view_category",
        }
    }

    #[test]
    fn success_status() {
        let response = |status_code| DispatchResponse {
            status_code,
            latency: Duration::ZERO,
            body: String::new(),
        };
        assert!(response(200).is_success());
        assert!(response(204).is_success());
        assert!(!response(302).is_success());
        assert!(!response(404).is_success());
        assert!(!response(500).is_success());
        assert!(!response(1000).is_success());
    }

    #[test]
    fn methods() {
        assert_eq!(RequestMethod::from_str("get").unwrap(), RequestMethod::Get);
        assert_eq!(RequestMethod::from_str("POST").unwrap(), RequestMethod::Post);
        assert!(RequestMethod::from_str("PUT").is_err());
        assert_eq!(RequestMethod::Post.to_string(), "POST");
    }

    #[tokio::test]
    async fn get_with_query() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/matomo.php")
                    .query_param("idsite", "3")
                    .query_param("_id", "0123456789abcdef")
                    .query_param("action_name", "Category: News")
                    .header("user-agent", "TestBrowser/2.0");
                then.status(200).body("Matomo Analytics");
            })
            .await;

        let dispatcher = HttpDispatcher::new(
            &server.url("/matomo.php"),
            RequestMethod::Get,
            Duration::from_secs(5),
            true,
        )
        .unwrap();
        let response = dispatcher.send(&request()).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "Matomo Analytics");
        assert!(response.is_success());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn post_form() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/matomo.php")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .header("user-agent", "TestBrowser/2.0");
                then.status(204);
            })
            .await;

        let dispatcher = HttpDispatcher::new(
            &server.url("/matomo.php"),
            RequestMethod::Post,
            Duration::from_secs(5),
            false,
        )
        .unwrap();
        let response = dispatcher.send(&request()).await.unwrap();
        assert_eq!(response.status_code, 204);
        assert!(response.body.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_is_a_response() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/matomo.php");
                then.status(500).body("oops");
            })
            .await;

        let dispatcher = HttpDispatcher::new(
            &server.url("/matomo.php"),
            RequestMethod::Get,
            Duration::from_secs(5),
            true,
        )
        .unwrap();
        let response = dispatcher.send(&request()).await.unwrap();
        assert_eq!(response.status_code, 500);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn timeout() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/matomo.php");
                then.status(200).delay(Duration::from_secs(2));
            })
            .await;

        let dispatcher = HttpDispatcher::new(
            &server.url("/matomo.php"),
            RequestMethod::Get,
            Duration::from_millis(200),
            false,
        )
        .unwrap();
        let error = dispatcher.send(&request()).await.unwrap_err();
        assert!(matches!(error, DispatchError::Timeout { .. }));
        assert!(error.latency() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn connection_refused() {
        // Nothing listens on port 1.
        let dispatcher = HttpDispatcher::new(
            "http://127.0.0.1:1/matomo.php",
            RequestMethod::Get,
            Duration::from_secs(5),
            false,
        )
        .unwrap();
        let error = dispatcher.send(&request()).await.unwrap_err();
        assert!(matches!(error, DispatchError::Transport { .. }));
    }
}
