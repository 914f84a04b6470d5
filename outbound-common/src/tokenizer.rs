use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::metrics_consts::{TOKENIZER_CALLS, TOKENIZER_FAILURES};

/// Enumeration of the ways a tokenization call can fail.
///
/// The displayed messages are matched by downstream triage tooling and must not change.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TokenizerError {
    #[error("Unexpected empty token from tokenizer: {0}")]
    EmptyToken(String),
    #[error("{0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Transport(String),
    #[error("Pdv tokenizer returned {status} with error: {title}")]
    Status { status: u16, title: String },
}

impl TokenizerError {
    fn kind(&self) -> &'static str {
        match self {
            TokenizerError::EmptyToken(_) => "empty_token",
            TokenizerError::InvalidResponse(_) => "invalid_response",
            TokenizerError::Transport(_) => "transport",
            TokenizerError::Status { .. } => "status",
        }
    }
}

/// Exchanges a piece of personal data for its pseudonymous token.
#[async_trait]
pub trait Tokenizer: Send + Sync {
    async fn tokenize(&self, pii: &str) -> Result<String, TokenizerError>;
}

#[derive(Serialize)]
struct PiiResource<'a> {
    pii: &'a str,
}

#[derive(Deserialize)]
struct TokenResource {
    token: String,
}

#[derive(Deserialize)]
struct Problem {
    title: Option<String>,
}

/// Validates a successful tokenizer response body.
pub fn parse_token(body: &str) -> Result<String, TokenizerError> {
    let resource: TokenResource =
        serde_json::from_str(body).map_err(|e| TokenizerError::InvalidResponse(e.to_string()))?;

    if resource.token.trim().is_empty() {
        return Err(TokenizerError::EmptyToken(
            "token must be a non-empty string".to_string(),
        ));
    }

    Ok(resource.token)
}

/// HTTP client for the PDV tokenizer service.
pub struct PdvTokenizerClient {
    client: reqwest::Client,
    tokens_url: String,
    api_key: String,
}

impl PdvTokenizerClient {
    pub fn new(
        base_url: &str,
        api_key: String,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("CDC Outbound Publisher")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            tokens_url: format!("{}/tokens", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    async fn put_token(&self, pii: &str) -> Result<String, TokenizerError> {
        let response = self
            .client
            .put(&self.tokens_url)
            .header("x-api-key", &self.api_key)
            .json(&PiiResource { pii })
            .send()
            .await
            .map_err(|e| TokenizerError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TokenizerError::Transport(e.to_string()))?;

        if !status.is_success() {
            let title = serde_json::from_str::<Problem>(&body)
                .ok()
                .and_then(|problem| problem.title)
                .unwrap_or_else(|| {
                    status
                        .canonical_reason()
                        .unwrap_or("unknown error")
                        .to_string()
                });
            return Err(TokenizerError::Status {
                status: status.as_u16(),
                title,
            });
        }

        parse_token(&body)
    }
}

#[async_trait]
impl Tokenizer for PdvTokenizerClient {
    async fn tokenize(&self, pii: &str) -> Result<String, TokenizerError> {
        metrics::counter!(TOKENIZER_CALLS).increment(1);

        let result = self.put_token(pii).await;
        if let Err(err) = &result {
            debug!(kind = err.kind(), "tokenizer call failed: {}", err);
            metrics::counter!(TOKENIZER_FAILURES, "kind" => err.kind()).increment(1);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    fn client_for(server: &MockServer) -> PdvTokenizerClient {
        PdvTokenizerClient::new(
            &server.base_url(),
            "secret".to_string(),
            Duration::from_secs(5),
        )
        .expect("failed to build client")
    }

    #[test]
    fn parse_token_accepts_a_token() {
        assert_eq!(parse_token(r#"{"token":"abc"}"#), Ok("abc".to_string()));
    }

    #[test]
    fn parse_token_reports_empty_token() {
        let err = parse_token(r#"{"token":""}"#).unwrap_err();

        assert_eq!(
            err.to_string(),
            "Unexpected empty token from tokenizer: token must be a non-empty string"
        );
    }

    #[test]
    fn parse_token_reports_raw_validation_detail() {
        let err = parse_token(r#"{"other":"abc"}"#).unwrap_err();

        assert_eq!(
            err.to_string(),
            serde_json::from_str::<TokenResource>(r#"{"other":"abc"}"#)
                .err()
                .unwrap()
                .to_string()
        );
    }

    #[tokio::test]
    async fn tokenize_puts_pii_and_returns_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/tokens")
                    .header("x-api-key", "secret")
                    .json_body(json!({"pii": "RSSMRA80A01H501U"}));
                then.status(200).json_body(json!({"token": "token-1"}));
            })
            .await;

        let token = client_for(&server)
            .tokenize("RSSMRA80A01H501U")
            .await
            .expect("tokenize should succeed");

        assert_eq!(token, "token-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn tokenize_reports_status_and_problem_title() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/tokens");
                then.status(429).json_body(json!({"title": "Too Many Requests"}));
            })
            .await;

        let err = client_for(&server).tokenize("pii").await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "Pdv tokenizer returned 429 with error: Too Many Requests"
        );
    }

    #[tokio::test]
    async fn tokenize_reports_empty_token() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/tokens");
                then.status(200).json_body(json!({"token": "  "}));
            })
            .await;

        let err = client_for(&server).tokenize("pii").await.unwrap_err();

        assert!(matches!(err, TokenizerError::EmptyToken(_)));
        // The response body never leaks into the message
        assert!(!err.to_string().contains("\"token\""));
    }

    #[tokio::test]
    async fn tokenize_reports_transport_errors() {
        // Nothing listens on port 1
        let client = PdvTokenizerClient::new(
            "http://127.0.0.1:1",
            "secret".to_string(),
            Duration::from_secs(1),
        )
        .unwrap();

        let err = client.tokenize("pii").await.unwrap_err();

        assert!(matches!(err, TokenizerError::Transport(_)));
    }
}
