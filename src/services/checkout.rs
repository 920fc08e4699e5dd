//! Outbound checkout calls to the ParkITESO checkout service
//!
//! The checkout service owns the parking history; this side only asks it to
//! close the user's open check-in. Calls are fire-and-forget from the
//! tracker's point of view and are never retried.

use crate::domain::types::UserId;
use crate::infra::config::Config;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Longest response body excerpt kept in an error
const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("checkout request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The service refused this user (auto-checkout disabled, no open check-in, ...)
    #[error("checkout rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("checkout service returned status {status}: {message}")]
    Status { status: u16, message: String },
}

/// The single operation the tracker needs from the checkout service
#[async_trait]
pub trait CheckoutService: Send + Sync {
    async fn checkout(&self, user_id: UserId) -> Result<(), CheckoutError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutRequest<'a> {
    user_id: UserId,
    #[serde(rename = "type")]
    checkout_type: &'a str,
}

/// HTTP client for `POST /checkout`
pub struct HttpCheckout {
    url: String,
    checkout_type: String,
    client: reqwest::Client,
}

impl HttpCheckout {
    pub fn new(config: &Config) -> Result<Self, CheckoutError> {
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.checkout_timeout_ms()))
            .build()?;

        info!(url = %config.checkout_url(), checkout_type = %config.checkout_type(), "checkout_client_initialized");

        Ok(Self {
            url: config.checkout_url().to_string(),
            checkout_type: config.checkout_type().to_string(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CheckoutService for HttpCheckout {
    async fn checkout(&self, user_id: UserId) -> Result<(), CheckoutError> {
        let body = CheckoutRequest { user_id, checkout_type: &self.checkout_type };

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();

        if status.is_success() {
            debug!(user_id = %user_id, status = %status.as_u16(), "checkout_accepted");
            return Ok(());
        }

        let message = error_message(&response.text().await.unwrap_or_default());
        let status = status.as_u16();

        if matches!(status, 400 | 403 | 404) {
            Err(CheckoutError::Rejected { status, message })
        } else {
            Err(CheckoutError::Status { status, message })
        }
    }
}

/// Pull `message` or `error` out of a JSON error body, else keep the raw text
fn error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body).ok().and_then(|v| {
        v.get("message").or_else(|| v.get("error")).and_then(|m| m.as_str()).map(str::to_string)
    });

    let mut message = from_json.unwrap_or_else(|| body.trim().to_string());
    if message.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let body = CheckoutRequest { user_id: UserId(1), checkout_type: "automatic" };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"userId": 1, "type": "automatic"}));
    }

    #[test]
    fn test_error_message_from_json() {
        assert_eq!(
            error_message(r#"{"message":"El usuario tiene desactivado el checkout automático"}"#),
            "El usuario tiene desactivado el checkout automático"
        );
        assert_eq!(error_message(r#"{"error":"userId is required"}"#), "userId is required");
    }

    #[test]
    fn test_error_message_plain_text_truncated() {
        assert_eq!(error_message("  upstream down \n"), "upstream down");

        let long = "é".repeat(300);
        let message = error_message(&long);
        assert!(message.len() <= MAX_ERROR_BODY);
        assert!(message.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_client_uses_config_url() {
        let config = Config::default().with_checkout_url("http://127.0.0.1:4000/checkout");
        let client = HttpCheckout::new(&config).unwrap();
        assert_eq!(client.url(), "http://127.0.0.1:4000/checkout");
    }
}
