//! Marketplace transports: the official seller API (premium tier) and the
//! session-cookie seller web endpoints (standard tier).

pub mod config;
pub mod retry;
pub mod seller_api;
pub mod seller_web;

pub use seller_api::SellerApiClient;
pub use seller_web::SellerWebClient;

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OzonError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("authorization rejected: {0}")]
    Unauthorized(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("credential has no {0}")]
    MissingCredential(&'static str),
}

impl OzonError {
    pub fn is_retryable(&self) -> bool {
        match self {
            OzonError::Timeout | OzonError::Transport(_) => true,
            OzonError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Errors after which the credential must be disabled.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            OzonError::Unauthorized(_) | OzonError::MissingCredential(_)
        )
    }
}

impl From<reqwest::Error> for OzonError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OzonError::Timeout
        } else {
            OzonError::Transport(err.to_string())
        }
    }
}

/// Raw result of a reply submission call.
#[derive(Debug, Clone)]
pub struct Submission {
    pub accepted: bool,
    pub payload: Value,
}

/// SKUs arrive as numbers from one endpoint and strings from the other.
pub(crate) fn sku_from_any<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Sku {
        Number(i64),
        Text(String),
    }
    match Sku::deserialize(deserializer)? {
        Sku::Number(value) => Ok(value),
        Sku::Text(value) => value.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Error code carried in `{"error": {"code": ..}}` or a top-level `code`.
fn auth_code(body: &Value) -> Option<String> {
    let code = body
        .get("error")
        .and_then(|e| e.get("code"))
        .or_else(|| body.get("code"))?
        .as_str()?
        .to_ascii_lowercase();
    matches!(code.as_str(), "unauthorized" | "forbidden").then_some(code)
}

/// Checks status and body, then deserializes. 401/403 and error bodies coded
/// `unauthorized`/`forbidden` map to [`OzonError::Unauthorized`].
pub(crate) async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, OzonError> {
    let status = response.status();
    let text = response.text().await.map_err(OzonError::from)?;
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return Err(OzonError::Unauthorized(format!("HTTP {}", status.as_u16())));
    }
    let body: Option<Value> = serde_json::from_str(&text).ok();
    if let Some(code) = body.as_ref().and_then(auth_code) {
        return Err(OzonError::Unauthorized(code));
    }
    if !status.is_success() {
        return Err(OzonError::Status {
            status: status.as_u16(),
            body: text,
        });
    }
    let body = body.ok_or_else(|| OzonError::InvalidResponse("body is not JSON".into()))?;
    serde_json::from_value(body).map_err(|err| OzonError::InvalidResponse(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retry_classification() {
        assert!(OzonError::Timeout.is_retryable());
        assert!(OzonError::Transport("reset".into()).is_retryable());
        assert!(
            OzonError::Status {
                status: 502,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            !OzonError::Status {
                status: 400,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(!OzonError::Unauthorized("forbidden".into()).is_retryable());
        assert!(OzonError::Unauthorized("forbidden".into()).is_auth());
    }

    #[test]
    fn auth_codes_in_error_bodies() {
        assert_eq!(
            auth_code(&json!({"error": {"code": "Unauthorized", "message": "x"}})),
            Some("unauthorized".into())
        );
        assert_eq!(auth_code(&json!({"code": "forbidden"})), Some("forbidden".into()));
        assert_eq!(auth_code(&json!({"error": {"code": "rate_limited"}})), None);
        assert_eq!(auth_code(&json!({"result": []})), None);
    }
}
