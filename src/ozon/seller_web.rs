use super::config::{SELLER_ROOT, browser_headers};
use super::retry::{RetryPolicy, with_retry};
use super::{OzonError, Submission, decode, sku_from_any};
use crate::http::{FETCH_TIMEOUT, SUBMIT_TIMEOUT, build_client};
use crate::ingest::{RawReview, ReviewText};
use crate::models::{Photo, Video};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};

/// Cookie jar of one seller web session, flattened into a `Cookie` header.
#[derive(Debug, Clone)]
pub struct WebSession {
    cookie_header: String,
    company_id: String,
}

impl WebSession {
    /// Parses `name=value; name2=value2` and pins `sc_company_id` to the
    /// seller. Blank input means the credential has no session.
    pub fn parse(raw: Option<&str>, company_id: &str) -> Result<Self, OzonError> {
        let raw = raw
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(OzonError::MissingCredential("session cookies"))?;
        let mut pairs: Vec<(String, String)> = raw
            .split(';')
            .filter_map(|item| item.trim().split_once('='))
            .filter(|(name, _)| !name.is_empty() && *name != "sc_company_id")
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        if pairs.is_empty() {
            return Err(OzonError::MissingCredential("session cookies"));
        }
        pairs.push(("sc_company_id".into(), company_id.to_string()));
        let cookie_header = pairs
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        Ok(Self {
            cookie_header,
            company_id: company_id.to_string(),
        })
    }

    pub fn cookie_header(&self) -> &str {
        &self.cookie_header
    }

    /// Numeric company id when the seller id is numeric.
    fn company_value(&self) -> Value {
        self.company_id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(self.company_id.clone()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebPage {
    #[serde(default)]
    pub result: Vec<WebReview>,
    #[serde(default, deserialize_with = "opt_string_from_any")]
    pub pagination_last_uuid: Option<String>,
    #[serde(default, deserialize_with = "opt_string_from_any")]
    pub pagination_last_timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebReview {
    pub uuid: String,
    #[serde(deserialize_with = "sku_from_any")]
    pub sku: i64,
    #[serde(default)]
    pub text: WebText,
    pub rating: i32,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub interaction_status: Option<String>,
    #[serde(default)]
    pub product: Option<WebProduct>,
    #[serde(default)]
    pub photo: Vec<Photo>,
    #[serde(default)]
    pub video: Vec<Video>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebText {
    #[serde(default)]
    pub advantages: Option<String>,
    #[serde(default)]
    pub disadvantages: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebProduct {
    #[serde(default)]
    pub title: Option<String>,
}

impl From<WebReview> for RawReview {
    fn from(review: WebReview) -> Self {
        RawReview {
            id: review.uuid,
            sku: review.sku,
            text: ReviewText::Sections {
                advantages: review.text.advantages,
                disadvantages: review.text.disadvantages,
                comment: review.text.comment,
            },
            rating: review.rating,
            published_at: review.published_at,
            interaction_status: review.interaction_status,
            order_status: None,
            is_rating_participant: None,
            product_name: review.product.and_then(|p| p.title),
            photos: review.photo,
            videos: review.video,
            comments: Vec::new(),
        }
    }
}

fn opt_string_from_any<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(value)) if !value.is_empty() => Some(value),
        Some(Value::Number(value)) => Some(value.to_string()),
        _ => None,
    })
}

pub fn is_processed_status(status: &str) -> bool {
    matches!(
        status.trim().to_ascii_lowercase().as_str(),
        "processed" | "process"
    )
}

/// Client for the endpoints behind the seller web UI.
#[derive(Debug, Clone)]
pub struct SellerWebClient {
    http: Client,
    root: String,
    retry: RetryPolicy,
}

impl SellerWebClient {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            http: build_client(FETCH_TIMEOUT),
            root: SELLER_ROOT.clone(),
            retry,
        }
    }

    pub fn with_root(mut self, root: &str) -> Self {
        self.root = root.trim_end_matches('/').to_string();
        self
    }

    fn post(&self, session: &WebSession, path: &str) -> RequestBuilder {
        self.http
            .post(format!("{}{}", self.root, path))
            .headers(browser_headers(&session.company_id))
            .header(reqwest::header::COOKIE, session.cookie_header())
    }

    /// One page of reviews after the cursor, oldest first.
    pub async fn list_reviews(
        &self,
        session: &WebSession,
        last_uuid: Option<&str>,
        last_timestamp: Option<&str>,
    ) -> Result<WebPage, OzonError> {
        let mut body = json!({
            "with_counters": false,
            "sort": { "sort_by": "PUBLISHED_AT", "sort_direction": "ASC" },
            "company_type": "seller",
            "filter": { "interaction_status": ["ALL"] },
            "company_id": session.company_value(),
        });
        if let Some(uuid) = last_uuid {
            body["pagination_last_uuid"] = json!(uuid);
        }
        if let Some(timestamp) = last_timestamp {
            body["pagination_last_timestamp"] = json!(timestamp);
        }
        let body = &body;
        with_retry(self.retry, "/api/v3/review/list", || async move {
            let response = self
                .post(session, "/api/v3/review/list")
                .json(body)
                .send()
                .await?;
            decode(response).await
        })
        .await
    }

    /// Single reply attempt. Accepted when the body carries `result: true`.
    pub async fn create_comment(
        &self,
        session: &WebSession,
        review_uuid: &str,
        text: &str,
    ) -> Result<Submission, OzonError> {
        let response = self
            .post(session, "/api/review/comment/create")
            .timeout(SUBMIT_TIMEOUT)
            .json(&json!({
                "text": text,
                "review_uuid": review_uuid,
                "company_type": "seller",
                "company_id": session.company_value(),
            }))
            .send()
            .await?;
        let payload: Value = decode(response).await?;
        let accepted = payload.get("result").and_then(Value::as_bool) == Some(true);
        Ok(Submission { accepted, payload })
    }

    /// Current interaction status of a review as the seller UI reports it.
    pub async fn review_status(
        &self,
        session: &WebSession,
        review_uuid: &str,
    ) -> Result<Option<String>, OzonError> {
        let response = self
            .post(session, "/api/v2/review/detail")
            .timeout(SUBMIT_TIMEOUT)
            .json(&json!({
                "company_id": session.company_value(),
                "company_type": "seller",
                "review_uuid": review_uuid,
            }))
            .send()
            .await?;
        let payload: Value = decode(response).await?;
        Ok(payload
            .get("interaction_status")
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FAST: RetryPolicy = RetryPolicy {
        attempts: 3,
        delay: Duration::ZERO,
    };

    #[test]
    fn cookies_are_parsed_and_company_pinned() {
        let session =
            WebSession::parse(Some(" a=1; junk; b=x=y ;sc_company_id=999"), "42").unwrap();
        assert_eq!(session.cookie_header(), "a=1; b=x=y; sc_company_id=42");

        assert!(matches!(
            WebSession::parse(Some("   "), "42"),
            Err(OzonError::MissingCredential(_))
        ));
        assert!(WebSession::parse(None, "42").unwrap_err().is_auth());
    }

    #[test]
    fn processed_status_matching() {
        assert!(is_processed_status("PROCESSED"));
        assert!(is_processed_status("process"));
        assert!(!is_processed_status("not_viewed"));
    }

    #[tokio::test]
    async fn list_reviews_sends_cursor_and_parses_mixed_types() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/review/list"))
            .and(header("x-o3-company-id", "42"))
            .and(header("cookie", "token=abc; sc_company_id=42"))
            .and(body_partial_json(json!({
                "company_id": 42,
                "sort": { "sort_by": "PUBLISHED_AT", "sort_direction": "ASC" },
                "pagination_last_uuid": "u1",
                "pagination_last_timestamp": "1700000000"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [{
                    "uuid": "u2",
                    "sku": "123",
                    "text": { "advantages": "fast", "comment": "ok" },
                    "rating": 5,
                    "published_at": "2024-05-01T10:00:00Z",
                    "interaction_status": "NOT_VIEWED",
                    "product": { "title": "Чайник" },
                    "photo": [{ "url": "https://img/1.jpg" }]
                }],
                "pagination_last_uuid": "u2",
                "pagination_last_timestamp": 1700000100
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = SellerWebClient::new(FAST).with_root(&server.uri());
        let session = WebSession::parse(Some("token=abc"), "42").unwrap();
        let page = client
            .list_reviews(&session, Some("u1"), Some("1700000000"))
            .await
            .unwrap();
        assert_eq!(page.pagination_last_uuid.as_deref(), Some("u2"));
        assert_eq!(page.pagination_last_timestamp.as_deref(), Some("1700000100"));
        let raw: RawReview = page.result.into_iter().next().unwrap().into();
        assert_eq!(raw.sku, 123);
        assert_eq!(raw.product_name.as_deref(), Some("Чайник"));
        assert_eq!(raw.text.compose(), "Достоинства: fast\nКомментарий: ok");
    }

    #[tokio::test]
    async fn error_body_with_auth_code_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/review/list"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "code": "unauthorized", "message": "session expired" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = SellerWebClient::new(FAST).with_root(&server.uri());
        let session = WebSession::parse(Some("token=abc"), "42").unwrap();
        let err = client.list_reviews(&session, None, None).await.unwrap_err();
        assert!(err.is_auth());
    }
}
