use super::{InsertOutcome, LeaseAttempt, ReviewStore, StoreError};
use crate::http::{FETCH_TIMEOUT, build_client};
use crate::models::{
    Credential, Cursor, GeneratedResponse, Lease, NewReview, ProcessingLogEntry, ProductInfo,
    ResponseFilter, Review, ReviewStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use serde_with::skip_serializing_none;
use tracing::debug;
use urlencoding::encode;
use uuid::Uuid;

/// Store backed by the PostgREST API in front of the review database.
#[derive(Debug, Clone)]
pub struct PostgrestStore {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct CredentialRow {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(deserialize_with = "id_string")]
    seller_id: String,
    ozon_api_key: Option<String>,
    gpt_api_key: Option<String>,
    gpt_folder: Option<String>,
    session_cookies: Option<String>,
    reply_cookies: Option<String>,
    #[serde(default)]
    is_premium: Option<bool>,
    cursor_last_id: Option<String>,
    cursor_timestamp: Option<String>,
    lease_holder: Option<Uuid>,
    lease_until: Option<DateTime<Utc>>,
    #[serde(default)]
    disabled: Option<bool>,
}

impl From<CredentialRow> for Credential {
    fn from(row: CredentialRow) -> Self {
        let lease = match (row.lease_holder, row.lease_until) {
            (Some(holder), Some(expires_at)) => Some(Lease { holder, expires_at }),
            _ => None,
        };
        Credential {
            id: row.id,
            seller_id: row.seller_id,
            ozon_api_key: row.ozon_api_key.filter(|v| !v.trim().is_empty()),
            gpt_api_key: row.gpt_api_key.filter(|v| !v.trim().is_empty()),
            gpt_folder: row.gpt_folder.filter(|v| !v.trim().is_empty()),
            session_cookies: row.session_cookies.filter(|v| !v.trim().is_empty()),
            reply_cookies: row.reply_cookies.filter(|v| !v.trim().is_empty()),
            is_premium: row.is_premium.unwrap_or(false),
            cursor: Cursor::new(row.cursor_last_id, row.cursor_timestamp),
            lease,
            disabled: row.disabled.unwrap_or(false),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LeaseRow {
    #[serde(default)]
    disabled: Option<bool>,
    lease_holder: Option<Uuid>,
    lease_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ReviewRow {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(deserialize_with = "id_string")]
    client_id: String,
    sku: i64,
    #[serde(default)]
    text: Option<String>,
    rating: i32,
    status: String,
    published_at: DateTime<Utc>,
    #[serde(default)]
    order_status: Option<String>,
    #[serde(default)]
    is_rating_participant: Option<bool>,
    #[serde(default)]
    product_info: Option<Embedded<ProductInfoRow>>,
    #[serde(default)]
    neural_responses: Option<Embedded<ResponseRow>>,
}

impl ReviewRow {
    fn into_parts(
        self,
    ) -> Result<(Review, Option<ProductInfoRow>, Option<ResponseRow>), StoreError> {
        let status = ReviewStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Deserialize(format!("unknown review status {:?}", self.status))
        })?;
        let review = Review {
            id: self.id,
            seller_id: self.client_id,
            sku: self.sku,
            text: self.text.unwrap_or_default(),
            rating: self.rating,
            status,
            published_at: self.published_at,
            order_status: self.order_status,
            is_rating_participant: self.is_rating_participant,
        };
        Ok((
            review,
            self.product_info.and_then(Embedded::into_first),
            self.neural_responses.and_then(Embedded::into_first),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ProductInfoRow {
    #[serde(default)]
    product_name: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize)]
struct ResponseRow {
    #[serde(deserialize_with = "id_string")]
    review_id: String,
    #[serde(deserialize_with = "id_string")]
    client_id: String,
    response: String,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct FilterRow {
    #[serde(deserialize_with = "id_string")]
    id: String,
    rating: Option<i32>,
    has_text: Option<bool>,
    #[serde(default)]
    is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct PromptRow {
    #[serde(alias = "content")]
    prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TextRow {
    text: Option<String>,
}

/// PostgREST embeds a to-one relation as an object and a to-many as an array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Embedded<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Embedded<T> {
    fn into_first(self) -> Option<T> {
        match self {
            Embedded::Many(items) => items.into_iter().next(),
            Embedded::One(item) => Some(item),
        }
    }
}

fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Text(value) => value,
        Id::Number(value) => value.to_string(),
    })
}

impl PostgrestStore {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self::new(&base_url, &service_key))
    }

    pub fn new(base_url: &str, service_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
            http: build_client(FETCH_TIMEOUT),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/rest/v1/{}", self.base_url, path))
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send(builder: RequestBuilder) -> Result<Response, StoreError> {
        let response = builder
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn rows<T: DeserializeOwned>(builder: RequestBuilder) -> Result<Vec<T>, StoreError> {
        Self::send(builder)
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, StoreError> {
        debug!(target = "reviews.store", path, "select");
        Self::rows(self.request(Method::GET, path)).await
    }

    /// PATCH that reports how many rows matched the filter.
    async fn patch_count(&self, path: &str, body: serde_json::Value) -> Result<usize, StoreError> {
        let rows: Vec<serde_json::Value> = Self::rows(
            self.request(Method::PATCH, path)
                .header("Prefer", "return=representation")
                .json(&body),
        )
        .await?;
        Ok(rows.len())
    }

    async fn insert<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), StoreError> {
        Self::send(
            self.request(Method::POST, path)
                .header("Prefer", "return=minimal")
                .json(body),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ReviewStore for PostgrestStore {
    async fn list_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        let rows: Vec<CredentialRow> = self.get("api_keys?select=*&order=id.asc").await?;
        Ok(rows.into_iter().map(Credential::from).collect())
    }

    async fn credential(&self, id: &str) -> Result<Option<Credential>, StoreError> {
        let rows: Vec<CredentialRow> = self
            .get(&format!("api_keys?id=eq.{}&select=*&limit=1", encode(id)))
            .await?;
        Ok(rows.into_iter().next().map(Credential::from))
    }

    async fn credential_by_seller(
        &self,
        seller_id: &str,
    ) -> Result<Option<Credential>, StoreError> {
        let rows: Vec<CredentialRow> = self
            .get(&format!(
                "api_keys?seller_id=eq.{}&select=*&limit=1",
                encode(seller_id)
            ))
            .await?;
        Ok(rows.into_iter().next().map(Credential::from))
    }

    async fn try_acquire_lease(
        &self,
        credential_id: &str,
        lease: &Lease,
    ) -> Result<LeaseAttempt, StoreError> {
        let now = Utc::now().to_rfc3339();
        let path = format!(
            "api_keys?id=eq.{}&disabled=is.false&or=(lease_until.is.null,lease_until.lt.{})",
            encode(credential_id),
            encode(&now)
        );
        let taken = self
            .patch_count(
                &path,
                json!({ "lease_holder": lease.holder, "lease_until": lease.expires_at }),
            )
            .await?;
        if taken > 0 {
            return Ok(LeaseAttempt::Acquired);
        }

        let rows: Vec<LeaseRow> = self
            .get(&format!(
                "api_keys?id=eq.{}&select=disabled,lease_holder,lease_until&limit=1",
                encode(credential_id)
            ))
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(LeaseAttempt::Missing);
        };
        if row.disabled.unwrap_or(false) {
            return Ok(LeaseAttempt::Disabled);
        }
        Ok(LeaseAttempt::Busy {
            holder: row.lease_holder.unwrap_or_else(Uuid::nil),
            expires_at: row.lease_until.unwrap_or_else(Utc::now),
        })
    }

    async fn renew_lease(&self, credential_id: &str, lease: &Lease) -> Result<bool, StoreError> {
        let path = format!(
            "api_keys?id=eq.{}&lease_holder=eq.{}",
            encode(credential_id),
            lease.holder
        );
        let matched = self
            .patch_count(&path, json!({ "lease_until": lease.expires_at }))
            .await?;
        Ok(matched > 0)
    }

    async fn release_lease(&self, credential_id: &str, holder: Uuid) -> Result<(), StoreError> {
        let path = format!(
            "api_keys?id=eq.{}&lease_holder=eq.{}",
            encode(credential_id),
            holder
        );
        self.patch_count(&path, json!({ "lease_holder": null, "lease_until": null }))
            .await?;
        Ok(())
    }

    async fn disable_credential(&self, credential_id: &str) -> Result<(), StoreError> {
        let path = format!("api_keys?id=eq.{}", encode(credential_id));
        self.patch_count(&path, json!({ "disabled": true })).await?;
        Ok(())
    }

    async fn save_cursor(&self, credential_id: &str, cursor: &Cursor) -> Result<(), StoreError> {
        let path = format!("api_keys?id=eq.{}", encode(credential_id));
        self.patch_count(
            &path,
            json!({
                "cursor_last_id": cursor.last_id(),
                "cursor_timestamp": cursor.last_timestamp(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn review_exists(&self, review_id: &str, seller_id: &str) -> Result<bool, StoreError> {
        let rows: Vec<serde_json::Value> = self
            .get(&format!(
                "reviews?id=eq.{}&client_id=eq.{}&select=id&limit=1",
                encode(review_id),
                encode(seller_id)
            ))
            .await?;
        Ok(!rows.is_empty())
    }

    async fn insert_review(&self, review: &NewReview) -> Result<InsertOutcome, StoreError> {
        // The function writes every table in one transaction and returns
        // false when the review row already exists.
        let inserted: bool = Self::send(
            self.request(Method::POST, "rpc/ingest_review")
                .json(&json!({ "payload": review })),
        )
        .await?
        .json()
        .await
        .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        Ok(if inserted {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        })
    }

    async fn review(&self, review_id: &str, seller_id: &str) -> Result<Option<Review>, StoreError> {
        let rows: Vec<ReviewRow> = self
            .get(&format!(
                "reviews?id=eq.{}&client_id=eq.{}&select=*&limit=1",
                encode(review_id),
                encode(seller_id)
            ))
            .await?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(row.into_parts()?.0)),
            None => Ok(None),
        }
    }

    async fn reviews_awaiting_response(
        &self,
        seller_id: &str,
        limit: usize,
    ) -> Result<Vec<(Review, Option<ProductInfo>)>, StoreError> {
        let rows: Vec<ReviewRow> = self
            .get(&format!(
                "reviews?select=*,product_info(product_name),neural_responses(review_id)\
                 &client_id=eq.{}&status=eq.{}&neural_responses=is.null\
                 &order=published_at.asc&limit={}",
                encode(seller_id),
                ReviewStatus::Unprocessed,
                limit
            ))
            .await?;
        rows.into_iter()
            .map(|row| {
                let (review, product, _) = row.into_parts()?;
                let product = product.map(|p| ProductInfo {
                    review_id: review.id.clone(),
                    sku: review.sku,
                    product_name: p.product_name,
                });
                Ok((review, product))
            })
            .collect()
    }

    async fn save_response(&self, response: &GeneratedResponse) -> Result<(), StoreError> {
        let row = ResponseRow {
            review_id: response.review_id.clone(),
            client_id: response.seller_id.clone(),
            response: response.text.clone(),
            created_at: Some(response.created_at),
        };
        Self::send(
            self.request(Method::POST, "neural_responses?on_conflict=review_id,client_id")
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&[row]),
        )
        .await?;
        Ok(())
    }

    async fn reviews_with_response(
        &self,
        status: ReviewStatus,
        filter: Option<&ResponseFilter>,
    ) -> Result<Vec<(Review, GeneratedResponse)>, StoreError> {
        let mut path = format!(
            "reviews?select=*,neural_responses!inner(*)&status=eq.{status}&order=published_at.asc"
        );
        if let Some(filter) = filter {
            if let Some(rating) = filter.rating {
                path.push_str(&format!("&rating=eq.{rating}"));
            }
            match filter.has_text {
                Some(true) => path.push_str("&text=neq."),
                Some(false) => path.push_str("&or=(text.is.null,text.eq.)"),
                None => {}
            }
        }
        let rows: Vec<ReviewRow> = self.get(&path).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let (review, _, response) = row.into_parts()?;
            // rows without an embedded response are skipped
            let Some(response) = response else { continue };
            let generated = GeneratedResponse {
                review_id: review.id.clone(),
                seller_id: review.seller_id.clone(),
                text: response.response,
                created_at: response.created_at.unwrap_or(review.published_at),
            };
            out.push((review, generated));
        }
        Ok(out)
    }

    async fn compare_and_set_status(
        &self,
        review_id: &str,
        seller_id: &str,
        from: ReviewStatus,
        to: ReviewStatus,
    ) -> Result<bool, StoreError> {
        let path = format!(
            "reviews?id=eq.{}&client_id=eq.{}&status=eq.{}",
            encode(review_id),
            encode(seller_id),
            from
        );
        let matched = self.patch_count(&path, json!({ "status": to })).await?;
        Ok(matched > 0)
    }

    async fn active_prompt(&self) -> Result<Option<String>, StoreError> {
        let rows: Vec<PromptRow> = self
            .get("prompts?is_active=is.true&select=content&order=id.desc&limit=1")
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.prompt)
            .filter(|p| !p.trim().is_empty()))
    }

    async fn product_prompt(&self, sku: i64) -> Result<Option<String>, StoreError> {
        let rows: Vec<PromptRow> = self
            .get(&format!("product_prompts?sku=eq.{sku}&select=prompt&limit=1"))
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.prompt)
            .filter(|p| !p.trim().is_empty()))
    }

    async fn predefined_responses(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<TextRow> = self.get("predefined_responses?select=text").await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.text)
            .filter(|t| !t.trim().is_empty())
            .collect())
    }

    async fn active_filters(&self) -> Result<Vec<ResponseFilter>, StoreError> {
        let rows: Vec<FilterRow> = self
            .get("review_filters?is_active=is.true&select=*&order=id.asc")
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| ResponseFilter {
                id: row.id,
                rating: row.rating,
                has_text: row.has_text,
                is_active: row.is_active.unwrap_or(true),
            })
            .collect())
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<(), StoreError> {
        match entry {
            ProcessingLogEntry::Generation {
                status,
                review_text,
                response_text,
                created_at,
            } => {
                self.insert(
                    "logs_neuro",
                    &json!({
                        "status": status,
                        "review_text": review_text,
                        "response_text": response_text,
                        "created_at": created_at,
                    }),
                )
                .await
            }
            ProcessingLogEntry::Event {
                status,
                message,
                timestamp,
            } => {
                self.insert(
                    "logs",
                    &json!({ "status": status, "message": message, "timestamp": timestamp }),
                )
                .await
            }
        }
    }
}
