use super::config::API_ROOT;
use super::retry::{RetryPolicy, with_retry};
use super::{OzonError, Submission, decode, sku_from_any};
use crate::http::{FETCH_TIMEOUT, SUBMIT_TIMEOUT, build_client};
use crate::ingest::{RawReview, ReviewText};
use crate::models::{Comment, Credential, Photo, Video};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// `Client-Id` / `Api-Key` pair of a premium credential.
#[derive(Debug, Clone, Copy)]
pub struct ApiAuth<'a> {
    pub client_id: &'a str,
    pub api_key: &'a str,
}

impl<'a> ApiAuth<'a> {
    pub fn from_credential(credential: &'a Credential) -> Result<Self, OzonError> {
        let api_key = credential
            .ozon_api_key
            .as_deref()
            .ok_or(OzonError::MissingCredential("seller API key"))?;
        Ok(Self {
            client_id: &credential.seller_id,
            api_key,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ListRequest<'a> {
    status: &'static str,
    last_id: &'a str,
    limit: u32,
    sort_dir: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewPage {
    #[serde(default)]
    pub reviews: Vec<ApiReview>,
    #[serde(default)]
    pub last_id: Option<String>,
    #[serde(default)]
    pub has_next: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiReview {
    pub id: String,
    #[serde(deserialize_with = "sku_from_any")]
    pub sku: i64,
    #[serde(default)]
    pub text: String,
    pub rating: i32,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub order_status: Option<String>,
    #[serde(default)]
    pub is_rating_participant: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReviewInfo {
    #[serde(default)]
    pub photos: Vec<Photo>,
    #[serde(default)]
    pub videos: Vec<Video>,
}

#[derive(Debug, Deserialize)]
struct CommentPage {
    #[serde(default)]
    comments: Vec<Comment>,
}

#[derive(Debug, Deserialize)]
struct ProductList {
    #[serde(default)]
    items: Vec<ProductItem>,
}

#[derive(Debug, Deserialize)]
struct ProductItem {
    #[serde(default)]
    name: Option<String>,
}

impl ApiReview {
    pub fn into_raw(
        self,
        info: ReviewInfo,
        comments: Vec<Comment>,
        product_name: Option<String>,
    ) -> RawReview {
        RawReview {
            id: self.id,
            sku: self.sku,
            text: ReviewText::Plain(self.text),
            rating: self.rating,
            published_at: self.published_at,
            interaction_status: self.status,
            order_status: self.order_status,
            is_rating_participant: self.is_rating_participant,
            product_name,
            photos: info.photos,
            videos: info.videos,
            comments,
        }
    }
}

/// Client for the official seller API.
#[derive(Debug, Clone)]
pub struct SellerApiClient {
    http: Client,
    root: String,
    retry: RetryPolicy,
}

impl SellerApiClient {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            http: build_client(FETCH_TIMEOUT),
            root: API_ROOT.clone(),
            retry,
        }
    }

    pub fn with_root(mut self, root: &str) -> Self {
        self.root = root.trim_end_matches('/').to_string();
        self
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        auth: ApiAuth<'_>,
        path: &str,
        body: &Value,
    ) -> Result<T, OzonError> {
        let url = &format!("{}{}", self.root, path);
        let http = &self.http;
        with_retry(self.retry, path, || async move {
            let response = http
                .post(url)
                .header("Client-Id", auth.client_id)
                .header("Api-Key", auth.api_key)
                .json(body)
                .send()
                .await?;
            decode(response).await
        })
        .await
    }

    /// Up to `limit` reviews after `last_id`, oldest first.
    pub async fn list_reviews(
        &self,
        auth: ApiAuth<'_>,
        last_id: Option<&str>,
        limit: u32,
    ) -> Result<ReviewPage, OzonError> {
        let body = serde_json::to_value(ListRequest {
            status: "ALL",
            last_id: last_id.unwrap_or_default(),
            limit,
            sort_dir: "ASC",
        })
        .map_err(|err| OzonError::InvalidResponse(err.to_string()))?;
        self.call(auth, "/v1/review/list", &body).await
    }

    pub async fn review_info(
        &self,
        auth: ApiAuth<'_>,
        review_id: &str,
    ) -> Result<ReviewInfo, OzonError> {
        self.call(auth, "/v1/review/info", &json!({ "review_id": review_id }))
            .await
    }

    pub async fn comments(
        &self,
        auth: ApiAuth<'_>,
        review_id: &str,
    ) -> Result<Vec<Comment>, OzonError> {
        let page: CommentPage = self
            .call(
                auth,
                "/v1/review/comment/list",
                &json!({
                    "review_id": review_id,
                    "limit": 100,
                    "offset": 0,
                    "sort_dir": "ASC",
                }),
            )
            .await?;
        Ok(page.comments)
    }

    pub async fn product_name(
        &self,
        auth: ApiAuth<'_>,
        sku: i64,
    ) -> Result<Option<String>, OzonError> {
        let list: ProductList = self
            .call(
                auth,
                "/v3/product/info/list",
                &json!({ "sku": [sku.to_string()] }),
            )
            .await?;
        Ok(list
            .items
            .into_iter()
            .next()
            .and_then(|item| item.name)
            .filter(|name| !name.trim().is_empty()))
    }

    /// Single submission attempt; the caller owns the retry loop.
    pub async fn create_comment(
        &self,
        auth: ApiAuth<'_>,
        review_id: &str,
        text: &str,
    ) -> Result<Submission, OzonError> {
        let response = self
            .http
            .post(format!("{}/v1/review/comment/create", self.root))
            .timeout(SUBMIT_TIMEOUT)
            .header("Client-Id", auth.client_id)
            .header("Api-Key", auth.api_key)
            .json(&json!({
                "mark_review_as_processed": true,
                "parent_comment_id": null,
                "review_id": review_id,
                "text": text,
            }))
            .send()
            .await?;
        let payload: Value = decode(response).await?;
        let accepted = payload
            .get("comment_id")
            .is_some_and(|id| !id.is_null() && id.as_str() != Some(""));
        Ok(Submission { accepted, payload })
    }
}
