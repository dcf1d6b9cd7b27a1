use crate::models::{
    Comment, NewReview, Photo, ProductInfo, Review, ReviewStatus, Video,
};
use crate::store::{InsertOutcome, ReviewStore, StoreError};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Review body as the marketplace delivers it.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewText {
    /// Official API: one free-text field, stored as is.
    Plain(String),
    /// Seller web: labelled sub-fields.
    Sections {
        advantages: Option<String>,
        disadvantages: Option<String>,
        comment: Option<String>,
    },
}

impl ReviewText {
    pub fn compose(&self) -> String {
        match self {
            ReviewText::Plain(text) => text.clone(),
            ReviewText::Sections {
                advantages,
                disadvantages,
                comment,
            } => [
                ("Достоинства: ", advantages),
                ("Недостатки: ", disadvantages),
                ("Комментарий: ", comment),
            ]
            .into_iter()
            .filter_map(|(label, value)| {
                value
                    .as_deref()
                    .filter(|v| !v.is_empty())
                    .map(|v| format!("{label}{v}"))
            })
            .collect::<Vec<_>>()
            .join("\n"),
        }
    }
}

/// A review as fetched, before it is normalised into store rows.
#[derive(Debug, Clone)]
pub struct RawReview {
    pub id: String,
    pub sku: i64,
    pub text: ReviewText,
    pub rating: i32,
    pub published_at: Option<String>,
    pub interaction_status: Option<String>,
    pub order_status: Option<String>,
    pub is_rating_participant: Option<bool>,
    pub product_name: Option<String>,
    pub photos: Vec<Photo>,
    pub videos: Vec<Video>,
    pub comments: Vec<Comment>,
}

pub fn initial_status(interaction_status: Option<&str>) -> ReviewStatus {
    match interaction_status {
        Some(status) if status.trim().eq_ignore_ascii_case("processed") => ReviewStatus::Processed,
        _ => ReviewStatus::Unprocessed,
    }
}

/// RFC 3339 timestamp; missing or unparsable values fall back to now.
pub fn parse_published_at(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return Utc::now();
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => parsed.with_timezone(&Utc),
        Err(err) => {
            warn!(target = "reviews.fetch", value = raw, error = %err, "unparsable published_at");
            Utc::now()
        }
    }
}

impl RawReview {
    pub fn into_new_review(self, seller_id: &str) -> NewReview {
        let review = Review {
            id: self.id.clone(),
            seller_id: seller_id.to_string(),
            sku: self.sku,
            text: self.text.compose(),
            rating: self.rating,
            status: initial_status(self.interaction_status.as_deref()),
            published_at: parse_published_at(self.published_at.as_deref()),
            order_status: self.order_status,
            is_rating_participant: self.is_rating_participant,
        };
        NewReview {
            product: ProductInfo {
                review_id: self.id,
                sku: self.sku,
                product_name: self.product_name,
            },
            review,
            photos: self.photos,
            videos: self.videos,
            comments: self.comments,
        }
    }
}

/// Stores a fetched review unless (id, seller) is already known.
pub async fn ingest(
    store: &dyn ReviewStore,
    raw: RawReview,
    seller_id: &str,
) -> Result<InsertOutcome, StoreError> {
    if store.review_exists(&raw.id, seller_id).await? {
        debug!(target = "reviews.fetch", review_id = %raw.id, seller_id, "duplicate review");
        return Ok(InsertOutcome::Duplicate);
    }
    let new = raw.into_new_review(seller_id);
    let outcome = store.insert_review(&new).await?;
    if outcome == InsertOutcome::Inserted {
        debug!(
            target = "reviews.fetch",
            review_id = %new.review.id,
            seller_id,
            status = %new.review.status,
            "review stored"
        );
    }
    Ok(outcome)
}
