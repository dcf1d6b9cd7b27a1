//! Relational store seam.
//!
//! The tables behind this trait are owned by the CRUD service; the pipeline
//! only reads and updates rows. Two backends exist: [`PostgrestStore`] talks
//! to the PostgREST endpoint in front of the database, [`MemoryStore`] keeps
//! everything in process for local runs and tests.

mod memory;
mod postgrest;

pub use memory::MemoryStore;
pub use postgrest::PostgrestStore;

use crate::models::{
    Credential, Cursor, GeneratedResponse, Lease, NewReview, ProcessingLogEntry, ProductInfo,
    ResponseFilter, Review, ReviewStatus, TransitionError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAttempt {
    Acquired,
    Busy {
        holder: Uuid,
        expires_at: DateTime<Utc>,
    },
    Disabled,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[async_trait]
pub trait ReviewStore: Send + Sync + 'static {
    async fn list_credentials(&self) -> Result<Vec<Credential>, StoreError>;

    async fn credential(&self, id: &str) -> Result<Option<Credential>, StoreError>;

    async fn credential_by_seller(&self, seller_id: &str)
    -> Result<Option<Credential>, StoreError>;

    /// Takes the lease when the credential is enabled and no live lease is
    /// held. Must be a single conditional write so two workers can't both win.
    async fn try_acquire_lease(
        &self,
        credential_id: &str,
        lease: &Lease,
    ) -> Result<LeaseAttempt, StoreError>;

    /// Extends the lease if `lease.holder` still owns it.
    async fn renew_lease(&self, credential_id: &str, lease: &Lease) -> Result<bool, StoreError>;

    /// Clears the lease if `holder` still owns it.
    async fn release_lease(&self, credential_id: &str, holder: Uuid) -> Result<(), StoreError>;

    async fn disable_credential(&self, credential_id: &str) -> Result<(), StoreError>;

    async fn save_cursor(&self, credential_id: &str, cursor: &Cursor) -> Result<(), StoreError>;

    async fn review_exists(&self, review_id: &str, seller_id: &str) -> Result<bool, StoreError>;

    /// Writes the review, its product info, media and comments, plus an empty
    /// product prompt placeholder when the SKU has none, all or nothing.
    /// Returns `Duplicate` without writing if the review is already stored.
    async fn insert_review(&self, review: &NewReview) -> Result<InsertOutcome, StoreError>;

    async fn review(&self, review_id: &str, seller_id: &str) -> Result<Option<Review>, StoreError>;

    /// `UNPROCESSED` reviews of the seller that have no generated response yet.
    async fn reviews_awaiting_response(
        &self,
        seller_id: &str,
        limit: usize,
    ) -> Result<Vec<(Review, Option<ProductInfo>)>, StoreError>;

    /// Inserts or overwrites the single response of a review.
    async fn save_response(&self, response: &GeneratedResponse) -> Result<(), StoreError>;

    /// Reviews in `status` that have a generated response, optionally narrowed
    /// by a filter, oldest first.
    async fn reviews_with_response(
        &self,
        status: ReviewStatus,
        filter: Option<&ResponseFilter>,
    ) -> Result<Vec<(Review, GeneratedResponse)>, StoreError>;

    /// Compare-and-set of the status column. Returns `false` when the stored
    /// status was not `from`.
    async fn compare_and_set_status(
        &self,
        review_id: &str,
        seller_id: &str,
        from: ReviewStatus,
        to: ReviewStatus,
    ) -> Result<bool, StoreError>;

    async fn active_prompt(&self) -> Result<Option<String>, StoreError>;

    /// Non-empty custom prompt for the SKU, if any.
    async fn product_prompt(&self, sku: i64) -> Result<Option<String>, StoreError>;

    async fn predefined_responses(&self) -> Result<Vec<String>, StoreError>;

    /// Active filters in a stable order.
    async fn active_filters(&self) -> Result<Vec<ResponseFilter>, StoreError>;

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<(), StoreError>;

    /// Validated status change; illegal transitions never reach the backend.
    async fn transition_review(
        &self,
        review_id: &str,
        seller_id: &str,
        from: ReviewStatus,
        to: ReviewStatus,
    ) -> Result<bool, StoreError> {
        from.transition(to)?;
        self.compare_and_set_status(review_id, seller_id, from, to)
            .await
    }

    /// Undoes a `from -> InQueue` claim whose message was never published.
    /// Only a status that may legally enter `InQueue` can be restored.
    async fn release_claim(
        &self,
        review_id: &str,
        seller_id: &str,
        from: ReviewStatus,
    ) -> Result<bool, StoreError> {
        from.transition(ReviewStatus::InQueue)?;
        self.compare_and_set_status(review_id, seller_id, ReviewStatus::InQueue, from)
            .await
    }
}
