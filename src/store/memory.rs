use super::{InsertOutcome, LeaseAttempt, ReviewStore, StoreError};
use crate::models::{
    Comment, Credential, Cursor, GeneratedResponse, Lease, NewReview, Photo, ProcessingLogEntry,
    ProductInfo, ResponseFilter, Review, ReviewStatus, Video,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

type ReviewKey = (String, String);

/// In-process store. Every operation takes the single state lock, which makes
/// each trait call atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    credentials: BTreeMap<String, Credential>,
    reviews: HashMap<ReviewKey, StoredReview>,
    next_seq: u64,
    responses: HashMap<ReviewKey, GeneratedResponse>,
    prompts: Vec<(String, bool)>,
    product_prompts: BTreeMap<i64, Option<String>>,
    predefined: Vec<String>,
    filters: Vec<ResponseFilter>,
    logs: Vec<ProcessingLogEntry>,
    #[cfg(test)]
    filters_unavailable: bool,
}

struct StoredReview {
    seq: u64,
    review: Review,
    product: ProductInfo,
    photos: Vec<Photo>,
    videos: Vec<Video>,
    comments: Vec<Comment>,
}

fn key(review_id: &str, seller_id: &str) -> ReviewKey {
    (seller_id.to_string(), review_id.to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryStore {
    pub async fn insert_credential(&self, credential: Credential) {
        self.state
            .lock()
            .await
            .credentials
            .insert(credential.id.clone(), credential);
    }

    pub async fn set_active_prompt(&self, content: &str) {
        let mut state = self.state.lock().await;
        for prompt in state.prompts.iter_mut() {
            prompt.1 = false;
        }
        state.prompts.push((content.to_string(), true));
    }

    pub async fn set_product_prompt(&self, sku: i64, prompt: Option<&str>) {
        self.state
            .lock()
            .await
            .product_prompts
            .insert(sku, prompt.map(str::to_string));
    }

    pub async fn add_predefined_response(&self, text: &str) {
        self.state.lock().await.predefined.push(text.to_string());
    }

    pub async fn add_filter(&self, filter: ResponseFilter) {
        self.state.lock().await.filters.push(filter);
    }

    /// Makes `active_filters` fail from now on.
    pub async fn break_filters(&self) {
        self.state.lock().await.filters_unavailable = true;
    }

    pub async fn logs(&self) -> Vec<ProcessingLogEntry> {
        self.state.lock().await.logs.clone()
    }

    pub async fn review_count(&self) -> usize {
        self.state.lock().await.reviews.len()
    }

    pub async fn response_for(&self, review_id: &str, seller_id: &str) -> Option<GeneratedResponse> {
        self.state
            .lock()
            .await
            .responses
            .get(&key(review_id, seller_id))
            .cloned()
    }

    pub async fn media_counts(&self, review_id: &str, seller_id: &str) -> Option<(usize, usize, usize)> {
        self.state
            .lock()
            .await
            .reviews
            .get(&key(review_id, seller_id))
            .map(|stored| (stored.photos.len(), stored.videos.len(), stored.comments.len()))
    }

    pub async fn product_info(&self, review_id: &str, seller_id: &str) -> Option<ProductInfo> {
        self.state
            .lock()
            .await
            .reviews
            .get(&key(review_id, seller_id))
            .map(|stored| stored.product.clone())
    }

    pub async fn has_product_prompt_row(&self, sku: i64) -> bool {
        self.state.lock().await.product_prompts.contains_key(&sku)
    }

    /// Direct insert of a review with its response, skipping ingestion.
    pub async fn seed_review(&self, review: Review, response: Option<&str>) {
        let mut state = self.state.lock().await;
        let k = key(&review.id, &review.seller_id);
        if let Some(text) = response {
            state.responses.insert(
                k.clone(),
                GeneratedResponse {
                    review_id: review.id.clone(),
                    seller_id: review.seller_id.clone(),
                    text: text.to_string(),
                    created_at: Utc::now(),
                },
            );
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let product = ProductInfo {
            review_id: review.id.clone(),
            sku: review.sku,
            product_name: None,
        };
        state.reviews.insert(
            k,
            StoredReview {
                seq,
                review,
                product,
                photos: Vec::new(),
                videos: Vec::new(),
                comments: Vec::new(),
            },
        );
    }
}

fn oldest_first(a: &StoredReview, b: &StoredReview) -> std::cmp::Ordering {
    a.review
        .published_at
        .cmp(&b.review.published_at)
        .then(a.seq.cmp(&b.seq))
}

#[async_trait]
impl ReviewStore for MemoryStore {
    async fn list_credentials(&self) -> Result<Vec<Credential>, StoreError> {
        Ok(self.state.lock().await.credentials.values().cloned().collect())
    }

    async fn credential(&self, id: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self.state.lock().await.credentials.get(id).cloned())
    }

    async fn credential_by_seller(
        &self,
        seller_id: &str,
    ) -> Result<Option<Credential>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .credentials
            .values()
            .find(|c| c.seller_id == seller_id)
            .cloned())
    }

    async fn try_acquire_lease(
        &self,
        credential_id: &str,
        lease: &Lease,
    ) -> Result<LeaseAttempt, StoreError> {
        let mut state = self.state.lock().await;
        let Some(credential) = state.credentials.get_mut(credential_id) else {
            return Ok(LeaseAttempt::Missing);
        };
        if credential.disabled {
            return Ok(LeaseAttempt::Disabled);
        }
        if let Some(current) = &credential.lease
            && current.is_live(Utc::now())
        {
            return Ok(LeaseAttempt::Busy {
                holder: current.holder,
                expires_at: current.expires_at,
            });
        }
        credential.lease = Some(lease.clone());
        Ok(LeaseAttempt::Acquired)
    }

    async fn renew_lease(&self, credential_id: &str, lease: &Lease) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(credential) = state.credentials.get_mut(credential_id) else {
            return Ok(false);
        };
        match &mut credential.lease {
            Some(current) if current.holder == lease.holder => {
                current.expires_at = lease.expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, credential_id: &str, holder: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(credential) = state.credentials.get_mut(credential_id)
            && credential.lease.as_ref().is_some_and(|l| l.holder == holder)
        {
            credential.lease = None;
        }
        Ok(())
    }

    async fn disable_credential(&self, credential_id: &str) -> Result<(), StoreError> {
        if let Some(credential) = self.state.lock().await.credentials.get_mut(credential_id) {
            credential.disabled = true;
        }
        Ok(())
    }

    async fn save_cursor(&self, credential_id: &str, cursor: &Cursor) -> Result<(), StoreError> {
        if let Some(credential) = self.state.lock().await.credentials.get_mut(credential_id) {
            credential.cursor = cursor.clone();
        }
        Ok(())
    }

    async fn review_exists(&self, review_id: &str, seller_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .reviews
            .contains_key(&key(review_id, seller_id)))
    }

    async fn insert_review(&self, new: &NewReview) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let k = key(&new.review.id, &new.review.seller_id);
        if state.reviews.contains_key(&k) {
            return Ok(InsertOutcome::Duplicate);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.reviews.insert(
            k,
            StoredReview {
                seq,
                review: new.review.clone(),
                product: new.product.clone(),
                photos: new.photos.clone(),
                videos: new.videos.clone(),
                comments: new.comments.clone(),
            },
        );
        state.product_prompts.entry(new.review.sku).or_insert(None);
        Ok(InsertOutcome::Inserted)
    }

    async fn review(&self, review_id: &str, seller_id: &str) -> Result<Option<Review>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .reviews
            .get(&key(review_id, seller_id))
            .map(|stored| stored.review.clone()))
    }

    async fn reviews_awaiting_response(
        &self,
        seller_id: &str,
        limit: usize,
    ) -> Result<Vec<(Review, Option<ProductInfo>)>, StoreError> {
        let state = self.state.lock().await;
        let mut pending: Vec<&StoredReview> = state
            .reviews
            .iter()
            .filter(|(k, stored)| {
                k.0 == seller_id
                    && stored.review.status == ReviewStatus::Unprocessed
                    && !state.responses.contains_key(*k)
            })
            .map(|(_, stored)| stored)
            .collect();
        pending.sort_by(|a, b| oldest_first(a, b));
        Ok(pending
            .into_iter()
            .take(limit)
            .map(|stored| (stored.review.clone(), Some(stored.product.clone())))
            .collect())
    }

    async fn save_response(&self, response: &GeneratedResponse) -> Result<(), StoreError> {
        self.state.lock().await.responses.insert(
            key(&response.review_id, &response.seller_id),
            response.clone(),
        );
        Ok(())
    }

    async fn reviews_with_response(
        &self,
        status: ReviewStatus,
        filter: Option<&ResponseFilter>,
    ) -> Result<Vec<(Review, GeneratedResponse)>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<(&StoredReview, &GeneratedResponse)> = state
            .reviews
            .iter()
            .filter(|(_, stored)| stored.review.status == status)
            .filter(|(_, stored)| filter.is_none_or(|f| f.matches(&stored.review)))
            .filter_map(|(k, stored)| state.responses.get(k).map(|resp| (stored, resp)))
            .collect();
        rows.sort_by(|a, b| oldest_first(a.0, b.0));
        Ok(rows
            .into_iter()
            .map(|(stored, resp)| (stored.review.clone(), resp.clone()))
            .collect())
    }

    async fn compare_and_set_status(
        &self,
        review_id: &str,
        seller_id: &str,
        from: ReviewStatus,
        to: ReviewStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.reviews.get_mut(&key(review_id, seller_id)) {
            Some(stored) if stored.review.status == from => {
                stored.review.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn active_prompt(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .prompts
            .iter()
            .find(|(_, active)| *active)
            .map(|(content, _)| content.clone()))
    }

    async fn product_prompt(&self, sku: i64) -> Result<Option<String>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .product_prompts
            .get(&sku)
            .cloned()
            .flatten()
            .filter(|p| !p.trim().is_empty()))
    }

    async fn predefined_responses(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.state.lock().await.predefined.clone())
    }

    async fn active_filters(&self) -> Result<Vec<ResponseFilter>, StoreError> {
        let state = self.state.lock().await;
        #[cfg(test)]
        if state.filters_unavailable {
            return Err(StoreError::Request("filters unavailable".into()));
        }
        Ok(state
            .filters
            .iter()
            .filter(|f| f.is_active)
            .cloned()
            .collect())
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<(), StoreError> {
        self.state.lock().await.logs.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransitionError;

    fn review(id: &str, status: ReviewStatus) -> Review {
        Review {
            id: id.into(),
            seller_id: "s1".into(),
            sku: 1,
            text: "text".into(),
            rating: 5,
            status,
            published_at: Utc::now(),
            order_status: None,
            is_rating_participant: None,
        }
    }

    #[tokio::test]
    async fn transition_rejects_illegal_moves_before_writing() {
        let store = MemoryStore::new();
        store.seed_review(review("r1", ReviewStatus::Unprocessed), Some("hi")).await;

        let err = store
            .transition_review("r1", "s1", ReviewStatus::Unprocessed, ReviewStatus::Processed)
            .await
            .expect_err("illegal");
        assert!(matches!(
            err,
            StoreError::Transition(TransitionError {
                from: ReviewStatus::Unprocessed,
                to: ReviewStatus::Processed
            })
        ));
        let stored = store.review("r1", "s1").await.unwrap().unwrap();
        assert_eq!(stored.status, ReviewStatus::Unprocessed);
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = MemoryStore::new();
        store.seed_review(review("r1", ReviewStatus::Unprocessed), Some("hi")).await;

        let moved = store
            .transition_review("r1", "s1", ReviewStatus::InQueue, ReviewStatus::Processed)
            .await
            .unwrap();
        assert!(!moved, "stored status is not InQueue");

        assert!(
            store
                .transition_review("r1", "s1", ReviewStatus::Unprocessed, ReviewStatus::InQueue)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn released_claim_returns_to_the_previous_status() {
        let store = MemoryStore::new();
        store.seed_review(review("r1", ReviewStatus::InQueue), Some("hi")).await;

        assert!(
            store
                .release_claim("r1", "s1", ReviewStatus::Unprocessed)
                .await
                .unwrap()
        );
        let stored = store.review("r1", "s1").await.unwrap().unwrap();
        assert_eq!(stored.status, ReviewStatus::Unprocessed);

        // nothing to release once the review left InQueue
        assert!(
            !store
                .release_claim("r1", "s1", ReviewStatus::Unprocessed)
                .await
                .unwrap()
        );
        // PROCESSED never enters InQueue, so it is never a claim origin
        assert!(
            store
                .release_claim("r1", "s1", ReviewStatus::Processed)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn awaiting_response_excludes_answered_and_other_sellers() {
        let store = MemoryStore::new();
        store.seed_review(review("a", ReviewStatus::Unprocessed), None).await;
        store.seed_review(review("b", ReviewStatus::Unprocessed), Some("done")).await;
        store.seed_review(review("c", ReviewStatus::Processed), None).await;
        let mut other = review("d", ReviewStatus::Unprocessed);
        other.seller_id = "s2".into();
        store.seed_review(other, None).await;

        let pending = store.reviews_awaiting_response("s1", 10).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|(r, _)| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }
}
