use super::{DurableQueue, ReplyMessage};
use crate::models::{GeneratedResponse, ProcessingLogEntry, Review, ReviewStatus};
use crate::store::{ReviewStore, StoreError};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

enum Enqueue {
    Sent,
    /// Someone else moved the review first.
    Skipped,
    Failed,
}

pub struct Producer {
    store: Arc<dyn ReviewStore>,
    queue: Arc<dyn DurableQueue>,
    queue_name: String,
}

impl Producer {
    pub fn new(store: Arc<dyn ReviewStore>, queue: Arc<dyn DurableQueue>, queue_name: &str) -> Self {
        Self {
            store,
            queue,
            queue_name: queue_name.to_string(),
        }
    }

    /// Moves one review `from -> InQueue` and publishes it. The status is
    /// claimed before the message exists, so a consumer never sees a message
    /// for a review that is not yet `InQueue`.
    async fn enqueue(
        &self,
        review: &Review,
        response: &GeneratedResponse,
        from: ReviewStatus,
        filter_id: Option<&str>,
    ) -> Result<Enqueue, StoreError> {
        let message = ReplyMessage::new(review, response, filter_id);
        let body = match serde_json::to_string(&message) {
            Ok(body) => body,
            Err(err) => {
                warn!(target = "reviews.dispatch", review_id = %review.id, error = %err, "failed to encode message");
                return Ok(Enqueue::Failed);
            }
        };
        let claimed = self
            .store
            .transition_review(&review.id, &review.seller_id, from, ReviewStatus::InQueue)
            .await?;
        if !claimed {
            debug!(
                target = "reviews.dispatch",
                review_id = %review.id,
                expected = %from,
                "review status changed concurrently, skipped"
            );
            return Ok(Enqueue::Skipped);
        }
        if let Err(err) = self.queue.publish(&body).await {
            warn!(
                target = "reviews.dispatch",
                review_id = %review.id,
                error = %err,
                "publish failed, review left as is"
            );
            self.release(review, from).await;
            return Ok(Enqueue::Failed);
        }
        crate::metrics::reply_enqueued();
        let entry = ProcessingLogEntry::event(
            "SENT_TO_QUEUE",
            format!(
                "review {} of seller {} sent to queue {}",
                review.id, review.seller_id, self.queue_name
            ),
        );
        if let Err(err) = self.store.append_log(&entry).await {
            warn!(target = "reviews.dispatch", error = %err, "failed to write event log");
        }
        Ok(Enqueue::Sent)
    }

    /// Puts the review back to `from` after a failed publish, so it is picked
    /// up again by the next pass.
    async fn release(&self, review: &Review, from: ReviewStatus) {
        match self
            .store
            .release_claim(&review.id, &review.seller_id, from)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(target = "reviews.dispatch", review_id = %review.id, "review left InQueue concurrently");
            }
            Err(err) => {
                error!(
                    target = "reviews.dispatch",
                    review_id = %review.id,
                    error = %err,
                    "failed to release claim, review stays InQueue without a message"
                );
            }
        }
    }

    /// Runs every active filter in order. A review matched by several filters
    /// is enqueued by the first one only.
    pub async fn send_filtered(&self) -> Result<DispatchReport, StoreError> {
        let filters = self.store.active_filters().await?;
        let mut report = DispatchReport::default();
        let mut seen: HashSet<(String, String)> = HashSet::new();

        for filter in &filters {
            let rows = self
                .store
                .reviews_with_response(ReviewStatus::Unprocessed, Some(filter))
                .await?;
            debug!(target = "reviews.dispatch", filter_id = %filter.id, matched = rows.len(), "filter evaluated");
            for (review, response) in rows {
                let key = (review.seller_id.clone(), review.id.clone());
                if seen.contains(&key) {
                    continue;
                }
                match self
                    .enqueue(&review, &response, ReviewStatus::Unprocessed, Some(&filter.id))
                    .await?
                {
                    Enqueue::Sent => {
                        seen.insert(key);
                        report.sent += 1;
                    }
                    Enqueue::Skipped => {
                        seen.insert(key);
                    }
                    Enqueue::Failed => report.failed += 1,
                }
            }
        }
        if report.sent > 0 || report.failed > 0 {
            info!(target = "reviews.dispatch", sent = report.sent, failed = report.failed, "filtered replies dispatched");
        }
        Ok(report)
    }

    /// Requeues every review whose submission failed.
    pub async fn resend_failed(&self) -> Result<DispatchReport, StoreError> {
        let rows = self
            .store
            .reviews_with_response(ReviewStatus::InQueueError, None)
            .await?;
        let mut report = DispatchReport::default();
        for (review, response) in rows {
            match self
                .enqueue(&review, &response, ReviewStatus::InQueueError, None)
                .await?
            {
                Enqueue::Sent => report.sent += 1,
                Enqueue::Skipped => {}
                Enqueue::Failed => report.failed += 1,
            }
        }
        info!(target = "reviews.dispatch", sent = report.sent, failed = report.failed, "failed replies resent");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::queue::{Delivery, MemoryQueue, QueueError};
    use crate::models::ResponseFilter;
    use crate::store::MemoryStore;
    use crate::testutil::review;
    use async_trait::async_trait;
    use std::time::Duration;

    fn filter(id: &str, rating: Option<i32>, has_text: Option<bool>) -> ResponseFilter {
        ResponseFilter {
            id: id.into(),
            rating,
            has_text,
            is_active: true,
        }
    }

    async fn status(store: &MemoryStore, id: &str) -> ReviewStatus {
        store.review(id, "s1").await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn overlapping_filters_enqueue_once() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        store
            .seed_review(review("r1", "s1", 5, "great", ReviewStatus::Unprocessed), Some("thanks"))
            .await;
        store.add_filter(filter("f1", Some(5), None)).await;
        store.add_filter(filter("f2", None, Some(true))).await;

        let producer = Producer::new(store.clone(), queue.clone(), "reviews_ozon");
        let report = producer.send_filtered().await.unwrap();

        assert_eq!(report, DispatchReport { sent: 1, failed: 0 });
        let pending = queue.pending().await;
        assert_eq!(pending.len(), 1);
        let message: ReplyMessage = serde_json::from_str(&pending[0]).unwrap();
        assert_eq!(message.filter_id.as_deref(), Some("f1"));
        assert_eq!(message.response_text.as_deref(), Some("thanks"));
        assert_eq!(message.client_id.as_deref(), Some("s1"));
        assert_eq!(status(&store, "r1").await, ReviewStatus::InQueue);

        let logs = store.logs().await;
        assert!(logs.iter().any(|entry| matches!(
            entry,
            ProcessingLogEntry::Event { status, .. } if status == "SENT_TO_QUEUE"
        )));

        // a second pass finds nothing left to send
        assert_eq!(producer.send_filtered().await.unwrap().sent, 0);
    }

    #[tokio::test]
    async fn reviews_without_reply_or_match_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        store
            .seed_review(review("r1", "s1", 5, "great", ReviewStatus::Unprocessed), None)
            .await;
        store
            .seed_review(review("r2", "s1", 5, "", ReviewStatus::Unprocessed), Some("thanks"))
            .await;
        store.add_filter(filter("f1", Some(5), Some(true))).await;

        let producer = Producer::new(store.clone(), queue.clone(), "reviews_ozon");
        assert_eq!(producer.send_filtered().await.unwrap().sent, 0);
        assert!(queue.pending().await.is_empty());
        assert_eq!(status(&store, "r1").await, ReviewStatus::Unprocessed);
        assert_eq!(status(&store, "r2").await, ReviewStatus::Unprocessed);
    }

    struct BrokenQueue;

    #[async_trait]
    impl DurableQueue for BrokenQueue {
        async fn publish(&self, _body: &str) -> Result<(), QueueError> {
            Err(QueueError::Connection("refused".into()))
        }
        async fn receive(&self, _wait: Duration) -> Result<Option<Delivery>, QueueError> {
            Ok(None)
        }
        async fn ack(&self, _delivery: Delivery) -> Result<(), QueueError> {
            Ok(())
        }
        async fn nack(&self, _delivery: Delivery, _requeue: bool) -> Result<(), QueueError> {
            Ok(())
        }
        async fn recover(&self) -> Result<usize, QueueError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn publish_failure_leaves_review_untouched() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed_review(review("r1", "s1", 5, "great", ReviewStatus::Unprocessed), Some("thanks"))
            .await;
        store.add_filter(filter("f1", None, None)).await;

        let producer = Producer::new(store.clone(), Arc::new(BrokenQueue), "reviews_ozon");
        let report = producer.send_filtered().await.unwrap();
        assert_eq!(report, DispatchReport { sent: 0, failed: 1 });
        assert_eq!(status(&store, "r1").await, ReviewStatus::Unprocessed);

        // the next pass picks it up again
        let queue = Arc::new(MemoryQueue::new());
        let producer = Producer::new(store.clone(), queue.clone(), "reviews_ozon");
        assert_eq!(producer.send_filtered().await.unwrap().sent, 1);
        assert_eq!(status(&store, "r1").await, ReviewStatus::InQueue);
        assert_eq!(queue.pending().await.len(), 1);
    }

    #[tokio::test]
    async fn resend_requeues_failed_submissions() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        store
            .seed_review(review("r1", "s1", 3, "meh", ReviewStatus::InQueueError), Some("sorry"))
            .await;
        store
            .seed_review(review("r2", "s1", 5, "ok", ReviewStatus::Processed), Some("thanks"))
            .await;

        let producer = Producer::new(store.clone(), queue.clone(), "reviews_ozon");
        let report = producer.resend_failed().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(status(&store, "r1").await, ReviewStatus::InQueue);
        assert_eq!(status(&store, "r2").await, ReviewStatus::Processed);
        assert_eq!(queue.pending().await.len(), 1);
    }
}
