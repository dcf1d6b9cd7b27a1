use super::{Delivery, DurableQueue, ReplyMessage, ResponseLog};
use crate::config::DispatchSettings;
use crate::idempotency::ReplyLedger;
use crate::models::{Credential, ReviewStatus};
use crate::ozon::retry::with_retry_if;
use crate::ozon::seller_api::ApiAuth;
use crate::ozon::seller_web::{WebSession, is_processed_status};
use crate::ozon::{OzonError, SellerApiClient, SellerWebClient};
use crate::store::ReviewStore;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SETTLE_ATTEMPTS: u32 = 3;
const SETTLE_DELAY: Duration = Duration::from_millis(200);
const BACKOFF_AFTER_ERROR: Duration = Duration::from_secs(1);

/// How one delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Reply accepted by the marketplace; review is `PROCESSED`.
    Submitted,
    /// Review was answered before; acknowledged without a new submission.
    AlreadyAnswered,
    /// Message unusable; dead-lettered.
    Rejected(String),
    /// Submission failed after all attempts; review is `InQueueError`.
    Failed(String),
    /// Store unavailable; message requeued.
    Deferred(String),
}

impl MessageOutcome {
    fn settles_with_ack(&self) -> bool {
        matches!(self, MessageOutcome::Submitted | MessageOutcome::AlreadyAnswered)
    }
}

pub struct ReplyConsumer {
    store: Arc<dyn ReviewStore>,
    queue: Arc<dyn DurableQueue>,
    ledger: ReplyLedger,
    api: SellerApiClient,
    web: SellerWebClient,
    audit: Arc<ResponseLog>,
    settings: DispatchSettings,
}

pub struct ConsumerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Lets the in-flight message finish, then waits for the task.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            error!(target = "reviews.dispatch", error = %err, "consumer task ended abnormally");
        }
    }
}

impl ReplyConsumer {
    pub fn new(
        store: Arc<dyn ReviewStore>,
        queue: Arc<dyn DurableQueue>,
        ledger: ReplyLedger,
        api: SellerApiClient,
        web: SellerWebClient,
        audit: Arc<ResponseLog>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            queue,
            ledger,
            api,
            web,
            audit,
            settings,
        }
    }

    pub fn spawn(self: Arc<Self>) -> ConsumerHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        ConsumerHandle { cancel, task }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(target = "reviews.dispatch", "reply consumer started");
        while !cancel.is_cancelled() {
            match self.queue.receive(self.settings.receive_wait).await {
                Ok(Some(delivery)) => match self.handle(delivery).await {
                    Ok(MessageOutcome::Deferred(_)) => {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(BACKOFF_AFTER_ERROR) => {}
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!(target = "reviews.dispatch", error = %err, "failed to settle delivery");
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    warn!(target = "reviews.dispatch", error = %err, "receive failed");
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(BACKOFF_AFTER_ERROR) => {}
                    }
                }
            }
        }
        info!(target = "reviews.dispatch", "reply consumer stopped");
    }

    /// Processes one delivery and settles it exactly once.
    pub async fn handle(
        &self,
        delivery: Delivery,
    ) -> Result<MessageOutcome, super::QueueError> {
        let outcome = self.process(delivery.body()).await;
        crate::metrics::reply_submitted(match &outcome {
            MessageOutcome::Submitted => "submitted",
            MessageOutcome::AlreadyAnswered => "duplicate",
            MessageOutcome::Rejected(_) => "rejected",
            MessageOutcome::Failed(_) => "failed",
            MessageOutcome::Deferred(_) => "deferred",
        });
        match &outcome {
            o if o.settles_with_ack() => self.queue.ack(delivery).await?,
            MessageOutcome::Deferred(_) => self.queue.nack(delivery, true).await?,
            _ => self.queue.nack(delivery, false).await?,
        }
        Ok(outcome)
    }

    async fn process(&self, body: &str) -> MessageOutcome {
        let message: ReplyMessage = match serde_json::from_str(body) {
            Ok(message) => message,
            Err(err) => {
                warn!(target = "reviews.dispatch", error = %err, "message is not valid JSON");
                return MessageOutcome::Rejected(format!("malformed message: {err}"));
            }
        };
        let Some(review_id) = message.review_id.as_deref().filter(|v| !v.is_empty()) else {
            warn!(target = "reviews.dispatch", "message without review_id");
            return MessageOutcome::Rejected("missing review_id".into());
        };
        let client_id = message.client_id.as_deref().filter(|v| !v.is_empty());
        let response_text = message
            .response_text
            .as_deref()
            .filter(|v| !v.trim().is_empty());
        let (Some(client_id), Some(response_text)) = (client_id, response_text) else {
            warn!(target = "reviews.dispatch", review_id, "message without response_text or client_id");
            match client_id {
                Some(client_id) => {
                    self.settle(review_id, client_id, ReviewStatus::InQueueError)
                        .await;
                }
                None => {
                    warn!(target = "reviews.dispatch", review_id, "cannot mark review without client_id");
                }
            }
            return MessageOutcome::Rejected("missing response_text or client_id".into());
        };

        let review = match self.store.review(review_id, client_id).await {
            Ok(Some(review)) => review,
            Ok(None) => {
                warn!(target = "reviews.dispatch", review_id, client_id, "review not found");
                return MessageOutcome::Rejected("unknown review".into());
            }
            Err(err) => return MessageOutcome::Deferred(err.to_string()),
        };
        match review.status {
            ReviewStatus::Processed => {
                debug!(target = "reviews.dispatch", review_id, "already processed");
                return MessageOutcome::AlreadyAnswered;
            }
            ReviewStatus::InQueue => {}
            other => {
                warn!(target = "reviews.dispatch", review_id, status = %other, "stale message");
                return MessageOutcome::Rejected(format!("review is {other}"));
            }
        }
        if self.ledger.already_replied(client_id, review_id).await {
            info!(target = "reviews.dispatch", review_id, "reply already recorded, settling");
            self.settle(review_id, client_id, ReviewStatus::Processed).await;
            return MessageOutcome::AlreadyAnswered;
        }

        let credential = match self.store.credential_by_seller(client_id).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                let reason = format!("no credential for seller {client_id}");
                self.audit
                    .append(client_id, review_id, &json!({ "error": reason }))
                    .await;
                self.settle(review_id, client_id, ReviewStatus::InQueueError)
                    .await;
                return MessageOutcome::Failed(reason);
            }
            Err(err) => return MessageOutcome::Deferred(err.to_string()),
        };

        match self.submit(&credential, review_id, response_text).await {
            Ok(()) => {
                self.ledger.record(client_id, review_id).await;
                self.settle(review_id, client_id, ReviewStatus::Processed).await;
                info!(target = "reviews.dispatch", review_id, client_id, premium = credential.is_premium, "reply submitted");
                MessageOutcome::Submitted
            }
            Err(err) => {
                let reason = err.to_string();
                self.audit
                    .append(client_id, review_id, &json!({ "error": reason }))
                    .await;
                self.settle(review_id, client_id, ReviewStatus::InQueueError)
                    .await;
                error!(target = "reviews.dispatch", review_id, client_id, error = %reason, "reply submission failed");
                MessageOutcome::Failed(reason)
            }
        }
    }

    async fn submit(
        &self,
        credential: &Credential,
        review_id: &str,
        text: &str,
    ) -> Result<(), OzonError> {
        let policy = self.settings.submit_retry;
        let client_id = credential.seller_id.as_str();
        if credential.is_premium {
            let auth = ApiAuth::from_credential(credential)?;
            with_retry_if(policy, "comment/create", |_| true, || async move {
                let submission = self.api.create_comment(auth, review_id, text).await?;
                self.audit
                    .append(client_id, review_id, &submission.payload)
                    .await;
                if submission.accepted {
                    Ok(())
                } else {
                    Err(OzonError::InvalidResponse("no comment_id in response".into()))
                }
            })
            .await
        } else {
            let session = &WebSession::parse(credential.reply_cookies.as_deref(), client_id)?;
            // once the comment is posted only the status check is repeated
            let posted = &AtomicBool::new(false);
            with_retry_if(policy, "review/comment/create", |_| true, || async move {
                if !posted.load(Ordering::SeqCst) {
                    let submission = self.web.create_comment(session, review_id, text).await?;
                    self.audit
                        .append(client_id, review_id, &submission.payload)
                        .await;
                    if !submission.accepted {
                        return Err(OzonError::InvalidResponse("comment not accepted".into()));
                    }
                    posted.store(true, Ordering::SeqCst);
                }
                let status = self.web.review_status(session, review_id).await?;
                match status {
                    Some(status) if is_processed_status(&status) => Ok(()),
                    other => Err(OzonError::InvalidResponse(format!(
                        "interaction status is {}",
                        other.as_deref().unwrap_or("missing")
                    ))),
                }
            })
            .await
        }
    }

    /// `InQueue -> to`, retried a few times on store errors.
    async fn settle(&self, review_id: &str, seller_id: &str, to: ReviewStatus) {
        for attempt in 1..=SETTLE_ATTEMPTS {
            match self
                .store
                .transition_review(review_id, seller_id, ReviewStatus::InQueue, to)
                .await
            {
                Ok(true) => return,
                Ok(false) => {
                    warn!(target = "reviews.dispatch", review_id, to = %to, "review was not InQueue");
                    return;
                }
                Err(err) if attempt < SETTLE_ATTEMPTS => {
                    warn!(target = "reviews.dispatch", review_id, attempt, error = %err, "status update failed, retrying");
                    tokio::time::sleep(SETTLE_DELAY).await;
                }
                Err(err) => {
                    error!(target = "reviews.dispatch", review_id, to = %to, error = %err, "status update failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{MemoryQueue, Producer, QueueError};
    use crate::models::ResponseFilter;
    use crate::ozon::retry::RetryPolicy;
    use crate::store::MemoryStore;
    use crate::testutil::{premium_credential, review, standard_credential};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        consumer: Arc<ReplyConsumer>,
        audit_dir: std::path::PathBuf,
    }

    async fn fixture(server: &MockServer) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let audit_dir = std::env::temp_dir().join(format!("consumer-{}", uuid::Uuid::new_v4()));
        let fast = RetryPolicy {
            attempts: 5,
            delay: Duration::ZERO,
        };
        let settings = DispatchSettings {
            submit_retry: fast,
            receive_wait: Duration::from_millis(20),
            ..DispatchSettings::default()
        };
        let consumer = Arc::new(ReplyConsumer::new(
            store.clone(),
            queue.clone(),
            ReplyLedger::memory(),
            SellerApiClient::new(fast).with_root(&server.uri()),
            SellerWebClient::new(fast).with_root(&server.uri()),
            Arc::new(ResponseLog::new(audit_dir.join("responses.txt"))),
            settings,
        ));
        Fixture {
            store,
            queue,
            consumer,
            audit_dir,
        }
    }

    impl Fixture {
        async fn deliver(&self, body: serde_json::Value) -> MessageOutcome {
            self.queue.publish(&body.to_string()).await.unwrap();
            let delivery = self
                .queue
                .receive(Duration::from_millis(20))
                .await
                .unwrap()
                .unwrap();
            self.consumer.handle(delivery).await.unwrap()
        }

        async fn status(&self, id: &str) -> ReviewStatus {
            self.store.review(id, "42").await.unwrap().unwrap().status
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.audit_dir).ok();
        }
    }

    fn message(review_id: &str) -> serde_json::Value {
        json!({
            "review_id": review_id,
            "review_text": "good",
            "response_text": "Спасибо!",
            "created_at": "2024-05-01T10:00:00Z",
            "client_id": "42",
            "filter_id": "f1"
        })
    }

    #[tokio::test]
    async fn missing_response_text_is_rejected_without_submission() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let fx = fixture(&server).await;
        fx.store
            .seed_review(review("r1", "42", 5, "good", ReviewStatus::InQueue), Some("x"))
            .await;

        let outcome = fx
            .deliver(json!({ "review_id": "r1", "client_id": "42" }))
            .await;
        assert!(matches!(outcome, MessageOutcome::Rejected(_)));
        assert_eq!(fx.status("r1").await, ReviewStatus::InQueueError);
        assert_eq!(fx.queue.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn malformed_message_is_dead_lettered() {
        let server = MockServer::start().await;
        let fx = fixture(&server).await;
        fx.queue.publish("not json").await.unwrap();
        let delivery = fx.queue.receive(Duration::from_millis(20)).await.unwrap().unwrap();
        let outcome = fx.consumer.handle(delivery).await.unwrap();
        assert!(matches!(outcome, MessageOutcome::Rejected(_)));
        assert_eq!(fx.queue.dead_letters().await, vec!["not json".to_string()]);
    }

    #[tokio::test]
    async fn premium_reply_is_submitted_and_processed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/review/comment/create"))
            .and(body_partial_json(json!({ "review_id": "r1", "text": "Спасибо!" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "comment_id": "c1" })))
            .expect(1)
            .mount(&server)
            .await;
        let fx = fixture(&server).await;
        fx.store.insert_credential(premium_credential("c1", "42")).await;
        fx.store
            .seed_review(review("r1", "42", 5, "good", ReviewStatus::InQueue), Some("Спасибо!"))
            .await;

        assert_eq!(fx.deliver(message("r1")).await, MessageOutcome::Submitted);
        assert_eq!(fx.status("r1").await, ReviewStatus::Processed);
        assert_eq!(fx.queue.unacknowledged().await, 0);

        // redelivery of the same message does not post again
        assert_eq!(fx.deliver(message("r1")).await, MessageOutcome::AlreadyAnswered);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_the_review_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/review/comment/create"))
            .respond_with(ResponseTemplate::new(500))
            .expect(5)
            .mount(&server)
            .await;
        let fx = fixture(&server).await;
        fx.store.insert_credential(premium_credential("c1", "42")).await;
        fx.store
            .seed_review(review("r1", "42", 5, "good", ReviewStatus::InQueue), Some("Спасибо!"))
            .await;

        assert!(matches!(fx.deliver(message("r1")).await, MessageOutcome::Failed(_)));
        assert_eq!(fx.status("r1").await, ReviewStatus::InQueueError);
        assert_eq!(fx.queue.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn standard_reply_posts_once_then_polls_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/review/comment/create"))
            .and(body_partial_json(json!({ "review_uuid": "r1", "company_type": "seller" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": true })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/review/detail"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "interaction_status": "NOT_VIEWED" })),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/review/detail"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "interaction_status": "PROCESSED" })),
            )
            .mount(&server)
            .await;
        let fx = fixture(&server).await;
        fx.store.insert_credential(standard_credential("c2", "42")).await;
        fx.store
            .seed_review(review("r1", "42", 5, "good", ReviewStatus::InQueue), Some("Спасибо!"))
            .await;

        assert_eq!(fx.deliver(message("r1")).await, MessageOutcome::Submitted);
        assert_eq!(fx.status("r1").await, ReviewStatus::Processed);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let server = MockServer::start().await;
        let fx = fixture(&server).await;
        let handle = fx.consumer.clone().spawn();
        tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .expect("consumer stops");
    }

    fn any_filter() -> ResponseFilter {
        ResponseFilter {
            id: "f1".into(),
            rating: None,
            has_text: None,
            is_active: true,
        }
    }

    async fn mount_premium_accept(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v1/review/comment/create"))
            .and(body_partial_json(json!({ "review_id": "r1", "text": "Спасибо!" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "comment_id": "c1" })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn produced_message_is_submitted_once_and_acknowledged() {
        let server = MockServer::start().await;
        mount_premium_accept(&server).await;
        let fx = fixture(&server).await;
        fx.store.insert_credential(premium_credential("c1", "42")).await;
        fx.store
            .seed_review(review("r1", "42", 5, "good", ReviewStatus::Unprocessed), Some("Спасибо!"))
            .await;
        fx.store.add_filter(any_filter()).await;

        let producer = Producer::new(fx.store.clone(), fx.queue.clone(), "reviews_ozon");
        assert_eq!(producer.send_filtered().await.unwrap().sent, 1);

        let delivery = fx
            .queue
            .receive(Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fx.consumer.handle(delivery).await.unwrap(), MessageOutcome::Submitted);

        assert_eq!(fx.status("r1").await, ReviewStatus::Processed);
        assert!(fx.queue.pending().await.is_empty());
        assert!(fx.queue.dead_letters().await.is_empty());
        assert_eq!(fx.queue.unacknowledged().await, 0);
    }

    /// Hands every message to the consumer before `publish` returns.
    struct EagerQueue {
        inner: Arc<MemoryQueue>,
        consumer: Arc<ReplyConsumer>,
        outcomes: tokio::sync::Mutex<Vec<MessageOutcome>>,
    }

    #[async_trait::async_trait]
    impl DurableQueue for EagerQueue {
        async fn publish(&self, body: &str) -> Result<(), QueueError> {
            self.inner.publish(body).await?;
            if let Some(delivery) = self.inner.receive(Duration::from_millis(20)).await? {
                let outcome = self.consumer.handle(delivery).await?;
                self.outcomes.lock().await.push(outcome);
            }
            Ok(())
        }
        async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
            self.inner.receive(wait).await
        }
        async fn ack(&self, delivery: Delivery) -> Result<(), QueueError> {
            self.inner.ack(delivery).await
        }
        async fn nack(&self, delivery: Delivery, requeue: bool) -> Result<(), QueueError> {
            self.inner.nack(delivery, requeue).await
        }
        async fn recover(&self) -> Result<usize, QueueError> {
            self.inner.recover().await
        }
    }

    #[tokio::test]
    async fn consumer_receiving_during_publish_sees_in_queue() {
        let server = MockServer::start().await;
        mount_premium_accept(&server).await;
        let fx = fixture(&server).await;
        fx.store.insert_credential(premium_credential("c1", "42")).await;
        fx.store
            .seed_review(review("r1", "42", 5, "good", ReviewStatus::Unprocessed), Some("Спасибо!"))
            .await;
        fx.store.add_filter(any_filter()).await;
        let eager = Arc::new(EagerQueue {
            inner: fx.queue.clone(),
            consumer: fx.consumer.clone(),
            outcomes: tokio::sync::Mutex::new(Vec::new()),
        });

        let producer = Producer::new(fx.store.clone(), eager.clone(), "reviews_ozon");
        assert_eq!(producer.send_filtered().await.unwrap().sent, 1);

        assert_eq!(*eager.outcomes.lock().await, vec![MessageOutcome::Submitted]);
        assert_eq!(fx.status("r1").await, ReviewStatus::Processed);
        assert!(fx.queue.dead_letters().await.is_empty());
    }
}
