use crate::config::Settings;
use crate::dispatch::{DispatchReport, DurableQueue, Producer, ReplyConsumer, ResponseLog};
use crate::fetcher::{FetchReport, Fetcher};
use crate::idempotency::ReplyLedger;
use crate::lease::{LeaseError, LeaseManager};
use crate::llm::CompletionClient;
use crate::models::ProcessingLogEntry;
use crate::ozon::{SellerApiClient, SellerWebClient};
use crate::responder::{GenerationReport, ResponseEngine};
use crate::store::{ReviewStore, StoreError};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

/// Everything one worker process needs, cheap to clone into tasks.
#[derive(Clone)]
pub struct Pipeline {
    settings: Arc<Settings>,
    store: Arc<dyn ReviewStore>,
    queue: Arc<dyn DurableQueue>,
    ledger: ReplyLedger,
    leases: LeaseManager,
    fetcher: Arc<Fetcher>,
    engine: Arc<ResponseEngine>,
    producer: Arc<Producer>,
    audit: Arc<ResponseLog>,
    resend: Arc<Mutex<()>>,
}

impl Pipeline {
    pub fn new(
        settings: Settings,
        store: Arc<dyn ReviewStore>,
        queue: Arc<dyn DurableQueue>,
        ledger: ReplyLedger,
        llm: Arc<dyn CompletionClient>,
    ) -> Self {
        let leases = LeaseManager::new(store.clone(), settings.lease_ttl);
        let fetcher = Fetcher::new(store.clone(), settings.fetch.clone());
        let engine = ResponseEngine::new(store.clone(), llm);
        let producer = Producer::new(store.clone(), queue.clone(), &settings.queue_name);
        let audit = ResponseLog::new(settings.response_log_path.clone());
        Self {
            settings: Arc::new(settings),
            store,
            queue,
            ledger,
            leases,
            fetcher: Arc::new(fetcher),
            engine: Arc::new(engine),
            producer: Arc::new(producer),
            audit: Arc::new(audit),
            resend: Arc::new(Mutex::new(())),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Credentials worth scheduling this cycle.
    pub async fn credential_ids(&self) -> Result<Vec<String>, PipelineError> {
        let credentials = self
            .store
            .list_credentials()
            .await
            .map_err(|err| PipelineError::from_store("credentials", err))?;
        Ok(credentials
            .into_iter()
            .filter(|c| !c.disabled)
            .map(|c| c.id)
            .collect())
    }

    pub async fn generation_pass(
        &self,
        credential_id: &str,
    ) -> Result<GenerationReport, PipelineError> {
        let batch = self.settings.fetch.generation_batch;
        let engine = &self.engine;
        self.timed("generate", async {
            self.leases
                .scoped(credential_id, |lease| async move {
                    engine.process_pending(lease.credential(), batch).await
                })
                .await
                .map_err(|err| PipelineError::from_lease("generate", err))?
                .map_err(|err| PipelineError::from_store("generate", err))
        })
        .await
    }

    pub async fn fetch_pass(&self, credential_id: &str) -> Result<FetchReport, PipelineError> {
        let fetcher = &self.fetcher;
        self.timed("fetch", async {
            self.leases
                .scoped(credential_id, |lease| async move { fetcher.fetch(&lease).await })
                .await
                .map_err(|err| PipelineError::from_lease("fetch", err))?
                .map_err(|err| PipelineError::from_store("fetch", err))
        })
        .await
    }

    pub async fn dispatch_pass(&self) -> Result<DispatchReport, PipelineError> {
        self.timed("dispatch", async {
            self.producer
                .send_filtered()
                .await
                .map_err(|err| PipelineError::from_store("dispatch", err))
        })
        .await
    }

    /// Requeues every `InQueueError` review. Only one resend runs at a time.
    pub async fn resend_failed(&self) -> Result<DispatchReport, PipelineError> {
        let Ok(_running) = self.resend.try_lock() else {
            return Err(PipelineError::busy("resend", "a resend is already running"));
        };
        self.timed("resend", async {
            self.producer
                .resend_failed()
                .await
                .map_err(|err| PipelineError::from_store("resend", err))
        })
        .await
    }

    /// Returns messages a crashed consumer left unacknowledged.
    pub async fn recover_queue(&self) -> usize {
        match self.queue.recover().await {
            Ok(recovered) => recovered,
            Err(err) => {
                warn!(target = "reviews.dispatch", error = %err, "failed to recover unacknowledged messages");
                0
            }
        }
    }

    pub fn consumer(&self) -> ReplyConsumer {
        let retry = self.settings.dispatch.submit_retry;
        ReplyConsumer::new(
            self.store.clone(),
            self.queue.clone(),
            self.ledger.clone(),
            SellerApiClient::new(retry),
            SellerWebClient::new(retry),
            self.audit.clone(),
            self.settings.dispatch.clone(),
        )
    }

    /// Best-effort event row in the processing log.
    pub async fn log_event(&self, status: &str, message: impl Into<String>) {
        let entry = ProcessingLogEntry::event(status, message);
        if let Err(err) = self.store.append_log(&entry).await {
            warn!(target = "reviews.scheduler", error = %err, "failed to write event log");
        }
    }

    async fn timed<T, Fut>(&self, pass: &'static str, fut: Fut) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await;
        crate::metrics::pass_elapsed(pass, started.elapsed());
        outcome
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    /// Someone else holds the resource; try again later.
    Busy,
    Internal,
}

impl PipelineError {
    pub fn busy(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Busy,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    fn from_store(stage: &'static str, err: StoreError) -> Self {
        Self::internal(stage, err.to_string())
    }

    fn from_lease(stage: &'static str, err: LeaseError) -> Self {
        match err {
            LeaseError::AlreadyLocked { .. } | LeaseError::Disabled(_) => {
                Self::busy(stage, err.to_string())
            }
            other => Self::internal(stage, other.to_string()),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    pub fn is_busy(&self) -> bool {
        self.kind == PipelineErrorKind::Busy
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dispatch::MemoryQueue;
    use crate::models::{ResponseFilter, ReviewStatus};
    use crate::responder::tests::StubCompletion;
    use crate::store::MemoryStore;
    use crate::testutil::{premium_credential, review};
    use std::time::Duration;

    pub(crate) fn test_settings() -> Settings {
        Settings {
            response_log_path: std::env::temp_dir()
                .join(format!("pipeline-{}", uuid::Uuid::new_v4()))
                .join("responses.txt"),
            lease_ttl: Duration::from_secs(60),
            ..Settings::default()
        }
    }

    pub(crate) fn pipeline(store: Arc<MemoryStore>, queue: Arc<MemoryQueue>) -> Pipeline {
        pipeline_with(store, queue, test_settings())
    }

    pub(crate) fn pipeline_with(
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        settings: Settings,
    ) -> Pipeline {
        Pipeline::new(
            settings,
            store,
            queue,
            ReplyLedger::memory(),
            Arc::new(StubCompletion::ok("Спасибо за отзыв!")),
        )
    }

    #[tokio::test]
    async fn generation_then_dispatch_moves_review_into_queue() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        store.insert_credential(premium_credential("c1", "42")).await;
        store
            .seed_review(review("r1", "42", 5, "отлично", ReviewStatus::Unprocessed), None)
            .await;
        store
            .add_filter(ResponseFilter {
                id: "f1".into(),
                rating: Some(5),
                has_text: None,
                is_active: true,
            })
            .await;
        let pipeline = pipeline(store.clone(), queue.clone());

        let generated = pipeline.generation_pass("c1").await.unwrap();
        assert_eq!(generated.generated, 1);
        assert_eq!(
            store.response_for("r1", "42").await.map(|r| r.text),
            Some("Спасибо за отзыв!".to_string())
        );

        let sent = pipeline.dispatch_pass().await.unwrap();
        assert_eq!(sent.sent, 1);
        assert_eq!(queue.pending().await.len(), 1);
        let stored = store.review("r1", "42").await.unwrap().unwrap();
        assert_eq!(stored.status, ReviewStatus::InQueue);
    }

    #[tokio::test]
    async fn held_lease_is_reported_busy() {
        let store = Arc::new(MemoryStore::new());
        store.insert_credential(premium_credential("c1", "42")).await;
        let pipeline = pipeline(store.clone(), Arc::new(MemoryQueue::new()));

        let held = LeaseManager::new(store.clone(), Duration::from_secs(60))
            .acquire("c1")
            .await
            .unwrap();
        let err = pipeline.generation_pass("c1").await.unwrap_err();
        assert!(err.is_busy());
        assert_eq!(err.stage(), "generate");
        drop(held);
    }

    #[tokio::test]
    async fn disabled_credentials_are_not_scheduled() {
        let store = Arc::new(MemoryStore::new());
        store.insert_credential(premium_credential("c1", "42")).await;
        let mut disabled = premium_credential("c2", "43");
        disabled.disabled = true;
        store.insert_credential(disabled).await;
        let pipeline = pipeline(store, Arc::new(MemoryQueue::new()));

        assert_eq!(pipeline.credential_ids().await.unwrap(), vec!["c1".to_string()]);
    }
}
