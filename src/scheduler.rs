//! The cooperative main loop: generate, dispatch, pause, fetch, pause.

use crate::dispatch::ConsumerHandle;
use crate::pipeline::{Pipeline, PipelineError};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Scheduler {
    pipeline: Pipeline,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(pipeline: Pipeline, cancel: CancellationToken) -> Self {
        Self { pipeline, cancel }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let settings = self.pipeline.settings().scheduler.clone();
        let mut consumer = None;
        if settings.dispatch_enabled {
            let recovered = self.pipeline.recover_queue().await;
            if recovered > 0 {
                info!(target = "reviews.scheduler", recovered, "returned unacknowledged messages to the queue");
            }
            consumer = Some(self.start_consumer());
        }
        let mut consumer_started = Instant::now();
        let mut last_resend = Instant::now();
        info!(target = "reviews.scheduler", "scheduler started");

        while !self.cancel.is_cancelled() {
            if let Err(err) = self.cycle().await {
                error!(target = "reviews.scheduler", stage = err.stage(), error = %err, "cycle failed");
                self.pipeline
                    .log_event("error", format!("cycle failed: {err}"))
                    .await;
                self.pause(settings.error_pause).await;
            }
            if self.cancel.is_cancelled() {
                break;
            }

            if let Some(running) = consumer.take() {
                if consumer_started.elapsed() >= settings.consumer_refresh {
                    debug!(target = "reviews.scheduler", "refreshing reply consumer");
                    running.stop().await;
                    consumer = Some(self.start_consumer());
                    consumer_started = Instant::now();
                } else {
                    consumer = Some(running);
                }
            }

            if let Some(interval) = settings.resend_interval
                && last_resend.elapsed() >= interval
            {
                match self.pipeline.resend_failed().await {
                    Ok(report) => debug!(target = "reviews.scheduler", sent = report.sent, "scheduled resend done"),
                    Err(err) => warn!(target = "reviews.scheduler", error = %err, "scheduled resend failed"),
                }
                last_resend = Instant::now();
            }
        }

        if let Some(running) = consumer {
            running.stop().await;
        }
        self.pipeline.log_event("info", "scheduler stopped").await;
        info!(target = "reviews.scheduler", "scheduler stopped");
    }

    fn start_consumer(&self) -> ConsumerHandle {
        Arc::new(self.pipeline.consumer()).spawn()
    }

    async fn cycle(&self) -> Result<(), PipelineError> {
        let settings = &self.pipeline.settings().scheduler;
        let ids = self.pipeline.credential_ids().await?;

        let generated = fan_out(&self.pipeline, "generate", &ids, |pipeline, id| async move {
            pipeline.generation_pass(&id).await
        })
        .await;
        debug!(target = "reviews.scheduler", credentials = ids.len(), completed = generated.iter().flatten().count(), "generation step done");
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        if settings.dispatch_enabled
            && let Err(err) = self.pipeline.dispatch_pass().await
        {
            error!(target = "reviews.scheduler", error = %err, "dispatch step failed");
            self.pipeline
                .log_event("error", format!("dispatch failed: {err}"))
                .await;
        }
        self.pause(settings.processing_pause).await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let fetched = fan_out(&self.pipeline, "fetch", &ids, |pipeline, id| async move {
            pipeline.fetch_pass(&id).await
        })
        .await;
        let inserted: usize = fetched.iter().flatten().map(|r| r.inserted).sum();
        debug!(target = "reviews.scheduler", inserted, "fetch step done");
        self.pause(settings.fetch_pause).await;
        Ok(())
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

/// Runs `task` for every credential concurrently. Errors and panics are
/// logged, written to the event log and come back as `None`; a busy lease is
/// a silent skip.
pub(crate) async fn fan_out<T, F, Fut>(
    pipeline: &Pipeline,
    step: &'static str,
    ids: &[String],
    task: F,
) -> Vec<Option<T>>
where
    T: Send + 'static,
    F: Fn(Pipeline, String) -> Fut,
    Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for id in ids {
        let fut = task(pipeline.clone(), id.clone());
        let id = id.clone();
        set.spawn(async move { (id, fut.await) });
    }

    let mut results = Vec::with_capacity(ids.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(value))) => results.push(Some(value)),
            Ok((id, Err(err))) if err.is_busy() => {
                debug!(target = "reviews.scheduler", step, credential_id = %id, "credential busy, skipped");
                results.push(None);
            }
            Ok((id, Err(err))) => {
                error!(target = "reviews.scheduler", step, credential_id = %id, error = %err, "task failed");
                pipeline
                    .log_event("error", format!("{step} for credential {id} failed: {err}"))
                    .await;
                results.push(None);
            }
            Err(err) => {
                error!(target = "reviews.scheduler", step, error = %err, "task panicked");
                pipeline
                    .log_event("error", format!("{step} task aborted: {err}"))
                    .await;
                results.push(None);
            }
        }
    }
    results
}
