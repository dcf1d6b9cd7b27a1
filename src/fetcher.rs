//! Incremental, cursor-based review fetch for one leased credential.
//!
//! Premium credentials read the official seller API, everyone else the
//! session-cookie web endpoints. The cursor is saved only after every row of
//! a page has been persisted.

use crate::config::FetchSettings;
use crate::ingest::{RawReview, ingest};
use crate::lease::LeaseHandle;
use crate::models::{Credential, Cursor};
use crate::ozon::seller_api::{ApiAuth, ApiReview};
use crate::ozon::seller_web::WebSession;
use crate::ozon::{OzonError, SellerApiClient, SellerWebClient};
use crate::store::{InsertOutcome, ReviewStore, StoreError};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub cursor_advanced: bool,
    pub disabled: bool,
}

impl FetchReport {
    fn absorb(&mut self, page: PageTally) {
        self.inserted += page.inserted;
        self.duplicates += page.duplicates;
        self.failed += page.failed;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PageTally {
    inserted: usize,
    duplicates: usize,
    failed: usize,
}

impl PageTally {
    fn record(&mut self, outcome: Result<InsertOutcome, StoreError>, review_id: &str) {
        match outcome {
            Ok(InsertOutcome::Inserted) => self.inserted += 1,
            Ok(InsertOutcome::Duplicate) => self.duplicates += 1,
            Err(err) => {
                warn!(target = "reviews.fetch", review_id, error = %err, "failed to store review");
                self.failed += 1;
            }
        }
    }
}

pub struct Fetcher {
    store: Arc<dyn ReviewStore>,
    api: SellerApiClient,
    web: SellerWebClient,
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(store: Arc<dyn ReviewStore>, settings: FetchSettings) -> Self {
        Self {
            store,
            api: SellerApiClient::new(settings.retry),
            web: SellerWebClient::new(settings.retry),
            settings,
        }
    }

    pub fn with_clients(mut self, api: SellerApiClient, web: SellerWebClient) -> Self {
        self.api = api;
        self.web = web;
        self
    }

    /// One fetch cycle for the credential held by `lease`.
    ///
    /// Transport failures end the cycle with whatever progress was saved so
    /// far. Authorization failures disable the credential and keep the lease.
    pub async fn fetch(&self, lease: &LeaseHandle) -> Result<FetchReport, StoreError> {
        let credential = lease.credential();
        let (strategy, result) = if credential.is_premium {
            ("api", self.fetch_api(credential).await)
        } else {
            ("web", self.fetch_web(credential).await)
        };
        let report = match result {
            Ok(report) => report,
            Err(FetchFailure::Store(err)) => return Err(err),
            Err(FetchFailure::Ozon(err, partial)) if err.is_auth() => {
                warn!(
                    target = "reviews.fetch",
                    credential_id = %credential.id,
                    error = %err,
                    "authorization rejected, disabling credential"
                );
                self.store.disable_credential(&credential.id).await?;
                lease.skip_restore();
                FetchReport {
                    disabled: true,
                    ..partial
                }
            }
            Err(FetchFailure::Ozon(err, partial)) => {
                warn!(
                    target = "reviews.fetch",
                    credential_id = %credential.id,
                    error = %err,
                    "fetch failed, cursor left as is"
                );
                partial
            }
        };
        crate::metrics::reviews_fetched(strategy, "inserted", report.inserted as u64);
        crate::metrics::reviews_fetched(strategy, "duplicate", report.duplicates as u64);
        crate::metrics::reviews_fetched(strategy, "failed", report.failed as u64);
        info!(
            target = "reviews.fetch",
            credential_id = %credential.id,
            strategy,
            inserted = report.inserted,
            duplicates = report.duplicates,
            failed = report.failed,
            cursor_advanced = report.cursor_advanced,
            "fetch cycle done"
        );
        Ok(report)
    }

    async fn fetch_api(&self, credential: &Credential) -> Result<FetchReport, FetchFailure> {
        let mut report = FetchReport::default();
        let auth = ApiAuth::from_credential(credential).map_err(|err| FetchFailure::Ozon(err, report))?;
        let cursor = &credential.cursor;
        let page = self
            .api
            .list_reviews(auth, cursor.last_id(), self.settings.page_size)
            .await
            .map_err(|err| FetchFailure::Ozon(err, report))?;
        debug!(target = "reviews.fetch", seller_id = %credential.seller_id, count = page.reviews.len(), has_next = page.has_next, "api page");

        let last_seen = page.reviews.last().map(|review| review.id.clone());
        let mut tally = PageTally::default();
        for review in page.reviews {
            match self.store.review_exists(&review.id, &credential.seller_id).await {
                Ok(true) => {
                    tally.duplicates += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    tally.record(Err(err), &review.id);
                    continue;
                }
            }
            let review_id = review.id.clone();
            let raw = self.enrich(auth, review).await;
            tally.record(
                ingest(self.store.as_ref(), raw, &credential.seller_id).await,
                &review_id,
            );
        }
        report.absorb(tally);

        if tally.failed == 0 {
            let next_id = page.last_id.filter(|v| !v.is_empty()).or(last_seen);
            report.cursor_advanced = self
                .save_cursor(credential, cursor.advance(next_id.as_deref(), None))
                .await?;
        }
        Ok(report)
    }

    /// Attaches media, comments and product name. Each lookup falls back to
    /// nothing on failure.
    async fn enrich(&self, auth: ApiAuth<'_>, review: ApiReview) -> RawReview {
        let info = self
            .api
            .review_info(auth, &review.id)
            .await
            .inspect_err(|err| debug!(target = "reviews.fetch", review_id = %review.id, error = %err, "review info unavailable"))
            .unwrap_or_default();
        let comments = self
            .api
            .comments(auth, &review.id)
            .await
            .inspect_err(|err| debug!(target = "reviews.fetch", review_id = %review.id, error = %err, "comments unavailable"))
            .unwrap_or_default();
        let product_name = self
            .api
            .product_name(auth, review.sku)
            .await
            .inspect_err(|err| debug!(target = "reviews.fetch", sku = review.sku, error = %err, "product name unavailable"))
            .unwrap_or_default();
        review.into_raw(info, comments, product_name)
    }

    async fn fetch_web(&self, credential: &Credential) -> Result<FetchReport, FetchFailure> {
        let mut report = FetchReport::default();
        let session = WebSession::parse(credential.session_cookies.as_deref(), &credential.seller_id)
            .map_err(|err| FetchFailure::Ozon(err, report))?;
        let mut cursor = credential.cursor.clone();

        for page_no in 0..self.settings.web_pages_per_cycle {
            if page_no > 0 {
                tokio::time::sleep(self.settings.web_page_delay).await;
            }
            let page = self
                .web
                .list_reviews(&session, cursor.last_id(), cursor.last_timestamp())
                .await
                .map_err(|err| FetchFailure::Ozon(err, report))?;
            debug!(target = "reviews.fetch", seller_id = %credential.seller_id, page = page_no, count = page.result.len(), "web page");

            let mut tally = PageTally::default();
            for review in page.result {
                let review_id = review.uuid.clone();
                tally.record(
                    ingest(self.store.as_ref(), review.into(), &credential.seller_id).await,
                    &review_id,
                );
            }
            report.absorb(tally);
            if tally.failed > 0 {
                break;
            }

            let next = cursor.advance(
                page.pagination_last_uuid.as_deref(),
                page.pagination_last_timestamp.as_deref(),
            );
            let Some(next) = next else {
                break;
            };
            self.save_cursor(credential, Some(next.clone())).await?;
            report.cursor_advanced = true;
            cursor = next;
            if tally.inserted == 0 {
                break;
            }
        }
        Ok(report)
    }

    async fn save_cursor(
        &self,
        credential: &Credential,
        next: Option<Cursor>,
    ) -> Result<bool, StoreError> {
        let Some(next) = next else {
            return Ok(false);
        };
        self.store.save_cursor(&credential.id, &next).await?;
        debug!(
            target = "reviews.fetch",
            credential_id = %credential.id,
            last_id = next.last_id(),
            last_timestamp = next.last_timestamp(),
            "cursor saved"
        );
        Ok(true)
    }
}

/// Why a strategy stopped early, with the progress made before it did.
enum FetchFailure {
    Ozon(OzonError, FetchReport),
    Store(StoreError),
}

impl From<StoreError> for FetchFailure {
    fn from(err: StoreError) -> Self {
        FetchFailure::Store(err)
    }
}
