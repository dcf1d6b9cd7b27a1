//! Exclusive, time-bounded ownership of a credential.
//!
//! A lease is written to the store with a TTL and renewed by a heartbeat task
//! while its scope runs. A worker that dies or panics simply stops renewing,
//! and the credential frees itself once the TTL passes.

use crate::models::{Credential, Lease};
use crate::store::{LeaseAttempt, ReviewStore, StoreError};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("credential {credential_id} is leased by {holder} until {expires_at}")]
    AlreadyLocked {
        credential_id: String,
        holder: Uuid,
        expires_at: DateTime<Utc>,
    },
    #[error("credential {0} is disabled")]
    Disabled(String),
    #[error("credential {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the work inside a lease scope sees.
#[derive(Debug, Clone)]
pub struct LeaseHandle {
    credential: Arc<Credential>,
    restore: Arc<AtomicBool>,
}

impl LeaseHandle {
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Leave the lease in place on release. Used together with disabling the
    /// credential after an authorization failure.
    pub fn skip_restore(&self) {
        self.restore.store(false, Ordering::SeqCst);
    }

    pub fn restores(&self) -> bool {
        self.restore.load(Ordering::SeqCst)
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct LeaseGuard {
    handle: LeaseHandle,
    lease: Lease,
    _heartbeat: AbortOnDrop,
}

impl LeaseGuard {
    pub fn handle(&self) -> LeaseHandle {
        self.handle.clone()
    }

    pub fn holder(&self) -> Uuid {
        self.lease.holder
    }
}

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn ReviewStore>,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn ReviewStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn expiry(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(15))
    }

    pub async fn acquire(&self, credential_id: &str) -> Result<LeaseGuard, LeaseError> {
        let lease = Lease {
            holder: Uuid::new_v4(),
            expires_at: self.expiry(),
        };
        match self.store.try_acquire_lease(credential_id, &lease).await? {
            LeaseAttempt::Acquired => {}
            LeaseAttempt::Busy { holder, expires_at } => {
                crate::metrics::lease_contended();
                warn!(
                    target = "reviews.lease",
                    credential_id,
                    %holder,
                    %expires_at,
                    "credential already leased, skipping"
                );
                return Err(LeaseError::AlreadyLocked {
                    credential_id: credential_id.to_string(),
                    holder,
                    expires_at,
                });
            }
            LeaseAttempt::Disabled => return Err(LeaseError::Disabled(credential_id.into())),
            LeaseAttempt::Missing => return Err(LeaseError::NotFound(credential_id.into())),
        }

        let credential = match self.store.credential(credential_id).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                self.store.release_lease(credential_id, lease.holder).await.ok();
                return Err(LeaseError::NotFound(credential_id.into()));
            }
            Err(err) => {
                self.store.release_lease(credential_id, lease.holder).await.ok();
                return Err(err.into());
            }
        };
        debug!(target = "reviews.lease", credential_id, holder = %lease.holder, "lease acquired");

        let heartbeat = self.spawn_heartbeat(credential_id.to_string(), lease.holder);
        Ok(LeaseGuard {
            handle: LeaseHandle {
                credential: Arc::new(credential),
                restore: Arc::new(AtomicBool::new(true)),
            },
            lease,
            _heartbeat: AbortOnDrop(heartbeat),
        })
    }

    fn spawn_heartbeat(&self, credential_id: String, holder: Uuid) -> JoinHandle<()> {
        let manager = self.clone();
        let every = (self.ttl / 3).max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let renewed = Lease {
                    holder,
                    expires_at: manager.expiry(),
                };
                match manager.store.renew_lease(&credential_id, &renewed).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(target = "reviews.lease", %credential_id, %holder, "lease lost");
                        break;
                    }
                    Err(err) => {
                        warn!(target = "reviews.lease", %credential_id, error = %err, "lease renewal failed");
                    }
                }
            }
        })
    }

    /// Stops the heartbeat and clears the lease unless restore was skipped.
    /// A failed clear is logged; the TTL frees the credential later.
    pub async fn release(&self, guard: LeaseGuard) {
        let credential_id = guard.handle.credential.id.clone();
        let holder = guard.lease.holder;
        let restore = guard.handle.restores();
        drop(guard);

        if !restore {
            info!(target = "reviews.lease", %credential_id, "lease kept on disabled credential");
            return;
        }
        if let Err(err) = self.store.release_lease(&credential_id, holder).await {
            error!(
                target = "reviews.lease",
                %credential_id,
                error = %err,
                "failed to release lease"
            );
        }
    }

    /// Runs `work` under the lease of `credential_id`, releasing on every
    /// return path.
    pub async fn scoped<F, Fut, T>(&self, credential_id: &str, work: F) -> Result<T, LeaseError>
    where
        F: FnOnce(LeaseHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(credential_id).await?;
        let output = work(guard.handle()).await;
        self.release(guard).await;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::premium_credential;

    fn credential(id: &str) -> Credential {
        premium_credential(id, &format!("seller-{id}"))
    }

    async fn setup() -> (Arc<MemoryStore>, LeaseManager) {
        let store = Arc::new(MemoryStore::new());
        store.insert_credential(credential("c1")).await;
        let manager = LeaseManager::new(store.clone(), Duration::from_secs(60));
        (store, manager)
    }

    #[tokio::test]
    async fn second_acquire_is_refused_while_held() {
        let (store, manager) = setup().await;
        let guard = manager.acquire("c1").await.unwrap();
        let err = manager.acquire("c1").await.err().expect("busy");
        assert!(matches!(err, LeaseError::AlreadyLocked { holder, .. } if holder == guard.holder()));

        manager.release(guard).await;
        let stored = store.credential("c1").await.unwrap().unwrap();
        assert!(stored.lease.is_none());
        assert!(manager.acquire("c1").await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_acquire_has_one_winner() {
        let (_store, manager) = setup().await;
        let attempts = (0..8).map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire("c1").await.map(|g| g.holder()) })
        });
        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn skip_restore_keeps_the_lease() {
        let (store, manager) = setup().await;
        let result = manager
            .scoped("c1", |handle| async move {
                handle.skip_restore();
                "done"
            })
            .await
            .unwrap();
        assert_eq!(result, "done");
        let stored = store.credential("c1").await.unwrap().unwrap();
        assert!(stored.is_busy(Utc::now()));
    }

    #[tokio::test]
    async fn scoped_releases_after_error_results() {
        let (store, manager) = setup().await;
        let result: Result<Result<(), &str>, _> =
            manager.scoped("c1", |_| async { Err("boom") }).await;
        assert!(matches!(result, Ok(Err("boom"))));
        let stored = store.credential("c1").await.unwrap().unwrap();
        assert!(stored.lease.is_none());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let (store, manager) = setup().await;
        let mut stale = credential("c1");
        stale.lease = Some(Lease {
            holder: Uuid::new_v4(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
        });
        store.insert_credential(stale).await;
        assert!(manager.acquire("c1").await.is_ok());
    }

    #[tokio::test]
    async fn disabled_and_missing_credentials() {
        let (store, manager) = setup().await;
        store.disable_credential("c1").await.unwrap();
        assert!(matches!(
            manager.acquire("c1").await,
            Err(LeaseError::Disabled(_))
        ));
        assert!(matches!(
            manager.acquire("nope").await,
            Err(LeaseError::NotFound(_))
        ));
    }
}
