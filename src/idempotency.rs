use redis::AsyncCommands;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// Remembers which reviews already received a reply so a redelivered message
/// is not submitted twice.
#[derive(Clone)]
pub enum ReplyLedger {
    Redis { client: redis::Client, ttl: Duration },
    Memory(Arc<Mutex<HashSet<String>>>),
}

fn ledger_key(seller_id: &str, review_id: &str) -> String {
    format!("reviews:replied:{seller_id}:{review_id}")
}

impl ReplyLedger {
    pub fn memory() -> Self {
        ReplyLedger::Memory(Arc::new(Mutex::new(HashSet::new())))
    }

    pub fn from_url(url: Option<&str>, ttl: Duration) -> Self {
        match url.map(redis::Client::open) {
            Some(Ok(client)) => ReplyLedger::Redis { client, ttl },
            Some(Err(err)) => {
                warn!(target = "reviews.dispatch", error = %err, "invalid redis url, reply ledger kept in memory");
                Self::memory()
            }
            None => Self::memory(),
        }
    }

    /// A Redis outage reads as "not replied"; the review status check still
    /// guards against double submission.
    pub async fn already_replied(&self, seller_id: &str, review_id: &str) -> bool {
        let key = ledger_key(seller_id, review_id);
        match self {
            ReplyLedger::Redis { client, .. } => {
                let mut conn = match client.get_multiplexed_async_connection().await {
                    Ok(c) => c,
                    Err(_) => return false,
                };
                let replied: bool = conn.exists(&key).await.unwrap_or(false);
                replied
            }
            ReplyLedger::Memory(set) => set.lock().await.contains(&key),
        }
    }

    /// Returns whether the entry was stored. A failed write is logged; the
    /// review then relies on its `PROCESSED` status alone.
    pub async fn record(&self, seller_id: &str, review_id: &str) -> bool {
        let key = ledger_key(seller_id, review_id);
        match self {
            ReplyLedger::Redis { client, ttl } => {
                let written = async {
                    let mut conn = client.get_multiplexed_async_connection().await?;
                    conn.set_ex::<_, _, ()>(&key, 1, ttl.as_secs().max(1)).await?;
                    Ok::<(), redis::RedisError>(())
                }
                .await;
                if let Err(err) = written {
                    warn!(target = "reviews.dispatch", seller_id, review_id, error = %err, "failed to record reply in ledger");
                    return false;
                }
                true
            }
            ReplyLedger::Memory(set) => {
                set.lock().await.insert(key);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_ledger_is_keyed_by_seller_and_review() {
        let ledger = ReplyLedger::memory();
        assert!(!ledger.already_replied("s1", "r1").await);
        assert!(ledger.record("s1", "r1").await);
        assert!(ledger.already_replied("s1", "r1").await);
        assert!(!ledger.already_replied("s2", "r1").await);
    }

    #[tokio::test]
    async fn unusable_url_falls_back_to_memory() {
        let ledger = ReplyLedger::from_url(Some("not a url"), Duration::from_secs(60));
        assert!(matches!(ledger, ReplyLedger::Memory(_)));
        assert!(matches!(
            ReplyLedger::from_url(None, Duration::from_secs(60)),
            ReplyLedger::Memory(_)
        ));
    }

    #[tokio::test]
    async fn unreachable_redis_reports_unrecorded_reply() {
        let ledger = ReplyLedger::from_url(Some("redis://127.0.0.1:1/"), Duration::from_secs(60));
        assert!(matches!(ledger, ReplyLedger::Redis { .. }));
        assert!(!ledger.record("s1", "r1").await);
        assert!(!ledger.already_replied("s1", "r1").await);
    }
}
