//! Reliable reply dispatch: the producer moves stored replies into the durable
//! queue, the consumer submits them to the marketplace and settles review
//! status.

pub mod audit;
pub mod consumer;
pub mod producer;
pub mod queue;

pub use audit::ResponseLog;
pub use consumer::{ConsumerHandle, MessageOutcome, ReplyConsumer};
pub use producer::{DispatchReport, Producer};
pub use queue::{Delivery, DurableQueue, MemoryQueue, QueueError, RedisQueue};

use crate::models::{GeneratedResponse, Review};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Queue payload. Every field is optional on the way in so malformed
/// messages can be told apart from incomplete ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyMessage {
    #[serde(default)]
    pub review_id: Option<String>,
    #[serde(default)]
    pub review_text: Option<String>,
    #[serde(default)]
    pub response_text: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub filter_id: Option<String>,
}

impl ReplyMessage {
    pub fn new(review: &Review, response: &GeneratedResponse, filter_id: Option<&str>) -> Self {
        Self {
            review_id: Some(review.id.clone()),
            review_text: Some(review.text.clone()),
            response_text: Some(response.text.clone()),
            created_at: Some(response.created_at.to_rfc3339()),
            client_id: Some(review.seller_id.clone()),
            filter_id: filter_id.map(str::to_string),
        }
    }
}

/// Redis when a URL is configured and valid, otherwise an in-process queue.
pub fn connect_queue(redis_url: Option<&str>, name: &str) -> Arc<dyn DurableQueue> {
    if let Some(url) = redis_url {
        match RedisQueue::open(url, name) {
            Ok(queue) => {
                info!(target = "reviews.dispatch", queue = name, "using redis queue");
                return Arc::new(queue);
            }
            Err(err) => {
                warn!(target = "reviews.dispatch", error = %err, "redis queue unavailable");
            }
        }
    }
    warn!(
        target = "reviews.dispatch",
        queue = name,
        "using in-memory queue; messages do not survive restarts"
    );
    Arc::new(MemoryQueue::new())
}
