use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection failed: {0}")]
    Connection(String),
    #[error("queue command failed: {0}")]
    Command(String),
    #[error("previous delivery is still unacknowledged")]
    Unacknowledged,
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_io_error() {
            QueueError::Connection(err.to_string())
        } else {
            QueueError::Command(err.to_string())
        }
    }
}

/// A received, not yet settled message. Settling consumes it, so a delivery
/// is acknowledged at most once.
#[derive(Debug)]
pub struct Delivery {
    body: String,
}

impl Delivery {
    pub fn body(&self) -> &str {
        &self.body
    }
}

/// Durable FIFO with explicit acknowledgement and at most one unacknowledged
/// delivery per consumer.
#[async_trait]
pub trait DurableQueue: Send + Sync + 'static {
    async fn publish(&self, body: &str) -> Result<(), QueueError>;

    /// Waits up to `wait` for the next message.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: Delivery) -> Result<(), QueueError>;

    /// Without `requeue` the message moves to the dead-letter list.
    async fn nack(&self, delivery: Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Returns deliveries stranded by a crashed consumer to the queue.
    async fn recover(&self) -> Result<usize, QueueError>;
}

/// Reliable-queue pattern on Redis lists: producers `LPUSH`, the consumer
/// `BLMOVE`s into a processing list and `LREM`s on settle.
pub struct RedisQueue {
    client: redis::Client,
    queue: String,
    processing: String,
    dead: String,
    in_flight: AtomicBool,
}

impl RedisQueue {
    pub fn open(url: &str, name: &str) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(url).map_err(|err| QueueError::Connection(err.to_string()))?;
        Ok(Self {
            client,
            queue: format!("queue:{name}"),
            processing: format!("queue:{name}:processing"),
            dead: format!("queue:{name}:dead"),
            in_flight: AtomicBool::new(false),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| QueueError::Connection(err.to_string()))
    }
}

#[async_trait]
impl DurableQueue for RedisQueue {
    async fn publish(&self, body: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("LPUSH")
            .arg(&self.queue)
            .arg(body)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        if self.in_flight.load(Ordering::SeqCst) {
            return Err(QueueError::Unacknowledged);
        }
        let mut conn = self.connection().await?;
        let body: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.queue)
            .arg(&self.processing)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        Ok(body.map(|body| {
            self.in_flight.store(true, Ordering::SeqCst);
            Delivery { body }
        }))
    }

    async fn ack(&self, delivery: Delivery) -> Result<(), QueueError> {
        // the delivery is consumed either way; a failed LREM leaves the body
        // in the processing list for `recover`
        self.in_flight.store(false, Ordering::SeqCst);
        let mut conn = self.connection().await?;
        redis::cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(&delivery.body)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: Delivery, requeue: bool) -> Result<(), QueueError> {
        self.in_flight.store(false, Ordering::SeqCst);
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(&delivery.body)
            .ignore();
        if requeue {
            pipe.cmd("RPUSH").arg(&self.queue).arg(&delivery.body).ignore();
        } else {
            pipe.cmd("LPUSH").arg(&self.dead).arg(&delivery.body).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let mut moved = 0;
        loop {
            let item: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing)
                .arg(&self.queue)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if item.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            warn!(target = "reviews.dispatch", queue = %self.queue, moved, "recovered stranded deliveries");
        }
        Ok(moved)
    }
}

/// In-process queue with the same settle semantics.
#[derive(Default)]
pub struct MemoryQueue {
    lists: Mutex<MemoryLists>,
    arrived: Notify,
    in_flight: AtomicBool,
}

#[derive(Default)]
struct MemoryLists {
    ready: VecDeque<String>,
    processing: Vec<String>,
    dead: Vec<String>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn remove_processing(lists: &mut MemoryLists, body: &str) {
        if let Some(pos) = lists.processing.iter().position(|b| b == body) {
            lists.processing.remove(pos);
        }
    }
}

#[cfg(test)]
impl MemoryQueue {
    pub async fn pending(&self) -> Vec<String> {
        self.lists.lock().await.ready.iter().cloned().collect()
    }

    pub async fn dead_letters(&self) -> Vec<String> {
        self.lists.lock().await.dead.clone()
    }

    pub async fn unacknowledged(&self) -> usize {
        self.lists.lock().await.processing.len()
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn publish(&self, body: &str) -> Result<(), QueueError> {
        self.lists.lock().await.ready.push_back(body.to_string());
        self.arrived.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        if self.in_flight.load(Ordering::SeqCst) {
            return Err(QueueError::Unacknowledged);
        }
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let mut lists = self.lists.lock().await;
                if let Some(body) = lists.ready.pop_front() {
                    lists.processing.push(body.clone());
                    self.in_flight.store(true, Ordering::SeqCst);
                    return Ok(Some(Delivery { body }));
                }
            }
            if tokio::time::timeout_at(deadline, self.arrived.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: Delivery) -> Result<(), QueueError> {
        let mut lists = self.lists.lock().await;
        Self::remove_processing(&mut lists, &delivery.body);
        self.in_flight.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, delivery: Delivery, requeue: bool) -> Result<(), QueueError> {
        let mut lists = self.lists.lock().await;
        Self::remove_processing(&mut lists, &delivery.body);
        if requeue {
            lists.ready.push_front(delivery.body);
            self.arrived.notify_one();
        } else {
            lists.dead.push(delivery.body);
        }
        self.in_flight.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let mut lists = self.lists.lock().await;
        let stranded: Vec<String> = lists.processing.drain(..).collect();
        let moved = stranded.len();
        for body in stranded.into_iter().rev() {
            lists.ready.push_front(body);
        }
        if moved > 0 {
            info!(target = "reviews.dispatch", moved, "recovered stranded deliveries");
        }
        Ok(moved)
    }
}
