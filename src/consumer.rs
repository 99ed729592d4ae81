//! Analytics consumer: broker subscription, batching, and graph loading.
//!
//! The consumer owns the only write path into the graph store. Delivery is
//! at-least-once: a batch that fails to flush is retained and retried on the
//! next trigger, and the store's MERGE-based writes absorb the duplicates.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::{ConsumerConfig, RedisConfig};
use crate::error::{AppError, AppResult};
use crate::events::Event;
use crate::graph::GraphStore;
use crate::metrics;
use crate::utils::mask_url_credentials;

/// In-memory accumulator between the broker and the graph store.
///
/// Flushes on size or age, whichever comes first. `restore` puts a failed
/// batch back so no event is dropped between flush attempts.
pub struct EventBatch {
    events: Vec<Event>,
    capacity: usize,
    max_age: Duration,
    oldest: Option<Instant>,
}

impl EventBatch {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
            max_age,
            oldest: None,
        }
    }

    pub fn push(&mut self, event: Event) {
        if self.events.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn should_flush(&self) -> bool {
        if self.events.len() >= self.capacity {
            return true;
        }
        match self.oldest {
            Some(oldest) => oldest.elapsed() >= self.max_age,
            None => false,
        }
    }

    /// Hands the accumulated events to the caller and resets the clock.
    pub fn take(&mut self) -> Vec<Event> {
        self.oldest = None;
        std::mem::take(&mut self.events)
    }

    /// Reinstates a batch whose flush failed, ahead of anything that arrived
    /// in the meantime.
    pub fn restore(&mut self, mut failed: Vec<Event>) {
        failed.append(&mut self.events);
        self.events = failed;
        if self.oldest.is_none() {
            self.oldest = Some(Instant::now());
        }
    }
}

/// Subscribes to the gateway's event channel and loads batches into the
/// graph store, reconnecting with capped exponential backoff on broker loss.
pub struct AnalyticsConsumer {
    redis: RedisConfig,
    consumer: ConsumerConfig,
    store: Arc<dyn GraphStore>,
}

impl AnalyticsConsumer {
    pub fn new(redis: RedisConfig, consumer: ConsumerConfig, store: Arc<dyn GraphStore>) -> Self {
        Self {
            redis,
            consumer,
            store,
        }
    }

    /// Runs until `shutdown` flips. The pending batch survives reconnects
    /// and is flushed one last time before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        let mut batch = EventBatch::new(
            self.consumer.batch_size,
            Duration::from_millis(self.consumer.flush_interval_ms),
        );
        let min_backoff = Duration::from_millis(self.consumer.reconnect_backoff_min_ms);
        let max_backoff = Duration::from_millis(self.consumer.reconnect_backoff_max_ms);
        let mut backoff = min_backoff;

        loop {
            let result = self
                .subscribe_and_consume(&mut batch, &mut shutdown, &mut backoff)
                .await;
            match result {
                Ok(()) => {
                    self.flush(&mut batch).await;
                    tracing::info!("Analytics consumer stopped");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_in = ?backoff,
                        "Broker subscription lost, reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => {
                            self.flush(&mut batch).await;
                            return Ok(());
                        }
                    }
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
    }

    /// One subscription lifetime. Returns Ok on shutdown, Err on broker loss.
    /// A successful subscription resets the reconnect backoff.
    async fn subscribe_and_consume(
        &self,
        batch: &mut EventBatch,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Duration,
    ) -> AppResult<()> {
        tracing::info!(
            url = %mask_url_credentials(&self.redis.url),
            channel = %self.redis.event_channel,
            "Subscribing to event channel"
        );

        let client = redis::Client::open(self.redis.url.clone())
            .map_err(|e| AppError::broker(format!("invalid Redis URL: {}", e)))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| AppError::broker(format!("failed to connect to Redis: {}", e)))?;
        pubsub
            .subscribe(&self.redis.event_channel)
            .await
            .map_err(|e| AppError::broker(format!("subscribe failed: {}", e)))?;
        *backoff = Duration::from_millis(self.consumer.reconnect_backoff_min_ms);

        let mut stream = pubsub.on_message();
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.consumer.flush_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Err(AppError::broker("subscription stream ended"));
                    };
                    self.accept(batch, &msg);
                    if batch.should_flush() {
                        self.flush(batch).await;
                    }
                }
                _ = ticker.tick() => {
                    // Interval flush regardless of size
                    self.flush(batch).await;
                }
                _ = shutdown.changed() => {
                    return Ok(());
                }
            }
        }
    }

    /// Parses one broker message into the batch. Malformed payloads are
    /// counted and dropped; they must never stall the pipeline.
    fn accept(&self, batch: &mut EventBatch, msg: &redis::Msg) {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                metrics::MALFORMED_MESSAGES_TOTAL.inc();
                tracing::warn!(error = %e, "Dropping non-text broker message");
                return;
            }
        };

        match parse_event(&payload) {
            Ok(event) => {
                metrics::EVENTS_CONSUMED_TOTAL.inc();
                batch.push(event);
            }
            Err(e) => {
                metrics::MALFORMED_MESSAGES_TOTAL.inc();
                tracing::warn!(error = %e, "Dropping malformed event payload");
            }
        }
    }

    /// Writes the pending batch. On failure the batch is restored intact so
    /// the next trigger retries it.
    async fn flush(&self, batch: &mut EventBatch) {
        if batch.is_empty() {
            return;
        }

        let events = batch.take();
        let count = events.len();
        let started = Instant::now();

        match self.store.write_batch(&events).await {
            Ok(()) => {
                metrics::BATCHES_FLUSHED_TOTAL.inc();
                metrics::FLUSH_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
                tracing::debug!(events = count, "Batch flushed to graph store");
            }
            Err(e) => {
                metrics::FLUSH_FAILURES_TOTAL.inc();
                tracing::error!(error = %e, events = count, "Batch flush failed, retaining batch");
                batch.restore(events);
            }
        }
    }
}

/// Deserializes one broker payload into an event.
fn parse_event(payload: &str) -> AppResult<Event> {
    serde_json::from_str(payload).map_err(|e| AppError::ConsumerParse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Action;
    use crate::graph::MemoryStore;

    fn event(n: usize) -> Event {
        Event::new(Action::TokenIssued, "203.0.113.1", format!("/path/{}", n))
    }

    #[test]
    fn test_batch_flushes_on_size() {
        let mut batch = EventBatch::new(3, Duration::from_secs(60));
        batch.push(event(0));
        batch.push(event(1));
        assert!(!batch.should_flush());
        batch.push(event(2));
        assert!(batch.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_flushes_on_age() {
        let mut batch = EventBatch::new(100, Duration::from_secs(5));
        batch.push(event(0));
        assert!(!batch.should_flush());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(batch.should_flush());
    }

    #[test]
    fn test_parse_event_round_trip() {
        let original = event(0);
        let payload = serde_json::to_string(&original).unwrap();
        let parsed = parse_event(&payload).unwrap();
        assert_eq!(parsed.event_id, original.event_id);
    }

    #[test]
    fn test_malformed_payload_is_a_parse_error() {
        let result = parse_event("{\"action\": \"token-issued\"");
        assert!(matches!(result, Err(AppError::ConsumerParse(_))));

        let result = parse_event("not json at all");
        assert!(matches!(result, Err(AppError::ConsumerParse(_))));
    }

    #[test]
    fn test_empty_batch_never_flushes() {
        let batch = EventBatch::new(1, Duration::from_millis(0));
        assert!(!batch.should_flush());
    }

    #[test]
    fn test_take_resets_and_restore_preserves_order() {
        let mut batch = EventBatch::new(10, Duration::from_secs(5));
        let first = event(0);
        let first_id = first.event_id.clone();
        batch.push(first);

        let taken = batch.take();
        assert_eq!(taken.len(), 1);
        assert!(batch.is_empty());

        let late = event(1);
        let late_id = late.event_id.clone();
        batch.push(late);
        batch.restore(taken);

        assert_eq!(batch.len(), 2);
        let drained = batch.take();
        assert_eq!(drained[0].event_id, first_id);
        assert_eq!(drained[1].event_id, late_id);
    }

    #[tokio::test]
    async fn test_flush_writes_batch_to_store() {
        let store = Arc::new(MemoryStore::new());
        let config = crate::config::Config::for_tests("naglfar-test-secret");
        let consumer =
            AnalyticsConsumer::new(config.redis.clone(), config.consumer.clone(), store.clone());

        let mut batch = EventBatch::new(10, Duration::from_secs(5));
        batch.push(event(0));
        batch.push(event(1));
        consumer.flush(&mut batch).await;

        assert!(batch.is_empty());
        assert_eq!(store.counts().await.events, 2);
    }
}
