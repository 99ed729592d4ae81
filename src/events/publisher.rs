//! Decision event publishing.
//!
//! The publisher is the only point where the request path touches the
//! broker. It is bounded by a short timeout and never fails the request:
//! a broker outage costs analytics, not availability.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::config::RedisConfig;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::utils::mask_url_credentials;

use super::types::Event;

/// Sink for gateway decision events.
///
/// Seam for substituting a durable queue (or a test capture) without
/// touching the middleware.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &Event) -> AppResult<()>;
}

/// Publishes events to a single Redis pub/sub channel.
///
/// Fire-and-forget: no retry, no local queue. Events published while no
/// consumer is subscribed are lost, which is the accepted failure mode for
/// a non-critical-path pipeline.
pub struct RedisEventPublisher {
    conn: redis::aio::ConnectionManager,
    channel: String,
    publish_timeout: Duration,
}

impl RedisEventPublisher {
    pub async fn new(config: &RedisConfig) -> AppResult<Self> {
        tracing::info!(
            url = %mask_url_credentials(&config.url),
            channel = %config.event_channel,
            "Connecting event publisher to Redis"
        );

        let client = redis::Client::open(config.url.clone())
            .map_err(|e| AppError::broker(format!("invalid Redis URL: {}", e)))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| AppError::broker(format!("failed to connect to Redis: {}", e)))?;

        Ok(Self {
            conn,
            channel: config.event_channel.clone(),
            publish_timeout: Duration::from_millis(config.publish_timeout_ms),
        })
    }
}

#[async_trait]
impl EventSink for RedisEventPublisher {
    async fn publish(&self, event: &Event) -> AppResult<()> {
        let payload = serde_json::to_string(event)?;

        // ConnectionManager multiplexes commands over one connection and is
        // cheap to clone, so each publish awaits only its own send and the
        // timeout bounds the whole call. Concurrent requests must never
        // queue behind a stalled broker.
        let mut conn = self.conn.clone();
        let channel = self.channel.clone();
        let send = async move {
            let _: i64 = conn.publish(&channel, &payload).await?;
            Ok::<(), redis::RedisError>(())
        };

        match send_within(self.publish_timeout, send).await {
            Ok(()) => {
                metrics::EVENTS_PUBLISHED_TOTAL.inc();
                tracing::debug!(
                    event_id = %event.event_id,
                    action = %event.action.as_str(),
                    "Event published"
                );
                Ok(())
            }
            Err(e) => {
                metrics::PUBLISH_FAILURES_TOTAL.inc();
                Err(e)
            }
        }
    }
}

/// Bounds one broker send. The timeout covers the send future from its
/// first poll; there is nothing shared to wait on before it starts.
async fn send_within<F>(timeout: Duration, send: F) -> AppResult<()>
where
    F: Future<Output = Result<(), redis::RedisError>>,
{
    match tokio::time::timeout(timeout, send).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(AppError::broker(format!("publish failed: {}", e))),
        Err(_) => Err(AppError::broker(format!(
            "publish timed out after {:?}",
            timeout
        ))),
    }
}
