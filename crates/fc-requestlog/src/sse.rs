//! SSE fan-out for request log events.
//!
//! One `broadcast::Sender<LogEvent>` feeds every subscriber's own bounded
//! `mpsc` channel (cap 100); a slow subscriber drops events instead of
//! stalling the writer, matching the donor's shutdown-broadcast idiom
//! generalized from a unit signal to a real payload.

use fc_common::RequestLog;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::error::{RequestLogError, Result};

const SUBSCRIBER_QUEUE_CAP: usize = 100;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum LogEvent {
    #[serde(rename = "log:created")]
    Created(RequestLog),
    #[serde(rename = "log:updated")]
    Updated(RequestLog),
}

pub struct LogEventBroadcaster {
    tx: broadcast::Sender<LogEvent>,
    subscriber_count: Arc<AtomicUsize>,
    max_subscribers: usize,
}

pub struct Subscription {
    pub rx: mpsc::Receiver<LogEvent>,
    count: Arc<AtomicUsize>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LogEventBroadcaster {
    pub fn new(max_subscribers: usize) -> Self {
        let (tx, _rx) = broadcast::channel(SUBSCRIBER_QUEUE_CAP);
        Self {
            tx,
            subscriber_count: Arc::new(AtomicUsize::new(0)),
            max_subscribers,
        }
    }

    pub fn publish(&self, event: LogEvent) {
        // No receivers is the common case between SSE clients; not an error.
        let _ = self.tx.send(event);
    }

    /// Registers a new subscriber, fanning broadcast events into its own
    /// bounded queue. Fails once `max_subscribers` is already registered.
    pub fn subscribe(&self) -> Result<Subscription> {
        let current = self.subscriber_count.fetch_add(1, Ordering::SeqCst);
        if current >= self.max_subscribers {
            self.subscriber_count.fetch_sub(1, Ordering::SeqCst);
            return Err(RequestLogError::SubscriberCapacityReached(self.max_subscribers));
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAP);
        let mut broadcast_rx = self.tx.subscribe();
        let count = self.subscriber_count.clone();

        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(event) => {
                        if tx.try_send(event).is_err() {
                            warn!("SSE subscriber queue full, dropping event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "SSE subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                if tx.is_closed() {
                    break;
                }
            }
        });

        Ok(Subscription { rx, count })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_common::{RequestLog, RequestLogStatus};

    fn sample_log() -> RequestLog {
        RequestLog {
            id: "req_1".to_string(),
            status: RequestLogStatus::Pending,
            initial_time: chrono::Utc::now(),
            complete_time: None,
            duration_ms: None,
            input_tokens: None,
            output_tokens: None,
            cache_creation_tokens: None,
            cache_read_tokens: None,
            total_tokens: None,
            input_cost: None,
            output_cost: None,
            total_cost: None,
            channel_id: None,
            channel_uid: None,
            channel_name: None,
            endpoint: "/v1/messages".to_string(),
            client_id: None,
            session_id: None,
            api_key_id: None,
            failover_info: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let broadcaster = LogEventBroadcaster::new(10);
        let mut sub = broadcaster.subscribe().unwrap();
        broadcaster.publish(LogEvent::Created(sample_log()));
        let event = sub.rx.recv().await.unwrap();
        assert!(matches!(event, LogEvent::Created(_)));
    }

    #[tokio::test]
    async fn subscriber_cap_is_enforced() {
        let broadcaster = LogEventBroadcaster::new(1);
        let _first = broadcaster.subscribe().unwrap();
        let second = broadcaster.subscribe();
        assert!(matches!(second, Err(RequestLogError::SubscriberCapacityReached(1))));
    }

    #[tokio::test]
    async fn dropping_subscription_frees_a_slot() {
        let broadcaster = LogEventBroadcaster::new(1);
        {
            let _first = broadcaster.subscribe().unwrap();
        }
        tokio::task::yield_now().await;
        assert!(broadcaster.subscribe().is_ok());
    }
}
