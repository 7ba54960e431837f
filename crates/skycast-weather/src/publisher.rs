//! Best-effort "forecast requested" notifications.
//!
//! `notify` hands the event to a bounded queue and returns immediately. A
//! single worker drains the queue into an [`EventSink`]. A full queue drops
//! the event, a failing sink is logged; neither reaches the forecast caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::{CountryCode, ForecastRequest};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastRequested {
    pub city: String,
    pub country_code: CountryCode,
    pub days: u8,
    pub requested_at: DateTime<Utc>,
}

impl From<&ForecastRequest> for ForecastRequested {
    fn from(request: &ForecastRequest) -> Self {
        Self {
            city: request.city().to_string(),
            country_code: request.country_code(),
            days: request.days(),
            requested_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Sink rejected event: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Destination for side-channel events.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, event: &ForecastRequested) -> Result<(), PublishError>;
}

/// Writes events to the log; used when no external sink is configured.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, event: &ForecastRequested) -> Result<(), PublishError> {
        tracing::info!(
            city = %event.city,
            country = %event.country_code,
            days = event.days,
            "Forecast requested"
        );
        Ok(())
    }
}

/// POSTs each event as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn publish(&self, event: &ForecastRequested) -> Result<(), PublishError> {
        let response = self.client.post(&self.url).json(event).send().await?;
        if !response.status().is_success() {
            return Err(PublishError::Rejected(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub published: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

pub struct SideChannelPublisher {
    tx: mpsc::Sender<ForecastRequested>,
    counters: Arc<Counters>,
    worker: JoinHandle<()>,
}

impl SideChannelPublisher {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(sink: Arc<dyn EventSink>, capacity: usize, publish_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(run_worker(rx, sink, publish_timeout, Arc::clone(&counters)));

        Self {
            tx,
            counters,
            worker,
        }
    }

    /// Queue a "forecast requested" event without waiting.
    pub fn notify(&self, request: &ForecastRequest) {
        match self.tx.try_send(ForecastRequested::from(request)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Side-channel queue full, dropping event for {}, {}",
                    event.city,
                    event.country_code
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Side-channel worker stopped, dropping event");
            }
        }
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.counters.published.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting events, deliver what is queued, and wait for the worker.
    pub async fn shutdown(self) -> PublisherStats {
        let Self {
            tx,
            counters,
            worker,
        } = self;
        drop(tx);
        if let Err(e) = worker.await {
            tracing::error!("Side-channel worker failed: {}", e);
        }
        PublisherStats {
            published: counters.published.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<ForecastRequested>,
    sink: Arc<dyn EventSink>,
    publish_timeout: Duration,
    counters: Arc<Counters>,
) {
    tracing::debug!("Side-channel worker started (sink: {})", sink.name());

    while let Some(event) = rx.recv().await {
        match tokio::time::timeout(publish_timeout, sink.publish(&event)).await {
            Ok(Ok(())) => {
                counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Failed to publish event via {}: {}", sink.name(), e);
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Publishing via {} timed out after {:?}",
                    sink.name(),
                    publish_timeout
                );
            }
        }
    }

    tracing::debug!("Side-channel worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::request;
    use parking_lot::Mutex;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ForecastRequested>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn publish(&self, event: &ForecastRequested) -> Result<(), PublishError> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn publish(&self, _event: &ForecastRequested) -> Result<(), PublishError> {
            Err(PublishError::Rejected("broker down".into()))
        }
    }

    /// Blocks every publish until a permit is released.
    struct GatedSink {
        gate: Semaphore,
    }

    #[async_trait]
    impl EventSink for GatedSink {
        fn name(&self) -> &str {
            "gated"
        }

        async fn publish(&self, _event: &ForecastRequested) -> Result<(), PublishError> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| PublishError::Rejected(e.to_string()))?;
            permit.forget();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_events_are_delivered_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let publisher = SideChannelPublisher::spawn(sink.clone(), 16, Duration::from_secs(1));

        publisher.notify(&request("Prague", 1));
        publisher.notify(&request("Brno", 3));
        let stats = publisher.shutdown().await;

        assert_eq!(stats.published, 2);
        let events = sink.events.lock();
        assert_eq!(events[0].city, "Prague");
        assert_eq!(events[1].city, "Brno");
        assert_eq!(events[1].days, 3);
    }

    #[tokio::test]
    async fn test_sink_failures_are_counted_not_raised() {
        let publisher =
            SideChannelPublisher::spawn(Arc::new(FailingSink), 16, Duration::from_secs(1));
        publisher.notify(&request("Prague", 1));
        let stats = publisher.shutdown().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.published, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let sink = Arc::new(GatedSink {
            gate: Semaphore::new(0),
        });
        let publisher = SideChannelPublisher::spawn(sink.clone(), 1, Duration::from_secs(5));

        // One event held by the worker, one in the queue, the rest dropped.
        for _ in 0..5 {
            publisher.notify(&request("Prague", 1));
            tokio::task::yield_now().await;
        }
        let dropped = publisher.stats().dropped;
        assert!(dropped >= 3, "dropped {}", dropped);

        sink.gate.add_permits(10);
        let stats = publisher.shutdown().await;
        assert_eq!(stats.published + stats.dropped, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sink_times_out() {
        let sink = Arc::new(GatedSink {
            gate: Semaphore::new(0),
        });
        let publisher = SideChannelPublisher::spawn(sink, 4, Duration::from_millis(100));
        publisher.notify(&request("Prague", 1));
        let stats = publisher.shutdown().await;
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_webhook_sink_posts_json() {
        use wiremock::matchers::{body_partial_json, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .and(body_partial_json(serde_json::json!({
                "city": "Prague",
                "country_code": "CZ",
                "days": 2
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookSink::new(Client::new(), format!("{}/events", server.uri()));
        sink.publish(&ForecastRequested::from(&request("Prague", 2)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_webhook_sink_rejects_error_status() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = WebhookSink::new(Client::new(), server.uri());
        let err = sink
            .publish(&ForecastRequested::from(&request("Prague", 2)))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Rejected(ref m) if m.contains("500")));
    }
}
