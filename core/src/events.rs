//! Event broadcaster (spec.md §4.4): a process-wide bus of structured
//! lifecycle events (session created/exited, subscriber attached, etc.),
//! independent of any one session's output. Subscribers get a heartbeat
//! and an inactivity timeout per spec.md §4.4.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, Instant};
use tracing::debug;

use crate::session::SessionId;

/// Capacity of the broadcast channel backing the bus. A slow subscriber that
/// falls more than this many events behind receives `Lagged` and must
/// resubscribe rather than stall publishers.
const EVENT_BUS_CAP: usize = 1024;

/// One structured event (spec.md §3).
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            session_id: None,
            timestamp: crate::session::unix_now_secs(),
            attributes: serde_json::Map::new(),
        }
    }

    pub fn with_session(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// The subscribable bus. One instance per server process.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl EventBus {
    pub fn new(heartbeat_interval: Duration, client_timeout: Duration) -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUS_CAP);
        Self {
            tx,
            heartbeat_interval,
            client_timeout,
        }
    }

    /// Publish an event to all current subscribers. Non-blocking; if there
    /// are no subscribers this is a no-op (`send` errors are swallowed).
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the bus. Returns a stream-friendly receiver that also
    /// yields periodic heartbeat events and closes itself if the caller
    /// does not poll it within `client_timeout`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn client_timeout(&self) -> Duration {
        self.client_timeout
    }
}

/// Drive one subscriber's lifecycle: forward bus events to `sink`, inject a
/// heartbeat event on `heartbeat_interval`, and stop if `sink` refuses
/// delivery for longer than `client_timeout` (spec.md §4.4).
pub async fn pump_subscriber(
    mut rx: broadcast::Receiver<Event>,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    sink: tokio::sync::mpsc::Sender<Event>,
) {
    let mut ticker = interval(heartbeat_interval);
    let mut last_activity = Instant::now();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let heartbeat = Event::new("heartbeat");
                if timeout(client_timeout, sink.send(heartbeat)).await.is_err() {
                    debug!("event subscriber timed out on heartbeat send");
                    return;
                }
            }
            received = rx.recv() => {
                match received {
                    Ok(event) => {
                        last_activity = Instant::now();
                        if timeout(client_timeout, sink.send(event)).await.is_err() {
                            debug!("event subscriber timed out on event send");
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event subscriber lagged, continuing from latest");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
        if last_activity.elapsed() > client_timeout {
            debug!("event subscriber exceeded client timeout with no activity");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new(Duration::from_secs(30), Duration::from_secs(120));
        let mut rx = bus.subscribe();
        bus.publish(Event::new("session.created"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "session.created");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(Duration::from_secs(30), Duration::from_secs(120));
        bus.publish(Event::new("session.created"));
    }

    #[tokio::test]
    async fn heartbeat_is_delivered_on_interval() {
        let bus = EventBus::new(Duration::from_millis(20), Duration::from_secs(5));
        let rx = bus.subscribe();
        let (tx, mut out_rx) = tokio::sync::mpsc::channel(8);
        tokio::spawn(pump_subscriber(rx, Duration::from_millis(20), Duration::from_secs(5), tx));
        let event = tokio::time::timeout(Duration::from_millis(500), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, "heartbeat");
    }

    #[tokio::test]
    async fn lagged_subscriber_continues_instead_of_closing() {
        let bus = EventBus::new(Duration::from_secs(30), Duration::from_secs(5));
        let rx = bus.subscribe();
        for i in 0..(EVENT_BUS_CAP + 10) {
            bus.publish(Event::new(format!("evt-{i}")));
        }
        let (tx, mut out_rx) = tokio::sync::mpsc::channel(8);
        tokio::spawn(pump_subscriber(rx, Duration::from_secs(30), Duration::from_secs(5), tx));
        let event = tokio::time::timeout(Duration::from_millis(500), out_rx.recv())
            .await
            .unwrap();
        assert!(event.is_some());
    }
}
