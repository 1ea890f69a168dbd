//! Output fan-out (spec.md §4.3): turns one PTY's raw byte stream into
//! per-subscriber deliveries on two independent transports — a text record
//! stream (asciinema-v2-shaped JSON lines) and a debounced binary screen
//! snapshot. Each subscriber gets its own bounded queue so one slow client
//! never backs up another (spec.md §5 "Viewer isolation").

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::screen::ScreenModel;
use crate::wire::TextRecord;

/// Capacity of one text-stream subscriber's queue (spec.md §4.3).
const TEXT_QUEUE_CAP: usize = 100;
/// Capacity of one binary-snapshot subscriber's queue.
const SNAPSHOT_QUEUE_CAP: usize = 16;
/// Debounce window for coalescing bursts of output into one snapshot render.
const SNAPSHOT_DEBOUNCE: Duration = Duration::from_millis(50);
/// A subscriber that has dropped this many records is disconnected rather
/// than kept around indefinitely skipping output (spec.md §4.3, §8 scenario 3).
const DROP_DISCONNECT_THRESHOLD: u64 = 50;

/// Outcome of attempting to deliver to one subscriber (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverOutcome {
    Enqueued,
    Dropped { total_drops: u64 },
    Closed,
}

enum PushOutcome {
    Enqueued,
    DroppedOldest,
}

/// A bounded FIFO shared between one producer (the `Fanout`) and one
/// consumer (whatever is reading the subscriber's stream). Unlike
/// `tokio::sync::mpsc`, a push against a full queue evicts the oldest
/// queued item rather than rejecting the newest one, matching spec.md
/// §4.3's "drop the oldest record" requirement. Consumer-gone detection
/// piggybacks on `Arc` reference counting: once the receiving handle is
/// dropped, only the `Fanout`'s own clone remains.
struct BoundedQueue<T> {
    items: StdMutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
    cap: usize,
}

impl<T> BoundedQueue<T> {
    fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            items: StdMutex::new(VecDeque::with_capacity(cap)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            cap,
        })
    }

    fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut items = self.items.lock().unwrap();
            let outcome = if items.len() >= self.cap {
                items.pop_front();
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Enqueued
            };
            items.push_back(item);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    async fn recv(&self) -> Option<T> {
        loop {
            {
                let mut items = self.items.lock().unwrap();
                if let Some(item) = items.pop_front() {
                    return Some(item);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Receiving handle for one subscriber's queue. Implements the same
/// `recv`-in-a-loop shape as `tokio::sync::mpsc::Receiver` so callers don't
/// need to know the fan-out uses a custom queue underneath.
pub struct QueueReceiver<T> {
    queue: Arc<BoundedQueue<T>>,
}

impl<T> QueueReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.queue.recv().await
    }
}

pub type TextReceiver = QueueReceiver<TextRecord>;
pub type SnapshotReceiver = QueueReceiver<Arc<crate::screen::ScreenSnapshot>>;

/// A text-stream subscriber: receives `TextRecord`s as they are produced.
pub struct TextSubscriber {
    id: Uuid,
    queue: Arc<BoundedQueue<TextRecord>>,
    drops: AtomicU64,
}

/// A binary-snapshot subscriber: receives whole-screen renders, not raw bytes.
pub struct BinarySubscriber {
    id: Uuid,
    queue: Arc<BoundedQueue<Arc<crate::screen::ScreenSnapshot>>>,
    drops: AtomicU64,
}

enum Subscriber {
    TextStream(TextSubscriber),
    BinarySnapshot(BinarySubscriber),
}

impl Subscriber {
    fn id(&self) -> Uuid {
        match self {
            Subscriber::TextStream(s) => s.id,
            Subscriber::BinarySnapshot(s) => s.id,
        }
    }
}

/// A consumer dropping its receiving handle leaves only the `Fanout`'s own
/// `Arc` clone behind.
fn consumer_gone<T>(queue: &Arc<BoundedQueue<T>>) -> bool {
    Arc::strong_count(queue) <= 1
}

fn deliver_text(sub: &TextSubscriber, record: &TextRecord) -> DeliverOutcome {
    if consumer_gone(&sub.queue) {
        return DeliverOutcome::Closed;
    }
    match sub.queue.push(record.clone()) {
        PushOutcome::Enqueued => DeliverOutcome::Enqueued,
        PushOutcome::DroppedOldest => {
            let total = sub.drops.fetch_add(1, Ordering::Relaxed) + 1;
            // Best-effort marker; if this itself evicts something under
            // sustained pressure that eviction isn't separately counted.
            sub.queue.push(TextRecord::Dropped { total_drops: total });
            if total >= DROP_DISCONNECT_THRESHOLD {
                sub.queue.close();
                return DeliverOutcome::Closed;
            }
            DeliverOutcome::Dropped { total_drops: total }
        }
    }
}

fn deliver_snapshot(
    sub: &BinarySubscriber,
    snapshot: &Arc<crate::screen::ScreenSnapshot>,
) -> DeliverOutcome {
    if consumer_gone(&sub.queue) {
        return DeliverOutcome::Closed;
    }
    match sub.queue.push(Arc::clone(snapshot)) {
        PushOutcome::Enqueued => DeliverOutcome::Enqueued,
        PushOutcome::DroppedOldest => {
            let total = sub.drops.fetch_add(1, Ordering::Relaxed) + 1;
            DeliverOutcome::Dropped { total_drops: total }
        }
    }
}

/// One session's fan-out state: the subscriber list plus the screen model
/// that the binary transport renders from.
struct Inner {
    subscribers: Vec<Subscriber>,
    screen: ScreenModel,
}

/// Fan-out for a single session. Owned by the session's `SessionContext`
/// and fed every time the PTY produces output.
pub struct Fanout {
    inner: Mutex<Inner>,
    dirty: Notify,
}

impl Fanout {
    pub fn new(cols: u16, rows: u16) -> Arc<Self> {
        let fanout = Arc::new(Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                screen: ScreenModel::new(cols, rows),
            }),
            dirty: Notify::new(),
        });
        Self::spawn_snapshot_debouncer(Arc::clone(&fanout));
        fanout
    }

    fn spawn_snapshot_debouncer(fanout: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                fanout.dirty.notified().await;
                tokio::time::sleep(SNAPSHOT_DEBOUNCE).await;
                // Drain any further notifications coalesced during the sleep.
                fanout.render_and_broadcast_snapshot().await;
            }
        });
    }

    async fn render_and_broadcast_snapshot(&self) {
        let mut inner = self.inner.lock().await;
        let snapshot = Arc::new(inner.screen.snapshot());
        inner
            .subscribers
            .retain(|sub| match sub {
                Subscriber::BinarySnapshot(s) => {
                    !matches!(deliver_snapshot(s, &snapshot), DeliverOutcome::Closed)
                }
                Subscriber::TextStream(_) => true,
            });
    }

    /// Feed a chunk of raw PTY output: publish it as a text record to every
    /// text subscriber, advance the screen model, and schedule a debounced
    /// snapshot refresh for binary subscribers.
    pub async fn publish_output(&self, t: f64, data: &[u8]) {
        let record = TextRecord::Output {
            t,
            data: data.to_vec(),
        };
        let mut inner = self.inner.lock().await;
        inner.screen.feed(data);
        inner.subscribers.retain(|sub| match sub {
            Subscriber::TextStream(s) => !matches!(deliver_text(s, &record), DeliverOutcome::Closed),
            Subscriber::BinarySnapshot(_) => true,
        });
        drop(inner);
        self.dirty.notify_one();
    }

    /// Publish a resize record and resize the screen model in lockstep.
    pub async fn publish_resize(&self, t: f64, cols: u16, rows: u16) {
        let record = TextRecord::Resize { t, cols, rows };
        let mut inner = self.inner.lock().await;
        inner.screen.resize(cols, rows);
        inner.subscribers.retain(|sub| match sub {
            Subscriber::TextStream(s) => !matches!(deliver_text(s, &record), DeliverOutcome::Closed),
            Subscriber::BinarySnapshot(_) => true,
        });
        drop(inner);
        self.dirty.notify_one();
    }

    /// Publish the terminal exit record; subscribers are expected to close
    /// their streams once they see it.
    pub async fn publish_exit(&self, code: i32, session_id: &str) {
        let record = TextRecord::Exit {
            code,
            session_id: session_id.to_string(),
        };
        let inner = self.inner.lock().await;
        for sub in inner.subscribers.iter() {
            if let Subscriber::TextStream(s) = sub {
                let _ = deliver_text(s, &record);
            }
        }
    }

    /// Attach a text-stream subscriber. Returns its id (for `detach`) and the
    /// receiving end of its queue.
    pub async fn attach_text(&self) -> (Uuid, TextReceiver) {
        let queue = BoundedQueue::new(TEXT_QUEUE_CAP);
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock().await;
        inner.subscribers.push(Subscriber::TextStream(TextSubscriber {
            id,
            queue: Arc::clone(&queue),
            drops: AtomicU64::new(0),
        }));
        (id, QueueReceiver { queue })
    }

    /// Attach a binary-snapshot subscriber, immediately sending one initial
    /// snapshot so new viewers don't wait for the next output burst.
    pub async fn attach_binary(&self) -> (Uuid, SnapshotReceiver) {
        let queue = BoundedQueue::new(SNAPSHOT_QUEUE_CAP);
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock().await;
        let initial = Arc::new(inner.screen.snapshot());
        queue.push(initial);
        inner
            .subscribers
            .push(Subscriber::BinarySnapshot(BinarySubscriber {
                id,
                queue: Arc::clone(&queue),
                drops: AtomicU64::new(0),
            }));
        (id, QueueReceiver { queue })
    }

    pub async fn detach(&self, id: Uuid) {
        let mut inner = self.inner.lock().await;
        inner.subscribers.retain(|sub| sub.id() != id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_subscriber_receives_output_record() {
        let fanout = Fanout::new(80, 24);
        let (_id, mut rx) = fanout.attach_text().await;
        fanout.publish_output(0.0, b"hello").await;
        let record = rx.recv().await.unwrap();
        assert_eq!(
            record,
            TextRecord::Output {
                t: 0.0,
                data: b"hello".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn binary_subscriber_gets_initial_snapshot() {
        let fanout = Fanout::new(80, 24);
        let (_id, mut rx) = fanout.attach_binary().await;
        let snap = rx.recv().await.unwrap();
        assert_eq!(snap.cols, 80);
        assert_eq!(snap.rows, 24);
    }

    #[tokio::test]
    async fn detach_removes_subscriber() {
        let fanout = Fanout::new(80, 24);
        let (id, _rx) = fanout.attach_text().await;
        assert_eq!(fanout.subscriber_count().await, 1);
        fanout.detach(id).await;
        assert_eq!(fanout.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_gets_a_marker() {
        let fanout = Fanout::new(80, 24);
        let (_slow_id, mut slow_rx) = fanout.attach_text().await;
        let (_fast_id, mut fast_rx) = fanout.attach_text().await;
        // Overflow the slow subscriber's queue without draining it.
        for i in 0..(TEXT_QUEUE_CAP + 10) {
            fanout.publish_output(i as f64, b"x").await;
        }
        // The fast subscriber saw every record; delivery never blocked on
        // the slow one.
        let mut seen = 0;
        while fast_rx.try_recv_now().is_some() {
            seen += 1;
        }
        assert!(seen > 0);

        // The slow subscriber's oldest record was evicted, not its newest:
        // the first record still in its queue is not t=0.0.
        let first = slow_rx.recv().await.unwrap();
        if let TextRecord::Output { t, .. } = first {
            assert!(t > 0.0, "oldest record should have been dropped, not retained");
        }
        // Somewhere in the remaining stream a drop marker should appear.
        let mut saw_marker = false;
        while let Some(record) = slow_rx.try_recv_now() {
            if matches!(record, TextRecord::Dropped { .. }) {
                saw_marker = true;
            }
        }
        assert!(saw_marker, "expected a TextRecord::Dropped marker in the stream");
    }

    #[tokio::test]
    async fn subscriber_is_disconnected_after_drop_threshold() {
        let fanout = Fanout::new(80, 24);
        let (_id, mut rx) = fanout.attach_text().await;
        // Don't drain; push far past the disconnect threshold.
        for i in 0..(TEXT_QUEUE_CAP as u64 + DROP_DISCONNECT_THRESHOLD * 2) {
            fanout.publish_output(i as f64, b"x").await;
        }
        assert_eq!(fanout.subscriber_count().await, 0, "subscriber should have been removed");
        // The receiver should eventually drain to a close (None), not hang.
        let mut drained_to_close = false;
        for _ in 0..10_000 {
            match rx.try_recv_now() {
                Some(_) => continue,
                None => {
                    drained_to_close = true;
                    break;
                }
            }
        }
        assert!(drained_to_close);
    }

    impl<T> QueueReceiver<T> {
        /// Test-only non-blocking peek used to assert on ordering without
        /// racing the async `recv` against `tokio::time::pause`.
        fn try_recv_now(&mut self) -> Option<T> {
            let mut items = self.queue.items.lock().unwrap();
            items.pop_front()
        }
    }
}
