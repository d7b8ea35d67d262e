use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Queue depth per subscriber stream; a subscriber that falls this far
/// behind is torn down rather than allowed to stall ingest.
const STREAM_CHANNEL_CAPACITY: usize = 256;

/// One named server-sent event queued towards a subscriber.
#[derive(Debug, Clone)]
pub struct SseFrame {
    pub event: &'static str,
    pub data: Value,
}

impl SseFrame {
    pub fn new(event: &'static str, data: Value) -> Self {
        Self { event, data }
    }
}

/// One live subscriber stream bound to a session.
pub struct StreamRecord {
    pub id: Uuid,
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    sender: mpsc::Sender<SseFrame>,
    last_sent: AtomicI64,
}

impl StreamRecord {
    /// Resolves once the subscriber side of the channel is gone.
    pub async fn closed(&self) {
        self.sender.closed().await;
    }

    pub fn last_sent(&self) -> Option<DateTime<Utc>> {
        let millis = self.last_sent.load(Ordering::Relaxed);
        DateTime::<Utc>::from_timestamp_millis(millis)
    }
}

#[derive(Default)]
struct HubIndex {
    streams: HashMap<Uuid, Arc<StreamRecord>>,
    sessions: HashMap<String, HashSet<Uuid>>,
}

/// In-memory registry of all subscriber streams on this instance.
///
/// Fan-out takes a snapshot of the target streams under the lock and writes
/// outside it, so one slow subscriber can never block its siblings. Writes
/// to a single stream are serialized by that stream's channel.
#[derive(Default)]
pub struct StreamHub {
    index: RwLock<HubIndex>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber stream and returns its receive side.
    pub fn add(
        &self,
        session_id: &str,
        user_id: &str,
        client_ip: Option<String>,
        user_agent: Option<String>,
    ) -> (Arc<StreamRecord>, mpsc::Receiver<SseFrame>) {
        let (sender, receiver) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let record = Arc::new(StreamRecord {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            created_at: Utc::now(),
            client_ip,
            user_agent,
            sender,
            last_sent: AtomicI64::new(Utc::now().timestamp_millis()),
        });

        let mut index = self.index.write();
        index.streams.insert(record.id, record.clone());
        index
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(record.id);
        metrics::gauge!("sse_active_connections").set(index.streams.len() as f64);
        metrics::gauge!("sse_active_sessions").set(index.sessions.len() as f64);

        debug!(stream_id = %record.id, session_id, "registered subscriber stream");
        (record, receiver)
    }

    /// Drops a stream from both indices; the subscriber's channel closes
    /// when the last sender clone is gone.
    pub fn remove(&self, stream_id: Uuid) -> Option<Arc<StreamRecord>> {
        let mut index = self.index.write();
        let record = index.streams.remove(&stream_id)?;

        if let Some(members) = index.sessions.get_mut(&record.session_id) {
            members.remove(&stream_id);
            if members.is_empty() {
                index.sessions.remove(&record.session_id);
            }
        }
        metrics::gauge!("sse_active_connections").set(index.streams.len() as f64);
        metrics::gauge!("sse_active_sessions").set(index.sessions.len() as f64);

        debug!(stream_id = %stream_id, session_id = %record.session_id, "removed subscriber stream");
        Some(record)
    }

    /// Best-effort delivery to every stream of a session.
    pub fn send_to_session(&self, session_id: &str, frame: SseFrame) {
        let targets: Vec<Arc<StreamRecord>> = {
            let index = self.index.read();
            match index.sessions.get(session_id) {
                Some(members) => members
                    .iter()
                    .filter_map(|id| index.streams.get(id).cloned())
                    .collect(),
                None => return,
            }
        };

        let mut failed = Vec::new();
        for record in targets {
            if !self.deliver(&record, frame.clone()) {
                failed.push(record.id);
            }
        }
        for stream_id in failed {
            self.remove(stream_id);
        }
    }

    /// Delivery to one specific stream.
    pub fn send_to_stream(&self, stream_id: Uuid, frame: SseFrame) {
        let record = self.index.read().streams.get(&stream_id).cloned();
        if let Some(record) = record {
            if !self.deliver(&record, frame) {
                self.remove(stream_id);
            }
        }
    }

    /// Emits a `ping` event to every registered stream; streams that cannot
    /// accept it are torn down.
    pub fn broadcast_ping(&self) {
        let targets: Vec<Arc<StreamRecord>> =
            self.index.read().streams.values().cloned().collect();

        let frame = SseFrame::new("ping", json!({ "timestamp": Utc::now().timestamp() }));
        let mut failed = Vec::new();
        for record in targets {
            if !self.deliver(&record, frame.clone()) {
                failed.push(record.id);
            }
        }
        for stream_id in failed {
            self.remove(stream_id);
        }
    }

    fn deliver(&self, record: &StreamRecord, frame: SseFrame) -> bool {
        let event = frame.event;
        match record.sender.try_send(frame) {
            Ok(()) => {
                record
                    .last_sent
                    .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                metrics::counter!("sse_events_sent_total", "event" => event).increment(1);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    stream_id = %record.id,
                    session_id = %record.session_id,
                    event,
                    "subscriber stream lagging, scheduling teardown"
                );
                metrics::counter!("sse_events_dropped_total", "reason" => "full").increment(1);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::counter!("sse_events_dropped_total", "reason" => "closed").increment(1);
                false
            }
        }
    }

    pub fn has_streams(&self, session_id: &str) -> bool {
        self.index
            .read()
            .sessions
            .get(session_id)
            .is_some_and(|members| !members.is_empty())
    }

    pub fn connection_count(&self) -> usize {
        self.index.read().streams.len()
    }

    pub fn session_count(&self) -> usize {
        self.index.read().sessions.len()
    }

    /// Drops every stream; used during graceful drain so that subscriber
    /// bodies terminate promptly.
    pub fn close_all(&self) {
        let mut index = self.index.write();
        index.streams.clear();
        index.sessions.clear();
        metrics::gauge!("sse_active_connections").set(0.0);
        metrics::gauge!("sse_active_sessions").set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_reaches_every_stream_of_the_session() {
        let hub = StreamHub::new();
        let (_a, mut rx_a) = hub.add("s-1", "u-1", None, None);
        let (_b, mut rx_b) = hub.add("s-1", "u-2", None, None);
        let (_c, mut rx_c) = hub.add("s-2", "u-3", None, None);

        hub.send_to_session("s-1", SseFrame::new("chunk", json!({ "chunk_id": 0 })));

        assert_eq!(rx_a.recv().await.unwrap().event, "chunk");
        assert_eq!(rx_b.recv().await.unwrap().event, "chunk");
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_subscriber_is_removed_without_affecting_siblings() {
        let hub = StreamHub::new();
        let (record_a, rx_a) = hub.add("s-1", "u-1", None, None);
        let (_b, mut rx_b) = hub.add("s-1", "u-2", None, None);
        drop(rx_a);

        hub.send_to_session("s-1", SseFrame::new("chunk", json!({ "chunk_id": 0 })));

        assert_eq!(rx_b.recv().await.unwrap().event, "chunk");
        assert_eq!(hub.connection_count(), 1);
        assert!(hub.index.read().streams.get(&record_a.id).is_none());
    }

    #[tokio::test]
    async fn remove_clears_empty_session_entries() {
        let hub = StreamHub::new();
        let (record, _rx) = hub.add("s-1", "u-1", None, None);

        assert!(hub.has_streams("s-1"));
        assert_eq!(hub.session_count(), 1);

        hub.remove(record.id);
        assert!(!hub.has_streams("s-1"));
        assert_eq!(hub.session_count(), 0);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn ping_reaches_all_sessions() {
        let hub = StreamHub::new();
        let (_a, mut rx_a) = hub.add("s-1", "u-1", None, None);
        let (_b, mut rx_b) = hub.add("s-2", "u-2", None, None);

        hub.broadcast_ping();

        let ping = rx_a.recv().await.unwrap();
        assert_eq!(ping.event, "ping");
        assert!(ping.data["timestamp"].is_number());
        assert_eq!(rx_b.recv().await.unwrap().event, "ping");
    }

    #[tokio::test]
    async fn lagging_subscriber_is_torn_down() {
        let hub = StreamHub::new();
        let (_record, _rx) = hub.add("s-1", "u-1", None, None);

        for _ in 0..=STREAM_CHANNEL_CAPACITY {
            hub.send_to_session("s-1", SseFrame::new("chunk", json!({})));
        }

        // The send that found the queue full scheduled the stream's removal.
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn send_to_stream_updates_last_sent() {
        let hub = StreamHub::new();
        let (record, mut rx) = hub.add("s-1", "u-1", None, None);
        let before = record.last_sent();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        hub.send_to_stream(record.id, SseFrame::new("connected", json!({})));

        assert_eq!(rx.recv().await.unwrap().event, "connected");
        assert!(record.last_sent() >= before);
    }

    #[tokio::test]
    async fn close_all_terminates_receivers() {
        let hub = StreamHub::new();
        let (_a, mut rx) = hub.add("s-1", "u-1", None, None);

        hub.close_all();
        assert_eq!(hub.connection_count(), 0);
        assert!(rx.recv().await.is_none());
    }
}
