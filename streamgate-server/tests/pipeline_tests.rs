//! End-to-end tests for the fragment path: reorder buffers feeding the
//! stream hub through the ingest pipeline, with a capturing sink standing in
//! for durable storage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;

use streamgate_server::services::buffer::BufferManager;
use streamgate_server::services::ingest::IngestPipeline;
use streamgate_server::services::persistence::MessageSink;
use streamgate_server::services::stream_hub::{SseFrame, StreamHub};
use streamgate_shared::config::BufferConfig;
use streamgate_shared::models::{ChunkType, Message, ResponseChunk};

struct CapturingSink {
    tx: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl MessageSink for CapturingSink {
    async fn store(&self, message: &Message) -> Result<()> {
        self.tx.send(message.clone()).ok();
        Ok(())
    }
}

struct Harness {
    buffers: Arc<BufferManager>,
    streams: Arc<StreamHub>,
    pipeline: IngestPipeline,
    stored: mpsc::UnboundedReceiver<Message>,
}

fn harness() -> Harness {
    let buffers = Arc::new(BufferManager::new(BufferConfig {
        max_buffers: 64,
        max_chunks_per_buffer: 256,
        max_buffer_age: Duration::from_secs(300),
        cleanup_interval: Duration::from_secs(30),
        missing_chunk_timeout: Duration::from_secs(30),
    }));
    let streams = Arc::new(StreamHub::new());
    let (tx, stored) = mpsc::unbounded_channel();
    let pipeline = IngestPipeline::new(
        buffers.clone(),
        streams.clone(),
        Arc::new(CapturingSink { tx }),
    );
    Harness {
        buffers,
        streams,
        pipeline,
        stored,
    }
}

fn chunk(session: &str, message: &str, seq: u64, text: &str, is_final: bool) -> ResponseChunk {
    ResponseChunk {
        session_id: session.into(),
        message_id: message.into(),
        chunk_id: seq,
        chunk: text.into(),
        chunk_type: ChunkType::Content,
        is_final,
        metadata: is_final.then(|| HashMap::from([("tokens_used".into(), json!(9))])),
        error: None,
        timestamp: Utc::now(),
        correlation_id: "corr-1".into(),
    }
}

async fn next_frame(rx: &mut mpsc::Receiver<SseFrame>) -> SseFrame {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("frame within deadline")
        .expect("channel open")
}

/// Collects (event name, chunk_id if present) pairs until `message_complete`.
async fn drain_until_complete(rx: &mut mpsc::Receiver<SseFrame>) -> Vec<(String, Option<u64>)> {
    let mut seen = Vec::new();
    loop {
        let frame = next_frame(rx).await;
        let id = frame.data.get("chunk_id").and_then(|v| v.as_u64());
        let name = frame.event.to_string();
        let done = name == "message_complete";
        seen.push((name, id));
        if done {
            return seen;
        }
    }
}

#[tokio::test]
async fn in_order_fragments_stream_through_and_finalize() {
    let mut h = harness();
    let (_record, mut rx) = h.streams.add("s1", "u1", None, None);

    h.pipeline.handle_chunk(chunk("s1", "m1", 0, "a", false));
    h.pipeline.handle_chunk(chunk("s1", "m1", 1, "b", false));
    h.pipeline.handle_chunk(chunk("s1", "m1", 2, "c", true));

    let events = drain_until_complete(&mut rx).await;
    assert_eq!(
        events,
        vec![
            ("chunk".into(), Some(0)),
            ("chunk".into(), Some(1)),
            ("chunk".into(), Some(2)),
            ("message_complete".into(), None),
        ]
    );

    let message = h.stored.recv().await.unwrap();
    assert_eq!(message.content, "abc");
    assert_eq!(message.token_count, 9);
    assert_eq!(message.role, "assistant");
    assert!(h.buffers.is_empty());
}

#[tokio::test]
async fn permuted_arrival_is_reordered_before_emission() {
    let mut h = harness();
    let (_record, mut rx) = h.streams.add("s1", "u1", None, None);

    h.pipeline.handle_chunk(chunk("s1", "m1", 2, "c", true));
    h.pipeline.handle_chunk(chunk("s1", "m1", 0, "a", false));

    // Sequence 0 is emitted alone; 1 and 2 wait for the gap to close.
    let first = next_frame(&mut rx).await;
    assert_eq!(first.data["chunk_id"], json!(0));
    assert!(rx.try_recv().is_err());

    h.pipeline.handle_chunk(chunk("s1", "m1", 1, "b", false));

    let events = drain_until_complete(&mut rx).await;
    assert_eq!(
        events,
        vec![
            ("chunk".into(), Some(1)),
            ("chunk".into(), Some(2)),
            ("message_complete".into(), None),
        ]
    );
    assert_eq!(h.stored.recv().await.unwrap().content, "abc");
}

#[tokio::test(start_paused = true)]
async fn missing_middle_fragment_evicts_without_completion() {
    let mut h = harness();
    let baseline = h.buffers.len();
    let (_record, mut rx) = h.streams.add("s1", "u1", None, None);

    h.pipeline.handle_chunk(chunk("s1", "m1", 0, "a", false));
    h.pipeline.handle_chunk(chunk("s1", "m1", 2, "c", true));

    let first = next_frame(&mut rx).await;
    assert_eq!(first.data["chunk_id"], json!(0));

    tokio::time::advance(Duration::from_secs(31)).await;
    let evicted = h.buffers.sweep();
    assert_eq!(evicted.len(), 1);
    assert_eq!(h.buffers.len(), baseline);

    // Neither the held fragment nor a completion event ever surfaces.
    assert!(rx.try_recv().is_err());
    assert!(h.stored.try_recv().is_err());
}

#[tokio::test]
async fn duplicate_fragments_reach_the_client_once() {
    let mut h = harness();
    let (_record, mut rx) = h.streams.add("s1", "u1", None, None);

    h.pipeline.handle_chunk(chunk("s1", "m1", 0, "a", false));
    h.pipeline.handle_chunk(chunk("s1", "m1", 0, "a", false));
    h.pipeline.handle_chunk(chunk("s1", "m1", 0, "a", false));
    h.pipeline.handle_chunk(chunk("s1", "m1", 1, "b", false));
    h.pipeline.handle_chunk(chunk("s1", "m1", 2, "c", true));

    let events = drain_until_complete(&mut rx).await;
    let zero_events = events
        .iter()
        .filter(|(name, id)| name == "chunk" && *id == Some(0))
        .count();
    assert_eq!(zero_events, 1);

    assert_eq!(h.stored.recv().await.unwrap().content, "abc");
}

#[tokio::test]
async fn sibling_subscribers_see_identical_sequences() {
    let mut h = harness();
    let (record_a, mut rx_a) = h.streams.add("s1", "u1", None, None);
    let (_record_b, mut rx_b) = h.streams.add("s1", "u2", None, None);

    h.pipeline.handle_chunk(chunk("s1", "m1", 0, "a", false));

    let a0 = next_frame(&mut rx_a).await;
    let b0 = next_frame(&mut rx_b).await;
    assert_eq!(a0.data, b0.data);

    // One subscriber leaves mid-stream; the other is unaffected.
    drop(rx_a);
    h.streams.remove(record_a.id);

    h.pipeline.handle_chunk(chunk("s1", "m1", 1, "b", false));
    h.pipeline.handle_chunk(chunk("s1", "m1", 2, "c", true));

    let events = drain_until_complete(&mut rx_b).await;
    assert_eq!(
        events,
        vec![
            ("chunk".into(), Some(1)),
            ("chunk".into(), Some(2)),
            ("message_complete".into(), None),
        ]
    );
    assert_eq!(h.stored.recv().await.unwrap().content, "abc");
}

#[tokio::test]
async fn broadcast_fragments_only_ingest_for_local_sessions() {
    let h = harness();
    let (_record, _rx) = h.streams.add("s-local", "u1", None, None);

    h.pipeline
        .handle_broadcast(chunk("s-foreign", "m1", 0, "x", false));
    assert!(h.buffers.is_empty());

    h.pipeline
        .handle_broadcast(chunk("s-local", "m2", 0, "y", false));
    assert_eq!(h.buffers.len(), 1);
}

#[tokio::test]
async fn fragments_for_sessions_without_subscribers_still_buffer_on_direct_subject() {
    let h = harness();

    // Direct-subject fragments are buffered even before a subscriber
    // arrives; the reply is not lost if the client reconnects elsewhere.
    h.pipeline.handle_chunk(chunk("s1", "m1", 0, "a", false));
    assert_eq!(h.buffers.len(), 1);
    assert_eq!(
        h.buffers.state("m1").unwrap().total_sent,
        1,
        "fragments drain even with no live stream"
    );
}
