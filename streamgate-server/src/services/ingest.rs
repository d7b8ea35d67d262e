use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};

use streamgate_shared::models::ResponseChunk;

use crate::services::buffer::BufferManager;
use crate::services::persistence::MessageSink;
use crate::services::stream_hub::{SseFrame, StreamHub};

/// Drives every fragment received from the bus through reorder, fan-out and
/// finalization.
pub struct IngestPipeline {
    buffers: Arc<BufferManager>,
    streams: Arc<StreamHub>,
    sink: Arc<dyn MessageSink>,
}

impl IngestPipeline {
    pub fn new(
        buffers: Arc<BufferManager>,
        streams: Arc<StreamHub>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            buffers,
            streams,
            sink,
        }
    }

    /// Fragments from the broadcast subject: every instance sees them, so
    /// only ingest when this instance actually streams the session.
    pub fn handle_broadcast(&self, chunk: ResponseChunk) {
        if !self.streams.has_streams(&chunk.session_id) {
            debug!(
                session_id = %chunk.session_id,
                message_id = %chunk.message_id,
                "ignoring broadcast fragment for foreign session"
            );
            return;
        }
        self.handle_chunk(chunk);
    }

    /// Fragments addressed to this instance.
    pub fn handle_chunk(&self, chunk: ResponseChunk) {
        let session_id = chunk.session_id.clone();
        let message_id = chunk.message_id.clone();

        if let Err(err) = self.buffers.ingest(chunk) {
            warn!(
                session_id,
                message_id,
                error = %err,
                "dropping fragment"
            );
            metrics::counter!("chunks_dropped_total", "reason" => err.reason()).increment(1);
            return;
        }
        metrics::counter!("chunks_ingested_total").increment(1);

        let (ready, complete) = self.buffers.drain(&message_id);
        for fragment in ready {
            match serde_json::to_value(&fragment) {
                Ok(payload) => {
                    self.streams
                        .send_to_session(&session_id, SseFrame::new("chunk", payload));
                }
                Err(err) => {
                    error!(
                        message_id,
                        chunk_id = fragment.chunk_id,
                        error = %err,
                        "failed to encode fragment for fan-out"
                    );
                }
            }
        }

        if complete {
            self.complete_message(&session_id, &message_id);
        }
    }

    fn complete_message(&self, session_id: &str, message_id: &str) {
        let message = match self.buffers.finalize(message_id) {
            Ok(message) => message,
            Err(err) => {
                warn!(message_id, error = %err, "failed to finalize message");
                return;
            }
        };

        info!(
            message_id,
            session_id,
            chars = message.content.len(),
            tokens = message.token_count,
            "message complete"
        );

        // Storage is off the fragment hot path; the sink owns its retries
        // and the completion event below does not wait for it.
        let sink = self.sink.clone();
        let stored = message.clone();
        tokio::spawn(async move {
            if let Err(err) = sink.store(&stored).await {
                error!(
                    message_id = %stored.message_id,
                    error = %err,
                    "persistence sink gave up on finalized message"
                );
            }
        });

        self.streams.send_to_session(
            session_id,
            SseFrame::new(
                "message_complete",
                json!({
                    "message_id": message.message_id,
                    "token_count": message.token_count,
                }),
            ),
        );
    }
}
