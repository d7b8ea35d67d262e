use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

use streamgate_shared::config::BufferConfig;
use streamgate_shared::models::{BufferState, ChunkType, Message, ResponseChunk};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("buffer limit reached: {max} buffers")]
    CapacityExhausted { max: usize },
    #[error("chunk limit reached for message {message_id}: {max} chunks")]
    ChunkCapacity { message_id: String, max: usize },
}

impl IngestError {
    /// Stable label used on drop counters.
    pub fn reason(&self) -> &'static str {
        match self {
            IngestError::CapacityExhausted { .. } => "capacity_exhausted",
            IngestError::ChunkCapacity { .. } => "chunk_capacity",
        }
    }
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("no buffer for message {0}")]
    NotFound(String),
    #[error("message {0} has not seen its final fragment")]
    NotFinal(String),
    #[error("message {message_id} is missing chunk {seq}")]
    MissingChunk { message_id: String, seq: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// Final fragment seen but gaps remained past the grace period.
    Lossy,
    /// Never saw a final fragment and went idle past the age bound.
    Stuck,
    /// Final fragment seen but the buffer was never finalized out; normally
    /// unreachable because finalize removes the buffer immediately.
    Finalized,
}

impl EvictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictReason::Lossy => "lossy",
            EvictReason::Stuck => "stuck",
            EvictReason::Finalized => "finalized",
        }
    }
}

/// Record of one sweeper eviction, for logging.
#[derive(Debug)]
pub struct Evicted {
    pub message_id: String,
    pub session_id: String,
    pub reason: EvictReason,
    pub received: u64,
    pub emitted: u64,
}

struct Slots {
    /// Sparse sequence -> fragment map; entries below `next_to_emit` are
    /// removed as they are drained.
    chunks: HashMap<u64, ResponseChunk>,
    max_seen: u64,
    next_to_emit: u64,
    final_seen: bool,
    final_seq: u64,
    final_metadata: Option<HashMap<String, Value>>,
    /// Content-typed payloads already drained, in emission order.
    emitted_content: String,
    updated_at: Instant,
}

struct ChunkBuffer {
    session_id: String,
    message_id: String,
    slots: Mutex<Slots>,
}

impl ChunkBuffer {
    fn new(session_id: String, message_id: String) -> Self {
        Self {
            session_id,
            message_id,
            slots: Mutex::new(Slots {
                chunks: HashMap::new(),
                max_seen: 0,
                next_to_emit: 0,
                final_seen: false,
                final_seq: 0,
                final_metadata: None,
                emitted_content: String::new(),
                updated_at: Instant::now(),
            }),
        }
    }
}

/// Per-instance reorder state for all in-flight messages.
///
/// Lock order is always manager map first, then buffer slots; operations
/// that touch a single buffer drop the map lock before taking the slot lock.
pub struct BufferManager {
    buffers: RwLock<HashMap<String, Arc<ChunkBuffer>>>,
    config: BufferConfig,
}

impl BufferManager {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Admits one fragment.
    ///
    /// Duplicates with identical payload are absorbed silently; a duplicate
    /// with a differing payload keeps the first copy and logs the anomaly.
    pub fn ingest(&self, chunk: ResponseChunk) -> Result<(), IngestError> {
        let buffer = self.buffers.read().get(&chunk.message_id).cloned();
        let buffer = match buffer {
            Some(buffer) => buffer,
            None => {
                let mut buffers = self.buffers.write();
                if !buffers.contains_key(&chunk.message_id)
                    && buffers.len() >= self.config.max_buffers
                {
                    return Err(IngestError::CapacityExhausted {
                        max: self.config.max_buffers,
                    });
                }
                let buffer = buffers
                    .entry(chunk.message_id.clone())
                    .or_insert_with(|| {
                        Arc::new(ChunkBuffer::new(
                            chunk.session_id.clone(),
                            chunk.message_id.clone(),
                        ))
                    })
                    .clone();
                metrics::gauge!("reorder_buffers_active").set(buffers.len() as f64);
                buffer
            }
        };

        let mut slots = buffer.slots.lock();

        if chunk.chunk_id < slots.next_to_emit {
            // Late copy of a fragment that was already emitted and released.
            return Ok(());
        }
        if slots.chunks.len() >= self.config.max_chunks_per_buffer {
            return Err(IngestError::ChunkCapacity {
                message_id: buffer.message_id.clone(),
                max: self.config.max_chunks_per_buffer,
            });
        }
        if let Some(existing) = slots.chunks.get(&chunk.chunk_id) {
            if existing.chunk != chunk.chunk {
                warn!(
                    message_id = %buffer.message_id,
                    chunk_id = chunk.chunk_id,
                    "duplicate fragment with differing payload, keeping the first"
                );
            }
            return Ok(());
        }

        slots.max_seen = slots.max_seen.max(chunk.chunk_id);
        slots.updated_at = Instant::now();
        if chunk.is_final {
            slots.final_seen = true;
            slots.final_seq = chunk.chunk_id;
            slots.final_metadata = chunk.metadata.clone();
        }
        slots.chunks.insert(chunk.chunk_id, chunk);
        Ok(())
    }

    /// Removes and returns the contiguous run of fragments starting at
    /// `next_to_emit`, stopping at the first gap or after the terminal
    /// fragment. The second value is true once the whole message has been
    /// emitted.
    pub fn drain(&self, message_id: &str) -> (Vec<ResponseChunk>, bool) {
        let buffer = self.buffers.read().get(message_id).cloned();
        let Some(buffer) = buffer else {
            return (Vec::new(), false);
        };

        let mut slots = buffer.slots.lock();
        let mut ready = Vec::new();
        loop {
            let seq = slots.next_to_emit;
            let Some(chunk) = slots.chunks.remove(&seq) else {
                break;
            };
            slots.next_to_emit = seq + 1;
            if chunk.chunk_type == ChunkType::Content {
                slots.emitted_content.push_str(&chunk.chunk);
            }
            let terminal = chunk.is_final;
            ready.push(chunk);
            if terminal {
                break;
            }
        }

        debug_assert!(slots.next_to_emit <= slots.max_seen + 1);
        let complete = slots.final_seen && slots.next_to_emit > slots.final_seq;
        (ready, complete)
    }

    /// Removes the buffer and assembles the finalized message.
    ///
    /// Requires the terminal fragment and dense coverage of `[0, final_seq]`;
    /// on failure the buffer is discarded either way.
    pub fn finalize(&self, message_id: &str) -> Result<Message, FinalizeError> {
        let buffer = {
            let mut buffers = self.buffers.write();
            let removed = buffers.remove(message_id);
            metrics::gauge!("reorder_buffers_active").set(buffers.len() as f64);
            removed
        }
        .ok_or_else(|| FinalizeError::NotFound(message_id.to_string()))?;

        let mut slots = buffer.slots.lock();
        if !slots.final_seen {
            return Err(FinalizeError::NotFinal(message_id.to_string()));
        }

        // The prefix below next_to_emit is dense by construction; only the
        // undrained tail still needs checking.
        let mut content = std::mem::take(&mut slots.emitted_content);
        for seq in slots.next_to_emit..=slots.final_seq {
            let Some(chunk) = slots.chunks.get(&seq) else {
                return Err(FinalizeError::MissingChunk {
                    message_id: message_id.to_string(),
                    seq,
                });
            };
            if chunk.chunk_type == ChunkType::Content {
                content.push_str(&chunk.chunk);
            }
        }

        let metadata = slots.final_metadata.take();
        let token_count = metadata
            .as_ref()
            .and_then(|meta| meta.get("tokens_used"))
            .and_then(Value::as_f64)
            .map(|tokens| tokens as u32)
            .unwrap_or(0);

        Ok(Message {
            message_id: buffer.message_id.clone(),
            session_id: buffer.session_id.clone(),
            role: "assistant".into(),
            content,
            token_count,
            metadata,
            created_at: Utc::now(),
        })
    }

    /// Observability snapshot of one buffer.
    pub fn state(&self, message_id: &str) -> Option<BufferState> {
        let buffer = self.buffers.read().get(message_id).cloned()?;
        let slots = buffer.slots.lock();

        let mut missing = Vec::new();
        if slots.final_seen {
            for seq in slots.next_to_emit..=slots.final_seq {
                if !slots.chunks.contains_key(&seq) {
                    missing.push(seq);
                }
            }
        }

        Some(BufferState {
            total_expected: slots.final_seen.then(|| slots.final_seq + 1),
            total_received: slots.next_to_emit + slots.chunks.len() as u64,
            total_sent: slots.next_to_emit,
            is_complete: slots.final_seen && missing.is_empty(),
            missing_chunks: missing,
        })
    }

    pub fn len(&self) -> usize {
        self.buffers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.read().is_empty()
    }

    /// One sweeper pass: evicts lossy, stuck and leftover-finalized buffers.
    pub fn sweep(&self) -> Vec<Evicted> {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> Vec<Evicted> {
        let candidates: Vec<Arc<ChunkBuffer>> = self.buffers.read().values().cloned().collect();

        let mut evicted = Vec::new();
        for buffer in candidates {
            let verdict = {
                let slots = buffer.slots.lock();
                let age = now.saturating_duration_since(slots.updated_at);
                let has_gaps = slots.final_seen
                    && (slots.next_to_emit..=slots.final_seq)
                        .any(|seq| !slots.chunks.contains_key(&seq));

                let reason = if slots.final_seen
                    && has_gaps
                    && age >= self.config.missing_chunk_timeout
                {
                    Some(EvictReason::Lossy)
                } else if !slots.final_seen && age >= self.config.max_buffer_age {
                    Some(EvictReason::Stuck)
                } else if slots.final_seen && age >= self.config.max_buffer_age {
                    Some(EvictReason::Finalized)
                } else {
                    None
                };

                reason.map(|reason| Evicted {
                    message_id: buffer.message_id.clone(),
                    session_id: buffer.session_id.clone(),
                    reason,
                    received: slots.next_to_emit + slots.chunks.len() as u64,
                    emitted: slots.next_to_emit,
                })
            };

            if let Some(record) = verdict {
                let mut buffers = self.buffers.write();
                // finalize may have raced us; only report buffers we removed.
                if buffers.remove(&record.message_id).is_some() {
                    metrics::gauge!("reorder_buffers_active").set(buffers.len() as f64);
                    metrics::counter!(
                        "reorder_buffers_evicted_total",
                        "reason" => record.reason.as_str()
                    )
                    .increment(1);
                    evicted.push(record);
                }
            }
        }

        evicted
    }
}
