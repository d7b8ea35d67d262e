pub mod chat;
pub mod chunk;
pub mod connection;
pub mod message;
pub mod workflow;

pub use chat::{ChatRequest, ChatResponse};
pub use chunk::{ChunkType, ErrorInfo, ResponseChunk};
pub use connection::ActiveConnection;
pub use message::{BufferState, Message};
pub use workflow::WorkflowRequest;
