use std::sync::Arc;

use streamgate_shared::config::Config;

use crate::services::buffer::BufferManager;
use crate::services::bus::WorkflowBus;
use crate::services::directory::SessionDirectory;
use crate::services::stream_hub::StreamHub;

/// Shared state handed to every handler; constructed once at startup and
/// never recreated.
pub struct AppState {
    pub config: Arc<Config>,
    pub pod_id: String,
    pub bus: Arc<dyn WorkflowBus>,
    pub directory: Arc<dyn SessionDirectory>,
    pub streams: Arc<StreamHub>,
    pub buffers: Arc<BufferManager>,
}
