use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use streamgate_shared::config::Config;
use streamgate_shared::models::{ActiveConnection, WorkflowRequest};

use crate::app_state::AppState;
use crate::services::buffer::BufferManager;
use crate::services::bus::WorkflowBus;
use crate::services::directory::SessionDirectory;
use crate::services::stream_hub::StreamHub;

pub(crate) struct FakeBus {
    pub connected: bool,
    pub fail_publish: bool,
    pub published: Mutex<Vec<WorkflowRequest>>,
}

impl FakeBus {
    pub fn healthy() -> Self {
        Self {
            connected: true,
            fail_publish: false,
            published: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl WorkflowBus for FakeBus {
    async fn publish_workflow(&self, request: &WorkflowRequest) -> Result<()> {
        if self.fail_publish {
            return Err(anyhow!("broker rejected publish"));
        }
        self.published.lock().push(request.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

pub(crate) struct FakeDirectory {
    pub registered: Mutex<Vec<ActiveConnection>>,
    pub deregistered: Mutex<Vec<String>>,
    pub heartbeats: Mutex<Vec<String>>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self {
            registered: Mutex::new(Vec::new()),
            deregistered: Mutex::new(Vec::new()),
            heartbeats: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SessionDirectory for FakeDirectory {
    async fn register(&self, conn: &ActiveConnection) -> Result<()> {
        self.registered.lock().push(conn.clone());
        Ok(())
    }

    async fn deregister(&self, conn: &ActiveConnection) -> Result<()> {
        self.deregistered.lock().push(conn.connection_id.clone());
        Ok(())
    }

    async fn heartbeat(&self, conn: &ActiveConnection) -> Result<()> {
        self.heartbeats.lock().push(conn.connection_id.clone());
        Ok(())
    }

    async fn active_instances(&self, _session_id: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn streams_of(&self, _pod_id: &str) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    async fn cache_session_meta(
        &self,
        _session_id: &str,
        _meta: &HashMap<String, String>,
    ) -> Result<()> {
        Ok(())
    }

    async fn session_meta(&self, _session_id: &str) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

pub(crate) fn test_state(bus: Arc<FakeBus>) -> Arc<AppState> {
    test_state_with(bus, Arc::new(FakeDirectory::new()))
}

pub(crate) fn test_state_with(
    bus: Arc<FakeBus>,
    directory: Arc<FakeDirectory>,
) -> Arc<AppState> {
    let config = Arc::new(Config::from_env().unwrap());
    Arc::new(AppState {
        pod_id: config.server.pod_id.clone(),
        config: config.clone(),
        bus,
        directory,
        streams: Arc::new(StreamHub::new()),
        buffers: Arc::new(BufferManager::new(config.buffer.clone())),
    })
}
