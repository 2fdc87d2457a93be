use async_trait::async_trait;
use gatecore::store::error::Result;
use gatecore::store::{DeviceStore, DeviceStoreResolver};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct MemoryDeviceStore {
    session_id: String,
    device_id: RwLock<Option<String>>,
}

impl MemoryDeviceStore {
    pub fn new(session_id: impl Into<String>, device_id: Option<String>) -> Self {
        Self {
            session_id: session_id.into(),
            device_id: RwLock::new(device_id),
        }
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn device_id(&self) -> Option<String> {
        self.device_id.read().await.clone()
    }

    async fn set_device_id(&self, device_id: Option<String>) {
        *self.device_id.write().await = device_id;
    }
}

/// Hands out one device store per session, creating it on first use.
#[derive(Default)]
pub struct MemoryDeviceStoreResolver {
    stores: RwLock<HashMap<String, Arc<MemoryDeviceStore>>>,
}

impl MemoryDeviceStoreResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.stores.read().await.contains_key(session_id)
    }
}

#[async_trait]
impl DeviceStoreResolver for MemoryDeviceStoreResolver {
    async fn resolve(
        &self,
        session_id: &str,
        known_device_id: Option<&str>,
    ) -> Result<Arc<dyn DeviceStore>> {
        {
            let stores = self.stores.read().await;
            if let Some(store) = stores.get(session_id) {
                return Ok(store.clone());
            }
        }

        let mut stores = self.stores.write().await;
        // another caller may have created it between the two locks
        let store = stores
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!(target: "Gateway/Store", "Creating device store for session {session_id}");
                Arc::new(MemoryDeviceStore::new(
                    session_id,
                    known_device_id.map(str::to_string),
                ))
            })
            .clone();
        Ok(store)
    }

    async fn forget(&self, session_id: &str) -> Result<()> {
        if self.stores.write().await.remove(session_id).is_some() {
            debug!(target: "Gateway/Store", "Dropped device store for session {session_id}");
        }
        Ok(())
    }
}
