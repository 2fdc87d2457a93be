use super::error::Result;
use crate::types::session::{ListSessionsRequest, Session};
use async_trait::async_trait;
use std::sync::Arc;

/// Durable storage for session rows.
///
/// `update` has full-row upsert semantics. Callers keep writes field-scoped by
/// reading the current row first and changing only what they own.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: &Session) -> Result<()>;
    async fn get_by_id(&self, id: &str) -> Result<Option<Session>>;
    /// Returns the requested page and the total number of matching rows.
    async fn list(&self, req: &ListSessionsRequest) -> Result<(Vec<Session>, usize)>;
    async fn update(&self, session: &Session) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Protocol-level credentials for one session.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    fn session_id(&self) -> &str;
    async fn device_id(&self) -> Option<String>;
    async fn set_device_id(&self, device_id: Option<String>);

    async fn is_registered(&self) -> bool {
        self.device_id().await.is_some()
    }
}

#[async_trait]
pub trait DeviceStoreResolver: Send + Sync {
    /// Returns the device store for `session_id`, creating it on first use.
    /// `known_device_id` seeds a freshly created store with the identity the
    /// session row already records.
    async fn resolve(
        &self,
        session_id: &str,
        known_device_id: Option<&str>,
    ) -> Result<Arc<dyn DeviceStore>>;

    async fn forget(&self, session_id: &str) -> Result<()>;
}
