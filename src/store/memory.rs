use async_trait::async_trait;
use gatecore::store::SessionRepository;
use gatecore::store::error::{Result, StoreError};
use gatecore::{ListSessionsRequest, Session};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Session rows kept in process memory.
#[derive(Default)]
pub struct MemorySessionRepository {
    rows: RwLock<HashMap<String, Session>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn create(&self, session: &Session) -> Result<()> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists(session.id.clone()));
        }
        rows.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn list(&self, req: &ListSessionsRequest) -> Result<(Vec<Session>, usize)> {
        let rows = self.rows.read().await;
        let mut matching: Vec<&Session> = rows
            .values()
            .filter(|s| req.status.is_none_or(|status| s.status == status))
            .collect();
        // newest first, id breaks ties so paging is stable
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let total = matching.len();
        let limit = if req.limit == 0 { total } else { req.limit };
        let page = matching
            .into_iter()
            .skip(req.offset)
            .take(limit)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn update(&self, session: &Session) -> Result<()> {
        self.rows
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match self.rows.write().await.remove(id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }
}
