use crate::error::PersistenceError;
use chrono::{DateTime, Utc};
use gatecore::store::SessionRepository;
use gatecore::store::error::StoreError;
use gatecore::{ProxyConfig, Session, SessionStatus};
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// Field-scoped, timeout-bounded writes to session rows.
///
/// Each update reads the current row, changes only the fields it owns and
/// writes the row back. Concurrent updaters race at row granularity and the
/// last write wins.
#[derive(Clone)]
pub struct SessionPersistence {
    repo: Arc<dyn SessionRepository>,
    timeout: Duration,
}

impl SessionPersistence {
    pub fn new(repo: Arc<dyn SessionRepository>, timeout: Duration) -> Self {
        Self { repo, timeout }
    }

    pub async fn load(&self, id: &str) -> Result<Option<Session>, PersistenceError> {
        match tokio::time::timeout(self.timeout, self.repo.get_by_id(id)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(PersistenceError::Timeout(self.timeout)),
        }
    }

    async fn modify<F>(&self, id: &str, field: &'static str, apply: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&mut Session) + Send,
    {
        let write = async {
            let mut row = self
                .repo
                .get_by_id(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            apply(&mut row);
            row.touch();
            self.repo.update(&row).await
        };

        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(())) => {
                debug!(target: "Gateway/Persistence", "Updated {field} for session {id}");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(PersistenceError::Timeout(self.timeout)),
        }
    }

    pub async fn set_status(&self, id: &str, status: SessionStatus) -> Result<(), PersistenceError> {
        self.modify(id, "status", |row| row.status = status).await
    }

    pub async fn set_qr_code(
        &self,
        id: &str,
        code: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), PersistenceError> {
        self.modify(id, "qr_code", |row| {
            row.qr_code = code;
            row.qr_code_expires_at = expires_at;
        })
        .await
    }

    pub async fn set_device_jid(
        &self,
        id: &str,
        device_jid: Option<String>,
    ) -> Result<(), PersistenceError> {
        self.modify(id, "device_jid", |row| row.device_jid = device_jid)
            .await
    }

    pub async fn touch_last_seen(&self, id: &str, at: DateTime<Utc>) -> Result<(), PersistenceError> {
        self.modify(id, "last_seen", |row| row.last_seen = Some(at)).await
    }

    pub async fn set_proxy(
        &self,
        id: &str,
        proxy: Option<ProxyConfig>,
    ) -> Result<(), PersistenceError> {
        self.modify(id, "proxy_config", |row| row.proxy_config = proxy)
            .await
    }

    pub async fn set_connection_error(
        &self,
        id: &str,
        error: Option<String>,
    ) -> Result<(), PersistenceError> {
        self.modify(id, "connection_error", |row| row.connection_error = error)
            .await
    }
}
