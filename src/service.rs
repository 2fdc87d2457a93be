use crate::client::ClientFactory;
use crate::config::GatewayConfig;
use crate::connection::SessionConnection;
use crate::error::{GatewayError, Result};
use crate::manager::SessionManager;
use futures_util::future::join_all;
use gatecore::store::error::StoreError;
use gatecore::store::{DeviceStoreResolver, SessionRepository};
use gatecore::{
    DeviceInfo, ListSessionsRequest, ProxyConfig, QrCodeResponse, Session, SessionStats,
    SessionStatus,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

const MAX_NAME_LEN: usize = 100;
const MAX_LIST_LIMIT: usize = 100;
const MIN_PHONE_DIGITS: usize = 7;
const MAX_PHONE_DIGITS: usize = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(flatten)]
    pub session: Session,
    pub device_info: Option<DeviceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<Session>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub normalized: usize,
    pub reconnected: usize,
    pub failed: usize,
}

/// Session operations as the HTTP layer sees them: the stored rows and the
/// live registry kept in step.
pub struct SessionService {
    repository: Arc<dyn SessionRepository>,
    manager: Arc<SessionManager>,
}

impl SessionService {
    pub fn new(
        config: GatewayConfig,
        repository: Arc<dyn SessionRepository>,
        resolver: Arc<dyn DeviceStoreResolver>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let manager = Arc::new(SessionManager::new(
            config,
            repository.clone(),
            resolver,
            factory,
        ));
        Self {
            repository,
            manager,
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    fn config(&self) -> &GatewayConfig {
        self.manager.config()
    }

    async fn store<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config().persistence_timeout, fut).await {
            Ok(res) => res.map_err(Into::into),
            Err(_) => Err(GatewayError::Timeout(op.to_string())),
        }
    }

    async fn row(&self, id: &str) -> Result<Session> {
        self.store("load session", self.repository.get_by_id(id))
            .await?
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    /// The live handle of an existing session; `InvalidState` when the
    /// session exists but has never been started.
    async fn live(&self, id: &str) -> Result<Arc<SessionConnection>> {
        self.row(id).await?;
        self.manager.get(id).map_err(|_| {
            GatewayError::InvalidState(format!("session {id} has no active connection"))
        })
    }

    pub async fn create_session(&self, req: CreateSessionRequest) -> Result<Session> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(GatewayError::InvalidInput("session name is required".into()));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(GatewayError::InvalidInput(format!(
                "session name must be at most {MAX_NAME_LEN} characters"
            )));
        }
        if let Some(proxy) = &req.proxy {
            proxy
                .validate()
                .map_err(|e| GatewayError::InvalidInput(e.to_string()))?;
        }

        let mut session = Session::new(name);
        session.proxy_config = req.proxy.clone();
        self.store("create session", self.repository.create(&session))
            .await?;

        if let Err(e) = self.manager.create(&session.id, req.proxy.as_ref()).await {
            warn!(target: "Gateway/Service", "Session {}: registration failed, rolling back: {e}", session.id);
            if let Err(rollback) = self.repository.delete(&session.id).await {
                warn!(target: "Gateway/Service", "Session {}: rollback failed: {rollback}", session.id);
            }
            return Err(e);
        }

        info!(target: "Gateway/Service", "Created session {} ({})", session.id, session.name);
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<SessionInfo> {
        let mut session = self.row(id).await?;
        let mut device_info = None;
        if let Ok(conn) = self.manager.get(id) {
            session.status = conn.status();
            if conn.is_connected() {
                device_info = conn.device_info();
            }
        }
        Ok(SessionInfo {
            session,
            device_info,
        })
    }

    pub async fn list_sessions(&self, mut req: ListSessionsRequest) -> Result<SessionList> {
        if req.limit == 0 {
            req.limit = self.config().default_list_limit;
        }
        req.limit = req.limit.min(MAX_LIST_LIMIT);
        let (sessions, total) = self
            .store("list sessions", self.repository.list(&req))
            .await?;
        Ok(SessionList {
            sessions,
            total,
            limit: req.limit,
            offset: req.offset,
        })
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        self.row(id).await?;
        self.manager.remove(id).await;
        self.store("delete session", self.repository.delete(id))
            .await?;
        if let Err(e) = self.manager.resolver().forget(id).await {
            warn!(target: "Gateway/Service", "Session {id}: failed to drop device store: {e}");
        }
        info!(target: "Gateway/Service", "Deleted session {id}");
        Ok(())
    }

    pub async fn connect_session(&self, id: &str) -> Result<()> {
        let row = self.row(id).await?;
        if !row.can_connect() && self.manager.is_connected(id) {
            return Err(GatewayError::InvalidState(format!(
                "session {id} is already connected"
            )));
        }

        self.manager.get_or_restore(id).await?;
        let cfg = self.config();
        let result = self
            .manager
            .connect_with_retry(id, cfg.connect_max_retries, cfg.connect_retry_interval)
            .await;

        let recorded = match &result {
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        };
        if let Err(e) = self
            .manager
            .persistence()
            .set_connection_error(id, recorded)
            .await
        {
            warn!(target: "Gateway/Service", "Session {id}: failed to record connection result: {e}");
        }
        result
    }

    pub async fn disconnect_session(&self, id: &str) -> Result<()> {
        self.row(id).await?;
        if self.manager.contains(id) {
            self.manager.disconnect(id).await
        } else {
            self.manager
                .persistence()
                .set_status(id, SessionStatus::Disconnected)
                .await?;
            Ok(())
        }
    }

    pub async fn logout_session(&self, id: &str) -> Result<()> {
        let mut row = self.row(id).await?;
        if let Ok(conn) = self.manager.get(id) {
            row.status = conn.status();
        }
        if !row.can_logout() {
            return Err(GatewayError::InvalidState(format!(
                "session {id} is not connected"
            )));
        }
        self.manager.get_or_restore(id).await?;
        self.manager.logout(id).await
    }

    pub async fn get_qr_code(&self, id: &str) -> Result<QrCodeResponse> {
        self.live(id).await?.qr_code()
    }

    pub async fn pair_phone(&self, id: &str, phone: &str) -> Result<String> {
        let digits = normalize_phone(phone)?;
        self.live(id).await?.pair_phone(&digits).await
    }

    pub async fn is_connected(&self, id: &str) -> Result<bool> {
        self.row(id).await?;
        Ok(self.manager.is_connected(id))
    }

    pub async fn get_device_info(&self, id: &str) -> Result<DeviceInfo> {
        let row = self.row(id).await?;
        if let Some(info) = self.manager.get(id).ok().and_then(|c| c.device_info()) {
            return Ok(info);
        }
        row.device_jid
            .map(|device_jid| DeviceInfo {
                device_jid,
                platform: None,
                business_name: None,
                paired_at: None,
                connected: false,
            })
            .ok_or_else(|| GatewayError::InvalidState(format!("session {id} is not paired")))
    }

    pub async fn set_proxy(&self, id: &str, proxy: Option<ProxyConfig>) -> Result<()> {
        self.row(id).await?;
        if let Some(p) = &proxy {
            p.validate()
                .map_err(|e| GatewayError::InvalidInput(e.to_string()))?;
        }
        match self.manager.get(id) {
            Ok(conn) => conn.set_proxy(proxy).await,
            Err(_) => {
                self.manager.persistence().set_proxy(id, proxy).await?;
                Ok(())
            }
        }
    }

    pub async fn get_proxy(&self, id: &str) -> Result<Option<ProxyConfig>> {
        let row = self.row(id).await?;
        match self.manager.get(id) {
            Ok(conn) => Ok(conn.proxy().or(row.proxy_config)),
            Err(_) => Ok(row.proxy_config),
        }
    }

    pub async fn get_session_stats(&self, id: &str) -> Result<SessionStats> {
        self.row(id).await?;
        Ok(self
            .manager
            .get(id)
            .map(|conn| conn.stats())
            .unwrap_or_default())
    }

    /// Run once at startup. No live handle exists yet, so rows that claim to
    /// be connecting or connected are reset; paired sessions are then
    /// reconnected if the configuration asks for it.
    pub async fn restore_sessions(&self) -> Result<RestoreReport> {
        let all = ListSessionsRequest::default();
        let (rows, _) = self
            .store("list sessions", self.repository.list(&all))
            .await?;
        let mut report = RestoreReport::default();

        for row in rows.iter().filter(|r| r.status.is_active()) {
            match self
                .manager
                .persistence()
                .set_status(&row.id, SessionStatus::Disconnected)
                .await
            {
                Ok(()) => report.normalized += 1,
                Err(e) => warn!(target: "Gateway/Service", "Session {}: failed to reset status: {e}", row.id),
            }
        }

        if !self.config().restore_on_start {
            return Ok(report);
        }

        let cfg = self.config();
        let attempts = rows.iter().filter(|r| r.is_registered()).map(|row| {
            let manager = self.manager.clone();
            let id = row.id.clone();
            let (retries, interval) = (cfg.connect_max_retries, cfg.connect_retry_interval);
            async move {
                manager.get_or_restore(&id).await?;
                manager.connect_with_retry(&id, retries, interval).await?;
                Ok::<_, GatewayError>(id)
            }
        });
        for (row, outcome) in rows
            .iter()
            .filter(|r| r.is_registered())
            .zip(join_all(attempts).await)
        {
            match outcome {
                Ok(id) => {
                    info!(target: "Gateway/Service", "Restored session {id}");
                    report.reconnected += 1;
                }
                Err(e) => {
                    warn!(target: "Gateway/Service", "Session {}: restore failed: {e}", row.id);
                    if let Err(e) = self
                        .manager
                        .persistence()
                        .set_connection_error(&row.id, Some(e.to_string()))
                        .await
                    {
                        warn!(target: "Gateway/Service", "Session {}: failed to record restore error: {e}", row.id);
                    }
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

/// Strips formatting from a phone number and checks it can be dialled
/// internationally.
pub fn normalize_phone(phone: &str) -> Result<String> {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(GatewayError::InvalidInput("phone number is required".into()));
    }
    if digits.len() < MIN_PHONE_DIGITS || digits.len() > MAX_PHONE_DIGITS {
        return Err(GatewayError::InvalidInput(format!(
            "phone number must have between {MIN_PHONE_DIGITS} and {MAX_PHONE_DIGITS} digits"
        )));
    }
    if digits.starts_with('0') {
        return Err(GatewayError::InvalidInput(
            "phone number must start with the country code".into(),
        ));
    }
    Ok(digits)
}
