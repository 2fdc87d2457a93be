use crate::client::ClientFactory;
use crate::config::GatewayConfig;
use crate::connection::{SessionConnection, StatusChange};
use crate::error::{GatewayError, Result};
use crate::events::{EventSubscriber, HandlerId};
use crate::persistence::SessionPersistence;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use gatecore::store::{DeviceStoreResolver, SessionRepository};
use gatecore::{DeviceInfo, ProxyConfig, QrCodeResponse, SessionStats};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Registry of live connection handles, one per session identifier.
///
/// Lookups never wait on a transition in progress: the map only guards
/// insertion and removal, and no map lock is held across I/O.
pub struct SessionManager {
    sessions: DashMap<String, Arc<SessionConnection>>,
    resolver: Arc<dyn DeviceStoreResolver>,
    factory: Arc<dyn ClientFactory>,
    persistence: SessionPersistence,
    config: Arc<GatewayConfig>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        config: GatewayConfig,
        repository: Arc<dyn SessionRepository>,
        resolver: Arc<dyn DeviceStoreResolver>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let persistence = SessionPersistence::new(repository, config.persistence_timeout);
        Self {
            sessions: DashMap::new(),
            resolver,
            factory,
            persistence,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub(crate) fn persistence(&self) -> &SessionPersistence {
        &self.persistence
    }

    pub(crate) fn resolver(&self) -> &Arc<dyn DeviceStoreResolver> {
        &self.resolver
    }

    /// Builds and registers the live handle for `session_id`.
    ///
    /// The device store is seeded with the identity recorded on the session
    /// row, if there is one. A proxy that cannot be applied is logged and the
    /// session is created without it.
    pub async fn create(
        &self,
        session_id: &str,
        proxy: Option<&ProxyConfig>,
    ) -> Result<Arc<SessionConnection>> {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        if self.sessions.contains_key(session_id) {
            return Err(GatewayError::AlreadyExists(session_id.to_string()));
        }

        let known_device = match self.persistence.load(session_id).await {
            Ok(row) => row.and_then(|r| r.device_jid),
            Err(e) => {
                warn!(target: "Gateway/Manager", "Session {session_id}: could not read stored device identity: {e}");
                None
            }
        };
        let device_store = self
            .resolver
            .resolve(session_id, known_device.as_deref())
            .await?;
        let client = self
            .factory
            .create_client(session_id, device_store.clone())
            .await
            .map_err(|e| GatewayError::upstream("create client", e))?;

        let conn = SessionConnection::new(
            session_id,
            self.config.clone(),
            client,
            device_store,
            self.persistence.clone(),
            self.shutdown.child_token(),
        )
        .await;
        if let Some(proxy) = proxy {
            conn.apply_initial_proxy(proxy).await;
        }

        let inserted = match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(conn.clone());
                true
            }
        };
        if !inserted {
            conn.discard();
            return Err(GatewayError::AlreadyExists(session_id.to_string()));
        }

        info!(target: "Gateway/Manager", "Registered session {session_id}");
        Ok(conn)
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<SessionConnection>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::NotFound(session_id.to_string()))
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Returns the live handle, rebuilding it from the stored session row
    /// after a restart.
    pub async fn get_or_restore(&self, session_id: &str) -> Result<Arc<SessionConnection>> {
        if let Ok(conn) = self.get(session_id) {
            return Ok(conn);
        }
        let row = self
            .persistence
            .load(session_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(session_id.to_string()))?;

        debug!(target: "Gateway/Manager", "Restoring live handle for session {session_id}");
        match self.create(session_id, row.proxy_config.as_ref()).await {
            Ok(conn) => Ok(conn),
            // lost a race with another restore
            Err(GatewayError::AlreadyExists(_)) => self.get(session_id),
            Err(e) => Err(e),
        }
    }

    pub async fn connect(&self, session_id: &str) -> Result<()> {
        self.get(session_id)?.connect().await
    }

    /// Connects, retrying failed attempts `interval` apart. `max_retries`
    /// bounds the total number of attempts; at least one is always made.
    pub async fn connect_with_retry(
        &self,
        session_id: &str,
        max_retries: u32,
        interval: Duration,
    ) -> Result<()> {
        let attempts = max_retries.max(1);
        let mut attempt = 1;
        loop {
            let conn = self.get(session_id)?;
            let err = match conn.connect().await {
                Ok(()) => return Ok(()),
                Err(e @ (GatewayError::Cancelled | GatewayError::InvalidInput(_))) => return Err(e),
                Err(e) => e,
            };
            if attempt >= attempts {
                warn!(
                    target: "Gateway/Manager",
                    "Session {session_id}: giving up after {attempts} connect attempts: {err}"
                );
                return Err(err);
            }
            warn!(
                target: "Gateway/Manager",
                "Session {session_id}: connect attempt {attempt}/{attempts} failed, retrying in {interval:?}: {err}"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(GatewayError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
            attempt += 1;
        }
    }

    pub async fn disconnect(&self, session_id: &str) -> Result<()> {
        self.get(session_id)?.disconnect().await
    }

    /// Logs the session out and drops its handle and device store. Local
    /// cleanup happens even when the upstream logout fails.
    pub async fn logout(&self, session_id: &str) -> Result<()> {
        let conn = self.get(session_id)?;
        let result = conn.logout().await;
        self.remove(session_id).await;
        if let Err(e) = self.resolver.forget(session_id).await {
            warn!(target: "Gateway/Manager", "Session {session_id}: failed to drop device store: {e}");
        }
        result
    }

    /// Tears down and unregisters the handle. Returns whether one existed.
    pub async fn remove(&self, session_id: &str) -> bool {
        let Some((_, conn)) = self.sessions.remove(session_id) else {
            return false;
        };
        conn.teardown().await;
        info!(target: "Gateway/Manager", "Removed session {session_id}");
        true
    }

    pub fn get_qr_code(&self, session_id: &str) -> Result<QrCodeResponse> {
        self.get(session_id)?.qr_code()
    }

    pub async fn pair_phone(&self, session_id: &str, phone: &str) -> Result<String> {
        self.get(session_id)?.pair_phone(phone).await
    }

    /// False for unknown sessions.
    pub fn is_connected(&self, session_id: &str) -> bool {
        self.get(session_id)
            .map(|conn| conn.is_connected())
            .unwrap_or(false)
    }

    pub fn get_device_info(&self, session_id: &str) -> Result<Option<DeviceInfo>> {
        Ok(self.get(session_id)?.device_info())
    }

    pub async fn set_proxy(&self, session_id: &str, proxy: Option<ProxyConfig>) -> Result<()> {
        self.get(session_id)?.set_proxy(proxy).await
    }

    pub fn get_proxy(&self, session_id: &str) -> Result<Option<ProxyConfig>> {
        Ok(self.get(session_id)?.proxy())
    }

    pub fn stats(&self, session_id: &str) -> Result<SessionStats> {
        Ok(self.get(session_id)?.stats())
    }

    pub fn register_event_handler(
        &self,
        session_id: &str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Result<HandlerId> {
        Ok(self.get(session_id)?.register_event_handler(subscriber))
    }

    pub fn unregister_event_handler(&self, session_id: &str, handler: HandlerId) -> Result<()> {
        if self.get(session_id)?.unregister_event_handler(handler) {
            Ok(())
        } else {
            Err(GatewayError::NotFound(format!(
                "event handler {handler:?} on session {session_id}"
            )))
        }
    }

    pub fn subscribe_status(&self, session_id: &str) -> Result<broadcast::Receiver<StatusChange>> {
        Ok(self.get(session_id)?.subscribe_status())
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Tears down every handle and refuses new ones.
    pub async fn shutdown(&self) {
        info!(target: "Gateway/Manager", "Shutting down {} session(s)", self.sessions.len());
        self.shutdown.cancel();
        let ids = self.active_sessions();
        for id in ids {
            self.remove(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fast_config, test_gateway};
    use gatecore::{ProxyKind, SessionStatus};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_create_registers_exactly_one_handle() {
        let gw = test_gateway(fast_config());
        gw.seed_row("s1", None).await;
        let manager = gw.service.manager().clone();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.create("s1", None).await })
            })
            .collect();
        let mut created = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(GatewayError::AlreadyExists(id)) => assert_eq!(id, "s1"),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(created, 1);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.active_sessions(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let gw = test_gateway(fast_config());
        let manager = gw.service.manager();

        assert!(matches!(manager.get("nope"), Err(GatewayError::NotFound(_))));
        assert!(matches!(
            manager.connect("nope").await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(!manager.is_connected("nope"));
        assert!(!manager.remove("nope").await);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn create_seeds_device_store_from_the_row() {
        let gw = test_gateway(fast_config());
        gw.seed_row("s1", Some("555@x")).await;

        let conn = gw.service.manager().create("s1", None).await.unwrap();

        assert!(conn.is_logged_in());
        assert_eq!(conn.device_info().unwrap().device_jid, "555@x");
    }

    #[tokio::test]
    async fn proxy_failure_at_create_is_not_fatal() {
        let gw = test_gateway(fast_config());
        gw.seed_row("s1", None).await;
        gw.factory.set_fail_proxy(true);
        let proxy = ProxyConfig {
            kind: ProxyKind::Http,
            host: "proxy.local".into(),
            port: 3128,
            username: None,
            password: None,
        };

        let conn = gw.service.manager().create("s1", Some(&proxy)).await.unwrap();

        assert_eq!(conn.proxy(), None);
        assert_eq!(
            gw.factory.client("s1").count_op("set_proxy:http://proxy.local:3128"),
            1
        );
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let gw = test_gateway(fast_config());
        gw.seed_row("s1", Some("555@x")).await;
        let manager = gw.service.manager();
        manager.create("s1", None).await.unwrap();
        let client = gw.factory.client("s1");
        client.fail_next_connects(2);

        manager
            .connect_with_retry("s1", 3, Duration::from_millis(5))
            .await
            .unwrap();

        assert_eq!(client.count_op("connect"), 3);
        assert!(manager.is_connected("s1"));
        assert_eq!(manager.get("s1").unwrap().status(), SessionStatus::Connected);
    }

    #[tokio::test]
    async fn retry_gives_up_after_the_last_attempt() {
        let gw = test_gateway(fast_config());
        gw.seed_row("s1", Some("555@x")).await;
        let manager = gw.service.manager();
        manager.create("s1", None).await.unwrap();
        let client = gw.factory.client("s1");
        client.fail_next_connects(10);

        let err = manager
            .connect_with_retry("s1", 3, Duration::from_millis(5))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "upstream_failure");
        assert_eq!(client.count_op("connect"), 3);
        assert_eq!(manager.get("s1").unwrap().status(), SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn zero_retries_still_attempts_once() {
        let gw = test_gateway(fast_config());
        gw.seed_row("s1", Some("555@x")).await;
        let manager = gw.service.manager();
        manager.create("s1", None).await.unwrap();
        let client = gw.factory.client("s1");
        client.fail_next_connects(1);

        assert!(
            manager
                .connect_with_retry("s1", 0, Duration::from_millis(5))
                .await
                .is_err()
        );
        assert_eq!(client.count_op("connect"), 1);
    }

    #[tokio::test]
    async fn logout_drops_handle_even_if_upstream_fails() {
        let gw = test_gateway(fast_config());
        gw.seed_row("s1", Some("555@x")).await;
        let manager = gw.service.manager();
        let conn = manager.create("s1", None).await.unwrap();
        manager.connect("s1").await.unwrap();
        gw.factory.client("s1").set_fail_logout(true);

        manager.logout("s1").await.unwrap();

        assert!(!manager.contains("s1"));
        assert!(conn.is_torn_down());
        assert!(!gw.resolver.contains("s1").await);
        let row = gw.stored("s1").await;
        assert_eq!(row.device_jid, None);
        assert_eq!(row.status, SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn get_or_restore_rebuilds_from_the_row() {
        let gw = test_gateway(fast_config());
        gw.seed_row("s1", Some("555@x")).await;
        let manager = gw.service.manager();

        let restored = manager.get_or_restore("s1").await.unwrap();
        let again = manager.get_or_restore("s1").await.unwrap();

        assert!(Arc::ptr_eq(&restored, &again));
        assert_eq!(gw.factory.created(), 1);
        assert!(matches!(
            manager.get_or_restore("missing").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_handler_cannot_be_unregistered() {
        let gw = test_gateway(fast_config());
        gw.seed_row("s1", None).await;
        gw.seed_row("s2", None).await;
        let manager = gw.service.manager();
        manager.create("s1", None).await.unwrap();
        manager.create("s2", None).await.unwrap();

        struct Noop;
        #[async_trait::async_trait]
        impl EventSubscriber for Noop {
            async fn on_event(&self, _session_id: &str, _event: &gatecore::Event) {}
        }
        let handle = manager.register_event_handler("s1", Arc::new(Noop)).unwrap();

        assert!(matches!(
            manager.unregister_event_handler("s2", handle),
            Err(GatewayError::NotFound(_))
        ));
        manager.unregister_event_handler("s1", handle).unwrap();
    }

    #[tokio::test]
    async fn shutdown_tears_down_and_refuses_new_sessions() {
        let gw = test_gateway(fast_config());
        gw.seed_row("s1", Some("555@x")).await;
        gw.seed_row("s2", None).await;
        let manager = gw.service.manager();
        let first = manager.create("s1", None).await.unwrap();
        manager.connect("s1").await.unwrap();

        manager.shutdown().await;

        assert!(manager.is_empty());
        assert!(first.is_torn_down());
        assert!(matches!(
            manager.create("s2", None).await,
            Err(GatewayError::Cancelled)
        ));
        assert_eq!(gw.stored("s1").await.status, SessionStatus::Disconnected);
    }
}
