use crate::client::{ClientFactory, PairingEvent, ProtocolClient};
use crate::config::GatewayConfig;
use crate::service::SessionService;
use crate::store::{MemoryDeviceStoreResolver, MemorySessionRepository};
use async_trait::async_trait;
use gatecore::store::error::Result as StoreResult;
use gatecore::store::{DeviceStore, SessionRepository};
use gatecore::{Event, EventHandler, ListSessionsRequest, ProxyConfig, Session};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Timings short enough for tests that run on the real clock.
pub fn fast_config() -> GatewayConfig {
    GatewayConfig {
        connect_max_retries: 3,
        connect_retry_interval: Duration::from_millis(10),
        settle_delay: Duration::from_millis(20),
        stop_grace: Duration::from_millis(50),
        persistence_timeout: Duration::from_secs(1),
        upstream_timeout: Duration::from_secs(1),
        subscriber_timeout: Duration::from_millis(200),
        ..GatewayConfig::default()
    }
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Protocol client double that records every call and counts pairing
/// channels, so tests can check how many loops were consuming at once.
#[derive(Default)]
pub struct FakeProtocolClient {
    connected: AtomicBool,
    logged_in: AtomicBool,
    /// Connect returns Ok but the client never reports connected.
    stays_offline: AtomicBool,
    connect_failures: AtomicUsize,
    fail_logout: AtomicBool,
    fail_pairing_channel: AtomicBool,
    fail_proxy: AtomicBool,
    ops: Mutex<Vec<String>>,
    handlers: Mutex<Vec<Arc<dyn EventHandler>>>,
    channels: Mutex<Vec<mpsc::Sender<PairingEvent>>>,
    /// Number of still-open earlier channels at each channel open.
    open_at_each_open: Mutex<Vec<usize>>,
}

impl FakeProtocolClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, op: impl Into<String>) {
        self.ops.lock().unwrap().push(op.into());
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn count_op(&self, op: &str) -> usize {
        self.ops().iter().filter(|o| o.as_str() == op).count()
    }

    pub fn set_logged_in(&self, value: bool) {
        self.logged_in.store(value, Ordering::SeqCst);
    }

    pub fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::SeqCst);
    }

    pub fn set_stays_offline(&self, value: bool) {
        self.stays_offline.store(value, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_logout(&self, value: bool) {
        self.fail_logout.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_pairing_channel(&self, value: bool) {
        self.fail_pairing_channel.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_proxy(&self, value: bool) {
        self.fail_proxy.store(value, Ordering::SeqCst);
    }

    pub fn channels_opened(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    /// Channels whose consumer is still alive.
    pub fn open_channels(&self) -> usize {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    pub fn open_at_each_open(&self) -> Vec<usize> {
        self.open_at_each_open.lock().unwrap().clone()
    }

    /// Pushes onto the most recently opened pairing channel.
    pub async fn emit_pairing(&self, event: PairingEvent) {
        let tx = self
            .channels
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no pairing channel opened");
        tx.send(event).await.expect("pairing loop is gone");
    }

    pub fn emit(&self, event: Event) {
        let handlers = self.handlers.lock().unwrap().clone();
        for handler in handlers {
            handler.handle_event(&event);
        }
    }
}

#[async_trait]
impl ProtocolClient for FakeProtocolClient {
    async fn connect(&self) -> Result<(), anyhow::Error> {
        self.log("connect");
        let failing = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow::anyhow!("dial tcp: connection refused"));
        }
        if !self.stays_offline.load(Ordering::SeqCst) {
            self.connected.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.log("disconnect");
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    async fn logout(&self) -> Result<(), anyhow::Error> {
        self.log("logout");
        if self.fail_logout.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("logout rejected by server"));
        }
        self.logged_in.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn pairing_channel(&self) -> Result<mpsc::Receiver<PairingEvent>, anyhow::Error> {
        self.log("pairing_channel");
        if self.fail_pairing_channel.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("websocket closed"));
        }
        let mut channels = self.channels.lock().unwrap();
        let still_open = channels.iter().filter(|tx| !tx.is_closed()).count();
        self.open_at_each_open.lock().unwrap().push(still_open);
        let (tx, rx) = mpsc::channel(8);
        channels.push(tx);
        Ok(rx)
    }

    fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.lock().unwrap().push(handler);
    }

    async fn pair_phone(&self, phone: &str) -> Result<String, anyhow::Error> {
        self.log(format!("pair_phone:{phone}"));
        Ok("ABCD1234".to_string())
    }

    async fn set_proxy(&self, proxy: Option<&ProxyConfig>) -> Result<(), anyhow::Error> {
        self.log(format!(
            "set_proxy:{}",
            proxy.map(|p| p.url()).unwrap_or_default()
        ));
        if self.fail_proxy.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("proxy unreachable"));
        }
        Ok(())
    }
}

/// Builds one `FakeProtocolClient` per session and keeps them for inspection.
#[derive(Default)]
pub struct FakeClientFactory {
    clients: Mutex<HashMap<String, Arc<FakeProtocolClient>>>,
    fail_proxy: AtomicBool,
    fail_create: AtomicBool,
}

impl FakeClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self, session_id: &str) -> Arc<FakeProtocolClient> {
        self.clients
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .expect("no client created for session")
    }

    pub fn created(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn set_fail_proxy(&self, value: bool) {
        self.fail_proxy.store(value, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, value: bool) {
        self.fail_create.store(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClientFactory for FakeClientFactory {
    async fn create_client(
        &self,
        session_id: &str,
        device_store: Arc<dyn DeviceStore>,
    ) -> Result<Arc<dyn ProtocolClient>, anyhow::Error> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("client construction failed"));
        }
        let client = Arc::new(FakeProtocolClient::new());
        client.set_logged_in(device_store.is_registered().await);
        client.set_fail_proxy(self.fail_proxy.load(Ordering::SeqCst));
        self.clients
            .lock()
            .unwrap()
            .insert(session_id.to_string(), client.clone());
        Ok(client)
    }
}

/// A repository whose calls never complete.
pub struct StallingRepository;

#[async_trait]
impl SessionRepository for StallingRepository {
    async fn create(&self, _session: &Session) -> StoreResult<()> {
        std::future::pending().await
    }

    async fn get_by_id(&self, _id: &str) -> StoreResult<Option<Session>> {
        std::future::pending().await
    }

    async fn list(&self, _req: &ListSessionsRequest) -> StoreResult<(Vec<Session>, usize)> {
        std::future::pending().await
    }

    async fn update(&self, _session: &Session) -> StoreResult<()> {
        std::future::pending().await
    }

    async fn delete(&self, _id: &str) -> StoreResult<()> {
        std::future::pending().await
    }
}

pub struct TestGateway {
    pub service: SessionService,
    pub repo: Arc<MemorySessionRepository>,
    pub resolver: Arc<MemoryDeviceStoreResolver>,
    pub factory: Arc<FakeClientFactory>,
}

pub fn test_gateway(config: GatewayConfig) -> TestGateway {
    init_logging();
    let repo = Arc::new(MemorySessionRepository::new());
    let resolver = Arc::new(MemoryDeviceStoreResolver::new());
    let factory = Arc::new(FakeClientFactory::new());
    let service = SessionService::new(config, repo.clone(), resolver.clone(), factory.clone());
    TestGateway {
        service,
        repo,
        resolver,
        factory,
    }
}

impl TestGateway {
    /// Inserts a stored session row, optionally already paired.
    pub async fn seed_row(&self, id: &str, device_jid: Option<&str>) -> Session {
        let mut row = Session::with_id(id, format!("session {id}"));
        row.device_jid = device_jid.map(str::to_string);
        self.repo.create(&row).await.unwrap();
        row
    }

    pub async fn stored(&self, id: &str) -> Session {
        self.repo.get_by_id(id).await.unwrap().expect("row exists")
    }

    /// Polls the stored row until `pred` holds.
    pub async fn wait_for_row<P: Fn(&Session) -> bool>(
        &self,
        id: &str,
        what: &str,
        pred: P,
    ) -> Session {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let row = self.stored(id).await;
            if pred(&row) {
                return row;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}, last row: {row:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
