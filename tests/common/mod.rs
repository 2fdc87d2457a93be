#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use whatsapp_gateway::gatecore::{Event, EventHandler, ProxyConfig, Session};
use whatsapp_gateway::store::{
    DeviceStore, MemoryDeviceStoreResolver, MemorySessionRepository, SessionRepository,
};
use whatsapp_gateway::{ClientFactory, GatewayConfig, PairingEvent, ProtocolClient, SessionService};

/// A protocol client driven by the test: pairing and event traffic is pushed
/// in by hand.
#[derive(Default)]
pub struct ScriptedClient {
    connected: AtomicBool,
    logged_in: AtomicBool,
    pairing: Mutex<Option<mpsc::Sender<PairingEvent>>>,
    handlers: Mutex<Vec<Arc<dyn EventHandler>>>,
}

impl ScriptedClient {
    pub async fn pairing(&self, event: PairingEvent) {
        let tx = self
            .pairing
            .lock()
            .unwrap()
            .clone()
            .expect("pairing channel not opened");
        tx.send(event).await.expect("pairing loop gone");
    }

    pub fn event(&self, event: Event) {
        for handler in self.handlers.lock().unwrap().iter() {
            handler.handle_event(&event);
        }
    }

    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProtocolClient for ScriptedClient {
    async fn connect(&self) -> Result<(), anyhow::Error> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    async fn logout(&self) -> Result<(), anyhow::Error> {
        self.logged_in.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn pairing_channel(&self) -> Result<mpsc::Receiver<PairingEvent>, anyhow::Error> {
        let (tx, rx) = mpsc::channel(4);
        *self.pairing.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.lock().unwrap().push(handler);
    }

    async fn pair_phone(&self, _phone: &str) -> Result<String, anyhow::Error> {
        Ok("WXYZ9876".into())
    }

    async fn set_proxy(&self, _proxy: Option<&ProxyConfig>) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ScriptedFactory {
    clients: Mutex<HashMap<String, Arc<ScriptedClient>>>,
}

impl ScriptedFactory {
    pub fn client(&self, session_id: &str) -> Arc<ScriptedClient> {
        self.clients
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .expect("client not created")
    }
}

#[async_trait]
impl ClientFactory for ScriptedFactory {
    async fn create_client(
        &self,
        session_id: &str,
        device_store: Arc<dyn DeviceStore>,
    ) -> Result<Arc<dyn ProtocolClient>, anyhow::Error> {
        let client = Arc::new(ScriptedClient::default());
        client
            .logged_in
            .store(device_store.is_registered().await, Ordering::SeqCst);
        self.clients
            .lock()
            .unwrap()
            .insert(session_id.to_string(), client.clone());
        Ok(client)
    }
}

pub struct Harness {
    pub service: SessionService,
    pub repo: Arc<MemorySessionRepository>,
    pub factory: Arc<ScriptedFactory>,
}

pub fn harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = GatewayConfig {
        connect_retry_interval: Duration::from_millis(10),
        settle_delay: Duration::from_millis(10),
        stop_grace: Duration::from_millis(50),
        ..GatewayConfig::default()
    };
    let repo = Arc::new(MemorySessionRepository::new());
    let factory = Arc::new(ScriptedFactory::default());
    let service = SessionService::new(
        config,
        repo.clone(),
        Arc::new(MemoryDeviceStoreResolver::new()),
        factory.clone(),
    );
    Harness {
        service,
        repo,
        factory,
    }
}

impl Harness {
    pub async fn row(&self, id: &str) -> Session {
        self.repo
            .get_by_id(id)
            .await
            .expect("store read")
            .expect("row exists")
    }

    pub async fn eventually<P: Fn(&Session) -> bool>(&self, id: &str, pred: P) -> Session {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let row = self.row(id).await;
            if pred(&row) {
                return row;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "row never matched: {row:?}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
