use crate::client::ProtocolClient;
use crate::config::{GatewayConfig, ReconnectPolicy};
use crate::error::{GatewayError, PersistenceError, Result};
use crate::events::{self, EventSubscriber, HandlerId, SubscriberList};
use crate::pairing;
use crate::persistence::SessionPersistence;
use crate::task::LoopTask;
use chrono::{DateTime, Utc};
use gatecore::store::DeviceStore;
use gatecore::{DeviceInfo, ProxyConfig, QrCodeResponse, SessionStats, SessionStatus};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

// The size of the status broadcast buffer.
const STATUS_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub session_id: String,
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct IssuedQr {
    pub code: String,
    pub image: String,
    pub expires_at: DateTime<Utc>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
struct PairedDevice {
    jid: String,
    platform: Option<String>,
    business_name: Option<String>,
    paired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct LiveState {
    status: SessionStatus,
    qr: Option<IssuedQr>,
    device: Option<PairedDevice>,
    proxy: Option<ProxyConfig>,
    loop_active: bool,
    last_activity: Option<DateTime<Utc>>,
    connected_since: Option<DateTime<Utc>>,
}

/// State shared by the controller, the pairing loop and the event
/// dispatcher of one session.
///
/// The live fields sit behind a plain `RwLock` that is never held across an
/// await point; readers never wait on a transition in progress.
pub(crate) struct SessionShared {
    id: String,
    pub(crate) config: Arc<GatewayConfig>,
    pub(crate) client: Arc<dyn ProtocolClient>,
    pub(crate) device_store: Arc<dyn DeviceStore>,
    pub(crate) persistence: SessionPersistence,
    live: RwLock<LiveState>,
    status_tx: broadcast::Sender<StatusChange>,
    expected_disconnect: AtomicBool,
    messages_received: AtomicU64,
}

impl SessionShared {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    fn live(&self) -> RwLockReadGuard<'_, LiveState> {
        self.live.read().unwrap_or_else(|e| e.into_inner())
    }

    fn live_mut(&self) -> RwLockWriteGuard<'_, LiveState> {
        self.live.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn status(&self) -> SessionStatus {
        self.live().status
    }

    /// Applies `target` if the state machine allows it, otherwise re-asserts
    /// the current status. The resulting status is always written through.
    pub(crate) async fn set_status(
        &self,
        target: SessionStatus,
    ) -> std::result::Result<SessionStatus, PersistenceError> {
        let (from, to) = {
            let mut live = self.live_mut();
            let from = live.status;
            let to = from.transition(target);
            if to != target {
                debug!(
                    target: "Gateway/Connection",
                    "Session {}: ignoring transition {from} -> {target}, staying {to}", self.id
                );
            }
            live.status = to;
            match to {
                SessionStatus::Connected if from != SessionStatus::Connected => {
                    live.connected_since = Some(Utc::now());
                }
                SessionStatus::Disconnected => live.connected_since = None,
                _ => {}
            }
            (from, to)
        };

        if from != to {
            info!(target: "Gateway/Connection", "Session {} status {from} -> {to}", self.id);
            // no receivers is fine
            let _ = self.status_tx.send(StatusChange {
                session_id: self.id.clone(),
                from,
                to,
                at: Utc::now(),
            });
        }

        self.persistence.set_status(&self.id, to).await?;
        Ok(to)
    }

    /// `set_status` for callers that cannot propagate a persistence failure.
    pub(crate) async fn settle_status(&self, target: SessionStatus) -> SessionStatus {
        match self.set_status(target).await {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    target: "Gateway/Persistence",
                    "Session {}: failed to persist status: {e}", self.id
                );
                self.status()
            }
        }
    }

    pub(crate) fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.status_tx.subscribe()
    }

    pub(crate) fn current_qr(&self) -> Option<IssuedQr> {
        self.live().qr.clone()
    }

    /// Publishes a freshly issued pairing code and moves the session to
    /// `connecting`.
    pub(crate) async fn issue_qr(
        &self,
        code: String,
        timeout: Duration,
    ) -> std::result::Result<(), PersistenceError> {
        let image = match pairing::render_qr_image(&code) {
            Ok(image) => image,
            Err(e) => {
                warn!(target: "Gateway/Pairing", "Session {}: failed to render QR image: {e}", self.id);
                String::new()
            }
        };
        if let Ok(terminal) = pairing::render_qr_terminal(&code) {
            info!(target: "Gateway/Pairing", "Scan to pair session {}:\n{terminal}", self.id);
        }

        let expires_at = Utc::now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.live_mut().qr = Some(IssuedQr {
            code: code.clone(),
            image,
            expires_at,
            timeout,
        });

        let stored = self
            .persistence
            .set_qr_code(&self.id, Some(code), Some(expires_at))
            .await;
        let status = self.set_status(SessionStatus::Connecting).await;
        stored?;
        status.map(|_| ())
    }

    pub(crate) async fn clear_qr(&self) -> std::result::Result<(), PersistenceError> {
        self.live_mut().qr = None;
        self.persistence.set_qr_code(&self.id, None, None).await
    }

    pub(crate) async fn record_device(
        &self,
        jid: String,
        platform: Option<String>,
        business_name: Option<String>,
    ) -> std::result::Result<(), PersistenceError> {
        {
            let mut live = self.live_mut();
            // a repeat report for the same device only fills in what is missing
            let previous = live.device.take().filter(|d| d.jid == jid);
            let (old_platform, old_business, old_paired) = match previous {
                Some(d) => (d.platform, d.business_name, d.paired_at),
                None => (None, None, None),
            };
            live.device = Some(PairedDevice {
                jid: jid.clone(),
                platform: platform.or(old_platform),
                business_name: business_name.or(old_business),
                paired_at: old_paired.or_else(|| Some(Utc::now())),
            });
        }
        self.device_store.set_device_id(Some(jid.clone())).await;
        self.persistence.set_device_jid(&self.id, Some(jid)).await
    }

    pub(crate) async fn forget_device(&self) -> std::result::Result<(), PersistenceError> {
        self.live_mut().device = None;
        self.device_store.set_device_id(None).await;
        self.persistence.set_device_jid(&self.id, None).await
    }

    pub(crate) fn device_info(&self) -> Option<DeviceInfo> {
        let live = self.live();
        live.device.as_ref().map(|d| DeviceInfo {
            device_jid: d.jid.clone(),
            platform: d.platform.clone(),
            business_name: d.business_name.clone(),
            paired_at: d.paired_at,
            connected: live.status == SessionStatus::Connected,
        })
    }

    pub(crate) fn mark_expected_disconnect(&self) {
        self.expected_disconnect.store(true, Ordering::SeqCst);
    }

    /// Consumes the mark left by a disconnect this gateway initiated.
    pub(crate) fn take_expected_disconnect(&self) -> bool {
        self.expected_disconnect.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn touch_activity(&self) {
        self.live_mut().last_activity = Some(Utc::now());
    }

    pub(crate) async fn record_message(&self) -> std::result::Result<(), PersistenceError> {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        self.live_mut().last_activity = Some(now);
        self.persistence.touch_last_seen(&self.id, now).await
    }

    pub(crate) fn set_loop_active(&self, active: bool) {
        self.live_mut().loop_active = active;
    }

    pub(crate) fn loop_active(&self) -> bool {
        self.live().loop_active
    }

    fn proxy(&self) -> Option<ProxyConfig> {
        self.live().proxy.clone()
    }

    fn set_live_proxy(&self, proxy: Option<ProxyConfig>) {
        self.live_mut().proxy = proxy;
    }

    fn stats(&self) -> SessionStats {
        let live = self.live();
        let uptime_secs = live
            .connected_since
            .map(|since| (Utc::now() - since).num_seconds().max(0) as u64)
            .unwrap_or(0);
        SessionStats {
            messages_sent: 0,
            messages_received: self.messages_received.load(Ordering::Relaxed),
            last_activity: live.last_activity,
            connected_since: live.connected_since,
            uptime_secs,
        }
    }
}

struct Transition {
    /// Parent of the active pairing loop. Replaced on every connect.
    context: CancellationToken,
    pairing: Option<LoopTask>,
}

/// The live connection handle of one session.
///
/// `connect`, `disconnect` and `logout` are serialized by a per-session
/// transition lock; status reads go through the shared live state and never
/// wait on it.
pub struct SessionConnection {
    pub(crate) shared: Arc<SessionShared>,
    transition: Mutex<Transition>,
    /// Cancelled on teardown. Parent of the dispatcher, the pairing context
    /// and any reconnect task.
    root: CancellationToken,
    pub(crate) subscribers: SubscriberList,
    reconnecting: Arc<AtomicBool>,
}

impl SessionConnection {
    pub(crate) async fn new(
        session_id: &str,
        config: Arc<GatewayConfig>,
        client: Arc<dyn ProtocolClient>,
        device_store: Arc<dyn DeviceStore>,
        persistence: SessionPersistence,
        root: CancellationToken,
    ) -> Arc<Self> {
        let device = device_store.device_id().await.map(|jid| PairedDevice {
            jid,
            platform: None,
            business_name: None,
            paired_at: None,
        });
        let queue_capacity = config.event_queue_capacity;
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let shared = Arc::new(SessionShared {
            id: session_id.to_string(),
            config,
            client: client.clone(),
            device_store,
            persistence,
            live: RwLock::new(LiveState {
                device,
                ..Default::default()
            }),
            status_tx,
            expected_disconnect: AtomicBool::new(false),
            messages_received: AtomicU64::new(0),
        });

        let conn = Arc::new_cyclic(|weak: &Weak<SessionConnection>| {
            let sender = events::spawn_dispatcher(
                weak.clone(),
                session_id.to_string(),
                root.clone(),
                queue_capacity,
            );
            client.subscribe(Arc::new(sender));
            Self {
                shared,
                transition: Mutex::new(Transition {
                    context: root.child_token(),
                    pairing: None,
                }),
                root,
                subscribers: SubscriberList::default(),
                reconnecting: Arc::new(AtomicBool::new(false)),
            }
        });
        debug!(target: "Gateway/Connection", "Created connection handle for session {session_id}");
        conn
    }

    pub fn id(&self) -> &str {
        self.shared.id()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.client.is_connected()
    }

    pub fn is_logged_in(&self) -> bool {
        self.shared.client.is_logged_in()
    }

    pub fn is_pairing(&self) -> bool {
        self.shared.loop_active()
    }

    pub fn is_torn_down(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.shared.subscribe_status()
    }

    /// Drives the session towards `connected`.
    ///
    /// Any pairing loop from a previous attempt is stopped and confirmed gone
    /// first. An unregistered device gets a fresh pairing loop and this
    /// returns as soon as it runs; a registered device reconnects directly
    /// and the outcome is known on return.
    pub async fn connect(&self) -> Result<()> {
        if self.root.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        let mut t = self.transition.lock().await;
        self.stop_pairing(&mut t).await;

        if self.shared.client.is_connected() {
            debug!(target: "Gateway/Connection", "Session {}: dropping previous connection", self.id());
            self.shared.mark_expected_disconnect();
            self.shared.client.disconnect().await;
        }
        // the client does not report closes we asked for, drop any stale mark
        self.shared.take_expected_disconnect();
        t.context.cancel();
        t.context = self.root.child_token();

        self.shared.settle_status(SessionStatus::Disconnected).await;
        self.shared.settle_status(SessionStatus::Connecting).await;

        if self.shared.device_store.is_registered().await {
            self.reconnect_registered(&t.context).await
        } else {
            self.start_pairing(&mut t).await
        }
    }

    async fn start_pairing(&self, t: &mut Transition) -> Result<()> {
        let id = self.id().to_string();
        let timeout = self.shared.config.upstream_timeout;
        info!(target: "Gateway/Pairing", "Session {id} has no device identity, starting QR pairing");

        let rx = match tokio::time::timeout(timeout, self.shared.client.pairing_channel()).await {
            Ok(Ok(rx)) => rx,
            Ok(Err(e)) => {
                return self
                    .fail_connect(GatewayError::upstream("open pairing channel", e))
                    .await;
            }
            Err(_) => {
                return self
                    .fail_connect(GatewayError::Timeout("open pairing channel".into()))
                    .await;
            }
        };

        match tokio::time::timeout(timeout, self.shared.client.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.fail_connect(GatewayError::upstream("connect", e)).await,
            Err(_) => return self.fail_connect(GatewayError::Timeout("connect".into())).await,
        }

        self.shared.set_loop_active(true);
        let shared = self.shared.clone();
        t.pairing = Some(LoopTask::spawn(
            "QR pairing loop",
            &t.context,
            move |signals| pairing::run_pairing_loop(shared, rx, signals),
        ));
        Ok(())
    }

    async fn reconnect_registered(&self, context: &CancellationToken) -> Result<()> {
        let id = self.id();
        info!(target: "Gateway/Connection", "Reconnecting paired session {id}");

        match tokio::time::timeout(self.shared.config.upstream_timeout, self.shared.client.connect())
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.fail_connect(GatewayError::upstream("connect", e)).await,
            Err(_) => return self.fail_connect(GatewayError::Timeout("connect".into())).await,
        }

        tokio::select! {
            _ = context.cancelled() => return Err(GatewayError::Cancelled),
            _ = tokio::time::sleep(self.shared.config.settle_delay) => {}
        }

        if self.shared.client.is_connected() {
            self.shared.settle_status(SessionStatus::Connected).await;
            self.shared.touch_activity();
            Ok(())
        } else {
            self.fail_connect(GatewayError::UpstreamFailure {
                op: "connect",
                message: "client not connected after settle delay".into(),
            })
            .await
        }
    }

    async fn fail_connect(&self, err: GatewayError) -> Result<()> {
        warn!(target: "Gateway/Connection", "Session {}: connect failed: {err}", self.id());
        self.shared.set_loop_active(false);
        if let Err(e) = self.shared.clear_qr().await {
            debug!(target: "Gateway/Persistence", "Session {}: failed to clear QR: {e}", self.id());
        }
        self.shared.settle_status(SessionStatus::Disconnected).await;
        Err(err)
    }

    async fn stop_pairing(&self, t: &mut Transition) {
        if let Some(task) = t.pairing.take() {
            let outcome = task.stop(self.shared.config.stop_grace).await;
            debug!(
                target: "Gateway/Pairing",
                "Session {}: previous pairing loop stopped ({outcome:?})", self.id()
            );
            self.shared.set_loop_active(false);
        }
    }

    /// Idempotent. Leaves the session `disconnected` with no pairing loop
    /// and no QR code.
    pub async fn disconnect(&self) -> Result<()> {
        let mut t = self.transition.lock().await;
        self.stop_pairing(&mut t).await;

        if self.shared.client.is_connected() {
            self.shared.mark_expected_disconnect();
            self.shared.client.disconnect().await;
        }
        t.context.cancel();

        if let Err(e) = self.shared.clear_qr().await {
            warn!(target: "Gateway/Persistence", "Session {}: failed to clear QR: {e}", self.id());
        }
        self.shared.settle_status(SessionStatus::Disconnected).await;
        info!(target: "Gateway/Connection", "Session {} disconnected", self.id());
        Ok(())
    }

    /// Best-effort credential invalidation followed by unconditional local
    /// cleanup. An upstream logout failure is logged, not returned.
    pub async fn logout(&self) -> Result<()> {
        let mut t = self.transition.lock().await;
        self.stop_pairing(&mut t).await;

        let id = self.id();
        match tokio::time::timeout(self.shared.config.upstream_timeout, self.shared.client.logout())
            .await
        {
            Ok(Ok(())) => info!(target: "Gateway/Connection", "Session {id} logged out upstream"),
            Ok(Err(e)) => warn!(
                target: "Gateway/Connection",
                "Session {id}: upstream logout failed, cleaning up locally: {e}"
            ),
            Err(_) => warn!(
                target: "Gateway/Connection",
                "Session {id}: upstream logout timed out, cleaning up locally"
            ),
        }

        if self.shared.client.is_connected() {
            self.shared.mark_expected_disconnect();
            self.shared.client.disconnect().await;
        }
        t.context.cancel();

        if let Err(e) = self.shared.clear_qr().await {
            warn!(target: "Gateway/Persistence", "Session {id}: failed to clear QR: {e}");
        }
        if let Err(e) = self.shared.forget_device().await {
            warn!(target: "Gateway/Persistence", "Session {id}: failed to clear device identity: {e}");
        }
        self.shared.settle_status(SessionStatus::Disconnected).await;
        Ok(())
    }

    /// Disconnects and stops every background task of this handle.
    pub(crate) async fn teardown(&self) {
        if let Err(e) = self.disconnect().await {
            warn!(target: "Gateway/Connection", "Session {}: disconnect during teardown failed: {e}", self.id());
        }
        self.discard();
    }

    /// Stops background tasks without touching the client or the row.
    pub(crate) fn discard(&self) {
        self.root.cancel();
    }

    pub fn qr_code(&self) -> Result<QrCodeResponse> {
        if self.shared.client.is_logged_in() {
            return Err(GatewayError::InvalidState(format!(
                "session {} is already paired",
                self.id()
            )));
        }
        let qr = self.shared.current_qr().ok_or_else(|| {
            GatewayError::InvalidState(format!("no QR code issued for session {}", self.id()))
        })?;
        if qr.expires_at <= Utc::now() {
            return Err(GatewayError::InvalidState(format!(
                "QR code for session {} has expired",
                self.id()
            )));
        }
        Ok(QrCodeResponse {
            code: qr.code,
            image: qr.image,
            expires_at: qr.expires_at,
            timeout_secs: qr.timeout.as_secs(),
        })
    }

    /// `phone` must already be normalized to digits.
    pub async fn pair_phone(&self, phone: &str) -> Result<String> {
        if !self.shared.client.is_connected() {
            return Err(GatewayError::InvalidState(format!(
                "session {} must be connected to pair by phone",
                self.id()
            )));
        }
        if self.shared.client.is_logged_in() {
            return Err(GatewayError::InvalidState(format!(
                "session {} is already paired",
                self.id()
            )));
        }
        let code = tokio::time::timeout(
            self.shared.config.upstream_timeout,
            self.shared.client.pair_phone(phone),
        )
        .await
        .map_err(|_| GatewayError::Timeout("pair phone".into()))?
        .map_err(|e| GatewayError::upstream("pair phone", e))?;
        info!(target: "Gateway/Pairing", "Session {}: issued phone pairing code", self.id());
        Ok(code)
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.shared.device_info()
    }

    pub fn proxy(&self) -> Option<ProxyConfig> {
        self.shared.proxy()
    }

    /// Applies and persists a proxy. `None` removes it.
    pub async fn set_proxy(&self, proxy: Option<ProxyConfig>) -> Result<()> {
        if let Some(p) = &proxy {
            p.validate()
                .map_err(|e| GatewayError::InvalidInput(e.to_string()))?;
        }
        self.shared
            .client
            .set_proxy(proxy.as_ref())
            .await
            .map_err(|e| GatewayError::upstream("set proxy", e))?;
        self.shared.set_live_proxy(proxy.clone());
        self.shared.persistence.set_proxy(self.id(), proxy).await?;
        Ok(())
    }

    /// Proxy application at creation time. Failure leaves the session
    /// without a proxy and is only logged.
    pub(crate) async fn apply_initial_proxy(&self, proxy: &ProxyConfig) {
        let applied = match proxy.validate() {
            Ok(()) => self
                .shared
                .client
                .set_proxy(Some(proxy))
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match applied {
            Ok(()) => {
                self.shared.set_live_proxy(Some(proxy.clone()));
                debug!(target: "Gateway/Connection", "Session {}: proxy {} applied", self.id(), proxy.kind.scheme());
            }
            Err(e) => warn!(
                target: "Gateway/Connection",
                "Session {}: failed to apply proxy, continuing without it: {e}", self.id()
            ),
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }

    pub fn register_event_handler(&self, subscriber: Arc<dyn EventSubscriber>) -> HandlerId {
        self.subscribers.add(subscriber)
    }

    pub fn unregister_event_handler(&self, id: HandlerId) -> bool {
        self.subscribers.remove(id)
    }

    /// Starts a background reconnect under the configured policy. At most
    /// one runs per session.
    pub(crate) fn schedule_reconnect(self: &Arc<Self>) {
        let ReconnectPolicy::Auto {
            max_attempts,
            interval,
        } = self.shared.config.reconnect
        else {
            debug!(
                target: "Gateway/Connection",
                "Session {} disconnected unexpectedly, waiting for a manual connect", self.id()
            );
            return;
        };
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(self);
        let flag = self.reconnecting.clone();
        let token = self.root.child_token();
        let id = self.id().to_string();
        tokio::spawn(async move {
            let _reset = scopeguard::guard(flag, |f| f.store(false, Ordering::SeqCst));
            let attempts = max_attempts.max(1);
            for attempt in 1..=attempts {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(conn) = weak.upgrade() else { return };
                if conn.status() != SessionStatus::Disconnected {
                    debug!(target: "Gateway/Connection", "Session {id} is {}, reconnect not needed", conn.status());
                    return;
                }
                match conn.connect().await {
                    Ok(()) => {
                        info!(target: "Gateway/Connection", "Session {id} reconnected on attempt {attempt}");
                        return;
                    }
                    Err(e) => warn!(
                        target: "Gateway/Connection",
                        "Session {id}: reconnect attempt {attempt}/{attempts} failed: {e}"
                    ),
                }
            }
        });
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    pub(crate) fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }
}
