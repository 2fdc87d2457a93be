use crate::connection::SessionConnection;
use crate::error::GatewayError;
use async_trait::async_trait;
use futures_util::FutureExt;
use gatecore::types::events::{
    ChatPresenceUpdate, HistorySyncSummary, LoggedOut, MessageReceived, PairError, PairSuccess,
    PresenceUpdate, QrCodes, Receipt,
};
use gatecore::{Event, EventHandler, SessionStatus};
use log::{debug, error, info, warn};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

// First code of a batch when the protocol does not say how long it lives.
const DEFAULT_QR_TIMEOUT: Duration = Duration::from_secs(60);

/// External consumer of a session's events, such as a webhook forwarder.
///
/// Called after the gateway has applied the event to the session state.
/// Each call is bounded by the configured subscriber timeout and a panic
/// inside it is contained.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, session_id: &str, event: &Event);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub(crate) struct SubscriberList {
    next_id: AtomicU64,
    entries: RwLock<Vec<(HandlerId, Arc<dyn EventSubscriber>)>>,
}

impl SubscriberList {
    pub(crate) fn add(&self, subscriber: Arc<dyn EventSubscriber>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, subscriber));
        id
    }

    pub(crate) fn remove(&self, id: HandlerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventSubscriber>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, s)| s.clone())
            .collect()
    }
}

/// Registered with the protocol client. Queues events for the session's
/// dispatcher task and returns immediately; a full queue drops the event.
pub(crate) struct EventSender {
    session_id: String,
    tx: mpsc::Sender<Event>,
}

impl EventHandler for EventSender {
    fn handle_event(&self, event: &Event) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!(
                target: "Gateway/Events",
                "Session {}: event queue full, dropping {} event", self.session_id, event.kind()
            ),
            Err(TrySendError::Closed(_)) => debug!(
                target: "Gateway/Events",
                "Session {} is torn down, dropping {} event", self.session_id, event.kind()
            ),
        }
    }
}

/// Spawns the per-session worker that applies events in arrival order.
/// At most `capacity` events wait for it.
pub(crate) fn spawn_dispatcher(
    conn: Weak<SessionConnection>,
    session_id: String,
    token: CancellationToken,
    capacity: usize,
) -> EventSender {
    let (tx, mut rx) = mpsc::channel::<Event>(capacity.max(1));
    let worker_id = session_id.clone();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = rx.recv() => event,
            };
            let Some(event) = event else { break };
            let Some(conn) = conn.upgrade() else { break };
            dispatch(&conn, event).await;
        }
        debug!(target: "Gateway/Events", "Event dispatcher for session {worker_id} stopped");
    });
    EventSender { session_id, tx }
}

/// Applies one event to the session, then hands it to subscribers. Nothing
/// raised here reaches the caller.
pub(crate) async fn dispatch(conn: &Arc<SessionConnection>, event: Event) {
    let id = conn.id();
    let kind = event.kind();

    match AssertUnwindSafe(route(conn, &event)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(target: "Gateway/Events", "Session {id}: {kind} handler failed: {e}"),
        Err(panic) => error!(
            target: "Gateway/Events",
            "Session {id}: {kind} handler panicked: {}", panic_message(&*panic)
        ),
    }

    if !matches!(event, Event::Unknown(_)) {
        notify_subscribers(conn, &event).await;
    }
}

async fn route(conn: &Arc<SessionConnection>, event: &Event) -> Result<(), GatewayError> {
    match event {
        Event::Connected(_) => on_connected(conn).await,
        Event::Disconnected(_) => on_disconnected(conn).await,
        Event::LoggedOut(e) => on_logged_out(conn, e).await,
        Event::Qr(e) => on_qr(conn, e).await,
        Event::PairSuccess(e) => on_pair_success(conn, e).await,
        Event::PairError(e) => on_pair_error(conn, e).await,
        Event::Message(e) => on_message(conn, e).await,
        Event::Receipt(e) => {
            on_receipt(conn, e);
            Ok(())
        }
        Event::Presence(e) => {
            on_presence(conn, e);
            Ok(())
        }
        Event::ChatPresence(e) => {
            on_chat_presence(conn, e);
            Ok(())
        }
        Event::HistorySync(e) => {
            on_history_sync(conn, e);
            Ok(())
        }
        Event::Unknown(e) => {
            debug!(
                target: "Gateway/Events",
                "Session {}: dropping unmodeled event {}", conn.id(), e.name
            );
            Ok(())
        }
    }
}

async fn on_connected(conn: &SessionConnection) -> Result<(), GatewayError> {
    let shared = &conn.shared;
    shared.touch_activity();
    if shared.status() == SessionStatus::Disconnected {
        // a user disconnect won the race, the client will follow
        debug!(target: "Gateway/Events", "Session {}: connected event while disconnected, ignoring", conn.id());
        return Ok(());
    }
    if shared.loop_active() && !shared.client.is_logged_in() {
        debug!(target: "Gateway/Events", "Session {}: connected but not yet paired", conn.id());
        return Ok(());
    }
    shared.set_status(SessionStatus::Connected).await?;
    shared
        .persistence
        .set_connection_error(conn.id(), None)
        .await?;
    Ok(())
}

async fn on_disconnected(conn: &Arc<SessionConnection>) -> Result<(), GatewayError> {
    let shared = &conn.shared;
    let id = conn.id();
    if shared.take_expected_disconnect() {
        debug!(target: "Gateway/Events", "Session {id}: expected disconnect");
        return Ok(());
    }
    if shared.client.is_connected() {
        debug!(target: "Gateway/Events", "Session {id}: stale disconnect, client is connected again");
        return Ok(());
    }
    if shared.loop_active() {
        // the pairing loop sees the same failure through its channel
        debug!(target: "Gateway/Events", "Session {id}: disconnected while pairing");
        return Ok(());
    }

    warn!(target: "Gateway/Events", "Session {id} disconnected unexpectedly");
    let was = shared.status();
    shared.set_status(SessionStatus::Disconnected).await?;
    if was == SessionStatus::Connected && !conn.is_torn_down() {
        conn.schedule_reconnect();
    }
    Ok(())
}

async fn on_logged_out(
    conn: &Arc<SessionConnection>,
    event: &LoggedOut,
) -> Result<(), GatewayError> {
    let shared = &conn.shared;
    let reason = event.reason;
    warn!(
        target: "Gateway/Events",
        "Session {} logged out (on_connect: {}, reason: {})", conn.id(), event.on_connect, reason
    );
    let was = shared.status();
    let cleared = shared.clear_qr().await;
    // only a real logout invalidates the pairing, server trouble keeps it
    let forgotten = if reason.is_logged_out() {
        shared.forget_device().await
    } else {
        Ok(())
    };
    let status = shared.set_status(SessionStatus::Disconnected).await.map(|_| ());
    let recorded = shared
        .persistence
        .set_connection_error(conn.id(), Some(reason.to_string()))
        .await;
    if reason.should_reconnect() && was == SessionStatus::Connected && !conn.is_torn_down() {
        conn.schedule_reconnect();
    }
    cleared.and(forgotten).and(status).and(recorded)?;
    Ok(())
}

async fn on_qr(conn: &SessionConnection, event: &QrCodes) -> Result<(), GatewayError> {
    let shared = &conn.shared;
    let Some(first) = event.codes.first() else {
        return Ok(());
    };
    if shared.status() != SessionStatus::Connecting {
        debug!(target: "Gateway/Events", "Session {}: QR event outside pairing, ignoring", conn.id());
        return Ok(());
    }
    if shared.current_qr().is_some_and(|qr| &qr.code == first) {
        return Ok(());
    }
    let timeout = if event.timeout.is_zero() {
        DEFAULT_QR_TIMEOUT
    } else {
        event.timeout
    };
    shared.issue_qr(first.clone(), timeout).await?;
    Ok(())
}

async fn on_pair_success(conn: &SessionConnection, event: &PairSuccess) -> Result<(), GatewayError> {
    info!(
        target: "Gateway/Events",
        "Session {} paired with {} ({})", conn.id(), event.id, event.platform
    );
    let business_name = Some(event.business_name.clone()).filter(|n| !n.is_empty());
    conn.shared
        .record_device(event.id.clone(), Some(event.platform.clone()), business_name)
        .await?;
    Ok(())
}

async fn on_pair_error(conn: &SessionConnection, event: &PairError) -> Result<(), GatewayError> {
    let shared = &conn.shared;
    warn!(target: "Gateway/Events", "Session {}: pairing error: {}", conn.id(), event.error);
    let cleared = shared.clear_qr().await;
    let status = shared.set_status(SessionStatus::Disconnected).await.map(|_| ());
    let recorded = shared
        .persistence
        .set_connection_error(conn.id(), Some(event.error.clone()))
        .await;
    cleared.and(status).and(recorded)?;
    Ok(())
}

async fn on_message(conn: &SessionConnection, event: &MessageReceived) -> Result<(), GatewayError> {
    debug!(
        target: "Gateway/Events",
        "Session {}: message {} in {} from {}", conn.id(), event.id, event.chat, event.sender
    );
    conn.shared.record_message().await?;
    Ok(())
}

fn on_receipt(conn: &SessionConnection, event: &Receipt) {
    conn.shared.touch_activity();
    debug!(
        target: "Gateway/Events",
        "Session {}: {:?} receipt for {} message(s) in {}",
        conn.id(),
        event.receipt_type,
        event.message_ids.len(),
        event.chat
    );
}

fn on_presence(conn: &SessionConnection, event: &PresenceUpdate) {
    debug!(
        target: "Gateway/Events",
        "Session {}: {} is {}",
        conn.id(),
        event.from,
        if event.unavailable { "unavailable" } else { "available" }
    );
}

fn on_chat_presence(conn: &SessionConnection, event: &ChatPresenceUpdate) {
    debug!(
        target: "Gateway/Events",
        "Session {}: {} is {:?} ({:?}) in {}", conn.id(), event.sender, event.state, event.media, event.chat
    );
}

fn on_history_sync(conn: &SessionConnection, event: &HistorySyncSummary) {
    info!(
        target: "Gateway/Events",
        "Session {}: history sync {} with {} conversations ({} bytes)",
        conn.id(),
        event.sync_type,
        event.conversations,
        event.size_bytes
    );
}

async fn notify_subscribers(conn: &SessionConnection, event: &Event) {
    let id = conn.id();
    let timeout = conn.config().subscriber_timeout;
    for subscriber in conn.subscribers.snapshot() {
        let call = AssertUnwindSafe(subscriber.on_event(id, event)).catch_unwind();
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(())) => {}
            Ok(Err(panic)) => error!(
                target: "Gateway/Events",
                "Session {id}: subscriber panicked on {}: {}", event.kind(), panic_message(&*panic)
            ),
            Err(_) => warn!(
                target: "Gateway/Events",
                "Session {id}: subscriber timed out on {} after {timeout:?}", event.kind()
            ),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
