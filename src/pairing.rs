use crate::client::PairingEvent;
use crate::connection::SessionShared;
use crate::task::LoopSignals;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use gatecore::SessionStatus;
use log::{debug, error, info, warn};
use qrcode::QrCode;
use qrcode::render::{svg, unicode};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use qrcode::types::QrError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopControl {
    Continue,
    Finished,
}

/// Renders `code` as an SVG `data:` URI.
pub fn render_qr_image(code: &str) -> Result<String, QrError> {
    let qr = QrCode::new(code.as_bytes())?;
    let image = qr
        .render()
        .min_dimensions(256, 256)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#FFFFFF"))
        .build();
    Ok(format!(
        "data:image/svg+xml;base64,{}",
        BASE64_STANDARD.encode(image)
    ))
}

/// Renders `code` with half-block characters for an operator's terminal.
pub fn render_qr_terminal(code: &str) -> Result<String, QrError> {
    let qr = QrCode::new(code.as_bytes())?;
    Ok(qr
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

/// Drains the pairing channel until pairing completes, fails, or the loop is
/// stopped.
///
/// A stop or cancellation ends the loop without touching the session status;
/// whoever stopped it owns the status from then on. Every channel-driven end
/// clears the QR code and sets the final status itself.
pub(crate) async fn run_pairing_loop(
    shared: Arc<SessionShared>,
    mut rx: mpsc::Receiver<PairingEvent>,
    mut signals: LoopSignals,
) {
    let id = shared.id().to_string();
    let _active = scopeguard::guard(shared.clone(), |s| s.set_loop_active(false));
    debug!(target: "Gateway/Pairing", "Pairing loop started for session {id}");

    loop {
        let event = tokio::select! {
            biased;
            reason = signals.stopped() => {
                debug!(target: "Gateway/Pairing", "Pairing loop for session {id} stopped ({reason:?})");
                return;
            }
            event = rx.recv() => event,
        };

        let Some(event) = event else {
            warn!(target: "Gateway/Pairing", "Pairing channel for session {id} closed without a result");
            abandon_pairing(&shared, Some("pairing channel closed".into())).await;
            return;
        };

        let control = tokio::select! {
            biased;
            _ = signals.token().cancelled() => {
                debug!(target: "Gateway/Pairing", "Pairing loop for session {id} cancelled mid-event");
                return;
            }
            control = handle_pairing_event(&shared, event) => control,
        };
        if control == LoopControl::Finished {
            return;
        }
    }
}

async fn handle_pairing_event(shared: &SessionShared, event: PairingEvent) -> LoopControl {
    let id = shared.id();
    let terminal = event.is_terminal();
    match event {
        PairingEvent::Code { code, timeout } => {
            debug!(
                target: "Gateway/Pairing",
                "Session {id}: new QR code, valid for {}s", timeout.as_secs()
            );
            if let Err(e) = shared.issue_qr(code, timeout).await {
                warn!(target: "Gateway/Persistence", "Session {id}: failed to store QR code: {e}");
            }
        }
        PairingEvent::ScannedWithoutMultidevice => {
            warn!(
                target: "Gateway/Pairing",
                "Session {id}: QR scanned by a phone without multi-device enabled"
            );
        }
        PairingEvent::Success { device_id } => {
            info!(target: "Gateway/Pairing", "Session {id} paired as {device_id}");
            if let Err(e) = shared.record_device(device_id, None, None).await {
                warn!(target: "Gateway/Persistence", "Session {id}: failed to store device identity: {e}");
            }
            if let Err(e) = shared.clear_qr().await {
                warn!(target: "Gateway/Persistence", "Session {id}: failed to clear QR code: {e}");
            }
            shared.settle_status(SessionStatus::Connected).await;
            shared.touch_activity();
        }
        PairingEvent::Timeout => {
            info!(target: "Gateway/Pairing", "Session {id}: QR pairing timed out");
            abandon_pairing(shared, None).await;
        }
        PairingEvent::ClientOutdated => {
            error!(
                target: "Gateway/Pairing",
                "Session {id}: pairing rejected, client version is outdated"
            );
            abandon_pairing(shared, Some("client outdated".into())).await;
        }
        PairingEvent::Error(reason) => {
            warn!(target: "Gateway/Pairing", "Session {id}: pairing failed: {reason}");
            abandon_pairing(shared, Some(reason)).await;
        }
    }
    if terminal {
        LoopControl::Finished
    } else {
        LoopControl::Continue
    }
}

async fn abandon_pairing(shared: &SessionShared, reason: Option<String>) {
    let id = shared.id();
    if let Err(e) = shared.clear_qr().await {
        warn!(target: "Gateway/Persistence", "Session {id}: failed to clear QR code: {e}");
    }
    shared.settle_status(SessionStatus::Disconnected).await;
    if let Some(reason) = reason {
        if let Err(e) = shared
            .persistence
            .set_connection_error(id, Some(reason))
            .await
        {
            debug!(target: "Gateway/Persistence", "Session {id}: failed to record pairing error: {e}");
        }
    }
}
