use async_trait::async_trait;
use gatecore::store::DeviceStore;
use gatecore::{EventHandler, ProxyConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Items on the pairing channel of an unregistered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    Code { code: String, timeout: Duration },
    Success { device_id: String },
    Timeout,
    ScannedWithoutMultidevice,
    ClientOutdated,
    Error(String),
}

impl PairingEvent {
    /// The upstream closes the channel after any terminal event.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Code { .. } | Self::ScannedWithoutMultidevice)
    }
}

/// The protocol library as the gateway sees it. One instance per session,
/// owned by that session's connection controller.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn connect(&self) -> Result<(), anyhow::Error>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;
    fn is_logged_in(&self) -> bool;
    /// Invalidates the device credentials server-side.
    async fn logout(&self) -> Result<(), anyhow::Error>;
    /// Opens the single-consumer pairing stream. Must be called before
    /// `connect` on an unregistered device.
    async fn pairing_channel(&self) -> Result<mpsc::Receiver<PairingEvent>, anyhow::Error>;
    fn subscribe(&self, handler: Arc<dyn EventHandler>);
    /// Requests a phone-number pairing code for `phone` (digits only).
    async fn pair_phone(&self, phone: &str) -> Result<String, anyhow::Error>;
    async fn set_proxy(&self, proxy: Option<&ProxyConfig>) -> Result<(), anyhow::Error>;
}

#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create_client(
        &self,
        session_id: &str,
        device_store: Arc<dyn DeviceStore>,
    ) -> Result<Arc<dyn ProtocolClient>, anyhow::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_codes_and_soft_scan_failures_keep_pairing_open() {
        let code = PairingEvent::Code {
            code: "2@abc".into(),
            timeout: Duration::from_secs(20),
        };
        assert!(!code.is_terminal());
        assert!(!PairingEvent::ScannedWithoutMultidevice.is_terminal());

        for event in [
            PairingEvent::Success {
                device_id: "555@x".into(),
            },
            PairingEvent::Timeout,
            PairingEvent::ClientOutdated,
            PairingEvent::Error("boom".into()),
        ] {
            assert!(event.is_terminal(), "{event:?}");
        }
    }
}
