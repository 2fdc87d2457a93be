pub mod store;
pub mod types;

pub use types::events::{Event, EventHandler};
pub use types::session::{
    DeviceInfo, ListSessionsRequest, ProxyConfig, ProxyKind, QrCodeResponse, Session,
    SessionStats, SessionStatus,
};
