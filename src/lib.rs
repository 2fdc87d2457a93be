pub use gatecore::{self, types};

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod manager;
pub mod pairing;
pub mod persistence;
pub mod service;
pub mod store;
pub mod task;

#[cfg(test)]
pub mod test_utils;

pub use client::{ClientFactory, PairingEvent, ProtocolClient};
pub use config::{GatewayConfig, ReconnectPolicy};
pub use connection::{SessionConnection, StatusChange};
pub use error::{ErrorBody, GatewayError, PersistenceError};
pub use events::{EventSubscriber, HandlerId};
pub use manager::SessionManager;
pub use service::{CreateSessionRequest, RestoreReport, SessionInfo, SessionList, SessionService};
