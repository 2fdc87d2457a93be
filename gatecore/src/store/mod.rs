pub mod error;
pub mod traits;

pub use traits::{DeviceStore, DeviceStoreResolver, SessionRepository};
