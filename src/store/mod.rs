pub mod device_store;
pub mod memory;

pub use device_store::{MemoryDeviceStore, MemoryDeviceStoreResolver};
pub use gatecore::store::{DeviceStore, DeviceStoreResolver, SessionRepository};
pub use memory::MemorySessionRepository;
