pub mod events;
pub mod presence;
pub mod session;
