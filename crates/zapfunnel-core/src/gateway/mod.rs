pub mod port;
#[cfg(test)]
pub mod testkit;
pub mod types;

pub use port::GatewayPort;
pub use types::{MediaKind, Presence, SendIntent};
