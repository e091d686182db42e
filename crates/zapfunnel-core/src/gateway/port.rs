use async_trait::async_trait;

use crate::{
    domain::{InstanceName, Jid},
    gateway::types::{Presence, SendIntent},
    Result,
};

/// Port for one pool of interchangeable messaging-gateway instances.
///
/// The Evolution-style HTTP adapter is the first implementation; a fake
/// in-memory one backs the tests. Errors are opaque at this layer (message
/// plus optional status code): the dispatcher treats every failure the same
/// way and moves on to the next instance.
#[async_trait]
pub trait GatewayPort: Send + Sync {
    /// Send a message through one named instance. Bounded by a per-call
    /// timeout inside the adapter.
    async fn send(
        &self,
        instance: &InstanceName,
        recipient: &Jid,
        intent: &SendIntent,
    ) -> Result<()>;

    /// Toggle the typing indicator for a recipient. Best-effort: callers log
    /// failures and never escalate them.
    async fn set_presence(
        &self,
        instance: &InstanceName,
        recipient: &Jid,
        presence: Presence,
    ) -> Result<()>;
}
