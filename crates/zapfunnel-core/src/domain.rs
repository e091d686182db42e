use std::fmt;

use serde::{Deserialize, Serialize};

/// Suffix appended to a normalized phone to form the full conversation key.
pub const JID_SUFFIX: &str = "@s.whatsapp.net";

/// Canonical conversation key: normalized digits plus the identity-domain
/// suffix. The unit of correlation between inbound and outbound events.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(pub String);

impl Jid {
    /// The digits-only phone portion of the key.
    pub fn phone(&self) -> &str {
        self.0.strip_suffix(JID_SUFFIX).unwrap_or(&self.0)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of one gateway instance in the pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceName(pub String);

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order/sale reference supplied by the payment provider.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderRef(pub String);

impl fmt::Display for OrderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
