//! Serializable snapshots of the core's state.
//!
//! Persistence cadence and storage medium are the binary's concern; the core
//! only defines the shapes and "snapshot now" / "restore from snapshot"
//! operations on each owning component, plus small JSON file helpers.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    contacts::CapturedContact,
    domain::{InstanceName, Jid},
    funnel::FunnelDefinition,
    store::Conversation,
    Result,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationsSnapshot {
    pub conversations: Vec<Conversation>,
    pub sticky: Vec<(Jid, InstanceName)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactsSnapshot {
    pub by_instance: HashMap<String, Vec<CapturedContact>>,
    pub last_update: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub date: String,
    #[serde(default)]
    pub first_messages: Vec<Jid>,
    #[serde(default)]
    pub total_events: u64,
}

/// Versioned funnel backup document, also used by the import/export API.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelExport {
    pub version: String,
    pub export_date: DateTime<Utc>,
    pub total_funnels: usize,
    pub funnels: Vec<FunnelDefinition>,
}

/// Read a JSON snapshot file; `Ok(None)` when it does not exist or is empty.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let txt = std::fs::read_to_string(path)?;
    if txt.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&txt)?))
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let txt = serde_json::to_string_pretty(value)?;
    std::fs::write(path, txt)?;
    Ok(())
}
