use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    domain::{InstanceName, Jid, OrderRef},
    snapshot::ConversationsSnapshot,
};

/// One customer conversation, keyed by canonical identity.
///
/// Created when a funnel starts for a key (overwriting any prior conversation
/// at that key), mutated only by the funnel engine, never physically deleted:
/// terminal states are retained for audit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub jid: Jid,
    pub funnel_id: String,
    pub step_index: usize,
    /// Transition counter, bumped on every start/advance. Part of the
    /// step-dispatch idempotency key so an intentional self-loop re-sends
    /// while duplicate dispatches of one transition dedupe.
    #[serde(default)]
    pub epoch: u64,
    pub waiting_for_response: bool,

    #[serde(default)]
    pub canceled: bool,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    #[serde(default)]
    pub canceled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_system_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_reply_at: Option<DateTime<Utc>>,

    // Business metadata, opaque to the state machine.
    pub order_ref: OrderRef,
    pub customer_name: String,
    pub product: String,
    pub amount: String,
}

impl Conversation {
    /// Exactly one of {active, completed, canceled} holds; active is the
    /// default.
    pub fn is_active(&self) -> bool {
        !self.canceled && !self.completed
    }
}

#[derive(Default)]
struct StoreState {
    conversations: HashMap<Jid, Conversation>,
    sticky: HashMap<Jid, InstanceName>,
}

/// Authoritative map of conversation key -> conversation state, plus the
/// sticky instance assignments that travel with each identity.
///
/// Mutations funnel through the engine; the dispatcher reads sticky
/// assignments and reporting reads everything.
pub struct ConversationStore {
    state: Mutex<StoreState>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
        }
    }

    pub async fn get(&self, jid: &Jid) -> Option<Conversation> {
        self.state.lock().await.conversations.get(jid).cloned()
    }

    pub async fn contains(&self, jid: &Jid) -> bool {
        self.state.lock().await.conversations.contains_key(jid)
    }

    /// Insert or overwrite the conversation at its key.
    pub async fn insert(&self, conversation: Conversation) {
        let mut st = self.state.lock().await;
        st.conversations
            .insert(conversation.jid.clone(), conversation);
    }

    /// Apply `mutate` to the conversation at `jid`, if present.
    pub async fn update(&self, jid: &Jid, mutate: impl FnOnce(&mut Conversation)) -> bool {
        let mut st = self.state.lock().await;
        match st.conversations.get_mut(jid) {
            Some(conv) => {
                mutate(conv);
                true
            }
            None => false,
        }
    }

    /// Move a conversation (and its sticky assignment, if any) from a variant
    /// key to the canonical key, so future lookups are exact matches.
    pub async fn migrate(&self, from: &Jid, to: &Jid) -> Option<Conversation> {
        let mut st = self.state.lock().await;
        let mut conv = st.conversations.remove(from)?;
        conv.jid = to.clone();
        st.conversations.insert(to.clone(), conv.clone());

        if let Some(instance) = st.sticky.remove(from) {
            st.sticky.insert(to.clone(), instance);
        }
        Some(conv)
    }

    pub async fn sticky(&self, jid: &Jid) -> Option<InstanceName> {
        self.state.lock().await.sticky.get(jid).cloned()
    }

    pub async fn set_sticky(&self, jid: &Jid, instance: InstanceName) {
        let mut st = self.state.lock().await;
        st.sticky.insert(jid.clone(), instance);
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.conversations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.conversations.is_empty()
    }

    /// All conversations, newest first (for reporting).
    pub async fn list(&self) -> Vec<Conversation> {
        let st = self.state.lock().await;
        let mut out: Vec<Conversation> = st.conversations.values().cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// How many identities are pinned to each instance (for reporting).
    pub async fn sticky_counts(&self) -> HashMap<InstanceName, usize> {
        let st = self.state.lock().await;
        let mut out: HashMap<InstanceName, usize> = HashMap::new();
        for instance in st.sticky.values() {
            *out.entry(instance.clone()).or_default() += 1;
        }
        out
    }

    pub async fn sticky_len(&self) -> usize {
        self.state.lock().await.sticky.len()
    }

    pub async fn snapshot(&self) -> ConversationsSnapshot {
        let st = self.state.lock().await;
        ConversationsSnapshot {
            conversations: st.conversations.values().cloned().collect(),
            sticky: st
                .sticky
                .iter()
                .map(|(jid, instance)| (jid.clone(), instance.clone()))
                .collect(),
        }
    }

    pub async fn restore(&self, snapshot: ConversationsSnapshot) {
        let mut st = self.state.lock().await;
        st.conversations.clear();
        for conv in snapshot.conversations {
            st.conversations.insert(conv.jid.clone(), conv);
        }
        st.sticky.clear();
        for (jid, instance) in snapshot.sticky {
            st.sticky.insert(jid, instance);
        }
    }
}

/// Test fixture shared by the store, identity, and engine tests.
#[cfg(test)]
pub(crate) fn test_conversation(jid: &str, funnel_id: &str) -> Conversation {
    Conversation {
        jid: Jid(jid.to_string()),
        funnel_id: funnel_id.to_string(),
        step_index: 0,
        epoch: 0,
        waiting_for_response: false,
        canceled: false,
        cancel_reason: None,
        canceled_at: None,
        completed: false,
        completed_at: None,
        created_at: Utc::now(),
        last_system_message_at: None,
        last_reply_at: None,
        order_ref: OrderRef("ORDER-1".to_string()),
        customer_name: "Ana".to_string(),
        product: "CS".to_string(),
        amount: "R$ 97,00".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(jid: &str, funnel_id: &str) -> Conversation {
        test_conversation(jid, funnel_id)
    }

    #[tokio::test]
    async fn insert_overwrites_prior_conversation_at_key() {
        let store = ConversationStore::new();
        store.insert(conversation("551199@s.whatsapp.net", "A")).await;
        store.insert(conversation("551199@s.whatsapp.net", "B")).await;

        assert_eq!(store.len().await, 1);
        let conv = store.get(&Jid("551199@s.whatsapp.net".to_string())).await;
        assert_eq!(conv.unwrap().funnel_id, "B");
    }

    #[tokio::test]
    async fn migrate_moves_conversation_and_sticky() {
        let store = ConversationStore::new();
        let old = Jid("1199@s.whatsapp.net".to_string());
        let new = Jid("5511999@s.whatsapp.net".to_string());

        store.insert(conversation(&old.0, "A")).await;
        store.set_sticky(&old, InstanceName("G01".to_string())).await;

        let moved = store.migrate(&old, &new).await.unwrap();
        assert_eq!(moved.jid, new);
        assert_eq!(store.len().await, 1);
        assert!(store.get(&old).await.is_none());
        assert_eq!(store.get(&new).await.unwrap().funnel_id, "A");
        assert_eq!(store.sticky(&old).await, None);
        assert_eq!(store.sticky(&new).await, Some(InstanceName("G01".to_string())));
    }

    #[tokio::test]
    async fn snapshot_roundtrip_preserves_state() {
        let store = ConversationStore::new();
        store.insert(conversation("a@s.whatsapp.net", "A")).await;
        store
            .set_sticky(&Jid("a@s.whatsapp.net".to_string()), InstanceName("G02".to_string()))
            .await;

        let snap = store.snapshot().await;
        let restored = ConversationStore::new();
        restored.restore(snap).await;

        assert_eq!(restored.len().await, 1);
        assert_eq!(
            restored.sticky(&Jid("a@s.whatsapp.net".to_string())).await,
            Some(InstanceName("G02".to_string()))
        );
    }
}
