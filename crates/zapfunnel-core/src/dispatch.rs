//! Delivery dispatcher: instance selection and multi-instance fallback.
//!
//! Every identity is pinned to the instance that last delivered to it
//! (sticky assignment); brand-new conversations are spread round-robin
//! across the pool instead of always starting from the same instance.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    domain::{InstanceName, Jid},
    errors::Error,
    gateway::{GatewayPort, Presence, SendIntent},
    stats::DailyStats,
    store::ConversationStore,
    Result,
};

#[derive(Clone, Debug)]
pub struct DeliveryOutcome {
    pub instance: InstanceName,
}

pub struct Dispatcher {
    pool: Vec<InstanceName>,
    gateway: Arc<dyn GatewayPort>,
    store: Arc<ConversationStore>,
    stats: Arc<DailyStats>,
    /// Pool index of the last instance that took a first message. The next
    /// new conversation starts one past it.
    cursor: Mutex<Option<usize>>,
}

impl Dispatcher {
    pub fn new(
        pool: Vec<InstanceName>,
        gateway: Arc<dyn GatewayPort>,
        store: Arc<ConversationStore>,
        stats: Arc<DailyStats>,
    ) -> Self {
        Self {
            pool,
            gateway,
            store,
            stats,
            cursor: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &[InstanceName] {
        &self.pool
    }

    /// Try each instance in order until one succeeds.
    ///
    /// Attempts are strictly sequential; the loop is bounded by the pool
    /// size. On success the sticky assignment is refreshed unconditionally,
    /// and a first-message success advances the rotation cursor and the daily
    /// counter.
    pub async fn deliver(
        &self,
        jid: &Jid,
        intent: &SendIntent,
        is_first_message: bool,
    ) -> Result<DeliveryOutcome> {
        if self.pool.is_empty() {
            return Err(Error::PoolExhausted("empty instance pool".to_string()));
        }

        let client_message_id = Uuid::new_v4().to_string();
        let sticky = self.store.sticky(jid).await;

        let candidates = match (&sticky, is_first_message) {
            (Some(sticky), false) => {
                // Pinned instance first, then the rest in fixed pool order.
                let mut out = vec![sticky.clone()];
                out.extend(self.pool.iter().filter(|i| *i != sticky).cloned());
                out
            }
            (_, true) => {
                let start = {
                    let cursor = self.cursor.lock().await;
                    cursor.map(|i| (i + 1) % self.pool.len()).unwrap_or(0)
                };
                let mut out = self.pool[start..].to_vec();
                out.extend_from_slice(&self.pool[..start]);
                out
            }
            (None, false) => self.pool.clone(),
        };

        let mut last_error: Option<Error> = None;
        for (attempt, instance) in candidates.iter().enumerate() {
            debug!(
                identity = %jid,
                instance = %instance,
                attempt = attempt + 1,
                message_id = %client_message_id,
                "delivery attempt"
            );

            match self.gateway.send(instance, jid, intent).await {
                Ok(()) => {
                    self.store.set_sticky(jid, instance.clone()).await;

                    if is_first_message {
                        if let Some(pos) = self.pool.iter().position(|i| i == instance) {
                            *self.cursor.lock().await = Some(pos);
                        }
                        self.stats.record_first_message(jid).await;
                    }

                    info!(
                        identity = %jid,
                        instance = %instance,
                        first_message = is_first_message,
                        message_id = %client_message_id,
                        "message delivered"
                    );
                    return Ok(DeliveryOutcome {
                        instance: instance.clone(),
                    });
                }
                Err(e) => {
                    warn!(
                        identity = %jid,
                        instance = %instance,
                        error = %e,
                        "instance failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        error!(identity = %jid, tried = candidates.len(), "all instances failed");
        Err(Error::PoolExhausted(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no instances attempted".to_string()),
        ))
    }

    /// Show the typing indicator for `duration` on the identity's sticky
    /// instance (or the first pool entry). Best-effort: failures are logged,
    /// never escalated.
    pub async fn typing(&self, jid: &Jid, duration: Duration) {
        let instance = match self.store.sticky(jid).await {
            Some(instance) => instance,
            None => match self.pool.first() {
                Some(instance) => instance.clone(),
                None => return,
            },
        };

        if let Err(e) = self
            .gateway
            .set_presence(&instance, jid, Presence::Composing)
            .await
        {
            warn!(identity = %jid, instance = %instance, error = %e, "typing indicator failed");
            return;
        }

        sleep(duration).await;

        if let Err(e) = self
            .gateway
            .set_presence(&instance, jid, Presence::Paused)
            .await
        {
            warn!(identity = %jid, instance = %instance, error = %e, "typing indicator reset failed");
        }
    }

    /// Instance that took the last first-message delivery (for reporting).
    pub async fn last_successful(&self) -> Option<InstanceName> {
        let cursor = self.cursor.lock().await;
        cursor.and_then(|i| self.pool.get(i).cloned())
    }

    /// Instance the next new conversation will start from (for reporting).
    pub async fn next_in_rotation(&self) -> Option<InstanceName> {
        let cursor = self.cursor.lock().await;
        let idx = cursor.map(|i| (i + 1) % self.pool.len()).unwrap_or(0);
        self.pool.get(idx).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testkit::FakeGateway;

    fn pool(names: &[&str]) -> Vec<InstanceName> {
        names.iter().map(|n| InstanceName(n.to_string())).collect()
    }

    fn jid(phone: &str) -> Jid {
        Jid(format!("{phone}@s.whatsapp.net"))
    }

    fn text() -> SendIntent {
        SendIntent::Text {
            text: "hi".to_string(),
        }
    }

    fn dispatcher(gateway: Arc<FakeGateway>) -> (Dispatcher, Arc<ConversationStore>) {
        let store = Arc::new(ConversationStore::new());
        let stats = Arc::new(DailyStats::new());
        let d = Dispatcher::new(
            pool(&["G01", "G02", "G03"]),
            gateway,
            store.clone(),
            stats,
        );
        (d, store)
    }

    #[tokio::test]
    async fn sticky_instance_is_tried_first_after_a_success() {
        let gateway = Arc::new(FakeGateway::new());
        let (d, store) = dispatcher(gateway.clone());
        let x = jid("5511999990000");

        d.deliver(&x, &text(), true).await.unwrap();
        assert_eq!(store.sticky(&x).await, Some(InstanceName("G01".to_string())));

        d.deliver(&x, &text(), false).await.unwrap();
        assert_eq!(gateway.instances_used(), vec!["G01", "G01"]);
    }

    #[tokio::test]
    async fn sticky_failure_falls_back_and_repins() {
        let gateway = Arc::new(FakeGateway::new());
        let (d, store) = dispatcher(gateway.clone());
        let x = jid("5511999990000");

        store.set_sticky(&x, InstanceName("G02".to_string())).await;
        gateway.fail_instance("G02");

        let outcome = d.deliver(&x, &text(), false).await.unwrap();
        assert_eq!(outcome.instance, InstanceName("G01".to_string()));
        assert_eq!(store.sticky(&x).await, Some(InstanceName("G01".to_string())));
    }

    #[tokio::test]
    async fn first_messages_rotate_across_the_pool() {
        let gateway = Arc::new(FakeGateway::new());
        let (d, _) = dispatcher(gateway.clone());

        for n in 0..4 {
            d.deliver(&jid(&format!("551199999000{n}")), &text(), true)
                .await
                .unwrap();
        }
        assert_eq!(gateway.instances_used(), vec!["G01", "G02", "G03", "G01"]);
    }

    #[tokio::test]
    async fn rotation_cursor_lands_on_the_instance_that_actually_succeeded() {
        let gateway = Arc::new(FakeGateway::new());
        let (d, _) = dispatcher(gateway.clone());
        gateway.fail_instance("G02");

        d.deliver(&jid("5511999990001"), &text(), true).await.unwrap(); // G01
        d.deliver(&jid("5511999990002"), &text(), true).await.unwrap(); // G02 fails -> G03

        assert_eq!(d.last_successful().await, Some(InstanceName("G03".to_string())));
        assert_eq!(d.next_in_rotation().await, Some(InstanceName("G01".to_string())));
    }

    #[tokio::test]
    async fn exhaustion_surfaces_last_error_and_sets_no_sticky() {
        let gateway = Arc::new(FakeGateway::new());
        let (d, store) = dispatcher(gateway.clone());
        for name in ["G01", "G02", "G03"] {
            gateway.fail_instance(name);
        }

        let x = jid("5511999990000");
        let err = d.deliver(&x, &text(), true).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)));
        assert_eq!(store.sticky(&x).await, None);
        assert_eq!(gateway.send_count(), 0);
    }

    #[tokio::test]
    async fn typing_uses_sticky_then_first_pool_entry() {
        let gateway = Arc::new(FakeGateway::new());
        let (d, store) = dispatcher(gateway.clone());
        let x = jid("5511999990000");

        d.typing(&x, Duration::from_millis(5)).await;
        store.set_sticky(&x, InstanceName("G03".to_string())).await;
        d.typing(&x, Duration::from_millis(5)).await;

        let presences = gateway.presences();
        assert_eq!(presences.len(), 4); // composing+paused, twice
        assert_eq!(presences[0].0, InstanceName("G01".to_string()));
        assert_eq!(presences[0].2, Presence::Composing);
        assert_eq!(presences[2].0, InstanceName("G03".to_string()));
        assert_eq!(presences[3].2, Presence::Paused);
    }
}
