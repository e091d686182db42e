//! Inbound boundary events and their ingestion operations.
//!
//! The HTTP layer deserializes provider payloads into these shapes and hands
//! them to [`EventProcessor`]; everything after that point (idempotency,
//! classification, funnel selection, identity resolution) lives here.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    domain::OrderRef,
    engine::{AdvanceReason, FunnelEngine, StartContext},
    funnel::{FunnelCategory, FunnelRegistry},
    identity,
    idempotency::IdempotencyGuard,
    stats::DailyStats,
    store::ConversationStore,
    Result,
};

const UNKNOWN_PRODUCT: &str = "UNKNOWN";

// ---------- payment events ----------

/// Raw payment-provider webhook payload. Field mapping is tolerant: the
/// provider has shipped several spellings of the same information.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PaymentEvent {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub payment: Option<PaymentInfo>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub sale_id: Option<String>,
    #[serde(default)]
    pub checkout_id: Option<String>,
    #[serde(default)]
    pub customer: Option<CustomerInfo>,
    #[serde(default)]
    pub total_price: Option<String>,
    #[serde(default)]
    pub products: Vec<ProductInfo>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PaymentInfo {
    #[serde(default)]
    pub method: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CustomerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProductInfo {
    #[serde(default)]
    pub offer_id: Option<String>,
}

/// Success/payment-method classification of a payment event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaymentKind {
    Approved,
    PendingPix,
    Other,
}

impl PaymentEvent {
    pub fn kind(&self) -> PaymentKind {
        let event = self.event.to_uppercase();
        let status = self
            .status
            .as_deref()
            .or(self.payment_status.as_deref())
            .unwrap_or_default()
            .to_uppercase();
        let method = self
            .payment
            .as_ref()
            .and_then(|p| p.method.as_deref())
            .or(self.payment_method.as_deref())
            .unwrap_or_default()
            .to_uppercase();

        if event.contains("APPROVED") || event.contains("PAID") || status == "APPROVED" {
            PaymentKind::Approved
        } else if method.contains("PIX") || event.contains("PIX") {
            PaymentKind::PendingPix
        } else {
            PaymentKind::Other
        }
    }

    pub fn order_ref(&self) -> OrderRef {
        let id = self
            .sale_id
            .as_deref()
            .or(self.checkout_id.as_deref())
            .filter(|s| !s.trim().is_empty());
        match id {
            Some(id) => OrderRef(id.to_string()),
            None => OrderRef(format!("ORDER-{}", Uuid::new_v4())),
        }
    }

    pub fn customer_phone(&self) -> &str {
        self.customer
            .as_ref()
            .and_then(|c| c.phone_number.as_deref())
            .unwrap_or_default()
    }

    pub fn customer_name(&self) -> String {
        self.customer
            .as_ref()
            .and_then(|c| c.name.clone())
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "Customer".to_string())
    }

    pub fn amount(&self) -> String {
        self.total_price
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| "R$ 0,00".to_string())
    }

    /// Product tag for funnel selection; unknown offer ids map to `UNKNOWN`
    /// instead of being rejected.
    pub fn product_tag(&self, map: &std::collections::HashMap<String, String>) -> String {
        self.products
            .first()
            .and_then(|p| p.offer_id.as_deref())
            .and_then(|offer| map.get(offer))
            .cloned()
            .unwrap_or_else(|| UNKNOWN_PRODUCT.to_string())
    }
}

// ---------- reply events ----------

/// Raw gateway webhook payload for an inbound message.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ReplyEvent {
    #[serde(default)]
    pub data: Option<ReplyData>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ReplyData {
    #[serde(default)]
    pub key: Option<MessageKey>,
    #[serde(default)]
    pub message: Option<MessagePayload>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MessageKey {
    #[serde(rename = "remoteJid", default)]
    pub remote_jid: String,
    #[serde(rename = "fromMe", default)]
    pub from_me: bool,
}

/// The sub-shapes a gateway message can arrive in. Only the first non-empty
/// extracted text matters, in a fixed priority order.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub extended_text_message: Option<ExtendedTextMessage>,
    #[serde(default)]
    pub image_message: Option<MediaMessage>,
    #[serde(default)]
    pub video_message: Option<MediaMessage>,
    #[serde(default)]
    pub buttons_response_message: Option<ButtonsResponseMessage>,
    #[serde(default)]
    pub list_response_message: Option<ListResponseMessage>,
    #[serde(default)]
    pub template_button_reply_message: Option<TemplateButtonReplyMessage>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ExtendedTextMessage {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MediaMessage {
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonsResponseMessage {
    #[serde(default)]
    pub selected_display_text: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponseMessage {
    #[serde(default)]
    pub single_select_reply: Option<SingleSelectReply>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleSelectReply {
    #[serde(default)]
    pub selected_row_id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateButtonReplyMessage {
    #[serde(default)]
    pub selected_id: Option<String>,
}

impl MessagePayload {
    /// First non-empty text across the possible sub-shapes.
    pub fn extract_text(&self) -> String {
        let candidates = [
            self.conversation.as_deref(),
            self.extended_text_message
                .as_ref()
                .and_then(|m| m.text.as_deref()),
            self.image_message
                .as_ref()
                .and_then(|m| m.caption.as_deref()),
            self.video_message
                .as_ref()
                .and_then(|m| m.caption.as_deref()),
            self.buttons_response_message
                .as_ref()
                .and_then(|m| m.selected_display_text.as_deref()),
            self.list_response_message
                .as_ref()
                .and_then(|m| m.single_select_reply.as_ref())
                .and_then(|r| r.selected_row_id.as_deref()),
            self.template_button_reply_message
                .as_ref()
                .and_then(|m| m.selected_id.as_deref()),
        ];
        candidates
            .into_iter()
            .flatten()
            .find(|t| !t.trim().is_empty())
            .unwrap_or_default()
            .to_string()
    }
}

// ---------- ingestion ----------

/// What the boundary caller should report back upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Started { funnel_id: String },
    Advanced,
    Duplicate,
    Ignored(&'static str),
}

/// Applies idempotency, classification, and identity resolution to boundary
/// events and drives the funnel engine.
pub struct EventProcessor {
    cfg: Arc<Config>,
    engine: FunnelEngine,
    registry: Arc<FunnelRegistry>,
    store: Arc<ConversationStore>,
    guard: Arc<IdempotencyGuard>,
    stats: Arc<DailyStats>,
}

impl EventProcessor {
    pub fn new(
        cfg: Arc<Config>,
        engine: FunnelEngine,
        registry: Arc<FunnelRegistry>,
        store: Arc<ConversationStore>,
        guard: Arc<IdempotencyGuard>,
        stats: Arc<DailyStats>,
    ) -> Self {
        Self {
            cfg,
            engine,
            registry,
            store,
            guard,
            stats,
        }
    }

    /// Handle one payment-provider event. Duplicate deliveries are a
    /// successful no-op, never an error.
    pub async fn ingest_payment(&self, event: &PaymentEvent) -> Result<IngestOutcome> {
        let phone = event.customer_phone();
        if !phone.chars().any(|c| c.is_ascii_digit()) {
            warn!(event = %event.event, "payment event without customer phone");
            return Ok(IngestOutcome::Ignored("missing customer phone"));
        }

        let jid = identity::phone_to_jid(phone);
        let order = event.order_ref();
        let dedup_key = format!("payment:{}:{jid}:{order}", event.event.to_uppercase());
        if self.guard.seen(&dedup_key).await {
            info!(identity = %jid, order = %order, "duplicate payment event ignored");
            return Ok(IngestOutcome::Duplicate);
        }

        self.stats.record_event().await;

        let kind = event.kind();
        let product = event.product_tag(&self.cfg.product_map);
        info!(
            event = %event.event,
            identity = %jid,
            order = %order,
            product = %product,
            kind = ?kind,
            "payment event"
        );

        let category = match kind {
            PaymentKind::Approved => FunnelCategory::Approved,
            PaymentKind::PendingPix => FunnelCategory::Pending,
            PaymentKind::Other => return Ok(IngestOutcome::Ignored("unhandled event kind")),
        };

        if category == FunnelCategory::Approved {
            // Resolve variant-keyed history first so the engine's
            // pending-funnel cancellation sees it under the canonical key.
            let _ = identity::find_by_phone(&self.store, phone).await;
        }

        let Some(funnel) = self
            .registry
            .select(&product, category, &self.cfg.default_product)
            .await
        else {
            warn!(product = %product, category = ?category, "no funnel configured");
            return Ok(IngestOutcome::Ignored("no funnel configured"));
        };

        self.engine
            .start(
                &jid,
                &funnel.id,
                StartContext {
                    order_ref: order,
                    customer_name: event.customer_name(),
                    product,
                    amount: event.amount(),
                },
            )
            .await?;

        Ok(IngestOutcome::Started {
            funnel_id: funnel.id,
        })
    }

    /// Handle one inbound gateway message. Only replies to a conversation
    /// that is actively waiting advance the state machine.
    pub async fn ingest_reply(&self, event: &ReplyEvent) -> Result<IngestOutcome> {
        let Some(data) = &event.data else {
            return Ok(IngestOutcome::Ignored("no message data"));
        };
        let Some(key) = &data.key else {
            return Ok(IngestOutcome::Ignored("no message key"));
        };
        if key.from_me {
            debug!(remote = %key.remote_jid, "own message ignored");
            return Ok(IngestOutcome::Ignored("own message"));
        }
        if !key.remote_jid.chars().any(|c| c.is_ascii_digit()) {
            return Ok(IngestOutcome::Ignored("no remote identity"));
        }

        let text = data
            .message
            .as_ref()
            .map(MessagePayload::extract_text)
            .unwrap_or_default();

        let phone = key
            .remote_jid
            .strip_suffix(crate::domain::JID_SUFFIX)
            .unwrap_or(&key.remote_jid);

        let Some(conv) = identity::find_by_phone(&self.store, phone).await else {
            debug!(remote = %key.remote_jid, "reply without a conversation");
            return Ok(IngestOutcome::Ignored("no conversation"));
        };
        if !conv.waiting_for_response || conv.canceled {
            debug!(
                identity = %conv.jid,
                waiting = conv.waiting_for_response,
                canceled = conv.canceled,
                "reply outside a reply wait ignored"
            );
            return Ok(IngestOutcome::Ignored("conversation not waiting"));
        }

        let jid = identity::phone_to_jid(phone);
        let dedup_key = format!("reply:{jid}:{}:{}", conv.funnel_id, conv.step_index);
        if self.guard.seen(&dedup_key).await {
            info!(identity = %jid, step = conv.step_index, "duplicate reply ignored");
            return Ok(IngestOutcome::Duplicate);
        }

        info!(
            identity = %jid,
            funnel = %conv.funnel_id,
            step = conv.step_index,
            "client reply"
        );
        self.engine
            .advance(&jid, Some(&text), AdvanceReason::Reply)
            .await;
        Ok(IngestOutcome::Advanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::ContactBook;
    use crate::dispatch::Dispatcher;
    use crate::domain::InstanceName;
    use crate::funnel::builtin_funnels;
    use crate::gateway::testkit::FakeGateway;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            gateway_base_url: "http://localhost".to_string(),
            gateway_api_key: "key".to_string(),
            instances: vec![
                InstanceName("G01".to_string()),
                InstanceName("G02".to_string()),
            ],
            send_timeout: Duration::from_secs(1),
            pending_deadline: Duration::from_secs(600),
            idempotency_ttl: Duration::from_secs(60),
            default_product: "CS".to_string(),
            product_map: HashMap::from([
                ("offer-cs".to_string(), "CS".to_string()),
                ("offer-fab".to_string(), "FAB".to_string()),
            ]),
            data_dir: "/tmp".into(),
            snapshot_interval: Duration::from_secs(30),
            http_port: 0,
        })
    }

    struct Harness {
        processor: EventProcessor,
        gateway: Arc<FakeGateway>,
        store: Arc<ConversationStore>,
        stats: Arc<DailyStats>,
        registry: Arc<FunnelRegistry>,
    }

    async fn harness() -> Harness {
        let cfg = test_config();
        let registry = Arc::new(FunnelRegistry::new());
        for funnel in builtin_funnels() {
            registry.upsert(funnel).await.unwrap();
        }
        let gateway = Arc::new(FakeGateway::new());
        let store = Arc::new(ConversationStore::new());
        let stats = Arc::new(DailyStats::new());
        let dispatcher = Arc::new(Dispatcher::new(
            cfg.instances.clone(),
            gateway.clone(),
            store.clone(),
            stats.clone(),
        ));
        let guard = Arc::new(IdempotencyGuard::new(cfg.idempotency_ttl));
        let engine = FunnelEngine::new(
            cfg.clone(),
            registry.clone(),
            store.clone(),
            dispatcher,
            guard.clone(),
            Arc::new(ContactBook::new()),
        );
        let processor = EventProcessor::new(
            cfg,
            engine,
            registry.clone(),
            store.clone(),
            guard,
            stats.clone(),
        );
        Harness {
            processor,
            gateway,
            store,
            stats,
            registry,
        }
    }

    fn pix_event(phone: &str, order: &str) -> PaymentEvent {
        serde_json::from_value(json!({
            "event": "PIX_GENERATED",
            "payment": { "method": "PIX" },
            "sale_id": order,
            "customer": { "name": "Ana", "phone_number": phone },
            "total_price": "R$ 97,00",
            "products": [{ "offer_id": "offer-cs" }]
        }))
        .unwrap()
    }

    fn approved_event(phone: &str, order: &str) -> PaymentEvent {
        serde_json::from_value(json!({
            "event": "SALE_APPROVED",
            "status": "APPROVED",
            "sale_id": order,
            "customer": { "name": "Ana", "phone_number": phone },
            "total_price": "R$ 97,00",
            "products": [{ "offer_id": "offer-cs" }]
        }))
        .unwrap()
    }

    fn reply_event(remote_jid: &str, text: &str) -> ReplyEvent {
        serde_json::from_value(json!({
            "data": {
                "key": { "remoteJid": remote_jid, "fromMe": false },
                "message": { "conversation": text }
            }
        }))
        .unwrap()
    }

    #[test]
    fn classification_covers_approved_pix_and_other() {
        assert_eq!(approved_event("75981734444", "S1").kind(), PaymentKind::Approved);
        assert_eq!(pix_event("75981734444", "S1").kind(), PaymentKind::PendingPix);

        let other: PaymentEvent =
            serde_json::from_value(json!({ "event": "SALE_REFUSED" })).unwrap();
        assert_eq!(other.kind(), PaymentKind::Other);
    }

    #[test]
    fn extract_text_follows_priority_order() {
        let payload: MessagePayload = serde_json::from_value(json!({
            "conversation": "plain",
            "imageMessage": { "caption": "caption" }
        }))
        .unwrap();
        assert_eq!(payload.extract_text(), "plain");

        let payload: MessagePayload = serde_json::from_value(json!({
            "conversation": "  ",
            "imageMessage": { "caption": "caption" }
        }))
        .unwrap();
        assert_eq!(payload.extract_text(), "caption");

        let payload: MessagePayload = serde_json::from_value(json!({
            "listResponseMessage": { "singleSelectReply": { "selectedRowId": "row-2" } }
        }))
        .unwrap();
        assert_eq!(payload.extract_text(), "row-2");

        let payload: MessagePayload = serde_json::from_value(json!({})).unwrap();
        assert_eq!(payload.extract_text(), "");
    }

    #[tokio::test]
    async fn pix_event_starts_the_pending_funnel() {
        let h = harness().await;
        let outcome = h.processor.ingest_payment(&pix_event("75981734444", "S1")).await.unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Started {
                funnel_id: "CS_PIX".to_string()
            }
        );
        assert_eq!(h.gateway.send_count(), 1);
        assert_eq!(h.stats.counters().await.total_events, 1);
    }

    #[tokio::test]
    async fn duplicate_payment_event_is_a_no_op() {
        let h = harness().await;
        let event = pix_event("75981734444", "S1");
        h.processor.ingest_payment(&event).await.unwrap();
        let outcome = h.processor.ingest_payment(&event).await.unwrap();

        assert_eq!(outcome, IngestOutcome::Duplicate);
        assert_eq!(h.gateway.send_count(), 1);
        assert_eq!(h.stats.counters().await.total_events, 1);
    }

    #[tokio::test]
    async fn approved_event_cancels_the_pending_funnel_and_starts_approved() {
        let h = harness().await;
        h.processor.ingest_payment(&pix_event("75981734444", "S1")).await.unwrap();

        let outcome = h
            .processor
            .ingest_payment(&approved_event("75981734444", "S2"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Started {
                funnel_id: "CS_APROVADA".to_string()
            }
        );

        let jid = identity::phone_to_jid("75981734444");
        let conv = h.store.get(&jid).await.unwrap();
        assert_eq!(conv.funnel_id, "CS_APROVADA");
        assert!(conv.is_active());
        assert_eq!(h.gateway.send_count(), 2);
    }

    #[tokio::test]
    async fn unknown_product_falls_back_to_the_default_funnel() {
        let h = harness().await;
        let event: PaymentEvent = serde_json::from_value(json!({
            "event": "PIX_GENERATED",
            "payment": { "method": "PIX" },
            "sale_id": "S9",
            "customer": { "name": "Bia", "phone_number": "11987654321" },
            "products": [{ "offer_id": "never-seen" }]
        }))
        .unwrap();

        let outcome = h.processor.ingest_payment(&event).await.unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Started {
                funnel_id: "CS_PIX".to_string()
            }
        );
        let jid = identity::phone_to_jid("11987654321");
        assert_eq!(h.store.get(&jid).await.unwrap().product, "UNKNOWN");
    }

    #[tokio::test]
    async fn payment_event_without_phone_is_ignored() {
        let h = harness().await;
        let event: PaymentEvent = serde_json::from_value(json!({
            "event": "SALE_APPROVED",
            "status": "APPROVED"
        }))
        .unwrap();
        let outcome = h.processor.ingest_payment(&event).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Ignored("missing customer phone"));
        assert_eq!(h.gateway.send_count(), 0);
    }

    #[tokio::test]
    async fn own_messages_never_advance_conversations() {
        let h = harness().await;
        h.processor.ingest_payment(&pix_event("75981734444", "S1")).await.unwrap();

        let mut event = reply_event("5575981734444@s.whatsapp.net", "hi");
        event.data.as_mut().unwrap().key.as_mut().unwrap().from_me = true;

        let outcome = h.processor.ingest_reply(&event).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Ignored("own message"));
        assert_eq!(h.gateway.send_count(), 1);
    }

    #[tokio::test]
    async fn reply_advances_a_waiting_conversation() {
        let h = harness().await;
        h.processor.ingest_payment(&pix_event("75981734444", "S1")).await.unwrap();

        let outcome = h
            .processor
            .ingest_reply(&reply_event("5575981734444@s.whatsapp.net", "paid already"))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Advanced);

        let jid = identity::phone_to_jid("75981734444");
        let conv = h.store.get(&jid).await.unwrap();
        assert_eq!(conv.step_index, 1); // CS_PIX step 0 -> nextOnReply 1
        assert_eq!(h.gateway.send_count(), 2);
    }

    #[tokio::test]
    async fn duplicate_reply_at_the_same_step_is_swallowed() {
        let h = harness().await;
        // Turn the pending funnel's first step into a repeating prompt so the
        // conversation stays at the same index across replies.
        let mut looped = h.registry.get("CS_PIX").await.unwrap();
        looped.steps[0].next_on_reply = Some(0);
        h.registry.upsert(looped).await.unwrap();

        h.processor.ingest_payment(&pix_event("75981734444", "S1")).await.unwrap();

        let first = h
            .processor
            .ingest_reply(&reply_event("5575981734444@s.whatsapp.net", "yes"))
            .await
            .unwrap();
        let second = h
            .processor
            .ingest_reply(&reply_event("5575981734444@s.whatsapp.net", "yes"))
            .await
            .unwrap();

        assert_eq!(first, IngestOutcome::Advanced);
        assert_eq!(second, IngestOutcome::Duplicate);
        // The first reply re-sent the prompt, the duplicate did not.
        assert_eq!(h.gateway.send_count(), 2);
    }

    #[tokio::test]
    async fn reply_under_a_variant_spelling_finds_and_migrates_the_conversation() {
        let h = harness().await;
        // Conversation created from a provider phone without the mobile prefix.
        h.processor.ingest_payment(&pix_event("75981734444", "S1")).await.unwrap();
        let canonical = identity::phone_to_jid("75981734444");

        // Force the stored key into a historical variant spelling.
        let variant = crate::domain::Jid("557581734444@s.whatsapp.net".to_string());
        let conv = h.store.get(&canonical).await.unwrap();
        h.store.migrate(&conv.jid, &variant).await.unwrap();

        let outcome = h
            .processor
            .ingest_reply(&reply_event("5575981734444@s.whatsapp.net", "hello"))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Advanced);

        // Back under the canonical key, exactly once.
        assert_eq!(h.store.len().await, 1);
        assert!(h.store.get(&canonical).await.is_some());
        assert!(h.store.get(&variant).await.is_none());
    }

    #[tokio::test]
    async fn reply_without_conversation_is_ignored() {
        let h = harness().await;
        let outcome = h
            .processor
            .ingest_reply(&reply_event("5511999990000@s.whatsapp.net", "hi"))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Ignored("no conversation"));
    }
}
