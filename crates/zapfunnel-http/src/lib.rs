//! HTTP surface: webhooks in, reports out.
//!
//! A thin adapter over the core's operations: request parsing and response
//! shaping only, no business rules.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use zapfunnel_core::{
    config::Config,
    contacts::ContactBook,
    dispatch::Dispatcher,
    domain::InstanceName,
    engine::FunnelEngine,
    events::{EventProcessor, IngestOutcome, PaymentEvent, ReplyEvent},
    funnel::{FunnelDefinition, FunnelRegistry, Step, StepKind},
    identity,
    snapshot::FunnelExport,
    stats::DailyStats,
    store::ConversationStore,
    Error,
};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub processor: Arc<EventProcessor>,
    pub engine: FunnelEngine,
    pub registry: Arc<FunnelRegistry>,
    pub store: Arc<ConversationStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub stats: Arc<DailyStats>,
    pub contacts: Arc<ContactBook>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/payment", post(payment_webhook))
        .route("/webhook/gateway", post(gateway_webhook))
        .route("/api/dashboard", get(dashboard))
        .route("/api/conversations", get(conversations))
        .route("/api/funnels", get(list_funnels).post(upsert_funnel))
        .route("/api/funnels/export", get(export_funnels))
        .route("/api/funnels/import", post(import_funnels))
        .route("/api/funnels/{id}", delete(delete_funnel))
        .route("/api/contacts", get(contacts).delete(clear_contacts))
        .route("/api/contacts/export", get(export_contacts))
        .route("/api/send-test", post(send_test))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> zapfunnel_core::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http surface listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": e.to_string() })),
    )
}

async fn payment_webhook(
    State(state): State<AppState>,
    Json(event): Json<PaymentEvent>,
) -> impl IntoResponse {
    match state.processor.ingest_payment(&event).await {
        Ok(IngestOutcome::Started { funnel_id }) => (
            StatusCode::OK,
            Json(json!({ "success": true, "message": "processed", "funnelId": funnel_id })),
        ),
        Ok(IngestOutcome::Duplicate) => (
            StatusCode::OK,
            Json(json!({ "success": true, "message": "duplicate event ignored" })),
        ),
        Ok(other) => (
            StatusCode::OK,
            Json(json!({ "success": false, "message": outcome_label(&other) })),
        ),
        Err(e) => internal_error(e),
    }
}

async fn gateway_webhook(
    State(state): State<AppState>,
    Json(event): Json<ReplyEvent>,
) -> impl IntoResponse {
    match state.processor.ingest_reply(&event).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({ "success": true, "message": outcome_label(&outcome) })),
        ),
        Err(e) => internal_error(e),
    }
}

fn outcome_label(outcome: &IngestOutcome) -> String {
    match outcome {
        IngestOutcome::Started { funnel_id } => format!("started {funnel_id}"),
        IngestOutcome::Advanced => "reply processed".to_string(),
        IngestOutcome::Duplicate => "duplicate ignored".to_string(),
        IngestOutcome::Ignored(reason) => (*reason).to_string(),
    }
}

async fn dashboard(State(state): State<AppState>) -> impl IntoResponse {
    let sticky_counts = state.store.sticky_counts().await;
    let mut distribution: HashMap<String, usize> = state
        .dispatcher
        .pool()
        .iter()
        .map(|i| (i.0.clone(), 0))
        .collect();
    for (instance, count) in sticky_counts {
        distribution.insert(instance.0, count);
    }

    let counters = state.stats.counters().await;
    let data = json!({
        "active_conversations": state.store.len().await,
        "pending_deadlines": state.engine.pending_deadlines().await,
        "total_funnels": state.registry.len().await,
        "total_instances": state.dispatcher.pool().len(),
        "sticky_instances": state.store.sticky_len().await,
        "last_successful_instance": state.dispatcher.last_successful().await.map(|i| i.0),
        "next_instance_in_queue": state.dispatcher.next_in_rotation().await.map(|i| i.0),
        "instance_distribution": distribution,
        "daily_first_messages": counters.first_messages,
        "daily_total_events": counters.total_events,
        "today_date": counters.date,
        "captured_contacts": state.contacts.total().await,
    });

    Json(json!({
        "success": true,
        "data": data,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn conversations(State(state): State<AppState>) -> impl IntoResponse {
    let mut out = Vec::new();
    for conv in state.store.list().await {
        let sticky = state.store.sticky(&conv.jid).await.map(|i| i.0);
        out.push(json!({
            "id": conv.jid.0,
            "phone": conv.jid.phone(),
            "customerName": conv.customer_name,
            "product": conv.product,
            "funnelId": conv.funnel_id,
            "stepIndex": conv.step_index,
            "waitingForResponse": conv.waiting_for_response,
            "createdAt": conv.created_at,
            "lastSystemMessageAt": conv.last_system_message_at,
            "lastReplyAt": conv.last_reply_at,
            "orderRef": conv.order_ref.0,
            "amount": conv.amount,
            "stickyInstance": sticky,
            "canceled": conv.canceled,
            "completed": conv.completed,
        }));
    }
    Json(json!({ "success": true, "data": out }))
}

async fn list_funnels(State(state): State<AppState>) -> impl IntoResponse {
    let out: Vec<Value> = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|f| {
            let step_count = f.steps.len();
            let built_in = f.built_in;
            let mut v = serde_json::to_value(f).unwrap_or_default();
            v["stepCount"] = json!(step_count);
            v["isDefault"] = json!(built_in);
            v
        })
        .collect();
    Json(json!({ "success": true, "data": out }))
}

async fn upsert_funnel(
    State(state): State<AppState>,
    Json(funnel): Json<FunnelDefinition>,
) -> impl IntoResponse {
    match state.registry.upsert(funnel.clone()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "success": true, "message": "funnel saved", "data": funnel })),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": e.to_string() })),
        ),
    }
}

async fn delete_funnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.registry.delete(&id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "success": true, "message": "funnel deleted" })),
        ),
        Err(e @ Error::UnknownFunnel(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": e.to_string() })),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": e.to_string() })),
        ),
    }
}

async fn export_funnels(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.export().await)
}

async fn import_funnels(
    State(state): State<AppState>,
    Json(doc): Json<FunnelExport>,
) -> impl IntoResponse {
    let total = doc.funnels.len();
    let (imported, skipped) = state.registry.import(doc).await;
    Json(json!({
        "success": true,
        "imported": imported,
        "skipped": skipped,
        "total": total,
    }))
}

async fn contacts(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let filter = params.get("instance").cloned().map(InstanceName);
    let by_instance = state.contacts.by_instance(filter.as_ref()).await;
    let total: usize = by_instance.values().map(Vec::len).sum();
    let data: HashMap<String, Value> = by_instance
        .into_iter()
        .map(|(k, v)| (k.0, serde_json::to_value(v).unwrap_or_default()))
        .collect();
    Json(json!({ "success": true, "data": data, "total": total }))
}

async fn clear_contacts(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let filter = params.get("instance").cloned().map(InstanceName);
    state.contacts.clear(filter.as_ref()).await;
    Json(json!({ "success": true, "message": "contacts cleared" }))
}

async fn export_contacts(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let format = params.get("format").map(String::as_str).unwrap_or("google");
    let result = match format {
        "google" => state.contacts.phonebook_csv().await,
        "detailed" => state.contacts.detailed_csv().await,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": "invalid format" })),
            )
                .into_response()
        }
    };

    match result {
        Ok(body) => {
            let filename = format!("contacts-{format}-{}.csv", Utc::now().format("%Y-%m-%d"));
            (
                [
                    (
                        header::CONTENT_TYPE,
                        "text/csv; charset=utf-8".to_string(),
                    ),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{filename}\""),
                    ),
                ],
                body,
            )
                .into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendTestRequest {
    phone: String,
    #[serde(rename = "type", default = "default_test_kind")]
    kind: StepKind,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    media_url: Option<String>,
}

fn default_test_kind() -> StepKind {
    StepKind::Text
}

/// One-off operator send through the normal dispatcher (sticky + fallback).
async fn send_test(
    State(state): State<AppState>,
    Json(req): Json<SendTestRequest>,
) -> impl IntoResponse {
    let step = Step {
        id: "send-test".to_string(),
        kind: req.kind,
        text: req.text,
        media_url: req.media_url,
        wait_for_reply: false,
        timeout_minutes: None,
        next_on_reply: None,
        next_on_timeout: None,
        capture_contact: false,
        delay_before: None,
        show_typing: false,
        delay_seconds: None,
        typing_seconds: None,
    };
    let Some(intent) = step.intent() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "type must be sendable" })),
        );
    };

    let jid = identity::phone_to_jid(&req.phone);
    match state.dispatcher.deliver(&jid, &intent, false).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "message sent",
                "instanceUsed": outcome.instance.0,
            })),
        ),
        Err(e) => internal_error(e),
    }
}
