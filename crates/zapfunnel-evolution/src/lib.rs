//! Evolution-style gateway adapter.
//!
//! Implements the core's gateway port over the HTTP API exposed by each
//! instance: `message/sendText`, `message/sendMedia`, `chat/sendPresence`,
//! authenticated with an `apikey` header and bounded by a per-call timeout.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use zapfunnel_core::{
    domain::{InstanceName, Jid},
    gateway::{GatewayPort, MediaKind, Presence, SendIntent},
    Error, Result,
};

#[derive(Clone, Debug)]
pub struct EvolutionClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl EvolutionClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client build");
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        }
    }

    async fn post(&self, endpoint: &str, instance: &InstanceName, payload: &Value) -> Result<()> {
        let url = format!("{}/{endpoint}/{instance}", self.base_url);
        debug!(url = %url, "gateway call");

        let resp = self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::Gateway {
                message: e.to_string(),
                status: e.status().map(|s| s.as_u16()),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Gateway {
                message: body.chars().take(300).collect(),
                status: Some(status.as_u16()),
            });
        }

        Ok(())
    }
}

/// Map an intent onto the instance endpoint and payload it is sent with.
fn payload_for(intent: &SendIntent, number: &str) -> (&'static str, Value) {
    match intent {
        SendIntent::Text { text } => (
            "message/sendText",
            json!({ "number": number, "text": text }),
        ),
        SendIntent::Media { kind, url, caption } => {
            let mediatype = match kind {
                MediaKind::Image => "image",
                MediaKind::Video => "video",
            };
            (
                "message/sendMedia",
                json!({
                    "number": number,
                    "mediatype": mediatype,
                    "media": url,
                    "caption": caption.clone().unwrap_or_default(),
                }),
            )
        }
        SendIntent::Audio { url } => (
            "message/sendMedia",
            json!({ "number": number, "mediatype": "audio", "media": url }),
        ),
    }
}

#[async_trait]
impl GatewayPort for EvolutionClient {
    async fn send(
        &self,
        instance: &InstanceName,
        recipient: &Jid,
        intent: &SendIntent,
    ) -> Result<()> {
        let (endpoint, payload) = payload_for(intent, recipient.phone());
        self.post(endpoint, instance, &payload).await
    }

    async fn set_presence(
        &self,
        instance: &InstanceName,
        recipient: &Jid,
        presence: Presence,
    ) -> Result<()> {
        let presence = match presence {
            Presence::Composing => "composing",
            Presence::Paused => "paused",
        };
        self.post(
            "chat/sendPresence",
            instance,
            &json!({ "number": recipient.phone(), "presence": presence }),
        )
        .await
    }
}
