use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    errors::Error,
    gateway::types::{MediaKind, SendIntent},
    snapshot::FunnelExport,
    Result,
};

/// Business scenario of a funnel, checked structurally (never by sniffing the
/// identifier).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunnelCategory {
    Approved,
    Pending,
    Other,
}

/// What one step does on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "image+text")]
    ImageText,
    #[serde(rename = "video")]
    Video,
    #[serde(rename = "video+text")]
    VideoText,
    #[serde(rename = "audio")]
    Audio,
    #[serde(rename = "delay")]
    Delay,
    #[serde(rename = "typing")]
    Typing,
}

impl StepKind {
    /// Delay/typing steps are local waits; everything else reaches the
    /// gateway.
    pub fn is_wire(self) -> bool {
        !matches!(self, StepKind::Delay | StepKind::Typing)
    }
}

/// One unit of funnel behavior: a message to send (or a pure delay/typing
/// action) plus the rules for what happens on reply or timeout.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,

    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,

    #[serde(default)]
    pub wait_for_reply: bool,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    /// Target index on reply/timeout; absent falls back to `index + 1`.
    /// Pointing back at the current index is a legal repeating prompt.
    #[serde(default)]
    pub next_on_reply: Option<usize>,
    #[serde(default)]
    pub next_on_timeout: Option<usize>,

    #[serde(default)]
    pub capture_contact: bool,

    #[serde(default)]
    pub delay_before: Option<u64>,
    #[serde(default)]
    pub show_typing: bool,
    #[serde(default)]
    pub delay_seconds: Option<u64>,
    #[serde(default)]
    pub typing_seconds: Option<u64>,
}

impl Step {
    /// Wire-level intent for this step, `None` for delay/typing kinds.
    pub fn intent(&self) -> Option<SendIntent> {
        let text = self.text.clone().unwrap_or_default();
        let url = self.media_url.clone().unwrap_or_default();
        match self.kind {
            StepKind::Text => Some(SendIntent::Text { text }),
            StepKind::Image => Some(SendIntent::Media {
                kind: MediaKind::Image,
                url,
                caption: None,
            }),
            StepKind::ImageText => Some(SendIntent::Media {
                kind: MediaKind::Image,
                url,
                caption: Some(text),
            }),
            StepKind::Video => Some(SendIntent::Media {
                kind: MediaKind::Video,
                url,
                caption: None,
            }),
            StepKind::VideoText => Some(SendIntent::Media {
                kind: MediaKind::Video,
                url,
                caption: Some(text),
            }),
            StepKind::Audio => Some(SendIntent::Audio { url }),
            StepKind::Delay | StepKind::Typing => None,
        }
    }
}

/// An ordered, named sequence of message steps for one business scenario.
///
/// Immutable once loaded except through explicit replace/delete; built-in
/// definitions cannot be deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelDefinition {
    pub id: String,
    pub name: String,
    pub category: FunnelCategory,
    /// Product tag this funnel serves; `None` matches any product.
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub built_in: bool,
    pub steps: Vec<Step>,
}

impl FunnelDefinition {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() || self.name.trim().is_empty() {
            return Err(Error::InvalidFunnel(
                "id and name are required".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(Error::InvalidFunnel(format!(
                "funnel {} has no steps",
                self.id
            )));
        }
        for (idx, step) in self.steps.iter().enumerate() {
            for target in [step.next_on_reply, step.next_on_timeout].into_iter().flatten() {
                if target >= self.steps.len() {
                    return Err(Error::InvalidFunnel(format!(
                        "funnel {} step {idx} targets out-of-range index {target}",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Index of the last step, where a pending-funnel deadline jumps to.
    pub fn terminal_step(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }
}

/// In-memory catalog of funnel definitions.
pub struct FunnelRegistry {
    funnels: Mutex<HashMap<String, FunnelDefinition>>,
}

impl FunnelRegistry {
    pub fn new() -> Self {
        Self {
            funnels: Mutex::new(HashMap::new()),
        }
    }

    /// Registry pre-populated with the built-in catalog.
    pub fn with_builtins() -> Self {
        let mut map = HashMap::new();
        for funnel in builtin_funnels() {
            map.insert(funnel.id.clone(), funnel);
        }
        Self {
            funnels: Mutex::new(map),
        }
    }

    pub async fn get(&self, id: &str) -> Option<FunnelDefinition> {
        self.funnels.lock().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<FunnelDefinition> {
        let map = self.funnels.lock().await;
        let mut out: Vec<FunnelDefinition> = map.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Insert or replace a definition. Replacing a built-in keeps its
    /// built-in flag so it stays protected from deletion.
    pub async fn upsert(&self, mut funnel: FunnelDefinition) -> Result<()> {
        funnel.validate()?;
        let mut map = self.funnels.lock().await;
        if let Some(existing) = map.get(&funnel.id) {
            funnel.built_in = funnel.built_in || existing.built_in;
        }
        info!(funnel = %funnel.id, steps = funnel.steps.len(), "funnel saved");
        map.insert(funnel.id.clone(), funnel);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut map = self.funnels.lock().await;
        match map.get(id) {
            None => Err(Error::UnknownFunnel(id.to_string())),
            Some(funnel) if funnel.built_in => Err(Error::InvalidFunnel(format!(
                "built-in funnel {id} cannot be deleted"
            ))),
            Some(_) => {
                map.remove(id);
                info!(funnel = %id, "funnel deleted");
                Ok(())
            }
        }
    }

    /// Pick the funnel for a (product tag, category) pair. Falls back to the
    /// default product when the event's product has no funnel of its own.
    pub async fn select(
        &self,
        product: &str,
        category: FunnelCategory,
        default_product: &str,
    ) -> Option<FunnelDefinition> {
        let map = self.funnels.lock().await;
        let matching = |tag: &str| {
            let mut candidates: Vec<&FunnelDefinition> = map
                .values()
                .filter(|f| f.category == category)
                .filter(|f| f.product.as_deref() == Some(tag) || f.product.is_none())
                .collect();
            candidates.sort_by(|a, b| {
                // Product-tagged definitions win over wildcard ones.
                b.product.is_some().cmp(&a.product.is_some()).then(a.id.cmp(&b.id))
            });
            candidates.first().map(|f| (*f).clone())
        };

        matching(product).or_else(|| matching(default_product))
    }

    pub async fn len(&self) -> usize {
        self.funnels.lock().await.len()
    }

    pub async fn export(&self) -> FunnelExport {
        let funnels = self.list().await;
        FunnelExport {
            version: "2.0".to_string(),
            export_date: Utc::now(),
            total_funnels: funnels.len(),
            funnels,
        }
    }

    /// Import definitions from an export document. Invalid entries are
    /// skipped, not fatal. Returns `(imported, skipped)`.
    pub async fn import(&self, doc: FunnelExport) -> (usize, usize) {
        let mut imported = 0;
        let mut skipped = 0;
        for funnel in doc.funnels {
            let id = funnel.id.clone();
            match self.upsert(funnel).await {
                Ok(()) => imported += 1,
                Err(e) => {
                    warn!(funnel = %id, error = %e, "skipping invalid funnel on import");
                    skipped += 1;
                }
            }
        }
        (imported, skipped)
    }
}

impl Default for FunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn text_step(
    id: &str,
    text: &str,
    wait_for_reply: bool,
    timeout_minutes: Option<u32>,
    next_on_reply: Option<usize>,
    next_on_timeout: Option<usize>,
    capture_contact: bool,
) -> Step {
    Step {
        id: id.to_string(),
        kind: StepKind::Text,
        text: Some(text.to_string()),
        media_url: None,
        wait_for_reply,
        timeout_minutes,
        next_on_reply,
        next_on_timeout,
        capture_contact,
        delay_before: None,
        show_typing: false,
        delay_seconds: None,
        typing_seconds: None,
    }
}

/// The four built-in funnels: an approved and a pending scenario for each of
/// the two stock products.
pub fn builtin_funnels() -> Vec<FunnelDefinition> {
    let approved = |id: &str, product: &str, opening: &str, follow_up: &str, closing: &str| {
        FunnelDefinition {
            id: id.to_string(),
            name: format!("{product} - Purchase approved"),
            category: FunnelCategory::Approved,
            product: Some(product.to_string()),
            built_in: true,
            steps: vec![
                text_step("step_1", opening, true, Some(60), Some(1), Some(2), false),
                text_step("step_2", follow_up, true, Some(30), Some(2), Some(2), true),
                text_step("step_3", closing, false, None, None, None, false),
            ],
        }
    };
    let pending = |id: &str, product: &str, opening: &str, follow_up: &str, closing: &str| {
        FunnelDefinition {
            id: id.to_string(),
            name: format!("{product} - Payment pending"),
            category: FunnelCategory::Pending,
            product: Some(product.to_string()),
            built_in: true,
            steps: vec![
                text_step("step_1", opening, true, Some(10), Some(1), Some(2), false),
                text_step("step_2", follow_up, true, Some(15), Some(2), Some(2), true),
                text_step("step_3", closing, false, None, None, None, false),
            ],
        }
    };

    vec![
        approved(
            "CS_APROVADA",
            "CS",
            "Congratulations! Your order is approved. Welcome to CS!",
            "Thanks for the reply! Did the course access arrive in your inbox?",
            "Perfect! Remember to log into the platform. We are here if you need anything.",
        ),
        pending(
            "CS_PIX",
            "CS",
            "Your PIX code is ready! We are waiting for the payment to unlock your CS access.",
            "Thanks for reaching out! Are you having trouble with the payment?",
            "Your PIX code expired. Contact us to generate a new one.",
        ),
        approved(
            "FAB_APROVADA",
            "FAB",
            "Congratulations! Your FAB order is approved. Get ready!",
            "Great to hear from you! Have you opened the FAB members area yet?",
            "Open the members area and start today!",
        ),
        pending(
            "FAB_PIX",
            "FAB",
            "Your FAB PIX code is ready! We are waiting for the payment to get you started.",
            "Thanks for reaching out! Any questions about the payment?",
            "Your PIX code expired. Contact us for a new one before the offer ends.",
        ),
    ]
}
