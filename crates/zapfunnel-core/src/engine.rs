//! Funnel engine: the per-conversation state machine.
//!
//! All mutations for one identity are serialized through a per-identity lock.
//! Timers never touch state from their own execution context; they call back
//! into the engine through the same locked path as every other event.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    contacts::ContactBook,
    dispatch::Dispatcher,
    domain::{Jid, OrderRef},
    errors::Error,
    funnel::{FunnelCategory, FunnelRegistry, StepKind},
    idempotency::IdempotencyGuard,
    store::{Conversation, ConversationStore},
    Result,
};

const DEFAULT_DELAY_SECS: u64 = 10;
const DEFAULT_TYPING_SECS: u64 = 3;

/// Why a conversation is moving to its next step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvanceReason {
    Reply,
    Timeout,
    Auto,
}

/// Business metadata captured when a funnel starts.
#[derive(Clone, Debug)]
pub struct StartContext {
    pub order_ref: OrderRef,
    pub customer_name: String,
    pub product: String,
    pub amount: String,
}

struct StepTimer {
    step_index: usize,
    cancel: CancellationToken,
}

struct DeadlineTimer {
    order_ref: OrderRef,
    cancel: CancellationToken,
}

struct EngineInner {
    cfg: Arc<Config>,
    registry: Arc<FunnelRegistry>,
    store: Arc<ConversationStore>,
    dispatcher: Arc<Dispatcher>,
    guard: Arc<IdempotencyGuard>,
    contacts: Arc<ContactBook>,

    /// One lock per identity: at most one in-flight transition per identity.
    locks: Mutex<HashMap<Jid, Arc<Mutex<()>>>>,
    /// Armed reply-wait timeouts, one slot per identity (superseded on re-arm).
    step_timers: Mutex<HashMap<Jid, StepTimer>>,
    /// Pending-funnel deadlines, scheduled independently of step timeouts.
    deadlines: Mutex<HashMap<Jid, DeadlineTimer>>,
}

#[derive(Clone)]
pub struct FunnelEngine {
    inner: Arc<EngineInner>,
}

impl FunnelEngine {
    pub fn new(
        cfg: Arc<Config>,
        registry: Arc<FunnelRegistry>,
        store: Arc<ConversationStore>,
        dispatcher: Arc<Dispatcher>,
        guard: Arc<IdempotencyGuard>,
        contacts: Arc<ContactBook>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                cfg,
                registry,
                store,
                dispatcher,
                guard,
                contacts,
                locks: Mutex::new(HashMap::new()),
                step_timers: Mutex::new(HashMap::new()),
                deadlines: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start `funnel_id` for an identity, overwriting any prior conversation
    /// at that key. An approved funnel first cancels a live pending-payment
    /// funnel; a pending funnel arms its own deadline.
    pub async fn start(&self, jid: &Jid, funnel_id: &str, ctx: StartContext) -> Result<()> {
        let lock = self.identity_lock(jid).await;
        let _guard = lock.lock().await;

        let Some(funnel) = self.inner.registry.get(funnel_id).await else {
            error!(identity = %jid, funnel = %funnel_id, "cannot start unknown funnel");
            return Err(Error::UnknownFunnel(funnel_id.to_string()));
        };

        if funnel.category == FunnelCategory::Approved {
            self.cancel_locked(jid, "PAYMENT_APPROVED").await;
        }

        // Overwriting the key voids any timers armed for the prior
        // conversation at it.
        self.clear_timers(jid).await;

        let order_ref = ctx.order_ref.clone();
        self.inner
            .store
            .insert(Conversation {
                jid: jid.clone(),
                funnel_id: funnel.id.clone(),
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
                order_ref: ctx.order_ref,
                customer_name: ctx.customer_name,
                product: ctx.product,
                amount: ctx.amount,
            })
            .await;
        info!(identity = %jid, funnel = %funnel.id, order = %order_ref, "funnel started");

        if funnel.category == FunnelCategory::Pending {
            self.arm_deadline(jid, order_ref).await;
        }

        self.run_from_current(jid).await;
        Ok(())
    }

    /// Advance past the current step. Public entry for replies (and for the
    /// internal auto/timeout paths).
    pub async fn advance(&self, jid: &Jid, reply_text: Option<&str>, reason: AdvanceReason) {
        let lock = self.identity_lock(jid).await;
        let _guard = lock.lock().await;

        if self.advance_locked(jid, reply_text, reason).await {
            self.run_from_current(jid).await;
        }
    }

    /// A previously armed reply-wait timeout fired. No-op unless the
    /// conversation still exists, is still at `expected_step_index`, is still
    /// waiting, and was not canceled: a reply or a cancellation racing the
    /// timer wins.
    pub async fn handle_timeout(&self, jid: &Jid, expected_step_index: usize) {
        let lock = self.identity_lock(jid).await;
        let _guard = lock.lock().await;

        let Some(conv) = self.inner.store.get(jid).await else {
            return;
        };
        if conv.step_index != expected_step_index || !conv.waiting_for_response || conv.canceled {
            debug!(
                identity = %jid,
                expected_step = expected_step_index,
                "stale step timeout ignored"
            );
            return;
        }

        info!(identity = %jid, step = expected_step_index, "reply wait timed out");
        if self
            .advance_locked(jid, None, AdvanceReason::Timeout)
            .await
        {
            self.run_from_current(jid).await;
        }
    }

    /// Cancel a pending-payment conversation. Anything else is a logged
    /// no-op. The step index is left untouched for audit.
    pub async fn cancel(&self, jid: &Jid, reason: &str) {
        let lock = self.identity_lock(jid).await;
        let _guard = lock.lock().await;
        self.cancel_locked(jid, reason).await;
    }

    async fn cancel_locked(&self, jid: &Jid, reason: &str) {
        let Some(conv) = self.inner.store.get(jid).await else {
            return;
        };
        if !conv.is_active() {
            return;
        }
        let Some(funnel) = self.inner.registry.get(&conv.funnel_id).await else {
            error!(identity = %jid, funnel = %conv.funnel_id, "cancel: funnel not found");
            return;
        };
        if funnel.category != FunnelCategory::Pending {
            debug!(identity = %jid, funnel = %conv.funnel_id, "cancel ignored for non-pending funnel");
            return;
        }

        self.clear_timers(jid).await;
        self.inner
            .store
            .update(jid, |c| {
                c.waiting_for_response = false;
                c.canceled = true;
                c.cancel_reason = Some(reason.to_string());
                c.canceled_at = Some(Utc::now());
            })
            .await;
        info!(
            identity = %jid,
            funnel = %conv.funnel_id,
            step = conv.step_index,
            reason = %reason,
            "pending funnel canceled"
        );
    }

    /// Send steps starting at the conversation's current position, chaining
    /// through auto-advance steps until a reply wait, completion, or failure.
    ///
    /// Caller must hold the identity lock.
    async fn run_from_current(&self, jid: &Jid) {
        loop {
            let Some(conv) = self.inner.store.get(jid).await else {
                return;
            };
            if !conv.is_active() {
                return;
            }

            let Some(funnel) = self.inner.registry.get(&conv.funnel_id).await else {
                error!(identity = %jid, funnel = %conv.funnel_id, "step dispatch: funnel not found");
                return;
            };
            let Some(step) = funnel.steps.get(conv.step_index).cloned() else {
                error!(
                    identity = %jid,
                    funnel = %conv.funnel_id,
                    step = conv.step_index,
                    "step dispatch: step not found"
                );
                return;
            };

            // The epoch distinguishes a legitimate self-loop re-entry from a
            // duplicate dispatch of the same transition.
            let dispatch_key = format!(
                "send:{jid}:{}:{}:{}",
                funnel.id, conv.step_index, conv.epoch
            );
            if self.inner.guard.seen(&dispatch_key).await {
                debug!(
                    identity = %jid,
                    funnel = %funnel.id,
                    step = conv.step_index,
                    "duplicate step dispatch ignored"
                );
                return;
            }

            if let Some(secs) = step.delay_before.filter(|s| *s > 0) {
                debug!(identity = %jid, seconds = secs, "pre-send delay");
                sleep(Duration::from_secs(secs)).await;
            }
            if step.show_typing && step.kind != StepKind::Typing {
                self.inner
                    .dispatcher
                    .typing(
                        jid,
                        Duration::from_secs(step.typing_seconds.unwrap_or(DEFAULT_TYPING_SECS)),
                    )
                    .await;
            }

            match step.kind {
                StepKind::Delay => {
                    let secs = step.delay_seconds.unwrap_or(DEFAULT_DELAY_SECS);
                    debug!(identity = %jid, step = conv.step_index, seconds = secs, "delay step");
                    sleep(Duration::from_secs(secs)).await;
                }
                StepKind::Typing => {
                    let secs = step.typing_seconds.unwrap_or(DEFAULT_TYPING_SECS);
                    self.inner.dispatcher.typing(jid, Duration::from_secs(secs)).await;
                }
                _ => {
                    let Some(intent) = step.intent() else {
                        error!(
                            identity = %jid,
                            funnel = %funnel.id,
                            step = conv.step_index,
                            "step has no sendable payload"
                        );
                        return;
                    };
                    let is_first_message = conv.step_index == 0;
                    if let Err(e) = self
                        .inner
                        .dispatcher
                        .deliver(jid, &intent, is_first_message)
                        .await
                    {
                        // Instance fallback already happened inside deliver;
                        // the conversation stays put for operator attention.
                        error!(
                            identity = %jid,
                            funnel = %funnel.id,
                            step = conv.step_index,
                            error = %e,
                            "step send failed"
                        );
                        return;
                    }
                }
            }

            self.inner
                .store
                .update(jid, |c| c.last_system_message_at = Some(Utc::now()))
                .await;

            if step.wait_for_reply && step.kind.is_wire() {
                self.inner
                    .store
                    .update(jid, |c| c.waiting_for_response = true)
                    .await;
                debug!(
                    identity = %jid,
                    funnel = %funnel.id,
                    step = conv.step_index,
                    "waiting for reply"
                );
                if let Some(minutes) = step.timeout_minutes {
                    self.arm_step_timeout(
                        jid,
                        conv.step_index,
                        Duration::from_secs(u64::from(minutes) * 60),
                    )
                    .await;
                }
                return;
            }

            if !self.advance_locked(jid, None, AdvanceReason::Auto).await {
                return;
            }
        }
    }

    /// Apply one transition. Returns true when the conversation moved to a
    /// step that should now be sent. Caller must hold the identity lock.
    async fn advance_locked(
        &self,
        jid: &Jid,
        reply_text: Option<&str>,
        reason: AdvanceReason,
    ) -> bool {
        let Some(conv) = self.inner.store.get(jid).await else {
            warn!(identity = %jid, "advance for missing conversation ignored");
            return false;
        };
        if conv.canceled {
            debug!(identity = %jid, funnel = %conv.funnel_id, "advance on canceled conversation ignored");
            return false;
        }
        let Some(funnel) = self.inner.registry.get(&conv.funnel_id).await else {
            error!(identity = %jid, funnel = %conv.funnel_id, "advance: funnel not found");
            return false;
        };
        let Some(step) = funnel.steps.get(conv.step_index).cloned() else {
            error!(
                identity = %jid,
                funnel = %conv.funnel_id,
                step = conv.step_index,
                "advance: step not found"
            );
            return false;
        };

        if reason == AdvanceReason::Reply && step.capture_contact {
            if reply_text.is_some_and(|t| !t.trim().is_empty()) {
                if let Some(instance) = self.inner.store.sticky(jid).await {
                    self.inner
                        .contacts
                        .capture(&instance, jid, &conv.customer_name)
                        .await;
                }
            }
        }

        let next = match (reason, step.next_on_reply, step.next_on_timeout) {
            (AdvanceReason::Reply, Some(n), _) => n,
            (AdvanceReason::Timeout, _, Some(n)) => n,
            _ => conv.step_index + 1,
        };

        if next >= funnel.steps.len() {
            self.clear_timers(jid).await;
            self.inner
                .store
                .update(jid, |c| {
                    c.waiting_for_response = false;
                    c.completed = true;
                    c.completed_at = Some(Utc::now());
                    if reason == AdvanceReason::Reply {
                        c.last_reply_at = Some(Utc::now());
                    }
                })
                .await;
            info!(identity = %jid, funnel = %funnel.id, "funnel completed");
            return false;
        }

        self.cancel_step_timer(jid).await;
        self.inner
            .store
            .update(jid, |c| {
                c.step_index = next;
                c.waiting_for_response = false;
                c.epoch += 1;
                if reason == AdvanceReason::Reply {
                    c.last_reply_at = Some(Utc::now());
                }
            })
            .await;
        debug!(
            identity = %jid,
            funnel = %funnel.id,
            next_step = next,
            reason = ?reason,
            "conversation advanced"
        );
        true
    }

    async fn identity_lock(&self, jid: &Jid) -> Arc<Mutex<()>> {
        let mut locks = self.inner.locks.lock().await;
        locks
            .entry(jid.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn arm_step_timeout<'a>(
        &'a self,
        jid: &'a Jid,
        step_index: usize,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let cancel = CancellationToken::new();
            let engine = self.clone();
            let jid_for_task = jid.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = sleep(delay) => {
                        engine.expire_step_timer(&jid_for_task, step_index).await;
                        engine.handle_timeout(&jid_for_task, step_index).await;
                    }
                }
            });

            let mut timers = self.inner.step_timers.lock().await;
            if let Some(prev) = timers.insert(jid.clone(), StepTimer { step_index, cancel }) {
                debug!(identity = %jid, prev_step = prev.step_index, "step timeout superseded");
                prev.cancel.cancel();
            }
        })
    }

    async fn arm_deadline(&self, jid: &Jid, order_ref: OrderRef) {
        let delay = self.inner.cfg.pending_deadline;
        let cancel = CancellationToken::new();
        let engine = self.clone();
        let jid_for_task = jid.clone();
        let order_for_task = order_ref.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(delay) => {
                    engine.handle_deadline(&jid_for_task, &order_for_task).await;
                }
            }
        });

        let mut deadlines = self.inner.deadlines.lock().await;
        if let Some(prev) = deadlines.insert(jid.clone(), DeadlineTimer { order_ref, cancel }) {
            debug!(identity = %jid, prev_order = %prev.order_ref, "pending deadline superseded");
            prev.cancel.cancel();
        }
    }

    /// Pending-funnel deadline fired: forcibly jump to the terminal step,
    /// unless the conversation was canceled, completed, or replaced by a
    /// newer order in the meantime.
    async fn handle_deadline(&self, jid: &Jid, order_ref: &OrderRef) {
        let lock = self.identity_lock(jid).await;
        let _guard = lock.lock().await;

        {
            let mut deadlines = self.inner.deadlines.lock().await;
            if deadlines
                .get(jid)
                .is_some_and(|entry| &entry.order_ref == order_ref)
            {
                deadlines.remove(jid);
            }
        }

        let Some(conv) = self.inner.store.get(jid).await else {
            return;
        };
        if !conv.is_active() || conv.order_ref != *order_ref {
            debug!(identity = %jid, order = %order_ref, "stale pending deadline ignored");
            return;
        }
        let Some(funnel) = self.inner.registry.get(&conv.funnel_id).await else {
            error!(identity = %jid, funnel = %conv.funnel_id, "deadline: funnel not found");
            return;
        };

        info!(
            identity = %jid,
            funnel = %funnel.id,
            order = %order_ref,
            "pending deadline reached, jumping to terminal step"
        );
        self.cancel_step_timer(jid).await;
        self.inner
            .store
            .update(jid, |c| {
                c.step_index = funnel.terminal_step();
                c.waiting_for_response = false;
                c.epoch += 1;
            })
            .await;
        self.run_from_current(jid).await;
    }

    /// Drop the armed step-timer entry once its task has fired.
    async fn expire_step_timer(&self, jid: &Jid, step_index: usize) {
        let mut timers = self.inner.step_timers.lock().await;
        if timers
            .get(jid)
            .is_some_and(|entry| entry.step_index == step_index)
        {
            timers.remove(jid);
        }
    }

    async fn cancel_step_timer(&self, jid: &Jid) {
        if let Some(entry) = self.inner.step_timers.lock().await.remove(jid) {
            entry.cancel.cancel();
        }
    }

    async fn cancel_deadline(&self, jid: &Jid) {
        if let Some(entry) = self.inner.deadlines.lock().await.remove(jid) {
            entry.cancel.cancel();
        }
    }

    /// Cancel both timer slots; used on every terminal transition.
    async fn clear_timers(&self, jid: &Jid) {
        self.cancel_step_timer(jid).await;
        self.cancel_deadline(jid).await;
    }

    /// Number of identities with a pending deadline armed (for reporting).
    pub async fn pending_deadlines(&self) -> usize {
        self.inner.deadlines.lock().await.len()
    }
}
