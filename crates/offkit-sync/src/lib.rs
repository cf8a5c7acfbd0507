//! # OffKit Sync
//!
//! Deferred "replay when connectivity returns" work and out-of-band push
//! deliveries for the OffKit engine.
//!
//! ## Features
//!
//! - **DeferredTaskQueue**: tagged tasks drained on a readiness signal,
//!   at-least-once with a bounded attempt cap
//! - **PushGateway**: stored push subscription plus the trigger endpoint
//!   that turns a payload into an out-of-band delivery
//! - **Notifications**: push payloads surfaced through a
//!   [`NotificationSurface`], display failures dropped without retry
//!
//! ## Architecture
//!
//! ```text
//! ControlledContext ── register_tag/enqueue ──► DeferredTaskQueue
//!                                                    │ drain(tag) on readiness
//!                                                    ▼
//!                                               TaskAction (per tag)
//!
//! Remote origin ── send_notification ──► PushGateway ──► deliver_push
//!                                                             │
//!                                                             ▼
//!                                                   NotificationSurface
//! ```

use futures::future::BoxFuture;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

// ==================== Errors ====================

/// Deferred task errors.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    /// The platform offers no replay signal; registration is refused.
    #[error("Replay signals unsupported")]
    ReplayUnsupported,

    /// The task's completion action failed; the task stays queued.
    #[error("Task action failed: {0}")]
    ActionFailed(String),
}

/// Push pipeline errors.
#[derive(Error, Debug, Clone)]
pub enum PushError {
    /// No subscription stored; nothing to deliver to.
    #[error("No push subscription stored")]
    NoSubscription,

    /// The notification surface refused the display. Dropped, no retry.
    #[error("Push delivery failed: {0}")]
    DeliveryFailed(String),
}

// ==================== Deferred Tasks ====================

/// A tagged unit of work queued for replay.
#[derive(Debug, Clone)]
pub struct DeferredTask {
    /// Replay tag (e.g. `my-sync-tag`).
    pub tag: String,

    /// Enqueue timestamp (ms since epoch).
    pub enqueued_at: u64,

    /// Opaque payload handed to the completion action.
    pub payload: JsonValue,

    /// Completed attempts so far.
    pub attempts: u32,
}

/// Completion action invoked when a task's tag is triggered.
pub trait TaskAction: Send + Sync {
    /// Attempt the task. An error re-arms the task for the next trigger.
    fn run(&self, task: &DeferredTask) -> BoxFuture<'static, Result<(), TaskError>>;
}

/// Readiness signal that triggers a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessSignal {
    /// Connectivity regained; every tag is drained.
    Online,
    /// Explicit platform replay signal for one tag.
    Replay(String),
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Attempts after which a persistently failing task is dropped.
    /// The reference behavior retried without bound; a cap keeps the
    /// queue from growing forever.
    pub max_attempts: u32,

    /// Whether the runtime offers replay signals at all.
    pub replay_supported: bool,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            replay_supported: true,
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks completed and removed.
    pub completed: usize,
    /// Tasks that failed and were re-armed.
    pub rearmed: usize,
    /// Tasks dropped after exhausting the attempt cap.
    pub dropped: usize,
}

/// Tagged task queue drained by readiness signals.
///
/// Enqueue and drain both take the internal mutex, so they never
/// interleave destructively. Tasks complete at-least-once: an action
/// failure leaves the task queued for the next trigger.
pub struct DeferredTaskQueue {
    config: TaskQueueConfig,
    tasks: Mutex<Vec<DeferredTask>>,
    actions: RwLock<HashMap<String, Arc<dyn TaskAction>>>,
}

impl DeferredTaskQueue {
    /// Create an empty queue with default configuration.
    pub fn new() -> Self {
        Self::with_config(TaskQueueConfig::default())
    }

    /// Create an empty queue with the given configuration.
    pub fn with_config(config: TaskQueueConfig) -> Self {
        Self {
            config,
            tasks: Mutex::new(Vec::new()),
            actions: RwLock::new(HashMap::new()),
        }
    }

    /// Register the completion action for a tag. Fails when the runtime
    /// offers no replay signal support.
    pub async fn register_tag(
        &self,
        tag: &str,
        action: Arc<dyn TaskAction>,
    ) -> Result<(), TaskError> {
        if !self.config.replay_supported {
            return Err(TaskError::ReplayUnsupported);
        }
        debug!(tag, "Registered deferred task tag");
        self.actions.write().await.insert(tag.to_string(), action);
        Ok(())
    }

    /// Queue a task for later replay.
    pub async fn enqueue(&self, tag: &str, payload: JsonValue) {
        let task = DeferredTask {
            tag: tag.to_string(),
            enqueued_at: now_ms(),
            payload,
            attempts: 0,
        };
        debug!(tag, "Deferred task enqueued");
        self.tasks.lock().await.push(task);
    }

    /// Number of tasks queued under a tag.
    pub async fn pending(&self, tag: &str) -> usize {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|t| t.tag == tag)
            .count()
    }

    /// React to a readiness signal.
    pub async fn signal(&self, signal: ReadinessSignal) -> DrainReport {
        match signal {
            ReadinessSignal::Online => self.drain_all().await,
            ReadinessSignal::Replay(tag) => self.drain(&tag).await,
        }
    }

    /// Drain every task matching a tag: run its action, remove it on
    /// success, re-arm it on failure (until the attempt cap).
    pub async fn drain(&self, tag: &str) -> DrainReport {
        let action = self.actions.read().await.get(tag).cloned();
        let Some(action) = action else {
            warn!(tag, "Drain triggered for tag with no registered action");
            return DrainReport::default();
        };

        // Take matching tasks out under the lock; run actions outside it
        // so a slow action cannot block enqueues.
        let mut due = Vec::new();
        {
            let mut tasks = self.tasks.lock().await;
            let mut i = 0;
            while i < tasks.len() {
                if tasks[i].tag == tag {
                    due.push(tasks.remove(i));
                } else {
                    i += 1;
                }
            }
        }

        let mut report = DrainReport::default();
        let mut rearm = Vec::new();

        for mut task in due {
            task.attempts += 1;
            match action.run(&task).await {
                Ok(()) => {
                    debug!(tag, attempts = task.attempts, "Deferred task completed");
                    report.completed += 1;
                }
                Err(e) => {
                    if task.attempts >= self.config.max_attempts {
                        warn!(tag, attempts = task.attempts, error = %e, "Dropping task after attempt cap");
                        report.dropped += 1;
                    } else {
                        warn!(tag, attempts = task.attempts, error = %e, "Re-arming failed task");
                        rearm.push(task);
                        report.rearmed += 1;
                    }
                }
            }
        }

        if !rearm.is_empty() {
            self.tasks.lock().await.extend(rearm);
        }

        report
    }

    /// Drain every registered tag.
    pub async fn drain_all(&self) -> DrainReport {
        let tags: Vec<String> = self.actions.read().await.keys().cloned().collect();
        let mut total = DrainReport::default();
        for tag in tags {
            let report = self.drain(&tag).await;
            total.completed += report.completed;
            total.rearmed += report.rearmed;
            total.dropped += report.dropped;
        }
        total
    }
}

impl Default for DeferredTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ==================== Push Subscriptions ====================

/// A stored push subscription record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    /// Delivery endpoint of the remote push service.
    pub endpoint: String,

    /// Client keys (e.g. `p256dh`, `auth`).
    #[serde(default)]
    pub keys: HashMap<String, String>,
}

/// Subscription store and out-of-band delivery trigger.
///
/// Owns the stored subscription as explicit state with init/reset rather
/// than a module-level global. Deliveries triggered here arrive at the
/// engine through the channel handed out at construction.
pub struct PushGateway {
    public_key: String,
    subscription: Mutex<Option<PushSubscription>>,
    delivery_tx: mpsc::UnboundedSender<JsonValue>,
}

impl PushGateway {
    /// Create a gateway with the given application server key. The
    /// returned receiver is the engine's inbound push channel.
    pub fn new(public_key: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<JsonValue>) {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        (
            Self {
                public_key: public_key.into(),
                subscription: Mutex::new(None),
                delivery_tx,
            },
            delivery_rx,
        )
    }

    /// Application server public key handed to subscribing contexts.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Store a subscription, replacing any previous one.
    pub async fn subscribe(&self, record: PushSubscription) {
        info!(endpoint = %record.endpoint, "Push subscription stored");
        *self.subscription.lock().await = Some(record);
    }

    /// Current subscription, if any.
    pub async fn subscription(&self) -> Option<PushSubscription> {
        self.subscription.lock().await.clone()
    }

    /// Clear the stored subscription.
    pub async fn reset(&self) {
        *self.subscription.lock().await = None;
    }

    /// Trigger an out-of-band delivery of `payload` to the subscribed
    /// engine. Fails when no subscription is stored.
    pub async fn send_notification(&self, payload: JsonValue) -> Result<(), PushError> {
        if self.subscription.lock().await.is_none() {
            return Err(PushError::NoSubscription);
        }
        self.delivery_tx
            .send(payload)
            .map_err(|e| PushError::DeliveryFailed(e.to_string()))
    }
}

// ==================== Notifications ====================

/// An ephemeral user-visible notification. No lifecycle once displayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotification {
    /// Notification title.
    pub title: String,
    /// Notification body text.
    pub body: String,
    /// Icon reference.
    pub icon: String,
}

/// Default title when the payload does not carry one.
pub const DEFAULT_PUSH_TITLE: &str = "Push Notification";

/// Default body when the payload is empty.
pub const DEFAULT_PUSH_BODY: &str = "Yay it works!";

/// Default icon reference.
pub const DEFAULT_PUSH_ICON: &str = "/icons/notification-192.png";

impl PushNotification {
    /// Build a notification from an inbound push payload. String payloads
    /// become the body; object payloads may carry `title`/`body`/`icon`
    /// fields; anything missing falls back to the defaults.
    pub fn from_payload(payload: &JsonValue) -> Self {
        let title = payload
            .get("title")
            .and_then(JsonValue::as_str)
            .unwrap_or(DEFAULT_PUSH_TITLE)
            .to_string();

        let body = match payload {
            JsonValue::String(text) if !text.is_empty() => text.clone(),
            other => other
                .get("body")
                .and_then(JsonValue::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_PUSH_BODY)
                .to_string(),
        };

        let icon = payload
            .get("icon")
            .and_then(JsonValue::as_str)
            .unwrap_or(DEFAULT_PUSH_ICON)
            .to_string();

        Self { title, body, icon }
    }
}

/// Platform surface that displays notifications.
pub trait NotificationSurface: Send + Sync {
    /// Display a notification. Errors mean the delivery is lost.
    fn show(&self, notification: &PushNotification) -> Result<(), PushError>;
}

/// Handle one inbound push delivery: build the notification and surface
/// it synchronously. Display failure drops the delivery; there is no
/// retry path.
pub fn deliver_push(
    payload: &JsonValue,
    surface: &dyn NotificationSurface,
) -> Result<PushNotification, PushError> {
    let notification = PushNotification::from_payload(payload);
    match surface.show(&notification) {
        Ok(()) => {
            info!(title = %notification.title, "Push notification displayed");
            Ok(notification)
        }
        Err(e) => {
            warn!(error = %e, "Push delivery dropped");
            Err(e)
        }
    }
}
