//! # OffKit Bus
//!
//! Bidirectional messaging between the engine and the contexts it controls,
//! plus named many-to-many broadcast groups between contexts.
//!
//! ## Features
//!
//! - **MessagePort**: entangled port pairs over unbounded channels
//! - **Envelopes**: control messages (interpreted by the engine) vs
//!   opaque application payloads
//! - **Echo protocol**: the engine's default application-message reply
//! - **BroadcastHub**: `join(group)` / `post` / `leave`, no self-delivery
//!
//! ## Architecture
//!
//! ```text
//! Engine ◄── MessagePort pair ──► ControlledContext
//!     │            (per context, send order preserved)
//!     │
//! BroadcastHub
//!     └── "group" ── member A ──┐
//!                ── member B ◄──┤ post from A reaches B and C only
//!                ── member C ◄──┘
//! ```

use hashbrown::HashMap;
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

// ==================== Errors ====================

/// Messaging errors.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// The target context has terminated; delivery is dropped, no retry.
    #[error("Context gone")]
    ContextGone,

    /// The port was closed locally.
    #[error("Port closed")]
    PortClosed,

    /// No member/group with that identity.
    #[error("Not found: {0}")]
    NotFound(String),
}

// ==================== Identifiers ====================

/// Opaque handle for one controlled front-end context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocate a fresh context handle.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "context-{}", self.0)
    }
}

// ==================== Envelopes ====================

/// Reserved control commands the engine interprets rather than forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// "Take over now": promote the waiting engine version immediately.
    SkipWaiting,
}

/// A message travelling between a context and the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Interpreted internally by the engine.
    Control(ControlMessage),
    /// Opaque application payload, forwarded to application handlers.
    Application(JsonValue),
}

impl Envelope {
    /// Classify a raw JSON payload. A payload whose `type` field carries
    /// the reserved `SKIP_WAITING` tag becomes a control message;
    /// everything else is an application message.
    pub fn from_value(value: JsonValue) -> Self {
        match value.get("type").and_then(JsonValue::as_str) {
            Some("SKIP_WAITING") => Envelope::Control(ControlMessage::SkipWaiting),
            _ => Envelope::Application(value),
        }
    }

    /// Convenience constructor for an application payload.
    pub fn application(value: JsonValue) -> Self {
        Envelope::Application(value)
    }
}

/// Build the engine's echo reply for an application message: a
/// confirmation envelope wrapping the original payload.
pub fn echo_reply(original: &JsonValue) -> JsonValue {
    json!({
        "type": "REPLY",
        "payload": format!("Echo from engine: {original}"),
    })
}

// ==================== MessagePort ====================

/// One half of an entangled port pair.
///
/// Messages posted on one half arrive at the other in send order. Posting
/// into a pair whose other half has been dropped or closed fails with
/// [`BusError::ContextGone`]; delivery is fire-and-forget beyond that.
#[derive(Debug)]
pub struct MessagePort {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    closed: bool,
}

impl MessagePort {
    /// Create an entangled pair.
    pub fn create_pair() -> (Self, Self) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        let a = Self {
            tx: tx2,
            rx: rx1,
            closed: false,
        };
        let b = Self {
            tx: tx1,
            rx: rx2,
            closed: false,
        };
        (a, b)
    }

    /// Post a message to the entangled half.
    pub fn post(&self, envelope: Envelope) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::PortClosed);
        }
        self.tx.send(envelope).map_err(|_| BusError::ContextGone)
    }

    /// Receive the next message, waiting until one arrives or the other
    /// half closes.
    pub async fn recv(&mut self) -> Option<Envelope> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    /// Receive a message without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        if self.closed {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Close this half. Posts from the other half will fail afterwards.
    pub fn close(&mut self) {
        self.closed = true;
        self.rx.close();
    }

    /// Whether this half has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

// ==================== MessageBus ====================

/// Engine-side registry of per-context message ports.
///
/// The engine holds one half of a pair for every controlled context and
/// hands out the other half when the context attaches.
pub struct MessageBus {
    ports: RwLock<HashMap<ContextId, MessagePort>>,
}

impl MessageBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            ports: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a context, returning the context-side port half.
    pub async fn attach(&self, context: ContextId) -> MessagePort {
        let (engine_half, context_half) = MessagePort::create_pair();
        debug!(%context, "Context attached to message bus");
        self.ports.write().await.insert(context, engine_half);
        context_half
    }

    /// Detach a terminated context. Pending deliveries to it are dropped.
    pub async fn detach(&self, context: ContextId) -> bool {
        let removed = self.ports.write().await.remove(&context).is_some();
        if removed {
            debug!(%context, "Context detached from message bus");
        }
        removed
    }

    /// Contexts currently attached.
    pub async fn contexts(&self) -> Vec<ContextId> {
        self.ports.read().await.keys().copied().collect()
    }

    /// Send an envelope to one context. A gone context yields
    /// [`BusError::ContextGone`]; callers treat that as a silent drop.
    pub async fn send(&self, context: ContextId, envelope: Envelope) -> Result<(), BusError> {
        let ports = self.ports.read().await;
        let port = ports.get(&context).ok_or(BusError::ContextGone)?;
        port.post(envelope)
    }

    /// Drain all messages contexts have sent to the engine, in per-context
    /// send order.
    pub async fn poll(&self) -> Vec<(ContextId, Envelope)> {
        let mut messages = Vec::new();
        let mut ports = self.ports.write().await;
        for (context, port) in ports.iter_mut() {
            while let Some(envelope) = port.try_recv() {
                trace!(%context, "Message received from context");
                messages.push((*context, envelope));
            }
        }
        messages
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

// ==================== Broadcast Groups ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MemberId(u64);

impl MemberId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Default)]
struct HubState {
    groups: HashMap<String, Vec<(MemberId, mpsc::UnboundedSender<JsonValue>)>>,
}

/// Named many-to-many broadcast groups.
///
/// Every member of a group receives every payload posted by any *other*
/// member. There is no replay: a member only sees posts made after it
/// joined.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    state: Arc<RwLock<HubState>>,
}

impl BroadcastHub {
    /// Create a hub with no groups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a named group, creating it if absent.
    pub async fn join(&self, group: &str) -> BroadcastChannelHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let member = MemberId::new();

        let mut state = self.state.write().await;
        state
            .groups
            .entry(group.to_string())
            .or_default()
            .push((member, tx));
        debug!(group, "Member joined broadcast group");

        BroadcastChannelHandle {
            group: group.to_string(),
            member,
            hub: Arc::clone(&self.state),
            rx,
        }
    }

    /// Number of members currently in a group.
    pub async fn member_count(&self, group: &str) -> usize {
        self.state
            .read()
            .await
            .groups
            .get(group)
            .map_or(0, Vec::len)
    }
}

/// One membership in a broadcast group.
pub struct BroadcastChannelHandle {
    group: String,
    member: MemberId,
    hub: Arc<RwLock<HubState>>,
    rx: mpsc::UnboundedReceiver<JsonValue>,
}

impl BroadcastChannelHandle {
    /// Group name this handle belongs to.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Post a payload to every other member of the group.
    pub async fn post(&self, payload: JsonValue) {
        let state = self.hub.read().await;
        let Some(members) = state.groups.get(&self.group) else {
            return;
        };
        for (member, tx) in members {
            if *member == self.member {
                continue; // no self-delivery
            }
            let _ = tx.send(payload.clone());
        }
    }

    /// Receive the next broadcast, waiting until one arrives.
    pub async fn recv(&mut self) -> Option<JsonValue> {
        self.rx.recv().await
    }

    /// Receive a broadcast without waiting.
    pub fn try_recv(&mut self) -> Option<JsonValue> {
        self.rx.try_recv().ok()
    }

    /// Leave the group. Later posts no longer reach this handle.
    pub async fn leave(mut self) {
        let mut state = self.hub.write().await;
        if let Some(members) = state.groups.get_mut(&self.group) {
            members.retain(|(member, _)| *member != self.member);
            if members.is_empty() {
                state.groups.remove(&self.group);
            }
        }
        self.rx.close();
        debug!(group = %self.group, "Member left broadcast group");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_classification() {
        let control = Envelope::from_value(json!({"type": "SKIP_WAITING"}));
        assert_eq!(control, Envelope::Control(ControlMessage::SkipWaiting));

        let app = Envelope::from_value(json!({"type": "HELLO", "payload": "x"}));
        assert!(matches!(app, Envelope::Application(_)));

        let untyped = Envelope::from_value(json!(42));
        assert!(matches!(untyped, Envelope::Application(_)));
    }

    #[test]
    fn test_echo_reply_wraps_original() {
        let reply = echo_reply(&json!({"type": "HELLO", "payload": "x"}));
        assert_eq!(reply["type"], "REPLY");
        let payload = reply["payload"].as_str().unwrap();
        assert!(payload.starts_with("Echo from engine: "));
        assert!(payload.contains("\"x\""));
    }

    #[test]
    fn test_port_ordering() {
        let (a, mut b) = MessagePort::create_pair();

        a.post(Envelope::application(json!(1))).unwrap();
        a.post(Envelope::application(json!(2))).unwrap();
        a.post(Envelope::application(json!(3))).unwrap();

        assert_eq!(b.try_recv(), Some(Envelope::Application(json!(1))));
        assert_eq!(b.try_recv(), Some(Envelope::Application(json!(2))));
        assert_eq!(b.try_recv(), Some(Envelope::Application(json!(3))));
        assert_eq!(b.try_recv(), None);
    }

    #[test]
    fn test_post_to_dropped_half() {
        let (a, b) = MessagePort::create_pair();
        drop(b);

        let result = a.post(Envelope::application(json!(null)));
        assert!(matches!(result, Err(BusError::ContextGone)));
    }

    #[test]
    fn test_closed_port_rejects_post() {
        let (mut a, _b) = MessagePort::create_pair();
        a.close();
        assert!(matches!(
            a.post(Envelope::application(json!(null))),
            Err(BusError::PortClosed)
        ));
    }

    #[tokio::test]
    async fn test_bus_attach_send_poll() {
        let bus = MessageBus::new();
        let context = ContextId::new();
        let mut context_port = bus.attach(context).await;

        // Engine to context
        bus.send(context, Envelope::application(json!({"hello": true})))
            .await
            .unwrap();
        assert!(context_port.try_recv().is_some());

        // Context to engine
        context_port
            .post(Envelope::application(json!({"type": "HELLO"})))
            .unwrap();
        let polled = bus.poll().await;
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].0, context);
    }

    #[tokio::test]
    async fn test_bus_send_to_detached_context() {
        let bus = MessageBus::new();
        let context = ContextId::new();
        let _port = bus.attach(context).await;
        bus.detach(context).await;

        let result = bus.send(context, Envelope::application(json!(null))).await;
        assert!(matches!(result, Err(BusError::ContextGone)));
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_no_self_delivery() {
        let hub = BroadcastHub::new();
        let a = hub.join("g").await;
        let mut b = hub.join("g").await;
        let mut c = hub.join("g").await;

        a.post(json!("hi")).await;

        assert_eq!(b.try_recv(), Some(json!("hi")));
        assert_eq!(b.try_recv(), None);
        assert_eq!(c.try_recv(), Some(json!("hi")));
        assert_eq!(c.try_recv(), None);

        let mut a = a;
        assert_eq!(a.try_recv(), None);
    }

    #[tokio::test]
    async fn test_broadcast_no_replay_for_late_joiners() {
        let hub = BroadcastHub::new();
        let a = hub.join("g").await;
        let _b = hub.join("g").await;

        a.post(json!("early")).await;

        let mut late = hub.join("g").await;
        assert_eq!(late.try_recv(), None);

        a.post(json!("late")).await;
        assert_eq!(late.try_recv(), Some(json!("late")));
    }

    #[tokio::test]
    async fn test_broadcast_leave() {
        let hub = BroadcastHub::new();
        let a = hub.join("g").await;
        let b = hub.join("g").await;

        assert_eq!(hub.member_count("g").await, 2);
        b.leave().await;
        assert_eq!(hub.member_count("g").await, 1);

        // Posting after the peer left reaches nobody, and does not error
        a.post(json!("solo")).await;
    }

    #[tokio::test]
    async fn test_broadcast_groups_are_isolated() {
        let hub = BroadcastHub::new();
        let a = hub.join("g1").await;
        let mut b = hub.join("g2").await;

        a.post(json!("only-g1")).await;
        assert_eq!(b.try_recv(), None);
    }
}
