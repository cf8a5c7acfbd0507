//! # OffKit Engine
//!
//! The interception-and-cache coordination engine: a long-lived background
//! process that intercepts requests from controlled contexts, serves them
//! cache-first from named generations, exchanges control and application
//! messages with its contexts, and drives its own install/activate
//! lifecycle including stale-generation garbage collection.
//!
//! ## Architecture
//!
//! ```text
//! EngineRegistry (registrar surface)
//!     │
//!     └── Registration ("engine.js")
//!             ├── installing (ServiceEngine)
//!             ├── waiting (ServiceEngine)
//!             └── active (ServiceEngine)
//!                     ├── LifecycleController   install / activate / redundant
//!                     ├── InterceptionRouter    synthetic → cache-first → network
//!                     ├── MessageBus            control + application envelopes
//!                     └── DeferredTaskQueue     replay on readiness signal
//! ```
//!
//! Exactly one response (or one failure) leaves the router per intercepted
//! request. No error terminates the engine itself; engine-wide failures
//! surface on the registry's event channel.

use bytes::Bytes;
use futures::future::BoxFuture;
use hashbrown::{HashMap, HashSet};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use offkit_bus::{echo_reply, BusError, ContextId, ControlMessage, Envelope, MessageBus, MessagePort};
use offkit_cache::{CacheStore, CachedResponse, Fingerprint, ResponseKind, StoreError};
use offkit_common::RetryConfig;
use offkit_sync::{
    deliver_push, DeferredTaskQueue, NotificationSurface, PushError, PushNotification,
    ReadinessSignal, TaskAction, TaskError,
};

pub mod lifecycle;
pub mod router;

pub use lifecycle::{LifecycleController, LifecycleState, VersionId};
pub use router::{InterceptionRouter, PopulatePolicy, SyntheticRoute};

// ==================== Errors ====================

/// Errors that can occur in engine operations.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Generation could not be opened. Fatal for the installing version.
    #[error("Store open failed: {0}")]
    StoreOpenFailed(String),

    /// Cache write failed. Non-fatal; the in-flight response is unaffected.
    #[error("Store write failed: {0}")]
    StoreWriteFailed(String),

    /// Live network fetch failed or timed out.
    #[error("Network fetch failed: {0}")]
    NetworkFetchFailed(String),

    /// Target context terminated. Silently dropped, no retry.
    #[error("Message delivery failed: {0}")]
    MessageDeliveryFailed(String),

    /// Lifecycle transition not permitted from the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No registration or resource with that identity.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::OpenFailed(msg) => EngineError::StoreOpenFailed(msg),
            StoreError::WriteFailed(msg) => EngineError::StoreWriteFailed(msg),
        }
    }
}

impl From<BusError> for EngineError {
    fn from(e: BusError) -> Self {
        EngineError::MessageDeliveryFailed(e.to_string())
    }
}

// ==================== Requests / Responses ====================

/// Headers that participate in the cache fingerprint.
const VARY_HEADERS: &[&str] = &["accept", "accept-language"];

/// An outbound request intercepted from a controlled context.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    /// Request method.
    pub method: String,

    /// Request URL.
    pub url: Url,

    /// Request headers.
    pub headers: Vec<(String, String)>,
}

impl EngineRequest {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            method: "GET".to_string(),
            url,
            headers: Vec::new(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    /// URL path component.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Normalized cache key for this request. Only the headers in the
    /// vary set participate.
    pub fn fingerprint(&self) -> Fingerprint {
        let vary: Vec<(String, String)> = self
            .headers
            .iter()
            .filter(|(name, _)| VARY_HEADERS.contains(&name.as_str()))
            .cloned()
            .collect();
        Fingerprint::new(&self.method, &self.url, &vary)
    }
}

/// A response returned to a controlled context.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    /// Status code.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body. `Bytes` clones cheaply, so the same capture can be
    /// returned to the caller and persisted to the cache.
    pub body: Bytes,

    /// Response classification.
    pub kind: ResponseKind,

    /// Whether this response was served from the cache.
    pub from_cache: bool,
}

impl EngineResponse {
    /// Create a basic 200 response.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body: body.into(),
            kind: ResponseKind::Basic,
            from_cache: false,
        }
    }

    /// Create a response with explicit status and kind.
    pub fn with_status(status: u16, kind: ResponseKind, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
            kind,
            from_cache: false,
        }
    }

    /// Create a basic JSON response.
    pub fn json(value: &JsonValue) -> Self {
        Self::ok(value.to_string()).with_header("content-type", "application/json")
    }

    /// Set a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Whether this response may be written to the cache: only basic
    /// same-origin 200 responses qualify.
    pub fn is_cacheable(&self) -> bool {
        self.kind == ResponseKind::Basic && self.status == 200
    }

    /// Rehydrate a response from a cache entry.
    pub fn from_cached(entry: CachedResponse) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers,
            body: entry.body,
            kind: entry.kind,
            from_cache: true,
        }
    }

    /// Capture this response for storage. The body is duplicated, not
    /// consumed.
    pub fn to_cached(&self) -> CachedResponse {
        let mut cached = CachedResponse::with_status(self.status, self.kind, self.body.clone());
        cached.headers = self.headers.clone();
        cached
    }
}

// ==================== Network Backend ====================

/// Seam to the live network. The deployment supplies the implementation;
/// tests supply fakes.
pub trait NetworkBackend: Send + Sync {
    /// Perform a live fetch.
    fn fetch(&self, request: &EngineRequest) -> BoxFuture<'static, Result<EngineResponse, EngineError>>;
}

// ==================== Events ====================

/// Observability events surfaced to the registrar.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A new installing version appeared for a registration.
    UpdateFound { script_ref: String },

    /// An engine version changed lifecycle state.
    StateChange {
        version: VersionId,
        state: LifecycleState,
    },

    /// Installation failed; the version is stalled in Installing.
    InstallFailed { version: VersionId, error: String },

    /// A context came under this engine version's control.
    ControllerChange {
        version: VersionId,
        context: ContextId,
    },
}

// ==================== Configuration ====================

/// Per-version engine configuration.
pub struct EngineConfig {
    /// Name of this version's cache generation.
    pub generation: String,

    /// Generation names retained across activation. Everything else is
    /// garbage-collected. Always includes `generation`.
    pub keep_generations: Vec<String>,

    /// App-shell URLs pre-populated at install time.
    pub shell_urls: Vec<Url>,

    /// Whether successful network fetches populate the cache.
    pub populate_policy: PopulatePolicy,

    /// Timeout applied to live network fetches.
    pub fetch_timeout: Duration,

    /// Retry policy for install-time shell fetches.
    pub shell_retry: RetryConfig,

    /// Mock endpoints answered without touching cache or network.
    pub synthetic_routes: Vec<SyntheticRoute>,
}

impl EngineConfig {
    /// Configuration for a generation name with static-cache defaults.
    pub fn new(generation: impl Into<String>) -> Self {
        let generation = generation.into();
        Self {
            keep_generations: vec![generation.clone()],
            generation,
            shell_urls: Vec::new(),
            populate_policy: PopulatePolicy::Static,
            fetch_timeout: Duration::from_secs(30),
            shell_retry: RetryConfig::none(),
            synthetic_routes: Vec::new(),
        }
    }

    /// Set the retry policy for install-time shell fetches.
    pub fn with_shell_retry(mut self, retry: RetryConfig) -> Self {
        self.shell_retry = retry;
        self
    }

    /// Keep an additional generation across activation.
    pub fn keep(mut self, name: impl Into<String>) -> Self {
        self.keep_generations.push(name.into());
        self
    }

    /// Set the shell allow-list.
    pub fn with_shell_urls(mut self, urls: Vec<Url>) -> Self {
        self.shell_urls = urls;
        self
    }

    /// Set the populate policy.
    pub fn with_populate_policy(mut self, policy: PopulatePolicy) -> Self {
        self.populate_policy = policy;
        self
    }

    /// Add a synthetic route.
    pub fn with_synthetic_route(mut self, route: SyntheticRoute) -> Self {
        self.synthetic_routes.push(route);
        self
    }
}

// ==================== Service Engine ====================

/// Summary of one message-pump pass.
#[derive(Debug, Clone, Default)]
pub struct MessagePumpReport {
    /// A controlled context asked the waiting version to take over.
    pub skip_waiting_requested: bool,
    /// Echo replies delivered.
    pub replies_sent: usize,
    /// Replies dropped because the context terminated.
    pub replies_dropped: usize,
}

/// Status snapshot for one engine version.
#[derive(Debug, Clone)]
pub struct EngineVersionStatus {
    /// Version identifier.
    pub version: VersionId,
    /// Current lifecycle state.
    pub state: LifecycleState,
    /// Contexts currently controlled by this version.
    pub controlled_contexts: usize,
}

/// One engine version: lifecycle, router, bus, and deferred work.
pub struct ServiceEngine {
    config: EngineConfig,
    lifecycle: LifecycleController,
    cache: Arc<CacheStore>,
    backend: Arc<dyn NetworkBackend>,
    router: InterceptionRouter,
    bus: MessageBus,
    tasks: DeferredTaskQueue,
    controlled: RwLock<HashSet<ContextId>>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ServiceEngine {
    /// Create a new engine version in the Installing state.
    pub fn new(
        mut config: EngineConfig,
        cache: Arc<CacheStore>,
        backend: Arc<dyn NetworkBackend>,
        event_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let version = VersionId::new();
        let routes = std::mem::take(&mut config.synthetic_routes);
        let router = InterceptionRouter::new(
            Arc::clone(&cache),
            config.generation.clone(),
            config.populate_policy,
            Arc::clone(&backend),
            config.fetch_timeout,
            routes,
        );

        Self {
            lifecycle: LifecycleController::new(version, event_tx.clone()),
            router,
            cache,
            backend,
            config,
            bus: MessageBus::new(),
            tasks: DeferredTaskQueue::new(),
            controlled: RwLock::new(HashSet::new()),
            event_tx,
        }
    }

    /// This version's identifier.
    pub fn version(&self) -> VersionId {
        self.lifecycle.version()
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> LifecycleState {
        self.lifecycle.state().await
    }

    /// Run the install hook: open this version's generation (fatal on
    /// failure) and pre-populate the shell allow-list (individual fetch
    /// failures are logged and skipped).
    pub async fn install(&self) -> Result<(), EngineError> {
        self.lifecycle
            .install(
                &self.cache,
                self.backend.as_ref(),
                &self.config.generation,
                &self.config.shell_urls,
                &self.config.shell_retry,
            )
            .await
    }

    /// Run the activate hook: garbage-collect every generation not in the
    /// allow-list. All deletions complete before this returns, so claiming
    /// never observes a half-collected store.
    pub async fn activate(&self) -> Result<(), EngineError> {
        self.lifecycle
            .activate(&self.cache, &self.config.keep_generations)
            .await
    }

    /// Mark this version redundant. Refused while it still controls
    /// contexts.
    pub async fn make_redundant(&self) -> Result<(), EngineError> {
        let controlled = self.controlled.read().await.len();
        self.lifecycle.make_redundant(controlled).await
    }

    /// Claim one context: attach it to this version's bus and return the
    /// context-side port. Only an active version may claim.
    pub async fn claim_one(&self, context: ContextId) -> Result<MessagePort, EngineError> {
        let state = self.lifecycle.state().await;
        if state != LifecycleState::Active {
            return Err(EngineError::InvalidState(format!(
                "cannot claim context in state {state:?}"
            )));
        }

        let port = self.bus.attach(context).await;
        self.controlled.write().await.insert(context);
        info!(version = %self.version(), %context, "Context claimed");
        let _ = self.event_tx.send(EngineEvent::ControllerChange {
            version: self.version(),
            context,
        });
        Ok(port)
    }

    /// Release one context (it terminated or was claimed by a newer
    /// version).
    pub async fn release(&self, context: ContextId) {
        if self.controlled.write().await.remove(&context) {
            self.bus.detach(context).await;
            debug!(version = %self.version(), %context, "Context released");
        }
    }

    /// Release every controlled context.
    pub async fn release_all(&self) {
        let contexts: Vec<ContextId> = self.controlled.write().await.drain().collect();
        for context in contexts {
            self.bus.detach(context).await;
        }
    }

    /// Number of contexts this version currently controls.
    pub async fn controlled_count(&self) -> usize {
        self.controlled.read().await.len()
    }

    /// Route one intercepted request: synthetic → cache-first → network.
    pub async fn handle_fetch(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError> {
        self.router.handle(request).await
    }

    /// Drain inbound context messages: interpret control messages, echo
    /// application messages back to their senders. Replies to terminated
    /// contexts are dropped silently.
    pub async fn pump_messages(&self) -> MessagePumpReport {
        let mut report = MessagePumpReport::default();

        for (context, envelope) in self.bus.poll().await {
            match envelope {
                Envelope::Control(ControlMessage::SkipWaiting) => {
                    info!(%context, "Skip-waiting requested");
                    report.skip_waiting_requested = true;
                }
                Envelope::Application(payload) => {
                    let reply = Envelope::Application(echo_reply(&payload));
                    match self.bus.send(context, reply).await {
                        Ok(()) => report.replies_sent += 1,
                        Err(e) => {
                            debug!(%context, error = %e, "Echo reply dropped");
                            report.replies_dropped += 1;
                        }
                    }
                }
            }
        }

        report
    }

    /// Register the completion action for a deferred-task tag. Fails when
    /// the platform offers no replay signalling.
    pub async fn register_deferred_task(
        &self,
        tag: &str,
        action: Arc<dyn TaskAction>,
    ) -> Result<(), TaskError> {
        self.tasks.register_tag(tag, action).await
    }

    /// Queue deferred work requested by a controlled context.
    pub async fn enqueue_deferred(&self, tag: &str, payload: JsonValue) {
        self.tasks.enqueue(tag, payload).await;
    }

    /// React to a readiness signal by draining matching deferred tasks.
    pub async fn signal_readiness(&self, signal: ReadinessSignal) -> offkit_sync::DrainReport {
        self.tasks.signal(signal).await
    }

    /// Handle one out-of-band push delivery: surface a notification
    /// synchronously. Display failure drops the delivery.
    pub fn handle_push(
        &self,
        payload: &JsonValue,
        surface: &dyn NotificationSurface,
    ) -> Result<PushNotification, PushError> {
        deliver_push(payload, surface)
    }

    /// Status snapshot for this version.
    pub async fn status(&self) -> EngineVersionStatus {
        EngineVersionStatus {
            version: self.version(),
            state: self.lifecycle.state().await,
            controlled_contexts: self.controlled.read().await.len(),
        }
    }
}

// ==================== Registry (registrar surface) ====================

/// Lifecycle observability flags for one registration.
#[derive(Debug, Clone)]
pub struct RegistrationStatus {
    /// Script reference this registration was created from.
    pub script_ref: String,
    /// The installing version, if any.
    pub installing: Option<EngineVersionStatus>,
    /// The installed-but-waiting version, if any.
    pub waiting: Option<EngineVersionStatus>,
    /// The active version, if any.
    pub active: Option<EngineVersionStatus>,
    /// Live cache generation names.
    pub generations: Vec<String>,
}

struct Registration {
    installing: Option<Arc<ServiceEngine>>,
    waiting: Option<Arc<ServiceEngine>>,
    active: Option<Arc<ServiceEngine>>,
}

/// The engine registry: the in-scope half of the registration protocol.
///
/// At most two versions of a registration are live at once: the old
/// active one and a new installing/waiting one.
pub struct EngineRegistry {
    cache: Arc<CacheStore>,
    backend: Arc<dyn NetworkBackend>,
    registrations: RwLock<HashMap<String, Registration>>,
    /// Attached front-end contexts and their pending context-side ports.
    contexts: RwLock<HashMap<ContextId, Option<MessagePort>>>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineRegistry {
    /// Create a registry over a shared cache store and network backend.
    /// The returned receiver carries lifecycle observability events.
    pub fn new(
        cache: Arc<CacheStore>,
        backend: Arc<dyn NetworkBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                cache,
                backend,
                registrations: RwLock::new(HashMap::new()),
                contexts: RwLock::new(HashMap::new()),
                event_tx,
            },
            event_rx,
        )
    }

    /// Register (or update) an engine for a script reference. A new
    /// version starts installing immediately; `updatefound` fires on the
    /// event channel. Install failure leaves the version stalled in
    /// Installing and is surfaced both as an error and as an event.
    pub async fn register(
        &self,
        script_ref: &str,
        config: EngineConfig,
    ) -> Result<(), EngineError> {
        let engine = Arc::new(ServiceEngine::new(
            config,
            Arc::clone(&self.cache),
            Arc::clone(&self.backend),
            self.event_tx.clone(),
        ));
        let version = engine.version();

        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(script_ref.to_string())
                .or_insert_with(|| Registration {
                    installing: None,
                    waiting: None,
                    active: None,
                });
            registration.installing = Some(Arc::clone(&engine));
        }

        info!(script_ref, %version, "Update found; installing new engine version");
        let _ = self.event_tx.send(EngineEvent::UpdateFound {
            script_ref: script_ref.to_string(),
        });

        if let Err(e) = engine.install().await {
            warn!(script_ref, %version, error = %e, "Install failed");
            let _ = self.event_tx.send(EngineEvent::InstallFailed {
                version,
                error: e.to_string(),
            });
            return Err(e);
        }

        // Installed: move to the waiting slot.
        {
            let mut registrations = self.registrations.write().await;
            if let Some(registration) = registrations.get_mut(script_ref) {
                registration.waiting = registration.installing.take();
            }
        }

        // Activate naturally when no older active version still controls
        // a context.
        let may_activate = {
            let registrations = self.registrations.read().await;
            match registrations.get(script_ref).and_then(|r| r.active.as_ref()) {
                None => true,
                Some(active) => active.controlled_count().await == 0,
            }
        };
        if may_activate {
            self.promote(script_ref).await?;
        }

        Ok(())
    }

    /// Promote the waiting version: run activation (generation GC), claim
    /// every attached context, and retire the previous active version.
    pub async fn promote(&self, script_ref: &str) -> Result<(), EngineError> {
        let engine = {
            let registrations = self.registrations.read().await;
            registrations
                .get(script_ref)
                .ok_or_else(|| EngineError::NotFound(script_ref.to_string()))?
                .waiting
                .clone()
                .ok_or_else(|| EngineError::InvalidState("no waiting version".to_string()))?
        };

        // GC completes inside activate() before any context is claimed.
        // The slots stay untouched until this succeeds, so a failed
        // activation leaves the previous active version serving.
        engine.activate().await?;

        let old_active = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(script_ref)
                .ok_or_else(|| EngineError::NotFound(script_ref.to_string()))?;
            registration.waiting = None;
            registration.active.replace(Arc::clone(&engine))
        };

        // Claim existing contexts without requiring a reload.
        {
            let mut contexts = self.contexts.write().await;
            for (context, port_slot) in contexts.iter_mut() {
                let port = engine.claim_one(*context).await?;
                *port_slot = Some(port);
            }
        }

        if let Some(old) = old_active {
            old.release_all().await;
            old.make_redundant().await?;
        }

        Ok(())
    }

    /// Explicit skip-waiting: promote the waiting version now.
    pub async fn skip_waiting(&self, script_ref: &str) -> Result<(), EngineError> {
        self.promote(script_ref).await
    }

    /// Attach a new front-end context. If an active version exists it is
    /// claimed immediately; otherwise it stays uncontrolled until the
    /// next activation.
    pub async fn attach_context(&self, script_ref: &str) -> Result<ContextId, EngineError> {
        let context = ContextId::new();
        let port = {
            let registrations = self.registrations.read().await;
            match registrations.get(script_ref).and_then(|r| r.active.clone()) {
                Some(active) => Some(active.claim_one(context).await?),
                None => None,
            }
        };
        self.contexts.write().await.insert(context, port);
        Ok(context)
    }

    /// Take the context-side message port for an attached context. Present
    /// once the context has been claimed by an active version.
    pub async fn take_context_port(&self, context: ContextId) -> Option<MessagePort> {
        self.contexts.write().await.get_mut(&context)?.take()
    }

    /// Detach a terminated context from the registry and from whichever
    /// version controls it.
    pub async fn detach_context(&self, script_ref: &str, context: ContextId) {
        self.contexts.write().await.remove(&context);
        let registrations = self.registrations.read().await;
        if let Some(active) = registrations.get(script_ref).and_then(|r| r.active.clone()) {
            active.release(context).await;
        }
    }

    /// The active engine version for a registration, if any.
    pub async fn active_engine(&self, script_ref: &str) -> Option<Arc<ServiceEngine>> {
        self.registrations
            .read()
            .await
            .get(script_ref)
            .and_then(|r| r.active.clone())
    }

    /// Drive the active version's message pump, honoring skip-waiting
    /// requests from its contexts.
    pub async fn pump(&self, script_ref: &str) -> Result<MessagePumpReport, EngineError> {
        let engine = self
            .active_engine(script_ref)
            .await
            .ok_or_else(|| EngineError::InvalidState("no active version".to_string()))?;

        let report = engine.pump_messages().await;
        if report.skip_waiting_requested {
            match self.promote(script_ref).await {
                Ok(()) => {}
                // No waiting version to promote; the request is a no-op.
                Err(EngineError::InvalidState(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Status snapshot the registrar can poll: lifecycle flags per slot
    /// plus live generation names.
    pub async fn status(&self, script_ref: &str) -> Result<RegistrationStatus, EngineError> {
        let registrations = self.registrations.read().await;
        let registration = registrations
            .get(script_ref)
            .ok_or_else(|| EngineError::NotFound(script_ref.to_string()))?;

        let installing = match &registration.installing {
            Some(engine) => Some(engine.status().await),
            None => None,
        };
        let waiting = match &registration.waiting {
            Some(engine) => Some(engine.status().await),
            None => None,
        };
        let active = match &registration.active {
            Some(engine) => Some(engine.status().await),
            None => None,
        };

        Ok(RegistrationStatus {
            script_ref: script_ref.to_string(),
            installing,
            waiting,
            active,
            generations: self.cache.generation_names().await,
        })
    }
}

// ==================== Test Utilities ====================


#[cfg(test)]
mod tests {
    use super::testutil::{url, MockBackend};
    use super::*;
    use serde_json::json;

    fn shell_backend() -> Arc<MockBackend> {
        let backend = MockBackend::new();
        backend.respond("https://app.example/", EngineResponse::ok("<html>"));
        backend.respond("https://app.example/index.html", EngineResponse::ok("<html>"));
        backend
    }

    fn shell_config(generation: &str) -> EngineConfig {
        EngineConfig::new(generation).with_shell_urls(vec![
            url("https://app.example/"),
            url("https://app.example/index.html"),
        ])
    }

    #[tokio::test]
    async fn test_register_installs_and_activates() {
        let cache = Arc::new(CacheStore::new());
        let backend = shell_backend();
        let (registry, mut events) = EngineRegistry::new(cache, backend);

        registry
            .register("engine.js", shell_config("shell-v1"))
            .await
            .unwrap();

        let status = registry.status("engine.js").await.unwrap();
        assert!(status.installing.is_none());
        assert!(status.waiting.is_none());
        let active = status.active.unwrap();
        assert_eq!(active.state, LifecycleState::Active);
        assert!(status.generations.contains(&"shell-v1".to_string()));

        // First event is updatefound.
        let event = events.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::UpdateFound { .. }));
    }

    #[tokio::test]
    async fn test_install_failure_stalls_in_installing() {
        let cache = Arc::new(CacheStore::with_config(offkit_cache::CacheStoreConfig {
            max_entries_per_generation: None,
            max_generations: Some(0),
        }));
        let backend = MockBackend::new();
        let (registry, mut events) = EngineRegistry::new(cache, backend);

        let err = registry
            .register("engine.js", EngineConfig::new("shell-v1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StoreOpenFailed(_)));

        let status = registry.status("engine.js").await.unwrap();
        let installing = status.installing.unwrap();
        assert_eq!(installing.state, LifecycleState::Installing);
        assert!(status.active.is_none());

        // updatefound, then the install failure surfaces on the channel.
        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::UpdateFound { .. }
        ));
        loop {
            match events.recv().await.unwrap() {
                EngineEvent::InstallFailed { .. } => break,
                EngineEvent::StateChange { .. } => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_echo_protocol_replies_only_to_sender() {
        let cache = Arc::new(CacheStore::new());
        let backend = shell_backend();
        let (registry, _events) = EngineRegistry::new(cache, backend);
        registry
            .register("engine.js", shell_config("shell-v1"))
            .await
            .unwrap();

        let ctx_a = registry.attach_context("engine.js").await.unwrap();
        let ctx_b = registry.attach_context("engine.js").await.unwrap();
        let mut port_a = registry.take_context_port(ctx_a).await.unwrap();
        let mut port_b = registry.take_context_port(ctx_b).await.unwrap();

        port_a
            .post(Envelope::application(json!({"type": "HELLO", "payload": "x"})))
            .unwrap();

        let report = registry.pump("engine.js").await.unwrap();
        assert_eq!(report.replies_sent, 1);

        let reply = port_a.try_recv().unwrap();
        match reply {
            Envelope::Application(value) => {
                assert_eq!(value["type"], "REPLY");
                assert!(value["payload"].as_str().unwrap().contains("\"x\""));
            }
            other => panic!("unexpected envelope: {other:?}"),
        }

        // The other context receives nothing.
        assert!(port_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_skip_waiting_control_message_promotes() {
        let cache = Arc::new(CacheStore::new());
        let backend = shell_backend();
        let (registry, _events) = EngineRegistry::new(cache, backend);

        registry
            .register("engine.js", shell_config("shell-v1"))
            .await
            .unwrap();
        let context = registry.attach_context("engine.js").await.unwrap();
        let port = registry.take_context_port(context).await.unwrap();

        let v1 = registry.active_engine("engine.js").await.unwrap().version();

        // A context is controlled, so v2 waits instead of activating.
        registry
            .register("engine.js", shell_config("shell-v2").keep("shell-v1"))
            .await
            .unwrap();
        let status = registry.status("engine.js").await.unwrap();
        assert!(status.waiting.is_some());
        assert_eq!(status.active.as_ref().unwrap().version, v1);

        // The controlled context sends the reserved control tag.
        port.post(Envelope::from_value(json!({"type": "SKIP_WAITING"})))
            .unwrap();
        registry.pump("engine.js").await.unwrap();

        let status = registry.status("engine.js").await.unwrap();
        assert!(status.waiting.is_none());
        assert_ne!(status.active.as_ref().unwrap().version, v1);
    }

    #[tokio::test]
    async fn test_old_version_becomes_redundant_on_promotion() {
        let cache = Arc::new(CacheStore::new());
        let backend = shell_backend();
        let (registry, _events) = EngineRegistry::new(cache, backend);

        registry
            .register("engine.js", shell_config("shell-v1"))
            .await
            .unwrap();
        let old = registry.active_engine("engine.js").await.unwrap();
        let context = registry.attach_context("engine.js").await.unwrap();
        registry.take_context_port(context).await.unwrap();

        registry
            .register("engine.js", shell_config("shell-v2").keep("shell-v1"))
            .await
            .unwrap();
        registry.skip_waiting("engine.js").await.unwrap();

        assert_eq!(old.state().await, LifecycleState::Redundant);
        assert_eq!(old.controlled_count().await, 0);

        // The context was re-claimed by the new version without reload.
        let new = registry.active_engine("engine.js").await.unwrap();
        assert_eq!(new.controlled_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_promotion_keeps_previous_active_serving() {
        let cache = Arc::new(CacheStore::new());
        let backend = shell_backend();
        let (registry, _events) = EngineRegistry::new(cache, backend);

        registry
            .register("engine.js", shell_config("shell-v1"))
            .await
            .unwrap();
        let context = registry.attach_context("engine.js").await.unwrap();
        registry.take_context_port(context).await.unwrap();
        let v1 = registry.active_engine("engine.js").await.unwrap().version();

        registry
            .register("engine.js", shell_config("shell-v2").keep("shell-v1"))
            .await
            .unwrap();

        // Push the waiting version past Installed so its activation hook
        // can no longer run.
        let waiting = registry
            .registrations
            .read()
            .await
            .get("engine.js")
            .unwrap()
            .waiting
            .clone()
            .unwrap();
        waiting.activate().await.unwrap();

        let err = registry.promote("engine.js").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        // The previous active version still serves and the waiting slot
        // survives for a later attempt.
        let status = registry.status("engine.js").await.unwrap();
        assert_eq!(status.active.as_ref().unwrap().version, v1);
        assert!(status.waiting.is_some());

        let engine = registry.active_engine("engine.js").await.unwrap();
        assert_eq!(engine.version(), v1);
        assert_eq!(engine.controlled_count().await, 1);
        let request = EngineRequest::get(url("https://app.example/index.html"));
        assert!(engine.handle_fetch(&request).await.unwrap().from_cache);
    }

    #[tokio::test]
    async fn test_natural_activation_when_no_controlled_contexts() {
        let cache = Arc::new(CacheStore::new());
        let backend = shell_backend();
        let (registry, _events) = EngineRegistry::new(cache, backend);

        registry
            .register("engine.js", shell_config("shell-v1"))
            .await
            .unwrap();

        // No contexts are controlled, so a new version activates directly.
        registry
            .register("engine.js", shell_config("shell-v2").keep("shell-v1"))
            .await
            .unwrap();
        let status = registry.status("engine.js").await.unwrap();
        assert!(status.waiting.is_none());
        assert_eq!(status.active.unwrap().state, LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_fetch_through_active_engine() {
        let cache = Arc::new(CacheStore::new());
        let backend = shell_backend();
        let (registry, _events) = EngineRegistry::new(cache, backend);
        registry
            .register("engine.js", shell_config("shell-v1"))
            .await
            .unwrap();

        let engine = registry.active_engine("engine.js").await.unwrap();

        // The shell was pre-populated at install; no network fetch happens.
        let request = EngineRequest::get(url("https://app.example/index.html"));
        let response = engine.handle_fetch(&request).await.unwrap();
        assert!(response.from_cache);
        assert_eq!(response.body, Bytes::from("<html>"));
    }

    #[tokio::test]
    async fn test_detach_context_drops_replies_silently() {
        let cache = Arc::new(CacheStore::new());
        let backend = shell_backend();
        let (registry, _events) = EngineRegistry::new(cache, backend);
        registry
            .register("engine.js", shell_config("shell-v1"))
            .await
            .unwrap();

        let context = registry.attach_context("engine.js").await.unwrap();
        let port = registry.take_context_port(context).await.unwrap();
        port.post(Envelope::application(json!({"type": "HELLO"})))
            .unwrap();

        let engine = registry.active_engine("engine.js").await.unwrap();

        // Pump picks the message up, but the context is gone before the
        // reply can be delivered.
        drop(port);
        registry.detach_context("engine.js", context).await;

        let report = engine.pump_messages().await;
        assert_eq!(report.replies_sent, 0);
    }

    #[tokio::test]
    async fn test_status_reports_generations() {
        let cache = Arc::new(CacheStore::new());
        cache.open("stale-v0").await.unwrap();
        let backend = shell_backend();
        let (registry, _events) = EngineRegistry::new(Arc::clone(&cache), backend);

        registry
            .register("engine.js", shell_config("shell-v1"))
            .await
            .unwrap();

        // Activation garbage-collected the stale generation.
        let status = registry.status("engine.js").await.unwrap();
        assert_eq!(status.generations, vec!["shell-v1".to_string()]);
    }

    #[test]
    fn test_engine_request_fingerprint_vary() {
        let a = EngineRequest::get(url("https://app.example/data"))
            .with_header("accept", "application/json")
            .with_header("x-custom", "1");
        let b = EngineRequest::get(url("https://app.example/data"))
            .with_header("accept", "application/json")
            .with_header("x-custom", "2");
        // Non-vary headers do not change the cache key.
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = EngineRequest::get(url("https://app.example/data"))
            .with_header("accept", "text/html");
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_response_cacheability() {
        assert!(EngineResponse::ok("x").is_cacheable());
        assert!(!EngineResponse::with_status(404, ResponseKind::Basic, "").is_cacheable());
        assert!(!EngineResponse::with_status(200, ResponseKind::Opaque, "").is_cacheable());
    }
}
