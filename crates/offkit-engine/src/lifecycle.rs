//! Engine version lifecycle.
//!
//! Every engine version walks the same one-way path:
//!
//! ```text
//! Installing ──► Installed ──► Activating ──► Active ──► Redundant
//!     │ (waiting)                                           ▲
//!     └──────────────── install failure stalls here         │
//!                        any state may jump to Redundant ───┘
//! ```
//!
//! The install hook opens the version's cache generation and pre-populates
//! the app shell; the activate hook garbage-collects stale generations.
//! Activation deletions all complete before the version reports Active, so
//! a freshly claimed context never observes a half-collected store.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use offkit_cache::CacheStore;
use offkit_common::{retry_with_backoff, RetryConfig};

use crate::{EngineError, EngineEvent, EngineRequest, NetworkBackend};

// ==================== Version Identity ====================

/// Monotonic identifier for one engine version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionId(u64);

impl VersionId {
    /// Allocate a fresh version identifier.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for VersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// ==================== Lifecycle State ====================

/// Lifecycle states, in order. Transitions only move forward; the single
/// exception is that any non-redundant version may be retired directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// Running the install hook (or stalled after an install failure).
    #[default]
    Installing,
    /// Install complete; waiting for permission to activate.
    Installed,
    /// Running the activate hook (generation GC).
    Activating,
    /// Controlling contexts and intercepting their requests.
    Active,
    /// Retired. A redundant version never runs again.
    Redundant,
}

impl LifecycleState {
    fn rank(self) -> u8 {
        match self {
            LifecycleState::Installing => 0,
            LifecycleState::Installed => 1,
            LifecycleState::Activating => 2,
            LifecycleState::Active => 3,
            LifecycleState::Redundant => 4,
        }
    }

    /// Whether a transition from `self` to `next` is permitted.
    pub fn can_advance(self, next: LifecycleState) -> bool {
        next.rank() == self.rank() + 1
            || (next == LifecycleState::Redundant && self != LifecycleState::Redundant)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LifecycleState::Installing => "installing",
            LifecycleState::Installed => "installed",
            LifecycleState::Activating => "activating",
            LifecycleState::Active => "active",
            LifecycleState::Redundant => "redundant",
        };
        f.write_str(label)
    }
}

// ==================== Lifecycle Controller ====================

/// Drives one engine version through its lifecycle.
pub struct LifecycleController {
    version: VersionId,
    state: RwLock<LifecycleState>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl LifecycleController {
    /// Create a controller in the Installing state.
    pub fn new(version: VersionId, event_tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            version,
            state: RwLock::new(LifecycleState::Installing),
            event_tx,
        }
    }

    /// This controller's version.
    pub fn version(&self) -> VersionId {
        self.version
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    /// Transition to the next state. Backward or skipping transitions are
    /// refused.
    pub async fn advance(&self, next: LifecycleState) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        if !state.can_advance(next) {
            return Err(EngineError::InvalidState(format!(
                "cannot transition {} -> {}",
                *state, next
            )));
        }
        info!(version = %self.version, from = %*state, to = %next, "Lifecycle transition");
        *state = next;
        let _ = self.event_tx.send(EngineEvent::StateChange {
            version: self.version,
            state: next,
        });
        Ok(())
    }

    /// Run the install hook.
    ///
    /// Opening the generation is the critical step: failure is fatal and
    /// leaves the version stalled in Installing. Shell pre-population is
    /// best-effort; each fetch runs under the given retry policy, and an
    /// unreachable or uncacheable shell URL is logged and skipped.
    pub async fn install(
        &self,
        cache: &CacheStore,
        backend: &dyn NetworkBackend,
        generation: &str,
        shell_urls: &[Url],
        retry: &RetryConfig,
    ) -> Result<(), EngineError> {
        let handle = cache.open(generation).await.map_err(EngineError::from)?;

        for url in shell_urls {
            let request = EngineRequest::get(url.clone());
            match retry_with_backoff(retry, || backend.fetch(&request)).await {
                Ok(response) if response.is_cacheable() => {
                    if let Err(e) = handle.put(request.fingerprint(), response.to_cached()).await {
                        warn!(version = %self.version, %url, error = %e, "Shell entry not stored");
                    } else {
                        debug!(version = %self.version, %url, "Shell entry pre-populated");
                    }
                }
                Ok(response) => {
                    warn!(
                        version = %self.version,
                        %url,
                        status = response.status,
                        "Shell response not cacheable, skipped"
                    );
                }
                Err(e) => {
                    warn!(version = %self.version, %url, error = %e, "Shell fetch failed, skipped");
                }
            }
        }

        self.advance(LifecycleState::Installed).await
    }

    /// Run the activate hook: delete every generation whose name is not on
    /// the keep list. Every deletion completes before the version reports
    /// Active.
    pub async fn activate(
        &self,
        cache: &CacheStore,
        keep_generations: &[String],
    ) -> Result<(), EngineError> {
        self.advance(LifecycleState::Activating).await?;

        for name in cache.generation_names().await {
            if !keep_generations.contains(&name) {
                info!(version = %self.version, generation = %name, "Garbage-collecting stale generation");
                cache.delete_generation(&name).await;
            }
        }

        self.advance(LifecycleState::Active).await
    }

    /// Retire this version. Refused while it still controls contexts.
    pub async fn make_redundant(&self, controlled_contexts: usize) -> Result<(), EngineError> {
        if controlled_contexts > 0 {
            return Err(EngineError::InvalidState(format!(
                "version {} still controls {} context(s)",
                self.version, controlled_contexts
            )));
        }
        self.advance(LifecycleState::Redundant).await
    }
}
