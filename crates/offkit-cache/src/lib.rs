//! # OffKit Cache
//!
//! Named, versioned response cache for the OffKit interception engine.
//!
//! ## Features
//!
//! - **Generations**: independently named cache namespaces (`app-shell-v1`)
//! - **Fingerprints**: normalized request keys, exact-match lookup only
//! - **Last write wins**: `put` overwrites any existing entry for a key
//! - **Generation GC**: stale names are deleted wholesale on activation
//!
//! ## Architecture
//!
//! ```text
//! CacheStore
//!     ├── "app-shell-v1" (CacheGeneration)
//!     │       └── Fingerprint → CachedResponse
//!     └── "app-shell-v2" (CacheGeneration)
//!             └── Fingerprint → CachedResponse
//! ```
//!
//! Each generation sits behind its own lock so concurrent request handlers
//! touching different generations never contend.

use bytes::Bytes;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};
use url::Url;

// ==================== Errors ====================

/// Errors that can occur in cache store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Opening a generation failed. Fatal to an installing engine version.
    #[error("Store open failed: {0}")]
    OpenFailed(String),

    /// Writing an entry failed (store full, serialization). Non-fatal to
    /// the response already in flight.
    #[error("Store write failed: {0}")]
    WriteFailed(String),
}

// ==================== Fingerprint ====================

/// Normalized request fingerprint used as the cache key.
///
/// Derived from (method, URL, relevant headers): the method is uppercased,
/// the URL fragment is stripped, and headers are lowercased and sorted so
/// two equivalent requests always produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute a fingerprint from request parts.
    pub fn new(method: &str, url: &Url, vary_headers: &[(String, String)]) -> Self {
        let mut normalized = url.clone();
        normalized.set_fragment(None);

        let mut headers: Vec<String> = vary_headers
            .iter()
            .map(|(name, value)| format!("{}={}", name.to_ascii_lowercase(), value))
            .collect();
        headers.sort();

        Self(format!(
            "{} {} [{}]",
            method.to_ascii_uppercase(),
            normalized,
            headers.join(",")
        ))
    }

    /// Fingerprint for a plain GET with no vary headers.
    pub fn get(url: &Url) -> Self {
        Self::new("GET", url, &[])
    }

    /// The normalized key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ==================== Cached Response ====================

/// Classification of a captured response, used to judge cacheability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ResponseKind {
    /// Same-origin response with readable headers and body.
    #[default]
    Basic,
    /// Cross-origin response with an unreadable body.
    Opaque,
    /// A network-level error response.
    Error,
}

/// A captured response stored in a generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Response status code.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body. `Bytes` clones are cheap, so one capture can serve
    /// both the requester and the store.
    pub body: Bytes,

    /// Response classification.
    pub kind: ResponseKind,

    /// Capture timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CachedResponse {
    /// Create a basic 200 response.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body: body.into(),
            kind: ResponseKind::Basic,
            cached_at: now_ms(),
        }
    }

    /// Create a response with explicit status and kind.
    pub fn with_status(status: u16, kind: ResponseKind, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
            kind,
            cached_at: now_ms(),
        }
    }

    /// Set a header, replacing any existing value.
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
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ==================== Cache Generation ====================

/// One named cache generation owning its entries exclusively.
#[derive(Debug)]
pub struct CacheGeneration {
    /// Generation name (e.g. `app-shell-v1`).
    pub name: String,

    /// Entry capacity, if limited.
    max_entries: Option<usize>,

    /// Stored entries, unique per fingerprint.
    entries: HashMap<Fingerprint, CachedResponse>,
}

impl CacheGeneration {
    fn new(name: &str, max_entries: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            max_entries,
            entries: HashMap::new(),
        }
    }

    /// Exact fingerprint lookup.
    pub fn match_entry(&self, key: &Fingerprint) -> Option<&CachedResponse> {
        self.entries.get(key)
    }

    /// Insert an entry, overwriting any existing one for the same key.
    pub fn put(&mut self, key: Fingerprint, response: CachedResponse) -> Result<(), StoreError> {
        if let Some(max) = self.max_entries {
            // Overwrites never grow the map, so they are always allowed.
            if self.entries.len() >= max && !self.entries.contains_key(&key) {
                return Err(StoreError::WriteFailed(format!(
                    "generation '{}' is full ({} entries)",
                    self.name, max
                )));
            }
        }
        self.entries.insert(key, response);
        Ok(())
    }

    /// Remove one entry. Returns `false` if absent.
    pub fn delete(&mut self, key: &Fingerprint) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All stored fingerprints.
    pub fn keys(&self) -> Vec<Fingerprint> {
        self.entries.keys().cloned().collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the generation holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Generation Handle ====================

/// Shared handle to one open generation.
///
/// Handles returned by [`CacheStore::open`] for the same name refer to the
/// same underlying generation.
#[derive(Debug, Clone)]
pub struct GenerationHandle {
    inner: Arc<RwLock<CacheGeneration>>,
}

impl GenerationHandle {
    /// Generation name.
    pub async fn name(&self) -> String {
        self.inner.read().await.name.clone()
    }

    /// Exact fingerprint lookup, returning a clone of the stored response.
    pub async fn match_request(&self, key: &Fingerprint) -> Option<CachedResponse> {
        let generation = self.inner.read().await;
        let hit = generation.match_entry(key).cloned();
        trace!(generation = %generation.name, key = %key, hit = hit.is_some(), "Cache lookup");
        hit
    }

    /// Store a response under a fingerprint (last write wins).
    pub async fn put(&self, key: Fingerprint, response: CachedResponse) -> Result<(), StoreError> {
        let mut generation = self.inner.write().await;
        generation.put(key, response)
    }

    /// Remove one entry. Returns `false` if absent.
    pub async fn delete(&self, key: &Fingerprint) -> bool {
        self.inner.write().await.delete(key)
    }

    /// All stored fingerprints.
    pub async fn keys(&self) -> Vec<Fingerprint> {
        self.inner.read().await.keys()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

// ==================== Cache Store ====================

/// Cache store configuration.
#[derive(Debug, Clone, Default)]
pub struct CacheStoreConfig {
    /// Maximum number of entries per generation (None = unlimited).
    pub max_entries_per_generation: Option<usize>,

    /// Maximum number of live generations (None = unlimited). Opening a
    /// new name beyond this limit fails with [`StoreError::OpenFailed`].
    pub max_generations: Option<usize>,
}

/// The set of all named cache generations.
#[derive(Debug)]
pub struct CacheStore {
    config: CacheStoreConfig,
    generations: RwLock<HashMap<String, Arc<RwLock<CacheGeneration>>>>,
}

impl CacheStore {
    /// Create an empty store with default (unlimited) configuration.
    pub fn new() -> Self {
        Self::with_config(CacheStoreConfig::default())
    }

    /// Create an empty store with the given configuration.
    pub fn with_config(config: CacheStoreConfig) -> Self {
        Self {
            config,
            generations: RwLock::new(HashMap::new()),
        }
    }

    /// Open a generation, creating it if absent. Idempotent: two opens of
    /// the same name return handles to the same generation.
    pub async fn open(&self, name: &str) -> Result<GenerationHandle, StoreError> {
        let mut generations = self.generations.write().await;

        if let Some(existing) = generations.get(name) {
            return Ok(GenerationHandle {
                inner: Arc::clone(existing),
            });
        }

        if let Some(max) = self.config.max_generations {
            if generations.len() >= max {
                warn!(name, max, "Refusing to open generation beyond limit");
                return Err(StoreError::OpenFailed(format!(
                    "generation limit reached ({} live, {} max)",
                    generations.len(),
                    max
                )));
            }
        }

        debug!(name, "Creating cache generation");
        let generation = Arc::new(RwLock::new(CacheGeneration::new(
            name,
            self.config.max_entries_per_generation,
        )));
        generations.insert(name.to_string(), Arc::clone(&generation));

        Ok(GenerationHandle { inner: generation })
    }

    /// Whether a generation with this name exists.
    pub async fn has(&self, name: &str) -> bool {
        self.generations.read().await.contains_key(name)
    }

    /// Names of all live generations.
    pub async fn generation_names(&self) -> Vec<String> {
        self.generations.read().await.keys().cloned().collect()
    }

    /// Delete an entire generation and all its entries. Returns `false`
    /// if no generation had that name.
    pub async fn delete_generation(&self, name: &str) -> bool {
        let removed = self.generations.write().await.remove(name).is_some();
        if removed {
            debug!(name, "Deleted cache generation");
        }
        removed
    }

    /// Lookup a fingerprint in a named generation without holding a handle.
    pub async fn match_request(&self, name: &str, key: &Fingerprint) -> Option<CachedResponse> {
        let generation = {
            let generations = self.generations.read().await;
            generations.get(name).cloned()
        }?;
        let generation = generation.read().await;
        generation.match_entry(key).cloned()
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}
