//! Search encryption contexts.
//!
//! A context pins the backend, the master key version and the vector
//! dimension an index was built with. It is persisted as a key-store secret
//! so every process serving the same index agrees on it. One context per
//! index: values produced under two contexts are not comparable.

use crate::error::{SearchError, SearchResult};
use chrono::{DateTime, Duration, Utc};
use confidocs_vault::error::{KeyStoreError, KeyStoreErrorKind, VaultError};
use confidocs_vault::{KeyStore, SearchEncryptionMode, ServiceConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Content type of the persisted context secret.
pub const CONTEXT_CONTENT_TYPE: &str = "application/json";

/// Which transform produced an index's values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchAlgorithm {
    /// Deterministic keyed encoding, for development and tests.
    Simulated,
    /// Distance-comparison-preserving encryption.
    Dcpe,
}

impl SearchAlgorithm {
    /// The backend a configuration selects, `None` when search is off.
    pub fn for_mode(mode: SearchEncryptionMode) -> Option<Self> {
        match mode {
            SearchEncryptionMode::Off => None,
            SearchEncryptionMode::Simulated => Some(Self::Simulated),
            SearchEncryptionMode::Real => Some(Self::Dcpe),
        }
    }

    /// Tag at the front of encrypted text fields.
    pub fn text_prefix(self) -> &'static str {
        match self {
            Self::Simulated => "SIM",
            Self::Dcpe => "PPE",
        }
    }

    pub fn from_text_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "SIM" => Some(Self::Simulated),
            "PPE" => Some(Self::Dcpe),
            _ => None,
        }
    }
}

impl fmt::Display for SearchAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Simulated => "simulated",
            Self::Dcpe => "dcpe",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncryptionContext {
    pub context_id: Uuid,
    pub algorithm: SearchAlgorithm,
    /// Master key the sub-keys are derived from.
    pub key_name: String,
    pub key_version: String,
    pub vector_dimension: usize,
    /// Upper bound on the relative perturbation applied by the DCPE backend.
    pub approximation_factor: f32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl EncryptionContext {
    pub fn new(settings: &ContextSettings, key_version: &str, now: DateTime<Utc>) -> Self {
        Self {
            context_id: Uuid::new_v4(),
            algorithm: settings.algorithm,
            key_name: settings.key_name.clone(),
            key_version: key_version.to_string(),
            vector_dimension: settings.vector_dimension,
            approximation_factor: settings.approximation_factor,
            created_at: now,
            expires_at: now + settings.ttl,
        }
    }

    /// Whether values produced under `other` can be mixed with values
    /// produced under `self`.
    pub fn same_index(&self, other: &Self) -> bool {
        self.context_id == other.context_id
            && self.algorithm == other.algorithm
            && self.key_name == other.key_name
            && self.key_version == other.key_version
            && self.vector_dimension == other.vector_dimension
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn to_json(&self) -> SearchResult<String> {
        serde_json::to_string(self).map_err(|e| invalid(format!("cannot encode context: {e}")))
    }

    pub fn from_json(json: &str) -> SearchResult<Self> {
        serde_json::from_str(json).map_err(|e| invalid(format!("stored context is unreadable: {e}")))
    }
}

impl fmt::Display for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}@{}, dim {})",
            self.context_id, self.algorithm, self.key_name, self.key_version, self.vector_dimension
        )
    }
}

/// Summary of the active context that is safe to show to operators.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContextInfo {
    pub context_id: Uuid,
    pub algorithm: SearchAlgorithm,
    pub key_name: String,
    pub vector_dimension: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expired: bool,
}

impl From<&EncryptionContext> for ContextInfo {
    fn from(context: &EncryptionContext) -> Self {
        Self {
            context_id: context.context_id,
            algorithm: context.algorithm,
            key_name: context.key_name.clone(),
            vector_dimension: context.vector_dimension,
            created_at: context.created_at,
            expires_at: context.expires_at,
            expired: context.is_expired(),
        }
    }
}

/// What new contexts are stamped with and how long they are kept.
#[derive(Clone, Debug)]
pub struct ContextSettings {
    /// Secret the context is persisted under.
    pub secret_name: String,
    pub algorithm: SearchAlgorithm,
    pub key_name: String,
    pub vector_dimension: usize,
    pub approximation_factor: f32,
    pub ttl: Duration,
    /// How long a loaded context is served from memory.
    pub cache_for: Duration,
}

impl ContextSettings {
    pub fn from_config(config: &ServiceConfig, algorithm: SearchAlgorithm) -> Self {
        Self {
            secret_name: config.search_context_name.clone(),
            algorithm,
            key_name: config.search_encryption_key_name.clone(),
            vector_dimension: config.vector_dimension,
            approximation_factor: config.approximation_factor,
            ttl: Duration::days(config.search_context_ttl_days),
            cache_for: Duration::seconds(config.search_context_cache_secs),
        }
    }
}

struct CachedContext {
    context: EncryptionContext,
    loaded_at: DateTime<Utc>,
}

/// Loads, creates and rotates the persisted context of one index.
pub struct ContextManager {
    store: Arc<KeyStore>,
    settings: ContextSettings,
    key_version: String,
    cached: RwLock<Option<CachedContext>>,
}

impl ContextManager {
    /// `key_version` is the master key version new contexts record.
    pub fn new(store: Arc<KeyStore>, settings: ContextSettings, key_version: impl Into<String>) -> Self {
        Self {
            store,
            settings,
            key_version: key_version.into(),
            cached: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    /// Returns the active context, creating one if none is stored and
    /// replacing the stored one if it has expired.
    pub async fn current(&self) -> SearchResult<EncryptionContext> {
        let now = Utc::now();
        if let Some(context) = self.cached_at(now).await {
            return Ok(context);
        }

        let mut cached = self.cached.write().await;
        if let Some(hit) = cached.as_ref().filter(|c| self.is_fresh(c, now)) {
            return Ok(hit.context.clone());
        }

        let context = self.load_or_create(now).await?;
        *cached = Some(CachedContext {
            context: context.clone(),
            loaded_at: now,
        });
        Ok(context)
    }

    /// Returns the stored context without creating one.
    ///
    /// Query paths use this: a context created at query time could never
    /// match the index.
    pub async fn existing(&self) -> SearchResult<EncryptionContext> {
        let now = Utc::now();
        if let Some(context) = self.cached_at(now).await {
            return Ok(context);
        }
        let stored = self
            .store
            .read_secret(&self.settings.secret_name)
            .await?
            .ok_or(SearchError::MissingContext)?;
        if stored.content_type.as_deref().is_some_and(|ct| ct != CONTEXT_CONTENT_TYPE) {
            return Err(SearchError::MissingContext);
        }
        let context = EncryptionContext::from_json(&stored.value)?;
        if context.is_expired_at(now) {
            warn!("Search context {} expired at {}", context.context_id, context.expires_at);
        }
        Ok(context)
    }

    /// Replaces the stored context with a fresh one. Everything encrypted
    /// under the old context has to be re-indexed.
    pub async fn rotate(&self) -> SearchResult<EncryptionContext> {
        let mut cached = self.cached.write().await;
        let now = Utc::now();
        let context = self.store_new(now).await?;
        info!("Rotated search context to {}", context.context_id);
        *cached = Some(CachedContext {
            context: context.clone(),
            loaded_at: now,
        });
        Ok(context)
    }

    /// Re-stamps the stored context with this manager's key version when it
    /// was made under `previous_version` of the same master key. The
    /// context id is kept, so values already in the index stay comparable.
    ///
    /// For moves that keep the key bytes but store them anew, such as
    /// wrapping a plain master key for secure key release.
    pub async fn carry_over(&self, previous_version: &str) -> SearchResult<Option<EncryptionContext>> {
        let mut cached = self.cached.write().await;
        let Some(stored) = self.store.read_secret(&self.settings.secret_name).await? else {
            return Ok(None);
        };
        let mut context = EncryptionContext::from_json(&stored.value)?;
        if context.key_name != self.settings.key_name || context.key_version != previous_version {
            return Ok(None);
        }

        context.key_version = self.key_version.clone();
        self.store
            .replace_secret(&self.settings.secret_name, &context.to_json()?, CONTEXT_CONTENT_TYPE)
            .await?;
        *cached = None;
        info!(
            "Search context {} now bound to {}@{}",
            context.context_id, context.key_name, context.key_version
        );
        Ok(Some(context))
    }

    pub async fn info(&self) -> SearchResult<ContextInfo> {
        Ok(ContextInfo::from(&self.current().await?))
    }

    async fn cached_at(&self, now: DateTime<Utc>) -> Option<EncryptionContext> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|c| self.is_fresh(c, now))
            .map(|c| c.context.clone())
    }

    fn is_fresh(&self, cached: &CachedContext, now: DateTime<Utc>) -> bool {
        now - cached.loaded_at < self.settings.cache_for && !cached.context.is_expired_at(now)
    }

    async fn load_or_create(&self, now: DateTime<Utc>) -> SearchResult<EncryptionContext> {
        let fresh = EncryptionContext::new(&self.settings, &self.key_version, now);
        let encoded = fresh.to_json()?;
        let stored = self
            .store
            .get_or_create_secret(&self.settings.secret_name, CONTEXT_CONTENT_TYPE, || {
                Ok(Zeroizing::new(encoded))
            })
            .await?;
        let context = EncryptionContext::from_json(&stored.value)?;

        if context.is_expired_at(now) {
            warn!(
                "Search context {} expired at {}; replacing it, the index must be rebuilt",
                context.context_id, context.expires_at
            );
            return self.store_new(now).await;
        }
        debug!("Loaded search context {context}");
        Ok(context)
    }

    async fn store_new(&self, now: DateTime<Utc>) -> SearchResult<EncryptionContext> {
        let context = EncryptionContext::new(&self.settings, &self.key_version, now);
        self.store
            .replace_secret(&self.settings.secret_name, &context.to_json()?, CONTEXT_CONTENT_TYPE)
            .await?;
        Ok(context)
    }
}

fn invalid(message: String) -> SearchError {
    VaultError::from(KeyStoreError::new(KeyStoreErrorKind::Invalid, message)).into()
}
