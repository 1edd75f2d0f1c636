//! The searchable encryption facade.
//!
//! A [`SearchEncryption`] is bound to exactly one index context. Every
//! operation takes the caller's idea of the context and refuses to run if
//! it is not the bound one, so values from two contexts never end up in the
//! same comparison. Callers never learn which backend is active.

use crate::backend::{EncryptedVector, SearchCipher, cipher_for};
use crate::context::{ContextManager, ContextSettings, EncryptionContext, SearchAlgorithm};
use crate::error::{SearchError, SearchResult};
use crate::master_key::MasterKey;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use confidocs_vault::{Deployment, SearchEncryptionMode};
use tracing::{info, warn};
use uuid::Uuid;

pub struct SearchEncryption {
    context: EncryptionContext,
    cipher: Box<dyn SearchCipher>,
}

impl SearchEncryption {
    /// Binds to `context`, keyed from `master_key`.
    pub fn new(context: EncryptionContext, master_key: &[u8]) -> SearchResult<Self> {
        let cipher = cipher_for(&context, master_key)?;
        Ok(Self { context, cipher })
    }

    /// Builds the layer for a running deployment, or `None` when search
    /// encryption is switched off.
    pub async fn from_config(deployment: &Deployment) -> SearchResult<Option<Self>> {
        let Some((manager, master_key)) = Self::manager_for(deployment).await? else {
            return Ok(None);
        };
        Self::from_manager(&manager, &master_key).await.map(Some)
    }

    /// Like [`Self::from_config`], for processes that only serve queries.
    /// Never creates a context; fails with [`SearchError::MissingContext`]
    /// until an indexer has made one.
    pub async fn attach_from_config(deployment: &Deployment) -> SearchResult<Option<Self>> {
        let Some((manager, master_key)) = Self::manager_for(deployment).await? else {
            return Ok(None);
        };
        Self::attach(&manager, &master_key).await.map(Some)
    }

    async fn manager_for(deployment: &Deployment) -> SearchResult<Option<(ContextManager, MasterKey)>> {
        let Some(algorithm) = algorithm_for(deployment.config.search_encryption) else {
            return Ok(None);
        };

        let master_key = MasterKey::load(deployment).await?;
        let manager = ContextManager::new(
            deployment.key_store.clone(),
            ContextSettings::from_config(&deployment.config, algorithm),
            master_key.version(),
        );
        Ok(Some((manager, master_key)))
    }

    /// Binds to the manager's current context, creating one if needed.
    ///
    /// Fails with [`SearchError::ContextMismatch`] when the stored context
    /// was made for another backend or master key version, and with
    /// [`SearchError::DimensionMismatch`] when it has another dimension.
    /// Both mean the index has to be rebuilt after a rotation.
    pub async fn from_manager(manager: &ContextManager, master_key: &MasterKey) -> SearchResult<Self> {
        let context = manager.current().await?;
        Self::bind(context, manager.settings(), master_key)
    }

    /// Binds to the stored context without ever creating one.
    pub async fn attach(manager: &ContextManager, master_key: &MasterKey) -> SearchResult<Self> {
        let context = manager.existing().await?;
        Self::bind(context, manager.settings(), master_key)
    }

    fn bind(context: EncryptionContext, settings: &ContextSettings, master_key: &MasterKey) -> SearchResult<Self> {
        if context.algorithm != settings.algorithm
            || context.key_name != master_key.name()
            || context.key_version != master_key.version()
        {
            return Err(SearchError::context_mismatch(
                format!("{}, {}@{}", settings.algorithm, master_key.name(), master_key.version()),
                &context,
            ));
        }
        if context.vector_dimension != settings.vector_dimension {
            return Err(SearchError::DimensionMismatch {
                expected: settings.vector_dimension,
                actual: context.vector_dimension,
            });
        }

        info!("Search encryption bound to context {context}");
        Self::new(context, master_key.as_bytes())
    }

    pub fn context(&self) -> &EncryptionContext {
        &self.context
    }

    pub fn encrypt_vector(&self, vector: &[f32], ctx: &EncryptionContext) -> SearchResult<EncryptedVector> {
        self.check_context(ctx)?;
        self.check_dimension(vector.len())?;
        self.cipher.encrypt_vector(vector)
    }

    pub fn decrypt_vector(&self, vector: &EncryptedVector, ctx: &EncryptionContext) -> SearchResult<Vec<f32>> {
        self.check_context(ctx)?;
        self.check_dimension(vector.values.len())?;
        self.cipher.decrypt_vector(vector)
    }

    pub fn encrypt_query(&self, vector: &[f32], ctx: &EncryptionContext) -> SearchResult<Vec<f32>> {
        self.check_context(ctx)?;
        self.check_dimension(vector.len())?;
        self.cipher.encrypt_query(vector)
    }

    /// Encrypts a text field to `"{tag}:{context_id}:{base64}"`.
    pub fn encrypt_text(&self, text: &str, ctx: &EncryptionContext) -> SearchResult<String> {
        self.check_context(ctx)?;
        let payload = self.cipher.encrypt_text(text)?;
        Ok(format!(
            "{}:{}:{}",
            self.cipher.algorithm().text_prefix(),
            self.context.context_id,
            STANDARD.encode(payload)
        ))
    }

    pub fn decrypt_text(&self, text: &str, ctx: &EncryptionContext) -> SearchResult<String> {
        self.check_context(ctx)?;

        let mut parts = text.splitn(3, ':');
        let (Some(prefix), Some(id), Some(body)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(SearchError::MalformedCiphertext(
                "expected tag:context:payload".to_string(),
            ));
        };
        let algorithm = SearchAlgorithm::from_text_prefix(prefix)
            .ok_or_else(|| SearchError::MalformedCiphertext(format!("unknown text tag '{prefix}'")))?;
        let context_id = Uuid::parse_str(id)
            .map_err(|_| SearchError::MalformedCiphertext("context id is not a UUID".to_string()))?;

        if algorithm != self.cipher.algorithm() || context_id != self.context.context_id {
            return Err(SearchError::context_mismatch(
                &self.context,
                format!("{context_id} ({algorithm})"),
            ));
        }

        let payload = STANDARD
            .decode(body)
            .map_err(|_| SearchError::MalformedCiphertext("payload is not base64".to_string()))?;
        self.cipher.decrypt_text(&payload)
    }

    fn check_context(&self, ctx: &EncryptionContext) -> SearchResult<()> {
        if self.context.same_index(ctx) {
            Ok(())
        } else {
            Err(SearchError::context_mismatch(&self.context, ctx))
        }
    }

    fn check_dimension(&self, actual: usize) -> SearchResult<()> {
        if actual == self.context.vector_dimension {
            Ok(())
        } else {
            Err(SearchError::DimensionMismatch {
                expected: self.context.vector_dimension,
                actual,
            })
        }
    }
}

fn algorithm_for(mode: SearchEncryptionMode) -> Option<SearchAlgorithm> {
    let algorithm = SearchAlgorithm::for_mode(mode)?;
    if algorithm == SearchAlgorithm::Simulated {
        warn!("Search encryption uses the simulated backend; do not use it in production");
    }
    Some(algorithm)
}
