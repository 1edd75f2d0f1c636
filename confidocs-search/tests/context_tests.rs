mod support;

use chrono::{Duration, Utc};
use confidocs_search::context::CONTEXT_CONTENT_TYPE;
use confidocs_search::{
    ContextManager, ContextSettings, EncryptionContext, SearchAlgorithm, SearchError,
};
use confidocs_vault::KeyStore;
use confidocs_vault::memory_vault::MemoryKeyVault;
use pretty_assertions::assert_eq;
use std::sync::Arc;

const SECRET: &str = "search-encryption-context";

fn store() -> (Arc<MemoryKeyVault>, Arc<KeyStore>) {
    let vault = Arc::new(MemoryKeyVault::new());
    (vault.clone(), Arc::new(KeyStore::new(vault)))
}

fn manager_with(store: &Arc<KeyStore>, settings: ContextSettings) -> ContextManager {
    ContextManager::new(store.clone(), settings, "v1")
}

fn manager(store: &Arc<KeyStore>) -> ContextManager {
    manager_with(store, support::settings(SearchAlgorithm::Dcpe))
}

fn uncached() -> ContextSettings {
    ContextSettings {
        cache_for: Duration::zero(),
        ..support::settings(SearchAlgorithm::Dcpe)
    }
}

// ── Creation ──

#[tokio::test]
async fn first_call_creates_and_persists_context() {
    let (vault, store) = store();
    let context = manager(&store).current().await.unwrap();

    assert_eq!(context.algorithm, SearchAlgorithm::Dcpe);
    assert_eq!(context.key_name, "search-master-key");
    assert_eq!(context.key_version, "v1");
    assert_eq!(context.vector_dimension, support::DIMENSION);
    assert!(!context.is_expired());
    assert_eq!(context.expires_at - context.created_at, Duration::days(30));

    let stored = store.read_secret(SECRET).await.unwrap().unwrap();
    assert_eq!(stored.content_type.as_deref(), Some(CONTEXT_CONTENT_TYPE));
    assert_eq!(EncryptionContext::from_json(&stored.value).unwrap(), context);
    assert_eq!(vault.secret_version_count(SECRET).await, 1);
}

#[tokio::test]
async fn repeated_calls_reuse_context() {
    let (vault, store) = store();
    let manager = manager_with(&store, uncached());
    let first = manager.current().await.unwrap();
    let second = manager.current().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(vault.secret_version_count(SECRET).await, 1);
}

#[tokio::test]
async fn processes_share_the_stored_context() {
    let (vault, store) = store();
    let ours = manager(&store).current().await.unwrap();
    let theirs = manager(&Arc::new(KeyStore::new(vault))).current().await.unwrap();
    assert_eq!(ours.context_id, theirs.context_id);
}

#[tokio::test]
async fn concurrent_first_calls_agree() {
    let (vault, store) = store();
    let manager = manager(&store);
    let (a, b) = tokio::join!(manager.current(), manager.current());
    assert_eq!(a.unwrap().context_id, b.unwrap().context_id);
    assert_eq!(vault.secret_version_count(SECRET).await, 1);
}

// ── Expiry and rotation ──

#[tokio::test]
async fn expired_context_is_replaced() {
    let (_vault, store) = store();
    let past = Utc::now() - Duration::days(40);
    let expired = EncryptionContext::new(&support::settings(SearchAlgorithm::Dcpe), "v1", past);
    store
        .replace_secret(SECRET, &expired.to_json().unwrap(), CONTEXT_CONTENT_TYPE)
        .await
        .unwrap();

    let current = manager(&store).current().await.unwrap();
    assert_ne!(current.context_id, expired.context_id);
    assert!(!current.is_expired());

    let stored = store.read_secret(SECRET).await.unwrap().unwrap();
    assert_eq!(
        EncryptionContext::from_json(&stored.value).unwrap().context_id,
        current.context_id
    );
}

#[tokio::test]
async fn rotate_replaces_context() {
    let (vault, store) = store();
    let manager = manager(&store);
    let before = manager.current().await.unwrap();
    let rotated = manager.rotate().await.unwrap();

    assert_ne!(before.context_id, rotated.context_id);
    assert_eq!(manager.current().await.unwrap(), rotated);
    assert_eq!(vault.secret_version_count(SECRET).await, 2);
}

// ── Caching ──

#[tokio::test]
async fn cached_context_served_until_cache_expires() {
    let (_vault, store) = store();
    let cached = manager(&store);
    let uncached = manager_with(&store, uncached());
    let original = cached.current().await.unwrap();
    uncached.current().await.unwrap();

    // Another process rotates behind our back.
    let other = manager(&store).rotate().await.unwrap();

    assert_eq!(cached.current().await.unwrap().context_id, original.context_id);
    assert_eq!(uncached.current().await.unwrap().context_id, other.context_id);
}

// ── Query-time loading ──

#[tokio::test]
async fn existing_without_stored_context_is_missing() {
    let (vault, store) = store();
    let err = manager(&store).existing().await.unwrap_err();
    assert!(matches!(err, SearchError::MissingContext), "got: {err:?}");
    assert_eq!(vault.secret_version_count(SECRET).await, 0);
}

#[tokio::test]
async fn existing_returns_stored_context() {
    let (_vault, store) = store();
    let created = manager(&store).current().await.unwrap();
    assert_eq!(manager(&store).existing().await.unwrap(), created);
}

// ── Carry-over ──

#[tokio::test]
async fn carry_over_rebinds_key_version_and_keeps_id() {
    let (_vault, store) = store();
    let before = manager(&store).current().await.unwrap();

    let moved = ContextManager::new(store.clone(), support::settings(SearchAlgorithm::Dcpe), "v2");
    let carried = moved.carry_over("v1").await.unwrap().unwrap();

    assert_eq!(carried.context_id, before.context_id);
    assert_eq!(carried.key_version, "v2");
    assert_eq!(moved.current().await.unwrap(), carried);
}

#[tokio::test]
async fn carry_over_leaves_other_versions_alone() {
    let (vault, store) = store();
    let before = manager(&store).current().await.unwrap();

    let moved = ContextManager::new(store.clone(), support::settings(SearchAlgorithm::Dcpe), "v3");
    assert!(moved.carry_over("v2").await.unwrap().is_none());

    let stored = store.read_secret(SECRET).await.unwrap().unwrap();
    assert_eq!(EncryptionContext::from_json(&stored.value).unwrap(), before);
    assert_eq!(vault.secret_version_count(SECRET).await, 1);
}

#[tokio::test]
async fn carry_over_without_context_does_nothing() {
    let (vault, store) = store();
    assert!(manager(&store).carry_over("v0").await.unwrap().is_none());
    assert_eq!(vault.secret_version_count(SECRET).await, 0);
}

// ── Info ──

#[tokio::test]
async fn info_summarises_active_context() {
    let (_vault, store) = store();
    let manager = manager(&store);
    let context = manager.current().await.unwrap();
    let info = manager.info().await.unwrap();

    assert_eq!(info.context_id, context.context_id);
    assert_eq!(info.algorithm, SearchAlgorithm::Dcpe);
    assert_eq!(info.vector_dimension, support::DIMENSION);
    assert!(!info.expired);

    let json = serde_json::to_value(&info).unwrap();
    assert!(json.get("key_version").is_none());
}

#[tokio::test]
async fn unreadable_stored_context_is_an_error() {
    let (_vault, store) = store();
    store
        .replace_secret(SECRET, "not json", CONTEXT_CONTENT_TYPE)
        .await
        .unwrap();
    assert!(matches!(
        manager(&store).current().await,
        Err(SearchError::Vault(_))
    ));
}
