mod support;

use async_trait::async_trait;
use confidocs_vault::attestation::{AttestationToken, Attestor, SimulatedAttestor};
use confidocs_vault::error::{AttestationError, AttestationFailure, ReleaseFailure, VaultError};
use confidocs_vault::key_release::KeyReleaseClient;
use confidocs_vault::key_store::{KeyProtection, KeyReference, KeyStore};
use confidocs_vault::memory_vault::MemoryKeyVault;
use std::sync::Arc;
use std::time::Duration;
use support::{AUTHORITY, CountingHook, KEK_NAME};

struct Fixture {
    vault: Arc<MemoryKeyVault>,
    attestor: Arc<SimulatedAttestor>,
    hook: Arc<CountingHook>,
    client: KeyReleaseClient,
    key_ref: KeyReference,
}

async fn fixture_with(attestor: SimulatedAttestor) -> Fixture {
    let vault = support::vault_with_kek().await;
    let key_ref = KeyStore::new(vault.clone())
        .resolve_release_key(KEK_NAME, AUTHORITY)
        .await
        .unwrap();
    let attestor = Arc::new(attestor);
    let hook = Arc::new(CountingHook::default());
    let client = KeyReleaseClient::new(attestor.clone(), vault.clone(), Duration::from_secs(5))
        .with_hook(hook.clone());
    Fixture {
        vault,
        attestor,
        hook,
        client,
        key_ref,
    }
}

async fn fixture() -> Fixture {
    fixture_with(SimulatedAttestor::new(AUTHORITY)).await
}

fn release_cause(err: VaultError) -> ReleaseFailure {
    match err {
        VaultError::KeyRelease { cause, .. } => cause,
        other => panic!("expected VaultError::KeyRelease, got: {other:?}"),
    }
}

// ── Round trip ──

#[tokio::test]
async fn wrap_then_unwrap_returns_key() {
    let f = fixture().await;
    let wrapped = f.client.wrap_key(&[0x42; 32], &f.key_ref).await.unwrap();
    let unwrapped = f.client.unwrap_key(&wrapped, &f.key_ref).await.unwrap();
    assert_eq!(unwrapped.as_slice(), &[0x42; 32]);
}

#[tokio::test]
async fn released_material_discarded_after_each_call() {
    let f = fixture().await;
    let wrapped = f.client.wrap_key(&[1; 32], &f.key_ref).await.unwrap();
    f.client.unwrap_key(&wrapped, &f.key_ref).await.unwrap();

    assert_eq!(f.hook.acquired(), 2);
    assert_eq!(f.hook.resident(), 0);
}

#[tokio::test]
async fn every_release_attests_afresh() {
    let f = fixture().await;
    let wrapped = f.client.wrap_key(&[1; 32], &f.key_ref).await.unwrap();
    f.client.unwrap_key(&wrapped, &f.key_ref).await.unwrap();
    f.client.unwrap_key(&wrapped, &f.key_ref).await.unwrap();

    assert_eq!(f.attestor.attestation_count(), 3);
    assert_eq!(f.vault.release_count(), 3);
}

// ── Failure containment ──

#[tokio::test]
async fn rejected_attestation_is_attestation_rejected() {
    let f = fixture().await;
    let wrapped = f.client.wrap_key(&[7; 32], &f.key_ref).await.unwrap();
    let releases_before = f.vault.release_count();

    f.attestor.set_rejecting(true);
    let err = f.client.unwrap_key(&wrapped, &f.key_ref).await.unwrap_err();

    assert_eq!(release_cause(err), ReleaseFailure::AttestationRejected);
    assert_eq!(f.vault.release_count(), releases_before);
    assert_eq!(f.hook.resident(), 0);
    assert_eq!(f.hook.acquired(), 1, "only the successful wrap acquired material");
}

#[tokio::test]
async fn token_from_untrusted_authority_is_policy_denied() {
    let f = fixture_with(SimulatedAttestor::new("https://rogue.example")).await;
    let err = f.client.wrap_key(&[7; 32], &f.key_ref).await.unwrap_err();
    assert_eq!(release_cause(err), ReleaseFailure::PolicyDenied);
    assert_eq!(f.hook.acquired(), 0);
}

#[tokio::test]
async fn expired_token_is_policy_denied() {
    let attestor = SimulatedAttestor::new(AUTHORITY).with_ttl(chrono::Duration::minutes(-1));
    let f = fixture_with(attestor).await;
    let err = f.client.wrap_key(&[7; 32], &f.key_ref).await.unwrap_err();
    assert_eq!(release_cause(err), ReleaseFailure::PolicyDenied);
}

#[tokio::test]
async fn unreachable_vault_is_transport() {
    let f = fixture().await;
    f.vault.set_offline(true);
    let err = f.client.wrap_key(&[7; 32], &f.key_ref).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(release_cause(err), ReleaseFailure::Transport);
}

#[tokio::test]
async fn wrong_wrapped_blob_fails_without_residue() {
    let f = fixture().await;
    let mut wrapped = f.client.wrap_key(&[7; 32], &f.key_ref).await.unwrap();
    wrapped[10] ^= 0xFF;

    let err = f.client.unwrap_key(&wrapped, &f.key_ref).await.unwrap_err();
    assert!(matches!(err, VaultError::Decryption(_)), "got: {err:?}");
    assert_eq!(f.hook.resident(), 0);
}

#[tokio::test]
async fn non_release_reference_refused_before_attesting() {
    let f = fixture().await;
    let rsa_ref = KeyReference {
        name: "doc-rsa".into(),
        version: "v1".into(),
        protection: KeyProtection::RsaKeyPair,
    };
    let err = f.client.wrap_key(&[7; 32], &rsa_ref).await.unwrap_err();
    assert_eq!(release_cause(err), ReleaseFailure::PolicyDenied);
    assert_eq!(f.attestor.attestation_count(), 0);
}

#[tokio::test]
async fn unknown_key_version_is_policy_denied() {
    let f = fixture().await;
    let stale = f.key_ref.at_version("retired");
    let err = f.client.wrap_key(&[7; 32], &stale).await.unwrap_err();
    assert_eq!(release_cause(err), ReleaseFailure::PolicyDenied);
}

// ── Timeouts ──

struct StalledAttestor;

#[async_trait]
impl Attestor for StalledAttestor {
    async fn attest(&self) -> Result<AttestationToken, AttestationError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(AttestationError::new(AttestationFailure::Unreachable, "never"))
    }
}

#[tokio::test(start_paused = true)]
async fn timeout_is_transport_not_denial() {
    let vault = support::vault_with_kek().await;
    let key_ref = KeyStore::new(vault.clone())
        .resolve_release_key(KEK_NAME, AUTHORITY)
        .await
        .unwrap();
    let hook = Arc::new(CountingHook::default());
    let client = KeyReleaseClient::new(Arc::new(StalledAttestor), vault, Duration::from_secs(30))
        .with_hook(hook.clone());

    let err = client.unwrap_key(&[0u8; 256], &key_ref).await.unwrap_err();
    assert_eq!(release_cause(err), ReleaseFailure::Transport);
    assert_eq!(hook.acquired(), 0);
}

#[tokio::test]
async fn unreachable_authority_is_transport() {
    struct DownAttestor;

    #[async_trait]
    impl Attestor for DownAttestor {
        async fn attest(&self) -> Result<AttestationToken, AttestationError> {
            Err(AttestationError::new(AttestationFailure::Unreachable, "connection refused"))
        }
    }

    let vault = support::vault_with_kek().await;
    let key_ref = KeyStore::new(vault.clone())
        .resolve_release_key(KEK_NAME, AUTHORITY)
        .await
        .unwrap();
    let client = KeyReleaseClient::new(Arc::new(DownAttestor), vault, Duration::from_secs(5));
    let err = client.wrap_key(&[1; 32], &key_ref).await.unwrap_err();
    assert_eq!(release_cause(err), ReleaseFailure::Transport);
}
