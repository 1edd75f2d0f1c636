use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use confidocs_vault::error::KeyStoreErrorKind;
use confidocs_vault::http_vault::HttpKeyVault;
use confidocs_vault::key_store::{KeySpec, KeyVault, ReleasePolicy};
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn setup(server: &MockServer) -> HttpKeyVault {
    HttpKeyVault::new(
        server.uri(),
        "7.4",
        Some("vault-token".into()),
        Duration::from_secs(2),
    )
    .unwrap()
}

fn secret_body(server: &MockServer, name: &str, version: &str, value: &str) -> serde_json::Value {
    serde_json::json!({
        "value": value,
        "id": format!("{}/secrets/{name}/{version}", server.uri()),
        "contentType": "application/x-pem-file",
    })
}

fn policy_data(authority: &str) -> String {
    let document = serde_json::json!({
        "version": "1.0.0",
        "anyOf": [{ "authority": authority }],
    });
    URL_SAFE_NO_PAD.encode(document.to_string())
}

// ── Secrets ──

#[tokio::test]
async fn get_secret_parses_version_and_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/secrets/doc-rsa"))
        .and(query_param("api-version", "7.4"))
        .and(header("authorization", "Bearer vault-token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(secret_body(&server, "doc-rsa", "v7", "pem")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let vault = setup(&server).await;
    let secret = vault.get_secret("doc-rsa", None).await.unwrap().unwrap();
    assert_eq!(secret.version, "v7");
    assert_eq!(secret.value.as_str(), "pem");
    assert_eq!(secret.content_type.as_deref(), Some("application/x-pem-file"));
}

#[tokio::test]
async fn get_secret_by_version_uses_version_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/secrets/doc-rsa/v1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(secret_body(&server, "doc-rsa", "v1", "old")),
        )
        .mount(&server)
        .await;

    let vault = setup(&server).await;
    let secret = vault.get_secret("doc-rsa", Some("v1")).await.unwrap().unwrap();
    assert_eq!(secret.value.as_str(), "old");
}

#[tokio::test]
async fn missing_secret_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/secrets/absent"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let vault = setup(&server).await;
    assert!(vault.get_secret("absent", None).await.unwrap().is_none());
}

#[tokio::test]
async fn set_secret_puts_value_and_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/secrets/master"))
        .and(body_json(serde_json::json!({
            "value": "abcd",
            "contentType": "application/x-confidocs-master-key",
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(secret_body(&server, "master", "v1", "abcd")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let vault = setup(&server).await;
    let stored = vault
        .set_secret("master", "abcd", "application/x-confidocs-master-key")
        .await
        .unwrap();
    assert_eq!(stored.version, "v1");
}

// ── Status mapping ──

#[tokio::test]
async fn forbidden_maps_to_denied() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/secrets/locked"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let err = setup(&server).await.get_secret("locked", None).await.unwrap_err();
    assert_eq!(err.kind, KeyStoreErrorKind::Denied);
}

#[tokio::test]
async fn unauthorized_maps_to_denied() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/secrets/s"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = setup(&server).await.set_secret("s", "v", "t").await.unwrap_err();
    assert_eq!(err.kind, KeyStoreErrorKind::Denied);
}

#[tokio::test]
async fn conflict_maps_to_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/secrets/s"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let err = setup(&server).await.set_secret("s", "v", "t").await.unwrap_err();
    assert_eq!(err.kind, KeyStoreErrorKind::Conflict);
}

#[tokio::test]
async fn server_error_maps_to_transport() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/secrets/s"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = setup(&server).await.get_secret("s", None).await.unwrap_err();
    assert_eq!(err.kind, KeyStoreErrorKind::Transport);
}

#[tokio::test]
async fn garbage_body_maps_to_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/secrets/s"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = setup(&server).await.get_secret("s", None).await.unwrap_err();
    assert_eq!(err.kind, KeyStoreErrorKind::Invalid);
}

#[tokio::test]
async fn slow_vault_maps_to_transport() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/secrets/s"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let vault = HttpKeyVault::new(server.uri(), "7.4", None, Duration::from_millis(200)).unwrap();
    let err = vault.get_secret("s", None).await.unwrap_err();
    assert_eq!(err.kind, KeyStoreErrorKind::Transport);
}

#[tokio::test]
async fn unreachable_vault_maps_to_transport() {
    let vault = HttpKeyVault::new("http://127.0.0.1:1", "7.4", None, Duration::from_secs(1)).unwrap();
    let err = vault.get_secret("s", None).await.unwrap_err();
    assert_eq!(err.kind, KeyStoreErrorKind::Transport);
}

// ── Keys ──

#[tokio::test]
async fn get_key_decodes_release_policy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/keys/kek"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "key": { "kid": format!("{}/keys/kek/k3", server.uri()), "kty": "RSA-HSM" },
            "attributes": { "exportable": true },
            "release_policy": {
                "contentType": "application/json; charset=utf-8",
                "data": policy_data("https://attest.example"),
            },
        })))
        .mount(&server)
        .await;

    let key = setup(&server).await.get_key("kek").await.unwrap().unwrap();
    assert_eq!(key.version, "k3");
    assert!(key.exportable);
    assert_eq!(
        key.release_policy,
        Some(ReleasePolicy {
            authority: "https://attest.example".into()
        })
    );
}

#[tokio::test]
async fn get_key_without_policy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/keys/plain"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "key": { "kid": format!("{}/keys/plain/p1", server.uri()) },
        })))
        .mount(&server)
        .await;

    let key = setup(&server).await.get_key("plain").await.unwrap().unwrap();
    assert!(!key.exportable);
    assert!(key.release_policy.is_none());
}

#[tokio::test]
async fn create_key_sends_policy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/keys/kek/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "key": { "kid": format!("{}/keys/kek/new", server.uri()) },
            "attributes": { "exportable": true },
            "release_policy": {
                "contentType": "application/json; charset=utf-8",
                "data": policy_data("https://attest.example"),
            },
        })))
        .expect(1)
        .mount(&server)
        .await;

    let key = setup(&server)
        .await
        .create_key("kek", &KeySpec::releasable("https://attest.example"))
        .await
        .unwrap();
    assert_eq!(key.version, "new");

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["kty"], "RSA-HSM");
    assert_eq!(body["key_size"], 2048);
    assert_eq!(body["attributes"]["exportable"], true);
    assert!(body["release_policy"]["data"].is_string());
}

// ── Release ──

#[tokio::test]
async fn release_posts_token_and_decodes_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/keys/kek/k3/release"))
        .and(body_json(serde_json::json!({ "target": "attestation-jwt" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "value": STANDARD.encode([0x30, 0x82, 0x01]) })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let key = setup(&server)
        .await
        .release_key("kek", "k3", "attestation-jwt")
        .await
        .unwrap();
    assert_eq!(key.as_slice(), &[0x30, 0x82, 0x01]);
}

#[tokio::test]
async fn release_denied_by_policy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/keys/kek/k3/release"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let err = setup(&server)
        .await
        .release_key("kek", "k3", "jwt")
        .await
        .unwrap_err();
    assert_eq!(err.kind, KeyStoreErrorKind::Denied);
}

#[tokio::test]
async fn release_with_non_base64_value_is_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/keys/kek/k3/release"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "value": "%%%" })),
        )
        .mount(&server)
        .await;

    let err = setup(&server)
        .await
        .release_key("kek", "k3", "jwt")
        .await
        .unwrap_err();
    assert_eq!(err.kind, KeyStoreErrorKind::Invalid);
    assert!(!err.message.contains("%%%"));
}
