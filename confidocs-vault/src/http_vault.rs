//! HTTP client for a Key-Vault-shaped REST API.
//!
//! Every request carries the configured `api-version` query parameter and,
//! when configured, a bearer token. Lookups map 404 to `Ok(None)`.

use crate::config::ServiceConfig;
use crate::error::{KeyStoreError, KeyStoreErrorKind, VaultError, VaultResult};
use crate::key_store::{KeyBundle, KeySpec, KeyVault, ReleasePolicy, SecretBundle};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use confidocs_crypto::KeyMaterial;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use zeroize::Zeroizing;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretResponse {
    value: String,
    id: String,
    content_type: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetSecretRequest<'a> {
    value: &'a str,
    content_type: &'a str,
}

#[derive(Deserialize)]
struct KeyResponse {
    key: JsonWebKey,
    #[serde(default)]
    attributes: KeyAttributes,
    release_policy: Option<PolicyEnvelope>,
}

#[derive(Deserialize)]
struct JsonWebKey {
    kid: String,
}

#[derive(Default, Deserialize, Serialize)]
struct KeyAttributes {
    #[serde(default)]
    exportable: bool,
}

/// Release policies travel as base64url JSON documents.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct PolicyEnvelope {
    content_type: String,
    data: String,
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct PolicyDocument {
    version: String,
    any_of: Vec<PolicyRule>,
}

#[derive(Deserialize, Serialize)]
struct PolicyRule {
    authority: String,
}

#[derive(Serialize)]
struct CreateKeyRequest {
    kty: &'static str,
    key_size: usize,
    attributes: KeyAttributes,
    release_policy: Option<PolicyEnvelope>,
}

#[derive(Serialize)]
struct ReleaseRequest<'a> {
    target: &'a str,
}

#[derive(Deserialize)]
struct ReleaseResponse {
    value: String,
}

/// [`KeyVault`] backed by a remote vault over HTTPS.
pub struct HttpKeyVault {
    client: Client,
    base_url: String,
    api_version: String,
    bearer_token: Option<String>,
}

impl HttpKeyVault {
    pub fn new(
        base_url: impl Into<String>,
        api_version: impl Into<String>,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> VaultResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VaultError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_version: api_version.into(),
            bearer_token,
        })
    }

    pub fn from_config(config: &ServiceConfig) -> VaultResult<Self> {
        Self::new(
            config.vault_url.clone(),
            config.vault_api_version.clone(),
            config.vault_bearer_token.clone(),
            config.request_timeout(),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.query(&[("api-version", self.api_version.as_str())]);
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, KeyStoreError> {
        let resp = self.authorize(request).send().await?;
        check_status(resp, what)
    }

    /// Like `send`, but a 404 is `Ok(None)`.
    async fn send_lookup(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<Option<Response>, KeyStoreError> {
        let resp = self.authorize(request).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!("{what}: not found");
            return Ok(None);
        }
        check_status(resp, what).map(Some)
    }
}

fn check_status(resp: Response, what: &str) -> Result<Response, KeyStoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let kind = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => KeyStoreErrorKind::Denied,
        StatusCode::NOT_FOUND => KeyStoreErrorKind::NotFound,
        StatusCode::CONFLICT => KeyStoreErrorKind::Conflict,
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            KeyStoreErrorKind::Transport
        }
        _ => KeyStoreErrorKind::Invalid,
    };
    Err(KeyStoreError::new(kind, format!("{what}: HTTP {status}")))
}

/// Object ids end in `/{name}/{version}`.
fn version_from_id(id: &str) -> Result<String, KeyStoreError> {
    id.rsplit('/')
        .next()
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| KeyStoreError::new(KeyStoreErrorKind::Invalid, format!("no version in id {id}")))
}

fn encode_policy(policy: &ReleasePolicy) -> Result<PolicyEnvelope, KeyStoreError> {
    let document = PolicyDocument {
        version: "1.0.0".to_string(),
        any_of: vec![PolicyRule {
            authority: policy.authority.clone(),
        }],
    };
    let json = serde_json::to_vec(&document)
        .map_err(|e| KeyStoreError::new(KeyStoreErrorKind::Invalid, e.to_string()))?;
    Ok(PolicyEnvelope {
        content_type: "application/json; charset=utf-8".to_string(),
        data: URL_SAFE_NO_PAD.encode(json),
    })
}

fn decode_policy(envelope: &PolicyEnvelope) -> Result<ReleasePolicy, KeyStoreError> {
    let invalid = |msg: String| KeyStoreError::new(KeyStoreErrorKind::Invalid, msg);
    let json = URL_SAFE_NO_PAD
        .decode(envelope.data.trim_end_matches('='))
        .map_err(|e| invalid(format!("release policy is not base64url: {e}")))?;
    let document: PolicyDocument = serde_json::from_slice(&json)
        .map_err(|e| invalid(format!("unparseable release policy: {e}")))?;
    document
        .any_of
        .into_iter()
        .next()
        .map(|rule| ReleasePolicy {
            authority: rule.authority,
        })
        .ok_or_else(|| invalid("release policy names no authority".to_string()))
}

fn key_bundle(name: &str, body: KeyResponse) -> Result<KeyBundle, KeyStoreError> {
    Ok(KeyBundle {
        name: name.to_string(),
        version: version_from_id(&body.key.kid)?,
        exportable: body.attributes.exportable,
        release_policy: body.release_policy.as_ref().map(decode_policy).transpose()?,
    })
}

#[async_trait]
impl KeyVault for HttpKeyVault {
    async fn get_secret(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<SecretBundle>, KeyStoreError> {
        let path = match version {
            Some(v) => format!("secrets/{name}/{v}"),
            None => format!("secrets/{name}"),
        };
        let Some(resp) = self
            .send_lookup(self.client.get(self.url(&path)), &format!("get secret {name}"))
            .await?
        else {
            return Ok(None);
        };
        let body: SecretResponse = resp.json().await?;
        Ok(Some(SecretBundle {
            name: name.to_string(),
            version: version_from_id(&body.id)?,
            value: Zeroizing::new(body.value),
            content_type: body.content_type,
        }))
    }

    async fn set_secret(
        &self,
        name: &str,
        value: &str,
        content_type: &str,
    ) -> Result<SecretBundle, KeyStoreError> {
        let request = self
            .client
            .put(self.url(&format!("secrets/{name}")))
            .json(&SetSecretRequest {
                value,
                content_type,
            });
        let resp = self.send(request, &format!("set secret {name}")).await?;
        let body: SecretResponse = resp.json().await?;
        Ok(SecretBundle {
            name: name.to_string(),
            version: version_from_id(&body.id)?,
            value: Zeroizing::new(body.value),
            content_type: body.content_type,
        })
    }

    async fn get_key(&self, name: &str) -> Result<Option<KeyBundle>, KeyStoreError> {
        let Some(resp) = self
            .send_lookup(
                self.client.get(self.url(&format!("keys/{name}"))),
                &format!("get key {name}"),
            )
            .await?
        else {
            return Ok(None);
        };
        let body: KeyResponse = resp.json().await?;
        key_bundle(name, body).map(Some)
    }

    async fn create_key(&self, name: &str, spec: &KeySpec) -> Result<KeyBundle, KeyStoreError> {
        let body = CreateKeyRequest {
            kty: "RSA-HSM",
            key_size: spec.size,
            attributes: KeyAttributes {
                exportable: spec.exportable,
            },
            release_policy: spec.release_policy.as_ref().map(encode_policy).transpose()?,
        };
        let request = self
            .client
            .post(self.url(&format!("keys/{name}/create")))
            .json(&body);
        let resp = self.send(request, &format!("create key {name}")).await?;
        let body: KeyResponse = resp.json().await?;
        key_bundle(name, body)
    }

    async fn release_key(
        &self,
        name: &str,
        version: &str,
        token: &str,
    ) -> Result<KeyMaterial, KeyStoreError> {
        let request = self
            .client
            .post(self.url(&format!("keys/{name}/{version}/release")))
            .json(&ReleaseRequest { target: token });
        let resp = self.send(request, &format!("release key {name}")).await?;
        let body: ReleaseResponse = resp.json().await?;
        let value = Zeroizing::new(body.value);
        STANDARD
            .decode(value.as_bytes())
            .map(Zeroizing::new)
            .map_err(|_| {
                KeyStoreError::new(
                    KeyStoreErrorKind::Invalid,
                    format!("released key {name} is not base64"),
                )
            })
    }
}
