//! Remote attestation client.
//!
//! Only secure-key-release deployments construct an [`Attestor`]; direct
//! deployments never touch this module. No retries are performed here.

use crate::bootstrap::Capabilities;
use crate::config::{ServiceConfig, WrapMode};
use crate::error::{AttestationError, AttestationFailure, VaultError, VaultResult};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// API path of the SEV-SNP attestation endpoint.
const ATTEST_PATH: &str = "attest/SevSnpVm";
const ATTEST_API_VERSION: &str = "2022-08-01";

/// A signed statement from the attestation authority. Short-lived and
/// never persisted.
#[derive(Clone)]
pub struct AttestationToken {
    raw: String,
    pub issuer: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct Claims {
    iss: String,
    exp: i64,
}

impl AttestationToken {
    /// Parses a compact JWT, reading `iss` and `exp` from its payload.
    ///
    /// The signature is not checked here; the key store verifies it when
    /// the token is presented for release.
    pub fn parse(raw: &str) -> Result<Self, AttestationError> {
        let malformed = |msg: &str| AttestationError::new(AttestationFailure::Malformed, msg);

        let mut parts = raw.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed("token is not a compact JWT"));
        };
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| malformed("token payload is not base64url"))?;
        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| malformed("token payload lacks iss/exp"))?;
        let expires_at = DateTime::from_timestamp(claims.exp, 0)
            .ok_or_else(|| malformed("token expiry out of range"))?;

        Ok(Self {
            raw: raw.to_string(),
            issuer: claims.iss,
            expires_at,
        })
    }

    /// The encoded token, for presenting to the key store.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

impl fmt::Debug for AttestationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestationToken")
            .field("issuer", &self.issuer)
            .field("expires_at", &self.expires_at)
            .field("raw", &"[REDACTED]")
            .finish()
    }
}

/// Obtains attestation tokens for this execution environment.
#[async_trait]
pub trait Attestor: Send + Sync {
    async fn attest(&self) -> Result<AttestationToken, AttestationError>;
}

/// Platform evidence. The format is opaque to this crate.
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    async fn collect(&self) -> Result<Vec<u8>, AttestationError>;
}

/// Evidence written to a file by the platform tooling.
pub struct FileEvidence {
    path: PathBuf,
}

impl FileEvidence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl EvidenceSource for FileEvidence {
    async fn collect(&self) -> Result<Vec<u8>, AttestationError> {
        let evidence = tokio::fs::read(&self.path).await.map_err(|e| {
            AttestationError::new(
                AttestationFailure::Rejected,
                format!("no evidence at {}: {e}", self.path.display()),
            )
        })?;
        if evidence.is_empty() {
            return Err(AttestationError::new(
                AttestationFailure::Rejected,
                format!("evidence file {} is empty", self.path.display()),
            ));
        }
        Ok(evidence)
    }
}

#[derive(Deserialize)]
struct AttestResponse {
    token: String,
}

/// Client for a Microsoft-Azure-Attestation-shaped authority.
pub struct MaaAttestor {
    client: Client,
    endpoint: String,
    evidence: Arc<dyn EvidenceSource>,
}

impl MaaAttestor {
    pub fn new(
        endpoint: impl Into<String>,
        evidence: Arc<dyn EvidenceSource>,
        timeout: std::time::Duration,
    ) -> VaultResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VaultError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            evidence,
        })
    }
}

#[async_trait]
impl Attestor for MaaAttestor {
    async fn attest(&self) -> Result<AttestationToken, AttestationError> {
        let evidence = self.evidence.collect().await?;
        let url = format!("{}/{ATTEST_PATH}", self.endpoint);
        debug!("Requesting attestation from {}", self.endpoint);

        let resp = self
            .client
            .post(&url)
            .query(&[("api-version", ATTEST_API_VERSION)])
            .json(&serde_json::json!({ "report": URL_SAFE_NO_PAD.encode(&evidence) }))
            .send()
            .await
            .map_err(|e| {
                AttestationError::new(AttestationFailure::Unreachable, format!("{}: {e}", self.endpoint))
            })?;

        let status = resp.status();
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            return Err(AttestationError::new(
                AttestationFailure::Rejected,
                format!("authority returned HTTP {status}"),
            ));
        }
        if !status.is_success() {
            return Err(AttestationError::new(
                AttestationFailure::Unreachable,
                format!("authority returned HTTP {status}"),
            ));
        }

        let body: AttestResponse = resp.json().await.map_err(|_| {
            AttestationError::new(AttestationFailure::Malformed, "response has no token")
        })?;
        AttestationToken::parse(&body.token)
    }
}

/// Development attestor that mints unsigned tokens for a fixed authority.
pub struct SimulatedAttestor {
    authority: String,
    ttl: Duration,
    reject: AtomicBool,
    calls: AtomicUsize,
}

impl SimulatedAttestor {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            ttl: Duration::minutes(5),
            reject: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Tokens expire `ttl` after issue. A negative ttl mints expired tokens.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Makes subsequent attestations fail as if the evidence were rejected.
    pub fn set_rejecting(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Number of attestations requested so far, successful or not.
    pub fn attestation_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn mint(&self) -> String {
        let now = Utc::now();
        let header = serde_json::json!({ "alg": "none", "typ": "JWT" });
        let claims = serde_json::json!({
            "iss": self.authority,
            "iat": now.timestamp(),
            "exp": (now + self.ttl).timestamp(),
            "x-ms-attestation-type": "simulated",
        });
        format!(
            "{}.{}.",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        )
    }
}

#[async_trait]
impl Attestor for SimulatedAttestor {
    async fn attest(&self) -> Result<AttestationToken, AttestationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(AttestationError::new(
                AttestationFailure::Rejected,
                "simulated authority rejected the evidence",
            ));
        }
        AttestationToken::parse(&self.mint())
    }
}

/// Builds the attestor for a deployment. Direct deployments get `None`.
pub fn attestor_from_config(
    config: &ServiceConfig,
    capabilities: &Capabilities,
) -> VaultResult<Option<Arc<dyn Attestor>>> {
    if config.mode != WrapMode::SecureKeyRelease {
        return Ok(None);
    }
    let endpoint = config.attestation_endpoint.as_deref().ok_or_else(|| {
        VaultError::Config("attestation_endpoint is required in secure-key-release mode".to_string())
    })?;

    if capabilities.simulated_attestation {
        warn!("Using SIMULATED attestation for {endpoint}; not for production use");
        return Ok(Some(Arc::new(SimulatedAttestor::new(endpoint))));
    }

    let path = config
        .attestation_evidence_path
        .as_ref()
        .filter(|_| capabilities.attestation_evidence)
        .ok_or_else(|| {
            VaultError::Config(
                "secure-key-release mode needs attestation evidence, none found on this host"
                    .to_string(),
            )
        })?;
    let attestor = MaaAttestor::new(
        endpoint,
        Arc::new(FileEvidence::new(path.clone())),
        config.request_timeout(),
    )?;
    Ok(Some(Arc::new(attestor)))
}
