//! Sub-keys derived from the search master key.
//!
//! The master key never touches a vector or a string directly. Each use gets
//! its own HKDF-SHA-256 output, salted with the context id so that rotating
//! the context changes every derived key.

use crate::error::{SearchError, SearchResult};
use hkdf::Hkdf;
use sha2::Sha256;
use uuid::Uuid;
use zeroize::Zeroizing;

pub(crate) const SUB_KEY_SIZE: usize = 32;

/// Master keys shorter than this are refused.
pub const MIN_MASTER_KEY_SIZE: usize = 32;

const TRANSFORM_INFO: &[u8] = b"confidocs-search/v1/transform";
const NOISE_INFO: &[u8] = b"confidocs-search/v1/noise";
const TEXT_INFO: &[u8] = b"confidocs-search/v1/text";
const NOISE_SEED_INFO: &[u8] = b"confidocs-search/v1/noise-seed";

pub(crate) type SubKey = Zeroizing<[u8; SUB_KEY_SIZE]>;

pub(crate) struct SubKeys {
    pub transform: SubKey,
    pub noise: SubKey,
    pub text: SubKey,
}

impl SubKeys {
    pub fn derive(master_key: &[u8], context_id: Uuid) -> SearchResult<Self> {
        if master_key.len() < MIN_MASTER_KEY_SIZE {
            return Err(SearchError::KeyDerivation(format!(
                "master key is {} bytes, need at least {MIN_MASTER_KEY_SIZE}",
                master_key.len()
            )));
        }
        let hk = Hkdf::<Sha256>::new(Some(&context_id.as_bytes()[..]), master_key);
        Ok(Self {
            transform: expand(&hk, TRANSFORM_INFO)?,
            noise: expand(&hk, NOISE_INFO)?,
            text: expand(&hk, TEXT_INFO)?,
        })
    }
}

/// Seed for the perturbation of one vector, bound to its IV.
pub(crate) fn noise_seed(noise_key: &SubKey, iv: &[u8]) -> SearchResult<SubKey> {
    let hk = Hkdf::<Sha256>::new(Some(iv), &noise_key[..]);
    expand(&hk, NOISE_SEED_INFO)
}

fn expand(hk: &Hkdf<Sha256>, info: &[u8]) -> SearchResult<SubKey> {
    let mut okm = Zeroizing::new([0u8; SUB_KEY_SIZE]);
    hk.expand(info, &mut okm[..])
        .map_err(|e| SearchError::KeyDerivation(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}
