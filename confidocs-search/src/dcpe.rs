//! Distance-comparison-preserving encryption.
//!
//! Scale-and-perturb: each vector goes through the keyed orthogonal map and
//! then gets a noise vector drawn uniformly from a ball whose radius is
//! `scale * approximation_factor / 4`. The noise is seeded from the noise
//! sub-key and a random per-vector IV, so the key holder can strip it again.
//! Rankings survive up to the approximation factor.
//!
//! Text fields use ChaCha20-Poly1305 with a random nonce and the context id
//! as associated data.

use crate::backend::{EncryptedVector, NOISE_IV_SIZE, SearchCipher};
use crate::context::{EncryptionContext, SearchAlgorithm};
use crate::error::{SearchError, SearchResult};
use crate::keys::{SubKey, SubKeys, noise_seed};
use crate::transform::KeyedTransform;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::f64::consts::PI;
use uuid::Uuid;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

pub struct DcpeCipher {
    context_id: Uuid,
    transform: KeyedTransform,
    noise_key: SubKey,
    noise_radius: f32,
    text_cipher: ChaCha20Poly1305,
}

impl DcpeCipher {
    pub fn new(context: &EncryptionContext, master_key: &[u8]) -> SearchResult<Self> {
        let keys = SubKeys::derive(master_key, context.context_id)?;
        let transform = KeyedTransform::new(&keys.transform, context.vector_dimension);
        let noise_radius = transform.scale() * context.approximation_factor.max(0.0) / 4.0;
        let text_cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.text[..]));
        Ok(Self {
            context_id: context.context_id,
            transform,
            noise_key: keys.noise,
            noise_radius,
            text_cipher,
        })
    }

    fn noise(&self, iv: &[u8; NOISE_IV_SIZE], dimension: usize) -> SearchResult<Vec<f32>> {
        let seed = noise_seed(&self.noise_key, iv)?;
        let mut rng = ChaCha20Rng::from_seed(*seed);
        Ok(sample_in_ball(&mut rng, dimension, self.noise_radius))
    }

    fn perturb(&self, vector: &[f32]) -> SearchResult<EncryptedVector> {
        let mut iv = [0u8; NOISE_IV_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        let noise = self.noise(&iv, vector.len())?;
        let values = self
            .transform
            .apply(vector)
            .into_iter()
            .zip(noise)
            .map(|(x, n)| x + n)
            .collect();
        Ok(EncryptedVector {
            values,
            iv: Some(iv),
        })
    }
}

impl SearchCipher for DcpeCipher {
    fn algorithm(&self) -> SearchAlgorithm {
        SearchAlgorithm::Dcpe
    }

    fn encrypt_vector(&self, vector: &[f32]) -> SearchResult<EncryptedVector> {
        self.perturb(vector)
    }

    fn decrypt_vector(&self, vector: &EncryptedVector) -> SearchResult<Vec<f32>> {
        let iv = vector
            .iv
            .as_ref()
            .ok_or_else(|| SearchError::MalformedCiphertext("vector has no IV".to_string()))?;
        let noise = self.noise(iv, vector.values.len())?;
        let unperturbed: Vec<f32> = vector.values.iter().zip(noise).map(|(c, n)| c - n).collect();
        Ok(self.transform.invert(&unperturbed))
    }

    fn encrypt_query(&self, vector: &[f32]) -> SearchResult<Vec<f32>> {
        Ok(self.perturb(vector)?.values)
    }

    fn encrypt_text(&self, text: &str) -> SearchResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let payload = Payload {
            msg: text.as_bytes(),
            aad: self.context_id.as_bytes(),
        };
        let ciphertext = self
            .text_cipher
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| SearchError::Encryption("text encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt_text(&self, payload: &[u8]) -> SearchResult<String> {
        if payload.len() < NONCE_SIZE + TAG_SIZE {
            return Err(SearchError::MalformedCiphertext(format!(
                "text payload is {} bytes, shorter than nonce and tag",
                payload.len()
            )));
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);
        let plaintext = self
            .text_cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: self.context_id.as_bytes(),
                },
            )
            .map_err(|_| {
                SearchError::Decryption("authentication failed (wrong key or tampered text)".to_string())
            })?;
        String::from_utf8(plaintext)
            .map_err(|_| SearchError::MalformedCiphertext("text is not valid UTF-8".to_string()))
    }
}

/// Uniform sample from the ball of `radius` around the origin.
fn sample_in_ball(rng: &mut ChaCha20Rng, dimension: usize, radius: f32) -> Vec<f32> {
    if dimension == 0 || radius <= 0.0 {
        return vec![0.0; dimension];
    }
    let direction: Vec<f64> = (0..dimension).map(|_| standard_normal(rng)).collect();
    let norm = direction.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm == 0.0 {
        return vec![0.0; dimension];
    }
    let u: f64 = rng.r#gen();
    let r = f64::from(radius) * u.powf(1.0 / dimension as f64);
    direction.iter().map(|x| (x / norm * r) as f32).collect()
}

/// Box-Muller. `1 - u` keeps the logarithm finite.
fn standard_normal(rng: &mut ChaCha20Rng) -> f64 {
    let u1: f64 = 1.0 - rng.r#gen::<f64>();
    let u2: f64 = rng.r#gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}
