//! Deterministic, reversible stand-in for the real backend.
//!
//! Vectors go through the keyed orthogonal map with no noise, so rankings
//! are preserved exactly. Text is XOR'd with a keystream that depends only
//! on the key: equal plaintexts give equal ciphertexts. Not for production.

use crate::backend::{EncryptedVector, SearchCipher};
use crate::context::{EncryptionContext, SearchAlgorithm};
use crate::error::{SearchError, SearchResult};
use crate::keys::{SubKey, SubKeys};
use crate::transform::KeyedTransform;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use zeroize::Zeroizing;

pub struct SimulatedCipher {
    transform: KeyedTransform,
    text_key: SubKey,
}

impl SimulatedCipher {
    pub fn new(context: &EncryptionContext, master_key: &[u8]) -> SearchResult<Self> {
        let keys = SubKeys::derive(master_key, context.context_id)?;
        Ok(Self {
            transform: KeyedTransform::new(&keys.transform, context.vector_dimension),
            text_key: keys.text,
        })
    }

    fn keystream_xor(&self, data: &[u8]) -> Vec<u8> {
        let mut stream = Zeroizing::new(vec![0u8; data.len()]);
        ChaCha20Rng::from_seed(*self.text_key).fill_bytes(&mut stream);
        data.iter().zip(stream.iter()).map(|(d, k)| d ^ k).collect()
    }
}

impl SearchCipher for SimulatedCipher {
    fn algorithm(&self) -> SearchAlgorithm {
        SearchAlgorithm::Simulated
    }

    fn encrypt_vector(&self, vector: &[f32]) -> SearchResult<EncryptedVector> {
        Ok(EncryptedVector {
            values: self.transform.apply(vector),
            iv: None,
        })
    }

    fn decrypt_vector(&self, vector: &EncryptedVector) -> SearchResult<Vec<f32>> {
        if vector.iv.is_some() {
            return Err(SearchError::MalformedCiphertext(
                "simulated vectors carry no IV".to_string(),
            ));
        }
        Ok(self.transform.invert(&vector.values))
    }

    fn encrypt_query(&self, vector: &[f32]) -> SearchResult<Vec<f32>> {
        Ok(self.transform.apply(vector))
    }

    fn encrypt_text(&self, text: &str) -> SearchResult<Vec<u8>> {
        Ok(self.keystream_xor(text.as_bytes()))
    }

    fn decrypt_text(&self, payload: &[u8]) -> SearchResult<String> {
        String::from_utf8(self.keystream_xor(payload))
            .map_err(|_| SearchError::MalformedCiphertext("text is not valid UTF-8".to_string()))
    }
}
