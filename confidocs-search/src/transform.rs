//! Keyed orthogonal map shared by both backends.
//!
//! A permutation of the coordinates, a sign flip per coordinate and one
//! global scale. The first two are orthogonal and the scale is uniform, so
//! cosine similarity and the order of Euclidean distances are unchanged.

use crate::keys::SubKey;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use zeroize::{Zeroize, ZeroizeOnDrop};

const MIN_SCALE: f32 = 1.0;
const MAX_SCALE: f32 = 8.0;

#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct KeyedTransform {
    /// Output position of each input coordinate.
    permutation: Vec<usize>,
    signs: Vec<f32>,
    scale: f32,
}

impl KeyedTransform {
    pub fn new(key: &SubKey, dimension: usize) -> Self {
        let mut rng = ChaCha20Rng::from_seed(**key);
        let mut permutation: Vec<usize> = (0..dimension).collect();
        permutation.shuffle(&mut rng);
        let signs = (0..dimension)
            .map(|_| if rng.r#gen::<bool>() { 1.0 } else { -1.0 })
            .collect();
        let scale = rng.gen_range(MIN_SCALE..MAX_SCALE);
        Self {
            permutation,
            signs,
            scale,
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Callers check that `v` has the transform's dimension.
    pub fn apply(&self, v: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; self.permutation.len()];
        for ((x, &to), sign) in v.iter().zip(&self.permutation).zip(&self.signs) {
            out[to] = x * sign * self.scale;
        }
        out
    }

    pub fn invert(&self, c: &[f32]) -> Vec<f32> {
        self.permutation
            .iter()
            .zip(&self.signs)
            .map(|(&from, sign)| c[from] / (sign * self.scale))
            .collect()
    }
}
