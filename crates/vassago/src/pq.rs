//! Product quantizer: per-subvector k-means, byte codes, reconstruction.
//!
//! Vectors of dimension `dim` are split into `m` sub-vectors of length
//! `dim / m`; each sub-vector space gets its own codebook of `k` centroids
//! trained with Lloyd's algorithm. A coded vector is `m` bytes, one
//! nearest-centroid index per sub-quantizer.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use vassago_core::{Error, Result};

/// Training parameters.
#[derive(Debug, Clone, Copy)]
pub struct PqParams {
    /// Sub-quantizer count. Must divide the vector dimension.
    pub m: usize,
    /// Centroids per sub-quantizer. Clamped to the sample count.
    pub k: usize,
    /// Lloyd iterations.
    pub iters: usize,
    /// Seed for deterministic centroid initialization.
    pub seed: u64,
}

/// A trained product quantizer.
#[derive(Debug, Clone)]
pub struct ProductQuantizer {
    pub m: usize,
    pub k: usize,
    /// Sub-vector length.
    pub dsub: usize,
    /// One flat `k * dsub` centroid array per sub-quantizer.
    pub codebooks: Vec<Vec<f32>>,
}

impl ProductQuantizer {
    /// Train on `n = data.len() / dim` vectors of length `dim`.
    ///
    /// Each sub-quantizer trains independently (and in parallel) with its
    /// own seed derived from `params.seed`, so results do not depend on
    /// scheduling. Empty clusters keep their previous centroid.
    pub fn train(data: &[f32], dim: usize, params: &PqParams) -> Result<Self> {
        if dim == 0 || params.m == 0 || dim % params.m != 0 {
            return Err(Error::shape(format!(
                "dimension {dim} not divisible by sub-quantizer count {}",
                params.m
            )));
        }
        if data.len() % dim != 0 {
            return Err(Error::shape(format!(
                "data length {} not a multiple of dimension {dim}",
                data.len()
            )));
        }
        let n = data.len() / dim;
        if n == 0 {
            return Err(Error::shape("no vectors to train on"));
        }
        let k = params.k.clamp(1, n);
        let dsub = dim / params.m;

        let codebooks: Vec<Vec<f32>> = (0..params.m)
            .into_par_iter()
            .map(|i| {
                // gather this sub-quantizer's slice of every vector
                let mut subs = vec![0.0f32; n * dsub];
                for v in 0..n {
                    let src = &data[v * dim + i * dsub..v * dim + (i + 1) * dsub];
                    subs[v * dsub..(v + 1) * dsub].copy_from_slice(src);
                }
                let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(i as u64));
                kmeans(&subs, n, dsub, k, params.iters, &mut rng)
            })
            .collect();

        Ok(Self {
            m: params.m,
            k,
            dsub,
            codebooks,
        })
    }

    /// Vector dimension `m * dsub`.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.m * self.dsub
    }

    /// Encode vectors to codes, `m` bytes per vector.
    pub fn encode(&self, data: &[f32]) -> Vec<u8> {
        let dim = self.dim();
        let n = data.len() / dim;
        let mut codes = vec![0u8; n * self.m];
        for (i, cb) in self.codebooks.iter().enumerate() {
            for v in 0..n {
                let sub = &data[v * dim + i * self.dsub..v * dim + (i + 1) * self.dsub];
                codes[v * self.m + i] = nearest(sub, cb, self.k, self.dsub) as u8;
            }
        }
        codes
    }

    /// Reconstruct vectors from codes by concatenating selected centroids.
    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let n = codes.len() / self.m;
        let dim = self.dim();
        let mut out = vec![0.0f32; n * dim];
        for (i, cb) in self.codebooks.iter().enumerate() {
            for v in 0..n {
                let idx = codes[v * self.m + i] as usize;
                let src = &cb[idx * self.dsub..(idx + 1) * self.dsub];
                out[v * dim + i * self.dsub..v * dim + (i + 1) * self.dsub]
                    .copy_from_slice(src);
            }
        }
        out
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

fn nearest(sub: &[f32], codebook: &[f32], k: usize, dsub: usize) -> usize {
    let mut best = 0;
    let mut best_d = f32::INFINITY;
    for j in 0..k {
        let d = squared_l2(sub, &codebook[j * dsub..(j + 1) * dsub]);
        if d < best_d {
            best_d = d;
            best = j;
        }
    }
    best
}

/// Lloyd's k-means over `n` vectors of length `dsub`, returning a flat
/// `k * dsub` centroid array.
fn kmeans(subs: &[f32], n: usize, dsub: usize, k: usize, iters: usize, rng: &mut StdRng) -> Vec<f32> {
    // init: uniform sample without replacement
    let picks = rand::seq::index::sample(rng, n, k);
    let mut centroids = vec![0.0f32; k * dsub];
    for (j, v) in picks.iter().enumerate() {
        centroids[j * dsub..(j + 1) * dsub].copy_from_slice(&subs[v * dsub..(v + 1) * dsub]);
    }

    let mut assign = vec![0usize; n];
    for _ in 0..iters {
        for v in 0..n {
            assign[v] = nearest(&subs[v * dsub..(v + 1) * dsub], &centroids, k, dsub);
        }
        let mut counts = vec![0usize; k];
        let mut sums = vec![0.0f32; k * dsub];
        for v in 0..n {
            let c = assign[v];
            counts[c] += 1;
            for j in 0..dsub {
                sums[c * dsub + j] += subs[v * dsub + j];
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                continue; // empty cluster keeps its previous centroid
            }
            let inv = 1.0 / counts[c] as f32;
            for j in 0..dsub {
                centroids[c * dsub + j] = sums[c * dsub + j] * inv;
            }
        }
    }
    centroids
}
