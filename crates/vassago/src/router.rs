//! Cost-budgeted shard routing.
//!
//! The ROUTING section is a flat table over the shard bank: one entry per
//! shard in bank order, carrying a 64-dim L2-normalized key and a cost in
//! MiB of uncompressed payload. A text query hashes into the same key
//! space and shards are greedily selected by descending cosine similarity
//! under an optional cost budget.
//!
//! Section layout (little-endian):
//! `dim:u16, n:u32, shard_id:u32*n, cost:f32*n, key:f32[n*dim]`.

use xxhash_rust::xxh3::xxh3_64;

use vassago_core::{Error, Result};

use crate::shard;

/// Key dimension emitted by the writer. Parsers honor whatever the
/// section header declares.
pub const KEY_DIM: usize = 64;

/// Minimum shard cost in MiB.
pub const MIN_COST: f32 = 0.001;

/// One selected shard with the cost it was charged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    pub shard_id: u32,
    pub cost: f32,
}

/// Parsed routing table.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    dim: usize,
    shard_ids: Vec<u32>,
    costs: Vec<f32>,
    /// Flat `n * dim` keys, renormalized at parse time.
    keys: Vec<f32>,
}

impl RoutingTable {
    /// Key dimension declared by the section header.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of routed shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shard_ids.len()
    }

    /// True when the table routes no shards.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shard_ids.is_empty()
    }

    /// Shard ids in table order.
    #[must_use]
    pub fn shard_ids(&self) -> &[u32] {
        &self.shard_ids
    }

    /// Costs in table order.
    #[must_use]
    pub fn costs(&self) -> &[f32] {
        &self.costs
    }

    /// Parse the ROUTING section. The header `dim` is authoritative; keys
    /// are renormalized for numeric stability.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 6 {
            return Err(Error::format("routing: short header"));
        }
        let dim = u16::from_le_bytes([data[0], data[1]]) as usize;
        let n = u32::from_le_bytes(data[2..6].try_into().unwrap()) as usize;
        if dim == 0 {
            return Err(Error::format("routing: zero key dimension"));
        }
        let need = 6 + n * 4 + n * 4 + n * dim * 4;
        if data.len() < need {
            return Err(Error::format(format!(
                "routing: short table: need {need} bytes, have {}",
                data.len()
            )));
        }

        let mut off = 6;
        let mut shard_ids = Vec::with_capacity(n);
        for _ in 0..n {
            shard_ids.push(u32::from_le_bytes(data[off..off + 4].try_into().unwrap()));
            off += 4;
        }
        let mut costs = Vec::with_capacity(n);
        for _ in 0..n {
            costs.push(f32::from_le_bytes(data[off..off + 4].try_into().unwrap()));
            off += 4;
        }
        let mut keys = Vec::with_capacity(n * dim);
        for _ in 0..n * dim {
            keys.push(f32::from_le_bytes(data[off..off + 4].try_into().unwrap()));
            off += 4;
        }
        for key in keys.chunks_exact_mut(dim) {
            normalize(key);
        }

        Ok(Self {
            dim,
            shard_ids,
            costs,
            keys,
        })
    }

    /// Rank table entries by descending cosine against `query`; ties go to
    /// the lower index.
    #[must_use]
    pub fn rank(&self, query: &[f32]) -> Vec<usize> {
        let sims: Vec<f64> = self
            .keys
            .chunks_exact(self.dim)
            .map(|key| {
                key.iter()
                    .zip(query)
                    .map(|(a, b)| *a as f64 * *b as f64)
                    .sum()
            })
            .collect();
        let mut order: Vec<usize> = (0..sims.len()).collect();
        order.sort_by(|&a, &b| {
            sims[b]
                .partial_cmp(&sims[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        order
    }

    /// Greedily select up to `k` shards in ranked order. With a positive
    /// `budget`, a candidate that would push the accumulated cost past it
    /// is skipped and scanning continues.
    #[must_use]
    pub fn select(&self, query: &[f32], k: usize, budget: f64) -> Vec<Selection> {
        let mut selected = Vec::with_capacity(k.min(self.len()));
        let mut total = 0.0f64;
        for idx in self.rank(query) {
            let cost = self.costs[idx];
            if budget > 0.0 && total + cost as f64 > budget {
                continue;
            }
            selected.push(Selection {
                shard_id: self.shard_ids[idx],
                cost,
            });
            total += cost as f64;
            if selected.len() >= k {
                break;
            }
        }
        selected
    }
}

fn normalize(v: &mut [f32]) {
    let norm: f64 = v.iter().map(|&x| x as f64 * x as f64).sum();
    let inv = (1.0 / (norm.sqrt() + 1e-8)) as f32;
    for x in v {
        *x *= inv;
    }
}

/// Build a query key from a prompt: whitespace tokens hash into `dim`
/// buckets with unit increments, then L2-normalize.
#[must_use]
pub fn query_key(prompt: &str, dim: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dim];
    let mut tokens = prompt.split_whitespace().peekable();
    if tokens.peek().is_none() {
        v[(xxh3_64(b"") % dim as u64) as usize] += 1.0;
    } else {
        for t in tokens {
            v[(xxh3_64(t.as_bytes()) % dim as u64) as usize] += 1.0;
        }
    }
    normalize(&mut v);
    v
}

/// Build the ROUTING section from shard bank bytes: one entry per shard
/// in bank order with a deterministic per-index key and a size-derived
/// cost.
pub fn build_from_bank(bank: &[u8]) -> Result<Vec<u8>> {
    let records = shard::index_bank(bank)?;
    let n = records.len();

    let mut out = Vec::with_capacity(6 + n * (8 + KEY_DIM * 4));
    out.extend_from_slice(&(KEY_DIM as u16).to_le_bytes());
    out.extend_from_slice(&(n as u32).to_le_bytes());
    for i in 0..n {
        out.extend_from_slice(&(i as u32).to_le_bytes());
    }
    for rec in &records {
        let mib = rec.header.uncompressed_size as f32 / (1024.0 * 1024.0);
        out.extend_from_slice(&mib.max(MIN_COST).to_le_bytes());
    }
    for i in 0..n {
        let mut key = deterministic_key(i);
        normalize(&mut key);
        for v in key {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    Ok(out)
}

/// Deterministic pseudo-random key for shard index `i` (LCG over an
/// FNV-mixed seed).
fn deterministic_key(i: usize) -> Vec<f32> {
    let seed = 1469598103u32 ^ (i as u32).wrapping_mul(16777619);
    let mut s = seed;
    (0..KEY_DIM)
        .map(|_| {
            s = s.wrapping_mul(1664525).wrapping_add(1013904223);
            (s % 1000) as f32 / 1000.0
        })
        .collect()
}
