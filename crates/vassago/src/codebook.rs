//! Shared product-quantizer codebook pool.
//!
//! After decomposition every R-shard embeds its own codebooks. The sharing
//! rewrite deduplicates them into one pool section and rewrites each
//! R-shard to carry a 16-bit pool id instead, which collapses the common
//! case of many layers trained to identical codebooks.
//!
//! Pool section layout (little-endian):
//! `count:u16`, then per entry `id:u16, d:u16, m:u16, k:u16, size:u32,
//! bytes` where `bytes` is `m*k*(d/m)` f32 values, `[subvector][centroid]
//! [sub-dimension]`.

use std::collections::HashMap;

use xxhash_rust::xxh3::xxh3_64;

use vassago_core::{Error, Result};

use crate::shard::{self, CodebookRef, ShardHeader, ShardType};

/// One pooled codebook.
#[derive(Debug, Clone)]
pub struct CodebookEntry {
    pub id: u16,
    /// Block length of the R-shards this codebook serves.
    pub d: usize,
    pub m: usize,
    pub k: usize,
    /// Flat centroids, `[m][k][d/m]`.
    pub data: Vec<f32>,
}

/// Immutable pool of codebooks, keyed by id.
#[derive(Debug, Default)]
pub struct CodebookPool {
    entries: HashMap<u16, CodebookEntry>,
}

impl CodebookPool {
    /// Parse the CODEBOOKS section. An empty section is an empty pool.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut pool = CodebookPool::default();
        if bytes.is_empty() {
            return Ok(pool);
        }
        if bytes.len() < 2 {
            return Err(Error::format("codebook pool: short header"));
        }
        let count = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let mut off = 2;
        for _ in 0..count {
            if off + 12 > bytes.len() {
                return Err(Error::format_at("codebook pool: short entry header", off));
            }
            let id = u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap());
            let d = u16::from_le_bytes(bytes[off + 2..off + 4].try_into().unwrap()) as usize;
            let m = u16::from_le_bytes(bytes[off + 4..off + 6].try_into().unwrap()) as usize;
            let k = u16::from_le_bytes(bytes[off + 6..off + 8].try_into().unwrap()) as usize;
            let size = u32::from_le_bytes(bytes[off + 8..off + 12].try_into().unwrap()) as usize;
            off += 12;
            if off + size > bytes.len() {
                return Err(Error::format_at("codebook pool: short entry data", off));
            }
            if size % 4 != 0 {
                return Err(Error::format(format!(
                    "codebook pool: entry {id} size {size} not a multiple of 4"
                )));
            }
            let data = bytes[off..off + size]
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                .collect();
            off += size;
            pool.entries.insert(id, CodebookEntry { id, d, m, k, data });
        }
        Ok(pool)
    }

    /// Look up a codebook by id.
    #[must_use]
    pub fn get(&self, id: u16) -> Option<&CodebookEntry> {
        self.entries.get(&id)
    }

    /// Number of pooled codebooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the pool holds no codebooks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a codebook for a parsed residual, validating parameters.
    pub fn resolve(&self, id: u16, d: usize, m: usize, k: usize) -> Result<&CodebookEntry> {
        let entry = self
            .get(id)
            .ok_or_else(|| Error::not_found(format!("codebook id {id}")))?;
        if entry.m != 0 && entry.m != m {
            return Err(Error::shape(format!(
                "codebook {id}: m mismatch ({} vs {m})",
                entry.m
            )));
        }
        if entry.k != 0 && entry.k != k {
            return Err(Error::shape(format!(
                "codebook {id}: k mismatch ({} vs {k})",
                entry.k
            )));
        }
        if entry.d != 0 && m != 0 && entry.d / m != d / m {
            return Err(Error::shape(format!(
                "codebook {id}: sub-vector length mismatch ({} vs {})",
                entry.d / m,
                d / m
            )));
        }
        Ok(entry)
    }
}

/// Serialize pooled codebooks (given in id order) to the section layout.
fn pool_section(entries: &[(u16, usize, usize, usize, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for (id, d, m, k, data) in entries {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(*d as u16).to_le_bytes());
        out.extend_from_slice(&(*m as u16).to_le_bytes());
        out.extend_from_slice(&(*k as u16).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
    }
    out
}

/// Rewrite R-shards to reference a shared codebook pool.
///
/// Takes framed shard blobs in bank order. Embedded codebooks are
/// deduplicated by (xxh3-64, byte equality) and assigned sequential pool
/// ids starting at 0 in first-seen order; each R payload is rewritten to
/// the shared layout with `usize = csize =` new payload length. Non-R
/// shards pass through untouched and every shard keeps its position.
///
/// Returns the rewritten blobs and the CODEBOOKS section bytes.
pub fn share_codebooks(shards: Vec<Vec<u8>>) -> (Vec<Vec<u8>>, Vec<u8>) {
    struct PoolSlot {
        key: u64,
        data: Vec<u8>,
        d: usize,
        m: usize,
        k: usize,
    }
    let mut pool: Vec<PoolSlot> = Vec::new();
    let mut out = Vec::with_capacity(shards.len());

    for blob in shards {
        let rewritten = (|| -> Option<Vec<u8>> {
            if blob.len() < ShardHeader::SIZE {
                return None;
            }
            let header =
                ShardHeader::from_bytes(blob[..ShardHeader::SIZE].try_into().unwrap()).ok()?;
            if header.shard_type != ShardType::Residual {
                return None;
            }
            let payload = blob.get(
                ShardHeader::SIZE..ShardHeader::SIZE + header.stored_size as usize,
            )?;
            let parsed = shard::parse_residual(payload).ok()?;
            let cb_bytes = match parsed.codebook {
                CodebookRef::Embedded(bytes) => bytes,
                CodebookRef::Shared(_) => return None,
            };

            let key = xxh3_64(cb_bytes);
            let id = match pool
                .iter()
                .position(|e| e.key == key && e.data == cb_bytes)
            {
                Some(i) => i,
                None => {
                    pool.push(PoolSlot {
                        key,
                        data: cb_bytes.to_vec(),
                        d: parsed.d,
                        m: parsed.m,
                        k: parsed.k,
                    });
                    pool.len() - 1
                }
            } as u16;

            let new_payload = shard::encode_residual_shared(
                parsed.rows,
                parsed.cols,
                parsed.d,
                parsed.m,
                parsed.k,
                parsed.n,
                id,
                parsed.codes,
            );
            let new_header = ShardHeader {
                uncompressed_size: new_payload.len() as u32,
                stored_size: new_payload.len() as u32,
                ..header
            };
            let mut out = Vec::with_capacity(ShardHeader::SIZE + new_payload.len());
            out.extend_from_slice(&new_header.to_bytes());
            out.extend_from_slice(&new_payload);
            Some(out)
        })();
        match rewritten {
            Some(b) => out.push(b),
            None => out.push(blob),
        }
    }

    let entries: Vec<_> = pool
        .into_iter()
        .enumerate()
        .map(|(i, e)| (i as u16, e.d, e.m, e.k, e.data))
        .collect();
    (out, pool_section(&entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{encode_residual_embedded, frame};

    fn embedded_r(scope: u16, cb: &[Vec<f32>]) -> Vec<u8> {
        // 2x2 matrix, d=2, m=1, k=2, n=2
        frame(
            ShardType::Residual,
            scope,
            &encode_residual_embedded(2, 2, 2, 1, 2, 2, cb, &[0, 1]),
        )
    }

    #[test]
    fn identical_codebooks_share_one_id() {
        let cb = vec![vec![1.0f32, 0.0, 0.0, 1.0]];
        let shards = vec![embedded_r(0, &cb), embedded_r(1, &cb)];
        let (rewritten, section) = share_codebooks(shards);
        assert_eq!(rewritten.len(), 2);

        let pool = CodebookPool::parse(&section).unwrap();
        assert_eq!(pool.len(), 1);

        for blob in &rewritten {
            let payload = &blob[ShardHeader::SIZE..];
            let parsed = shard::parse_residual(payload).unwrap();
            assert_eq!(parsed.codebook, CodebookRef::Shared(0));
        }
    }

    #[test]
    fn distinct_codebooks_get_sequential_ids() {
        let cb_a = vec![vec![1.0f32, 0.0, 0.0, 1.0]];
        let cb_b = vec![vec![2.0f32, 0.0, 0.0, 2.0]];
        let shards = vec![embedded_r(0, &cb_a), embedded_r(1, &cb_b), embedded_r(2, &cb_a)];
        let (rewritten, section) = share_codebooks(shards);

        let pool = CodebookPool::parse(&section).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(0).unwrap().data, cb_a[0]);
        assert_eq!(pool.get(1).unwrap().data, cb_b[0]);

        let ids: Vec<u16> = rewritten
            .iter()
            .map(|b| {
                match shard::parse_residual(&b[ShardHeader::SIZE..])
                    .unwrap()
                    .codebook
                {
                    CodebookRef::Shared(id) => id,
                    CodebookRef::Embedded(_) => panic!("still embedded"),
                }
            })
            .collect();
        assert_eq!(ids, vec![0, 1, 0]);
    }

    #[test]
    fn non_residual_shards_pass_through() {
        let l = frame(ShardType::LowRank, 0, &[1, 2, 3, 4]);
        let cb = vec![vec![1.0f32, 0.0, 0.0, 1.0]];
        let r = embedded_r(0, &cb);
        let (rewritten, _) = share_codebooks(vec![l.clone(), r]);
        assert_eq!(rewritten[0], l);
    }

    #[test]
    fn empty_section_parses_to_empty_pool() {
        let pool = CodebookPool::parse(&[]).unwrap();
        assert!(pool.is_empty());
    }

    #[test]
    fn resolve_validates_parameters() {
        let cb = vec![vec![1.0f32, 0.0, 0.0, 1.0]];
        let (_, section) = share_codebooks(vec![embedded_r(0, &cb)]);
        let pool = CodebookPool::parse(&section).unwrap();
        assert!(pool.resolve(0, 2, 1, 2).is_ok());
        assert_eq!(pool.resolve(9, 2, 1, 2).unwrap_err().category(), "not_found");
        assert_eq!(pool.resolve(0, 2, 1, 4).unwrap_err().category(), "shape");
    }

    #[test]
    fn pool_image_independent_of_shard_order() {
        let cb_a = vec![vec![1.0f32, 0.0, 0.0, 1.0]];
        let cb_b = vec![vec![2.0f32, 0.0, 0.0, 2.0]];
        let (_, s1) = share_codebooks(vec![embedded_r(0, &cb_a), embedded_r(1, &cb_b)]);
        let (_, s2) = share_codebooks(vec![embedded_r(1, &cb_b), embedded_r(0, &cb_a)]);
        // same byte volume and same entries modulo id assignment
        assert_eq!(s1.len(), s2.len());
        let p1 = CodebookPool::parse(&s1).unwrap();
        let p2 = CodebookPool::parse(&s2).unwrap();
        assert_eq!(p1.len(), p2.len());
        assert_eq!(p1.get(0).unwrap().data, p2.get(1).unwrap().data);
        assert_eq!(p1.get(1).unwrap().data, p2.get(0).unwrap().data);
    }
}
