//! Dense reconstruction of one scope from its shards.
//!
//! `dst = L + D + Σ R + S`; missing components contribute zero. Addition
//! of the components commutes, so the bank order of a scope's shards does
//! not affect the result beyond floating-point rounding.

use vassago_core::{Error, Result};

use crate::codebook::CodebookPool;
use crate::shard::{self, BankRecord, CodebookRef, ResidualPayload, ShardType};

/// Decode a residual payload to a dense `rows * cols` matrix.
///
/// Blocks are decoded at full padded length and truncated to the matrix
/// element count.
pub fn decode_residual_dense(
    parsed: &ResidualPayload<'_>,
    pool: Option<&CodebookPool>,
) -> Result<Vec<f32>> {
    let dsub = parsed.dsub();
    let centroids: Vec<f32> = match parsed.codebook {
        CodebookRef::Embedded(_) => parsed.embedded_centroids().unwrap(),
        CodebookRef::Shared(id) => {
            let pool = pool.ok_or_else(|| {
                Error::not_found(format!(
                    "codebook pool (R shard references shared codebook {id})"
                ))
            })?;
            pool.resolve(id, parsed.d, parsed.m, parsed.k)?.data.clone()
        }
    };

    let mut blocks = vec![0.0f32; parsed.n * parsed.d];
    for i in 0..parsed.m {
        for r in 0..parsed.n {
            let code = parsed.codes[r * parsed.m + i] as usize;
            let base = (i * parsed.k + code) * dsub;
            let dst = r * parsed.d + i * dsub;
            blocks[dst..dst + dsub].copy_from_slice(&centroids[base..base + dsub]);
        }
    }

    let need = parsed.rows * parsed.cols;
    blocks.truncate(need.min(blocks.len()));
    blocks.resize(need, 0.0);
    Ok(blocks)
}

fn note_shape(
    shape: &mut Option<(usize, usize)>,
    rows: usize,
    cols: usize,
    scope: u16,
) -> Result<()> {
    match *shape {
        None => {
            *shape = Some((rows, cols));
            Ok(())
        }
        Some((r, c)) if r == rows && c == cols => Ok(()),
        Some((r, c)) => Err(Error::shape(format!(
            "scope {scope}: shard shape {rows}x{cols} disagrees with {r}x{c}"
        ))),
    }
}

fn add_in_place(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

/// Reconstruct a dense weight matrix for one scope.
///
/// Returns `(rows, cols, row-major data)`. All shards of the scope must
/// agree on the shape; an absent scope is a lookup error.
pub fn reconstruct_scope(
    bank: &[u8],
    pool: Option<&CodebookPool>,
    scope: u16,
) -> Result<(usize, usize, Vec<f32>)> {
    let records = shard::index_bank(bank)?;
    reconstruct_from_records(bank, &records, pool, scope)
}

/// Reconstruct using a pre-built bank index.
pub fn reconstruct_from_records(
    bank: &[u8],
    records: &[BankRecord],
    pool: Option<&CodebookPool>,
    scope: u16,
) -> Result<(usize, usize, Vec<f32>)> {
    let mut shape: Option<(usize, usize)> = None;
    let mut low_rank: Option<Vec<f32>> = None;
    let mut diagonal: Option<Vec<f32>> = None;
    let mut residuals: Vec<Vec<f32>> = Vec::new();
    let mut sparse: Option<shard::SparsePayload> = None;

    for rec in records.iter().filter(|r| r.header.scope == scope) {
        let payload = shard::decompress_payload(rec.header.comp, rec.payload(bank))?;
        match rec.header.shard_type {
            ShardType::LowRank => {
                let (r, c, mat) = shard::decode_fp16_matrix(&payload)?;
                note_shape(&mut shape, r, c, scope)?;
                low_rank = Some(mat);
            }
            ShardType::Diagonal => {
                let (r, c, mat) = shard::decode_fp16_matrix(&payload)?;
                note_shape(&mut shape, r, c, scope)?;
                diagonal = Some(mat);
            }
            ShardType::Residual => {
                let parsed = shard::parse_residual(&payload)?;
                note_shape(&mut shape, parsed.rows, parsed.cols, scope)?;
                residuals.push(decode_residual_dense(&parsed, pool)?);
            }
            ShardType::Outliers => {
                let parsed = shard::parse_sparse(&payload)?;
                note_shape(&mut shape, parsed.rows, parsed.cols, scope)?;
                sparse = Some(parsed);
            }
        }
    }

    let (rows, cols) =
        shape.ok_or_else(|| Error::not_found(format!("scope {scope}")))?;
    let mut data = vec![0.0f32; rows * cols];
    if let Some(l) = low_rank {
        add_in_place(&mut data, &l);
    }
    if let Some(d) = diagonal {
        add_in_place(&mut data, &d);
    }
    for r in &residuals {
        add_in_place(&mut data, r);
    }
    if let Some(s) = sparse {
        for (r, c, v) in s.entries {
            if r < 0 || r as usize >= rows || c < 0 || c as usize >= cols {
                continue;
            }
            data[r as usize * cols + c as usize] += v;
        }
    }
    Ok((rows, cols, data))
}
