//! Streaming matrix–vector product over a scope's shards.
//!
//! `apply_scope` computes `y = W·x` without materializing `W`: fp16 rows
//! are decoded on the fly for L and D, residual blocks accumulate straight
//! from their centroids using the same flattening as the reconstructor,
//! and sparse entries are bounds-checked triplet adds.
//!
//! An optional dense backend may take over the L and D terms. The
//! contract is boolean per component: the backend either fully accumulates
//! `A·x` into `y` and returns `true`, or leaves `y` untouched and returns
//! `false`, in which case the CPU path runs for that component. L and D
//! are offered to the backend separately, so partial acceleration is safe.

use vassago_core::fp16;
use vassago_core::{Error, Result};

use crate::codebook::CodebookPool;
use crate::shard::{self, CodebookRef, ShardType};

/// Dense matvec backend for the acceleration hook.
///
/// Implementations must be synchronous and must not retain pointers past
/// the call.
pub trait DenseMatVec {
    /// Accumulate `y += A·x` for a row-major `rows x cols` matrix.
    ///
    /// Returns `true` only after fully accumulating into `y`. On `false`
    /// the backend must not have written to `y`.
    fn matvec_add(&self, y: &mut [f32], a: &[f32], rows: usize, cols: usize, x: &[f32]) -> bool;
}

/// Compute `y = W·x` for one scope. `x` must have length `cols`; the
/// result has length `rows`.
pub fn apply_scope(
    bank: &[u8],
    pool: Option<&CodebookPool>,
    scope: u16,
    x: &[f32],
    backend: Option<&dyn DenseMatVec>,
) -> Result<(Vec<f32>, usize, usize)> {
    let records = shard::index_bank(bank)?;
    let scoped: Vec<_> = records
        .iter()
        .filter(|r| r.header.scope == scope)
        .copied()
        .collect();

    // shape discovery pass
    let mut shape: Option<(usize, usize)> = None;
    for rec in &scoped {
        let payload = shard::decompress_payload(rec.header.comp, rec.payload(bank))?;
        let (rows, cols) = shard::read_shape(&payload)?;
        match shape {
            None => shape = Some((rows, cols)),
            Some((r, c)) if r == rows && c == cols => {}
            Some((r, c)) => {
                return Err(Error::shape(format!(
                    "scope {scope}: shard shape {rows}x{cols} disagrees with {r}x{c}"
                )))
            }
        }
    }
    let (rows, cols) = shape.ok_or_else(|| Error::not_found(format!("scope {scope}")))?;
    if x.len() != cols {
        return Err(Error::shape(format!(
            "input length {} != cols {cols}",
            x.len()
        )));
    }
    let mut y = vec![0.0f32; rows];

    // optionally offload L and D, each tracked on its own
    let mut l_handled = false;
    let mut d_handled = false;
    if let Some(backend) = backend {
        for rec in &scoped {
            let component = match rec.header.shard_type {
                ShardType::LowRank => &mut l_handled,
                ShardType::Diagonal => &mut d_handled,
                _ => continue,
            };
            let payload = shard::decompress_payload(rec.header.comp, rec.payload(bank))?;
            let Ok((r, c, dense)) = shard::decode_fp16_matrix(&payload) else {
                continue; // CPU pass will surface the decode error
            };
            if r != rows || c != cols {
                continue;
            }
            if backend.matvec_add(&mut y, &dense, rows, cols, x) {
                *component = true;
            }
        }
    }

    for rec in &scoped {
        let payload = shard::decompress_payload(rec.header.comp, rec.payload(bank))?;
        match rec.header.shard_type {
            ShardType::LowRank => {
                if !l_handled {
                    matvec_fp16_add(&mut y, rows, cols, &payload[8..], x)?;
                }
            }
            ShardType::Diagonal => {
                if !d_handled {
                    matvec_fp16_add(&mut y, rows, cols, &payload[8..], x)?;
                }
            }
            ShardType::Residual => apply_residual_add(&mut y, rows, cols, &payload, x, pool)?,
            ShardType::Outliers => apply_sparse_add(&mut y, rows, cols, &payload, x)?,
        }
    }

    Ok((y, rows, cols))
}

/// `y += A·x` streaming rows out of little-endian fp16 data.
fn matvec_fp16_add(
    y: &mut [f32],
    rows: usize,
    cols: usize,
    data: &[u8],
    x: &[f32],
) -> Result<()> {
    if data.len() < rows * cols * 2 {
        return Err(Error::format(format!(
            "short fp16 data: need {} bytes, have {}",
            rows * cols * 2,
            data.len()
        )));
    }
    for i in 0..rows {
        let mut s = 0.0f32;
        let row = &data[i * cols * 2..(i + 1) * cols * 2];
        for (j, half) in row.chunks_exact(2).enumerate() {
            let w = fp16::decode(u16::from_le_bytes([half[0], half[1]]));
            s += w * x[j];
        }
        y[i] += s;
    }
    Ok(())
}

/// Accumulate a residual shard block-by-block without materializing it.
///
/// Uses the identical flattening as the reconstructor, including the pad
/// region: `flat = block*d + sub*dsub + j`, `(row, col) = (flat / cols,
/// flat % cols)`, rows past the matrix are dropped.
fn apply_residual_add(
    y: &mut [f32],
    rows: usize,
    cols: usize,
    payload: &[u8],
    x: &[f32],
    pool: Option<&CodebookPool>,
) -> Result<()> {
    let parsed = shard::parse_residual(payload)?;
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

    for r in 0..parsed.n {
        let base_flat = r * parsed.d;
        for i in 0..parsed.m {
            let code = parsed.codes[r * parsed.m + i] as usize;
            let cb_base = (i * parsed.k + code) * dsub;
            for j in 0..dsub {
                let flat = base_flat + i * dsub + j;
                let row = flat / cols;
                let col = flat % cols;
                if row < rows {
                    y[row] += centroids[cb_base + j] * x[col];
                }
            }
        }
    }
    Ok(())
}

/// Accumulate sparse triplets, skipping out-of-range indices.
fn apply_sparse_add(
    y: &mut [f32],
    rows: usize,
    cols: usize,
    payload: &[u8],
    x: &[f32],
) -> Result<()> {
    let parsed = shard::parse_sparse(payload)?;
    for (r, c, v) in parsed.entries {
        if r < 0 || r as usize >= rows || c < 0 || c as usize >= cols {
            continue;
        }
        y[r as usize] += v * x[c as usize];
    }
    Ok(())
}
