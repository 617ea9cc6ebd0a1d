//! NDSQ decomposition: dense matrix → low-rank + diagonal + sparse
//! outliers + product-quantized residual.
//!
//! The split is sequential and order matters: the low-rank factor is
//! subtracted first, the residual's main diagonal moves to D, outliers
//! above the magnitude quantile move to S, and whatever is left is
//! zero-padded into fixed-length blocks and product-quantized into R.

use nalgebra::DMatrix;
use tracing::debug;

use vassago_core::{Error, Result};

use crate::pq::{PqParams, ProductQuantizer};
use crate::shard::{self, ShardType};

/// Residual block length for product quantization.
pub const BLOCK_LEN: usize = 128;

/// Lloyd iterations used for residual codebooks.
const PQ_ITERS: usize = 25;

/// Seed for residual codebook training.
const PQ_SEED: u64 = 1234;

/// SVD iteration cap; hitting it surfaces as a numeric error.
const SVD_MAX_ITER: usize = 10_000;

/// Decomposition parameters for one scope.
#[derive(Debug, Clone, Copy)]
pub struct DecomposeConfig {
    /// Target rank of the low-rank factor (clamped to the matrix rank).
    pub rank: usize,
    /// Outlier magnitude quantile in `[0, 1]`.
    pub outlier_quantile: f64,
    /// PQ sub-quantizer count (falls back to `BLOCK_LEN / 8` when it does
    /// not divide the block length).
    pub pq_m: usize,
    /// PQ centroids per sub-quantizer.
    pub pq_k: usize,
}

impl Default for DecomposeConfig {
    fn default() -> Self {
        Self {
            rank: 64,
            outlier_quantile: 0.999,
            pq_m: 8,
            pq_k: 256,
        }
    }
}

/// Decompose a row-major `rows x cols` matrix into the four component
/// payloads, in L, D, R, S order.
pub fn decompose(
    rows: usize,
    cols: usize,
    data: &[f32],
    cfg: &DecomposeConfig,
) -> Result<Vec<(ShardType, Vec<u8>)>> {
    if rows == 0 || cols == 0 {
        return Err(Error::shape("empty matrix"));
    }
    if data.len() != rows * cols {
        return Err(Error::shape(format!(
            "data length {} does not match {rows}x{cols}",
            data.len()
        )));
    }

    let low_rank = low_rank_factor(rows, cols, data, cfg.rank)?;

    let mut resid: Vec<f32> = data
        .iter()
        .zip(&low_rank)
        .map(|(w, l)| w - l)
        .collect();

    // main diagonal of the residual moves to D
    let mut diag = vec![0.0f32; rows * cols];
    for i in 0..rows.min(cols) {
        let idx = i * cols + i;
        diag[idx] = resid[idx];
        resid[idx] = 0.0;
    }

    // outliers at or above the magnitude quantile move to S, scan order
    // row-major, exact zeros never included
    let abs: Vec<f64> = resid.iter().map(|v| (*v as f64).abs()).collect();
    let mut sorted = abs.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let threshold = if sorted.is_empty() {
        0.0
    } else {
        let qidx = ((sorted.len() - 1) as f64 * cfg.outlier_quantile) as usize;
        sorted[qidx.min(sorted.len() - 1)]
    };
    let mut outliers = Vec::new();
    for i in 0..rows {
        for j in 0..cols {
            let idx = i * cols + j;
            if abs[idx] >= threshold && abs[idx] != 0.0 {
                outliers.push((i as i32, j as i32, resid[idx]));
                resid[idx] = 0.0;
            }
        }
    }

    // remaining residual: pad to a block multiple and product-quantize
    let d = BLOCK_LEN;
    let pad = (d - resid.len() % d) % d;
    resid.resize(resid.len() + pad, 0.0);
    let n_blocks = resid.len() / d;
    let m = if cfg.pq_m > 0 && d % cfg.pq_m == 0 {
        cfg.pq_m
    } else {
        d / 8
    };
    let pq = ProductQuantizer::train(
        &resid,
        d,
        &PqParams {
            m,
            k: cfg.pq_k,
            iters: PQ_ITERS,
            seed: PQ_SEED,
        },
    )?;
    let codes = pq.encode(&resid);

    debug!(
        rows,
        cols,
        outliers = outliers.len(),
        blocks = n_blocks,
        pq_k = pq.k,
        "decomposed scope"
    );

    Ok(vec![
        (
            ShardType::LowRank,
            shard::encode_fp16_matrix(rows, cols, &low_rank),
        ),
        (
            ShardType::Diagonal,
            shard::encode_fp16_matrix(rows, cols, &diag),
        ),
        (
            ShardType::Residual,
            shard::encode_residual_embedded(
                rows,
                cols,
                d,
                m,
                pq.k,
                n_blocks,
                &pq.codebooks,
                &codes,
            ),
        ),
        (
            ShardType::Outliers,
            shard::encode_sparse(rows, cols, &outliers),
        ),
    ])
}

/// Rank-clamped low-rank factor `U_r Σ_r V_r^T` via thin SVD in f64.
fn low_rank_factor(rows: usize, cols: usize, data: &[f32], rank: usize) -> Result<Vec<f32>> {
    let r_max = rows.min(cols);
    let r = rank.min(r_max);
    if r == 0 {
        return Ok(vec![0.0f32; rows * cols]);
    }

    let wide: Vec<f64> = data.iter().map(|&v| v as f64).collect();
    let a = DMatrix::from_row_slice(rows, cols, &wide);
    let svd = nalgebra::linalg::SVD::try_new(a, true, true, f64::EPSILON, SVD_MAX_ITER)
        .ok_or_else(|| Error::numeric("SVD did not converge"))?;
    let s = svd.singular_values;
    let u = svd.u.ok_or_else(|| Error::numeric("SVD produced no U"))?;
    let v_t = svd.v_t.ok_or_else(|| Error::numeric("SVD produced no V^T"))?;

    let r = r.min(s.len());
    // scale U_r columns by the singular values, then multiply by V_r^T
    let mut us = u.columns(0, r).into_owned();
    for j in 0..r {
        let sv = s[j];
        us.column_mut(j).scale_mut(sv);
    }
    let l64 = us * v_t.rows(0, r);

    let mut out = vec![0.0f32; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            out[i * cols + j] = l64[(i, j)] as f32;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{decode_fp16_matrix, parse_residual, parse_sparse};

    fn component<'a>(
        shards: &'a [(ShardType, Vec<u8>)],
        ty: ShardType,
    ) -> &'a [u8] {
        &shards.iter().find(|(t, _)| *t == ty).unwrap().1
    }

    #[test]
    fn emits_all_four_components_in_order() {
        let data = vec![1.0f32; 12];
        let shards = decompose(3, 4, &data, &DecomposeConfig::default()).unwrap();
        let order: Vec<ShardType> = shards.iter().map(|(t, _)| *t).collect();
        assert_eq!(
            order,
            vec![
                ShardType::LowRank,
                ShardType::Diagonal,
                ShardType::Residual,
                ShardType::Outliers
            ]
        );
    }

    #[test]
    fn rank_zero_moves_diagonal_to_d() {
        let data = vec![
            1.0f32, 2.0, 3.0, //
            4.0, 5.0, 6.0, //
            7.0, 8.0, 9.0,
        ];
        let cfg = DecomposeConfig {
            rank: 0,
            outlier_quantile: 1.0,
            ..DecomposeConfig::default()
        };
        let shards = decompose(3, 3, &data, &cfg).unwrap();

        let (_, _, l) = decode_fp16_matrix(component(&shards, ShardType::LowRank)).unwrap();
        assert!(l.iter().all(|&v| v == 0.0));

        let (_, _, d) = decode_fp16_matrix(component(&shards, ShardType::Diagonal)).unwrap();
        assert_eq!(d[0], 1.0);
        assert_eq!(d[4], 5.0);
        assert_eq!(d[8], 9.0);
        assert_eq!(d[1], 0.0);
    }

    #[test]
    fn quantile_zero_sends_every_nonzero_residual_to_s() {
        let data = vec![
            0.0f32, 2.0, 3.0, //
            4.0, 0.0, 6.0,
        ];
        let cfg = DecomposeConfig {
            rank: 0,
            outlier_quantile: 0.0,
            ..DecomposeConfig::default()
        };
        let shards = decompose(2, 3, &data, &cfg).unwrap();
        let s = parse_sparse(component(&shards, ShardType::Outliers)).unwrap();
        // diagonal entries (0,0) and (1,1) are zero in the input; the four
        // nonzero off-diagonal entries all clear the zero quantile
        assert_eq!(s.entries.len(), 4);
        assert_eq!(s.entries[0], (0, 1, 2.0));
        // R is all padding zeros after S absorbed the rest
        let r = parse_residual(component(&shards, ShardType::Residual)).unwrap();
        let cb = r.embedded_centroids().unwrap();
        assert!(cb.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn residual_blocks_cover_padded_length() {
        let data = vec![0.5f32; 2 * 3];
        let shards = decompose(2, 3, &data, &DecomposeConfig::default()).unwrap();
        let r = parse_residual(component(&shards, ShardType::Residual)).unwrap();
        assert_eq!(r.d, BLOCK_LEN);
        assert_eq!(r.n, 1); // 6 elements pad up to one 128-block
        assert_eq!(r.codes.len(), r.n * r.m);
    }

    #[test]
    fn pq_m_falls_back_when_indivisible() {
        let data = vec![0.1f32; 4];
        let cfg = DecomposeConfig {
            pq_m: 7, // does not divide 128
            ..DecomposeConfig::default()
        };
        let shards = decompose(2, 2, &data, &cfg).unwrap();
        let r = parse_residual(component(&shards, ShardType::Residual)).unwrap();
        assert_eq!(r.m, BLOCK_LEN / 8);
    }

    #[test]
    fn shape_mismatch_rejected() {
        let err = decompose(2, 3, &[0.0; 5], &DecomposeConfig::default()).unwrap_err();
        assert_eq!(err.category(), "shape");
        assert!(decompose(0, 3, &[], &DecomposeConfig::default()).is_err());
    }
}
