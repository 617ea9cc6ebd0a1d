//! Optional dense-matvec acceleration.
//!
//! Offload is double-gated: the crate must be built with the `cuda`
//! feature and the process must opt in with `CROW_CUDA=1`. Everything
//! else goes through the [`DenseMatVec`] boolean contract, so a backend
//! that fails to initialize or errors mid-call simply reports not-handled
//! and the CPU path runs.

use crate::linear::DenseMatVec;

/// Environment variable that opts into GPU offload.
pub const ENV_OPT_IN: &str = "CROW_CUDA";

/// True when the process opted into acceleration.
#[must_use]
pub fn env_enabled() -> bool {
    std::env::var(ENV_OPT_IN).map(|v| v == "1").unwrap_or(false)
}

/// Build the dense backend selected by the environment, if any.
///
/// Returns `None` when the opt-in flag is unset, the `cuda` feature is
/// not compiled in, or no usable device is present.
pub fn env_backend() -> Option<Box<dyn DenseMatVec>> {
    if !env_enabled() {
        return None;
    }
    #[cfg(feature = "cuda")]
    {
        match cublas::CublasMatVec::new() {
            Ok(b) => return Some(Box::new(b)),
            Err(e) => {
                tracing::warn!("CUDA requested but unavailable: {e}");
                return None;
            }
        }
    }
    #[cfg(not(feature = "cuda"))]
    {
        tracing::warn!("{ENV_OPT_IN}=1 set but built without the cuda feature");
        None
    }
}

#[cfg(feature = "cuda")]
mod cublas {
    use std::sync::Arc;

    use cudarc::cublas::{CudaBlas, Gemv, GemvConfig};
    use cudarc::driver::CudaDevice;

    use crate::linear::DenseMatVec;

    /// cuBLAS-backed dense matvec.
    ///
    /// The device result lands in a scratch vector and is added to `y` on
    /// the host, so a failure at any point leaves `y` untouched.
    pub struct CublasMatVec {
        device: Arc<CudaDevice>,
        blas: CudaBlas,
    }

    impl CublasMatVec {
        pub fn new() -> Result<Self, String> {
            let device = CudaDevice::new(0).map_err(|e| e.to_string())?;
            let blas = CudaBlas::new(device.clone()).map_err(|e| format!("{e:?}"))?;
            Ok(Self { device, blas })
        }

        fn try_matvec(
            &self,
            a: &[f32],
            rows: usize,
            cols: usize,
            x: &[f32],
        ) -> Option<Vec<f32>> {
            let a_dev = self.device.htod_sync_copy(a).ok()?;
            let x_dev = self.device.htod_sync_copy(x).ok()?;
            let mut y_dev = self.device.alloc_zeros::<f32>(rows).ok()?;
            // row-major A read as column-major (cols x rows) with a
            // transposed op gives A·x
            let cfg = GemvConfig {
                trans: cudarc::cublas::sys::cublasOperation_t::CUBLAS_OP_T,
                m: cols as i32,
                n: rows as i32,
                alpha: 1.0f32,
                lda: cols as i32,
                incx: 1,
                beta: 0.0f32,
                incy: 1,
            };
            unsafe { self.blas.gemv(cfg, &a_dev, &x_dev, &mut y_dev) }.ok()?;
            self.device.dtoh_sync_copy(&y_dev).ok()
        }
    }

    impl DenseMatVec for CublasMatVec {
        fn matvec_add(
            &self,
            y: &mut [f32],
            a: &[f32],
            rows: usize,
            cols: usize,
            x: &[f32],
        ) -> bool {
            if a.len() != rows * cols || x.len() != cols || y.len() != rows {
                return false;
            }
            match self.try_matvec(a, rows, cols, x) {
                Some(partial) => {
                    for (dst, add) in y.iter_mut().zip(&partial) {
                        *dst += add;
                    }
                    true
                }
                None => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_absent_without_opt_in() {
        // no env manipulation: absent or !="1" both mean disabled
        if std::env::var(ENV_OPT_IN).ok().as_deref() != Some("1") {
            assert!(env_backend().is_none());
        }
    }
}
