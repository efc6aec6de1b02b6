//! Kernels on discriminator features and the unbiased MMD² estimator.
//!
//! Features are flattened to `(batch, dim)` before any kernel is evaluated.
//! Every kernel here is symmetric, so `mmd2(X, Y) == mmd2(Y, X)` up to
//! floating-point summation order.

use candle_core::{DType, Error, Result, Tensor};

/// Bandwidths of the `mix_rbf` kernel.
const RBF_SIGMAS: [f64; 6] = [2.0, 5.0, 10.0, 20.0, 40.0, 80.0];
/// Shape parameters of the `mix_rq` kernel.
const RQ_ALPHAS: [f64; 5] = [0.2, 0.5, 1.0, 2.0, 5.0];
const NORM_EPS: f64 = 1e-8;

/// A positive-definite (or conditionally so) similarity on feature rows.
pub trait Kernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Gram matrix `K[i, j] = k(x_i, y_j)` of shape `(m, n)`.
    fn matrix(&self, x: &Tensor, y: &Tensor) -> Result<Tensor>;
}

/// Look a kernel up by its configuration name.
pub fn kernel_by_name(name: &str) -> Option<Box<dyn Kernel>> {
    let kernel: Box<dyn Kernel> = match name {
        "dot" => Box::new(DotKernel),
        "poly" => Box::new(PolyKernel),
        "mix_rbf" => Box::new(MixRbfKernel::default()),
        "mix_rq" => Box::new(MixRqKernel::default()),
        "distance" => Box::new(DistanceKernel),
        _ => return None,
    };
    Some(kernel)
}

/// Names accepted by [`kernel_by_name`].
pub const KERNEL_NAMES: [&str; 5] = ["dot", "poly", "mix_rbf", "mix_rq", "distance"];

// ── Shared helpers ──────────────────────────────────────────────────────────

fn flat(x: &Tensor) -> Result<Tensor> {
    if x.rank() == 2 {
        Ok(x.clone())
    } else {
        x.flatten_from(1)
    }
}

fn dot(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    x.matmul(&y.t()?)
}

/// Pairwise squared Euclidean distances, clamped at zero.
///
/// The clamp is `(d + |d|) / 2` rather than `relu` so a NaN feature stays
/// NaN in the statistic.
fn sq_dists(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let xx = x.sqr()?.sum_keepdim(1)?;
    let yy = y.sqr()?.sum_keepdim(1)?.t()?;
    let xy = dot(x, y)?;
    let d2 = xx.broadcast_add(&yy)?.broadcast_sub(&xy.affine(2.0, 0.0)?)?;
    (d2.abs()? + &d2)? * 0.5
}

// ── Catalogue ───────────────────────────────────────────────────────────────

/// Linear kernel `⟨x, y⟩`.
pub struct DotKernel;

impl Kernel for DotKernel {
    fn name(&self) -> &'static str {
        "dot"
    }

    fn matrix(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        dot(&flat(x)?, &flat(y)?)
    }
}

/// Cubic polynomial kernel `(⟨x, y⟩ / d + 1)³`, as used by KID.
pub struct PolyKernel;

impl Kernel for PolyKernel {
    fn name(&self) -> &'static str {
        "poly"
    }

    fn matrix(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let (x, y) = (flat(x)?, flat(y)?);
        let d = x.dim(1)? as f64;
        let base = dot(&x, &y)?.affine(1.0 / d, 1.0)?;
        base.sqr()? * base
    }
}

/// Sum of Gaussian kernels over several bandwidths.
pub struct MixRbfKernel {
    sigmas: Vec<f64>,
}

impl Default for MixRbfKernel {
    fn default() -> Self {
        Self {
            sigmas: RBF_SIGMAS.to_vec(),
        }
    }
}

impl MixRbfKernel {
    pub fn new(sigmas: Vec<f64>) -> Self {
        Self { sigmas }
    }
}

impl Kernel for MixRbfKernel {
    fn name(&self) -> &'static str {
        "mix_rbf"
    }

    fn matrix(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let d2 = sq_dists(&flat(x)?, &flat(y)?)?;
        let mut k: Option<Tensor> = None;
        for &sigma in &self.sigmas {
            let term = d2.affine(-1.0 / (2.0 * sigma * sigma), 0.0)?.exp()?;
            k = Some(match k {
                None => term,
                Some(acc) => (acc + term)?,
            });
        }
        k.ok_or_else(|| Error::Msg("mix_rbf kernel needs at least one sigma".into()))
    }
}

/// Sum of rational-quadratic kernels `(1 + ‖x − y‖² / 2α)^(−α)`.
pub struct MixRqKernel {
    alphas: Vec<f64>,
}

impl Default for MixRqKernel {
    fn default() -> Self {
        Self {
            alphas: RQ_ALPHAS.to_vec(),
        }
    }
}

impl Kernel for MixRqKernel {
    fn name(&self) -> &'static str {
        "mix_rq"
    }

    fn matrix(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let d2 = sq_dists(&flat(x)?, &flat(y)?)?;
        let mut k: Option<Tensor> = None;
        for &alpha in &self.alphas {
            // Base is ≥ 1, so log is safe.
            let term = d2
                .affine(1.0 / (2.0 * alpha), 1.0)?
                .log()?
                .affine(-alpha, 0.0)?
                .exp()?;
            k = Some(match k {
                None => term,
                Some(acc) => (acc + term)?,
            });
        }
        k.ok_or_else(|| Error::Msg("mix_rq kernel needs at least one alpha".into()))
    }
}

/// Energy-distance kernel `‖x‖ + ‖y‖ − ‖x − y‖`.
pub struct DistanceKernel;

impl Kernel for DistanceKernel {
    fn name(&self) -> &'static str {
        "distance"
    }

    fn matrix(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let (x, y) = (flat(x)?, flat(y)?);
        let nx = x.sqr()?.sum_keepdim(1)?.affine(1.0, NORM_EPS)?.sqrt()?;
        let ny = y.sqr()?.sum_keepdim(1)?.affine(1.0, NORM_EPS)?.sqrt()?.t()?;
        let dist = sq_dists(&x, &y)?.affine(1.0, NORM_EPS)?.sqrt()?;
        nx.broadcast_add(&ny)?.sub(&dist)
    }
}

// ── MMD² ────────────────────────────────────────────────────────────────────

/// The three Gram matrices an MMD estimate needs.
pub struct KernelMatrices {
    pub k_xx: Tensor,
    pub k_xy: Tensor,
    pub k_yy: Tensor,
}

impl KernelMatrices {
    pub fn new(kernel: &dyn Kernel, x: &Tensor, y: &Tensor) -> Result<Self> {
        Ok(Self {
            k_xx: kernel.matrix(x, x)?,
            k_xy: kernel.matrix(x, y)?,
            k_yy: kernel.matrix(y, y)?,
        })
    }
}

fn off_diagonal_sum(k: &Tensor) -> Result<Tensor> {
    let n = k.dim(0)?;
    let eye = Tensor::eye(n, k.dtype(), k.device())?;
    k.sum_all()? - (k * eye)?.sum_all()?
}

/// Unbiased MMD² estimate (diagonals excluded from the within-set terms).
///
/// Returns a scalar tensor that stays attached to the autograd graph.
pub fn mmd2(k: &KernelMatrices) -> Result<Tensor> {
    let m = k.k_xx.dim(0)?;
    let n = k.k_yy.dim(0)?;
    if m < 2 || n < 2 {
        return Err(Error::Msg(format!(
            "unbiased MMD² needs at least two rows per set, got {m} and {n}"
        )));
    }
    let xx = off_diagonal_sum(&k.k_xx)?.affine(1.0 / (m * (m - 1)) as f64, 0.0)?;
    let yy = off_diagonal_sum(&k.k_yy)?.affine(1.0 / (n * (n - 1)) as f64, 0.0)?;
    let xy = k.k_xy.sum_all()?.affine(2.0 / (m * n) as f64, 0.0)?;
    (xx + yy)? - xy
}

/// MMD² between two feature batches under `kernel`.
pub fn mmd2_between(kernel: &dyn Kernel, x: &Tensor, y: &Tensor) -> Result<Tensor> {
    mmd2(&KernelMatrices::new(kernel, x, y)?)
}

/// Mean similarity of every row of `x` to the rows of `anchors`, shape `(m,)`.
pub fn mean_similarity(kernel: &dyn Kernel, x: &Tensor, anchors: &Tensor) -> Result<Tensor> {
    kernel.matrix(x, anchors)?.mean(1)
}

/// Read a scalar tensor as `f32` regardless of its dtype.
pub fn scalar_f32(t: &Tensor) -> Result<f32> {
    t.to_dtype(DType::F32)?.to_scalar::<f32>()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn batch(seed: f32, rows: usize) -> Tensor {
        let data: Vec<f32> = (0..rows * 3)
            .map(|i| ((i as f32 + 1.0) * seed).sin())
            .collect();
        Tensor::from_vec(data, (rows, 3), &Device::Cpu).unwrap()
    }

    #[test]
    fn every_kernel_is_symmetric_statistic() {
        let a = batch(0.7, 6);
        let b = batch(1.3, 5);
        for name in KERNEL_NAMES {
            let k = kernel_by_name(name).unwrap();
            let ab = scalar_f32(&mmd2_between(k.as_ref(), &a, &b).unwrap()).unwrap();
            let ba = scalar_f32(&mmd2_between(k.as_ref(), &b, &a).unwrap()).unwrap();
            assert!((ab - ba).abs() < 1e-4, "{name}: {ab} vs {ba}");
        }
    }

    #[test]
    fn gram_matrix_shape() {
        let k = MixRbfKernel::default();
        let m = k.matrix(&batch(0.3, 4), &batch(0.9, 7)).unwrap();
        assert_eq!(m.dims(), &[4, 7]);
    }

    #[test]
    fn rbf_self_similarity_is_number_of_sigmas() {
        let k = MixRbfKernel::new(vec![1.0, 2.0]);
        let x = batch(0.5, 3);
        let diag: Vec<f32> = (k.matrix(&x, &x).unwrap() * Tensor::eye(3, DType::F32, &Device::Cpu).unwrap())
            .unwrap()
            .sum(1)
            .unwrap()
            .to_vec1()
            .unwrap();
        for v in diag {
            assert!((v - 2.0).abs() < 1e-5);
        }
    }

    #[test]
    fn separated_sets_have_larger_mmd() {
        let k = MixRqKernel::default();
        let a = batch(0.7, 8);
        let near = (batch(0.7, 8) + 0.01).unwrap();
        let far = (batch(0.7, 8) + 3.0).unwrap();
        let close = scalar_f32(&mmd2_between(&k, &a, &near).unwrap()).unwrap();
        let apart = scalar_f32(&mmd2_between(&k, &a, &far).unwrap()).unwrap();
        assert!(apart > close);
    }

    #[test]
    fn single_row_is_rejected() {
        let k = DotKernel;
        assert!(mmd2_between(&k, &batch(0.1, 1), &batch(0.2, 4)).is_err());
    }

    #[test]
    fn nan_features_propagate_through_every_kernel() {
        let nan = Tensor::full(f32::NAN, (6, 3), &Device::Cpu).unwrap();
        let real = batch(0.4, 6);
        for name in KERNEL_NAMES {
            let k = kernel_by_name(name).unwrap();
            let v = scalar_f32(&mmd2_between(k.as_ref(), &nan, &real).unwrap()).unwrap();
            assert!(v.is_nan(), "{name} gave {v}");
        }
    }

    #[test]
    fn unknown_kernel_name() {
        assert!(kernel_by_name("laplace").is_none());
    }
}
