//! Tangential damping of the unconditional score.
//!
//! The unconditional and conditional scores of one batch element are stacked into a
//! 2xD matrix `[uncond; cond]`. The unconditional score is then replaced by its
//! projection onto the leading right-singular vector of that matrix, i.e. the
//! direction both scores share the most.
use candle_core::{DType, Device, Result, Tensor};
use nalgebra::{Matrix2, SymmetricEigen};
use tracing::{debug, warn};

/// Iterations allowed for the 2x2 eigen solve before it counts as a non-convergence.
pub const MAX_EIGEN_ITERATIONS: usize = 64;

/// Dtype the decomposition runs in. Half precision SVD is unstable, so anything
/// narrower than f32 is upcast; f64 stays f64.
pub fn working_dtype(dtype: DType) -> DType {
    match dtype {
        DType::F64 => DType::F64,
        _ => DType::F32,
    }
}

/// Damped unconditional score with the default decomposition.
///
/// `cond_score` and `uncond_score` must share the shape `[batch, *dims]`. The result has
/// the shape and dtype of `uncond_score`.
pub fn score_tangential_damping(cond_score: &Tensor, uncond_score: &Tensor) -> Result<Tensor> {
    tangential_damping_with(cond_score, uncond_score, leading_right_singular_vector)
}

/// Same as [`score_tangential_damping`] but with a caller supplied decomposition.
///
/// `decompose` receives the `[batch, 2, D]` score matrix and must return the leading
/// right-singular vectors as `[batch, 1, D]`. If it fails, it is retried once on a CPU
/// copy of the matrix; a second failure is returned as is.
pub fn tangential_damping_with<F>(
    cond_score: &Tensor,
    uncond_score: &Tensor,
    decompose: F,
) -> Result<Tensor>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    let batch = uncond_score.dim(0)?;
    let width = uncond_score.elem_count() / batch.max(1);
    let work = working_dtype(uncond_score.dtype());

    let cond_flat = cond_score.reshape((batch, 1, width))?.to_dtype(work)?;
    let uncond_flat = uncond_score.reshape((batch, 1, width))?.to_dtype(work)?;

    // Row 0 is the unconditional score, row 1 the conditional one.
    let score_matrix = Tensor::cat(&[&uncond_flat, &cond_flat], 1)?;

    let v1 = match decompose(&score_matrix) {
        Ok(v1) => v1,
        Err(err) => {
            warn!(
                %err,
                device = ?score_matrix.device(),
                "score decomposition failed, retrying on cpu"
            );
            let host_matrix = score_matrix.to_device(&Device::Cpu)?;
            let v1 = decompose(&host_matrix)?;
            v1.to_device(uncond_flat.device())?
        }
    };

    // (u . v1) v1
    let coeff = uncond_flat.matmul(&v1.t()?.contiguous()?)?;
    let damped = coeff.broadcast_mul(&v1)?;

    damped
        .reshape(uncond_score.shape())?
        .to_dtype(uncond_score.dtype())
}

/// Leading right-singular vector of each `[2, D]` slice of `matrix` (`[batch, 2, D]`).
///
/// Works through the 2x2 Gram matrix `M Mᵀ`: its top eigenpair `(σ², u)` gives the
/// singular vector as `v = uᵀM / σ`. Only the 2x2 eigen solve runs on the host; both
/// products stay on the matrix's device. A zero matrix yields a zero vector.
pub fn leading_right_singular_vector(matrix: &Tensor) -> Result<Tensor> {
    let (batch, rows, _width) = matrix.dims3()?;
    if rows != 2 {
        return Err(candle_core::Error::Msg(format!(
            "score matrix must stack exactly two rows, got {rows}"
        )));
    }

    let gram = matrix.matmul(&matrix.t()?.contiguous()?)?;
    let gram = gram.to_dtype(DType::F64)?.to_vec3::<f64>()?;

    let mut coeffs = Vec::with_capacity(batch * 2);
    for (b, g) in gram.iter().enumerate() {
        let m = Matrix2::new(g[0][0], g[0][1], g[1][0], g[1][1]);
        if m.iter().any(|x| !x.is_finite()) {
            return Err(candle_core::Error::Msg(format!(
                "non-finite score matrix for batch element {b}"
            )));
        }

        let eigen = SymmetricEigen::try_new(m, f64::EPSILON, MAX_EIGEN_ITERATIONS).ok_or_else(
            || {
                candle_core::Error::Msg(format!(
                    "eigen solve did not converge for batch element {b}"
                ))
            },
        )?;

        let top = eigen.eigenvalues.imax();
        let sigma = eigen.eigenvalues[top].max(0.0).sqrt();
        if sigma > 0.0 {
            let u = eigen.eigenvectors.column(top);
            coeffs.push(u[0] / sigma);
            coeffs.push(u[1] / sigma);
        } else {
            coeffs.push(0.0);
            coeffs.push(0.0);
        }
        debug!(batch = b, sigma, "leading singular value");
    }

    let coeffs = Tensor::from_vec(coeffs, (batch, 1, 2), matrix.device())?.to_dtype(matrix.dtype())?;
    coeffs.matmul(matrix)
}
