pub mod post_cfg;
pub mod tangential;

pub use post_cfg::{PostCfgArgs, TcfgHook};
pub use tangential::{leading_right_singular_vector, score_tangential_damping, tangential_damping_with};

use candle_core::{Result, Tensor};

/// Classifier-free guidance: `uncond + scale * (cond - uncond)`.
pub fn cfg(cond: &Tensor, uncond: &Tensor, scale: f64) -> Result<Tensor> {
    let diff = (cond - uncond)?;
    uncond + diff.affine(scale, 0.0)?
}

/// `start + weight * (end - start)`. `weight == 0` returns `start` bit for bit.
pub fn lerp(start: &Tensor, end: &Tensor, weight: f64) -> Result<Tensor> {
    let step = (end - start)?.affine(weight, 0.0)?;
    start + step
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_cfg_formula() -> Result<()> {
        let device = Device::Cpu;
        let cond = Tensor::new(&[1f32, 2.0, 3.0], &device)?;
        let uncond = Tensor::new(&[0f32, 1.0, 1.0], &device)?;

        let out = cfg(&cond, &uncond, 7.0)?.to_vec1::<f32>()?;
        assert_eq!(out, vec![7.0, 8.0, 15.0]);

        // scale 1 is the conditional prediction
        let out = cfg(&cond, &uncond, 1.0)?.to_vec1::<f32>()?;
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
        Ok(())
    }

    #[test]
    fn test_lerp_endpoints() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::randn(0f32, 1.0, (2, 8), &device)?;
        let b = Tensor::randn(0f32, 1.0, (2, 8), &device)?;

        assert_eq!(lerp(&a, &b, 0.0)?.to_vec2::<f32>()?, a.to_vec2::<f32>()?);

        let at_one = lerp(&a, &b, 1.0)?.to_vec2::<f32>()?;
        for (row_out, row_b) in at_one.iter().zip(b.to_vec2::<f32>()?) {
            for (x, y) in row_out.iter().zip(row_b) {
                assert!((x - y).abs() < 1e-6);
            }
        }

        // past 1 extrapolates: 2b - a
        let at_two = lerp(&a, &b, 2.0)?;
        let expected = ((&b * 2.0)? - &a)?;
        let err = (at_two - expected)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(err < 1e-5);
        Ok(())
    }
}
