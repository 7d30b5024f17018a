use candle_core::{Result, Tensor};
use tracing::debug;

use super::{cfg, lerp, score_tangential_damping};

/// What the sampler hands a post-CFG hook for one step.
#[derive(Debug, Clone, Copy)]
pub struct PostCfgArgs<'a> {
    pub cond_denoised: &'a Tensor,
    pub uncond_denoised: &'a Tensor,
    /// Noisy latent of the current step.
    pub input: &'a Tensor,
    /// Guided output as computed so far (plain CFG, or the previous hook's result).
    pub denoised: &'a Tensor,
    pub sigma: Option<&'a Tensor>,
    pub cond_scale: Option<f64>,
}

impl<'a> PostCfgArgs<'a> {
    pub fn new(
        cond_denoised: &'a Tensor,
        uncond_denoised: &'a Tensor,
        input: &'a Tensor,
        denoised: &'a Tensor,
    ) -> Self {
        Self {
            cond_denoised,
            uncond_denoised,
            input,
            denoised,
            sigma: None,
            cond_scale: None,
        }
    }
}

/// Post-CFG correction: rebuilds the guided output from a tangentially damped
/// unconditional prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TcfgHook {
    /// Blend between the original (0.0) and fully damped (1.0) unconditional score.
    pub scale: f64,
    /// Guidance strength of the request, read once when the hook is built.
    pub cfg_scale: f64,
}

impl TcfgHook {
    pub fn new(scale: f64, cfg_scale: f64) -> Self {
        Self { scale, cfg_scale }
    }

    pub fn apply(&self, args: &PostCfgArgs<'_>) -> Result<Tensor> {
        let x = args.input;
        let cond_pred = args.cond_denoised;

        // denoised -> score (epsilon-like residual)
        let cond_score = (x - cond_pred)?;
        let uncond_score = (x - args.uncond_denoised)?;

        let uncond_score_td = score_tangential_damping(&cond_score, &uncond_score)?;
        let final_uncond_score = lerp(&uncond_score, &uncond_score_td, self.scale)?;
        let final_uncond_pred = (x - final_uncond_score)?;

        debug!(scale = self.scale, cfg_scale = self.cfg_scale, dims = ?x.dims(), "tcfg step");
        cfg(cond_pred, &final_uncond_pred, self.cfg_scale)
    }
}
