use candle_core::{Result, Tensor};
use std::fmt;

use super::{PostCfgFn, PostGuidanceHost};
use crate::guidance::{cfg, PostCfgArgs};

/// Minimal CFG sampler step with post-CFG hooks, the way a diffusion host runs them:
/// plain CFG first, then every registered hook in order, each one seeing the previous
/// hook's output as `denoised`.
#[derive(Clone, Default)]
pub struct CfgDenoiser {
    post_cfg: Vec<PostCfgFn>,
}

impl CfgDenoiser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post_cfg_hooks(&self) -> usize {
        self.post_cfg.len()
    }

    pub fn combine(
        &self,
        cond_denoised: &Tensor,
        uncond_denoised: &Tensor,
        input: &Tensor,
        cfg_scale: f64,
    ) -> Result<Tensor> {
        let mut denoised = cfg(cond_denoised, uncond_denoised, cfg_scale)?;
        for hook in &self.post_cfg {
            let mut args = PostCfgArgs::new(cond_denoised, uncond_denoised, input, &denoised);
            args.cond_scale = Some(cfg_scale);
            let next = hook(&args)?;
            denoised = next;
        }
        Ok(denoised)
    }
}

impl PostGuidanceHost for CfgDenoiser {
    fn register_post_guidance_hook(&mut self, hook: PostCfgFn) {
        self.post_cfg.push(hook);
    }
}

impl fmt::Debug for CfgDenoiser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CfgDenoiser")
            .field("post_cfg_hooks", &self.post_cfg.len())
            .finish()
    }
}
