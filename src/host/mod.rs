//! Wiring between the guidance math and whatever sampler runs it.
//!
//! The sampler is abstracted as a [`PostGuidanceHost`]: something cheap to clone that
//! accepts post-CFG callbacks. TCFG never patches a host in place. It clones it, registers
//! on the clone and hands the clone back for the one request.
pub mod denoiser;

pub use denoiser::CfgDenoiser;

use candle_core::{Result, Tensor};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{FailurePolicy, TcfgConfig, DEFAULT_CFG_SCALE};
use crate::guidance::{PostCfgArgs, TcfgHook};

pub type PostCfgFn = Arc<dyn Fn(&PostCfgArgs<'_>) -> Result<Tensor> + Send + Sync>;

pub trait PostGuidanceHost: Clone {
    /// Adds a callback run after CFG on every sampling step.
    fn register_post_guidance_hook(&mut self, hook: PostCfgFn);
}

/// The host's view of one generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub cfg_scale: f64,
    pub tcfg: TcfgConfig,
    /// Parameters stored with the output so the generation can be reproduced.
    pub extra_generation_params: BTreeMap<String, Value>,
}

impl GenerationRequest {
    pub fn new(cfg_scale: f64, tcfg: TcfgConfig) -> Self {
        Self {
            cfg_scale,
            tcfg,
            extra_generation_params: BTreeMap::new(),
        }
    }
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self::new(DEFAULT_CFG_SCALE, TcfgConfig::default())
    }
}

/// Wraps a [`TcfgHook`] into a host callback honouring `policy` on failure.
pub fn post_cfg_hook(hook: TcfgHook, policy: FailurePolicy) -> PostCfgFn {
    Arc::new(move |args: &PostCfgArgs<'_>| match hook.apply(args) {
        Ok(out) => Ok(out),
        Err(err) => match policy {
            FailurePolicy::Propagate => Err(err),
            FailurePolicy::Uncorrected => {
                warn!(%err, "tcfg step failed, keeping uncorrected cfg output");
                Ok(args.denoised.clone())
            }
        },
    })
}

/// Clone of `host` with the TCFG hook registered. `host` itself is not touched.
pub fn patch_model<H: PostGuidanceHost>(host: &H, config: &TcfgConfig, cfg_scale: f64) -> H {
    let mut patched = host.clone();
    let hook = TcfgHook::new(config.scale as f64, cfg_scale);
    patched.register_post_guidance_hook(post_cfg_hook(hook, config.on_failure));
    patched
}

/// Runs before sampling starts. Returns the patched host to sample this request with, or
/// `None` when TCFG is off and the original host should be used.
pub fn process_before_every_sampling<H: PostGuidanceHost>(
    request: &mut GenerationRequest,
    host: &H,
) -> Option<H> {
    if !request.tcfg.is_active() {
        return None;
    }

    let patched = patch_model(host, &request.tcfg, request.cfg_scale);
    for (key, value) in request.tcfg.generation_params() {
        request.extra_generation_params.insert(key.to_string(), value);
    }
    info!(
        scale = request.tcfg.scale,
        cfg_scale = request.cfg_scale,
        "tcfg patched for request"
    );
    Some(patched)
}
