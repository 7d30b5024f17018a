//! Tangential Damping CFG (TCFG).
//!
//! Before the CFG interpolation, the unconditional score is projected onto the direction
//! it shares with the conditional score. `guidance` holds the math, `host` the sampler
//! wiring.
pub mod config;
pub mod device;
pub mod guidance;
pub mod host;

// Re-exports
pub use config::{FailurePolicy, Settings, TcfgConfig};
pub use guidance::{cfg, score_tangential_damping, PostCfgArgs, TcfgHook};
pub use host::{
    patch_model, process_before_every_sampling, CfgDenoiser, GenerationRequest, PostCfgFn,
    PostGuidanceHost,
};
