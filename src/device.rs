use anyhow::{Context, Result};
use candle_core::Device;
use tracing::{info, warn};

use crate::config::DeviceChoice;

pub const USE_GPU_ENV: &str = "TCFG_USE_GPU";

pub fn cuda_available() -> bool {
    candle_core::utils::cuda_is_available()
}

/// Whether the environment asks for GPU acceleration (`TCFG_USE_GPU=1`).
pub fn gpu_requested() -> bool {
    matches!(
        std::env::var(USE_GPU_ENV).as_deref(),
        Ok("1" | "true" | "TRUE" | "yes" | "YES")
    )
}

pub fn select_device(choice: DeviceChoice, ordinal: usize) -> Result<Device> {
    match choice {
        DeviceChoice::Cpu => Ok(Device::Cpu),
        DeviceChoice::Cuda => {
            Device::new_cuda(ordinal).with_context(|| format!("opening cuda device {ordinal}"))
        }
        DeviceChoice::Auto => {
            if !gpu_requested() {
                info!("GPU not requested (set {USE_GPU_ENV}=1 to enable)");
                return Ok(Device::Cpu);
            }
            if !cuda_available() {
                warn!("GPU requested but CUDA not available, using cpu");
                return Ok(Device::Cpu);
            }
            Ok(Device::cuda_if_available(ordinal)?)
        }
    }
}
