//! Compute backend selection
//!
//! Resolved once at startup and fixed for the lifetime of the run. The probe
//! order is CUDA, then Metal, then the CPU fallback.

use anyhow::Result;
use candle_core::Device;
use tracing::{info, warn};

/// Pick the best available compute device.
///
/// Only a missing accelerator degrades to a fallback; an accelerator that is
/// present but fails to initialize is a fatal error.
pub fn select_device() -> Result<Device> {
    if candle_core::utils::cuda_is_available() {
        let device = Device::new_cuda(0)?;
        info!("Using CUDA device 0");
        return Ok(device);
    }
    if candle_core::utils::metal_is_available() {
        let device = Device::new_metal(0)?;
        info!("Using Metal device 0");
        return Ok(device);
    }
    warn!("No accelerator found, falling back to CPU (this will be very slow)");
    Ok(Device::Cpu)
}
