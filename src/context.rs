//! Device and dtype shared by every network and tensor in a run.

use candle_core::{DType, Device};

/// Execution context passed to every component instead of a global device.
#[derive(Debug, Clone)]
pub struct Context {
    pub device: Device,
    pub dtype: DType,
}

impl Context {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    /// CPU, f32. What the tests use.
    pub fn cpu() -> Self {
        Self::new(Device::Cpu, DType::F32)
    }

    /// CUDA device `cuda_ordinal` if candle was built with CUDA and the device
    /// opens, otherwise CPU. Training always runs in f32.
    pub fn preferred(cuda_ordinal: usize) -> Self {
        let device = Device::cuda_if_available(cuda_ordinal).unwrap_or(Device::Cpu);
        Self::new(device, DType::F32)
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self.device, Device::Cpu)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::cpu()
    }
}
