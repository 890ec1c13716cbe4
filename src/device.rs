//! Device selection for patcher construction.

use candle_core::backend::BackendDevice;
use candle_core::{CudaDevice, Device};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{PatcherError, Result};

/// Request for a specific device, used when configuring a patcher's
/// load/offload device pair.
#[derive(Debug, Clone, Default)]
pub enum DeviceRequest {
    /// Run on CPU (default).
    #[default]
    Cpu,
    /// Select a specific CUDA device by index.
    Cuda(usize),
}

impl DeviceRequest {
    /// Resolve the request into an actual [`Device`].
    pub fn resolve(self) -> Result<Device> {
        match self {
            DeviceRequest::Cpu => Ok(Device::Cpu),
            DeviceRequest::Cuda(i) => {
                // Cache one CudaDevice per GPU so every patcher selecting the
                // same index shares the stream. Synchronize before reuse to
                // flush pending ops from previously loaded models.
                static CUDA_DEVICE_CACHE: Lazy<Mutex<HashMap<usize, CudaDevice>>> =
                    Lazy::new(|| Mutex::new(HashMap::new()));

                let mut cache = CUDA_DEVICE_CACHE.lock().unwrap();
                if let Some(dev) = cache.get(&i) {
                    dev.synchronize().map_err(|e| {
                        PatcherError::Device(format!("Failed to sync CUDA device {i}: {e}"))
                    })?;
                    return Ok(Device::Cuda(dev.clone()));
                }

                let dev = CudaDevice::new_with_stream(i).map_err(|e| {
                    PatcherError::Device(format!(
                        "Failed to init CUDA device {i}: {e}. Try CPU as fallback."
                    ))
                })?;
                cache.insert(i, dev.clone());
                Ok(Device::Cuda(dev))
            }
        }
    }
}
