//! Model patching and device placement for quantized diffusion models.
//!
//! Powered by [Candle](https://github.com/huggingface/candle). A node-graph
//! host runtime drives patchers through the [`ModelPatcher`] trait: `load`
//! before sampling, `detach` when memory is reclaimed, `clone_patcher` when
//! a graph branch forks and needs its own patch state.
//!
//! Quantized weight formats cannot be patched in place or moved tensor by
//! tensor, so [`QuantizedPatcher`] routes every placement change through the
//! model's own safe-transfer path and keeps runtime hooks detached while the
//! weights are in flight:
//!
//! ```ignore
//! let patcher = QuantizedPatcher::new(model, load_device, Device::Cpu);
//! patcher.load(&load_device, LoadParams::default())?;
//! // ... sampling ...
//! patcher.detach(true)?;
//! ```

#![deny(missing_docs)]

pub mod device;
pub mod error;
pub mod model;
pub mod patcher;

pub use device::DeviceRequest;
pub use error::{PatcherError, Result};
pub use model::{DiffusionModel, ModelHook};
pub use patcher::{
    LoadParams, ModelOptions, ModelPatcher, PatchKind, PatcherCore, QuantizedPatcher, WeightPatch,
};
