//! Patcher variant for quantized diffusion models.
//!
//! Quantized weight formats cannot be patched in place or moved tensor by
//! tensor, so this variant routes every placement change through the
//! model's own safe-transfer path and disables weight pinning entirely.
//! Everything else (patch recording, injection machinery, options)
//! comes unchanged from [`PatcherCore`].

use std::sync::Arc;

use candle_core::Device;

use super::{LoadParams, ModelPatcher, PatcherCore};
use crate::error::Result;
use crate::model::DiffusionModel;

/// Model patcher for quantized diffusion models.
///
/// `load` holds the patcher in the ejected state for the duration of the
/// transfer: hooks are detached before the weights move and restored once
/// the model has settled on the target device. `detach` ejects
/// unconditionally and parks the model on the offload device.
pub struct QuantizedPatcher<M: DiffusionModel + ?Sized> {
    core: PatcherCore<M>,
}

impl<M: DiffusionModel + ?Sized> QuantizedPatcher<M> {
    /// Create a patcher over `model` with the given device pair.
    pub fn new(model: Arc<M>, load_device: Device, offload_device: Device) -> Self {
        Self {
            core: PatcherCore::new(model, load_device, offload_device),
        }
    }

    /// Wrap an existing core, e.g. one produced by another patcher's
    /// clone path. Flag, pin, and backup state travel with the core.
    pub fn from_core(core: PatcherCore<M>) -> Self {
        Self { core }
    }

    /// Shared patcher state.
    pub fn core(&self) -> &PatcherCore<M> {
        &self.core
    }

    /// Mutable access to the shared patcher state.
    pub fn core_mut(&mut self) -> &mut PatcherCore<M> {
        &mut self.core
    }
}

impl<M: DiffusionModel + ?Sized> Clone for QuantizedPatcher<M> {
    /// Clone under the core's per-field copy policy: the model, device
    /// pair, pinned set, injection flags, and backups stay shared; the
    /// patch maps get independent keys over shared entries;
    /// `model_options` is deep-copied. See [`PatcherCore::clone_core`].
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone_core(),
        }
    }
}

impl<M: DiffusionModel + ?Sized + 'static> ModelPatcher for QuantizedPatcher<M> {
    fn load(&self, device_to: &Device, _params: LoadParams) -> Result<()> {
        // lowvram budgeting and forced weight patching do not apply to
        // quantized weights; placement is all-or-nothing.
        let _ejected = self.core.use_ejected()?;
        tracing::debug!(device = ?device_to.location(), "loading quantized model");
        self.core.model().to_device_safely(device_to)
    }

    fn detach(&self, _unpatch_all: bool) -> Result<()> {
        // Ejection is unconditional for this family.
        self.core.eject_model()?;
        tracing::debug!(
            device = ?self.core.offload_device().location(),
            "offloading quantized model"
        );
        self.core.model().to_device_safely(self.core.offload_device())
    }

    fn clone_patcher(&self) -> Box<dyn ModelPatcher> {
        Box::new(self.clone())
    }

    // Pinning is unsupported for quantized layouts; these overrides keep
    // the generic bookkeeping untouched.
    fn pin_weight_to_device(&self, _key: &str) {}

    fn unpin_weight(&self, _key: &str) {}

    fn unpin_all_weights(&self) {}

    fn model_size(&self) -> usize {
        self.core.model_size()
    }
}
