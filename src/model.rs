//! Contracts for the models and runtime modifications a patcher manages.
//!
//! Concrete diffusion model implementations live with the host runtime,
//! not in this crate. The patcher only needs two things from its
//! collaborators: a way to move the wrapped model between devices, and a
//! way to attach/detach the runtime modifications it tracks.

use candle_core::Device;

use crate::error::Result;

/// A diffusion model whose placement a patcher manages.
///
/// Quantized formats cannot be moved with a plain tensor-by-tensor copy:
/// block scales and zero points travel with their weight blocks, and some
/// layouts are repacked per device. [`to_device_safely`] owns those
/// concerns; the patcher only decides *when* and *where* to move.
///
/// Placement changes go through `&self`: implementations keep their
/// device state behind interior mutability so a shared model can be moved
/// by whichever patcher currently owns the load.
///
/// [`to_device_safely`]: DiffusionModel::to_device_safely
pub trait DiffusionModel: Send + Sync {
    /// Move the model to `device`, handling any layout concerns of the
    /// concrete weight format.
    fn to_device_safely(&self, device: &Device) -> Result<()>;

    /// The device the model currently lives on.
    fn device(&self) -> Device;

    /// Total parameter size in bytes, used by the host for memory
    /// budgeting.
    fn size_in_bytes(&self) -> usize;

    /// Names of patchable weight keys. Patches added for keys outside
    /// this set are skipped.
    fn weight_keys(&self) -> Vec<String>;
}

/// A named runtime modification a patcher can inject into a model.
///
/// Hooks are attached when the patcher injects the model and detached in
/// reverse registration order on ejection.
pub trait ModelHook<M: ?Sized>: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Attach the modification to the model.
    fn attach(&self, model: &M) -> Result<()>;

    /// Remove the modification from the model.
    fn detach(&self, model: &M) -> Result<()>;
}
