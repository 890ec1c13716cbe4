//! Patch bookkeeping, injection machinery, and the host-facing
//! [`ModelPatcher`] trait.
//!
//! The host runtime owns a table of patchers and drives them
//! polymorphically: [`load`] before sampling, [`detach`] when memory is
//! reclaimed, [`clone_patcher`] when a graph branch forks and needs its
//! own patch state. Which fields a clone shares with its source and which
//! it copies is part of the contract; see [`PatcherCore::clone_core`]
//! for the per-field policy.
//!
//! [`load`]: ModelPatcher::load
//! [`detach`]: ModelPatcher::detach
//! [`clone_patcher`]: ModelPatcher::clone_patcher

pub mod quantized;

pub use quantized::QuantizedPatcher;

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{DiffusionModel, ModelHook};

// ============ Patch data model ============

/// A runtime weight modification, keyed by model weight name.
#[derive(Debug, Clone)]
pub struct WeightPatch {
    /// What to apply.
    pub kind: PatchKind,
    /// Strength of the patch itself.
    pub strength: f32,
    /// Strength multiplier on the base weight.
    pub strength_model: f32,
}

impl WeightPatch {
    /// A patch applied at full strength with the base weight unscaled.
    pub fn new(kind: PatchKind) -> Self {
        Self {
            kind,
            strength: 1.0,
            strength_model: 1.0,
        }
    }
}

/// Supported weight patch formats.
#[derive(Debug, Clone)]
pub enum PatchKind {
    /// Additive delta with the same shape as the target weight.
    Diff(Tensor),
    /// Low-rank adaptation pair.
    Lora {
        /// Up-projection.
        up: Tensor,
        /// Down-projection.
        down: Tensor,
        /// Scale override; applied as `alpha / rank` when set.
        alpha: Option<f32>,
    },
}

/// Deep-copyable options forwarded to the model at load time.
///
/// Cloning an options bag never aliases the source; this is the one
/// field of a patcher that every clone owns outright.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOptions {
    /// Free-form options consumed by the model's transformer blocks.
    pub transformer_options: BTreeMap<String, serde_json::Value>,
}

impl ModelOptions {
    /// Insert a transformer option, serializing the value.
    pub fn set_transformer_option(&mut self, key: &str, value: impl Serialize) -> Result<()> {
        self.transformer_options
            .insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }
}

/// Auxiliary parameters of [`ModelPatcher::load`].
///
/// Variants that do not support partial loads accept these for interface
/// compatibility and ignore them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadParams {
    /// Memory budget for partial loads, in bytes. Zero means no budget.
    pub lowvram_model_memory: usize,
    /// Re-apply weight patches even when already applied.
    pub force_patch_weights: bool,
    /// Load every weight eagerly.
    pub full_load: bool,
}

// ============ Host-facing trait ============

/// Polymorphic patcher surface the host runtime dispatches through.
///
/// The host holds `Box<dyn ModelPatcher>` per graph node and never knows
/// the concrete variant behind it.
pub trait ModelPatcher: Send + Sync {
    /// Place the wrapped model on `device_to`.
    fn load(&self, device_to: &Device, params: LoadParams) -> Result<()>;

    /// Eject injected modifications and move the model to the offload
    /// device.
    fn detach(&self, unpatch_all: bool) -> Result<()>;

    /// Produce an independent patcher over the same model, following the
    /// variant's per-field copy policy.
    fn clone_patcher(&self) -> Box<dyn ModelPatcher>;

    /// Mark a weight as fixed to its device, exempt from offload.
    fn pin_weight_to_device(&self, key: &str);

    /// Remove a weight's pin.
    fn unpin_weight(&self, key: &str);

    /// Remove all weight pins.
    fn unpin_all_weights(&self);

    /// Total size of the wrapped model in bytes.
    fn model_size(&self) -> usize;
}

// ============ Shared patcher core ============

/// Bookkeeping shared by every patcher variant.
///
/// Holds the wrapped model, its device pair, recorded patches, and the
/// injection state the host's machinery mutates. Fields whose mutations
/// must stay visible across clones (`pinned`, the injection flags, the
/// backups) live behind shared handles; see [`clone_core`] for the full
/// policy.
///
/// [`clone_core`]: PatcherCore::clone_core
pub struct PatcherCore<M: ?Sized> {
    model: Arc<M>,
    load_device: Device,
    offload_device: Device,
    size: usize,
    weight_inplace_update: bool,

    patches: HashMap<String, Vec<Arc<WeightPatch>>>,
    patches_uuid: Uuid,
    object_patches: HashMap<String, Arc<dyn Any + Send + Sync>>,
    model_options: ModelOptions,

    backup: Arc<Mutex<HashMap<String, Tensor>>>,
    object_patches_backup: Arc<Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>>,

    hooks: Vec<Arc<dyn ModelHook<M>>>,
    pinned: Arc<Mutex<HashSet<String>>>,
    is_injected: Arc<AtomicBool>,
    skip_injection: Arc<AtomicBool>,
}

impl<M: DiffusionModel + ?Sized> PatcherCore<M> {
    /// Create a core over `model` with the given device pair.
    ///
    /// Injection flags start cleared and the pinned set starts empty,
    /// whichever construction path produced the core.
    pub fn new(model: Arc<M>, load_device: Device, offload_device: Device) -> Self {
        let size = model.size_in_bytes();
        Self {
            model,
            load_device,
            offload_device,
            size,
            weight_inplace_update: false,
            patches: HashMap::new(),
            patches_uuid: Uuid::new_v4(),
            object_patches: HashMap::new(),
            model_options: ModelOptions::default(),
            backup: Arc::new(Mutex::new(HashMap::new())),
            object_patches_backup: Arc::new(Mutex::new(HashMap::new())),
            hooks: Vec::new(),
            pinned: Arc::new(Mutex::new(HashSet::new())),
            is_injected: Arc::new(AtomicBool::new(false)),
            skip_injection: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enable in-place weight updates when patches are applied.
    pub fn with_weight_inplace_update(mut self, enabled: bool) -> Self {
        self.weight_inplace_update = enabled;
        self
    }

    // ============ Accessors ============

    /// The wrapped model.
    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    /// Device the model is placed on when loaded.
    pub fn load_device(&self) -> &Device {
        &self.load_device
    }

    /// Device the model is parked on when not in use.
    pub fn offload_device(&self) -> &Device {
        &self.offload_device
    }

    /// Total size of the wrapped model in bytes.
    pub fn model_size(&self) -> usize {
        self.size
    }

    /// Whether patch application may overwrite weights in place.
    pub fn weight_inplace_update(&self) -> bool {
        self.weight_inplace_update
    }

    /// Recorded weight patches, keyed by weight name.
    pub fn patches(&self) -> &HashMap<String, Vec<Arc<WeightPatch>>> {
        &self.patches
    }

    /// Identity of the current patch set. Regenerated whenever patches
    /// are added, so loaders can tell whether applied weights are stale.
    pub fn patches_uuid(&self) -> Uuid {
        self.patches_uuid
    }

    /// Recorded object patches, keyed by attribute path.
    pub fn object_patches(&self) -> &HashMap<String, Arc<dyn Any + Send + Sync>> {
        &self.object_patches
    }

    /// Options forwarded to the model at load time.
    pub fn model_options(&self) -> &ModelOptions {
        &self.model_options
    }

    /// Mutable access to the load-time options.
    pub fn model_options_mut(&mut self) -> &mut ModelOptions {
        &mut self.model_options
    }

    /// Handle to the weight backups taken before in-place patching.
    /// Shared across clones.
    pub fn backup(&self) -> Arc<Mutex<HashMap<String, Tensor>>> {
        Arc::clone(&self.backup)
    }

    /// Handle to the object-patch backups. Shared across clones.
    pub fn object_patches_backup(
        &self,
    ) -> Arc<Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>> {
        Arc::clone(&self.object_patches_backup)
    }

    /// Whether hooks are currently attached to the model.
    pub fn is_injected(&self) -> bool {
        self.is_injected.load(Ordering::Acquire)
    }

    /// Whether injection is bypassed.
    pub fn skip_injection(&self) -> bool {
        self.skip_injection.load(Ordering::Acquire)
    }

    /// Bypass (or re-enable) injection. Visible across clones.
    pub fn set_skip_injection(&self, skip: bool) {
        self.skip_injection.store(skip, Ordering::Release);
    }

    // ============ Patch recording ============

    /// Record weight patches, skipping keys the model does not expose.
    ///
    /// Returns the accepted keys, sorted. Accepting at least one patch
    /// regenerates [`patches_uuid`].
    ///
    /// [`patches_uuid`]: PatcherCore::patches_uuid
    pub fn add_patches(&mut self, patches: HashMap<String, WeightPatch>) -> Vec<String> {
        let known: HashSet<String> = self.model.weight_keys().into_iter().collect();
        let mut accepted = Vec::new();
        for (key, patch) in patches {
            if !known.contains(&key) {
                continue;
            }
            self.patches
                .entry(key.clone())
                .or_default()
                .push(Arc::new(patch));
            accepted.push(key);
        }
        if !accepted.is_empty() {
            self.patches_uuid = Uuid::new_v4();
        }
        accepted.sort();
        accepted
    }

    /// Record an object patch for an attribute path on the model.
    pub fn add_object_patch(&mut self, path: &str, value: Arc<dyn Any + Send + Sync>) {
        self.object_patches.insert(path.to_string(), value);
    }

    // ============ Injection machinery ============

    /// Register a hook to be attached on injection.
    pub fn add_hook(&mut self, hook: Arc<dyn ModelHook<M>>) {
        self.hooks.push(hook);
    }

    /// Attach all registered hooks to the model.
    ///
    /// No-op when already injected or when [`skip_injection`] is set.
    ///
    /// [`skip_injection`]: PatcherCore::skip_injection
    pub fn inject_model(&self) -> Result<()> {
        if self.skip_injection() || self.is_injected() {
            return Ok(());
        }
        for hook in &self.hooks {
            tracing::trace!(hook = hook.name(), "attaching hook");
            hook.attach(self.model.as_ref())?;
        }
        self.is_injected.store(true, Ordering::Release);
        Ok(())
    }

    /// Detach all hooks from the model, in reverse registration order.
    /// Idempotent.
    pub fn eject_model(&self) -> Result<()> {
        if !self.is_injected() {
            return Ok(());
        }
        for hook in self.hooks.iter().rev() {
            tracing::trace!(hook = hook.name(), "detaching hook");
            hook.detach(self.model.as_ref())?;
        }
        self.is_injected.store(false, Ordering::Release);
        Ok(())
    }

    /// Hold the patcher in ejected state for the lifetime of the guard.
    ///
    /// Ejects immediately; the returned guard re-injects on drop iff
    /// injection was active at acquire time. The release runs on every
    /// exit path, including unwinding.
    pub fn use_ejected(&self) -> Result<EjectedGuard<'_, M>> {
        let reinject = self.is_injected();
        self.eject_model()?;
        Ok(EjectedGuard {
            core: self,
            reinject,
        })
    }

    // ============ Pin bookkeeping ============

    /// Mark a weight as fixed to its device. Generic bookkeeping; a
    /// variant whose weight format cannot honor pins overrides the
    /// [`ModelPatcher`] pin operations with no-ops instead.
    pub fn pin_weight(&self, key: &str) {
        self.pinned.lock().unwrap().insert(key.to_string());
    }

    /// Remove a weight's pin.
    pub fn unpin_weight(&self, key: &str) {
        self.pinned.lock().unwrap().remove(key);
    }

    /// Remove all pins.
    pub fn unpin_all(&self) {
        self.pinned.lock().unwrap().clear();
    }

    /// Snapshot of the pinned weight keys.
    pub fn pinned(&self) -> HashSet<String> {
        self.pinned.lock().unwrap().clone()
    }

    // ============ Cloning ============

    /// Clone the core, field by field, under this policy:
    ///
    /// | policy  | fields |
    /// |---------|--------|
    /// | share   | `model`, `load_device`, `offload_device`, `patches_uuid`, `backup`, `object_patches_backup`, `pinned`, `is_injected`, `skip_injection` |
    /// | shallow | `patches` (new map and lists, shared patch objects), `object_patches` (new map, shared values), `hooks` (new list, shared hooks) |
    /// | deep    | `model_options` |
    /// | copy    | `size`, `weight_inplace_update` |
    ///
    /// Shared fields alias: pinning or injection-state changes made
    /// through either core are visible through the other. Shallow fields
    /// give each core its own key set while the entries themselves stay
    /// shared. The asymmetry is deliberate and matches what the host's
    /// patch machinery assumes is safe to alias.
    pub fn clone_core(&self) -> Self {
        let mut patches = HashMap::with_capacity(self.patches.len());
        for (key, list) in &self.patches {
            patches.insert(key.clone(), list.clone());
        }

        Self {
            model: Arc::clone(&self.model),
            load_device: self.load_device.clone(),
            offload_device: self.offload_device.clone(),
            size: self.size,
            weight_inplace_update: self.weight_inplace_update,
            patches,
            patches_uuid: self.patches_uuid,
            object_patches: self.object_patches.clone(),
            model_options: self.model_options.clone(),
            backup: Arc::clone(&self.backup),
            object_patches_backup: Arc::clone(&self.object_patches_backup),
            hooks: self.hooks.clone(),
            pinned: Arc::clone(&self.pinned),
            is_injected: Arc::clone(&self.is_injected),
            skip_injection: Arc::clone(&self.skip_injection),
        }
    }
}

/// RAII bracket holding a patcher in ejected state.
///
/// Returned by [`PatcherCore::use_ejected`]. Dropping the guard restores
/// the injection state found at acquire time; a failed re-injection
/// cannot propagate out of `drop` and is logged instead.
#[must_use = "dropping the guard immediately ends the ejected scope"]
pub struct EjectedGuard<'a, M: DiffusionModel + ?Sized> {
    core: &'a PatcherCore<M>,
    reinject: bool,
}

impl<M: DiffusionModel + ?Sized> Drop for EjectedGuard<'_, M> {
    fn drop(&mut self) {
        if self.reinject {
            if let Err(err) = self.core.inject_model() {
                tracing::warn!(%err, "re-injection after ejected scope failed");
            }
        }
    }
}
