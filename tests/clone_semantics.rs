//! Aliasing contract of patcher cloning: which state a fork shares with
//! its source and which it owns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};
use diffusion_patcher::{
    DiffusionModel, LoadParams, ModelPatcher, PatchKind, QuantizedPatcher, Result, WeightPatch,
};

struct StubModel {
    device: Mutex<Device>,
}

impl StubModel {
    fn shared() -> Arc<Self> {
        Arc::new(Self {
            device: Mutex::new(Device::Cpu),
        })
    }
}

impl DiffusionModel for StubModel {
    fn to_device_safely(&self, device: &Device) -> Result<()> {
        *self.device.lock().unwrap() = device.clone();
        Ok(())
    }

    fn device(&self) -> Device {
        self.device.lock().unwrap().clone()
    }

    fn size_in_bytes(&self) -> usize {
        2048
    }

    fn weight_keys(&self) -> Vec<String> {
        vec![
            "blocks.0.attn.qkv.weight".into(),
            "blocks.1.attn.qkv.weight".into(),
        ]
    }
}

fn patcher() -> QuantizedPatcher<StubModel> {
    QuantizedPatcher::new(StubModel::shared(), Device::Cpu, Device::Cpu)
}

fn diff_patch() -> WeightPatch {
    let tensor = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
    WeightPatch::new(PatchKind::Diff(tensor))
}

fn lora_patch() -> WeightPatch {
    let up = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
    let down = Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap();
    WeightPatch::new(PatchKind::Lora {
        up,
        down,
        alpha: Some(8.0),
    })
}

#[test]
fn pinned_set_is_shared_both_ways() {
    let original = patcher();
    let clone = original.clone();

    original.core().pin_weight("blocks.0.attn.qkv.weight");
    assert!(clone
        .core()
        .pinned()
        .contains("blocks.0.attn.qkv.weight"));

    clone.core().unpin_all();
    assert!(original.core().pinned().is_empty());
}

#[test]
fn injection_flags_are_shared() {
    let original = patcher();
    let clone = original.clone();

    clone.core().set_skip_injection(true);
    assert!(original.core().skip_injection());

    original.core().set_skip_injection(false);
    original.core().inject_model().unwrap();
    assert!(clone.core().is_injected());
}

#[test]
fn model_options_are_deep_copied() {
    let mut original = patcher();
    original
        .core_mut()
        .model_options_mut()
        .set_transformer_option("cfg_scale", 3.5)
        .unwrap();

    let mut clone = original.clone();
    clone
        .core_mut()
        .model_options_mut()
        .set_transformer_option("cfg_scale", 7.0)
        .unwrap();
    clone
        .core_mut()
        .model_options_mut()
        .set_transformer_option("shift", 1.15)
        .unwrap();

    let original_options = original.core().model_options();
    assert_eq!(
        original_options.transformer_options["cfg_scale"],
        serde_json::json!(3.5)
    );
    assert!(!original_options.transformer_options.contains_key("shift"));
}

#[test]
fn patch_maps_have_independent_keys_but_shared_entries() {
    let mut original = patcher();
    let mut patches = HashMap::new();
    patches.insert("blocks.0.attn.qkv.weight".to_string(), diff_patch());
    original.core_mut().add_patches(patches);

    let mut clone = original.clone();

    // Entries recorded before the fork are the same objects.
    let original_entry = &original.core().patches()["blocks.0.attn.qkv.weight"][0];
    let clone_entry = &clone.core().patches()["blocks.0.attn.qkv.weight"][0];
    assert!(Arc::ptr_eq(original_entry, clone_entry));

    // Keys added after the fork stay private to one side.
    let mut more = HashMap::new();
    more.insert("blocks.1.attn.qkv.weight".to_string(), lora_patch());
    clone.core_mut().add_patches(more);

    assert_eq!(clone.core().patches().len(), 2);
    assert_eq!(original.core().patches().len(), 1);
}

#[test]
fn patches_uuid_diverges_once_a_side_adds_patches() {
    let mut original = patcher();
    let clone = original.clone();
    assert_eq!(original.core().patches_uuid(), clone.core().patches_uuid());

    let mut patches = HashMap::new();
    patches.insert("blocks.0.attn.qkv.weight".to_string(), diff_patch());
    original.core_mut().add_patches(patches);

    assert_ne!(original.core().patches_uuid(), clone.core().patches_uuid());
}

#[test]
fn object_patches_are_shallow_copied() {
    let mut original = patcher();
    let replacement: Arc<dyn std::any::Any + Send + Sync> = Arc::new("sampler-v2".to_string());
    original
        .core_mut()
        .add_object_patch("model_sampling", Arc::clone(&replacement));

    let mut clone = original.clone();

    let original_value = &original.core().object_patches()["model_sampling"];
    let clone_value = &clone.core().object_patches()["model_sampling"];
    assert!(Arc::ptr_eq(original_value, clone_value));

    clone
        .core_mut()
        .add_object_patch("diffusion_model", Arc::new(0_u32));
    assert!(!original.core().object_patches().contains_key("diffusion_model"));
}

#[test]
fn backups_are_shared() {
    let original = patcher();
    let clone = original.clone();

    let tensor = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
    original
        .core()
        .backup()
        .lock()
        .unwrap()
        .insert("blocks.0.attn.qkv.weight".to_string(), tensor);

    assert_eq!(clone.core().backup().lock().unwrap().len(), 1);

    clone
        .core()
        .object_patches_backup()
        .lock()
        .unwrap()
        .insert("model_sampling".to_string(), Arc::new(1_u8));
    assert_eq!(
        original.core().object_patches_backup().lock().unwrap().len(),
        1
    );
}

#[test]
fn cloned_patcher_is_usable_through_the_trait() {
    let original = patcher();
    let forked = original.clone_patcher();
    forked.load(&Device::Cpu, LoadParams::default()).unwrap();
    forked.detach(false).unwrap();
    assert_eq!(forked.model_size(), 2048);
}
