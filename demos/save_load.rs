//! Saving and loading adapter checkpoints.
//!
//! This example demonstrates:
//! - Saving every adapter of a model with `save_pretrained`
//! - Restoring one onto a fresh copy of the base network
//! - Loading a second adapter next to it
//! - The on-disk layout: `adapter_config.json` + `adapter_model.safetensors`

use std::collections::HashMap;

use anyhow::Result;
use candle_core::{Device, Tensor};
use peft_tuners::nn::Activation;
use peft_tuners::{
    load_adapter_config, BaseLayer, Layer, LoraConfig, LoraInitialization, PeftConfig, PeftModel,
    Sequential, ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME,
};

fn network(weights: &HashMap<&str, Tensor>) -> Result<Layer> {
    let linear = |name: &str| -> Result<Layer> { Ok(Layer::Base(BaseLayer::linear(&weights[name], None)?)) };
    Ok(Sequential::new()
        .add_named("fc1", linear("fc1")?)
        .add_named("act", Layer::Module(Box::new(Activation::Tanh)))
        .add_named("fc2", linear("fc2")?)
        .into_layer())
}

fn main() -> Result<()> {
    println!("=== Save / Load Example ===\n");

    let device = Device::Cpu;
    let weights: HashMap<&str, Tensor> = [
        ("fc1", Tensor::randn(0f32, 0.1, (48, 24), &device)?),
        ("fc2", Tensor::randn(0f32, 0.1, (12, 48), &device)?),
    ]
    .into_iter()
    .collect();
    let input = Tensor::randn(0f32, 1.0, (2, 24), &device)?;

    let lora = |r: usize| LoraConfig {
        init_lora_weights: LoraInitialization::Random,
        ..LoraConfig::new(r, 2 * r, ["fc1", "fc2"])
    };
    let mut model = PeftModel::new(network(&weights)?, lora(4), "default")?;
    model.add_adapter("wide", lora(16))?;
    let expected = model.forward(&input)?;

    let dir = tempfile::tempdir()?;
    model.save_pretrained(dir.path(), None)?;
    println!("Saved to {}", dir.path().display());
    for entry in walk(dir.path())? {
        println!("  {entry}");
    }

    let config: PeftConfig = load_adapter_config(dir.path().join(ADAPTER_CONFIG_FILENAME))?;
    println!("\nSaved config: {} (inference_mode = {})", config.peft_type(), config.inference_mode());

    // Restore onto a fresh base network
    let mut restored = PeftModel::from_pretrained(network(&weights)?, dir.path(), "default", false)?;
    let output = restored.forward(&input)?;
    let diff = (output - &expected)?.abs()?.max_all()?.to_scalar::<f32>()?;
    println!("\nRestored 'default', max difference: {diff:.2e}");
    println!("Trainable after inference load: {}", restored.get_nb_trainable_parameters().0);

    restored.load_adapter(dir.path().join("wide"), "wide", true)?;
    println!("Loaded 'wide' as trainable; adapters: {:?}", restored.adapter_names());
    println!("Trainable now: {}", restored.get_nb_trainable_parameters().0);

    Ok(())
}

fn walk(dir: &std::path::Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            files.extend(walk(&path)?);
        } else if path.ends_with(ADAPTER_WEIGHTS_FILENAME) || path.ends_with(ADAPTER_CONFIG_FILENAME) {
            let size = std::fs::metadata(&path)?.len();
            files.push(format!("{} ({size} bytes)", path.display()));
        }
    }
    files.sort();
    Ok(files)
}
