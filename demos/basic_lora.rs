//! Basic LoRA adapter usage example.
//!
//! This example demonstrates:
//! - Wrapping a small network with a LoRA adapter
//! - Inspecting trainable parameter counts
//! - A few optimizer steps on the adapter only
//! - Merging the adapter back into the base weights

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::{Optimizer, SGD};
use peft_tuners::nn::Activation;
use peft_tuners::{
    format_parameter_count, BaseLayer, ForwardContext, Layer, LoraConfig, PeftModel, Sequential,
};

fn linear(in_features: usize, out_features: usize, device: &Device) -> Result<Layer> {
    let weight = Tensor::randn(0f32, 0.1, (out_features, in_features), device)?;
    let bias = Tensor::zeros(out_features, candle_core::DType::F32, device)?;
    Ok(Layer::Base(BaseLayer::linear(&weight, Some(&bias))?))
}

fn main() -> Result<()> {
    println!("=== Basic LoRA Example ===\n");

    let device = Device::Cpu;
    let (in_features, hidden, out_features) = (64, 128, 16);

    // A two-layer MLP: fc1 -> relu -> fc2
    let network = Sequential::new()
        .add_named("fc1", linear(in_features, hidden, &device)?)
        .add_named("act", Layer::Module(Box::new(Activation::Relu)))
        .add_named("fc2", linear(hidden, out_features, &device)?)
        .into_layer();

    // - r: rank of the low-rank decomposition
    // - alpha: the delta is scaled by alpha / r
    let config = LoraConfig::new(8, 16, ["fc1", "fc2"]);
    println!("LoRA Configuration:");
    println!("  Rank (r): {}", config.r);
    println!("  Alpha: {}", config.alpha);
    println!("  Scaling factor: {}\n", config.scaling());

    let model = PeftModel::new(network, config, "default")?;
    let (trainable, total) = model.get_nb_trainable_parameters();
    println!("Parameters:");
    println!("  Trainable: {}", format_parameter_count(trainable));
    println!("  Total: {}", format_parameter_count(total));
    println!(
        "  Trainable share: {:.2}%\n",
        100.0 * trainable as f64 / total as f64
    );

    let input = Tensor::randn(0f32, 1.0, (32, in_features), &device)?;
    let target = Tensor::randn(0f32, 1.0, (32, out_features), &device)?;

    let mut sgd = SGD::new(model.trainable_vars(), 0.05)?;
    for step in 0..20 {
        let output = model.forward_with_context(&input, &mut ForwardContext::train())?;
        let loss = (output - &target)?.sqr()?.mean_all()?;
        sgd.backward_step(&loss)?;
        if step % 5 == 0 {
            println!("  step {step:>2}: loss = {:.5}", loss.to_scalar::<f32>()?);
        }
    }

    let adapted = model.forward(&input)?;
    println!("\nOutput shape: {:?}", adapted.dims());

    // Fold B·A into the base weights and drop the wrappers
    let merged = model.merge_and_unload(None, true, true)?;
    let output = merged.forward(&input, &mut ForwardContext::new())?;
    let diff = (output - adapted)?.abs()?.max_all()?.to_scalar::<f32>()?;
    println!("Max difference after merge_and_unload: {diff:.2e}");

    Ok(())
}
