//! Multiple adapters on one network.
//!
//! This example demonstrates:
//! - Adding several named adapters to one model
//! - Switching and combining active adapters
//! - Routing each batch row through a different adapter
//! - Mixing LoRA and LoHa adapters with `MixedModel`

use anyhow::Result;
use candle_core::{Device, Tensor};
use peft_tuners::nn::Activation;
use peft_tuners::{
    BaseAdapterConfig, BaseLayer, ForwardContext, Layer, LoHaConfig, LoraConfig,
    LoraInitialization, MixedModel, PeftModel, Sequential, BASE_ONLY,
};

fn network(device: &Device) -> Result<Layer> {
    let linear = |i: usize, o: usize| -> Result<Layer> {
        let weight = Tensor::randn(0f32, 0.1, (o, i), device)?;
        Ok(Layer::Base(BaseLayer::linear(&weight, None)?))
    };
    Ok(Sequential::new()
        .add_named("fc1", linear(32, 64)?)
        .add_named("act", Layer::Module(Box::new(Activation::Gelu)))
        .add_named("fc2", linear(64, 8)?)
        .into_layer())
}

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
}

fn main() -> Result<()> {
    println!("=== Multi-Adapter Example ===\n");

    let device = Device::Cpu;
    let input = Tensor::randn(0f32, 1.0, (4, 32), &device)?;

    // Random init so every adapter changes the output right away
    let lora = |r: usize, targets: &[&str]| LoraConfig {
        init_lora_weights: LoraInitialization::Random,
        ..LoraConfig::new(r, 2 * r, targets.iter().copied())
    };

    let mut model = PeftModel::new(network(&device)?, lora(4, &["fc1", "fc2"]), "small")?;
    model.add_adapter("large", lora(16, &["fc1", "fc2"]))?;
    println!("Adapters: {:?}", model.adapter_names());
    println!("Active: {:?}\n", model.active_adapters());

    let base = model.with_adapters_disabled(|m| m.forward(&input))?;
    let small = model.forward(&input)?;

    model.set_adapter(&["large"])?;
    let large = model.forward(&input)?;

    model.set_adapter(&["small", "large"])?;
    let both = model.forward(&input)?;

    println!("--- Switching ---");
    println!("  small vs base:  {:.4}", max_diff(&small, &base)?);
    println!("  large vs base:  {:.4}", max_diff(&large, &base)?);
    println!("  both vs base:   {:.4}", max_diff(&both, &base)?);

    // One adapter per batch row
    let per_row: Vec<String> = ["small", "large", BASE_ONLY, "small"]
        .iter()
        .map(ToString::to_string)
        .collect();
    let mut ctx = ForwardContext::new().with_adapter_names(&per_row);
    let routed = model.forward_with_context(&input, &mut ctx)?;
    let row = |t: &Tensor, i: usize| t.get(i);
    println!("\n--- Mixed batch ---");
    println!("  row 0 matches small: {:.2e}", max_diff(&row(&routed, 0)?, &row(&small, 0)?)?);
    println!("  row 1 matches large: {:.2e}", max_diff(&row(&routed, 1)?, &row(&large, 1)?)?);
    println!("  row 2 matches base:  {:.2e}", max_diff(&row(&routed, 2)?, &row(&base, 2)?)?);

    model.delete_adapter(&["large"])?;
    println!("\nAfter deleting 'large': {:?}", model.adapter_names());

    // Families can only be combined through MixedModel
    println!("\n--- Mixed families ---");
    let mut mixed = MixedModel::new(network(&device)?, lora(4, &["fc1"]), "lora")?;
    mixed.add_adapter(
        "loha",
        LoHaConfig {
            r: 4,
            init_weights: false,
            base: BaseAdapterConfig::targeting(["fc1", "fc2"]),
            ..LoHaConfig::default()
        },
    )?;
    mixed.set_adapter(&["lora", "loha"])?;
    let (trainable, total) = mixed.get_nb_trainable_parameters();
    println!("  trainable: {trainable} / {total}");
    println!("  output shape: {:?}", mixed.forward(&input)?.dims());

    Ok(())
}
