//! PiSSA checkpoint conversion.
//!
//! A PiSSA adapter is trained on top of a residual base `W - s·B₀A₀`. To
//! ship it as a plain `LoRA` adapter for the untouched base `W`, the initial
//! factors are subtracted again inside a rank-`2r` adapter:
//! `[B₁, -B₀]·[A₁; A₀] = B₁A₁ - B₀A₀`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};

use crate::adapters::lora::{LoraConfig, LoraInitialization};
use crate::config::PeftConfig;
use crate::error::{PeftError, Result};
use crate::io::{
    load_adapter_config, load_tensors, parse_adapter_key, save_adapter_config, save_tensors,
    ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME,
};
use crate::model::PeftModel;

fn lora_config(config: &PeftConfig) -> Result<&LoraConfig> {
    match config {
        PeftConfig::Lora(c) => Ok(c),
        other => Err(PeftError::Unsupported(format!(
            "PiSSA conversion needs a LoRA adapter, got {}",
            other.peft_type()
        ))),
    }
}

/// Build rank-`2r` `LoRA` factors from the initial and fine-tuned PiSSA
/// factors.
///
/// Keys are matched on parameter name and module path, so the two state
/// dicts may use different adapter names; the output uses the fine-tuned
/// keys. Tensors other than `lora_A`/`lora_B` are copied from `finetuned`.
///
/// # Errors
/// Returns [`PeftError::WeightLoad`] if a factor has no initial counterpart.
pub fn pissa_to_lora(
    initial: &HashMap<String, Tensor>,
    finetuned: &HashMap<String, Tensor>,
) -> Result<HashMap<String, Tensor>> {
    let by_module: HashMap<(&str, &str), &Tensor> = initial
        .iter()
        .filter_map(|(key, t)| parse_adapter_key(key).map(|(param, path, _)| ((param, path), t)))
        .collect();
    let mut converted = HashMap::with_capacity(finetuned.len());
    for (key, tuned) in finetuned {
        let factor = match parse_adapter_key(key) {
            Some((param @ ("lora_A" | "lora_B"), path, _)) => Some((param, path)),
            _ => None,
        };
        let Some((param, path)) = factor else {
            converted.insert(key.clone(), tuned.clone());
            continue;
        };
        let init = by_module.get(&(param, path)).ok_or_else(|| {
            PeftError::WeightLoad(format!("no initial PiSSA factor for '{key}'"))
        })?;
        let tensor = if param == "lora_A" {
            Tensor::cat(&[tuned, *init], 0)?
        } else {
            Tensor::cat(&[tuned.clone(), init.neg()?], 1)?
        };
        converted.insert(key.clone(), tensor);
    }
    Ok(converted)
}

/// Save the PiSSA factors of `adapter_name` before training starts.
///
/// The config is written with `Standard` initialization, so the directory
/// also loads as an ordinary `LoRA` checkpoint.
///
/// # Errors
/// Returns an error if the adapter is unknown, not a `LoRA` adapter, or
/// writing fails.
pub fn save_pissa_initialization(model: &PeftModel, dir: impl AsRef<Path>, adapter_name: &str) -> Result<()> {
    let dir = dir.as_ref();
    let config = model
        .peft_config(adapter_name)
        .ok_or_else(|| PeftError::not_found(adapter_name, &model.adapter_names()))?;
    let mut lora = lora_config(config)?.clone();
    if lora.init_lora_weights != LoraInitialization::Pissa {
        tracing::warn!(adapter = adapter_name, "adapter was not initialized with PiSSA");
    }
    lora.init_lora_weights = LoraInitialization::Standard;
    lora.base.inference_mode = true;
    fs::create_dir_all(dir)
        .map_err(|e| PeftError::Io(format!("failed to create {}: {e}", dir.display())))?;
    save_tensors(
        &model.get_peft_model_state_dict(adapter_name)?,
        dir.join(ADAPTER_WEIGHTS_FILENAME),
    )?;
    save_adapter_config(&PeftConfig::Lora(lora), dir.join(ADAPTER_CONFIG_FILENAME))
}

/// Convert a fine-tuned PiSSA checkpoint into a `LoRA` checkpoint for the
/// original base weights.
///
/// The written config doubles `r` and `alpha`, keeping the scaling, and
/// resets the initialization to `Standard`.
///
/// # Errors
/// Returns an error if either checkpoint cannot be read, is not `LoRA`,
/// uses rank-stabilized scaling, or the ranks disagree.
pub fn convert_pissa_checkpoint(
    initial_dir: impl AsRef<Path>,
    finetuned_dir: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
) -> Result<()> {
    let (initial_dir, finetuned_dir, output_dir) =
        (initial_dir.as_ref(), finetuned_dir.as_ref(), output_dir.as_ref());
    let initial_config: PeftConfig = load_adapter_config(initial_dir.join(ADAPTER_CONFIG_FILENAME))?;
    let finetuned_config: PeftConfig = load_adapter_config(finetuned_dir.join(ADAPTER_CONFIG_FILENAME))?;
    let initial_lora = lora_config(&initial_config)?;
    let mut lora = lora_config(&finetuned_config)?.clone();
    if lora.use_rslora {
        return Err(PeftError::Unsupported(
            "PiSSA conversion with rank-stabilized scaling".into(),
        ));
    }
    if initial_lora.r != lora.r {
        return Err(PeftError::DimensionMismatch {
            message: format!(
                "initial rank {} differs from fine-tuned rank {}",
                initial_lora.r, lora.r
            ),
        });
    }

    let initial = load_tensors(initial_dir.join(ADAPTER_WEIGHTS_FILENAME), &Device::Cpu)?;
    let finetuned = load_tensors(finetuned_dir.join(ADAPTER_WEIGHTS_FILENAME), &Device::Cpu)?;
    let converted = pissa_to_lora(&initial, &finetuned)?;

    lora.r *= 2;
    lora.alpha *= 2;
    lora.init_lora_weights = LoraInitialization::Standard;
    lora.base.inference_mode = true;
    fs::create_dir_all(output_dir)
        .map_err(|e| PeftError::Io(format!("failed to create {}: {e}", output_dir.display())))?;
    save_tensors(&converted, output_dir.join(ADAPTER_WEIGHTS_FILENAME))?;
    save_adapter_config(&PeftConfig::Lora(lora), output_dir.join(ADAPTER_CONFIG_FILENAME))?;
    tracing::info!(path = %output_dir.display(), "converted PiSSA checkpoint to LoRA");
    Ok(())
}
