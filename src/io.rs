//! Checkpoint files.
//!
//! A checkpoint directory holds `adapter_model.safetensors` with flat,
//! adapter-scoped tensor keys and `adapter_config.json` with the serialized
//! config.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{PeftError, Result};

/// File name of the adapter configuration inside a checkpoint directory.
pub const ADAPTER_CONFIG_FILENAME: &str = "adapter_config.json";

/// File name of the adapter weights inside a checkpoint directory.
pub const ADAPTER_WEIGHTS_FILENAME: &str = "adapter_model.safetensors";

/// Modules whose tensors can be exported and restored by local name.
pub trait SaveLoad {
    /// Current tensors by local name.
    ///
    /// # Errors
    /// Returns an error if a tensor cannot be read.
    fn state_dict(&self) -> Result<HashMap<String, Tensor>>;

    /// Overwrite the module's tensors from `state_dict`.
    ///
    /// # Errors
    /// Returns an error if a tensor is missing or has the wrong shape.
    fn load_state_dict(&mut self, state_dict: HashMap<String, Tensor>) -> Result<()>;
}

/// Checkpoint key of an adapter parameter: `{param}.{module_path}.{adapter}`.
///
/// Parameters shared by a whole adapter (no module path) are keyed
/// `{param}.{adapter}`.
#[must_use]
pub fn adapter_key(param: &str, module_path: &str, adapter: &str) -> String {
    if module_path.is_empty() {
        format!("{param}.{adapter}")
    } else {
        format!("{param}.{module_path}.{adapter}")
    }
}

/// Split a key built by [`adapter_key`] into `(param, module_path, adapter)`.
///
/// Returns `None` if the key has fewer than two components.
#[must_use]
pub fn parse_adapter_key(key: &str) -> Option<(&str, &str, &str)> {
    let (param, rest) = key.split_once('.')?;
    match rest.rsplit_once('.') {
        Some((path, adapter)) => Some((param, path, adapter)),
        None => Some((param, "", rest)),
    }
}

/// Write a flat tensor map to a safetensors file.
///
/// # Errors
/// Returns an error if serialization or writing fails.
pub fn save_tensors<P: AsRef<Path>>(tensors: &HashMap<String, Tensor>, path: P) -> Result<()> {
    let mut entries = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        entries.push((name.as_str(), tensor.contiguous()?));
    }
    safetensors::tensor::serialize_to_file(entries, &None, path.as_ref())
        .map_err(|e| PeftError::Io(format!("{}: {e}", path.as_ref().display())))?;
    Ok(())
}

/// Read a flat tensor map from a safetensors file.
///
/// # Errors
/// Returns an error if the file is missing or not valid safetensors.
pub fn load_tensors<P: AsRef<Path>>(path: P, device: &Device) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(PeftError::Io(format!(
            "weights file not found: {}",
            path.display()
        )));
    }
    candle_core::safetensors::load(path, device)
        .map_err(|e| PeftError::WeightLoad(format!("{}: {e}", path.display())))
}

/// Write the state dict of a standalone module (prompt embedding, prefix
/// encoder, router) to a safetensors file.
///
/// # Errors
/// Returns an error if a tensor cannot be read or the file cannot be written.
pub fn save_adapter_weights<P: AsRef<Path>>(module: &dyn SaveLoad, path: P) -> Result<()> {
    save_tensors(&module.state_dict()?, path)
}

/// Restore a standalone module from a safetensors file written by
/// [`save_adapter_weights`], placing the tensors on `device`.
///
/// # Errors
/// Returns an error if the file cannot be read or a tensor is missing or
/// mis-shaped.
pub fn load_adapter_weights<P: AsRef<Path>>(
    module: &mut dyn SaveLoad,
    path: P,
    device: &Device,
) -> Result<()> {
    module.load_state_dict(load_tensors(path, device)?)
}

/// Write a config as pretty-printed JSON.
///
/// # Errors
/// Returns an error if serialization or writing fails.
pub fn save_adapter_config<T: Serialize, P: AsRef<Path>>(config: &T, path: P) -> Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| PeftError::Io(format!("cannot serialize config: {e}")))?;
    fs::write(path, json).map_err(|e| PeftError::Io(format!("{}: {e}", path.display())))
}

/// Read a JSON config.
///
/// # Errors
/// Returns an error if the file cannot be read or does not describe a `T`.
pub fn load_adapter_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let json = fs::read_to_string(path).map_err(|e| PeftError::Io(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&json)
        .map_err(|e| PeftError::InvalidConfig(format!("{}: {e}", path.display())))
}

/// Remove the tensor stored under `key`.
///
/// # Errors
/// Returns [`PeftError::WeightLoad`] when the key is missing.
pub(crate) fn take_tensor(state_dict: &mut HashMap<String, Tensor>, key: &str) -> Result<Tensor> {
    state_dict
        .remove(key)
        .ok_or_else(|| PeftError::WeightLoad(format!("missing tensor '{key}' in state dict")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::lora::LoraConfig;
    use crate::adapters::prompt_tuning::{PromptEmbedding, PromptTuningConfig};
    use crate::config::{PeftConfig, PeftType};
    use tempfile::TempDir;

    #[test]
    fn test_save_load_module_weights() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let dir = TempDir::new()?;
        let path = dir.path().join(ADAPTER_WEIGHTS_FILENAME);
        let config = PromptTuningConfig {
            num_virtual_tokens: 4,
            token_dim: 6,
            ..PromptTuningConfig::default()
        };
        let source = PromptEmbedding::new(config.clone(), None, &device)?;
        save_adapter_weights(&source, &path)?;

        let mut target = PromptEmbedding::new(config, None, &device)?;
        load_adapter_weights(&mut target, &path, &device)?;
        let (a, b) = (source.state_dict()?, target.state_dict()?);
        assert_eq!(a.len(), b.len());
        for (name, tensor) in &a {
            let diff = (tensor - &b[name])?.abs()?.max_all()?.to_scalar::<f32>()?;
            assert!(diff < 1e-7, "{name} differs");
        }
        Ok(())
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = load_tensors(temp_dir.path().join("missing.safetensors"), &Device::Cpu);
        assert!(matches!(result, Err(PeftError::Io(_))));
    }

    #[test]
    fn test_config_is_tagged_by_family() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(ADAPTER_CONFIG_FILENAME);
        let config = PeftConfig::from(LoraConfig::new(8, 16, ["q_proj", "v_proj"]));
        save_adapter_config(&config, &path)?;

        let loaded: PeftConfig = load_adapter_config(&path)?;
        assert_eq!(loaded.peft_type(), PeftType::Lora);
        assert_eq!(loaded.base().target_modules, config.base().target_modules);

        fs::write(&path, "{\"peft_type\": \"NOPE\"}")?;
        assert!(matches!(
            load_adapter_config::<PeftConfig, _>(&path),
            Err(PeftError::InvalidConfig(_))
        ));
        Ok(())
    }

    #[test]
    fn test_adapter_key_round_trip() {
        assert_eq!(
            adapter_key("lora_A", "layers.0.self_attn.q_proj", "default"),
            "lora_A.layers.0.self_attn.q_proj.default"
        );
        assert_eq!(
            parse_adapter_key("lora_A.layers.0.self_attn.q_proj.default"),
            Some(("lora_A", "layers.0.self_attn.q_proj", "default"))
        );
        assert_eq!(adapter_key("vera_A", "", "other"), "vera_A.other");
        assert_eq!(parse_adapter_key("vera_A.other"), Some(("vera_A", "", "other")));
        assert_eq!(parse_adapter_key("orphan"), None);
    }
}
