//! Adaption prompts (LLaMA-Adapter).
//!
//! The last `adapter_layers` attention blocks get a learned prompt whose
//! keys and values are attended to by the block's queries. The result is
//! scaled by a zero-initialized gate and added to the block output, so a
//! fresh adapter leaves the network unchanged.
//!
//! Only one adapter is attached at a time. The others are kept as cached
//! parameters and swapped in by [`AdaptionPromptModel::set_adapter`].
//!
//! Reference: <https://arxiv.org/abs/2303.16199>

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor, Var, D};
use serde::{Deserialize, Serialize};

use crate::error::{PeftError, Result};
use crate::io::{
    load_adapter_config, load_tensors, save_adapter_config, save_tensors, take_tensor,
    ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME,
};
use crate::nn::{
    get_layer_mut, named_modules, parameter_counts, visit_parameters_mut, AttentionModule,
    ForwardContext, Layer, Param,
};
use crate::registry::AdapterRegistry;
use crate::traits::AdapterConfig;

fn default_target() -> String {
    "self_attn".into()
}

/// Configuration for adaption prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptionPromptConfig {
    /// Name of the attention submodules, matched against the last path segment.
    #[serde(default = "default_target")]
    pub target_modules: String,

    /// Number of prompt tokens.
    pub adapter_len: usize,

    /// Number of attention blocks, counted from the end, to adapt.
    pub adapter_layers: usize,

    /// Freeze the prompt and gate.
    #[serde(default)]
    pub inference_mode: bool,
}

impl Default for AdaptionPromptConfig {
    fn default() -> Self {
        Self {
            target_modules: default_target(),
            adapter_len: 10,
            adapter_layers: 1,
            inference_mode: false,
        }
    }
}

impl AdapterConfig for AdaptionPromptConfig {
    fn validate(&self) -> Result<()> {
        if self.adapter_len == 0 || self.adapter_layers == 0 {
            return Err(PeftError::InvalidConfig(
                "adapter_len and adapter_layers must be > 0".into(),
            ));
        }
        if self.target_modules.is_empty() {
            return Err(PeftError::InvalidConfig("target_modules must not be empty".into()));
        }
        Ok(())
    }
}

/// Prompt and gate of one adapter on one attention block.
#[derive(Debug)]
pub struct AdaptionParams {
    /// Prompt embeddings `[1, adapter_len, hidden]`
    prompt: Param,
    /// Scalar gate, zero at creation
    gate: Param,
}

impl AdaptionParams {
    fn new(config: &AdaptionPromptConfig, hidden: usize, device: &Device) -> Result<Self> {
        let prompt = Tensor::randn(0f32, 1.0, (1, config.adapter_len, hidden), device)?;
        let gate = Tensor::zeros(1, candle_core::DType::F32, device)?;
        let (prompt, gate) = if config.inference_mode {
            (Param::frozen(&prompt)?, Param::frozen(&gate)?)
        } else {
            (Param::new(&prompt)?, Param::new(&gate)?)
        };
        Ok(Self { prompt, gate })
    }

    fn named(&self) -> [(&'static str, &Param); 2] {
        [("adaption_prompt", &self.prompt), ("adaption_gate", &self.gate)]
    }
}

/// An attention block with an adaption prompt attached.
#[derive(Debug)]
pub struct AdaptedAttention {
    inner: Box<dyn AttentionModule>,
    params: AdaptionParams,
}

impl AdaptedAttention {
    /// Attach `params` to `inner`.
    #[must_use]
    pub fn new(inner: Box<dyn AttentionModule>, params: AdaptionParams) -> Self {
        Self { inner, params }
    }

    /// The wrapped attention block.
    #[must_use]
    pub fn inner(&self) -> &dyn AttentionModule {
        &*self.inner
    }

    /// Mutable wrapped attention block.
    pub fn inner_mut(&mut self) -> &mut dyn AttentionModule {
        &mut *self.inner
    }

    /// Detach the prompt, returning the block and the adapter parameters.
    #[must_use]
    pub fn into_parts(self) -> (Box<dyn AttentionModule>, AdaptionParams) {
        (self.inner, self.params)
    }

    /// `attn(x) + o_proj(gate · softmax(q·kᵀ/√d) · v)` with `k`, `v` from the prompt.
    ///
    /// # Errors
    /// Returns an error if the inner block or a projection fails.
    #[allow(clippy::cast_precision_loss)]
    pub fn forward(&self, xs: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        let out = self.inner.forward(xs, ctx)?;
        let (b, s, _) = xs.dims3()?;
        let heads = self.inner.num_heads();
        let head_dim = self.inner.head_dim();
        let len = self.params.prompt.dims()[1];

        let prompt = self.params.prompt.value().to_dtype(xs.dtype())?;
        let (key, value) = self.inner.project_key_value(&prompt, ctx)?;
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((1, len, heads, head_dim))?
                .transpose(1, 2)?
                .repeat((b, 1, 1, 1))?
                .contiguous()?)
        };
        let (key, value) = (split(key)?, split(value)?);

        let query = self.inner.query_states(xs, ctx)?;
        let scores = (query.matmul(&key.t()?.contiguous()?)? / (head_dim as f64).sqrt())?;
        let probs = candle_nn::ops::softmax(&scores.to_dtype(candle_core::DType::F32)?, D::Minus1)?;
        let gate = self.params.gate.value();
        let probs = probs.broadcast_mul(&gate)?.to_dtype(value.dtype())?;
        let adapter_out = probs
            .matmul(&value)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, s, heads * head_dim))?;
        let adapter_out = self.inner.project_output(&adapter_out, ctx)?;
        Ok((out + adapter_out.to_dtype(xs.dtype())?)?)
    }

    /// Parameters of the block and the prompt.
    #[must_use]
    pub fn parameters(&self) -> Vec<(String, &Param)> {
        let mut params = self.inner.parameters();
        params.extend(self.params.named().map(|(n, p)| (n.to_string(), p)));
        params
    }

    /// Mutable parameters of the block and the prompt.
    pub fn parameters_mut(&mut self) -> Vec<(String, &mut Param)> {
        let mut params = self.inner.parameters_mut();
        params.push(("adaption_prompt".into(), &mut self.params.prompt));
        params.push(("adaption_gate".into(), &mut self.params.gate));
        params
    }
}

/// A network with adaption prompts on its last attention blocks.
#[derive(Debug)]
pub struct AdaptionPromptModel {
    root: Layer,
    configs: AdapterRegistry<AdaptionPromptConfig>,
    /// Detached adapters: name → (module path, parameters)
    cached: HashMap<String, Vec<(String, AdaptionParams)>>,
    /// Module paths carrying each adapter
    placements: HashMap<String, Vec<String>>,
    enabled: bool,
}

impl AdaptionPromptModel {
    /// Freeze `root` and attach the first adapter.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or there are too few
    /// matching attention blocks.
    pub fn new(mut root: Layer, config: AdaptionPromptConfig, adapter_name: &str) -> Result<Self> {
        visit_parameters_mut(&mut root, &mut |_, p| p.set_requires_grad(false));
        let mut model = Self {
            root,
            configs: AdapterRegistry::new(),
            cached: HashMap::new(),
            placements: HashMap::new(),
            enabled: true,
        };
        model.add_adapter(adapter_name, config)?;
        Ok(model)
    }

    /// The wrapped network.
    #[must_use]
    pub fn base_model(&self) -> &Layer {
        &self.root
    }

    /// Configuration of adapter `name`.
    #[must_use]
    pub fn peft_config(&self, name: &str) -> Option<&AdaptionPromptConfig> {
        self.configs.get(name)
    }

    /// The attached adapter.
    #[must_use]
    pub fn active_adapter(&self) -> Option<&str> {
        self.configs.active().first().map(String::as_str)
    }

    /// Attach a new adapter and make it active. The previously active
    /// adapter moves to the cache.
    ///
    /// # Errors
    /// Returns [`PeftError::AdapterExists`] for a taken name, or
    /// [`PeftError::InsufficientLayers`] if fewer than `adapter_layers`
    /// blocks match.
    pub fn add_adapter(&mut self, adapter_name: &str, config: AdaptionPromptConfig) -> Result<()> {
        config.validate()?;
        if self.configs.contains(adapter_name) {
            return Err(PeftError::AdapterExists {
                name: adapter_name.to_string(),
            });
        }
        let candidates: Vec<(String, usize, Device)> = named_modules(&self.root)
            .into_iter()
            .filter(|(path, _)| path.rsplit('.').next() == Some(config.target_modules.as_str()))
            .filter_map(|(path, layer)| {
                let attn = match layer {
                    Layer::Attention(attn) => attn.as_ref(),
                    Layer::AdaptedAttention(adapted) => adapted.inner(),
                    _ => return None,
                };
                let device = layer_device(layer).unwrap_or(Device::Cpu);
                Some((path, attn.hidden_size(), device))
            })
            .collect();
        if candidates.len() < config.adapter_layers {
            return Err(PeftError::InsufficientLayers {
                requested: config.adapter_layers,
                available: candidates.len(),
            });
        }
        let chosen = &candidates[candidates.len() - config.adapter_layers..];
        let mut params = Vec::with_capacity(chosen.len());
        for (path, hidden, device) in chosen {
            params.push((path.clone(), AdaptionParams::new(&config, *hidden, device)?));
        }

        self.detach_active()?;
        self.placements
            .insert(adapter_name.to_string(), chosen.iter().map(|(p, ..)| p.clone()).collect());
        self.cached.insert(adapter_name.to_string(), params);
        self.configs.insert(adapter_name, config);
        self.configs.set_active_unchecked(&[adapter_name.to_string()]);
        if self.enabled {
            self.attach(adapter_name)?;
        }
        tracing::info!(adapter = adapter_name, "added adaption prompt");
        Ok(())
    }

    /// Swap the attached adapter for `name`.
    ///
    /// # Errors
    /// Returns a lookup error if the name is unknown.
    pub fn set_adapter(&mut self, name: &str) -> Result<()> {
        self.configs.require(name)?;
        if self.active_adapter() == Some(name) {
            return Ok(());
        }
        self.detach_active()?;
        self.configs.set_active_unchecked(&[name.to_string()]);
        if self.enabled {
            self.attach(name)?;
        }
        Ok(())
    }

    /// Detach the active adapter, leaving the base network.
    ///
    /// # Errors
    /// Returns an error if the network was modified externally.
    pub fn disable_adapter_layers(&mut self) -> Result<()> {
        if self.enabled {
            self.detach_active()?;
            self.enabled = false;
        }
        Ok(())
    }

    /// Re-attach the active adapter.
    ///
    /// # Errors
    /// Returns an error if the network was modified externally.
    pub fn enable_adapter_layers(&mut self) -> Result<()> {
        if !self.enabled {
            self.enabled = true;
            if let Some(name) = self.active_adapter().map(str::to_string) {
                self.attach(&name)?;
            }
        }
        Ok(())
    }

    fn attach(&mut self, name: &str) -> Result<()> {
        let Some(params) = self.cached.remove(name) else {
            return Ok(());
        };
        for (path, params) in params {
            let slot = get_layer_mut(&mut self.root, &path)
                .ok_or_else(|| PeftError::TargetNotFound { patterns: vec![path.clone()] })?;
            match std::mem::replace(slot, Layer::Identity) {
                Layer::Attention(inner) => {
                    *slot = Layer::AdaptedAttention(Box::new(AdaptedAttention::new(inner, params)));
                }
                other => {
                    *slot = other;
                    return Err(PeftError::StateConflict(format!(
                        "{path} is not a bare attention block"
                    )));
                }
            }
        }
        Ok(())
    }

    fn detach_active(&mut self) -> Result<()> {
        let Some(name) = self.active_adapter().map(str::to_string) else {
            return Ok(());
        };
        if self.cached.contains_key(&name) {
            return Ok(());
        }
        let paths = self.placements.get(&name).cloned().unwrap_or_default();
        let mut params = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(slot) = get_layer_mut(&mut self.root, &path) else {
                continue;
            };
            match std::mem::replace(slot, Layer::Identity) {
                Layer::AdaptedAttention(adapted) => {
                    let (inner, p) = adapted.into_parts();
                    *slot = Layer::Attention(inner);
                    params.push((path, p));
                }
                other => *slot = other,
            }
        }
        self.cached.insert(name, params);
        Ok(())
    }

    /// Forward pass in inference mode.
    ///
    /// # Errors
    /// Returns an error if the network forward fails.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.root.forward(xs, &mut ForwardContext::new())
    }

    /// Forward pass with a caller-provided context.
    ///
    /// # Errors
    /// Returns an error if the network forward fails.
    pub fn forward_with_context(&self, xs: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        self.root.forward(xs, ctx)
    }

    /// Trainable and total parameter counts of the attached network.
    #[must_use]
    pub fn get_nb_trainable_parameters(&self) -> (usize, usize) {
        parameter_counts(&self.root)
    }

    /// Trainable variables of the attached adapter.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.attached_params()
            .into_iter()
            .filter(|(_, p)| p.requires_grad())
            .map(|(_, p)| p.var().clone())
            .collect()
    }

    fn attached_params(&self) -> Vec<(String, &Param)> {
        named_modules(&self.root)
            .into_iter()
            .filter_map(|(path, layer)| match layer {
                Layer::AdaptedAttention(adapted) => Some((path, &adapted.params)),
                _ => None,
            })
            .flat_map(|(path, params)| params.named().map(|(name, p)| (format!("{path}.{name}"), p)))
            .collect()
    }

    /// Prompt and gate tensors of adapter `name`, keyed `{path}.adaption_prompt`
    /// and `{path}.adaption_gate`.
    ///
    /// # Errors
    /// Returns a lookup error if the name is unknown.
    pub fn get_state_dict(&self, name: &str) -> Result<HashMap<String, Tensor>> {
        self.configs.require(name)?;
        let state = match self.cached.get(name) {
            Some(params) => params
                .iter()
                .flat_map(|(path, p)| {
                    p.named()
                        .map(|(n, param)| (format!("{path}.{n}"), param.value().detach()))
                })
                .collect(),
            None => self
                .attached_params()
                .into_iter()
                .map(|(key, p)| (key, p.value().detach()))
                .collect(),
        };
        Ok(state)
    }

    /// Load prompt and gate tensors into adapter `name`.
    ///
    /// # Errors
    /// Returns an error if the name is unknown or a tensor is missing or
    /// has the wrong shape.
    pub fn set_state_dict(&mut self, mut state: HashMap<String, Tensor>, name: &str) -> Result<()> {
        self.configs.require(name)?;
        let targets: Vec<(String, &Param)> = match self.cached.get(name) {
            Some(params) => params
                .iter()
                .flat_map(|(path, p)| p.named().map(|(n, param)| (format!("{path}.{n}"), param)))
                .collect(),
            None => self.attached_params(),
        };
        for (key, param) in targets {
            param.set(&take_tensor(&mut state, &key)?)?;
        }
        Ok(())
    }

    /// Save adapter `name` under `dir`.
    ///
    /// # Errors
    /// Returns an error if the name is unknown or writing fails.
    pub fn save_pretrained(&self, dir: impl AsRef<Path>, name: &str) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| PeftError::Io(format!("failed to create {}: {e}", dir.display())))?;
        let mut config = self.configs.require(name)?.clone();
        config.inference_mode = true;
        save_tensors(&self.get_state_dict(name)?, dir.join(ADAPTER_WEIGHTS_FILENAME))?;
        save_adapter_config(&config, dir.join(ADAPTER_CONFIG_FILENAME))
    }

    /// Add adapter `name` from a directory written by
    /// [`AdaptionPromptModel::save_pretrained`].
    ///
    /// # Errors
    /// Returns an error if reading fails or the weights do not match.
    pub fn load_adapter(&mut self, dir: impl AsRef<Path>, name: &str, is_trainable: bool) -> Result<()> {
        let dir = dir.as_ref();
        let mut config: AdaptionPromptConfig = load_adapter_config(dir.join(ADAPTER_CONFIG_FILENAME))?;
        config.inference_mode = !is_trainable;
        let previous = self.active_adapter().map(str::to_string);
        self.add_adapter(name, config)?;
        let device = self
            .attached_params()
            .first()
            .map_or(Device::Cpu, |(_, p)| p.var().device().clone());
        let loaded = load_tensors(dir.join(ADAPTER_WEIGHTS_FILENAME), &device)
            .and_then(|state| self.set_state_dict(state, name));
        if let Err(e) = loaded {
            self.detach_active()?;
            self.cached.remove(name);
            self.placements.remove(name);
            self.configs.remove(name);
            self.configs.set_active_unchecked(&[]);
            if let Some(previous) = previous {
                self.set_adapter(&previous)?;
            }
            return Err(e);
        }
        Ok(())
    }
}

/// Device of the first parameter found under `layer`.
fn layer_device(layer: &Layer) -> Option<Device> {
    named_modules(layer).into_iter().find_map(|(_, l)| {
        l.parameters()
            .first()
            .map(|(_, p)| p.var().device().clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::testing::{decoder, max_abs_diff};
    use candle_nn::{Optimizer, SGD};

    const HIDDEN: usize = 8;

    fn config(adapter_layers: usize) -> AdaptionPromptConfig {
        AdaptionPromptConfig {
            adapter_len: 3,
            adapter_layers,
            ..AdaptionPromptConfig::default()
        }
    }

    fn count_adapted(model: &AdaptionPromptModel) -> usize {
        named_modules(model.base_model())
            .iter()
            .filter(|(_, l)| matches!(l, Layer::AdaptedAttention(_)))
            .count()
    }

    #[test]
    fn test_zero_gate_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let root = decoder(3, HIDDEN, 2, &device)?;
        let xs = Tensor::randn(0f32, 1.0, (2, 4, HIDDEN), &device)?;
        let expected = root.forward(&xs, &mut ForwardContext::new())?;
        let model = AdaptionPromptModel::new(root, config(2), "default")?;
        assert_eq!(count_adapted(&model), 2);
        assert!(max_abs_diff(&model.forward(&xs)?, &expected)? < 1e-6);
        // prompt [1, 3, 8] and gate [1] on two blocks
        assert_eq!(model.get_nb_trainable_parameters().0, 2 * (24 + 1));
        Ok(())
    }

    #[test]
    fn test_last_blocks_are_adapted() -> Result<()> {
        let model = AdaptionPromptModel::new(decoder(3, HIDDEN, 2, &Device::Cpu)?, config(2), "default")?;
        let mut keys: Vec<String> = model.get_state_dict("default")?.into_keys().collect();
        keys.sort();
        assert_eq!(
            keys,
            [
                "layers.1.self_attn.adaption_gate",
                "layers.1.self_attn.adaption_prompt",
                "layers.2.self_attn.adaption_gate",
                "layers.2.self_attn.adaption_prompt",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_insufficient_layers() -> Result<()> {
        let err = AdaptionPromptModel::new(decoder(2, HIDDEN, 2, &Device::Cpu)?, config(3), "default")
            .unwrap_err();
        assert!(matches!(
            err,
            PeftError::InsufficientLayers {
                requested: 3,
                available: 2
            }
        ));
        Ok(())
    }

    #[test]
    fn test_training_opens_gate_and_swapping_adapters() -> Result<()> {
        let device = Device::Cpu;
        let root = decoder(2, HIDDEN, 2, &device)?;
        let xs = Tensor::randn(0f32, 1.0, (2, 4, HIDDEN), &device)?;
        let base = root.forward(&xs, &mut ForwardContext::new())?;
        let mut model = AdaptionPromptModel::new(root, config(1), "a")?;

        let mut sgd = SGD::new(model.trainable_vars(), 0.1)?;
        for _ in 0..3 {
            let out = model.forward_with_context(&xs, &mut ForwardContext::train())?;
            sgd.backward_step(&out.sqr()?.mean_all()?)?;
        }
        let trained = model.forward(&xs)?;
        assert!(max_abs_diff(&trained, &base)? > 1e-6);

        model.add_adapter("b", config(2))?;
        assert_eq!(model.active_adapter(), Some("b"));
        assert_eq!(count_adapted(&model), 2);
        assert!(max_abs_diff(&model.forward(&xs)?, &base)? < 1e-6);

        model.set_adapter("a")?;
        assert_eq!(count_adapted(&model), 1);
        assert!(max_abs_diff(&model.forward(&xs)?, &trained)? < 1e-6);

        model.disable_adapter_layers()?;
        assert_eq!(count_adapted(&model), 0);
        assert!(max_abs_diff(&model.forward(&xs)?, &base)? < 1e-6);
        model.enable_adapter_layers()?;
        assert!(max_abs_diff(&model.forward(&xs)?, &trained)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::TempDir::new().map_err(|e| PeftError::Io(e.to_string()))?;
        let model = AdaptionPromptModel::new(decoder(2, HIDDEN, 2, &device)?, config(1), "default")?;
        let gate = Tensor::new(&[0.5f32], &device)?;
        let mut state = model.get_state_dict("default")?;
        state.insert("layers.1.self_attn.adaption_gate".into(), gate);
        let mut model = model;
        model.set_state_dict(state, "default")?;
        model.save_pretrained(dir.path(), "default")?;

        let xs = Tensor::randn(0f32, 1.0, (1, 4, HIDDEN), &device)?;
        let expected = model.forward(&xs)?;
        model.load_adapter(dir.path(), "copy", false)?;
        assert_eq!(model.active_adapter(), Some("copy"));
        assert!(max_abs_diff(&model.forward(&xs)?, &expected)? < 1e-6);
        assert_eq!(model.get_nb_trainable_parameters().0, 0);
        Ok(())
    }
}
