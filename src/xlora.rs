//! Mixture of `LoRA` experts with a learned router (xLoRA).
//!
//! A small classifier maps hidden states to per-token, per-layer mixture
//! weights. The weights travel through the forward pass inside the
//! [`ForwardContext`], and every adapter layer scales each expert's delta by
//! its coefficient. Nothing about a pass is stored on the model, except the
//! optional scalings log.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use candle_core::{DType, Device, Module as _, Tensor, Var, D};
use candle_nn::Linear;
use serde::{Deserialize, Serialize};

use crate::adapters::dropout;
use crate::config::{PeftConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::io::{
    load_adapter_config, load_tensors, save_adapter_config, save_tensors, take_tensor, SaveLoad,
};
use crate::layer::RoutingSlot;
use crate::model::PeftModel;
use crate::nn::{tuned_layers, tuned_layers_mut, ForwardContext, Layer, Param};
use crate::traits::AdapterConfig;

/// File name of the saved classifier weights.
pub const XLORA_CLASSIFIER_FILENAME: &str = "xlora_classifier.safetensors";

/// File name of the saved xLoRA configuration.
pub const XLORA_CONFIG_FILENAME: &str = "xlora_config.json";

fn default_true() -> bool {
    true
}

fn default_depth() -> usize {
    1
}

fn default_size() -> usize {
    2048
}

fn default_dropout() -> f64 {
    0.2
}

fn default_temperature() -> f64 {
    1.0
}

/// Configuration for xLoRA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XLoraConfig {
    /// Width of the hidden states fed to the classifier.
    pub hidden_size: usize,

    /// Expert adapters: name → checkpoint directory. Experts are ordered by
    /// name along the scalings' adapter axis.
    pub adapters: BTreeMap<String, String>,

    /// Predict a separate mixture for every adapter layer.
    #[serde(default)]
    pub layerwise_scalings: bool,

    /// `ReLU` and dropout between classifier layers.
    #[serde(default = "default_true")]
    pub enable_relu_and_dropout: bool,

    /// Number of classifier layers.
    #[serde(default = "default_depth")]
    pub xlora_depth: usize,

    /// Hidden width of a deep classifier.
    #[serde(default = "default_size")]
    pub xlora_size: usize,

    /// Classifier dropout probability.
    #[serde(default = "default_dropout")]
    pub xlora_dropout_p: f64,

    /// Softmax over the experts.
    #[serde(default = "default_true")]
    pub enable_softmax: bool,

    /// Temperature of the expert softmax.
    #[serde(default = "default_temperature")]
    pub softmax_temperature: f64,

    /// Value used for every scaling in a scaling pass.
    #[serde(default)]
    pub scaling_pass_value: f64,

    /// Train the expert adapters along with the classifier.
    #[serde(default)]
    pub use_trainable_adapters: bool,

    /// Bias on the classifier layers.
    #[serde(default = "default_true")]
    pub use_bias: bool,

    /// Multiplier applied to every routed delta.
    #[serde(default = "default_temperature")]
    pub global_scaling_weight: f64,

    /// Keep only the k largest scalings per token and layer.
    #[serde(default)]
    pub top_k_lora: Option<usize>,

    /// Renormalize the kept scalings with a softmax.
    #[serde(default)]
    pub enable_softmax_topk: bool,

    /// Adapter layer (path or dotted suffix) whose output, taken from a
    /// scaling pass, is fed to the classifier. Unset, the classifier reads
    /// the network input.
    #[serde(default)]
    pub hidden_state_module: Option<String>,
}

impl Default for XLoraConfig {
    fn default() -> Self {
        Self {
            hidden_size: 4096,
            adapters: BTreeMap::new(),
            layerwise_scalings: false,
            enable_relu_and_dropout: true,
            xlora_depth: default_depth(),
            xlora_size: default_size(),
            xlora_dropout_p: default_dropout(),
            enable_softmax: true,
            softmax_temperature: default_temperature(),
            scaling_pass_value: 0.0,
            use_trainable_adapters: false,
            use_bias: true,
            global_scaling_weight: 1.0,
            top_k_lora: None,
            enable_softmax_topk: false,
            hidden_state_module: None,
        }
    }
}

impl XLoraConfig {
    /// Expert names in routing order.
    #[must_use]
    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

impl AdapterConfig for XLoraConfig {
    fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 {
            return Err(PeftError::InvalidConfig("hidden_size must be > 0".into()));
        }
        if self.adapters.is_empty() {
            return Err(PeftError::InvalidConfig(
                "xLoRA needs at least one adapter".into(),
            ));
        }
        if self.xlora_depth == 0 || (self.xlora_depth > 1 && self.xlora_size == 0) {
            return Err(PeftError::InvalidConfig(
                "xlora_depth and xlora_size must be > 0".into(),
            ));
        }
        crate::adapters::check_probability("xlora_dropout_p", self.xlora_dropout_p)?;
        if self.softmax_temperature <= 0.0 {
            return Err(PeftError::InvalidConfig(
                "softmax_temperature must be > 0".into(),
            ));
        }
        if let Some(k) = self.top_k_lora {
            if k == 0 || k > self.adapters.len() {
                return Err(PeftError::InvalidConfig(format!(
                    "top_k_lora must be in 1..={}, got {k}",
                    self.adapters.len()
                )));
            }
        }
        if self.enable_softmax_topk && self.top_k_lora.is_none() {
            tracing::warn!("enable_softmax_topk has no effect without top_k_lora");
        }
        Ok(())
    }
}

/// Linear layer with torch-style uniform init.
#[derive(Debug)]
struct Dense {
    weight: Param,
    bias: Option<Param>,
}

impl Dense {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn new(in_dim: usize, out_dim: usize, bias: bool, device: &Device) -> Result<Self> {
        let bound = (1.0 / (in_dim as f64).sqrt()) as f32;
        Ok(Self {
            weight: Param::new(&Tensor::rand(-bound, bound, (out_dim, in_dim), device)?)?,
            bias: if bias {
                Some(Param::new(&Tensor::rand(-bound, bound, out_dim, device)?)?)
            } else {
                None
            },
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let linear = Linear::new(self.weight.value(), self.bias.as_ref().map(Param::value));
        Ok(linear.forward(xs)?)
    }
}

/// Router producing scalings `[batch, seq, n_layers, n_adapters]`.
#[derive(Debug)]
pub struct XLoraClassifier {
    layers: Vec<Dense>,
    n_classes: usize,
    n_layers: usize,
    config: XLoraConfig,
}

impl XLoraClassifier {
    /// Create a classifier for `n_classes` experts over `n_layers` layers.
    ///
    /// # Errors
    /// Returns an error if the config is invalid.
    pub fn new(config: &XLoraConfig, n_classes: usize, n_layers: usize, device: &Device) -> Result<Self> {
        config.validate()?;
        let out_dim = if config.layerwise_scalings {
            n_classes * n_layers
        } else {
            n_classes
        };
        let mut layers = Vec::with_capacity(config.xlora_depth);
        if config.xlora_depth == 1 {
            layers.push(Dense::new(config.hidden_size, out_dim, config.use_bias, device)?);
        } else {
            layers.push(Dense::new(config.hidden_size, config.xlora_size, config.use_bias, device)?);
            for _ in 0..config.xlora_depth - 2 {
                layers.push(Dense::new(config.xlora_size, config.xlora_size, config.use_bias, device)?);
            }
            layers.push(Dense::new(config.xlora_size, out_dim, config.use_bias, device)?);
        }
        Ok(Self {
            layers,
            n_classes,
            n_layers,
            config: config.clone(),
        })
    }

    /// Number of experts.
    #[must_use]
    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Number of routed layers.
    #[must_use]
    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    /// Scalings for `hidden_states [b, s, hidden]`.
    ///
    /// # Errors
    /// Returns an error if the input is not 3-D or tensor operations fail.
    pub fn forward(&self, hidden_states: &Tensor, train: bool) -> Result<Tensor> {
        let (b, s, _) = hidden_states.dims3()?;
        let mut xs = hidden_states.clone();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if i < last && self.config.enable_relu_and_dropout {
                xs = dropout(&xs.relu()?, self.config.xlora_dropout_p, train)?;
            }
        }
        let logits = if self.config.layerwise_scalings {
            xs.reshape((b, s, self.n_layers, self.n_classes))?
        } else {
            xs.unsqueeze(2)?
                .broadcast_as((b, s, self.n_layers, self.n_classes))?
                .contiguous()?
        };
        let mut scalings = if self.config.enable_softmax {
            candle_nn::ops::softmax(&(logits / self.config.softmax_temperature)?, D::Minus1)?
        } else {
            logits
        };
        if let Some(k) = self.config.top_k_lora {
            scalings = self.top_k(&scalings, k)?;
        }
        Ok(scalings)
    }

    /// Zero all but the `k` largest scalings of every token and layer.
    fn top_k(&self, scalings: &Tensor, k: usize) -> Result<Tensor> {
        let scalings = scalings.contiguous()?;
        let (sorted, _) = scalings.sort_last_dim(false)?;
        let kth = sorted.narrow(D::Minus1, k - 1, 1)?;
        let keep = scalings.broadcast_ge(&kth)?;
        if self.config.enable_softmax_topk {
            let masked_out = Tensor::full(f32::NEG_INFINITY, scalings.dims(), scalings.device())?
                .to_dtype(scalings.dtype())?;
            let masked = keep.where_cond(&scalings, &masked_out)?;
            Ok(candle_nn::ops::softmax(&masked, D::Minus1)?)
        } else {
            Ok((&scalings * keep.to_dtype(scalings.dtype())?)?)
        }
    }

    fn named_params(&self) -> Vec<(String, &Param)> {
        let mut params = Vec::new();
        for (i, layer) in self.layers.iter().enumerate() {
            params.push((format!("layers.{i}.weight"), &layer.weight));
            if let Some(bias) = &layer.bias {
                params.push((format!("layers.{i}.bias"), bias));
            }
        }
        params
    }

    /// Classifier variables for the optimizer.
    #[must_use]
    pub fn vars(&self) -> Vec<Var> {
        self.named_params()
            .into_iter()
            .map(|(_, p)| p.var().clone())
            .collect()
    }

    /// Number of classifier parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.named_params().iter().map(|(_, p)| p.elem_count()).sum()
    }
}

impl SaveLoad for XLoraClassifier {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(self
            .named_params()
            .into_iter()
            .map(|(name, p)| (name, p.value().detach()))
            .collect())
    }

    fn load_state_dict(&mut self, mut state_dict: HashMap<String, Tensor>) -> Result<()> {
        for (name, param) in self.named_params() {
            param.set(&take_tensor(&mut state_dict, &name)?)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ScalingsLog {
    enabled: bool,
    entries: Vec<Tensor>,
}

fn is_module(path: &str, module: &str) -> bool {
    path == module || path.strip_suffix(module).is_some_and(|rest| rest.ends_with('.'))
}

/// A [`PeftModel`] of `LoRA` experts routed by an [`XLoraClassifier`].
#[derive(Debug)]
pub struct XLoraModel {
    inner: PeftModel,
    classifier: XLoraClassifier,
    config: XLoraConfig,
    scalings_log: Mutex<ScalingsLog>,
}

impl XLoraModel {
    /// Route between the `LoRA` adapters of `model` named in `config.adapters`.
    ///
    /// Every adapter layer gets a layer number in traversal order. Expert
    /// parameters are frozen unless `use_trainable_adapters`.
    ///
    /// # Errors
    /// Returns an error if the config is invalid, an expert is missing, or
    /// an expert is not a `LoRA` adapter.
    pub fn new(mut model: PeftModel, config: XLoraConfig) -> Result<Self> {
        config.validate()?;
        let names = config.adapter_names();
        for name in &names {
            match model.peft_config(name) {
                Some(PeftConfig::Lora(_)) => {}
                Some(other) => {
                    return Err(PeftError::IncompatibleAdapter {
                        peft_type: other.peft_type(),
                        compatible: vec![PeftType::Lora],
                    })
                }
                None => return Err(PeftError::not_found(name.clone(), &model.adapter_names())),
            }
        }
        model.set_adapter(&names)?;

        let mut n_layers = 0;
        for (layer_number, (_, layer)) in tuned_layers_mut(model.root_mut()).into_iter().enumerate() {
            layer.set_routing(Some(RoutingSlot {
                layer: layer_number,
                adapters: names.clone(),
                global_scaling_weight: config.global_scaling_weight,
            }));
            n_layers += 1;
        }
        if n_layers == 0 {
            return Err(PeftError::TargetNotFound {
                patterns: vec!["LoRA adapter layers".into()],
            });
        }
        if let Some(module) = &config.hidden_state_module {
            if !tuned_layers(model.base_model()).iter().any(|(path, _)| is_module(path, module)) {
                return Err(PeftError::TargetNotFound {
                    patterns: vec![module.clone()],
                });
            }
        }
        let device = tuned_layers(model.base_model())
            .first()
            .map_or(Device::Cpu, |(_, l)| l.base_layer().weight().var().device().clone());
        let classifier = XLoraClassifier::new(&config, names.len(), n_layers, &device)?;
        let mut xlora = Self {
            inner: model,
            classifier,
            config,
            scalings_log: Mutex::new(ScalingsLog::default()),
        };
        let trainable = xlora.config.use_trainable_adapters;
        xlora.set_use_trainable_adapters(trainable);
        tracing::info!(experts = names.len(), layers = n_layers, "created xLoRA model");
        Ok(xlora)
    }

    /// Load every expert from its checkpoint directory onto `root` and route
    /// between them.
    ///
    /// # Errors
    /// Returns an error if a checkpoint cannot be loaded.
    pub fn from_adapter_dirs(root: Layer, config: XLoraConfig) -> Result<Self> {
        config.validate()?;
        let trainable = config.use_trainable_adapters;
        let mut sources = config.adapters.iter();
        let Some((first_name, first_dir)) = sources.next() else {
            return Err(PeftError::InvalidConfig("xLoRA needs at least one adapter".into()));
        };
        let mut model = PeftModel::from_pretrained(root, first_dir, first_name, trainable)?;
        for (name, dir) in sources {
            model.load_adapter(dir, name, trainable)?;
        }
        Self::new(model, config)
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &XLoraConfig {
        &self.config
    }

    /// The routed adapter model.
    #[must_use]
    pub fn peft_model(&self) -> &PeftModel {
        &self.inner
    }

    /// The router.
    #[must_use]
    pub fn classifier(&self) -> &XLoraClassifier {
        &self.classifier
    }

    /// Mutable router, e.g. for loading weights.
    pub fn classifier_mut(&mut self) -> &mut XLoraClassifier {
        &mut self.classifier
    }

    /// Freeze or unfreeze the expert adapters.
    pub fn set_use_trainable_adapters(&mut self, trainable: bool) {
        self.config.use_trainable_adapters = trainable;
        let names = self.config.adapter_names();
        for (_, layer) in tuned_layers_mut(self.inner.root_mut()) {
            for name in &names {
                layer.set_trainable(name, trainable);
            }
        }
    }

    /// Set the multiplier applied to every routed delta.
    pub fn set_global_scaling_weight(&mut self, weight: f64) {
        self.config.global_scaling_weight = weight;
        for (_, layer) in tuned_layers_mut(self.inner.root_mut()) {
            let slot = layer.routing().cloned();
            if let Some(mut slot) = slot {
                slot.global_scaling_weight = weight;
                layer.set_routing(Some(slot));
            }
        }
    }

    /// Multiplier applied to every routed delta.
    #[must_use]
    pub fn global_scaling_weight(&self) -> f64 {
        self.config.global_scaling_weight
    }

    /// Set or clear top-k selection.
    ///
    /// # Errors
    /// Returns an error if `k` is zero or exceeds the number of experts.
    pub fn set_topk_lora(&mut self, k: Option<usize>) -> Result<()> {
        let mut config = self.config.clone();
        config.top_k_lora = k;
        config.validate()?;
        self.classifier.config.top_k_lora = k;
        self.config = config;
        Ok(())
    }

    /// Current top-k selection.
    #[must_use]
    pub fn topk_lora(&self) -> Option<usize> {
        self.config.top_k_lora
    }

    /// Set the value used by [`XLoraModel::scaling_pass`].
    pub fn set_scaling_pass_value(&mut self, value: f64) {
        self.config.scaling_pass_value = value;
    }

    /// Router output for `hidden_states`, logged if logging is enabled.
    ///
    /// # Errors
    /// Returns an error if the classifier fails.
    pub fn compute_scalings(&self, hidden_states: &Tensor, train: bool) -> Result<Tensor> {
        let scalings = self.classifier.forward(hidden_states, train)?;
        let mut log = self
            .scalings_log
            .lock()
            .map_err(|_| PeftError::StateConflict("scalings log lock poisoned".into()))?;
        if log.enabled {
            log.entries.push(scalings.detach());
        }
        Ok(scalings)
    }

    /// Classifier input for `xs`.
    ///
    /// With `hidden_state_module` set, this runs a scaling pass and returns
    /// the detached output of the last matching adapter layer; otherwise it
    /// is `xs` itself.
    ///
    /// # Errors
    /// Returns an error if the scaling pass fails or never reaches the module.
    pub fn hidden_states(&self, xs: &Tensor) -> Result<Tensor> {
        let Some(module) = &self.config.hidden_state_module else {
            return Ok(xs.clone());
        };
        let scalings = self.constant_scalings(xs, self.config.scaling_pass_value)?;
        let mut ctx = ForwardContext::new().with_scalings(&scalings).with_activation_tap();
        self.inner.forward_with_context(xs, &mut ctx)?;
        ctx.take_activations()
            .into_iter()
            .rev()
            .find(|(path, _)| is_module(path, module))
            .map(|(_, hidden)| hidden.detach())
            .ok_or_else(|| PeftError::TargetNotFound {
                patterns: vec![module.clone()],
            })
    }

    /// Forward pass routed by the classifier.
    ///
    /// # Errors
    /// Returns an error if the classifier or the network forward fails.
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.hidden_states(xs)?;
        let scalings = self.compute_scalings(&hidden, train)?;
        self.forward_with_scalings(xs, &scalings, train)
    }

    /// Forward pass with caller-provided scalings `[b, s, n_layers, n_adapters]`.
    ///
    /// # Errors
    /// Returns an error if the network forward fails.
    pub fn forward_with_scalings(&self, xs: &Tensor, scalings: &Tensor, train: bool) -> Result<Tensor> {
        let ctx = if train {
            ForwardContext::train()
        } else {
            ForwardContext::new()
        };
        self.inner.forward_with_context(xs, &mut ctx.with_scalings(scalings))
    }

    /// Forward pass with every scaling forced to `value`, bypassing the
    /// classifier.
    ///
    /// # Errors
    /// Returns an error if the input has fewer than two dimensions or the
    /// forward fails.
    pub fn forward_with_scaling_value(&self, xs: &Tensor, value: f64) -> Result<Tensor> {
        let scalings = self.constant_scalings(xs, value)?;
        self.forward_with_scalings(xs, &scalings, false)
    }

    /// `[b, s, n_layers, n_adapters]` filled with `value`, in the dtype of
    /// the adapted weights so token-id inputs work too.
    fn constant_scalings(&self, xs: &Tensor, value: f64) -> Result<Tensor> {
        let (b, s) = match xs.dims() {
            [b, s, ..] => (*b, *s),
            dims => {
                return Err(PeftError::DimensionMismatch {
                    message: format!("xLoRA input needs [batch, seq, ..], got {dims:?}"),
                })
            }
        };
        let dtype = tuned_layers(self.inner.base_model())
            .first()
            .map_or(DType::F32, |(_, l)| l.base_layer().weight().var().dtype());
        let shape = (b, s, self.classifier.n_layers, self.classifier.n_classes);
        Ok((Tensor::ones(shape, DType::F32, xs.device())? * value)?.to_dtype(dtype)?)
    }

    /// Forward pass with the configured `scaling_pass_value`.
    ///
    /// # Errors
    /// Returns an error if the forward fails.
    pub fn scaling_pass(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_with_scaling_value(xs, self.config.scaling_pass_value)
    }

    /// Start recording every computed scalings tensor.
    pub fn enable_scalings_logging(&self) {
        if let Ok(mut log) = self.scalings_log.lock() {
            log.enabled = true;
        }
    }

    /// Stop recording; entries already logged are kept.
    pub fn disable_scalings_logging(&self) {
        if let Ok(mut log) = self.scalings_log.lock() {
            log.enabled = false;
        }
    }

    /// Recorded scalings, oldest first.
    #[must_use]
    pub fn get_scalings_log(&self) -> Vec<Tensor> {
        self.scalings_log
            .lock()
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }

    /// Write the recorded scalings to a safetensors file as `scalings.{i}`
    /// and clear the log.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn flush_log_scalings(&self, path: impl AsRef<Path>) -> Result<()> {
        let entries = {
            let mut log = self
                .scalings_log
                .lock()
                .map_err(|_| PeftError::StateConflict("scalings log lock poisoned".into()))?;
            std::mem::take(&mut log.entries)
        };
        tracing::debug!(entries = entries.len(), "flushing scalings log");
        let tensors: HashMap<String, Tensor> = entries
            .into_iter()
            .enumerate()
            .map(|(i, t)| (format!("scalings.{i}"), t))
            .collect();
        save_tensors(&tensors, path)
    }

    /// Trainable and total parameter counts, classifier included.
    #[must_use]
    pub fn get_nb_trainable_parameters(&self) -> (usize, usize) {
        let (trainable, total) = self.inner.get_nb_trainable_parameters();
        let classifier = self.classifier.num_parameters();
        (trainable + classifier, total + classifier)
    }

    /// Variables an optimizer should update: the classifier, plus the
    /// experts when they are trainable.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.inner.trainable_vars();
        vars.extend(self.classifier.vars());
        vars
    }

    /// Save the experts, the classifier and the xLoRA config under `dir`.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| PeftError::Io(format!("failed to create {}: {e}", dir.display())))?;
        let names = self.config.adapter_names();
        self.inner.save_pretrained(dir, Some(&names))?;
        save_tensors(&self.classifier.state_dict()?, dir.join(XLORA_CLASSIFIER_FILENAME))?;
        save_adapter_config(&self.config, dir.join(XLORA_CONFIG_FILENAME))?;
        tracing::info!(path = %dir.display(), "saved xLoRA model");
        Ok(())
    }

    /// Load classifier weights saved by [`XLoraModel::save_pretrained`].
    ///
    /// # Errors
    /// Returns an error if the file is missing or does not match.
    pub fn load_classifier(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let device = self
            .classifier
            .layers
            .first()
            .map_or(Device::Cpu, |l| l.weight.var().device().clone());
        let tensors = load_tensors(dir.join(XLORA_CLASSIFIER_FILENAME), &device)?;
        self.classifier.load_state_dict(tensors)
    }

    /// Read an xLoRA config saved by [`XLoraModel::save_pretrained`].
    ///
    /// # Errors
    /// Returns an error if the file is missing or invalid.
    pub fn load_config(dir: impl AsRef<Path>) -> Result<XLoraConfig> {
        load_adapter_config(dir.as_ref().join(XLORA_CONFIG_FILENAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::lora::{LoraConfig, LoraInitialization};
    use crate::nn::testing::{decoder, max_abs_diff, values};
    use crate::nn::{BaseLayer, Sequential};
    use tempfile::TempDir;

    const HIDDEN: usize = 8;

    fn experts_on(root: Layer) -> Result<PeftModel> {
        let lora = |r| LoraConfig {
            init_lora_weights: LoraInitialization::Random,
            ..LoraConfig::new(r, 2 * r, ["q_proj", "v_proj"])
        };
        let mut model = PeftModel::new(root, lora(2), "a")?;
        model.add_adapter("b", lora(4))?;
        Ok(model)
    }

    fn experts(device: &Device) -> Result<PeftModel> {
        experts_on(decoder(2, HIDDEN, 2, device)?)
    }

    fn token_decoder(device: &Device) -> Result<Layer> {
        let embed = BaseLayer::embedding(&Tensor::randn(0f32, 1.0, (20, HIDDEN), device)?)?;
        Ok(Sequential::new()
            .add_named("embed", embed)
            .add_named("decoder", decoder(2, HIDDEN, 2, device)?)
            .into_layer())
    }

    fn config() -> XLoraConfig {
        XLoraConfig {
            hidden_size: HIDDEN,
            adapters: [("a".to_string(), String::new()), ("b".to_string(), String::new())]
                .into_iter()
                .collect(),
            xlora_depth: 2,
            xlora_size: 6,
            ..XLoraConfig::default()
        }
    }

    #[test]
    fn test_scalings_shape_and_softmax() -> Result<()> {
        let device = Device::Cpu;
        let model = XLoraModel::new(experts(&device)?, config())?;
        assert_eq!(model.classifier().n_layers(), 4);
        let xs = Tensor::randn(0f32, 1.0, (2, 3, HIDDEN), &device)?;
        let scalings = model.compute_scalings(&xs, false)?;
        assert_eq!(scalings.dims(), &[2, 3, 4, 2]);
        for total in values(&scalings.sum(D::Minus1)?)? {
            assert!((total - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_scaling_value_inhibitor() -> Result<()> {
        let device = Device::Cpu;
        let xs = Tensor::randn(0f32, 1.0, (2, 3, HIDDEN), &device)?;
        let mut reference = experts(&device)?;
        reference.set_adapter(&["a", "b"])?;
        let both = reference.forward(&xs)?;
        let plain = reference.with_adapters_disabled(|m| m.forward(&xs))?;

        let model = XLoraModel::new(reference, config())?;
        let zero = model.forward_with_scaling_value(&xs, 0.0)?;
        assert!(max_abs_diff(&zero, &plain)? < 1e-6);
        let one = model.forward_with_scaling_value(&xs, 1.0)?;
        assert!(max_abs_diff(&one, &both)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_token_ids_routed_through_hidden_states() -> Result<()> {
        let device = Device::Cpu;
        let routed_config = XLoraConfig {
            hidden_state_module: Some("v_proj".into()),
            ..config()
        };
        let model = XLoraModel::new(experts_on(token_decoder(&device)?)?, routed_config)?;
        let ids = Tensor::new(&[[1u32, 4, 7], [0, 19, 3]], &device)?;

        let hidden = model.hidden_states(&ids)?;
        assert_eq!(hidden.dims(), &[2, 3, HIDDEN]);
        let scalings = model.compute_scalings(&hidden, false)?;
        let routed = model.forward(&ids, false)?;
        let expected = model.forward_with_scalings(&ids, &scalings, false)?;
        assert!(max_abs_diff(&routed, &expected)? < 1e-6);
        assert_eq!(model.forward_with_scaling_value(&ids, 0.0)?.dims(), &[2, 3, HIDDEN]);

        let missing = XLoraConfig {
            hidden_state_module: Some("o_proj_missing".into()),
            ..config()
        };
        let err = XLoraModel::new(experts_on(token_decoder(&device)?)?, missing);
        assert!(matches!(err, Err(PeftError::TargetNotFound { .. })));
        Ok(())
    }

    #[test]
    fn test_top_k_keeps_largest() -> Result<()> {
        let device = Device::Cpu;
        let config = XLoraConfig {
            top_k_lora: Some(1),
            ..config()
        };
        let model = XLoraModel::new(experts(&device)?, config)?;
        let xs = Tensor::randn(0f32, 1.0, (1, 4, HIDDEN), &device)?;
        let scalings = model.compute_scalings(&xs, false)?;
        let nonzero = values(&scalings)?.iter().filter(|v| **v != 0.0).count();
        assert_eq!(nonzero, 4 * 4);
        Ok(())
    }

    #[test]
    fn test_experts_frozen_classifier_trainable() -> Result<()> {
        let device = Device::Cpu;
        let model = XLoraModel::new(experts(&device)?, config())?;
        assert_eq!(model.peft_model().get_nb_trainable_parameters().0, 0);
        // [6, 8] + 6, then [2, 6] + 2
        assert_eq!(model.classifier().num_parameters(), 48 + 6 + 12 + 2);
        assert_eq!(model.trainable_vars().len(), 4);
        Ok(())
    }

    #[test]
    fn test_scalings_log_and_classifier_round_trip() -> Result<()> {
        let device = Device::Cpu;
        let dir = TempDir::new().map_err(|e| PeftError::Io(e.to_string()))?;
        let model = XLoraModel::new(experts(&device)?, config())?;
        let xs = Tensor::randn(0f32, 1.0, (1, 2, HIDDEN), &device)?;

        model.enable_scalings_logging();
        model.forward(&xs, false)?;
        model.forward(&xs, false)?;
        assert_eq!(model.get_scalings_log().len(), 2);
        model.flush_log_scalings(dir.path().join("log.safetensors"))?;
        assert!(model.get_scalings_log().is_empty());

        model.save_pretrained(dir.path())?;
        let mut other = XLoraModel::new(experts(&device)?, config())?;
        other.load_classifier(dir.path())?;
        let expected = model.compute_scalings(&xs, false)?;
        assert!(max_abs_diff(&other.compute_scalings(&xs, false)?, &expected)? < 1e-6);
        assert_eq!(XLoraModel::load_config(dir.path())?, *model.config());
        Ok(())
    }
}
