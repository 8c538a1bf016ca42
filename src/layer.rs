//! Adapter-bearing wrapper around one base layer.
//!
//! A [`TunerLayer`] replaces a [`BaseLayer`] node in the network tree. It
//! keeps the base operation, every named adapter attached to it, and the
//! bookkeeping needed to fold adapters into the base weight and back out.

use candle_core::{DType, Tensor};

use crate::adapters::BuiltAdapter;
use crate::error::{PeftError, Result};
use crate::nn::{BaseLayer, ForwardContext, LayerWeights, Param};
use crate::registry::AdapterRegistry;
use crate::traits::{Adapter, Mergeable, Trainable};

/// Per-sample adapter name that routes a row through the base layer only.
pub const BASE_ONLY: &str = "__base__";

/// Position of a layer inside an xLoRA mixture.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingSlot {
    /// Index of this layer along the scalings' layer axis
    pub layer: usize,
    /// Adapter names in the order of the scalings' adapter axis
    pub adapters: Vec<String>,
    /// Global multiplier applied on top of the routed weights
    pub global_scaling_weight: f64,
}

/// A base layer carrying one or more named adapters.
///
/// Computes `λ·base(x) + Σ_active delta(x)`, where the gate `λ` is 1 unless a
/// distillation schedule has set it. Adapters already merged into the base
/// weight are never added again.
#[derive(Debug)]
pub struct TunerLayer {
    base: BaseLayer,
    adapters: AdapterRegistry<Box<dyn Adapter>>,
    merged: Vec<String>,
    disabled: bool,
    path: String,
    routing: Option<RoutingSlot>,
    lambda: Option<f64>,
}

impl TunerLayer {
    /// Wrap `base`, located at `path`, with no adapters yet.
    #[must_use]
    pub fn new(base: BaseLayer, path: impl Into<String>) -> Self {
        Self {
            base,
            adapters: AdapterRegistry::new(),
            merged: Vec::new(),
            disabled: false,
            path: path.into(),
            routing: None,
            lambda: None,
        }
    }

    /// The wrapped layer.
    #[must_use]
    pub fn base_layer(&self) -> &BaseLayer {
        &self.base
    }

    /// Module path this layer was injected at.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Install or reinitialize the adapter `name`.
    ///
    /// Replacing an existing name discards its old parameters. A replacement
    /// base weight carried by `built` (decomposition-based initialization)
    /// is written into the base layer.
    ///
    /// # Errors
    /// Returns [`PeftError::StateConflict`] if `name` is currently merged,
    /// or a shape error if the replacement base weight does not fit.
    pub fn update(&mut self, name: &str, built: BuiltAdapter) -> Result<()> {
        if self.merged.iter().any(|m| m == name) {
            return Err(PeftError::StateConflict(format!(
                "adapter '{name}' is merged into {}, unmerge it before reinitializing",
                self.path
            )));
        }
        if let Some(weight) = built.base_weight {
            self.base.weight().set(&weight)?;
        }
        if self.adapters.insert(name, built.adapter).is_some() {
            tracing::debug!(adapter = name, module = %self.path, "reinitialized adapter");
        }
        Ok(())
    }

    /// Adapter `name`, if this layer carries it.
    #[must_use]
    pub fn adapter(&self, name: &str) -> Option<&dyn Adapter> {
        self.adapters.get(name).map(|a| &**a)
    }

    /// Names of all adapters on this layer, in insertion order.
    #[must_use]
    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters.names()
    }

    /// Whether the layer carries no adapter.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Active adapter names.
    #[must_use]
    pub fn active_adapters(&self) -> &[String] {
        self.adapters.active()
    }

    /// Select the active adapters. Active adapters become trainable and the
    /// others are frozen; names this layer does not carry are ignored.
    pub fn set_adapter(&mut self, names: &[String]) {
        self.adapters.set_active_unchecked(names);
        for (name, adapter) in self.adapters.iter_mut() {
            if names.iter().any(|n| n == name) {
                adapter.unfreeze();
            } else {
                adapter.freeze();
            }
        }
    }

    /// Set the gradient requirement of one adapter's parameters.
    pub fn set_trainable(&mut self, name: &str, trainable: bool) {
        if let Some(adapter) = self.adapters.get_mut(name) {
            if trainable {
                adapter.unfreeze();
            } else {
                adapter.freeze();
            }
        }
    }

    /// Remove adapter `name`. If it is merged, the layer is unmerged and the
    /// other merged adapters are merged back afterwards.
    ///
    /// Returns whether the layer carried the adapter.
    ///
    /// # Errors
    /// Returns an error if unmerging or re-merging fails.
    pub fn delete_adapter(&mut self, name: &str) -> Result<bool> {
        if !self.adapters.contains(name) {
            return Ok(false);
        }
        if self.merged.iter().any(|m| m == name) {
            tracing::warn!(adapter = name, module = %self.path, "deleting a merged adapter, unmerging first");
            let survivors: Vec<String> = self.merged.iter().filter(|m| *m != name).cloned().collect();
            self.unmerge()?;
            self.adapters.remove(name);
            if !survivors.is_empty() {
                self.merge(Some(&survivors), false)?;
            }
            return Ok(true);
        }
        self.adapters.remove(name);
        Ok(true)
    }

    /// Enable or disable all adapters. Disabling a merged layer unmerges it
    /// so the base path sees the original weights.
    ///
    /// # Errors
    /// Returns an error if unmerging fails.
    pub fn enable_adapters(&mut self, enabled: bool) -> Result<()> {
        if !enabled && self.merged() {
            self.unmerge()?;
        }
        self.disabled = !enabled;
        Ok(())
    }

    /// Whether adapters are bypassed.
    #[must_use]
    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// Attach this layer to an xLoRA mixture, or detach it with `None`.
    pub fn set_routing(&mut self, slot: Option<RoutingSlot>) {
        self.routing = slot;
    }

    /// The xLoRA mixture slot, if any.
    #[must_use]
    pub fn routing(&self) -> Option<&RoutingSlot> {
        self.routing.as_ref()
    }

    /// Set the gate on the base output; `None` restores the plain sum.
    pub fn set_lambda(&mut self, lambda: Option<f64>) {
        self.lambda = lambda;
    }

    /// Current gate on the base output.
    #[must_use]
    pub fn lambda(&self) -> Option<f64> {
        self.lambda
    }

    /// Trainable scalar count over all adapters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.adapters.iter().map(|(_, a)| a.num_parameters()).sum()
    }

    /// Forward pass.
    ///
    /// # Errors
    /// Returns an error if the base or an adapter forward fails, or if a
    /// mixed batch is requested on a merged layer or with a wrong number of
    /// names.
    pub fn forward(&self, xs: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        if self.disabled {
            let out = self.base.forward(xs)?;
            ctx.record_activation(&self.path, &out);
            return Ok(out);
        }

        let base_out = match self.lambda {
            Some(l) if l == 0.0 => {
                let dtype = self.base.weight().var().dtype();
                Tensor::zeros(self.base.output_dims(xs)?, dtype, xs.device())?
            }
            _ => self.base.forward(xs)?,
        };
        let mut result = match self.lambda {
            Some(l) if l != 0.0 && (l - 1.0).abs() > f64::EPSILON => (&base_out * l)?,
            _ => base_out.clone(),
        };

        if let Some(names) = ctx.adapter_names() {
            result = self.mixed_batch_forward(xs, &base_out, result, names, ctx.is_train())?;
        } else {
            for (name, adapter) in self.adapters.active_entries() {
                if self.merged.iter().any(|m| m == name) {
                    continue;
                }
                let delta = adapter.forward(xs, &base_out, &self.base, ctx.is_train())?;
                let delta = self.route(name, delta, ctx.scalings())?;
                result = (result + delta.to_dtype(base_out.dtype())?)?;
            }
        }
        ctx.record_activation(&self.path, &result);
        Ok(result)
    }

    /// Weight an adapter's delta by its routed mixture coefficient.
    fn route(&self, name: &str, delta: Tensor, scalings: Option<&Tensor>) -> Result<Tensor> {
        let (Some(slot), Some(scalings)) = (&self.routing, scalings) else {
            return Ok(delta);
        };
        let Some(idx) = slot.adapters.iter().position(|a| a == name) else {
            return Ok(delta);
        };
        // [b, s, n_layers, n_adapters] -> [b, s, 1]
        let weight = scalings
            .narrow(2, slot.layer, 1)?
            .narrow(3, idx, 1)?
            .squeeze(3)?;
        let weight = (weight * slot.global_scaling_weight)?.to_dtype(delta.dtype())?;
        Ok(delta.broadcast_mul(&weight)?)
    }

    fn mixed_batch_forward(
        &self,
        xs: &Tensor,
        base_out: &Tensor,
        mut result: Tensor,
        names: &[String],
        train: bool,
    ) -> Result<Tensor> {
        if self.merged() {
            return Err(PeftError::StateConflict(
                "cannot pass per-sample adapter names while adapters are merged".into(),
            ));
        }
        let batch = xs.dim(0)?;
        if names.len() != batch {
            return Err(PeftError::DimensionMismatch {
                message: format!(
                    "got {} adapter names for a batch of {batch}",
                    names.len()
                ),
            });
        }
        let mut seen: Vec<&str> = Vec::new();
        for name in names {
            if name == BASE_ONLY || seen.contains(&name.as_str()) {
                continue;
            }
            seen.push(name);
            let Some(adapter) = self.adapters.get(name) else {
                tracing::debug!(adapter = %name, module = %self.path, "adapter not on this layer, skipping rows");
                continue;
            };
            #[allow(clippy::cast_possible_truncation)]
            let rows: Vec<u32> = names
                .iter()
                .enumerate()
                .filter(|(_, n)| *n == name)
                .map(|(i, _)| i as u32)
                .collect();
            let rows = Tensor::new(rows.as_slice(), xs.device())?;
            let sub_x = xs.index_select(&rows, 0)?;
            let sub_base = base_out.index_select(&rows, 0)?;
            let delta = adapter
                .forward(&sub_x, &sub_base, &self.base, train)?
                .to_dtype(result.dtype())?;
            result = result.index_add(&rows, &delta, 0)?;
        }
        Ok(result)
    }

    /// Unwrap into the base layer, dropping all adapters.
    #[must_use]
    pub fn into_base(self) -> BaseLayer {
        self.base
    }

    /// Named parameters: `base_layer.{weight,bias}` and `{param}.{adapter}`.
    #[must_use]
    pub fn parameters(&self) -> Vec<(String, &Param)> {
        let mut params: Vec<(String, &Param)> = self
            .base
            .parameters()
            .into_iter()
            .map(|(n, p)| (format!("base_layer.{n}"), p))
            .collect();
        for (adapter_name, adapter) in self.adapters.iter() {
            for (local, param) in adapter.parameters() {
                params.push((format!("{local}.{adapter_name}"), param));
            }
        }
        params
    }

    /// Mutable named parameters, same naming as [`TunerLayer::parameters`].
    pub fn parameters_mut(&mut self) -> Vec<(String, &mut Param)> {
        let mut params: Vec<(String, &mut Param)> = self
            .base
            .parameters_mut()
            .into_iter()
            .map(|(n, p)| (format!("base_layer.{n}"), p))
            .collect();
        for (adapter_name, adapter) in self.adapters.iter_mut() {
            for (local, param) in adapter.parameters_mut() {
                params.push((format!("{local}.{adapter_name}"), param));
            }
        }
        params
    }

    /// Parameters of one adapter by local name.
    #[must_use]
    pub fn adapter_parameters(&self, name: &str) -> Vec<(&'static str, &Param)> {
        self.adapters
            .get(name)
            .map(|a| a.parameters())
            .unwrap_or_default()
    }
}

/// Whether every element of `t` is finite.
fn all_finite(t: &Tensor) -> Result<bool> {
    let values = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(values.iter().all(|v| v.is_finite()))
}

impl Mergeable for TunerLayer {
    fn merge(&mut self, adapter_names: Option<&[String]>, safe: bool) -> Result<()> {
        if self.disabled {
            tracing::warn!(module = %self.path, "adapters are disabled, skipping merge");
            return Ok(());
        }
        let requested: Vec<String> = match adapter_names {
            Some(names) => names.to_vec(),
            None => self.adapters.active().to_vec(),
        };
        let mut to_merge = Vec::new();
        for name in requested {
            if self.merged.contains(&name) {
                tracing::warn!(adapter = %name, module = %self.path, "adapter is already merged, skipping");
            } else if self.adapters.contains(&name) && !to_merge.contains(&name) {
                to_merge.push(name);
            }
        }
        if to_merge.is_empty() {
            return Ok(());
        }

        // Stage everything before touching the base weights
        let mut staged: LayerWeights = self.base.weights();
        for name in &to_merge {
            let adapter = self.adapters.require(name)?;
            let next = adapter.merge(&self.base, &staged)?;
            if safe {
                let bias_ok = match &next.bias {
                    Some(b) => all_finite(b)?,
                    None => true,
                };
                if !all_finite(&next.weight)? || !bias_ok {
                    return Err(PeftError::NonFiniteWeights {
                        adapter: name.clone(),
                    });
                }
            }
            staged = next;
        }
        self.base.set_weights(&staged)?;
        self.merged.extend(to_merge);
        Ok(())
    }

    fn unmerge(&mut self) -> Result<()> {
        if self.merged.is_empty() {
            tracing::warn!(module = %self.path, "already unmerged, nothing to do");
            return Ok(());
        }
        let mut staged = self.base.weights();
        for name in self.merged.iter().rev() {
            let adapter = self.adapters.require(name)?;
            if !adapter.exact_unmerge() {
                tracing::debug!(adapter = %name, module = %self.path, "unmerge is approximate for this adapter type");
            }
            staged = adapter.unmerge(&self.base, &staged)?;
        }
        self.base.set_weights(&staged)?;
        self.merged.clear();
        Ok(())
    }

    fn merged_adapters(&self) -> &[String] {
        &self.merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::lora::{LoraConfig, LoraInitialization};
    use crate::adapters::{build_adapter, BuildContext};
    use crate::config::PeftConfig;
    use crate::nn::testing::max_abs_diff;
    use candle_core::Device;

    fn linear(device: &Device) -> Result<BaseLayer> {
        BaseLayer::linear(
            &Tensor::randn(0f32, 0.5, (6, 4), device)?,
            Some(&Tensor::randn(0f32, 0.1, 6, device)?),
        )
    }

    fn with_lora(base: BaseLayer, names: &[&str], init: LoraInitialization) -> Result<TunerLayer> {
        let mut layer = TunerLayer::new(base, "lin");
        for name in names {
            let config = PeftConfig::Lora(LoraConfig {
                r: 2,
                init_lora_weights: init,
                ..LoraConfig::default()
            });
            let built = build_adapter(
                &config,
                BuildContext {
                    path: "lin",
                    base: layer.base_layer(),
                    shared: None,
                },
            )?;
            layer.update(name, built)?;
        }
        let active: Vec<String> = names.iter().map(|n| (*n).to_string()).collect();
        layer.set_adapter(&active[..1]);
        Ok(layer)
    }

    #[test]
    fn test_zero_init_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let base = linear(&device)?;
        let xs = Tensor::randn(0f32, 1.0, (5, 4), &device)?;
        let expected = base.forward(&xs)?;
        let layer = with_lora(base, &["default"], LoraInitialization::Standard)?;
        let out = layer.forward(&xs, &mut ForwardContext::new())?;
        assert_eq!(max_abs_diff(&out, &expected)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_merge_matches_forward_and_unmerge_restores() -> Result<()> {
        let device = Device::Cpu;
        let base = linear(&device)?;
        let original = base.weights().weight.copy()?;
        let mut layer = with_lora(base, &["default"], LoraInitialization::Random)?;
        let xs = Tensor::randn(0f32, 1.0, (5, 4), &device)?;
        let before = layer.forward(&xs, &mut ForwardContext::new())?;

        layer.merge(None, true)?;
        assert_eq!(layer.merged_adapters(), &["default".to_string()]);
        let after = layer.forward(&xs, &mut ForwardContext::new())?;
        assert!(max_abs_diff(&before, &after)? < 1e-4);

        // merging again is a no-op
        layer.merge(None, false)?;
        assert_eq!(layer.merged_adapters().len(), 1);

        layer.unmerge()?;
        assert!(!layer.merged());
        assert!(max_abs_diff(&layer.base_layer().weights().weight, &original)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_safe_merge_rejects_nan_without_writing() -> Result<()> {
        let device = Device::Cpu;
        let base = linear(&device)?;
        let original = base.weights().weight.copy()?;
        let mut layer = with_lora(base, &["default"], LoraInitialization::Random)?;
        let params = layer.adapter_parameters("default");
        let (_, lora_b) = params
            .iter()
            .find(|(n, _)| *n == "lora_B")
            .expect("lora_B exists");
        lora_b.set(&(Tensor::ones((6, 2), DType::F32, &device)? * f64::NAN)?)?;

        let err = layer.merge(None, true);
        assert!(matches!(err, Err(PeftError::NonFiniteWeights { .. })));
        assert!(!layer.merged());
        assert_eq!(max_abs_diff(&layer.base_layer().weights().weight, &original)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_disable_unmerges_and_bypasses() -> Result<()> {
        let device = Device::Cpu;
        let base = linear(&device)?;
        let xs = Tensor::randn(0f32, 1.0, (3, 4), &device)?;
        let expected = base.forward(&xs)?;
        let mut layer = with_lora(base, &["default"], LoraInitialization::Random)?;
        layer.merge(None, false)?;
        layer.enable_adapters(false)?;
        assert!(!layer.merged());
        let out = layer.forward(&xs, &mut ForwardContext::new())?;
        assert!(max_abs_diff(&out, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_merge_while_disabled_is_skipped() -> Result<()> {
        let device = Device::Cpu;
        let base = linear(&device)?;
        let xs = Tensor::randn(0f32, 1.0, (3, 4), &device)?;
        let expected = base.forward(&xs)?;
        let mut layer = with_lora(base, &["default"], LoraInitialization::Random)?;
        let adapted = layer.forward(&xs, &mut ForwardContext::new())?;

        layer.enable_adapters(false)?;
        layer.merge(None, false)?;
        assert!(!layer.merged());
        let out = layer.forward(&xs, &mut ForwardContext::new())?;
        assert_eq!(max_abs_diff(&out, &expected)?, 0.0);

        layer.enable_adapters(true)?;
        let out = layer.forward(&xs, &mut ForwardContext::new())?;
        assert!(max_abs_diff(&out, &adapted)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_delete_merged_keeps_siblings_merged() -> Result<()> {
        let device = Device::Cpu;
        let base = linear(&device)?;
        let xs = Tensor::randn(0f32, 1.0, (3, 4), &device)?;
        let mut layer = with_lora(base, &["a", "b"], LoraInitialization::Random)?;
        layer.set_adapter(&["b".to_string()]);
        let b_only = layer.forward(&xs, &mut ForwardContext::new())?;

        layer.merge(Some(&["a".to_string(), "b".to_string()]), false)?;
        assert!(layer.delete_adapter("a")?);
        assert_eq!(layer.merged_adapters(), &["b".to_string()]);
        let out = layer.forward(&xs, &mut ForwardContext::new())?;
        assert!(max_abs_diff(&out, &b_only)? < 1e-5);

        layer.unmerge()?;
        let out = layer.forward(&xs, &mut ForwardContext::new())?;
        assert!(max_abs_diff(&out, &b_only)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_mixed_batch_routes_rows() -> Result<()> {
        let device = Device::Cpu;
        let base = linear(&device)?;
        let layer = with_lora(base, &["a", "b"], LoraInitialization::Random)?;
        let xs = Tensor::randn(0f32, 1.0, (3, 4), &device)?;
        let names = vec!["a".to_string(), BASE_ONLY.to_string(), "unknown".to_string()];
        let out = layer.forward(&xs, &mut ForwardContext::new().with_adapter_names(&names))?;

        let base_out = layer.base_layer().forward(&xs)?;
        let with_a = layer.forward(&xs, &mut ForwardContext::new())?;
        assert!(max_abs_diff(&out.get(0)?, &with_a.get(0)?)? < 1e-6);
        assert_eq!(max_abs_diff(&out.get(1)?, &base_out.get(1)?)?, 0.0);
        assert_eq!(max_abs_diff(&out.get(2)?, &base_out.get(2)?)?, 0.0);

        let short = vec!["a".to_string()];
        assert!(layer
            .forward(&xs, &mut ForwardContext::new().with_adapter_names(&short))
            .is_err());
        Ok(())
    }

    #[test]
    fn test_zero_lambda_skips_base() -> Result<()> {
        let device = Device::Cpu;
        let base = linear(&device)?;
        let mut layer = with_lora(base, &["default"], LoraInitialization::Random)?;
        let xs = Tensor::randn(0f32, 1.0, (3, 4), &device)?;
        let full = layer.forward(&xs, &mut ForwardContext::new())?;
        let base_out = layer.base_layer().forward(&xs)?;
        layer.set_lambda(Some(0.0));
        let delta_only = layer.forward(&xs, &mut ForwardContext::new())?;
        assert!(max_abs_diff(&(full - base_out)?, &delta_only)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_routing_scales_delta() -> Result<()> {
        let device = Device::Cpu;
        let base = linear(&device)?;
        let mut layer = with_lora(base, &["a"], LoraInitialization::Random)?;
        layer.set_routing(Some(RoutingSlot {
            layer: 1,
            adapters: vec!["a".into()],
            global_scaling_weight: 1.0,
        }));
        let xs = Tensor::randn(0f32, 1.0, (2, 3, 4), &device)?;
        let scalings = Tensor::zeros((2, 3, 2, 1), DType::F32, &device)?;
        let out = layer.forward(&xs, &mut ForwardContext::new().with_scalings(&scalings))?;
        let base_out = layer.base_layer().forward(&xs)?;
        assert_eq!(max_abs_diff(&out, &base_out)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_delete_and_parameter_names() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = with_lora(linear(&device)?, &["a", "b"], LoraInitialization::Standard)?;
        let names: Vec<String> = layer.parameters().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"base_layer.weight".to_string()));
        assert!(names.contains(&"lora_A.b".to_string()));
        assert!(layer.delete_adapter("a")?);
        assert!(!layer.delete_adapter("a")?);
        assert_eq!(layer.adapter_names(), vec!["b".to_string()]);
        Ok(())
    }
}
