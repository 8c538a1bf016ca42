//! `AdaLoRA` (Adaptive Low-Rank Adaptation) implementation.
//!
//! `AdaLoRA` parameterizes the update in SVD form and dynamically allocates
//! the rank budget during training using importance scores. It uses a
//! three-phase training schedule:
//! 1. Initial warmup phase (tinit steps)
//! 2. Rank reduction phase (between tinit and `total_step` - tfinal)
//! 3. Final fine-tuning phase (tfinal steps)
//!
//! Reference: <https://arxiv.org/abs/2303.10512>

#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]

use std::any::Any;
use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Module as _, Tensor, D};
use candle_nn::Linear;
use serde::{Deserialize, Serialize};

use crate::adapters::{check_probability, dropout, ensure_kind, normal, zeros};
use crate::config::{BaseAdapterConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::nn::{BaseKind, BaseLayer, Param};
use crate::training::BudgetSchedule;
use crate::traits::{Adapter, AdapterConfig};

/// Configuration for AdaLoRA adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaLoraConfig {
    /// Target average rank after pruning.
    #[serde(default = "default_target_r")]
    pub target_r: usize,

    /// Initial rank for each incremental matrix (before pruning).
    #[serde(default = "default_init_r")]
    pub init_r: usize,

    /// Scaling numerator.
    #[serde(alias = "lora_alpha")]
    pub alpha: usize,

    /// Dropout probability applied to the delta-path input.
    #[serde(default, alias = "lora_dropout")]
    pub dropout: f64,

    /// Steps of initial warmup (no rank reduction).
    #[serde(default)]
    pub tinit: usize,

    /// Steps of final fine-tuning (no rank reduction).
    #[serde(default)]
    pub tfinal: usize,

    /// Time interval between budget allocations.
    #[serde(default = "default_delta_t", alias = "deltaT")]
    pub delta_t: usize,

    /// Hyperparameter of EMA for sensitivity smoothing.
    #[serde(default = "default_beta")]
    pub beta1: f64,

    /// Hyperparameter of EMA for uncertainty quantification.
    #[serde(default = "default_beta")]
    pub beta2: f64,

    /// Coefficient of orthogonal regularization.
    #[serde(default = "default_orth_reg")]
    pub orth_reg_weight: f64,

    /// Total training steps, required for rank allocation.
    #[serde(default)]
    pub total_step: Option<usize>,

    /// Target selection.
    #[serde(flatten)]
    pub base: BaseAdapterConfig,
}

fn default_target_r() -> usize {
    8
}

fn default_init_r() -> usize {
    12
}

fn default_delta_t() -> usize {
    1
}

fn default_beta() -> f64 {
    0.85
}

fn default_orth_reg() -> f64 {
    0.5
}

impl Default for AdaLoraConfig {
    fn default() -> Self {
        Self {
            target_r: default_target_r(),
            init_r: default_init_r(),
            alpha: 16,
            dropout: 0.0,
            tinit: 0,
            tfinal: 0,
            delta_t: default_delta_t(),
            beta1: default_beta(),
            beta2: default_beta(),
            orth_reg_weight: default_orth_reg(),
            total_step: None,
            base: BaseAdapterConfig::default(),
        }
    }
}

impl AdapterConfig for AdaLoraConfig {
    fn validate(&self) -> Result<()> {
        if self.init_r == 0 {
            return Err(PeftError::InvalidConfig("init_r must be > 0".into()));
        }
        if self.target_r == 0 {
            return Err(PeftError::InvalidConfig("target_r must be > 0".into()));
        }
        if self.target_r > self.init_r {
            return Err(PeftError::InvalidConfig(
                "target_r must be <= init_r".into(),
            ));
        }
        if self.alpha == 0 {
            return Err(PeftError::InvalidConfig("alpha must be > 0".into()));
        }
        check_probability("dropout", self.dropout)?;
        if let Some(total_step) = self.total_step {
            if total_step == 0 {
                return Err(PeftError::InvalidConfig("total_step must be > 0".into()));
            }
            if self.tinit >= total_step.saturating_sub(self.tfinal) {
                return Err(PeftError::InvalidConfig(
                    "tinit must be < (total_step - tfinal) for budgeting phase".into(),
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.beta1) || !(0.0..=1.0).contains(&self.beta2) {
            return Err(PeftError::InvalidConfig(
                "beta1 and beta2 must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }
}

/// AdaLoRA parameters for one layer, in SVD-like form.
///
/// Uses `ΔW = B · (A ⊙ E) · alpha / (r + 1e-5)` where:
/// - A: right singular vectors `[r, in_features]`
/// - E: singular values `[r, 1]`, pruned by masking
/// - B: left singular vectors `[out_features, r]`
#[derive(Debug)]
pub struct AdaLoraAdapter {
    lora_a: Param,
    lora_e: Param,
    lora_b: Param,
    scaling: f64,
    dropout: f64,
}

impl AdaLoraAdapter {
    /// Create a new AdaLoRA adapter for `base`.
    ///
    /// `E` starts at zero, so the adapter is an identity at creation.
    ///
    /// # Errors
    /// Returns error if configuration is invalid or the layer is not linear.
    pub fn new(config: &AdaLoraConfig, base: &BaseLayer) -> Result<Self> {
        config.validate()?;
        ensure_kind("AdaLoRA", base, &[BaseKind::Linear])?;
        let (r, in_features, out_features) = (config.init_r, base.in_features(), base.out_features());
        Ok(Self {
            lora_a: Param::new(&normal((r, in_features), 0.02, base)?)?,
            lora_e: Param::new(&zeros((r, 1), base)?)?,
            lora_b: Param::new(&normal((out_features, r), 0.02, base)?)?,
            scaling: config.alpha as f64 / (r as f64 + 1e-5),
            dropout: config.dropout,
        })
    }

    /// Initial rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.lora_e.dims()[0]
    }

    /// Number of singular values not masked to zero.
    ///
    /// # Errors
    /// Returns error if the values cannot be read.
    pub fn current_rank(&self) -> Result<usize> {
        let values = self
            .lora_e
            .value()
            .flatten_all()?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        Ok(values.iter().filter(|v| **v != 0.0).count())
    }

    /// Get the scaling factor.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Right singular vectors `[r, in]`.
    #[must_use]
    pub fn lora_a(&self) -> &Param {
        &self.lora_a
    }

    /// Singular values `[r, 1]`.
    #[must_use]
    pub fn lora_e(&self) -> &Param {
        &self.lora_e
    }

    /// Left singular vectors `[out, r]`.
    #[must_use]
    pub fn lora_b(&self) -> &Param {
        &self.lora_b
    }

    fn scaled_a(&self) -> Result<Tensor> {
        Ok(self.lora_a.value().broadcast_mul(&self.lora_e.value())?)
    }
}

impl Adapter for AdaLoraAdapter {
    fn peft_type(&self) -> PeftType {
        PeftType::AdaLora
    }

    fn forward(
        &self,
        input: &Tensor,
        _base_output: &Tensor,
        _base: &BaseLayer,
        train: bool,
    ) -> Result<Tensor> {
        let xs = dropout(input, self.dropout, train)?;
        let after_a = Linear::new(self.scaled_a()?, None).forward(&xs)?;
        let out = Linear::new(self.lora_b.value(), None).forward(&after_a)?;
        Ok((out * self.scaling)?)
    }

    fn delta_weight(&self, _base: &BaseLayer) -> Result<Tensor> {
        let delta = self.lora_b.value().matmul(&self.scaled_a()?)?;
        Ok((delta * self.scaling)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn parameters(&self) -> Vec<(&'static str, &Param)> {
        vec![
            ("lora_A", &self.lora_a),
            ("lora_B", &self.lora_b),
            ("lora_E", &self.lora_e),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Param)> {
        vec![
            ("lora_A", &mut self.lora_a),
            ("lora_B", &mut self.lora_b),
            ("lora_E", &mut self.lora_e),
        ]
    }
}

/// Exponential moving averages of one parameter's sensitivity.
#[derive(Debug)]
struct Sensitivity {
    exp_avg_ipt: Tensor,
    exp_avg_unc: Tensor,
}

/// Importance-driven rank budget allocator.
///
/// Tracks `|w · ∇w|` of every AdaLoRA parameter with two EMAs and, on the
/// budget schedule, zeros the singular values whose triplet importance
/// falls below the budget threshold.
#[derive(Debug)]
pub struct RankAllocator {
    schedule: BudgetSchedule,
    beta1: f64,
    beta2: f64,
    sensitivity: HashMap<String, Sensitivity>,
    rank_pattern: Option<HashMap<String, Tensor>>,
}

impl RankAllocator {
    /// Allocator for an adapter spread over `num_layers` layers.
    ///
    /// # Errors
    /// Returns error if the config has no `total_step`.
    pub fn new(config: &AdaLoraConfig, num_layers: usize) -> Result<Self> {
        let total_step = config.total_step.ok_or_else(|| {
            PeftError::InvalidConfig("AdaLoRA rank allocation requires total_step".into())
        })?;
        Ok(Self {
            schedule: BudgetSchedule {
                init_budget: config.init_r * num_layers,
                target_budget: config.target_r * num_layers,
                tinit: config.tinit,
                tfinal: config.tfinal,
                total_step,
                delta_t: config.delta_t,
            },
            beta1: config.beta1,
            beta2: config.beta2,
            sensitivity: HashMap::new(),
            rank_pattern: None,
        })
    }

    /// Budget schedule driving the allocator.
    #[must_use]
    pub fn schedule(&self) -> &BudgetSchedule {
        &self.schedule
    }

    /// Update importance scores from `grads` and prune to the budget of
    /// `step`. `layers` pairs each module path with its adapter.
    ///
    /// Returns the budget when a masking happened.
    ///
    /// # Errors
    /// Returns error if tensor operations fail.
    pub fn update_and_allocate(
        &mut self,
        layers: &[(String, &AdaLoraAdapter)],
        grads: &GradStore,
        step: usize,
    ) -> Result<Option<usize>> {
        let final_start = self.schedule.total_step.saturating_sub(self.schedule.tfinal);
        let (budget, mask) = self.schedule.budget(step);
        if step < final_start {
            self.update_ipt(layers, grads)?;
            if mask {
                self.mask_to_budget(layers, budget)?;
                return Ok(Some(budget));
            }
            Ok(None)
        } else if step == final_start || self.rank_pattern.is_none() {
            // Fix the final pattern once and keep it for the remaining steps
            self.update_ipt(layers, grads)?;
            let pattern = self.mask_to_budget(layers, budget)?;
            self.rank_pattern = Some(pattern);
            Ok(Some(budget))
        } else {
            if let Some(pattern) = &self.rank_pattern {
                for (path, adapter) in layers {
                    if let Some(keep) = pattern.get(path) {
                        let e = adapter.lora_e.value().detach();
                        adapter.lora_e.set(&e.broadcast_mul(&keep.to_dtype(e.dtype())?)?)?;
                    }
                }
            }
            Ok(Some(budget))
        }
    }

    fn update_ipt(&mut self, layers: &[(String, &AdaLoraAdapter)], grads: &GradStore) -> Result<()> {
        for (path, adapter) in layers {
            for (name, param) in adapter.parameters() {
                let Some(grad) = grads.get(param.var().as_tensor()) else {
                    continue;
                };
                let weight = param.var().as_tensor().detach().to_dtype(DType::F32)?;
                let ipt = (weight * grad.to_dtype(DType::F32)?)?.abs()?;
                let key = format!("{path}.{name}");
                let entry = match self.sensitivity.remove(&key) {
                    Some(s) => s,
                    None => Sensitivity {
                        exp_avg_ipt: ipt.zeros_like()?,
                        exp_avg_unc: ipt.zeros_like()?,
                    },
                };
                let exp_avg_ipt =
                    ((entry.exp_avg_ipt * self.beta1)? + (&ipt * (1.0 - self.beta1))?)?;
                let unc = (&ipt - &exp_avg_ipt)?.abs()?;
                let exp_avg_unc = ((entry.exp_avg_unc * self.beta2)? + (unc * (1.0 - self.beta2))?)?;
                self.sensitivity.insert(
                    key,
                    Sensitivity {
                        exp_avg_ipt,
                        exp_avg_unc,
                    },
                );
            }
        }
        Ok(())
    }

    /// Per-parameter element score `avg_ipt · avg_unc`.
    fn element_score(&self, key: &str) -> Result<Option<Tensor>> {
        match self.sensitivity.get(key) {
            Some(s) => Ok(Some((&s.exp_avg_ipt * &s.exp_avg_unc)?)),
            None => Ok(None),
        }
    }

    /// Importance of each singular triplet of one layer, `[r, 1]`.
    fn triplet_score(&self, path: &str, adapter: &AdaLoraAdapter) -> Result<Tensor> {
        let r = adapter.rank();
        let device = adapter.lora_e.var().device();
        let mut score = Tensor::zeros((r, 1), DType::F32, device)?;
        if let Some(e) = self.element_score(&format!("{path}.lora_E"))? {
            score = (score + e)?;
        }
        if let Some(a) = self.element_score(&format!("{path}.lora_A"))? {
            score = (score + a.mean_keepdim(D::Minus1)?)?;
        }
        if let Some(b) = self.element_score(&format!("{path}.lora_B"))? {
            score = (score + b.mean(0)?.reshape((r, 1))?)?;
        }
        Ok(score)
    }

    fn mask_to_budget(
        &self,
        layers: &[(String, &AdaLoraAdapter)],
        budget: usize,
    ) -> Result<HashMap<String, Tensor>> {
        let mut scores = Vec::with_capacity(layers.len());
        let mut all = Vec::new();
        for (path, adapter) in layers {
            let score = self.triplet_score(path, adapter)?;
            all.extend(score.flatten_all()?.to_vec1::<f32>()?);
            scores.push(score);
        }
        let init_budget: usize = layers.iter().map(|(_, a)| a.rank()).sum();
        let k = init_budget.saturating_sub(budget);

        let mut pattern = HashMap::new();
        if k == 0 || all.is_empty() {
            for (path, adapter) in layers {
                let keep = Tensor::ones((adapter.rank(), 1), DType::F32, adapter.lora_e.var().device())?;
                pattern.insert(path.clone(), keep);
            }
            return Ok(pattern);
        }
        all.sort_by(f32::total_cmp);
        let threshold = f64::from(all[(k - 1).min(all.len() - 1)]);

        for ((path, adapter), score) in layers.iter().zip(scores) {
            let keep = score.gt(threshold)?.to_dtype(DType::F32)?;
            let e = adapter.lora_e.value().detach();
            adapter.lora_e.set(&e.broadcast_mul(&keep.to_dtype(e.dtype())?)?)?;
            pattern.insert(path.clone(), keep);
        }
        tracing::debug!(budget, threshold, "AdaLoRA masked singular values");
        Ok(pattern)
    }
}

/// Orthogonal regularization over the AdaLoRA adapters of one name.
///
/// Mean over all `lora_A` and `lora_B` matrices of `‖AAᵀ − I‖_F` and
/// `‖BᵀB − I‖_F`, multiplied by `weight`.
///
/// # Errors
/// Returns error if no adapter is given or tensor operations fail.
pub fn orthogonal_regularization(adapters: &[&AdaLoraAdapter], weight: f64) -> Result<Tensor> {
    if adapters.is_empty() {
        return Err(PeftError::InvalidConfig(
            "orthogonal regularization needs at least one AdaLoRA layer".into(),
        ));
    }
    let mut total: Option<Tensor> = None;
    let mut count = 0usize;
    for adapter in adapters {
        let a = adapter.lora_a.value();
        let b = adapter.lora_b.value();
        let eye = Tensor::eye(adapter.rank(), a.dtype(), a.device())?;
        for cov in [a.matmul(&a.t()?)?, b.t()?.matmul(&b)?] {
            let norm = (cov - &eye)?.sqr()?.sum_all()?.sqrt()?;
            total = Some(match total {
                Some(t) => (t + norm)?,
                None => norm,
            });
            count += 1;
        }
    }
    let total = total.ok_or_else(|| PeftError::InvalidConfig("no AdaLoRA parameters".into()))?;
    Ok((total * (weight / count as f64))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn linear_base(out: usize, inp: usize) -> Result<BaseLayer> {
        BaseLayer::linear(&Tensor::randn(0f32, 1.0, (out, inp), &Device::Cpu)?, None)
    }

    #[test]
    fn test_adalora_config_default() {
        let config = AdaLoraConfig::default();
        assert_eq!(config.target_r, 8);
        assert_eq!(config.init_r, 12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_adalora_config_invalid_target_r() {
        let config = AdaLoraConfig {
            target_r: 16,
            init_r: 12,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_adalora_config_invalid_phases() {
        let config = AdaLoraConfig {
            tinit: 50,
            tfinal: 60,
            total_step: Some(100),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_delta_t_alias() -> anyhow::Result<()> {
        let config: AdaLoraConfig =
            serde_json::from_str(r#"{"lora_alpha": 32, "deltaT": 10, "total_step": 100}"#)?;
        assert_eq!(config.delta_t, 10);
        assert_eq!(config.alpha, 32);
        Ok(())
    }

    #[test]
    fn test_adalora_zero_init_delta() -> Result<()> {
        let base = linear_base(32, 64)?;
        let adapter = AdaLoraAdapter::new(&AdaLoraConfig::default(), &base)?;
        let delta = adapter.delta_weight(&base)?;
        assert_eq!(delta.dims(), &[32, 64]);
        assert_eq!(delta.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        assert_eq!(adapter.current_rank()?, 0);
        Ok(())
    }

    #[test]
    fn test_adalora_rejects_embedding() -> Result<()> {
        let base = BaseLayer::embedding(&Tensor::zeros((10, 4), DType::F32, &Device::Cpu)?)?;
        assert!(AdaLoraAdapter::new(&AdaLoraConfig::default(), &base).is_err());
        Ok(())
    }

    #[test]
    fn test_orthogonal_regularization_positive() -> Result<()> {
        let base = linear_base(16, 16)?;
        let adapter = AdaLoraAdapter::new(&AdaLoraConfig::default(), &base)?;
        let loss = orthogonal_regularization(&[&adapter], 0.5)?;
        assert!(loss.to_scalar::<f32>()? > 0.0);
        Ok(())
    }

    #[test]
    fn test_rank_allocator_masks_to_budget() -> Result<()> {
        let config = AdaLoraConfig {
            init_r: 4,
            target_r: 2,
            total_step: Some(10),
            ..Default::default()
        };
        let base = linear_base(8, 8)?;
        let adapters = [
            AdaLoraAdapter::new(&config, &base)?,
            AdaLoraAdapter::new(&config, &base)?,
        ];
        for adapter in &adapters {
            adapter
                .lora_e()
                .set(&Tensor::new(&[[1f32], [2.], [3.], [4.]], &Device::Cpu)?)?;
        }

        let x = Var::from_tensor(&Tensor::randn(0f32, 1.0, (3, 8), &Device::Cpu)?)?;
        let mut loss = Tensor::zeros((), DType::F32, &Device::Cpu)?;
        for adapter in &adapters {
            let out = adapter.forward(x.as_tensor(), x.as_tensor(), &base, false)?;
            loss = (loss + out.sqr()?.sum_all()?)?;
        }
        let grads = loss.backward()?;

        let layers: Vec<(String, &AdaLoraAdapter)> = adapters
            .iter()
            .enumerate()
            .map(|(i, a)| (format!("lin{i}"), a))
            .collect();
        let mut allocator = RankAllocator::new(&config, layers.len())?;
        // Final phase: budget is target_r per layer
        let budget = allocator.update_and_allocate(&layers, &grads, 10)?;
        assert_eq!(budget, Some(4));
        let kept: usize = adapters
            .iter()
            .map(AdaLoraAdapter::current_rank)
            .sum::<Result<usize>>()?;
        assert!(kept <= 4);
        Ok(())
    }

    #[test]
    fn test_rank_allocator_requires_total_step() {
        assert!(RankAllocator::new(&AdaLoraConfig::default(), 2).is_err());
    }
}
