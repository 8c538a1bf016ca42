//! LoHa (Low-Rank Hadamard Product) implementation.
//!
//! LoHa uses the Hadamard (element-wise) product of two low-rank matrices
//! for more expressive weight updates: `ΔW = (A1 ⊗ B1) ⊙ (A2 ⊗ B2)`
//!
//! Reference: <https://arxiv.org/abs/2108.06098> (LyCORIS)

use std::any::Any;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::adapters::{check_probability, check_rank, ensure_kind, kaiming_uniform, zeros};
use crate::config::{BaseAdapterConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::nn::{BaseKind, BaseLayer, Param};
use crate::traits::{Adapter, AdapterConfig};

/// Configuration for LoHa adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoHaConfig {
    /// Rank of the first low-rank decomposition.
    pub r: usize,

    /// Scaling factor (typically `alpha / r`).
    #[serde(alias = "lora_alpha")]
    pub alpha: usize,

    /// Probability of skipping the whole adapter for a training step.
    #[serde(default)]
    pub module_dropout: f64,

    /// Zero the last factor so the adapter starts as an identity.
    #[serde(default = "default_true")]
    pub init_weights: bool,

    /// Target selection.
    #[serde(flatten)]
    pub base: BaseAdapterConfig,
}

fn default_true() -> bool {
    true
}

impl Default for LoHaConfig {
    fn default() -> Self {
        Self {
            r: 8,
            alpha: 16,
            module_dropout: 0.0,
            init_weights: true,
            base: BaseAdapterConfig::default(),
        }
    }
}

impl AdapterConfig for LoHaConfig {
    fn validate(&self) -> Result<()> {
        check_rank(self.r)?;
        if self.alpha == 0 {
            return Err(PeftError::InvalidConfig("alpha must be > 0".into()));
        }
        check_probability("module_dropout", self.module_dropout)
    }
}

/// LoHa parameters for one layer.
///
/// Computes: `ΔW = (A1 @ B1) ⊙ (A2 @ B2) * scaling`
///
/// Where:
/// - A1, A2: [out_features, r]
/// - B1, B2: [r, fan_in]
/// - ⊙ is element-wise (Hadamard) product
#[derive(Debug)]
pub struct LoHaAdapter {
    hada_w1_a: Param,
    hada_w1_b: Param,
    hada_w2_a: Param,
    hada_w2_b: Param,
    /// Scaling factor = alpha / r
    scaling: f64,
    module_dropout: f64,
}

impl LoHaAdapter {
    /// Create a new LoHa adapter for `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails or the layer kind
    /// is not supported.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(config: &LoHaConfig, base: &BaseLayer) -> Result<Self> {
        config.validate()?;
        ensure_kind("LoHa", base, &[BaseKind::Linear, BaseKind::Conv2d])?;
        let (r, fan_in, out) = (config.r, base.fan_in(), base.out_features());

        let hada_w2_b = if config.init_weights {
            zeros((r, fan_in), base)?
        } else {
            kaiming_uniform((r, fan_in), base)?
        };

        Ok(Self {
            hada_w1_a: Param::new(&kaiming_uniform((out, r), base)?)?,
            hada_w1_b: Param::new(&kaiming_uniform((r, fan_in), base)?)?,
            hada_w2_a: Param::new(&kaiming_uniform((out, r), base)?)?,
            hada_w2_b: Param::new(&hada_w2_b)?,
            scaling: config.alpha as f64 / r as f64,
            module_dropout: config.module_dropout,
        })
    }

    /// Get the scaling factor.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    fn delta_2d(&self) -> Result<Tensor> {
        let w1 = self.hada_w1_a.value().matmul(&self.hada_w1_b.value())?;
        let w2 = self.hada_w2_a.value().matmul(&self.hada_w2_b.value())?;
        Ok(((w1 * w2)? * self.scaling)?)
    }
}

impl Adapter for LoHaAdapter {
    fn peft_type(&self) -> PeftType {
        PeftType::LoHa
    }

    fn forward(
        &self,
        input: &Tensor,
        base_output: &Tensor,
        base: &BaseLayer,
        train: bool,
    ) -> Result<Tensor> {
        if train && self.module_dropout > 0.0 && rand::random::<f64>() < self.module_dropout {
            return Ok(base_output.zeros_like()?);
        }
        let delta = base.to_weight_layout(&self.delta_2d()?)?;
        base.apply_weight(input, &delta)
    }

    fn delta_weight(&self, base: &BaseLayer) -> Result<Tensor> {
        base.to_weight_layout(&self.delta_2d()?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn parameters(&self) -> Vec<(&'static str, &Param)> {
        vec![
            ("hada_w1_a", &self.hada_w1_a),
            ("hada_w1_b", &self.hada_w1_b),
            ("hada_w2_a", &self.hada_w2_a),
            ("hada_w2_b", &self.hada_w2_b),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Param)> {
        vec![
            ("hada_w1_a", &mut self.hada_w1_a),
            ("hada_w1_b", &mut self.hada_w1_b),
            ("hada_w2_a", &mut self.hada_w2_a),
            ("hada_w2_b", &mut self.hada_w2_b),
        ]
    }
}
