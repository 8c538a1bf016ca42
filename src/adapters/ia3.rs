//! IA³ (Infused Adapter by Inhibiting and Amplifying Inner Activations) implementation.
//!
//! IA³ is an extremely parameter-efficient fine-tuning method that learns
//! rescaling vectors for keys, values, and feedforward layers.
//!
//! Reference: <https://arxiv.org/abs/2205.05638>

use std::any::Any;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::adapters::{ensure_kind, full, normal};
use crate::config::{BaseAdapterConfig, ModulePattern, PeftType, TargetModules};
use crate::error::{PeftError, Result};
use crate::nn::{BaseKind, BaseLayer, LayerWeights, Param};
use crate::traits::{Adapter, AdapterConfig};

/// Guard against division by a vanishing scale on unmerge.
const UNMERGE_EPS: f64 = 1e-8;

/// Configuration for IA³ adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ia3Config {
    /// Modules treated as feedforward (scaling applied to input).
    /// Must be a subset of `target_modules`.
    #[serde(default)]
    pub feedforward_modules: Vec<String>,

    /// Whether to initialize the vectors in IA³ layers to ones.
    /// Setting this to false is discouraged.
    #[serde(default = "default_true")]
    pub init_ia3_weights: bool,

    /// Target selection.
    #[serde(flatten)]
    pub base: BaseAdapterConfig,
}

fn default_true() -> bool {
    true
}

impl Default for Ia3Config {
    fn default() -> Self {
        Self {
            feedforward_modules: vec!["down_proj".into()],
            init_ia3_weights: true,
            base: BaseAdapterConfig::targeting(["k_proj", "v_proj", "down_proj"]),
        }
    }
}

impl Ia3Config {
    /// Whether the module at `path` scales its input rather than its output.
    #[must_use]
    pub fn is_feedforward(&self, path: &str) -> bool {
        self.feedforward_modules
            .iter()
            .any(|m| ModulePattern::parse(m).matches(path))
    }
}

impl AdapterConfig for Ia3Config {
    fn validate(&self) -> Result<()> {
        // Check that feedforward_modules is a subset of target_modules
        if let TargetModules::Names(targets) = &self.base.target_modules {
            for ff_module in &self.feedforward_modules {
                if !targets.contains(ff_module) {
                    return Err(PeftError::InvalidConfig(format!(
                        "feedforward_module '{ff_module}' must be in target_modules"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// IA³ rescaling vector for one layer.
///
/// For non-feedforward modules: `output = base_output * l`
/// For feedforward modules: `output = base_layer(input * l)`
#[derive(Debug)]
pub struct Ia3Adapter {
    /// Shape `[out_features]`, or `[in_features]` for feedforward modules.
    ia3_l: Param,
    is_feedforward: bool,
}

impl Ia3Adapter {
    /// Create a new IA³ adapter for the module at `path`.
    ///
    /// # Errors
    /// Returns error if configuration is invalid or the layer is not linear.
    pub fn new(config: &Ia3Config, base: &BaseLayer, path: &str) -> Result<Self> {
        config.validate()?;
        ensure_kind("IA3", base, &[BaseKind::Linear])?;
        let is_feedforward = config.is_feedforward(path);
        let len = if is_feedforward {
            base.in_features()
        } else {
            base.out_features()
        };
        let ia3_l = if config.init_ia3_weights {
            full(1.0, len, base)?
        } else {
            normal(len, 0.02, base)?
        };
        Ok(Self {
            ia3_l: Param::new(&ia3_l)?,
            is_feedforward,
        })
    }

    /// Whether this adapter scales the layer input.
    #[must_use]
    pub fn is_feedforward(&self) -> bool {
        self.is_feedforward
    }

    /// Scale of the weight in `[out, in]` layout.
    fn weight_scale(&self) -> Result<Tensor> {
        let l = self.ia3_l.value();
        let n = l.dim(0)?;
        if self.is_feedforward {
            Ok(l.reshape((1, n))?)
        } else {
            Ok(l.reshape((n, 1))?)
        }
    }
}

impl Adapter for Ia3Adapter {
    fn peft_type(&self) -> PeftType {
        PeftType::Ia3
    }

    fn forward(
        &self,
        input: &Tensor,
        base_output: &Tensor,
        base: &BaseLayer,
        _train: bool,
    ) -> Result<Tensor> {
        let shift = (self.ia3_l.value() - 1.0)?;
        if self.is_feedforward {
            let scaled = input.broadcast_mul(&shift.to_dtype(input.dtype())?)?;
            base.apply_weight(&scaled, &base.weight().value())
        } else {
            Ok(base_output.broadcast_mul(&shift.to_dtype(base_output.dtype())?)?)
        }
    }

    fn delta_weight(&self, base: &BaseLayer) -> Result<Tensor> {
        let w = base.weight().value();
        let shift = (self.weight_scale()? - 1.0)?;
        Ok(w.broadcast_mul(&shift.to_dtype(w.dtype())?)?)
    }

    fn merge(&self, _base: &BaseLayer, weights: &LayerWeights) -> Result<LayerWeights> {
        let scale = self.weight_scale()?.to_dtype(weights.weight.dtype())?;
        let bias = match (&weights.bias, self.is_feedforward) {
            (Some(b), false) => Some(b.mul(&self.ia3_l.value().to_dtype(b.dtype())?)?),
            (bias, _) => bias.clone(),
        };
        Ok(LayerWeights {
            weight: weights.weight.broadcast_mul(&scale)?,
            bias,
        })
    }

    fn unmerge(&self, _base: &BaseLayer, weights: &LayerWeights) -> Result<LayerWeights> {
        let scale = (self.weight_scale()? + UNMERGE_EPS)?.to_dtype(weights.weight.dtype())?;
        let bias = match (&weights.bias, self.is_feedforward) {
            (Some(b), false) => {
                let l = (self.ia3_l.value() + UNMERGE_EPS)?.to_dtype(b.dtype())?;
                Some(b.div(&l)?)
            }
            (bias, _) => bias.clone(),
        };
        Ok(LayerWeights {
            weight: weights.weight.broadcast_div(&scale)?,
            bias,
        })
    }

    fn exact_unmerge(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn parameters(&self) -> Vec<(&'static str, &Param)> {
        vec![("ia3_l", &self.ia3_l)]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Param)> {
        vec![("ia3_l", &mut self.ia3_l)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn config() -> Ia3Config {
        Ia3Config {
            feedforward_modules: vec!["down_proj".into()],
            base: BaseAdapterConfig::targeting(["q_proj", "down_proj"]),
            ..Default::default()
        }
    }

    #[test]
    fn test_ia3_config_feedforward_subset() {
        let mut config = config();
        assert!(config.validate().is_ok());
        config.feedforward_modules = vec!["up_proj".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ia3_vector_shapes() -> Result<()> {
        let device = Device::Cpu;
        let base = BaseLayer::linear(&Tensor::zeros((16, 8), DType::F32, &device)?, None)?;
        let output = Ia3Adapter::new(&config(), &base, "layers.0.q_proj")?;
        let ff = Ia3Adapter::new(&config(), &base, "layers.0.mlp.down_proj")?;
        assert!(!output.is_feedforward());
        assert!(ff.is_feedforward());
        assert_eq!(output.num_parameters(), 16);
        assert_eq!(ff.num_parameters(), 8);
        Ok(())
    }

    #[test]
    fn test_ia3_identity_at_init() -> Result<()> {
        let device = Device::Cpu;
        let base = BaseLayer::linear(
            &Tensor::randn(0f32, 1.0, (16, 8), &device)?,
            Some(&Tensor::randn(0f32, 1.0, 16, &device)?),
        )?;
        let adapter = Ia3Adapter::new(&config(), &base, "down_proj")?;
        let xs = Tensor::randn(0f32, 1.0, (2, 8), &device)?;
        let base_out = base.forward(&xs)?;
        let delta = adapter.forward(&xs, &base_out, &base, false)?;
        assert_eq!(delta.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_ia3_merge_scales_rows_and_bias() -> Result<()> {
        let device = Device::Cpu;
        let base = BaseLayer::linear(
            &Tensor::ones((2, 3), DType::F32, &device)?,
            Some(&Tensor::ones(2, DType::F32, &device)?),
        )?;
        let adapter = Ia3Adapter::new(&config(), &base, "q_proj")?;
        adapter.ia3_l.set(&Tensor::new(&[2f32, 3.], &device)?)?;
        let merged = adapter.merge(&base, &base.weights())?;
        assert_eq!(merged.weight.to_vec2::<f32>()?, vec![vec![2.; 3], vec![3.; 3]]);
        assert_eq!(
            merged.bias.as_ref().map(Tensor::to_vec1::<f32>).transpose()?,
            Some(vec![2., 3.])
        );
        let restored = adapter.unmerge(&base, &merged)?;
        let diff = (restored.weight - base.weights().weight)?.abs()?.max_all()?;
        assert!(diff.to_scalar::<f32>()? < 1e-6);
        Ok(())
    }
}
