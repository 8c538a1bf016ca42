//! `GLoRA` (Generalized LoRA) implementation.
//!
//! `GLoRA` rescales and shifts both the weight and the bias of a linear
//! layer through five support tensors:
//!
//! ```text
//! W' = W + W ⊙ A + B
//! b' = b + b ⊙ D + E + W · C
//! ```
//!
//! Each support tensor can take one of a few forms (low-rank, vector,
//! constant, none). During supernet training a random form is drawn for
//! every forward pass; an evaluation path fixes the choice.
//!
//! Reference: <https://arxiv.org/abs/2306.07967>

use std::any::Any;

use candle_core::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::adapters::{check_rank, ensure_kind, kaiming_uniform, zeros};
use crate::config::{BaseAdapterConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::nn::{BaseKind, BaseLayer, LayerWeights, Param};
use crate::traits::{Adapter, AdapterConfig};

/// Form of one support tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Support {
    /// Low-rank product `Xd @ Xu`
    #[serde(rename = "lora")]
    LoRA,
    /// First column of `Xd`
    Vector,
    /// A single learned scalar
    Constant,
    /// Zero
    None,
}

const AB_CHOICES: [Support; 4] = [Support::LoRA, Support::Vector, Support::Constant, Support::None];
const C_CHOICES: [Support; 3] = [Support::LoRA, Support::Vector, Support::None];
const DE_CHOICES: [Support; 3] = [Support::Constant, Support::None, Support::Vector];

/// Choice of form for each support tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct GLoraPath {
    /// Weight scale
    pub A: Support,
    /// Weight shift
    pub B: Support,
    /// Weight-projected bias shift
    pub C: Support,
    /// Bias scale
    pub D: Support,
    /// Bias shift
    pub E: Support,
}

impl GLoraPath {
    /// Draw a path uniformly from the search space.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            A: AB_CHOICES[rng.gen_range(0..AB_CHOICES.len())],
            B: AB_CHOICES[rng.gen_range(0..AB_CHOICES.len())],
            C: C_CHOICES[rng.gen_range(0..C_CHOICES.len())],
            D: DE_CHOICES[rng.gen_range(0..DE_CHOICES.len())],
            E: DE_CHOICES[rng.gen_range(0..DE_CHOICES.len())],
        }
    }

    fn validate(&self) -> Result<()> {
        if !C_CHOICES.contains(&self.C) {
            return Err(PeftError::InvalidConfig(format!(
                "GLoRA support C cannot be {:?}",
                self.C
            )));
        }
        for (name, support) in [("D", self.D), ("E", self.E)] {
            if !DE_CHOICES.contains(&support) {
                return Err(PeftError::InvalidConfig(format!(
                    "GLoRA support {name} cannot be {support:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for `GLoRA` adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GLoraConfig {
    /// Rank of the low-rank support tensors.
    #[serde(default = "default_r")]
    pub r: usize,

    /// Fixed path for evaluation and merging; random paths are drawn
    /// per forward pass when unset.
    #[serde(default)]
    pub eval_config: Option<GLoraPath>,

    /// Target selection.
    #[serde(flatten)]
    pub base: BaseAdapterConfig,
}

fn default_r() -> usize {
    4
}

impl Default for GLoraConfig {
    fn default() -> Self {
        Self {
            r: default_r(),
            eval_config: None,
            base: BaseAdapterConfig::default(),
        }
    }
}

impl AdapterConfig for GLoraConfig {
    fn validate(&self) -> Result<()> {
        check_rank(self.r)?;
        self.eval_config.as_ref().map_or(Ok(()), GLoraPath::validate)
    }
}

/// Support tensors resolved for one path.
struct Supports {
    /// `[out, in]`, `[out, 1]` or `[1, 1]`
    a: Tensor,
    b: Tensor,
    /// `[in, 1]`
    c: Tensor,
    /// `[out]` or `[1]`
    d: Tensor,
    e: Tensor,
}

/// `GLoRA` support tensors for one linear layer.
#[derive(Debug)]
#[allow(clippy::struct_field_names)]
pub struct GLoraAdapter {
    glora_ad: Param,
    glora_au: Param,
    glora_bd: Param,
    glora_bu: Param,
    glora_cd: Param,
    glora_cu: Param,
    glora_d: Param,
    glora_e: Param,
    eval_config: Option<GLoraPath>,
}

impl GLoraAdapter {
    /// Create a new `GLoRA` adapter for `base`.
    ///
    /// All `*d` factors and the bias vectors start at zero, so every path
    /// is an identity at creation.
    ///
    /// # Errors
    /// Returns error if configuration is invalid or the layer is not linear.
    pub fn new(config: &GLoraConfig, base: &BaseLayer) -> Result<Self> {
        config.validate()?;
        ensure_kind("GLoRA", base, &[BaseKind::Linear])?;
        let (r, in_features, out_features) = (config.r, base.in_features(), base.out_features());
        Ok(Self {
            glora_ad: Param::new(&zeros((out_features, r), base)?)?,
            glora_au: Param::new(&kaiming_uniform((r, in_features), base)?)?,
            glora_bd: Param::new(&zeros((out_features, r), base)?)?,
            glora_bu: Param::new(&kaiming_uniform((r, in_features), base)?)?,
            glora_cd: Param::new(&zeros((in_features, r), base)?)?,
            glora_cu: Param::new(&kaiming_uniform((r, 1), base)?)?,
            glora_d: Param::new(&zeros(out_features, base)?)?,
            glora_e: Param::new(&zeros(out_features, base)?)?,
            eval_config: config.eval_config,
        })
    }

    /// Evaluation path, if fixed.
    #[must_use]
    pub fn eval_config(&self) -> Option<GLoraPath> {
        self.eval_config
    }

    fn low_rank_support(support: Support, down: &Param, up: &Param) -> Result<Tensor> {
        let down = down.value();
        let up = up.value();
        Ok(match support {
            Support::LoRA => down.matmul(&up)?,
            Support::Vector => down.narrow(1, 0, 1)?,
            Support::Constant => down.narrow(0, 0, 1)?.narrow(1, 0, 1)?,
            Support::None => Tensor::zeros((down.dim(0)?, up.dim(1)?), down.dtype(), down.device())?,
        })
    }

    fn vector_support(support: Support, vector: &Param) -> Result<Tensor> {
        let vector = vector.value();
        Ok(match support {
            Support::Vector => vector,
            Support::Constant => vector.narrow(0, 0, 1)?,
            Support::LoRA | Support::None => vector.zeros_like()?.narrow(0, 0, 1)?,
        })
    }

    fn supports(&self, path: GLoraPath) -> Result<Supports> {
        Ok(Supports {
            a: Self::low_rank_support(path.A, &self.glora_ad, &self.glora_au)?,
            b: Self::low_rank_support(path.B, &self.glora_bd, &self.glora_bu)?,
            c: Self::low_rank_support(path.C, &self.glora_cd, &self.glora_cu)?,
            d: Self::vector_support(path.D, &self.glora_d)?,
            e: Self::vector_support(path.E, &self.glora_e)?,
        })
    }

    fn eval_path(&self) -> Result<GLoraPath> {
        self.eval_config.ok_or_else(|| {
            PeftError::InvalidConfig("merging a GLoRA adapter requires an eval_config path".into())
        })
    }

    /// `(W ⊙ A + B, b ⊙ D + E + W · C)` for weight `w` and bias `b`.
    fn deltas(s: &Supports, w: &Tensor, b: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let dtype = w.dtype();
        let dw = w
            .broadcast_mul(&s.a.to_dtype(dtype)?)?
            .broadcast_add(&s.b.to_dtype(dtype)?)?;
        let out = w.dim(0)?;
        let mut db = w.matmul(&s.c.to_dtype(dtype)?)?.reshape(out)?;
        db = db.broadcast_add(&s.e.to_dtype(dtype)?)?;
        if let Some(b) = b {
            db = (db + b.broadcast_mul(&s.d.to_dtype(dtype)?)?)?;
        }
        Ok((dw, db))
    }
}

impl Adapter for GLoraAdapter {
    fn peft_type(&self) -> PeftType {
        PeftType::GLora
    }

    fn forward(
        &self,
        input: &Tensor,
        _base_output: &Tensor,
        base: &BaseLayer,
        _train: bool,
    ) -> Result<Tensor> {
        let path = match self.eval_config {
            Some(path) => path,
            None => GLoraPath::random(&mut rand::thread_rng()),
        };
        let supports = self.supports(path)?;
        let bias = base.bias().map(Param::value);
        let (dw, db) = Self::deltas(&supports, &base.weight().value(), bias.as_ref())?;
        let out = base.apply_weight(input, &dw)?;
        Ok(out.broadcast_add(&db.to_dtype(out.dtype())?)?)
    }

    fn delta_weight(&self, base: &BaseLayer) -> Result<Tensor> {
        let supports = self.supports(self.eval_path()?)?;
        let (dw, _) = Self::deltas(&supports, &base.weight().value(), None)?;
        Ok(dw)
    }

    fn merge(&self, _base: &BaseLayer, weights: &LayerWeights) -> Result<LayerWeights> {
        let supports = self.supports(self.eval_path()?)?;
        let (dw, db) = Self::deltas(&supports, &weights.weight, weights.bias.as_ref())?;
        let bias = match &weights.bias {
            Some(b) => (b + db)?,
            None => db,
        };
        Ok(LayerWeights {
            weight: (&weights.weight + dw)?,
            bias: Some(bias),
        })
    }

    fn unmerge(&self, _base: &BaseLayer, weights: &LayerWeights) -> Result<LayerWeights> {
        let s = self.supports(self.eval_path()?)?;
        let dtype = weights.weight.dtype();
        // W' = W (1 + A) + B
        let one_plus_a = (s.a.to_dtype(dtype)? + 1.0)?;
        let weight = weights
            .weight
            .broadcast_sub(&s.b.to_dtype(dtype)?)?
            .broadcast_div(&one_plus_a)?;
        // b' = b (1 + D) + E + W C
        let bias = match &weights.bias {
            Some(merged) => {
                let out = weight.dim(0)?;
                let wc = weight.matmul(&s.c.to_dtype(dtype)?)?.reshape(out)?;
                let one_plus_d = (s.d.to_dtype(dtype)? + 1.0)?;
                Some(
                    (merged - wc)?
                        .broadcast_sub(&s.e.to_dtype(dtype)?)?
                        .broadcast_div(&one_plus_d)?,
                )
            }
            None => None,
        };
        Ok(LayerWeights { weight, bias })
    }

    fn exact_unmerge(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn parameters(&self) -> Vec<(&'static str, &Param)> {
        vec![
            ("glora_Ad", &self.glora_ad),
            ("glora_Au", &self.glora_au),
            ("glora_Bd", &self.glora_bd),
            ("glora_Bu", &self.glora_bu),
            ("glora_Cd", &self.glora_cd),
            ("glora_Cu", &self.glora_cu),
            ("glora_D", &self.glora_d),
            ("glora_E", &self.glora_e),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Param)> {
        vec![
            ("glora_Ad", &mut self.glora_ad),
            ("glora_Au", &mut self.glora_au),
            ("glora_Bd", &mut self.glora_bd),
            ("glora_Bu", &mut self.glora_bu),
            ("glora_Cd", &mut self.glora_cd),
            ("glora_Cu", &mut self.glora_cu),
            ("glora_D", &mut self.glora_d),
            ("glora_E", &mut self.glora_e),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn path() -> GLoraPath {
        GLoraPath {
            A: Support::LoRA,
            B: Support::Vector,
            C: Support::LoRA,
            D: Support::Constant,
            E: Support::Vector,
        }
    }

    fn base(device: &Device) -> Result<BaseLayer> {
        BaseLayer::linear(
            &Tensor::randn(0f32, 1.0, (6, 4), device)?,
            Some(&Tensor::randn(0f32, 1.0, 6, device)?),
        )
    }

    #[test]
    fn test_glora_identity_for_any_path() -> Result<()> {
        let device = Device::Cpu;
        let base = base(&device)?;
        let adapter = GLoraAdapter::new(&GLoraConfig::default(), &base)?;
        let xs = Tensor::randn(0f32, 1.0, (3, 4), &device)?;
        for _ in 0..8 {
            let delta = adapter.forward(&xs, &xs, &base, true)?;
            assert_eq!(delta.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_glora_merge_requires_eval_path() -> Result<()> {
        let device = Device::Cpu;
        let base = base(&device)?;
        let adapter = GLoraAdapter::new(&GLoraConfig::default(), &base)?;
        assert!(adapter.merge(&base, &base.weights()).is_err());
        Ok(())
    }

    #[test]
    fn test_glora_merge_matches_forward() -> Result<()> {
        let device = Device::Cpu;
        let base = base(&device)?;
        let config = GLoraConfig {
            eval_config: Some(path()),
            ..Default::default()
        };
        let adapter = GLoraAdapter::new(&config, &base)?;
        for (_, p) in adapter.parameters() {
            p.set(&Tensor::randn(0f32, 0.1, p.dims(), &device)?)?;
        }
        let xs = Tensor::randn(0f32, 1.0, (3, 4), &device)?;
        let expected = (base.forward(&xs)? + adapter.forward(&xs, &xs, &base, false)?)?;

        let merged = adapter.merge(&base, &base.weights())?;
        let merged_layer = BaseLayer::linear(&merged.weight, merged.bias.as_ref())?;
        let diff = (merged_layer.forward(&xs)? - expected)?.abs()?.max_all()?;
        assert!(diff.to_scalar::<f32>()? < 1e-4);

        let restored = adapter.unmerge(&base, &merged)?;
        let diff = (restored.weight - base.weights().weight)?.abs()?.max_all()?;
        assert!(diff.to_scalar::<f32>()? < 1e-3);
        Ok(())
    }

    #[test]
    fn test_glora_path_validation() {
        let config = GLoraConfig {
            eval_config: Some(GLoraPath {
                C: Support::Constant,
                ..path()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
