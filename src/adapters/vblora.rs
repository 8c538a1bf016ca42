//! VB-LoRA (Vector Bank LoRA) implementation.
//!
//! Every layer composes its low-rank factors from a single bank of small
//! vectors shared by the whole adapter. Each sub-vector of a factor is a
//! softmax-weighted mixture of the top-k bank vectors picked by learned
//! logits.
//!
//! Reference: <https://arxiv.org/abs/2405.15179>

use std::any::Any;

use candle_core::{DType, Device, Module as _, Tensor, D};
use candle_nn::Linear;
use serde::{Deserialize, Serialize};

use crate::adapters::{check_probability, check_rank, dropout, ensure_kind, normal, SharedParams};
use crate::config::{BaseAdapterConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::nn::{BaseKind, BaseLayer, Param};
use crate::traits::{Adapter, AdapterConfig};

/// Configuration for VB-LoRA adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VbLoraConfig {
    /// Rank of the composed factors.
    #[serde(default = "default_r")]
    pub r: usize,

    /// Number of vectors in the bank.
    #[serde(default = "default_bank_size")]
    pub num_vectors: usize,

    /// Length of each bank vector; must divide the layer dimensions.
    #[serde(default = "default_bank_size")]
    pub vector_length: usize,

    /// Number of bank vectors mixed per sub-vector.
    #[serde(default = "default_topk")]
    pub topk: usize,

    /// Bank entries start uniform in `[-bound, bound]`.
    #[serde(default = "default_bank_bound")]
    pub init_vector_bank_bound: f64,

    /// Standard deviation of the initial logits.
    #[serde(default = "default_logits_std")]
    pub init_logits_std: f64,

    /// Dropout probability applied to the delta-path input.
    #[serde(default, alias = "vblora_dropout")]
    pub dropout: f64,

    /// Target selection.
    #[serde(flatten)]
    pub base: BaseAdapterConfig,
}

fn default_r() -> usize {
    4
}

fn default_bank_size() -> usize {
    256
}

fn default_topk() -> usize {
    2
}

fn default_bank_bound() -> f64 {
    0.02
}

fn default_logits_std() -> f64 {
    0.1
}

impl Default for VbLoraConfig {
    fn default() -> Self {
        Self {
            r: default_r(),
            num_vectors: default_bank_size(),
            vector_length: default_bank_size(),
            topk: default_topk(),
            init_vector_bank_bound: default_bank_bound(),
            init_logits_std: default_logits_std(),
            dropout: 0.0,
            base: BaseAdapterConfig::default(),
        }
    }
}

impl AdapterConfig for VbLoraConfig {
    fn validate(&self) -> Result<()> {
        check_rank(self.r)?;
        if self.vector_length == 0 || self.num_vectors == 0 {
            return Err(PeftError::InvalidConfig(
                "vector_length and num_vectors must be > 0".into(),
            ));
        }
        if self.topk == 0 || self.topk > self.num_vectors {
            return Err(PeftError::InvalidConfig(format!(
                "topk must be in [1, num_vectors={}], got {}",
                self.num_vectors, self.topk
            )));
        }
        check_probability("dropout", self.dropout)
    }
}

/// Create the trainable vector bank of one adapter name.
///
/// # Errors
/// Returns error if tensor creation fails.
#[allow(clippy::cast_possible_truncation)]
pub fn vector_bank(config: &VbLoraConfig, device: &Device, dtype: DType) -> Result<SharedParams> {
    let bound = config.init_vector_bank_bound as f32;
    let bank = Tensor::rand(-bound, bound, (config.num_vectors, config.vector_length), device)?
        .to_dtype(dtype)?;
    Ok(SharedParams::VectorBank {
        bank: Param::new(&bank)?,
    })
}

/// VB-LoRA selection logits for one layer.
///
/// - `vblora_logits_A`: `[r, in / len, num_vectors]`
/// - `vblora_logits_B`: `[out / len, r, num_vectors]`
#[derive(Debug)]
pub struct VbLoraAdapter {
    bank: Param,
    logits_a: Param,
    logits_b: Param,
    topk: usize,
    dropout: f64,
}

impl VbLoraAdapter {
    /// Create a new VB-LoRA adapter on `base` drawing from the `shared` bank.
    ///
    /// # Errors
    /// Returns error if the bank is missing or was built for another vector
    /// length, or the layer dimensions are not divisible by it.
    pub fn new(config: &VbLoraConfig, base: &BaseLayer, shared: Option<&SharedParams>) -> Result<Self> {
        config.validate()?;
        ensure_kind("VB-LoRA", base, &[BaseKind::Linear])?;
        let Some(SharedParams::VectorBank { bank }) = shared else {
            return Err(PeftError::InvalidConfig(
                "VB-LoRA adapters need the shared vector bank".into(),
            ));
        };
        let (num_vectors, len) = (bank.dims()[0], bank.dims()[1]);
        if len != config.vector_length || num_vectors != config.num_vectors {
            return Err(PeftError::InvalidConfig(format!(
                "vector bank is [{num_vectors}, {len}] but the config asks for [{}, {}]",
                config.num_vectors, config.vector_length
            )));
        }
        let (in_features, out_features) = (base.in_features(), base.out_features());
        if in_features % len != 0 || out_features % len != 0 {
            return Err(PeftError::InvalidConfig(format!(
                "in_features ({in_features}) and out_features ({out_features}) must be \
                 divisible by vector_length ({len})"
            )));
        }
        let std = config.init_logits_std;
        Ok(Self {
            bank: bank.clone(),
            logits_a: Param::new(&normal((config.r, in_features / len, num_vectors), std, base)?)?,
            logits_b: Param::new(&normal((out_features / len, config.r, num_vectors), std, base)?)?,
            topk: config.topk,
            dropout: config.dropout,
        })
    }

    /// Softmax mixture of the top-k bank vectors: `[.., nv] -> [.., len]`.
    fn mixture(&self, logits: &Tensor) -> Result<Tensor> {
        let bank = self.bank.value();
        let len = bank.dim(1)?;
        let indices = logits
            .detach()
            .contiguous()?
            .arg_sort_last_dim(false)?
            .narrow(D::Minus1, 0, self.topk)?
            .contiguous()?;
        let weights = candle_nn::ops::softmax(&logits.gather(&indices, D::Minus1)?, D::Minus1)?;
        let mut shape = indices.dims().to_vec();
        let vectors = bank.index_select(&indices.flatten_all()?, 0)?;
        shape.push(len);
        let vectors = vectors.reshape(shape)?;
        Ok(weights.unsqueeze(D::Minus1)?.broadcast_mul(&vectors)?.sum(D::Minus2)?)
    }

    /// Composed factors `A [r, in]` and `B [out, r]`.
    fn factors(&self) -> Result<(Tensor, Tensor)> {
        let logits_a = self.logits_a.value();
        let logits_b = self.logits_b.value();
        let r = logits_a.dim(0)?;
        let a = self.mixture(&logits_a)?.reshape((r, ()))?;
        let b = self
            .mixture(&logits_b)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape(((), r))?;
        Ok((a, b))
    }
}

impl Adapter for VbLoraAdapter {
    fn peft_type(&self) -> PeftType {
        PeftType::VbLora
    }

    fn forward(
        &self,
        input: &Tensor,
        _base_output: &Tensor,
        _base: &BaseLayer,
        train: bool,
    ) -> Result<Tensor> {
        let (a, b) = self.factors()?;
        let xs = dropout(input, self.dropout, train)?;
        let after_a = Linear::new(a, None).forward(&xs)?;
        Ok(Linear::new(b, None).forward(&after_a)?)
    }

    fn delta_weight(&self, _base: &BaseLayer) -> Result<Tensor> {
        let (a, b) = self.factors()?;
        Ok(b.matmul(&a)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn parameters(&self) -> Vec<(&'static str, &Param)> {
        vec![
            ("vblora_logits_A", &self.logits_a),
            ("vblora_logits_B", &self.logits_b),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Param)> {
        vec![
            ("vblora_logits_A", &mut self.logits_a),
            ("vblora_logits_B", &mut self.logits_b),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> VbLoraConfig {
        VbLoraConfig {
            vector_length: 2,
            num_vectors: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_vblora_logit_shapes() -> Result<()> {
        let device = Device::Cpu;
        let config = small_config();
        let bank = vector_bank(&config, &device, DType::F32)?;
        let base = BaseLayer::linear(&Tensor::randn(0f32, 1.0, (20, 10), &device)?, None)?;
        let adapter = VbLoraAdapter::new(&config, &base, Some(&bank))?;
        assert_eq!(adapter.logits_a.dims(), &[config.r, 5, 10]);
        assert_eq!(adapter.logits_b.dims(), &[10, config.r, 10]);
        let delta = adapter.delta_weight(&base)?;
        assert_eq!(delta.dims(), &[20, 10]);
        Ok(())
    }

    #[test]
    fn test_vblora_forward_matches_delta() -> Result<()> {
        let device = Device::Cpu;
        let config = small_config();
        let bank = vector_bank(&config, &device, DType::F32)?;
        let base = BaseLayer::linear(&Tensor::randn(0f32, 1.0, (4, 6), &device)?, None)?;
        let adapter = VbLoraAdapter::new(&config, &base, Some(&bank))?;
        let xs = Tensor::randn(0f32, 1.0, (3, 6), &device)?;
        let out = adapter.forward(&xs, &xs, &base, false)?;
        let expected = xs.matmul(&adapter.delta_weight(&base)?.t()?)?;
        let diff = (out - expected)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_vblora_shares_bank_storage() -> Result<()> {
        let device = Device::Cpu;
        let config = small_config();
        let bank = vector_bank(&config, &device, DType::F32)?;
        let base = BaseLayer::linear(&Tensor::randn(0f32, 1.0, (4, 4), &device)?, None)?;
        let first = VbLoraAdapter::new(&config, &base, Some(&bank))?;
        let second = VbLoraAdapter::new(&config, &base, Some(&bank))?;
        first.bank.set(&Tensor::zeros((10, 2), DType::F32, &device)?)?;
        assert_eq!(second.delta_weight(&base)?.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_vblora_dimension_checks() -> Result<()> {
        let device = Device::Cpu;
        let config = small_config();
        let bank = vector_bank(&config, &device, DType::F32)?;
        let odd = BaseLayer::linear(&Tensor::zeros((4, 5), DType::F32, &device)?, None)?;
        assert!(VbLoraAdapter::new(&config, &odd, Some(&bank)).is_err());

        let other = VbLoraConfig {
            vector_length: 4,
            ..small_config()
        };
        let base = BaseLayer::linear(&Tensor::zeros((8, 8), DType::F32, &device)?, None)?;
        assert!(VbLoraAdapter::new(&other, &base, Some(&bank)).is_err());
        Ok(())
    }
}
