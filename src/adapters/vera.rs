//! `VeRA` (Vector-based Random Matrix Adaptation) implementation.
//!
//! `VeRA` uses a single pair of frozen random matrices shared by every layer
//! and learns only small per-layer scaling vectors, making it far more
//! parameter-efficient than `LoRA`.
//!
//! Reference: <https://arxiv.org/abs/2310.11454>

use std::any::Any;

use candle_core::{DType, Device, Module as _, Tensor};
use candle_nn::{Embedding, Linear};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::adapters::{check_probability, check_rank, dropout, ensure_kind, full, zeros, SharedParams};
use crate::config::{BaseAdapterConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::nn::{BaseKind, BaseLayer, Param};
use crate::traits::{Adapter, AdapterConfig};

/// Configuration for `VeRA` adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VeraConfig {
    /// Rank of the shared random projections.
    #[serde(default = "default_r")]
    pub r: usize,

    /// Seed for generating the shared projections.
    #[serde(default)]
    pub projection_prng_key: u64,

    /// Store the shared projections in the checkpoint.
    #[serde(default = "default_true")]
    pub save_projection: bool,

    /// Dropout probability applied to the delta-path input.
    #[serde(default)]
    pub vera_dropout: f64,

    /// Initial value of the `λd` vector.
    #[serde(default = "default_d_initial")]
    pub d_initial: f64,

    /// Target selection.
    #[serde(flatten)]
    pub base: BaseAdapterConfig,
}

fn default_r() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_d_initial() -> f64 {
    0.1
}

impl Default for VeraConfig {
    fn default() -> Self {
        Self {
            r: default_r(),
            projection_prng_key: 0,
            save_projection: true,
            vera_dropout: 0.0,
            d_initial: default_d_initial(),
            base: BaseAdapterConfig::default(),
        }
    }
}

impl AdapterConfig for VeraConfig {
    fn validate(&self) -> Result<()> {
        check_rank(self.r)?;
        check_probability("vera_dropout", self.vera_dropout)
    }
}

/// Generate the shared frozen projections for one adapter name.
///
/// Both matrices are Kaiming-uniform, drawn from a generator seeded with
/// `projection_prng_key`, so the same config always yields the same bank.
///
/// # Errors
/// Returns error if tensor creation fails.
pub fn projections(
    config: &VeraConfig,
    max_in: usize,
    max_out: usize,
    device: &Device,
    dtype: DType,
) -> Result<SharedParams> {
    let mut rng = StdRng::seed_from_u64(config.projection_prng_key);
    let vera_a = seeded_kaiming_uniform(&mut rng, (config.r, max_in), device, dtype)?;
    let vera_b = seeded_kaiming_uniform(&mut rng, (max_out, config.r), device, dtype)?;
    Ok(SharedParams::VeraProjection {
        vera_a: Param::frozen(&vera_a)?,
        vera_b: Param::frozen(&vera_b)?,
    })
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn seeded_kaiming_uniform(
    rng: &mut StdRng,
    (rows, cols): (usize, usize),
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let bound = (1.0 / (cols.max(1) as f64).sqrt()) as f32;
    let data: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-bound..bound)).collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?.to_dtype(dtype)?)
}

/// `VeRA` scaling vectors for one layer, plus handles on the shared bank.
///
/// Computes: `ΔW = (λb · B[:out]) @ (λd · A[:, :in])`
#[derive(Debug)]
pub struct VeraAdapter {
    /// Shared `[r, max_in]`, frozen
    vera_a: Param,
    /// Shared `[max_out, r]`, frozen
    vera_b: Param,
    /// `[out_features]`
    vera_lambda_b: Param,
    /// `[r]`
    vera_lambda_d: Param,
    dropout: f64,
}

impl VeraAdapter {
    /// Create a new `VeRA` adapter on `base` backed by the `shared` bank.
    ///
    /// # Errors
    /// Returns error if the bank is missing, its rank differs from the
    /// config, or it is too small for this layer.
    pub fn new(config: &VeraConfig, base: &BaseLayer, shared: Option<&SharedParams>) -> Result<Self> {
        config.validate()?;
        ensure_kind("VeRA", base, &[BaseKind::Linear, BaseKind::Embedding])?;
        let Some(SharedParams::VeraProjection { vera_a, vera_b }) = shared else {
            return Err(PeftError::InvalidConfig(
                "VeRA adapters need the shared vera_A/vera_B projections".into(),
            ));
        };
        let (bank_r, max_in) = (vera_a.dims()[0], vera_a.dims()[1]);
        let max_out = vera_b.dims()[0];
        if bank_r != config.r || vera_b.dims()[1] != config.r {
            return Err(PeftError::InvalidConfig(format!(
                "multiple VeRA adapters with different ranks share one projection bank: \
                 bank has r={bank_r}, config has r={}",
                config.r
            )));
        }
        if base.fan_in() > max_in || base.out_features() > max_out {
            return Err(PeftError::DimensionMismatch {
                message: format!(
                    "layer [{}, {}] does not fit the shared projections [{max_out}, {max_in}]",
                    base.out_features(),
                    base.fan_in()
                ),
            });
        }
        Ok(Self {
            vera_a: vera_a.clone(),
            vera_b: vera_b.clone(),
            vera_lambda_b: Param::new(&zeros(base.out_features(), base)?)?,
            vera_lambda_d: Param::new(&full(config.d_initial, config.r, base)?)?,
            dropout: config.vera_dropout,
        })
    }

    fn sliced(&self, base: &BaseLayer) -> Result<(Tensor, Tensor)> {
        let a = self.vera_a.value().narrow(1, 0, base.fan_in())?;
        let b = self.vera_b.value().narrow(0, 0, base.out_features())?;
        Ok((a, b))
    }
}

impl Adapter for VeraAdapter {
    fn peft_type(&self) -> PeftType {
        PeftType::Vera
    }

    fn forward(
        &self,
        input: &Tensor,
        _base_output: &Tensor,
        base: &BaseLayer,
        train: bool,
    ) -> Result<Tensor> {
        let (a, b) = self.sliced(base)?;
        let lambda_d = self.vera_lambda_d.value();
        let lambda_b = self.vera_lambda_b.value();
        let after_a = match base {
            BaseLayer::Embedding { .. } => {
                let r = a.dim(0)?;
                Embedding::new(a.t()?.contiguous()?, r).forward(input)?
            }
            _ => {
                let xs = dropout(input, self.dropout, train)?;
                Linear::new(a.contiguous()?, None).forward(&xs)?
            }
        };
        let after_a = after_a.broadcast_mul(&lambda_d)?;
        let after_b = Linear::new(b.contiguous()?, None).forward(&after_a)?;
        Ok(after_b.broadcast_mul(&lambda_b)?)
    }

    fn delta_weight(&self, base: &BaseLayer) -> Result<Tensor> {
        let (a, b) = self.sliced(base)?;
        let r = a.dim(0)?;
        let scaled_b = b.broadcast_mul(&self.vera_lambda_b.value().unsqueeze(1)?)?;
        let scaled_a = a.broadcast_mul(&self.vera_lambda_d.value().reshape((r, 1))?)?;
        base.to_weight_layout(&scaled_b.matmul(&scaled_a)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn parameters(&self) -> Vec<(&'static str, &Param)> {
        vec![
            ("vera_lambda_b", &self.vera_lambda_b),
            ("vera_lambda_d", &self.vera_lambda_d),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Param)> {
        vec![
            ("vera_lambda_b", &mut self.vera_lambda_b),
            ("vera_lambda_d", &mut self.vera_lambda_d),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank(config: &VeraConfig, max_in: usize, max_out: usize) -> Result<SharedParams> {
        projections(config, max_in, max_out, &Device::Cpu, DType::F32)
    }

    #[test]
    fn test_vera_config_default() {
        let config = VeraConfig::default();
        assert_eq!(config.r, 256);
        assert!(config.save_projection);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_projections_are_seeded() -> Result<()> {
        let config = VeraConfig {
            r: 4,
            ..Default::default()
        };
        let first = bank(&config, 8, 6)?;
        let second = bank(&config, 8, 6)?;
        let (a1, a2) = (first.parameters()[0].1.value(), second.parameters()[0].1.value());
        assert_eq!(a1.to_vec2::<f32>()?, a2.to_vec2::<f32>()?);
        assert!(first.parameters().iter().all(|(_, p)| !p.requires_grad()));
        Ok(())
    }

    #[test]
    fn test_vera_zero_init_and_params() -> Result<()> {
        let config = VeraConfig {
            r: 4,
            ..Default::default()
        };
        let shared = bank(&config, 16, 16)?;
        let base = BaseLayer::linear(&Tensor::randn(0f32, 1.0, (12, 16), &Device::Cpu)?, None)?;
        let adapter = VeraAdapter::new(&config, &base, Some(&shared))?;
        // out + r trainable values
        assert_eq!(adapter.num_parameters(), 12 + 4);
        let delta = adapter.delta_weight(&base)?;
        assert_eq!(delta.dims(), &[12, 16]);
        assert_eq!(delta.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_vera_forward_matches_delta() -> Result<()> {
        let device = Device::Cpu;
        let config = VeraConfig {
            r: 4,
            ..Default::default()
        };
        let shared = bank(&config, 8, 8)?;
        let base = BaseLayer::linear(&Tensor::randn(0f32, 1.0, (8, 8), &device)?, None)?;
        let adapter = VeraAdapter::new(&config, &base, Some(&shared))?;
        adapter.vera_lambda_b.set(&Tensor::ones(8, DType::F32, &device)?)?;
        let xs = Tensor::randn(0f32, 1.0, (3, 8), &device)?;
        let out = adapter.forward(&xs, &xs, &base, false)?;
        let expected = xs.matmul(&adapter.delta_weight(&base)?.t()?)?;
        let diff = (out - expected)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_vera_rank_mismatch() -> Result<()> {
        let shared = bank(
            &VeraConfig {
                r: 4,
                ..Default::default()
            },
            8,
            8,
        )?;
        let base = BaseLayer::linear(&Tensor::zeros((8, 8), DType::F32, &Device::Cpu)?, None)?;
        let other = VeraConfig {
            r: 2,
            ..Default::default()
        };
        assert!(VeraAdapter::new(&other, &base, Some(&shared)).is_err());
        assert!(VeraAdapter::new(&other, &base, None).is_err());
        Ok(())
    }
}
