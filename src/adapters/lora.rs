//! LoRA (Low-Rank Adaptation) implementation.
//!
//! LoRA reduces the number of trainable parameters by decomposing weight updates
//! into low-rank matrices: `ΔW = BA` where `B ∈ R^{d×r}` and `A ∈ R^{r×k}`.
//!
//! Reference: <https://arxiv.org/abs/2106.09685>

use std::any::Any;

use candle_core::{Module as _, Tensor};
use candle_nn::{Embedding, Linear};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::adapters::{
    check_probability, check_rank, dropout, ensure_kind, kaiming_uniform, normal, zeros,
    BuildContext, BuiltAdapter,
};
use crate::config::{BaseAdapterConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::nn::{BaseKind, BaseLayer, Param};
use crate::traits::{Adapter, AdapterConfig};

/// Configuration for LoRA adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition.
    pub r: usize,

    /// Scaling numerator; the delta is scaled by `alpha / r`.
    #[serde(alias = "lora_alpha")]
    pub alpha: usize,

    /// Dropout probability applied to the input of the LoRA path.
    #[serde(default, alias = "lora_dropout")]
    pub dropout: f64,

    /// Scale by `alpha / sqrt(r)` instead of `alpha / r`.
    #[serde(default)]
    pub use_rslora: bool,

    /// Initialization of the factor matrices.
    #[serde(default)]
    pub init_lora_weights: LoraInitialization,

    /// Target selection.
    #[serde(flatten)]
    pub base: BaseAdapterConfig,
}

/// Initialization strategy for LoRA weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoraInitialization {
    /// Standard: A ~ U(-1/√k, 1/√k), B = 0
    #[default]
    Standard,
    /// A ~ N(0, 1/r²), B = 0
    Gaussian,
    /// Principal singular vectors of the base weight; the base keeps the residual
    Pissa,
    /// Both factors random, so the adapter is not an identity at creation
    Random,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 8,
            alpha: 16,
            dropout: 0.0,
            use_rslora: false,
            init_lora_weights: LoraInitialization::Standard,
            base: BaseAdapterConfig::default(),
        }
    }
}

impl LoraConfig {
    /// Rank-`r` config targeting the given modules.
    pub fn new<I, S>(r: usize, alpha: usize, target_modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            r,
            alpha,
            base: BaseAdapterConfig::targeting(target_modules),
            ..Self::default()
        }
    }

    /// Scale applied to `B·A`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling(&self) -> f64 {
        if self.use_rslora {
            self.alpha as f64 / (self.r as f64).sqrt()
        } else {
            self.alpha as f64 / self.r as f64
        }
    }
}

impl AdapterConfig for LoraConfig {
    fn validate(&self) -> Result<()> {
        check_rank(self.r)?;
        if self.alpha == 0 {
            return Err(PeftError::InvalidConfig("alpha must be > 0".into()));
        }
        check_probability("dropout", self.dropout)
    }
}

/// Low-rank factors of one LoRA adapter on one layer.
///
/// Computes: `delta = (dropout(x) @ A^T @ B^T) * scaling`
#[derive(Debug)]
pub struct LoraAdapter {
    /// Down projection `[r, fan_in]`
    lora_a: Param,
    /// Up projection `[out, r]`
    lora_b: Param,
    scaling: f64,
    dropout: f64,
}

impl LoraAdapter {
    /// Create the adapter for `ctx.base`. For PiSSA the returned
    /// [`BuiltAdapter`] carries the residual base weight.
    ///
    /// # Errors
    /// Returns an error if the layer kind is unsupported, or PiSSA is
    /// requested with a rank above the weight's smaller dimension.
    pub fn build(config: &LoraConfig, ctx: BuildContext<'_>) -> Result<BuiltAdapter> {
        config.validate()?;
        let base = ctx.base;
        ensure_kind(
            "LoRA",
            base,
            &[BaseKind::Linear, BaseKind::Embedding, BaseKind::Conv2d],
        )?;
        let (r, fan_in, out) = (config.r, base.fan_in(), base.out_features());
        let scaling = config.scaling();

        let (a, b, base_weight) = match config.init_lora_weights {
            LoraInitialization::Standard => {
                (kaiming_uniform((r, fan_in), base)?, zeros((out, r), base)?, None)
            }
            #[allow(clippy::cast_precision_loss)]
            LoraInitialization::Gaussian => (
                normal((r, fan_in), 1.0 / r as f64, base)?,
                zeros((out, r), base)?,
                None,
            ),
            LoraInitialization::Random => (
                kaiming_uniform((r, fan_in), base)?,
                kaiming_uniform((out, r), base)?,
                None,
            ),
            LoraInitialization::Pissa => {
                ensure_kind("PiSSA initialization", base, &[BaseKind::Linear])?;
                let (a, b, residual) = pissa_init(base, r, scaling)?;
                (a, b, Some(residual))
            }
        };

        Ok(BuiltAdapter {
            adapter: Box::new(Self::from_factors(&a, &b, scaling, config.dropout)?),
            base_weight,
        })
    }

    /// Adapter from explicit factors.
    ///
    /// # Errors
    /// Returns an error if the factor ranks disagree.
    pub fn from_factors(a: &Tensor, b: &Tensor, scaling: f64, dropout: f64) -> Result<Self> {
        let (r, _) = a.dims2()?;
        let (_, r_b) = b.dims2()?;
        if r != r_b {
            return Err(PeftError::DimensionMismatch {
                message: format!("lora_A has rank {r} but lora_B has rank {r_b}"),
            });
        }
        Ok(Self {
            lora_a: Param::new(a)?,
            lora_b: Param::new(b)?,
            scaling,
            dropout,
        })
    }

    /// Get the scaling factor.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Get the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.lora_a.dims()[0]
    }

    /// Down projection `[r, fan_in]`.
    #[must_use]
    pub fn lora_a(&self) -> &Param {
        &self.lora_a
    }

    /// Up projection `[out, r]`.
    #[must_use]
    pub fn lora_b(&self) -> &Param {
        &self.lora_b
    }
}

impl Adapter for LoraAdapter {
    fn peft_type(&self) -> PeftType {
        PeftType::Lora
    }

    fn forward(
        &self,
        input: &Tensor,
        _base_output: &Tensor,
        base: &BaseLayer,
        train: bool,
    ) -> Result<Tensor> {
        let a = self.lora_a.value();
        let b = self.lora_b.value();
        let xs = dropout(input, self.dropout, train)?;
        let out = match base {
            BaseLayer::Linear { .. } => {
                let after_a = Linear::new(a, None).forward(&xs)?;
                Linear::new(b, None).forward(&after_a)?
            }
            BaseLayer::Embedding { .. } => {
                let r = a.dim(0)?;
                let after_a = Embedding::new(a.t()?.contiguous()?, r).forward(&xs)?;
                Linear::new(b, None).forward(&after_a)?
            }
            BaseLayer::Conv2d { conv, .. } => {
                let (out_channels, r) = b.dims2()?;
                let (in_channels, (kh, kw)) = (base.in_features(), base.kernel_size().unwrap_or((1, 1)));
                let kernel_a = a.reshape((r, in_channels, kh, kw))?;
                let after_a = xs.conv2d(&kernel_a, conv.padding, conv.stride, conv.dilation, 1)?;
                after_a.conv2d(&b.reshape((out_channels, r, 1, 1))?, 0, 1, 1, 1)?
            }
        };
        Ok((out * self.scaling)?)
    }

    fn delta_weight(&self, base: &BaseLayer) -> Result<Tensor> {
        let delta = (self.lora_b.value().matmul(&self.lora_a.value())? * self.scaling)?;
        base.to_weight_layout(&delta)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn parameters(&self) -> Vec<(&'static str, &Param)> {
        vec![("lora_A", &self.lora_a), ("lora_B", &self.lora_b)]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Param)> {
        vec![("lora_A", &mut self.lora_a), ("lora_B", &mut self.lora_b)]
    }
}

/// PiSSA: take the top-`r` singular triplets of `W` as the adapter and leave
/// the residual in the base, so that `W_res + scaling·B·A == W`.
///
/// Returns `(A, B, W_res)`.
#[allow(clippy::cast_possible_truncation)]
fn pissa_init(base: &BaseLayer, r: usize, scaling: f64) -> Result<(Tensor, Tensor, Tensor)> {
    let weight = base.weight().value();
    let (out, fan_in) = weight.dims2()?;
    if r > out.min(fan_in) {
        return Err(PeftError::InvalidConfig(format!(
            "PiSSA rank {r} exceeds the smaller weight dimension {}",
            out.min(fan_in)
        )));
    }
    let data = weight
        .to_dtype(candle_core::DType::F64)?
        .flatten_all()?
        .to_vec1::<f64>()?;
    let svd = DMatrix::from_row_slice(out, fan_in, &data).svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u.as_ref(), svd.v_t.as_ref()) else {
        return Err(PeftError::InvalidConfig(
            "SVD of the base weight did not converge".into(),
        ));
    };
    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&i, &j| svd.singular_values[j].total_cmp(&svd.singular_values[i]));

    let mut a = Vec::with_capacity(r * fan_in);
    let mut b = vec![0f64; out * r];
    for (k, &idx) in order.iter().take(r).enumerate() {
        let s = (svd.singular_values[idx] / scaling).sqrt();
        a.extend(v_t.row(idx).iter().map(|v| v * s));
        for row in 0..out {
            b[row * r + k] = u[(row, idx)] * s;
        }
    }
    let device = weight.device();
    let dtype = weight.dtype();
    let a = Tensor::from_vec(a, (r, fan_in), device)?.to_dtype(dtype)?;
    let b = Tensor::from_vec(b, (out, r), device)?.to_dtype(dtype)?;
    let residual = (&weight - (b.matmul(&a)? * scaling)?)?;
    Ok((a, b, residual))
}
