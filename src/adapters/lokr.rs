//! LoKr (Low-Rank Kronecker Product) implementation.
//!
//! LoKr expresses the weight update as a Kronecker product of a small
//! factor and a (possibly low-rank) larger factor: `ΔW = w1 ⊗ w2`.
//!
//! Reference: <https://arxiv.org/abs/2309.14859> (LyCORIS)

use std::any::Any;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::adapters::{check_probability, check_rank, ensure_kind, kaiming_uniform, zeros};
use crate::config::{BaseAdapterConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::nn::{BaseKind, BaseLayer, Param};
use crate::traits::{Adapter, AdapterConfig};

/// Configuration for LoKr adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoKrConfig {
    /// Rank for the decomposition (used for one factor).
    pub r: usize,

    /// Scaling factor.
    #[serde(alias = "lora_alpha")]
    pub alpha: usize,

    /// Factor dimension (splits the weight into factor x remaining).
    /// If None, uses automatic factorization.
    #[serde(default, alias = "decompose_factor")]
    pub factor: Option<usize>,

    /// Also decompose the first Kronecker factor into low-rank matrices.
    #[serde(default)]
    pub decompose_both: bool,

    /// Probability of skipping the whole adapter for a training step.
    #[serde(default)]
    pub module_dropout: f64,

    /// Target selection.
    #[serde(flatten)]
    pub base: BaseAdapterConfig,
}

impl Default for LoKrConfig {
    fn default() -> Self {
        Self {
            r: 8,
            alpha: 16,
            factor: None,
            decompose_both: false,
            module_dropout: 0.0,
            base: BaseAdapterConfig::default(),
        }
    }
}

impl AdapterConfig for LoKrConfig {
    fn validate(&self) -> Result<()> {
        check_rank(self.r)?;
        if self.alpha == 0 {
            return Err(PeftError::InvalidConfig("alpha must be > 0".into()));
        }
        if self.factor == Some(0) {
            return Err(PeftError::InvalidConfig("factor must be > 0".into()));
        }
        check_probability("module_dropout", self.module_dropout)
    }
}

/// Split `dimension` into `(m, n)` with `m <= n` and `m * n == dimension`.
///
/// With a `factor` dividing the dimension, that factor is used directly.
/// Otherwise the pair closest to a square with `m <= factor` is chosen.
#[must_use]
pub fn factorization(dimension: usize, factor: Option<usize>) -> (usize, usize) {
    if let Some(f) = factor.filter(|&f| f > 0 && dimension % f == 0) {
        let (m, n) = (f, dimension / f);
        return if m > n { (n, m) } else { (m, n) };
    }
    let limit = factor.unwrap_or(dimension);
    let (mut m, mut n) = (1, dimension);
    let length = m + n;
    while m < n {
        let mut new_m = m + 1;
        while dimension % new_m != 0 {
            new_m += 1;
        }
        let new_n = dimension / new_m;
        if new_m + new_n > length || new_m > limit {
            break;
        }
        m = new_m;
        n = new_n;
    }
    if m > n {
        (n, m)
    } else {
        (m, n)
    }
}

/// Kronecker product of two matrices: `[m, n] ⊗ [p, q] -> [m*p, n*q]`.
///
/// # Errors
///
/// Returns an error if either input is not 2-D.
pub fn kronecker(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (m, n) = a.dims2()?;
    let (p, q) = b.dims2()?;
    let prod = a
        .reshape((m, 1, n, 1))?
        .broadcast_mul(&b.reshape((1, p, 1, q))?)?;
    Ok(prod.reshape((m * p, n * q))?)
}

/// A Kronecker factor, either full or as a low-rank product.
#[derive(Debug)]
enum Factor {
    Full(Param),
    LowRank(Param, Param),
}

impl Factor {
    fn value(&self) -> Result<Tensor> {
        match self {
            Self::Full(w) => Ok(w.value()),
            Self::LowRank(a, b) => Ok(a.value().matmul(&b.value())?),
        }
    }
}

/// LoKr parameters for one layer.
///
/// - `lokr_w1` (or `lokr_w1_a @ lokr_w1_b`): first factor `[out_l, in_m]`
/// - `lokr_w2` (or `lokr_w2_a @ lokr_w2_b`): second factor `[out_k, in_n]`
#[derive(Debug)]
pub struct LoKrAdapter {
    w1: Factor,
    w2: Factor,
    /// Scaling factor = alpha / r
    scaling: f64,
    module_dropout: f64,
}

impl LoKrAdapter {
    /// Create a new LoKr adapter for `base`.
    ///
    /// The first factor starts at zero so the adapter is an identity.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails or the layer kind
    /// is not supported.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(config: &LoKrConfig, base: &BaseLayer) -> Result<Self> {
        config.validate()?;
        ensure_kind("LoKr", base, &[BaseKind::Linear, BaseKind::Conv2d])?;
        let r = config.r;
        let (in_m, in_n) = factorization(base.fan_in(), config.factor);
        let (out_l, out_k) = factorization(base.out_features(), config.factor);

        let w1 = if config.decompose_both && 2 * r < out_l.max(in_m) {
            Factor::LowRank(
                Param::new(&zeros((out_l, r), base)?)?,
                Param::new(&kaiming_uniform((r, in_m), base)?)?,
            )
        } else {
            Factor::Full(Param::new(&zeros((out_l, in_m), base)?)?)
        };
        let w2 = if 2 * r < out_k.max(in_n) {
            Factor::LowRank(
                Param::new(&kaiming_uniform((out_k, r), base)?)?,
                Param::new(&kaiming_uniform((r, in_n), base)?)?,
            )
        } else {
            Factor::Full(Param::new(&kaiming_uniform((out_k, in_n), base)?)?)
        };

        Ok(Self {
            w1,
            w2,
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
        let delta = kronecker(&self.w1.value()?, &self.w2.value()?)?;
        Ok((delta * self.scaling)?)
    }
}

impl Adapter for LoKrAdapter {
    fn peft_type(&self) -> PeftType {
        PeftType::LoKr
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
        let mut params = match &self.w1 {
            Factor::Full(w) => vec![("lokr_w1", w)],
            Factor::LowRank(a, b) => vec![("lokr_w1_a", a), ("lokr_w1_b", b)],
        };
        match &self.w2 {
            Factor::Full(w) => params.push(("lokr_w2", w)),
            Factor::LowRank(a, b) => params.extend([("lokr_w2_a", a), ("lokr_w2_b", b)]),
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Param)> {
        let mut params = match &mut self.w1 {
            Factor::Full(w) => vec![("lokr_w1", w)],
            Factor::LowRank(a, b) => vec![("lokr_w1_a", a), ("lokr_w1_b", b)],
        };
        match &mut self.w2 {
            Factor::Full(w) => params.push(("lokr_w2", w)),
            Factor::LowRank(a, b) => params.extend([("lokr_w2_a", a), ("lokr_w2_b", b)]),
        }
        params
    }
}
