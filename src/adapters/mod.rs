//! PEFT adapter implementations.
//!
//! Each weight-injecting family provides a config and an [`Adapter`]
//! implementation holding the parameters one adapter name attaches to one
//! base layer. Prompt-based conditioning modules live alongside them but are
//! standalone: they produce embeddings rather than wrapping layers.

pub mod adalora;
pub mod glora;
pub mod ia3;
pub mod loha;
pub mod lokr;
pub mod lora;
pub mod prefix_tuning;
pub mod prompt_tuning;
pub mod vblora;
pub mod vera;

use candle_core::{DType, Device, Tensor};

use crate::config::PeftConfig;
use crate::error::{PeftError, Result};
use crate::nn::{BaseKind, BaseLayer, Param};
use crate::traits::Adapter;

/// Parameters shared by every layer of one adapter name.
#[derive(Debug, Clone)]
pub enum SharedParams {
    /// Frozen random projections of `VeRA`
    VeraProjection {
        /// `[r, max_in]`
        vera_a: Param,
        /// `[max_out, r]`
        vera_b: Param,
    },
    /// Trainable vector bank of VB-LoRA, `[num_vectors, vector_length]`
    VectorBank {
        /// The bank
        bank: Param,
    },
}

impl SharedParams {
    /// Parameters by local name.
    #[must_use]
    pub fn parameters(&self) -> Vec<(&'static str, &Param)> {
        match self {
            Self::VeraProjection { vera_a, vera_b } => vec![("vera_A", vera_a), ("vera_B", vera_b)],
            Self::VectorBank { bank } => vec![("vblora_vector_bank", bank)],
        }
    }

    /// Mutable parameters by local name.
    pub fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Param)> {
        match self {
            Self::VeraProjection { vera_a, vera_b } => {
                vec![("vera_A", vera_a), ("vera_B", vera_b)]
            }
            Self::VectorBank { bank } => vec![("vblora_vector_bank", bank)],
        }
    }

    /// Build the shared parameters an adapter config needs, sized for all
    /// `targets` it will be attached to.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor creation fails.
    pub fn for_config(
        config: &PeftConfig,
        targets: &[&BaseLayer],
        device: &Device,
        dtype: DType,
    ) -> Result<Option<Self>> {
        match config {
            PeftConfig::Vera(c) => {
                let max_in = targets.iter().map(|b| b.fan_in()).max().unwrap_or(0);
                let max_out = targets.iter().map(|b| b.out_features()).max().unwrap_or(0);
                Ok(Some(vera::projections(c, max_in, max_out, device, dtype)?))
            }
            PeftConfig::VbLora(c) => Ok(Some(vblora::vector_bank(c, device, dtype)?)),
            _ => Ok(None),
        }
    }
}

/// Everything an adapter constructor may look at.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    /// Dotted path of the wrapped module
    pub path: &'a str,
    /// The wrapped layer
    pub base: &'a BaseLayer,
    /// Shared parameters of this adapter name
    pub shared: Option<&'a SharedParams>,
}

/// Freshly created adapter plus an optional replacement base weight
/// (decomposition-based initializations move weight out of the base).
#[derive(Debug)]
pub struct BuiltAdapter {
    /// The new adapter
    pub adapter: Box<dyn Adapter>,
    /// New base weight, in native layout
    pub base_weight: Option<Tensor>,
}

impl BuiltAdapter {
    fn plain(adapter: impl Adapter + 'static) -> Self {
        Self {
            adapter: Box::new(adapter),
            base_weight: None,
        }
    }
}

/// Construct the adapter `config` describes for one base layer.
///
/// # Errors
///
/// Returns an error if the base layer kind is unsupported by the family or
/// the dimensions are incompatible.
pub fn build_adapter(config: &PeftConfig, ctx: BuildContext<'_>) -> Result<BuiltAdapter> {
    match config {
        PeftConfig::Lora(c) => lora::LoraAdapter::build(c, ctx),
        PeftConfig::LoHa(c) => Ok(BuiltAdapter::plain(loha::LoHaAdapter::new(c, ctx.base)?)),
        PeftConfig::LoKr(c) => Ok(BuiltAdapter::plain(lokr::LoKrAdapter::new(c, ctx.base)?)),
        PeftConfig::AdaLora(c) => Ok(BuiltAdapter::plain(adalora::AdaLoraAdapter::new(c, ctx.base)?)),
        PeftConfig::Ia3(c) => Ok(BuiltAdapter::plain(ia3::Ia3Adapter::new(c, ctx.base, ctx.path)?)),
        PeftConfig::Vera(c) => Ok(BuiltAdapter::plain(vera::VeraAdapter::new(c, ctx.base, ctx.shared)?)),
        PeftConfig::VbLora(c) => Ok(BuiltAdapter::plain(vblora::VbLoraAdapter::new(c, ctx.base, ctx.shared)?)),
        PeftConfig::GLora(c) => Ok(BuiltAdapter::plain(glora::GLoraAdapter::new(c, ctx.base)?)),
    }
}

/// Fail unless `base` is one of the `supported` kinds.
pub(crate) fn ensure_kind(family: &str, base: &BaseLayer, supported: &[BaseKind]) -> Result<()> {
    if supported.contains(&base.kind()) {
        Ok(())
    } else {
        Err(PeftError::InvalidConfig(format!(
            "{family} does not support {} layers, supported kinds are {supported:?}",
            base.kind()
        )))
    }
}

/// Uniform init in `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`, the bound of
/// Kaiming-uniform with `a = sqrt(5)`.
pub(crate) fn kaiming_uniform(shape: (usize, usize), base: &BaseLayer) -> Result<Tensor> {
    let bound = 1.0 / (shape.1.max(1) as f64).sqrt();
    let device = base.weight().var().device();
    let t = Tensor::rand(-bound as f32, bound as f32, shape, device)?;
    Ok(t.to_dtype(base.weight().var().dtype())?)
}

/// Normal init with the base layer's dtype and device.
pub(crate) fn normal(shape: impl Into<candle_core::Shape>, std: f64, base: &BaseLayer) -> Result<Tensor> {
    let device = base.weight().var().device();
    let t = Tensor::randn(0f32, std as f32, shape, device)?;
    Ok(t.to_dtype(base.weight().var().dtype())?)
}

/// Zeros with the base layer's dtype and device.
pub(crate) fn zeros(shape: impl Into<candle_core::Shape>, base: &BaseLayer) -> Result<Tensor> {
    let var = base.weight().var();
    Ok(Tensor::zeros(shape, var.dtype(), var.device())?)
}

/// Constant fill with the base layer's dtype and device.
pub(crate) fn full(value: f64, shape: impl Into<candle_core::Shape>, base: &BaseLayer) -> Result<Tensor> {
    let var = base.weight().var();
    Ok((Tensor::ones(shape, var.dtype(), var.device())? * value)?)
}

/// Dropout on the delta-path input; identity at inference or `p == 0`.
pub(crate) fn dropout(xs: &Tensor, p: f64, train: bool) -> Result<Tensor> {
    if train && p > 0.0 && xs.dtype().is_float() {
        Ok(candle_nn::ops::dropout(xs, p as f32)?)
    } else {
        Ok(xs.clone())
    }
}

/// Check a rank against zero.
pub(crate) fn check_rank(r: usize) -> Result<()> {
    if r == 0 {
        Err(PeftError::InvalidConfig("rank must be > 0".into()))
    } else {
        Ok(())
    }
}

/// Check a probability lies in `[0, 1)`.
pub(crate) fn check_probability(name: &str, p: f64) -> Result<()> {
    if (0.0..1.0).contains(&p) {
        Ok(())
    } else {
        Err(PeftError::InvalidConfig(format!(
            "{name} must be in [0, 1), got {p}"
        )))
    }
}
