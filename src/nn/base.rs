//! Wrappable base layers.
//!
//! These are the leaf operations an adapter can attach to. Each exposes its
//! feature dimensions without running a forward pass, can run an arbitrary
//! weight through its own operation (used for delta paths), and lets the
//! tuner read and overwrite its weight for merging.

use std::fmt;

use candle_core::{Module as _, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{PeftError, Result};
use crate::nn::Param;

/// Spatial settings of a 2-D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvParams {
    /// Zero padding on each side
    pub padding: usize,
    /// Stride
    pub stride: usize,
    /// Dilation
    pub dilation: usize,
}

impl Default for ConvParams {
    fn default() -> Self {
        Self {
            padding: 0,
            stride: 1,
            dilation: 1,
        }
    }
}

/// Kind of a [`BaseLayer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseKind {
    /// Fully connected layer
    Linear,
    /// Lookup table
    Embedding,
    /// 2-D convolution
    Conv2d,
}

impl fmt::Display for BaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "Linear"),
            Self::Embedding => write!(f, "Embedding"),
            Self::Conv2d => write!(f, "Conv2d"),
        }
    }
}

/// Snapshot of a layer's weight and bias.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    /// Weight in the layer's native layout
    pub weight: Tensor,
    /// Optional bias of shape `[out]`
    pub bias: Option<Tensor>,
}

/// A linear, embedding or convolution layer of the base network.
#[derive(Debug, Clone)]
pub enum BaseLayer {
    /// `y = x Wᵀ + b`, weight `[out, in]`
    Linear {
        /// Weight `[out_features, in_features]`
        weight: Param,
        /// Optional bias `[out_features]`
        bias: Option<Param>,
    },
    /// Row lookup, weight `[num_embeddings, embedding_dim]`
    Embedding {
        /// Embedding table
        weight: Param,
    },
    /// 2-D convolution, weight `[out, in, kh, kw]`
    Conv2d {
        /// Kernel
        weight: Param,
        /// Optional bias `[out_channels]`
        bias: Option<Param>,
        /// Padding, stride and dilation
        conv: ConvParams,
    },
}

impl BaseLayer {
    /// Linear layer from a `[out, in]` weight.
    ///
    /// # Errors
    ///
    /// Returns an error if the weight is not 2-D or the bias length differs.
    pub fn linear(weight: &Tensor, bias: Option<&Tensor>) -> Result<Self> {
        let (out_features, _) = weight.dims2()?;
        check_bias(bias, out_features)?;
        Ok(Self::Linear {
            weight: Param::new(weight)?,
            bias: bias.map(Param::new).transpose()?,
        })
    }

    /// Embedding layer from a `[num_embeddings, dim]` table.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is not 2-D.
    pub fn embedding(weight: &Tensor) -> Result<Self> {
        weight.dims2()?;
        Ok(Self::Embedding {
            weight: Param::new(weight)?,
        })
    }

    /// Convolution layer from a `[out, in, kh, kw]` kernel.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel is not 4-D or the bias length differs.
    pub fn conv2d(weight: &Tensor, bias: Option<&Tensor>, conv: ConvParams) -> Result<Self> {
        let (out_channels, _, _, _) = weight.dims4()?;
        check_bias(bias, out_channels)?;
        Ok(Self::Conv2d {
            weight: Param::new(weight)?,
            bias: bias.map(Param::new).transpose()?,
            conv,
        })
    }

    /// Layer kind.
    #[must_use]
    pub fn kind(&self) -> BaseKind {
        match self {
            Self::Linear { .. } => BaseKind::Linear,
            Self::Embedding { .. } => BaseKind::Embedding,
            Self::Conv2d { .. } => BaseKind::Conv2d,
        }
    }

    /// Weight parameter.
    #[must_use]
    pub fn weight(&self) -> &Param {
        match self {
            Self::Linear { weight, .. } | Self::Embedding { weight } | Self::Conv2d { weight, .. } => {
                weight
            }
        }
    }

    /// Bias parameter, if the layer has one.
    #[must_use]
    pub fn bias(&self) -> Option<&Param> {
        match self {
            Self::Linear { bias, .. } | Self::Conv2d { bias, .. } => bias.as_ref(),
            Self::Embedding { .. } => None,
        }
    }

    /// Input width: features, vocabulary size, or input channels.
    #[must_use]
    pub fn in_features(&self) -> usize {
        let dims = self.weight().dims();
        match self {
            Self::Linear { .. } | Self::Conv2d { .. } => dims[1],
            Self::Embedding { .. } => dims[0],
        }
    }

    /// Output width: features, embedding size, or output channels.
    #[must_use]
    pub fn out_features(&self) -> usize {
        let dims = self.weight().dims();
        match self {
            Self::Linear { .. } | Self::Conv2d { .. } => dims[0],
            Self::Embedding { .. } => dims[1],
        }
    }

    /// Kernel size of a convolution.
    #[must_use]
    pub fn kernel_size(&self) -> Option<(usize, usize)> {
        match self {
            Self::Conv2d { weight, .. } => {
                let dims = weight.dims();
                Some((dims[2], dims[3]))
            }
            _ => None,
        }
    }

    /// Padding, stride and dilation of a convolution.
    #[must_use]
    pub fn conv_params(&self) -> Option<ConvParams> {
        match self {
            Self::Conv2d { conv, .. } => Some(*conv),
            _ => None,
        }
    }

    /// Width of the flattened input side of a `[out, fan_in]` delta matrix.
    #[must_use]
    pub fn fan_in(&self) -> usize {
        match self.kernel_size() {
            Some((kh, kw)) => self.in_features() * kh * kw,
            None => self.in_features(),
        }
    }

    /// Output shape of [`BaseLayer::forward`] for an input of shape `xs`,
    /// computed without running the layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the input rank does not fit the layer.
    pub fn output_dims(&self, xs: &Tensor) -> Result<Vec<usize>> {
        let mut dims = xs.dims().to_vec();
        match self {
            Self::Linear { .. } => match dims.last_mut() {
                Some(last) => *last = self.out_features(),
                None => {
                    return Err(PeftError::DimensionMismatch {
                        message: "linear input must have at least one dimension".into(),
                    })
                }
            },
            Self::Embedding { .. } => dims.push(self.out_features()),
            Self::Conv2d { conv, .. } => {
                let (b, _, h, w) = xs.dims4()?;
                let (kh, kw) = self.kernel_size().unwrap_or((1, 1));
                let span = |size: usize, k: usize| {
                    (size + 2 * conv.padding).saturating_sub(conv.dilation * (k - 1) + 1) / conv.stride + 1
                };
                dims = vec![b, self.out_features(), span(h, kh), span(w, kw)];
            }
        }
        Ok(dims)
    }

    /// Base forward pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the input shape is incompatible.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let bias = self.bias().map(Param::value);
        self.apply(xs, &self.weight().value(), bias.as_ref())
    }

    /// Run `weight` (in this layer's native layout) through the layer's
    /// operation without bias.
    ///
    /// # Errors
    ///
    /// Returns an error if the input or weight shape is incompatible.
    pub fn apply_weight(&self, xs: &Tensor, weight: &Tensor) -> Result<Tensor> {
        self.apply(xs, weight, None)
    }

    fn apply(&self, xs: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        match self {
            Self::Linear { .. } => {
                Ok(candle_nn::Linear::new(weight.clone(), bias.cloned()).forward(xs)?)
            }
            Self::Embedding { .. } => {
                let dim = weight.dim(1)?;
                Ok(candle_nn::Embedding::new(weight.clone(), dim).forward(xs)?)
            }
            Self::Conv2d { conv, .. } => {
                let ys = xs.conv2d(weight, conv.padding, conv.stride, conv.dilation, 1)?;
                match bias {
                    Some(b) => Ok(ys.broadcast_add(&b.reshape((1, b.elem_count(), 1, 1))?)?),
                    None => Ok(ys),
                }
            }
        }
    }

    /// Convert a `[out, fan_in]` delta matrix into the native weight layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the delta does not have `[out, fan_in]` shape.
    pub fn to_weight_layout(&self, delta: &Tensor) -> Result<Tensor> {
        let expected = [self.out_features(), self.fan_in()];
        if delta.dims() != expected {
            return Err(PeftError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: delta.dims().to_vec(),
            });
        }
        match self {
            Self::Linear { .. } => Ok(delta.clone()),
            Self::Embedding { .. } => Ok(delta.t()?.contiguous()?),
            Self::Conv2d { weight, .. } => Ok(delta.reshape(weight.dims())?),
        }
    }

    /// Current weight and bias values, detached.
    #[must_use]
    pub fn weights(&self) -> LayerWeights {
        LayerWeights {
            weight: self.weight().var().as_tensor().detach(),
            bias: self.bias().map(|b| b.var().as_tensor().detach()),
        }
    }

    /// Overwrite weight and bias in place.
    ///
    /// A bias appearing where the layer had none is added as a frozen
    /// parameter.
    ///
    /// # Errors
    ///
    /// Returns an error if shapes differ from the current parameters.
    pub fn set_weights(&mut self, weights: &LayerWeights) -> Result<()> {
        self.weight().set(&weights.weight)?;
        let Some(new_bias) = weights.bias.as_ref() else {
            return Ok(());
        };
        match self {
            Self::Linear { bias, .. } | Self::Conv2d { bias, .. } => match bias {
                Some(b) => b.set(new_bias)?,
                None => *bias = Some(Param::frozen(new_bias)?),
            },
            Self::Embedding { .. } => {
                return Err(PeftError::InvalidConfig(
                    "embedding layers do not carry a bias".into(),
                ))
            }
        }
        Ok(())
    }

    /// Named parameters owned by this layer.
    #[must_use]
    pub fn parameters(&self) -> Vec<(String, &Param)> {
        let mut params = vec![("weight".to_string(), self.weight())];
        if let Some(bias) = self.bias() {
            params.push(("bias".to_string(), bias));
        }
        params
    }

    /// Mutable named parameters owned by this layer.
    pub fn parameters_mut(&mut self) -> Vec<(String, &mut Param)> {
        match self {
            Self::Linear { weight, bias } | Self::Conv2d { weight, bias, .. } => {
                let mut params = vec![("weight".to_string(), weight)];
                if let Some(bias) = bias.as_mut() {
                    params.push(("bias".to_string(), bias));
                }
                params
            }
            Self::Embedding { weight } => vec![("weight".to_string(), weight)],
        }
    }
}

fn check_bias(bias: Option<&Tensor>, out: usize) -> Result<()> {
    if let Some(bias) = bias {
        if bias.dims() != [out] {
            return Err(PeftError::ShapeMismatch {
                expected: vec![out],
                actual: bias.dims().to_vec(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_linear_dims() -> Result<()> {
        let device = Device::Cpu;
        let layer = BaseLayer::linear(&Tensor::zeros((20, 10), DType::F32, &device)?, None)?;
        assert_eq!(layer.in_features(), 10);
        assert_eq!(layer.out_features(), 20);
        assert_eq!(layer.fan_in(), 10);
        let xs = Tensor::ones((5, 10), DType::F32, &device)?;
        assert_eq!(layer.forward(&xs)?.dims(), &[5, 20]);
        assert_eq!(layer.output_dims(&xs)?, vec![5, 20]);
        Ok(())
    }

    #[test]
    fn test_embedding_layout() -> Result<()> {
        let device = Device::Cpu;
        let layer = BaseLayer::embedding(&Tensor::zeros((50, 8), DType::F32, &device)?)?;
        assert_eq!(layer.in_features(), 50);
        assert_eq!(layer.out_features(), 8);
        let delta = Tensor::zeros((8, 50), DType::F32, &device)?;
        assert_eq!(layer.to_weight_layout(&delta)?.dims(), &[50, 8]);
        Ok(())
    }

    #[test]
    fn test_conv_layout() -> Result<()> {
        let device = Device::Cpu;
        let layer = BaseLayer::conv2d(
            &Tensor::zeros((4, 3, 3, 3), DType::F32, &device)?,
            None,
            ConvParams {
                padding: 1,
                ..ConvParams::default()
            },
        )?;
        assert_eq!(layer.fan_in(), 27);
        let delta = Tensor::zeros((4, 27), DType::F32, &device)?;
        assert_eq!(layer.to_weight_layout(&delta)?.dims(), &[4, 3, 3, 3]);
        let xs = Tensor::ones((2, 3, 8, 8), DType::F32, &device)?;
        assert_eq!(layer.forward(&xs)?.dims(), &[2, 4, 8, 8]);
        assert_eq!(layer.output_dims(&xs)?, vec![2, 4, 8, 8]);
        Ok(())
    }

    #[test]
    fn test_set_weights_adds_bias() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = BaseLayer::linear(&Tensor::zeros((2, 2), DType::F32, &device)?, None)?;
        layer.set_weights(&LayerWeights {
            weight: Tensor::ones((2, 2), DType::F32, &device)?,
            bias: Some(Tensor::ones(2, DType::F32, &device)?),
        })?;
        let bias = layer.bias().expect("bias added");
        assert!(!bias.requires_grad());
        Ok(())
    }
}
