//! Simple containers for assembling networks.

use candle_core::Tensor;

use crate::error::Result;
use crate::nn::{ForwardContext, Layer, Module};

/// Element-wise activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// `max(x, 0)`
    Relu,
    /// Gaussian error linear unit
    Gelu,
    /// `x * sigmoid(x)`
    Silu,
    /// Hyperbolic tangent
    Tanh,
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor, _ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        let ys = match self {
            Self::Relu => xs.relu()?,
            Self::Gelu => xs.gelu()?,
            Self::Silu => candle_nn::ops::silu(xs)?,
            Self::Tanh => xs.tanh()?,
        };
        Ok(ys)
    }
}

/// Layers applied in order. Children are named by the caller or by index.
#[derive(Debug, Default)]
pub struct Sequential {
    layers: Vec<(String, Layer)>,
}

impl Sequential {
    /// Empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer named after its position.
    #[must_use]
    pub fn add(mut self, layer: impl Into<Layer>) -> Self {
        let name = self.layers.len().to_string();
        self.layers.push((name, layer.into()));
        self
    }

    /// Append a named layer.
    #[must_use]
    pub fn add_named(mut self, name: impl Into<String>, layer: impl Into<Layer>) -> Self {
        self.layers.push((name.into(), layer.into()));
        self
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the container is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Box into a tree node.
    #[must_use]
    pub fn into_layer(self) -> Layer {
        Layer::Module(Box::new(self))
    }
}

impl Module for Sequential {
    fn forward(&self, xs: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (_, layer) in &self.layers {
            xs = layer.forward(&xs, ctx)?;
        }
        Ok(xs)
    }

    fn children(&self) -> Vec<(String, &Layer)> {
        self.layers.iter().map(|(n, l)| (n.clone(), l)).collect()
    }

    fn children_mut(&mut self) -> Vec<(String, &mut Layer)> {
        self.layers.iter_mut().map(|(n, l)| (n.clone(), l)).collect()
    }
}

impl From<Activation> for Layer {
    fn from(act: Activation) -> Self {
        Layer::Module(Box::new(act))
    }
}

impl From<Sequential> for Layer {
    fn from(seq: Sequential) -> Self {
        seq.into_layer()
    }
}
