//! Small networks shared by the unit tests.

use candle_core::{DType, Device, Tensor, D};

use crate::error::Result;
use crate::nn::{
    Activation, AttentionModule, BaseLayer, ConvParams, ForwardContext, Layer, Module, Param,
    Sequential,
};

/// Four linear layers `lin0 (10→20)`, `lin1`, `lin2 (20→20)`, `lin3 (20→2)` with ReLU.
#[derive(Debug)]
pub struct Mlp {
    lin0: Layer,
    lin1: Layer,
    lin2: Layer,
    lin3: Layer,
}

/// Weights and biases of an [`Mlp`], so identical copies can be built.
pub type MlpWeights = Vec<(Tensor, Tensor)>;

impl Mlp {
    pub fn random_weights(device: &Device) -> Result<MlpWeights> {
        [(20, 10), (20, 20), (20, 20), (2, 20)]
            .into_iter()
            .map(|(out, inp)| {
                let w = Tensor::randn(0f32, 0.3, (out, inp), device)?;
                let b = Tensor::randn(0f32, 0.1, out, device)?;
                Ok((w, b))
            })
            .collect()
    }

    pub fn from_weights(weights: &MlpWeights) -> Result<Layer> {
        let mut layers = weights
            .iter()
            .map(|(w, b)| Ok(Layer::Base(BaseLayer::linear(&w.copy()?, Some(&b.copy()?))?)))
            .collect::<Result<Vec<_>>>()?
            .into_iter();
        let mut next = || layers.next().unwrap_or(Layer::Identity);
        Ok(Layer::Module(Box::new(Self {
            lin0: next(),
            lin1: next(),
            lin2: next(),
            lin3: next(),
        })))
    }

    pub fn layer(device: &Device) -> Result<Layer> {
        Self::from_weights(&Self::random_weights(device)?)
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        let xs = self.lin0.forward(xs, ctx)?.relu()?;
        let xs = self.lin1.forward(&xs, ctx)?.relu()?;
        let xs = self.lin2.forward(&xs, ctx)?.relu()?;
        self.lin3.forward(&xs, ctx)
    }

    fn children(&self) -> Vec<(String, &Layer)> {
        vec![
            ("lin0".into(), &self.lin0),
            ("lin1".into(), &self.lin1),
            ("lin2".into(), &self.lin2),
            ("lin3".into(), &self.lin3),
        ]
    }

    fn children_mut(&mut self) -> Vec<(String, &mut Layer)> {
        vec![
            ("lin0".into(), &mut self.lin0),
            ("lin1".into(), &mut self.lin1),
            ("lin2".into(), &mut self.lin2),
            ("lin3".into(), &mut self.lin3),
        ]
    }
}

/// `lin0 (10→8)`, ReLU, `lin1 (8→4)`.
pub fn two_layer(device: &Device) -> Result<Layer> {
    let lin0 = BaseLayer::linear(
        &Tensor::randn(0f32, 0.3, (8, 10), device)?,
        Some(&Tensor::zeros(8, DType::F32, device)?),
    )?;
    let lin1 = BaseLayer::linear(&Tensor::randn(0f32, 0.3, (4, 8), device)?, None)?;
    Ok(Sequential::new()
        .add_named("lin0", lin0)
        .add_named("act", Activation::Relu)
        .add_named("lin1", lin1)
        .into_layer())
}

/// `emb (50×16)` followed by `proj (16→16)`; takes `u32` ids.
pub fn embedding_net(device: &Device) -> Result<Layer> {
    let emb = BaseLayer::embedding(&Tensor::randn(0f32, 1.0, (50, 16), device)?)?;
    let proj = BaseLayer::linear(&Tensor::randn(0f32, 0.3, (16, 16), device)?, None)?;
    Ok(Sequential::new()
        .add_named("emb", emb)
        .add_named("proj", proj)
        .into_layer())
}

/// `conv0 (3→4, 3×3, pad 1)` followed by `conv1 (4→4, 1×1)`.
pub fn conv_net(device: &Device) -> Result<Layer> {
    let conv0 = BaseLayer::conv2d(
        &Tensor::randn(0f32, 0.3, (4, 3, 3, 3), device)?,
        Some(&Tensor::zeros(4, DType::F32, device)?),
        ConvParams {
            padding: 1,
            ..ConvParams::default()
        },
    )?;
    let conv1 = BaseLayer::conv2d(
        &Tensor::randn(0f32, 0.3, (4, 4, 1, 1), device)?,
        None,
        ConvParams::default(),
    )?;
    Ok(Sequential::new()
        .add_named("conv0", conv0)
        .add_named("conv1", conv1)
        .into_layer())
}

/// Multi-head self-attention without masking or caching.
#[derive(Debug)]
pub struct ToyAttention {
    q_proj: Layer,
    k_proj: Layer,
    v_proj: Layer,
    o_proj: Layer,
    num_heads: usize,
    head_dim: usize,
}

impl ToyAttention {
    pub fn new(hidden: usize, num_heads: usize, device: &Device) -> Result<Self> {
        let proj = || -> Result<Layer> {
            Ok(Layer::Base(BaseLayer::linear(
                &Tensor::randn(0f32, 0.2, (hidden, hidden), device)?,
                None,
            )?))
        };
        Ok(Self {
            q_proj: proj()?,
            k_proj: proj()?,
            v_proj: proj()?,
            o_proj: proj()?,
            num_heads,
            head_dim: hidden / num_heads,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, s, _) = xs.dims3()?;
        Ok(xs
            .reshape((b, s, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }
}

impl Module for ToyAttention {
    fn forward(&self, xs: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        let (b, s, h) = xs.dims3()?;
        let q = self.query_states(xs, ctx)?;
        let k = self.split_heads(&self.k_proj.forward(xs, ctx)?)?;
        let v = self.split_heads(&self.v_proj.forward(xs, ctx)?)?;
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let attn = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, s, h))?;
        self.project_output(&attn, ctx)
    }

    fn children(&self) -> Vec<(String, &Layer)> {
        vec![
            ("q_proj".into(), &self.q_proj),
            ("k_proj".into(), &self.k_proj),
            ("v_proj".into(), &self.v_proj),
            ("o_proj".into(), &self.o_proj),
        ]
    }

    fn children_mut(&mut self) -> Vec<(String, &mut Layer)> {
        vec![
            ("q_proj".into(), &mut self.q_proj),
            ("k_proj".into(), &mut self.k_proj),
            ("v_proj".into(), &mut self.v_proj),
            ("o_proj".into(), &mut self.o_proj),
        ]
    }
}

impl AttentionModule for ToyAttention {
    fn num_heads(&self) -> usize {
        self.num_heads
    }

    fn head_dim(&self) -> usize {
        self.head_dim
    }

    fn query_states(&self, hidden_states: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        self.split_heads(&self.q_proj.forward(hidden_states, ctx)?)
    }

    fn project_key_value(
        &self,
        prompt: &Tensor,
        ctx: &mut ForwardContext<'_>,
    ) -> Result<(Tensor, Tensor)> {
        Ok((self.k_proj.forward(prompt, ctx)?, self.v_proj.forward(prompt, ctx)?))
    }

    fn project_output(&self, xs: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        self.o_proj.forward(xs, ctx)
    }
}

/// Residual block: `x + attn(x)` then `x + mlp(x)`.
#[derive(Debug)]
struct Block {
    self_attn: Layer,
    mlp: Layer,
    norm_scale: Param,
}

impl Module for Block {
    fn forward(&self, xs: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        let xs = (xs + self.self_attn.forward(xs, ctx)?)?;
        let xs = xs.broadcast_mul(&self.norm_scale.value())?;
        Ok((&xs + self.mlp.forward(&xs, ctx)?.tanh()?)?)
    }

    fn children(&self) -> Vec<(String, &Layer)> {
        vec![("self_attn".into(), &self.self_attn), ("mlp".into(), &self.mlp)]
    }

    fn children_mut(&mut self) -> Vec<(String, &mut Layer)> {
        vec![
            ("self_attn".into(), &mut self.self_attn),
            ("mlp".into(), &mut self.mlp),
        ]
    }

    fn parameters(&self) -> Vec<(String, &Param)> {
        vec![("norm_scale".into(), &self.norm_scale)]
    }

    fn parameters_mut(&mut self) -> Vec<(String, &mut Param)> {
        vec![("norm_scale".into(), &mut self.norm_scale)]
    }
}

/// Stack of attention blocks under `layers.{i}`; input `[batch, seq, hidden]`.
pub fn decoder(n_layers: usize, hidden: usize, num_heads: usize, device: &Device) -> Result<Layer> {
    let mut layers = Sequential::new();
    for _ in 0..n_layers {
        let block = Block {
            self_attn: Layer::Attention(Box::new(ToyAttention::new(hidden, num_heads, device)?)),
            mlp: Layer::Base(BaseLayer::linear(
                &Tensor::randn(0f32, 0.2, (hidden, hidden), device)?,
                None,
            )?),
            norm_scale: Param::new(&Tensor::ones(hidden, DType::F32, device)?)?,
        };
        layers = layers.add(Layer::Module(Box::new(block)));
    }
    Ok(Sequential::new().add_named("layers", layers).into_layer())
}

/// Flattened `f32` values.
pub fn values(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

/// Largest absolute element-wise difference.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(values(a)?
        .iter()
        .zip(values(b)?.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max))
}
