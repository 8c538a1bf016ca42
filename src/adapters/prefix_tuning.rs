//! Prefix Tuning implementation.
//!
//! Prefix tuning prepends trainable "prefix" vectors to the keys and values
//! in attention layers, without modifying the original model weights.
//!
//! Reference: <https://arxiv.org/abs/2101.00190>

use std::collections::HashMap;

use candle_core::{Device, Module as _, Tensor};
use candle_nn::{Embedding, Linear};
use serde::{Deserialize, Serialize};

use crate::error::{PeftError, Result};
use crate::io::{take_tensor, SaveLoad};
use crate::nn::Param;
use crate::traits::AdapterConfig;

/// Configuration for prefix tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixTuningConfig {
    /// Number of prefix tokens to prepend.
    #[serde(alias = "num_prefix_tokens")]
    pub num_virtual_tokens: usize,

    /// Model width, `num_attention_heads * head_dim`.
    pub token_dim: usize,

    /// Number of attention layers receiving a prefix.
    pub num_layers: usize,

    /// Number of attention heads.
    pub num_attention_heads: usize,

    /// Reparameterize the prefix through a two-layer tanh MLP.
    #[serde(default)]
    pub prefix_projection: bool,

    /// Hidden width of the reparameterization MLP.
    #[serde(default = "default_encoder_hidden_size")]
    pub encoder_hidden_size: usize,

    /// Freeze the encoder.
    #[serde(default)]
    pub inference_mode: bool,
}

fn default_encoder_hidden_size() -> usize {
    512
}

impl Default for PrefixTuningConfig {
    fn default() -> Self {
        Self {
            num_virtual_tokens: 20,
            token_dim: 768,
            num_layers: 12,
            num_attention_heads: 12,
            prefix_projection: false,
            encoder_hidden_size: default_encoder_hidden_size(),
            inference_mode: false,
        }
    }
}

impl PrefixTuningConfig {
    /// Width of one encoded prefix row: a key and a value for every layer.
    #[must_use]
    pub fn output_dim(&self) -> usize {
        self.num_layers * 2 * self.token_dim
    }
}

impl AdapterConfig for PrefixTuningConfig {
    fn validate(&self) -> Result<()> {
        if self.num_virtual_tokens == 0 {
            return Err(PeftError::InvalidConfig(
                "num_virtual_tokens must be > 0".into(),
            ));
        }
        if self.num_layers == 0 || self.num_attention_heads == 0 {
            return Err(PeftError::InvalidConfig(
                "num_layers and num_attention_heads must be > 0".into(),
            ));
        }
        if self.token_dim == 0 || self.token_dim % self.num_attention_heads != 0 {
            return Err(PeftError::InvalidConfig(format!(
                "token_dim ({}) must be a positive multiple of num_attention_heads ({})",
                self.token_dim, self.num_attention_heads
            )));
        }
        if self.prefix_projection && self.encoder_hidden_size == 0 {
            return Err(PeftError::InvalidConfig(
                "encoder_hidden_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Two-layer tanh MLP used to reparameterize the prefix.
#[derive(Debug)]
struct Projection {
    w1: Param,
    b1: Param,
    w2: Param,
    b2: Param,
}

impl Projection {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden = Linear::new(self.w1.value(), Some(self.b1.value())).forward(xs)?;
        Ok(Linear::new(self.w2.value(), Some(self.b2.value())).forward(&hidden.tanh()?)?)
    }

    fn params(&self) -> [(&'static str, &Param); 4] {
        [
            ("transform.0.weight", &self.w1),
            ("transform.0.bias", &self.b1),
            ("transform.2.weight", &self.w2),
            ("transform.2.bias", &self.b2),
        ]
    }
}

/// Encoder producing per-layer key/value prefixes.
///
/// Without projection the prefix table is `[num_virtual_tokens,
/// num_layers * 2 * token_dim]`; with projection it is `[num_virtual_tokens,
/// token_dim]` followed by the MLP.
#[derive(Debug)]
pub struct PrefixEncoder {
    embedding: Param,
    transform: Option<Projection>,
    config: PrefixTuningConfig,
}

impl PrefixEncoder {
    /// Create a new prefix encoder.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails or tensor creation fails.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn new(config: PrefixTuningConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let make = |t: &Tensor| {
            if config.inference_mode {
                Param::frozen(t)
            } else {
                Param::new(t)
            }
        };
        let out_dim = config.output_dim();
        let (embedding, transform) = if config.prefix_projection {
            let hidden = config.encoder_hidden_size;
            let b1 = 1.0 / (config.token_dim as f64).sqrt();
            let b2 = 1.0 / (hidden as f64).sqrt();
            let uniform = |bound: f64, shape: (usize, usize)| {
                Tensor::rand(-bound as f32, bound as f32, shape, device)
            };
            let transform = Projection {
                w1: make(&uniform(b1, (hidden, config.token_dim))?)?,
                b1: make(&uniform(b1, (1, hidden))?.squeeze(0)?)?,
                w2: make(&uniform(b2, (out_dim, hidden))?)?,
                b2: make(&uniform(b2, (1, out_dim))?.squeeze(0)?)?,
            };
            let table = Tensor::randn(0f32, 1.0, (config.num_virtual_tokens, config.token_dim), device)?;
            (make(&table)?, Some(transform))
        } else {
            let table = Tensor::randn(0f32, 1.0, (config.num_virtual_tokens, out_dim), device)?;
            (make(&table)?, None)
        };
        Ok(Self {
            embedding,
            transform,
            config,
        })
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &PrefixTuningConfig {
        &self.config
    }

    /// Encode prefix indices: `[b, n] -> [b, n, num_layers * 2 * token_dim]`.
    ///
    /// # Errors
    ///
    /// Returns an error if an index is out of range.
    pub fn forward(&self, prefix: &Tensor) -> Result<Tensor> {
        let table = self.embedding.value();
        let dim = table.dim(1)?;
        let embedded = Embedding::new(table, dim).forward(prefix)?;
        match &self.transform {
            Some(transform) => transform.forward(&embedded),
            None => Ok(embedded),
        }
    }

    /// Per-layer `(key, value)` prefixes, each `[b, heads, num_virtual_tokens, head_dim]`.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor operations fail.
    #[allow(clippy::cast_possible_truncation)]
    pub fn past_key_values(&self, batch_size: usize) -> Result<Vec<(Tensor, Tensor)>> {
        let c = &self.config;
        let n = c.num_virtual_tokens;
        let head_dim = c.token_dim / c.num_attention_heads;
        let device = self.embedding.var().device();
        let indices = Tensor::arange(0u32, n as u32, device)?
            .unsqueeze(0)?
            .repeat((batch_size, 1))?;
        // [b, n, 2L, heads, head_dim] -> [2L, b, heads, n, head_dim]
        let encoded = self
            .forward(&indices)?
            .reshape((batch_size, n, c.num_layers * 2, c.num_attention_heads, head_dim))?
            .permute((2, 0, 3, 1, 4))?
            .contiguous()?;
        (0..c.num_layers)
            .map(|layer| -> Result<(Tensor, Tensor)> {
                let key = encoded.get(2 * layer)?;
                let value = encoded.get(2 * layer + 1)?;
                Ok((key, value))
            })
            .collect()
    }

    /// Trainable parameters by local name.
    #[must_use]
    pub fn parameters(&self) -> Vec<(&'static str, &Param)> {
        let mut params = vec![("embedding.weight", &self.embedding)];
        if let Some(transform) = &self.transform {
            params.extend(transform.params());
        }
        params
    }

    /// Number of trainable values.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.parameters()
            .iter()
            .filter(|(_, p)| p.requires_grad())
            .map(|(_, p)| p.elem_count())
            .sum()
    }
}

impl SaveLoad for PrefixEncoder {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(self
            .parameters()
            .into_iter()
            .map(|(name, p)| (name.to_string(), p.value().detach()))
            .collect())
    }

    fn load_state_dict(&mut self, mut state_dict: HashMap<String, Tensor>) -> Result<()> {
        for (name, param) in self.parameters() {
            param.set(&take_tensor(&mut state_dict, name)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(prefix_projection: bool) -> PrefixTuningConfig {
        PrefixTuningConfig {
            num_virtual_tokens: 5,
            token_dim: 16,
            num_layers: 3,
            num_attention_heads: 4,
            prefix_projection,
            encoder_hidden_size: 8,
            inference_mode: false,
        }
    }

    #[test]
    fn test_prefix_tuning_config_validation() {
        assert!(config(false).validate().is_ok());
        let bad = PrefixTuningConfig {
            token_dim: 15,
            ..config(false)
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_past_key_values_shapes() -> Result<()> {
        for projection in [false, true] {
            let encoder = PrefixEncoder::new(config(projection), &Device::Cpu)?;
            let kv = encoder.past_key_values(2)?;
            assert_eq!(kv.len(), 3);
            for (k, v) in &kv {
                assert_eq!(k.dims(), &[2, 4, 5, 4]);
                assert_eq!(v.dims(), &[2, 4, 5, 4]);
            }
        }
        Ok(())
    }

    #[test]
    fn test_num_parameters() -> Result<()> {
        let plain = PrefixEncoder::new(config(false), &Device::Cpu)?;
        assert_eq!(plain.num_parameters(), 5 * 3 * 2 * 16);
        let projected = PrefixEncoder::new(config(true), &Device::Cpu)?;
        assert_eq!(
            projected.num_parameters(),
            5 * 16 + (8 * 16 + 8) + (96 * 8 + 96)
        );
        Ok(())
    }

    #[test]
    fn test_state_dict_round_trip() -> Result<()> {
        let source = PrefixEncoder::new(config(true), &Device::Cpu)?;
        let mut target = PrefixEncoder::new(config(true), &Device::Cpu)?;
        target.load_state_dict(source.state_dict()?)?;
        let (k1, _) = &source.past_key_values(1)?[0];
        let (k2, _) = &target.past_key_values(1)?[0];
        let diff = (k1 - k2)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}
