//! Prompt Tuning implementation.
//!
//! Prompt tuning prepends learnable "soft prompt" embeddings to the input,
//! allowing the model to be steered without modifying weights. The
//! multitask variant shares one prompt across tasks and modulates it with a
//! per-task low-rank factor pair.
//!
//! References:
//! - <https://arxiv.org/abs/2104.08691>
//! - <https://arxiv.org/abs/2303.02861>

use std::collections::HashMap;

use candle_core::{DType, Device, Module as _, Tensor};
use candle_nn::Embedding;
use serde::{Deserialize, Serialize};

use crate::error::{PeftError, Result};
use crate::io::{take_tensor, SaveLoad};
use crate::nn::Param;
use crate::traits::AdapterConfig;

/// Configuration for prompt tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTuningConfig {
    /// Number of virtual tokens (soft prompt length).
    pub num_virtual_tokens: usize,

    /// Hidden size of the model embeddings.
    #[serde(alias = "hidden_size")]
    pub token_dim: usize,

    /// Number of transformer submodules (2 for encoder-decoder models).
    #[serde(default = "default_submodules")]
    pub num_transformer_submodules: usize,

    /// Initialization strategy.
    #[serde(default)]
    pub prompt_tuning_init: PromptTuningInit,

    /// Freeze the prompt.
    #[serde(default)]
    pub inference_mode: bool,
}

fn default_submodules() -> usize {
    1
}

/// Initialization strategy for soft prompts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromptTuningInit {
    /// Random initialization from a standard normal distribution.
    #[default]
    Random,
    /// Copy the word embeddings of these token ids, repeated or truncated to
    /// the prompt length.
    Text(Vec<u32>),
}

impl Default for PromptTuningConfig {
    fn default() -> Self {
        Self {
            num_virtual_tokens: 20,
            token_dim: 768,
            num_transformer_submodules: 1,
            prompt_tuning_init: PromptTuningInit::Random,
            inference_mode: false,
        }
    }
}

impl PromptTuningConfig {
    /// Prompt rows across all transformer submodules.
    #[must_use]
    pub fn total_virtual_tokens(&self) -> usize {
        self.num_virtual_tokens * self.num_transformer_submodules
    }
}

impl AdapterConfig for PromptTuningConfig {
    fn validate(&self) -> Result<()> {
        if self.num_virtual_tokens == 0 {
            return Err(PeftError::InvalidConfig(
                "num_virtual_tokens must be > 0".into(),
            ));
        }
        if self.token_dim == 0 {
            return Err(PeftError::InvalidConfig("token_dim must be > 0".into()));
        }
        if self.num_transformer_submodules == 0 {
            return Err(PeftError::InvalidConfig(
                "num_transformer_submodules must be > 0".into(),
            ));
        }
        if matches!(&self.prompt_tuning_init, PromptTuningInit::Text(ids) if ids.is_empty()) {
            return Err(PeftError::InvalidConfig(
                "text initialization needs at least one token id".into(),
            ));
        }
        Ok(())
    }
}

/// Soft prompt table of shape `[total_virtual_tokens, token_dim]`.
#[derive(Debug)]
pub struct PromptEmbedding {
    embedding: Param,
    config: PromptTuningConfig,
}

impl PromptEmbedding {
    /// Create a soft prompt.
    ///
    /// `word_embeddings` is the base model's `[vocab, token_dim]` table; it is
    /// only read for [`PromptTuningInit::Text`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, text initialization
    /// lacks a word embedding table, or a token id is out of range.
    pub fn new(
        config: PromptTuningConfig,
        word_embeddings: Option<&Tensor>,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let total = config.total_virtual_tokens();
        let init = match &config.prompt_tuning_init {
            PromptTuningInit::Random => {
                Tensor::randn(0f32, 1.0, (total, config.token_dim), device)?
            }
            PromptTuningInit::Text(ids) => {
                let table = word_embeddings.ok_or_else(|| {
                    PeftError::InvalidConfig(
                        "text initialization requires the word embedding table".into(),
                    )
                })?;
                let (vocab, dim) = table.dims2()?;
                if dim != config.token_dim {
                    return Err(PeftError::ShapeMismatch {
                        expected: vec![vocab, config.token_dim],
                        actual: vec![vocab, dim],
                    });
                }
                if let Some(bad) = ids.iter().find(|&&id| id as usize >= vocab) {
                    return Err(PeftError::InvalidConfig(format!(
                        "token id {bad} is outside the vocabulary of {vocab}"
                    )));
                }
                let ids: Vec<u32> = ids.iter().copied().cycle().take(total).collect();
                let ids = Tensor::new(ids.as_slice(), table.device())?;
                table
                    .detach()
                    .index_select(&ids, 0)?
                    .to_dtype(DType::F32)?
                    .to_device(device)?
            }
        };
        let embedding = if config.inference_mode {
            Param::frozen(&init)?
        } else {
            Param::new(&init)?
        };
        Ok(Self { embedding, config })
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &PromptTuningConfig {
        &self.config
    }

    /// The soft prompt table.
    #[must_use]
    pub fn embedding(&self) -> &Param {
        &self.embedding
    }

    /// Look up prompt rows: `[b, n] -> [b, n, token_dim]`.
    ///
    /// # Errors
    ///
    /// Returns an error if an index is out of range.
    pub fn forward(&self, indices: &Tensor) -> Result<Tensor> {
        Ok(Embedding::new(self.embedding.value(), self.config.token_dim).forward(indices)?)
    }

    /// Prompt indices `0..total_virtual_tokens` repeated for every row of a batch.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor creation fails.
    #[allow(clippy::cast_possible_truncation)]
    pub fn prompt_indices(&self, batch_size: usize) -> Result<Tensor> {
        let total = self.config.total_virtual_tokens() as u32;
        let device = self.embedding.var().device();
        Ok(Tensor::arange(0u32, total, device)?
            .unsqueeze(0)?
            .repeat((batch_size, 1))?)
    }

    /// Prepend the soft prompt to input embeddings.
    ///
    /// # Arguments
    /// * `input_embeds` - Input embeddings [batch, `seq_len`, hidden]
    ///
    /// # Returns
    /// Concatenated embeddings [batch, `total_virtual_tokens` + `seq_len`, hidden]
    ///
    /// # Errors
    ///
    /// Returns an error if tensor operations fail.
    pub fn prepend_to_input(&self, input_embeds: &Tensor) -> Result<Tensor> {
        let batch_size = input_embeds.dim(0)?;
        let prompt = self
            .forward(&self.prompt_indices(batch_size)?)?
            .to_dtype(input_embeds.dtype())?;
        Ok(Tensor::cat(&[&prompt, input_embeds], 1)?)
    }

    /// Number of trainable values.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        if self.embedding.requires_grad() {
            self.embedding.elem_count()
        } else {
            0
        }
    }
}

impl SaveLoad for PromptEmbedding {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([(
            "prompt_embeddings".to_string(),
            self.embedding.value().detach(),
        )]))
    }

    fn load_state_dict(&mut self, mut state_dict: HashMap<String, Tensor>) -> Result<()> {
        self.embedding
            .set(&take_tensor(&mut state_dict, "prompt_embeddings")?)
    }
}

/// Configuration for multitask prompt tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultitaskPromptTuningConfig {
    /// Shared prompt settings.
    #[serde(flatten)]
    pub prompt: PromptTuningConfig,

    /// Number of tasks with their own modulation.
    #[serde(default = "default_one")]
    pub num_tasks: usize,

    /// Rank of the per-task modulation.
    #[serde(default = "default_one")]
    pub num_ranks: usize,
}

fn default_one() -> usize {
    1
}

impl Default for MultitaskPromptTuningConfig {
    fn default() -> Self {
        Self {
            prompt: PromptTuningConfig::default(),
            num_tasks: 1,
            num_ranks: 1,
        }
    }
}

impl AdapterConfig for MultitaskPromptTuningConfig {
    fn validate(&self) -> Result<()> {
        self.prompt.validate()?;
        if self.num_tasks == 0 || self.num_ranks == 0 {
            return Err(PeftError::InvalidConfig(
                "num_tasks and num_ranks must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Shared soft prompt modulated per task by `cols[t] @ rows[t]`.
///
/// - `prefix_task_cols`: `[num_tasks, total_virtual_tokens, num_ranks]`
/// - `prefix_task_rows`: `[num_tasks, num_ranks, token_dim]`
#[derive(Debug)]
pub struct MultitaskPromptEmbedding {
    prompt: PromptEmbedding,
    prefix_task_cols: Param,
    prefix_task_rows: Param,
    num_tasks: usize,
}

impl MultitaskPromptEmbedding {
    /// Create a multitask soft prompt.
    ///
    /// # Errors
    ///
    /// Returns an error under the same conditions as [`PromptEmbedding::new`].
    pub fn new(
        config: MultitaskPromptTuningConfig,
        word_embeddings: Option<&Tensor>,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let total = config.prompt.total_virtual_tokens();
        let cols = Tensor::randn(0f32, 0.02, (config.num_tasks, total, config.num_ranks), device)?;
        let rows = Tensor::randn(
            0f32,
            0.02,
            (config.num_tasks, config.num_ranks, config.prompt.token_dim),
            device,
        )?;
        let frozen = config.prompt.inference_mode;
        let make = |t: &Tensor| if frozen { Param::frozen(t) } else { Param::new(t) };
        Ok(Self {
            prefix_task_cols: make(&cols)?,
            prefix_task_rows: make(&rows)?,
            num_tasks: config.num_tasks,
            prompt: PromptEmbedding::new(config.prompt, word_embeddings, device)?,
        })
    }

    /// The shared prompt.
    #[must_use]
    pub fn shared(&self) -> &PromptEmbedding {
        &self.prompt
    }

    /// Task-modulated prompt rows: `[b, n] x [b] -> [b, n, token_dim]`.
    ///
    /// # Errors
    ///
    /// Returns an error if a task id is out of range or shapes disagree.
    pub fn forward(&self, indices: &Tensor, task_ids: &Tensor) -> Result<Tensor> {
        let ids = task_ids.to_dtype(DType::U32)?.flatten_all()?;
        let max = ids.max(0)?.to_scalar::<u32>()? as usize;
        if max >= self.num_tasks {
            return Err(PeftError::InvalidConfig(format!(
                "task id {max} is out of range for {} tasks",
                self.num_tasks
            )));
        }
        let prompt = self.prompt.forward(indices)?;
        let cols = self.prefix_task_cols.value().index_select(&ids, 0)?;
        let rows = self.prefix_task_rows.value().index_select(&ids, 0)?;
        let task_prompts = cols.matmul(&rows)?;
        Ok((prompt * task_prompts)?)
    }

    /// Prepend the task-specific prompt to input embeddings.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor operations fail.
    pub fn prepend_to_input(&self, input_embeds: &Tensor, task_ids: &Tensor) -> Result<Tensor> {
        let batch_size = input_embeds.dim(0)?;
        let prompt = self
            .forward(&self.prompt.prompt_indices(batch_size)?, task_ids)?
            .to_dtype(input_embeds.dtype())?;
        Ok(Tensor::cat(&[&prompt, input_embeds], 1)?)
    }

    /// Number of trainable values.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        [&self.prefix_task_cols, &self.prefix_task_rows]
            .iter()
            .filter(|p| p.requires_grad())
            .map(|p| p.elem_count())
            .sum::<usize>()
            + self.prompt.num_parameters()
    }
}

impl SaveLoad for MultitaskPromptEmbedding {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = self.prompt.state_dict()?;
        state.insert(
            "prefix_task_cols".into(),
            self.prefix_task_cols.value().detach(),
        );
        state.insert(
            "prefix_task_rows".into(),
            self.prefix_task_rows.value().detach(),
        );
        Ok(state)
    }

    fn load_state_dict(&mut self, mut state_dict: HashMap<String, Tensor>) -> Result<()> {
        self.prefix_task_cols
            .set(&take_tensor(&mut state_dict, "prefix_task_cols")?)?;
        self.prefix_task_rows
            .set(&take_tensor(&mut state_dict, "prefix_task_rows")?)?;
        self.prompt.load_state_dict(state_dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> PromptTuningConfig {
        PromptTuningConfig {
            num_virtual_tokens: 4,
            token_dim: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_prompt_tuning_creation() {
        let layer = PromptEmbedding::new(PromptTuningConfig::default(), None, &Device::Cpu);
        assert!(layer.is_ok());
    }

    #[test]
    fn test_prepend_to_input() -> Result<()> {
        let device = Device::Cpu;
        let config = PromptTuningConfig {
            num_virtual_tokens: 10,
            token_dim: 768,
            ..Default::default()
        };
        let layer = PromptEmbedding::new(config, None, &device)?;

        let input = Tensor::zeros(&[2, 20, 768], DType::F32, &device)?;
        let output = layer.prepend_to_input(&input)?;

        // Output should be [2, 10+20, 768] = [2, 30, 768]
        assert_eq!(output.shape().dims(), &[2, 30, 768]);
        assert_eq!(layer.num_parameters(), 10 * 768);
        Ok(())
    }

    #[test]
    fn test_text_init_repeats_token_rows() -> Result<()> {
        let device = Device::Cpu;
        let table = Tensor::arange(0f32, 24., &device)?.reshape((3, 8))?;
        let config = PromptTuningConfig {
            prompt_tuning_init: PromptTuningInit::Text(vec![2, 0]),
            ..small_config()
        };
        let layer = PromptEmbedding::new(config, Some(&table), &device)?;
        let rows = layer.embedding().value().to_vec2::<f32>()?;
        assert_eq!(rows[0], rows[2]);
        assert_eq!(rows[1], rows[3]);
        assert_eq!(rows[0][0], 16.0);
        assert_eq!(rows[1][0], 0.0);
        Ok(())
    }

    #[test]
    fn test_text_init_requires_table() {
        let config = PromptTuningConfig {
            prompt_tuning_init: PromptTuningInit::Text(vec![1]),
            ..small_config()
        };
        assert!(PromptEmbedding::new(config, None, &Device::Cpu).is_err());
    }

    #[test]
    fn test_multitask_shapes_and_task_selection() -> Result<()> {
        let device = Device::Cpu;
        let config = MultitaskPromptTuningConfig {
            prompt: small_config(),
            num_tasks: 3,
            num_ranks: 2,
        };
        let layer = MultitaskPromptEmbedding::new(config, None, &device)?;
        let input = Tensor::zeros((2, 5, 8), DType::F32, &device)?;
        let task_ids = Tensor::new(&[0u32, 2], &device)?;
        let out = layer.prepend_to_input(&input, &task_ids)?;
        assert_eq!(out.dims(), &[2, 9, 8]);
        assert_eq!(layer.num_parameters(), 4 * 8 + 3 * 4 * 2 + 3 * 2 * 8);

        let bad = Tensor::new(&[3u32, 0], &device)?;
        assert!(layer.prepend_to_input(&input, &bad).is_err());
        Ok(())
    }

    #[test]
    fn test_multitask_state_dict_round_trip() -> Result<()> {
        let device = Device::Cpu;
        let config = MultitaskPromptTuningConfig {
            prompt: small_config(),
            num_tasks: 2,
            num_ranks: 1,
        };
        let source = MultitaskPromptEmbedding::new(config.clone(), None, &device)?;
        let mut target = MultitaskPromptEmbedding::new(config, None, &device)?;
        let state = source.state_dict()?;
        assert_eq!(state.len(), 3);
        target.load_state_dict(state)?;

        let indices = source.shared().prompt_indices(1)?;
        let task = Tensor::new(&[1u32], &device)?;
        let a = source.forward(&indices, &task)?;
        let b = target.forward(&indices, &task)?;
        assert_eq!(a.flatten_all()?.to_vec1::<f32>()?, b.flatten_all()?.to_vec1::<f32>()?);
        Ok(())
    }
}
