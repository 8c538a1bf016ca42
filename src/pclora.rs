//! Progressive compression `LoRA` (PC-LoRA).
//!
//! During training every adapter layer computes `λ·base(x) + Σ delta(x)`,
//! with `λ` decaying from 1 to 0 on a [`DecaySchedule`]. Once `λ` reaches 0
//! the base weights are no longer needed. The frozen base network acts as a
//! teacher: its layer outputs are compared against the student's through a
//! feature distillation loss.

use candle_core::{Tensor, Var, D};
use serde::{Deserialize, Serialize};

use crate::adapters::lora::LoraConfig;
use crate::error::{PeftError, Result};
use crate::model::PeftModel;
use crate::nn::{tuned_layers_mut, ForwardContext, Layer};
use crate::training::DecaySchedule;
use crate::traits::AdapterConfig;

fn default_k() -> usize {
    10
}

/// Configuration for PC-LoRA: a `LoRA` config plus the decay of `λ`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcLoraConfig {
    /// The student adapter.
    #[serde(flatten)]
    pub lora: LoraConfig,

    /// Shape of the decay.
    #[serde(default)]
    pub decay_schedule: DecaySchedule,

    /// Number of steps over which `λ` decays.
    pub q: usize,

    /// `λ` is recomputed every `k` steps.
    #[serde(default = "default_k")]
    pub k: usize,

    /// Weight of the task loss in the total loss.
    pub task_loss_alpha: f64,
}

impl Default for PcLoraConfig {
    fn default() -> Self {
        Self {
            lora: LoraConfig::default(),
            decay_schedule: DecaySchedule::default(),
            q: 1000,
            k: default_k(),
            task_loss_alpha: 0.5,
        }
    }
}

impl AdapterConfig for PcLoraConfig {
    fn validate(&self) -> Result<()> {
        self.lora.validate()?;
        if self.q == 0 || self.k == 0 {
            return Err(PeftError::InvalidConfig("q and k must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.task_loss_alpha) {
            return Err(PeftError::InvalidConfig(format!(
                "task_loss_alpha must be in [0, 1], got {}",
                self.task_loss_alpha
            )));
        }
        Ok(())
    }
}

/// Student and teacher outputs of one PC-LoRA pass.
#[derive(Debug)]
pub struct PcLoraOutput {
    /// Network output with the adapters.
    pub student: Tensor,
    /// Network output of the frozen base, detached.
    pub teacher: Tensor,
    /// Adapter layer outputs of the student pass, by module path.
    pub student_activations: Vec<(String, Tensor)>,
    /// Adapter layer outputs of the teacher pass, detached.
    pub teacher_activations: Vec<(String, Tensor)>,
}

/// Losses of one training step.
#[derive(Debug)]
pub struct PcLossBreakdown {
    /// `α·task + (1−α)·feature`, the value to backpropagate.
    pub total: Tensor,
    /// Mean feature distillation loss.
    pub feature: Tensor,
    /// Knowledge distillation loss on the outputs, detached.
    pub kd: Tensor,
    /// Detached per-layer feature losses.
    pub per_layer: Vec<(String, Tensor)>,
}

/// A single `LoRA` student distilled from its own frozen base.
#[derive(Debug)]
pub struct PcLoraModel {
    inner: PeftModel,
    config: PcLoraConfig,
    lambda: f64,
}

impl PcLoraModel {
    /// Inject the student adapter into `root` with `λ = 1`.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or injection fails.
    pub fn new(root: Layer, config: PcLoraConfig, adapter_name: &str) -> Result<Self> {
        config.validate()?;
        let inner = PeftModel::new(root, config.lora.clone(), adapter_name)?;
        let mut model = Self {
            inner,
            config,
            lambda: 1.0,
        };
        model.apply_lambda();
        Ok(model)
    }

    fn apply_lambda(&mut self) {
        let lambda = self.lambda;
        for (_, layer) in tuned_layers_mut(self.inner.root_mut()) {
            layer.set_lambda(Some(lambda));
        }
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &PcLoraConfig {
        &self.config
    }

    /// The adapter model.
    #[must_use]
    pub fn peft_model(&self) -> &PeftModel {
        &self.inner
    }

    /// Current base gate.
    #[must_use]
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Advance the schedule to `step` and return the gate in effect.
    ///
    /// `λ` only changes on multiples of `k` and at `step == q`; in between
    /// the last value is kept.
    pub fn update_lora(&mut self, step: usize) -> f64 {
        let PcLoraConfig { q, k, .. } = self.config;
        if step % k == 0 || step == q {
            self.lambda = self.config.decay_schedule.value(step, q);
            self.apply_lambda();
            tracing::debug!(step, lambda = self.lambda, "updated PC-LoRA gate");
        }
        self.lambda
    }

    /// Run the teacher (adapters disabled) and the student on `xs`.
    ///
    /// # Errors
    /// Returns an error if either pass fails.
    pub fn forward(&mut self, xs: &Tensor, train: bool) -> Result<PcLoraOutput> {
        let (teacher, teacher_activations) = self.inner.with_adapters_disabled(|model| {
            let mut ctx = ForwardContext::new().with_activation_tap();
            let out = model.forward_with_context(xs, &mut ctx)?;
            let activations = ctx
                .take_activations()
                .into_iter()
                .map(|(path, t)| (path, t.detach()))
                .collect::<Vec<_>>();
            Ok((out.detach(), activations))
        })?;

        let ctx = if train {
            ForwardContext::train()
        } else {
            ForwardContext::new()
        };
        let mut ctx = ctx.with_activation_tap();
        let student = self.inner.forward_with_context(xs, &mut ctx)?;
        Ok(PcLoraOutput {
            student,
            teacher,
            student_activations: ctx.take_activations(),
            teacher_activations,
        })
    }

    /// Combine a task loss with the distillation losses of `output`.
    ///
    /// # Errors
    /// Returns an error if no activations were recorded or shapes disagree.
    pub fn loss(&self, output: &PcLoraOutput, task_loss: &Tensor) -> Result<PcLossBreakdown> {
        let (feature, per_layer) = feature_distillation_loss(output)?;
        let kd = kd_loss(&output.teacher, &output.student, 1.0)?.detach();
        let total = total_loss(task_loss, &feature, self.config.task_loss_alpha)?;
        Ok(PcLossBreakdown {
            total,
            feature,
            kd,
            per_layer,
        })
    }

    /// Variables an optimizer should update.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.inner.trainable_vars()
    }

    /// Release the adapter model; the gate stays on the layers.
    #[must_use]
    pub fn into_inner(self) -> PeftModel {
        self.inner
    }
}

/// Mean over adapter layers of the MSE between student and teacher outputs.
///
/// Also returns the detached per-layer losses.
///
/// # Errors
/// Returns an error if no layer was recorded in both passes.
pub fn feature_distillation_loss(output: &PcLoraOutput) -> Result<(Tensor, Vec<(String, Tensor)>)> {
    let mut losses = Vec::new();
    let mut per_layer = Vec::new();
    for (path, student) in &output.student_activations {
        let Some((_, teacher)) = output.teacher_activations.iter().find(|(p, _)| p == path) else {
            tracing::warn!(module = %path, "no teacher activation recorded, skipping");
            continue;
        };
        let loss = candle_nn::loss::mse(student, teacher)?;
        per_layer.push((path.clone(), loss.detach()));
        losses.push(loss);
    }
    if losses.is_empty() {
        return Err(PeftError::StateConflict(
            "no adapter layer activations recorded".into(),
        ));
    }
    let mean = Tensor::stack(&losses, 0)?.mean_all()?;
    Ok((mean, per_layer))
}

/// KL divergence of the student from the teacher on temperature-softened
/// `log_softmax` outputs, averaged over the batch and scaled by `T²`.
///
/// # Errors
/// Returns an error if shapes disagree.
pub fn kd_loss(teacher_logits: &Tensor, student_logits: &Tensor, temperature: f64) -> Result<Tensor> {
    let teacher = candle_nn::ops::log_softmax(&(teacher_logits / temperature)?, D::Minus1)?;
    let student = candle_nn::ops::log_softmax(&(student_logits / temperature)?, D::Minus1)?;
    let batch = student_logits.dim(0)?;
    #[allow(clippy::cast_precision_loss)]
    let norm = temperature * temperature / batch as f64;
    let kl = (teacher.exp()? * (&teacher - &student)?)?.sum_all()?;
    Ok((kl * norm)?)
}

/// `α·task + (1−α)·feature`.
///
/// # Errors
/// Returns an error if the losses are not scalars of the same dtype.
pub fn total_loss(task_loss: &Tensor, feature_loss: &Tensor, alpha: f64) -> Result<Tensor> {
    Ok(((task_loss * alpha)? + (feature_loss * (1.0 - alpha))?)?)
}
