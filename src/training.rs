//! Training utilities for PEFT adapters.
//!
//! This module provides functionality for:
//! - The distillation gate schedule of progressive-compression LoRA
//! - The rank budget schedule of `AdaLoRA`
//! - Parameter counting helpers

// Allow usize to f64 casts for schedule calculations - this is standard in ML code
#![allow(clippy::cast_precision_loss)]

use std::f64::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};

use crate::nn::Layer;

/// Decay of the distillation gate `λ` from 1 towards 0 over `q` steps.
///
/// Every schedule returns 0 once `step >= q`, except
/// [`DecaySchedule::LinearCutoff`] which never drops below 0.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecaySchedule {
    /// `1 - s/q`
    #[default]
    Linear,
    /// `sin(π/2 · (1 + s/q))`
    Cosine,
    /// `1 - sin(π/2 · s/q)`
    Sine,
    /// Constant 1 until `q`
    Identity,
    /// `max(1 - s/q, 0.9)`
    LinearCutoff,
}

impl DecaySchedule {
    /// Gate value at `step` for a decay over `q` steps.
    #[must_use]
    pub fn value(&self, step: usize, q: usize) -> f64 {
        let progress = if q == 0 { 1.0 } else { step as f64 / q as f64 };
        match self {
            Self::LinearCutoff => (1.0 - progress).max(0.9),
            _ if step >= q => 0.0,
            Self::Linear => 1.0 - progress,
            Self::Cosine => (FRAC_PI_2 * (1.0 + progress)).sin(),
            Self::Sine => 1.0 - (FRAC_PI_2 * progress).sin(),
            Self::Identity => 1.0,
        }
    }
}

/// Cubic rank budget schedule of `AdaLoRA`.
///
/// The budget stays at `init_budget` for `tinit` steps, then shrinks
/// cubically to `target_budget`, which is held for the last `tfinal` steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetSchedule {
    /// Total rank before pruning
    pub init_budget: usize,
    /// Total rank after pruning
    pub target_budget: usize,
    /// Warmup steps without pruning
    pub tinit: usize,
    /// Final steps at the target budget
    pub tfinal: usize,
    /// Total number of training steps
    pub total_step: usize,
    /// Interval between maskings during the pruning phase
    pub delta_t: usize,
}

impl BudgetSchedule {
    /// Budget at `step`, and whether singular values should be masked.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn budget(&self, step: usize) -> (usize, bool) {
        let final_start = self.total_step.saturating_sub(self.tfinal);
        if step <= self.tinit {
            (self.init_budget, false)
        } else if step > final_start {
            (self.target_budget, true)
        } else {
            let span = final_start.saturating_sub(self.tinit).max(1);
            let mul_coeff = 1.0 - (step - self.tinit) as f64 / span as f64;
            let range = self.init_budget.saturating_sub(self.target_budget) as f64;
            let budget = (range * mul_coeff.powi(3)) as usize + self.target_budget;
            (budget, step % self.delta_t.max(1) == 0)
        }
    }
}

/// Count trainable parameters in a network.
///
/// # Arguments
/// * `root` - The network to count parameters for
///
/// # Returns
/// Number of trainable parameters
#[must_use]
pub fn count_trainable_parameters(root: &Layer) -> usize {
    crate::nn::parameter_counts(root).0
}

/// Format parameter count with appropriate units.
///
/// # Arguments
/// * `count` - Number of parameters
///
/// # Returns
/// Human-readable string (e.g., "12.3K", "1.5M", "2.1B")
#[must_use]
pub fn format_parameter_count(count: usize) -> String {
    if count >= 1_000_000_000 {
        format!("{:.2}B", count as f64 / 1_000_000_000.0)
    } else if count >= 1_000_000 {
        format!("{:.2}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.2}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}
