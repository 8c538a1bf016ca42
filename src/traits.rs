//! Core traits for PEFT adapters.

use std::any::Any;
use std::fmt;

use candle_core::Tensor;

use crate::config::PeftType;
use crate::nn::{BaseLayer, LayerWeights, Param};
use crate::Result;

/// Configuration trait for adapter hyperparameters.
pub trait AdapterConfig: Clone + Send + Sync {
    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> Result<()>;
}

/// One named adapter's parameters attached to a single base layer.
///
/// Adapters are stored as trait objects inside a [`crate::TunerLayer`], so
/// the trait is object safe: the wrapped layer is passed in rather than
/// owned, and parameters are reported by local name (`lora_A`, `hada_w1_a`,
/// ...) without the adapter suffix.
pub trait Adapter: Send + Sync + fmt::Debug {
    /// Adapter family.
    fn peft_type(&self) -> PeftType;

    /// Additive contribution to the base output for input `input`.
    ///
    /// # Arguments
    /// * `input` - Input of the wrapped layer
    /// * `base_output` - Output of the wrapped layer (for rescaling adapters)
    /// * `base` - The wrapped layer
    /// * `train` - Whether dropout and stochastic paths are active
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn forward(
        &self,
        input: &Tensor,
        base_output: &Tensor,
        base: &BaseLayer,
        train: bool,
    ) -> Result<Tensor>;

    /// Closed-form weight delta in the base layer's native layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the delta cannot be materialized.
    fn delta_weight(&self, base: &BaseLayer) -> Result<Tensor>;

    /// Weights after folding this adapter into `weights`.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor operations fail.
    fn merge(&self, base: &BaseLayer, weights: &LayerWeights) -> Result<LayerWeights> {
        let delta = self.delta_weight(base)?;
        Ok(LayerWeights {
            weight: (&weights.weight + delta.to_dtype(weights.weight.dtype())?)?,
            bias: weights.bias.clone(),
        })
    }

    /// Weights after removing this adapter from merged `weights`.
    ///
    /// # Errors
    ///
    /// Returns an error if tensor operations fail.
    fn unmerge(&self, base: &BaseLayer, weights: &LayerWeights) -> Result<LayerWeights> {
        let delta = self.delta_weight(base)?;
        Ok(LayerWeights {
            weight: (&weights.weight - delta.to_dtype(weights.weight.dtype())?)?,
            bias: weights.bias.clone(),
        })
    }

    /// Whether unmerging restores the weight up to rounding. Families whose
    /// unmerge divides by learned factors return `false`.
    fn exact_unmerge(&self) -> bool {
        true
    }

    /// Downcasting support for family-specific operations.
    fn as_any(&self) -> &dyn Any;

    /// Parameters by local name.
    fn parameters(&self) -> Vec<(&'static str, &Param)>;

    /// Mutable parameters by local name.
    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Param)>;

    /// Get the number of trainable parameters.
    #[must_use]
    fn num_parameters(&self) -> usize {
        self.parameters()
            .iter()
            .filter(|(_, p)| p.requires_grad())
            .map(|(_, p)| p.elem_count())
            .sum()
    }
}

/// Trait for layers that can fold adapters into their base weights.
pub trait Mergeable {
    /// Merge the named (or all active) adapters into the base weights.
    ///
    /// # Errors
    ///
    /// Returns an error if merging fails; with `safe` set, non-finite results
    /// are rejected before any weight is written.
    fn merge(&mut self, adapter_names: Option<&[String]>, safe: bool) -> Result<()>;

    /// Undo all merges in reverse order.
    ///
    /// # Errors
    ///
    /// Returns an error if unmerging fails.
    fn unmerge(&mut self) -> Result<()>;

    /// Adapters currently folded into the base weights, in merge order.
    fn merged_adapters(&self) -> &[String];

    /// Whether any adapter is merged.
    fn merged(&self) -> bool {
        !self.merged_adapters().is_empty()
    }
}

/// Trait for trainable adapters.
pub trait Trainable {
    /// Freeze all adapter parameters (disable gradients).
    fn freeze(&mut self);

    /// Unfreeze all adapter parameters (enable gradients).
    fn unfreeze(&mut self);

    /// Check if the adapter is frozen.
    #[must_use]
    fn is_frozen(&self) -> bool;
}

impl<A: Adapter + ?Sized> Trainable for A {
    fn freeze(&mut self) {
        for (_, param) in self.parameters_mut() {
            param.set_requires_grad(false);
        }
    }

    fn unfreeze(&mut self) {
        for (_, param) in self.parameters_mut() {
            param.set_requires_grad(true);
        }
    }

    fn is_frozen(&self) -> bool {
        self.parameters().iter().all(|(_, p)| !p.requires_grad())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Trait object safety check
    fn _assert_adapter_object_safe(_: &dyn Adapter) {}
    fn _assert_mergeable_object_safe(_: &dyn Mergeable) {}
}
