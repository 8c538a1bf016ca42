//! Heterogeneous adapter families on one network.
//!
//! [`MixedModel`] runs the same injection engine as [`PeftModel`] but accepts
//! any family on the compatibility whitelist, so e.g. a `LoRA` and a `LoHa`
//! adapter may sit on the same layer and be active together.

use std::path::Path;

use candle_core::{Tensor, Var};

use crate::config::{PeftConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::model::PeftModel;
use crate::nn::{ForwardContext, Layer};

/// Families that may be combined in a [`MixedModel`].
///
/// All of them add a delta to the base output, so forward and merge agree in
/// any order. Multiplicative families such as IA3 are excluded.
pub const COMPATIBLE_TUNER_TYPES: [PeftType; 4] = [
    PeftType::Lora,
    PeftType::LoHa,
    PeftType::LoKr,
    PeftType::AdaLora,
];

/// Network carrying adapters of several compatible families.
#[derive(Debug)]
pub struct MixedModel {
    inner: PeftModel,
}

impl MixedModel {
    /// Wrap `root` and inject the first adapter.
    ///
    /// # Errors
    /// Returns [`PeftError::IncompatibleAdapter`] if the family is not on the
    /// whitelist, or any injection error.
    pub fn new(root: Layer, config: impl Into<PeftConfig>, adapter_name: &str) -> Result<Self> {
        let inner = PeftModel::with_policy(
            root,
            config.into(),
            adapter_name,
            Some(COMPATIBLE_TUNER_TYPES.to_vec()),
        )?;
        Ok(Self { inner })
    }

    /// The wrapped network.
    #[must_use]
    pub fn base_model(&self) -> &Layer {
        self.inner.base_model()
    }

    /// Configuration of adapter `name`.
    #[must_use]
    pub fn peft_config(&self, name: &str) -> Option<&PeftConfig> {
        self.inner.peft_config(name)
    }

    /// Active adapter names.
    #[must_use]
    pub fn active_adapters(&self) -> &[String] {
        self.inner.active_adapters()
    }

    /// Add an adapter of any compatible family.
    ///
    /// # Errors
    /// Returns [`PeftError::IncompatibleAdapter`] naming the whitelist, or
    /// any injection error; the model is unchanged on failure.
    pub fn add_adapter(&mut self, adapter_name: &str, config: impl Into<PeftConfig>) -> Result<()> {
        self.inner.add_adapter(adapter_name, config)
    }

    /// Select the active adapters.
    ///
    /// # Errors
    /// Returns a lookup error if any name is unknown.
    pub fn set_adapter<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        self.inner.set_adapter(names)
    }

    /// Remove the named adapters everywhere.
    ///
    /// # Errors
    /// Returns a lookup error if any name is unknown.
    pub fn delete_adapter<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        self.inner.delete_adapter(names)
    }

    /// Merge the named (or active) adapters into the base weights.
    ///
    /// # Errors
    /// See [`PeftModel::merge_adapter`].
    pub fn merge_adapter(&mut self, adapter_names: Option<&[String]>, safe_merge: bool) -> Result<()> {
        self.inner.merge_adapter(adapter_names, safe_merge)
    }

    /// Undo all merges.
    ///
    /// # Errors
    /// See [`PeftModel::unmerge_adapter`].
    pub fn unmerge_adapter(&mut self) -> Result<()> {
        self.inner.unmerge_adapter()
    }

    /// Bypass all adapters.
    ///
    /// # Errors
    /// See [`PeftModel::disable_adapter_layers`].
    pub fn disable_adapter_layers(&mut self) -> Result<()> {
        self.inner.disable_adapter_layers()
    }

    /// Route forwards through the adapters again.
    ///
    /// # Errors
    /// See [`PeftModel::enable_adapter_layers`].
    pub fn enable_adapter_layers(&mut self) -> Result<()> {
        self.inner.enable_adapter_layers()
    }

    /// Run `f` with all adapters bypassed, then restore the previous state.
    ///
    /// # Errors
    /// Returns the error of `f`, or an error from toggling the layers.
    pub fn with_adapters_disabled<T>(&mut self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let scope = self.inner.enter_disabled()?;
        let result = f(&*self);
        self.inner.exit_disabled(scope)?;
        result
    }

    /// Forward pass in inference mode.
    ///
    /// # Errors
    /// Returns an error if the network forward fails.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.inner.forward(xs)
    }

    /// Forward pass with a caller-provided context.
    ///
    /// # Errors
    /// Returns an error if the network forward fails.
    pub fn forward_with_context(&self, xs: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        self.inner.forward_with_context(xs, ctx)
    }

    /// Trainable and total parameter counts.
    #[must_use]
    pub fn get_nb_trainable_parameters(&self) -> (usize, usize) {
        self.inner.get_nb_trainable_parameters()
    }

    /// Log the trainable parameter report.
    pub fn print_trainable_parameters(&self) {
        self.inner.print_trainable_parameters();
    }

    /// Variables an optimizer should update.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.inner.trainable_vars()
    }

    /// Fold adapters into the base weights and return the plain network.
    ///
    /// # Errors
    /// See [`PeftModel::merge_and_unload`].
    pub fn merge_and_unload(
        self,
        adapter_names: Option<&[String]>,
        safe_merge: bool,
        progress: bool,
    ) -> Result<Layer> {
        self.inner.merge_and_unload(adapter_names, safe_merge, progress)
    }

    /// Drop all adapters and return the plain network.
    ///
    /// # Errors
    /// See [`PeftModel::unload`].
    pub fn unload(self) -> Result<Layer> {
        self.inner.unload()
    }

    /// Not supported.
    ///
    /// # Errors
    /// Always returns [`PeftError::Unsupported`].
    pub fn save_pretrained(&self, _dir: impl AsRef<Path>) -> Result<()> {
        Err(PeftError::Unsupported(
            "save_pretrained is not supported for MixedModel (yet)".into(),
        ))
    }

    /// Not supported.
    ///
    /// # Errors
    /// Always returns [`PeftError::Unsupported`].
    pub fn load_adapter(&mut self, _dir: impl AsRef<Path>, _adapter_name: &str) -> Result<()> {
        Err(PeftError::Unsupported(
            "load_adapter is not supported for MixedModel (yet)".into(),
        ))
    }

    /// Not supported.
    ///
    /// # Errors
    /// Always returns [`PeftError::Unsupported`].
    pub fn from_pretrained(_root: Layer, _dir: impl AsRef<Path>, _adapter_name: &str) -> Result<Self> {
        Err(PeftError::Unsupported(
            "from_pretrained is not supported for MixedModel (yet)".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ia3::Ia3Config;
    use crate::adapters::loha::LoHaConfig;
    use crate::adapters::lora::{LoraConfig, LoraInitialization};
    use crate::adapters::vera::VeraConfig;
    use crate::config::BaseAdapterConfig;
    use crate::nn::testing::{max_abs_diff, Mlp};
    use candle_core::Device;

    fn lora() -> LoraConfig {
        LoraConfig {
            init_lora_weights: LoraInitialization::Random,
            ..LoraConfig::new(2, 4, ["lin0", "lin1"])
        }
    }

    fn loha() -> LoHaConfig {
        LoHaConfig {
            r: 2,
            init_weights: false,
            base: BaseAdapterConfig::targeting(["lin1", "lin2"]),
            ..LoHaConfig::default()
        }
    }

    #[test]
    fn test_lora_and_loha_compose() -> Result<()> {
        let device = Device::Cpu;
        let xs = Tensor::randn(0f32, 1.0, (3, 10), &device)?;
        let mut model = MixedModel::new(Mlp::layer(&device)?, lora(), "lora")?;
        model.add_adapter("loha", loha())?;
        let lora_only = model.forward(&xs)?;
        model.set_adapter(&["lora", "loha"])?;
        let both = model.forward(&xs)?;
        assert!(max_abs_diff(&both, &lora_only)? > 1e-6);

        let expected = both.clone();
        let merged = model.merge_and_unload(None, true, false)?;
        let out = merged.forward(&xs, &mut ForwardContext::new())?;
        assert!(max_abs_diff(&out, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_disabled_scope_and_delete() -> Result<()> {
        let device = Device::Cpu;
        let weights = Mlp::random_weights(&device)?;
        let xs = Tensor::randn(0f32, 1.0, (3, 10), &device)?;
        let plain = Mlp::from_weights(&weights)?.forward(&xs, &mut ForwardContext::new())?;
        let mut model = MixedModel::new(Mlp::from_weights(&weights)?, lora(), "lora")?;
        model.add_adapter("loha", loha())?;
        model.set_adapter(&["lora", "loha"])?;
        let before = model.forward(&xs)?;

        let inside = model.with_adapters_disabled(|m| m.forward(&xs))?;
        assert_eq!(max_abs_diff(&inside, &plain)?, 0.0);
        assert_eq!(max_abs_diff(&model.forward(&xs)?, &before)?, 0.0);

        model.delete_adapter(&["lora", "loha"])?;
        assert_eq!(max_abs_diff(&model.forward(&xs)?, &plain)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_incompatible_family_rejected() -> Result<()> {
        let mut model = MixedModel::new(Mlp::layer(&Device::Cpu)?, lora(), "lora")?;
        let vera = VeraConfig {
            r: 2,
            base: BaseAdapterConfig::targeting(["lin2"]),
            ..VeraConfig::default()
        };
        match model.add_adapter("vera", vera) {
            Err(PeftError::IncompatibleAdapter { peft_type, compatible }) => {
                assert_eq!(peft_type, PeftType::Vera);
                assert_eq!(compatible, COMPATIBLE_TUNER_TYPES.to_vec());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(model.peft_config("vera").is_none());
        Ok(())
    }

    #[test]
    fn test_ia3_cannot_join_lora() -> Result<()> {
        let mut model = MixedModel::new(Mlp::layer(&Device::Cpu)?, lora(), "lora")?;
        let ia3 = Ia3Config {
            feedforward_modules: vec![],
            base: BaseAdapterConfig::targeting(["lin1"]),
            ..Ia3Config::default()
        };
        assert!(matches!(
            model.add_adapter("ia3", ia3),
            Err(PeftError::IncompatibleAdapter { peft_type: PeftType::Ia3, .. })
        ));
        assert_eq!(model.active_adapters(), ["lora".to_string()]);
        Ok(())
    }

    #[test]
    fn test_save_load_unsupported() -> Result<()> {
        let mut model = MixedModel::new(Mlp::layer(&Device::Cpu)?, lora(), "lora")?;
        let err = model.save_pretrained("unused").unwrap_err();
        assert!(err.to_string().contains("not supported for MixedModel (yet)"));
        assert!(matches!(
            model.load_adapter("unused", "x"),
            Err(PeftError::Unsupported(_))
        ));
        Ok(())
    }
}
