//! Call-scoped state threaded through a forward pass.

use candle_core::Tensor;

/// Per-call context passed down the module tree.
///
/// Holds everything that used to live as mutable state on a shared model:
/// the training flag, per-sample adapter routing for mixed batches, xLoRA
/// mixture weights and the activation tap used for distillation. Because
/// it is owned by the caller for a single pass, concurrent forward calls on
/// the same network never observe each other's routing state.
#[derive(Debug, Default)]
pub struct ForwardContext<'a> {
    train: bool,
    adapter_names: Option<&'a [String]>,
    scalings: Option<&'a Tensor>,
    activations: Option<Vec<(String, Tensor)>>,
}

impl<'a> ForwardContext<'a> {
    /// Inference context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Training context: dropout and stochastic adapter paths are enabled.
    #[must_use]
    pub fn train() -> Self {
        Self {
            train: true,
            ..Self::default()
        }
    }

    /// Route each batch row through the adapter named at the same index.
    ///
    /// Use `"__base__"` for rows that should see the base network only.
    #[must_use]
    pub fn with_adapter_names(mut self, names: &'a [String]) -> Self {
        self.adapter_names = Some(names);
        self
    }

    /// Mixture weights of shape `[batch, seq, n_layers, n_adapters]`.
    #[must_use]
    pub fn with_scalings(mut self, scalings: &'a Tensor) -> Self {
        self.scalings = Some(scalings);
        self
    }

    /// Record the output of every adapter layer under its module path.
    #[must_use]
    pub fn with_activation_tap(mut self) -> Self {
        self.activations = Some(Vec::new());
        self
    }

    /// Whether this is a training pass.
    #[must_use]
    pub fn is_train(&self) -> bool {
        self.train
    }

    /// Per-sample adapter names, if any.
    #[must_use]
    pub fn adapter_names(&self) -> Option<&'a [String]> {
        self.adapter_names
    }

    /// Routing scalings, if any.
    #[must_use]
    pub fn scalings(&self) -> Option<&'a Tensor> {
        self.scalings
    }

    pub(crate) fn record_activation(&mut self, path: &str, output: &Tensor) {
        if let Some(activations) = self.activations.as_mut() {
            activations.push((path.to_string(), output.clone()));
        }
    }

    /// Drain the recorded activations in call order.
    pub fn take_activations(&mut self) -> Vec<(String, Tensor)> {
        self.activations
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }
}
