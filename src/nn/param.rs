//! Trainable parameter handle.

use candle_core::{Tensor, Var};

use crate::error::{PeftError, Result};

/// A named tensor of a module together with its gradient requirement.
///
/// The storage is a [`Var`] so the parameter can be handed to an optimizer and
/// updated in place. Frozen parameters are read detached: gradients never flow
/// into them, whether or not they take part in the forward pass.
#[derive(Debug, Clone)]
pub struct Param {
    var: Var,
    requires_grad: bool,
}

impl Param {
    /// Create a trainable parameter from a tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor cannot be copied into a variable.
    pub fn new(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            var: Var::from_tensor(tensor)?,
            requires_grad: true,
        })
    }

    /// Create a frozen parameter from a tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor cannot be copied into a variable.
    pub fn frozen(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            var: Var::from_tensor(tensor)?,
            requires_grad: false,
        })
    }

    /// Wrap an existing variable, sharing its storage.
    #[must_use]
    pub fn from_var(var: Var, requires_grad: bool) -> Self {
        Self { var, requires_grad }
    }

    /// Current value for use in a forward pass.
    #[must_use]
    pub fn value(&self) -> Tensor {
        if self.requires_grad {
            self.var.as_tensor().clone()
        } else {
            self.var.as_tensor().detach()
        }
    }

    /// Underlying variable.
    #[must_use]
    pub fn var(&self) -> &Var {
        &self.var
    }

    /// Whether the optimizer should update this parameter.
    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Set the gradient requirement.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    /// Number of scalar elements.
    #[must_use]
    pub fn elem_count(&self) -> usize {
        self.var.elem_count()
    }

    /// Shape of the parameter.
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        self.var.dims()
    }

    /// Overwrite the value in place, converting dtype and device as needed.
    ///
    /// The value is copied first, so it may be derived from this parameter.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::ShapeMismatch`] when the shapes differ.
    pub fn set(&self, value: &Tensor) -> Result<()> {
        if value.dims() != self.dims() {
            return Err(PeftError::ShapeMismatch {
                expected: self.dims().to_vec(),
                actual: value.dims().to_vec(),
            });
        }
        let value = value
            .to_dtype(self.var.dtype())?
            .to_device(self.var.device())?
            .copy()?;
        self.var.set(&value)?;
        Ok(())
    }
}
