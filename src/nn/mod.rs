//! Base-network capability contract.
//!
//! A network is a tree of [`Layer`] nodes reachable from a root. Container
//! modules expose their children by name, so every node has a stable dotted
//! path (`"layers.0.self_attn.q_proj"`). Adapter injection is an explicit
//! rewrite of the node at such a path.

mod base;
mod context;
mod param;
mod sequential;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;

use candle_core::Tensor;

pub use base::{BaseKind, BaseLayer, ConvParams, LayerWeights};
pub use context::ForwardContext;
pub use param::Param;
pub use sequential::{Activation, Sequential};

use crate::adaption_prompt::AdaptedAttention;
use crate::error::Result;
use crate::layer::TunerLayer;

/// A node of the base network with a forward transform.
///
/// Implementors expose child layers by name so they can be located and
/// replaced. Parameters that belong to the module itself (not to a child)
/// are reported through [`Module::parameters`].
pub trait Module: Send + Sync + fmt::Debug {
    /// Forward pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn forward(&self, xs: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor>;

    /// Named child layers in a fixed order.
    fn children(&self) -> Vec<(String, &Layer)> {
        Vec::new()
    }

    /// Mutable named child layers, in the same order as [`Module::children`].
    fn children_mut(&mut self) -> Vec<(String, &mut Layer)> {
        Vec::new()
    }

    /// Parameters owned directly by this module.
    fn parameters(&self) -> Vec<(String, &Param)> {
        Vec::new()
    }

    /// Mutable parameters owned directly by this module.
    fn parameters_mut(&mut self) -> Vec<(String, &mut Param)> {
        Vec::new()
    }
}

/// Self-attention block that adaption prompts can attach to.
///
/// The output projection must be linear without bias so that a zero gate
/// leaves the block's output unchanged.
pub trait AttentionModule: Module {
    /// Number of attention heads.
    fn num_heads(&self) -> usize;

    /// Width of a single head.
    fn head_dim(&self) -> usize;

    /// Model width, `num_heads * head_dim`.
    fn hidden_size(&self) -> usize {
        self.num_heads() * self.head_dim()
    }

    /// Query states for `hidden_states`, shaped `[batch, heads, seq, head_dim]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the projection fails.
    fn query_states(&self, hidden_states: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor>;

    /// Key and value projections of prompt embeddings `[1, len, hidden]`.
    ///
    /// # Errors
    ///
    /// Returns an error if a projection fails.
    fn project_key_value(
        &self,
        prompt: &Tensor,
        ctx: &mut ForwardContext<'_>,
    ) -> Result<(Tensor, Tensor)>;

    /// Output projection applied to `[batch, seq, hidden]` attention values.
    ///
    /// # Errors
    ///
    /// Returns an error if the projection fails.
    fn project_output(&self, xs: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor>;
}

/// A node of the network tree.
#[derive(Debug)]
pub enum Layer {
    /// Plain linear, embedding or convolution layer
    Base(BaseLayer),
    /// Base layer wrapped with adapters
    Tuned(Box<TunerLayer>),
    /// Attention block
    Attention(Box<dyn AttentionModule>),
    /// Attention block with an adaption prompt
    AdaptedAttention(Box<AdaptedAttention>),
    /// Any other module, usually a container
    Module(Box<dyn Module>),
    /// Pass-through
    Identity,
}

impl Layer {
    /// Forward pass through this node.
    ///
    /// # Errors
    ///
    /// Returns an error if the wrapped forward pass fails.
    pub fn forward(&self, xs: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        match self {
            Self::Base(base) => base.forward(xs),
            Self::Tuned(tuned) => tuned.forward(xs, ctx),
            Self::Attention(attn) => attn.forward(xs, ctx),
            Self::AdaptedAttention(attn) => attn.forward(xs, ctx),
            Self::Module(module) => module.forward(xs, ctx),
            Self::Identity => Ok(xs.clone()),
        }
    }

    /// Named child layers.
    #[must_use]
    pub fn children(&self) -> Vec<(String, &Layer)> {
        match self {
            Self::Attention(attn) => attn.children(),
            Self::AdaptedAttention(attn) => attn.inner().children(),
            Self::Module(module) => module.children(),
            Self::Base(_) | Self::Tuned(_) | Self::Identity => Vec::new(),
        }
    }

    /// Mutable named child layers.
    pub fn children_mut(&mut self) -> Vec<(String, &mut Layer)> {
        match self {
            Self::Attention(attn) => attn.children_mut(),
            Self::AdaptedAttention(attn) => attn.inner_mut().children_mut(),
            Self::Module(module) => module.children_mut(),
            Self::Base(_) | Self::Tuned(_) | Self::Identity => Vec::new(),
        }
    }

    /// Parameters owned by this node, excluding those of its children.
    #[must_use]
    pub fn parameters(&self) -> Vec<(String, &Param)> {
        match self {
            Self::Base(base) => base.parameters(),
            Self::Tuned(tuned) => tuned.parameters(),
            Self::Attention(attn) => attn.parameters(),
            Self::AdaptedAttention(attn) => attn.parameters(),
            Self::Module(module) => module.parameters(),
            Self::Identity => Vec::new(),
        }
    }

    /// Mutable parameters owned by this node.
    pub fn parameters_mut(&mut self) -> Vec<(String, &mut Param)> {
        match self {
            Self::Base(base) => base.parameters_mut(),
            Self::Tuned(tuned) => tuned.parameters_mut(),
            Self::Attention(attn) => attn.parameters_mut(),
            Self::AdaptedAttention(attn) => attn.parameters_mut(),
            Self::Module(module) => module.parameters_mut(),
            Self::Identity => Vec::new(),
        }
    }

    /// Short kind name for diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> String {
        match self {
            Self::Base(base) => base.kind().to_string(),
            Self::Tuned(tuned) => format!("Tuned{}", tuned.base_layer().kind()),
            Self::Attention(_) => "Attention".into(),
            Self::AdaptedAttention(_) => "AdaptedAttention".into(),
            Self::Module(_) => "Module".into(),
            Self::Identity => "Identity".into(),
        }
    }
}

impl From<BaseLayer> for Layer {
    fn from(base: BaseLayer) -> Self {
        Self::Base(base)
    }
}

/// Join a parent path and a child name.
#[must_use]
pub fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// All nodes in preorder with their dotted paths. The root has path `""`.
///
/// The order only depends on the static structure, so repeated calls on an
/// unchanged network return the same sequence.
#[must_use]
pub fn named_modules(root: &Layer) -> Vec<(String, &Layer)> {
    let mut out = Vec::new();
    collect_modules(root, String::new(), &mut out);
    out
}

fn collect_modules<'a>(layer: &'a Layer, path: String, out: &mut Vec<(String, &'a Layer)>) {
    let children = layer.children();
    out.push((path.clone(), layer));
    for (name, child) in children {
        collect_modules(child, join_path(&path, &name), out);
    }
}

/// Resolve a dotted path to a node.
#[must_use]
pub fn get_layer<'a>(root: &'a Layer, path: &str) -> Option<&'a Layer> {
    if path.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for segment in path.split('.') {
        current = current
            .children()
            .into_iter()
            .find(|(name, _)| name == segment)
            .map(|(_, child)| child)?;
    }
    Some(current)
}

/// Resolve a dotted path to a mutable node, the splice point for injection.
pub fn get_layer_mut<'a>(root: &'a mut Layer, path: &str) -> Option<&'a mut Layer> {
    let mut current = root;
    if path.is_empty() {
        return Some(current);
    }
    for segment in path.split('.') {
        let layer: &'a mut Layer = current;
        current = layer
            .children_mut()
            .into_iter()
            .find(|(name, _)| name == segment)
            .map(|(_, child)| child)?;
    }
    Some(current)
}

/// All parameters with fully qualified names.
#[must_use]
pub fn named_parameters(root: &Layer) -> Vec<(String, &Param)> {
    let mut out = Vec::new();
    for (path, layer) in named_modules(root) {
        for (name, param) in layer.parameters() {
            out.push((join_path(&path, &name), param));
        }
    }
    out
}

/// Visit every parameter mutably with its fully qualified name.
pub fn visit_parameters_mut(root: &mut Layer, f: &mut dyn FnMut(&str, &mut Param)) {
    visit_params(root, "", f);
}

fn visit_params(layer: &mut Layer, path: &str, f: &mut dyn FnMut(&str, &mut Param)) {
    for (name, param) in layer.parameters_mut() {
        f(&join_path(path, &name), param);
    }
    for (name, child) in layer.children_mut() {
        visit_params(child, &join_path(path, &name), f);
    }
}

/// Every adapter-wrapped layer with its path, in preorder.
pub fn tuned_layers_mut(root: &mut Layer) -> Vec<(String, &mut TunerLayer)> {
    let mut out = Vec::new();
    collect_tuned(root, String::new(), &mut out);
    out
}

fn collect_tuned<'a>(layer: &'a mut Layer, path: String, out: &mut Vec<(String, &'a mut TunerLayer)>) {
    match layer {
        Layer::Tuned(tuned) => out.push((path, tuned.as_mut())),
        other => {
            for (name, child) in other.children_mut() {
                let child_path = join_path(&path, &name);
                collect_tuned(child, child_path, out);
            }
        }
    }
}

/// Every adapter-wrapped layer with its path, in preorder.
#[must_use]
pub fn tuned_layers(root: &Layer) -> Vec<(String, &TunerLayer)> {
    named_modules(root)
        .into_iter()
        .filter_map(|(path, layer)| match layer {
            Layer::Tuned(tuned) => Some((path, tuned.as_ref())),
            _ => None,
        })
        .collect()
}

/// Trainable and total scalar parameter counts.
#[must_use]
pub fn parameter_counts(root: &Layer) -> (usize, usize) {
    named_parameters(root)
        .into_iter()
        .fold((0, 0), |(trainable, total), (_, p)| {
            let n = p.elem_count();
            (trainable + if p.requires_grad() { n } else { 0 }, total + n)
        })
}

#[cfg(test)]
mod tests {
    use super::testing::Mlp;
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_named_modules_preorder() -> Result<()> {
        let root = Mlp::layer(&Device::Cpu)?;
        let names: Vec<String> = named_modules(&root).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["", "lin0", "lin1", "lin2", "lin3"]);
        Ok(())
    }

    #[test]
    fn test_get_layer_mut_splices() -> Result<()> {
        let mut root = Mlp::layer(&Device::Cpu)?;
        let slot = get_layer_mut(&mut root, "lin2").expect("lin2 exists");
        *slot = Layer::Identity;
        assert!(matches!(get_layer(&root, "lin2"), Some(Layer::Identity)));
        assert!(get_layer(&root, "lin9").is_none());
        Ok(())
    }

    #[test]
    fn test_named_parameters() -> Result<()> {
        let root = Mlp::layer(&Device::Cpu)?;
        let names: Vec<String> = named_parameters(&root).into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"lin0.weight".to_string()));
        assert!(names.contains(&"lin3.bias".to_string()));
        let (trainable, total) = parameter_counts(&root);
        assert_eq!(trainable, total);
        Ok(())
    }
}
