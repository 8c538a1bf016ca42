//! Model integration for PEFT adapters.
//!
//! [`PeftModel`] owns a base network and rewrites it in place:
//! - locating target modules by name pattern, regex and layer index
//! - wrapping them in [`TunerLayer`]s, or extending existing wrappers
//! - switching, deleting, merging and unloading named adapters
//! - extracting and restoring adapter checkpoints

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use indicatif::{ProgressBar, ProgressStyle};

use crate::adapters::adalora::{self, AdaLoraAdapter, RankAllocator};
use crate::adapters::{build_adapter, BuildContext, BuiltAdapter, SharedParams};
use crate::config::{ModulePattern, PeftConfig, PeftType, TargetMatcher};
use crate::error::{PeftError, Result};
use crate::io::{
    adapter_key, load_adapter_config, load_tensors, parse_adapter_key, save_adapter_config,
    save_tensors, take_tensor, ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME,
};
use crate::layer::TunerLayer;
use crate::nn::{
    get_layer_mut, named_modules, named_parameters, parameter_counts, tuned_layers,
    tuned_layers_mut, visit_parameters_mut, BaseLayer, ForwardContext, Layer,
};
use crate::registry::AdapterRegistry;
use crate::training::format_parameter_count;
use crate::traits::{AdapterConfig, Mergeable, Trainable};

/// Adapter name used when none is given.
pub const DEFAULT_ADAPTER_NAME: &str = "default";

/// Prefix of `modules_to_save` entries in a checkpoint.
const MODULES_TO_SAVE_PREFIX: &str = "modules_to_save";

/// Adapters built for one `add_adapter` call, not yet spliced in.
struct InjectionPlan {
    name: String,
    config: PeftConfig,
    shared: Option<SharedParams>,
    adapters: Vec<(String, BuiltAdapter)>,
    modules_to_save: Vec<String>,
}

/// PEFT model wrapper for managing adapters across modules.
///
/// The base network's parameters are frozen on construction. Adapter
/// parameters of the active adapters are trainable unless their config is
/// in inference mode; `modules_to_save` stay fully trainable.
#[derive(Debug)]
pub struct PeftModel {
    root: Layer,
    peft_config: AdapterRegistry<PeftConfig>,
    shared: HashMap<String, SharedParams>,
    modules_to_save: Vec<String>,
    compatible: Option<Vec<PeftType>>,
    allocators: HashMap<String, RankAllocator>,
}

/// Layer state saved while adapters are temporarily bypassed.
#[derive(Debug)]
pub(crate) struct DisabledScope {
    merged: Vec<(String, Vec<String>)>,
    was_disabled: Vec<String>,
}

impl PeftModel {
    /// Wrap `root` and inject the first adapter.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or targets nothing.
    pub fn new(root: Layer, config: impl Into<PeftConfig>, adapter_name: &str) -> Result<Self> {
        Self::with_policy(root, config.into(), adapter_name, None)
    }

    pub(crate) fn with_policy(
        mut root: Layer,
        config: PeftConfig,
        adapter_name: &str,
        compatible: Option<Vec<PeftType>>,
    ) -> Result<Self> {
        visit_parameters_mut(&mut root, &mut |_, param| param.set_requires_grad(false));
        let mut model = Self {
            root,
            peft_config: AdapterRegistry::new(),
            shared: HashMap::new(),
            modules_to_save: Vec::new(),
            compatible,
            allocators: HashMap::new(),
        };
        model.add_adapter(adapter_name, config)?;
        Ok(model)
    }

    /// The wrapped network.
    #[must_use]
    pub fn base_model(&self) -> &Layer {
        &self.root
    }

    pub(crate) fn root_mut(&mut self) -> &mut Layer {
        &mut self.root
    }

    /// Configuration of adapter `name`.
    #[must_use]
    pub fn peft_config(&self, name: &str) -> Option<&PeftConfig> {
        self.peft_config.get(name)
    }

    /// All adapter names in insertion order.
    #[must_use]
    pub fn adapter_names(&self) -> Vec<String> {
        self.peft_config.names()
    }

    /// Active adapter names.
    #[must_use]
    pub fn active_adapters(&self) -> &[String] {
        self.peft_config.active()
    }

    /// Add (or reinitialize) adapter `adapter_name` from `config`.
    ///
    /// All adapter parameters are built before the network is touched, so a
    /// failing call leaves the model as it was. The first adapter becomes
    /// active; later ones are added inactive and frozen.
    ///
    /// # Errors
    /// Returns an error if the name is invalid, the config is invalid or of
    /// an incompatible family, no module matches, or building fails.
    pub fn add_adapter(&mut self, adapter_name: &str, config: impl Into<PeftConfig>) -> Result<()> {
        let plan = self.plan(adapter_name, config.into())?;
        self.commit(plan)
    }

    fn plan(&self, name: &str, config: PeftConfig) -> Result<InjectionPlan> {
        validate_adapter_name(name)?;
        config.validate()?;
        self.check_compatible(name, &config)?;

        let matcher = TargetMatcher::new(config.base())?;
        let mut targets: Vec<(String, &BaseLayer)> = Vec::new();
        for (path, layer) in named_modules(&self.root) {
            if !matcher.matches(&path) {
                continue;
            }
            match layer {
                Layer::Base(base) => targets.push((path, base)),
                Layer::Tuned(tuned) => {
                    if tuned.merged_adapters().iter().any(|m| m == name) {
                        return Err(PeftError::StateConflict(format!(
                            "adapter '{name}' is merged into {path}, unmerge before re-adding it"
                        )));
                    }
                    targets.push((path, tuned.base_layer()));
                }
                _ => {}
            }
        }
        let Some((_, first)) = targets.first() else {
            return Err(PeftError::TargetNotFound {
                patterns: config.base().target_modules.patterns(),
            });
        };

        let var = first.weight().var();
        let bases: Vec<&BaseLayer> = targets.iter().map(|(_, b)| *b).collect();
        let shared = SharedParams::for_config(&config, &bases, var.device(), var.dtype())?;
        let mut adapters = Vec::with_capacity(targets.len());
        for (path, base) in &targets {
            let mut built = build_adapter(
                &config,
                BuildContext {
                    path,
                    base,
                    shared: shared.as_ref(),
                },
            )?;
            if config.inference_mode() {
                built.adapter.freeze();
            }
            adapters.push((path.clone(), built));
        }

        let save_patterns: Vec<ModulePattern> = config
            .base()
            .modules_to_save
            .iter()
            .map(|m| ModulePattern::parse(m))
            .collect();
        let modules_to_save = named_modules(&self.root)
            .into_iter()
            .filter(|(path, _)| !path.is_empty() && save_patterns.iter().any(|p| p.matches(path)))
            .map(|(path, _)| path)
            .collect();

        Ok(InjectionPlan {
            name: name.to_string(),
            config,
            shared,
            adapters,
            modules_to_save,
        })
    }

    fn commit(&mut self, plan: InjectionPlan) -> Result<()> {
        let InjectionPlan {
            name,
            config,
            shared,
            adapters,
            modules_to_save,
        } = plan;

        if self.peft_config.contains(&name) {
            // Reinitialization: drop the adapter from modules the new config no longer targets
            let stale: Vec<String> = tuned_layers(&self.root)
                .into_iter()
                .filter(|(path, layer)| {
                    layer.adapter(&name).is_some() && !adapters.iter().any(|(p, _)| p == path)
                })
                .map(|(path, _)| path)
                .collect();
            for path in stale {
                self.remove_from_layer(&path, &name)?;
            }
        }

        let count = adapters.len();
        for (path, built) in adapters {
            let slot = get_layer_mut(&mut self.root, &path).ok_or_else(|| PeftError::TargetNotFound {
                patterns: vec![path.clone()],
            })?;
            let mut tuned = match std::mem::replace(slot, Layer::Identity) {
                Layer::Base(base) => Box::new(TunerLayer::new(base, path.as_str())),
                Layer::Tuned(tuned) => tuned,
                other => {
                    *slot = other;
                    return Err(PeftError::StateConflict(format!(
                        "module {path} changed kind during injection"
                    )));
                }
            };
            let updated = tuned.update(&name, built);
            *slot = Layer::Tuned(tuned);
            updated?;
            tracing::debug!(module = %path, adapter = %name, "injected adapter");
        }

        tracing::info!(
            adapter = %name,
            peft_type = %config.peft_type(),
            modules = count,
            "added adapter"
        );
        self.peft_config.insert(name.clone(), config);
        match shared {
            Some(shared) => {
                self.shared.insert(name.clone(), shared);
            }
            None => {
                self.shared.remove(&name);
            }
        }
        self.allocators.remove(&name);
        for path in modules_to_save {
            if !self.modules_to_save.contains(&path) {
                self.modules_to_save.push(path);
            }
        }
        if self.peft_config.active().is_empty() {
            self.peft_config.set_active_unchecked(&[name]);
        }
        self.apply_trainability();
        Ok(())
    }

    fn check_compatible(&self, name: &str, config: &PeftConfig) -> Result<()> {
        let peft_type = config.peft_type();
        match &self.compatible {
            Some(allowed) if !allowed.contains(&peft_type) => {
                return Err(PeftError::IncompatibleAdapter {
                    peft_type,
                    compatible: allowed.clone(),
                });
            }
            Some(_) => {}
            None => {
                if let Some((_, other)) = self
                    .peft_config
                    .iter()
                    .find(|(n, c)| *n != name && c.peft_type() != peft_type)
                {
                    return Err(PeftError::IncompatibleAdapter {
                        peft_type,
                        compatible: vec![other.peft_type()],
                    });
                }
            }
        }
        if peft_type == PeftType::AdaLora
            && !config.inference_mode()
            && self.peft_config.iter().any(|(n, c)| {
                n != name && c.peft_type() == PeftType::AdaLora && !c.inference_mode()
            })
        {
            return Err(PeftError::InvalidConfig(
                "AdaLoRA supports only one trainable adapter, set inference_mode on the others"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Sync gradient flags with the active selection.
    fn apply_trainability(&mut self) {
        let active = self.peft_config.active().to_vec();
        let frozen: Vec<String> = active
            .iter()
            .filter(|n| self.peft_config.get(n).is_some_and(PeftConfig::inference_mode))
            .cloned()
            .collect();
        for (_, layer) in tuned_layers_mut(&mut self.root) {
            layer.set_adapter(&active);
            for name in &frozen {
                layer.set_trainable(name, false);
            }
        }
        for (name, shared) in &mut self.shared {
            let trainable = matches!(shared, SharedParams::VectorBank { .. })
                && active.contains(name)
                && !frozen.contains(name);
            for (_, param) in shared.parameters_mut() {
                param.set_requires_grad(trainable);
            }
        }
        let modules = &self.modules_to_save;
        visit_parameters_mut(&mut self.root, &mut |path, param| {
            if modules.iter().any(|m| is_under(path, m)) {
                param.set_requires_grad(true);
            }
        });
    }

    /// Select the active adapters on every layer.
    ///
    /// Merged layers are unmerged first.
    ///
    /// # Errors
    /// Returns a lookup error listing the available names if any name is
    /// unknown.
    pub fn set_adapter<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        let names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        self.peft_config.set_active(&names)?;
        for (path, layer) in tuned_layers_mut(&mut self.root) {
            if layer.merged() {
                tracing::warn!(module = %path, "adapter cannot be set when the model is merged, unmerging first");
                layer.unmerge()?;
            }
        }
        self.apply_trainability();
        Ok(())
    }

    /// Remove the named adapters everywhere. Layers left without adapters
    /// are replaced by their base layer; if no active adapter remains, the
    /// first remaining adapter becomes active.
    ///
    /// # Errors
    /// Returns a lookup error if any name is unknown; nothing is removed then.
    pub fn delete_adapter<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        for name in names {
            self.peft_config.require(name.as_ref())?;
        }
        for name in names {
            self.delete_one(name.as_ref())?;
        }
        Ok(())
    }

    fn delete_one(&mut self, name: &str) -> Result<()> {
        let paths: Vec<String> = tuned_layers(&self.root)
            .into_iter()
            .filter(|(_, layer)| layer.adapter(name).is_some())
            .map(|(path, _)| path)
            .collect();
        for path in paths {
            self.remove_from_layer(&path, name)?;
        }
        self.peft_config.remove(name);
        self.shared.remove(name);
        self.allocators.remove(name);
        if self.peft_config.active().is_empty() {
            if let Some(first) = self.peft_config.names().into_iter().next() {
                self.peft_config.set_active_unchecked(&[first]);
            }
        }
        self.apply_trainability();
        tracing::info!(adapter = name, "deleted adapter");
        Ok(())
    }

    fn remove_from_layer(&mut self, path: &str, name: &str) -> Result<()> {
        let Some(slot) = get_layer_mut(&mut self.root, path) else {
            return Ok(());
        };
        if let Layer::Tuned(tuned) = slot {
            tuned.delete_adapter(name)?;
            if !tuned.is_empty() {
                return Ok(());
            }
        } else {
            return Ok(());
        }
        restore_base(slot);
        Ok(())
    }

    fn check_names(&self, names: Option<&[String]>) -> Result<()> {
        for name in names.unwrap_or_default() {
            self.peft_config.require(name)?;
        }
        Ok(())
    }

    /// Merge the named (or active) adapters into the base weights.
    ///
    /// # Errors
    /// Returns a lookup error for unknown names, or
    /// [`PeftError::NonFiniteWeights`] from a safe merge.
    pub fn merge_adapter(&mut self, adapter_names: Option<&[String]>, safe_merge: bool) -> Result<()> {
        self.check_names(adapter_names)?;
        for (_, layer) in tuned_layers_mut(&mut self.root) {
            layer.merge(adapter_names, safe_merge)?;
        }
        Ok(())
    }

    /// Undo all merges.
    ///
    /// # Errors
    /// Returns an error if a layer fails to unmerge.
    pub fn unmerge_adapter(&mut self) -> Result<()> {
        let mut any = false;
        for (_, layer) in tuned_layers_mut(&mut self.root) {
            if layer.merged() {
                layer.unmerge()?;
                any = true;
            }
        }
        if !any {
            tracing::warn!("already unmerged, nothing to do");
        }
        Ok(())
    }

    /// Fold the named (or active) adapters into the base weights and return
    /// the plain network.
    ///
    /// # Errors
    /// Returns a lookup error for unknown names, or
    /// [`PeftError::NonFiniteWeights`] from a safe merge.
    pub fn merge_and_unload(
        mut self,
        adapter_names: Option<&[String]>,
        safe_merge: bool,
        progress: bool,
    ) -> Result<Layer> {
        self.check_names(adapter_names)?;
        self.unload_layers(true, adapter_names, safe_merge, progress)?;
        Ok(self.root)
    }

    /// Remove all adapter scaffolding without merging and return the plain
    /// network. Merged layers are unmerged first, so the deltas are gone.
    ///
    /// # Errors
    /// Returns an error if unmerging fails.
    pub fn unload(mut self) -> Result<Layer> {
        self.unload_layers(false, None, false, false)?;
        Ok(self.root)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn unload_layers(
        &mut self,
        merge: bool,
        adapter_names: Option<&[String]>,
        safe_merge: bool,
        progress: bool,
    ) -> Result<()> {
        let paths: Vec<String> = tuned_layers(&self.root).into_iter().map(|(p, _)| p).collect();
        let bar = if progress {
            ProgressBar::new(paths.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar().template("Unloading model {bar:40} {pos}/{len}") {
            bar.set_style(style);
        }
        for path in paths {
            if let Some(slot) = get_layer_mut(&mut self.root, &path) {
                if let Layer::Tuned(tuned) = slot {
                    if merge {
                        tuned.merge(adapter_names, safe_merge)?;
                    } else if tuned.merged() {
                        tuned.unmerge()?;
                    }
                }
                restore_base(slot);
            }
            bar.inc(1);
        }
        bar.finish_and_clear();
        Ok(())
    }

    /// Route forwards through the adapters again.
    ///
    /// # Errors
    /// Never fails today; kept fallible like its counterpart.
    pub fn enable_adapter_layers(&mut self) -> Result<()> {
        for (_, layer) in tuned_layers_mut(&mut self.root) {
            layer.enable_adapters(true)?;
        }
        Ok(())
    }

    /// Bypass every adapter; merged layers are unmerged.
    ///
    /// # Errors
    /// Returns an error if unmerging fails.
    pub fn disable_adapter_layers(&mut self) -> Result<()> {
        for (_, layer) in tuned_layers_mut(&mut self.root) {
            layer.enable_adapters(false)?;
        }
        Ok(())
    }

    /// Run `f` with all adapters bypassed, then restore the previous state,
    /// re-merging every layer that was merged on entry.
    ///
    /// # Errors
    /// Returns the error of `f`, or an error from toggling the layers.
    pub fn with_adapters_disabled<T>(&mut self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let scope = self.enter_disabled()?;
        let result = f(&*self);
        self.exit_disabled(scope)?;
        result
    }

    /// Disable every layer, remembering what to restore.
    pub(crate) fn enter_disabled(&mut self) -> Result<DisabledScope> {
        let merged: Vec<(String, Vec<String>)> = tuned_layers(&self.root)
            .into_iter()
            .filter(|(_, layer)| layer.merged())
            .map(|(path, layer)| (path, layer.merged_adapters().to_vec()))
            .collect();
        let was_disabled: Vec<String> = tuned_layers(&self.root)
            .into_iter()
            .filter(|(_, layer)| layer.disabled())
            .map(|(path, _)| path)
            .collect();
        self.disable_adapter_layers()?;
        Ok(DisabledScope { merged, was_disabled })
    }

    /// Undo [`Self::enter_disabled`], re-merging layers merged on entry.
    pub(crate) fn exit_disabled(&mut self, scope: DisabledScope) -> Result<()> {
        for (path, layer) in tuned_layers_mut(&mut self.root) {
            if !scope.was_disabled.contains(&path) {
                layer.enable_adapters(true)?;
            }
        }
        for (path, names) in scope.merged {
            if let Some(Layer::Tuned(layer)) = get_layer_mut(&mut self.root, &path) {
                layer.merge(Some(&names), false)?;
            }
        }
        Ok(())
    }

    /// Forward pass in inference mode.
    ///
    /// # Errors
    /// Returns an error if the network forward fails.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.root.forward(xs, &mut ForwardContext::new())
    }

    /// Forward pass with a caller-provided context.
    ///
    /// # Errors
    /// Returns an error if the network forward fails.
    pub fn forward_with_context(&self, xs: &Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        self.root.forward(xs, ctx)
    }

    /// Trainable and total parameter counts, shared adapter tensors included.
    #[must_use]
    pub fn get_nb_trainable_parameters(&self) -> (usize, usize) {
        let (mut trainable, mut total) = parameter_counts(&self.root);
        for shared in self.shared.values() {
            for (_, param) in shared.parameters() {
                total += param.elem_count();
                if param.requires_grad() {
                    trainable += param.elem_count();
                }
            }
        }
        (trainable, total)
    }

    /// Log the trainable parameter report.
    #[allow(clippy::cast_precision_loss)]
    pub fn print_trainable_parameters(&self) {
        let (trainable, total) = self.get_nb_trainable_parameters();
        let percent = if total == 0 {
            0.0
        } else {
            100.0 * trainable as f64 / total as f64
        };
        tracing::info!(
            "trainable params: {} || all params: {} || trainable%: {percent:.4}",
            format_parameter_count(trainable),
            format_parameter_count(total)
        );
    }

    /// Variables an optimizer should update.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars: Vec<Var> = named_parameters(&self.root)
            .into_iter()
            .filter(|(_, p)| p.requires_grad())
            .map(|(_, p)| p.var().clone())
            .collect();
        for shared in self.shared.values() {
            vars.extend(
                shared
                    .parameters()
                    .into_iter()
                    .filter(|(_, p)| p.requires_grad())
                    .map(|(_, p)| p.var().clone()),
            );
        }
        vars
    }

    fn device(&self) -> Device {
        named_parameters(&self.root)
            .first()
            .map_or(Device::Cpu, |(_, p)| p.var().device().clone())
    }

    /// Checkpoint tensors of adapter `adapter_name`.
    ///
    /// Layer parameters are keyed `{param}.{module_path}.{adapter}`, shared
    /// tensors `{param}.{adapter}` and `modules_to_save` parameters
    /// `modules_to_save.{module_path}.{param}`.
    ///
    /// # Errors
    /// Returns a lookup error if the adapter is unknown.
    pub fn get_peft_model_state_dict(&self, adapter_name: &str) -> Result<HashMap<String, Tensor>> {
        let config = self.peft_config.require(adapter_name)?;
        let mut state = HashMap::new();
        for (path, layer) in tuned_layers(&self.root) {
            for (local, param) in layer.adapter_parameters(adapter_name) {
                state.insert(adapter_key(local, &path, adapter_name), param.value().detach());
            }
        }
        if let Some(shared) = self.shared.get(adapter_name) {
            let save = match (shared, config) {
                (SharedParams::VeraProjection { .. }, PeftConfig::Vera(c)) => c.save_projection,
                (SharedParams::VectorBank { .. }, _) => true,
                _ => false,
            };
            if save {
                for (local, param) in shared.parameters() {
                    state.insert(adapter_key(local, "", adapter_name), param.value().detach());
                }
            }
        }
        for (name, param) in named_parameters(&self.root) {
            if self.modules_to_save.iter().any(|m| is_under(&name, m)) {
                state.insert(format!("{MODULES_TO_SAVE_PREFIX}.{name}"), param.value().detach());
            }
        }
        Ok(state)
    }

    /// Load checkpoint tensors into adapter `adapter_name`.
    ///
    /// Every layer parameter must be present. Missing `VeRA` projections are
    /// kept as regenerated from the seed. Unexpected keys are reported and
    /// ignored.
    ///
    /// # Errors
    /// Returns a lookup error if the adapter is unknown, or
    /// [`PeftError::WeightLoad`] / [`PeftError::ShapeMismatch`] for missing or
    /// mis-shaped tensors.
    pub fn set_peft_model_state_dict(
        &mut self,
        mut state: HashMap<String, Tensor>,
        adapter_name: &str,
    ) -> Result<()> {
        self.peft_config.require(adapter_name)?;
        for (path, layer) in tuned_layers(&self.root) {
            for (local, param) in layer.adapter_parameters(adapter_name) {
                param.set(&take_tensor(&mut state, &adapter_key(local, &path, adapter_name))?)?;
            }
        }
        if let Some(shared) = self.shared.get(adapter_name) {
            for (local, param) in shared.parameters() {
                let key = adapter_key(local, "", adapter_name);
                match state.remove(&key) {
                    Some(tensor) => param.set(&tensor)?,
                    None if matches!(shared, SharedParams::VectorBank { .. }) => {
                        return Err(PeftError::WeightLoad(format!(
                            "missing tensor '{key}' in state dict"
                        )));
                    }
                    None => {
                        tracing::info!(adapter = adapter_name, "projections not in checkpoint, using the seeded ones");
                    }
                }
            }
        }
        for (name, param) in named_parameters(&self.root) {
            if let Some(tensor) = state.remove(&format!("{MODULES_TO_SAVE_PREFIX}.{name}")) {
                param.set(&tensor)?;
            }
        }
        if !state.is_empty() {
            let mut unexpected: Vec<String> = state.into_keys().collect();
            unexpected.sort();
            tracing::warn!(?unexpected, "unexpected keys in adapter state dict");
        }
        Ok(())
    }

    /// Save adapters to `dir`: `default` directly in it, others in
    /// `dir/{name}`. Configs are saved in inference mode.
    ///
    /// # Errors
    /// Returns a lookup error for unknown names or an I/O error.
    pub fn save_pretrained(&self, dir: impl AsRef<Path>, adapter_names: Option<&[String]>) -> Result<()> {
        self.check_names(adapter_names)?;
        let names = adapter_names.map_or_else(|| self.peft_config.names(), <[String]>::to_vec);
        let dir = dir.as_ref();
        for name in &names {
            let mut config = self.peft_config.require(name)?.clone();
            config.set_inference_mode(true);
            let out = if name == DEFAULT_ADAPTER_NAME {
                dir.to_path_buf()
            } else {
                dir.join(name)
            };
            fs::create_dir_all(&out)
                .map_err(|e| PeftError::Io(format!("failed to create {}: {e}", out.display())))?;
            save_tensors(
                &self.get_peft_model_state_dict(name)?,
                out.join(ADAPTER_WEIGHTS_FILENAME),
            )?;
            save_adapter_config(&config, out.join(ADAPTER_CONFIG_FILENAME))?;
            tracing::info!(adapter = %name, path = %out.display(), "saved adapter");
        }
        Ok(())
    }

    /// Wrap `root` with the adapter saved in `dir`.
    ///
    /// # Errors
    /// Returns an error if the checkpoint cannot be read or does not match
    /// the network.
    pub fn from_pretrained(
        root: Layer,
        dir: impl AsRef<Path>,
        adapter_name: &str,
        is_trainable: bool,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let mut config: PeftConfig = load_adapter_config(dir.join(ADAPTER_CONFIG_FILENAME))?;
        config.set_inference_mode(!is_trainable);
        let mut model = Self::new(root, config, adapter_name)?;
        model.load_weights(dir, adapter_name)?;
        Ok(model)
    }

    /// Add the adapter saved in `dir` under `adapter_name`.
    ///
    /// A failed load removes the half-added adapter again.
    ///
    /// # Errors
    /// Returns [`PeftError::AdapterExists`] if the name is taken, or an error
    /// if the checkpoint cannot be read or does not match the network.
    pub fn load_adapter(&mut self, dir: impl AsRef<Path>, adapter_name: &str, is_trainable: bool) -> Result<()> {
        if self.peft_config.contains(adapter_name) {
            return Err(PeftError::AdapterExists {
                name: adapter_name.to_string(),
            });
        }
        let dir = dir.as_ref();
        let mut config: PeftConfig = load_adapter_config(dir.join(ADAPTER_CONFIG_FILENAME))?;
        config.set_inference_mode(!is_trainable);
        self.add_adapter(adapter_name, config)?;
        if let Err(e) = self.load_weights(dir, adapter_name) {
            self.delete_adapter(&[adapter_name])?;
            return Err(e);
        }
        Ok(())
    }

    fn load_weights(&mut self, dir: &Path, adapter_name: &str) -> Result<()> {
        let path = dir.join(ADAPTER_WEIGHTS_FILENAME);
        let tensors = rename_adapter(load_tensors(&path, &self.device())?, adapter_name);
        self.set_peft_model_state_dict(tensors, adapter_name)?;
        tracing::info!(adapter = adapter_name, path = %path.display(), "loaded adapter");
        Ok(())
    }

    /// The single trainable, active AdaLoRA adapter.
    fn trainable_adalora(&self) -> Result<(&str, &adalora::AdaLoraConfig)> {
        self.peft_config
            .iter()
            .find_map(|(name, config)| match config {
                PeftConfig::AdaLora(c)
                    if !c.base.inference_mode && self.peft_config.active().iter().any(|a| a == name) =>
                {
                    Some((name, c))
                }
                _ => None,
            })
            .ok_or_else(|| PeftError::InvalidConfig("no active trainable AdaLoRA adapter".into()))
    }

    /// AdaLoRA budget step: update importance scores from `grads` and mask
    /// singular values down to the budget of `step`.
    ///
    /// Returns the budget when masking happened.
    ///
    /// # Errors
    /// Returns an error if there is no trainable AdaLoRA adapter or the
    /// config has no `total_step`.
    pub fn update_and_allocate(&mut self, grads: &GradStore, step: usize) -> Result<Option<usize>> {
        let (name, config) = {
            let (name, config) = self.trainable_adalora()?;
            (name.to_string(), config.clone())
        };
        let layers: Vec<(String, &AdaLoraAdapter)> = adalora_layers(&self.root, &name);
        let allocator = match self.allocators.entry(name) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(RankAllocator::new(&config, layers.len())?),
        };
        allocator.update_and_allocate(&layers, grads, step)
    }

    /// AdaLoRA orthogonal regularization term, to be added to the loss.
    ///
    /// # Errors
    /// Returns an error if there is no trainable AdaLoRA adapter.
    pub fn orthogonal_regularization(&self) -> Result<Tensor> {
        let (name, config) = self.trainable_adalora()?;
        let layers = adalora_layers(&self.root, name);
        let adapters: Vec<&AdaLoraAdapter> = layers.iter().map(|(_, a)| *a).collect();
        adalora::orthogonal_regularization(&adapters, config.orth_reg_weight)
    }
}

fn adalora_layers<'a>(root: &'a Layer, name: &str) -> Vec<(String, &'a AdaLoraAdapter)> {
    tuned_layers(root)
        .into_iter()
        .filter_map(|(path, layer)| {
            layer
                .adapter(name)
                .and_then(|a| a.as_any().downcast_ref::<AdaLoraAdapter>())
                .map(|a| (path, a))
        })
        .collect()
}

/// Whether `path` is `module` or lies below it.
fn is_under(path: &str, module: &str) -> bool {
    path.strip_prefix(module)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

/// Replace a wrapped layer by its base layer; other nodes are left alone.
fn restore_base(slot: &mut Layer) {
    match std::mem::replace(slot, Layer::Identity) {
        Layer::Tuned(tuned) => *slot = Layer::Base(tuned.into_base()),
        other => *slot = other,
    }
}

/// Re-key a single-adapter checkpoint to `adapter_name`.
fn rename_adapter(state: HashMap<String, Tensor>, adapter_name: &str) -> HashMap<String, Tensor> {
    state
        .into_iter()
        .map(|(key, tensor)| {
            if key.starts_with(MODULES_TO_SAVE_PREFIX) {
                return (key, tensor);
            }
            let renamed = parse_adapter_key(&key)
                .map(|(param, path, _)| adapter_key(param, path, adapter_name));
            (renamed.unwrap_or(key), tensor)
        })
        .collect()
}

fn validate_adapter_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('.') {
        return Err(PeftError::InvalidConfig(format!(
            "adapter name '{name}' must be non-empty and must not contain '.'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::adalora::AdaLoraConfig;
    use crate::adapters::ia3::Ia3Config;
    use crate::adapters::loha::LoHaConfig;
    use crate::adapters::lokr::LoKrConfig;
    use crate::adapters::lora::{LoraConfig, LoraInitialization};
    use crate::adapters::vblora::VbLoraConfig;
    use crate::adapters::vera::VeraConfig;
    use crate::config::BaseAdapterConfig;
    use crate::nn::get_layer;
    use crate::nn::testing::{conv_net, embedding_net, max_abs_diff, two_layer, Mlp};
    use candle_nn::{Optimizer, SGD};
    use tempfile::TempDir;

    fn random_lora(r: usize, targets: &[&str]) -> LoraConfig {
        LoraConfig {
            init_lora_weights: LoraInitialization::Random,
            ..LoraConfig::new(r, 2 * r, targets.iter().copied())
        }
    }

    fn run(model: &PeftModel, xs: &Tensor) -> Result<Tensor> {
        model.forward(xs)
    }

    /// Wrap `root` and move every adapter tensor away from its initial value.
    fn perturbed(root: Layer, config: impl Into<PeftConfig>) -> Result<PeftModel> {
        let mut model = PeftModel::new(root, config, "default")?;
        let mut state = model.get_peft_model_state_dict("default")?;
        for tensor in state.values_mut() {
            *tensor = (&*tensor + tensor.randn_like(0.0, 0.2)?)?;
        }
        model.set_peft_model_state_dict(state, "default")?;
        Ok(model)
    }

    fn base_weight(model: &PeftModel, path: &str) -> Result<Tensor> {
        match get_layer(model.base_model(), path) {
            Some(Layer::Tuned(tuned)) => Ok(tuned.base_layer().weights().weight.copy()?),
            _ => Err(PeftError::StateConflict(format!("{path} is not tuned"))),
        }
    }

    fn every_family(targets: [&str; 2]) -> Vec<PeftConfig> {
        let base = || BaseAdapterConfig::targeting(targets);
        vec![
            random_lora(2, &targets).into(),
            LoHaConfig { r: 2, init_weights: false, base: base(), ..LoHaConfig::default() }.into(),
            LoKrConfig { r: 2, base: base(), ..LoKrConfig::default() }.into(),
            AdaLoraConfig { init_r: 4, target_r: 2, base: base(), ..AdaLoraConfig::default() }.into(),
            Ia3Config { feedforward_modules: vec![], base: base(), ..Ia3Config::default() }.into(),
            VeraConfig { r: 4, base: base(), ..VeraConfig::default() }.into(),
            VbLoraConfig {
                r: 2,
                num_vectors: 16,
                vector_length: 4,
                topk: 2,
                base: base(),
                ..VbLoraConfig::default()
            }
            .into(),
        ]
    }

    #[test]
    fn test_two_layer_train_then_merge_and_unload() -> Result<()> {
        let device = Device::Cpu;
        let root = two_layer(&device)?;
        let xs = Tensor::randn(0f32, 1.0, (5, 10), &device)?;
        let plain = root.forward(&xs, &mut ForwardContext::new())?;

        let mut model = PeftModel::new(root, LoraConfig::new(4, 8, ["lin0", "lin1"]), "default")?;
        assert_eq!(max_abs_diff(&run(&model, &xs)?, &plain)?, 0.0);

        let mut sgd = SGD::new(model.trainable_vars(), 0.5)?;
        let loss = model
            .forward_with_context(&xs, &mut ForwardContext::train())?
            .sqr()?
            .mean_all()?;
        sgd.backward_step(&loss)?;
        let adapted = run(&model, &xs)?;
        assert!(max_abs_diff(&adapted, &plain)? > 1e-6);

        let merged = model.merge_and_unload(None, true, false)?;
        assert!(matches!(get_layer(&merged, "lin0"), Some(Layer::Base(_))));
        let out = merged.forward(&xs, &mut ForwardContext::new())?;
        assert!(max_abs_diff(&out, &adapted)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_base_frozen_and_counts() -> Result<()> {
        let model = PeftModel::new(Mlp::layer(&Device::Cpu)?, LoraConfig::new(2, 4, ["lin0"]), "default")?;
        let (trainable, total) = model.get_nb_trainable_parameters();
        // lora_A [2, 10] + lora_B [20, 2]
        assert_eq!(trainable, 2 * 10 + 20 * 2);
        assert_eq!(total, 10 * 20 + 20 + 2 * (20 * 20 + 20) + 20 * 2 + 2 + trainable);
        assert_eq!(model.trainable_vars().len(), 2);
        Ok(())
    }

    #[test]
    fn test_overlapping_targets_switching() -> Result<()> {
        let device = Device::Cpu;
        let xs = Tensor::randn(0f32, 1.0, (3, 10), &device)?;
        let mut model = PeftModel::new(Mlp::layer(&device)?, random_lora(2, &["lin0", "lin1"]), "a")?;
        let only_a = run(&model, &xs)?;

        model.add_adapter("b", random_lora(4, &["lin1", "lin3"]))?;
        assert_eq!(model.active_adapters(), &["a".to_string()]);
        assert_eq!(max_abs_diff(&run(&model, &xs)?, &only_a)?, 0.0);

        model.set_adapter(&["b"])?;
        let with_b = run(&model, &xs)?;
        assert!(max_abs_diff(&with_b, &only_a)? > 1e-6);

        model.set_adapter(&["a"])?;
        assert_eq!(max_abs_diff(&run(&model, &xs)?, &only_a)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_switching_reproduces_single_adapter_output() -> Result<()> {
        let device = Device::Cpu;
        let weights = Mlp::random_weights(&device)?;
        let xs = Tensor::randn(0f32, 1.0, (3, 10), &device)?;
        let single = PeftModel::new(Mlp::from_weights(&weights)?, random_lora(4, &["lin1", "lin3"]), "b")?;
        let expected = run(&single, &xs)?;

        let mut model = PeftModel::new(Mlp::from_weights(&weights)?, random_lora(2, &["lin0", "lin1"]), "a")?;
        model.add_adapter("b", random_lora(4, &["lin1", "lin3"]))?;
        model.set_peft_model_state_dict(single.get_peft_model_state_dict("b")?, "b")?;
        model.set_adapter(&["b"])?;
        assert!(max_abs_diff(&run(&model, &xs)?, &expected)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_every_family_merge_and_unmerge() -> Result<()> {
        let device = Device::Cpu;
        let weights = Mlp::random_weights(&device)?;
        let xs = Tensor::randn(0f32, 1.0, (4, 10), &device)?;
        for config in every_family(["lin1", "lin2"]) {
            let family = config.peft_type();
            let mut model = perturbed(Mlp::from_weights(&weights)?, config)?;
            let adapted = run(&model, &xs)?;
            let original = base_weight(&model, "lin1")?;

            model.merge_adapter(None, true)?;
            assert!(max_abs_diff(&run(&model, &xs)?, &adapted)? < 1e-4, "{family}: merged forward");
            model.unmerge_adapter()?;
            assert!(max_abs_diff(&base_weight(&model, "lin1")?, &original)? < 1e-4, "{family}: unmerge");
            assert!(max_abs_diff(&run(&model, &xs)?, &adapted)? < 1e-4, "{family}: after unmerge");

            let merged = model.merge_and_unload(None, false, false)?;
            let out = merged.forward(&xs, &mut ForwardContext::new())?;
            assert!(max_abs_diff(&out, &adapted)? < 1e-4, "{family}: merge_and_unload");
        }
        Ok(())
    }

    #[test]
    fn test_conv_and_embedding_lora_merge_equivalence() -> Result<()> {
        let device = Device::Cpu;
        let images = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device)?;
        let model = perturbed(conv_net(&device)?, random_lora(2, &["conv0", "conv1"]))?;
        let adapted = run(&model, &images)?;
        let merged = model.merge_and_unload(None, true, false)?;
        let out = merged.forward(&images, &mut ForwardContext::new())?;
        assert!(max_abs_diff(&out, &adapted)? < 1e-4);

        let ids = Tensor::new(&[[1u32, 5, 7], [3, 49, 0]], &device)?;
        let model = perturbed(embedding_net(&device)?, random_lora(2, &["emb", "proj"]))?;
        let adapted = run(&model, &ids)?;
        let merged = model.merge_and_unload(None, true, false)?;
        let out = merged.forward(&ids, &mut ForwardContext::new())?;
        assert!(max_abs_diff(&out, &adapted)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_merge_while_disabled_keeps_base_output() -> Result<()> {
        let device = Device::Cpu;
        let weights = Mlp::random_weights(&device)?;
        let xs = Tensor::randn(0f32, 1.0, (4, 10), &device)?;
        let plain = Mlp::from_weights(&weights)?.forward(&xs, &mut ForwardContext::new())?;
        let mut model = PeftModel::new(Mlp::from_weights(&weights)?, random_lora(2, &["lin0", "lin1"]), "default")?;
        let adapted = run(&model, &xs)?;

        model.disable_adapter_layers()?;
        model.merge_adapter(None, false)?;
        assert_eq!(max_abs_diff(&run(&model, &xs)?, &plain)?, 0.0);
        assert!(tuned_layers(model.base_model()).iter().all(|(_, l)| !l.merged()));

        model.enable_adapter_layers()?;
        assert!(max_abs_diff(&run(&model, &xs)?, &adapted)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_delete_several_adapters_at_once() -> Result<()> {
        let mut model = PeftModel::new(Mlp::layer(&Device::Cpu)?, LoraConfig::new(2, 4, ["lin0"]), "a")?;
        model.add_adapter("b", LoraConfig::new(2, 4, ["lin1"]))?;
        model.add_adapter("c", LoraConfig::new(2, 4, ["lin2"]))?;
        assert!(model.delete_adapter(&["b", "missing"]).is_err());
        assert_eq!(model.adapter_names().len(), 3);
        model.delete_adapter(&["a", "b"])?;
        assert_eq!(model.adapter_names(), vec!["c".to_string()]);
        assert_eq!(model.active_adapters(), &["c".to_string()]);
        assert!(matches!(get_layer(model.base_model(), "lin1"), Some(Layer::Base(_))));
        Ok(())
    }

    #[test]
    fn test_set_adapter_unknown_lists_names() -> Result<()> {
        let mut model = PeftModel::new(Mlp::layer(&Device::Cpu)?, LoraConfig::new(2, 4, ["lin0"]), "default")?;
        match model.set_adapter(&["nope"]) {
            Err(PeftError::AdapterNotFound { available, .. }) => {
                assert_eq!(available, vec!["default".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_failed_add_leaves_model_unchanged() -> Result<()> {
        let mut model = PeftModel::new(Mlp::layer(&Device::Cpu)?, LoraConfig::new(2, 4, ["lin0"]), "default")?;
        let err = model.add_adapter("other", LoraConfig::new(2, 4, ["missing"]));
        assert!(matches!(err, Err(PeftError::TargetNotFound { .. })));
        let err = model.add_adapter("bad.name", LoraConfig::new(2, 4, ["lin1"]));
        assert!(matches!(err, Err(PeftError::InvalidConfig(_))));
        let ia3 = Ia3Config {
            feedforward_modules: vec![],
            base: BaseAdapterConfig::targeting(["lin1"]),
            ..Ia3Config::default()
        };
        let err = model.add_adapter("ia3", ia3);
        assert!(matches!(err, Err(PeftError::IncompatibleAdapter { .. })));
        assert_eq!(model.adapter_names(), vec!["default".to_string()]);
        assert!(matches!(get_layer(model.base_model(), "lin1"), Some(Layer::Base(_))));
        Ok(())
    }

    #[test]
    fn test_delete_restores_base_layers() -> Result<()> {
        let mut model = PeftModel::new(Mlp::layer(&Device::Cpu)?, LoraConfig::new(2, 4, ["lin0"]), "a")?;
        model.add_adapter("b", LoraConfig::new(2, 4, ["lin0", "lin2"]))?;
        model.delete_adapter(&["a"])?;
        assert_eq!(model.active_adapters(), &["b".to_string()]);
        model.delete_adapter(&["b"])?;
        assert!(matches!(get_layer(model.base_model(), "lin0"), Some(Layer::Base(_))));
        assert!(matches!(get_layer(model.base_model(), "lin2"), Some(Layer::Base(_))));
        assert!(model.delete_adapter(&["b"]).is_err());
        Ok(())
    }

    #[test]
    fn test_disabled_scope_round_trip() -> Result<()> {
        let device = Device::Cpu;
        let weights = Mlp::random_weights(&device)?;
        let xs = Tensor::randn(0f32, 1.0, (4, 10), &device)?;
        let plain = Mlp::from_weights(&weights)?.forward(&xs, &mut ForwardContext::new())?;
        let mut model = PeftModel::new(Mlp::from_weights(&weights)?, random_lora(2, &["lin0", "lin2"]), "default")?;
        let before = run(&model, &xs)?;

        let inside = model.with_adapters_disabled(|m| run(m, &xs))?;
        assert_eq!(max_abs_diff(&inside, &plain)?, 0.0);
        assert_eq!(max_abs_diff(&run(&model, &xs)?, &before)?, 0.0);

        model.merge_adapter(None, false)?;
        let inside = model.with_adapters_disabled(|m| run(m, &xs))?;
        assert!(max_abs_diff(&inside, &plain)? < 1e-5);
        assert!(tuned_layers(model.base_model()).iter().all(|(_, l)| l.merged()));
        assert!(max_abs_diff(&run(&model, &xs)?, &before)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_save_load_round_trip() -> Result<()> {
        let device = Device::Cpu;
        let weights = Mlp::random_weights(&device)?;
        let xs = Tensor::randn(0f32, 1.0, (4, 10), &device)?;
        let dir = TempDir::new().map_err(|e| PeftError::Io(e.to_string()))?;

        let mut model = PeftModel::new(Mlp::from_weights(&weights)?, random_lora(2, &["lin0", "lin3"]), "default")?;
        model.add_adapter("other", random_lora(3, &["lin1"]))?;
        let expected = run(&model, &xs)?;
        model.save_pretrained(dir.path(), None)?;
        assert!(dir.path().join(ADAPTER_WEIGHTS_FILENAME).exists());
        assert!(dir.path().join("other").join(ADAPTER_CONFIG_FILENAME).exists());

        let mut loaded = PeftModel::from_pretrained(Mlp::from_weights(&weights)?, dir.path(), "default", false)?;
        assert!(max_abs_diff(&run(&loaded, &xs)?, &expected)? < 1e-3);
        assert_eq!(loaded.get_nb_trainable_parameters().0, 0);

        loaded.load_adapter(dir.path().join("other"), "other", true)?;
        assert!(loaded.load_adapter(dir.path().join("other"), "other", true).is_err());
        loaded.set_adapter(&["other"])?;
        model.set_adapter(&["other"])?;
        assert!(max_abs_diff(&run(&loaded, &xs)?, &run(&model, &xs)?)? < 1e-3);
        Ok(())
    }

    #[test]
    fn test_modules_to_save_trainable_and_saved() -> Result<()> {
        let config = LoraConfig {
            base: BaseAdapterConfig {
                modules_to_save: vec!["lin3".into()],
                ..BaseAdapterConfig::targeting(["lin0"])
            },
            ..LoraConfig::new(2, 4, ["lin0"])
        };
        let model = PeftModel::new(Mlp::layer(&Device::Cpu)?, config, "default")?;
        let (trainable, _) = model.get_nb_trainable_parameters();
        assert_eq!(trainable, 2 * 10 + 20 * 2 + 2 * 20 + 2);
        let state = model.get_peft_model_state_dict("default")?;
        assert!(state.contains_key("modules_to_save.lin3.weight"));
        assert!(state.contains_key("lora_A.lin0.default"));
        Ok(())
    }

    #[test]
    fn test_shared_vector_bank_saved_once() -> Result<()> {
        let config = VbLoraConfig {
            r: 2,
            num_vectors: 8,
            vector_length: 2,
            topk: 2,
            base: BaseAdapterConfig::targeting(["lin1", "lin2"]),
            ..VbLoraConfig::default()
        };
        let model = PeftModel::new(Mlp::layer(&Device::Cpu)?, config, "default")?;
        let state = model.get_peft_model_state_dict("default")?;
        assert!(state.contains_key("vblora_vector_bank.default"));
        assert!(state.contains_key("vblora_logits_A.lin1.default"));
        assert_eq!(state.len(), 5);
        Ok(())
    }
}
