//! Configuration types for PEFT adapters.
//!
//! Every weight-injecting family has its own config struct (next to its
//! implementation in [`crate::adapters`]); they share a flattened
//! [`BaseAdapterConfig`] describing which modules to target. [`PeftConfig`]
//! is the tagged union persisted as `adapter_config.json`.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::adapters::adalora::AdaLoraConfig;
use crate::adapters::glora::GLoraConfig;
use crate::adapters::ia3::Ia3Config;
use crate::adapters::loha::LoHaConfig;
use crate::adapters::lokr::LoKrConfig;
use crate::adapters::lora::LoraConfig;
use crate::adapters::vblora::VbLoraConfig;
use crate::adapters::vera::VeraConfig;
use crate::error::{PeftError, Result};
use crate::traits::AdapterConfig;

/// Adapter family identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PeftType {
    /// Low-rank adaptation
    #[serde(rename = "LORA")]
    Lora,
    /// Low-rank Hadamard product
    #[serde(rename = "LOHA")]
    LoHa,
    /// Low-rank Kronecker product
    #[serde(rename = "LOKR")]
    LoKr,
    /// Adaptive budget low-rank adaptation
    #[serde(rename = "ADALORA")]
    AdaLora,
    /// Learned activation rescaling
    #[serde(rename = "IA3")]
    Ia3,
    /// Shared random projections with trainable scaling vectors
    #[serde(rename = "VERA")]
    Vera,
    /// Shared vector bank with top-k selection
    #[serde(rename = "VBLORA")]
    VbLora,
    /// Generalized LoRA with searchable sub-paths
    #[serde(rename = "GLORA")]
    GLora,
    /// Mixture of LoRA experts with a learned router
    #[serde(rename = "XLORA")]
    XLora,
    /// Progressive compression LoRA
    #[serde(rename = "PCLORA")]
    PcLora,
    /// Gated prompts attached to attention blocks
    #[serde(rename = "ADAPTION_PROMPT")]
    AdaptionPrompt,
    /// Soft prompt prepended to the input embeddings
    #[serde(rename = "PROMPT_TUNING")]
    PromptTuning,
    /// Soft prompt with per-task low-rank modulation
    #[serde(rename = "MULTITASK_PROMPT_TUNING")]
    MultitaskPromptTuning,
    /// Trainable key/value prefixes for every attention layer
    #[serde(rename = "PREFIX_TUNING")]
    PrefixTuning,
}

impl fmt::Display for PeftType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lora => "LORA",
            Self::LoHa => "LOHA",
            Self::LoKr => "LOKR",
            Self::AdaLora => "ADALORA",
            Self::Ia3 => "IA3",
            Self::Vera => "VERA",
            Self::VbLora => "VBLORA",
            Self::GLora => "GLORA",
            Self::XLora => "XLORA",
            Self::PcLora => "PCLORA",
            Self::AdaptionPrompt => "ADAPTION_PROMPT",
            Self::PromptTuning => "PROMPT_TUNING",
            Self::MultitaskPromptTuning => "MULTITASK_PROMPT_TUNING",
            Self::PrefixTuning => "PREFIX_TUNING",
        };
        f.write_str(name)
    }
}

/// Pattern for matching module names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModulePattern {
    /// Match a module by name: the full path or its last dotted components
    Name(String),
    /// Match modules ending with `.suffix` (e.g., `*.attention`)
    Suffix(String),
    /// Match modules starting with `prefix.` (e.g., `layer.*`)
    Prefix(String),
    /// Match all modules
    All,
}

impl ModulePattern {
    /// Parse a pattern string into a `ModulePattern`.
    ///
    /// # Examples
    /// - `"q_proj"` -> `Name`, matches `layers.0.q_proj`
    /// - `"*.attention"` -> `Suffix`
    /// - `"layer.*"` -> `Prefix`
    /// - `"*"` -> `All`
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        match pattern {
            "*" => Self::All,
            s if s.starts_with("*.") => Self::Suffix(s[2..].to_string()),
            s if s.ends_with(".*") => Self::Prefix(s[..s.len() - 2].to_string()),
            s => Self::Name(s.to_string()),
        }
    }

    /// Check if a module name matches this pattern.
    #[must_use]
    pub fn matches(&self, module_name: &str) -> bool {
        match self {
            Self::Name(name) => {
                module_name == name
                    || module_name
                        .strip_suffix(name.as_str())
                        .is_some_and(|head| head.ends_with('.'))
            }
            Self::Suffix(suffix) => module_name
                .strip_suffix(suffix.as_str())
                .is_some_and(|head| head.ends_with('.')),
            Self::Prefix(prefix) => module_name
                .strip_prefix(prefix.as_str())
                .is_some_and(|tail| tail.starts_with('.')),
            Self::All => !module_name.is_empty(),
        }
    }
}

/// Target modules: a list of names or a regex matched against the full path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetModules {
    /// Names or glob patterns, see [`ModulePattern`]
    Names(Vec<String>),
    /// Regular expression that must match the whole module path
    Regex(String),
}

impl TargetModules {
    /// Target a list of names.
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Names(names.into_iter().map(Into::into).collect())
    }

    /// Pattern strings for diagnostics.
    #[must_use]
    pub fn patterns(&self) -> Vec<String> {
        match self {
            Self::Names(names) => names.clone(),
            Self::Regex(re) => vec![re.clone()],
        }
    }
}

impl Default for TargetModules {
    fn default() -> Self {
        default_target_modules()
    }
}

fn default_target_modules() -> TargetModules {
    TargetModules::names(["q_proj", "v_proj"])
}

/// Common configuration shared across adapter types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseAdapterConfig {
    /// Target modules to apply adapters to (e.g., [`q_proj`, `v_proj`]).
    #[serde(default = "default_target_modules")]
    pub target_modules: TargetModules,

    /// Modules to exclude from adaptation, same syntax as name targets.
    #[serde(default)]
    pub exclude_modules: Vec<String>,

    /// Only adapt modules whose layer index is in this list.
    #[serde(default)]
    pub layers_to_transform: Option<Vec<usize>>,

    /// Path segment preceding the layer index (e.g., `layers`).
    #[serde(default)]
    pub layers_pattern: Option<String>,

    /// Modules kept fully trainable and saved with the adapter (e.g., a head).
    #[serde(default)]
    pub modules_to_save: Vec<String>,

    /// Freeze adapter parameters too.
    #[serde(default)]
    pub inference_mode: bool,
}

impl Default for BaseAdapterConfig {
    fn default() -> Self {
        Self {
            target_modules: default_target_modules(),
            exclude_modules: Vec::new(),
            layers_to_transform: None,
            layers_pattern: None,
            modules_to_save: Vec::new(),
            inference_mode: false,
        }
    }
}

impl BaseAdapterConfig {
    /// Config targeting the given module names.
    pub fn targeting<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target_modules: TargetModules::names(names),
            ..Self::default()
        }
    }
}

impl AdapterConfig for BaseAdapterConfig {
    fn validate(&self) -> Result<()> {
        match &self.target_modules {
            TargetModules::Names(names) if names.is_empty() => {
                return Err(PeftError::InvalidConfig(
                    "target_modules cannot be empty".into(),
                ));
            }
            TargetModules::Regex(re) => {
                Regex::new(re).map_err(|e| {
                    PeftError::InvalidConfig(format!("invalid target_modules regex: {e}"))
                })?;
            }
            TargetModules::Names(_) => {}
        }
        if self.layers_to_transform.as_ref().is_some_and(Vec::is_empty) {
            return Err(PeftError::InvalidConfig(
                "layers_to_transform cannot be an empty list".into(),
            ));
        }
        Ok(())
    }
}

/// Compiled form of a [`BaseAdapterConfig`]'s module selection.
#[derive(Debug)]
pub struct TargetMatcher {
    targets: Targets,
    exclude: Vec<ModulePattern>,
    layers_to_transform: Option<Vec<usize>>,
    layers_pattern: Option<String>,
}

#[derive(Debug)]
enum Targets {
    Patterns(Vec<ModulePattern>),
    Regex(Regex),
}

impl TargetMatcher {
    /// Compile the selection.
    ///
    /// # Errors
    ///
    /// Returns an error if the regex does not compile.
    pub fn new(config: &BaseAdapterConfig) -> Result<Self> {
        let targets = match &config.target_modules {
            TargetModules::Names(names) => {
                Targets::Patterns(names.iter().map(|n| ModulePattern::parse(n)).collect())
            }
            TargetModules::Regex(re) => Targets::Regex(
                Regex::new(&format!("^(?:{re})$"))
                    .map_err(|e| PeftError::InvalidConfig(format!("invalid target_modules regex: {e}")))?,
            ),
        };
        Ok(Self {
            targets,
            exclude: config
                .exclude_modules
                .iter()
                .map(|n| ModulePattern::parse(n))
                .collect(),
            layers_to_transform: config.layers_to_transform.clone(),
            layers_pattern: config.layers_pattern.clone(),
        })
    }

    /// Whether the module at `path` is selected.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        if path.is_empty() || self.exclude.iter().any(|p| p.matches(path)) {
            return false;
        }
        let hit = match &self.targets {
            Targets::Patterns(patterns) => patterns.iter().any(|p| p.matches(path)),
            Targets::Regex(re) => re.is_match(path),
        };
        if !hit {
            return false;
        }
        match &self.layers_to_transform {
            None => true,
            Some(indices) => layer_index(path, self.layers_pattern.as_deref())
                .is_some_and(|idx| indices.contains(&idx)),
        }
    }
}

/// Numeric layer index in a dotted path.
///
/// With a pattern, the index is the segment right after the pattern segment;
/// otherwise the first numeric segment.
#[must_use]
pub fn layer_index(path: &str, layers_pattern: Option<&str>) -> Option<usize> {
    let segments: Vec<&str> = path.split('.').collect();
    match layers_pattern {
        Some(pattern) => segments
            .windows(2)
            .find(|w| w[0] == pattern)
            .and_then(|w| w[1].parse().ok()),
        None => segments.iter().find_map(|s| s.parse().ok()),
    }
}

/// Configuration of one weight-injecting adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "peft_type")]
pub enum PeftConfig {
    /// `LoRA`
    #[serde(rename = "LORA")]
    Lora(LoraConfig),
    /// `LoHa`
    #[serde(rename = "LOHA")]
    LoHa(LoHaConfig),
    /// `LoKr`
    #[serde(rename = "LOKR")]
    LoKr(LoKrConfig),
    /// `AdaLoRA`
    #[serde(rename = "ADALORA")]
    AdaLora(AdaLoraConfig),
    /// IA³
    #[serde(rename = "IA3")]
    Ia3(Ia3Config),
    /// `VeRA`
    #[serde(rename = "VERA")]
    Vera(VeraConfig),
    /// VB-LoRA
    #[serde(rename = "VBLORA")]
    VbLora(VbLoraConfig),
    /// `GLoRA`
    #[serde(rename = "GLORA")]
    GLora(GLoraConfig),
}

impl PeftConfig {
    /// Adapter family.
    #[must_use]
    pub fn peft_type(&self) -> PeftType {
        match self {
            Self::Lora(_) => PeftType::Lora,
            Self::LoHa(_) => PeftType::LoHa,
            Self::LoKr(_) => PeftType::LoKr,
            Self::AdaLora(_) => PeftType::AdaLora,
            Self::Ia3(_) => PeftType::Ia3,
            Self::Vera(_) => PeftType::Vera,
            Self::VbLora(_) => PeftType::VbLora,
            Self::GLora(_) => PeftType::GLora,
        }
    }

    /// Shared target selection.
    #[must_use]
    pub fn base(&self) -> &BaseAdapterConfig {
        match self {
            Self::Lora(c) => &c.base,
            Self::LoHa(c) => &c.base,
            Self::LoKr(c) => &c.base,
            Self::AdaLora(c) => &c.base,
            Self::Ia3(c) => &c.base,
            Self::Vera(c) => &c.base,
            Self::VbLora(c) => &c.base,
            Self::GLora(c) => &c.base,
        }
    }

    /// Mutable shared target selection.
    pub fn base_mut(&mut self) -> &mut BaseAdapterConfig {
        match self {
            Self::Lora(c) => &mut c.base,
            Self::LoHa(c) => &mut c.base,
            Self::LoKr(c) => &mut c.base,
            Self::AdaLora(c) => &mut c.base,
            Self::Ia3(c) => &mut c.base,
            Self::Vera(c) => &mut c.base,
            Self::VbLora(c) => &mut c.base,
            Self::GLora(c) => &mut c.base,
        }
    }

    /// Whether adapter parameters are frozen.
    #[must_use]
    pub fn inference_mode(&self) -> bool {
        self.base().inference_mode
    }

    /// Set the inference-mode flag.
    pub fn set_inference_mode(&mut self, inference_mode: bool) {
        self.base_mut().inference_mode = inference_mode;
    }
}

impl AdapterConfig for PeftConfig {
    fn validate(&self) -> Result<()> {
        self.base().validate()?;
        match self {
            Self::Lora(c) => c.validate(),
            Self::LoHa(c) => c.validate(),
            Self::LoKr(c) => c.validate(),
            Self::AdaLora(c) => c.validate(),
            Self::Ia3(c) => c.validate(),
            Self::Vera(c) => c.validate(),
            Self::VbLora(c) => c.validate(),
            Self::GLora(c) => c.validate(),
        }
    }
}

impl From<LoraConfig> for PeftConfig {
    fn from(c: LoraConfig) -> Self {
        Self::Lora(c)
    }
}

impl From<LoHaConfig> for PeftConfig {
    fn from(c: LoHaConfig) -> Self {
        Self::LoHa(c)
    }
}

impl From<LoKrConfig> for PeftConfig {
    fn from(c: LoKrConfig) -> Self {
        Self::LoKr(c)
    }
}

impl From<AdaLoraConfig> for PeftConfig {
    fn from(c: AdaLoraConfig) -> Self {
        Self::AdaLora(c)
    }
}

impl From<Ia3Config> for PeftConfig {
    fn from(c: Ia3Config) -> Self {
        Self::Ia3(c)
    }
}

impl From<VeraConfig> for PeftConfig {
    fn from(c: VeraConfig) -> Self {
        Self::Vera(c)
    }
}

impl From<VbLoraConfig> for PeftConfig {
    fn from(c: VbLoraConfig) -> Self {
        Self::VbLora(c)
    }
}

impl From<GLoraConfig> for PeftConfig {
    fn from(c: GLoraConfig) -> Self {
        Self::GLora(c)
    }
}
