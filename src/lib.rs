//! # peft-tuners
//!
//! Adapter injection and lifecycle management for parameter-efficient
//! fine-tuning on top of candle networks.
//!
//! A base network is a tree of [`Layer`] nodes. A [`PeftModel`] locates the
//! layers matched by an adapter config and wraps each in a [`TunerLayer`]
//! that holds any number of named adapters next to the frozen base weights.
//! Adapters can then be switched, combined, merged into the base weights,
//! unmerged, saved and loaded.
//!
//! Weight-injecting families:
//! - **`LoRA`** (Low-Rank Adaptation), including PiSSA initialization
//! - **`LoHa`** (Low-Rank Hadamard Product)
//! - **`LoKr`** (Low-Rank Kronecker Product)
//! - **`AdaLoRA`** (Adaptive Low-Rank Adaptation)
//! - **IA³** (Infused Adapter by Inhibiting and Amplifying Inner Activations)
//! - **`VeRA`** (Vector-based Random Matrix Adaptation)
//! - **VB-LoRA** (Vector Bank `LoRA`)
//! - **`GLoRA`** (Generalized `LoRA`)
//!
//! Composites and conditioning: [`MixedModel`], [`XLoraModel`],
//! [`PcLoraModel`], [`AdaptionPromptModel`], prompt tuning and prefix tuning.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use peft_tuners::{LoraConfig, PeftModel};
//!
//! let config = LoraConfig::new(8, 16, ["q_proj", "v_proj"]);
//! let mut model = PeftModel::new(network, config, "default")?;
//! model.print_trainable_parameters();
//!
//! let output = model.forward(&input)?;
//! let merged = model.merge_and_unload(None, true, false)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod adaption_prompt;
pub mod config;
pub mod convert;
pub mod error;
pub mod io;
pub mod layer;
pub mod mixed;
pub mod model;
pub mod nn;
pub mod pclora;
pub mod registry;
pub mod training;
pub mod traits;
pub mod xlora;

pub use adapters::adalora::{AdaLoraAdapter, AdaLoraConfig, RankAllocator};
pub use adapters::glora::{GLoraAdapter, GLoraConfig};
pub use adapters::ia3::{Ia3Adapter, Ia3Config};
pub use adapters::loha::{LoHaAdapter, LoHaConfig};
pub use adapters::lokr::{LoKrAdapter, LoKrConfig};
pub use adapters::lora::{LoraAdapter, LoraConfig, LoraInitialization};
pub use adapters::prefix_tuning::{PrefixEncoder, PrefixTuningConfig};
pub use adapters::prompt_tuning::{
    MultitaskPromptEmbedding, MultitaskPromptTuningConfig, PromptEmbedding, PromptTuningConfig,
    PromptTuningInit,
};
pub use adapters::vblora::{VbLoraAdapter, VbLoraConfig};
pub use adapters::vera::{VeraAdapter, VeraConfig};
pub use adaption_prompt::{AdaptedAttention, AdaptionPromptConfig, AdaptionPromptModel};
pub use config::{BaseAdapterConfig, ModulePattern, PeftConfig, PeftType, TargetModules};
pub use convert::{convert_pissa_checkpoint, pissa_to_lora, save_pissa_initialization};
pub use error::{PeftError, Result};
pub use io::{
    adapter_key, load_adapter_config, load_adapter_weights, parse_adapter_key, save_adapter_config,
    save_adapter_weights, SaveLoad, ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME,
};
pub use layer::{TunerLayer, BASE_ONLY};
pub use mixed::{MixedModel, COMPATIBLE_TUNER_TYPES};
pub use model::{PeftModel, DEFAULT_ADAPTER_NAME};
pub use nn::{AttentionModule, BaseLayer, ForwardContext, Layer, Module, Param, Sequential};
pub use pclora::{PcLoraConfig, PcLoraModel};
pub use registry::AdapterRegistry;
pub use training::{count_trainable_parameters, format_parameter_count, BudgetSchedule, DecaySchedule};
pub use traits::{Adapter, AdapterConfig, Mergeable, Trainable};
pub use xlora::{XLoraClassifier, XLoraConfig, XLoraModel};
