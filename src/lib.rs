// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→isize for negative positions
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `pos`/`pos_act`
#![allow(clippy::module_name_repetitions)] // HaystackModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// Method style pedantic:
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_pass_by_value)] // configs passed by value into runners
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! haystack-rs: finding context neurons in small language models
//!
//! Tools for probing, ablating and decomposing the activations of Pythia
//! models on multilingual text, centred on neurons that track "this text is
//! German".
//!
//! ## Architecture
//!
//! - `hooks`: hook points, interventions and captured activations
//! - `model`: HaystackModel wrapper (tokenisation, hooked runs, losses)
//! - `forward_neox`: GPT-NeoX / Pythia forward pass with hook points
//! - `masks`: cached causal masks
//! - `checkpoints`: Pythia training-checkpoint schedule
//! - `corpus`: language data, token batching and prompt construction
//! - `cache`: activation matrices and column statistics
//! - `probe`: linear probing with linfa
//! - `feature_formation`: per-checkpoint probes, layer ablations and language losses
//! - `sae`: sparse autoencoder, its training and persistence
//! - `direction`: analysis of autoencoder directions
//! - `context_neuron`: context neuron hooks and path patching
//! - `and_conditions`: AND-neuron analysis of the context neuron's readers
//! - `downstream`: peak-snapping analysis of a bimodal context neuron
//! - `baseline`: single-neuron probing baselines

pub mod and_conditions;
pub mod baseline;
pub mod cache;
pub mod checkpoints;
pub mod context_neuron;
pub mod corpus;
pub mod direction;
pub mod downstream;
pub mod feature_formation;
pub mod forward_neox;
pub mod hooks;
pub mod masks;
pub mod model;
pub mod probe;
pub mod sae;

pub use and_conditions::{AndConditionsConfig, Condition, FeatureMode, IncludeMode, ValueKind};
pub use baseline::{BaselineConfig, NeuronProbeScore};
pub use cache::ActivationCache;
pub use checkpoints::CheckpointOutOfRange;
pub use context_neuron::{ContextHooks, ContextNeuron, PathPatchingEffects, ReturnType};
pub use corpus::{AblationMode, LanguageData};
pub use direction::{ExampleMode, MaxActivations, ReconstructionLosses};
pub use downstream::{DownstreamConfig, MetricMode};
pub use feature_formation::{FeatureFormation, FeatureFormationConfig, FeatureFormationProgress};
pub use forward_neox::{HaystackNeox, NeoxConfig};
pub use hooks::{HookCache, HookPoint, HookSpec, Intervention};
pub use masks::create_causal_mask;
pub use model::{HaystackBackend, HaystackModel};
pub use probe::{ProbeResults, ProbeTrainer};
pub use sae::{AutoEncoder, AutoEncoderConfig, SaeTrainingConfig};
