//! Context neuron hooks and path patching
//!
//! A context neuron (L3 N669 in pythia-70m fires on German text) is switched
//! on or off by fixing it to its mean activation on German or non-German
//! prompts. Path patching then separates its direct effect on the output
//! from the part that flows through later MLP layers.

use std::ops::Range;

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::column_means;
use crate::hooks::{resolve_position, HookPoint, HookSpec, Intervention};
use crate::model::HaystackModel;

/// Positions used to estimate mean activations
pub const MEAN_ACTIVATION_POSITIONS: Range<usize> = 10..400;

/// One or more neurons in an MLP layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextNeuron {
    pub layer: usize,
    pub neurons: Vec<usize>,
}

impl Default for ContextNeuron {
    fn default() -> Self {
        Self {
            layer: 3,
            neurons: vec![669],
        }
    }
}

impl ContextNeuron {
    pub fn new(layer: usize, neurons: Vec<usize>) -> Self {
        Self { layer, neurons }
    }

    pub fn hook_point(&self) -> HookPoint {
        HookPoint::MlpPost(self.layer)
    }

    /// `L{layer}N{neuron}` for a single neuron
    pub fn label(&self) -> String {
        let neurons: Vec<String> = self.neurons.iter().map(ToString::to_string).collect();
        format!("L{}N{}", self.layer, neurons.join("+"))
    }
}

/// Hooks that force a context neuron on or off
#[derive(Debug, Clone)]
pub struct ContextHooks {
    pub neuron: ContextNeuron,
    pub active_values: Vec<f32>,
    pub inactive_values: Vec<f32>,
    activate: HookSpec,
    deactivate: HookSpec,
}

impl ContextHooks {
    /// Fix the neuron(s) to the given active and inactive values
    pub fn from_values(
        neuron: ContextNeuron,
        active_values: Vec<f32>,
        inactive_values: Vec<f32>,
    ) -> Result<Self> {
        anyhow::ensure!(
            active_values.len() == neuron.neurons.len()
                && inactive_values.len() == neuron.neurons.len(),
            "Need one active and one inactive value per neuron"
        );
        let hook = neuron.hook_point();
        let activate = HookSpec::new().with_intervention(
            hook.clone(),
            Intervention::SetNeurons {
                neurons: neuron.neurons.clone(),
                values: active_values.clone(),
            },
        );
        let deactivate = HookSpec::new().with_intervention(
            hook,
            Intervention::SetNeurons {
                neurons: neuron.neurons.clone(),
                values: inactive_values.clone(),
            },
        );
        Ok(Self {
            neuron,
            active_values,
            inactive_values,
            activate,
            deactivate,
        })
    }

    /// Mean activations on German (active) and non-German (inactive) prompts
    pub fn from_data<S: AsRef<str>, T: AsRef<str>>(
        model: &HaystackModel,
        neuron: ContextNeuron,
        german: &[S],
        non_german: &[T],
    ) -> Result<Self> {
        let means = |prompts: Vec<&str>| -> Result<Vec<f32>> {
            let acts = model.mlp_activations(&prompts, neuron.layer, MEAN_ACTIVATION_POSITIONS)?;
            let all = column_means(&acts)?;
            neuron
                .neurons
                .iter()
                .map(|&n| {
                    all.get(n)
                        .copied()
                        .ok_or_else(|| anyhow::anyhow!("Neuron {n} out of range"))
                })
                .collect()
        };
        let active = means(german.iter().map(AsRef::as_ref).collect())?;
        let inactive = means(non_german.iter().map(AsRef::as_ref).collect())?;
        info!(
            "Context neuron {}: active {:?}, inactive {:?}",
            neuron.label(),
            active,
            inactive
        );
        Self::from_values(neuron, active, inactive)
    }

    /// Hooks with the context neuron on
    pub fn activate(&self) -> &HookSpec {
        &self.activate
    }

    /// Hooks with the context neuron off
    pub fn deactivate(&self) -> &HookSpec {
        &self.deactivate
    }
}

/// What a path-patched run reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    /// Per-prompt next-token loss at a position of the per-token loss
    Loss(isize),
    /// Per-prompt logits at a sequence position
    Logits(isize),
}

/// Outputs of the four path-patching runs
///
/// Loss values are `[batch]`, logit values `[batch, vocab]`.
#[derive(Debug, Clone)]
pub struct PathPatchingEffects {
    /// Context active
    pub original: Tensor,
    /// Context inactive
    pub ablated: Tensor,
    /// Context active, later MLP outputs from the inactive run
    pub direct: Tensor,
    /// Context inactive, later MLP outputs from the active run
    pub indirect: Tensor,
}

fn read_output(model: &HaystackModel, tokens: &Tensor, hooks: &HookSpec, kind: ReturnType) -> Result<Tensor> {
    match kind {
        ReturnType::Loss(position) => {
            let per_token = model.loss_per_token(tokens, hooks)?;
            let pos = resolve_position(position, per_token.dim(1)?)?;
            Ok(per_token.i((.., pos))?)
        }
        ReturnType::Logits(position) => {
            let logits = model.logits(tokens, hooks)?;
            let pos = resolve_position(position, logits.dim(1)?)?;
            Ok(logits.i((.., pos))?.to_dtype(DType::F32)?)
        }
    }
}

/// Run with the context on and off, swapping the outputs of the MLP layers after it
pub fn path_patching_effects(
    model: &HaystackModel,
    tokens: &Tensor,
    hooks: &ContextHooks,
    kind: ReturnType,
) -> Result<PathPatchingEffects> {
    let later_layers: Vec<usize> = (hooks.neuron.layer + 1..model.n_layers()).collect();

    let mut capture = HookSpec::new();
    for &l in &later_layers {
        capture.capture(HookPoint::MlpOut(l));
    }
    let active_run = model.run_with_hooks(tokens, &hooks.activate().merged(&capture))?;
    let inactive_run = model.run_with_hooks(tokens, &hooks.deactivate().merged(&capture))?;

    let mut from_inactive = hooks.activate().clone();
    let mut from_active = hooks.deactivate().clone();
    for &l in &later_layers {
        let hook = HookPoint::MlpOut(l);
        from_inactive.intervene(hook.clone(), Intervention::Replace(inactive_run.require(&hook)?.clone()));
        from_active.intervene(hook.clone(), Intervention::Replace(active_run.require(&hook)?.clone()));
    }
    debug!("Path patching {} later MLP layers", later_layers.len());

    Ok(PathPatchingEffects {
        original: read_output(model, tokens, hooks.activate(), kind)?,
        ablated: read_output(model, tokens, hooks.deactivate(), kind)?,
        direct: read_output(model, tokens, &from_inactive, kind)?,
        indirect: read_output(model, tokens, &from_active, kind)?,
    })
}

/// Mean last-position loss with the context off, except that `mlp_layer`
/// sees context-active values for every neuron not in `neurons`
pub fn path_patched_mlp_loss(
    model: &HaystackModel,
    tokens: &Tensor,
    hooks: &ContextHooks,
    mlp_layer: usize,
    neurons: &[usize],
) -> Result<f32> {
    let hook = HookPoint::MlpPost(mlp_layer);
    let capture = HookSpec::new().with_capture(hook.clone());
    let active = model
        .run_with_hooks(tokens, &hooks.activate().merged(&capture))?
        .require_f32(&hook)?;
    let inactive = model
        .run_with_hooks(tokens, &hooks.deactivate().merged(&capture))?
        .require_f32(&hook)?;

    let d_mlp = active.dim(2)?;
    let mut mask = vec![0f32; d_mlp];
    for &n in neurons {
        anyhow::ensure!(n < d_mlp, "Neuron {n} out of range (d_mlp={d_mlp})");
        mask[n] = 1.0;
    }
    let mask = Tensor::from_vec(mask, d_mlp, active.device())?;
    let keep = mask.affine(-1.0, 1.0)?;
    let patched = (active.broadcast_mul(&keep)? + inactive.broadcast_mul(&mask)?)?;

    let spec = hooks
        .deactivate()
        .clone()
        .with_intervention(hook, Intervention::Replace(patched));
    model.loss_at(tokens, &spec, -1)
}
