//! Hook points and activation interventions
//!
//! A [`HookSpec`] tells a backend which activations to capture and which
//! interventions to apply while it runs a forward pass. Hook points use the
//! TransformerLens naming scheme so results line up with the usual
//! `blocks.{layer}.mlp.hook_post` style of addressing.
//!
//! ```ignore
//! let mut hooks = HookSpec::new();
//! hooks
//!     .capture("blocks.3.mlp.hook_post")
//!     .intervene(HookPoint::MlpPost(3), Intervention::set_neuron(669, 0.0));
//! let cache = model.run_with_hooks("Das ist ein Test", &hooks)?;
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor};

/// Named location in the forward pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Token embedding output (`hook_embed`)
    Embed,
    /// Residual stream entering layer `i`
    ResidPre(usize),
    /// Attention block output of layer `i`
    AttnOut(usize),
    /// MLP pre-activation (after the input projection)
    MlpPre(usize),
    /// MLP post-activation (after the nonlinearity)
    MlpPost(usize),
    /// MLP block output written to the residual stream
    MlpOut(usize),
    /// Residual stream leaving layer `i`
    ResidPost(usize),
    /// Final layer norm scale, `sqrt(var + eps)` per position
    LnFinalScale,
    /// Final layer norm output
    LnFinalNormalized,
    /// Anything else
    Custom(String),
}

impl HookPoint {
    /// Layer index for per-layer hook points
    pub fn layer(&self) -> Option<usize> {
        match self {
            Self::ResidPre(i)
            | Self::AttnOut(i)
            | Self::MlpPre(i)
            | Self::MlpPost(i)
            | Self::MlpOut(i)
            | Self::ResidPost(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::MlpPre(i) => write!(f, "blocks.{i}.mlp.hook_pre"),
            Self::MlpPost(i) => write!(f, "blocks.{i}.mlp.hook_post"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::LnFinalScale => write!(f, "ln_final.hook_scale"),
            Self::LnFinalNormalized => write!(f, "ln_final.hook_normalized"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_name(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_name(s)
    }
}

fn parse_hook_name(s: &str) -> HookPoint {
    match s {
        "hook_embed" => return HookPoint::Embed,
        "ln_final.hook_scale" => return HookPoint::LnFinalScale,
        "ln_final.hook_normalized" => return HookPoint::LnFinalNormalized,
        _ => {}
    }

    if let Some((layer, suffix)) = s
        .strip_prefix("blocks.")
        .and_then(|rest| rest.split_once('.'))
    {
        if let Ok(layer) = layer.parse::<usize>() {
            return match suffix {
                "hook_resid_pre" => HookPoint::ResidPre(layer),
                "hook_attn_out" => HookPoint::AttnOut(layer),
                "mlp.hook_pre" => HookPoint::MlpPre(layer),
                "mlp.hook_post" => HookPoint::MlpPost(layer),
                "hook_mlp_out" => HookPoint::MlpOut(layer),
                "hook_resid_post" => HookPoint::ResidPost(layer),
                _ => HookPoint::Custom(s.to_string()),
            };
        }
    }

    HookPoint::Custom(s.to_string())
}

/// Tensor-to-tensor function applied at a hook point
pub type HookFn = Arc<dyn Fn(&Tensor) -> Result<Tensor> + Send + Sync>;

/// Modification applied to the activation at a hook point.
///
/// Activations are `[batch, seq, d]`. Position-specific variants accept
/// negative positions, counted from the end of the sequence.
#[derive(Clone)]
pub enum Intervention {
    /// Zero the whole activation
    Zero,
    /// Replace the activation with a tensor of the same shape
    Replace(Tensor),
    /// Broadcast-add a tensor
    Add(Tensor),
    /// Multiply by a constant
    Scale(f64),
    /// Fix the given units to constant values at every position
    SetNeurons { neurons: Vec<usize>, values: Vec<f32> },
    /// Replace a single position with a `[batch, d]` tensor
    ReplaceAt { position: isize, value: Tensor },
    /// Add a `[batch, d]` tensor at a single position
    AddAt { position: isize, value: Tensor },
    /// Arbitrary function of the activation
    Apply(HookFn),
}

impl Intervention {
    /// Fix one unit to a constant
    pub fn set_neuron(neuron: usize, value: f32) -> Self {
        Self::SetNeurons {
            neurons: vec![neuron],
            values: vec![value],
        }
    }

    /// Wrap a closure as an intervention
    pub fn apply<F>(f: F) -> Self
    where
        F: Fn(&Tensor) -> Result<Tensor> + Send + Sync + 'static,
    {
        Self::Apply(Arc::new(f))
    }
}

impl fmt::Debug for Intervention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => write!(f, "Zero"),
            Self::Replace(t) => write!(f, "Replace({:?})", t.shape()),
            Self::Add(t) => write!(f, "Add({:?})", t.shape()),
            Self::Scale(s) => write!(f, "Scale({s})"),
            Self::SetNeurons { neurons, values } => {
                write!(f, "SetNeurons({neurons:?} = {values:?})")
            }
            Self::ReplaceAt { position, value } => {
                write!(f, "ReplaceAt({position}, {:?})", value.shape())
            }
            Self::AddAt { position, value } => write!(f, "AddAt({position}, {:?})", value.shape()),
            Self::Apply(_) => write!(f, "Apply(<fn>)"),
        }
    }
}

/// Resolve a possibly negative position against a sequence length
pub fn resolve_position(position: isize, seq_len: usize) -> Result<usize> {
    let resolved = if position < 0 {
        seq_len as isize + position
    } else {
        position
    };
    anyhow::ensure!(
        resolved >= 0 && (resolved as usize) < seq_len,
        "Position {position} out of range (seq_len={seq_len})"
    );
    Ok(resolved as usize)
}

/// Replace position `pos` of a `[batch, seq, d]` tensor with `value` (`[batch, d]`)
pub fn replace_position(tensor: &Tensor, pos: usize, value: &Tensor) -> Result<Tensor> {
    let seq_len = tensor.dim(1)?;
    anyhow::ensure!(pos < seq_len, "Position {pos} out of range (seq_len={seq_len})");

    let value = value.to_dtype(tensor.dtype())?.unsqueeze(1)?;
    let mut parts = Vec::with_capacity(3);
    if pos > 0 {
        parts.push(tensor.narrow(1, 0, pos)?);
    }
    parts.push(value);
    if pos + 1 < seq_len {
        parts.push(tensor.narrow(1, pos + 1, seq_len - pos - 1)?);
    }
    Ok(Tensor::cat(&parts, 1)?)
}

/// Apply a single intervention to an activation
pub fn apply_intervention(tensor: &Tensor, intervention: &Intervention) -> Result<Tensor> {
    match intervention {
        Intervention::Zero => Ok(tensor.zeros_like()?),
        Intervention::Replace(replacement) => {
            anyhow::ensure!(
                replacement.dims() == tensor.dims(),
                "Replacement shape {:?} does not match activation shape {:?}",
                replacement.dims(),
                tensor.dims()
            );
            Ok(replacement.to_dtype(tensor.dtype())?)
        }
        Intervention::Add(delta) => Ok(tensor.broadcast_add(&delta.to_dtype(tensor.dtype())?)?),
        Intervention::Scale(factor) => Ok((tensor * *factor)?),
        Intervention::SetNeurons { neurons, values } => set_neurons(tensor, neurons, values),
        Intervention::ReplaceAt { position, value } => {
            let pos = resolve_position(*position, tensor.dim(1)?)?;
            replace_position(tensor, pos, value)
        }
        Intervention::AddAt { position, value } => {
            let pos = resolve_position(*position, tensor.dim(1)?)?;
            let current = tensor.i((.., pos, ..))?;
            let updated = current.broadcast_add(&value.to_dtype(tensor.dtype())?)?;
            replace_position(tensor, pos, &updated)
        }
        Intervention::Apply(f) => f(tensor),
    }
}

fn set_neurons(tensor: &Tensor, neurons: &[usize], values: &[f32]) -> Result<Tensor> {
    anyhow::ensure!(
        neurons.len() == values.len() || values.len() == 1,
        "Got {} neurons but {} values",
        neurons.len(),
        values.len()
    );
    let d = tensor.dim(tensor.rank() - 1)?;
    let mut keep = vec![1f32; d];
    let mut fill = vec![0f32; d];
    for (i, &neuron) in neurons.iter().enumerate() {
        anyhow::ensure!(neuron < d, "Neuron {neuron} out of range (d={d})");
        keep[neuron] = 0.0;
        fill[neuron] = if values.len() == 1 { values[0] } else { values[i] };
    }
    let keep = Tensor::from_vec(keep, d, tensor.device())?.to_dtype(tensor.dtype())?;
    let fill = Tensor::from_vec(fill, d, tensor.device())?.to_dtype(tensor.dtype())?;
    Ok(tensor.broadcast_mul(&keep)?.broadcast_add(&fill)?)
}

/// Captures and interventions for one forward pass
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    captures: HashSet<HookPoint>,
    interventions: Vec<(HookPoint, Intervention)>,
}

impl HookSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at a hook point
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Register an intervention; several at one point run in insertion order
    pub fn intervene<H: Into<HookPoint>>(
        &mut self,
        hook: H,
        intervention: Intervention,
    ) -> &mut Self {
        self.interventions.push((hook.into(), intervention));
        self
    }

    /// Builder form of [`HookSpec::capture`]
    pub fn with_capture<H: Into<HookPoint>>(mut self, hook: H) -> Self {
        self.capture(hook);
        self
    }

    /// Builder form of [`HookSpec::intervene`]
    pub fn with_intervention<H: Into<HookPoint>>(
        mut self,
        hook: H,
        intervention: Intervention,
    ) -> Self {
        self.intervene(hook, intervention);
        self
    }

    /// Append another spec's captures and interventions
    pub fn merge(&mut self, other: &HookSpec) -> &mut Self {
        self.captures.extend(other.captures.iter().cloned());
        self.interventions
            .extend(other.interventions.iter().cloned());
        self
    }

    /// Merged copy of two specs
    pub fn merged(&self, other: &HookSpec) -> Self {
        let mut spec = self.clone();
        spec.merge(other);
        spec
    }

    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty()
    }

    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    pub fn num_interventions(&self) -> usize {
        self.interventions.len()
    }

    pub fn interventions_at<'a>(
        &'a self,
        hook: &'a HookPoint,
    ) -> impl Iterator<Item = &'a Intervention> + 'a {
        self.interventions
            .iter()
            .filter(move |(h, _)| h == hook)
            .map(|(_, i)| i)
    }

    pub fn has_intervention_at(&self, hook: &HookPoint) -> bool {
        self.interventions.iter().any(|(h, _)| h == hook)
    }

    /// Run interventions at `hook`, then record the result if it was captured
    pub fn run_hook(
        &self,
        hook: HookPoint,
        tensor: Tensor,
        captures: &mut HashMap<HookPoint, Tensor>,
    ) -> Result<Tensor> {
        let mut tensor = tensor;
        for intervention in self.interventions_at(&hook) {
            tensor = apply_intervention(&tensor, intervention)?;
        }
        if self.captures.contains(&hook) {
            captures.insert(hook, tensor.clone());
        }
        Ok(tensor)
    }
}

/// Logits and captured activations from one forward pass
#[derive(Debug)]
pub struct HookCache {
    logits: Tensor,
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    pub fn new(logits: Tensor, captures: HashMap<HookPoint, Tensor>) -> Self {
        Self { logits, captures }
    }

    /// Logits, shape `[batch, seq, vocab]`
    pub fn logits(&self) -> &Tensor {
        &self.logits
    }

    pub fn into_logits(self) -> Tensor {
        self.logits
    }

    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Captured tensor, or an error naming the missing hook
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| anyhow::anyhow!("Hook point `{hook}` was not captured"))
    }

    /// Captured tensor converted to F32
    pub fn require_f32(&self, hook: &HookPoint) -> Result<Tensor> {
        Ok(self.require(hook)?.to_dtype(DType::F32)?)
    }

    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}
