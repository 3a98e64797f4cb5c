//! Analysis of individual autoencoder directions
//!
//! Everything here reads the model through an [`AutoEncoder`] attached at
//! its configured hook point: feature activations per prompt, top examples,
//! firing frequencies, reconstruction and ablation losses, direct logit
//! attribution, and the interaction of a feature with the context neuron.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, IndexOp, Tensor, D};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::hooks::{replace_position, resolve_position, HookPoint, HookSpec, Intervention};
use crate::model::HaystackModel;
use crate::sae::{AutoEncoder, AutoEncoderConfig};

// --- Feature activations ---

/// Feature activations of the first sequence in `tokens`, `[pos, d_hidden]`
pub fn get_acts(
    model: &HaystackModel,
    encoder: &AutoEncoder,
    cfg: &AutoEncoderConfig,
    tokens: &Tensor,
) -> Result<Tensor> {
    let hook = cfg.encoder_hook_point();
    let cache = model.run_with_hooks(tokens, &HookSpec::new().with_capture(hook.clone()))?;
    let acts = cache.require_f32(&hook)?.i(0)?;
    encoder.encode(&acts)
}

/// [`get_acts`] for a prompt string (BOS prepended)
pub fn prompt_acts(
    model: &HaystackModel,
    encoder: &AutoEncoder,
    cfg: &AutoEncoderConfig,
    prompt: &str,
) -> Result<Tensor> {
    get_acts(model, encoder, cfg, &model.to_tokens(prompt)?)
}

/// Per-prompt maximum of every feature and the position where it occurs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaxActivations {
    /// `[n_prompts][d_hidden]`
    pub max_activations: Vec<Vec<f32>>,
    /// `[n_prompts][d_hidden]`
    pub max_activation_token_indices: Vec<Vec<u32>>,
}

impl MaxActivations {
    pub fn n_prompts(&self) -> usize {
        self.max_activations.len()
    }

    pub fn d_hidden(&self) -> usize {
        self.max_activations.first().map_or(0, Vec::len)
    }

    /// Max activation of one direction in each prompt
    pub fn direction(&self, direction: usize) -> Result<Vec<f32>> {
        anyhow::ensure!(
            direction < self.d_hidden(),
            "Direction {direction} out of range (d_hidden={})",
            self.d_hidden()
        );
        Ok(self.max_activations.iter().map(|row| row[direction]).collect())
    }

    /// Largest activation of every direction over all prompts
    pub fn global_max(&self) -> Vec<f32> {
        let mut global = vec![f32::NEG_INFINITY; self.d_hidden()];
        for row in &self.max_activations {
            for (g, &v) in global.iter_mut().zip(row) {
                *g = g.max(v);
            }
        }
        global
    }

    /// Number of directions that fire on at least one prompt
    pub fn num_active_directions(&self) -> usize {
        (0..self.d_hidden())
            .filter(|&d| self.max_activations.iter().any(|row| row[d] > 0.0))
            .count()
    }
}

/// Max and argmax of each feature per prompt, ignoring the last position
pub fn get_max_activations<S: AsRef<str>>(
    prompts: &[S],
    model: &HaystackModel,
    encoder: &AutoEncoder,
    cfg: &AutoEncoderConfig,
) -> Result<MaxActivations> {
    let mut max_activations = Vec::with_capacity(prompts.len());
    let mut indices = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        let acts = prompt_acts(model, encoder, cfg, prompt.as_ref())?;
        let n_pos = acts.dim(0)?;
        anyhow::ensure!(n_pos >= 2, "Prompt too short: {:?}", prompt.as_ref());
        let acts = acts.narrow(0, 0, n_pos - 1)?;
        max_activations.push(acts.max(0)?.to_vec1::<f32>()?);
        indices.push(acts.argmax(0)?.to_dtype(DType::U32)?.to_vec1::<u32>()?);
    }

    let result = MaxActivations {
        max_activations,
        max_activation_token_indices: indices,
    };
    info!(
        "Active directions on validation data: {} out of {}",
        result.num_active_directions(),
        encoder.d_hidden()
    );
    Ok(result)
}

/// [`get_max_activations`], cached at `{save_path}/data/{encoder_name}_activations.json`
pub fn get_activations<S: AsRef<str>>(
    encoder: &AutoEncoder,
    cfg: &AutoEncoderConfig,
    encoder_name: &str,
    prompts: &[S],
    model: &HaystackModel,
    save_path: impl AsRef<Path>,
    save_activations: bool,
) -> Result<MaxActivations> {
    let path = save_path
        .as_ref()
        .join("data")
        .join(format!("{encoder_name}_activations.json"));
    if path.exists() {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()));
    }

    let activations = get_max_activations(prompts, model, encoder, cfg)?;
    if save_activations {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string(&activations)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(activations)
}

/// Which band of activations to draw examples from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExampleMode {
    Top,
    Upper,
    Middle,
    Lower,
}

impl FromStr for ExampleMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "top" => Ok(Self::Top),
            "upper" => Ok(Self::Upper),
            "middle" => Ok(Self::Middle),
            "lower" => Ok(Self::Lower),
            other => anyhow::bail!("Unknown example mode: {other}"),
        }
    }
}

impl fmt::Display for ExampleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Top => "top",
            Self::Upper => "upper",
            Self::Middle => "middle",
            Self::Lower => "lower",
        };
        write!(f, "{name}")
    }
}

/// Up to `k` prompts from one band of a direction's activations
///
/// `top` takes the strongest prompts. The other modes start just below a
/// threshold of `floor(max/3)*2` (upper), `floor(max/3)` (middle) or
/// `floor(max/10)` (lower). Only prompts where the direction fires are
/// returned, together with the position of the maximum.
pub fn top_activating_examples<'a, S: AsRef<str>>(
    prompts: &'a [S],
    direction: usize,
    max_activations: &MaxActivations,
    k: usize,
    mode: ExampleMode,
) -> Result<(Vec<&'a str>, Vec<u32>)> {
    let activations = max_activations.direction(direction)?;
    anyhow::ensure!(
        activations.len() == prompts.len(),
        "{} prompts but {} activation rows",
        prompts.len(),
        activations.len()
    );

    let mut sorted = activations.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let num_non_zero = sorted.iter().filter(|&&a| a > 0.0).count();
    if num_non_zero == 0 {
        return Ok((Vec::new(), Vec::new()));
    }

    let max_activation = sorted[sorted.len() - 1];
    let threshold = match mode {
        ExampleMode::Upper => (max_activation / 3.0).floor() * 2.0,
        ExampleMode::Middle => (max_activation / 3.0).floor(),
        ExampleMode::Top | ExampleMode::Lower => (max_activation / 10.0).floor(),
    };
    let index = sorted
        .iter()
        .position(|&a| a > threshold)
        .ok_or_else(|| anyhow::anyhow!("No activation above {threshold}"))?;
    let negative_index = sorted.len() - index;

    let mut order: Vec<usize> = (0..activations.len()).collect();
    order.sort_by(|&a, &b| activations[b].total_cmp(&activations[a]));
    order.truncate(num_non_zero + 1);

    let window: Vec<usize> = match mode {
        ExampleMode::Top => order.into_iter().take(k).collect(),
        _ => order.into_iter().skip(negative_index).take(k).collect(),
    };
    let selected: Vec<usize> = window.into_iter().take(num_non_zero).collect();

    let top_prompts = selected.iter().map(|&i| prompts[i].as_ref()).collect();
    let token_indices = selected
        .iter()
        .map(|&i| max_activations.max_activation_token_indices[i][direction])
        .collect();
    Ok((top_prompts, token_indices))
}

/// Fraction of tokens on which each feature fires
pub fn feature_frequencies<S: AsRef<str>>(
    data: &[S],
    model: &HaystackModel,
    encoder: &AutoEncoder,
    cfg: &AutoEncoderConfig,
) -> Result<Vec<f32>> {
    let mut counts = vec![0f32; encoder.d_hidden()];
    let mut mean_active = Vec::with_capacity(data.len());
    let mut total_tokens = 0usize;
    for prompt in data {
        let tokens = model.to_tokens(prompt.as_ref())?;
        let acts = get_acts(model, encoder, cfg, &tokens)?;
        let firing = acts.gt(0f32)?.to_dtype(DType::F32)?;
        for (c, f) in counts.iter_mut().zip(firing.sum(0)?.to_vec1::<f32>()?) {
            *c += f;
        }
        mean_active.push(firing.sum(1)?.mean_all()?.to_scalar::<f32>()?);
        total_tokens += tokens.elem_count();
    }
    anyhow::ensure!(total_tokens > 0, "No tokens to count");

    let active = counts.iter().filter(|&&c| c > 0.0).count();
    info!("Number of active features over {} tokens: {}", total_tokens, active);
    info!(
        "Number of average active features per token: {:.2}",
        mean_active.iter().sum::<f32>() / mean_active.len() as f32
    );
    Ok(counts.iter().map(|c| c / total_tokens as f32).collect())
}

// --- Reconstruction ---

/// Mean losses with the hook point untouched, reconstructed and zeroed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionLosses {
    pub original: f32,
    pub reconstruction: f32,
    pub zero_ablation: f32,
}

impl ReconstructionLosses {
    /// Share of the zero-ablation loss increase the reconstruction recovers
    pub fn recovered(&self) -> f32 {
        (self.zero_ablation - self.reconstruction) / (self.zero_ablation - self.original)
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        f32::NAN
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

/// Mean prompt loss with the hook point replaced by its reconstruction
pub fn reconstruction_loss<S: AsRef<str>>(
    encoder: &Arc<AutoEncoder>,
    hook: &HookPoint,
    data: &[S],
    model: &HaystackModel,
) -> Result<f32> {
    let spec = HookSpec::new().with_intervention(hook.clone(), encoder.reconstruction_intervention());
    let losses = data
        .iter()
        .map(|p| model.prompt_loss(p.as_ref(), &spec))
        .collect::<Result<Vec<_>>>()?;
    Ok(mean(&losses))
}

/// Original, reconstruction-patched and zero-ablated mean losses
pub fn evaluate_reconstruction<S: AsRef<str>>(
    encoder: &Arc<AutoEncoder>,
    hook: &HookPoint,
    data: &[S],
    model: &HaystackModel,
) -> Result<ReconstructionLosses> {
    let reconstruct = HookSpec::new().with_intervention(hook.clone(), encoder.reconstruction_intervention());
    let zero = HookSpec::new().with_intervention(hook.clone(), Intervention::Zero);
    let none = HookSpec::new();

    let (mut original, mut recon, mut zeroed) = (Vec::new(), Vec::new(), Vec::new());
    for prompt in data {
        let tokens = model.to_tokens(prompt.as_ref())?;
        recon.push(model.loss(&tokens, &reconstruct)?);
        original.push(model.loss(&tokens, &none)?);
        zeroed.push(model.loss(&tokens, &zero)?);
    }

    let losses = ReconstructionLosses {
        original: mean(&original),
        reconstruction: mean(&recon),
        zero_ablation: mean(&zeroed),
    };
    info!(
        "Average loss increase after encoding: {:.4}",
        losses.reconstruction - losses.original
    );
    Ok(losses)
}

/// Reconstruction loss over padded batches, ignoring EOS targets
pub fn batched_reconstruction_loss<S: AsRef<str>>(
    encoder: &Arc<AutoEncoder>,
    hook: &HookPoint,
    data: &[S],
    model: &HaystackModel,
    batch_size: usize,
) -> Result<f32> {
    anyhow::ensure!(batch_size > 0, "batch_size must be positive");
    let spec = HookSpec::new().with_intervention(hook.clone(), encoder.reconstruction_intervention());
    let eos = model.eos_token_id();

    let mut losses = Vec::new();
    for batch in data.chunks(batch_size) {
        let tokens = model.to_tokens_batch(batch)?;
        let per_token: Vec<f32> = model.loss_per_token(&tokens, &spec)?.flatten_all()?.to_vec1()?;
        let seq_len = tokens.dim(1)?;
        let targets: Vec<u32> = tokens.narrow(1, 1, seq_len - 1)?.flatten_all()?.to_vec1()?;
        let kept: Vec<f32> = per_token
            .iter()
            .zip(&targets)
            .filter(|(_, &t)| t != eos)
            .map(|(&l, _)| l)
            .collect();
        if !kept.is_empty() {
            losses.push(mean(&kept));
        }
    }
    Ok(mean(&losses))
}

// --- Direction ablation ---

/// Subtract the contribution of `directions` from the hooked activation
///
/// With `position` set only that position is changed.
pub fn direction_ablation_intervention(
    encoder: &Arc<AutoEncoder>,
    directions: &[usize],
    position: Option<isize>,
) -> Result<Intervention> {
    for &d in directions {
        anyhow::ensure!(
            d < encoder.d_hidden(),
            "Direction {d} out of range (d_hidden={})",
            encoder.d_hidden()
        );
    }
    let encoder = Arc::clone(encoder);
    let ids: Vec<u32> = directions.iter().map(|&d| d as u32).collect();
    Ok(Intervention::apply(move |x| {
        let idx = Tensor::new(ids.as_slice(), x.device())?;
        let w_enc = encoder.w_enc().index_select(&idx, 1)?;
        let b_enc = encoder.b_enc().index_select(&idx, 0)?;
        let w_dec = encoder.w_dec().index_select(&idx, 0)?;

        let x32 = x.to_dtype(DType::F32)?;
        let x_cent = x32.broadcast_sub(encoder.b_dec())?;
        let acts = x_cent.broadcast_matmul(&w_enc)?.broadcast_add(&b_enc)?.relu()?;
        let impact = acts.broadcast_matmul(&w_dec)?;

        let ablated = match position {
            None => (x32 - impact)?,
            Some(position) => {
                let pos = resolve_position(position, x.dim(1)?)?;
                let updated = (x32.i((.., pos))? - impact.i((.., pos))?)?;
                replace_position(&x32, pos, &updated)?
            }
        };
        Ok(ablated.to_dtype(x.dtype())?)
    }))
}

/// Which loss an ablation is judged by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    Mean,
    /// Absolute position in the per-token loss
    Position(usize),
    PerToken,
}

/// A loss as a scalar or per token
#[derive(Debug, Clone, PartialEq)]
pub enum LossValue {
    Scalar(f32),
    PerToken(Vec<f32>),
}

impl LossValue {
    pub fn scalar(&self) -> Option<f32> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::PerToken(_) => None,
        }
    }
}

fn measure_loss(model: &HaystackModel, tokens: &Tensor, hooks: &HookSpec, kind: LossKind) -> Result<LossValue> {
    Ok(match kind {
        LossKind::Mean => LossValue::Scalar(model.loss(tokens, hooks)?),
        LossKind::Position(pos) => {
            let per_token = model.loss_per_token(tokens, hooks)?;
            LossValue::Scalar(per_token.i((0, pos))?.to_scalar::<f32>()?)
        }
        LossKind::PerToken => {
            LossValue::PerToken(model.loss_per_token(tokens, hooks)?.i(0)?.to_vec1()?)
        }
    })
}

/// Loss of a prompt before and after ablating `directions`
pub fn evaluate_direction_ablation(
    prompt: &str,
    encoder: &Arc<AutoEncoder>,
    model: &HaystackModel,
    directions: &[usize],
    cfg: &AutoEncoderConfig,
    kind: LossKind,
) -> Result<(LossValue, LossValue)> {
    let tokens = model.to_tokens(prompt)?;
    let position = match kind {
        LossKind::Position(pos) => Some(pos as isize),
        _ => None,
    };
    let ablate = HookSpec::new().with_intervention(
        cfg.encoder_hook_point(),
        direction_ablation_intervention(encoder, directions, position)?,
    );
    let original = measure_loss(model, &tokens, &HookSpec::new(), kind)?;
    let ablated = measure_loss(model, &tokens, &ablate, kind)?;
    Ok((original, ablated))
}

/// Log-probability, logit and rank of an answer token before and after ablation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenRankResult {
    pub logprob: f32,
    pub ablated_logprob: f32,
    pub logit: f32,
    pub ablated_logit: f32,
    pub rank: usize,
    pub ablated_rank: usize,
}

fn answer_stats(logits: &Tensor, answer: u32) -> Result<(f32, f32, usize)> {
    let logprobs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let logits: Vec<f32> = logits.to_vec1()?;
    let answer_logit = logits[answer as usize];
    let rank = logits.iter().filter(|&&l| l > answer_logit).count();
    let logprob = logprobs.i(answer as usize)?.to_scalar::<f32>()?;
    Ok((logprob, answer_logit, rank))
}

/// Answer token statistics at `position`, ablating `directions` there
pub fn eval_ablation_token_rank(
    prompt: &str,
    encoder: &Arc<AutoEncoder>,
    model: &HaystackModel,
    directions: &[usize],
    cfg: &AutoEncoderConfig,
    answer_token: &str,
    position: isize,
) -> Result<TokenRankResult> {
    let answer = model.to_single_token(answer_token)?;
    let tokens = model.to_tokens(prompt)?;
    let pos = resolve_position(position, tokens.dim(1)?)?;

    let logits = model.logits(&tokens, &HookSpec::new())?.i((0, pos))?.to_dtype(DType::F32)?;
    let ablate = HookSpec::new().with_intervention(
        cfg.encoder_hook_point(),
        direction_ablation_intervention(encoder, directions, Some(position))?,
    );
    let ablated_logits = model.logits(&tokens, &ablate)?.i((0, pos))?.to_dtype(DType::F32)?;

    let (logprob, logit, rank) = answer_stats(&logits, answer)?;
    let (ablated_logprob, ablated_logit, ablated_rank) = answer_stats(&ablated_logits, answer)?;
    Ok(TokenRankResult {
        logprob,
        ablated_logprob,
        logit,
        ablated_logit,
        rank,
        ablated_rank,
    })
}

/// Sparse `(direction, token) -> count` table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionTokenCounts {
    pub counts: BTreeMap<usize, BTreeMap<u32, u32>>,
}

impl DirectionTokenCounts {
    pub fn get(&self, direction: usize, token: u32) -> u32 {
        self.counts
            .get(&direction)
            .and_then(|tokens| tokens.get(&token))
            .copied()
            .unwrap_or(0)
    }

    fn increment(&mut self, direction: usize, token: u32) {
        *self
            .counts
            .entry(direction)
            .or_default()
            .entry(token)
            .or_insert(0) += 1;
    }

    /// The `k` tokens a direction fires on most, most frequent first
    pub fn top_tokens(&self, direction: usize, k: usize) -> Vec<(u32, u32)> {
        let mut tokens: Vec<(u32, u32)> = self
            .counts
            .get(&direction)
            .map(|t| t.iter().map(|(&tok, &c)| (tok, c)).collect())
            .unwrap_or_default();
        tokens.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        tokens.truncate(k);
        tokens
    }
}

/// Count tokens whose feature activation exceeds `threshold * global max`
///
/// Positions before 10 are skipped.
pub fn eval_direction_tokens_global<S: AsRef<str>>(
    max_activations: &MaxActivations,
    prompts: &[S],
    model: &HaystackModel,
    encoder: &AutoEncoder,
    cfg: &AutoEncoderConfig,
    percentage_threshold: f32,
) -> Result<DirectionTokenCounts> {
    let thresholds: Vec<f32> = max_activations
        .global_max()
        .iter()
        .map(|m| m * percentage_threshold)
        .collect();
    anyhow::ensure!(
        thresholds.len() == encoder.d_hidden(),
        "Activations cover {} directions, encoder has {}",
        thresholds.len(),
        encoder.d_hidden()
    );

    let mut counts = DirectionTokenCounts::default();
    for prompt in prompts {
        let ids = model.to_token_ids(prompt.as_ref())?;
        let acts: Vec<Vec<f32>> = get_acts(model, encoder, cfg, &model.tokens_tensor(&ids)?)?.to_vec2()?;
        for (position, row) in acts.iter().enumerate().skip(10) {
            for (direction, (&a, &t)) in row.iter().zip(&thresholds).enumerate() {
                if a > t {
                    counts.increment(direction, ids[position]);
                }
            }
        }
    }
    Ok(counts)
}

// --- Direct logit attribution ---

/// Per-feature write direction in the residual stream, centred and scaled by the final norm
fn feature_output_directions(
    model: &HaystackModel,
    encoder: &AutoEncoder,
    cfg: &AutoEncoderConfig,
) -> Result<Tensor> {
    let directions = match cfg.act_name.as_str() {
        "mlp.hook_post" => {
            let w_out = model.backend().mlp_out_weight(cfg.layer)?.to_dtype(DType::F32)?;
            encoder.w_dec().matmul(&w_out.t()?)?
        }
        "hook_mlp_out" => encoder.w_dec().clone(),
        other => anyhow::bail!("Direct logit attribution is undefined for {other}"),
    };
    let centered = directions.broadcast_sub(&directions.mean_keepdim(D::Minus1)?)?;
    let ln_weight = model.backend().final_norm_weight()?.to_dtype(DType::F32)?;
    Ok(centered.broadcast_mul(&ln_weight)?)
}

/// Direct logit attribution of every feature to the next token, `[batch, pos - 1, d_hidden]`
pub fn encoder_dla_batched(
    tokens: &Tensor,
    model: &HaystackModel,
    encoder: &AutoEncoder,
    cfg: &AutoEncoderConfig,
) -> Result<Tensor> {
    let (batch, seq_len) = tokens.dims2()?;
    anyhow::ensure!(seq_len >= 2, "Need at least two tokens for DLA");
    let hook = cfg.encoder_hook_point();
    let spec = HookSpec::new()
        .with_capture(hook.clone())
        .with_capture(HookPoint::LnFinalScale);
    let cache = model.run_with_hooks(tokens, &spec)?;

    let acts = cache.require_f32(&hook)?.narrow(1, 0, seq_len - 1)?;
    let mid_acts = encoder.encode_any(&acts)?;

    let directions = feature_output_directions(model, encoder, cfg)?;
    let next_tokens = tokens
        .narrow(1, 1, seq_len - 1)?
        .flatten_all()?
        .to_dtype(DType::U32)?;
    let w_u = model.backend().unembed_weight()?.to_dtype(DType::F32)?;
    let w_u_next = w_u.index_select(&next_tokens, 0)?;
    let boosts = w_u_next
        .matmul(&directions.t()?)?
        .reshape((batch, seq_len - 1, encoder.d_hidden()))?;

    let scale = cache.require_f32(&HookPoint::LnFinalScale)?.narrow(1, 0, seq_len - 1)?;
    Ok((mid_acts * boosts)?.broadcast_div(&scale)?)
}

/// Direct logit attribution of one feature's decoder row to a trigram's last token
pub fn trigram_token_dla(
    model: &HaystackModel,
    encoder: &AutoEncoder,
    encoder_neuron: usize,
    trigram: &str,
    cfg: &AutoEncoderConfig,
) -> Result<f32> {
    let ids = model.to_token_ids(trigram)?;
    let &correct_token = ids
        .last()
        .ok_or_else(|| anyhow::anyhow!("Empty trigram"))?;
    anyhow::ensure!(
        encoder_neuron < encoder.d_hidden(),
        "Feature {encoder_neuron} out of range"
    );

    let direction = feature_output_directions(model, encoder, cfg)?.i(encoder_neuron)?;
    let w_u = model.backend().unembed_weight()?.to_dtype(DType::F32)?;
    let dla = (w_u.i(correct_token as usize)? * direction)?
        .sum_all()?
        .to_scalar::<f32>()?;
    info!("'{}' DLA = {:.2}", model.decode_token(correct_token), dla);
    Ok(dla)
}

/// Up to `max_directions` strongest directions with DLA above `cutoff`
pub fn directions_from_dla(dla: &[f32], cutoff: f32, max_directions: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..dla.len()).collect();
    order.sort_by(|&a, &b| dla[b].total_cmp(&dla[a]));
    let directions: Vec<usize> = order
        .into_iter()
        .take(max_directions)
        .filter(|&i| dla[i] > cutoff)
        .collect();
    info!(
        "Top {} directions with DLA > {}: {:?}",
        max_directions, cutoff, directions
    );
    directions
}

/// Windows of `prompt_length + 1` tokens ending on the trigram's middle token
///
/// Occurrences at index `<= prompt_length` are skipped. Returns `[n, prompt_length + 1]`.
pub fn trigram_dataset_examples<S: AsRef<str>>(
    model: &HaystackModel,
    trigram: &str,
    german_data: &[S],
    prompt_length: usize,
    max_prompts: usize,
) -> Result<Tensor> {
    let trigram_ids = model.to_token_ids(trigram)?;
    anyhow::ensure!(trigram_ids.len() >= 2, "Trigram `{trigram}` is too short");
    let token = trigram_ids[trigram_ids.len() - 2];

    let mut rows: Vec<Vec<u32>> = Vec::new();
    let mut occurrences: HashMap<String, usize> = HashMap::new();
    for prompt in german_data {
        let ids = model.to_token_ids(prompt.as_ref())?;
        for i in (prompt_length + 1)..ids.len() {
            if ids[i] != token {
                continue;
            }
            rows.push(ids[i - prompt_length..=i].to_vec());
            let end = (i + 2).min(ids.len());
            *occurrences.entry(model.decode(&ids[i - 1..end])?).or_default() += 1;
        }
        if rows.len() >= max_prompts {
            break;
        }
    }
    anyhow::ensure!(
        !rows.is_empty(),
        "No prompts contain '{}'",
        model.decode_token(token)
    );

    info!(
        "Found {} prompts with token '{}'",
        rows.len(),
        model.decode_token(token)
    );
    let mut counted: Vec<(String, usize)> = occurrences.into_iter().collect();
    counted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    info!("{:?}", counted);

    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows.len(), prompt_length + 1), model.device())?)
}

// --- Context interaction ---

/// Loss and feature activation with the context neuron active and inactive
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextEffect {
    pub context_active_loss: f32,
    pub context_inactive_loss: f32,
    pub feature_activation_context_active: f32,
    pub feature_activation_context_inactive: f32,
}

fn feature_activation_at(
    model: &HaystackModel,
    tokens: &Tensor,
    hooks: &HookSpec,
    encoder: &AutoEncoder,
    encoder_neuron: usize,
    cfg: &AutoEncoderConfig,
) -> Result<f32> {
    let hook = cfg.encoder_hook_point();
    let cache = model.run_with_hooks(tokens, &hooks.clone().with_capture(hook.clone()))?;
    let acts = cache.require_f32(&hook)?;
    let pos = resolve_position(-2, acts.dim(1)?)?;
    let feature = encoder.encode(&acts.i((.., pos))?)?.i((.., encoder_neuron))?;
    Ok(feature.mean_all()?.to_scalar::<f32>()?)
}

/// Last-position loss and feature activation at −2, with and without `deactivate_context`
pub fn context_effect_on_feature(
    model: &HaystackModel,
    tokens: &Tensor,
    encoder: &AutoEncoder,
    encoder_neuron: usize,
    deactivate_context: &HookSpec,
    cfg: &AutoEncoderConfig,
) -> Result<ContextEffect> {
    anyhow::ensure!(encoder_neuron < encoder.d_hidden(), "Feature {encoder_neuron} out of range");
    let none = HookSpec::new();
    let effect = ContextEffect {
        context_active_loss: model.loss_at(tokens, &none, -1)?,
        context_inactive_loss: model.loss_at(tokens, deactivate_context, -1)?,
        feature_activation_context_active: feature_activation_at(
            model, tokens, &none, encoder, encoder_neuron, cfg,
        )?,
        feature_activation_context_inactive: feature_activation_at(
            model,
            tokens,
            deactivate_context,
            encoder,
            encoder_neuron,
            cfg,
        )?,
    };
    info!("Mean loss context active: {:.2}", effect.context_active_loss);
    info!("Mean loss context inactive: {:.2}", effect.context_inactive_loss);
    info!(
        "Mean feature activation when context neuron active: {:.2}",
        effect.feature_activation_context_active
    );
    info!(
        "Mean feature activation with context neuron inactive: {:.2}",
        effect.feature_activation_context_inactive
    );
    Ok(effect)
}

/// Last-position loss with position −2 patched by the reconstruction of
/// context-active and context-inactive activations
pub fn encoder_token_reconstruction_losses(
    tokens: &Tensor,
    model: &HaystackModel,
    encoder: &AutoEncoder,
    deactivate_context: &HookSpec,
    cfg: &AutoEncoderConfig,
) -> Result<(f32, f32)> {
    let hook = cfg.encoder_hook_point();
    let capture = HookSpec::new().with_capture(hook.clone());
    let active = model.run_with_hooks(tokens, &capture)?.require_f32(&hook)?;
    let inactive = model
        .run_with_hooks(tokens, &deactivate_context.merged(&capture))?
        .require_f32(&hook)?;
    let pos = resolve_position(-2, active.dim(1)?)?;

    let patched_loss = |acts: &Tensor| -> Result<f32> {
        let value = encoder.reconstruct(&acts.i((.., pos))?)?;
        let spec = HookSpec::new().with_intervention(
            hook.clone(),
            Intervention::ReplaceAt {
                position: -2,
                value,
            },
        );
        model.loss_at(tokens, &spec, -1)
    };
    let active_loss = patched_loss(&active)?;
    info!(
        "Model loss when patching through encoder with context neuron active: {:.2}",
        active_loss
    );
    let inactive_loss = patched_loss(&inactive)?;
    info!(
        "Model loss when patching through encoder with context neuron inactive: {:.2}",
        inactive_loss
    );
    Ok((active_loss, inactive_loss))
}

fn fixed_feature_intervention(encoder: &Arc<AutoEncoder>, neuron: usize, value: f32) -> Intervention {
    let encoder = Arc::clone(encoder);
    Intervention::apply(move |x| {
        let pos = resolve_position(-2, x.dim(1)?)?;
        let recon = encoder
            .custom_forward(&x.i((.., pos))?, neuron, value)?
            .reconstruction;
        replace_position(x, pos, &recon)
    })
}

/// Last-position loss with position −2 reconstructed and one feature set to
/// its context-active value, its context-inactive value, and zero
pub fn encoder_feature_reconstruction_losses(
    tokens: &Tensor,
    encoder: &Arc<AutoEncoder>,
    model: &HaystackModel,
    encoder_neuron: usize,
    feature_activation_context_active: f32,
    feature_activation_context_inactive: f32,
    cfg: &AutoEncoderConfig,
) -> Result<(f32, f32, f32)> {
    let hook = cfg.encoder_hook_point();
    let loss_with = |value: f32| -> Result<f32> {
        let spec = HookSpec::new()
            .with_intervention(hook.clone(), fixed_feature_intervention(encoder, encoder_neuron, value));
        model.loss_at(tokens, &spec, -1)
    };

    let active = loss_with(feature_activation_context_active)?;
    info!(
        "Mean loss when patching second trigram token through encoder: {:.2}",
        active
    );
    let inactive = loss_with(feature_activation_context_inactive)?;
    info!(
        "Mean loss when patching second trigram token through encoder and setting N{} to activation with context neuron inactive: {:.2}",
        encoder_neuron, inactive
    );
    let zeroed = loss_with(0.0)?;
    info!(
        "Mean loss when patching second trigram token through encoder and setting N{} to zero: {:.2}",
        encoder_neuron, zeroed
    );
    Ok((active, inactive, zeroed))
}

/// Greedy continuation with the hook point replaced by its reconstruction
pub fn generate_with_encoder(
    model: &HaystackModel,
    encoder: &Arc<AutoEncoder>,
    cfg: &AutoEncoderConfig,
    input: &str,
    k: usize,
) -> Result<String> {
    let spec = HookSpec::new()
        .with_intervention(cfg.encoder_hook_point(), encoder.reconstruction_intervention());
    model.generate(input, k, &spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::apply_intervention;
    use crate::model::test_utils::tiny_model;
    use candle_core::Device;

    const PROMPTS: [&str; 3] = [
        "der die das ist ein Haus und der die das",
        "the house is a house of the house",
        "das Haus ist ein Haus in der die",
    ];

    fn setup() -> (HaystackModel, Arc<AutoEncoder>, AutoEncoderConfig) {
        let model = tiny_model();
        let encoder = Arc::new(AutoEncoder::new(32, 64, 0.01, 7, &Device::Cpu).unwrap());
        let cfg = AutoEncoderConfig {
            layer: 1,
            act_name: "mlp.hook_post".to_string(),
            expansion_factor: 2,
            l1_coeff: 0.01,
            d_in: Some(32),
            run_name: None,
            reg: "l1".to_string(),
        };
        (model, encoder, cfg)
    }

    fn synthetic_max() -> MaxActivations {
        let column = [0.0, 9.0, 3.0, 0.0, 6.0, 1.0];
        MaxActivations {
            max_activations: column.iter().map(|&a| vec![a, 0.0]).collect(),
            max_activation_token_indices: (0..6).map(|i| vec![i, 0]).collect(),
        }
    }

    #[test]
    fn test_top_activating_examples_modes() {
        let prompts = ["p0", "p1", "p2", "p3", "p4", "p5"];
        let max = synthetic_max();

        let (top, idx) = top_activating_examples(&prompts, 0, &max, 2, ExampleMode::Top).unwrap();
        assert_eq!(top, vec!["p1", "p4"]);
        assert_eq!(idx, vec![1, 4]);

        // Threshold 6: starts just below the strongest prompt
        let (upper, _) = top_activating_examples(&prompts, 0, &max, 2, ExampleMode::Upper).unwrap();
        assert_eq!(upper, vec!["p4", "p2"]);

        // Threshold 3: skips the two prompts above it
        let (middle, _) = top_activating_examples(&prompts, 0, &max, 2, ExampleMode::Middle).unwrap();
        assert_eq!(middle, vec!["p2", "p5"]);

        let (dead, _) = top_activating_examples(&prompts, 1, &max, 2, ExampleMode::Top).unwrap();
        assert!(dead.is_empty());
        assert!(top_activating_examples(&prompts, 2, &max, 2, ExampleMode::Top).is_err());
    }

    #[test]
    fn test_example_mode_parsing() {
        assert_eq!("middle".parse::<ExampleMode>().unwrap(), ExampleMode::Middle);
        assert_eq!(ExampleMode::Upper.to_string(), "upper");
        assert!("bottom".parse::<ExampleMode>().is_err());
    }

    #[test]
    fn test_directions_from_dla() {
        let dla = [0.1, 0.5, 0.3, 0.25, 0.9];
        assert_eq!(directions_from_dla(&dla, 0.2, 3), vec![4, 1, 2]);
        assert_eq!(directions_from_dla(&dla, 0.6, 3), vec![4]);
    }

    #[test]
    fn test_token_counts() {
        let mut counts = DirectionTokenCounts::default();
        counts.increment(3, 10);
        counts.increment(3, 10);
        counts.increment(3, 7);
        assert_eq!(counts.get(3, 10), 2);
        assert_eq!(counts.get(0, 10), 0);
        assert_eq!(counts.top_tokens(3, 1), vec![(10, 2)]);
    }

    #[test]
    fn test_full_ablation_removes_reconstruction() {
        let (_, encoder, _) = setup();
        let x = Tensor::randn(0f32, 1f32, (1, 4, 32), &Device::Cpu).unwrap();
        let all: Vec<usize> = (0..64).collect();
        let ablated =
            apply_intervention(&x, &direction_ablation_intervention(&encoder, &all, None).unwrap())
                .unwrap();
        let recon = encoder.reconstruct(&x).unwrap();
        let expected = (&x - recon.broadcast_sub(encoder.b_dec()).unwrap()).unwrap();
        let diff = (ablated - expected)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4);
    }

    #[test]
    fn test_position_ablation_is_local() {
        let (_, encoder, _) = setup();
        let x = Tensor::randn(0f32, 1f32, (1, 4, 32), &Device::Cpu).unwrap();
        let ablated = apply_intervention(
            &x,
            &direction_ablation_intervention(&encoder, &[0, 5, 9], Some(-2)).unwrap(),
        )
        .unwrap();
        for pos in [0, 1, 3] {
            assert_eq!(
                ablated.i((0, pos)).unwrap().to_vec1::<f32>().unwrap(),
                x.i((0, pos)).unwrap().to_vec1::<f32>().unwrap()
            );
        }
        assert!(direction_ablation_intervention(&encoder, &[64], None).is_err());
    }

    #[test]
    fn test_max_activations_and_cache() {
        let (model, encoder, cfg) = setup();
        let max = get_max_activations(&PROMPTS, &model, &encoder, &cfg).unwrap();
        assert_eq!(max.n_prompts(), 3);
        assert_eq!(max.d_hidden(), 64);
        assert!(max.max_activations.iter().flatten().all(|&a| a >= 0.0));

        let dir = tempfile::tempdir().unwrap();
        let first = get_activations(&encoder, &cfg, "enc", &PROMPTS, &model, dir.path(), true).unwrap();
        assert!(dir.path().join("data").join("enc_activations.json").exists());
        let no_prompts: [&str; 0] = [];
        let cached =
            get_activations(&encoder, &cfg, "enc", &no_prompts, &model, dir.path(), true).unwrap();
        assert_eq!(first, cached);
    }

    #[test]
    fn test_frequencies_are_fractions() {
        let (model, encoder, cfg) = setup();
        let freqs = feature_frequencies(&PROMPTS, &model, &encoder, &cfg).unwrap();
        assert_eq!(freqs.len(), 64);
        assert!(freqs.iter().all(|&f| (0.0..=1.0).contains(&f)));
    }

    #[test]
    fn test_reconstruction_losses() {
        let (model, encoder, cfg) = setup();
        let hook = cfg.encoder_hook_point();
        let losses = evaluate_reconstruction(&encoder, &hook, &PROMPTS, &model).unwrap();
        assert!(losses.original.is_finite() && losses.zero_ablation.is_finite());

        let single = reconstruction_loss(&encoder, &hook, &PROMPTS, &model).unwrap();
        assert!((single - losses.reconstruction).abs() < 1e-4);

        let batched = batched_reconstruction_loss(&encoder, &hook, &PROMPTS, &model, 2).unwrap();
        assert!(batched.is_finite());
    }

    #[test]
    fn test_direction_ablation_losses() {
        let (model, encoder, cfg) = setup();
        let (orig, ablated) =
            evaluate_direction_ablation(PROMPTS[0], &encoder, &model, &[1, 2], &cfg, LossKind::Mean)
                .unwrap();
        assert!(orig.scalar().is_some() && ablated.scalar().is_some());

        let (per_token, _) = evaluate_direction_ablation(
            PROMPTS[0],
            &encoder,
            &model,
            &[1],
            &cfg,
            LossKind::PerToken,
        )
        .unwrap();
        let LossValue::PerToken(values) = per_token else {
            panic!("expected per-token losses");
        };
        assert_eq!(values.len(), 10);

        let rank =
            eval_ablation_token_rank(PROMPTS[0], &encoder, &model, &[1], &cfg, "das", -2).unwrap();
        assert!(rank.rank < 16 && rank.ablated_rank < 16);
        assert!(rank.logprob <= 0.0);
    }

    #[test]
    fn test_direction_tokens_global_skips_early_positions() {
        let (model, encoder, cfg) = setup();
        let max = get_max_activations(&PROMPTS, &model, &encoder, &cfg).unwrap();
        let counts =
            eval_direction_tokens_global(&max, &PROMPTS, &model, &encoder, &cfg, 0.25).unwrap();
        // Only the first prompt reaches position 10
        let total: u32 = counts.counts.values().flat_map(|t| t.values()).sum();
        assert!(total as usize <= 64);
    }

    #[test]
    fn test_dla_shapes() {
        let (model, encoder, cfg) = setup();
        let tokens = model.to_tokens_batch(&PROMPTS[..2]).unwrap();
        let seq_len = tokens.dim(1).unwrap();
        let dla = encoder_dla_batched(&tokens, &model, &encoder, &cfg).unwrap();
        assert_eq!(dla.dims(), &[2, seq_len - 1, 64]);

        let single = trigram_token_dla(&model, &encoder, 3, "der die das", &cfg).unwrap();
        assert!(single.is_finite());

        let pre = AutoEncoderConfig {
            act_name: "mlp.hook_pre".to_string(),
            ..cfg
        };
        assert!(encoder_dla_batched(&tokens, &model, &encoder, &pre).is_err());
    }

    /// One-layer model over `[<|endoftext|>, x]` with identity `W_out`,
    /// final norm weight `[2, 1, 1, 1]` and raw unembedding rows `0` and `2·e0`
    fn two_token_setup() -> (HaystackModel, AutoEncoder, AutoEncoderConfig) {
        use crate::forward_neox::{HaystackNeox, NeoxConfig};
        use crate::model::test_utils::word_tokenizer;
        use crate::model::ENDOFTEXT;
        use candle_nn::{VarBuilder, VarMap};

        let config = NeoxConfig {
            hidden_size: 4,
            intermediate_size: 4,
            num_attention_heads: 1,
            num_hidden_layers: 1,
            vocab_size: 2,
            rotary_pct: 0.5,
            rotary_emb_base: 10_000.0,
            layer_norm_eps: 1e-5,
            max_position_embeddings: 16,
            use_parallel_residual: true,
        };
        let dev = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        HaystackNeox::from_vb(vb, config.clone()).unwrap();

        let eye = Tensor::eye(4, DType::F32, &dev).unwrap();
        varmap.set_one("gpt_neox.layers.0.mlp.dense_4h_to_h.weight", &eye).unwrap();
        let ln = Tensor::new(&[2f32, 1., 1., 1.], &dev).unwrap();
        varmap.set_one("gpt_neox.final_layer_norm.weight", &ln).unwrap();
        let w_u = Tensor::new(&[[0f32, 0., 0., 0.], [2., 0., 0., 0.]], &dev).unwrap();
        varmap.set_one("embed_out.weight", &w_u).unwrap();

        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let neox = HaystackNeox::from_vb(vb, config).unwrap();
        let model = HaystackModel::from_parts(
            Box::new(neox),
            word_tokenizer(&[ENDOFTEXT, "x"]),
            dev.clone(),
            "test/two-token",
        )
        .unwrap();

        let w_enc = Tensor::new(&[[1f32, 0.], [0., 1.], [0., 0.], [0., 0.]], &dev).unwrap();
        let b_enc = Tensor::new(&[10f32, 10.], &dev).unwrap();
        let w_dec = Tensor::new(&[[1f32, 0., 0., 0.], [0., 1., 0., 0.]], &dev).unwrap();
        let b_dec = Tensor::zeros(4, DType::F32, &dev).unwrap();
        let encoder = AutoEncoder::from_tensors(w_enc, b_enc, w_dec, b_dec, 0.01).unwrap();
        let cfg = AutoEncoderConfig {
            layer: 0,
            act_name: "mlp.hook_post".to_string(),
            expansion_factor: 2,
            l1_coeff: 0.01,
            d_in: Some(4),
            run_name: None,
            reg: "l1".to_string(),
        };
        (model, encoder, cfg)
    }

    #[test]
    fn test_trigram_dla_matches_hand_computation() {
        let (model, encoder, cfg) = two_token_setup();

        // Centred unembedding: x -> [1, 0, 0, 0], eot -> [-1, 0, 0, 0]
        // Feature 0: e0 centred [0.75, -0.25, -0.25, -0.25] * [2, 1, 1, 1] -> 1.5 on x
        // Feature 1: e1 centred [-0.25, 0.75, -0.25, -0.25] * [2, 1, 1, 1] -> -0.5 on x
        let f0 = trigram_token_dla(&model, &encoder, 0, "x x x", &cfg).unwrap();
        let f1 = trigram_token_dla(&model, &encoder, 1, "x x x", &cfg).unwrap();
        assert!((f0 - 1.5).abs() < 1e-5, "{f0}");
        assert!((f1 + 0.5).abs() < 1e-5, "{f1}");
        assert!(trigram_token_dla(&model, &encoder, 2, "x x x", &cfg).is_err());
    }

    #[test]
    fn test_batched_dla_matches_hand_computation() {
        let (model, encoder, cfg) = two_token_setup();
        // Next tokens x, eot, x
        let tokens = Tensor::new(&[[0u32, 1, 0, 1]], &Device::Cpu).unwrap();
        let dla = encoder_dla_batched(&tokens, &model, &encoder, &cfg).unwrap();
        assert_eq!(dla.dims(), &[1, 3, 2]);

        let spec = HookSpec::new()
            .with_capture(HookPoint::MlpPost(0))
            .with_capture(HookPoint::LnFinalScale);
        let cache = model.run_with_hooks(&tokens, &spec).unwrap();
        let acts = encoder
            .encode_any(&cache.require_f32(&HookPoint::MlpPost(0)).unwrap())
            .unwrap();
        let acts: Vec<Vec<f32>> = acts.squeeze(0).unwrap().to_vec2().unwrap();
        let scale: Vec<f32> = cache
            .require_f32(&HookPoint::LnFinalScale)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        let boosts = [[1.5f32, -0.5], [-1.5, 0.5], [1.5, -0.5]];
        let dla: Vec<Vec<f32>> = dla.squeeze(0).unwrap().to_vec2().unwrap();
        for pos in 0..3 {
            for f in 0..2 {
                assert!(acts[pos][f] > 0.0);
                let expected = acts[pos][f] * boosts[pos][f] / scale[pos];
                assert!(
                    (dla[pos][f] - expected).abs() < 1e-4,
                    "pos {pos} feature {f}: {} vs {expected}",
                    dla[pos][f]
                );
            }
        }
    }

    #[test]
    fn test_trigram_examples() {
        let model = tiny_model();
        let data = ["der die das ist der die das", "das ist"];
        let rows = trigram_dataset_examples(&model, "die das ist", &data, 2, 100).unwrap();
        let rows: Vec<Vec<u32>> = rows.to_vec2().unwrap();
        assert_eq!(rows, vec![vec![2, 3, 4], vec![2, 3, 4]]);
        assert!(trigram_dataset_examples(&model, "die Haus ist", &data, 2, 100).is_err());
    }

    #[test]
    fn test_context_interaction() {
        let (model, encoder, cfg) = setup();
        let tokens = model.to_tokens_batch(&PROMPTS[..2]).unwrap();
        let deactivate = HookSpec::new()
            .with_intervention(HookPoint::MlpPost(0), Intervention::set_neuron(3, 0.0));

        let effect = context_effect_on_feature(&model, &tokens, &encoder, 5, &deactivate, &cfg).unwrap();
        assert!(effect.context_active_loss.is_finite());
        assert!(effect.feature_activation_context_active >= 0.0);

        let (active, inactive) =
            encoder_token_reconstruction_losses(&tokens, &model, &encoder, &deactivate, &cfg).unwrap();
        assert!(active.is_finite() && inactive.is_finite());

        let (a, i, z) =
            encoder_feature_reconstruction_losses(&tokens, &encoder, &model, 5, 2.0, 0.5, &cfg).unwrap();
        assert!(a.is_finite() && i.is_finite() && z.is_finite());
    }

    #[test]
    fn test_generate_with_encoder() {
        let (model, encoder, cfg) = setup();
        let text = generate_with_encoder(&model, &encoder, &cfg, "der die", 3).unwrap();
        assert!(text.starts_with("der die"));
    }
}
