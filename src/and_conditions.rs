//! AND-neuron analysis of the German context neuron
//!
//! Prompts end in a multi-token German word whose last token is predicted.
//! Each of the three features (previous token at −3, current token at −2,
//! context neuron) is either present (`Y`)
//! or absent (`N`), giving eight conditions from `YYY` to `NNN`. Tokens are
//! removed by replacing them with random common tokens; the context is
//! removed with the deactivation hooks.
//!
//! Comparing a condition with the sum of its parts shows whether the model
//! (or an individual MLP neuron) computes more than an additive function of
//! the features.
//!
//! The ablation sweep covers the four flag-based include modes plus
//! "Positive and Negative", which takes half of `k` from each end of the
//! diff ranking. That mode has no flag, so its sweep has no `All` entry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, IndexOp, Tensor};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};
use tracing::{debug, info};

use crate::cache::column_stds;
use crate::context_neuron::{path_patched_mlp_loss, path_patching_effects, ContextHooks, ContextNeuron, ReturnType};
use crate::corpus::{
    common_tokens, create_ablation_prompts, generate_random_prompts, ignore_tokens, rows_to_tensor, AblationMode,
    LanguageData,
};
use crate::hooks::{replace_position, resolve_position, HookPoint, HookSpec, Intervention};
use crate::model::HaystackModel;

/// Presence of (previous token, current token, context)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Condition {
    Nnn,
    Nny,
    Nyn,
    Ynn,
    Nyy,
    Yny,
    Yyn,
    Yyy,
}

impl Condition {
    pub const ALL: [Condition; 8] = [
        Self::Nnn,
        Self::Nny,
        Self::Nyn,
        Self::Ynn,
        Self::Nyy,
        Self::Yny,
        Self::Yyn,
        Self::Yyy,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Nnn => "NNN",
            Self::Nny => "NNY",
            Self::Nyn => "NYN",
            Self::Ynn => "YNN",
            Self::Nyy => "NYY",
            Self::Yny => "YNY",
            Self::Yyn => "YYN",
            Self::Yyy => "YYY",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Whether the context neuron is on
    pub fn context_active(self) -> bool {
        matches!(self, Self::Nny | Self::Nyy | Self::Yny | Self::Yyy)
    }

    /// Token replacement producing this condition's prompts, `None` for the originals
    pub fn ablation_mode(self) -> Option<AblationMode> {
        match self {
            Self::Yyy | Self::Yyn => None,
            Self::Nyy | Self::Nyn => Some(AblationMode::Nyy),
            Self::Yny | Self::Ynn => Some(AblationMode::Yny),
            Self::Nny | Self::Nnn => Some(AblationMode::Nny),
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One value per condition
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ConditionValues([f64; 8]);

impl ConditionValues {
    pub fn from_fn<F: FnMut(Condition) -> Result<f64>>(mut f: F) -> Result<Self> {
        let mut values = [0.0; 8];
        for c in Condition::ALL {
            values[c.index()] = f(c)?;
        }
        Ok(Self(values))
    }

    pub fn get(&self, condition: Condition) -> f64 {
        self.0[condition.index()]
    }

    fn map<F: Fn(Condition, f64) -> f64>(&self, f: F) -> Self {
        let mut values = self.0;
        for c in Condition::ALL {
            values[c.index()] = f(c, values[c.index()]);
        }
        Self(values)
    }

    pub fn to_map(&self) -> BTreeMap<String, f64> {
        Condition::ALL
            .iter()
            .map(|&c| (c.label().to_string(), self.get(c)))
            .collect()
    }
}

/// What is measured at the end of each prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Loss of the final token
    Loss,
    /// Logit of the answer token, read at the current token
    Logits,
}

impl ValueKind {
    /// Sign applied so that a larger difference always means a larger effect
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Loss => 1.0,
            Self::Logits => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loss => "loss",
            Self::Logits => "logits",
        }
    }
}

/// Original prompts and the three token-ablated variants
#[derive(Debug, Clone)]
pub struct ConditionPrompts {
    original: Tensor,
    previous_ablated: Tensor,
    current_ablated: Tensor,
    both_ablated: Tensor,
}

impl ConditionPrompts {
    pub fn new(
        prompts: &[Vec<u32>],
        common: &[u32],
        seed: u64,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let variant = |mode: AblationMode, offset: u64| -> Result<Tensor> {
            let rows = create_ablation_prompts(prompts, mode, common, seed + offset)?;
            rows_to_tensor(&rows, device)
        };
        Ok(Self {
            original: rows_to_tensor(prompts, device)?,
            previous_ablated: variant(AblationMode::Nyy, 0)?,
            current_ablated: variant(AblationMode::Yny, 1)?,
            both_ablated: variant(AblationMode::Nny, 2)?,
        })
    }

    pub fn tokens(&self, condition: Condition) -> &Tensor {
        match condition.ablation_mode() {
            None => &self.original,
            Some(AblationMode::Nyy) => &self.previous_ablated,
            Some(AblationMode::Yny) => &self.current_ablated,
            Some(AblationMode::Nny) => &self.both_ablated,
        }
    }

    pub fn original(&self) -> &Tensor {
        &self.original
    }
}

/// Last token of `option` as tokenized on its own
pub fn answer_token(model: &HaystackModel, option: &str) -> Result<u32> {
    model
        .encode(option)?
        .last()
        .copied()
        .ok_or_else(|| anyhow::anyhow!("`{option}` encodes to no tokens"))
}

/// Model output for one condition
///
/// With the context present the indirect path-patched run is used, so later
/// MLP layers see the context while the direct path does not.
pub fn condition_value(
    model: &HaystackModel,
    hooks: &ContextHooks,
    prompts: &ConditionPrompts,
    condition: Condition,
    answer: u32,
    kind: ValueKind,
) -> Result<f64> {
    let tokens = prompts.tokens(condition);
    let value = if condition.context_active() {
        let return_type = match kind {
            ValueKind::Loss => ReturnType::Loss(-1),
            ValueKind::Logits => ReturnType::Logits(-2),
        };
        let effects = path_patching_effects(model, tokens, hooks, return_type)?;
        match kind {
            ValueKind::Loss => effects.indirect,
            ValueKind::Logits => effects.indirect.i((.., answer as usize))?,
        }
    } else {
        match kind {
            ValueKind::Loss => {
                let per_token = model.loss_per_token(tokens, hooks.deactivate())?;
                let pos = resolve_position(-1, per_token.dim(1)?)?;
                per_token.i((.., pos))?
            }
            ValueKind::Logits => {
                let logits = model.logits(tokens, hooks.deactivate())?;
                let pos = resolve_position(-2, logits.dim(1)?)?;
                logits.i((.., pos, answer as usize))?.to_dtype(DType::F32)?
            }
        }
    };
    Ok(f64::from(value.mean_all()?.to_scalar::<f32>()?))
}

/// Interaction scores derived from the eight condition values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AndScores {
    #[serde(rename = "Fix Current")]
    pub fix_current: f64,
    #[serde(rename = "Fix Previous")]
    pub fix_previous: f64,
    #[serde(rename = "Fix Context")]
    pub fix_context: f64,
    #[serde(rename = "Single Feature")]
    pub single_feature: f64,
    #[serde(rename = "Two Features")]
    pub two_features: f64,
    #[serde(rename = "Merge Tokens")]
    pub merge_tokens: f64,
}

impl AndScores {
    pub fn from_values(values: &ConditionValues, kind: ValueKind) -> Self {
        use Condition::*;
        let m = kind.multiplier();
        let diff = |base: Condition, other: Condition| (values.get(base) - values.get(other)) * m;

        let fix_current = diff(Nyn, Yyy) - (diff(Nyn, Yyn) + diff(Nyn, Nyy));
        let fix_previous = diff(Ynn, Yyy) - (diff(Ynn, Yyn) + diff(Ynn, Yny));
        let fix_context = diff(Nny, Yyy) - (diff(Nny, Nyy) + diff(Nny, Yny));

        let all = diff(Nnn, Yyy);
        let single_feature = all - (diff(Nnn, Nny) + diff(Nnn, Nyn) + diff(Nnn, Ynn));
        let two_features = all - (diff(Nnn, Nyy) + diff(Nnn, Yny) + diff(Nnn, Yyn)) / 2.0;
        let merge_tokens = all - (diff(Nnn, Yyn) + diff(Nnn, Nny));

        Self {
            fix_current,
            fix_previous,
            fix_context,
            single_feature,
            two_features,
            merge_tokens,
        }
    }
}

/// Condition values and scores for one option
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AndConditionRecord {
    #[serde(rename = "Option")]
    pub option: String,
    #[serde(rename = "Values")]
    pub values: BTreeMap<String, f64>,
    #[serde(flatten)]
    pub scores: AndScores,
}

/// Value of every condition for the prompts ending in `option`
pub fn compute_and_conditions(
    model: &HaystackModel,
    hooks: &ContextHooks,
    option: &str,
    prompts: &ConditionPrompts,
    kind: ValueKind,
) -> Result<AndConditionRecord> {
    let answer = answer_token(model, option)?;
    let values = ConditionValues::from_fn(|c| {
        let v = condition_value(model, hooks, prompts, c, answer, kind)?;
        debug!("{option} {kind:?} {c}: {v:.4}");
        Ok(v)
    })?;
    Ok(AndConditionRecord {
        option: option.to_string(),
        values: values.to_map(),
        scores: AndScores::from_values(&values, kind),
    })
}

/// Which additive baseline a neuron's `YYY` activation is compared with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeatureMode {
    TwoFeatures,
    SingleFeatures,
    CurrentToken,
    PreviousToken,
    ContextNeuron,
    MergeTokens,
}

impl FeatureMode {
    pub const ALL: [FeatureMode; 6] = [
        Self::TwoFeatures,
        Self::SingleFeatures,
        Self::CurrentToken,
        Self::PreviousToken,
        Self::ContextNeuron,
        Self::MergeTokens,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::TwoFeatures => "Two Features",
            Self::SingleFeatures => "Single Features",
            Self::CurrentToken => "Current Token",
            Self::PreviousToken => "Previous Token",
            Self::ContextNeuron => "Context Neuron",
            Self::MergeTokens => "Merge Tokens",
        }
    }

    /// (joint effect, sum of partial effects) relative to this mode's baseline
    fn sides(self, v: &ConditionValues) -> (f64, f64) {
        use Condition::*;
        let rel = |c: Condition, base: Condition| v.get(c) - v.get(base);
        match self {
            Self::TwoFeatures => (
                rel(Yyy, Nnn),
                (rel(Yny, Nnn) + rel(Nyy, Nnn) + rel(Yyn, Nnn)) / 2.0,
            ),
            Self::SingleFeatures => (rel(Yyy, Nnn), rel(Ynn, Nnn) + rel(Nyn, Nnn) + rel(Nny, Nnn)),
            Self::CurrentToken => (rel(Yyy, Nyn), rel(Yyn, Nyn) + rel(Nyy, Nyn)),
            Self::PreviousToken => (rel(Yyy, Ynn), rel(Yyn, Ynn) + rel(Yny, Ynn)),
            Self::ContextNeuron => (rel(Yyy, Nny), rel(Yny, Nny) + rel(Nyy, Nny)),
            Self::MergeTokens => (rel(Yyy, Nnn), rel(Yyn, Nnn) + rel(Nny, Nnn)),
        }
    }
}

/// Mean activation of one MLP neuron at the current token under each condition
#[derive(Debug, Clone, PartialEq)]
pub struct NeuronConditionRow {
    pub neuron: usize,
    pub values: ConditionValues,
    pub ablation_loss_increase: Option<f64>,
}

impl NeuronConditionRow {
    pub fn diff(&self, mode: FeatureMode) -> f64 {
        let (joint, parts) = mode.sides(&self.values);
        joint - parts
    }

    /// Joint effect exceeds the parts and the neuron fires in `YYY`
    pub fn is_and(&self, mode: FeatureMode) -> bool {
        let (joint, parts) = mode.sides(&self.values);
        joint > parts && self.values.get(Condition::Yyy) > 0.0
    }

    /// Joint effect falls short of the parts and the neuron fires in `NNN`
    pub fn is_neg_and(&self, mode: FeatureMode) -> bool {
        let (joint, parts) = mode.sides(&self.values);
        joint < parts && self.values.get(Condition::Nnn) > 0.0
    }

    pub fn greater_than_all(&self) -> bool {
        let yyy = self.values.get(Condition::Yyy);
        Condition::ALL
            .iter()
            .filter(|&&c| c != Condition::Yyy)
            .all(|&c| yyy > self.values.get(c))
    }

    pub fn smaller_than_all(&self) -> bool {
        let yyy = self.values.get(Condition::Yyy);
        Condition::ALL
            .iter()
            .filter(|&&c| c != Condition::Yyy)
            .all(|&c| yyy < self.values.get(c))
    }

    /// Flat record with the condition, diff and flag columns
    pub fn to_record(&self) -> BTreeMap<String, serde_json::Value> {
        let mut record: BTreeMap<String, serde_json::Value> = self
            .values
            .to_map()
            .into_iter()
            .map(|(k, v)| (k, v.into()))
            .collect();
        record.insert("Neuron".into(), self.neuron.into());
        for mode in FeatureMode::ALL {
            record.insert(format!("{} (diff)", mode.label()), self.diff(mode).into());
            record.insert(format!("{} (AND)", mode.label()), self.is_and(mode).into());
            record.insert(format!("{} (NEG AND)", mode.label()), self.is_neg_and(mode).into());
        }
        record.insert("Greater Than All".into(), self.greater_than_all().into());
        record.insert("Smaller Than All".into(), self.smaller_than_all().into());
        if let Some(increase) = self.ablation_loss_increase {
            record.insert("AblationLossIncrease".into(), increase.into());
        }
        record
    }
}

/// Mean hook activation at position −2, one row per neuron
pub fn activation_table(
    model: &HaystackModel,
    hooks: &ContextHooks,
    prompts: &ConditionPrompts,
    hook: &HookPoint,
) -> Result<Vec<NeuronConditionRow>> {
    let mut per_condition: BTreeMap<Condition, Vec<f32>> = BTreeMap::new();
    for c in Condition::ALL {
        let spec = if c.context_active() {
            hooks.activate()
        } else {
            hooks.deactivate()
        };
        let cache = model.run_with_hooks(prompts.tokens(c), &spec.clone().with_capture(hook.clone()))?;
        let acts = cache.require_f32(hook)?;
        let pos = resolve_position(-2, acts.dim(1)?)?;
        per_condition.insert(c, acts.i((.., pos))?.mean(0)?.to_vec1()?);
    }

    let d = per_condition.values().next().map_or(0, Vec::len);
    (0..d)
        .map(|neuron| {
            let values = ConditionValues::from_fn(|c| {
                per_condition
                    .get(&c)
                    .and_then(|v| v.get(neuron))
                    .map(|&v| f64::from(v))
                    .ok_or_else(|| anyhow::anyhow!("Missing activation for {c} neuron {neuron}"))
            })?;
            Ok(NeuronConditionRow {
                neuron,
                values,
                ablation_loss_increase: None,
            })
        })
        .collect()
}

/// Divide each neuron's condition values by its activation std
///
/// Neurons with zero std are left unscaled.
pub fn scale_table(rows: &[NeuronConditionRow], stds: &[f64]) -> Result<Vec<NeuronConditionRow>> {
    anyhow::ensure!(
        rows.len() == stds.len(),
        "Got {} rows but {} standard deviations",
        rows.len(),
        stds.len()
    );
    Ok(rows
        .iter()
        .zip(stds)
        .map(|(row, &std)| NeuronConditionRow {
            values: if std > 0.0 {
                row.values.map(|_, v| v / std)
            } else {
                row.values
            },
            ..row.clone()
        })
        .collect())
}

/// Last-position loss with the context on and `neurons` of `mlp_layer` fixed
/// to their mean activation under `condition`
pub fn mlp_ablation_loss(
    model: &HaystackModel,
    tokens: &Tensor,
    hooks: &ContextHooks,
    mlp_layer: usize,
    rows: &[NeuronConditionRow],
    neurons: &[usize],
    condition: Condition,
) -> Result<f32> {
    let d = rows.len();
    let mut mask = vec![0f32; d];
    let mut values = vec![0f32; d];
    for &n in neurons {
        let row = rows
            .get(n)
            .ok_or_else(|| anyhow::anyhow!("Neuron {n} out of range ({d} rows)"))?;
        mask[n] = 1.0;
        values[n] = row.values.get(condition) as f32;
    }
    let mask = Tensor::from_vec(mask, d, model.device())?;
    let values = Tensor::from_vec(values, d, model.device())?;

    let spec = hooks.activate().clone().with_intervention(
        HookPoint::MlpPost(mlp_layer),
        Intervention::apply(move |t| {
            let pos = resolve_position(-2, t.dim(1)?)?;
            let current = t.i((.., pos))?;
            let keep = mask.affine(-1.0, 1.0)?.to_dtype(t.dtype())?;
            let fixed = (&values * &mask)?.to_dtype(t.dtype())?;
            let patched = current.broadcast_mul(&keep)?.broadcast_add(&fixed)?;
            replace_position(t, pos, &patched)
        }),
    );
    model.loss_at(tokens, &spec, -1)
}

/// Loss increase from fixing each neuron alone to its `YYN` value
pub fn ablation_loss_increases(
    model: &HaystackModel,
    tokens: &Tensor,
    hooks: &ContextHooks,
    mlp_layer: usize,
    rows: &[NeuronConditionRow],
) -> Result<Vec<f64>> {
    let original = model.loss_at(tokens, hooks.activate(), -1)?;
    let all: Vec<usize> = (0..rows.len()).collect();
    let all_ablated = mlp_ablation_loss(model, tokens, hooks, mlp_layer, rows, &all, Condition::Yyn)?;
    info!("MLP{mlp_layer} YYN ablation: original {original:.4}, all neurons {all_ablated:.4}");

    (0..rows.len())
        .map(|n| {
            let ablated = mlp_ablation_loss(model, tokens, hooks, mlp_layer, rows, &[n], Condition::Yyn)?;
            Ok(f64::from(ablated - original))
        })
        .collect()
}

/// Neuron indices of the `k` rows passing `filter` with the largest
/// (or smallest, if `ascending`) diff for `mode`
pub fn top_k_neurons<F>(
    rows: &[NeuronConditionRow],
    filter: F,
    mode: FeatureMode,
    k: usize,
    ascending: bool,
) -> Vec<usize>
where
    F: Fn(&NeuronConditionRow) -> bool,
{
    let mut selected: Vec<&NeuronConditionRow> = rows.iter().filter(|r| filter(r)).collect();
    selected.sort_by(|a, b| {
        let ord = a.diff(mode).total_cmp(&b.diff(mode));
        if ascending {
            ord
        } else {
            ord.reverse()
        }
    });
    selected.into_iter().take(k).map(|r| r.neuron).collect()
}

/// How neurons are picked for path-patched ablation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludeMode {
    AllPositive,
    GreaterPositive,
    AllNegative,
    SmallerNegative,
    PositiveAndNegative,
}

impl IncludeMode {
    /// Every mode swept by [`ablation_sweep`], mixed mode last
    pub const ALL: [IncludeMode; 5] = [
        Self::AllPositive,
        Self::GreaterPositive,
        Self::AllNegative,
        Self::SmallerNegative,
        Self::PositiveAndNegative,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::AllPositive => "All Positive",
            Self::GreaterPositive => "Greater Positive",
            Self::AllNegative => "All Negative",
            Self::SmallerNegative => "Smaller Negative",
            Self::PositiveAndNegative => "Positive and Negative",
        }
    }

    /// Every neuron whose AND flag holds; `None` for the mixed mode
    pub fn flagged(self, rows: &[NeuronConditionRow], mode: FeatureMode) -> Option<Vec<usize>> {
        let pick = |f: &dyn Fn(&NeuronConditionRow) -> bool| {
            rows.iter().filter(|r| f(r)).map(|r| r.neuron).collect()
        };
        match self {
            Self::AllPositive => Some(pick(&|r| r.is_and(mode))),
            Self::GreaterPositive => Some(pick(&|r| r.is_and(mode) && r.greater_than_all())),
            Self::AllNegative => Some(pick(&|r| r.is_neg_and(mode))),
            Self::SmallerNegative => Some(pick(&|r| r.is_neg_and(mode) && r.smaller_than_all())),
            Self::PositiveAndNegative => None,
        }
    }

    /// Top `k` neurons by diff among the mode's candidates
    pub fn top_k(self, rows: &[NeuronConditionRow], mode: FeatureMode, k: usize) -> Vec<usize> {
        let yyy = |r: &NeuronConditionRow| r.values.get(Condition::Yyy) > 0.0;
        let nnn = |r: &NeuronConditionRow| r.values.get(Condition::Nnn) > 0.0;
        match self {
            Self::AllPositive => top_k_neurons(rows, yyy, mode, k, false),
            Self::GreaterPositive => top_k_neurons(rows, |r| yyy(r) && r.greater_than_all(), mode, k, false),
            Self::AllNegative => top_k_neurons(rows, nnn, mode, k, true),
            Self::SmallerNegative => top_k_neurons(rows, |r| nnn(r) && r.smaller_than_all(), mode, k, true),
            Self::PositiveAndNegative => {
                let mut neurons = top_k_neurons(rows, nnn, mode, k / 2, true);
                neurons.extend(top_k_neurons(rows, yyy, mode, k / 2, false));
                neurons
            }
        }
    }
}

/// Neuron counts swept in the ablation study
pub const SWEEP_K: [usize; 4] = [5, 10, 25, 50];

/// Path-patched losses, keyed by include mode, then `All` or `k`, then column
pub type AblationSweep = BTreeMap<String, BTreeMap<String, BTreeMap<String, f64>>>;

/// Path-patched loss of each neuron selection against the full and empty selections
pub fn ablation_sweep(
    model: &HaystackModel,
    tokens: &Tensor,
    hooks: &ContextHooks,
    mlp_layer: usize,
    rows: &[NeuronConditionRow],
    ks: &[usize],
) -> Result<AblationSweep> {
    let original = f64::from(path_patched_mlp_loss(model, tokens, hooks, mlp_layer, &[])?);
    let all_ablated = f64::from(model.loss_at(tokens, hooks.deactivate(), -1)?);

    let baseline = || {
        BTreeMap::from([
            ("Original".to_string(), original),
            ("All Ablated".to_string(), all_ablated),
        ])
    };
    let ablate = |neurons: &[usize], losses: &mut BTreeMap<String, f64>, mode: FeatureMode| -> Result<()> {
        let loss = path_patched_mlp_loss(model, tokens, hooks, mlp_layer, neurons)?;
        losses.insert(format!("{} (N={})", mode.label(), neurons.len()), f64::from(loss));
        Ok(())
    };

    let mut sweep = AblationSweep::new();
    for include in IncludeMode::ALL {
        let mut by_k = BTreeMap::new();

        if FeatureMode::ALL.iter().all(|&m| include.flagged(rows, m).is_some()) {
            let mut losses = baseline();
            for mode in FeatureMode::ALL {
                let neurons = include.flagged(rows, mode).unwrap_or_default();
                ablate(&neurons, &mut losses, mode)?;
            }
            by_k.insert("All".to_string(), losses);
        }

        for &k in ks {
            let mut losses = baseline();
            for mode in FeatureMode::ALL {
                ablate(&include.top_k(rows, mode, k), &mut losses, mode)?;
            }
            by_k.insert(k.to_string(), losses);
        }
        info!("Ablation sweep done for {}", include.label());
        sweep.insert(include.label().to_string(), by_k);
    }
    Ok(sweep)
}

/// Values beyond the upper bound of a quantile-based IQR rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IqrOutliers {
    pub q1: f64,
    pub q3: f64,
    pub iqr: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub outliers: Vec<f64>,
}

pub fn iqr_outliers(values: &[f64], lower_quantile: f64, upper_quantile: f64) -> Result<IqrOutliers> {
    anyhow::ensure!(!values.is_empty(), "No values to compute quantiles of");
    let mut data = Data::new(values.to_vec());
    let q1 = data.quantile(lower_quantile);
    let q3 = data.quantile(upper_quantile);
    let iqr = q3 - q1;
    let lower_bound = q1 - 1.5 * iqr;
    let upper_bound = q3 + 1.5 * iqr;
    let outliers = values.iter().copied().filter(|&v| v > upper_bound).collect();
    Ok(IqrOutliers {
        q1,
        q3,
        iqr,
        lower_bound,
        upper_bound,
        outliers,
    })
}

/// Settings of the AND-condition analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AndConditionsConfig {
    pub model: String,
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Words whose final token is predicted
    pub options: Vec<String>,
    pub context_neuron: ContextNeuron,
    pub mlp_layer: usize,
    pub num_prompts: usize,
    pub prompt_length: usize,
    pub num_common_tokens: usize,
    pub num_german: usize,
    pub seed: u64,
}

impl Default for AndConditionsConfig {
    fn default() -> Self {
        Self {
            model: "EleutherAI/pythia-70m".to_string(),
            data_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("data/and_neurons"),
            options: vec!["orschlägen".into(), " häufig".into(), " beweglich".into()],
            context_neuron: ContextNeuron::default(),
            mlp_layer: 5,
            num_prompts: 1000,
            prompt_length: 20,
            num_common_tokens: 100,
            num_german: 200,
            seed: 42,
        }
    }
}

/// Tables produced for one option
#[derive(Debug, Clone, Serialize)]
pub struct OptionAnalysis {
    pub option: String,
    pub loss: AndConditionRecord,
    pub logits: AndConditionRecord,
    /// Keyed by hook name, then `Scaled` / `Unscaled`
    pub activations: BTreeMap<String, BTreeMap<String, Vec<BTreeMap<String, serde_json::Value>>>>,
    /// Keyed by hook name, then `Scaled` / `Unscaled`
    pub ablation_losses: BTreeMap<String, BTreeMap<String, AblationSweep>>,
    pub context_neuron_outliers: IqrOutliers,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

/// Run the whole analysis for every option and write JSON tables to `output_dir`
pub fn run(model: &HaystackModel, cfg: &AndConditionsConfig) -> Result<Vec<OptionAnalysis>> {
    std::fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("Failed to create {}", cfg.output_dir.display()))?;

    let languages = LanguageData::load(&cfg.data_dir)?;
    let german: Vec<String> = languages.german()?.iter().take(cfg.num_german).cloned().collect();
    let non_german = languages.non_german(cfg.num_german, cfg.seed);
    let hooks = ContextHooks::from_data(model, cfg.context_neuron.clone(), &german, &non_german)?;

    let ignore = ignore_tokens(model);
    let common = common_tokens(model, &german, &ignore, cfg.num_common_tokens)?;

    let hook_points = [HookPoint::MlpPre(cfg.mlp_layer), HookPoint::MlpPost(cfg.mlp_layer)];
    let mut stds = BTreeMap::new();
    for hook in &hook_points {
        let acts = model.hook_activations(&german, hook, 0..model.max_positions(), &HookSpec::new())?;
        stds.insert(hook.to_string(), column_stds(&acts)?);
    }

    let mut results = Vec::with_capacity(cfg.options.len());
    for option in &cfg.options {
        info!("Option {option:?}");
        let end_tokens = model.encode(option)?;
        let rows = generate_random_prompts(
            &end_tokens,
            &common,
            model.bos_token_id(),
            cfg.num_prompts,
            cfg.prompt_length,
            cfg.seed,
        )?;
        let prompts = ConditionPrompts::new(&rows, &common, cfg.seed, model.device())?;

        let loss = compute_and_conditions(model, &hooks, option, &prompts, ValueKind::Loss)?;
        let logits = compute_and_conditions(model, &hooks, option, &prompts, ValueKind::Logits)?;

        let post = activation_table(model, &hooks, &prompts, &HookPoint::MlpPost(cfg.mlp_layer))?;
        let increases = ablation_loss_increases(model, prompts.original(), &hooks, cfg.mlp_layer, &post)?;

        let mut activations = BTreeMap::new();
        let mut ablation_losses = BTreeMap::new();
        let mut outliers = None;
        for hook in &hook_points {
            let unscaled: Vec<NeuronConditionRow> = activation_table(model, &hooks, &prompts, hook)?
                .into_iter()
                .zip(&increases)
                .map(|(row, &inc)| NeuronConditionRow {
                    ablation_loss_increase: Some(inc),
                    ..row
                })
                .collect();
            let std = stds
                .get(&hook.to_string())
                .ok_or_else(|| anyhow::anyhow!("No activation std for {hook}"))?;
            let scaled = scale_table(&unscaled, std)?;

            if matches!(hook, HookPoint::MlpPost(_)) {
                let diffs: Vec<f64> = scaled.iter().map(|r| r.diff(FeatureMode::ContextNeuron)).collect();
                let found = iqr_outliers(&diffs, 0.10, 0.90)?;
                info!(
                    "{} context neuron diff outliers above {:.3}",
                    found.outliers.len(),
                    found.upper_bound
                );
                outliers = Some(found);
            }

            let name = match hook {
                HookPoint::MlpPre(_) => "hook_pre",
                _ => "hook_post",
            };
            let mut tables = BTreeMap::new();
            let mut sweeps = BTreeMap::new();
            for (label, table) in [("Scaled", &scaled), ("Unscaled", &unscaled)] {
                tables.insert(label.to_string(), table.iter().map(NeuronConditionRow::to_record).collect());
                sweeps.insert(
                    label.to_string(),
                    ablation_sweep(model, prompts.original(), &hooks, cfg.mlp_layer, table, &SWEEP_K)?,
                );
            }
            activations.insert(name.to_string(), tables);
            ablation_losses.insert(name.to_string(), sweeps);
        }

        results.push(OptionAnalysis {
            option: option.clone(),
            loss,
            logits,
            activations,
            ablation_losses,
            context_neuron_outliers: outliers
                .ok_or_else(|| anyhow::anyhow!("No hook_post table for {option:?}"))?,
        });
    }

    for kind in [ValueKind::Loss, ValueKind::Logits] {
        let records: Vec<&AndConditionRecord> = results
            .iter()
            .map(|r| match kind {
                ValueKind::Loss => &r.loss,
                ValueKind::Logits => &r.logits,
            })
            .collect();
        write_json(&cfg.output_dir.join(format!("and_conditions_{}.json", kind.as_str())), &records)?;
    }
    write_json(&cfg.output_dir.join("activation_tables.json"), &results)?;
    info!("Wrote AND-condition tables to {}", cfg.output_dir.display());
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_utils::tiny_model;

    fn values(pairs: [(Condition, f64); 8]) -> ConditionValues {
        ConditionValues::from_fn(|c| Ok(pairs.iter().find(|(k, _)| *k == c).unwrap().1)).unwrap()
    }

    fn additive() -> ConditionValues {
        use Condition::*;
        // prev = 1, current = 2, context = 4, plus an interaction of 3 in YYY
        values([
            (Nnn, 0.0),
            (Ynn, 1.0),
            (Nyn, 2.0),
            (Nny, 4.0),
            (Yyn, 3.0),
            (Yny, 5.0),
            (Nyy, 6.0),
            (Yyy, 10.0),
        ])
    }

    fn row(neuron: usize, v: ConditionValues) -> NeuronConditionRow {
        NeuronConditionRow {
            neuron,
            values: v,
            ablation_loss_increase: None,
        }
    }

    #[test]
    fn test_condition_layout() {
        assert_eq!(Condition::ALL.len(), 8);
        assert!(Condition::Yyy.context_active());
        assert!(!Condition::Yyn.context_active());
        assert_eq!(Condition::Nyn.ablation_mode(), Some(AblationMode::Nyy));
        assert_eq!(Condition::Ynn.ablation_mode(), Some(AblationMode::Yny));
        assert_eq!(Condition::Nnn.ablation_mode(), Some(AblationMode::Nny));
        assert_eq!(Condition::Yyn.ablation_mode(), None);
        let labels: Vec<&str> = Condition::ALL.iter().map(|c| c.label()).collect();
        assert_eq!(labels, ["NNN", "NNY", "NYN", "YNN", "NYY", "YNY", "YYN", "YYY"]);
    }

    #[test]
    fn test_scores_on_loss() {
        let s = AndScores::from_values(&additive(), ValueKind::Loss);
        // diffs are base - other, so a rising value gives negative diffs
        // current: (2-10) - ((2-3) + (2-6)) = -3
        assert!((s.fix_current + 3.0).abs() < 1e-12);
        // previous: (1-10) - ((1-3) + (1-5)) = -3
        assert!((s.fix_previous + 3.0).abs() < 1e-12);
        // context: (4-10) - ((4-6) + (4-5)) = -3
        assert!((s.fix_context + 3.0).abs() < 1e-12);
        // single: -10 - (-4 - 2 - 1) = -3
        assert!((s.single_feature + 3.0).abs() < 1e-12);
        // two: -10 - (-6 - 5 - 3) / 2 = -3
        assert!((s.two_features + 3.0).abs() < 1e-12);
        // merge: -10 - (-3 - 4) = -3
        assert!((s.merge_tokens + 3.0).abs() < 1e-12);

        let logits = AndScores::from_values(&additive(), ValueKind::Logits);
        assert!((logits.fix_current - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_neuron_flags_and_diffs() {
        let r = row(0, additive());
        for mode in FeatureMode::ALL {
            assert!((r.diff(mode) - 3.0).abs() < 1e-12, "{mode:?}");
            assert!(r.is_and(mode));
            assert!(!r.is_neg_and(mode));
        }
        assert!(r.greater_than_all());
        assert!(!r.smaller_than_all());

        let negated = row(1, additive().map(|_, v| -v));
        // NNN is 0, so NEG AND cannot hold
        assert!(!negated.is_neg_and(FeatureMode::TwoFeatures));
        assert!(negated.smaller_than_all());

        let record = r.to_record();
        assert_eq!(record["Context Neuron (AND)"], serde_json::Value::Bool(true));
        assert_eq!(record["YYY"], serde_json::json!(10.0));
        assert!(!record.contains_key("AblationLossIncrease"));
    }

    #[test]
    fn test_top_k_and_include_modes() {
        let rows: Vec<NeuronConditionRow> = (0..4)
            .map(|i| {
                let scale = i as f64 - 1.0;
                row(i, additive().map(|c, v| if c == Condition::Yyy { v + scale } else { v }))
            })
            .collect();
        // YYY = 9, 10, 11, 12 -> diffs 2, 3, 4, 5
        assert_eq!(top_k_neurons(&rows, |_| true, FeatureMode::MergeTokens, 2, false), vec![3, 2]);
        assert_eq!(top_k_neurons(&rows, |_| true, FeatureMode::MergeTokens, 2, true), vec![0, 1]);
        assert_eq!(top_k_neurons(&rows, |r| r.neuron != 3, FeatureMode::MergeTokens, 9, false), vec![2, 1, 0]);

        assert_eq!(IncludeMode::AllPositive.top_k(&rows, FeatureMode::TwoFeatures, 1), vec![3]);
        // NNN is 0 for every row, so negative modes find nothing
        assert!(IncludeMode::AllNegative.top_k(&rows, FeatureMode::TwoFeatures, 3).is_empty());
        assert_eq!(IncludeMode::PositiveAndNegative.top_k(&rows, FeatureMode::TwoFeatures, 4), vec![3, 2]);
        assert_eq!(
            IncludeMode::GreaterPositive.flagged(&rows, FeatureMode::CurrentToken),
            Some(vec![0, 1, 2, 3])
        );
        assert_eq!(IncludeMode::PositiveAndNegative.flagged(&rows, FeatureMode::CurrentToken), None);
    }

    #[test]
    fn test_scale_table() {
        let rows = vec![row(0, additive()), row(1, additive())];
        let scaled = scale_table(&rows, &[2.0, 0.0]).unwrap();
        assert_eq!(scaled[0].values.get(Condition::Yyy), 5.0);
        assert_eq!(scaled[1].values.get(Condition::Yyy), 10.0);
        assert!(scale_table(&rows, &[1.0]).is_err());
    }

    #[test]
    fn test_iqr_outliers() {
        let mut values: Vec<f64> = (0..20).map(f64::from).collect();
        values.push(100.0);
        let found = iqr_outliers(&values, 0.10, 0.90).unwrap();
        assert!(found.q1 < found.q3);
        assert!((found.iqr - (found.q3 - found.q1)).abs() < 1e-12);
        assert_eq!(found.outliers, vec![100.0]);
        assert!(iqr_outliers(&[], 0.1, 0.9).is_err());
    }

    fn tiny_setup() -> (crate::model::HaystackModel, ContextHooks, ConditionPrompts) {
        let model = tiny_model();
        let hooks = ContextHooks::from_values(ContextNeuron::new(0, vec![1]), vec![3.0], vec![0.0]).unwrap();
        let common = vec![5, 7, 8, 9];
        let rows = generate_random_prompts(&[13, 11, 12], &common, model.bos_token_id(), 3, 4, 42).unwrap();
        let prompts = ConditionPrompts::new(&rows, &common, 42, model.device()).unwrap();
        (model, hooks, prompts)
    }

    #[test]
    fn test_condition_prompts_replace_tokens() {
        let (_model, _hooks, prompts) = tiny_setup();
        let original: Vec<Vec<u32>> = prompts.tokens(Condition::Yyy).to_vec2().unwrap();
        let current: Vec<Vec<u32>> = prompts.tokens(Condition::Ynn).to_vec2().unwrap();
        for (o, c) in original.iter().zip(&current) {
            assert_eq!(o.len(), 8);
            assert_eq!(o[..6], c[..6]);
            assert_eq!(o[7], c[7]);
            assert_ne!(c[6], 11);
        }
        let previous: Vec<Vec<u32>> = prompts.tokens(Condition::Nyy).to_vec2().unwrap();
        assert!(previous.iter().all(|r| r[5] != 13 && r[6] == 11));
    }

    #[test]
    fn test_compute_and_conditions_on_tiny_model() {
        let (model, hooks, prompts) = tiny_setup();
        for kind in [ValueKind::Loss, ValueKind::Logits] {
            let record = compute_and_conditions(&model, &hooks, "ein Haus house", &prompts, kind).unwrap();
            assert_eq!(record.values.len(), 8);
            assert!(record.values.values().all(|v| v.is_finite()));
            assert!(record.scores.two_features.is_finite());
        }
        let json = serde_json::to_value(
            compute_and_conditions(&model, &hooks, "house", &prompts, ValueKind::Loss).unwrap(),
        )
        .unwrap();
        assert!(json.get("Fix Context").is_some());
        assert!(json["Values"].get("NNY").is_some());
    }

    #[test]
    fn test_activation_table_and_sweep() {
        let (model, hooks, prompts) = tiny_setup();
        let rows = activation_table(&model, &hooks, &prompts, &HookPoint::MlpPost(1)).unwrap();
        assert_eq!(rows.len(), 32);
        assert_eq!(rows[7].neuron, 7);

        let increases = ablation_loss_increases(&model, prompts.original(), &hooks, 1, &rows).unwrap();
        assert_eq!(increases.len(), 32);

        let sweep = ablation_sweep(&model, prompts.original(), &hooks, 1, &rows, &[2]).unwrap();
        assert_eq!(sweep.len(), 5);
        assert!(sweep["Positive and Negative"].get("All").is_none());
        let all_positive = &sweep["All Positive"];
        assert!(all_positive["All"].contains_key("Original"));
        assert_eq!(all_positive["2"].len(), 2 + FeatureMode::ALL.len());
    }
}
