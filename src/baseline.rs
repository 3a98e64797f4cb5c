//! Single-neuron probing baselines
//!
//! Every MLP neuron is used on its own as a one-feature logistic-regression
//! probe for two labels: "the next token starts a new word" and "the text is
//! German". The scores show how special a context neuron is compared with
//! the rest of the model.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{IndexOp, Tensor};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::corpus::load_json_data;
use crate::hooks::{HookPoint, HookSpec};
use crate::model::HaystackModel;
use crate::probe::{ProbeTrainer, StandardScaler};

/// Shuffle seed for the probe datasets
pub const SHUFFLE_SEED: u64 = 42;

/// Whether a vocabulary entry begins a new word
pub fn starts_new_word(token: &str) -> bool {
    token.starts_with(' ') || token.starts_with('Ġ') || token.starts_with('▁')
}

/// For every position but the last, whether the following token starts a new word
pub fn new_word_labels(model: &HaystackModel, tokens: &[u32]) -> Vec<bool> {
    tokens
        .iter()
        .skip(1)
        .map(|&id| {
            model
                .tokenizer()
                .id_to_token(id)
                .is_some_and(|t| starts_new_word(&t))
        })
        .collect()
}

fn select_rows(acts: &Tensor, rows: &[u32]) -> Result<Option<Tensor>> {
    if rows.is_empty() {
        return Ok(None);
    }
    let index = Tensor::new(rows, acts.device())?;
    Ok(Some(acts.index_select(&index, 0)?))
}

fn cat_or_empty(chunks: &[Tensor], d: usize, device: &candle_core::Device) -> Result<Tensor> {
    if chunks.is_empty() {
        Ok(Tensor::zeros((0, d), candle_core::DType::F32, device)?)
    } else {
        Ok(Tensor::cat(chunks, 0)?)
    }
}

fn n_rows(chunks: &[Tensor]) -> usize {
    chunks.iter().filter_map(|c| c.dim(0).ok()).sum()
}

/// `[rows, d_mlp]` activations before new-word and continuation tokens
///
/// Stops once both classes have `num_examples` rows.
pub fn next_is_space_activations<S: AsRef<str>>(
    model: &HaystackModel,
    prompts: &[S],
    layer: usize,
    num_examples: usize,
) -> Result<(Tensor, Tensor)> {
    let hook = HookPoint::MlpPost(layer);
    let spec = HookSpec::new().with_capture(hook.clone());
    let (mut space, mut non_space) = (Vec::new(), Vec::new());

    for prompt in prompts {
        let ids = model.to_token_ids(prompt.as_ref())?;
        if ids.len() < 2 {
            continue;
        }
        let labels = new_word_labels(model, &ids);
        let cache = model.run_with_hooks(&model.tokens_tensor(&ids)?, &spec)?;
        let acts = cache.require_f32(&hook)?.i((0, ..ids.len() - 1))?;

        let (pos, neg): (Vec<u32>, Vec<u32>) = (0..labels.len() as u32).partition(|&i| labels[i as usize]);
        space.extend(select_rows(&acts, &pos)?);
        non_space.extend(select_rows(&acts, &neg)?);

        if n_rows(&space) >= num_examples && n_rows(&non_space) >= num_examples {
            break;
        }
    }
    debug!("Layer {layer}: {} space, {} non-space rows", n_rows(&space), n_rows(&non_space));
    Ok((
        cat_or_empty(&space, model.d_mlp(), model.device())?,
        cat_or_empty(&non_space, model.d_mlp(), model.device())?,
    ))
}

fn window_activations<S: AsRef<str>>(
    model: &HaystackModel,
    prompts: &[S],
    hook: &HookPoint,
    start: usize,
    num_examples: usize,
) -> Result<Tensor> {
    let spec = HookSpec::new().with_capture(hook.clone());
    let mut chunks = Vec::new();
    for prompt in prompts {
        let tokens = model.to_tokens(prompt.as_ref())?;
        if tokens.dim(1)? <= start {
            continue;
        }
        let cache = model.run_with_hooks(&tokens, &spec)?;
        chunks.push(cache.require_f32(hook)?.i((0, start..))?);
        if n_rows(&chunks) >= num_examples {
            break;
        }
    }
    cat_or_empty(&chunks, model.d_mlp(), model.device())
}

/// `[rows, d_mlp]` activations on German and English text from position 10
pub fn is_german_activations<S: AsRef<str>, T: AsRef<str>>(
    model: &HaystackModel,
    german: &[S],
    english: &[T],
    layer: usize,
    num_examples: usize,
) -> Result<(Tensor, Tensor)> {
    let hook = HookPoint::MlpPost(layer);
    Ok((
        window_activations(model, german, &hook, 10, num_examples)?,
        window_activations(model, english, &hook, 10, num_examples)?,
    ))
}

/// Probe score of one neuron
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuronProbeScore {
    pub name: String,
    pub f1: f64,
    pub mcc: f64,
    pub pos_act: f64,
    pub neg_act: f64,
    pub layer: usize,
    pub neuron: usize,
}

impl NeuronProbeScore {
    /// Columns suffixed with ` ({column_name})`, except the keys
    pub fn to_record(&self, column_name: &str) -> serde_json::Map<String, Value> {
        let suffix = if column_name.is_empty() {
            String::new()
        } else {
            format!(" ({column_name})")
        };
        let mut record = serde_json::Map::new();
        record.insert("name".into(), self.name.clone().into());
        record.insert(format!("f1{suffix}"), self.f1.into());
        record.insert(format!("mcc{suffix}"), self.mcc.into());
        record.insert(format!("pos act{suffix}"), self.pos_act.into());
        record.insert(format!("neg act{suffix}"), self.neg_act.into());
        record.insert("layer".into(), self.layer.into());
        record.insert("neuron".into(), self.neuron.into());
        record
    }
}

/// Fit a one-feature probe per neuron on `train_size` shuffled rows, score on the rest
///
/// Each class contributes at most `(train_size + test_size) / 2` rows.
pub fn neuron_wise_f1(
    pos: &Tensor,
    neg: &Tensor,
    layer: usize,
    train_size: usize,
    test_size: usize,
) -> Result<Vec<NeuronProbeScore>> {
    let per_class = (train_size + test_size) / 2;
    let take = |t: &Tensor| -> Result<Vec<Vec<f32>>> {
        let n = t.dim(0)?.min(per_class);
        Ok(t.narrow(0, 0, n)?.to_vec2()?)
    };
    let pos_rows = take(pos)?;
    let neg_rows = take(neg)?;
    anyhow::ensure!(
        !pos_rows.is_empty() && !neg_rows.is_empty(),
        "Layer {layer}: need activations for both classes"
    );
    let d = pos.dim(1)?;
    let n = pos_rows.len() + neg_rows.len();

    let y: Array1<usize> = std::iter::repeat(1)
        .take(pos_rows.len())
        .chain(std::iter::repeat(0).take(neg_rows.len()))
        .collect();
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(SHUFFLE_SEED));
    let (train_idx, test_idx) = order.split_at(train_size.min(n));
    anyhow::ensure!(!test_idx.is_empty(), "Layer {layer}: no rows left for testing");
    let y_train = y.select(Axis(0), train_idx);
    let y_test = y.select(Axis(0), test_idx);

    let trainer = ProbeTrainer::new();
    (0..d)
        .map(|neuron| {
            let values: Vec<f64> = pos_rows
                .iter()
                .chain(&neg_rows)
                .map(|row| f64::from(row[neuron]))
                .collect();
            let x = StandardScaler::fit_transform(&Array2::from_shape_vec((n, 1), values)?)?;
            let results = trainer.fit_and_score(
                x.select(Axis(0), train_idx),
                y_train.clone(),
                &x.select(Axis(0), test_idx),
                &y_test,
            )?;
            let mean = |rows: &[Vec<f32>]| rows.iter().map(|r| f64::from(r[neuron])).sum::<f64>() / rows.len() as f64;
            Ok(NeuronProbeScore {
                name: format!("L{layer}N{neuron}"),
                f1: results.f1(),
                mcc: results.mcc(),
                pos_act: mean(&pos_rows),
                neg_act: mean(&neg_rows),
                layer,
                neuron,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    pub model: String,
    pub layers: Vec<usize>,
    pub train_size: usize,
    pub test_size: usize,
    pub num_prompts: usize,
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            model: "EleutherAI/pythia-160m".to_string(),
            layers: (0..9).collect(),
            train_size: 10_000,
            test_size: 10_000,
            num_prompts: 200,
            data_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("data/pythia_160m"),
        }
    }
}

/// Both baselines for every layer; writes `space_probing_baseline.json` and
/// `german_probing_baseline.json`
pub fn run(model: &HaystackModel, cfg: &BaselineConfig) -> Result<(Vec<NeuronProbeScore>, Vec<NeuronProbeScore>)> {
    let mut german = load_json_data(cfg.data_dir.join("german_europarl.json"))?;
    german.truncate(cfg.num_prompts);
    let mut english = load_json_data(cfg.data_dir.join("english_europarl.json"))?;
    english.truncate(cfg.num_prompts);
    let num_examples = (cfg.train_size + cfg.test_size) / 2;

    let (mut space_scores, mut german_scores) = (Vec::new(), Vec::new());
    for &layer in &cfg.layers {
        let (space, non_space) = next_is_space_activations(model, &german, layer, num_examples)?;
        space_scores.extend(neuron_wise_f1(&space, &non_space, layer, cfg.train_size, cfg.test_size)?);

        let (de, en) = is_german_activations(model, &german, &english, layer, num_examples)?;
        german_scores.extend(neuron_wise_f1(&de, &en, layer, cfg.train_size, cfg.test_size)?);
        info!("Layer {layer} probing baselines done");
    }

    for (scores, column, file) in [
        (&space_scores, "next_is_space", "space_probing_baseline.json"),
        (&german_scores, "is_german", "german_probing_baseline.json"),
    ] {
        let best = scores.iter().max_by(|a, b| a.f1.total_cmp(&b.f1));
        if let Some(best) = best {
            info!("Best {column} neuron: {} (F1 {:.3})", best.name, best.f1);
        }
        std::fs::create_dir_all(&cfg.output_dir)
            .with_context(|| format!("Failed to create {}", cfg.output_dir.display()))?;
        let records: Vec<_> = scores.iter().map(|s| s.to_record(column)).collect();
        let path = cfg.output_dir.join(file);
        std::fs::write(&path, serde_json::to_string_pretty(&records)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok((space_scores, german_scores))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_utils::tiny_model;
    use candle_core::Device;

    #[test]
    fn test_starts_new_word() {
        assert!(starts_new_word("Ġthe"));
        assert!(starts_new_word(" the"));
        assert!(!starts_new_word("the"));
        assert!(!starts_new_word(""));
    }

    #[test]
    fn test_new_word_labels_length() {
        let model = tiny_model();
        let ids = model.to_token_ids("der die das").unwrap();
        let labels = new_word_labels(&model, &ids);
        assert_eq!(labels.len(), ids.len() - 1);
        // The word-level test vocabulary has no space markers
        assert!(labels.iter().all(|&l| !l));
    }

    #[test]
    fn test_neuron_wise_f1_separates_one_neuron() {
        let device = Device::Cpu;
        // Neuron 0 separates the classes, neuron 1 is noise
        let pos: Vec<f32> = (0..40).flat_map(|i| [3.0 + (i % 3) as f32 * 0.1, (i % 2) as f32]).collect();
        let neg: Vec<f32> = (0..40).flat_map(|i| [-3.0 - (i % 3) as f32 * 0.1, (i % 2) as f32]).collect();
        let pos = Tensor::from_vec(pos, (40, 2), &device).unwrap();
        let neg = Tensor::from_vec(neg, (40, 2), &device).unwrap();

        let scores = neuron_wise_f1(&pos, &neg, 4, 40, 40).unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].name, "L4N0");
        assert!(scores[0].f1 > 0.95);
        assert!(scores[1].f1 < scores[0].f1);
        assert!((scores[0].pos_act - 3.1).abs() < 0.05);

        let record = scores[0].to_record("is_german");
        assert!(record.contains_key("f1 (is_german)"));
        assert!(record.contains_key("neuron"));
    }

    #[test]
    fn test_neuron_wise_f1_needs_both_classes() {
        let device = Device::Cpu;
        let pos = Tensor::ones((4, 2), candle_core::DType::F32, &device).unwrap();
        let neg = Tensor::zeros((0, 2), candle_core::DType::F32, &device).unwrap();
        assert!(neuron_wise_f1(&pos, &neg, 0, 2, 2).is_err());
        assert!(neuron_wise_f1(&pos, &pos, 0, 100, 0).is_err());
    }

    #[test]
    fn test_activation_collection() {
        let model = tiny_model();
        let prompts = ["der die das ist", "das Haus ist ein Haus und der die das ist ein Haus"];
        let (space, non_space) = next_is_space_activations(&model, &prompts, 1, 1000).unwrap();
        assert_eq!(space.dim(0).unwrap(), 0);
        // 4 + 12 positions before the last token
        assert_eq!(non_space.dims(), &[4 + 12, 32]);

        let english = ["the house is a house and the house is a house of the house"];
        let (de, en) = is_german_activations(&model, &prompts, &english, 0, 1000).unwrap();
        // 13 tokens -> 3 rows, 15 tokens -> 5 rows
        assert_eq!(de.dims(), &[3, 32]);
        assert_eq!(en.dims(), &[5, 32]);
    }
}
