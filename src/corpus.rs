//! Language corpora and prompt construction
//!
//! Europarl-style data lives under a data directory:
//! - `english_europarl.json`: JSON array of English paragraphs
//! - `europarl/{lang}_*.txt`: one paragraph per line
//!
//! Prompts for the n-gram analyses are token tensors: BOS, random common
//! tokens, then the n-gram's own tokens.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use safetensors::tensor::SafeTensors;
use tracing::info;

use crate::model::HaystackModel;

/// Language code of the German corpus
pub const GERMAN: &str = "de";

/// Paragraphs kept per language
pub const LANGUAGE_SAMPLES: usize = 200;

/// Load a JSON array of strings
pub fn load_json_data(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load one prompt per non-empty line
pub fn load_txt_data(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Paragraphs keyed by language code
#[derive(Debug, Clone, Default)]
pub struct LanguageData {
    languages: BTreeMap<String, Vec<String>>,
}

impl LanguageData {
    /// Load English from `english_europarl.json` and every `europarl/{lang}_*.txt`
    pub fn load(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let mut languages = BTreeMap::new();

        let mut english = load_json_data(data_dir.join("english_europarl.json"))?;
        english.truncate(LANGUAGE_SAMPLES);
        languages.insert("en".to_string(), english);

        let europarl_dir = data_dir.join("europarl");
        let entries = std::fs::read_dir(&europarl_dir)
            .with_context(|| format!("Failed to list {}", europarl_dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let lang = file_name.split('_').next().unwrap_or(file_name).to_string();
            languages.insert(lang, load_txt_data(&path)?);
        }

        for (lang, prompts) in &languages {
            info!("{} {}", lang, prompts.len());
        }
        Ok(Self { languages })
    }

    pub fn from_map(languages: BTreeMap<String, Vec<String>>) -> Self {
        Self { languages }
    }

    pub fn get(&self, lang: &str) -> Option<&[String]> {
        self.languages.get(lang).map(Vec::as_slice)
    }

    pub fn german(&self) -> Result<&[String]> {
        self.get(GERMAN)
            .ok_or_else(|| anyhow::anyhow!("No German data loaded"))
    }

    /// Every language except German, shuffled and truncated to `n`
    pub fn non_german(&self, n: usize, seed: u64) -> Vec<String> {
        let mut data: Vec<String> = self
            .languages
            .iter()
            .filter(|(lang, _)| lang.as_str() != GERMAN)
            .flat_map(|(_, prompts)| prompts.iter().cloned())
            .collect();
        let mut rng = StdRng::seed_from_u64(seed);
        data.shuffle(&mut rng);
        data.truncate(n);
        data
    }

    pub fn languages(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.languages
            .iter()
            .map(|(lang, prompts)| (lang.as_str(), prompts.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}

/// Split concatenated token streams into shuffled rows of `seq_len + 1`
///
/// The stream is cut to a multiple of `seq_len`, then every row gets `bos`
/// prepended.
pub fn chunk_tokens(streams: &[Vec<u32>], seq_len: usize, bos: u32, seed: u64) -> Vec<Vec<u32>> {
    if seq_len == 0 {
        return Vec::new();
    }
    let all: Vec<u32> = streams.iter().flatten().copied().collect();
    let usable = all.len() - all.len() % seq_len;

    let mut rows: Vec<Vec<u32>> = all[..usable]
        .chunks(seq_len)
        .map(|chunk| {
            let mut row = Vec::with_capacity(seq_len + 1);
            row.push(bos);
            row.extend_from_slice(chunk);
            row
        })
        .collect();

    let mut rng = StdRng::seed_from_u64(seed);
    rows.shuffle(&mut rng);
    rows
}

/// Tokenise prompts (each with BOS) into a `[rows, seq_len + 1]` tensor
pub fn batch_prompts<S: AsRef<str>>(
    model: &HaystackModel,
    prompts: &[S],
    seq_len: usize,
    seed: u64,
) -> Result<Tensor> {
    let streams = prompts
        .iter()
        .map(|p| model.to_token_ids(p.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    let rows = chunk_tokens(&streams, seq_len, model.bos_token_id(), seed);
    anyhow::ensure!(!rows.is_empty(), "Not enough tokens for one row of {seq_len}");
    info!("Batched {} prompts into {} rows", prompts.len(), rows.len());
    rows_to_tensor(&rows, &Device::Cpu)
}

/// Stack equal-length token rows into a `[rows, len]` tensor
pub fn rows_to_tensor(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let width = rows.first().map_or(0, Vec::len);
    anyhow::ensure!(
        rows.iter().all(|r| r.len() == width),
        "Token rows have different lengths"
    );
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

/// Save a batched token tensor under the key `tokens`
pub fn save_token_batches(tokens: &Tensor, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tensors = HashMap::from([("tokens".to_string(), tokens.to_dtype(DType::U32)?)]);
    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Load a batched token tensor saved by [`save_token_batches`]
pub fn load_token_batches(path: impl AsRef<Path>, device: &Device) -> Result<Tensor> {
    let path = path.as_ref();
    let data =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let st = SafeTensors::deserialize(&data)
        .with_context(|| format!("Failed to deserialize {}", path.display()))?;
    let view = st
        .tensor("tokens")
        .with_context(|| format!("No `tokens` tensor in {}", path.display()))?;
    token_tensor_from_view(&view, device)
}

fn token_tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::U32 => DType::U32,
        safetensors::Dtype::I64 => DType::I64,
        safetensors::Dtype::U8 => DType::U8,
        other => anyhow::bail!("Unsupported token dtype: {other:?}"),
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?;
    Ok(tensor.to_dtype(DType::U32)?)
}

/// Tokens excluded from frequency counts and random prompts
///
/// Special tokens and tokens that decode to empty or non-printable text.
pub fn ignore_tokens(model: &HaystackModel) -> Vec<u32> {
    let specials: Vec<u32> = model
        .tokenizer()
        .get_added_tokens_decoder()
        .iter()
        .filter(|(_, t)| t.special)
        .map(|(&id, _)| id)
        .collect();

    let mut ignore: Vec<u32> = (0..model.vocab_size() as u32)
        .filter(|&id| {
            if specials.contains(&id) {
                return true;
            }
            match model.tokenizer().id_to_token(id) {
                None => true,
                Some(_) => {
                    let decoded = model.decode_token(id);
                    decoded.trim().is_empty()
                        || decoded.chars().any(|c| c.is_control() || c == '\u{FFFD}')
                }
            }
        })
        .collect();
    ignore.sort_unstable();
    ignore
}

/// The `k` most frequent tokens in `data`, skipping `ignore`
pub fn common_tokens<S: AsRef<str>>(
    model: &HaystackModel,
    data: &[S],
    ignore: &[u32],
    k: usize,
) -> Result<Vec<u32>> {
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for prompt in data {
        for id in model.to_token_ids(prompt.as_ref())? {
            *counts.entry(id).or_insert(0) += 1;
        }
    }
    Ok(top_k_by_count(counts, ignore, k))
}

fn top_k_by_count(counts: HashMap<u32, usize>, ignore: &[u32], k: usize) -> Vec<u32> {
    let mut counted: Vec<(u32, usize)> = counts
        .into_iter()
        .filter(|(id, _)| !ignore.contains(id))
        .collect();
    // Ties broken by id so the result is deterministic
    counted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    counted.into_iter().take(k).map(|(id, _)| id).collect()
}

/// `n` prompts of BOS + `length` random common tokens + `end_tokens`
pub fn generate_random_prompts(
    end_tokens: &[u32],
    common: &[u32],
    bos: u32,
    n: usize,
    length: usize,
    seed: u64,
) -> Result<Vec<Vec<u32>>> {
    anyhow::ensure!(!common.is_empty(), "No common tokens to sample from");
    let mut rng = StdRng::seed_from_u64(seed);
    Ok((0..n)
        .map(|_| {
            let mut row = Vec::with_capacity(1 + length + end_tokens.len());
            row.push(bos);
            row.extend((0..length).map(|_| common[rng.gen_range(0..common.len())]));
            row.extend_from_slice(end_tokens);
            row
        })
        .collect())
}

/// Which of the previous (−3) and current (−2) tokens to replace
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AblationMode {
    /// Previous token replaced
    Nyy,
    /// Current token replaced
    Yny,
    /// Both replaced
    Nny,
}

impl AblationMode {
    fn replaces(self) -> (bool, bool) {
        match self {
            Self::Nyy => (true, false),
            Self::Yny => (false, true),
            Self::Nny => (true, true),
        }
    }
}

impl std::str::FromStr for AblationMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NYY" => Ok(Self::Nyy),
            "YNY" => Ok(Self::Yny),
            "NNY" => Ok(Self::Nny),
            other => anyhow::bail!("Unknown ablation mode `{other}`"),
        }
    }
}

/// Replace the previous and/or current token of each prompt with random common tokens
pub fn create_ablation_prompts(
    prompts: &[Vec<u32>],
    mode: AblationMode,
    common: &[u32],
    seed: u64,
) -> Result<Vec<Vec<u32>>> {
    anyhow::ensure!(!common.is_empty(), "No common tokens to sample from");
    let (previous, current) = mode.replaces();
    let mut rng = StdRng::seed_from_u64(seed);

    prompts
        .iter()
        .map(|prompt| {
            let len = prompt.len();
            anyhow::ensure!(len >= 3, "Prompt too short for ablation ({len} tokens)");
            let mut row = prompt.clone();
            if previous {
                row[len - 3] = common[rng.gen_range(0..common.len())];
            }
            if current {
                row[len - 2] = common[rng.gen_range(0..common.len())];
            }
            Ok(row)
        })
        .collect()
}
