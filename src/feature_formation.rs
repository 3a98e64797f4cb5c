//! Feature formation across training checkpoints
//!
//! For every Pythia checkpoint and layer, each MLP neuron is probed for
//! German text, whole layers are zero-ablated on German prompts, and the
//! per-language loss is recorded. Results are written after every layer so
//! an interrupted run resumes where it stopped.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{column, column_means};
use crate::checkpoints::{num_checkpoints, preload_checkpoints, CheckpointOutOfRange};
use crate::corpus::LanguageData;
use crate::hooks::{HookPoint, HookSpec, Intervention};
use crate::model::HaystackModel;
use crate::probe::train_probe;

/// Configuration for a feature-formation run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFormationConfig {
    /// Model ID on the hub (must publish training checkpoints)
    pub model: String,
    pub output_dir: PathBuf,
    /// Directory with `english_europarl.json` and `europarl/*.txt`
    pub data_dir: PathBuf,
    /// Stop after this many checkpoints
    pub max_checkpoints: Option<usize>,
    pub force_cpu: bool,
    pub seed: u64,
    pub num_probe_prompts: usize,
    /// Cap on activation rows per class
    pub max_probe_rows: usize,
    pub num_ablation_prompts: usize,
    pub num_non_german: usize,
    pub probe_max_iterations: u64,
}

impl Default for FeatureFormationConfig {
    fn default() -> Self {
        Self {
            model: "EleutherAI/pythia-70m".to_string(),
            output_dir: PathBuf::from("feature_formation"),
            data_dir: PathBuf::from("data"),
            max_checkpoints: None,
            force_cpu: false,
            seed: 42,
            num_probe_prompts: 30,
            max_probe_rows: 10_000,
            num_ablation_prompts: 100,
            num_non_german: 200,
            probe_max_iterations: 2000,
        }
    }
}

impl FeatureFormationConfig {
    /// `{output_dir}/{model}_checkpoint_features.json`
    pub fn progress_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}_checkpoint_features.json", self.model))
    }
}

/// German probe score of one neuron at one checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuronProbeRecord {
    #[serde(rename = "Label")]
    pub label: String,
    #[serde(rename = "NeuronLabel")]
    pub neuron_label: String,
    #[serde(rename = "Neuron")]
    pub neuron: usize,
    #[serde(rename = "F1")]
    pub f1: f64,
    #[serde(rename = "MCC")]
    pub mcc: f64,
    #[serde(rename = "MeanGermanActivation")]
    pub mean_german_activation: f32,
    #[serde(rename = "MeanNonGermanActivation")]
    pub mean_non_german_activation: f32,
    #[serde(rename = "Checkpoint")]
    pub checkpoint: usize,
    #[serde(rename = "Layer")]
    pub layer: usize,
}

/// Loss change from zeroing a whole MLP layer on one prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerAblationRecord {
    #[serde(rename = "Checkpoint")]
    pub checkpoint: usize,
    #[serde(rename = "Layer")]
    pub layer: usize,
    #[serde(rename = "LossDifference")]
    pub loss_difference: f32,
    #[serde(rename = "OriginalLoss")]
    pub original_loss: f32,
    #[serde(rename = "AblatedLoss")]
    pub ablated_loss: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageLossRecord {
    #[serde(rename = "Checkpoint")]
    pub checkpoint: usize,
    #[serde(rename = "Language")]
    pub language: String,
    #[serde(rename = "Loss")]
    pub loss: f32,
}

/// Everything computed so far
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureFormationProgress {
    pub probe: Vec<NeuronProbeRecord>,
    pub layer_ablation: Vec<LayerAblationRecord>,
    pub lang_loss: Vec<LanguageLossRecord>,
    /// Finished (checkpoint, layer) pairs
    pub completed: BTreeSet<(usize, usize)>,
}

impl FeatureFormationProgress {
    /// Load saved progress, or start fresh if the file does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse progress file {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn is_done(&self, checkpoint: usize, layer: usize) -> bool {
        self.completed.contains(&(checkpoint, layer))
    }

    pub fn has_language_losses(&self, checkpoint: usize) -> bool {
        self.lang_loss.iter().any(|r| r.checkpoint == checkpoint)
    }
}

/// Probe every neuron of `layer` for German vs non-German text
pub fn layer_probe_performance<S: AsRef<str>, T: AsRef<str>>(
    model: &HaystackModel,
    checkpoint: usize,
    layer: usize,
    german: &[S],
    non_german: &[T],
    cfg: &FeatureFormationConfig,
) -> Result<Vec<NeuronProbeRecord>> {
    let acts = |prompts: Vec<&str>| -> Result<candle_core::Tensor> {
        let n = prompts.len().min(cfg.num_probe_prompts);
        let all = model.mlp_activations(&prompts[..n], layer, 10..400)?;
        let rows = all.dim(0)?.min(cfg.max_probe_rows);
        Ok(all.narrow(0, 0, rows)?)
    };
    let german_acts = acts(german.iter().map(AsRef::as_ref).collect())?;
    let non_german_acts = acts(non_german.iter().map(AsRef::as_ref).collect())?;

    let mean_german = column_means(&german_acts)?;
    let mean_non_german = column_means(&non_german_acts)?;

    let single = |values: Vec<f32>| values.into_iter().map(|v| vec![v]).collect::<Vec<_>>();
    (0..model.d_mlp())
        .map(|neuron| {
            let (f1, mcc) = train_probe(
                &single(column(&german_acts, neuron)?),
                &single(column(&non_german_acts, neuron)?),
                cfg.probe_max_iterations,
                cfg.seed,
            )?;
            Ok(NeuronProbeRecord {
                label: format!("C{checkpoint}L{layer}N{neuron}"),
                neuron_label: format!("L{layer}N{neuron}"),
                neuron,
                f1,
                mcc,
                mean_german_activation: mean_german[neuron],
                mean_non_german_activation: mean_non_german[neuron],
                checkpoint,
                layer,
            })
        })
        .collect()
}

/// Loss with and without `layer`'s MLP output zeroed, per German prompt
pub fn layer_ablation_loss<S: AsRef<str>>(
    model: &HaystackModel,
    german: &[S],
    checkpoint: usize,
    layer: usize,
    num_prompts: usize,
) -> Result<Vec<LayerAblationRecord>> {
    let ablate = HookSpec::new().with_intervention(HookPoint::MlpPost(layer), Intervention::Zero);
    german
        .iter()
        .take(num_prompts)
        .map(|prompt| {
            let tokens = model.to_tokens(prompt.as_ref())?;
            let original_loss = model.loss(&tokens, &HookSpec::new())?;
            let ablated_loss = model.loss(&tokens, &ablate)?;
            Ok(LayerAblationRecord {
                checkpoint,
                layer,
                loss_difference: ablated_loss - original_loss,
                original_loss,
                ablated_loss,
            })
        })
        .collect()
}

/// Mean prompt loss per language
pub fn language_losses(
    model: &HaystackModel,
    checkpoint: usize,
    languages: &LanguageData,
) -> Result<Vec<LanguageLossRecord>> {
    let mut records = Vec::with_capacity(languages.len());
    for (language, prompts) in languages.languages() {
        if prompts.is_empty() {
            warn!("No prompts for {language}, skipping");
            continue;
        }
        let mut total = 0.0;
        for prompt in prompts {
            total += model.prompt_loss(prompt, &HookSpec::new())?;
        }
        records.push(LanguageLossRecord {
            checkpoint,
            language: language.to_string(),
            loss: total / prompts.len() as f32,
        });
    }
    Ok(records)
}

/// Runner for the checkpoint sweep
pub struct FeatureFormation {
    config: FeatureFormationConfig,
    languages: LanguageData,
    non_german: Vec<String>,
}

impl FeatureFormation {
    pub fn new(config: FeatureFormationConfig, languages: LanguageData) -> Self {
        let non_german = languages.non_german(config.num_non_german, config.seed);
        Self {
            config,
            languages,
            non_german,
        }
    }

    pub fn config(&self) -> &FeatureFormationConfig {
        &self.config
    }

    /// Analyse every unfinished layer of one loaded checkpoint, saving after each
    pub fn run_checkpoint(
        &self,
        model: &HaystackModel,
        checkpoint: usize,
        progress: &mut FeatureFormationProgress,
    ) -> Result<()> {
        let german = self.languages.german()?;
        let path = self.config.progress_path();

        if !progress.has_language_losses(checkpoint) {
            progress
                .lang_loss
                .extend(language_losses(model, checkpoint, &self.languages)?);
        }

        for layer in 0..model.n_layers() {
            if progress.is_done(checkpoint, layer) {
                continue;
            }
            info!("Checkpoint {checkpoint}, layer {layer}");
            let probes = layer_probe_performance(model, checkpoint, layer, german, &self.non_german, &self.config)?;
            if let Some(best) = probes.iter().max_by(|a, b| a.f1.total_cmp(&b.f1)) {
                info!("Best German neuron: {} (F1 {:.3}, MCC {:.3})", best.label, best.f1, best.mcc);
            }
            progress.probe.extend(probes);
            progress.layer_ablation.extend(layer_ablation_loss(
                model,
                german,
                checkpoint,
                layer,
                self.config.num_ablation_prompts,
            )?);
            progress.completed.insert((checkpoint, layer));
            progress.save(&path)?;
        }
        Ok(())
    }

    /// Iterate over checkpoints until the schedule (or `max_checkpoints`) runs out
    pub fn run(&self) -> Result<FeatureFormationProgress> {
        let path = self.config.progress_path();
        let mut progress = FeatureFormationProgress::load(&path)?;
        if !progress.completed.is_empty() {
            info!(
                "Resuming from {} with {} finished layers",
                path.display(),
                progress.completed.len()
            );
        }

        let total = num_checkpoints(&self.config.model, self.config.max_checkpoints)?;
        let force_cpu = self.config.force_cpu.then_some(true);
        for checkpoint in 0..total {
            let model = match HaystackModel::from_checkpoint(&self.config.model, Some(checkpoint), force_cpu) {
                Ok(model) => model,
                Err(e) if e.downcast_ref::<CheckpointOutOfRange>().is_some() => {
                    info!("{e}");
                    break;
                }
                Err(e) => return Err(e),
            };
            let done = (0..model.n_layers()).all(|l| progress.is_done(checkpoint, l));
            if done {
                continue;
            }
            self.run_checkpoint(&model, checkpoint, &mut progress)?;
        }
        info!("Feature formation results in {}", path.display());
        Ok(progress)
    }
}

/// Preload checkpoints, load language data and run the sweep
pub fn run(config: FeatureFormationConfig) -> Result<FeatureFormationProgress> {
    info!("Config: {:?}", config);
    let available = preload_checkpoints(&config.model, config.max_checkpoints)?;
    info!("{available} checkpoints available");
    let languages = LanguageData::load(&config.data_dir)?;
    FeatureFormation::new(config, languages).run()
}
