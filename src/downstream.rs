//! Downstream readers of a bimodal context neuron
//!
//! In pythia-160m, L8N2994 fires with two distinct peaks on German text.
//! Positions are labelled by the peak the neuron falls in on the unablated
//! run; each later MLP neuron is then scored by how well its firing predicts
//! each peak. Snapping the context neuron to one peak's value shows which
//! readers depend on the distinction.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{IndexOp, Tensor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::corpus::load_json_data;
use crate::hooks::{HookPoint, HookSpec, Intervention};
use crate::model::HaystackModel;

const EPS: f64 = 1e-10;

/// Open interval of activations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakWindow {
    pub low: f32,
    pub high: f32,
}

impl PeakWindow {
    pub fn contains(&self, act: f32) -> bool {
        act > self.low && act < self.high
    }
}

/// What counts as a false positive for a peak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MetricMode {
    /// Firing anywhere outside the peak
    All,
    /// Firing inside the other peak
    Peaks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownstreamConfig {
    pub model: String,
    pub layer: usize,
    pub neuron: usize,
    pub peak_1: PeakWindow,
    pub peak_2: PeakWindow,
    /// Activation the context neuron is snapped to for each peak
    pub peak_1_value: f32,
    pub peak_2_value: f32,
    /// Positions before this index are ignored
    pub start_index: usize,
    pub downstream_layers: Vec<usize>,
    pub num_prompts: usize,
    pub mode: MetricMode,
    pub data_path: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            model: "EleutherAI/pythia-160m".to_string(),
            layer: 8,
            neuron: 2994,
            peak_1: PeakWindow { low: 0.8, high: 4.1 },
            peak_2: PeakWindow { low: 4.8, high: 10.0 },
            peak_1_value: 2.5,
            peak_2_value: 6.5,
            start_index: 5,
            downstream_layers: vec![9, 10, 11],
            num_prompts: 100,
            mode: MetricMode::Peaks,
            data_path: PathBuf::from("data/german_europarl.json"),
            output_dir: PathBuf::from("data/downstream"),
        }
    }
}

impl DownstreamConfig {
    pub fn hook_point(&self) -> HookPoint {
        HookPoint::MlpPost(self.layer)
    }

    /// Fix the context neuron to `value` at every position
    pub fn snap_hooks(&self, value: f32) -> HookSpec {
        HookSpec::new().with_intervention(self.hook_point(), Intervention::set_neuron(self.neuron, value))
    }
}

/// Confusion counts for one neuron against one peak
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PeakCounts {
    tp: u64,
    fp_outside: u64,
    fp_other_peak: u64,
    fn_: u64,
}

impl PeakCounts {
    fn update(&mut self, fires: bool, in_peak: bool, in_other: bool) {
        match (fires, in_peak) {
            (true, true) => self.tp += 1,
            (true, false) => {
                self.fp_outside += 1;
                if in_other {
                    self.fp_other_peak += 1;
                }
            }
            (false, true) => self.fn_ += 1,
            (false, false) => {}
        }
    }

    /// (precision, recall, F1), smoothed so empty counts give 0
    fn scores(&self, mode: MetricMode) -> (f64, f64, f64) {
        let tp = self.tp as f64;
        let fp = match mode {
            MetricMode::All => self.fp_outside,
            MetricMode::Peaks => self.fp_other_peak,
        } as f64;
        let fn_ = self.fn_ as f64;
        (
            tp / (tp + fp + EPS),
            tp / (tp + fn_ + EPS),
            2.0 * tp / (2.0 * tp + fp + fn_ + EPS),
        )
    }
}

/// Running statistics of one downstream neuron
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NeuronPeakStats {
    positions: u64,
    fires: u64,
    peak_1_sum: f64,
    peak_1_n: u64,
    peak_2_sum: f64,
    peak_2_n: u64,
    peak_1: PeakCounts,
    peak_2: PeakCounts,
}

impl NeuronPeakStats {
    pub fn update(&mut self, act: f32, in_peak_1: bool, in_peak_2: bool) {
        let fires = act > 0.0;
        self.positions += 1;
        self.fires += u64::from(fires);
        if in_peak_1 {
            self.peak_1_sum += f64::from(act);
            self.peak_1_n += 1;
        }
        if in_peak_2 {
            self.peak_2_sum += f64::from(act);
            self.peak_2_n += 1;
        }
        self.peak_1.update(fires, in_peak_1, in_peak_2);
        self.peak_2.update(fires, in_peak_2, in_peak_1);
    }

    pub fn metrics(&self, mode: MetricMode) -> PeakMetrics {
        let mean = |sum: f64, n: u64| if n == 0 { f64::NAN } else { sum / n as f64 };
        let (p1_precision, p1_recall, p1_f1) = self.peak_1.scores(mode);
        let (p2_precision, p2_recall, p2_f1) = self.peak_2.scores(mode);
        PeakMetrics {
            firing_rate: self.fires as f64 / (self.positions as f64 + EPS),
            p1_activation: mean(self.peak_1_sum, self.peak_1_n),
            p2_activation: mean(self.peak_2_sum, self.peak_2_n),
            p1_precision,
            p1_recall,
            p1_f1,
            p2_precision,
            p2_recall,
            p2_f1,
        }
    }
}

/// Per-neuron peak metrics; activations are NaN when a peak never occurs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakMetrics {
    pub firing_rate: f64,
    pub p1_activation: f64,
    pub p2_activation: f64,
    pub p1_precision: f64,
    pub p1_recall: f64,
    pub p1_f1: f64,
    pub p2_precision: f64,
    pub p2_recall: f64,
    pub p2_f1: f64,
}

impl PeakMetrics {
    fn insert_columns(&self, record: &mut BTreeMap<String, Value>, suffix: &str) {
        let columns = [
            ("Firing Rate", self.firing_rate),
            ("P1 activation", self.p1_activation),
            ("P2 activation", self.p2_activation),
            ("P1 Precision", self.p1_precision),
            ("P1 Recall", self.p1_recall),
            ("P1 F1", self.p1_f1),
            ("P2 Precision", self.p2_precision),
            ("P2 Recall", self.p2_recall),
            ("P2 F1", self.p2_f1),
        ];
        for (name, value) in columns {
            let key = if suffix.is_empty() {
                name.to_string()
            } else {
                format!("{name} ({suffix})")
            };
            record.insert(key, value.into());
        }
    }
}

/// Statistics of every downstream neuron over a set of prompts
#[derive(Debug, Clone, Default)]
pub struct DownstreamStats {
    names: Vec<String>,
    stats: Vec<NeuronPeakStats>,
}

impl DownstreamStats {
    pub fn new(layers: &[usize], d_mlp: usize) -> Self {
        let names: Vec<String> = layers
            .iter()
            .flat_map(|l| (0..d_mlp).map(move |n| format!("L{l}N{n}")))
            .collect();
        let stats = vec![NeuronPeakStats::default(); names.len()];
        Self { names, stats }
    }

    /// Add `[positions, d_mlp]` activations of consecutive layers in order
    pub fn push(&mut self, layer_acts: &[Tensor], peaks: &[(bool, bool)]) -> Result<()> {
        let mut offset = 0;
        for acts in layer_acts {
            let rows: Vec<Vec<f32>> = acts.to_vec2()?;
            anyhow::ensure!(
                rows.len() == peaks.len(),
                "Got {} activation rows for {} peak labels",
                rows.len(),
                peaks.len()
            );
            for (row, &(p1, p2)) in rows.iter().zip(peaks) {
                for (i, &act) in row.iter().enumerate() {
                    let stat = self
                        .stats
                        .get_mut(offset + i)
                        .ok_or_else(|| anyhow::anyhow!("More activations than tracked neurons"))?;
                    stat.update(act, p1, p2);
                }
            }
            offset += rows.first().map_or(0, Vec::len);
        }
        Ok(())
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn metrics(&self, mode: MetricMode) -> Vec<PeakMetrics> {
        self.stats.iter().map(|s| s.metrics(mode)).collect()
    }
}

/// Peak label of every position from `start_index` on, from an unhooked run
pub fn peak_labels(model: &HaystackModel, tokens: &Tensor, cfg: &DownstreamConfig) -> Result<Vec<(bool, bool)>> {
    let hook = cfg.hook_point();
    let cache = model.run_with_hooks(tokens, &HookSpec::new().with_capture(hook.clone()))?;
    let acts = cache.require_f32(&hook)?;
    let seq_len = acts.dim(1)?;
    if cfg.start_index >= seq_len {
        return Ok(Vec::new());
    }
    let column: Vec<f32> = acts.i((0, cfg.start_index.., cfg.neuron))?.to_vec1()?;
    Ok(column
        .into_iter()
        .map(|a| (cfg.peak_1.contains(a), cfg.peak_2.contains(a)))
        .collect())
}

/// Accumulate downstream statistics over `prompts`, optionally snapping the context neuron
pub fn collect_downstream_stats<S: AsRef<str>>(
    model: &HaystackModel,
    prompts: &[S],
    cfg: &DownstreamConfig,
    snap: Option<f32>,
) -> Result<DownstreamStats> {
    let mut stats = DownstreamStats::new(&cfg.downstream_layers, model.d_mlp());
    let mut capture = match snap {
        Some(value) => cfg.snap_hooks(value),
        None => HookSpec::new(),
    };
    for &l in &cfg.downstream_layers {
        capture.capture(HookPoint::MlpPost(l));
    }

    for prompt in prompts {
        let tokens = model.to_tokens(prompt.as_ref())?;
        let peaks = peak_labels(model, &tokens, cfg)?;
        if peaks.is_empty() {
            continue;
        }
        let cache = model.run_with_hooks(&tokens, &capture)?;
        let layer_acts = cfg
            .downstream_layers
            .iter()
            .map(|&l| Ok(cache.require_f32(&HookPoint::MlpPost(l))?.i((0, cfg.start_index..))?))
            .collect::<Result<Vec<_>>>()?;
        stats.push(&layer_acts, &peaks)?;
    }
    debug!("Collected downstream stats (snap = {snap:?})");
    Ok(stats)
}

/// One row per downstream neuron
pub type DownstreamRecord = BTreeMap<String, Value>;

/// Merge the unablated and snapped metrics and add the F1 increases
pub fn compare_snapping(
    names: &[String],
    original: &[PeakMetrics],
    p1_snapped: &[PeakMetrics],
    p2_snapped: &[PeakMetrics],
) -> Result<Vec<DownstreamRecord>> {
    anyhow::ensure!(
        names.len() == original.len() && original.len() == p1_snapped.len() && original.len() == p2_snapped.len(),
        "Metric tables differ in length"
    );
    Ok(names
        .iter()
        .zip(original.iter().zip(p1_snapped.iter().zip(p2_snapped)))
        .map(|(name, (base, (p1, p2)))| {
            let mut record = DownstreamRecord::new();
            record.insert("Neuron".into(), name.clone().into());
            base.insert_columns(&mut record, "");
            p1.insert_columns(&mut record, "P1 snapped");
            p2.insert_columns(&mut record, "P2 snapped");
            record.insert("P1 F1 increase".into(), (base.p1_f1 - p2.p1_f1).into());
            record.insert("P2 F1 increase".into(), (base.p2_f1 - p1.p2_f1).into());
            record
        })
        .collect())
}

fn column(record: &DownstreamRecord, key: &str) -> f64 {
    record.get(key).and_then(Value::as_f64).unwrap_or(f64::NAN)
}

/// Names of the `k` neurons with the largest increase among those with F1 above `min_f1`
pub fn top_increase(records: &[DownstreamRecord], f1: &str, increase: &str, min_f1: f64, k: usize) -> Vec<String> {
    let mut selected: Vec<&DownstreamRecord> = records.iter().filter(|r| column(r, f1) > min_f1).collect();
    selected.sort_by(|a, b| column(b, increase).total_cmp(&column(a, increase)));
    selected
        .into_iter()
        .take(k)
        .filter_map(|r| r.get("Neuron").and_then(Value::as_str).map(str::to_string))
        .collect()
}

/// Score downstream neurons unablated and with both snaps, and write the table
pub fn run(model: &HaystackModel, cfg: &DownstreamConfig) -> Result<Vec<DownstreamRecord>> {
    let mut prompts = load_json_data(&cfg.data_path)?;
    prompts.truncate(cfg.num_prompts);
    info!(
        "Scoring {} downstream layers of L{}N{} on {} prompts",
        cfg.downstream_layers.len(),
        cfg.layer,
        cfg.neuron,
        prompts.len()
    );

    let original = collect_downstream_stats(model, &prompts, cfg, None)?;
    let p1 = collect_downstream_stats(model, &prompts, cfg, Some(cfg.peak_1_value))?;
    let p2 = collect_downstream_stats(model, &prompts, cfg, Some(cfg.peak_2_value))?;

    let records = compare_snapping(
        original.names(),
        &original.metrics(cfg.mode),
        &p1.metrics(cfg.mode),
        &p2.metrics(cfg.mode),
    )?;

    info!("Top P1 F1 increase: {:?}", top_increase(&records, "P1 F1", "P1 F1 increase", 0.7, 10));
    info!("Top P2 F1 increase: {:?}", top_increase(&records, "P2 F1", "P2 F1 increase", 0.7, 10));

    std::fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("Failed to create {}", cfg.output_dir.display()))?;
    let mode = match cfg.mode {
        MetricMode::All => "all",
        MetricMode::Peaks => "peaks",
    };
    let path = cfg.output_dir.join(format!("L{}N{}_downstream_{mode}.json", cfg.layer, cfg.neuron));
    std::fs::write(&path, serde_json::to_string_pretty(&records)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote {}", path.display());
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_utils::tiny_model;

    #[test]
    fn test_peak_window_is_open() {
        let w = PeakWindow { low: 0.8, high: 4.1 };
        assert!(w.contains(2.5));
        assert!(!w.contains(0.8));
        assert!(!w.contains(4.1));
    }

    #[test]
    fn test_neuron_metrics_by_mode() {
        let mut s = NeuronPeakStats::default();
        // (act, p1, p2)
        for (act, p1, p2) in [
            (1.0, true, false),
            (2.0, true, false),
            (-1.0, true, false),
            (3.0, false, true),
            (0.5, false, false),
            (0.0, false, true),
        ] {
            s.update(act, p1, p2);
        }

        let all = s.metrics(MetricMode::All);
        assert!((all.firing_rate - 4.0 / 6.0).abs() < 1e-9);
        assert!((all.p1_activation - 2.0 / 3.0).abs() < 1e-9);
        assert!((all.p2_activation - 1.5).abs() < 1e-9);
        // P1: TP 2, FP 2 outside, FN 1
        assert!((all.p1_precision - 0.5).abs() < 1e-9);
        assert!((all.p1_recall - 2.0 / 3.0).abs() < 1e-9);
        assert!((all.p1_f1 - 4.0 / 7.0).abs() < 1e-9);

        let peaks = s.metrics(MetricMode::Peaks);
        // P1: FP only counts firing in peak 2
        assert!((peaks.p1_precision - 2.0 / 3.0).abs() < 1e-9);
        // P2: TP 1, FP 2 in peak 1, FN 1
        assert!((peaks.p2_f1 - 2.0 / 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_peak_is_nan() {
        let mut s = NeuronPeakStats::default();
        s.update(1.0, false, false);
        let m = s.metrics(MetricMode::All);
        assert!(m.p1_activation.is_nan());
        assert_eq!(m.p1_f1, 0.0);
    }

    #[test]
    fn test_compare_and_rank() {
        let names = vec!["L9N0".to_string(), "L9N1".to_string()];
        let mut a = NeuronPeakStats::default();
        a.update(1.0, true, false);
        let mut b = NeuronPeakStats::default();
        b.update(-1.0, true, false);
        let good = a.metrics(MetricMode::Peaks);
        let bad = b.metrics(MetricMode::Peaks);

        let records = compare_snapping(&names, &[good, good], &[good, good], &[bad, good]).unwrap();
        assert_eq!(records.len(), 2);
        assert!((column(&records[0], "P1 F1 increase") - 1.0).abs() < 1e-6);
        assert!(column(&records[1], "P1 F1 increase").abs() < 1e-9);
        assert!(records[0].contains_key("P2 F1 (P1 snapped)"));
        assert_eq!(top_increase(&records, "P1 F1", "P1 F1 increase", 0.7, 1), vec!["L9N0"]);
        assert!(compare_snapping(&names, &[good], &[good], &[good]).is_err());
    }

    fn tiny_cfg() -> DownstreamConfig {
        DownstreamConfig {
            layer: 0,
            neuron: 3,
            start_index: 2,
            downstream_layers: vec![1],
            ..DownstreamConfig::default()
        }
    }

    #[test]
    fn test_snapping_sets_peaks() {
        let model = tiny_model();
        let cfg = tiny_cfg();
        let tokens = model.to_tokens("der die das ist ein Haus").unwrap();
        let hook = cfg.hook_point();
        let cache = model
            .run_with_hooks(&tokens, &cfg.snap_hooks(cfg.peak_2_value).with_capture(hook.clone()))
            .unwrap();
        let column: Vec<f32> = cache.require(&hook).unwrap().i((0, .., 3)).unwrap().to_vec1().unwrap();
        assert!(column.iter().all(|&v| v == 6.5));

        assert_eq!(peak_labels(&model, &tokens, &cfg).unwrap().len(), 5);
    }

    #[test]
    fn test_collect_on_tiny_model() {
        let model = tiny_model();
        let cfg = tiny_cfg();
        let prompts = ["der die das ist ein Haus", "das Haus", "the house is a house"];
        let stats = collect_downstream_stats(&model, &prompts, &cfg, Some(2.5)).unwrap();
        assert_eq!(stats.names().len(), 32);
        assert_eq!(stats.names()[5], "L1N5");
        let metrics = stats.metrics(MetricMode::All);
        // "das Haus" has 3 tokens, so one position past start_index
        assert!(metrics.iter().all(|m| m.firing_rate >= 0.0 && m.firing_rate <= 1.0));
        assert_eq!(stats.stats[0].positions, 5 + 1 + 4);
    }
}
