//! Linear probing with linfa
//!
//! Logistic-regression probes separate activations of a positive class
//! (e.g. German text) from a negative class, scored with F1 and the
//! Matthews correlation coefficient.

use anyhow::{Context, Result};
use linfa::prelude::*;
use linfa_logistic::LogisticRegression;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

/// Results from training and evaluating a probe
#[derive(Debug, Clone)]
pub struct ProbeResults {
    /// Classification accuracy on test set
    pub accuracy: f64,
    /// Number of correct predictions
    pub correct: usize,
    /// Total number of test samples
    pub total: usize,
    pub true_positives: usize,
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl ProbeResults {
    /// Confusion counts of predictions against labels (1 = positive)
    pub fn from_predictions(predictions: &[usize], labels: &[usize]) -> Self {
        let (mut tp, mut tn, mut fp, mut r#fn) = (0, 0, 0, 0);
        for (pred, label) in predictions.iter().zip(labels) {
            match (*pred, *label) {
                (1, 1) => tp += 1,
                (0, 0) => tn += 1,
                (1, 0) => fp += 1,
                (0, 1) => r#fn += 1,
                _ => {}
            }
        }
        let correct = tp + tn;
        let total = predictions.len();
        Self {
            accuracy: if total == 0 {
                0.0
            } else {
                correct as f64 / total as f64
            },
            correct,
            total,
            true_positives: tp,
            true_negatives: tn,
            false_positives: fp,
            false_negatives: r#fn,
        }
    }

    pub fn precision(&self) -> f64 {
        let denom = self.true_positives + self.false_positives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    pub fn recall(&self) -> f64 {
        let denom = self.true_positives + self.false_negatives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    /// Matthews correlation coefficient (0 when undefined)
    pub fn mcc(&self) -> f64 {
        let tp = self.true_positives as f64;
        let tn = self.true_negatives as f64;
        let fp = self.false_positives as f64;
        let r#fn = self.false_negatives as f64;
        let denom = ((tp + fp) * (tp + r#fn) * (tn + fp) * (tn + r#fn)).sqrt();
        if denom == 0.0 {
            0.0
        } else {
            (tp * tn - fp * r#fn) / denom
        }
    }
}

/// Per-feature standardisation to zero mean and unit variance
#[derive(Debug, Clone)]
pub struct StandardScaler {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl StandardScaler {
    /// Fit on the rows of `x`; zero-variance features keep a scale of 1
    pub fn fit(x: &Array2<f64>) -> Result<Self> {
        let mean = x
            .mean_axis(Axis(0))
            .ok_or_else(|| anyhow::anyhow!("Cannot fit a scaler on zero rows"))?;
        let scale = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s == 0.0 { 1.0 } else { s });
        Ok(Self { mean, scale })
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        (x - &self.mean) / &self.scale
    }

    pub fn fit_transform(x: &Array2<f64>) -> Result<Array2<f64>> {
        Ok(Self::fit(x)?.transform(x))
    }
}

/// Shuffled split of rows into train and test sets
pub fn train_test_split(
    x: &Array2<f64>,
    y: &Array1<usize>,
    test_fraction: f64,
    seed: u64,
) -> Result<(Array2<f64>, Array2<f64>, Array1<usize>, Array1<usize>)> {
    let n = x.nrows();
    anyhow::ensure!(n == y.len(), "Got {n} rows but {} labels", y.len());
    anyhow::ensure!(
        (0.0..1.0).contains(&test_fraction),
        "Test fraction must be in [0, 1), got {test_fraction}"
    );

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let n_test = (n as f64 * test_fraction).ceil() as usize;
    let (test_idx, train_idx) = indices.split_at(n_test.min(n));

    Ok((
        x.select(Axis(0), train_idx),
        x.select(Axis(0), test_idx),
        y.select(Axis(0), train_idx),
        y.select(Axis(0), test_idx),
    ))
}

/// Stack positive and negative rows with labels 1 and 0
pub fn labelled_matrix(positive: &[Vec<f32>], negative: &[Vec<f32>]) -> Result<(Array2<f64>, Array1<usize>)> {
    let n = positive.len() + negative.len();
    anyhow::ensure!(n > 0, "Empty dataset");
    let n_features = positive.first().or(negative.first()).map_or(0, Vec::len);

    let flat: Vec<f64> = positive
        .iter()
        .chain(negative)
        .flat_map(|row| row.iter().map(|&v| f64::from(v)))
        .collect();
    let x = Array2::from_shape_vec((n, n_features), flat)
        .context("Failed to create feature matrix")?;
    let y: Array1<usize> = std::iter::repeat(1)
        .take(positive.len())
        .chain(std::iter::repeat(0).take(negative.len()))
        .collect();
    Ok((x, y))
}

/// Trainer for linear probes
pub struct ProbeTrainer {
    max_iterations: u64,
}

impl ProbeTrainer {
    pub fn new() -> Self {
        Self {
            max_iterations: 100,
        }
    }

    pub fn with_max_iterations(max_iterations: u64) -> Self {
        Self { max_iterations }
    }

    /// Fit on one set of rows and score on another
    pub fn fit_and_score(
        &self,
        train_x: Array2<f64>,
        train_y: Array1<usize>,
        test_x: &Array2<f64>,
        test_y: &Array1<usize>,
    ) -> Result<ProbeResults> {
        debug!(
            "Training probe: {} samples, {} features",
            train_x.nrows(),
            train_x.ncols()
        );

        // A single-class training set cannot be fit; predict that class
        let first = train_y.first().copied().unwrap_or(0);
        let predictions: Vec<usize> = if train_y.iter().all(|&l| l == first) {
            vec![first; test_x.nrows()]
        } else {
            let model = LogisticRegression::default()
                .max_iterations(self.max_iterations)
                .fit(&Dataset::new(train_x, train_y))
                .context("Failed to train logistic regression")?;
            model.predict(test_x).to_vec()
        };

        Ok(ProbeResults::from_predictions(
            &predictions,
            test_y.as_slice().unwrap_or(&test_y.to_vec()),
        ))
    }
}

impl Default for ProbeTrainer {
    fn default() -> Self {
        Self::new()
    }
}

/// Scale, split 80/20, fit and score a probe; returns (F1, MCC)
pub fn train_probe(
    positive: &[Vec<f32>],
    negative: &[Vec<f32>],
    max_iterations: u64,
    seed: u64,
) -> Result<(f64, f64)> {
    let (x, y) = labelled_matrix(positive, negative)?;
    let x = StandardScaler::fit_transform(&x)?;
    let (train_x, test_x, train_y, test_y) = train_test_split(&x, &y, 0.2, seed)?;
    let results = ProbeTrainer::with_max_iterations(max_iterations)
        .fit_and_score(train_x, train_y, &test_x, &test_y)?;
    Ok((results.f1(), results.mcc()))
}
