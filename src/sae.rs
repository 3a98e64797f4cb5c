//! Sparse autoencoders over MLP activations
//!
//! An [`AutoEncoder`] maps `d_in` activations to a wider, sparsely active
//! hidden layer and back. Decoder rows are unit norm during training.
//! Weights are stored as safetensors next to a JSON config:
//!
//! ```text
//! {dir}/{model_name}/{name}.safetensors   W_enc, b_enc, W_dec, b_dec
//! {dir}/{model_name}/{name}.json          layer, act, expansion_factor, l1_coeff, ...
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::corpus::{load_json_data, load_token_batches};
use crate::hooks::{HookPoint, HookSpec, Intervention};
use crate::model::HaystackModel;

fn default_reg() -> String {
    "l1".to_string()
}

/// Shape and location of an autoencoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoEncoderConfig {
    pub layer: usize,
    #[serde(rename = "act")]
    pub act_name: String,
    pub expansion_factor: usize,
    pub l1_coeff: f64,
    #[serde(default)]
    pub d_in: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_name: Option<String>,
    #[serde(default = "default_reg")]
    pub reg: String,
}

impl AutoEncoderConfig {
    /// `blocks.{layer}.{act_name}`
    pub fn encoder_hook_point(&self) -> HookPoint {
        HookPoint::from(format!("blocks.{}.{}", self.layer, self.act_name).as_str())
    }

    pub fn d_in(&self) -> Result<usize> {
        self.d_in
            .ok_or_else(|| anyhow::anyhow!("Autoencoder config has no d_in"))
    }

    pub fn d_hidden(&self) -> Result<usize> {
        Ok(self.d_in()? * self.expansion_factor)
    }
}

/// Width of the activation an autoencoder reads
pub fn act_name_to_d_in(model: &HaystackModel, act_name: &str) -> Result<usize> {
    match act_name {
        "mlp.hook_post" | "mlp.hook_pre" => Ok(model.d_mlp()),
        "hook_mlp_out" => Ok(model.d_model()),
        other => anyhow::bail!("Act name not recognised: {other}"),
    }
}

/// Last path segment of a hub id (`EleutherAI/pythia-70m` -> `pythia-70m`)
pub fn model_short_name(model_id: &str) -> &str {
    model_id.rsplit('/').next().unwrap_or(model_id)
}

/// Outputs of one autoencoder pass
#[derive(Debug)]
pub struct AutoEncoderOutput {
    pub loss: Tensor,
    pub reconstruction: Tensor,
    pub acts: Tensor,
    pub l2_loss: Tensor,
    pub l1_loss: Tensor,
}

/// Tied-bias sparse autoencoder
pub struct AutoEncoder {
    w_enc: Var,
    b_enc: Var,
    w_dec: Var,
    b_dec: Var,
    l1_coeff: f64,
    d_in: usize,
    d_hidden: usize,
}

impl AutoEncoder {
    /// Kaiming-uniform weights with unit-norm decoder rows, zero biases
    pub fn new(d_in: usize, d_hidden: usize, l1_coeff: f64, seed: u64, device: &Device) -> Result<Self> {
        anyhow::ensure!(d_in > 0 && d_hidden > 0, "Autoencoder dimensions must be positive");
        let mut rng = StdRng::seed_from_u64(seed);

        let mut kaiming = |fan_in: usize, rows: usize, cols: usize| -> Result<Tensor> {
            let bound = (6.0 / fan_in as f64).sqrt() as f32;
            let values: Vec<f32> = (0..rows * cols)
                .map(|_| rng.gen_range(-bound..bound))
                .collect();
            Ok(Tensor::from_vec(values, (rows, cols), device)?)
        };
        let w_enc = kaiming(d_hidden, d_in, d_hidden)?;
        let w_dec = kaiming(d_in, d_hidden, d_in)?;

        let encoder = Self {
            w_enc: Var::from_tensor(&w_enc)?,
            b_enc: Var::zeros(d_hidden, DType::F32, device)?,
            w_dec: Var::from_tensor(&w_dec)?,
            b_dec: Var::zeros(d_in, DType::F32, device)?,
            l1_coeff,
            d_in,
            d_hidden,
        };
        encoder.normalize_decoder()?;
        Ok(encoder)
    }

    /// Build from stored weights: `W_enc [d_in, d_hidden]`, `W_dec [d_hidden, d_in]`
    pub fn from_tensors(
        w_enc: Tensor,
        b_enc: Tensor,
        w_dec: Tensor,
        b_dec: Tensor,
        l1_coeff: f64,
    ) -> Result<Self> {
        let (d_in, d_hidden) = w_enc.dims2()?;
        anyhow::ensure!(
            w_dec.dims() == [d_hidden, d_in],
            "W_dec shape {:?} does not match W_enc shape {:?}",
            w_dec.dims(),
            w_enc.dims()
        );
        anyhow::ensure!(b_enc.dims() == [d_hidden], "b_enc shape {:?}", b_enc.dims());
        anyhow::ensure!(b_dec.dims() == [d_in], "b_dec shape {:?}", b_dec.dims());
        Ok(Self {
            w_enc: Var::from_tensor(&w_enc.to_dtype(DType::F32)?)?,
            b_enc: Var::from_tensor(&b_enc.to_dtype(DType::F32)?)?,
            w_dec: Var::from_tensor(&w_dec.to_dtype(DType::F32)?)?,
            b_dec: Var::from_tensor(&b_dec.to_dtype(DType::F32)?)?,
            l1_coeff,
            d_in,
            d_hidden,
        })
    }

    pub fn d_in(&self) -> usize {
        self.d_in
    }

    pub fn d_hidden(&self) -> usize {
        self.d_hidden
    }

    pub fn l1_coeff(&self) -> f64 {
        self.l1_coeff
    }

    pub fn w_enc(&self) -> &Tensor {
        self.w_enc.as_tensor()
    }

    pub fn b_enc(&self) -> &Tensor {
        self.b_enc.as_tensor()
    }

    pub fn w_dec(&self) -> &Tensor {
        self.w_dec.as_tensor()
    }

    pub fn b_dec(&self) -> &Tensor {
        self.b_dec.as_tensor()
    }

    /// Trainable parameters in a fixed order
    pub fn vars(&self) -> Vec<Var> {
        vec![
            self.w_enc.clone(),
            self.b_enc.clone(),
            self.w_dec.clone(),
            self.b_dec.clone(),
        ]
    }

    /// Feature activations of `[n, d_in]` rows, `[n, d_hidden]`
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let x_cent = x.to_dtype(DType::F32)?.broadcast_sub(self.b_dec())?;
        Ok(x_cent
            .matmul(self.w_enc())?
            .broadcast_add(self.b_enc())?
            .relu()?)
    }

    /// Loss, reconstruction, activations and both loss terms for `[n, d_in]` rows
    pub fn forward(&self, x: &Tensor) -> Result<AutoEncoderOutput> {
        let acts = self.encode(x)?;
        self.decode_with_losses(x, acts)
    }

    /// [`AutoEncoder::forward`] with one feature fixed to `value`
    pub fn custom_forward(&self, x: &Tensor, neuron: usize, value: f32) -> Result<AutoEncoderOutput> {
        anyhow::ensure!(
            neuron < self.d_hidden,
            "Feature {neuron} out of range (d_hidden={})",
            self.d_hidden
        );
        let acts = crate::hooks::apply_intervention(
            &self.encode(x)?,
            &Intervention::set_neuron(neuron, value),
        )?;
        self.decode_with_losses(x, acts)
    }

    fn decode_with_losses(&self, x: &Tensor, acts: Tensor) -> Result<AutoEncoderOutput> {
        let x = x.to_dtype(DType::F32)?;
        let reconstruction = acts.matmul(self.w_dec())?.broadcast_add(self.b_dec())?;
        let l2_loss = (&reconstruction - &x)?
            .sqr()?
            .sum(D::Minus1)?
            .mean(0)?;
        let l1_loss = (acts.abs()?.sum_all()? * self.l1_coeff)?;
        let loss = (&l2_loss + &l1_loss)?;
        Ok(AutoEncoderOutput {
            loss,
            reconstruction,
            acts,
            l2_loss,
            l1_loss,
        })
    }

    /// Reconstruction of an activation of any rank ending in `d_in`
    pub fn reconstruct(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims().to_vec();
        let flat = x.reshape(((), self.d_in))?;
        let recon = self.forward(&flat)?.reconstruction;
        Ok(recon.reshape(dims)?.to_dtype(x.dtype())?)
    }

    /// Feature activations of an activation of any rank ending in `d_in`
    pub fn encode_any(&self, x: &Tensor) -> Result<Tensor> {
        let mut dims = x.dims().to_vec();
        let flat = x.reshape(((), self.d_in))?;
        let acts = self.encode(&flat)?;
        if let Some(last) = dims.last_mut() {
            *last = self.d_hidden;
        }
        Ok(acts.reshape(dims)?)
    }

    /// Scale decoder rows to unit norm
    pub fn normalize_decoder(&self) -> Result<()> {
        let w_dec = self.w_dec.as_tensor();
        let norms = w_dec.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
        self.w_dec.set(&w_dec.broadcast_div(&norms)?.detach())?;
        Ok(())
    }

    /// Drop the decoder gradient component parallel to each decoder row
    pub fn remove_parallel_decoder_grad(&self, grads: &mut GradStore) -> Result<()> {
        let w_dec = self.w_dec.as_tensor();
        let Some(grad) = grads.get(w_dec) else {
            return Ok(());
        };
        let norms = w_dec.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
        let unit = w_dec.broadcast_div(&norms)?.detach();
        let parallel = (grad * &unit)?.sum_keepdim(D::Minus1)?;
        let projected = (grad - unit.broadcast_mul(&parallel)?)?;
        grads.insert(w_dec, projected);
        Ok(())
    }

    /// Intervention replacing the hooked activation with its reconstruction
    pub fn reconstruction_intervention(self: &Arc<Self>) -> Intervention {
        let encoder = Arc::clone(self);
        Intervention::apply(move |x| encoder.reconstruct(x))
    }

    /// Write `{name}.safetensors` and `{name}.json` into `dir`
    pub fn save(&self, dir: impl AsRef<Path>, name: &str, config: &AutoEncoderConfig) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let tensors = HashMap::from([
            ("W_enc".to_string(), self.w_enc().clone()),
            ("b_enc".to_string(), self.b_enc().clone()),
            ("W_dec".to_string(), self.w_dec().clone()),
            ("b_dec".to_string(), self.b_dec().clone()),
        ]);
        let weights_path = dir.join(format!("{name}.safetensors"));
        candle_core::safetensors::save(&tensors, &weights_path)
            .with_context(|| format!("Failed to write {}", weights_path.display()))?;

        let mut config = config.clone();
        config.d_in = Some(self.d_in);
        let config_path = dir.join(format!("{name}.json"));
        std::fs::write(&config_path, serde_json::to_string_pretty(&config)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        info!("Saved autoencoder to {}", weights_path.display());
        Ok(weights_path)
    }
}

/// Load `{dir}/{model_name}/{name}` (weights and config)
///
/// Missing `d_in` is derived from the model and the hook name; missing
/// `reg` defaults to `l1`.
pub fn load_encoder(
    name: &str,
    model_name: &str,
    model: &HaystackModel,
    dir: impl AsRef<Path>,
) -> Result<(AutoEncoder, AutoEncoderConfig)> {
    let base = dir.as_ref().join(model_name);
    let config_path = base.join(format!("{name}.json"));
    let text = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;
    let mut config: AutoEncoderConfig = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", config_path.display()))?;
    if config.d_in.is_none() {
        config.d_in = Some(act_name_to_d_in(model, &config.act_name)?);
    }
    anyhow::ensure!(
        config.reg == "l1",
        "Unsupported regularisation `{}`",
        config.reg
    );

    let weights_path = base.join(format!("{name}.safetensors"));
    let mut tensors = candle_core::safetensors::load(&weights_path, model.device())
        .with_context(|| format!("Failed to read {}", weights_path.display()))?;
    let mut take = |key: &str| {
        tensors
            .remove(key)
            .ok_or_else(|| anyhow::anyhow!("No `{key}` in {}", weights_path.display()))
    };
    let encoder = AutoEncoder::from_tensors(
        take("W_enc")?,
        take("b_enc")?,
        take("W_dec")?,
        take("b_dec")?,
        config.l1_coeff,
    )?;
    anyhow::ensure!(
        encoder.d_hidden() == config.d_hidden()?,
        "Stored d_hidden {} does not match config ({} x {})",
        encoder.d_hidden(),
        config.d_in()?,
        config.expansion_factor
    );
    info!(
        "Loaded autoencoder {} ({} -> {}) at {}",
        name,
        encoder.d_in(),
        encoder.d_hidden(),
        config.encoder_hook_point()
    );
    Ok((encoder, config))
}

// --- Training ---

/// Autoencoder training run settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaeTrainingConfig {
    pub model: String,
    pub layer: usize,
    pub act: String,
    pub expansion_factor: usize,
    pub l1_coeff: f64,
    pub lr: f64,
    pub batch_size: usize,
    pub seq_len: usize,
    pub buffer_mult: usize,
    pub num_training_tokens: usize,
    pub num_eval_tokens: usize,
    pub num_eval_prompts: usize,
    pub eval_interval: usize,
    /// Token batches written by `batch-prompts`
    pub data_path: PathBuf,
    /// JSON list of evaluation prompts
    pub eval_data_path: Option<PathBuf>,
    pub save_dir: PathBuf,
    pub run_name: Option<String>,
    pub seed: u64,
    /// JSON file whose fields override this config
    pub cfg_file: Option<PathBuf>,

    // Derived by `with_derived_values`
    pub model_batch_size: usize,
    pub buffer_size: usize,
    pub buffer_batches: usize,
    pub num_eval_batches: usize,
}

impl Default for SaeTrainingConfig {
    fn default() -> Self {
        Self {
            model: "EleutherAI/pythia-70m".to_string(),
            layer: 3,
            act: "mlp.hook_post".to_string(),
            expansion_factor: 4,
            l1_coeff: 1e-4,
            lr: 1e-4,
            batch_size: 4096,
            seq_len: 128,
            buffer_mult: 384,
            num_training_tokens: 200_000_000,
            num_eval_tokens: 800_000,
            num_eval_prompts: 200,
            eval_interval: 1000,
            data_path: PathBuf::from("data/tokens.safetensors"),
            eval_data_path: None,
            save_dir: PathBuf::from("output"),
            run_name: None,
            seed: 42,
            cfg_file: None,
            model_batch_size: 0,
            buffer_size: 0,
            buffer_batches: 0,
            num_eval_batches: 0,
        }
    }
}

impl SaeTrainingConfig {
    /// Read a config from JSON; absent fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply `cfg_file` overrides, then compute buffer and batch sizes
    pub fn with_derived_values(self) -> Result<Self> {
        let mut cfg = match &self.cfg_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let overrides: serde_json::Value = serde_json::from_str(&text)
                    .with_context(|| format!("Failed to parse {}", path.display()))?;
                let mut merged = serde_json::to_value(&self)?;
                if let (Some(base), Some(extra)) = (merged.as_object_mut(), overrides.as_object()) {
                    for (key, value) in extra {
                        base.insert(key.clone(), value.clone());
                    }
                }
                serde_json::from_value(merged)?
            }
            None => self,
        };

        anyhow::ensure!(cfg.seq_len > 0 && cfg.batch_size > 0, "batch_size and seq_len must be positive");
        cfg.model_batch_size = cfg.batch_size / cfg.seq_len * 16;
        cfg.buffer_size = cfg.batch_size * cfg.buffer_mult;
        cfg.buffer_batches = cfg.buffer_size / cfg.seq_len;
        cfg.num_eval_batches = cfg.num_eval_tokens / cfg.batch_size;
        anyhow::ensure!(
            cfg.model_batch_size > 0 && cfg.buffer_batches % cfg.model_batch_size == 0,
            "buffer_batches ({}) must be a multiple of model_batch_size ({})",
            cfg.buffer_batches,
            cfg.model_batch_size
        );
        Ok(cfg)
    }

    pub fn autoencoder_config(&self, d_in: usize) -> AutoEncoderConfig {
        AutoEncoderConfig {
            layer: self.layer,
            act_name: self.act.clone(),
            expansion_factor: self.expansion_factor,
            l1_coeff: self.l1_coeff,
            d_in: Some(d_in),
            run_name: self.run_name.clone(),
            reg: default_reg(),
        }
    }
}

/// Shuffled activations drawn from token rows through the model
pub struct ActivationBuffer<'a> {
    model: &'a HaystackModel,
    hook: HookPoint,
    tokens: Tensor,
    token_pointer: usize,
    buffer: Option<Tensor>,
    pointer: usize,
    batch_size: usize,
    buffer_size: usize,
    buffer_batches: usize,
    model_batch_size: usize,
    rng: StdRng,
}

impl<'a> ActivationBuffer<'a> {
    pub fn new(
        model: &'a HaystackModel,
        hook: HookPoint,
        tokens: Tensor,
        cfg: &SaeTrainingConfig,
    ) -> Result<Self> {
        anyhow::ensure!(tokens.rank() == 2, "Expected [rows, seq] tokens, got {:?}", tokens.dims());
        anyhow::ensure!(tokens.dim(0)? > 0, "No token rows to train on");
        Ok(Self {
            model,
            hook,
            tokens,
            token_pointer: 0,
            buffer: None,
            pointer: 0,
            batch_size: cfg.batch_size,
            buffer_size: cfg.buffer_size,
            buffer_batches: cfg.buffer_batches,
            model_batch_size: cfg.model_batch_size,
            rng: StdRng::seed_from_u64(cfg.seed),
        })
    }

    /// Run the next `buffer_batches` token rows and shuffle their activations
    pub fn refill(&mut self) -> Result<()> {
        let spec = HookSpec::new().with_capture(self.hook.clone());
        let n_rows = self.tokens.dim(0)?;
        let mut chunks = Vec::new();
        let mut collected = 0;
        let mut batches_done = 0;

        while batches_done < self.buffer_batches && collected < self.buffer_size {
            if self.token_pointer >= n_rows {
                warn!("Token rows exhausted, wrapping around");
                self.token_pointer = 0;
            }
            let take = self
                .model_batch_size
                .min(n_rows - self.token_pointer)
                .min(self.buffer_batches - batches_done);
            let batch = self
                .tokens
                .narrow(0, self.token_pointer, take)?
                .to_device(self.model.device())?;
            let cache = self.model.run_with_hooks(&batch, &spec)?;
            let acts = cache.require_f32(&self.hook)?;
            let d = acts.dim(2)?;
            let rows = acts.reshape(((), d))?;
            collected += rows.dim(0)?;
            chunks.push(rows);
            self.token_pointer += take;
            batches_done += take;
        }

        let all = Tensor::cat(&chunks, 0)?;
        let keep = all.dim(0)?.min(self.buffer_size);
        let mut order: Vec<u32> = (0..keep as u32).collect();
        order.shuffle(&mut self.rng);
        let order = Tensor::from_vec(order, keep, all.device())?;
        self.buffer = Some(all.narrow(0, 0, keep)?.index_select(&order, 0)?);
        self.pointer = 0;
        debug!("Refilled activation buffer with {} rows", keep);
        Ok(())
    }

    /// Next `[batch_size, d_in]` batch, refilling as needed
    pub fn next_batch(&mut self) -> Result<Tensor> {
        let available = match &self.buffer {
            Some(buffer) => buffer.dim(0)?.saturating_sub(self.pointer),
            None => 0,
        };
        if available < self.batch_size {
            self.refill()?;
        }
        let buffer = self
            .buffer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Activation buffer is empty"))?;
        let take = self.batch_size.min(buffer.dim(0)?);
        let batch = buffer.narrow(0, self.pointer, take)?;
        self.pointer += take;
        Ok(batch)
    }
}

/// Reconstruction loss plus the mean of each feature's non-zero activations
///
/// Features that never fire report `NaN`.
pub fn reconstruction_eval_with_activation_means<S: AsRef<str>>(
    encoder: &Arc<AutoEncoder>,
    hook: &HookPoint,
    prompts: &[S],
    model: &HaystackModel,
) -> Result<(f32, Vec<f32>)> {
    let d_hidden = encoder.d_hidden();
    let totals = Arc::new(Mutex::new((vec![0f32; d_hidden], vec![0f32; d_hidden])));

    let hook_encoder = Arc::clone(encoder);
    let hook_totals = Arc::clone(&totals);
    let spec = HookSpec::new().with_intervention(
        hook.clone(),
        Intervention::apply(move |x| {
            let dims = x.dims().to_vec();
            let flat = x.reshape(((), hook_encoder.d_in()))?;
            let out = hook_encoder.forward(&flat)?;
            let sums: Vec<f32> = out.acts.sum(0)?.to_vec1()?;
            let counts: Vec<f32> = out.acts.gt(0f32)?.to_dtype(DType::F32)?.sum(0)?.to_vec1()?;
            let mut guard = hook_totals
                .lock()
                .map_err(|_| anyhow::anyhow!("Activation totals lock poisoned"))?;
            for (total, s) in guard.0.iter_mut().zip(sums) {
                *total += s;
            }
            for (total, c) in guard.1.iter_mut().zip(counts) {
                *total += c;
            }
            Ok(out.reconstruction.reshape(dims)?.to_dtype(x.dtype())?)
        }),
    );

    let mut losses = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        losses.push(model.prompt_loss(prompt.as_ref(), &spec)?);
    }
    anyhow::ensure!(!losses.is_empty(), "No evaluation prompts");
    let mean_loss = losses.iter().sum::<f32>() / losses.len() as f32;

    let guard = totals
        .lock()
        .map_err(|_| anyhow::anyhow!("Activation totals lock poisoned"))?;
    let means = guard
        .0
        .iter()
        .zip(&guard.1)
        .map(|(s, c)| s / c)
        .collect();
    Ok((mean_loss, means))
}

/// Summary of a finished training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub steps: usize,
    pub final_loss: f32,
    pub final_l2_loss: f32,
    pub final_l1_loss: f32,
    pub reconstruction_losses: Vec<(usize, f32)>,
    pub save_path: Option<PathBuf>,
}

/// One AdamW step with the decoder-norm constraint
pub fn training_step(
    encoder: &AutoEncoder,
    optimizer: &mut AdamW,
    acts: &Tensor,
) -> Result<AutoEncoderOutput> {
    let out = encoder.forward(acts)?;
    let mut grads = out.loss.backward()?;
    encoder.remove_parallel_decoder_grad(&mut grads)?;
    optimizer.step(&grads)?;
    encoder.normalize_decoder()?;
    Ok(out)
}

/// Train an autoencoder on activations of `model` and save it
///
/// `tokens` are `[rows, seq_len + 1]` BOS-prefixed rows. Evaluation on
/// `eval_prompts` runs every `eval_interval` steps and at the end.
pub fn train_autoencoder<S: AsRef<str>>(
    model: &HaystackModel,
    cfg: &SaeTrainingConfig,
    tokens: Tensor,
    eval_prompts: &[S],
) -> Result<(Arc<AutoEncoder>, TrainingSummary)> {
    let d_in = act_name_to_d_in(model, &cfg.act)?;
    let ae_cfg = cfg.autoencoder_config(d_in);
    let hook = ae_cfg.encoder_hook_point();

    let encoder = AutoEncoder::new(
        d_in,
        d_in * cfg.expansion_factor,
        cfg.l1_coeff,
        cfg.seed,
        model.device(),
    )?;
    let mut optimizer = AdamW::new(
        encoder.vars(),
        ParamsAdamW {
            lr: cfg.lr,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;

    let mut buffer = ActivationBuffer::new(model, hook.clone(), tokens, cfg)?;
    let num_steps = (cfg.num_training_tokens / cfg.batch_size).max(1);
    info!(
        "Training {} -> {} autoencoder on {} for {} steps",
        d_in,
        encoder.d_hidden(),
        hook,
        num_steps
    );

    let encoder = Arc::new(encoder);
    let mut last = None;
    let mut reconstruction_losses = Vec::new();
    for step in 0..num_steps {
        let acts = buffer.next_batch()?;
        let out = training_step(&encoder, &mut optimizer, &acts)?;
        let loss = out.loss.to_scalar::<f32>()?;
        let l2 = out.l2_loss.to_scalar::<f32>()?;
        let l1 = out.l1_loss.to_scalar::<f32>()?;
        debug!("Step {}: loss {:.4} (l2 {:.4}, l1 {:.4})", step, loss, l2, l1);

        let is_last = step + 1 == num_steps;
        if !eval_prompts.is_empty() && cfg.eval_interval > 0 && (step % cfg.eval_interval == 0 || is_last) {
            let n = cfg.num_eval_prompts.min(eval_prompts.len());
            let (recon_loss, means) =
                reconstruction_eval_with_activation_means(&encoder, &hook, &eval_prompts[..n], model)?;
            let alive = means.iter().filter(|m| m.is_finite()).count();
            info!(
                "Step {}: loss {:.4}, reconstruction loss {:.4}, {} of {} features active",
                step,
                loss,
                recon_loss,
                alive,
                means.len()
            );
            reconstruction_losses.push((step, recon_loss));
        }
        last = Some((loss, l2, l1));
    }

    let (final_loss, final_l2_loss, final_l1_loss) = last.unwrap_or((f32::NAN, f32::NAN, f32::NAN));
    let name = cfg
        .run_name
        .clone()
        .unwrap_or_else(|| format!("L{}_{}_{}", cfg.layer, cfg.act.replace('.', "_"), cfg.seed));
    let save_path = encoder.save(
        cfg.save_dir.join(model_short_name(&cfg.model)),
        &name,
        &ae_cfg,
    )?;

    Ok((
        encoder,
        TrainingSummary {
            steps: num_steps,
            final_loss,
            final_l2_loss,
            final_l1_loss,
            reconstruction_losses,
            save_path: Some(save_path),
        },
    ))
}

/// Train from a config: load token batches and evaluation prompts, then train
pub fn run_training(cfg: SaeTrainingConfig, force_cpu: Option<bool>) -> Result<TrainingSummary> {
    let cfg = cfg.with_derived_values()?;
    info!(
        "Derived sizes: model_batch_size={}, buffer_size={}, buffer_batches={}, num_eval_batches={}",
        cfg.model_batch_size, cfg.buffer_size, cfg.buffer_batches, cfg.num_eval_batches
    );
    let model = HaystackModel::from_pretrained_with_device(&cfg.model, force_cpu)?;
    let tokens = load_token_batches(&cfg.data_path, &Device::Cpu)?;
    let eval_prompts = match &cfg.eval_data_path {
        Some(path) => load_json_data(path)?,
        None => Vec::new(),
    };
    let (_, summary) = train_autoencoder(&model, &cfg, tokens, &eval_prompts)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_utils::tiny_model;

    fn row_norms(w: &Tensor) -> Vec<f32> {
        w.sqr().unwrap().sum(1).unwrap().sqrt().unwrap().to_vec1().unwrap()
    }

    fn tiny_training_config(save_dir: &Path) -> SaeTrainingConfig {
        SaeTrainingConfig {
            model: "test/tiny-neox".to_string(),
            layer: 1,
            expansion_factor: 2,
            batch_size: 8,
            seq_len: 8,
            buffer_mult: 4,
            num_training_tokens: 16,
            eval_interval: 1,
            num_eval_prompts: 2,
            save_dir: save_dir.to_path_buf(),
            run_name: Some("tiny".to_string()),
            model_batch_size: 2,
            buffer_size: 32,
            buffer_batches: 4,
            ..Default::default()
        }
    }

    fn token_rows(n: usize, len: usize) -> Tensor {
        let ids: Vec<u32> = (0..n * len).map(|i| 2 + (i as u32 * 7) % 14).collect();
        Tensor::from_vec(ids, (n, len), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_losses() {
        let encoder = AutoEncoder::new(6, 12, 0.01, 0, &Device::Cpu).unwrap();
        let x = Tensor::randn(0f32, 1f32, (5, 6), &Device::Cpu).unwrap();
        let out = encoder.forward(&x).unwrap();
        assert_eq!(out.reconstruction.dims(), &[5, 6]);
        assert_eq!(out.acts.dims(), &[5, 12]);

        let acts: Vec<Vec<f32>> = out.acts.to_vec2().unwrap();
        assert!(acts.iter().flatten().all(|&a| a >= 0.0));

        let l1: f32 = out.l1_loss.to_scalar().unwrap();
        let expected_l1 = 0.01 * acts.iter().flatten().sum::<f32>();
        assert!((l1 - expected_l1).abs() < 1e-4);

        let total: f32 = out.loss.to_scalar().unwrap();
        let l2: f32 = out.l2_loss.to_scalar().unwrap();
        assert!((total - l2 - l1).abs() < 1e-4);
    }

    #[test]
    fn test_decoder_rows_start_unit_norm() {
        let encoder = AutoEncoder::new(4, 8, 0.0, 1, &Device::Cpu).unwrap();
        assert!(row_norms(encoder.w_dec()).iter().all(|n| (n - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_custom_forward_fixes_feature() {
        let encoder = AutoEncoder::new(4, 8, 0.0, 2, &Device::Cpu).unwrap();
        let x = Tensor::randn(0f32, 1f32, (3, 4), &Device::Cpu).unwrap();
        let out = encoder.custom_forward(&x, 5, 2.5).unwrap();
        let acts: Vec<Vec<f32>> = out.acts.to_vec2().unwrap();
        assert!(acts.iter().all(|row| row[5] == 2.5));
        assert!(encoder.custom_forward(&x, 8, 1.0).is_err());
    }

    #[test]
    fn test_reconstruct_keeps_shape() {
        let encoder = AutoEncoder::new(4, 8, 0.0, 3, &Device::Cpu).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 3, 4), &Device::Cpu).unwrap();
        assert_eq!(encoder.reconstruct(&x).unwrap().dims(), &[2, 3, 4]);
        assert_eq!(encoder.encode_any(&x).unwrap().dims(), &[2, 3, 8]);
    }

    #[test]
    fn test_parallel_grad_is_removed() {
        let encoder = AutoEncoder::new(4, 8, 0.1, 4, &Device::Cpu).unwrap();
        let x = Tensor::randn(0f32, 1f32, (16, 4), &Device::Cpu).unwrap();
        let mut grads = encoder.forward(&x).unwrap().loss.backward().unwrap();
        encoder.remove_parallel_decoder_grad(&mut grads).unwrap();

        let grad = grads.get(encoder.w_dec()).unwrap();
        let dots: Vec<f32> = (grad * encoder.w_dec())
            .unwrap()
            .sum(1)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(dots.iter().all(|d| d.abs() < 1e-4), "{dots:?}");
    }

    #[test]
    fn test_training_step_keeps_unit_decoder() {
        let encoder = AutoEncoder::new(4, 8, 0.01, 5, &Device::Cpu).unwrap();
        let mut optimizer = AdamW::new(
            encoder.vars(),
            ParamsAdamW {
                lr: 1e-2,
                weight_decay: 0.0,
                ..Default::default()
            },
        )
        .unwrap();
        let x = Tensor::randn(0f32, 1f32, (16, 4), &Device::Cpu).unwrap();
        let before = encoder.w_enc().to_vec2::<f32>().unwrap();
        let out = training_step(&encoder, &mut optimizer, &x).unwrap();
        assert!(out.loss.to_scalar::<f32>().unwrap().is_finite());
        assert_ne!(encoder.w_enc().to_vec2::<f32>().unwrap(), before);
        assert!(row_norms(encoder.w_dec()).iter().all(|n| (n - 1.0).abs() < 1e-4));
    }

    #[test]
    fn test_derived_values() {
        let cfg = SaeTrainingConfig::default().with_derived_values().unwrap();
        assert_eq!(cfg.model_batch_size, 512);
        assert_eq!(cfg.buffer_size, 4096 * 384);
        assert_eq!(cfg.buffer_batches, 12_288);
        assert_eq!(cfg.num_eval_batches, 195);

        let bad = SaeTrainingConfig {
            batch_size: 100,
            seq_len: 10,
            buffer_mult: 3,
            ..Default::default()
        };
        assert!(bad.with_derived_values().is_err());
    }

    #[test]
    fn test_cfg_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("override.json");
        std::fs::write(&path, r#"{"layer": 5, "l1_coeff": 0.5}"#).unwrap();
        let cfg = SaeTrainingConfig {
            cfg_file: Some(path),
            ..Default::default()
        }
        .with_derived_values()
        .unwrap();
        assert_eq!(cfg.layer, 5);
        assert_eq!(cfg.l1_coeff, 0.5);
        assert_eq!(cfg.seq_len, 128);
    }

    #[test]
    fn test_config_json_names() {
        let json = r#"{"layer": 3, "act": "mlp.hook_post", "expansion_factor": 4, "l1_coeff": 0.001}"#;
        let cfg: AutoEncoderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.reg, "l1");
        assert_eq!(cfg.d_in, None);
        assert_eq!(cfg.encoder_hook_point(), HookPoint::MlpPost(3));
        assert!(cfg.d_hidden().is_err());
    }

    #[test]
    fn test_d_in_from_act_name() {
        let model = tiny_model();
        assert_eq!(act_name_to_d_in(&model, "mlp.hook_post").unwrap(), 32);
        assert_eq!(act_name_to_d_in(&model, "hook_mlp_out").unwrap(), 16);
        assert!(act_name_to_d_in(&model, "hook_resid_pre").is_err());
    }

    #[test]
    fn test_save_and_load_fills_d_in() {
        let model = tiny_model();
        let dir = tempfile::tempdir().unwrap();
        let encoder = AutoEncoder::new(32, 64, 0.01, 6, &Device::Cpu).unwrap();
        let cfg = AutoEncoderConfig {
            layer: 1,
            act_name: "mlp.hook_post".to_string(),
            expansion_factor: 2,
            l1_coeff: 0.01,
            d_in: None,
            run_name: None,
            reg: "l1".to_string(),
        };
        encoder.save(dir.path().join("tiny-neox"), "enc", &cfg).unwrap();

        // Strip d_in so loading has to derive it
        let json_path = dir.path().join("tiny-neox").join("enc.json");
        let mut value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("d_in");
        value.as_object_mut().unwrap().remove("reg");
        std::fs::write(&json_path, value.to_string()).unwrap();

        let (loaded, loaded_cfg) = load_encoder("enc", "tiny-neox", &model, dir.path()).unwrap();
        assert_eq!(loaded_cfg.d_in, Some(32));
        assert_eq!(loaded_cfg.reg, "l1");
        assert_eq!(
            loaded.w_dec().to_vec2::<f32>().unwrap(),
            encoder.w_dec().to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_activation_buffer_batches() {
        let model = tiny_model();
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_training_config(dir.path());
        let mut buffer =
            ActivationBuffer::new(&model, HookPoint::MlpPost(1), token_rows(3, 9), &cfg).unwrap();
        for _ in 0..6 {
            assert_eq!(buffer.next_batch().unwrap().dims(), &[8, 32]);
        }
    }

    #[test]
    fn test_train_autoencoder_saves_encoder() {
        let model = tiny_model();
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_training_config(dir.path());
        let (encoder, summary) =
            train_autoencoder(&model, &cfg, token_rows(4, 9), &["der die das ist", "the house is"])
                .unwrap();
        assert_eq!(summary.steps, 2);
        assert_eq!(summary.reconstruction_losses.len(), 2);
        assert!(summary.final_loss.is_finite());
        assert_eq!(encoder.d_hidden(), 64);

        let (loaded, _) = load_encoder("tiny", "tiny-neox", &model, dir.path()).unwrap();
        assert_eq!(loaded.d_in(), 32);
    }
}
