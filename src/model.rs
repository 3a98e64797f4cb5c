//! HaystackModel wrapper: tokenizer, hooked forward passes and losses
//!
//! Tokenisation follows TransformerLens conventions: every prompt gets a
//! BOS token, batches are right-padded with EOS, and losses are next-token
//! cross-entropies over `seq - 1` positions.

use std::ops::Range;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

use crate::checkpoints::{checkpoint_revision, CheckpointOutOfRange};
use crate::forward_neox::HaystackNeox;
use crate::hooks::{resolve_position, HookCache, HookPoint, HookSpec};

/// Token used as BOS, EOS and padding by the Pythia tokenizer
pub const ENDOFTEXT: &str = "<|endoftext|>";

/// Backend trait for hooked transformer implementations.
///
/// A backend runs a forward pass under a [`HookSpec`] and exposes the
/// weights needed for direct logit attribution.
pub trait HaystackBackend {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn d_mlp(&self) -> usize;
    fn n_heads(&self) -> usize;
    fn vocab_size(&self) -> usize;
    /// Context length
    fn max_positions(&self) -> usize;

    // --- Forward pass ---
    /// `input_ids` is `[batch, seq]`; logits are `[batch, seq, vocab]`
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    // --- Weights ---
    /// Unembedding matrix, `[vocab, d_model]`
    fn unembed_weight(&self) -> Result<Tensor>;
    /// Final layer norm weight, `[d_model]`
    fn final_norm_weight(&self) -> Result<Tensor>;
    /// MLP output projection of a layer, `[d_model, d_mlp]`
    fn mlp_out_weight(&self, layer: usize) -> Result<Tensor>;
}

/// Pick CUDA when available unless CPU is forced
pub fn select_device(force_cpu: Option<bool>) -> Device {
    if force_cpu == Some(true) {
        info!("Forcing CPU mode");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            dev
        }
        _ => {
            info!("CUDA not available, using CPU");
            Device::Cpu
        }
    }
}

/// High-level model wrapper for the analyses in this crate
pub struct HaystackModel {
    backend: Box<dyn HaystackBackend>,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
    revision: Option<String>,
    bos_token_id: u32,
    eos_token_id: u32,
}

impl HaystackModel {
    /// Load the final model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        Self::from_pretrained_with_device(model_id, None)
    }

    /// Load with explicit device choice (None = auto-detect)
    pub fn from_pretrained_with_device(model_id: &str, force_cpu: Option<bool>) -> Result<Self> {
        Self::load_revision(model_id, None, force_cpu)
    }

    /// Load a training checkpoint by index (None = final model)
    ///
    /// An index past the last checkpoint fails with [`CheckpointOutOfRange`].
    pub fn from_checkpoint(
        model_id: &str,
        checkpoint: Option<usize>,
        force_cpu: Option<bool>,
    ) -> Result<Self> {
        let revision = match checkpoint {
            None => None,
            Some(index) => Some(
                checkpoint_revision(model_id, index)?
                    .ok_or_else(|| CheckpointOutOfRange::new(model_id, index))?,
            ),
        };
        Self::load_revision(model_id, revision.as_deref(), force_cpu)
    }

    fn load_revision(
        model_id: &str,
        revision: Option<&str>,
        force_cpu: Option<bool>,
    ) -> Result<Self> {
        let device = select_device(force_cpu);

        info!("Loading model: {}", model_id);
        info!("Revision: {}", revision.unwrap_or("main"));
        info!("Device: {:?}", device);

        // Checkpoint revisions share the tokenizer of the main branch
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let backend = HaystackNeox::load(model_id, revision, &device, DType::F32)?;

        let mut model = Self::from_parts(Box::new(backend), tokenizer, device, model_id)?;
        model.revision = revision.map(str::to_string);
        Ok(model)
    }

    /// Assemble a model from an already-built backend and tokenizer
    pub fn from_parts(
        backend: Box<dyn HaystackBackend>,
        tokenizer: Tokenizer,
        device: Device,
        model_id: &str,
    ) -> Result<Self> {
        let endoftext = tokenizer
            .token_to_id(ENDOFTEXT)
            .ok_or_else(|| anyhow::anyhow!("Tokenizer has no {ENDOFTEXT} token"))?;
        Ok(Self {
            backend,
            tokenizer,
            device,
            model_id: model_id.to_string(),
            revision: None,
            bos_token_id: endoftext,
            eos_token_id: endoftext,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Hub revision the weights came from, if not main
    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn backend(&self) -> &dyn HaystackBackend {
        self.backend.as_ref()
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn n_layers(&self) -> usize {
        self.backend.n_layers()
    }

    pub fn d_model(&self) -> usize {
        self.backend.d_model()
    }

    pub fn d_mlp(&self) -> usize {
        self.backend.d_mlp()
    }

    pub fn n_heads(&self) -> usize {
        self.backend.n_heads()
    }

    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    pub fn max_positions(&self) -> usize {
        self.backend.max_positions()
    }

    pub fn bos_token_id(&self) -> u32 {
        self.bos_token_id
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    // --- Tokenisation ---

    /// Token ids of `text` without BOS
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Token ids with BOS prepended, truncated to the context length
    pub fn to_token_ids(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = vec![self.bos_token_id];
        ids.extend(self.encode(text)?);
        ids.truncate(self.max_positions());
        Ok(ids)
    }

    /// `[1, seq]` token tensor with BOS
    pub fn to_tokens(&self, text: &str) -> Result<Tensor> {
        let ids = self.to_token_ids(text)?;
        self.tokens_tensor(&ids)
    }

    /// `[batch, max_seq]` token tensor, right-padded with EOS
    pub fn to_tokens_batch<S: AsRef<str>>(&self, texts: &[S]) -> Result<Tensor> {
        anyhow::ensure!(!texts.is_empty(), "Cannot tokenize an empty batch");
        let rows = texts
            .iter()
            .map(|t| self.to_token_ids(t.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let max_len = rows.iter().map(Vec::len).max().unwrap_or(0);

        let mut flat = Vec::with_capacity(rows.len() * max_len);
        for row in &rows {
            flat.extend_from_slice(row);
            flat.extend(std::iter::repeat(self.eos_token_id).take(max_len - row.len()));
        }
        Ok(Tensor::from_vec(flat, (rows.len(), max_len), &self.device)?)
    }

    /// `[1, n]` tensor from raw ids
    pub fn tokens_tensor(&self, ids: &[u32]) -> Result<Tensor> {
        Ok(Tensor::new(ids, &self.device)?.unsqueeze(0)?)
    }

    /// Decoded string of each token, BOS included
    pub fn to_str_tokens(&self, text: &str) -> Result<Vec<String>> {
        Ok(self
            .to_token_ids(text)?
            .iter()
            .map(|&id| self.decode_token(id))
            .collect())
    }

    /// Id of a string that must encode to exactly one token
    pub fn to_single_token(&self, text: &str) -> Result<u32> {
        let ids = self.encode(text)?;
        match ids.as_slice() {
            [id] => Ok(*id),
            _ => anyhow::bail!("`{text}` is {} tokens, expected exactly one", ids.len()),
        }
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, false)
            .map_err(|e| anyhow::anyhow!("Decoding error: {e}"))
    }

    /// Decode a token ID to string
    pub fn decode_token(&self, token_id: u32) -> String {
        self.tokenizer
            .decode(&[token_id], false)
            .unwrap_or_else(|_| format!("<{token_id}>"))
    }

    // --- Forward passes ---

    /// Run `[batch, seq]` tokens under `hooks`
    pub fn run_with_hooks(&self, tokens: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        self.backend.forward(tokens, hooks)
    }

    /// Logits `[batch, seq, vocab]`
    pub fn logits(&self, tokens: &Tensor, hooks: &HookSpec) -> Result<Tensor> {
        Ok(self.run_with_hooks(tokens, hooks)?.into_logits())
    }

    /// Run a prompt (BOS prepended) under `hooks`
    pub fn run_prompt(&self, text: &str, hooks: &HookSpec) -> Result<HookCache> {
        let tokens = self.to_tokens(text)?;
        self.run_with_hooks(&tokens, hooks)
    }

    // --- Losses ---

    /// Next-token loss per position, `[batch, seq - 1]`
    pub fn loss_per_token(&self, tokens: &Tensor, hooks: &HookSpec) -> Result<Tensor> {
        let logits = self.logits(tokens, hooks)?;
        cross_entropy_per_token(&logits, tokens)
    }

    /// Mean next-token loss
    pub fn loss(&self, tokens: &Tensor, hooks: &HookSpec) -> Result<f32> {
        Ok(self
            .loss_per_token(tokens, hooks)?
            .mean_all()?
            .to_scalar::<f32>()?)
    }

    /// Batch-mean loss at one column of the per-token loss (negative counts from the end)
    pub fn loss_at(&self, tokens: &Tensor, hooks: &HookSpec, position: isize) -> Result<f32> {
        let per_token = self.loss_per_token(tokens, hooks)?;
        loss_column(&per_token, position)
    }

    /// Mean loss of a single prompt
    pub fn prompt_loss(&self, text: &str, hooks: &HookSpec) -> Result<f32> {
        let tokens = self.to_tokens(text)?;
        self.loss(&tokens, hooks)
    }

    // --- Generation ---

    /// Greedy continuation of `prompt`; hooks apply at every step
    pub fn generate(&self, prompt: &str, max_new_tokens: usize, hooks: &HookSpec) -> Result<String> {
        let mut ids = self.to_token_ids(prompt)?;
        for _ in 0..max_new_tokens {
            if ids.len() >= self.max_positions() {
                break;
            }
            let logits = self.logits(&self.tokens_tensor(&ids)?, hooks)?;
            let last = logits.i((0, ids.len() - 1))?;
            let next = argmax(&last)?;
            ids.push(next);
            if next == self.eos_token_id {
                break;
            }
        }
        self.decode(&ids[1..])
    }

    // --- Activations ---

    /// `mlp.hook_post` rows of `layer` at `positions` of each prompt, `[rows, d_mlp]`
    ///
    /// Prompts shorter than the window contribute whatever positions they have.
    pub fn mlp_activations<S: AsRef<str>>(
        &self,
        prompts: &[S],
        layer: usize,
        positions: Range<usize>,
    ) -> Result<Tensor> {
        self.hook_activations(prompts, &HookPoint::MlpPost(layer), positions, &HookSpec::new())
    }

    /// Rows of any captured hook at `positions` of each prompt, under extra hooks
    pub fn hook_activations<S: AsRef<str>>(
        &self,
        prompts: &[S],
        hook: &HookPoint,
        positions: Range<usize>,
        hooks: &HookSpec,
    ) -> Result<Tensor> {
        let spec = hooks.clone().with_capture(hook.clone());
        let mut rows = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let tokens = self.to_tokens(prompt.as_ref())?;
            let seq_len = tokens.dim(1)?;
            let end = positions.end.min(seq_len);
            if positions.start >= end {
                continue;
            }
            let cache = self.run_with_hooks(&tokens, &spec)?;
            let acts = cache.require_f32(hook)?;
            rows.push(acts.i((0, positions.start..end))?);
        }
        anyhow::ensure!(
            !rows.is_empty(),
            "No prompt reached position {} for {hook}",
            positions.start
        );
        Ok(Tensor::cat(&rows, 0)?)
    }
}

/// Cross-entropy of each next token, `[batch, seq - 1]`
pub fn cross_entropy_per_token(logits: &Tensor, tokens: &Tensor) -> Result<Tensor> {
    let (_b, seq_len, _v) = logits.dims3()?;
    anyhow::ensure!(seq_len >= 2, "Need at least two tokens to compute a loss");

    let log_probs = candle_nn::ops::log_softmax(
        &logits.narrow(1, 0, seq_len - 1)?.to_dtype(DType::F32)?,
        D::Minus1,
    )?;
    let targets = tokens
        .narrow(1, 1, seq_len - 1)?
        .to_dtype(DType::U32)?
        .unsqueeze(2)?
        .contiguous()?;
    Ok(log_probs.gather(&targets, 2)?.squeeze(2)?.neg()?)
}

/// Batch mean of one column of a `[batch, seq]` loss tensor
pub fn loss_column(per_token: &Tensor, position: isize) -> Result<f32> {
    let pos = resolve_position(position, per_token.dim(1)?)?;
    Ok(per_token.i((.., pos))?.mean_all()?.to_scalar::<f32>()?)
}

/// Argmax over a 1-D logit vector
pub fn argmax(logits: &Tensor) -> Result<u32> {
    let logits: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let (max_idx, _) = logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| anyhow::anyhow!("Empty logits"))?;
    Ok(max_idx as u32)
}


#[cfg(test)]
mod tests {
    use super::test_utils::tiny_model;
    use super::*;
    use crate::hooks::Intervention;

    #[test]
    fn test_to_tokens_prepends_bos() {
        let model = tiny_model();
        let ids = model.to_token_ids("das Haus ist ein Haus").unwrap();
        assert_eq!(ids, vec![0, 4, 11, 6, 13, 11]);
        assert_eq!(
            model.to_str_tokens("der und").unwrap(),
            vec!["<|endoftext|>", "der", "und"]
        );
    }

    #[test]
    fn test_to_tokens_truncates_to_context() {
        let model = tiny_model();
        let long = vec!["der"; 100].join(" ");
        assert_eq!(model.to_token_ids(&long).unwrap().len(), model.max_positions());
    }

    #[test]
    fn test_batch_is_right_padded_with_eos() {
        let model = tiny_model();
        let batch = model.to_tokens_batch(&["der", "the house is"]).unwrap();
        let rows: Vec<Vec<u32>> = batch.to_vec2().unwrap();
        assert_eq!(rows[0], vec![0, 2, 0, 0]);
        assert_eq!(rows[1], vec![0, 7, 12, 8]);
    }

    #[test]
    fn test_single_token() {
        let model = tiny_model();
        assert_eq!(model.to_single_token("Haus").unwrap(), 11);
        assert!(model.to_single_token("das Haus").is_err());
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let tokens = Tensor::new(&[[0u32, 1, 2]], &Device::Cpu).unwrap();
        let loss: Vec<Vec<f32>> = cross_entropy_per_token(&logits, &tokens)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(loss[0].len(), 2);
        for v in &loss[0] {
            assert!((v - 4f32.ln()).abs() < 1e-5);
        }
    }

    #[test]
    fn test_loss_column() {
        let per_token = Tensor::new(&[[1f32, 2., 3.], [3., 4., 5.]], &Device::Cpu).unwrap();
        assert_eq!(loss_column(&per_token, -1).unwrap(), 4.0);
        assert_eq!(loss_column(&per_token, 0).unwrap(), 2.0);
        assert!(loss_column(&per_token, 3).is_err());
    }

    #[test]
    fn test_losses_are_consistent() {
        let model = tiny_model();
        let tokens = model.to_tokens("das Haus ist ein Haus").unwrap();
        let per_token = model.loss_per_token(&tokens, &HookSpec::new()).unwrap();
        assert_eq!(per_token.dims(), &[1, 5]);

        let mean = model.loss(&tokens, &HookSpec::new()).unwrap();
        let manual = per_token.mean_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((mean - manual).abs() < 1e-5);
        assert!(mean > 0.0);

        let prompt = model
            .prompt_loss("das Haus ist ein Haus", &HookSpec::new())
            .unwrap();
        assert!((prompt - mean).abs() < 1e-5);
    }

    #[test]
    fn test_generate_is_greedy_and_deterministic() {
        let model = tiny_model();
        let a = model.generate("der", 3, &HookSpec::new()).unwrap();
        let b = model.generate("der", 3, &HookSpec::new()).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("der"));
    }

    #[test]
    fn test_mlp_activations_window() {
        let model = tiny_model();
        let prompts = ["das Haus ist ein Haus", "der"];
        let acts = model.mlp_activations(&prompts, 1, 2..10).unwrap();
        // Only the first prompt reaches position 2 (6 tokens with BOS)
        assert_eq!(acts.dims(), &[4, model.d_mlp()]);
        assert!(model.mlp_activations(&["der"], 0, 5..10).is_err());
    }

    #[test]
    fn test_hook_activations_see_interventions() {
        let model = tiny_model();
        let hooks =
            HookSpec::new().with_intervention(HookPoint::MlpPost(0), Intervention::set_neuron(3, 7.0));
        let acts = model
            .hook_activations(&["der die das"], &HookPoint::MlpPost(0), 0..4, &hooks)
            .unwrap();
        let column: Vec<f32> = acts.i((.., 3)).unwrap().to_vec1().unwrap();
        assert!(column.iter().all(|&v| v == 7.0));
    }
}
