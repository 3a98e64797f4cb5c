//! GPT-NeoX forward pass with hook points
//!
//! Pythia models are GPT-NeoX decoders:
//! - fused `query_key_value` projection with bias
//! - rotary embeddings on the first `rotary_pct` of each head
//! - parallel residual, `x + attn(ln1(x)) + mlp(ln2(x))`
//! - exact GELU MLP
//! - separate `embed_out` unembedding, centred over the vocabulary at load
//!   time so logits sum to zero at every position
//!
//! Every hook point in [`crate::hooks::HookPoint`] is applied and captured
//! on the way through, so interventions can be composed freely.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{embedding, linear, linear_no_bias, Embedding, Init, Linear, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::info;

use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::masks::create_causal_mask;
use crate::model::HaystackBackend;

/// Model configuration (matches HuggingFace config.json for GPT-NeoX)
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct NeoxConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rotary_pct")]
    pub rotary_pct: f64,
    #[serde(default = "default_rotary_emb_base")]
    pub rotary_emb_base: f64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_use_parallel_residual")]
    pub use_parallel_residual: bool,
}

fn default_rotary_pct() -> f64 {
    0.25
}

fn default_rotary_emb_base() -> f64 {
    10_000.0
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_use_parallel_residual() -> bool {
    true
}

impl NeoxConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Number of rotated dimensions per head
    pub fn rotary_dim(&self) -> usize {
        (self.head_dim() as f64 * self.rotary_pct) as usize
    }
}

/// LayerNorm with bias that can also expose its scale
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn load(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    /// Centred input and its scale `sqrt(var + eps)`, shape `[.., 1]`
    fn center_and_scale(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let centered = x.broadcast_sub(&x.mean_keepdim(D::Minus1)?)?;
        let scale = (centered.sqr()?.mean_keepdim(D::Minus1)? + self.eps)?.sqrt()?;
        Ok((centered, scale))
    }

    fn affine(&self, normalized: &Tensor) -> Result<Tensor> {
        Ok(normalized
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?)
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (centered, scale) = self.center_and_scale(x)?;
        self.affine(&centered.broadcast_div(&scale)?)
    }
}

/// NeoX rotary embeddings over the first `rotary_dim` channels of each head
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
    dim: usize,
}

impl RotaryEmbedding {
    fn new(dim: usize, max_seq_len: usize, base: f64, device: &Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| (1.0 / base.powf(i as f64 / dim as f64)) as f32)
            .collect();
        let n_freq = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, n_freq), device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::from_vec(positions, (max_seq_len, 1), device)?;

        // [seq_len, dim]: both halves share the same frequencies
        let freqs = positions.matmul(&inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok(Self {
            cos: emb.cos()?,
            sin: emb.sin()?,
            dim,
        })
    }

    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        if self.dim == 0 {
            return Ok(x.clone());
        }
        let (_b, _h, seq_len, head_dim) = x.dims4()?;
        let cos = self.cos.i(..seq_len)?.to_dtype(x.dtype())?;
        let sin = self.sin.i(..seq_len)?.to_dtype(x.dtype())?;

        let x_rot = x.narrow(D::Minus1, 0, self.dim)?;
        let rotated = x_rot
            .broadcast_mul(&cos)?
            .add(&rotate_half(&x_rot)?.broadcast_mul(&sin)?)?;

        if self.dim == head_dim {
            return Ok(rotated);
        }
        let x_pass = x.narrow(D::Minus1, self.dim, head_dim - self.dim)?;
        Ok(Tensor::cat(&[&rotated, &x_pass], D::Minus1)?)
    }
}

fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?)
}

/// Multi-head attention with fused QKV projection
struct Attention {
    query_key_value: Linear,
    dense: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &NeoxConfig) -> Result<Self> {
        let query_key_value = linear(
            config.hidden_size,
            3 * config.hidden_size,
            vb.pp("query_key_value"),
        )?;
        let dense = linear(config.hidden_size, config.hidden_size, vb.pp("dense"))?;
        Ok(Self {
            query_key_value,
            dense,
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;
        let hd = self.head_dim;

        // [b, s, heads, 3 * head_dim], split per head
        let qkv = self
            .query_key_value
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, 3 * hd))?;
        let q = qkv.narrow(D::Minus1, 0, hd)?.transpose(1, 2)?.contiguous()?;
        let k = qkv.narrow(D::Minus1, hd, hd)?.transpose(1, 2)?.contiguous()?;
        let v = qkv
            .narrow(D::Minus1, 2 * hd, hd)?
            .transpose(1, 2)?
            .contiguous()?;

        let q = rotary.apply(&q)?.contiguous()?;
        let k = rotary.apply(&k)?.contiguous()?;

        let scale = 1.0 / (hd as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let mask = create_causal_mask(seq_len, x.device(), x.dtype())?;
        let attn_weights = attn_weights.broadcast_add(&mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        let attn_output = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, ()))?;
        Ok(self.dense.forward(&attn_output)?)
    }
}

/// MLP block (GELU, with bias)
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    dense_h_to_4h: Linear,
    dense_4h_to_h: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &NeoxConfig) -> Result<Self> {
        let dense_h_to_4h = linear(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("dense_h_to_4h"),
        )?;
        let dense_4h_to_h = linear(
            config.intermediate_size,
            config.hidden_size,
            vb.pp("dense_4h_to_h"),
        )?;
        Ok(Self {
            dense_h_to_4h,
            dense_4h_to_h,
        })
    }
}

/// Single decoder layer
struct DecoderLayer {
    input_layernorm: LayerNorm,
    post_attention_layernorm: LayerNorm,
    attention: Attention,
    mlp: MLP,
    use_parallel_residual: bool,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &NeoxConfig) -> Result<Self> {
        Ok(Self {
            input_layernorm: LayerNorm::load(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: LayerNorm::load(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            attention: Attention::load(vb.pp("attention"), config)?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
            use_parallel_residual: config.use_parallel_residual,
        })
    }

    fn forward(
        &self,
        layer: usize,
        x: Tensor,
        rotary: &RotaryEmbedding,
        hooks: &HookSpec,
        captures: &mut HashMap<HookPoint, Tensor>,
    ) -> Result<Tensor> {
        let x = hooks.run_hook(HookPoint::ResidPre(layer), x, captures)?;

        let attn_out = self
            .attention
            .forward(&self.input_layernorm.forward(&x)?, rotary)?;
        let attn_out = hooks.run_hook(HookPoint::AttnOut(layer), attn_out, captures)?;

        let mlp_in = if self.use_parallel_residual {
            self.post_attention_layernorm.forward(&x)?
        } else {
            self.post_attention_layernorm.forward(&(&x + &attn_out)?)?
        };

        let pre = self.mlp.dense_h_to_4h.forward(&mlp_in)?;
        let pre = hooks.run_hook(HookPoint::MlpPre(layer), pre, captures)?;
        let post = pre.gelu_erf()?;
        let post = hooks.run_hook(HookPoint::MlpPost(layer), post, captures)?;
        let mlp_out = self.mlp.dense_4h_to_h.forward(&post)?;
        let mlp_out = hooks.run_hook(HookPoint::MlpOut(layer), mlp_out, captures)?;

        let x = ((x + attn_out)? + mlp_out)?;
        hooks.run_hook(HookPoint::ResidPost(layer), x, captures)
    }
}

/// Subtract the vocabulary mean from every `d_model` column of `[vocab, d_model]`
///
/// Softmax is unchanged; only the per-position logit offset is removed.
pub fn center_unembed(weight: &Tensor) -> Result<Tensor> {
    Ok(weight.broadcast_sub(&weight.mean_keepdim(0)?)?)
}

/// GPT-NeoX model with hook points at every layer
pub struct HaystackNeox {
    embed_in: Embedding,
    layers: Vec<DecoderLayer>,
    final_layer_norm: LayerNorm,
    embed_out: Linear,
    rotary: RotaryEmbedding,
    config: NeoxConfig,
}

impl HaystackNeox {
    /// Load model from HuggingFace at a given revision (`None` = main)
    pub fn load(
        model_id: &str,
        revision: Option<&str>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let revision = revision.unwrap_or("main");
        info!("Loading GPT-NeoX from: {} @ {}", model_id, revision);

        let (config_path, weights_path) = fetch_model_files(model_id, revision)?;

        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: NeoxConfig =
            serde_json::from_str(&config_str).context("Failed to parse config.json")?;

        info!(
            "Model config: {} layers, {} hidden, {} mlp, {} vocab",
            config.num_hidden_layers,
            config.hidden_size,
            config.intermediate_size,
            config.vocab_size
        );

        let vb = match weights_path {
            WeightsFile::Safetensors(path) => unsafe {
                VarBuilder::from_mmaped_safetensors(&[path], dtype, device)?
            },
            WeightsFile::Pth(path) => VarBuilder::from_pth(&path, dtype, device)?,
        };

        let model = Self::from_vb(vb, config)?;
        info!(
            "Model loaded successfully with {} layers (vocab_size: {})",
            model.config.num_hidden_layers, model.config.vocab_size
        );
        Ok(model)
    }

    /// Build the model from a weight source
    ///
    /// Expects the HuggingFace layout: `gpt_neox.*` for the body and
    /// `embed_out` for the unembedding.
    pub fn from_vb(vb: VarBuilder, config: NeoxConfig) -> Result<Self> {
        let vb_body = vb.pp("gpt_neox");

        let embed_in = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_body.pp("embed_in"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(DecoderLayer::load(vb_body.pp(format!("layers.{i}")), &config)?);
        }

        let final_layer_norm = LayerNorm::load(
            config.hidden_size,
            config.layer_norm_eps,
            vb_body.pp("final_layer_norm"),
        )?;
        let embed_out = linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("embed_out"))?;
        let embed_out = Linear::new(center_unembed(embed_out.weight())?, None);

        let rotary = RotaryEmbedding::new(
            config.rotary_dim(),
            config.max_position_embeddings,
            config.rotary_emb_base,
            vb.device(),
        )?;

        Ok(Self {
            embed_in,
            layers,
            final_layer_norm,
            embed_out,
            rotary,
            config,
        })
    }

    pub fn config(&self) -> &NeoxConfig {
        &self.config
    }

    /// Forward pass applying `hooks`, returning logits and captures
    pub fn forward_with_hooks(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let seq_len = input_ids.dim(1)?;
        anyhow::ensure!(
            seq_len <= self.config.max_position_embeddings,
            "Sequence length {seq_len} exceeds context length {}",
            self.config.max_position_embeddings
        );

        let mut captures = HashMap::new();

        let embed = self.embed_in.forward(input_ids)?;
        let mut hidden = hooks.run_hook(HookPoint::Embed, embed, &mut captures)?;

        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(i, hidden, &self.rotary, hooks, &mut captures)?;
        }

        let (centered, scale) = self.final_layer_norm.center_and_scale(&hidden)?;
        let scale = hooks.run_hook(HookPoint::LnFinalScale, scale, &mut captures)?;
        let normalized = centered.broadcast_div(&scale)?;
        let normalized = hooks.run_hook(HookPoint::LnFinalNormalized, normalized, &mut captures)?;
        let output = self.final_layer_norm.affine(&normalized)?;

        let logits = self.embed_out.forward(&output)?;
        Ok(HookCache::new(logits, captures))
    }
}

impl HaystackBackend for HaystackNeox {
    fn n_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    fn d_model(&self) -> usize {
        self.config.hidden_size
    }

    fn d_mlp(&self) -> usize {
        self.config.intermediate_size
    }

    fn n_heads(&self) -> usize {
        self.config.num_attention_heads
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn max_positions(&self) -> usize {
        self.config.max_position_embeddings
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        self.forward_with_hooks(input_ids, hooks)
    }

    fn unembed_weight(&self) -> Result<Tensor> {
        Ok(self.embed_out.weight().clone())
    }

    fn final_norm_weight(&self) -> Result<Tensor> {
        Ok(self.final_layer_norm.weight.clone())
    }

    fn mlp_out_weight(&self, layer: usize) -> Result<Tensor> {
        let layer = self
            .layers
            .get(layer)
            .ok_or_else(|| anyhow::anyhow!("Layer {layer} out of range"))?;
        Ok(layer.mlp.dense_4h_to_h.weight().clone())
    }
}

enum WeightsFile {
    Safetensors(PathBuf),
    Pth(PathBuf),
}

/// Download `config.json` and the weights for a model revision
fn fetch_model_files(model_id: &str, revision: &str) -> Result<(PathBuf, WeightsFile)> {
    let api = Api::new()?;
    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    let config_path = repo
        .get("config.json")
        .with_context(|| format!("Failed to download config.json for {model_id}@{revision}"))?;

    // Older checkpoints only ship PyTorch weights
    let weights = match repo.get("model.safetensors") {
        Ok(path) => WeightsFile::Safetensors(path),
        Err(_) => {
            info!("No model.safetensors at {revision}, falling back to pytorch_model.bin");
            let path = repo.get("pytorch_model.bin").with_context(|| {
                format!("Failed to download weights for {model_id}@{revision}")
            })?;
            WeightsFile::Pth(path)
        }
    };

    Ok((config_path, weights))
}

/// Download every file a revision needs without building the model
pub fn prefetch(model_id: &str, revision: &str) -> Result<()> {
    fetch_model_files(model_id, revision).map(|_| ())
}
