//! Llama-family decoder for native candle inference.
//!
//! Covers the checkpoints sharing the pre-norm RMSNorm / rotary / SwiGLU
//! layout: `llama`, `mistral`, `qwen2` (biased q/k/v projections) and
//! `qwen3` (per-head q/k RMSNorm). Unlike the stock candle-transformers
//! models, `forward` returns logits for every position, which likelihood
//! scoring needs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{ops, Dropout, Embedding, Linear, RmsNorm, VarBuilder};
use serde::Deserialize;
use tracing::{info, warn};

use super::{greedy_generate, CausalLm, GenerationParams, LoadOptions};
use crate::device::DeviceSpec;
use crate::error::{Error, Result};
use crate::hub::{CheckpointConfig, CheckpointLocator, HubLoader};
use crate::length::ContextConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderFlavor {
    #[default]
    Llama,
    Qwen2,
    Qwen3,
}

impl DecoderFlavor {
    pub fn from_model_type(model_type: &str) -> Option<Self> {
        match model_type {
            "llama" | "mistral" => Some(Self::Llama),
            "qwen2" => Some(Self::Qwen2),
            "qwen3" => Some(Self::Qwen3),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default)]
    pub attention_dropout: f32,
    #[serde(skip)]
    pub flavor: DecoderFlavor,
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10_000.0
}

impl DecoderConfig {
    pub fn from_checkpoint(config: &CheckpointConfig) -> Result<Self> {
        let model_type = config.model_type.as_deref().unwrap_or("llama");
        let flavor = DecoderFlavor::from_model_type(model_type).ok_or_else(|| {
            Error::LoadFailure(format!(
                "Unsupported model_type '{model_type}' (architectures: {:?})",
                config.architectures
            ))
        })?;
        let mut cfg: DecoderConfig = serde_json::from_value(config.raw.clone())
            .map_err(|e| Error::load("Parsing decoder config", e))?;
        cfg.flavor = flavor;
        Ok(cfg)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    fn qkv_bias(&self) -> bool {
        self.attention_bias || self.flavor == DecoderFlavor::Qwen2
    }
}

/// Per-layer key/value cache used while decoding.
struct DecoderCache {
    kv: Vec<Option<(Tensor, Tensor)>>,
}

impl DecoderCache {
    fn new(num_layers: usize) -> Self {
        Self {
            kv: vec![None; num_layers],
        }
    }

    fn append(&mut self, layer: usize, k: Tensor, v: Tensor) -> Result<(Tensor, Tensor)> {
        let (k, v) = match &self.kv[layer] {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, &k], 2)?,
                Tensor::cat(&[prev_v, &v], 2)?,
            ),
            None => (k, v),
        };
        self.kv[layer] = Some((k.clone(), v.clone()));
        Ok((k, v))
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: Option<RmsNorm>,
    k_norm: Option<RmsNorm>,
    dropout: Dropout,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    rope_theta: f64,
}

impl Attention {
    fn load(cfg: &DecoderConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let head_dim = cfg.head_dim();
        let num_kv_heads = cfg.num_kv_heads();
        let proj = |out: usize, name: &str| {
            if cfg.qkv_bias() {
                candle_nn::linear(cfg.hidden_size, out, vb.pp(name))
            } else {
                candle_nn::linear_no_bias(cfg.hidden_size, out, vb.pp(name))
            }
        };
        let q_proj = proj(cfg.num_attention_heads * head_dim, "q_proj")?;
        let k_proj = proj(num_kv_heads * head_dim, "k_proj")?;
        let v_proj = proj(num_kv_heads * head_dim, "v_proj")?;
        let o_proj = candle_nn::linear_no_bias(
            cfg.num_attention_heads * head_dim,
            cfg.hidden_size,
            vb.pp("o_proj"),
        )?;

        let (q_norm, k_norm) = if cfg.flavor == DecoderFlavor::Qwen3 {
            (
                Some(candle_nn::rms_norm(head_dim, cfg.rms_norm_eps, vb.pp("q_norm"))?),
                Some(candle_nn::rms_norm(head_dim, cfg.rms_norm_eps, vb.pp("k_norm"))?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            q_norm,
            k_norm,
            dropout: Dropout::new(cfg.attention_dropout),
            num_heads: cfg.num_attention_heads,
            num_kv_heads,
            head_dim,
            rope_theta: cfg.rope_theta,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        start_pos: usize,
        cache: Option<&mut DecoderCache>,
        layer_idx: usize,
        train: bool,
    ) -> Result<Tensor> {
        let (bsz, seq_len, _) = x.dims3()?;

        // [b, s, h * d] -> [b, h, s, d]
        let split_heads = |t: Tensor, heads: usize| -> candle_core::Result<Tensor> {
            t.reshape((bsz, seq_len, heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let mut q = split_heads(self.q_proj.forward(x)?, self.num_heads)?;
        let mut k = split_heads(self.k_proj.forward(x)?, self.num_kv_heads)?;
        let v = split_heads(self.v_proj.forward(x)?, self.num_kv_heads)?;

        if let Some(norm) = &self.q_norm {
            q = norm.forward(&q)?;
        }
        if let Some(norm) = &self.k_norm {
            k = norm.forward(&k)?;
        }

        let (cos, sin) = rope_tables(
            seq_len,
            self.head_dim,
            start_pos,
            self.rope_theta,
            x.device(),
            q.dtype(),
        )?;
        let q = candle_nn::rotary_emb::rope(&q, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k, &cos, &sin)?;

        let (k, v) = match cache {
            Some(cache) => cache.append(layer_idx, k, v)?,
            None => (k, v),
        };
        let total_len = k.dim(2)?;

        let repeats = self.num_heads / self.num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, repeats)?.contiguous()?;
        let v = candle_transformers::utils::repeat_kv(v, repeats)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut att = (q.matmul(&k.t()?)? * scale)?;
        if seq_len > 1 {
            let mask = causal_mask(seq_len, total_len, start_pos, x.device(), att.dtype())?;
            att = att.broadcast_add(&mask)?;
        }
        let att = ops::softmax_last_dim(&att)?;
        let att = self.dropout.forward(&att, train)?;

        let out = att
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((bsz, seq_len, self.num_heads * self.head_dim))?;
        Ok(self.o_proj.forward(&out)?)
    }
}

struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn load(cfg: &DecoderConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            gate_proj: candle_nn::linear_no_bias(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("gate_proj"),
            )?,
            up_proj: candle_nn::linear_no_bias(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("up_proj"),
            )?,
            down_proj: candle_nn::linear_no_bias(
                cfg.intermediate_size,
                cfg.hidden_size,
                vb.pp("down_proj"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = ops::silu(&self.gate_proj.forward(x)?)?;
        let hidden = (gate * self.up_proj.forward(x)?)?;
        Ok(self.down_proj.forward(&hidden)?)
    }
}

struct Layer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl Layer {
    fn load(cfg: &DecoderConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            input_layernorm: candle_nn::rms_norm(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            self_attn: Attention::load(cfg, vb.pp("self_attn"))?,
            post_attention_layernorm: candle_nn::rms_norm(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::load(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        start_pos: usize,
        cache: Option<&mut DecoderCache>,
        layer_idx: usize,
        train: bool,
    ) -> Result<Tensor> {
        let normed = self.input_layernorm.forward(x)?;
        let attn_out = self
            .self_attn
            .forward(&normed, start_pos, cache, layer_idx, train)?;
        let x = (x + attn_out)?;
        let normed = self.post_attention_layernorm.forward(&x)?;
        let mlp_out = self.mlp.forward(&normed)?;
        Ok((x + mlp_out)?)
    }
}

pub struct DecoderModel {
    name_or_path: String,
    embed_tokens: Embedding,
    layers: Vec<Layer>,
    norm: RmsNorm,
    lm_head: Linear,
    device: Device,
    dtype: DType,
    context: ContextConfig,
    training: AtomicBool,
}

impl DecoderModel {
    /// Build the network from a variable builder.
    ///
    /// Like any freshly built module it starts in training mode.
    pub fn load(
        name_or_path: impl Into<String>,
        cfg: &DecoderConfig,
        context: ContextConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::load_inner(name_or_path.into(), cfg, context, vb)
            .map_err(|e| Error::load("Building decoder weights", e))
    }

    fn load_inner(
        name_or_path: String,
        cfg: &DecoderConfig,
        context: ContextConfig,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let embed_tokens =
            candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("model.embed_tokens"))?;
        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?
        };
        let layers = (0..cfg.num_hidden_layers)
            .map(|idx| Layer::load(cfg, vb.pp(format!("model.layers.{idx}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let norm = candle_nn::rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("model.norm"))?;

        Ok(Self {
            name_or_path,
            embed_tokens,
            layers,
            norm,
            lm_head,
            device: vb.device().clone(),
            dtype: vb.dtype(),
            context,
            training: AtomicBool::new(true),
        })
    }

    /// Resolve, fetch and load a checkpoint onto `device`.
    pub fn from_pretrained(
        hub: &HubLoader,
        locator: &CheckpointLocator,
        device: &DeviceSpec,
        options: &LoadOptions,
    ) -> Result<Self> {
        let config = CheckpointConfig::load(hub, locator)?;
        config.check_remote_code(&locator.identifier, options.trust_remote_code)?;
        let decoder_cfg = DecoderConfig::from_checkpoint(&config)?;

        let dtype = options.precision.select_dtype(
            config.torch_dtype.as_deref(),
            device,
            options.load_in_8bit,
        );
        let candle_device = device.to_candle()?;
        let weights = hub.fetch_safetensors(locator)?;
        let vb = weights_builder(&weights, dtype, &candle_device, options.low_cpu_mem_usage)?;

        let model = Self::load(locator.identifier.clone(), &decoder_cfg, config.context, vb)?;
        info!(
            "Loaded {:?} decoder {} ({} layers, {:?}) on {}",
            decoder_cfg.flavor,
            locator.identifier,
            decoder_cfg.num_hidden_layers,
            dtype,
            device
        );
        Ok(model)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn forward_from(
        &self,
        input_ids: &Tensor,
        start_pos: usize,
        mut cache: Option<&mut DecoderCache>,
    ) -> Result<Tensor> {
        let train = self.is_training();
        let mut x = self.embed_tokens.forward(input_ids)?;
        for (idx, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x, start_pos, cache.as_deref_mut(), idx, train)?;
        }
        let x = self.norm.forward(&x)?;
        Ok(self.lm_head.forward(&x)?)
    }
}

impl CausalLm for DecoderModel {
    fn name_or_path(&self) -> &str {
        &self.name_or_path
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn context_config(&self) -> ContextConfig {
        self.context
    }

    fn eval(&self) {
        self.training.store(false, Ordering::Release);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::Acquire)
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.forward_from(input_ids, 0, None)
    }

    fn generate(&self, context: &Tensor, params: &GenerationParams) -> Result<Tensor> {
        let mut cache = DecoderCache::new(self.layers.len());
        greedy_generate(context, params, |sequence, processed| {
            let len = sequence.dim(1)?;
            let fresh = sequence.narrow(1, processed, len - processed)?;
            let logits = self.forward_from(&fresh, processed, Some(&mut cache))?;
            Ok(logits.i((.., len - processed - 1, ..))?)
        })
    }
}

fn weights_builder(
    files: &[PathBuf],
    dtype: DType,
    device: &Device,
    low_cpu_mem_usage: bool,
) -> Result<VarBuilder<'static>> {
    if low_cpu_mem_usage {
        // SAFETY: the checkpoint files are not modified while mapped.
        return unsafe { VarBuilder::from_mmaped_safetensors(files, dtype, device) }
            .map_err(|e| Error::load("Memory-mapping safetensors", e));
    }

    let mut tensors = std::collections::HashMap::new();
    for file in files {
        let loaded = candle_core::safetensors::load(file, device)
            .map_err(|e| Error::load(format!("Reading {:?}", file), e))?;
        tensors.extend(loaded);
    }
    if tensors.is_empty() {
        warn!("Checkpoint contains no tensors");
    }
    Ok(VarBuilder::from_tensors(tensors, dtype, device))
}

fn rope_tables(
    seq_len: usize,
    head_dim: usize,
    start_pos: usize,
    rope_theta: f64,
    device: &Device,
    dtype: DType,
) -> candle_core::Result<(Tensor, Tensor)> {
    let inv_freq: Vec<f32> = (0..head_dim / 2)
        .map(|i| (1.0 / rope_theta.powf(2.0 * i as f64 / head_dim as f64)) as f32)
        .collect();
    let mut angles = Vec::with_capacity(seq_len * inv_freq.len());
    for pos in start_pos..start_pos + seq_len {
        angles.extend(inv_freq.iter().map(|inv| pos as f32 * inv));
    }
    let angles = Tensor::from_vec(angles, (seq_len, head_dim / 2), device)?;
    Ok((angles.cos()?.to_dtype(dtype)?, angles.sin()?.to_dtype(dtype)?))
}

fn causal_mask(
    seq_len: usize,
    total_len: usize,
    start_pos: usize,
    device: &Device,
    dtype: DType,
) -> candle_core::Result<Tensor> {
    let data: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| {
                if j > start_pos + i {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Tensor::from_vec(data, (1, 1, seq_len, total_len), device)?.to_dtype(dtype)
}
