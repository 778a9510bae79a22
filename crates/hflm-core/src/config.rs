//! Adapter configuration

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::batch::BatchSize;
use crate::device::{DeviceFallback, Precision};
use crate::error::{Error, Result};
use crate::length::LengthPolicy;
use crate::models::LoadOptions;

/// Inference runtime behind the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Native candle decoder, accelerator-resident when one is visible.
    #[default]
    Candle,
    /// ONNX Runtime session on the CPU.
    OnnxCpu,
}

impl Backend {
    pub fn device_fallback(&self) -> DeviceFallback {
        match self {
            Self::Candle => DeviceFallback::PreferAccelerator,
            Self::OnnxCpu => DeviceFallback::Cpu,
        }
    }

    pub fn length_policy(&self) -> LengthPolicy {
        match self {
            Self::Candle => LengthPolicy::Full,
            Self::OnnxCpu => LengthPolicy::ConfigOnly,
        }
    }

    pub fn default_trust_remote_code(&self) -> bool {
        matches!(self, Self::Candle)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Candle => write!(f, "candle"),
            Self::OnnxCpu => write!(f, "onnx-cpu"),
        }
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "candle" | "hf" => Ok(Self::Candle),
            "onnx" | "onnx-cpu" | "onnx_cpu" => Ok(Self::OnnxCpu),
            other => Err(Error::InvalidArgument(format!(
                "Unknown backend '{other}' (expected 'candle' or 'onnx-cpu')"
            ))),
        }
    }
}

/// Everything needed to construct a [`ModelAdapter`](crate::ModelAdapter)
/// apart from the checkpoint itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterOptions {
    /// Checkpoint id or local path, when given through model args
    #[serde(default)]
    pub pretrained: Option<String>,

    #[serde(default)]
    pub backend: Backend,

    /// Requested device; resolved against the visible devices
    #[serde(default)]
    pub device: Option<String>,

    #[serde(default = "default_revision")]
    pub revision: String,

    #[serde(default)]
    pub subfolder: Option<String>,

    /// Tokenizer id or path, when it differs from the checkpoint
    #[serde(default)]
    pub tokenizer: Option<String>,

    #[serde(default)]
    pub batch_size: BatchSize,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Fixed context length; probed from the checkpoint when unset
    #[serde(default)]
    pub max_length: Option<usize>,

    #[serde(default)]
    pub load_in_8bit: bool,

    /// Memory-map weights instead of reading them eagerly
    #[serde(default = "default_low_cpu_mem_usage")]
    pub low_cpu_mem_usage: bool,

    /// Defaults per backend when unset
    #[serde(default)]
    pub trust_remote_code: Option<bool>,

    #[serde(default)]
    pub dtype: Precision,

    /// Hub download cache
    #[serde(default = "default_cache_dir")]
    pub cache_dir: Option<PathBuf>,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            pretrained: None,
            backend: Backend::default(),
            device: None,
            revision: default_revision(),
            subfolder: None,
            tokenizer: None,
            batch_size: BatchSize::default(),
            max_batch_size: default_max_batch_size(),
            max_length: None,
            load_in_8bit: false,
            low_cpu_mem_usage: default_low_cpu_mem_usage(),
            trust_remote_code: None,
            dtype: Precision::default(),
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_revision() -> String {
    "main".to_string()
}

fn default_max_batch_size() -> usize {
    512
}

fn default_low_cpu_mem_usage() -> bool {
    true
}

fn default_cache_dir() -> Option<PathBuf> {
    if let Ok(from_env) = std::env::var("HFLM_CACHE_DIR") {
        let trimmed = from_env.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    None
}

impl AdapterOptions {
    /// Parse an lm-eval style `key=value,key=value` string.
    pub fn from_model_args(args: &str) -> Result<Self> {
        ModelArgs::parse(args)?.apply(Self::default())
    }

    pub fn trust_remote_code(&self) -> bool {
        self.trust_remote_code
            .unwrap_or_else(|| self.backend.default_trust_remote_code())
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            precision: self.dtype,
            load_in_8bit: self.load_in_8bit,
            low_cpu_mem_usage: self.low_cpu_mem_usage,
            trust_remote_code: self.trust_remote_code(),
        }
    }
}

/// Ordered `key=value` pairs from a model-args string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelArgs {
    pairs: Vec<(String, String)>,
}

impl ModelArgs {
    pub fn parse(args: &str) -> Result<Self> {
        let mut pairs = Vec::new();
        for item in args.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = item.split_once('=').ok_or_else(|| {
                Error::InvalidArgument(format!("Expected key=value in model args, got '{item}'"))
            })?;
            pairs.push((key.trim().to_string(), value.trim().to_string()));
        }
        Ok(Self { pairs })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Overlay the pairs on `options`. Later keys win.
    pub fn apply(&self, mut options: AdapterOptions) -> Result<AdapterOptions> {
        for (key, value) in &self.pairs {
            match key.as_str() {
                "pretrained" => options.pretrained = Some(value.clone()),
                "backend" => options.backend = value.parse()?,
                "device" => options.device = Some(value.clone()),
                "revision" => options.revision = value.clone(),
                "subfolder" => options.subfolder = Some(value.clone()),
                "tokenizer" => options.tokenizer = Some(value.clone()),
                "batch_size" => options.batch_size = BatchSize::parse(value)?,
                "max_batch_size" => options.max_batch_size = parse_number(key, value)?,
                // Zero means unset.
                "max_length" => {
                    options.max_length = Some(parse_number(key, value)?).filter(|len| *len > 0)
                }
                "load_in_8bit" => options.load_in_8bit = parse_bool(key, value)?,
                "low_cpu_mem_usage" => options.low_cpu_mem_usage = parse_bool(key, value)?,
                "trust_remote_code" => options.trust_remote_code = Some(parse_bool(key, value)?),
                "dtype" => options.dtype = Precision::parse(value)?,
                "cache_dir" => options.cache_dir = Some(PathBuf::from(value)),
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "Unknown model argument '{other}'"
                    )))
                }
            }
        }
        Ok(options)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::InvalidArgument(format!(
            "{key} expects a boolean, got '{value}'"
        ))),
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value.parse::<usize>().map_err(|_| {
        Error::InvalidArgument(format!("{key} expects a non-negative integer, got '{value}'"))
    })
}
