//! HFLM Core - causal language model adapter for evaluation harnesses
//!
//! Wraps a pretrained causal LM and its tokenizer behind the small surface an
//! evaluation harness needs: device and context-length resolution,
//! tokenization without implicit special tokens, single-pass logits and
//! greedy generation.
//!
//! Two backends implement the same contract:
//! - `candle`: native Llama-family decoder, accelerator-resident when one is
//!   visible
//! - `onnx-cpu`: ONNX Runtime session on the CPU
//!
//! # Example
//!
//! ```ignore
//! use hflm_core::{AdapterOptions, LanguageModel, ModelAdapter};
//!
//! let options = AdapterOptions::from_model_args("pretrained=Qwen/Qwen2.5-0.5B,batch_size=auto")?;
//! let adapter = ModelAdapter::from_options(&options)?;
//! let ids = adapter.tok_encode("The capital of France is")?;
//! ```

pub mod adapter;
pub mod batch;
pub mod config;
pub mod device;
pub mod error;
pub mod hub;
pub mod length;
pub mod models;
pub mod tokenizer;

pub use adapter::{Checkpoint, LanguageModel, ModelAdapter, TokenizerSource, MAX_GEN_TOKS};
pub use batch::BatchSize;
pub use config::{AdapterOptions, Backend, ModelArgs};
pub use device::{resolve_device, DeviceFallback, DeviceSpec, Precision, VisibleDevices};
pub use error::{Error, Result};
pub use hub::{CheckpointConfig, CheckpointLocator, HubLoader};
pub use length::{ContextConfig, LengthPolicy, DEFAULT_MAX_LENGTH};
pub use models::{CausalLm, DecoderModel, GenerationParams, LoadOptions, OnnxModel};
pub use tokenizer::{TextTokenizer, Tokenizer};
