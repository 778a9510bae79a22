//! The evaluation-harness facing model adapter.
//!
//! [`ModelAdapter`] turns a checkpoint reference into something the harness
//! can score and sample from: it resolves the device, loads the network and
//! tokenizer through the selected [`Backend`], switches the network to
//! inference mode and then forwards tokenization, scoring and generation
//! calls. Both backends share this one implementation; they differ only in
//! loader, device fallback and length policy.

use std::sync::Arc;

use candle_core::{DType, Tensor};
use tracing::{debug, info};

use crate::batch::BatchSize;
use crate::config::{AdapterOptions, Backend};
use crate::device::{resolve_device, DeviceSpec, VisibleDevices};
use crate::error::{Error, Result};
use crate::hub::{CheckpointLocator, HubLoader};
use crate::models::{CausalLm, DecoderModel, GenerationParams, OnnxModel};
use crate::tokenizer::{TextTokenizer, Tokenizer};

/// Upper bound on generated tokens the harness requests per call.
pub const MAX_GEN_TOKS: usize = 256;

/// What to evaluate: a checkpoint to load or a network already in memory.
#[derive(Clone)]
pub enum Checkpoint {
    Identifier(String),
    Handle(Arc<dyn CausalLm>),
}

impl From<&str> for Checkpoint {
    fn from(value: &str) -> Self {
        Self::Identifier(value.to_string())
    }
}

impl From<String> for Checkpoint {
    fn from(value: String) -> Self {
        Self::Identifier(value)
    }
}

impl From<Arc<dyn CausalLm>> for Checkpoint {
    fn from(value: Arc<dyn CausalLm>) -> Self {
        Self::Handle(value)
    }
}

#[derive(Clone)]
pub enum TokenizerSource {
    Identifier(String),
    Handle(Arc<dyn TextTokenizer>),
}

/// Surface the evaluation harness drives.
pub trait LanguageModel: Send + Sync {
    /// End-of-text id, used as the default stop token.
    fn eot_token_id(&self) -> Option<u32>;

    /// Longest input the model accepts, recomputed on every call.
    fn max_length(&self) -> usize;

    fn max_gen_toks(&self) -> usize {
        MAX_GEN_TOKS
    }

    /// Batch-size policy as configured. An auto scale is left to the harness.
    fn batch_size(&self) -> BatchSize;

    fn max_batch_size(&self) -> usize;

    fn device(&self) -> &DeviceSpec;

    /// Token ids for `text`. Special tokens are never added.
    fn tok_encode(&self, text: &str) -> Result<Vec<u32>>;

    fn tok_decode(&self, ids: &[u32]) -> Result<String>;

    /// `(batch, seq)` ids to `(batch, seq, vocab)` logits, single pass.
    fn logits_for(&self, batch: &Tensor) -> Result<Tensor>;

    /// Greedy continuation of `context` up to `max_length` total tokens.
    fn generate(
        &self,
        context: &Tensor,
        max_length: usize,
        eos_token_id: Option<u32>,
    ) -> Result<Tensor>;
}

pub struct ModelAdapter {
    model: Arc<dyn CausalLm>,
    tokenizer: Arc<dyn TextTokenizer>,
    device: DeviceSpec,
    vocab_size: usize,
    batch_size: BatchSize,
    max_batch_size: usize,
    explicit_max_length: Option<usize>,
    backend: Backend,
}

impl ModelAdapter {
    /// Build an adapter, probing the visible accelerators.
    ///
    /// `tokenizer` overrides `options.tokenizer` when both are given.
    pub fn new(
        checkpoint: Checkpoint,
        tokenizer: Option<TokenizerSource>,
        options: &AdapterOptions,
    ) -> Result<Self> {
        let hub = HubLoader::new(options.cache_dir.clone());
        Self::with_environment(
            checkpoint,
            tokenizer,
            options,
            &VisibleDevices::detect(),
            &hub,
        )
    }

    /// Build from options alone; `options.pretrained` names the checkpoint.
    pub fn from_options(options: &AdapterOptions) -> Result<Self> {
        let pretrained = options.pretrained.clone().ok_or_else(|| {
            Error::InvalidArgument("No checkpoint given (set 'pretrained')".to_string())
        })?;
        Self::new(Checkpoint::Identifier(pretrained), None, options)
    }

    /// Build against an explicit device inventory and hub loader.
    pub fn with_environment(
        checkpoint: Checkpoint,
        tokenizer: Option<TokenizerSource>,
        options: &AdapterOptions,
        visible: &VisibleDevices,
        hub: &HubLoader,
    ) -> Result<Self> {
        let tokenizer = tokenizer.or_else(|| {
            options
                .tokenizer
                .clone()
                .map(TokenizerSource::Identifier)
        });

        let (model, tokenizer, device) = match checkpoint {
            Checkpoint::Handle(model) => {
                let device = DeviceSpec::from_candle(model.device());
                info!(
                    "Adopting pre-built model {} on {}",
                    model.name_or_path(),
                    device
                );
                let tokenizer = match tokenizer {
                    Some(TokenizerSource::Handle(tokenizer)) => tokenizer,
                    Some(TokenizerSource::Identifier(id)) => {
                        return Err(Error::InvalidArgument(format!(
                            "A pre-built model needs a tokenizer handle, got identifier '{id}'"
                        )))
                    }
                    None => {
                        let locator = CheckpointLocator::new(
                            model.name_or_path(),
                            options.revision.clone(),
                            None,
                        );
                        Arc::new(Tokenizer::load(hub, &locator)?) as Arc<dyn TextTokenizer>
                    }
                };
                (model, tokenizer, device)
            }
            Checkpoint::Identifier(identifier) => {
                if identifier.trim().is_empty() {
                    return Err(Error::InvalidArgument(
                        "Checkpoint identifier must not be empty".to_string(),
                    ));
                }
                let device = resolve_device(
                    options.device.as_deref(),
                    visible,
                    options.backend.device_fallback(),
                );
                let locator = CheckpointLocator::new(
                    identifier,
                    options.revision.clone(),
                    options.subfolder.clone(),
                );
                info!(
                    "Loading {} at revision {} with the {} backend",
                    locator.identifier,
                    locator.effective_revision(),
                    options.backend
                );

                let model = load_model(options.backend, hub, &locator, &device, options)?;
                let tokenizer = match tokenizer {
                    Some(TokenizerSource::Handle(tokenizer)) => tokenizer,
                    Some(TokenizerSource::Identifier(id)) => {
                        Arc::new(Tokenizer::load(hub, &locator.with_identifier(id))?)
                            as Arc<dyn TextTokenizer>
                    }
                    None => Arc::new(Tokenizer::load(hub, &locator)?) as Arc<dyn TextTokenizer>,
                };
                (model, tokenizer, device)
            }
        };

        model.eval();

        let vocab_size = tokenizer.vocab_size();
        if vocab_size == 0 {
            return Err(Error::LoadFailure(format!(
                "Tokenizer for {} reports an empty vocabulary",
                model.name_or_path()
            )));
        }
        debug!(
            "Adapter ready: vocab {}, batch size {}, max batch size {}",
            vocab_size, options.batch_size, options.max_batch_size
        );

        Ok(Self {
            model,
            tokenizer,
            device,
            vocab_size,
            batch_size: options.batch_size,
            max_batch_size: options.max_batch_size,
            explicit_max_length: options.max_length.filter(|len| *len > 0),
            backend: options.backend,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn model(&self) -> &Arc<dyn CausalLm> {
        &self.model
    }

    pub fn tokenizer(&self) -> &Arc<dyn TextTokenizer> {
        &self.tokenizer
    }

    /// Ids as a `(batch, seq)` tensor on the model's device.
    fn placed(&self, ids: &Tensor, what: &str) -> Result<Tensor> {
        if ids.rank() != 2 {
            return Err(Error::InvalidArgument(format!(
                "{what} must be a (batch, seq) tensor, got shape {:?}",
                ids.shape()
            )));
        }
        Ok(ids.to_dtype(DType::U32)?.to_device(self.model.device())?)
    }
}

fn load_model(
    backend: Backend,
    hub: &HubLoader,
    locator: &CheckpointLocator,
    device: &DeviceSpec,
    options: &AdapterOptions,
) -> Result<Arc<dyn CausalLm>> {
    let load_options = options.load_options();
    let model: Arc<dyn CausalLm> = match backend {
        Backend::Candle => Arc::new(DecoderModel::from_pretrained(
            hub,
            locator,
            device,
            &load_options,
        )?),
        Backend::OnnxCpu => Arc::new(OnnxModel::from_pretrained(
            hub,
            locator,
            device,
            &load_options,
        )?),
    };
    Ok(model)
}

impl LanguageModel for ModelAdapter {
    fn eot_token_id(&self) -> Option<u32> {
        self.tokenizer.eos_token_id()
    }

    fn max_length(&self) -> usize {
        self.backend.length_policy().resolve(
            self.explicit_max_length,
            &self.model.context_config(),
            self.tokenizer.model_max_length(),
        )
    }

    fn batch_size(&self) -> BatchSize {
        self.batch_size
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn device(&self) -> &DeviceSpec {
        &self.device
    }

    fn tok_encode(&self, text: &str) -> Result<Vec<u32>> {
        self.tokenizer.encode(text, false)
    }

    fn tok_decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer.decode(ids)
    }

    fn logits_for(&self, batch: &Tensor) -> Result<Tensor> {
        let batch = self.placed(batch, "Scoring batch")?;
        self.model.forward(&batch)
    }

    fn generate(
        &self,
        context: &Tensor,
        max_length: usize,
        eos_token_id: Option<u32>,
    ) -> Result<Tensor> {
        let context = self.placed(context, "Generation context")?;
        self.model
            .generate(&context, &GenerationParams::greedy(max_length, eos_token_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::length::{ContextConfig, DEFAULT_MAX_LENGTH, UNBOUNDED_MODEL_MAX_LENGTH};
    use crate::models::decoder::tests::{tiny_decoder, TINY_CONFIG};
    use crate::models::tests::CountingLm;
    use crate::tokenizer::tests::write_fixture;
    use candle_core::Device;
    use std::fs;

    struct FakeTokenizer {
        words: Vec<&'static str>,
        model_max_length: Option<u128>,
    }

    impl FakeTokenizer {
        fn new(words: Vec<&'static str>) -> Self {
            Self {
                words,
                model_max_length: None,
            }
        }
    }

    impl TextTokenizer for FakeTokenizer {
        fn vocab_size(&self) -> usize {
            self.words.len()
        }

        fn eos_token_id(&self) -> Option<u32> {
            self.words
                .iter()
                .position(|w| *w == "<eos>")
                .map(|idx| idx as u32)
        }

        fn model_max_length(&self) -> Option<u128> {
            self.model_max_length
        }

        fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
            let mut ids = text
                .split_whitespace()
                .map(|word| {
                    self.words
                        .iter()
                        .position(|w| *w == word)
                        .map(|idx| idx as u32)
                        .ok_or_else(|| Error::TokenizationError(format!("unknown word {word}")))
                })
                .collect::<Result<Vec<_>>>()?;
            if add_special_tokens {
                ids.extend(self.eos_token_id());
            }
            Ok(ids)
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            Ok(ids
                .iter()
                .map(|id| self.words[*id as usize])
                .collect::<Vec<_>>()
                .join(" "))
        }
    }

    fn digits() -> FakeTokenizer {
        FakeTokenizer::new(vec![
            "zero", "one", "two", "three", "four", "five", "<eos>", "seven",
        ])
    }

    fn adopt(
        model: Arc<CountingLm>,
        tokenizer: FakeTokenizer,
        options: &AdapterOptions,
    ) -> ModelAdapter {
        ModelAdapter::with_environment(
            Checkpoint::Handle(model),
            Some(TokenizerSource::Handle(Arc::new(tokenizer))),
            options,
            &VisibleDevices::none(),
            &HubLoader::default(),
        )
        .unwrap()
    }

    fn ids(rows: Vec<Vec<u32>>) -> Tensor {
        let width = rows[0].len();
        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), width), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_adopted_handle_is_put_in_eval_mode() {
        let model = Arc::new(CountingLm::new("counting", 8));
        let adapter = adopt(model.clone(), digits(), &AdapterOptions::default());
        assert!(!model.is_training());
        assert_eq!(adapter.device(), &DeviceSpec::Cpu);
        assert_eq!(adapter.vocab_size(), 8);
        assert_eq!(adapter.eot_token_id(), Some(6));
        assert_eq!(adapter.max_gen_toks(), 256);
        assert_eq!(adapter.max_batch_size(), 512);
    }

    #[test]
    fn test_encode_skips_special_tokens() {
        let adapter = adopt(
            Arc::new(CountingLm::new("counting", 8)),
            digits(),
            &AdapterOptions::default(),
        );
        let encoded = adapter.tok_encode("one two three").unwrap();
        assert_eq!(encoded, vec![1, 2, 3]);
        assert_eq!(adapter.tok_decode(&encoded).unwrap(), "one two three");
    }

    #[test]
    fn test_logits_shape_matches_batch() {
        let adapter = adopt(
            Arc::new(CountingLm::new("counting", 8)),
            digits(),
            &AdapterOptions::default(),
        );
        for (b, t) in [(1, 1), (2, 5), (4, 3)] {
            let batch = Tensor::zeros((b, t), DType::U32, &Device::Cpu).unwrap();
            let logits = adapter.logits_for(&batch).unwrap();
            assert_eq!(logits.dims(), &[b, t, adapter.vocab_size()]);
        }
        let flat = Tensor::zeros(3, DType::U32, &Device::Cpu).unwrap();
        assert!(matches!(
            adapter.logits_for(&flat),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_generate_bounded_and_stops_at_eos() {
        let adapter = adopt(
            Arc::new(CountingLm::new("counting", 8)),
            digits(),
            &AdapterOptions::default(),
        );
        let out = adapter.generate(&ids(vec![vec![0, 1]]), 5, None).unwrap();
        assert_eq!(out.to_vec2::<u32>().unwrap(), vec![vec![0, 1, 2, 3, 4]]);

        let eos = adapter.eot_token_id();
        let out = adapter.generate(&ids(vec![vec![3, 4]]), 20, eos).unwrap();
        assert_eq!(out.to_vec2::<u32>().unwrap(), vec![vec![3, 4, 5, 6]]);
    }

    #[test]
    fn test_handle_rejects_tokenizer_identifier() {
        let result = ModelAdapter::with_environment(
            Checkpoint::Handle(Arc::new(CountingLm::new("counting", 8))),
            Some(TokenizerSource::Identifier("org/tokenizer".to_string())),
            &AdapterOptions::default(),
            &VisibleDevices::none(),
            &HubLoader::default(),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_handle_without_tokenizer_uses_its_origin() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), None);
        let name = dir.path().to_string_lossy().to_string();

        let adapter = ModelAdapter::with_environment(
            Checkpoint::Handle(Arc::new(CountingLm::new(&name, 4))),
            None,
            &AdapterOptions::default(),
            &VisibleDevices::none(),
            &HubLoader::default(),
        )
        .unwrap();
        assert_eq!(adapter.tok_encode("hello world").unwrap(), vec![0, 1]);
        assert_eq!(adapter.eot_token_id(), Some(2));
    }

    #[test]
    fn test_empty_vocabulary_is_load_failure() {
        let result = ModelAdapter::with_environment(
            Checkpoint::Handle(Arc::new(CountingLm::new("counting", 8))),
            Some(TokenizerSource::Handle(Arc::new(FakeTokenizer::new(vec![])))),
            &AdapterOptions::default(),
            &VisibleDevices::none(),
            &HubLoader::default(),
        );
        assert!(matches!(result, Err(Error::LoadFailure(_))));
    }

    #[test]
    fn test_max_length_follows_live_config() {
        let model = Arc::new(CountingLm::new("counting", 8));
        let mut tokenizer = digits();
        tokenizer.model_max_length = Some(UNBOUNDED_MODEL_MAX_LENGTH);
        let adapter = adopt(model.clone(), tokenizer, &AdapterOptions::default());
        assert_eq!(adapter.max_length(), DEFAULT_MAX_LENGTH);

        *model.context.write().unwrap() = ContextConfig {
            max_position_embeddings: Some(4096),
            n_ctx: Some(128),
            ..Default::default()
        };
        assert_eq!(adapter.max_length(), 4096);

        let options = AdapterOptions {
            max_length: Some(300),
            ..AdapterOptions::default()
        };
        let pinned = adopt(model.clone(), digits(), &options);
        assert_eq!(pinned.max_length(), 300);

        let zero = AdapterOptions {
            max_length: Some(0),
            ..AdapterOptions::default()
        };
        let unpinned = adopt(model, digits(), &zero);
        assert_eq!(unpinned.max_length(), 4096);
    }

    #[test]
    fn test_tokenizer_limit_applies_without_config() {
        let mut tokenizer = digits();
        tokenizer.model_max_length = Some(1024);
        let adapter = adopt(
            Arc::new(CountingLm::new("counting", 8)),
            tokenizer,
            &AdapterOptions::default(),
        );
        assert_eq!(adapter.max_length(), 1024);
    }

    #[test]
    fn test_auto_batch_scale_is_stored_not_applied() {
        let options = AdapterOptions::from_model_args("batch_size=auto:4").unwrap();
        let adapter = adopt(Arc::new(CountingLm::new("counting", 8)), digits(), &options);
        assert_eq!(adapter.batch_size(), BatchSize::Auto { scale: 4.0 });
        assert_eq!(adapter.batch_size().fixed(), None);
    }

    #[test]
    fn test_from_options_requires_checkpoint() {
        assert!(matches!(
            ModelAdapter::from_options(&AdapterOptions::default()),
            Err(Error::InvalidArgument(_))
        ));
    }

    /// Checkpoint directory with a tiny random llama, tokenizer and config.
    fn dummy_checkpoint(root: &std::path::Path) -> String {
        let dir = root.join("dummy-model-2-layer");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("config.json"), TINY_CONFIG).unwrap();
        write_fixture(&dir, None);
        let (_, varmap) = tiny_decoder("dummy-model-2-layer", "llama");
        varmap.save(dir.join("model.safetensors")).unwrap();
        dir.to_string_lossy().to_string()
    }

    #[test]
    fn test_dummy_checkpoint_on_cpu_only_host() {
        let root = tempfile::tempdir().unwrap();
        let path = dummy_checkpoint(root.path());
        let options = AdapterOptions::from_model_args("batch_size=auto:0.5").unwrap();

        let adapter = ModelAdapter::with_environment(
            Checkpoint::Identifier(path),
            None,
            &options,
            &VisibleDevices::none(),
            &HubLoader::default(),
        )
        .unwrap();

        assert_eq!(adapter.device(), &DeviceSpec::Cpu);
        assert_eq!(adapter.device().to_string(), "cpu");
        assert_eq!(adapter.max_length(), 128);
        assert_eq!(adapter.batch_size().scale(), Some(0.5));
        assert!(!adapter.model().is_training());

        let tokens = adapter.tok_encode("hello world").unwrap();
        let batch = Tensor::from_vec(tokens.clone(), (1, tokens.len()), &Device::Cpu).unwrap();
        let logits = adapter.logits_for(&batch).unwrap();
        assert_eq!(logits.dims(), &[1, 2, 4]);

        let out = adapter.generate(&batch, 6, None).unwrap();
        assert_eq!(out.dims(), &[1, 6]);
    }

    #[test]
    fn test_unavailable_device_falls_back_to_cpu() {
        let root = tempfile::tempdir().unwrap();
        let path = dummy_checkpoint(root.path());
        let options = AdapterOptions {
            device: Some("cuda:3".to_string()),
            low_cpu_mem_usage: false,
            ..AdapterOptions::default()
        };
        let adapter = ModelAdapter::with_environment(
            Checkpoint::Identifier(path),
            None,
            &options,
            &VisibleDevices::none(),
            &HubLoader::default(),
        )
        .unwrap();
        assert_eq!(adapter.device(), &DeviceSpec::Cpu);
    }

    #[test]
    fn test_missing_tokenizer_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let path = dummy_checkpoint(root.path());
        fs::remove_file(root.path().join("dummy-model-2-layer").join("tokenizer.json")).unwrap();
        let result = ModelAdapter::with_environment(
            Checkpoint::Identifier(path),
            None,
            &AdapterOptions::default(),
            &VisibleDevices::none(),
            &HubLoader::default(),
        );
        assert!(matches!(result, Err(Error::LoadFailure(_))));
    }

    #[test]
    fn test_corrupt_special_tokens_map_is_load_failure() {
        let root = tempfile::tempdir().unwrap();
        let path = dummy_checkpoint(root.path());
        fs::write(
            root.path()
                .join("dummy-model-2-layer")
                .join("special_tokens_map.json"),
            "{not json",
        )
        .unwrap();
        let result = ModelAdapter::with_environment(
            Checkpoint::Identifier(path),
            None,
            &AdapterOptions::default(),
            &VisibleDevices::none(),
            &HubLoader::default(),
        );
        assert!(matches!(result, Err(Error::LoadFailure(_))));
    }

    #[test]
    fn test_onnx_backend_without_graph_fails_to_load() {
        let root = tempfile::tempdir().unwrap();
        let path = dummy_checkpoint(root.path());
        let options = AdapterOptions {
            backend: Backend::OnnxCpu,
            ..AdapterOptions::default()
        };
        let result = ModelAdapter::with_environment(
            Checkpoint::Identifier(path),
            None,
            &options,
            &VisibleDevices::none(),
            &HubLoader::default(),
        );
        assert!(matches!(result, Err(Error::LoadFailure(_))));
    }

    #[test]
    fn test_remote_code_checkpoint_needs_trust() {
        let root = tempfile::tempdir().unwrap();
        let path = dummy_checkpoint(root.path());
        let config = TINY_CONFIG.replacen(
            '{',
            r#"{"auto_map": {"AutoModelForCausalLM": "modeling.Custom"},"#,
            1,
        );
        fs::write(
            root.path().join("dummy-model-2-layer").join("config.json"),
            config,
        )
        .unwrap();

        let options = AdapterOptions {
            trust_remote_code: Some(false),
            ..AdapterOptions::default()
        };
        let result = ModelAdapter::with_environment(
            Checkpoint::Identifier(path),
            None,
            &options,
            &VisibleDevices::none(),
            &HubLoader::default(),
        );
        assert!(matches!(result, Err(Error::LoadFailure(_))));
    }
}
