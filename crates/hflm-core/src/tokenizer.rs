//! Text tokenization for evaluated checkpoints.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tokenizers::decoders::byte_fallback::ByteFallback;
use tokenizers::decoders::sequence::Sequence;
use tokenizers::decoders::DecoderWrapper;
use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::AddedToken;
use tokenizers::Tokenizer as HfTokenizer;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hub::{read_json, CheckpointLocator, HubLoader};

/// Tried in order when the tokenizer config names no eos token.
const FALLBACK_EOS_TOKENS: &[&str] = &["<|endoftext|>", "</s>", "<eos>"];

/// Text to token-id codec the adapter delegates to.
pub trait TextTokenizer: Send + Sync {
    /// Size of the base vocabulary, added tokens excluded.
    fn vocab_size(&self) -> usize;

    fn eos_token_id(&self) -> Option<u32>;

    /// Declared `model_max_length`, if the tokenizer carries one.
    fn model_max_length(&self) -> Option<u128>;

    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32]) -> Result<String>;
}

pub struct Tokenizer {
    inner: HfTokenizer,
    eos_token_id: Option<u32>,
    model_max_length: Option<u128>,
}

impl Tokenizer {
    /// Resolve the tokenizer files of a checkpoint and load them.
    pub fn load(hub: &HubLoader, locator: &CheckpointLocator) -> Result<Self> {
        let config = match hub.fetch_optional(locator, "tokenizer_config.json")? {
            Some(path) => Some(read_json::<TokenizerConfigFile>(&path)?),
            None => None,
        };
        let special_map = match hub.fetch_optional(locator, "special_tokens_map.json")? {
            Some(path) => Some(read_json::<Value>(&path)?),
            None => None,
        };

        let inner = if let Some(path) = hub.fetch_optional(locator, "tokenizer.json")? {
            HfTokenizer::from_file(&path)
                .map_err(|e| Error::load(format!("Reading {:?}", path), e))?
        } else {
            let vocab = hub.fetch(locator, "vocab.json").map_err(|e| {
                Error::load(
                    format!("No tokenizer.json or vocab.json for {}", locator.identifier),
                    e,
                )
            })?;
            let merges = hub.fetch(locator, "merges.txt")?;
            from_vocab_merges(&vocab, &merges, config.as_ref())?
        };

        let tokenizer = Self::from_parts(inner, config.as_ref(), special_map.as_ref());
        info!(
            "Loaded tokenizer for {} (vocab {}, eos {:?})",
            locator.identifier,
            tokenizer.vocab_size(),
            tokenizer.eos_token_id
        );
        Ok(tokenizer)
    }

    /// Load from a directory holding `tokenizer.json` and friends.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let locator = CheckpointLocator::new(dir.to_string_lossy(), "main", None);
        Self::load(&HubLoader::default(), &locator)
    }

    fn from_parts(
        inner: HfTokenizer,
        config: Option<&TokenizerConfigFile>,
        special_map: Option<&Value>,
    ) -> Self {
        let eos_content = config
            .and_then(|cfg| cfg.eos_token.as_ref())
            .and_then(token_content)
            .or_else(|| {
                special_map
                    .and_then(|map| map.get("eos_token"))
                    .and_then(token_content)
            });

        let eos_token_id = match eos_content {
            Some(content) => inner.token_to_id(&content),
            None => FALLBACK_EOS_TOKENS
                .iter()
                .find_map(|token| inner.token_to_id(token)),
        };

        let model_max_length = config.and_then(|cfg| cfg.model_max_length.as_ref()).and_then(
            |value| match value {
                Value::Number(n) => n
                    .as_u64()
                    .map(u128::from)
                    .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u128)),
                _ => None,
            },
        );

        Self {
            inner,
            eos_token_id,
            model_max_length,
        }
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

impl TextTokenizer for Tokenizer {
    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(false)
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    fn model_max_length(&self) -> Option<u128> {
        self.model_max_length
    }

    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| Error::TokenizationError(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| Error::TokenizationError(e.to_string()))
    }
}

fn from_vocab_merges(
    vocab_path: &Path,
    merges_path: &Path,
    config: Option<&TokenizerConfigFile>,
) -> Result<HfTokenizer> {
    info!("Loading BPE tokenizer from vocab.json + merges.txt");
    let vocab_str = vocab_path
        .to_str()
        .ok_or_else(|| Error::LoadFailure("Invalid vocab path".to_string()))?;
    let merges_str = merges_path
        .to_str()
        .ok_or_else(|| Error::LoadFailure("Invalid merges path".to_string()))?;

    let bpe = BPE::from_file(vocab_str, merges_str)
        .byte_fallback(true)
        .build()
        .map_err(|e| Error::load("BPE build failed", e))?;

    let mut inner = HfTokenizer::new(bpe);

    let add_prefix_space = config
        .and_then(|cfg| cfg.add_prefix_space)
        .unwrap_or(false);
    let byte_level = ByteLevel::new(add_prefix_space, true, true);
    inner.with_pre_tokenizer(Some(byte_level.clone()));
    let decoder = DecoderWrapper::Sequence(Sequence::new(vec![
        DecoderWrapper::ByteFallback(ByteFallback::new()),
        DecoderWrapper::ByteLevel(byte_level),
    ]));
    inner.with_decoder(Some(decoder));

    if let Some(cfg) = config {
        let mut added: Vec<(u32, &AddedTokenConfig)> = cfg
            .added_tokens_decoder
            .iter()
            .filter_map(|(id, entry)| id.parse::<u32>().ok().map(|id| (id, entry)))
            .collect();
        // Inserting in id order keeps upstream ids stable.
        added.sort_by_key(|(id, _)| *id);
        for (_, entry) in added {
            let token = entry.to_added_token();
            if entry.special {
                inner.add_special_tokens(&[token]);
            } else {
                inner.add_tokens(&[token]);
            }
        }
    }

    debug!("Loaded BPE tokenizer with byte-level fallback");
    Ok(inner)
}

/// `eos_token` is either a bare string or an added-token object.
fn token_content(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("content")
            .and_then(|c| c.as_str())
            .map(String::from),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct TokenizerConfigFile {
    #[serde(default)]
    add_prefix_space: Option<bool>,
    #[serde(default)]
    eos_token: Option<Value>,
    /// Kept as a raw number: the unbounded sentinel overflows u64.
    #[serde(default)]
    model_max_length: Option<Value>,
    #[serde(default)]
    added_tokens_decoder: HashMap<String, AddedTokenConfig>,
}

#[derive(Debug, Deserialize)]
struct AddedTokenConfig {
    content: String,
    #[serde(default)]
    single_word: bool,
    #[serde(default)]
    lstrip: bool,
    #[serde(default)]
    rstrip: bool,
    #[serde(default)]
    normalized: bool,
    #[serde(default)]
    special: bool,
}

impl AddedTokenConfig {
    fn to_added_token(&self) -> AddedToken {
        AddedToken::from(self.content.clone(), self.special)
            .single_word(self.single_word)
            .lstrip(self.lstrip)
            .rstrip(self.rstrip)
            .normalized(self.normalized)
    }
}
