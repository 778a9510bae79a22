//! Maximum context length resolution.

use serde::{Deserialize, Serialize};

/// Used when neither the checkpoint nor the tokenizer declares a limit.
pub const DEFAULT_MAX_LENGTH: usize = 2048;

/// Value tokenizers store in `model_max_length` when no limit was ever
/// configured (`int(1e30)`).
pub const UNBOUNDED_MODEL_MAX_LENGTH: u128 = 1_000_000_000_000_000_019_884_624_838_656;

/// Context-length attributes a checkpoint config may carry.
///
/// Different model families store the same quantity under different keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub n_positions: Option<usize>,
    #[serde(default)]
    pub max_position_embeddings: Option<usize>,
    #[serde(default)]
    pub n_ctx: Option<usize>,
}

impl ContextConfig {
    /// First declared attribute among `keys`, in order.
    fn first_present(&self, keys: &[ContextKey]) -> Option<usize> {
        keys.iter().find_map(|key| match key {
            ContextKey::NPositions => self.n_positions,
            ContextKey::MaxPositionEmbeddings => self.max_position_embeddings,
            ContextKey::NCtx => self.n_ctx,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextKey {
    NPositions,
    MaxPositionEmbeddings,
    NCtx,
}

/// How far down the fallback chain a backend looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPolicy {
    /// `n_positions`, `max_position_embeddings`, `n_ctx`, then the tokenizer.
    Full,
    /// `n_ctx`, then `max_position_embeddings`. The tokenizer is not consulted.
    ConfigOnly,
}

impl LengthPolicy {
    fn keys(&self) -> &'static [ContextKey] {
        match self {
            Self::Full => &[
                ContextKey::NPositions,
                ContextKey::MaxPositionEmbeddings,
                ContextKey::NCtx,
            ],
            Self::ConfigOnly => &[ContextKey::NCtx, ContextKey::MaxPositionEmbeddings],
        }
    }

    /// Resolve the maximum input length.
    ///
    /// Evaluated on every query so config changes on a shared model handle
    /// are picked up.
    pub fn resolve(
        &self,
        explicit: Option<usize>,
        config: &ContextConfig,
        tokenizer_max: Option<u128>,
    ) -> usize {
        if let Some(explicit) = explicit {
            return explicit;
        }
        if let Some(len) = config.first_present(self.keys()) {
            return len;
        }
        match (self, tokenizer_max) {
            (Self::Full, Some(UNBOUNDED_MODEL_MAX_LENGTH)) => DEFAULT_MAX_LENGTH,
            (Self::Full, Some(len)) => usize::try_from(len).unwrap_or(DEFAULT_MAX_LENGTH),
            _ => DEFAULT_MAX_LENGTH,
        }
    }
}
