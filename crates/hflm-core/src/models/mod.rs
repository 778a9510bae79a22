//! Model handles the adapter drives.
//!
//! A [`CausalLm`] is a loaded network placed on a device. Two runtimes are
//! provided: a candle decoder for accelerator-resident inference and an ONNX
//! Runtime session for CPU inference. Callers may also bring their own.

pub mod decoder;
pub mod onnx;

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use tracing::debug;

use crate::device::Precision;
use crate::error::{Error, Result};
use crate::length::ContextConfig;

pub use decoder::{DecoderConfig, DecoderModel};
pub use onnx::OnnxModel;

/// A loaded causal language model.
pub trait CausalLm: Send + Sync {
    /// Hub id or path the weights came from.
    fn name_or_path(&self) -> &str;

    fn device(&self) -> &Device;

    fn dtype(&self) -> DType;

    /// Context-length attributes of the current configuration.
    fn context_config(&self) -> ContextConfig;

    /// Disable training-only behaviour such as dropout.
    fn eval(&self);

    fn is_training(&self) -> bool {
        false
    }

    /// `(batch, seq)` token ids to `(batch, seq, vocab)` logits.
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor>;

    /// Decode until `max_length` or every row produced the eos token.
    ///
    /// The default recomputes the full sequence each step.
    fn generate(&self, context: &Tensor, params: &GenerationParams) -> Result<Tensor> {
        greedy_generate(context, params, |sequence, _processed| {
            let logits = self.forward(sequence)?;
            let last = logits.dim(1)? - 1;
            Ok(logits.i((.., last, ..))?)
        })
    }
}

/// Generation arguments forwarded to a [`CausalLm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationParams {
    pub do_sample: bool,
    /// Total length, prompt included.
    pub max_length: usize,
    pub eos_token_id: Option<u32>,
    pub pad_token_id: Option<u32>,
}

impl GenerationParams {
    /// Deterministic decoding; the eos token doubles as padding.
    pub fn greedy(max_length: usize, eos_token_id: Option<u32>) -> Self {
        Self {
            do_sample: false,
            max_length,
            eos_token_id,
            pad_token_id: eos_token_id,
        }
    }
}

/// Options shared by the checkpoint loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadOptions {
    pub precision: Precision,
    pub load_in_8bit: bool,
    pub low_cpu_mem_usage: bool,
    pub trust_remote_code: bool,
}

/// Argmax decoding loop.
///
/// `next_logits` receives the whole sequence so far plus how many leading
/// positions it has already seen, and returns `(batch, vocab)` logits for
/// the last position. Rows that produced the eos token are padded from then
/// on; the loop ends once all rows are finished.
pub fn greedy_generate<F>(
    context: &Tensor,
    params: &GenerationParams,
    mut next_logits: F,
) -> Result<Tensor>
where
    F: FnMut(&Tensor, usize) -> Result<Tensor>,
{
    if params.do_sample {
        return Err(Error::InvalidArgument(
            "Sampling is not supported; only greedy decoding is available".to_string(),
        ));
    }
    let (batch, prompt_len) = context.dims2().map_err(|_| {
        Error::InvalidArgument(format!(
            "Expected a 2-D context, got {:?}",
            context.shape()
        ))
    })?;
    if prompt_len == 0 {
        return Err(Error::InvalidArgument(
            "Generation context must hold at least one token".to_string(),
        ));
    }
    let mut sequence = context.to_dtype(DType::U32)?;
    if prompt_len >= params.max_length {
        debug!(
            "Context length {prompt_len} already reaches max_length {}",
            params.max_length
        );
        return Ok(sequence);
    }

    let pad = params.pad_token_id.or(params.eos_token_id).unwrap_or(0);
    let mut processor = LogitsProcessor::from_sampling(0, Sampling::ArgMax);
    let mut finished = vec![false; batch];
    let mut processed = 0;

    while sequence.dim(1)? < params.max_length {
        let logits = next_logits(&sequence, processed)?;
        processed = sequence.dim(1)?;

        let mut next = Vec::with_capacity(batch);
        for (row, done) in finished.iter_mut().enumerate() {
            if *done {
                next.push(pad);
                continue;
            }
            let token = processor.sample(&logits.get(row)?)?;
            if params.eos_token_id == Some(token) {
                *done = true;
            }
            next.push(token);
        }

        let next = Tensor::from_vec(next, (batch, 1), sequence.device())?;
        sequence = Tensor::cat(&[&sequence, &next], 1)?;

        if params.eos_token_id.is_some() && finished.iter().all(|done| *done) {
            break;
        }
    }

    debug!(
        "Generated {} tokens per row (batch {batch})",
        sequence.dim(1)? - prompt_len
    );
    Ok(sequence)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::RwLock;

    /// Scripted model: every position predicts `(last_token + 1) % vocab`.
    pub(crate) struct CountingLm {
        pub name: String,
        pub vocab: usize,
        pub context: RwLock<ContextConfig>,
        pub training: AtomicBool,
        device: Device,
    }

    impl CountingLm {
        pub(crate) fn new(name: &str, vocab: usize) -> Self {
            Self {
                name: name.to_string(),
                vocab,
                context: RwLock::new(ContextConfig::default()),
                training: AtomicBool::new(true),
                device: Device::Cpu,
            }
        }
    }

    impl CausalLm for CountingLm {
        fn name_or_path(&self) -> &str {
            &self.name
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn dtype(&self) -> DType {
            DType::F32
        }

        fn context_config(&self) -> ContextConfig {
            *self.context.read().unwrap()
        }

        fn eval(&self) {
            self.training.store(false, Ordering::SeqCst);
        }

        fn is_training(&self) -> bool {
            self.training.load(Ordering::SeqCst)
        }

        fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
            let ids = input_ids.to_vec2::<u32>()?;
            let (batch, seq) = input_ids.dims2()?;
            let mut data = vec![0f32; batch * seq * self.vocab];
            for (b, row) in ids.iter().enumerate() {
                for (t, id) in row.iter().enumerate() {
                    let next = (*id as usize + 1) % self.vocab;
                    data[(b * seq + t) * self.vocab + next] = 1.0;
                }
            }
            Ok(Tensor::from_vec(data, (batch, seq, self.vocab), &Device::Cpu)?)
        }
    }

    fn ids(rows: Vec<Vec<u32>>) -> Tensor {
        let width = rows[0].len();
        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), width), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_generate_runs_to_max_length_without_eos() {
        let lm = CountingLm::new("counting", 10);
        let out = lm
            .generate(&ids(vec![vec![1, 2]]), &GenerationParams::greedy(6, None))
            .unwrap();
        assert_eq!(out.to_vec2::<u32>().unwrap(), vec![vec![1, 2, 3, 4, 5, 6]]);
    }

    #[test]
    fn test_generate_stops_at_eos() {
        let lm = CountingLm::new("counting", 10);
        let out = lm
            .generate(&ids(vec![vec![1, 2]]), &GenerationParams::greedy(9, Some(4)))
            .unwrap();
        assert_eq!(out.to_vec2::<u32>().unwrap(), vec![vec![1, 2, 3, 4]]);
    }

    #[test]
    fn test_finished_rows_are_padded_with_eos() {
        let lm = CountingLm::new("counting", 10);
        let out = lm
            .generate(
                &ids(vec![vec![2, 3], vec![0, 1]]),
                &GenerationParams::greedy(8, Some(5)),
            )
            .unwrap();
        assert_eq!(
            out.to_vec2::<u32>().unwrap(),
            vec![vec![2, 3, 4, 5, 5, 5], vec![0, 1, 2, 3, 4, 5]]
        );
    }

    #[test]
    fn test_context_at_max_length_is_returned_unchanged() {
        let lm = CountingLm::new("counting", 10);
        let context = ids(vec![vec![1, 2, 3]]);
        let out = lm
            .generate(&context, &GenerationParams::greedy(2, Some(4)))
            .unwrap();
        assert_eq!(out.to_vec2::<u32>().unwrap(), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_empty_context_is_rejected() {
        let lm = CountingLm::new("counting", 10);
        let empty = Tensor::zeros((1, 0), DType::U32, &Device::Cpu).unwrap();
        assert!(matches!(
            lm.generate(&empty, &GenerationParams::greedy(4, None)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_sampling_is_rejected() {
        let lm = CountingLm::new("counting", 10);
        let params = GenerationParams {
            do_sample: true,
            ..GenerationParams::greedy(4, None)
        };
        assert!(matches!(
            lm.generate(&ids(vec![vec![1]]), &params),
            Err(Error::InvalidArgument(_))
        ));
    }
}
