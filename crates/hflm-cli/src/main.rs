//! HFLM CLI - poke at an evaluation adapter from the shell
//!
//! Builds a [`ModelAdapter`] from lm-eval style model args and exercises the
//! same calls an evaluation harness makes.

use anyhow::{bail, Context};
use candle_core::{DType, Device, IndexOp, Tensor};
use clap::{Parser, Subcommand, ValueEnum};
use hflm_core::{AdapterOptions, Backend, LanguageModel, ModelAdapter};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// HFLM - causal LM adapter for evaluation harnesses
///
/// Examples:
///   hflm --model-args pretrained=Qwen/Qwen2.5-0.5B inspect
///   hflm --model-args pretrained=./my-model encode "Hello world"
///   hflm --model-args pretrained=./my-model next-token "The capital of France is"
///   hflm --backend onnx-cpu --model-args pretrained=org/model-onnx generate "Once upon"
#[derive(Parser)]
#[command(
    name = "hflm",
    about = "Causal LM adapter for evaluation harnesses",
    version = env!("CARGO_PKG_VERSION"),
    arg_required_else_help = true,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Comma-separated key=value model arguments (pretrained=..., device=..., ...)
    #[arg(long, global = true, default_value = "")]
    pub model_args: String,

    /// Inference backend, overriding any `backend=` model argument
    #[arg(long, global = true, value_enum)]
    pub backend: Option<BackendArg>,

    /// Output format
    #[arg(
        long = "output-format",
        global = true,
        value_enum,
        default_value = "plain"
    )]
    pub output_format: OutputFormat,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show resolved device, vocabulary, lengths and batch policy
    Inspect,

    /// Encode text into token ids (no special tokens)
    Encode {
        /// Text to encode
        text: String,
    },

    /// Decode token ids into text
    Decode {
        /// Token ids
        #[arg(required = true)]
        ids: Vec<u32>,
    },

    /// Most likely next tokens after the given text
    NextToken {
        /// Prompt text
        text: String,

        /// Number of candidates to show
        #[arg(short = 'k', long, default_value = "5")]
        top_k: usize,
    },

    /// Greedy continuation of the given text
    Generate {
        /// Prompt text
        text: String,

        /// Number of new tokens (defaults to the adapter's max_gen_toks)
        #[arg(short = 'n', long)]
        max_new_tokens: Option<usize>,

        /// Stop once the end-of-text token is produced
        #[arg(long)]
        stop_at_eos: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum BackendArg {
    Candle,
    OnnxCpu,
}

impl From<BackendArg> for Backend {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Candle => Backend::Candle,
            BackendArg::OnnxCpu => Backend::OnnxCpu,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Plain,
    /// JSON output
    Json,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "hflm_core=debug,hflm_cli=debug"
    } else {
        "hflm_core=info,hflm_cli=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut options =
        AdapterOptions::from_model_args(&cli.model_args).context("Invalid --model-args")?;
    if let Some(backend) = cli.backend {
        options.backend = backend.into();
    }
    if options.pretrained.is_none() {
        bail!("--model-args must include pretrained=<id or path>");
    }

    info!("Building {} adapter", options.backend);
    let adapter = ModelAdapter::from_options(&options).context("Failed to build adapter")?;

    match cli.command {
        Commands::Inspect => inspect(&adapter, cli.output_format),
        Commands::Encode { text } => {
            let ids = adapter.tok_encode(&text)?;
            match cli.output_format {
                OutputFormat::Json => println!("{}", json!({ "ids": ids })),
                OutputFormat::Plain => println!(
                    "{}",
                    ids.iter()
                        .map(u32::to_string)
                        .collect::<Vec<_>>()
                        .join(" ")
                ),
            }
            Ok(())
        }
        Commands::Decode { ids } => {
            let text = adapter.tok_decode(&ids)?;
            match cli.output_format {
                OutputFormat::Json => println!("{}", json!({ "text": text })),
                OutputFormat::Plain => println!("{text}"),
            }
            Ok(())
        }
        Commands::NextToken { text, top_k } => {
            next_token(&adapter, &text, top_k, cli.output_format)
        }
        Commands::Generate {
            text,
            max_new_tokens,
            stop_at_eos,
        } => generate(
            &adapter,
            &text,
            max_new_tokens.unwrap_or_else(|| adapter.max_gen_toks()),
            stop_at_eos,
            cli.output_format,
        ),
    }
}

fn inspect(adapter: &ModelAdapter, format: OutputFormat) -> anyhow::Result<()> {
    let batch_size = adapter.batch_size();
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "model": adapter.model().name_or_path(),
                "backend": adapter.backend().to_string(),
                "device": adapter.device().to_string(),
                "dtype": format!("{:?}", adapter.model().dtype()),
                "vocab_size": adapter.vocab_size(),
                "eot_token_id": adapter.eot_token_id(),
                "max_length": adapter.max_length(),
                "max_gen_toks": adapter.max_gen_toks(),
                "batch_size": batch_size,
                "max_batch_size": adapter.max_batch_size(),
            }))?
        ),
        OutputFormat::Plain => {
            println!("model:          {}", adapter.model().name_or_path());
            println!("backend:        {}", adapter.backend());
            println!("device:         {}", adapter.device());
            println!("dtype:          {:?}", adapter.model().dtype());
            println!("vocab_size:     {}", adapter.vocab_size());
            match adapter.eot_token_id() {
                Some(id) => println!("eot_token_id:   {id}"),
                None => println!("eot_token_id:   none"),
            }
            println!("max_length:     {}", adapter.max_length());
            println!("max_gen_toks:   {}", adapter.max_gen_toks());
            println!("batch_size:     {batch_size}");
            println!("max_batch_size: {}", adapter.max_batch_size());
        }
    }
    Ok(())
}

fn prompt_tensor(adapter: &ModelAdapter, text: &str) -> anyhow::Result<Tensor> {
    let ids = adapter.tok_encode(text)?;
    if ids.is_empty() {
        bail!("Prompt encodes to zero tokens");
    }
    let len = ids.len();
    Ok(Tensor::from_vec(ids, (1, len), &Device::Cpu)?)
}

fn next_token(
    adapter: &ModelAdapter,
    text: &str,
    top_k: usize,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let prompt = prompt_tensor(adapter, text)?;
    let last = prompt.dim(1)? - 1;
    let logits = adapter.logits_for(&prompt)?;
    let last_logits = logits.i((0, last))?.to_dtype(DType::F32)?;
    let probs = candle_nn::ops::softmax_last_dim(&last_logits)?.to_vec1::<f32>()?;

    let mut ranked: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(top_k);

    let mut rows = Vec::with_capacity(ranked.len());
    for (id, prob) in ranked {
        let token = adapter.tok_decode(&[id as u32])?;
        rows.push((id, token, prob));
    }

    match format {
        OutputFormat::Json => {
            let items: Vec<_> = rows
                .iter()
                .map(|(id, token, prob)| json!({ "id": id, "token": token, "prob": prob }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Plain => {
            for (id, token, prob) in rows {
                println!("{id:>8}  {prob:>8.4}  {token:?}");
            }
        }
    }
    Ok(())
}

fn generate(
    adapter: &ModelAdapter,
    text: &str,
    max_new_tokens: usize,
    stop_at_eos: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let prompt = prompt_tensor(adapter, text)?;
    let prompt_len = prompt.dim(1)?;
    let max_length = (prompt_len + max_new_tokens).min(adapter.max_length());
    let eos = if stop_at_eos {
        adapter.eot_token_id()
    } else {
        None
    };

    let output = adapter.generate(&prompt, max_length, eos)?;
    let ids = output.i(0)?.to_vec1::<u32>()?;
    let continuation = adapter.tok_decode(&ids[prompt_len.min(ids.len())..])?;

    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "ids": ids, "prompt_tokens": prompt_len, "text": continuation })
        ),
        OutputFormat::Plain => println!("{text}{continuation}"),
    }
    Ok(())
}
