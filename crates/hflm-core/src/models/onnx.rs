//! ONNX Runtime backed causal LM for CPU inference.

use std::borrow::Cow;
use std::sync::Mutex;

use candle_core::{DType, Device, Tensor};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue, SessionInputs};
use ort::value::{Tensor as OrtTensor, Value};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use super::{CausalLm, LoadOptions};
use crate::device::DeviceSpec;
use crate::error::{Error, Result};
use crate::hub::{CheckpointConfig, CheckpointLocator, HubLoader};
use crate::length::ContextConfig;

const PAST_KEY_VALUES_PREFIX: &str = "past_key_values.";

/// Latency-oriented session: sequential execution, one inter-op thread and
/// no optimized graph written to disk.
fn latency_session() -> Result<SessionBuilder> {
    Session::builder()
        .map_err(|e| Error::load("Creating session builder", e))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| Error::load("Setting optimization level", e))?
        .with_parallel_execution(false)
        .map_err(|e| Error::load("Setting execution mode", e))?
        .with_inter_threads(1)
        .map_err(|e| Error::load("Setting inter-op threads", e))
}

fn graph_file(load_in_8bit: bool) -> &'static str {
    if load_in_8bit {
        "model_quantized.onnx"
    } else {
        "model.onnx"
    }
}

/// Weights exported beside a graph larger than the protobuf limit.
fn external_data_file(graph_file: &str) -> String {
    format!("{graph_file}_data")
}

/// Shape of the empty cache tensors fed to graphs exported with
/// `past_key_values` inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheLayout {
    num_kv_heads: usize,
    head_dim: usize,
}

impl CacheLayout {
    fn from_config(raw: &JsonValue) -> Option<Self> {
        let get = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| raw.get(*k).and_then(|v| v.as_u64()))
                .map(|v| v as usize)
        };
        let heads = get(&["num_attention_heads", "n_head", "num_heads"])?;
        let num_kv_heads = get(&["num_key_value_heads"]).unwrap_or(heads);
        let head_dim = match get(&["head_dim"]) {
            Some(dim) => dim,
            None => get(&["hidden_size", "n_embd", "d_model"])?.checked_div(heads)?,
        };
        Some(Self {
            num_kv_heads,
            head_dim,
        })
    }
}

pub struct OnnxModel {
    name_or_path: String,
    session: Mutex<Session>,
    input_names: Vec<String>,
    logits_output: String,
    cache_layout: Option<CacheLayout>,
    context: ContextConfig,
    device: Device,
}

impl OnnxModel {
    pub fn from_pretrained(
        hub: &HubLoader,
        locator: &CheckpointLocator,
        device: &DeviceSpec,
        options: &LoadOptions,
    ) -> Result<Self> {
        let config = CheckpointConfig::load(hub, locator)?;
        config.check_remote_code(&locator.identifier, options.trust_remote_code)?;

        let graph_file = graph_file(options.load_in_8bit);
        let graph = hub.fetch(locator, graph_file)?;
        // External weights must sit next to the graph before it is parsed.
        if let Some(data) = hub.fetch_optional(locator, &external_data_file(graph_file))? {
            debug!("Using external ONNX data {:?}", data);
        }

        let _ = ort::init().commit();
        let session = latency_session()?
            .commit_from_file(&graph)
            .map_err(|e| Error::load(format!("Loading ONNX graph {:?}", graph), e))?;

        let model = Self::from_session(
            locator.identifier.clone(),
            session,
            config.context,
            CacheLayout::from_config(&config.raw),
            device.to_candle()?,
        );
        info!("Loaded ONNX graph {} for {}", graph_file, locator.identifier);
        Ok(model)
    }

    fn from_session(
        name_or_path: String,
        session: Session,
        context: ContextConfig,
        cache_layout: Option<CacheLayout>,
        device: Device,
    ) -> Self {
        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|input| input.name().to_string())
            .collect();
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|output| output.name().to_string())
            .collect();
        let logits_output = output_names
            .iter()
            .find(|name| name.as_str() == "logits")
            .or_else(|| output_names.first())
            .cloned()
            .unwrap_or_else(|| "logits".to_string());
        debug!("ONNX inputs {:?}, logits output {}", input_names, logits_output);

        Self {
            name_or_path,
            session: Mutex::new(session),
            input_names,
            logits_output,
            cache_layout,
            context,
            device,
        }
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FeedData {
    Int64(Vec<i64>),
    Bool(Vec<bool>),
    Float32(Vec<f32>),
}

/// One named graph input, before it is handed to the runtime.
#[derive(Debug, Clone, PartialEq)]
struct Feed {
    name: String,
    shape: Vec<usize>,
    data: FeedData,
}

impl Feed {
    fn int64(name: &str, shape: Vec<usize>, data: Vec<i64>) -> Self {
        Self {
            name: name.to_string(),
            shape,
            data: FeedData::Int64(data),
        }
    }

    fn into_session_input(self) -> Result<(Cow<'static, str>, SessionInputValue<'static>)> {
        let value: Value = match self.data {
            FeedData::Int64(data) => OrtTensor::from_array((self.shape, data))?.into(),
            FeedData::Bool(data) => OrtTensor::from_array((self.shape, data))?.into(),
            FeedData::Float32(data) => OrtTensor::from_array((self.shape, data))?.into(),
        };
        Ok((Cow::Owned(self.name), value.into()))
    }
}

/// Inputs for one full-sequence pass, in graph declaration order.
///
/// Graphs exported with a cache get empty `past_key_values.*` tensors and
/// `use_cache_branch = false`.
fn plan_feeds(
    input_names: &[String],
    cache_layout: Option<CacheLayout>,
    ids: &[i64],
    batch: usize,
    seq: usize,
) -> Result<Vec<Feed>> {
    if ids.len() != batch * seq {
        return Err(Error::InvalidArgument(format!(
            "{} token ids do not fill a ({batch}, {seq}) batch",
            ids.len()
        )));
    }
    let mut feeds = Vec::with_capacity(input_names.len());
    for name in input_names {
        let feed = match name.as_str() {
            "input_ids" => Feed::int64(name, vec![batch, seq], ids.to_vec()),
            "attention_mask" => Feed::int64(name, vec![batch, seq], vec![1; batch * seq]),
            "position_ids" => {
                let positions = (0..batch).flat_map(|_| 0..seq as i64).collect();
                Feed::int64(name, vec![batch, seq], positions)
            }
            "use_cache_branch" => Feed {
                name: name.clone(),
                shape: vec![1],
                data: FeedData::Bool(vec![false]),
            },
            other if other.starts_with(PAST_KEY_VALUES_PREFIX) => {
                let layout = cache_layout.ok_or_else(|| {
                    Error::InferenceFailure(format!(
                        "Graph expects {other} but config.json has no attention geometry"
                    ))
                })?;
                Feed {
                    name: name.clone(),
                    shape: vec![batch, layout.num_kv_heads, 0, layout.head_dim],
                    data: FeedData::Float32(Vec::new()),
                }
            }
            other => {
                return Err(Error::InferenceFailure(format!(
                    "Unsupported ONNX graph input '{other}'"
                )))
            }
        };
        feeds.push(feed);
    }
    Ok(feeds)
}

impl CausalLm for OnnxModel {
    fn name_or_path(&self) -> &str {
        &self.name_or_path
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn context_config(&self) -> ContextConfig {
        self.context
    }

    fn eval(&self) {}

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq) = input_ids.dims2()?;
        let ids: Vec<i64> = input_ids
            .to_dtype(DType::I64)?
            .flatten_all()?
            .to_vec1::<i64>()?;
        let feeds = plan_feeds(&self.input_names, self.cache_layout, &ids, batch, seq)?
            .into_iter()
            .map(Feed::into_session_input)
            .collect::<Result<Vec<_>>>()?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| Error::InferenceFailure(format!("Failed to lock session: {e}")))?;
        let outputs = session.run(SessionInputs::from(feeds))?;
        let (shape, data) = outputs[self.logits_output.as_str()].try_extract_tensor::<f32>()?;

        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        let tensor = Tensor::from_slice(data, dims, &Device::Cpu)?;
        Ok(tensor.to_device(&self.device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_external_data_follows_selected_graph() {
        assert_eq!(external_data_file(graph_file(false)), "model.onnx_data");
        assert_eq!(
            external_data_file(graph_file(true)),
            "model_quantized.onnx_data"
        );
    }

    #[test]
    fn test_cache_layout_from_llama_config() {
        let raw = json!({"num_attention_heads": 8, "num_key_value_heads": 2, "hidden_size": 512});
        assert_eq!(
            CacheLayout::from_config(&raw),
            Some(CacheLayout {
                num_kv_heads: 2,
                head_dim: 64
            })
        );
    }

    #[test]
    fn test_cache_layout_from_gpt2_config() {
        let raw = json!({"n_head": 12, "n_embd": 768});
        assert_eq!(
            CacheLayout::from_config(&raw),
            Some(CacheLayout {
                num_kv_heads: 12,
                head_dim: 64
            })
        );
        assert_eq!(CacheLayout::from_config(&json!({})), None);
    }

    #[test]
    fn test_cache_layout_without_heads_is_none() {
        let raw = json!({"num_attention_heads": 0, "hidden_size": 512});
        assert_eq!(CacheLayout::from_config(&raw), None);
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_plain_graph_feeds() {
        let inputs = names(&["input_ids", "attention_mask", "position_ids"]);
        let feeds = plan_feeds(&inputs, None, &[5, 6, 7, 8, 9, 10], 2, 3).unwrap();

        assert_eq!(feeds.len(), 3);
        assert_eq!(
            feeds[0],
            Feed::int64("input_ids", vec![2, 3], vec![5, 6, 7, 8, 9, 10])
        );
        assert_eq!(feeds[1], Feed::int64("attention_mask", vec![2, 3], vec![1; 6]));
        assert_eq!(
            feeds[2],
            Feed::int64("position_ids", vec![2, 3], vec![0, 1, 2, 0, 1, 2])
        );
    }

    #[test]
    fn test_cached_graph_gets_empty_past() {
        let inputs = names(&[
            "input_ids",
            "past_key_values.0.key",
            "past_key_values.0.value",
            "use_cache_branch",
        ]);
        let layout = CacheLayout {
            num_kv_heads: 2,
            head_dim: 16,
        };
        let feeds = plan_feeds(&inputs, Some(layout), &[1, 2], 1, 2).unwrap();

        let names: Vec<String> = feeds.iter().map(|f| f.name.clone()).collect();
        assert_eq!(names, inputs);
        for past in &feeds[1..3] {
            assert_eq!(past.shape, vec![1, 2, 0, 16]);
            assert_eq!(past.data, FeedData::Float32(Vec::new()));
        }
        assert_eq!(feeds[3].shape, vec![1]);
        assert_eq!(feeds[3].data, FeedData::Bool(vec![false]));
    }

    #[test]
    fn test_past_inputs_need_attention_geometry() {
        let inputs = names(&["input_ids", "past_key_values.0.key"]);
        assert!(matches!(
            plan_feeds(&inputs, None, &[1], 1, 1),
            Err(Error::InferenceFailure(_))
        ));
    }

    #[test]
    fn test_unknown_graph_input_is_rejected() {
        let inputs = names(&["input_ids", "token_type_ids"]);
        let err = plan_feeds(&inputs, None, &[1, 2], 1, 2).unwrap_err();
        assert!(matches!(&err, Error::InferenceFailure(msg) if msg.contains("'token_type_ids'")));
    }

    #[test]
    fn test_ids_must_fill_the_batch() {
        let inputs = names(&["input_ids"]);
        assert!(matches!(
            plan_feeds(&inputs, None, &[1, 2, 3], 2, 2),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_missing_graph_is_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"n_ctx": 64}"#).unwrap();
        let locator = CheckpointLocator::new(dir.path().to_string_lossy(), "main", None);
        let result = OnnxModel::from_pretrained(
            &HubLoader::default(),
            &locator,
            &DeviceSpec::Cpu,
            &LoadOptions::default(),
        );
        assert!(matches!(result, Err(Error::LoadFailure(_))));
    }
}
