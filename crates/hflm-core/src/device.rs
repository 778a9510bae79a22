//! Device enumeration, resolution and dtype selection.
//!
//! Device strings follow the `cpu`, `<accel>` and `<accel>:<index>` form,
//! where `<accel>` is `cuda` or `metal` depending on the platform.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, DeviceLocation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Upper bound when probing CUDA ordinals.
const MAX_PROBED_ACCELERATORS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AcceleratorKind {
    Cuda,
    Metal,
}

impl AcceleratorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Metal => "metal",
        }
    }

    /// Accelerator family this platform would use.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "macos") {
            Self::Metal
        } else {
            Self::Cuda
        }
    }
}

/// A logical compute target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceSpec {
    Cpu,
    Accelerator {
        kind: AcceleratorKind,
        ordinal: Option<usize>,
    },
}

impl DeviceSpec {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu)
    }

    pub fn is_accelerator(&self) -> bool {
        !self.is_cpu()
    }

    /// Materialize the candle device.
    pub fn to_candle(&self) -> Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Accelerator {
                kind: AcceleratorKind::Cuda,
                ordinal,
            } => Device::new_cuda(ordinal.unwrap_or(0))
                .map_err(|e| Error::load(format!("Opening device {self}"), e)),
            Self::Accelerator {
                kind: AcceleratorKind::Metal,
                ordinal,
            } => Device::new_metal(ordinal.unwrap_or(0))
                .map_err(|e| Error::load(format!("Opening device {self}"), e)),
        }
    }

    /// Placement of an already constructed tensor or model.
    pub fn from_candle(device: &Device) -> Self {
        match device.location() {
            DeviceLocation::Cpu => Self::Cpu,
            DeviceLocation::Cuda { gpu_id } => Self::Accelerator {
                kind: AcceleratorKind::Cuda,
                ordinal: Some(gpu_id),
            },
            DeviceLocation::Metal { gpu_id } => Self::Accelerator {
                kind: AcceleratorKind::Metal,
                ordinal: Some(gpu_id),
            },
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Accelerator {
                kind,
                ordinal: None,
            } => f.write_str(kind.name()),
            Self::Accelerator {
                kind,
                ordinal: Some(idx),
            } => write!(f, "{}:{idx}", kind.name()),
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "cpu" {
            return Ok(Self::Cpu);
        }
        let (family, ordinal) = match s.split_once(':') {
            Some((family, idx)) => {
                let idx = idx
                    .parse::<usize>()
                    .map_err(|_| Error::InvalidArgument(format!("Invalid device '{s}'")))?;
                (family, Some(idx))
            }
            None => (s, None),
        };
        let kind = match family {
            "cuda" => AcceleratorKind::Cuda,
            "metal" => AcceleratorKind::Metal,
            _ => return Err(Error::InvalidArgument(format!("Invalid device '{s}'"))),
        };
        Ok(Self::Accelerator { kind, ordinal })
    }
}

/// What to pick when the requested device is absent or not recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFallback {
    /// First visible accelerator, else CPU.
    PreferAccelerator,
    Cpu,
}

/// Accelerators visible to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleDevices {
    pub kind: AcceleratorKind,
    pub count: usize,
}

impl VisibleDevices {
    pub fn none() -> Self {
        Self {
            kind: AcceleratorKind::platform_default(),
            count: 0,
        }
    }

    pub fn detect() -> Self {
        let kind = AcceleratorKind::platform_default();
        let count = match kind {
            AcceleratorKind::Metal => {
                if candle_core::utils::metal_is_available() && probe(kind, 0) {
                    1
                } else {
                    0
                }
            }
            AcceleratorKind::Cuda => {
                if candle_core::utils::cuda_is_available() {
                    (0..MAX_PROBED_ACCELERATORS)
                        .take_while(|idx| probe(kind, *idx))
                        .count()
                } else {
                    0
                }
            }
        };
        debug!("Detected {count} visible {} device(s)", kind.name());
        Self { kind, count }
    }

    pub fn any(&self) -> bool {
        self.count > 0
    }

    /// The enumerated set of acceptable device strings.
    ///
    /// The bare accelerator name is always part of the set, even when no
    /// accelerator is visible.
    pub fn valid_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        names.insert("cpu".to_string());
        names.insert(self.kind.name().to_string());
        for idx in 0..self.count {
            names.insert(format!("{}:{idx}", self.kind.name()));
        }
        names
    }
}

fn probe(kind: AcceleratorKind, ordinal: usize) -> bool {
    std::panic::catch_unwind(|| match kind {
        AcceleratorKind::Cuda => Device::new_cuda(ordinal).is_ok(),
        AcceleratorKind::Metal => Device::new_metal(ordinal).is_ok(),
    })
    .unwrap_or(false)
}

/// Pick the device for a load request.
///
/// A requested name inside the enumerated set is used verbatim; anything
/// else (including no request) takes the fallback.
pub fn resolve_device(
    requested: Option<&str>,
    visible: &VisibleDevices,
    fallback: DeviceFallback,
) -> DeviceSpec {
    if let Some(name) = requested.map(str::trim).filter(|n| !n.is_empty()) {
        if visible.valid_names().contains(name) {
            if let Ok(spec) = name.parse::<DeviceSpec>() {
                info!("Using device '{spec}'");
                return spec;
            }
        }
        warn!("Device '{name}' is not available, falling back");
    } else {
        info!("Device not specified");
    }

    let resolved = match fallback {
        DeviceFallback::PreferAccelerator if visible.any() => DeviceSpec::Accelerator {
            kind: visible.kind,
            ordinal: Some(0),
        },
        _ => DeviceSpec::Cpu,
    };
    info!(
        "Accelerator available: {}, using '{resolved}'",
        visible.any()
    );
    resolved
}

/// Numeric precision requested for the weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Precision {
    /// Use the precision stored with the checkpoint.
    #[default]
    Auto,
    F32,
    F16,
    BF16,
}

impl Precision {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "float32" | "fp32" | "f32" | "float" => Ok(Self::F32),
            "float16" | "fp16" | "f16" | "half" => Ok(Self::F16),
            "bfloat16" | "bf16" => Ok(Self::BF16),
            other => Err(Error::InvalidArgument(format!("Unknown dtype '{other}'"))),
        }
    }

    fn dtype(&self) -> Option<DType> {
        match self {
            Self::Auto => None,
            Self::F32 => Some(DType::F32),
            Self::F16 => Some(DType::F16),
            Self::BF16 => Some(DType::BF16),
        }
    }

    /// Select the dtype weights are loaded and computed in.
    ///
    /// `Auto` defers to the checkpoint's `torch_dtype`. CPU and Metal compute
    /// in F32 whatever is requested. `reduced` asks for the narrowest float
    /// the device handles when nothing explicit was requested.
    pub fn select_dtype(
        &self,
        checkpoint_dtype: Option<&str>,
        device: &DeviceSpec,
        reduced: bool,
    ) -> DType {
        let requested = match self.dtype() {
            Some(dtype) => Some(dtype),
            None => checkpoint_dtype
                .and_then(|raw| Precision::parse(raw).ok())
                .and_then(|p| p.dtype()),
        };

        let dtype = match device {
            DeviceSpec::Cpu
            | DeviceSpec::Accelerator {
                kind: AcceleratorKind::Metal,
                ..
            } => {
                if reduced {
                    warn!("Reduced-precision loading is not supported on {device}; using F32");
                }
                DType::F32
            }
            DeviceSpec::Accelerator {
                kind: AcceleratorKind::Cuda,
                ..
            } => match (self, requested) {
                (Precision::Auto, _) if reduced => {
                    warn!("8-bit loading is unavailable; loading weights in F16 instead");
                    DType::F16
                }
                (_, Some(dtype)) => dtype,
                (_, None) => DType::F32,
            },
        };

        debug!(
            "Selected dtype {:?} for device {} (requested: {:?}, checkpoint: {:?})",
            dtype, device, self, checkpoint_dtype
        );
        dtype
    }
}

impl TryFrom<String> for Precision {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Precision> for String {
    fn from(value: Precision) -> Self {
        match value {
            Precision::Auto => "auto",
            Precision::F32 => "float32",
            Precision::F16 => "float16",
            Precision::BF16 => "bfloat16",
        }
        .to_string()
    }
}
