#![forbid(unsafe_code)]

use std::fmt;

use fb_core::{DType, DenseTensor, Device};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    Mismatch { expected: Device, actual: Device },
    NoBackend { device: Device },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch { expected, actual } => {
                write!(f, "device mismatch: expected {expected:?}, got {actual:?}")
            }
            Self::NoBackend { device } => {
                write!(f, "no kernel backend is registered for device {device:?}")
            }
        }
    }
}

impl std::error::Error for DeviceError {}

/// Execution target threaded through each reference check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceContext {
    device: Device,
    device_index: u32,
}

impl DeviceContext {
    #[must_use]
    pub const fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            device_index: 0,
        }
    }

    #[must_use]
    pub const fn cuda(device_index: u32) -> Self {
        Self {
            device: Device::Cuda,
            device_index,
        }
    }

    #[must_use]
    pub const fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub const fn device_index(&self) -> u32 {
        self.device_index
    }

    /// Whether a kernel backend for this context is compiled in.
    #[must_use]
    pub const fn has_backend(&self) -> bool {
        matches!(self.device, Device::Cpu)
    }

    /// Whether the backend computes natively in `dtype`.
    #[must_use]
    pub const fn supports_dtype(&self, dtype: DType) -> bool {
        match self.device {
            Device::Cpu => true,
            // No accelerator kernels exist; nothing is native there.
            Device::Cuda => {
                let _ = dtype;
                false
            }
        }
    }

    #[must_use]
    pub fn label(&self) -> String {
        match self.device {
            Device::Cpu => "cpu".to_string(),
            Device::Cuda => format!("cuda:{}", self.device_index),
        }
    }

    #[must_use]
    pub fn guard(&self) -> DeviceGuard {
        DeviceGuard::new(self.device)
    }

    pub fn ensure_backend(&self) -> Result<(), DeviceError> {
        if self.has_backend() {
            Ok(())
        } else {
            Err(DeviceError::NoBackend {
                device: self.device,
            })
        }
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Every context a reference check should run on.
#[must_use]
pub fn available_contexts() -> Vec<DeviceContext> {
    vec![DeviceContext::cpu()]
}

/// Accelerator-only subset of [`available_contexts`].
#[must_use]
pub fn accelerator_contexts() -> Vec<DeviceContext> {
    available_contexts()
        .into_iter()
        .filter(|context| context.device().is_accelerator())
        .collect()
}

/// Contexts whose backend handles `dtype` natively.
#[must_use]
pub fn contexts_supporting(dtype: DType) -> Vec<DeviceContext> {
    available_contexts()
        .into_iter()
        .filter(|context| context.supports_dtype(dtype))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGuard {
    device: Device,
}

impl DeviceGuard {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn ensure_tensor_device(&self, tensor: &DenseTensor) -> Result<(), DeviceError> {
        let actual = tensor.device();
        if actual != self.device {
            return Err(DeviceError::Mismatch {
                expected: self.device,
                actual,
            });
        }
        Ok(())
    }
}

/// Shared device of `tensors`, or `None` when the list is empty.
pub fn ensure_same_device(tensors: &[&DenseTensor]) -> Result<Option<Device>, DeviceError> {
    let Some(first) = tensors.first() else {
        return Ok(None);
    };
    let expected = first.device();
    for tensor in &tensors[1..] {
        if tensor.device() != expected {
            return Err(DeviceError::Mismatch {
                expected,
                actual: tensor.device(),
            });
        }
    }
    Ok(Some(expected))
}
