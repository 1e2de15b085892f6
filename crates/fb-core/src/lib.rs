#![forbid(unsafe_code)]

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

pub use half::f16;

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Element types, declared in promotion order (`Bool < I64 < F16 < F32 < F64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    Bool,
    I64,
    F16,
    F32,
    F64,
}

impl DType {
    #[must_use]
    pub const fn all() -> &'static [DType] {
        &[DType::Bool, DType::I64, DType::F16, DType::F32, DType::F64]
    }

    /// Scalar-type name as spelled in operator arguments (`type="float"`).
    #[must_use]
    pub const fn aten_name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I64 => "long",
            Self::F16 => "half",
            Self::F32 => "float",
            Self::F64 => "double",
        }
    }

    #[must_use]
    pub fn from_aten_name(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bool" => Some(Self::Bool),
            "long" | "int64" | "i64" => Some(Self::I64),
            "half" | "float16" | "f16" => Some(Self::F16),
            "float" | "float32" | "f32" => Some(Self::F32),
            "double" | "float64" | "f64" => Some(Self::F64),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_floating_point(self) -> bool {
        matches!(self, Self::F16 | Self::F32 | Self::F64)
    }

    #[must_use]
    pub const fn element_size(self) -> usize {
        match self {
            Self::Bool => 1,
            Self::F16 => 2,
            Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    #[must_use]
    pub fn promote(self, other: Self) -> Self {
        self.max(other)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.aten_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    #[must_use]
    pub const fn is_accelerator(self) -> bool {
        matches!(self, Self::Cuda)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage_offset: usize,
    dtype: DType,
    device: Device,
}

impl TensorMeta {
    #[must_use]
    pub fn scalar(dtype: DType, device: Device) -> Self {
        Self {
            shape: Vec::new(),
            strides: Vec::new(),
            storage_offset: 0,
            dtype,
            device,
        }
    }

    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            storage_offset: 0,
            dtype,
            device,
        }
    }

    pub fn from_shape_and_strides(
        shape: Vec<usize>,
        strides: Vec<usize>,
        storage_offset: usize,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let meta = Self {
            shape,
            strides,
            storage_offset,
            dtype,
            device,
        };
        meta.validate()?;
        Ok(meta)
    }

    #[must_use]
    pub fn with_storage_offset(mut self, storage_offset: usize) -> Self {
        self.storage_offset = storage_offset;
        self
    }

    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn validate(&self) -> Result<(), TensorMetaError> {
        self.max_linear_offset().map(|_| ())
    }

    fn max_linear_offset(&self) -> Result<usize, TensorMetaError> {
        if self.shape.len() != self.strides.len() {
            return Err(TensorMetaError::RankStrideMismatch {
                rank: self.shape.len(),
                strides: self.strides.len(),
            });
        }

        let mut max_linear_offset = 0usize;
        for (size, stride) in self.shape.iter().copied().zip(self.strides.iter().copied()) {
            if size == 0 {
                continue;
            }

            let span = stride
                .checked_mul(size.saturating_sub(1))
                .ok_or(TensorMetaError::StrideOverflow { size, stride })?;
            max_linear_offset = max_linear_offset.checked_add(span).ok_or(
                TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset,
                },
            )?;
        }

        self.storage_offset.checked_add(max_linear_offset).ok_or(
            TensorMetaError::StorageOffsetOverflow {
                storage_offset: self.storage_offset,
                max_linear_offset,
            },
        )
    }

    /// Minimum storage length that every logical element of this view fits into.
    pub fn required_storage_len(&self) -> Result<usize, TensorMetaError> {
        let last = self.max_linear_offset()?;
        if self.numel() == 0 {
            return Ok(0);
        }
        last.checked_add(1)
            .ok_or(TensorMetaError::StorageOffsetOverflow {
                storage_offset: self.storage_offset,
                max_linear_offset: last,
            })
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        if self.shape.is_empty() {
            return 1;
        }
        self.shape.iter().copied().product()
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        if self.shape.len() != self.strides.len() {
            return false;
        }

        let mut expected_stride = 1usize;
        for (size, stride) in self
            .shape
            .iter()
            .copied()
            .zip(self.strides.iter().copied())
            .rev()
        {
            // Singleton dimensions are contiguous regardless of stride.
            if size == 1 {
                continue;
            }
            if stride != expected_stride {
                return false;
            }
            let Some(next_expected) = expected_stride.checked_mul(size) else {
                return false;
            };
            expected_stride = next_expected;
        }
        true
    }

    pub fn storage_index_for(&self, index: &[usize]) -> Result<usize, TensorMetaError> {
        if index.len() != self.shape.len() {
            return Err(TensorMetaError::IndexRankMismatch {
                expected: self.shape.len(),
                actual: index.len(),
            });
        }

        let mut linear = self.storage_offset;
        for (dim, ((idx, dim_size), stride)) in index
            .iter()
            .copied()
            .zip(self.shape.iter().copied())
            .zip(self.strides.iter().copied())
            .enumerate()
        {
            if idx >= dim_size {
                return Err(TensorMetaError::IndexOutOfBounds {
                    dim,
                    index: idx,
                    size: dim_size,
                });
            }

            let step = idx
                .checked_mul(stride)
                .ok_or(TensorMetaError::StrideOverflow { size: idx, stride })?;
            linear = linear
                .checked_add(step)
                .ok_or(TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset: step,
                })?;
        }

        Ok(linear)
    }

    /// Storage positions of every logical element, in row-major order.
    pub fn storage_indices(&self) -> Result<Vec<usize>, TensorMetaError> {
        self.validate()?;
        let numel = self.numel();
        if numel == 0 {
            return Ok(Vec::new());
        }
        if self.is_contiguous() {
            return Ok((self.storage_offset..self.storage_offset + numel).collect());
        }

        let mut out = Vec::with_capacity(numel);
        let mut cursor = vec![0usize; self.shape.len()];
        for _ in 0..numel {
            let linear = self.storage_offset
                + cursor
                    .iter()
                    .zip(self.strides.iter())
                    .map(|(idx, stride)| idx * stride)
                    .sum::<usize>();
            out.push(linear);

            for dim in (0..cursor.len()).rev() {
                cursor[dim] += 1;
                if cursor[dim] < self.shape[dim] {
                    break;
                }
                cursor[dim] = 0;
            }
        }
        Ok(out)
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.shape.hash(&mut hasher);
        self.strides.hash(&mut hasher);
        self.storage_offset.hash(&mut hasher);
        self.dtype.hash(&mut hasher);
        self.device.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorMetaError {
    RankStrideMismatch {
        rank: usize,
        strides: usize,
    },
    StrideOverflow {
        size: usize,
        stride: usize,
    },
    StorageOffsetOverflow {
        storage_offset: usize,
        max_linear_offset: usize,
    },
    IndexRankMismatch {
        expected: usize,
        actual: usize,
    },
    IndexOutOfBounds {
        dim: usize,
        index: usize,
        size: usize,
    },
}

impl fmt::Display for TensorMetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankStrideMismatch { rank, strides } => {
                write!(f, "shape rank {rank} does not match strides rank {strides}")
            }
            Self::StrideOverflow { size, stride } => {
                write!(f, "stride overflow for size={size}, stride={stride}")
            }
            Self::StorageOffsetOverflow {
                storage_offset,
                max_linear_offset,
            } => write!(
                f,
                "storage offset overflow for storage_offset={storage_offset}, max_linear_offset={max_linear_offset}"
            ),
            Self::IndexRankMismatch { expected, actual } => {
                write!(
                    f,
                    "index rank mismatch expected={expected}, actual={actual}"
                )
            }
            Self::IndexOutOfBounds { dim, index, size } => {
                write!(
                    f,
                    "index out of bounds at dim={dim}: index={index}, size={size}"
                )
            }
        }
    }
}

impl std::error::Error for TensorMetaError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorCompatError {
    DTypeMismatch { lhs: DType, rhs: DType },
    DeviceMismatch { lhs: Device, rhs: Device },
}

impl fmt::Display for TensorCompatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DTypeMismatch { lhs, rhs } => {
                write!(f, "dtype mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::DeviceMismatch { lhs, rhs } => {
                write!(f, "device mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
        }
    }
}

impl std::error::Error for TensorCompatError {}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorStorage {
    F64(Vec<f64>),
    F32(Vec<f32>),
    F16(Vec<f16>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
}

impl TensorStorage {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F64(_) => DType::F64,
            Self::F32(_) => DType::F32,
            Self::F16(_) => DType::F16,
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F64(values) => values.len(),
            Self::F32(values) => values.len(),
            Self::F16(values) => values.len(),
            Self::I64(values) => values.len(),
            Self::Bool(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn filled(dtype: DType, len: usize, value: f64) -> Self {
        match dtype {
            DType::F64 => Self::F64(vec![value; len]),
            DType::F32 => Self::F32(vec![value as f32; len]),
            DType::F16 => Self::F16(vec![f16::from_f64(value); len]),
            DType::I64 => Self::I64(vec![value as i64; len]),
            DType::Bool => Self::Bool(vec![value != 0.0; len]),
        }
    }

    /// Narrows `f64` values into `dtype`. Integer targets truncate toward zero.
    #[must_use]
    pub fn from_f64_values(dtype: DType, values: &[f64]) -> Self {
        match dtype {
            DType::F64 => Self::F64(values.to_vec()),
            DType::F32 => Self::F32(values.iter().map(|value| *value as f32).collect()),
            DType::F16 => Self::F16(values.iter().copied().map(f16::from_f64).collect()),
            DType::I64 => Self::I64(values.iter().map(|value| *value as i64).collect()),
            DType::Bool => Self::Bool(values.iter().map(|value| *value != 0.0).collect()),
        }
    }

    #[must_use]
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Self::F64(values) => values.clone(),
            Self::F32(values) => values.iter().map(|value| f64::from(*value)).collect(),
            Self::F16(values) => values.iter().map(|value| value.to_f64()).collect(),
            Self::I64(values) => values.iter().map(|value| *value as f64).collect(),
            Self::Bool(values) => values
                .iter()
                .map(|value| if *value { 1.0 } else { 0.0 })
                .collect(),
        }
    }

    #[must_use]
    pub fn cast(&self, dtype: DType) -> Self {
        match (self, dtype) {
            (storage, target) if storage.dtype() == target => storage.clone(),
            (Self::I64(values), DType::Bool) => {
                Self::Bool(values.iter().map(|value| *value != 0).collect())
            }
            (Self::Bool(values), DType::I64) => {
                Self::I64(values.iter().map(|value| i64::from(*value)).collect())
            }
            (Self::F16(values), DType::F32) => {
                Self::F32(values.iter().map(|value| value.to_f32()).collect())
            }
            (storage, target) => Self::from_f64_values(target, &storage.to_f64_vec()),
        }
    }

    /// Picks the elements at `positions`. Callers validate positions against `len()`.
    #[must_use]
    pub fn gather(&self, positions: &[usize]) -> Self {
        match self {
            Self::F64(values) => Self::F64(positions.iter().map(|pos| values[*pos]).collect()),
            Self::F32(values) => Self::F32(positions.iter().map(|pos| values[*pos]).collect()),
            Self::F16(values) => Self::F16(positions.iter().map(|pos| values[*pos]).collect()),
            Self::I64(values) => Self::I64(positions.iter().map(|pos| values[*pos]).collect()),
            Self::Bool(values) => Self::Bool(positions.iter().map(|pos| values[*pos]).collect()),
        }
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.dtype().hash(&mut hasher);
        match self {
            Self::F64(values) => values.iter().for_each(|v| v.to_bits().hash(&mut hasher)),
            Self::F32(values) => values.iter().for_each(|v| v.to_bits().hash(&mut hasher)),
            Self::F16(values) => values.iter().for_each(|v| v.to_bits().hash(&mut hasher)),
            Self::I64(values) => values.hash(&mut hasher),
            Self::Bool(values) => values.hash(&mut hasher),
        }
        hasher.finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DenseTensorError {
    Meta(TensorMetaError),
    StorageDTypeMismatch { meta: DType, storage: DType },
    InsufficientStorage { needed: usize, available: usize },
    ElementCountMismatch { shape: Vec<usize>, expected: usize, actual: usize },
    DTypeMismatch { expected: DType, actual: DType },
}

impl fmt::Display for DenseTensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meta(error) => write!(f, "invalid tensor metadata: {error}"),
            Self::StorageDTypeMismatch { meta, storage } => write!(
                f,
                "storage dtype {storage:?} does not match metadata dtype {meta:?}"
            ),
            Self::InsufficientStorage { needed, available } => write!(
                f,
                "insufficient storage: needed={needed}, available={available}"
            ),
            Self::ElementCountMismatch {
                shape,
                expected,
                actual,
            } => write!(
                f,
                "shape {shape:?} needs {expected} elements, got {actual}"
            ),
            Self::DTypeMismatch { expected, actual } => {
                write!(f, "expected dtype {expected:?}, got {actual:?}")
            }
        }
    }
}

impl std::error::Error for DenseTensorError {}

impl From<TensorMetaError> for DenseTensorError {
    fn from(value: TensorMetaError) -> Self {
        Self::Meta(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    id: u64,
    storage_id: u64,
    meta: TensorMeta,
    storage: TensorStorage,
    version: u64,
}

impl DenseTensor {
    pub fn from_storage(meta: TensorMeta, storage: TensorStorage) -> Result<Self, DenseTensorError> {
        if storage.dtype() != meta.dtype() {
            return Err(DenseTensorError::StorageDTypeMismatch {
                meta: meta.dtype(),
                storage: storage.dtype(),
            });
        }
        let needed = meta.required_storage_len()?;
        if storage.len() < needed {
            return Err(DenseTensorError::InsufficientStorage {
                needed,
                available: storage.len(),
            });
        }

        Ok(Self {
            id: next_tensor_id(),
            storage_id: next_storage_id(),
            meta,
            storage,
            version: 0,
        })
    }

    /// Builds a contiguous tensor whose storage holds exactly `shape`'s element count.
    pub fn from_contiguous(
        shape: Vec<usize>,
        storage: TensorStorage,
        device: Device,
    ) -> Result<Self, DenseTensorError> {
        let meta = TensorMeta::from_shape(shape, storage.dtype(), device);
        if storage.len() != meta.numel() {
            return Err(DenseTensorError::ElementCountMismatch {
                shape: meta.shape().to_vec(),
                expected: meta.numel(),
                actual: storage.len(),
            });
        }
        Self::from_storage(meta, storage)
    }

    pub fn from_f64(
        values: Vec<f64>,
        shape: Vec<usize>,
        device: Device,
    ) -> Result<Self, DenseTensorError> {
        Self::from_contiguous(shape, TensorStorage::F64(values), device)
    }

    pub fn from_f32(
        values: Vec<f32>,
        shape: Vec<usize>,
        device: Device,
    ) -> Result<Self, DenseTensorError> {
        Self::from_contiguous(shape, TensorStorage::F32(values), device)
    }

    pub fn from_f16(
        values: Vec<f16>,
        shape: Vec<usize>,
        device: Device,
    ) -> Result<Self, DenseTensorError> {
        Self::from_contiguous(shape, TensorStorage::F16(values), device)
    }

    pub fn from_i64(
        values: Vec<i64>,
        shape: Vec<usize>,
        device: Device,
    ) -> Result<Self, DenseTensorError> {
        Self::from_contiguous(shape, TensorStorage::I64(values), device)
    }

    pub fn from_bool(
        values: Vec<bool>,
        shape: Vec<usize>,
        device: Device,
    ) -> Result<Self, DenseTensorError> {
        Self::from_contiguous(shape, TensorStorage::Bool(values), device)
    }

    #[must_use]
    pub fn scalar(value: f64, dtype: DType, device: Device) -> Self {
        Self {
            id: next_tensor_id(),
            storage_id: next_storage_id(),
            meta: TensorMeta::scalar(dtype, device),
            storage: TensorStorage::filled(dtype, 1, value),
            version: 0,
        }
    }

    #[must_use]
    pub fn full(shape: Vec<usize>, value: f64, dtype: DType, device: Device) -> Self {
        let meta = TensorMeta::from_shape(shape, dtype, device);
        let storage = TensorStorage::filled(dtype, meta.numel(), value);
        Self {
            id: next_tensor_id(),
            storage_id: next_storage_id(),
            meta,
            storage,
            version: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn storage_id(&self) -> u64 {
        self.storage_id
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.meta.dtype()
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.meta.device()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.meta.numel()
    }

    /// Raw backing storage, including elements outside this view.
    #[must_use]
    pub fn storage(&self) -> &TensorStorage {
        &self.storage
    }

    /// Logical elements in row-major order, independent of strides and offset.
    pub fn contiguous_storage(&self) -> Result<TensorStorage, DenseTensorError> {
        if self.meta.is_contiguous()
            && self.meta.storage_offset() == 0
            && self.storage.len() == self.meta.numel()
        {
            return Ok(self.storage.clone());
        }
        let positions = self.meta.storage_indices()?;
        Ok(self.storage.gather(&positions))
    }

    pub fn values_f64(&self) -> Result<Vec<f64>, DenseTensorError> {
        Ok(self.contiguous_storage()?.to_f64_vec())
    }

    pub fn values_i64(&self) -> Result<Vec<i64>, DenseTensorError> {
        match self.contiguous_storage()? {
            TensorStorage::I64(values) => Ok(values),
            TensorStorage::Bool(values) => Ok(values.into_iter().map(i64::from).collect()),
            other => Err(DenseTensorError::DTypeMismatch {
                expected: DType::I64,
                actual: other.dtype(),
            }),
        }
    }

    pub fn values_bool(&self) -> Result<Vec<bool>, DenseTensorError> {
        match self.contiguous_storage()? {
            TensorStorage::Bool(values) => Ok(values),
            other => Err(DenseTensorError::DTypeMismatch {
                expected: DType::Bool,
                actual: other.dtype(),
            }),
        }
    }

    /// Out-of-place result: fresh tensor and storage identity, version bumped.
    pub fn derive(
        &self,
        shape: Vec<usize>,
        storage: TensorStorage,
    ) -> Result<Self, DenseTensorError> {
        let mut out = Self::from_contiguous(shape, storage, self.device())?;
        out.version = self.version.saturating_add(1);
        Ok(out)
    }

    /// Replaces the logical contents while keeping storage identity.
    pub fn write_in_place(&mut self, storage: TensorStorage) -> Result<(), DenseTensorError> {
        if storage.dtype() != self.dtype() {
            return Err(DenseTensorError::DTypeMismatch {
                expected: self.dtype(),
                actual: storage.dtype(),
            });
        }
        if storage.len() != self.numel() {
            return Err(DenseTensorError::ElementCountMismatch {
                shape: self.shape().to_vec(),
                expected: self.numel(),
                actual: storage.len(),
            });
        }
        self.meta = TensorMeta::from_shape(self.shape().to_vec(), self.dtype(), self.device());
        self.storage = storage;
        self.version = self.version.saturating_add(1);
        Ok(())
    }

    pub fn to_dtype(&self, dtype: DType) -> Result<Self, DenseTensorError> {
        if dtype == self.dtype() {
            return Ok(self.clone());
        }
        let storage = self.contiguous_storage()?.cast(dtype);
        self.derive(self.shape().to_vec(), storage)
    }

    /// Copies the tensor onto `device`; the copy owns new storage.
    #[must_use]
    pub fn to_device(&self, device: Device) -> Self {
        if device == self.device() {
            return self.clone();
        }
        Self {
            id: next_tensor_id(),
            storage_id: next_storage_id(),
            meta: self.meta.clone().with_device(device),
            storage: self.storage.clone(),
            version: self.version,
        }
    }

    #[must_use]
    pub fn evidence_fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.id.hash(&mut hasher);
        self.storage_id.hash(&mut hasher);
        self.version.hash(&mut hasher);
        self.meta.fingerprint64().hash(&mut hasher);
        self.storage.fingerprint64().hash(&mut hasher);
        hasher.finish()
    }
}

pub fn ensure_compatible(lhs: &TensorMeta, rhs: &TensorMeta) -> Result<(), TensorCompatError> {
    if lhs.dtype() != rhs.dtype() {
        return Err(TensorCompatError::DTypeMismatch {
            lhs: lhs.dtype(),
            rhs: rhs.dtype(),
        });
    }

    if lhs.device() != rhs.device() {
        return Err(TensorCompatError::DeviceMismatch {
            lhs: lhs.device(),
            rhs: rhs.device(),
        });
    }

    Ok(())
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

fn next_tensor_id() -> u64 {
    NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed)
}

fn next_storage_id() -> u64 {
    NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        DType, DenseTensor, DenseTensorError, Device, TensorCompatError, TensorMeta,
        TensorMetaError, TensorStorage, contiguous_strides, ensure_compatible, f16,
    };

    #[test]
    fn rank_zero_metadata_validates() {
        let meta = TensorMeta::scalar(DType::F64, Device::Cpu);
        assert!(meta.validate().is_ok());
        assert!(meta.shape().is_empty());
        assert!(meta.strides().is_empty());
        assert_eq!(meta.numel(), 1);
        assert_eq!(meta.required_storage_len(), Ok(1));
        assert!(meta.is_contiguous());
    }

    #[test]
    fn row_major_strides_follow_trailing_dims() {
        let meta = TensorMeta::from_shape(vec![2, 3, 4], DType::F32, Device::Cpu);
        assert_eq!(meta.strides(), &[12, 4, 1]);
        assert_eq!(meta.numel(), 24);
        assert!(meta.is_contiguous());
    }

    #[test]
    fn size_one_dims_ignore_stride_when_checking_contiguity() {
        let meta =
            TensorMeta::from_shape_and_strides(vec![2, 1, 4], vec![4, 99, 1], 0, DType::F64, Device::Cpu)
                .expect("interior singleton stride should validate");
        assert!(meta.is_contiguous());
    }

    #[test]
    fn transposed_view_yields_column_major_storage_indices() {
        let meta =
            TensorMeta::from_shape_and_strides(vec![2, 3], vec![1, 2], 0, DType::F64, Device::Cpu)
                .expect("transposed meta should validate");
        assert!(!meta.is_contiguous());
        assert_eq!(
            meta.storage_indices().expect("indices"),
            vec![0, 2, 4, 1, 3, 5]
        );
    }

    #[test]
    fn storage_index_rejects_bad_rank_and_overflowing_coordinates() {
        let meta = TensorMeta::from_shape(vec![2, 3], DType::F64, Device::Cpu);

        let rank_err = meta
            .storage_index_for(&[1])
            .expect_err("rank mismatch should fail");
        assert!(matches!(
            rank_err,
            TensorMetaError::IndexRankMismatch {
                expected: 2,
                actual: 1
            }
        ));

        let oob_err = meta
            .storage_index_for(&[2, 0])
            .expect_err("out-of-bounds index should fail");
        assert!(matches!(
            oob_err,
            TensorMetaError::IndexOutOfBounds {
                dim: 0,
                index: 2,
                size: 2
            }
        ));
    }

    #[test]
    fn compatibility_checks_reject_dtype_and_device_mismatch() {
        let f64_cpu = TensorMeta::from_shape(vec![2], DType::F64, Device::Cpu);
        let f32_cpu = TensorMeta::from_shape(vec![2], DType::F32, Device::Cpu);
        let f64_cuda = TensorMeta::from_shape(vec![2], DType::F64, Device::Cuda);

        assert!(ensure_compatible(&f64_cpu, &f64_cpu).is_ok());
        assert!(matches!(
            ensure_compatible(&f64_cpu, &f32_cpu),
            Err(TensorCompatError::DTypeMismatch {
                lhs: DType::F64,
                rhs: DType::F32
            })
        ));
        assert!(matches!(
            ensure_compatible(&f64_cpu, &f64_cuda),
            Err(TensorCompatError::DeviceMismatch {
                lhs: Device::Cpu,
                rhs: Device::Cuda
            })
        ));
    }

    #[test]
    fn dtype_names_parse_and_promote() {
        for dtype in DType::all() {
            assert_eq!(DType::from_aten_name(dtype.aten_name()), Some(*dtype));
        }
        assert_eq!(DType::from_aten_name("Float"), Some(DType::F32));
        assert_eq!(DType::from_aten_name("complex"), None);
        assert_eq!(DType::F16.promote(DType::F32), DType::F32);
        assert_eq!(DType::I64.promote(DType::Bool), DType::I64);
        assert!(DType::F16.is_floating_point());
        assert!(!DType::I64.is_floating_point());
    }

    #[test]
    fn contiguous_constructor_rejects_element_count_mismatch() {
        let err = DenseTensor::from_f64(vec![1.0, 2.0, 3.0], vec![2, 2], Device::Cpu)
            .expect_err("3 values cannot fill a 2x2 tensor");
        assert!(matches!(
            err,
            DenseTensorError::ElementCountMismatch {
                expected: 4,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn from_storage_rejects_dtype_and_length_violations() {
        let meta = TensorMeta::from_shape(vec![3], DType::F32, Device::Cpu);
        let err = DenseTensor::from_storage(meta.clone(), TensorStorage::F64(vec![0.0; 3]))
            .expect_err("dtype mismatch must fail closed");
        assert!(matches!(err, DenseTensorError::StorageDTypeMismatch { .. }));

        let err = DenseTensor::from_storage(
            meta.with_storage_offset(2),
            TensorStorage::F32(vec![0.0; 4]),
        )
        .expect_err("offset view over short storage must fail closed");
        assert!(matches!(
            err,
            DenseTensorError::InsufficientStorage {
                needed: 5,
                available: 4
            }
        ));
    }

    #[test]
    fn strided_view_gathers_logical_values() {
        let meta =
            TensorMeta::from_shape_and_strides(vec![2, 2], vec![1, 2], 1, DType::F64, Device::Cpu)
                .expect("meta should validate");
        let tensor =
            DenseTensor::from_storage(meta, TensorStorage::F64(vec![9.0, 1.0, 2.0, 3.0, 4.0]))
                .expect("view should build");
        assert_eq!(
            tensor.values_f64().expect("values"),
            vec![1.0, 3.0, 2.0, 4.0]
        );
    }

    #[test]
    fn bridge_output_tensor_owns_fresh_storage() {
        let source = DenseTensor::from_f64(vec![1.0, 2.0], vec![2], Device::Cpu)
            .expect("source should build");
        let derived = source
            .derive(vec![2], TensorStorage::F64(vec![3.0, 4.0]))
            .expect("derive should succeed");

        assert_ne!(source.id(), derived.id());
        assert_ne!(source.storage_id(), derived.storage_id());
        assert_eq!(derived.version(), source.version() + 1);
    }

    #[test]
    fn in_place_write_keeps_storage_identity() {
        let mut tensor = DenseTensor::from_f32(vec![1.0, 2.0], vec![2], Device::Cpu)
            .expect("tensor should build");
        let storage_id = tensor.storage_id();
        let before = tensor.evidence_fingerprint64();

        tensor
            .write_in_place(TensorStorage::F32(vec![5.0, 6.0]))
            .expect("in-place write should succeed");

        assert_eq!(tensor.storage_id(), storage_id);
        assert_eq!(tensor.version(), 1);
        assert_ne!(before, tensor.evidence_fingerprint64());

        let err = tensor
            .write_in_place(TensorStorage::F64(vec![0.0, 0.0]))
            .expect_err("dtype change must fail closed");
        assert!(matches!(err, DenseTensorError::DTypeMismatch { .. }));
    }

    #[test]
    fn half_storage_rounds_on_construction() {
        let storage = TensorStorage::from_f64_values(DType::F16, &[1.0, 0.1]);
        let TensorStorage::F16(values) = &storage else {
            panic!("expected half storage");
        };
        assert_eq!(values[0], f16::from_f32(1.0));
        assert_eq!(values[1], f16::from_f64(0.1));
        assert_eq!(storage.cast(DType::F32).dtype(), DType::F32);
    }

    #[test]
    fn integer_accessors_reject_floating_tensors() {
        let tensor = DenseTensor::from_f64(vec![1.0], vec![1], Device::Cpu).expect("tensor");
        assert!(matches!(
            tensor.values_i64(),
            Err(DenseTensorError::DTypeMismatch {
                expected: DType::I64,
                actual: DType::F64
            })
        ));
        let mask = DenseTensor::from_bool(vec![true, false], vec![2], Device::Cpu).expect("mask");
        assert_eq!(mask.values_i64().expect("bool widens"), vec![1, 0]);
    }

    #[test]
    fn device_copy_gets_new_storage() {
        let tensor = DenseTensor::full(vec![2], 1.0, DType::F32, Device::Cpu);
        let moved = tensor.to_device(Device::Cuda);
        assert_eq!(moved.device(), Device::Cuda);
        assert_ne!(moved.storage_id(), tensor.storage_id());
        assert_eq!(moved.values_f64().expect("values"), vec![1.0, 1.0]);
    }

    #[test]
    fn zero_rank_shape_has_no_strides() {
        assert_eq!(contiguous_strides(&[]), Vec::<usize>::new());
    }

    proptest! {
        #[test]
        fn prop_contiguous_stride_contract(shape in prop::collection::vec(1usize..=4, 1..=4)) {
            let strides = contiguous_strides(shape.as_slice());
            prop_assert_eq!(strides.len(), shape.len());
            prop_assert_eq!(strides.last().copied(), Some(1));
            for dim in 1..shape.len() {
                prop_assert_eq!(strides[dim - 1], strides[dim] * shape[dim]);
            }
        }

        #[test]
        fn prop_storage_indices_cover_numel(shape in prop::collection::vec(1usize..=4, 1..=4)) {
            let meta = TensorMeta::from_shape(shape.clone(), DType::F64, Device::Cpu);
            let indices = meta.storage_indices().expect("contiguous indices");
            let expected: usize = shape.iter().copied().product();
            prop_assert_eq!(indices.len(), expected);
            prop_assert_eq!(meta.required_storage_len().expect("len"), expected);
            prop_assert!(indices.iter().copied().eq(0..expected));
        }

        #[test]
        fn prop_small_integers_survive_float_casts(values in prop::collection::vec(-1_000i64..1_000, 1..16)) {
            let storage = TensorStorage::I64(values.clone());
            for dtype in [DType::F16, DType::F32, DType::F64] {
                let back = storage.cast(dtype).cast(DType::I64);
                prop_assert_eq!(&back, &storage);
                prop_assert_eq!(back.fingerprint64(), storage.fingerprint64());
            }
        }

        #[test]
        fn prop_rank_stride_mismatch_fail_closed(
            shape in prop::collection::vec(1usize..=4, 1..=4),
            extra in 1usize..=3,
        ) {
            let strides = vec![1usize; shape.len() + extra];
            let err = TensorMeta::from_shape_and_strides(
                shape.clone(),
                strides,
                0,
                DType::F64,
                Device::Cpu,
            )
            .expect_err("rank/stride mismatch must fail");

            match err {
                TensorMetaError::RankStrideMismatch { .. } => {}
                other => prop_assert!(false, "expected RankStrideMismatch, got {other:?}"),
            }
        }
    }
}
