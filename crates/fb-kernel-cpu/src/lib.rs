#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;

use fb_core::{
    DType, DenseTensor, DenseTensorError, Device, TensorCompatError, TensorStorage,
    contiguous_strides, ensure_compatible, f16,
};

#[derive(Debug, Clone, PartialEq)]
pub enum KernelError {
    Incompatible(TensorCompatError),
    Tensor(DenseTensorError),
    ShapeMismatch {
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    UnsupportedDType {
        op: &'static str,
        dtype: DType,
    },
    NonIntegralScalar {
        op: &'static str,
        name: &'static str,
        value: f64,
    },
    DimOutOfRange {
        dim: i64,
        rank: usize,
    },
    DuplicateDim {
        dim: usize,
    },
    NegativeSize {
        dim: usize,
        size: i64,
    },
    SizeOverflow {
        size: Vec<usize>,
    },
    NoIndices,
    ZeroDimMask,
    TooManyIndices {
        rank: usize,
        indexed: usize,
    },
    MaskShapeMismatch {
        mask: Vec<usize>,
        indexed: Vec<usize>,
        start_dim: usize,
    },
    IndexBroadcastMismatch {
        lengths: Vec<usize>,
    },
    IndexOutOfBounds {
        dim: usize,
        index: i64,
        size: usize,
    },
    ValuesShapeMismatch {
        selected: usize,
        trailing: usize,
        values: usize,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incompatible(error) => write!(f, "incompatible tensors: {error}"),
            Self::Tensor(error) => write!(f, "tensor access failure: {error}"),
            Self::ShapeMismatch { lhs, rhs } => {
                write!(f, "shape mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::UnsupportedDType { op, dtype } => {
                write!(f, "{op} does not support dtype {dtype:?}")
            }
            Self::NonIntegralScalar { op, name, value } => {
                write!(f, "{op} requires an integral {name} for integer tensors, got {value}")
            }
            Self::DimOutOfRange { dim, rank } => {
                write!(f, "dim {dim} out of range for tensor of rank {rank}")
            }
            Self::DuplicateDim { dim } => write!(f, "dim {dim} appears multiple times"),
            Self::NegativeSize { dim, size } => {
                write!(f, "negative size {size} at dim {dim}")
            }
            Self::SizeOverflow { size } => {
                write!(f, "size {size:?} exceeds the addressable element count")
            }
            Self::NoIndices => write!(f, "index_put requires at least one index tensor"),
            Self::ZeroDimMask => write!(f, "zero-dim boolean masks are not supported"),
            Self::TooManyIndices { rank, indexed } => write!(
                f,
                "too many indices: tensor rank {rank}, indexed dims {indexed}"
            ),
            Self::MaskShapeMismatch {
                mask,
                indexed,
                start_dim,
            } => write!(
                f,
                "mask shape {mask:?} does not match indexed shape {indexed:?} starting at dim {start_dim}"
            ),
            Self::IndexBroadcastMismatch { lengths } => {
                write!(f, "index lists cannot be broadcast together: lengths={lengths:?}")
            }
            Self::IndexOutOfBounds { dim, index, size } => {
                write!(f, "index {index} is out of bounds for dim {dim} with size {size}")
            }
            Self::ValuesShapeMismatch {
                selected,
                trailing,
                values,
            } => write!(
                f,
                "values with {values} elements cannot fill {selected} selected positions of {trailing} elements"
            ),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<TensorCompatError> for KernelError {
    fn from(value: TensorCompatError) -> Self {
        Self::Incompatible(value)
    }
}

impl From<DenseTensorError> for KernelError {
    fn from(value: DenseTensorError) -> Self {
        Self::Tensor(value)
    }
}

fn ensure_same_shape(lhs: &DenseTensor, rhs: &DenseTensor) -> Result<(), KernelError> {
    if lhs.shape() != rhs.shape() {
        return Err(KernelError::ShapeMismatch {
            lhs: lhs.shape().to_vec(),
            rhs: rhs.shape().to_vec(),
        });
    }
    Ok(())
}

fn integral_scalar(op: &'static str, name: &'static str, value: f64) -> Result<i64, KernelError> {
    if value.fract() != 0.0 || !value.is_finite() {
        return Err(KernelError::NonIntegralScalar { op, name, value });
    }
    Ok(value as i64)
}

/// Wraps a possibly negative `dim` into `0..rank`. Zero-dim tensors accept `0` and `-1`.
pub fn normalize_dim(dim: i64, rank: usize) -> Result<usize, KernelError> {
    let effective_rank = rank.max(1) as i64;
    let wrapped = if dim < 0 { dim + effective_rank } else { dim };
    if !(0..effective_rank).contains(&wrapped) {
        return Err(KernelError::DimOutOfRange { dim, rank });
    }
    Ok(wrapped as usize)
}

/// `lhs + alpha * rhs` over identically shaped tensors.
pub fn add_tensor(
    lhs: &DenseTensor,
    rhs: &DenseTensor,
    alpha: f64,
) -> Result<DenseTensor, KernelError> {
    ensure_compatible(lhs.meta(), rhs.meta())?;
    ensure_same_shape(lhs, rhs)?;

    let storage = match (lhs.contiguous_storage()?, rhs.contiguous_storage()?) {
        (TensorStorage::F64(left), TensorStorage::F64(right)) => TensorStorage::F64(
            left.iter()
                .zip(right.iter())
                .map(|(l, r)| l + alpha * r)
                .collect(),
        ),
        (TensorStorage::F32(left), TensorStorage::F32(right)) => {
            let alpha = alpha as f32;
            TensorStorage::F32(
                left.iter()
                    .zip(right.iter())
                    .map(|(l, r)| l + alpha * r)
                    .collect(),
            )
        }
        (TensorStorage::F16(left), TensorStorage::F16(right)) => {
            // Half operands widen to f32 and round once on the way back.
            let alpha = alpha as f32;
            TensorStorage::F16(
                left.iter()
                    .zip(right.iter())
                    .map(|(l, r)| f16::from_f32(l.to_f32() + alpha * r.to_f32()))
                    .collect(),
            )
        }
        (TensorStorage::I64(left), TensorStorage::I64(right)) => {
            let alpha = integral_scalar("add", "alpha", alpha)?;
            TensorStorage::I64(
                left.iter()
                    .zip(right.iter())
                    .map(|(l, r)| l.wrapping_add(alpha.wrapping_mul(*r)))
                    .collect(),
            )
        }
        (other, _) => {
            return Err(KernelError::UnsupportedDType {
                op: "add",
                dtype: other.dtype(),
            });
        }
    };

    Ok(lhs.derive(lhs.shape().to_vec(), storage)?)
}

fn pow_f64(base: f64, exponent: f64) -> f64 {
    // Exponent 2 lowers to a multiply, matching `square`.
    if exponent == 2.0 {
        base * base
    } else {
        base.powf(exponent)
    }
}

fn pow_f32(base: f32, exponent: f32) -> f32 {
    if exponent == 2.0 {
        base * base
    } else {
        base.powf(exponent)
    }
}

pub fn pow_scalar(input: &DenseTensor, exponent: f64) -> Result<DenseTensor, KernelError> {
    let storage = match input.contiguous_storage()? {
        TensorStorage::F64(values) => {
            TensorStorage::F64(values.iter().map(|v| pow_f64(*v, exponent)).collect())
        }
        TensorStorage::F32(values) => {
            let exponent = exponent as f32;
            TensorStorage::F32(values.iter().map(|v| pow_f32(*v, exponent)).collect())
        }
        TensorStorage::F16(values) => {
            let exponent = exponent as f32;
            TensorStorage::F16(
                values
                    .iter()
                    .map(|v| f16::from_f32(pow_f32(v.to_f32(), exponent)))
                    .collect(),
            )
        }
        TensorStorage::I64(values) => {
            let exponent = integral_scalar("pow", "exponent", exponent)?;
            let exponent = u32::try_from(exponent).map_err(|_| KernelError::NonIntegralScalar {
                op: "pow",
                name: "non-negative exponent",
                value: exponent as f64,
            })?;
            TensorStorage::I64(values.iter().map(|v| v.wrapping_pow(exponent)).collect())
        }
        TensorStorage::Bool(_) => {
            return Err(KernelError::UnsupportedDType {
                op: "pow",
                dtype: DType::Bool,
            });
        }
    };

    Ok(input.derive(input.shape().to_vec(), storage)?)
}

enum SortKeys {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Bool(Vec<bool>),
}

impl SortKeys {
    fn from_storage(storage: &TensorStorage) -> Self {
        match storage {
            TensorStorage::I64(values) => Self::Int(values.clone()),
            TensorStorage::Bool(values) => Self::Bool(values.clone()),
            other => Self::Float(other.to_f64_vec()),
        }
    }

    fn compare(&self, lhs: usize, rhs: usize) -> Ordering {
        match self {
            Self::Float(values) => compare_nan_last(values[lhs], values[rhs]),
            Self::Int(values) => values[lhs].cmp(&values[rhs]),
            Self::Bool(values) => values[lhs].cmp(&values[rhs]),
        }
    }
}

/// Total order with NaN greater than every number.
fn compare_nan_last(lhs: f64, rhs: f64) -> Ordering {
    match (lhs.is_nan(), rhs.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => lhs.partial_cmp(&rhs).unwrap_or(Ordering::Equal),
    }
}

/// Stable sort along `dim`; returns `(values, indices)` with `I64` indices.
pub fn sort(
    input: &DenseTensor,
    dim: i64,
    descending: bool,
) -> Result<(DenseTensor, DenseTensor), KernelError> {
    let shape = input.shape().to_vec();
    let dim = normalize_dim(dim, shape.len())?;
    let storage = input.contiguous_storage()?;
    let numel = storage.len();

    let (outer, size, inner) = if shape.is_empty() {
        (1, 1, 1)
    } else {
        (
            shape[..dim].iter().product::<usize>(),
            shape[dim],
            shape[dim + 1..].iter().product::<usize>(),
        )
    };

    let keys = SortKeys::from_storage(&storage);
    let mut source_positions = vec![0usize; numel];
    let mut index_values = vec![0i64; numel];
    let mut line: Vec<usize> = Vec::with_capacity(size);

    if numel > 0 {
        for o in 0..outer {
            for i in 0..inner {
                let base = o * size * inner + i;
                line.clear();
                line.extend(0..size);
                line.sort_by(|a, b| {
                    let ordering = keys.compare(base + a * inner, base + b * inner);
                    if descending {
                        ordering.reverse()
                    } else {
                        ordering
                    }
                });
                for (rank, src) in line.iter().copied().enumerate() {
                    let dst = base + rank * inner;
                    source_positions[dst] = base + src * inner;
                    index_values[dst] = src as i64;
                }
            }
        }
    }

    let values = input.derive(shape.clone(), storage.gather(&source_positions))?;
    let indices = input.derive(shape, TensorStorage::I64(index_values))?;
    Ok((values, indices))
}

fn default_sum_dtype(dtype: DType) -> DType {
    if dtype.is_floating_point() {
        dtype
    } else {
        DType::I64
    }
}

enum Accumulator {
    Float(Vec<f64>),
    Int(Vec<i64>),
}

fn accumulate_into(
    input: &DenseTensor,
    out_dtype: DType,
    buckets: usize,
    bucket_of: impl Fn(usize) -> usize,
) -> Result<TensorStorage, KernelError> {
    if out_dtype == DType::Bool {
        return Err(KernelError::UnsupportedDType {
            op: "sum",
            dtype: out_dtype,
        });
    }
    let storage = input.contiguous_storage()?;
    let mut acc = if out_dtype.is_floating_point() {
        Accumulator::Float(vec![0.0; buckets])
    } else {
        Accumulator::Int(vec![0; buckets])
    };

    match &mut acc {
        Accumulator::Float(sums) => {
            // Floating sums accumulate in f64 and narrow once at the end.
            for (flat, value) in storage.to_f64_vec().into_iter().enumerate() {
                sums[bucket_of(flat)] += value;
            }
        }
        Accumulator::Int(sums) => {
            let TensorStorage::I64(values) = storage.cast(DType::I64) else {
                return Err(KernelError::UnsupportedDType {
                    op: "sum",
                    dtype: storage.dtype(),
                });
            };
            for (flat, value) in values.into_iter().enumerate() {
                let slot = &mut sums[bucket_of(flat)];
                *slot = slot.wrapping_add(value);
            }
        }
    }

    Ok(match acc {
        Accumulator::Float(sums) => TensorStorage::from_f64_values(out_dtype, &sums),
        Accumulator::Int(sums) => TensorStorage::I64(sums),
    })
}

/// Total reduction to a zero-dim tensor.
pub fn sum_all(input: &DenseTensor, dtype: Option<DType>) -> Result<DenseTensor, KernelError> {
    let out_dtype = dtype.unwrap_or_else(|| default_sum_dtype(input.dtype()));
    let storage = accumulate_into(input, out_dtype, 1, |_| 0)?;
    Ok(input.derive(Vec::new(), storage)?)
}

/// Reduction over `dims`. An empty `dims` list reduces every dimension.
pub fn sum_dims(
    input: &DenseTensor,
    dims: &[i64],
    keepdim: bool,
    dtype: Option<DType>,
) -> Result<DenseTensor, KernelError> {
    let shape = input.shape().to_vec();
    let rank = shape.len();
    let mut reduced = vec![dims.is_empty(); rank];
    for dim in dims {
        let dim = normalize_dim(*dim, rank)?;
        if rank == 0 {
            continue;
        }
        if reduced[dim] {
            return Err(KernelError::DuplicateDim { dim });
        }
        reduced[dim] = true;
    }

    let kept_shape: Vec<usize> = shape
        .iter()
        .zip(reduced.iter())
        .map(|(size, is_reduced)| if *is_reduced { 1 } else { *size })
        .collect();
    let out_shape: Vec<usize> = if keepdim {
        kept_shape.clone()
    } else {
        shape
            .iter()
            .zip(reduced.iter())
            .filter(|(_, is_reduced)| !**is_reduced)
            .map(|(size, _)| *size)
            .collect()
    };

    let in_strides = contiguous_strides(&shape);
    let out_strides = contiguous_strides(&kept_shape);
    let buckets = kept_shape.iter().product::<usize>();
    let bucket_of = |flat: usize| {
        let mut bucket = 0usize;
        for dim in 0..rank {
            let coord = (flat / in_strides[dim]) % shape[dim];
            if !reduced[dim] {
                bucket += coord * out_strides[dim];
            }
        }
        bucket
    };

    let out_dtype = dtype.unwrap_or_else(|| default_sum_dtype(input.dtype()));
    let storage = accumulate_into(input, out_dtype, buckets, bucket_of)?;
    Ok(input.derive(out_shape, storage)?)
}

fn checked_sizes(size: &[i64]) -> Result<Vec<usize>, KernelError> {
    let shape = size
        .iter()
        .enumerate()
        .map(|(dim, value)| {
            usize::try_from(*value).map_err(|_| KernelError::NegativeSize { dim, size: *value })
        })
        .collect::<Result<Vec<_>, _>>()?;

    // Strides are suffix products; check each one even when a dim is zero.
    let overflow = || KernelError::SizeOverflow {
        size: shape.clone(),
    };
    let mut numel = 1usize;
    for dim in shape.iter().rev() {
        numel = numel.checked_mul(*dim).ok_or_else(overflow)?;
    }
    let bytes = numel
        .checked_mul(std::mem::size_of::<f64>())
        .ok_or_else(overflow)?;
    if bytes > isize::MAX as usize {
        return Err(overflow());
    }
    Ok(shape)
}

pub fn fill(
    size: &[i64],
    value: f64,
    dtype: DType,
    device: Device,
) -> Result<DenseTensor, KernelError> {
    let shape = checked_sizes(size)?;
    Ok(DenseTensor::full(shape, value, dtype, device))
}

pub fn ones(size: &[i64], dtype: DType, device: Device) -> Result<DenseTensor, KernelError> {
    fill(size, 1.0, dtype, device)
}

pub fn zeros(size: &[i64], dtype: DType, device: Device) -> Result<DenseTensor, KernelError> {
    fill(size, 0.0, dtype, device)
}

/// `(destination position, values position)` pairs in assignment order.
fn index_put_plan(
    base: &DenseTensor,
    indices: &[&DenseTensor],
    values: &DenseTensor,
) -> Result<Vec<(usize, usize)>, KernelError> {
    if indices.is_empty() {
        return Err(KernelError::NoIndices);
    }
    ensure_compatible(base.meta(), values.meta())?;

    let shape = base.shape();
    let rank = shape.len();
    let mut coords: Vec<Vec<i64>> = Vec::new();

    for index in indices {
        if index.device() != base.device() {
            return Err(KernelError::Incompatible(TensorCompatError::DeviceMismatch {
                lhs: base.device(),
                rhs: index.device(),
            }));
        }
        let start_dim = coords.len();
        match index.dtype() {
            DType::Bool => {
                let mask_shape = index.shape();
                if mask_shape.is_empty() {
                    return Err(KernelError::ZeroDimMask);
                }
                let end_dim = start_dim + mask_shape.len();
                if end_dim > rank {
                    return Err(KernelError::TooManyIndices {
                        rank,
                        indexed: end_dim,
                    });
                }
                if mask_shape != &shape[start_dim..end_dim] {
                    return Err(KernelError::MaskShapeMismatch {
                        mask: mask_shape.to_vec(),
                        indexed: shape[start_dim..end_dim].to_vec(),
                        start_dim,
                    });
                }

                let mask_strides = contiguous_strides(mask_shape);
                let mut per_dim = vec![Vec::new(); mask_shape.len()];
                for (flat, selected) in index.values_bool()?.into_iter().enumerate() {
                    if !selected {
                        continue;
                    }
                    for (axis, coord_list) in per_dim.iter_mut().enumerate() {
                        coord_list.push(((flat / mask_strides[axis]) % mask_shape[axis]) as i64);
                    }
                }
                coords.extend(per_dim);
            }
            DType::I64 => {
                if start_dim + 1 > rank {
                    return Err(KernelError::TooManyIndices {
                        rank,
                        indexed: start_dim + 1,
                    });
                }
                coords.push(index.values_i64()?);
            }
            other => {
                return Err(KernelError::UnsupportedDType {
                    op: "index_put indices",
                    dtype: other,
                });
            }
        }
    }

    let lengths: Vec<usize> = coords.iter().map(Vec::len).collect();
    let mut selected = 1usize;
    for length in lengths.iter().copied().filter(|length| *length != 1) {
        if selected != 1 && selected != length {
            return Err(KernelError::IndexBroadcastMismatch { lengths });
        }
        selected = length;
    }

    let indexed_dims = coords.len();
    let strides = contiguous_strides(shape);
    let trailing = shape[indexed_dims..].iter().product::<usize>();
    let value_count = values.numel();
    let value_stride = if value_count == selected * trailing {
        trailing
    } else if value_count == trailing {
        0
    } else if value_count == 1 {
        0
    } else {
        return Err(KernelError::ValuesShapeMismatch {
            selected,
            trailing,
            values: value_count,
        });
    };
    let per_element = value_count != 1;

    let mut plan = Vec::with_capacity(selected * trailing);
    for k in 0..selected {
        let mut head = 0usize;
        for (dim, coord_list) in coords.iter().enumerate() {
            let raw = if coord_list.len() == 1 {
                coord_list[0]
            } else {
                coord_list[k]
            };
            let size = shape[dim];
            let wrapped = if raw < 0 { raw + size as i64 } else { raw };
            if wrapped < 0 || wrapped as usize >= size {
                return Err(KernelError::IndexOutOfBounds {
                    dim,
                    index: raw,
                    size,
                });
            }
            head += wrapped as usize * strides.get(dim).copied().unwrap_or(1);
        }
        for t in 0..trailing {
            let source = if per_element { k * value_stride + t } else { 0 };
            plan.push((head + t, source));
        }
    }
    Ok(plan)
}

fn add_f64(lhs: f64, rhs: f64) -> f64 {
    lhs + rhs
}

fn add_f32(lhs: f32, rhs: f32) -> f32 {
    lhs + rhs
}

fn add_f16(lhs: f16, rhs: f16) -> f16 {
    f16::from_f32(lhs.to_f32() + rhs.to_f32())
}

fn or_bool(lhs: bool, rhs: bool) -> bool {
    lhs || rhs
}

fn scatter<T: Copy>(
    dst: &mut [T],
    src: &[T],
    plan: &[(usize, usize)],
    combine: Option<fn(T, T) -> T>,
) {
    for (to, from) in plan.iter().copied() {
        dst[to] = match combine {
            Some(combine) => combine(dst[to], src[from]),
            None => src[from],
        };
    }
}

fn index_put_storage(
    base: &DenseTensor,
    indices: &[&DenseTensor],
    values: &DenseTensor,
    accumulate: bool,
) -> Result<TensorStorage, KernelError> {
    let plan = index_put_plan(base, indices, values)?;
    let mut out = base.contiguous_storage()?;
    let src = values.contiguous_storage()?;

    match (&mut out, &src) {
        (TensorStorage::F64(dst), TensorStorage::F64(src)) => {
            scatter(dst, src, &plan, accumulate.then_some(add_f64 as fn(f64, f64) -> f64));
        }
        (TensorStorage::F32(dst), TensorStorage::F32(src)) => {
            scatter(dst, src, &plan, accumulate.then_some(add_f32 as fn(f32, f32) -> f32));
        }
        (TensorStorage::F16(dst), TensorStorage::F16(src)) => {
            scatter(dst, src, &plan, accumulate.then_some(add_f16 as fn(f16, f16) -> f16));
        }
        (TensorStorage::I64(dst), TensorStorage::I64(src)) => {
            scatter(dst, src, &plan, accumulate.then_some(i64::wrapping_add as fn(i64, i64) -> i64));
        }
        (TensorStorage::Bool(dst), TensorStorage::Bool(src)) => {
            scatter(dst, src, &plan, accumulate.then_some(or_bool as fn(bool, bool) -> bool));
        }
        (dst, src) => {
            return Err(KernelError::Incompatible(TensorCompatError::DTypeMismatch {
                lhs: dst.dtype(),
                rhs: src.dtype(),
            }));
        }
    }
    Ok(out)
}

/// Out-of-place advanced-index assignment: `out = base.clone(); out[indices] = values`.
pub fn index_put(
    base: &DenseTensor,
    indices: &[&DenseTensor],
    values: &DenseTensor,
    accumulate: bool,
) -> Result<DenseTensor, KernelError> {
    let storage = index_put_storage(base, indices, values, accumulate)?;
    Ok(base.derive(base.shape().to_vec(), storage)?)
}

/// In-place variant; `base` keeps its storage identity.
pub fn index_put_inplace(
    base: &mut DenseTensor,
    indices: &[&DenseTensor],
    values: &DenseTensor,
    accumulate: bool,
) -> Result<(), KernelError> {
    let storage = index_put_storage(base, indices, values, accumulate)?;
    base.write_in_place(storage)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use fb_core::{DType, DenseTensor, Device, TensorCompatError, TensorMeta, TensorStorage, f16};
    use proptest::prelude::*;

    use super::{
        KernelError, add_tensor, fill, index_put, index_put_inplace, normalize_dim, ones,
        pow_scalar, sort, sum_all, sum_dims, zeros,
    };

    fn f64_tensor(values: Vec<f64>, shape: Vec<usize>) -> DenseTensor {
        DenseTensor::from_f64(values, shape, Device::Cpu).expect("f64 tensor should build")
    }

    fn f32_tensor(values: Vec<f32>, shape: Vec<usize>) -> DenseTensor {
        DenseTensor::from_f32(values, shape, Device::Cpu).expect("f32 tensor should build")
    }

    fn i64_tensor(values: Vec<i64>, shape: Vec<usize>) -> DenseTensor {
        DenseTensor::from_i64(values, shape, Device::Cpu).expect("i64 tensor should build")
    }

    fn mask(values: Vec<bool>, shape: Vec<usize>) -> DenseTensor {
        DenseTensor::from_bool(values, shape, Device::Cpu).expect("mask should build")
    }

    #[test]
    fn add_returns_elementwise_sum() {
        let lhs = f64_tensor(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let rhs = f64_tensor(vec![0.5, 1.5, 2.5, 3.5], vec![2, 2]);

        let out = add_tensor(&lhs, &rhs, 1.0).expect("add should succeed");
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.values_f64().expect("values"), vec![1.5, 3.5, 5.5, 7.5]);
        assert_ne!(out.storage_id(), lhs.storage_id());
    }

    #[test]
    fn add_applies_alpha_and_keeps_f32() {
        let lhs = f32_tensor(vec![1.0, 2.0], vec![2]);
        let rhs = f32_tensor(vec![3.0, 4.0], vec![2]);

        let out = add_tensor(&lhs, &rhs, -1.0).expect("sub-style add should succeed");
        assert_eq!(out.dtype(), DType::F32);
        assert_eq!(out.values_f64().expect("values"), vec![-2.0, -2.0]);
    }

    #[test]
    fn add_half_rounds_once() {
        let to_half = |values: &[f32]| values.iter().copied().map(f16::from_f32).collect::<Vec<_>>();
        let lhs = DenseTensor::from_f16(to_half(&[1.0, 2.0, 3.0, 4.0]), vec![4], Device::Cpu)
            .expect("lhs");
        let rhs = DenseTensor::from_f16(to_half(&[0.5, 1.5, 2.5, 3.5]), vec![4], Device::Cpu)
            .expect("rhs");

        let out = add_tensor(&lhs, &rhs, 1.0).expect("half add should succeed");
        assert_eq!(
            out.contiguous_storage().expect("storage"),
            TensorStorage::F16(to_half(&[1.5, 3.5, 5.5, 7.5]))
        );
    }

    #[test]
    fn add_integer_rejects_fractional_alpha() {
        let lhs = i64_tensor(vec![1, 2], vec![2]);
        let err = add_tensor(&lhs, &lhs, 0.5).expect_err("fractional alpha must fail");
        assert!(matches!(err, KernelError::NonIntegralScalar { op: "add", .. }));
    }

    #[test]
    fn add_rejects_dtype_and_shape_mismatch() {
        let lhs = f64_tensor(vec![1.0, 2.0], vec![2]);
        let rhs = f32_tensor(vec![1.0, 2.0], vec![2]);
        let err = add_tensor(&lhs, &rhs, 1.0).expect_err("dtype mismatch must fail closed");
        assert!(matches!(
            err,
            KernelError::Incompatible(TensorCompatError::DTypeMismatch { .. })
        ));

        let rhs = f64_tensor(vec![1.0, 2.0], vec![2, 1]);
        let err = add_tensor(&lhs, &rhs, 1.0).expect_err("shape mismatch must fail closed");
        assert!(matches!(err, KernelError::ShapeMismatch { .. }));
    }

    #[test]
    fn add_rejects_bool_tensors() {
        let lhs = mask(vec![true, false], vec![2]);
        let err = add_tensor(&lhs, &lhs, 1.0).expect_err("bool add is unsupported");
        assert!(matches!(
            err,
            KernelError::UnsupportedDType {
                op: "add",
                dtype: DType::Bool
            }
        ));
    }

    #[test]
    fn add_reads_strided_views_logically() {
        let meta =
            TensorMeta::from_shape_and_strides(vec![2, 2], vec![1, 2], 0, DType::F64, Device::Cpu)
                .expect("transposed meta");
        let lhs = DenseTensor::from_storage(meta, TensorStorage::F64(vec![1.0, 2.0, 3.0, 4.0]))
            .expect("transposed view");
        let rhs = f64_tensor(vec![0.0; 4], vec![2, 2]);

        let out = add_tensor(&lhs, &rhs, 1.0).expect("strided add");
        assert_eq!(out.values_f64().expect("values"), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn pow_two_squares_floats_and_integers() {
        let x = f32_tensor(vec![-1.5, 0.0, 3.0], vec![3]);
        let out = pow_scalar(&x, 2.0).expect("pow should succeed");
        assert_eq!(out.values_f64().expect("values"), vec![2.25, 0.0, 9.0]);

        let x = i64_tensor(vec![-3, 2], vec![2]);
        let out = pow_scalar(&x, 3.0).expect("integer pow should succeed");
        assert_eq!(out.values_i64().expect("values"), vec![-27, 8]);
    }

    #[test]
    fn pow_integer_rejects_negative_exponent() {
        let x = i64_tensor(vec![2], vec![1]);
        let err = pow_scalar(&x, -1.0).expect_err("negative integer exponent must fail");
        assert!(matches!(err, KernelError::NonIntegralScalar { op: "pow", .. }));
    }

    #[test]
    fn sort_returns_values_and_permutation() {
        let x = i64_tensor(vec![3, 0, 2, 1], vec![4]);
        let (values, indices) = sort(&x, -1, false).expect("sort should succeed");
        assert_eq!(values.values_i64().expect("values"), vec![0, 1, 2, 3]);
        assert_eq!(indices.dtype(), DType::I64);
        assert_eq!(indices.values_i64().expect("indices"), vec![1, 3, 2, 0]);
    }

    #[test]
    fn sort_descending_keeps_ties_stable() {
        let x = f64_tensor(vec![1.0, 5.0, 1.0, 5.0], vec![4]);
        let (values, indices) = sort(&x, 0, true).expect("sort should succeed");
        assert_eq!(values.values_f64().expect("values"), vec![5.0, 5.0, 1.0, 1.0]);
        assert_eq!(indices.values_i64().expect("indices"), vec![1, 3, 0, 2]);
    }

    #[test]
    fn sort_along_leading_dim() {
        let x = f64_tensor(vec![4.0, 1.0, 2.0, 3.0], vec![2, 2]);
        let (values, indices) = sort(&x, 0, false).expect("sort should succeed");
        assert_eq!(values.values_f64().expect("values"), vec![2.0, 1.0, 4.0, 3.0]);
        assert_eq!(indices.values_i64().expect("indices"), vec![1, 0, 0, 1]);
    }

    #[test]
    fn sort_places_nan_last() {
        let x = f64_tensor(vec![f64::NAN, 1.0, -2.0], vec![3]);
        let (values, indices) = sort(&x, -1, false).expect("sort should succeed");
        let values = values.values_f64().expect("values");
        assert_eq!(&values[..2], &[-2.0, 1.0]);
        assert!(values[2].is_nan());
        assert_eq!(indices.values_i64().expect("indices"), vec![2, 1, 0]);
    }

    #[test]
    fn sort_rejects_out_of_range_dim() {
        let x = f64_tensor(vec![1.0, 2.0], vec![2]);
        let err = sort(&x, 1, false).expect_err("dim 1 is out of range for rank 1");
        assert!(matches!(err, KernelError::DimOutOfRange { dim: 1, rank: 1 }));
        assert_eq!(normalize_dim(-1, 0), Ok(0));
    }

    #[test]
    fn sum_all_reduces_to_zero_dim() {
        let x = f32_tensor(vec![1.0, 2.0, 3.5], vec![3]);
        let out = sum_all(&x, None).expect("sum should succeed");
        assert!(out.shape().is_empty());
        assert_eq!(out.dtype(), DType::F32);
        assert_eq!(out.values_f64().expect("values"), vec![6.5]);
    }

    #[test]
    fn sum_of_integers_and_bools_is_long() {
        let x = i64_tensor(vec![4, -1, 7], vec![3]);
        assert_eq!(
            sum_all(&x, None).expect("sum").values_i64().expect("values"),
            vec![10]
        );

        let m = mask(vec![true, false, true], vec![3]);
        let out = sum_all(&m, None).expect("bool sum");
        assert_eq!(out.dtype(), DType::I64);
        assert_eq!(out.values_i64().expect("values"), vec![2]);
    }

    #[test]
    fn sum_dims_respects_keepdim() {
        let x = f64_tensor(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);

        let rows = sum_dims(&x, &[1], false, None).expect("row sums");
        assert_eq!(rows.shape(), &[2]);
        assert_eq!(rows.values_f64().expect("values"), vec![6.0, 15.0]);

        let cols = sum_dims(&x, &[0], true, None).expect("column sums");
        assert_eq!(cols.shape(), &[1, 3]);
        assert_eq!(cols.values_f64().expect("values"), vec![5.0, 7.0, 9.0]);

        let err = sum_dims(&x, &[1, -1], false, None).expect_err("duplicate dim");
        assert!(matches!(err, KernelError::DuplicateDim { dim: 1 }));
    }

    #[test]
    fn sum_with_explicit_dtype_overrides_default() {
        let x = i64_tensor(vec![1, 2], vec![2]);
        let out = sum_all(&x, Some(DType::F64)).expect("sum as double");
        assert_eq!(out.dtype(), DType::F64);
        assert_eq!(out.values_f64().expect("values"), vec![3.0]);
    }

    #[test]
    fn factories_fill_requested_shape() {
        let out = ones(&[2, 4], DType::F32, Device::Cpu).expect("ones");
        assert_eq!(out.shape(), &[2, 4]);
        assert_eq!(out.dtype(), DType::F32);
        assert!(out.values_f64().expect("values").iter().all(|v| *v == 1.0));

        let out = zeros(&[3], DType::I64, Device::Cuda).expect("zeros");
        assert_eq!(out.device(), Device::Cuda);
        assert_eq!(out.values_i64().expect("values"), vec![0, 0, 0]);

        let err = fill(&[2, -1], 0.0, DType::F64, Device::Cpu).expect_err("negative size");
        assert!(matches!(err, KernelError::NegativeSize { dim: 1, size: -1 }));
    }

    #[test]
    fn fill_rejects_sizes_past_the_addressable_range() {
        let err = ones(&[i64::MAX, 4], DType::F32, Device::Cpu).expect_err("overflowing size");
        assert!(matches!(err, KernelError::SizeOverflow { .. }));

        let err = zeros(&[0, i64::MAX, 4], DType::I64, Device::Cpu)
            .expect_err("zero-length dim still needs addressable strides");
        assert!(matches!(err, KernelError::SizeOverflow { .. }));

        let err = fill(&[1 << 40, 1 << 22], 0.0, DType::F64, Device::Cpu)
            .expect_err("allocation would exceed isize::MAX bytes");
        assert!(err.to_string().contains("addressable"));

        let empty = zeros(&[0, 3], DType::F64, Device::Cpu).expect("empty tensor");
        assert_eq!(empty.numel(), 0);
    }

    #[test]
    fn index_put_mask_assigns_row_major() {
        let base = f32_tensor(vec![0.0; 9], vec![3, 3]);
        let m = mask(
            vec![true, true, true, true, false, false, true, true, false],
            vec![3, 3],
        );
        let values = f32_tensor(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![6]);

        let out = index_put(&base, &[&m], &values, false).expect("masked assignment");
        assert_eq!(
            out.values_f64().expect("values"),
            vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 5.0, 6.0, 0.0]
        );
        assert_eq!(base.values_f64().expect("base untouched"), vec![0.0; 9]);
    }

    #[test]
    fn index_put_rejects_values_count_mismatch() {
        let base = f32_tensor(vec![0.0; 4], vec![2, 2]);
        let m = mask(vec![true, false, true, true], vec![2, 2]);
        let values = f32_tensor(vec![1.0, 2.0], vec![2]);

        let err = index_put(&base, &[&m], &values, false).expect_err("2 values for 3 slots");
        assert!(matches!(
            err,
            KernelError::ValuesShapeMismatch {
                selected: 3,
                trailing: 1,
                values: 2
            }
        ));
    }

    #[test]
    fn index_put_broadcasts_single_value() {
        let base = f64_tensor(vec![1.0, 2.0, 3.0], vec![3]);
        let m = mask(vec![false, true, true], vec![3]);
        let values = f64_tensor(vec![9.0], vec![1]);

        let out = index_put(&base, &[&m], &values, false).expect("broadcast value");
        assert_eq!(out.values_f64().expect("values"), vec![1.0, 9.0, 9.0]);
    }

    #[test]
    fn index_put_rejects_mask_shape_mismatch() {
        let base = f64_tensor(vec![0.0; 6], vec![2, 3]);
        let m = mask(vec![true, false], vec![2, 1]);
        let values = f64_tensor(vec![1.0], vec![1]);

        let err = index_put(&base, &[&m], &values, false).expect_err("mask shape mismatch");
        assert!(matches!(err, KernelError::MaskShapeMismatch { start_dim: 0, .. }));
    }

    #[test]
    fn index_put_long_indices_select_rows_and_wrap_negatives() {
        let base = f64_tensor(vec![0.0; 6], vec![3, 2]);
        let rows = i64_tensor(vec![-1, 0], vec![2]);
        let values = f64_tensor(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);

        let out = index_put(&base, &[&rows], &values, false).expect("row assignment");
        assert_eq!(
            out.values_f64().expect("values"),
            vec![3.0, 4.0, 0.0, 0.0, 1.0, 2.0]
        );

        let rows = i64_tensor(vec![3], vec![1]);
        let row = f64_tensor(vec![1.0, 2.0], vec![2]);
        let err = index_put(&base, &[&rows], &row, false).expect_err("row 3 is out of bounds");
        assert!(matches!(
            err,
            KernelError::IndexOutOfBounds {
                dim: 0,
                index: 3,
                size: 3
            }
        ));
    }

    #[test]
    fn index_put_accumulates_duplicates() {
        let base = i64_tensor(vec![0, 0, 0], vec![3]);
        let idx = i64_tensor(vec![1, 1, 2], vec![3]);
        let values = i64_tensor(vec![5, 6, 7], vec![3]);

        let replaced = index_put(&base, &[&idx], &values, false).expect("replace");
        assert_eq!(replaced.values_i64().expect("values"), vec![0, 6, 7]);

        let summed = index_put(&base, &[&idx], &values, true).expect("accumulate");
        assert_eq!(summed.values_i64().expect("values"), vec![0, 11, 7]);
    }

    #[test]
    fn index_put_rejects_value_dtype_mismatch() {
        let base = f32_tensor(vec![0.0; 2], vec![2]);
        let m = mask(vec![true, true], vec![2]);
        let values = f64_tensor(vec![1.0, 2.0], vec![2]);

        let err = index_put(&base, &[&m], &values, false).expect_err("dtype mismatch");
        assert!(matches!(
            err,
            KernelError::Incompatible(TensorCompatError::DTypeMismatch { .. })
        ));
        let err = index_put(&base, &[], &values, false).expect_err("no indices");
        assert_eq!(err, KernelError::NoIndices);
    }

    #[test]
    fn index_put_inplace_keeps_storage_identity() {
        let mut base = f64_tensor(vec![1.0, 2.0], vec![2]);
        let storage_id = base.storage_id();
        let m = mask(vec![true, false], vec![2]);
        let values = f64_tensor(vec![7.0], vec![1]);

        index_put_inplace(&mut base, &[&m], &values, false).expect("in-place assignment");
        assert_eq!(base.storage_id(), storage_id);
        assert_eq!(base.version(), 1);
        assert_eq!(base.values_f64().expect("values"), vec![7.0, 2.0]);
    }

    proptest! {
        #[test]
        fn prop_sort_indices_reconstruct_values(values in prop::collection::vec(-50i64..50, 1..24)) {
            let n = values.len();
            let x = i64_tensor(values.clone(), vec![n]);
            let (sorted, indices) = sort(&x, -1, false).expect("sort");
            let sorted = sorted.values_i64().expect("sorted");
            let indices = indices.values_i64().expect("indices");

            for (position, index) in indices.iter().enumerate() {
                prop_assert_eq!(sorted[position], values[*index as usize]);
            }
            prop_assert!(sorted.windows(2).all(|pair| pair[0] <= pair[1]));
        }

        #[test]
        fn prop_sum_all_matches_total(values in prop::collection::vec(-1_000.0f64..1_000.0, 1..32)) {
            let n = values.len();
            let x = f64_tensor(values.clone(), vec![n]);
            let total = sum_all(&x, None).expect("sum").values_f64().expect("values")[0];
            let expected: f64 = values.iter().sum();
            prop_assert!((total - expected).abs() <= 1e-9);
        }

        #[test]
        fn prop_sum_dims_then_rest_matches_sum_all(
            rows in 1usize..=4,
            cols in 1usize..=4,
            seed in -100i64..100,
        ) {
            let values: Vec<i64> = (0..rows * cols).map(|i| seed + i as i64).collect();
            let x = i64_tensor(values, vec![rows, cols]);
            let partial = sum_dims(&x, &[1], false, None).expect("partial");
            let staged = sum_all(&partial, None).expect("staged").values_i64().expect("values");
            let direct = sum_all(&x, None).expect("direct").values_i64().expect("values");
            prop_assert_eq!(staged, direct);
        }
    }
}
