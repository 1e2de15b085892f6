#![forbid(unsafe_code)]

mod operator;
mod schema;

use std::fmt;

use fb_core::{DType, DenseTensor, Device, ExecutionMode};
use fb_device::{DeviceContext, DeviceError, ensure_same_device};
use fb_kernel_cpu::{
    KernelError, add_tensor, index_put, index_put_inplace, ones, pow_scalar, sort, sum_all,
    sum_dims, zeros,
};

pub use operator::{Argument, BRIDGE_OP_TYPE, OPERATOR_ARG, OperatorDef};
pub use schema::{
    ArgKind, ArgSpec, Arity, KernelId, OpSchemaError, OperatorRegistry, OperatorSchema,
    ResolvedArgs,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DispatchKey {
    Undefined = 0,
    BackendSelect = 1,
    CompositeImplicitAutograd = 2,
    CPU = 3,
    CUDA = 4,
}

impl DispatchKey {
    #[must_use]
    pub const fn all() -> &'static [DispatchKey] {
        &[
            DispatchKey::BackendSelect,
            DispatchKey::CompositeImplicitAutograd,
            DispatchKey::CPU,
            DispatchKey::CUDA,
        ]
    }

    #[must_use]
    pub const fn bit(self) -> u64 {
        1u64 << (self as u8)
    }

    #[must_use]
    pub const fn for_device(device: Device) -> Self {
        match device {
            Device::Cpu => Self::CPU,
            Device::Cuda => Self::CUDA,
        }
    }
}

const TYPE_PRIORITY: [DispatchKey; 4] = [
    DispatchKey::CompositeImplicitAutograd,
    DispatchKey::CUDA,
    DispatchKey::CPU,
    DispatchKey::BackendSelect,
];

const BACKEND_PRIORITY: [DispatchKey; 2] = [DispatchKey::CUDA, DispatchKey::CPU];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DispatchKeySet {
    bits: u64,
}

impl DispatchKeySet {
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    #[must_use]
    pub fn from_keys(keys: &[DispatchKey]) -> Self {
        let mut out = Self::empty();
        for key in keys {
            out.add(*key);
        }
        out
    }

    pub fn from_bits_checked(bits: u64) -> Result<Self, DispatchKeyError> {
        let known_mask = DispatchKey::all()
            .iter()
            .fold(0u64, |mask, key| mask | key.bit());
        let unknown = bits & !known_mask;
        if unknown != 0 {
            return Err(DispatchKeyError::UnknownBits {
                unknown_mask: unknown,
            });
        }
        Ok(Self { bits })
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.bits
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    pub fn add(&mut self, key: DispatchKey) {
        self.bits |= key.bit();
    }

    pub fn remove(&mut self, key: DispatchKey) {
        self.bits &= !key.bit();
    }

    #[must_use]
    pub const fn has(self, key: DispatchKey) -> bool {
        (self.bits & key.bit()) != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self {
            bits: self.bits & other.bits,
        }
    }

    pub fn highest_priority_type_id(self) -> Result<DispatchKey, DispatchKeyError> {
        if self.is_empty() {
            return Err(DispatchKeyError::EmptySet);
        }
        TYPE_PRIORITY
            .iter()
            .find(|&&key| self.has(key))
            .copied()
            .ok_or(DispatchKeyError::NoTypeKey)
    }

    pub fn highest_priority_backend_type_id(self) -> Result<DispatchKey, DispatchKeyError> {
        if self.is_empty() {
            return Err(DispatchKeyError::EmptySet);
        }
        BACKEND_PRIORITY
            .iter()
            .find(|&&key| self.has(key))
            .copied()
            .ok_or(DispatchKeyError::NoBackendKey)
    }

    pub fn validate(self) -> Result<(), DispatchKeyError> {
        if self.is_empty() {
            return Err(DispatchKeyError::EmptySet);
        }
        if self.has(DispatchKey::CPU) && self.has(DispatchKey::CUDA) {
            return Err(DispatchKeyError::IncompatibleSet {
                reason: "keyset names more than one backend",
            });
        }
        self.highest_priority_type_id()?;
        self.highest_priority_backend_type_id()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKeyError {
    EmptySet,
    NoTypeKey,
    NoBackendKey,
    UnknownBits { unknown_mask: u64 },
    IncompatibleSet { reason: &'static str },
    NoKernelForBackend { key: DispatchKey },
}

impl fmt::Display for DispatchKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySet => write!(f, "dispatch keyset is empty"),
            Self::NoTypeKey => write!(f, "dispatch keyset has no resolvable type key"),
            Self::NoBackendKey => write!(f, "dispatch keyset has no backend key"),
            Self::UnknownBits { unknown_mask } => {
                write!(
                    f,
                    "dispatch keyset has unknown bitmask 0x{unknown_mask:016x}"
                )
            }
            Self::IncompatibleSet { reason } => {
                write!(f, "incompatible dispatch keyset: {reason}")
            }
            Self::NoKernelForBackend { key } => write!(
                f,
                "strict mode forbids fallback: no kernel table for backend {key:?}"
            ),
        }
    }
}

impl std::error::Error for DispatchKeyError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchDecision {
    pub op: &'static str,
    pub mode: ExecutionMode,
    pub kernel: &'static str,
    pub selected_key: DispatchKey,
    pub backend_key: DispatchKey,
    pub keyset_bits: u64,
    pub fallback_used: bool,
    pub ignored_args: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub outputs: Vec<DenseTensor>,
    pub decision: DispatchDecision,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    Schema(OpSchemaError),
    Key(DispatchKeyError),
    Device(DeviceError),
    Kernel(KernelError),
    DTypeMismatch {
        op: &'static str,
        expected: DType,
        actual: DType,
    },
    InputCountMismatch {
        op: &'static str,
        bound: usize,
        supplied: usize,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schema(error) => write!(f, "operator schema failure: {error}"),
            Self::Key(error) => write!(f, "dispatch key failure: {error}"),
            Self::Device(error) => write!(f, "device failure: {error}"),
            Self::Kernel(error) => write!(f, "kernel dispatch failure: {error}"),
            Self::DTypeMismatch {
                op,
                expected,
                actual,
            } => write!(
                f,
                "strict mode forbids promotion: {op} expected dtype {expected}, got {actual}"
            ),
            Self::InputCountMismatch {
                op,
                bound,
                supplied,
            } => write!(
                f,
                "{op} binds {bound} input blob(s) but {supplied} tensor(s) were supplied"
            ),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<OpSchemaError> for DispatchError {
    fn from(value: OpSchemaError) -> Self {
        Self::Schema(value)
    }
}

impl From<DispatchKeyError> for DispatchError {
    fn from(value: DispatchKeyError) -> Self {
        Self::Key(value)
    }
}

impl From<DeviceError> for DispatchError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

impl From<KernelError> for DispatchError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<fb_core::DenseTensorError> for DispatchError {
    fn from(value: fb_core::DenseTensorError) -> Self {
        Self::Kernel(KernelError::Tensor(value))
    }
}

/// Keys a call carries: the inputs' device, or `BackendSelect` plus the
/// context device for factories, and the composite key for composite ops.
pub fn dispatch_keyset_for(
    schema: &OperatorSchema,
    inputs: &[&DenseTensor],
    context: DeviceContext,
) -> Result<DispatchKeySet, DispatchError> {
    let mut keyset = DispatchKeySet::empty();
    match ensure_same_device(inputs)? {
        Some(device) => keyset.add(DispatchKey::for_device(device)),
        None => {
            keyset.add(DispatchKey::BackendSelect);
            keyset.add(DispatchKey::for_device(context.device()));
        }
    }
    if schema.is_composite() {
        keyset.add(DispatchKey::CompositeImplicitAutograd);
    }
    Ok(keyset)
}

/// Runs one bridge invocation against the CPU kernel table.
pub fn dispatch_operator(
    registry: &OperatorRegistry,
    def: &OperatorDef,
    inputs: &[&DenseTensor],
    context: DeviceContext,
    mode: ExecutionMode,
) -> Result<DispatchOutcome, DispatchError> {
    let schema = registry.resolve(def)?;
    if inputs.len() != def.inputs().len() {
        return Err(DispatchError::InputCountMismatch {
            op: schema.name(),
            bound: def.inputs().len(),
            supplied: inputs.len(),
        });
    }
    let args = schema.resolve_args(def, mode)?;
    let keyset = dispatch_keyset_for(schema, inputs, context)?;
    dispatch_with_keyset(schema, &args, inputs, keyset, mode)
}

pub fn dispatch_with_keyset(
    schema: &OperatorSchema,
    args: &ResolvedArgs,
    inputs: &[&DenseTensor],
    keyset: DispatchKeySet,
    mode: ExecutionMode,
) -> Result<DispatchOutcome, DispatchError> {
    if !schema.input_arity().accepts(inputs.len()) {
        return Err(OpSchemaError::InputArity {
            op: schema.name(),
            expected: schema.input_arity(),
            actual: inputs.len(),
        }
        .into());
    }
    keyset.validate()?;
    let selected_key = keyset.highest_priority_type_id()?;
    let backend_key = keyset.highest_priority_backend_type_id()?;

    let mut fallback_used = match backend_key {
        DispatchKey::CPU => false,
        DispatchKey::CUDA => match mode {
            ExecutionMode::Strict => {
                return Err(DispatchKeyError::NoKernelForBackend { key: backend_key }.into());
            }
            ExecutionMode::Hardened => true,
        },
        _ => return Err(DispatchKeyError::NoBackendKey.into()),
    };
    if selected_key == DispatchKey::CompositeImplicitAutograd && !schema.is_composite() {
        return Err(DispatchKeyError::IncompatibleSet {
            reason: "composite key on an operator without a decomposition",
        }
        .into());
    }

    let target_device = match backend_key {
        DispatchKey::CUDA => Device::Cuda,
        _ => Device::Cpu,
    };
    let mut staged: Vec<DenseTensor> = inputs
        .iter()
        .map(|tensor| tensor.to_device(Device::Cpu))
        .collect();
    fallback_used |= reconcile_dtypes(schema, &mut staged, mode)?;

    let (outputs, kernel) = run_cpu_kernel(schema, args, &staged)?;
    let outputs = outputs
        .into_iter()
        .map(|output| restore_device(schema, inputs, output, target_device))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DispatchOutcome {
        outputs,
        decision: DispatchDecision {
            op: schema.name(),
            mode,
            kernel,
            selected_key,
            backend_key,
            keyset_bits: keyset.bits(),
            fallback_used,
            ignored_args: args.ignored().len(),
        },
    })
}

/// Aligns operand dtypes the kernel requires to match; returns whether a
/// hardened-mode promotion happened.
fn reconcile_dtypes(
    schema: &OperatorSchema,
    staged: &mut [DenseTensor],
    mode: ExecutionMode,
) -> Result<bool, DispatchError> {
    match schema.kernel() {
        KernelId::Add | KernelId::Sub => {
            let (lhs, rhs) = (staged[0].dtype(), staged[1].dtype());
            if lhs == rhs {
                return Ok(false);
            }
            if mode == ExecutionMode::Strict {
                return Err(DispatchError::DTypeMismatch {
                    op: schema.name(),
                    expected: lhs,
                    actual: rhs,
                });
            }
            let promoted = lhs.promote(rhs);
            for tensor in staged.iter_mut().take(2) {
                *tensor = tensor.to_dtype(promoted)?;
            }
            Ok(true)
        }
        KernelId::IndexPut | KernelId::IndexPutInplace => {
            let base = staged[0].dtype();
            let last = staged.len() - 1;
            let values = staged[last].dtype();
            if base == values {
                return Ok(false);
            }
            if mode == ExecutionMode::Strict {
                return Err(DispatchError::DTypeMismatch {
                    op: schema.name(),
                    expected: base,
                    actual: values,
                });
            }
            // Values follow the destination; the result keeps self's dtype.
            staged[last] = staged[last].to_dtype(base)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn run_cpu_kernel(
    schema: &OperatorSchema,
    args: &ResolvedArgs,
    staged: &[DenseTensor],
) -> Result<(Vec<DenseTensor>, &'static str), DispatchError> {
    let result = match schema.kernel() {
        KernelId::Add => (
            vec![add_tensor(&staged[0], &staged[1], args.float("alpha")?)?],
            "cpu::add_tensor",
        ),
        KernelId::Sub => (
            vec![add_tensor(&staged[0], &staged[1], -args.float("alpha")?)?],
            "composite::sub->cpu::add_tensor",
        ),
        KernelId::Pow => (
            vec![pow_scalar(&staged[0], args.float("exponent")?)?],
            "cpu::pow_scalar",
        ),
        KernelId::Sort => {
            let (values, indices) =
                sort(&staged[0], args.int("dim")?, args.flag("descending")?)?;
            (vec![values, indices], "cpu::sort")
        }
        KernelId::Sum => {
            let dtype = args.dtype("dtype")?;
            let keepdim = args.flag("keepdim")?;
            if args.contains("dim") || keepdim {
                let dims: &[i64] = if args.contains("dim") {
                    args.ints("dim")?
                } else {
                    &[]
                };
                (
                    vec![sum_dims(&staged[0], dims, keepdim, dtype)?],
                    "cpu::sum_dims",
                )
            } else {
                (vec![sum_all(&staged[0], dtype)?], "cpu::sum_all")
            }
        }
        KernelId::Ones | KernelId::Zeros => {
            let dtype = args.dtype("type")?.unwrap_or(DType::F32);
            let size = args.ints("size")?;
            if schema.kernel() == KernelId::Ones {
                (vec![ones(size, dtype, Device::Cpu)?], "cpu::ones")
            } else {
                (vec![zeros(size, dtype, Device::Cpu)?], "cpu::zeros")
            }
        }
        KernelId::IndexPut => {
            let (base, indices, values) = split_index_put(staged);
            (
                vec![index_put(base, &indices, values, args.flag("accumulate")?)?],
                "cpu::index_put",
            )
        }
        KernelId::IndexPutInplace => {
            let (base, indices, values) = split_index_put(staged);
            let mut target = base.clone();
            index_put_inplace(&mut target, &indices, values, args.flag("accumulate")?)?;
            (vec![target], "cpu::index_put_")
        }
    };
    Ok(result)
}

fn split_index_put(staged: &[DenseTensor]) -> (&DenseTensor, Vec<&DenseTensor>, &DenseTensor) {
    let last = staged.len() - 1;
    let indices = staged[1..last].iter().collect();
    (&staged[0], indices, &staged[last])
}

/// Moves a CPU result back onto the requested device. In-place results are
/// written into the original `self` so its storage identity survives.
fn restore_device(
    schema: &OperatorSchema,
    inputs: &[&DenseTensor],
    output: DenseTensor,
    target: Device,
) -> Result<DenseTensor, DispatchError> {
    if output.device() == target {
        return Ok(output);
    }
    if schema.is_inplace() {
        let mut aliased = (*inputs[0]).clone();
        aliased.write_in_place(output.contiguous_storage()?)?;
        return Ok(aliased);
    }
    Ok(output.to_device(target))
}
