use std::collections::BTreeMap;
use std::fmt;

use fb_core::{DType, ExecutionMode};

use crate::operator::{Argument, BRIDGE_OP_TYPE, OPERATOR_ARG, OperatorDef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Float,
    Int,
    Ints,
    Str,
    Bool,
}

impl ArgKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Int => "int",
            Self::Ints => "ints",
            Self::Str => "str",
            Self::Bool => "bool",
        }
    }

    /// Accepts the argument as this kind, widening where the encoding is lossless.
    fn coerce(self, value: &Argument) -> Option<Argument> {
        match (self, value) {
            (Self::Float, Argument::Float(v)) => Some(Argument::Float(*v)),
            (Self::Float, Argument::Int(v)) => Some(Argument::Float(*v as f64)),
            (Self::Int, Argument::Int(v)) => Some(Argument::Int(*v)),
            (Self::Ints, Argument::Ints(v)) => Some(Argument::Ints(v.clone())),
            (Self::Ints, Argument::Int(v)) => Some(Argument::Ints(vec![*v])),
            (Self::Str, Argument::Str(v)) => Some(Argument::Str(v.clone())),
            (Self::Bool, Argument::Bool(v)) => Some(Argument::Bool(*v)),
            // Integer-encoded flags: 0 and 1 only.
            (Self::Bool, Argument::Int(v @ (0 | 1))) => Some(Argument::Bool(*v == 1)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArgSpec {
    name: &'static str,
    kind: ArgKind,
    required: bool,
    default: Option<Argument>,
}

impl ArgSpec {
    #[must_use]
    pub fn required(name: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            default: None,
        }
    }

    #[must_use]
    pub fn optional(name: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: None,
        }
    }

    #[must_use]
    pub fn with_default(name: &'static str, kind: ArgKind, default: impl Into<Argument>) -> Self {
        Self {
            name,
            kind,
            required: false,
            default: Some(default.into()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn kind(&self) -> ArgKind {
        self.kind
    }

    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    #[must_use]
    pub const fn accepts(self, count: usize) -> bool {
        match self {
            Self::Exact(expected) => count == expected,
            Self::AtLeast(minimum) => count >= minimum,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(expected) => write!(f, "exactly {expected}"),
            Self::AtLeast(minimum) => write!(f, "at least {minimum}"),
        }
    }
}

/// CPU kernel family a schema routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelId {
    Add,
    Sub,
    Pow,
    Sort,
    Sum,
    Ones,
    Zeros,
    IndexPut,
    IndexPutInplace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorSchema {
    name: &'static str,
    inputs: Arity,
    outputs: usize,
    args: Vec<ArgSpec>,
    kernel: KernelId,
    composite: bool,
    inplace: bool,
}

impl OperatorSchema {
    #[must_use]
    pub fn new(name: &'static str, inputs: Arity, outputs: usize, kernel: KernelId) -> Self {
        Self {
            name,
            inputs,
            outputs,
            args: Vec::new(),
            kernel,
            composite: false,
            inplace: false,
        }
    }

    #[must_use]
    pub fn arg(mut self, spec: ArgSpec) -> Self {
        self.args.push(spec);
        self
    }

    /// Implemented by decomposition into other registered kernels.
    #[must_use]
    pub fn composite(mut self) -> Self {
        self.composite = true;
        self
    }

    /// Writes its result into the first input; the first output must name it.
    #[must_use]
    pub fn inplace(mut self) -> Self {
        self.inplace = true;
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn input_arity(&self) -> Arity {
        self.inputs
    }

    #[must_use]
    pub fn output_count(&self) -> usize {
        self.outputs
    }

    #[must_use]
    pub fn arg_specs(&self) -> &[ArgSpec] {
        &self.args
    }

    #[must_use]
    pub fn kernel(&self) -> KernelId {
        self.kernel
    }

    #[must_use]
    pub fn is_composite(&self) -> bool {
        self.composite
    }

    #[must_use]
    pub fn is_inplace(&self) -> bool {
        self.inplace
    }

    #[must_use]
    pub fn is_factory(&self) -> bool {
        self.inputs == Arity::Exact(0)
    }

    pub fn check_bindings(&self, def: &OperatorDef) -> Result<(), OpSchemaError> {
        if !self.inputs.accepts(def.inputs().len()) {
            return Err(OpSchemaError::InputArity {
                op: self.name,
                expected: self.inputs,
                actual: def.inputs().len(),
            });
        }
        if def.outputs().len() != self.outputs {
            return Err(OpSchemaError::OutputArity {
                op: self.name,
                expected: self.outputs,
                actual: def.outputs().len(),
            });
        }
        if self.inplace && def.outputs().first() != def.inputs().first() {
            return Err(OpSchemaError::InplaceOutputMustAlias {
                op: self.name,
                input: def.inputs().first().cloned().unwrap_or_default(),
                output: def.outputs().first().cloned().unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Typed argument values with defaults applied.
    ///
    /// Arguments the schema does not declare fail in strict mode and are
    /// dropped (and reported) in hardened mode.
    pub fn resolve_args(
        &self,
        def: &OperatorDef,
        mode: ExecutionMode,
    ) -> Result<ResolvedArgs, OpSchemaError> {
        let mut ignored = Vec::new();
        for name in def.args().keys() {
            if name == OPERATOR_ARG || self.args.iter().any(|spec| spec.name == name) {
                continue;
            }
            match mode {
                ExecutionMode::Strict => {
                    return Err(OpSchemaError::UnknownArgument {
                        op: self.name,
                        arg: name.clone(),
                    });
                }
                ExecutionMode::Hardened => ignored.push(name.clone()),
            }
        }

        let mut values = BTreeMap::new();
        for spec in &self.args {
            let value = match def.arg(spec.name) {
                Some(raw) => {
                    spec.kind
                        .coerce(raw)
                        .ok_or_else(|| OpSchemaError::ArgumentType {
                            op: self.name,
                            arg: spec.name,
                            expected: spec.kind,
                            actual: raw.kind_name(),
                        })?
                }
                None => match (&spec.default, spec.required) {
                    (Some(default), _) => default.clone(),
                    (None, true) => {
                        return Err(OpSchemaError::MissingArgument {
                            op: self.name,
                            arg: spec.name,
                        });
                    }
                    (None, false) => continue,
                },
            };
            values.insert(spec.name, value);
        }

        Ok(ResolvedArgs {
            op: self.name,
            values,
            ignored,
        })
    }
}

/// Arguments after schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedArgs {
    op: &'static str,
    values: BTreeMap<&'static str, Argument>,
    ignored: Vec<String>,
}

impl ResolvedArgs {
    #[must_use]
    pub fn ignored(&self) -> &[String] {
        &self.ignored
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    fn get(&self, name: &'static str) -> Result<&Argument, OpSchemaError> {
        self.values
            .get(name)
            .ok_or(OpSchemaError::MissingArgument { op: self.op, arg: name })
    }

    fn mismatch(&self, name: &'static str, expected: ArgKind, actual: &Argument) -> OpSchemaError {
        OpSchemaError::ArgumentType {
            op: self.op,
            arg: name,
            expected,
            actual: actual.kind_name(),
        }
    }

    pub fn float(&self, name: &'static str) -> Result<f64, OpSchemaError> {
        match self.get(name)? {
            Argument::Float(value) => Ok(*value),
            other => Err(self.mismatch(name, ArgKind::Float, other)),
        }
    }

    pub fn int(&self, name: &'static str) -> Result<i64, OpSchemaError> {
        match self.get(name)? {
            Argument::Int(value) => Ok(*value),
            other => Err(self.mismatch(name, ArgKind::Int, other)),
        }
    }

    pub fn ints(&self, name: &'static str) -> Result<&[i64], OpSchemaError> {
        match self.get(name)? {
            Argument::Ints(values) => Ok(values),
            other => Err(self.mismatch(name, ArgKind::Ints, other)),
        }
    }

    pub fn flag(&self, name: &'static str) -> Result<bool, OpSchemaError> {
        match self.get(name)? {
            Argument::Bool(value) => Ok(*value),
            other => Err(self.mismatch(name, ArgKind::Bool, other)),
        }
    }

    pub fn string(&self, name: &'static str) -> Result<&str, OpSchemaError> {
        match self.get(name)? {
            Argument::Str(value) => Ok(value),
            other => Err(self.mismatch(name, ArgKind::Str, other)),
        }
    }

    /// Parses a scalar-type name argument; `None` when the argument is absent.
    pub fn dtype(&self, name: &'static str) -> Result<Option<DType>, OpSchemaError> {
        if !self.contains(name) {
            return Ok(None);
        }
        let raw = self.string(name)?;
        DType::from_aten_name(raw)
            .map(Some)
            .ok_or_else(|| OpSchemaError::InvalidDType {
                op: self.op,
                arg: name,
                value: raw.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpSchemaError {
    UnsupportedOpType {
        op_type: String,
    },
    MissingOperatorName,
    UnknownOperator {
        name: String,
    },
    DuplicateRegistration {
        name: &'static str,
    },
    InputArity {
        op: &'static str,
        expected: Arity,
        actual: usize,
    },
    OutputArity {
        op: &'static str,
        expected: usize,
        actual: usize,
    },
    InplaceOutputMustAlias {
        op: &'static str,
        input: String,
        output: String,
    },
    MissingArgument {
        op: &'static str,
        arg: &'static str,
    },
    ArgumentType {
        op: &'static str,
        arg: &'static str,
        expected: ArgKind,
        actual: &'static str,
    },
    UnknownArgument {
        op: &'static str,
        arg: String,
    },
    InvalidDType {
        op: &'static str,
        arg: &'static str,
        value: String,
    },
}

impl fmt::Display for OpSchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedOpType { op_type } => write!(
                f,
                "unsupported operator type {op_type:?}; expected {BRIDGE_OP_TYPE:?}"
            ),
            Self::MissingOperatorName => {
                write!(f, "bridge invocation is missing the '{OPERATOR_ARG}' argument")
            }
            Self::UnknownOperator { name } => write!(f, "unknown operator {name:?}"),
            Self::DuplicateRegistration { name } => {
                write!(f, "operator {name:?} is already registered")
            }
            Self::InputArity {
                op,
                expected,
                actual,
            } => write!(f, "{op} expects {expected} inputs, got {actual}"),
            Self::OutputArity {
                op,
                expected,
                actual,
            } => write!(f, "{op} expects {expected} outputs, got {actual}"),
            Self::InplaceOutputMustAlias { op, input, output } => write!(
                f,
                "{op} writes in place: output {output:?} must alias input {input:?}"
            ),
            Self::MissingArgument { op, arg } => {
                write!(f, "{op} is missing required argument '{arg}'")
            }
            Self::ArgumentType {
                op,
                arg,
                expected,
                actual,
            } => write!(
                f,
                "{op} argument '{arg}' expects {}, got {actual}",
                expected.name()
            ),
            Self::UnknownArgument { op, arg } => {
                write!(f, "{op} does not accept argument '{arg}'")
            }
            Self::InvalidDType { op, arg, value } => {
                write!(f, "{op} argument '{arg}' names unknown dtype {value:?}")
            }
        }
    }
}

impl std::error::Error for OpSchemaError {}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OperatorRegistry {
    schemas: BTreeMap<&'static str, OperatorSchema>,
}

impl OperatorRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding every operation the CPU kernel table implements.
    #[must_use]
    pub fn with_builtin_ops() -> Self {
        let mut registry = Self::empty();
        for schema in builtin_schemas() {
            registry.schemas.insert(schema.name, schema);
        }
        registry
    }

    pub fn register(&mut self, schema: OperatorSchema) -> Result<(), OpSchemaError> {
        if self.schemas.contains_key(schema.name) {
            return Err(OpSchemaError::DuplicateRegistration { name: schema.name });
        }
        self.schemas.insert(schema.name, schema);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OperatorSchema> {
        self.schemas.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.schemas.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Schema for a bridge invocation, after checking its bindings.
    pub fn resolve(&self, def: &OperatorDef) -> Result<&OperatorSchema, OpSchemaError> {
        if def.op_type() != BRIDGE_OP_TYPE {
            return Err(OpSchemaError::UnsupportedOpType {
                op_type: def.op_type().to_string(),
            });
        }
        let name = def
            .operator_name()
            .ok_or(OpSchemaError::MissingOperatorName)?;
        let schema = self
            .schemas
            .get(name)
            .ok_or_else(|| OpSchemaError::UnknownOperator {
                name: name.to_string(),
            })?;
        schema.check_bindings(def)?;
        Ok(schema)
    }
}

fn builtin_schemas() -> Vec<OperatorSchema> {
    let alpha = || ArgSpec::with_default("alpha", ArgKind::Float, 1.0);
    let accumulate = || ArgSpec::with_default("accumulate", ArgKind::Bool, false);
    let size = || ArgSpec::required("size", ArgKind::Ints);
    let scalar_type = || ArgSpec::with_default("type", ArgKind::Str, DType::F32.aten_name());

    vec![
        OperatorSchema::new("add", Arity::Exact(2), 1, KernelId::Add).arg(alpha()),
        OperatorSchema::new("sub", Arity::Exact(2), 1, KernelId::Sub)
            .arg(alpha())
            .composite(),
        OperatorSchema::new("pow", Arity::Exact(1), 1, KernelId::Pow)
            .arg(ArgSpec::required("exponent", ArgKind::Float)),
        OperatorSchema::new("sort", Arity::Exact(1), 2, KernelId::Sort)
            .arg(ArgSpec::with_default("dim", ArgKind::Int, -1i64))
            .arg(ArgSpec::with_default("descending", ArgKind::Bool, false)),
        OperatorSchema::new("sum", Arity::Exact(1), 1, KernelId::Sum)
            .arg(ArgSpec::optional("dim", ArgKind::Ints))
            .arg(ArgSpec::with_default("keepdim", ArgKind::Bool, false))
            .arg(ArgSpec::optional("dtype", ArgKind::Str)),
        OperatorSchema::new("ones", Arity::Exact(0), 1, KernelId::Ones)
            .arg(size())
            .arg(scalar_type()),
        OperatorSchema::new("zeros", Arity::Exact(0), 1, KernelId::Zeros)
            .arg(size())
            .arg(scalar_type()),
        OperatorSchema::new("index_put", Arity::AtLeast(3), 1, KernelId::IndexPut)
            .arg(accumulate()),
        OperatorSchema::new("index_put_", Arity::AtLeast(3), 1, KernelId::IndexPutInplace)
            .arg(accumulate())
            .inplace(),
    ]
}

#[cfg(test)]
mod tests {
    use fb_core::{DType, ExecutionMode};

    use super::{ArgKind, Arity, KernelId, OpSchemaError, OperatorRegistry, OperatorSchema};
    use crate::operator::OperatorDef;

    #[test]
    fn builtin_registry_lists_bridge_ops() {
        let registry = OperatorRegistry::with_builtin_ops();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(
            names,
            vec![
                "add",
                "index_put",
                "index_put_",
                "ones",
                "pow",
                "sort",
                "sub",
                "sum",
                "zeros"
            ]
        );
        assert!(registry.get("sub").expect("sub").is_composite());
        assert!(registry.get("ones").expect("ones").is_factory());
        assert_eq!(registry.get("sort").expect("sort").output_count(), 2);
    }

    #[test]
    fn resolve_rejects_foreign_op_type_and_unknown_names() {
        let registry = OperatorRegistry::with_builtin_ops();

        let err = registry
            .resolve(&OperatorDef::new("Relu").with_inputs(["X"]).with_outputs(["Y"]))
            .expect_err("non-bridge op type");
        assert!(matches!(err, OpSchemaError::UnsupportedOpType { .. }));

        let err = registry
            .resolve(&OperatorDef::new("ATen"))
            .expect_err("missing operator name");
        assert_eq!(err, OpSchemaError::MissingOperatorName);

        let err = registry
            .resolve(&OperatorDef::aten("conv2d"))
            .expect_err("unknown operator");
        assert!(err.to_string().contains("conv2d"));
    }

    #[test]
    fn resolve_checks_arity_and_inplace_alias() {
        let registry = OperatorRegistry::with_builtin_ops();

        let err = registry
            .resolve(&OperatorDef::aten("add").with_inputs(["X"]).with_outputs(["Z"]))
            .expect_err("add needs two inputs");
        assert!(matches!(
            err,
            OpSchemaError::InputArity {
                op: "add",
                expected: Arity::Exact(2),
                actual: 1
            }
        ));

        let err = registry
            .resolve(&OperatorDef::aten("sort").with_inputs(["X"]).with_outputs(["Z"]))
            .expect_err("sort needs two outputs");
        assert!(matches!(err, OpSchemaError::OutputArity { op: "sort", .. }));

        let err = registry
            .resolve(
                &OperatorDef::aten("index_put_")
                    .with_inputs(["self", "mask", "values"])
                    .with_outputs(["out"]),
            )
            .expect_err("in-place output must alias self");
        assert!(matches!(err, OpSchemaError::InplaceOutputMustAlias { .. }));

        registry
            .resolve(
                &OperatorDef::aten("index_put_")
                    .with_inputs(["self", "mask", "values"])
                    .with_outputs(["self"]),
            )
            .expect("aliased in-place invocation resolves");
    }

    #[test]
    fn resolve_args_applies_defaults_and_coercions() {
        let registry = OperatorRegistry::with_builtin_ops();
        let schema = registry.get("sort").expect("sort");
        let args = schema
            .resolve_args(&OperatorDef::aten("sort").with_arg("descending", 1i64), ExecutionMode::Strict)
            .expect("args resolve");
        assert_eq!(args.int("dim"), Ok(-1));
        assert_eq!(args.flag("descending"), Ok(true));

        let schema = registry.get("add").expect("add");
        let args = schema
            .resolve_args(&OperatorDef::aten("add").with_arg("alpha", 2i64), ExecutionMode::Strict)
            .expect("int alpha widens to float");
        assert_eq!(args.float("alpha"), Ok(2.0));

        let schema = registry.get("ones").expect("ones");
        let args = schema
            .resolve_args(&OperatorDef::aten("ones").with_arg("size", 3i64), ExecutionMode::Strict)
            .expect("single int widens to a size list");
        assert_eq!(args.ints("size"), Ok(&[3i64][..]));
        assert_eq!(args.dtype("type"), Ok(Some(DType::F32)));
    }

    #[test]
    fn resolve_args_rejects_missing_and_mistyped() {
        let registry = OperatorRegistry::with_builtin_ops();
        let schema = registry.get("pow").expect("pow");

        let err = schema
            .resolve_args(&OperatorDef::aten("pow"), ExecutionMode::Hardened)
            .expect_err("exponent is required");
        assert_eq!(
            err,
            OpSchemaError::MissingArgument {
                op: "pow",
                arg: "exponent"
            }
        );

        let err = schema
            .resolve_args(&OperatorDef::aten("pow").with_arg("exponent", "two"), ExecutionMode::Strict)
            .expect_err("string exponent");
        assert!(matches!(
            err,
            OpSchemaError::ArgumentType {
                expected: ArgKind::Float,
                actual: "str",
                ..
            }
        ));
    }

    #[test]
    fn unknown_arguments_split_by_mode() {
        let registry = OperatorRegistry::with_builtin_ops();
        let schema = registry.get("sum").expect("sum");
        let def = OperatorDef::aten("sum").with_arg("broadcast", true);

        let err = schema
            .resolve_args(&def, ExecutionMode::Strict)
            .expect_err("strict mode rejects unknown args");
        assert!(matches!(err, OpSchemaError::UnknownArgument { op: "sum", .. }));

        let args = schema
            .resolve_args(&def, ExecutionMode::Hardened)
            .expect("hardened mode drops unknown args");
        assert_eq!(args.ignored(), &["broadcast".to_string()]);
        assert!(!args.contains("dim"));
        assert_eq!(args.dtype("dtype"), Ok(None));
    }

    #[test]
    fn invalid_dtype_name_is_reported() {
        let registry = OperatorRegistry::with_builtin_ops();
        let schema = registry.get("ones").expect("ones");
        let args = schema
            .resolve_args(
                &OperatorDef::aten("ones").with_arg("size", vec![2i64]).with_arg("type", "quaternion"),
                ExecutionMode::Strict,
            )
            .expect("string arg resolves");
        let err = args.dtype("type").expect_err("unknown dtype name");
        assert!(matches!(err, OpSchemaError::InvalidDType { .. }));
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = OperatorRegistry::with_builtin_ops();
        let err = registry
            .register(OperatorSchema::new("add", Arity::Exact(2), 1, KernelId::Add))
            .expect_err("duplicate");
        assert_eq!(err, OpSchemaError::DuplicateRegistration { name: "add" });
        assert_eq!(registry.len(), 9);
    }
}
