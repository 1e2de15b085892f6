use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Operator type of every bridge invocation.
pub const BRIDGE_OP_TYPE: &str = "ATen";

/// Argument carrying the tensor operation name.
pub const OPERATOR_ARG: &str = "operator";

/// Auxiliary operator argument.
///
/// Serialized untagged so fixtures read naturally: `2.0` is a float, `2` an
/// int, `[2, 4]` an int list, `"float"` a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Argument {
    Bool(bool),
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Str(String),
}

impl Argument {
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Ints(_) => "ints",
            Self::Floats(_) => "floats",
            Self::Str(_) => "str",
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Ints(values) => write!(f, "{values:?}"),
            Self::Floats(values) => write!(f, "{values:?}"),
            Self::Str(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<bool> for Argument {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Argument {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Argument {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<Vec<i64>> for Argument {
    fn from(value: Vec<i64>) -> Self {
        Self::Ints(value)
    }
}

impl From<&[i64]> for Argument {
    fn from(value: &[i64]) -> Self {
        Self::Ints(value.to_vec())
    }
}

impl From<Vec<f64>> for Argument {
    fn from(value: Vec<f64>) -> Self {
        Self::Floats(value)
    }
}

impl From<&str> for Argument {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Argument {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// One operator invocation: type, named input/output blobs and arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorDef {
    op_type: String,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    args: BTreeMap<String, Argument>,
}

impl OperatorDef {
    #[must_use]
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            args: BTreeMap::new(),
        }
    }

    /// Bridge invocation of the tensor operation `operator`.
    #[must_use]
    pub fn aten(operator: &str) -> Self {
        Self::new(BRIDGE_OP_TYPE).with_arg(OPERATOR_ARG, operator)
    }

    #[must_use]
    pub fn with_inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(names.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(names.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_arg(mut self, name: &str, value: impl Into<Argument>) -> Self {
        self.args.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    #[must_use]
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    #[must_use]
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    #[must_use]
    pub fn args(&self) -> &BTreeMap<String, Argument> {
        &self.args
    }

    #[must_use]
    pub fn arg(&self, name: &str) -> Option<&Argument> {
        self.args.get(name)
    }

    /// Name in the `operator` argument, when present and a string.
    #[must_use]
    pub fn operator_name(&self) -> Option<&str> {
        match self.args.get(OPERATOR_ARG) {
            Some(Argument::Str(name)) => Some(name.as_str()),
            _ => None,
        }
    }
}
