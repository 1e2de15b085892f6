#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use fb_core::{DenseTensor, ExecutionMode};
use fb_device::DeviceContext;
use fb_dispatch::{DispatchDecision, DispatchError, OperatorDef, OperatorRegistry, dispatch_operator};
use fb_runtime::{EvidenceEntry, EvidenceKind, RuntimeContext};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    MissingBlob { op: String, name: String },
    Dispatch(DispatchError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingBlob { op, name } if op.is_empty() => {
                write!(f, "workspace has no blob named {name:?}")
            }
            Self::MissingBlob { op, name } => {
                write!(f, "{op} reads blob {name:?}, which is not in the workspace")
            }
            Self::Dispatch(error) => write!(f, "operator run failed: {error}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<DispatchError> for SessionError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

/// Named-blob workspace bound to one execution context.
#[derive(Debug, Clone)]
pub struct BridgeSession {
    workspace: BTreeMap<String, DenseTensor>,
    registry: OperatorRegistry,
    runtime: RuntimeContext,
    context: DeviceContext,
    last_decision: Option<DispatchDecision>,
}

impl BridgeSession {
    #[must_use]
    pub fn new(context: DeviceContext, mode: ExecutionMode) -> Self {
        Self::with_registry(context, mode, OperatorRegistry::with_builtin_ops())
    }

    #[must_use]
    pub fn with_registry(
        context: DeviceContext,
        mode: ExecutionMode,
        registry: OperatorRegistry,
    ) -> Self {
        Self {
            workspace: BTreeMap::new(),
            registry,
            runtime: RuntimeContext::new(mode),
            context,
            last_decision: None,
        }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.runtime.mode()
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    #[must_use]
    pub fn context(&self) -> DeviceContext {
        self.context
    }

    #[must_use]
    pub fn registry(&self) -> &OperatorRegistry {
        &self.registry
    }

    /// Stores `tensor` under `name`, placed on the session's device.
    pub fn feed_blob(&mut self, name: impl Into<String>, tensor: DenseTensor) {
        let name = name.into();
        let tensor = tensor.to_device(self.context.device());
        self.runtime.record_workspace(format!(
            "feed blob={name} shape={:?} dtype={} device={}",
            tensor.shape(),
            tensor.dtype(),
            self.context
        ));
        self.workspace.insert(name, tensor);
    }

    pub fn fetch_blob(&self, name: &str) -> Result<&DenseTensor, SessionError> {
        self.workspace
            .get(name)
            .ok_or_else(|| SessionError::MissingBlob {
                op: String::new(),
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn has_blob(&self, name: &str) -> bool {
        self.workspace.contains_key(name)
    }

    #[must_use]
    pub fn blob_names(&self) -> Vec<&str> {
        self.workspace.keys().map(String::as_str).collect()
    }

    pub fn remove_blob(&mut self, name: &str) -> Option<DenseTensor> {
        let removed = self.workspace.remove(name);
        if removed.is_some() {
            self.runtime.record_workspace(format!("remove blob={name}"));
        }
        removed
    }

    pub fn reset_workspace(&mut self) {
        let cleared = self.workspace.len();
        self.workspace.clear();
        self.last_decision = None;
        self.runtime
            .record_workspace(format!("reset workspace cleared={cleared}"));
    }

    /// Runs one invocation: reads its inputs from the workspace and writes
    /// every output back under the invocation's output names.
    pub fn run_operator_once(&mut self, def: &OperatorDef) -> Result<DispatchDecision, SessionError> {
        let op = def.operator_name().unwrap_or(def.op_type()).to_string();
        let inputs = match self.gather_inputs(&op, def) {
            Ok(inputs) => inputs,
            Err(error) => {
                self.runtime.record_dispatch_failure(&op, &error);
                return Err(error);
            }
        };
        let refs: Vec<&DenseTensor> = inputs.iter().collect();

        let outcome = match dispatch_operator(&self.registry, def, &refs, self.context, self.mode()) {
            Ok(outcome) => outcome,
            Err(error) => {
                self.runtime.record_dispatch_failure(&op, &error);
                return Err(error.into());
            }
        };

        for (name, tensor) in def.outputs().iter().zip(outcome.outputs) {
            self.workspace.insert(name.clone(), tensor);
        }
        self.record_decision(&outcome.decision);
        self.last_decision = Some(outcome.decision.clone());
        Ok(outcome.decision)
    }

    /// Runs invocations in order, stopping at the first failure.
    pub fn run_operators(
        &mut self,
        defs: &[OperatorDef],
    ) -> Result<Vec<DispatchDecision>, SessionError> {
        defs.iter().map(|def| self.run_operator_once(def)).collect()
    }

    #[must_use]
    pub fn last_decision(&self) -> Option<&DispatchDecision> {
        self.last_decision.as_ref()
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.ledger().len()
    }

    fn gather_inputs(&self, op: &str, def: &OperatorDef) -> Result<Vec<DenseTensor>, SessionError> {
        def.inputs()
            .iter()
            .map(|name| {
                self.workspace
                    .get(name)
                    .cloned()
                    .ok_or_else(|| SessionError::MissingBlob {
                        op: op.to_string(),
                        name: name.clone(),
                    })
            })
            .collect()
    }

    fn record_decision(&mut self, decision: &DispatchDecision) {
        self.runtime.ledger_mut().record(
            EvidenceKind::Dispatch,
            format!(
                "op={} mode={:?} kernel={} key={:?} backend={:?} keyset=0x{:016x} fallback={} ignored_args={}",
                decision.op,
                decision.mode,
                decision.kernel,
                decision.selected_key,
                decision.backend_key,
                decision.keyset_bits,
                decision.fallback_used,
                decision.ignored_args
            ),
        );
    }
}
