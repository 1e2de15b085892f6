#![forbid(unsafe_code)]

mod logging;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use fb_api::{BridgeSession, SessionError};
use fb_core::{DType, DenseTensor, DenseTensorError, Device, ExecutionMode, TensorStorage};
use fb_device::DeviceContext;
use fb_dispatch::{DispatchDecision, OperatorDef};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub use logging::{LOG_SCHEMA_VERSION, StructuredCaseLog, mode_label};

const MAX_FIXTURE_BYTES: u64 = 1_048_576;
const BRIDGE_FIXTURE: &str = "aten_bridge_cases.json";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub strict_mode: bool,
    /// Applies to fixture cases that carry no tolerance of their own.
    /// `None` keeps the per-dtype default.
    pub default_tolerance: Option<Tolerance>,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            strict_mode: true,
            default_tolerance: None,
        }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        if self.strict_mode {
            ExecutionMode::Strict
        } else {
            ExecutionMode::Hardened
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

/// Accepts `|actual - expected| <= atol + rtol * |expected|`; NaN matches NaN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl Tolerance {
    pub const EXACT: Self = Self::new(0.0, 0.0);

    #[must_use]
    pub const fn new(atol: f64, rtol: f64) -> Self {
        Self { atol, rtol }
    }

    #[must_use]
    pub const fn for_dtype(dtype: DType) -> Self {
        match dtype {
            DType::F32 | DType::F64 => Self::new(1e-4, 1e-4),
            DType::F16 => Self::new(1e-3, 1e-3),
            DType::I64 | DType::Bool => Self::EXACT,
        }
    }

    #[must_use]
    pub fn allows(self, actual: f64, expected: f64) -> bool {
        if actual.is_nan() || expected.is_nan() {
            return actual.is_nan() && expected.is_nan();
        }
        if actual == expected {
            return true;
        }
        if actual.is_infinite() || expected.is_infinite() {
            return false;
        }
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }

    fn is_exact(self) -> bool {
        self.atol == 0.0 && self.rtol == 0.0
    }
}

impl fmt::Display for Tolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "atol={} rtol={}", self.atol, self.rtol)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceCheckError {
    InputCountMismatch {
        op: String,
        expected: usize,
        actual: usize,
    },
    OutputCountMismatch {
        op: String,
        expected: usize,
        actual: usize,
    },
    Session(SessionError),
    Tensor(DenseTensorError),
    ShapeMismatch {
        output: String,
        actual: Vec<usize>,
        expected: Vec<usize>,
    },
    DTypeMismatch {
        output: String,
        actual: DType,
        expected: DType,
    },
    ValueMismatch {
        output: String,
        index: usize,
        actual: f64,
        expected: f64,
        tolerance: Tolerance,
    },
    InContext {
        context: DeviceContext,
        error: Box<ReferenceCheckError>,
    },
}

impl fmt::Display for ReferenceCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputCountMismatch {
                op,
                expected,
                actual,
            } => write!(
                f,
                "{op} binds {expected} input blob(s), but {actual} tensor(s) were supplied"
            ),
            Self::OutputCountMismatch {
                op,
                expected,
                actual,
            } => write!(
                f,
                "{op} declares {expected} output(s), but the reference produced {actual}"
            ),
            Self::Session(error) => write!(f, "operator invocation failed: {error}"),
            Self::Tensor(error) => write!(f, "output tensor could not be read: {error}"),
            Self::ShapeMismatch {
                output,
                actual,
                expected,
            } => write!(
                f,
                "output {output:?} has shape {actual:?}, reference has {expected:?}"
            ),
            Self::DTypeMismatch {
                output,
                actual,
                expected,
            } => write!(
                f,
                "output {output:?} has dtype {actual}, reference has {expected}"
            ),
            Self::ValueMismatch {
                output,
                index,
                actual,
                expected,
                tolerance,
            } => write!(
                f,
                "output {output:?} differs at flat index {index}: actual={actual} expected={expected} ({tolerance})"
            ),
            Self::InContext { context, error } => write!(f, "[{context}] {error}"),
        }
    }
}

impl std::error::Error for ReferenceCheckError {}

impl From<SessionError> for ReferenceCheckError {
    fn from(value: SessionError) -> Self {
        Self::Session(value)
    }
}

impl From<DenseTensorError> for ReferenceCheckError {
    fn from(value: DenseTensorError) -> Self {
        Self::Tensor(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputCheck {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub max_abs_error: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceCheckReport {
    pub op: String,
    pub context: DeviceContext,
    pub mode: ExecutionMode,
    pub decision: DispatchDecision,
    pub outputs: Vec<OutputCheck>,
    pub forensic_log: StructuredCaseLog,
}

/// Runs `op` on `context` and compares every output with `reference`
/// under the per-dtype default tolerance.
pub fn assert_reference_checks<F>(
    context: DeviceContext,
    mode: ExecutionMode,
    op: &OperatorDef,
    inputs: &[DenseTensor],
    reference: F,
) -> Result<ReferenceCheckReport, ReferenceCheckError>
where
    F: Fn(&[DenseTensor]) -> Vec<DenseTensor>,
{
    assert_reference_checks_with_tolerance(context, mode, op, inputs, None, reference)
}

pub fn assert_reference_checks_with_tolerance<F>(
    context: DeviceContext,
    mode: ExecutionMode,
    op: &OperatorDef,
    inputs: &[DenseTensor],
    tolerance: Option<Tolerance>,
    reference: F,
) -> Result<ReferenceCheckReport, ReferenceCheckError>
where
    F: Fn(&[DenseTensor]) -> Vec<DenseTensor>,
{
    let op_name = op.operator_name().unwrap_or(op.op_type()).to_string();
    if op.inputs().len() != inputs.len() {
        return Err(ReferenceCheckError::InputCountMismatch {
            op: op_name,
            expected: op.inputs().len(),
            actual: inputs.len(),
        });
    }

    let mut session = BridgeSession::new(context, mode);
    for (name, tensor) in op.inputs().iter().zip(inputs) {
        session.feed_blob(name.clone(), tensor.clone());
    }
    let decision = session.run_operator_once(op)?;

    let expected = reference(inputs);
    if expected.len() != op.outputs().len() {
        return Err(ReferenceCheckError::OutputCountMismatch {
            op: op_name,
            expected: op.outputs().len(),
            actual: expected.len(),
        });
    }

    let mut outputs = Vec::with_capacity(expected.len());
    for (name, expected) in op.outputs().iter().zip(&expected) {
        let actual = session.fetch_blob(name)?;
        let max_abs_error = compare_output(name, actual, expected, tolerance)?;
        outputs.push(OutputCheck {
            name: name.clone(),
            shape: actual.shape().to_vec(),
            dtype: actual.dtype(),
            max_abs_error,
        });
    }

    let forensic_log = StructuredCaseLog::new(
        "aten_reference",
        "generated",
        &format!("{op_name}@{}", context.label()),
        mode,
        vec!["crates/fb-conformance/tests/aten_bridge.rs".to_string()],
        format!(
            "cargo test -p fb-conformance --test aten_bridge -- --nocapture # mode={}",
            mode_label(mode)
        ),
        "pass",
        "reference_parity_ok",
    )
    .with_extra_fields(reference_forensic_fields(
        context, &decision, inputs, &outputs,
    ));

    Ok(ReferenceCheckReport {
        op: op_name,
        context,
        mode,
        decision,
        outputs,
        forensic_log,
    })
}

/// Stops at the first failing context. No contexts, no checks.
pub fn assert_reference_checks_all<F>(
    contexts: &[DeviceContext],
    mode: ExecutionMode,
    op: &OperatorDef,
    inputs: &[DenseTensor],
    reference: F,
) -> Result<Vec<ReferenceCheckReport>, ReferenceCheckError>
where
    F: Fn(&[DenseTensor]) -> Vec<DenseTensor>,
{
    contexts
        .iter()
        .map(|context| {
            assert_reference_checks(*context, mode, op, inputs, &reference).map_err(|error| {
                ReferenceCheckError::InContext {
                    context: *context,
                    error: Box::new(error),
                }
            })
        })
        .collect()
}

/// Returns the largest finite absolute error.
fn compare_output(
    name: &str,
    actual: &DenseTensor,
    expected: &DenseTensor,
    tolerance: Option<Tolerance>,
) -> Result<f64, ReferenceCheckError> {
    if actual.shape() != expected.shape() {
        return Err(ReferenceCheckError::ShapeMismatch {
            output: name.to_string(),
            actual: actual.shape().to_vec(),
            expected: expected.shape().to_vec(),
        });
    }
    if actual.dtype() != expected.dtype() {
        return Err(ReferenceCheckError::DTypeMismatch {
            output: name.to_string(),
            actual: actual.dtype(),
            expected: expected.dtype(),
        });
    }

    let tolerance = tolerance.unwrap_or_else(|| Tolerance::for_dtype(expected.dtype()));
    if !expected.dtype().is_floating_point() && tolerance.is_exact() {
        let actual_values = actual.values_i64()?;
        let expected_values = expected.values_i64()?;
        if let Some(index) = actual_values
            .iter()
            .zip(&expected_values)
            .position(|(actual, expected)| actual != expected)
        {
            return Err(ReferenceCheckError::ValueMismatch {
                output: name.to_string(),
                index,
                actual: actual_values[index] as f64,
                expected: expected_values[index] as f64,
                tolerance,
            });
        }
        return Ok(0.0);
    }

    let actual_values = actual.values_f64()?;
    let expected_values = expected.values_f64()?;
    let mut max_abs_error = 0.0f64;
    for (index, (actual, expected)) in actual_values.iter().zip(&expected_values).enumerate() {
        if !tolerance.allows(*actual, *expected) {
            return Err(ReferenceCheckError::ValueMismatch {
                output: name.to_string(),
                index,
                actual: *actual,
                expected: *expected,
                tolerance,
            });
        }
        let error = (actual - expected).abs();
        if error.is_finite() {
            max_abs_error = max_abs_error.max(error);
        }
    }
    Ok(max_abs_error)
}

fn reference_forensic_fields(
    context: DeviceContext,
    decision: &DispatchDecision,
    inputs: &[DenseTensor],
    outputs: &[OutputCheck],
) -> BTreeMap<String, Value> {
    let mut fields = decision_fields(decision);
    fields.insert("context".to_string(), json!(context.label()));
    fields.insert(
        "input_fingerprints".to_string(),
        json!(
            inputs
                .iter()
                .map(|tensor| format!("{:016x}", tensor.evidence_fingerprint64()))
                .collect::<Vec<_>>()
        ),
    );
    fields.insert(
        "outputs".to_string(),
        json!(
            outputs
                .iter()
                .map(|output| json!({
                    "name": output.name,
                    "shape": output.shape,
                    "dtype": output.dtype.aten_name(),
                    "max_abs_error": output.max_abs_error,
                }))
                .collect::<Vec<_>>()
        ),
    );
    fields
}

fn decision_fields(decision: &DispatchDecision) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    fields.insert("op".to_string(), json!(decision.op));
    fields.insert("kernel".to_string(), json!(decision.kernel));
    fields.insert(
        "selected_key".to_string(),
        json!(format!("{:?}", decision.selected_key)),
    );
    fields.insert(
        "backend_key".to_string(),
        json!(format!("{:?}", decision.backend_key)),
    );
    fields.insert("keyset_bits".to_string(), json!(decision.keyset_bits));
    fields.insert("fallback_used".to_string(), json!(decision.fallback_used));
    fields.insert("ignored_args".to_string(), json!(decision.ignored_args));
    fields
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub strict_mode: bool,
    pub cases_total: usize,
    pub cases_passed: usize,
}

impl HarnessReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.cases_total == self.cases_passed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub output_ok: bool,
    pub error_ok: bool,
    pub fallback_ok: bool,
    pub kernel_ok: bool,
    pub ignored_args_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl BridgeCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.output_ok && self.error_ok && self.fallback_ok && self.kernel_ok && self.ignored_args_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForensicsSummary {
    pub output_path: PathBuf,
    pub log_entries: usize,
    pub failed_entries: usize,
    pub modes: Vec<ExecutionMode>,
}

#[derive(Debug, Clone, Deserialize)]
struct BridgeFixtureFile {
    cases: Vec<BridgeCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct BridgeCase {
    name: String,
    op: OperatorDef,
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    inputs: Vec<TensorFixture>,
    #[serde(default)]
    expected_outputs: Vec<TensorFixture>,
    #[serde(default)]
    tolerance: Option<Tolerance>,
    #[serde(default)]
    strict: ModeExpectation,
    #[serde(default)]
    hardened: ModeExpectation,
}

#[derive(Debug, Clone, Deserialize)]
struct TensorFixture {
    dtype: String,
    shape: Vec<usize>,
    values: Vec<f64>,
}

impl TensorFixture {
    fn to_tensor(&self) -> Result<DenseTensor, String> {
        let dtype = DType::from_aten_name(&self.dtype)
            .ok_or_else(|| format!("unknown fixture dtype '{}'", self.dtype))?;
        DenseTensor::from_contiguous(
            self.shape.clone(),
            TensorStorage::from_f64_values(dtype, &self.values),
            Device::Cpu,
        )
        .map_err(|error| format!("invalid fixture tensor: {error}"))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ModeExpectation {
    expect_error: Option<bool>,
    expected_fallback: Option<bool>,
    expected_kernel: Option<String>,
    expected_ignored_args: Option<usize>,
    expected_outputs: Option<Vec<TensorFixture>>,
}

/// Fixture count plus a bridge conformance pass in the configured mode.
#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = fs::read_dir(&config.fixture_root)
        .ok()
        .into_iter()
        .flat_map(|it| it.filter_map(Result::ok))
        .count();

    let (cases_total, cases_passed) = run_bridge_conformance(config, config.mode())
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(BridgeCaseReport::passed))
        });

    HarnessReport {
        suite: "smoke",
        fixture_count,
        strict_mode: config.strict_mode,
        cases_total,
        cases_passed,
    }
}

pub fn run_bridge_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<BridgeCaseReport>), String> {
    let fixture_path = config.fixture_root.join(BRIDGE_FIXTURE);
    let fixture: BridgeFixtureFile = load_fixture(&fixture_path)?;
    run_bridge_conformance_with_fixture(config, mode, &fixture)
}

fn run_bridge_conformance_with_fixture(
    config: &HarnessConfig,
    mode: ExecutionMode,
    fixture: &BridgeFixtureFile,
) -> Result<(HarnessReport, Vec<BridgeCaseReport>), String> {
    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_bridge_case(config, case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(BridgeCaseReport::passed));

    let report = HarnessReport {
        suite: "aten_bridge",
        fixture_count: 1,
        strict_mode: mode == ExecutionMode::Strict,
        cases_total,
        cases_passed,
    };

    Ok((report, case_reports))
}

/// Writes one JSON line per fixture case and mode. Empty `modes` means both.
pub fn emit_forensics_log(
    config: &HarnessConfig,
    output_path: &Path,
    modes: &[ExecutionMode],
) -> Result<ForensicsSummary, String> {
    let selected_modes = if modes.is_empty() {
        vec![ExecutionMode::Strict, ExecutionMode::Hardened]
    } else {
        modes.to_vec()
    };

    let fixture: BridgeFixtureFile = load_fixture(&config.fixture_root.join(BRIDGE_FIXTURE))?;
    let mut logs = Vec::new();
    for mode in selected_modes.iter().copied() {
        let (_, cases) = run_bridge_conformance_with_fixture(config, mode, &fixture)?;
        logs.extend(cases.into_iter().map(|case| case.forensic_log));
    }

    let mut lines = Vec::with_capacity(logs.len());
    for entry in &logs {
        lines.push(entry.to_json_line()?);
    }
    let mut payload = lines.join("\n");
    payload.push('\n');

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|error| {
                format!(
                    "failed to create forensics log dir {}: {error}",
                    parent.display()
                )
            })?;
        }
    }
    fs::write(output_path, payload).map_err(|error| {
        format!(
            "failed to write forensics log {}: {error}",
            output_path.display()
        )
    })?;

    let failed_entries = logs.iter().filter(|entry| !entry.passed()).count();

    Ok(ForensicsSummary {
        output_path: output_path.to_path_buf(),
        log_entries: logs.len(),
        failed_entries,
        modes: selected_modes,
    })
}

fn run_bridge_case(
    config: &HarnessConfig,
    case: &BridgeCase,
    mode: ExecutionMode,
) -> Result<BridgeCaseReport, String> {
    let expectation = match mode {
        ExecutionMode::Strict => &case.strict,
        ExecutionMode::Hardened => &case.hardened,
    };
    let context = parse_context(case.device.as_deref())?;
    if case.inputs.len() != case.op.inputs().len() {
        return Err(format!(
            "bridge case '{}' supplies {} input tensor(s) for {} input blob(s)",
            case.name,
            case.inputs.len(),
            case.op.inputs().len()
        ));
    }

    let mut session = BridgeSession::new(context, mode);
    for (name, fixture) in case.op.inputs().iter().zip(&case.inputs) {
        session.feed_blob(name.clone(), fixture.to_tensor()?);
    }
    let result = session.run_operator_once(&case.op);

    let mut fields = BTreeMap::new();
    fields.insert("context".to_string(), json!(context.label()));
    fields.insert(
        "operator".to_string(),
        json!(case.op.operator_name().unwrap_or(case.op.op_type())),
    );

    if expectation.expect_error.unwrap_or(false) {
        let error_ok = result.is_err();
        let reason_code = if error_ok {
            "expected_error_observed"
        } else {
            "expected_error_missing"
        };
        if let Err(error) = &result {
            fields.insert("error".to_string(), json!(error.to_string()));
        }
        return Ok(BridgeCaseReport {
            name: case.name.clone(),
            mode,
            output_ok: true,
            error_ok,
            fallback_ok: true,
            kernel_ok: true,
            ignored_args_ok: true,
            forensic_log: bridge_case_log(case, mode, error_ok, reason_code, fields),
        });
    }

    let decision = match result {
        Ok(decision) => decision,
        Err(error) => {
            fields.insert("error".to_string(), json!(error.to_string()));
            return Ok(BridgeCaseReport {
                name: case.name.clone(),
                mode,
                output_ok: false,
                error_ok: false,
                fallback_ok: false,
                kernel_ok: false,
                ignored_args_ok: false,
                forensic_log: bridge_case_log(case, mode, false, "unexpected_error", fields),
            });
        }
    };
    fields.extend(decision_fields(&decision));

    let expected_outputs = expectation
        .expected_outputs
        .as_ref()
        .unwrap_or(&case.expected_outputs)
        .iter()
        .map(TensorFixture::to_tensor)
        .collect::<Result<Vec<_>, _>>()?;
    let tolerance = case.tolerance.or(config.default_tolerance);
    let mut output_ok = expected_outputs.len() <= case.op.outputs().len();
    let mut max_abs_error = 0.0f64;
    for (name, expected) in case.op.outputs().iter().zip(&expected_outputs) {
        let comparison = session
            .fetch_blob(name)
            .map_err(ReferenceCheckError::from)
            .and_then(|actual| compare_output(name, actual, expected, tolerance));
        match comparison {
            Ok(error) => max_abs_error = max_abs_error.max(error),
            Err(error) => {
                output_ok = false;
                fields.insert("mismatch".to_string(), json!(error.to_string()));
                break;
            }
        }
    }
    fields.insert("max_abs_error".to_string(), json!(max_abs_error));

    let fallback_ok = expectation
        .expected_fallback
        .is_none_or(|expected| expected == decision.fallback_used);
    let kernel_ok = expectation
        .expected_kernel
        .as_deref()
        .is_none_or(|expected| expected == decision.kernel);
    let ignored_args_ok = expectation
        .expected_ignored_args
        .is_none_or(|expected| expected == decision.ignored_args);
    let passed = output_ok && fallback_ok && kernel_ok && ignored_args_ok;
    let reason_code = if passed {
        "bridge_parity_ok"
    } else {
        "bridge_expectation_mismatch"
    };

    Ok(BridgeCaseReport {
        name: case.name.clone(),
        mode,
        output_ok,
        error_ok: true,
        fallback_ok,
        kernel_ok,
        ignored_args_ok,
        forensic_log: bridge_case_log(case, mode, passed, reason_code, fields),
    })
}

fn bridge_case_log(
    case: &BridgeCase,
    mode: ExecutionMode,
    passed: bool,
    reason_code: &str,
    fields: BTreeMap<String, Value>,
) -> StructuredCaseLog {
    StructuredCaseLog::new(
        "aten_bridge",
        BRIDGE_FIXTURE,
        case.name.as_str(),
        mode,
        vec![format!("crates/fb-conformance/fixtures/{BRIDGE_FIXTURE}")],
        format!(
            "cargo run -p fb-conformance --bin run_bridge_conformance -- --mode {}",
            mode_label(mode)
        ),
        if passed { "pass" } else { "fail" },
        reason_code,
    )
    .with_extra_fields(fields)
}

fn parse_context(raw: Option<&str>) -> Result<DeviceContext, String> {
    let Some(raw) = raw else {
        return Ok(DeviceContext::cpu());
    };
    match raw.split_once(':') {
        None if raw == "cpu" => Ok(DeviceContext::cpu()),
        None if raw == "cuda" => Ok(DeviceContext::cuda(0)),
        Some(("cuda", index)) => index
            .parse::<u32>()
            .map(DeviceContext::cuda)
            .map_err(|error| format!("invalid cuda device index '{index}': {error}")),
        _ => Err(format!("unsupported fixture device '{raw}'")),
    }
}

fn load_fixture<T>(path: &Path) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}",
            path.display()
        ));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}
