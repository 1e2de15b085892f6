use std::collections::BTreeMap;

use fb_core::ExecutionMode;
use serde::Serialize;
use serde_json::Value;

pub const LOG_SCHEMA_VERSION: &str = "fb-conformance-log-v1";

/// One JSON-lines record per executed case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub schema_version: String,
    pub ts_unix_ms: u128,
    pub suite_id: String,
    pub scenario_id: String,
    pub fixture_id: String,
    pub mode: String,
    pub seed: u64,
    pub env_fingerprint: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub outcome: String,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &str,
        fixture_id: &str,
        case_name: &str,
        mode: ExecutionMode,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &str,
        reason_code: &str,
    ) -> Self {
        let mode = mode_label(mode);
        Self {
            schema_version: LOG_SCHEMA_VERSION.to_string(),
            ts_unix_ms: now_unix_ms(),
            suite_id: suite_id.to_string(),
            scenario_id: format!("{suite_id}/{mode}:{case_name}"),
            fixture_id: fixture_id.to_string(),
            mode: mode.to_string(),
            seed: det_seed(&[suite_id, fixture_id, case_name, mode]),
            env_fingerprint: env_fingerprint(),
            artifact_refs,
            replay_command,
            outcome: outcome.to_string(),
            reason_code: reason_code.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    /// Merges forensic fields; envelope keys are never shadowed.
    #[must_use]
    pub fn with_extra_fields(mut self, fields: BTreeMap<String, Value>) -> Self {
        for (key, value) in fields {
            if !ENVELOPE_KEYS.contains(&key.as_str()) {
                self.extra_fields.insert(key, value);
            }
        }
        self
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == "pass"
    }

    pub fn to_json_line(&self) -> Result<String, String> {
        serde_json::to_string(self)
            .map_err(|error| format!("failed to serialize structured log entry: {error}"))
    }
}

const ENVELOPE_KEYS: [&str; 12] = [
    "schema_version",
    "ts_unix_ms",
    "suite_id",
    "scenario_id",
    "fixture_id",
    "mode",
    "seed",
    "env_fingerprint",
    "artifact_refs",
    "replay_command",
    "outcome",
    "reason_code",
];

#[must_use]
pub fn mode_label(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Strict => "strict",
        ExecutionMode::Hardened => "hardened",
    }
}

/// FNV-1a over the parts; never zero.
fn det_seed(parts: &[&str]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for part in parts {
        for byte in part.bytes().chain(std::iter::once(0xff)) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash.max(1)
}

fn env_fingerprint() -> String {
    let seed = det_seed(&[
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    ]);
    format!("det64:{seed:016x}")
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
