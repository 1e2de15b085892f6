#![forbid(unsafe_code)]

use std::path::PathBuf;

use fb_conformance::{
    BridgeCaseReport, HarnessConfig, emit_forensics_log, mode_label, run_bridge_conformance,
};
use fb_core::ExecutionMode;
use serde_json::json;

fn main() -> Result<(), String> {
    let mut mode = String::from("both");
    let mut output: Option<PathBuf> = None;
    let mut print_full_report = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--mode requires one of: strict|hardened|both".to_string())?;
                mode = value;
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--print-full-report" => {
                print_full_report = true;
            }
            other => {
                return Err(format!(
                    "unknown arg '{other}'. usage: run_bridge_conformance [--mode strict|hardened|both] [--output path] [--print-full-report]"
                ));
            }
        }
    }

    let modes = parse_modes(mode.as_str())?;
    let config = HarnessConfig::default_paths();

    let mut mode_summaries = Vec::with_capacity(modes.len());
    let mut failed_cases = Vec::new();
    for mode in modes.iter().copied() {
        let (report, cases) = run_bridge_conformance(&config, mode)?;
        failed_cases.extend(
            cases
                .iter()
                .filter(|case| !case.passed())
                .map(|case| format!("{}:{}", mode_label(mode), case.name)),
        );
        let mut summary = json!({
            "mode": mode_label(mode),
            "suite": report.suite,
            "cases_total": report.cases_total,
            "cases_passed": report.cases_passed,
        });
        if print_full_report {
            summary["cases"] = json!(cases.iter().map(case_summary).collect::<Vec<_>>());
        }
        mode_summaries.push(summary);
    }

    let forensics = match output {
        Some(path) => {
            let summary = emit_forensics_log(&config, path.as_path(), modes.as_slice())?;
            Some(json!({
                "output_path": summary.output_path.display().to_string(),
                "log_entries": summary.log_entries,
                "failed_entries": summary.failed_entries,
            }))
        }
        None => None,
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "status": if failed_cases.is_empty() { "ok" } else { "failed" },
            "modes": mode_summaries,
            "failed_cases": failed_cases,
            "forensics": forensics,
        }))
        .map_err(|error| format!("failed to serialize summary: {error}"))?
    );

    if failed_cases.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "{} bridge conformance case(s) failed",
            failed_cases.len()
        ))
    }
}

fn case_summary(case: &BridgeCaseReport) -> serde_json::Value {
    json!({
        "name": case.name,
        "passed": case.passed(),
        "reason_code": case.forensic_log.reason_code,
        "scenario_id": case.forensic_log.scenario_id,
    })
}

fn parse_modes(raw: &str) -> Result<Vec<ExecutionMode>, String> {
    match raw {
        "strict" => Ok(vec![ExecutionMode::Strict]),
        "hardened" => Ok(vec![ExecutionMode::Hardened]),
        "both" => Ok(vec![ExecutionMode::Strict, ExecutionMode::Hardened]),
        _ => Err(format!(
            "unsupported mode '{raw}'; expected strict|hardened|both"
        )),
    }
}
