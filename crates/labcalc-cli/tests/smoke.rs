use labcalc_engine::{
    Analysis, Pad, PadValue, RecordStatus, StepConfig, StepParams, load_pads_from_path,
    save_pads_to_path,
};
use serde_json::{Value, json};
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn write_analysis(path: &Path) {
    let analysis = Analysis::new("d13c")
        .with_step(
            StepConfig::new(0, "background")
                .input("signal", "v44")
                .input("mass_spec_id", "instrument")
                .output("bg", "bg")
                .output("net", "v44_net")
                .format("net", "0.000"),
        )
        .with_step(
            StepConfig::new(1, "linear_correction")
                .input("raw", "v44_net")
                .output("corrected", "v44_corr"),
        )
        .with_step(
            StepConfig::new(2, "replicate_mean")
                .input("value", "v44_corr")
                .output("mean", "v44_mean"),
        )
        .with_params(StepParams::new(1).with("slope", json!(2.0)));
    analysis
        .save_to_path(path)
        .expect("analysis should save");
}

fn write_references(path: &Path) {
    let references = json!({
        "mass_spec": {
            "ms-1": { "background": 0.5 }
        }
    });
    std::fs::write(path, references.to_string()).expect("references should be written");
}

fn replicate(id: &str, signal: f64) -> Pad {
    Pad::replicate(id)
        .with_number("v44", signal)
        .with_text("instrument", "ms-1")
}

fn run_cli(args: &[&str], cwd: &Path) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_labcalc"))
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("cli process should start")
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("path should be utf8")
}

#[test]
fn compile_command_json_expected_column_report() {
    let temp = TempDir::new().expect("tempdir should create");
    let analysis = temp.path().join("analysis.json");
    write_analysis(&analysis);

    let output = run_cli(
        &["compile", "--analysis", path_str(&analysis), "--json"],
        temp.path(),
    );

    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    let report: Value = serde_json::from_str(&stdout).expect("json output should parse");
    assert_eq!(report["analysis_id"], "d13c");
    assert_eq!(report["required_input_columns"], json!(["v44"]));
    assert_eq!(
        report["generated_output_columns"],
        json!(["bg", "v44_net", "v44_corr", "v44_mean"])
    );
    assert_eq!(report["output_formats"]["v44_net"], "0.000");
    assert_eq!(report["errors"], json!([]));
}

#[test]
fn compile_command_duplicate_positions_expected_exit_code_two() {
    let temp = TempDir::new().expect("tempdir should create");
    let analysis_path = temp.path().join("analysis.json");
    Analysis::new("dup")
        .with_step(StepConfig::new(0, "linear_correction").input("raw", "a"))
        .with_step(StepConfig::new(0, "linear_correction").input("raw", "b"))
        .save_to_path(&analysis_path)
        .expect("analysis should save");

    let output = run_cli(
        &["compile", "--analysis", path_str(&analysis_path)],
        temp.path(),
    );

    assert_eq!(output.status.code(), Some(2));
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    assert!(stdout.contains("compile_error: [duplicate_position]"));
}

#[test]
fn run_command_batch_expected_outputs_written_and_ok_status() {
    let temp = TempDir::new().expect("tempdir should create");
    let analysis = temp.path().join("analysis.json");
    let records = temp.path().join("records.json");
    let references = temp.path().join("references.json");
    let output_path = temp.path().join("out.json");
    write_analysis(&analysis);
    write_references(&references);
    save_pads_to_path(&[replicate("r1", 3.0), replicate("r2", 4.5)], &records)
        .expect("records should save");

    let output = run_cli(
        &[
            "run",
            "--analysis",
            path_str(&analysis),
            "--records",
            path_str(&records),
            "--references",
            path_str(&references),
            "--output",
            path_str(&output_path),
            "--event-json",
        ],
        temp.path(),
    );

    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    assert!(stdout.contains("\"kind\":\"run_started\""));
    assert!(stdout.contains("run_id: d13c-batch"));
    assert!(stdout.contains("record r1: OK"));
    assert!(stdout.contains("record r2: OK"));

    let written = load_pads_from_path(&output_path).expect("output records should load");
    assert_eq!(written[0].get_f64("v44_corr"), Some(5.0));
    assert_eq!(written[1].get_f64("v44_corr"), Some(8.0));
    assert_eq!(written[0].status(), Some(RecordStatus::Ok));
}

#[test]
fn run_command_single_missing_reference_expected_error_exit() {
    let temp = TempDir::new().expect("tempdir should create");
    let analysis = temp.path().join("analysis.json");
    let records = temp.path().join("records.json");
    write_analysis(&analysis);
    save_pads_to_path(&[replicate("r1", 3.0)], &records).expect("records should save");

    let output = run_cli(
        &[
            "run",
            "--analysis",
            path_str(&analysis),
            "--records",
            path_str(&records),
            "--mode",
            "single",
            "--target",
            "0",
            "--no-stream-events",
        ],
        temp.path(),
    );

    assert_eq!(output.status.code(), Some(2));
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    assert!(stdout.contains("record r1: ERROR"));
    assert!(stdout.contains("error: record 'r1' step 0 (background)"));
}

#[test]
fn run_command_sample_expected_mean_over_replicates() {
    let temp = TempDir::new().expect("tempdir should create");
    let analysis = temp.path().join("analysis.json");
    let records = temp.path().join("records.json");
    let output_path = temp.path().join("out.json");
    write_analysis(&analysis);
    let sample = Pad::sample("s1")
        .with_child(
            Pad::replicate("r1")
                .with_number("v44_corr", 4.0)
                .with_status(RecordStatus::Ok),
        )
        .with_child(
            Pad::replicate("r2")
                .with_number("v44_corr", 6.0)
                .with_status(RecordStatus::Ok),
        );
    save_pads_to_path(&[sample], &records).expect("records should save");

    let output = run_cli(
        &[
            "run",
            "--analysis",
            path_str(&analysis),
            "--records",
            path_str(&records),
            "--mode",
            "sample",
            "--output",
            path_str(&output_path),
            "--no-stream-events",
        ],
        temp.path(),
    );

    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let written = load_pads_from_path(&output_path).expect("output records should load");
    match written[0].get("v44_mean") {
        Some(PadValue::Accumulator(accumulator)) => assert_eq!(accumulator.value, 5.0),
        other => panic!("expected accumulator, got {other:?}"),
    }
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    assert!(stdout.contains("record s1: OK"));
}

#[test]
fn run_command_full_expected_replicates_recalculated_before_mean() {
    let temp = TempDir::new().expect("tempdir should create");
    let analysis = temp.path().join("analysis.json");
    let records = temp.path().join("records.json");
    let references = temp.path().join("references.json");
    let output_path = temp.path().join("out.json");
    write_analysis(&analysis);
    write_references(&references);
    let sample = Pad::sample("s1")
        .with_child(replicate("r1", 3.0))
        .with_child(replicate("r2", 4.5));
    save_pads_to_path(&[sample], &records).expect("records should save");

    let output = run_cli(
        &[
            "run",
            "--analysis",
            path_str(&analysis),
            "--records",
            path_str(&records),
            "--references",
            path_str(&references),
            "--mode",
            "full",
            "--output",
            path_str(&output_path),
            "--no-stream-events",
        ],
        temp.path(),
    );

    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let written = load_pads_from_path(&output_path).expect("output records should load");
    let children = written[0].children();
    assert_eq!(children[0].get_f64("v44_corr"), Some(5.0));
    assert_eq!(children[1].get_f64("v44_corr"), Some(8.0));
    match written[0].get("v44_mean") {
        Some(PadValue::Accumulator(accumulator)) => assert_eq!(accumulator.value, 6.5),
        other => panic!("expected accumulator, got {other:?}"),
    }
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    assert!(stdout.contains("run_id: d13c-sample-s1/replicates"));
    assert!(stdout.contains("record s1: OK"));
    assert!(stdout.contains("  child r1: OK"));
}
