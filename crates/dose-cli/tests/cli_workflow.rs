use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const PHANTOM_PLAN: &str = r#"
{
  "volume": {
    "phantom": {
      "shape": [10, 16, 10],
      "spacing": [4, 3, 4],
      "hu": 0,
      "inserts": [{ "box": [0, 10, 10, 13, 0, 10], "hu": -700 }]
    }
  },
  "beams": [
    { "id": "ap", "energy": 6, "gantry_angle": 0 },
    { "id": "lat", "energy": 6, "gantry_angle": 90, "weight": 0.5 }
  ],
  "structures": [{ "name": "ptv", "boxes": [[3, 7, 4, 8, 3, 7]] }]
}
"#;

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dirs should be created");
    }
    fs::write(path, content).expect("file should be written");
}

fn run(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dose-engine"))
        .args(args)
        .env("RUST_LOG", "error")
        .output()
        .expect("binary should run")
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "command should succeed, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

fn calculate(plan: &Path, archive: &Path, extra: &[&str]) -> Output {
    let plan = plan.to_str().expect("utf-8 path");
    let archive = archive.to_str().expect("utf-8 path");
    let mut args = vec!["calculate", "--plan", plan, "--output", archive];
    args.extend_from_slice(extra);
    run(&args)
}

#[test]
fn calculate_then_inspect_round_trips_the_archive() {
    let temp = TempDir::new().expect("tempdir should be created");
    let plan = temp.path().join("plan.json");
    let archive = temp.path().join("out/dose.dgz");
    write_file(&plan, PHANTOM_PLAN);
    fs::create_dir_all(temp.path().join("out")).expect("output dir");

    let summary = stdout_json(&calculate(&plan, &archive, &["--serial"]));
    assert_eq!(summary["algorithm"], "pencil_beam");
    assert_eq!(summary["backend"], "serial");
    assert_eq!(summary["execution_mode"], "serial");
    assert_eq!(summary["beams"], 2);
    assert_eq!(summary["shape"], serde_json::json!([10, 16, 10]));
    let max_dose = summary["max_dose"].as_f64().expect("max dose");
    assert!(max_dose > 0.0);
    assert!(archive.exists(), "archive should be written");

    let archive_arg = archive.to_str().expect("utf-8 path");
    let inspected = stdout_json(&run(&["inspect", "--archive", archive_arg]));
    assert_eq!(inspected["metadata"]["algorithm"], "pencil_beam");
    assert_eq!(inspected["metadata"]["shape"], serde_json::json!([10, 16, 10]));
    assert_eq!(inspected["metadata"]["spacing"], serde_json::json!([4.0, 3.0, 4.0]));
    assert_eq!(inspected["statistics"]["max"].as_f64(), Some(max_dose));
    assert!(inspected["statistics"]["nonzero_voxels"].as_u64().expect("count") > 0);
}

#[test]
fn algorithm_flag_and_options_file_override_the_plan() {
    let temp = TempDir::new().expect("tempdir should be created");
    let plan = temp.path().join("plan.json");
    let options = temp.path().join("options.json");
    let archive = temp.path().join("dose.dgz");
    write_file(&plan, PHANTOM_PLAN);
    write_file(
        &options,
        r#"{ "convolution": { "kernel_size": 5 },
             "normalization": { "mode": "mean", "structure": "ptv", "value": 2.0 } }"#,
    );

    let output = calculate(
        &plan,
        &archive,
        &[
            "--algorithm",
            "collapsed-cone",
            "--options",
            options.to_str().expect("utf-8 path"),
        ],
    );
    let summary = stdout_json(&output);
    assert_eq!(summary["algorithm"], "convolution");
    assert_eq!(summary["normalized"], true);

    let archive_arg = archive.to_str().expect("utf-8 path");
    let inspected = stdout_json(&run(&["inspect", "--archive", archive_arg]));
    assert_eq!(inspected["metadata"]["options"]["convolution"]["kernel_size"], 5);
    assert_eq!(
        inspected["metadata"]["options"]["normalization"]["structure"],
        "ptv"
    );
}

#[test]
fn raw_volumes_are_read_relative_to_the_plan() {
    let temp = TempDir::new().expect("tempdir should be created");
    let mut bytes = Vec::new();
    for index in 0..(6 * 8 * 6) {
        let j = (index / 6) % 8;
        let hu: i16 = if j < 2 { -1000 } else { 0 };
        bytes.extend_from_slice(&hu.to_le_bytes());
    }
    fs::write(temp.path().join("ct.raw"), bytes).expect("raw volume");
    let plan = temp.path().join("plan.json");
    write_file(
        &plan,
        r#"{
          "volume": { "raw": { "path": "ct.raw", "shape": [6, 8, 6], "spacing": [5, 5, 5], "dtype": "i16" } },
          "beams": [{ "id": "ap", "energy": 10, "gantry_angle": 0 }],
          "algorithm": "grid_based"
        }"#,
    );

    let summary = stdout_json(&calculate(&plan, &temp.path().join("dose.dgz"), &[]));
    assert_eq!(summary["algorithm"], "grid_tracer");
    assert_eq!(summary["shape"], serde_json::json!([6, 8, 6]));
}

#[test]
fn failures_report_a_diagnostic_and_category_exit_code() {
    let temp = TempDir::new().expect("tempdir should be created");
    let plan = temp.path().join("plan.json");
    let archive = temp.path().join("dose.dgz");
    write_file(&plan, PHANTOM_PLAN);

    let output = calculate(&plan, &archive, &["--algorithm", "voodoo"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ERROR: [INPUT.UNKNOWN_ALGORITHM]"), "{stderr}");
    assert!(stderr.contains("FATAL EXIT CODE: 2"), "{stderr}");
    assert!(!archive.exists());

    let output = calculate(&temp.path().join("missing.json"), &archive, &[]);
    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("[IO.PLAN_READ]"));

    write_file(
        &plan,
        r#"{ "volume": { "phantom": { "shape": [4, 4, 4], "spacing": [1, 1, 1] } }, "beams": [] }"#,
    );
    let output = calculate(&plan, &archive, &[]);
    assert_eq!(output.status.code(), Some(4));
    assert!(String::from_utf8_lossy(&output.stderr).contains("[RUN.NO_BEAMS]"));

    let output = run(&["calculate"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("[INPUT.CLI_USAGE]"));
}

#[test]
fn algorithms_command_lists_every_name() {
    let output = run(&["algorithms"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 5);
    for name in [
        "pencil_beam",
        "convolution",
        "transport",
        "grid_tracer",
        "monte_carlo",
    ] {
        assert!(
            lines.iter().any(|line| line.starts_with(name)),
            "missing {name}"
        );
    }
    assert!(stdout.contains("acuros_xb"));
}
