//! Integration tests for `strata evaluate` and `strata predict`.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::json;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const CONFIG: &str = r"
input_features:
  - name: x
    type: number
output_features:
  - name: label
    type: binary
trainer:
  epochs: 2
  batch_size: 8
  learning_rate: 0.1
";

fn strata(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("strata").unwrap();
    cmd.current_dir(temp_dir.path()).env("STRATA_CONFIG", temp_dir.path().join("no-config.toml"));
    cmd
}

fn write_rows(path: &Path, rows: usize, labelled: bool) {
    let lines: Vec<String> = (0..rows)
        .map(|i| {
            let x = i as f64 / rows as f64 - 0.5;
            if labelled { json!({"x": x, "label": x > 0.0}) } else { json!({"x": x}) }.to_string()
        })
        .collect();
    std::fs::write(path, lines.join("\n")).unwrap();
}

/// Trains a model and returns its saved model directory.
fn train_model(temp_dir: &TempDir) -> PathBuf {
    let data = temp_dir.path().join("train.jsonl");
    write_rows(&data, 60, true);
    strata(temp_dir)
        .args(["train", "--skip-save-processed-input", "--config-str", CONFIG, "--dataset"])
        .arg(&data)
        .assert()
        .success();
    temp_dir.path().join("results").join("experiment_run").join("model")
}

#[test]
fn test_evaluate_saved_model() {
    let temp_dir = TempDir::new().unwrap();
    let model = train_model(&temp_dir);
    let data = temp_dir.path().join("eval.jsonl");
    write_rows(&data, 20, true);
    let out = temp_dir.path().join("eval");

    strata(&temp_dir)
        .args(["evaluate", "--collect-overall-stats", "--model-path"])
        .arg(&model)
        .arg("--dataset")
        .arg(&data)
        .arg("--output-directory")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("accuracy"));

    let statistics: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("test_statistics.json")).unwrap()).unwrap();
    assert!(statistics["label"]["confusion_matrix"].is_array());
    assert!(out.join("predictions.csv").exists());
}

#[test]
fn test_predict_without_labels() {
    let temp_dir = TempDir::new().unwrap();
    let model = train_model(&temp_dir);
    let data = temp_dir.path().join("unlabelled.jsonl");
    write_rows(&data, 15, false);
    let out = temp_dir.path().join("predict");

    strata(&temp_dir)
        .args(["predict", "--skip-save-unprocessed-output", "--model-path"])
        .arg(&model)
        .arg("--dataset")
        .arg(&data)
        .arg("-o")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("Predicted 15 rows"));

    let csv = std::fs::read_to_string(out.join("predictions.csv")).unwrap();
    assert!(csv.lines().next().unwrap().contains("label_predictions"));
    assert_eq!(csv.lines().count(), 16);
}

#[test]
fn test_evaluate_missing_model_fails() {
    let temp_dir = TempDir::new().unwrap();
    let data = temp_dir.path().join("eval.jsonl");
    write_rows(&data, 5, true);

    strata(&temp_dir)
        .args(["evaluate", "--model-path", "nowhere", "--dataset"])
        .arg(&data)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load model"));
}
