//! Integration tests for `strata train`, `strata experiment` and `strata kfold`.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::json;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const CONFIG: &str = r"
input_features:
  - name: x
    type: number
  - name: color
    type: category
output_features:
  - name: label
    type: binary
trainer:
  epochs: 2
  batch_size: 8
  learning_rate: 0.1
";

/// Writes a labelled jsonl dataset and returns its path.
fn write_dataset(dir: &Path, rows: usize) -> PathBuf {
    let path = dir.join("data.jsonl");
    let lines: Vec<String> = (0..rows)
        .map(|i| {
            let x = i as f64 / rows as f64 - 0.5;
            let color = ["red", "green", "blue"][i % 3];
            json!({"x": x, "color": color, "label": x > 0.0}).to_string()
        })
        .collect();
    std::fs::write(&path, lines.join("\n")).unwrap();
    path
}

fn write_config(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("config.yaml");
    std::fs::write(&path, text).unwrap();
    path
}

/// `strata` with a config file that does not exist, so user defaults never leak in.
fn strata(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("strata").unwrap();
    cmd.current_dir(temp_dir.path()).env("STRATA_CONFIG", temp_dir.path().join("no-config.toml"));
    cmd
}

#[test]
fn test_help_lists_commands() {
    let temp_dir = TempDir::new().unwrap();
    strata(&temp_dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("train"))
        .stdout(predicate::str::contains("experiment"))
        .stdout(predicate::str::contains("kfold"));
}

#[test]
fn test_train_writes_run_directory() {
    let temp_dir = TempDir::new().unwrap();
    let data = write_dataset(temp_dir.path(), 60);
    let config = write_config(temp_dir.path(), CONFIG);

    strata(&temp_dir)
        .arg("train")
        .arg("--config")
        .arg(&config)
        .arg("--dataset")
        .arg(&data)
        .arg("--output-directory")
        .arg(temp_dir.path().join("results"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Training complete"));

    let run_dir = temp_dir.path().join("results").join("experiment_run");
    assert!(run_dir.join("description.json").exists());
    assert!(run_dir.join("training_statistics.json").exists());
    assert!(run_dir.join("model").join("model_weights.json").exists());
    assert!(run_dir.join("model").join("model_hyperparameters.json").exists());
}

#[test]
fn test_skip_every_artifact_leaves_no_run_directory() {
    let temp_dir = TempDir::new().unwrap();
    let data = write_dataset(temp_dir.path(), 60);
    let config = write_config(temp_dir.path(), CONFIG);

    strata(&temp_dir)
        .args(["train", "--config"])
        .arg(&config)
        .arg("--dataset")
        .arg(&data)
        .args([
            "--skip-save-training-description",
            "--skip-save-training-statistics",
            "--skip-save-model",
            "--skip-save-progress",
            "--skip-save-log",
            "--skip-save-processed-input",
        ])
        .assert()
        .success();

    assert!(!temp_dir.path().join("results").exists());
}

#[test]
fn test_experimental_section_needs_confirmation() {
    let temp_dir = TempDir::new().unwrap();
    let data = write_dataset(temp_dir.path(), 60);
    let config = write_config(temp_dir.path(), &format!("{CONFIG}hyperopt:\n  goal: minimize\n"));

    strata(&temp_dir)
        .args(["train", "--config"])
        .arg(&config)
        .arg("--dataset")
        .arg(&data)
        .assert()
        .code(1);
    assert!(!temp_dir.path().join("results").exists());

    strata(&temp_dir)
        .args(["train", "--yes", "--config"])
        .arg(&config)
        .arg("--dataset")
        .arg(&data)
        .assert()
        .success();
    let saved = std::fs::read_to_string(
        temp_dir.path().join("results/experiment_run/model/model_hyperparameters.json"),
    )
    .unwrap();
    assert!(!saved.contains("hyperopt"));
}

#[test]
fn test_inline_config_and_cli_defaults_file() {
    let temp_dir = TempDir::new().unwrap();
    let data = write_dataset(temp_dir.path(), 60);
    let defaults = temp_dir.path().join("strata.toml");
    std::fs::write(&defaults, "output_directory = \"runs\"\nlog_level = \"warn\"\n").unwrap();

    Command::cargo_bin("strata")
        .unwrap()
        .current_dir(temp_dir.path())
        .env("STRATA_CONFIG", &defaults)
        .args(["train", "--config-str", CONFIG, "--dataset"])
        .arg(&data)
        .assert()
        .success();

    assert!(temp_dir.path().join("runs").join("experiment_run").exists());
}

#[test]
fn test_unknown_backend_fails() {
    let temp_dir = TempDir::new().unwrap();
    let data = write_dataset(temp_dir.path(), 60);

    strata(&temp_dir)
        .args(["train", "--backend", "ray", "--config-str", CONFIG, "--dataset"])
        .arg(&data)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown backend"));
}

#[test]
fn test_invalid_config_fails_before_writing() {
    let temp_dir = TempDir::new().unwrap();
    let data = write_dataset(temp_dir.path(), 60);
    let config = CONFIG.replace("epochs: 2", "epochs: 0");

    strata(&temp_dir)
        .args(["train", "--config-str", &config, "--dataset"])
        .arg(&data)
        .assert()
        .failure()
        .stderr(predicate::str::contains("epochs"));
    assert!(!temp_dir.path().join("results").exists());
}

#[test]
fn test_experiment_writes_evaluation_files() {
    let temp_dir = TempDir::new().unwrap();
    let data = write_dataset(temp_dir.path(), 90);

    strata(&temp_dir)
        .args(["experiment", "--config-str", CONFIG, "--dataset"])
        .arg(&data)
        .assert()
        .success()
        .stdout(predicate::str::contains("Experiment complete"));

    let run_dir = temp_dir.path().join("results").join("experiment_run");
    assert!(run_dir.join("test_statistics.json").exists());
    assert!(run_dir.join("predictions.csv").exists());
}

#[test]
fn test_kfold_writes_aggregate() {
    let temp_dir = TempDir::new().unwrap();
    let data = write_dataset(temp_dir.path(), 40);

    strata(&temp_dir)
        .args(["kfold", "-k", "4", "--config-str", CONFIG, "--dataset"])
        .arg(&data)
        .assert()
        .success()
        .stdout(predicate::str::contains("4-fold cross validation"));

    assert!(temp_dir.path().join("results").join("kfold_training_statistics.json").exists());
}
