//! Integration tests for k-fold cross validation.

mod common;

use common::{config, frame, list_files, CountingBackend, Counters};
use std::collections::BTreeSet;
use std::sync::Arc;
use strata_training::kfold::KFOLD_STATISTICS_FILE_NAME;
use strata_training::{
    kfold_cross_validate, CallbackBus, DatasetSource, KFoldOptions, KFoldResults, ModelRegistry, SkipSave,
};
use tempfile::TempDir;

async fn cross_validate(options: &KFoldOptions, backend: Arc<CountingBackend>) -> KFoldResults {
    let mut config = config();
    config.trainer.epochs = 1;
    kfold_cross_validate(
        &config,
        &DatasetSource::Frame(frame(100)),
        options,
        backend,
        &ModelRegistry::default(),
        &CallbackBus::new(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_five_folds_are_disjoint_and_cover_every_row() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(CountingBackend::coordinator());
    let counters = backend.counters.clone();
    let options = KFoldOptions {
        skip_save: SkipSave::all(),
        output_directory: Some(temp.path().to_path_buf()),
        ..KFoldOptions::default()
    };
    let results = cross_validate(&options, backend).await;

    assert_eq!(results.folds.len(), 5);
    let mut seen = BTreeSet::new();
    for fold in &results.folds {
        assert_eq!(fold.test_indices.len(), 20);
        for &row in &fold.test_indices {
            assert!(seen.insert(row), "row {row} appears in two folds");
        }
        assert!(fold.test_statistics.contains_key("label"));
    }
    assert_eq!(seen, (0..100).collect());

    assert_eq!(Counters::get(&counters.trainers_created), 5);
    assert_eq!(Counters::get(&counters.trainers_released), 5);

    let summary = &results.overall["label"]["accuracy"];
    assert!((0.0..=1.0).contains(&summary.mean));
    assert!(summary.std >= 0.0);
    assert!(!results.overall["label"].contains_key("confusion_matrix"));
    assert_eq!(list_files(temp.path()), vec![std::path::PathBuf::from(KFOLD_STATISTICS_FILE_NAME)]);
}

#[tokio::test]
async fn test_same_seed_gives_same_folds() {
    let options = KFoldOptions { num_folds: 4, skip_save: SkipSave::all(), ..KFoldOptions::default() };
    let first = cross_validate(&options, Arc::new(CountingBackend::coordinator())).await;
    let second = cross_validate(&options, Arc::new(CountingBackend::coordinator())).await;

    let indices = |r: &KFoldResults| r.folds.iter().map(|f| f.test_indices.clone()).collect::<Vec<_>>();
    assert_eq!(indices(&first), indices(&second));
}

#[tokio::test]
async fn test_worker_role_does_not_write_the_aggregate() {
    let temp = TempDir::new().unwrap();
    let options = KFoldOptions {
        num_folds: 2,
        skip_save: SkipSave::all(),
        output_directory: Some(temp.path().to_path_buf()),
        ..KFoldOptions::default()
    };
    let results = cross_validate(&options, Arc::new(CountingBackend::worker())).await;

    assert_eq!(results.folds.len(), 2);
    assert!(list_files(temp.path()).is_empty());
}
