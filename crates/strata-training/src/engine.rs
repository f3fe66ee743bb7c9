use crate::dataset::{RawFrame, Split};
use crate::error::{TrainingError, TrainingResult};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Row-partitioning engine used by preprocessing. Implementations may be
/// distributed; every role must call the same operations in the same order.
pub trait DataFrameEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Workers available for partitioned work.
    fn parallelism(&self) -> usize;

    /// Partition by an indicator column holding 0, 1 or 2.
    fn split_by_column(&self, frame: &RawFrame, column: &str) -> TrainingResult<[RawFrame; 3]>;

    /// Seeded random partition with the given train/validation/test probabilities.
    fn split_random(&self, frame: &RawFrame, probabilities: [f64; 3], seed: u64) -> TrainingResult<[RawFrame; 3]>;

    /// Seeded permutation of `0..len`.
    fn shuffled_indices(&self, len: usize, seed: u64) -> Vec<usize>;
}

/// Single-process engine over in-memory rows.
#[derive(Debug, Clone, Default)]
pub struct LocalEngine;

impl DataFrameEngine for LocalEngine {
    fn name(&self) -> &str {
        "local"
    }

    fn parallelism(&self) -> usize {
        std::thread::available_parallelism().map(usize::from).unwrap_or(1)
    }

    fn split_by_column(&self, frame: &RawFrame, column: &str) -> TrainingResult<[RawFrame; 3]> {
        let mut splits: [Vec<usize>; 3] = Default::default();
        for (i, row) in frame.rows.iter().enumerate() {
            let value = row.get(column).unwrap_or(&serde_json::Value::Null);
            let split = Split::from_indicator(value).ok_or_else(|| {
                TrainingError::Dataset(format!("row {i}: invalid split indicator {value} in column {column}"))
            })?;
            splits[split.index()].push(i);
        }
        Ok(splits.map(|indices| frame.select(&indices)))
    }

    fn split_random(&self, frame: &RawFrame, probabilities: [f64; 3], seed: u64) -> TrainingResult<[RawFrame; 3]> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut splits: [Vec<usize>; 3] = Default::default();
        for i in 0..frame.len() {
            let draw: f64 = rng.r#gen();
            let split = if draw < probabilities[0] {
                0
            } else if draw < probabilities[0] + probabilities[1] {
                1
            } else {
                2
            };
            splits[split].push(i);
        }
        Ok(splits.map(|indices| frame.select(&indices)))
    }

    fn shuffled_indices(&self, len: usize, seed: u64) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..len).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        indices
    }
}
