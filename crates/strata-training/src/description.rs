use crate::backend::Backend;
use crate::config::ConfigModel;
use crate::dataset::DatasetSources;
use crate::error::TrainingResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

const COMMIT_HASH_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeDescription {
    pub backend: String,
    pub num_nodes: usize,
}

/// Human-readable record of what a run was started with. Written before
/// preprocessing so a crash still leaves it behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDescription {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub strata_version: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    pub random_seed: u64,
    pub data_format: String,
    pub dataset: BTreeMap<String, String>,
    pub config: serde_json::Value,
    pub compute: ComputeDescription,
}

impl RunDescription {
    pub fn new(
        config: &ConfigModel,
        sources: &DatasetSources,
        backend: &dyn Backend,
        random_seed: u64,
    ) -> TrainingResult<Self> {
        Ok(Self {
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            strata_version: env!("CARGO_PKG_VERSION").to_string(),
            command: std::env::args().collect::<Vec<_>>().join(" "),
            commit_hash: commit_hash(),
            random_seed,
            data_format: sources.data_format.as_str().to_string(),
            dataset: sources
                .described_paths()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            config: config.to_json_value()?,
            compute: ComputeDescription { backend: backend.name().to_string(), num_nodes: backend.num_nodes() },
        })
    }

    pub fn save(&self, path: &Path) -> TrainingResult<()> {
        crate::artifacts::save_json(path, self)
    }

    pub fn log(&self) {
        tracing::info!(
            run_id = %self.run_id,
            version = %self.strata_version,
            commit = self.commit_hash.as_deref().unwrap_or("unknown"),
            random_seed = self.random_seed,
            data_format = %self.data_format,
            backend = %self.compute.backend,
            num_nodes = self.compute.num_nodes,
            "Run description"
        );
        for (role, path) in &self.dataset {
            tracing::info!(role = %role, path = %path, "Dataset");
        }
    }
}

/// Short hash of the current git checkout, if there is one.
fn commit_hash() -> Option<String> {
    let output = std::process::Command::new("git").args(["rev-parse", "HEAD"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let hash = String::from_utf8(output.stdout).ok()?;
    let hash = hash.trim();
    (!hash.is_empty()).then(|| hash.chars().take(COMMIT_HASH_LEN).collect())
}
