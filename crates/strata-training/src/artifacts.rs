use crate::error::{TrainingError, TrainingResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Pretty-printed JSON with a trailing newline. The same value always
/// produces the same bytes.
pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> TrainingResult<()> {
    let mut json = serde_json::to_string_pretty(value)?;
    json.push('\n');
    std::fs::write(path, json)?;
    Ok(())
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> TrainingResult<T> {
    if !path.exists() {
        return Err(TrainingError::Artifact(format!("artifact path does not exist: {}", path.display())));
    }
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    Ok(sha256_bytes(&bytes))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
