use std::{
    fs,
    path::{Path, PathBuf},
};

use bridge::Role;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

const INDEX_FILE: &str = "checkpoint";
const EXPORT_FILE: &str = "model.json";

/// A snapshot of a party's training progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Completed training steps.
    pub step: u64,
    pub epoch: u32,
    pub role: Role,
    pub model: Value,
}

/// A directory of checkpoints with an index naming the latest one.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `checkpoint` as `checkpoint-<step>.json` and points the index at it.
    ///
    /// # Returns
    /// The path of the written checkpoint.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let name = format!("checkpoint-{}.json", checkpoint.step);
        let path = self.dir.join(&name);
        write_json(&path, checkpoint)?;
        write_atomic(&self.dir.join(INDEX_FILE), name.as_bytes())?;

        info!(step = checkpoint.step; "saved checkpoint {}", path.display());
        Ok(path)
    }

    /// Reads the checkpoint the index points at.
    ///
    /// # Returns
    /// The latest checkpoint, or `None` if nothing was saved yet.
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        let index = self.dir.join(INDEX_FILE);
        if !index.is_file() {
            debug!("no checkpoint index under {}", self.dir.display());
            return Ok(None);
        }

        let name = fs::read_to_string(&index)?;
        let path = self.dir.join(name.trim());
        let checkpoint = serde_json::from_slice(&fs::read(&path)?)?;
        Ok(Some(checkpoint))
    }
}

/// Writes the final model state as `<dir>/model.json`.
pub fn export_model(dir: &Path, state: &Value) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let path = dir.join(EXPORT_FILE);
    write_json(&path, state)?;
    info!("exported model to {}", path.display());
    Ok(path)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Writes through a sibling temporary file so readers never see a partial file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn checkpoint(step: u64) -> Checkpoint {
        Checkpoint {
            step,
            epoch: 0,
            role: Role::Follower,
            model: json!({ "bias": step }),
        }
    }

    #[test]
    fn latest_follows_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("ckpt"));
        assert!(store.latest().unwrap().is_none());

        store.save(&checkpoint(10)).unwrap();
        let path = store.save(&checkpoint(20)).unwrap();

        assert_eq!(path, store.dir().join("checkpoint-20.json"));
        assert!(store.dir().join("checkpoint-10.json").is_file());
        assert_eq!(
            fs::read_to_string(store.dir().join("checkpoint")).unwrap(),
            "checkpoint-20.json"
        );
        assert_eq!(store.latest().unwrap(), Some(checkpoint(20)));
    }

    #[test]
    fn export_writes_model_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = export_model(dir.path(), &json!({ "weights": [1.0] })).unwrap();

        let back: Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(back, json!({ "weights": [1.0] }));
    }
}
