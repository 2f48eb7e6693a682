//! JSON file implementation of `DataSink`

use crate::output::traits::{DataSink, OutputError, OutputResult};
use serde_json::Value;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Writes records as pretty-printed JSON files below a root folder
///
/// Every write goes to a temporary file that is renamed into place, so a
/// reader never sees half a file.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    root: PathBuf,
}

impl JsonFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write_json(&self, path: &Path, value: &impl serde::Serialize) -> OutputResult<()> {
        let target = self.root.join(path);
        let wrap = |source| OutputError::Write {
            path: target.clone(),
            source,
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(wrap)?;
        }

        let bytes = serde_json::to_vec_pretty(value)?;
        let temp = target.with_extension("json.tmp");
        {
            let mut file = File::create(&temp).map_err(wrap)?;
            file.write_all(&bytes).map_err(wrap)?;
        }
        fs::rename(&temp, &target).map_err(wrap)?;

        tracing::trace!("Wrote {}", target.display());
        Ok(())
    }
}

impl DataSink for JsonFileSink {
    fn write_collection(&self, path: &Path, records: &[Value]) -> OutputResult<()> {
        self.write_json(path, &records)
    }

    fn write_item(&self, path: &Path, record: &Value) -> OutputResult<()> {
        self.write_json(path, record)
    }

    fn read_item(&self, path: &Path) -> OutputResult<Value> {
        let target = self.root.join(path);
        let content = fs::read_to_string(&target).map_err(|source| OutputError::Read {
            path: target.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|e| OutputError::InvalidJson {
            path: target,
            reason: e.to_string(),
        })
    }
}
