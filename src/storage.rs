//! Ambient — per-run storage writers.
//!
//! Grounded on `src/data/storage.rs`'s feature-gated `StorageWriter` trait
//! shape, collapsed to the single always-on JSON/text writer spec.md §6
//! calls for. The teacher's optional HDF5/Arrow/CSV/NetCDF backends aren't
//! named by the spec and are dropped rather than carried unused.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::metadata::Metadata;
use crate::observable::Value;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct RunLog<'a> {
    id: &'a str,
    metadata: &'a Metadata,
    state: &'a str,
    started_at: Option<DateTime<Utc>>,
    finished_at: DateTime<Utc>,
}

/// Writes `log.json` (structured), `log.txt` (human), and `values.json`
/// (full observation history, keyed `device -> variable -> [[t, v], ...]`)
/// into one run directory (spec.md §6 "Persisted state").
pub trait StorageWriter: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn write_run(
        &self,
        dir: &Path,
        id: &str,
        metadata: &Metadata,
        state: &str,
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        observations: &HashMap<String, HashMap<String, Vec<(DateTime<Utc>, Value)>>>,
    ) -> Result<(), StorageError>;
}

/// The only writer this crate ships: plain JSON and text files on the local
/// filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonTextWriter;

impl StorageWriter for JsonTextWriter {
    fn write_run(
        &self,
        dir: &Path,
        id: &str,
        metadata: &Metadata,
        state: &str,
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        observations: &HashMap<String, HashMap<String, Vec<(DateTime<Utc>, Value)>>>,
    ) -> Result<(), StorageError> {
        fs::create_dir_all(dir)?;

        let run_log = RunLog {
            id,
            metadata,
            state,
            started_at,
            finished_at,
        };
        fs::write(dir.join("log.json"), serde_json::to_string_pretty(&run_log)?)?;

        let log_txt = format!(
            "experiment: {}\nid: {}\nstate: {}\nstarted: {}\n",
            metadata.experiment_name,
            id,
            state,
            started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        );
        fs::write(dir.join("log.txt"), log_txt)?;

        let mut values: HashMap<&str, HashMap<&str, Vec<(DateTime<Utc>, JsonValue)>>> = HashMap::new();
        for (device, variables) in observations {
            let entry = values.entry(device.as_str()).or_default();
            for (name, samples) in variables {
                entry.insert(
                    name.as_str(),
                    samples.iter().map(|(t, v)| (*t, value_to_json(v))).collect(),
                );
            }
        }
        fs::write(dir.join("values.json"), serde_json::to_string_pretty(&values)?)?;

        Ok(())
    }
}

fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Number(n) => serde_json::json!(n),
        Value::Text(s) => serde_json::json!(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_all_three_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run-1");
        let metadata = Metadata {
            experiment_name: "titration".into(),
            ..Metadata::default()
        };
        let mut observations: HashMap<String, HashMap<String, Vec<(DateTime<Utc>, Value)>>> = HashMap::new();
        let t0 = Utc::now();
        observations
            .entry("pump1".into())
            .or_default()
            .insert("volume".into(), vec![(t0, Value::Number(1.5))]);

        let writer = JsonTextWriter;
        writer
            .write_run(&run_dir, "run-1", &metadata, "finished", Some(t0), t0, &observations)
            .unwrap();

        assert!(run_dir.join("log.json").exists());
        assert!(run_dir.join("log.txt").exists());
        let values_text = fs::read_to_string(run_dir.join("values.json")).unwrap();
        assert!(values_text.contains("pump1"));
        assert!(values_text.contains("volume"));
    }
}
