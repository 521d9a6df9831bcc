//! CSV log of finished scenarios, used to skip them when an experiment is
//! restarted.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ExperimentError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub scenario: usize,
    pub seed: u64,
    pub status: String,
}

#[derive(Debug)]
pub struct ExperimentProgressLog {
    path: PathBuf,
    entries: BTreeMap<usize, ProgressEntry>,
}

impl ExperimentProgressLog {
    /// Opens `path`, loading the scenarios it already lists. A missing file is
    /// an empty log.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ExperimentError> {
        let path = path.as_ref().to_path_buf();
        let mut entries = BTreeMap::new();
        if path.exists() {
            let mut reader = csv::Reader::from_path(&path)?;
            for row in reader.deserialize() {
                let entry: ProgressEntry = row?;
                entries.insert(entry.scenario, entry);
            }
        }
        debug!(path = %path.display(), finished = entries.len(), "progress log opened");
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, scenario: usize) -> Option<&ProgressEntry> {
        self.entries.get(&scenario)
    }

    /// True when `scenario` already finished with `seed`. A recorded seed
    /// that differs means the log belongs to another experiment.
    pub fn is_finished(&self, scenario: usize, seed: u64) -> Result<bool, ExperimentError> {
        match self.entries.get(&scenario) {
            None => Ok(false),
            Some(entry) if entry.seed == seed => Ok(true),
            Some(entry) => Err(ExperimentError::ProgressSeedMismatch {
                index: scenario,
                recorded: entry.seed,
                expected: seed,
            }),
        }
    }

    /// Appends one row and flushes it.
    pub fn record(&mut self, entry: ProgressEntry) -> Result<(), ExperimentError> {
        let write_header = !self.path.exists() || std::fs::metadata(&self.path)?.len() == 0;
        let file: File = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);
        writer.serialize(&entry)?;
        writer.flush()?;
        self.entries.insert(entry.scenario, entry);
        Ok(())
    }
}
