use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::Result;

/// On-disk totals record. The device has no persistent memory, so this file
/// is the source of truth across restarts. Operators can pre-seed real
/// meter totals by editing it while the service is stopped.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Measurements {
    /// Unix seconds of the last update.
    #[serde(default)]
    pub date: i64,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelRecord {
    pub total: u64,
}

impl Measurements {
    /// A channel with no stored record starts at zero.
    pub fn total(&self, input: &str) -> u64 {
        self.channels.get(input).map(|c| c.total).unwrap_or(0)
    }

    pub fn set_total(&mut self, input: &str, total: u64) {
        self.channels.entry(input.to_string()).or_default().total = total;
    }
}

/// Durable per-channel totals in a single YAML file.
///
/// Saves replace the whole file via write-temp-then-rename, so a process
/// killed mid-save leaves the previous file intact and no channel record is
/// ever partially written.
pub struct MeasurementStore {
    path: PathBuf,
    write_every: u32,
    writes_pending: u32,
}

impl MeasurementStore {
    pub fn new(path: impl Into<PathBuf>, write_every: u32) -> Self {
        Self {
            path: path.into(),
            write_every: write_every.max(1),
            writes_pending: 0,
        }
    }

    /// A missing or unreadable file is not fatal: totals start at zero.
    pub fn load(&self) -> Measurements {
        match fs::read_to_string(&self.path) {
            Ok(raw) => match serde_yaml::from_str(&raw) {
                Ok(m) => {
                    debug!(file = %self.path.display(), "loaded measurements");
                    m
                }
                Err(e) => {
                    warn!(
                        file = %self.path.display(),
                        error = %e,
                        "measurement file unreadable; starting from zero totals"
                    );
                    Measurements::default()
                }
            },
            Err(e) => {
                warn!(
                    file = %self.path.display(),
                    error = %e,
                    "no measurement file; starting from zero totals"
                );
                Measurements::default()
            }
        }
    }

    pub fn save(&self, m: &Measurements) -> Result<()> {
        let raw = serde_yaml::to_string(m)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Throttled variant for the per-reading write path: every
    /// `write_every`th call hits disk. Returns whether a write happened.
    /// The shutdown flush uses `save` directly.
    pub fn save_throttled(&mut self, m: &Measurements) -> Result<bool> {
        self.writes_pending += 1;
        if self.writes_pending < self.write_every {
            return Ok(false);
        }
        self.writes_pending = 0;
        self.save(m)?;
        Ok(true)
    }
}
