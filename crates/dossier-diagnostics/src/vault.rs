//! The fault vault.
//!
//! Faults are stored keyed by `fault_id` and persisted as an append-only
//! JSON-lines file: every state change appends the full record, and replay
//! keeps the last row per id. Closed faults are retained for a bounded
//! interval, then evicted. The active table has a hard ceiling; at the
//! ceiling, open LOW faults are dropped oldest-first to admit new arrivals.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dossier_types::{FaultId, FaultRecord, FaultState, Severity};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("fault vault io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("fault row failed to serialize: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unknown fault {0}")]
    UnknownFault(FaultId),
}

#[derive(Debug, Clone, Copy)]
pub struct VaultSettings {
    /// Active fault table hard ceiling.
    pub ceiling: usize,
    /// How long closed faults stay before eviction.
    pub closed_retention: Duration,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            ceiling: 2000,
            closed_retention: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// The vault: in-memory table plus its append-only file.
#[derive(Debug)]
pub struct FaultVault {
    settings: VaultSettings,
    path: PathBuf,
    file: File,
    faults: HashMap<FaultId, FaultRecord>,
    /// Insertion order for oldest-first eviction decisions.
    order: Vec<FaultId>,
}

impl FaultVault {
    /// Opens (or creates) the vault, replaying rows and dropping closed
    /// faults that have outlived retention.
    pub fn open(path: impl AsRef<Path>, settings: VaultSettings) -> Result<Self, VaultError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| VaultError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
        }

        let mut faults: HashMap<FaultId, FaultRecord> = HashMap::new();
        let mut order = Vec::new();
        if path.exists() {
            let reader = File::open(&path).map_err(|source| VaultError::Io {
                path: path.clone(),
                source,
            })?;
            for line in BufReader::new(reader).lines() {
                let line = line.map_err(|source| VaultError::Io {
                    path: path.clone(),
                    source,
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<FaultRecord>(&line) {
                    Ok(record) => {
                        if !faults.contains_key(&record.fault_id) {
                            order.push(record.fault_id);
                        }
                        faults.insert(record.fault_id, record);
                    }
                    Err(err) => warn!(%err, "dropping unparseable fault row"),
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| VaultError::Io {
                path: path.clone(),
                source,
            })?;

        let mut vault = Self {
            settings,
            path,
            file,
            faults,
            order,
        };
        vault.evict_expired(Utc::now());
        Ok(vault)
    }

    /// Records a new fault. At the ceiling, the oldest open LOW fault is
    /// dropped to admit the new arrival; if nothing is evictable the new
    /// LOW fault itself is rejected.
    pub fn record(&mut self, fault: FaultRecord) -> Result<bool, VaultError> {
        if self.faults.len() >= self.settings.ceiling {
            let evicted = self.evict_oldest_low();
            if !evicted {
                if fault.severity == Severity::Low {
                    warn!(fault_code = %fault.fault_code, "vault at ceiling; LOW fault rejected");
                    return Ok(false);
                }
                // Nothing evictable but the arrival outranks LOW: admit it
                // and let the ceiling be exceeded rather than lose it.
                warn!("fault vault ceiling exceeded by non-LOW fault");
            }
        }
        self.persist(&fault)?;
        if !self.faults.contains_key(&fault.fault_id) {
            self.order.push(fault.fault_id);
        }
        self.faults.insert(fault.fault_id, fault);
        Ok(true)
    }

    /// Moves a fault to a new lifecycle state, stamping `closed_at` when it
    /// closes.
    pub fn set_state(&mut self, fault_id: FaultId, state: FaultState) -> Result<(), VaultError> {
        let record = self
            .faults
            .get_mut(&fault_id)
            .ok_or(VaultError::UnknownFault(fault_id))?;
        record.state = state;
        if matches!(state, FaultState::Closed | FaultState::Unrepaired) {
            record.closed_at = Some(Utc::now());
        }
        let snapshot = record.clone();
        self.persist(&snapshot)
    }

    /// Bumps the attempt counter.
    pub fn bump_attempts(&mut self, fault_id: FaultId) -> Result<u32, VaultError> {
        let record = self
            .faults
            .get_mut(&fault_id)
            .ok_or(VaultError::UnknownFault(fault_id))?;
        record.attempts += 1;
        let attempts = record.attempts;
        let snapshot = record.clone();
        self.persist(&snapshot)?;
        Ok(attempts)
    }

    /// Evicts closed faults past retention. Returns how many went.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let retention =
            chrono::Duration::from_std(self.settings.closed_retention).unwrap_or_else(|_| {
                chrono::Duration::seconds(2 * 60 * 60)
            });
        let expired: Vec<FaultId> = self
            .faults
            .iter()
            .filter(|(_, record)| {
                matches!(record.state, FaultState::Closed | FaultState::Unrepaired)
                    && record
                        .closed_at
                        .is_some_and(|closed| now - closed > retention)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.faults.remove(id);
        }
        if !expired.is_empty() {
            self.order.retain(|id| self.faults.contains_key(id));
            debug!(evicted = expired.len(), "expired closed faults evicted");
        }
        expired.len()
    }

    pub fn get(&self, fault_id: FaultId) -> Option<&FaultRecord> {
        self.faults.get(&fault_id)
    }

    /// Open and in-repair faults, oldest first.
    pub fn active(&self) -> Vec<&FaultRecord> {
        self.order
            .iter()
            .filter_map(|id| self.faults.get(id))
            .filter(|record| matches!(record.state, FaultState::Open | FaultState::InRepair))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.faults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn evict_oldest_low(&mut self) -> bool {
        let candidate = self
            .order
            .iter()
            .copied()
            .find(|id| {
                self.faults
                    .get(id)
                    .is_some_and(|record| {
                        record.severity == Severity::Low
                            && matches!(record.state, FaultState::Open)
                    })
            });
        match candidate {
            Some(id) => {
                warn!(%id, "vault ceiling reached; dropping oldest open LOW fault");
                self.faults.remove(&id);
                self.order.retain(|existing| *existing != id);
                true
            }
            None => false,
        }
    }

    fn persist(&mut self, record: &FaultRecord) -> Result<(), VaultError> {
        let line = serde_json::to_string(record)?;
        writeln!(self.file, "{line}").map_err(|source| VaultError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.file.flush().map_err(|source| VaultError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dossier_types::{Address, FaultFamily};

    fn fault(severity: Severity) -> FaultRecord {
        FaultRecord::new(
            Address::locker(),
            FaultFamily::ResourceUnavailable,
            severity,
            "test fault",
        )
    }

    fn open_vault(dir: &tempfile::TempDir, ceiling: usize) -> FaultVault {
        FaultVault::open(
            dir.path().join("faults.jsonl"),
            VaultSettings {
                ceiling,
                closed_retention: Duration::from_secs(2 * 60 * 60),
            },
        )
        .unwrap()
    }

    #[test]
    fn state_changes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut vault = open_vault(&dir, 100);
            let record = fault(Severity::Medium);
            let id = record.fault_id;
            vault.record(record).unwrap();
            vault.set_state(id, FaultState::InRepair).unwrap();
            id
        };

        let vault = open_vault(&dir, 100);
        assert_eq!(vault.get(id).unwrap().state, FaultState::InRepair);
        assert_eq!(vault.len(), 1);
    }

    #[test]
    fn ceiling_drops_oldest_open_low_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = open_vault(&dir, 3);

        let oldest_low = fault(Severity::Low);
        let oldest_id = oldest_low.fault_id;
        vault.record(oldest_low).unwrap();
        vault.record(fault(Severity::High)).unwrap();
        vault.record(fault(Severity::Low)).unwrap();

        assert!(vault.record(fault(Severity::Medium)).unwrap());
        assert_eq!(vault.len(), 3);
        assert!(vault.get(oldest_id).is_none(), "oldest LOW must be the casualty");
    }

    #[test]
    fn full_vault_of_high_faults_rejects_new_low() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = open_vault(&dir, 2);
        vault.record(fault(Severity::High)).unwrap();
        vault.record(fault(Severity::High)).unwrap();

        assert!(!vault.record(fault(Severity::Low)).unwrap());
        // Non-LOW arrivals are admitted past the ceiling instead of lost.
        assert!(vault.record(fault(Severity::High)).unwrap());
        assert_eq!(vault.len(), 3);
    }

    #[test]
    fn closed_faults_evict_after_retention() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = open_vault(&dir, 100);
        let record = fault(Severity::Medium);
        let id = record.fault_id;
        vault.record(record).unwrap();
        vault.set_state(id, FaultState::Closed).unwrap();

        assert_eq!(vault.evict_expired(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::hours(3);
        assert_eq!(vault.evict_expired(later), 1);
        assert!(vault.get(id).is_none());
    }

    #[test]
    fn active_excludes_closed_faults() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = open_vault(&dir, 100);
        let open = fault(Severity::Medium);
        let closed = fault(Severity::Medium);
        let closed_id = closed.fault_id;
        vault.record(open).unwrap();
        vault.record(closed).unwrap();
        vault.set_state(closed_id, FaultState::Closed).unwrap();

        assert_eq!(vault.active().len(), 1);
        assert_eq!(vault.len(), 2);
    }
}
