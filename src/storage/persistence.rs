//! Write-Ahead Logging (WAL) and checkpoints for the ledger tables

use crate::core::{DbError, Result};
use crate::ledger::record::{ObjectKey, ProcessedMessage, SentMessage, StoredChange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;
use tracing::{Level, event};

const WAL_FILE: &str = "changeledger.wal";
const SNAPSHOT_FILE: &str = "changeledger.snapshot";
const SNAPSHOT_VERSION: u32 = 1;

// ============================================================================
// WAL Entry Types
// ============================================================================

/// One row-level redo operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalOp {
    PutChange(StoredChange),
    RemoveChange(ObjectKey),
    PutSent(SentMessage),
    RemoveSent(i64),
    PutProcessed(ProcessedMessage),
    RemoveProcessed { change_number: i64, queue_name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntry {
    /// All row writes of one committed transaction.
    Commit { tx_id: u64, ops: Vec<WalOp> },
    /// Change numbers up to and including `up_to` may have been handed out.
    ReserveChangeNumbers { up_to: i64 },
}

// ============================================================================
// Ledger Snapshot
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub version: u32,
    pub changes: Vec<StoredChange>,
    pub sent: Vec<SentMessage>,
    pub processed: Vec<ProcessedMessage>,
    pub reserved_up_to: i64,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: DateTime<Utc>,
    pub row_count: usize,
}

impl LedgerSnapshot {
    pub fn new(
        changes: Vec<StoredChange>,
        sent: Vec<SentMessage>,
        processed: Vec<ProcessedMessage>,
        reserved_up_to: i64,
    ) -> Self {
        let row_count = changes.len() + sent.len() + processed.len();
        Self {
            version: SNAPSHOT_VERSION,
            changes,
            sent,
            processed,
            reserved_up_to,
            metadata: SnapshotMetadata {
                created_at: Utc::now(),
                row_count,
            },
        }
    }
}

/// Committed ledger state rebuilt from the snapshot and the WAL.
#[derive(Debug, Default, Clone)]
pub struct RecoveredLedger {
    pub changes: BTreeMap<ObjectKey, StoredChange>,
    pub sent: BTreeMap<i64, SentMessage>,
    pub processed: BTreeMap<(i64, String), ProcessedMessage>,
    pub reserved_up_to: i64,
    pub replayed_entries: usize,
}

impl RecoveredLedger {
    fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            changes: snapshot
                .changes
                .into_iter()
                .map(|row| (row.key.clone(), row))
                .collect(),
            sent: snapshot
                .sent
                .into_iter()
                .map(|row| (row.change_number, row))
                .collect(),
            processed: snapshot
                .processed
                .into_iter()
                .map(|row| ((row.change_number, row.queue_name.clone()), row))
                .collect(),
            reserved_up_to: snapshot.reserved_up_to,
            replayed_entries: 0,
        }
    }

    fn apply(&mut self, entry: WalEntry) {
        match entry {
            WalEntry::Commit { ops, .. } => {
                for op in ops {
                    self.apply_op(op);
                }
            }
            WalEntry::ReserveChangeNumbers { up_to } => {
                self.reserved_up_to = self.reserved_up_to.max(up_to);
            }
        }
        self.replayed_entries += 1;
    }

    fn apply_op(&mut self, op: WalOp) {
        match op {
            WalOp::PutChange(row) => {
                self.changes.insert(row.key.clone(), row);
            }
            WalOp::RemoveChange(key) => {
                self.changes.remove(&key);
            }
            WalOp::PutSent(row) => {
                self.sent.insert(row.change_number, row);
            }
            WalOp::RemoveSent(change_number) => {
                self.sent.remove(&change_number);
            }
            WalOp::PutProcessed(row) => {
                self.processed
                    .insert((row.change_number, row.queue_name.clone()), row);
            }
            WalOp::RemoveProcessed {
                change_number,
                queue_name,
            } => {
                self.processed.remove(&(change_number, queue_name));
            }
        }
    }

    /// Highest change number that must never be issued again.
    pub fn high_water_mark(&self) -> i64 {
        let max_live = self
            .changes
            .values()
            .map(|row| row.change_number)
            .max()
            .unwrap_or(0);
        self.reserved_up_to.max(max_live)
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DurabilityMode {
    /// fsync after every WAL append
    Sync,
    /// flush to the OS, let it decide when to hit disk
    #[default]
    Async,
    /// no WAL, memory only
    None,
}

impl DurabilityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DurabilityMode::Sync => "sync",
            DurabilityMode::Async => "async",
            DurabilityMode::None => "none",
        }
    }
}

impl fmt::Display for DurabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DurabilityMode {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(DurabilityMode::Sync),
            "async" => Ok(DurabilityMode::Async),
            "none" => Ok(DurabilityMode::None),
            other => Err(DbError::InvalidArgument(format!(
                "Unknown durability mode: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// WAL Manager
// ============================================================================
//
// Frame layout: u32 LE payload length, u32 LE crc32 of the payload, then
// the MessagePack payload. A short or corrupt frame at the end of the file
// is a torn write from a crash and ends replay.

pub struct WalManager {
    wal_path: PathBuf,
    wal_file: Option<BufWriter<File>>,
    durability_mode: DurabilityMode,
    entries_since_checkpoint: usize,
    checkpoint_threshold: usize,
}

impl WalManager {
    pub fn new<P: AsRef<Path>>(wal_path: P, durability_mode: DurabilityMode) -> Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();
        if let Some(parent) = wal_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                DbError::IoError(format!("Failed to create WAL directory: {}", e))
            })?;
        }

        let wal_file = if durability_mode != DurabilityMode::None {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&wal_path)
                .map_err(|e| DbError::IoError(format!("Failed to open WAL file: {}", e)))?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self {
            wal_path,
            wal_file,
            durability_mode,
            entries_since_checkpoint: 0,
            checkpoint_threshold: 1000,
        })
    }

    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let file = self
            .wal_file
            .as_mut()
            .ok_or_else(|| DbError::IoError("WAL file not initialized".to_string()))?;
        let payload = rmp_serde::to_vec(entry).map_err(|e| {
            DbError::Serialization(format!("Failed to serialize WAL entry: {}", e))
        })?;
        let len = u32::try_from(payload.len())
            .map_err(|_| DbError::Serialization("WAL entry too large".to_string()))?;
        let checksum = crc32fast::hash(&payload);

        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&checksum.to_le_bytes());
        frame.extend_from_slice(&payload);

        file.write_all(&frame)
            .map_err(|e| DbError::IoError(format!("Failed to write WAL: {}", e)))?;
        file.flush()
            .map_err(|e| DbError::IoError(format!("Failed to flush WAL: {}", e)))?;
        if self.durability_mode == DurabilityMode::Sync {
            file.get_mut()
                .sync_all()
                .map_err(|e| DbError::IoError(format!("Failed to sync WAL: {}", e)))?;
        }
        self.entries_since_checkpoint += 1;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        if !self.wal_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.wal_path)
            .map_err(|e| DbError::IoError(format!("Failed to open WAL for reading: {}", e)))?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        loop {
            let mut header = [0u8; 8];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(DbError::IoError(format!(
                        "Failed to read WAL frame header: {}",
                        e
                    )));
                }
            }
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let checksum = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    event!(
                        Level::WARN,
                        recovered = entries.len(),
                        "WAL ends in a torn frame, ignoring the tail"
                    );
                    break;
                }
                Err(e) => {
                    return Err(DbError::IoError(format!(
                        "Failed to read WAL frame: {}",
                        e
                    )));
                }
            }
            if crc32fast::hash(&payload) != checksum {
                event!(
                    Level::WARN,
                    recovered = entries.len(),
                    "WAL frame checksum mismatch, ignoring the tail"
                );
                break;
            }

            let entry: WalEntry = rmp_serde::from_slice(&payload).map_err(|e| {
                DbError::Serialization(format!("Failed to deserialize WAL entry: {}", e))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.wal_file = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.wal_path)
            .map_err(|e| DbError::IoError(format!("Failed to truncate WAL: {}", e)))?;
        self.wal_file = Some(BufWriter::new(file));
        self.entries_since_checkpoint = 0;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.entries_since_checkpoint >= self.checkpoint_threshold
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }

    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.checkpoint_threshold = threshold;
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Writes the snapshot to a temp file next to the target and renames it
    /// into place, so readers see either the old or the new snapshot.
    pub fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let parent = self
            .snapshot_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent).map_err(|e| {
            DbError::IoError(format!("Failed to create snapshot directory: {}", e))
        })?;

        let serialized = rmp_serde::to_vec(snapshot).map_err(|e| {
            DbError::Serialization(format!("Failed to serialize snapshot: {}", e))
        })?;
        let mut temp = NamedTempFile::new_in(&parent)
            .map_err(|e| DbError::IoError(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(&serialized)
            .map_err(|e| DbError::IoError(format!("Failed to write snapshot: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| DbError::IoError(format!("Failed to sync snapshot: {}", e)))?;
        temp.persist(&self.snapshot_path)
            .map_err(|e| DbError::IoError(format!("Failed to persist snapshot: {}", e)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<LedgerSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)
            .map_err(|e| DbError::IoError(format!("Failed to open snapshot: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| DbError::IoError(format!("Failed to read snapshot: {}", e)))?;
        let snapshot: LedgerSnapshot = rmp_serde::from_slice(&data).map_err(|e| {
            DbError::Serialization(format!("Failed to deserialize snapshot: {}", e))
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(DbError::Serialization(format!(
                "Unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }
}

// ============================================================================
// Persistence Manager
// ============================================================================

pub struct PersistenceManager {
    wal: WalManager,
    snapshot: SnapshotManager,
    durability_mode: DurabilityMode,
}

impl PersistenceManager {
    pub fn new<P: AsRef<Path>>(data_dir: P, durability_mode: DurabilityMode) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let wal = WalManager::new(data_dir.join(WAL_FILE), durability_mode)?;
        let snapshot = SnapshotManager::new(data_dir.join(SNAPSHOT_FILE));
        Ok(Self {
            wal,
            snapshot,
            durability_mode,
        })
    }

    pub fn log(&mut self, entry: &WalEntry) -> Result<()> {
        self.wal.append(entry)
    }

    pub fn checkpoint(&mut self, snapshot: &LedgerSnapshot) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.snapshot.save(snapshot)?;
        self.wal.clear()?;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.wal.needs_checkpoint()
    }

    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.wal.set_checkpoint_threshold(threshold);
    }

    /// Rebuilds committed state: snapshot first, then WAL entries in order.
    pub fn recover(&self) -> Result<Option<RecoveredLedger>> {
        let snapshot = self.snapshot.load()?;
        let wal_entries = self.wal.read_all()?;
        if snapshot.is_none() && wal_entries.is_empty() {
            return Ok(None);
        }

        let mut recovered = snapshot
            .map(RecoveredLedger::from_snapshot)
            .unwrap_or_default();
        for entry in wal_entries {
            recovered.apply(entry);
        }
        Ok(Some(recovered))
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    pub fn snapshot(&self) -> &SnapshotManager {
        &self.snapshot
    }

    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability_mode
    }
}
