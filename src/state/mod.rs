// ABOUTME: State Manager - per-stream positions and the global log checkpoint
// ABOUTME: Enforces monotonic progress and is the only place durability is claimed

pub mod store;

pub use store::{FileStateStore, InMemoryStateStore, StateStore};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::catalog::StreamDescriptor;
use crate::error::{Result, SourceError};
use crate::wal::Lsn;

const STATE_VERSION: u32 = 1;

/// A comparable incremental cursor value.
///
/// Integers compare numerically; text compares lexically, which orders ISO
/// 8601 timestamps and dates correctly. Values of different kinds are not
/// comparable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CursorValue {
    Integer(i64),
    Text(String),
}

impl CursorValue {
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(CursorValue::Integer),
            serde_json::Value::String(s) => Some(CursorValue::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CursorValue::Integer(i) => serde_json::Value::from(*i),
            CursorValue::Text(s) => serde_json::Value::from(s.clone()),
        }
    }

    pub fn compare(&self, other: &CursorValue) -> Option<Ordering> {
        match (self, other) {
            (CursorValue::Integer(a), CursorValue::Integer(b)) => Some(a.cmp(b)),
            (CursorValue::Text(a), CursorValue::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Resume position of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CursorState {
    /// Incremental mode: highest cursor value confirmed emitted
    Cursor { field: String, value: CursorValue },
    /// CDC mode: log position confirmed emitted
    LogPosition { lsn: Lsn },
}

impl CursorState {
    pub fn cursor(field: impl Into<String>, value: CursorValue) -> Self {
        CursorState::Cursor {
            field: field.into(),
            value,
        }
    }

    pub fn log_position(lsn: Lsn) -> Self {
        CursorState::LogPosition { lsn }
    }

    pub fn as_lsn(&self) -> Option<Lsn> {
        match self {
            CursorState::LogPosition { lsn } => Some(*lsn),
            CursorState::Cursor { .. } => None,
        }
    }

    /// `None` when the two positions are of different kinds or fields.
    pub fn compare(&self, other: &CursorState) -> Option<Ordering> {
        match (self, other) {
            (CursorState::LogPosition { lsn: a }, CursorState::LogPosition { lsn: b }) => Some(a.cmp(b)),
            (
                CursorState::Cursor { field: fa, value: va },
                CursorState::Cursor { field: fb, value: vb },
            ) if fa == fb => va.compare(vb),
            _ => None,
        }
    }
}

/// Progress of an interrupted ordered scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotProgress {
    /// Sort key of the last row whose page was fully emitted
    #[serde(default)]
    pub last_key: Option<Vec<serde_json::Value>>,
    /// Log position observed before a CDC initial scan started
    #[serde(default)]
    pub resume_lsn: Option<Lsn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub stream: StreamDescriptor,
    #[serde(default)]
    pub cursor: Option<CursorState>,
    #[serde(default)]
    pub snapshot: Option<SnapshotProgress>,
}

impl StreamState {
    pub fn new(stream: StreamDescriptor) -> Self {
        Self {
            stream,
            cursor: None,
            snapshot: None,
        }
    }
}

/// The unit of recoverability: every stream's position plus the slot's
/// last confirmed log position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    pub streams: BTreeMap<StreamDescriptor, StreamState>,
    pub log_position: Option<Lsn>,
}

#[derive(Serialize, Deserialize)]
struct SerializedSyncState<S> {
    version: u32,
    streams: Vec<S>,
    #[serde(default)]
    log_position: Option<Lsn>,
    #[serde(default)]
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl SyncState {
    /// Parse a persisted state blob.
    ///
    /// The blob itself must be a JSON state object, otherwise
    /// `StateCorrupt` is returned. A single stream entry that does not
    /// parse is dropped with a warning so only that stream starts over.
    pub fn parse(blob: &str) -> Result<Self> {
        let raw: SerializedSyncState<serde_json::Value> = serde_json::from_str(blob)
            .map_err(|e| SourceError::StateCorrupt(format!("unreadable state blob: {}", e)))?;
        if raw.version > STATE_VERSION {
            return Err(SourceError::StateCorrupt(format!(
                "state version {} is newer than supported version {}",
                raw.version, STATE_VERSION
            )));
        }

        let mut streams = BTreeMap::new();
        for entry in raw.streams {
            match serde_json::from_value::<StreamState>(entry.clone()) {
                Ok(stream_state) => {
                    streams.insert(stream_state.stream.clone(), stream_state);
                }
                Err(e) => {
                    tracing::warn!(
                        "Discarding unreadable state entry {}: {}. That stream will start from scratch.",
                        entry,
                        e
                    );
                }
            }
        }

        Ok(Self {
            streams,
            log_position: raw.log_position,
        })
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        let serialized = SerializedSyncState {
            version: STATE_VERSION,
            streams: self.streams.values().cloned().collect::<Vec<StreamState>>(),
            log_position: self.log_position,
            updated_at: Some(chrono::Utc::now()),
        };
        Ok(serde_json::to_value(serialized)?)
    }

    pub fn stream(&self, stream: &StreamDescriptor) -> Option<&StreamState> {
        self.streams.get(stream)
    }

    fn stream_mut(&mut self, stream: &StreamDescriptor) -> &mut StreamState {
        self.streams
            .entry(stream.clone())
            .or_insert_with(|| StreamState::new(stream.clone()))
    }
}

/// Result of offering a position to [`StateManager::checkpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Advanced,
    Unchanged,
    /// Lower than the stored position; stored value kept
    Regressed { stored: CursorState, proposed: CursorState },
    /// Different kind or cursor field than the stored position; stored value kept
    Incompatible { stored: CursorState, proposed: CursorState },
}

impl CheckpointOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CheckpointOutcome::Advanced | CheckpointOutcome::Unchanged)
    }
}

/// Proof that a state snapshot was persisted to the manager's store.
///
/// Only [`StateManager::flush`] creates one, and the log reader only
/// acknowledges positions it is handed through a receipt. The sequence ties a
/// receipt to its STATE message so delivery downstream can be awaited.
#[derive(Debug, Clone)]
pub struct FlushReceipt {
    data: serde_json::Value,
    log_position: Option<Lsn>,
    sequence: u64,
}

impl FlushReceipt {
    /// The serialized state, as carried by the STATE message
    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    pub fn log_position(&self) -> Option<Lsn> {
        self.log_position
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

pub struct StateManager {
    state: SyncState,
    store: Arc<dyn StateStore>,
    flushes: u64,
}

impl StateManager {
    /// Build from a previously emitted state blob, or empty state on a
    /// first sync.
    pub fn load(persisted_state: Option<&str>, store: Arc<dyn StateStore>) -> Result<Self> {
        let state = match persisted_state.map(str::trim).filter(|s| !s.is_empty()) {
            Some(blob) => SyncState::parse(blob)?,
            None => SyncState::default(),
        };
        tracing::info!(
            "Loaded sync state: {} stream(s), log position {}",
            state.streams.len(),
            state
                .log_position
                .map(|l| l.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        Ok(Self {
            state,
            store,
            flushes: 0,
        })
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn stream_state(&self, stream: &StreamDescriptor) -> Option<&StreamState> {
        self.state.stream(stream)
    }

    pub fn cursor(&self, stream: &StreamDescriptor) -> Option<&CursorState> {
        self.state.stream(stream).and_then(|s| s.cursor.as_ref())
    }

    /// Accept `position` for `stream` only if it does not move backwards.
    pub fn checkpoint(&mut self, stream: &StreamDescriptor, position: CursorState) -> CheckpointOutcome {
        let entry = self.state.stream_mut(stream);
        let outcome = match &entry.cursor {
            None => CheckpointOutcome::Advanced,
            Some(stored) => match position.compare(stored) {
                Some(Ordering::Greater) => CheckpointOutcome::Advanced,
                Some(Ordering::Equal) => CheckpointOutcome::Unchanged,
                Some(Ordering::Less) => CheckpointOutcome::Regressed {
                    stored: stored.clone(),
                    proposed: position.clone(),
                },
                None => CheckpointOutcome::Incompatible {
                    stored: stored.clone(),
                    proposed: position.clone(),
                },
            },
        };

        match &outcome {
            CheckpointOutcome::Advanced => entry.cursor = Some(position),
            CheckpointOutcome::Unchanged => {}
            CheckpointOutcome::Regressed { stored, proposed } => {
                tracing::warn!(
                    "Rejected checkpoint regression for {}: stored {:?}, proposed {:?}. \
                     Upstream ordering is inconsistent.",
                    stream,
                    stored,
                    proposed
                );
            }
            CheckpointOutcome::Incompatible { stored, proposed } => {
                tracing::warn!(
                    "Rejected incompatible checkpoint for {}: stored {:?}, proposed {:?}",
                    stream,
                    stored,
                    proposed
                );
            }
        }
        outcome
    }

    /// Drop a stored position that no longer matches the configured mode
    /// so that stream runs as a first sync.
    pub fn reset_stream(&mut self, stream: &StreamDescriptor) {
        if let Some(entry) = self.state.streams.get_mut(stream) {
            tracing::warn!("Resetting stored state for {}", stream);
            entry.cursor = None;
            entry.snapshot = None;
        }
    }

    pub fn record_snapshot_progress(&mut self, stream: &StreamDescriptor, progress: SnapshotProgress) {
        self.state.stream_mut(stream).snapshot = Some(progress);
    }

    pub fn complete_snapshot(&mut self, stream: &StreamDescriptor) {
        if let Some(entry) = self.state.streams.get_mut(stream) {
            entry.snapshot = None;
        }
    }

    /// Advance the slot's global confirmed position; never moves backwards.
    pub fn set_log_position(&mut self, lsn: Lsn) -> CheckpointOutcome {
        match self.state.log_position {
            Some(stored) if lsn < stored => {
                tracing::warn!(
                    "Rejected log position regression: stored {}, proposed {}",
                    stored,
                    lsn
                );
                CheckpointOutcome::Regressed {
                    stored: CursorState::log_position(stored),
                    proposed: CursorState::log_position(lsn),
                }
            }
            Some(stored) if lsn == stored => CheckpointOutcome::Unchanged,
            _ => {
                self.state.log_position = Some(lsn);
                CheckpointOutcome::Advanced
            }
        }
    }

    /// Serialize and persist the current state.
    ///
    /// Callers must not acknowledge anything upstream until this returns
    /// `Ok` and the downstream consumer has handled the STATE built from the
    /// receipt.
    pub async fn flush(&mut self) -> Result<FlushReceipt> {
        let data = self.state.to_json()?;
        self.store.persist(&data).await?;
        self.flushes += 1;
        tracing::debug!(
            "Flushed state #{} (log position {:?})",
            self.flushes,
            self.state.log_position
        );
        Ok(FlushReceipt {
            data,
            log_position: self.state.log_position,
            sequence: self.flushes,
        })
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes
    }
}
