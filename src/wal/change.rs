// ABOUTME: Decoded row change events and committed transactions
// ABOUTME: Constructors enforce the before/after image shape of each operation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::StreamDescriptor;
use crate::wal::Lsn;

pub type RowImage = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One row-level change from the log.
///
/// An insert never has a before-image and a delete never has an
/// after-image; the only way to build one is through [`ChangeRecord::insert`],
/// [`ChangeRecord::update`] and [`ChangeRecord::delete`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawChangeRecord")]
pub struct ChangeRecord {
    stream: StreamDescriptor,
    op: Operation,
    before: Option<RowImage>,
    after: Option<RowImage>,
    commit_lsn: Lsn,
    commit_timestamp: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn insert(stream: StreamDescriptor, after: RowImage) -> Self {
        Self::unstamped(stream, Operation::Insert, None, Some(after))
    }

    /// `before` is present only when the table's replica identity sends it.
    pub fn update(stream: StreamDescriptor, before: Option<RowImage>, after: RowImage) -> Self {
        Self::unstamped(stream, Operation::Update, before, Some(after))
    }

    pub fn delete(stream: StreamDescriptor, before: RowImage) -> Self {
        Self::unstamped(stream, Operation::Delete, Some(before), None)
    }

    fn unstamped(
        stream: StreamDescriptor,
        op: Operation,
        before: Option<RowImage>,
        after: Option<RowImage>,
    ) -> Self {
        Self {
            stream,
            op,
            before,
            after,
            commit_lsn: Lsn::ZERO,
            commit_timestamp: DateTime::<Utc>::default(),
        }
    }

    /// Stamp with the owning transaction's commit position and time.
    pub(crate) fn stamp(&mut self, commit_lsn: Lsn, commit_timestamp: DateTime<Utc>) {
        self.commit_lsn = commit_lsn;
        self.commit_timestamp = commit_timestamp;
    }

    pub fn stream(&self) -> &StreamDescriptor {
        &self.stream
    }

    pub fn op(&self) -> Operation {
        self.op
    }

    pub fn before(&self) -> Option<&RowImage> {
        self.before.as_ref()
    }

    pub fn after(&self) -> Option<&RowImage> {
        self.after.as_ref()
    }

    pub fn commit_lsn(&self) -> Lsn {
        self.commit_lsn
    }

    pub fn commit_timestamp(&self) -> DateTime<Utc> {
        self.commit_timestamp
    }
}

#[derive(Deserialize)]
struct RawChangeRecord {
    stream: StreamDescriptor,
    op: Operation,
    #[serde(default)]
    before: Option<RowImage>,
    #[serde(default)]
    after: Option<RowImage>,
    commit_lsn: Lsn,
    commit_timestamp: DateTime<Utc>,
}

impl TryFrom<RawChangeRecord> for ChangeRecord {
    type Error = String;

    fn try_from(raw: RawChangeRecord) -> Result<Self, Self::Error> {
        match (raw.op, &raw.before, &raw.after) {
            (Operation::Insert, Some(_), _) => return Err("insert carries a before-image".into()),
            (Operation::Delete, _, Some(_)) => return Err("delete carries an after-image".into()),
            (Operation::Insert | Operation::Update, _, None) => {
                return Err(format!("{:?} has no after-image", raw.op))
            }
            (Operation::Delete, None, _) => return Err("delete has no before-image".into()),
            _ => {}
        }
        Ok(Self {
            stream: raw.stream,
            op: raw.op,
            before: raw.before,
            after: raw.after,
            commit_lsn: raw.commit_lsn,
            commit_timestamp: raw.commit_timestamp,
        })
    }
}

/// All changes of one committed transaction, in original order.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedTransaction {
    pub xid: u32,
    pub commit_lsn: Lsn,
    /// Position just past the commit record; the resume point after this txn
    pub end_lsn: Lsn,
    pub commit_timestamp: DateTime<Utc>,
    pub changes: Vec<ChangeRecord>,
}
