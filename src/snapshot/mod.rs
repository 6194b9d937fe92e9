// ABOUTME: Snapshot Reader: ordered, resumable, paginated table scans
// ABOUTME: Serves full refresh, incremental high-water-mark reads and the CDC initial pass

pub mod postgres;

pub use self::postgres::PgTableSource;

use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::catalog::{ConfiguredStream, StreamDescriptor, SyncMode};
use crate::error::{Result, SourceError};
use crate::message::OrderingKey;
use crate::state::CursorValue;
use crate::wal::{Lsn, RowImage};

/// Columns and primary key of a source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
}

/// One keyset-paginated read.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub table: StreamDescriptor,
    /// Total order of the scan; the last columns form a unique key
    pub order_by: Vec<String>,
    /// Only rows whose `order_by` tuple is strictly greater than this
    pub after: Option<RowImage>,
    /// Only rows with `column >= value`, and never rows where it is NULL
    pub lower_bound: Option<(String, serde_json::Value)>,
    pub require_not_null: Option<String>,
    pub limit: usize,
}

/// Table access the snapshot reader scans through.
#[async_trait]
pub trait TableSource: Send + Sync {
    /// `None` when the table does not exist
    async fn describe(&self, table: &StreamDescriptor) -> Result<Option<TableInfo>>;
    /// Rows in `order_by` order, at most `limit`
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<RowImage>>;
    /// Current server write position
    async fn current_wal_lsn(&self) -> Result<Lsn>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanMode {
    FullRefresh,
    /// Rows above the stored high-water-mark (strict) or from a start bound (inclusive)
    Incremental {
        cursor_field: String,
        stored: Option<CursorValue>,
        start: Option<CursorValue>,
    },
    CdcInitial,
}

/// Resolved scan of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    pub stream: StreamDescriptor,
    pub sort_key: Vec<String>,
    pub mode: ScanMode,
}

impl ScanPlan {
    /// Columns the scan is ordered by.
    pub fn order_by(&self) -> Vec<String> {
        match &self.mode {
            ScanMode::Incremental { cursor_field, .. } => {
                let mut order = vec![cursor_field.clone()];
                order.extend(self.sort_key.iter().filter(|c| *c != cursor_field).cloned());
                order
            }
            _ => self.sort_key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScannedRow {
    pub data: RowImage,
    pub ordering_key: OrderingKey,
}

/// One fully fetched page.
///
/// `checkpoint` and `last_key` describe the position after every row of the
/// page has been emitted, and must not be recorded before that.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub rows: Vec<ScannedRow>,
    /// Keyset position of the last row of the page
    pub last_key: Option<Vec<serde_json::Value>>,
    /// Incremental only: highest cursor value all of whose rows are emitted
    /// once this page is
    pub checkpoint: Option<CursorValue>,
    pub is_last: bool,
}

pub struct SnapshotReader {
    source: Arc<dyn TableSource>,
    page_size: usize,
}

impl SnapshotReader {
    pub fn new(source: Arc<dyn TableSource>, page_size: usize) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
        }
    }

    /// Resolve the sort key and scan mode for a configured stream.
    pub async fn plan(&self, configured: &ConfiguredStream, stored: Option<CursorValue>) -> Result<ScanPlan> {
        let stream = &configured.stream;
        let info = self.source.describe(stream).await?.ok_or_else(|| {
            SourceError::config(
                format!("stream {} was not found in the source", stream),
                "check the catalog's namespace and name, or remove the stream",
            )
        })?;

        let sort_key = match &configured.primary_key {
            Some(pk) if !pk.is_empty() => pk.clone(),
            _ => info.primary_key.clone(),
        };
        if sort_key.is_empty() {
            return Err(SourceError::config(
                format!("stream {} has no primary key to order the scan by", stream),
                "add a primary key to the table or set primary_key for the stream in the catalog",
            ));
        }
        for column in &sort_key {
            require_column(&info, stream, column, "sort key")?;
        }

        let mode = match configured.sync_mode {
            SyncMode::FullRefresh => ScanMode::FullRefresh,
            SyncMode::Cdc => ScanMode::CdcInitial,
            SyncMode::Incremental => {
                let cursor_field = configured.cursor_field.clone().ok_or_else(|| {
                    SourceError::config(
                        format!("incremental stream {} has no cursor_field", stream),
                        "set cursor_field in the catalog",
                    )
                })?;
                require_column(&info, stream, &cursor_field, "cursor field")?;
                let start = match &configured.start_cursor {
                    Some(value) => Some(CursorValue::from_json(value).ok_or_else(|| {
                        SourceError::config(
                            format!("start_cursor {} for {} is not an integer or string", value, stream),
                            "use an integer or an ISO 8601 string",
                        )
                    })?),
                    None => None,
                };
                ScanMode::Incremental {
                    cursor_field,
                    stored,
                    start,
                }
            }
        };

        Ok(ScanPlan {
            stream: stream.clone(),
            sort_key,
            mode,
        })
    }

    /// Start or resume a scan. `resume_after` is the `last_key` of the last
    /// page whose rows were all emitted.
    pub fn scan(&self, plan: ScanPlan, resume_after: Option<Vec<serde_json::Value>>) -> TableScan {
        let order_by = plan.order_by();
        let after = match resume_after {
            Some(key) if key.len() == order_by.len() => Some(key),
            Some(key) => {
                tracing::warn!(
                    "Ignoring stored scan position for {}: {} key value(s) for {} sort column(s)",
                    plan.stream,
                    key.len(),
                    order_by.len()
                );
                None
            }
            None => None,
        };
        TableScan {
            source: self.source.clone(),
            page_size: self.page_size,
            order_by,
            plan,
            after,
            done: false,
        }
    }

    pub async fn current_wal_lsn(&self) -> Result<Lsn> {
        self.source.current_wal_lsn().await
    }
}

fn require_column(info: &TableInfo, stream: &StreamDescriptor, column: &str, role: &str) -> Result<()> {
    if info.columns.iter().any(|c| c == column) {
        Ok(())
    } else {
        Err(SourceError::config(
            format!("{} column '{}' does not exist in {}", role, column, stream),
            format!("available columns: {}", info.columns.join(", ")),
        ))
    }
}

/// An in-progress ordered scan.
pub struct TableScan {
    source: Arc<dyn TableSource>,
    page_size: usize,
    plan: ScanPlan,
    order_by: Vec<String>,
    after: Option<Vec<serde_json::Value>>,
    done: bool,
}

impl TableScan {
    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    /// Fetch the next page, or `None` once the table is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Page>> {
        if self.done {
            return Ok(None);
        }

        let (lower_bound, require_not_null) = match &self.plan.mode {
            ScanMode::Incremental {
                cursor_field,
                stored,
                start,
            } => (
                stored
                    .as_ref()
                    .or(start.as_ref())
                    .map(|v| (cursor_field.clone(), v.to_json())),
                Some(cursor_field.clone()),
            ),
            _ => (None, None),
        };
        let request = PageRequest {
            table: self.plan.stream.clone(),
            order_by: self.order_by.clone(),
            after: self.after.as_ref().map(|key| key_to_image(&self.order_by, key)),
            lower_bound,
            require_not_null,
            limit: self.page_size + 1,
        };
        let mut rows = self.source.fetch_page(&request).await?;
        let look_ahead = if rows.len() > self.page_size {
            rows.truncate(self.page_size + 1);
            rows.pop()
        } else {
            None
        };
        let is_last = look_ahead.is_none();
        if rows.is_empty() {
            self.done = true;
            return Ok(Some(Page {
                rows: Vec::new(),
                last_key: self.after.clone(),
                checkpoint: None,
                is_last: true,
            }));
        }

        let last_key = rows.last().map(|r| extract_key(&self.order_by, r));
        let page = match &self.plan.mode {
            ScanMode::Incremental {
                cursor_field,
                stored,
                ..
            } => self.incremental_page(rows, look_ahead.as_ref(), cursor_field, stored.as_ref(), last_key.clone())?,
            _ => Page {
                rows: rows
                    .into_iter()
                    .map(|data| {
                        let key = extract_key(&self.order_by, &data);
                        ScannedRow {
                            data,
                            ordering_key: OrderingKey::SortKey { key },
                        }
                    })
                    .collect(),
                last_key: last_key.clone(),
                checkpoint: None,
                is_last,
            },
        };

        self.after = last_key;
        self.done = is_last;
        Ok(Some(Page { is_last, ..page }))
    }

    fn incremental_page(
        &self,
        rows: Vec<RowImage>,
        look_ahead: Option<&RowImage>,
        cursor_field: &str,
        stored: Option<&CursorValue>,
        last_key: Option<Vec<serde_json::Value>>,
    ) -> Result<Page> {
        let mut emitted = Vec::with_capacity(rows.len());
        let mut cursors = Vec::with_capacity(rows.len());
        for data in rows {
            let cursor = row_cursor(&self.plan.stream, cursor_field, &data)?;
            cursors.push(cursor.clone());
            // The query bound is inclusive; only values above the stored mark are new.
            if let Some(stored) = stored {
                if cursor.compare(stored) != Some(Ordering::Greater) {
                    continue;
                }
            }
            let key = extract_key(&self.order_by, &data);
            emitted.push(ScannedRow {
                data,
                ordering_key: OrderingKey::Cursor { value: cursor, key },
            });
        }

        let checkpoint = match (cursors.last(), look_ahead) {
            (Some(max), None) => Some(max.clone()),
            (Some(max), Some(next)) => {
                let next_cursor = row_cursor(&self.plan.stream, cursor_field, next)?;
                if next_cursor.compare(max) == Some(Ordering::Equal) {
                    // Rows with the page's highest value continue past the page.
                    cursors
                        .iter()
                        .rev()
                        .find(|c| c.compare(max) == Some(Ordering::Less))
                        .cloned()
                } else {
                    Some(max.clone())
                }
            }
            (None, _) => None,
        };
        let checkpoint = match (checkpoint, stored) {
            (Some(candidate), Some(stored)) if candidate.compare(stored) != Some(Ordering::Greater) => None,
            (candidate, _) => candidate,
        };

        Ok(Page {
            rows: emitted,
            last_key,
            checkpoint,
            is_last: look_ahead.is_none(),
        })
    }
}

fn row_cursor(stream: &StreamDescriptor, cursor_field: &str, row: &RowImage) -> Result<CursorValue> {
    let value = row.get(cursor_field).unwrap_or(&serde_json::Value::Null);
    CursorValue::from_json(value).ok_or_else(|| {
        SourceError::config(
            format!(
                "cursor field '{}' of {} has unsupported value {}",
                cursor_field, stream, value
            ),
            "use an integer, date or timestamp column as cursor_field",
        )
    })
}

fn extract_key(order_by: &[String], row: &RowImage) -> Vec<serde_json::Value> {
    order_by
        .iter()
        .map(|c| row.get(c).cloned().unwrap_or(serde_json::Value::Null))
        .collect()
}

fn key_to_image(order_by: &[String], key: &[serde_json::Value]) -> RowImage {
    order_by.iter().cloned().zip(key.iter().cloned()).collect()
}
