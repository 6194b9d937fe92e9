// ABOUTME: Slot/Publication Lifecycle Manager for logical replication
// ABOUTME: Verifies or creates slot and publication and hands out single-consumer slot handles

pub mod postgres;

pub use self::postgres::PgSlotCatalog;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::catalog::StreamDescriptor;
use crate::error::{Result, SourceError};
use crate::utils::validate_postgres_identifier;
use crate::wal::Lsn;

/// `pg_class.relreplident`: which old-row columns the log carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaIdentity {
    /// Primary key columns (`d`)
    Default,
    /// No old-row information (`n`)
    Nothing,
    /// Every column (`f`)
    Full,
    /// Columns of a chosen unique index (`i`)
    Index,
}

impl ReplicaIdentity {
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'd' => Some(Self::Default),
            'n' => Some(Self::Nothing),
            'f' => Some(Self::Full),
            'i' => Some(Self::Index),
            _ => None,
        }
    }

    pub fn code(self) -> char {
        match self {
            Self::Default => 'd',
            Self::Nothing => 'n',
            Self::Full => 'f',
            Self::Index => 'i',
        }
    }

    /// `ALTER TABLE ... REPLICA IDENTITY <keyword>`
    pub fn sql_keyword(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::Nothing => "NOTHING",
            Self::Full => "FULL",
            Self::Index => "USING INDEX",
        }
    }
}

impl fmt::Display for ReplicaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_keyword())
    }
}

/// Server-side description of a logical replication slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSlot {
    pub name: String,
    pub plugin: String,
    pub confirmed_flush: Option<Lsn>,
    pub active: bool,
    pub active_pid: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub name: String,
    /// `FOR ALL TABLES` publications cover every table implicitly
    pub all_tables: bool,
    pub tables: BTreeSet<StreamDescriptor>,
}

impl Publication {
    pub fn covers(&self, table: &StreamDescriptor) -> bool {
        self.all_tables || self.tables.contains(table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableIdentity {
    pub replica_identity: ReplicaIdentity,
    pub has_primary_key: bool,
}

impl TableIdentity {
    /// Whether updates and deletes carry enough old-row data to identify the row.
    pub fn is_adequate(&self) -> bool {
        match self.replica_identity {
            ReplicaIdentity::Nothing => false,
            ReplicaIdentity::Default => self.has_primary_key,
            ReplicaIdentity::Full | ReplicaIdentity::Index => true,
        }
    }
}

/// Catalog operations the lifecycle manager needs from the server.
#[async_trait]
pub trait SlotCatalog: Send + Sync {
    async fn find_slot(&self, name: &str) -> Result<Option<ReplicationSlot>>;
    async fn create_slot(&self, name: &str, plugin: &str) -> Result<ReplicationSlot>;
    async fn find_publication(&self, name: &str) -> Result<Option<Publication>>;
    async fn create_publication(&self, name: &str, tables: &[StreamDescriptor]) -> Result<Publication>;
    /// `None` when the table does not exist
    async fn table_identity(&self, table: &StreamDescriptor) -> Result<Option<TableIdentity>>;
    /// Whether the current user may `ALTER` the table
    async fn can_alter_table(&self, table: &StreamDescriptor) -> Result<bool>;
    async fn set_replica_identity(&self, table: &StreamDescriptor, identity: ReplicaIdentity) -> Result<()>;
}

type LeaseSet = Arc<Mutex<HashSet<String>>>;

/// Exclusive right to stream one slot from this process.
///
/// Not `Clone`; ownership moves into exactly one
/// [`LogReader`](crate::wal::LogReader). Dropping it releases the lease.
#[derive(Debug)]
pub struct SlotHandle {
    slot: ReplicationSlot,
    leases: LeaseSet,
}

impl SlotHandle {
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn plugin(&self) -> &str {
        &self.slot.plugin
    }

    /// Server-side confirmed position when the handle was acquired
    pub fn confirmed_flush(&self) -> Option<Lsn> {
        self.slot.confirmed_flush
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.remove(&self.slot.name);
        tracing::debug!("Released slot '{}'", self.slot.name);
    }
}

pub struct SlotManager {
    catalog: Arc<dyn SlotCatalog>,
    auto_create: bool,
    leases: LeaseSet,
}

impl SlotManager {
    pub fn new(catalog: Arc<dyn SlotCatalog>, auto_create: bool) -> Self {
        Self {
            catalog,
            auto_create,
            leases: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Make sure the slot exists with `plugin`, then acquire it.
    pub async fn verify_or_create(&self, slot_name: &str, plugin: &str) -> Result<SlotHandle> {
        validate_postgres_identifier(slot_name)?;
        match self.catalog.find_slot(slot_name).await? {
            Some(slot) if slot.plugin != plugin => {
                return Err(SourceError::config(
                    format!(
                        "replication slot '{}' uses plugin '{}', expected '{}'",
                        slot_name, slot.plugin, plugin
                    ),
                    format!(
                        "drop it with SELECT pg_drop_replication_slot('{}') and recreate it with the '{}' plugin, or configure another slot_name",
                        slot_name, plugin
                    ),
                ));
            }
            Some(_) => {}
            None if self.auto_create => {
                tracing::info!("Creating replication slot '{}' with plugin '{}'", slot_name, plugin);
                self.catalog.create_slot(slot_name, plugin).await?;
            }
            None => {
                return Err(SourceError::config(
                    format!("replication slot '{}' does not exist", slot_name),
                    format!(
                        "create it with SELECT pg_create_logical_replication_slot('{}', '{}') or set replication.auto_create = true",
                        slot_name, plugin
                    ),
                ));
            }
        }
        self.acquire(slot_name).await
    }

    /// Fail unless every table is in the publication. A missing publication
    /// is created only when auto-create is enabled; an existing one is never
    /// altered.
    pub async fn ensure_publication_covers(
        &self,
        publication: &str,
        tables: &[StreamDescriptor],
    ) -> Result<Publication> {
        validate_postgres_identifier(publication)?;
        let existing = match self.catalog.find_publication(publication).await? {
            Some(existing) => existing,
            None if self.auto_create => {
                tracing::info!(
                    "Creating publication '{}' for {} table(s)",
                    publication,
                    tables.len()
                );
                return self.catalog.create_publication(publication, tables).await;
            }
            None => {
                return Err(SourceError::config(
                    format!("publication '{}' does not exist", publication),
                    format!(
                        "CREATE PUBLICATION {} FOR TABLE {}; or set replication.auto_create = true",
                        publication,
                        qualified_list(tables)
                    ),
                ));
            }
        };

        let missing: Vec<StreamDescriptor> = tables
            .iter()
            .filter(|t| !existing.covers(t))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(SourceError::config(
                format!(
                    "publication '{}' does not include CDC table(s) {}",
                    publication,
                    qualified_list(&missing)
                ),
                format!(
                    "ALTER PUBLICATION {} ADD TABLE {};",
                    publication,
                    qualified_list(&missing)
                ),
            ));
        }
        Ok(existing)
    }

    /// Make sure updates and deletes of `table` can be decoded.
    ///
    /// Tables with identity NOTHING (or DEFAULT without a primary key) are
    /// switched to DEFAULT when a primary key exists, FULL otherwise, if the
    /// connector may alter the table; otherwise this is a permission error.
    pub async fn ensure_replica_identity(&self, table: &StreamDescriptor) -> Result<ReplicaIdentity> {
        let identity = self.catalog.table_identity(table).await?.ok_or_else(|| {
            SourceError::config(
                format!("table {} does not exist", table),
                "remove the stream from the catalog or create the table",
            )
        })?;
        if identity.is_adequate() {
            return Ok(identity.replica_identity);
        }

        let target = if identity.has_primary_key {
            ReplicaIdentity::Default
        } else {
            ReplicaIdentity::Full
        };
        if !self.catalog.can_alter_table(table).await? {
            return Err(SourceError::permission(
                format!(
                    "table {} has replica identity {}{}, so updates and deletes cannot be decoded",
                    table,
                    identity.replica_identity,
                    if identity.has_primary_key { "" } else { " and no primary key" }
                ),
                format!(
                    "run ALTER TABLE {} REPLICA IDENTITY {}; as the table owner",
                    table, target
                ),
            ));
        }
        tracing::warn!(
            "Setting replica identity of {} from {} to {}",
            table,
            identity.replica_identity,
            target
        );
        self.catalog.set_replica_identity(table, target).await?;
        Ok(target)
    }

    /// Take the exclusive handle for a slot. Never preempts: an active
    /// consumer elsewhere, or a live handle in this process, is `SlotBusy`.
    pub async fn acquire(&self, slot_name: &str) -> Result<SlotHandle> {
        let slot = self.catalog.find_slot(slot_name).await?.ok_or_else(|| {
            SourceError::config(
                format!("replication slot '{}' does not exist", slot_name),
                "create the slot before acquiring it",
            )
        })?;
        if slot.active {
            tracing::warn!(
                "Replication slot '{}' is active (pid {:?})",
                slot_name,
                slot.active_pid
            );
            return Err(SourceError::SlotBusy {
                slot: slot_name.to_string(),
            });
        }
        {
            let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
            if !leases.insert(slot_name.to_string()) {
                return Err(SourceError::SlotBusy {
                    slot: slot_name.to_string(),
                });
            }
        }
        tracing::info!(
            "Acquired replication slot '{}' (confirmed flush {})",
            slot_name,
            slot.confirmed_flush
                .map(|l| l.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        Ok(SlotHandle {
            slot,
            leases: self.leases.clone(),
        })
    }
}

fn qualified_list(tables: &[StreamDescriptor]) -> String {
    tables
        .iter()
        .map(StreamDescriptor::qualified_name)
        .collect::<Vec<_>>()
        .join(", ")
}
