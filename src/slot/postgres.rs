// ABOUTME: SlotCatalog backed by the PostgreSQL system catalogs
// ABOUTME: Reads pg_replication_slots/pg_publication and issues slot, publication and identity DDL

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_postgres::Client;

use super::{Publication, ReplicaIdentity, ReplicationSlot, SlotCatalog, TableIdentity};
use crate::catalog::StreamDescriptor;
use crate::error::{Result, SourceError};
use crate::utils::{quote_ident, validate_postgres_identifier};
use crate::wal::Lsn;

pub struct PgSlotCatalog {
    client: Arc<Client>,
}

impl PgSlotCatalog {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

fn parse_lsn(text: Option<String>) -> Result<Option<Lsn>> {
    text.map(|t| {
        t.parse::<Lsn>()
            .map_err(|e| SourceError::decode(format!("server returned {}", e)))
    })
    .transpose()
}

fn qualified(table: &StreamDescriptor) -> Result<String> {
    validate_postgres_identifier(&table.namespace)?;
    validate_postgres_identifier(&table.name)?;
    Ok(format!("{}.{}", quote_ident(&table.namespace), quote_ident(&table.name)))
}

#[async_trait]
impl SlotCatalog for PgSlotCatalog {
    async fn find_slot(&self, name: &str) -> Result<Option<ReplicationSlot>> {
        let row = self
            .client
            .query_opt(
                "SELECT slot_name::text, COALESCE(plugin::text, ''), confirmed_flush_lsn::text,
                        active, active_pid
                 FROM pg_replication_slots
                 WHERE slot_name = $1",
                &[&name],
            )
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ReplicationSlot {
            name: row.get(0),
            plugin: row.get(1),
            confirmed_flush: parse_lsn(row.get(2))?,
            active: row.get(3),
            active_pid: row.get(4),
        }))
    }

    async fn create_slot(&self, name: &str, plugin: &str) -> Result<ReplicationSlot> {
        validate_postgres_identifier(name)?;
        let row = self
            .client
            .query_one(
                "SELECT lsn::text FROM pg_create_logical_replication_slot($1, $2)",
                &[&name, &plugin],
            )
            .await?;
        Ok(ReplicationSlot {
            name: name.to_string(),
            plugin: plugin.to_string(),
            confirmed_flush: parse_lsn(row.get(0))?,
            active: false,
            active_pid: None,
        })
    }

    async fn find_publication(&self, name: &str) -> Result<Option<Publication>> {
        let row = self
            .client
            .query_opt("SELECT puballtables FROM pg_publication WHERE pubname = $1", &[&name])
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let all_tables: bool = row.get(0);
        let rows = self
            .client
            .query(
                "SELECT schemaname::text, tablename::text
                 FROM pg_publication_tables
                 WHERE pubname = $1",
                &[&name],
            )
            .await?;
        let tables: BTreeSet<StreamDescriptor> = rows
            .iter()
            .map(|r| StreamDescriptor::new(r.get::<_, String>(0), r.get::<_, String>(1)))
            .collect();
        Ok(Some(Publication {
            name: name.to_string(),
            all_tables,
            tables,
        }))
    }

    async fn create_publication(&self, name: &str, tables: &[StreamDescriptor]) -> Result<Publication> {
        validate_postgres_identifier(name)?;
        if tables.is_empty() {
            return Err(SourceError::config(
                format!("cannot create publication '{}' without tables", name),
                "configure at least one CDC stream",
            ));
        }
        let list = tables
            .iter()
            .map(qualified)
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        self.client
            .batch_execute(&format!("CREATE PUBLICATION {} FOR TABLE {}", quote_ident(name), list))
            .await?;
        Ok(Publication {
            name: name.to_string(),
            all_tables: false,
            tables: tables.iter().cloned().collect(),
        })
    }

    async fn table_identity(&self, table: &StreamDescriptor) -> Result<Option<TableIdentity>> {
        let row = self
            .client
            .query_opt(
                "SELECT c.relreplident::text,
                        EXISTS (SELECT 1 FROM pg_index i WHERE i.indrelid = c.oid AND i.indisprimary)
                 FROM pg_class c
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname = $1 AND c.relname = $2",
                &[&table.namespace, &table.name],
            )
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let code: String = row.get(0);
        let replica_identity = code
            .chars()
            .next()
            .and_then(ReplicaIdentity::from_code)
            .ok_or_else(|| SourceError::decode(format!("unknown relreplident '{}' for {}", code, table)))?;
        Ok(Some(TableIdentity {
            replica_identity,
            has_primary_key: row.get(1),
        }))
    }

    async fn can_alter_table(&self, table: &StreamDescriptor) -> Result<bool> {
        let row = self
            .client
            .query_opt(
                "SELECT pg_has_role(c.relowner, 'USAGE')
                 FROM pg_class c
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname = $1 AND c.relname = $2",
                &[&table.namespace, &table.name],
            )
            .await?;
        Ok(row.map(|r| r.get::<_, bool>(0)).unwrap_or(false))
    }

    async fn set_replica_identity(&self, table: &StreamDescriptor, identity: ReplicaIdentity) -> Result<()> {
        if identity == ReplicaIdentity::Index {
            return Err(SourceError::config(
                format!("refusing to pick a replica identity index for {}", table),
                format!("run ALTER TABLE {} REPLICA IDENTITY USING INDEX <index>;", table),
            ));
        }
        let sql = format!("ALTER TABLE {} REPLICA IDENTITY {}", qualified(table)?, identity.sql_keyword());
        self.client.batch_execute(&sql).await?;
        Ok(())
    }
}
