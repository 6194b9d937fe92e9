// ABOUTME: Resolved catalog types: stream identity and per-stream sync mode
// ABOUTME: Loaded from the configured-catalog JSON handed to the connector

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{Result, SourceError};
use crate::utils::validate_postgres_identifier;

/// Unique identity of a replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub namespace: String,
    pub name: String,
}

impl StreamDescriptor {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// `schema.table`, the key used in logs and publication membership
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    FullRefresh,
    Incremental,
    Cdc,
}

/// One stream as selected by the operator for this sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfiguredStream {
    pub stream: StreamDescriptor,
    pub sync_mode: SyncMode,
    /// Cursor column, required for incremental mode
    #[serde(default)]
    pub cursor_field: Option<String>,
    /// Sort key override; defaults to the table's primary key
    #[serde(default)]
    pub primary_key: Option<Vec<String>>,
    /// Inclusive lower bound for the first incremental sync
    #[serde(default)]
    pub start_cursor: Option<serde_json::Value>,
}

impl ConfiguredStream {
    pub fn new(stream: StreamDescriptor, sync_mode: SyncMode) -> Self {
        Self {
            stream,
            sync_mode,
            cursor_field: None,
            primary_key: None,
            start_cursor: None,
        }
    }

    pub fn with_cursor_field(mut self, field: impl Into<String>) -> Self {
        self.cursor_field = Some(field.into());
        self
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_start_cursor(mut self, value: serde_json::Value) -> Self {
        self.start_cursor = Some(value);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfiguredCatalog {
    pub streams: Vec<ConfiguredStream>,
}

impl ConfiguredCatalog {
    pub fn new(streams: Vec<ConfiguredStream>) -> Self {
        Self { streams }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog from {:?}", path))?;
        let catalog: ConfiguredCatalog = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse catalog from {:?}", path))?;
        Ok(catalog)
    }

    pub fn cdc_streams(&self) -> impl Iterator<Item = &ConfiguredStream> {
        self.streams.iter().filter(|s| s.sync_mode == SyncMode::Cdc)
    }

    pub fn has_cdc(&self) -> bool {
        self.cdc_streams().next().is_some()
    }

    /// Reject structurally invalid catalogs before anything connects.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for configured in &self.streams {
            let stream = &configured.stream;
            validate_postgres_identifier(&stream.namespace)?;
            validate_postgres_identifier(&stream.name)?;
            if !seen.insert(stream.clone()) {
                return Err(SourceError::config(
                    format!("stream {} is listed more than once", stream),
                    "a stream has exactly one sync mode per run; remove the duplicate entry",
                ));
            }
            if configured.sync_mode == SyncMode::Incremental {
                match &configured.cursor_field {
                    Some(field) => validate_postgres_identifier(field)?,
                    None => {
                        return Err(SourceError::config(
                            format!("incremental stream {} has no cursor_field", stream),
                            "set cursor_field to a monotonically increasing column, or use full_refresh",
                        ))
                    }
                }
            }
            if let Some(pk) = &configured.primary_key {
                for column in pk {
                    validate_postgres_identifier(column)?;
                }
            }
        }
        Ok(())
    }
}
