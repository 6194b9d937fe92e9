// ABOUTME: Pre-flight checks for logical replication prerequisites
// ABOUTME: Validates connectivity, wal_level, privileges, slot, publication and replica identity

use anyhow::Result;
use std::sync::Arc;

use crate::catalog::{ConfiguredCatalog, StreamDescriptor};
use crate::config::SourceConfig;
use crate::postgres::{check_source_privileges, check_table_select_permissions, check_wal_level, connect};
use crate::slot::{PgSlotCatalog, SlotCatalog};
use crate::utils::sanitize_url;

/// Individual check result
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            details: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Issue with suggested fixes
#[derive(Debug, Clone)]
pub struct PreflightIssue {
    pub title: String,
    pub explanation: String,
    pub fixes: Vec<String>,
}

#[derive(Debug, Default)]
pub struct PreflightResult {
    pub network: Vec<CheckResult>,
    pub permissions: Vec<CheckResult>,
    pub replication: Vec<CheckResult>,
    pub issues: Vec<PreflightIssue>,
}

impl PreflightResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_passed(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.issues.len()
    }

    fn fail(&mut self, section: Section, check: CheckResult, explanation: impl Into<String>, fixes: Vec<String>) {
        self.issues.push(PreflightIssue {
            title: check.message.clone(),
            explanation: explanation.into(),
            fixes,
        });
        self.section(section).push(check);
    }

    fn pass(&mut self, section: Section, check: CheckResult) {
        self.section(section).push(check);
    }

    fn section(&mut self, section: Section) -> &mut Vec<CheckResult> {
        match section {
            Section::Network => &mut self.network,
            Section::Permissions => &mut self.permissions,
            Section::Replication => &mut self.replication,
        }
    }

    /// Print formatted output. Goes to stderr; stdout is reserved for messages.
    pub fn print(&self) {
        eprintln!();
        eprintln!("Pre-flight Checks");
        eprintln!("{}", "═".repeat(61));
        eprintln!();

        for (title, checks) in [
            ("Network Connectivity:", &self.network),
            ("Source Permissions:", &self.permissions),
            ("Logical Replication:", &self.replication),
        ] {
            if checks.is_empty() {
                continue;
            }
            eprintln!("{}", title);
            for check in checks {
                let icon = if check.passed { "✓" } else { "✗" };
                eprintln!("  {} {}", icon, check.message);
                if let Some(ref details) = check.details {
                    eprintln!("      {}", details);
                }
            }
            eprintln!();
        }

        eprintln!("{}", "═".repeat(61));
        if self.all_passed() {
            eprintln!("PASSED: All pre-flight checks successful");
        } else {
            eprintln!("FAILED: {} issue(s) must be resolved", self.failed_count());
            eprintln!();
            for (i, issue) in self.issues.iter().enumerate() {
                eprintln!("Issue {}: {}", i + 1, issue.title);
                eprintln!("  {}", issue.explanation);
                eprintln!();
                eprintln!("  Fix options:");
                for fix in &issue.fixes {
                    eprintln!("    • {}", fix);
                }
                eprintln!();
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Section {
    Network,
    Permissions,
    Replication,
}

/// Run all pre-flight checks against the configured source.
///
/// Checks never create or alter anything, regardless of `auto_create`.
pub async fn run_preflight_checks(
    config: &SourceConfig,
    catalog: Option<&ConfiguredCatalog>,
) -> Result<PreflightResult> {
    let mut result = PreflightResult::new();

    let client = match connect(&config.url).await {
        Ok(client) => {
            result.pass(
                Section::Network,
                CheckResult::pass("source", format!("Connected to {}", sanitize_url(&config.url))),
            );
            Arc::new(client)
        }
        Err(e) => {
            result.fail(
                Section::Network,
                CheckResult::fail("source", "Cannot connect to source database").with_details(e.to_string()),
                "The connector needs a working connection before any other check can run.",
                vec![
                    "Check host, port and credentials in the configured url".to_string(),
                    e.remediation(),
                ],
            );
            return Ok(result);
        }
    };

    let streams: Vec<StreamDescriptor> = catalog
        .map(|c| c.streams.iter().map(|s| s.stream.clone()).collect())
        .unwrap_or_default();
    let cdc_tables: Vec<StreamDescriptor> = catalog
        .map(|c| c.cdc_streams().map(|s| s.stream.clone()).collect())
        .unwrap_or_default();
    let needs_replication = catalog.map(|c| c.has_cdc()).unwrap_or(true);

    check_permissions(&mut result, &client, &streams, needs_replication).await?;
    if needs_replication {
        check_replication_objects(&mut result, client, config, &cdc_tables).await?;
    }
    Ok(result)
}

async fn check_permissions(
    result: &mut PreflightResult,
    client: &tokio_postgres::Client,
    streams: &[StreamDescriptor],
    needs_replication: bool,
) -> Result<()> {
    if needs_replication {
        let privileges = check_source_privileges(client).await?;
        if privileges.can_replicate() {
            let how = if privileges.is_superuser { "superuser" } else { "REPLICATION attribute" };
            result.pass(
                Section::Permissions,
                CheckResult::pass("replication", format!("User may open replication connections ({})", how)),
            );
        } else {
            result.fail(
                Section::Permissions,
                CheckResult::fail("replication", "User lacks REPLICATION privilege"),
                "Logical decoding requires the REPLICATION role attribute.",
                vec!["ALTER ROLE <user> WITH REPLICATION;".to_string()],
            );
        }

        let wal_level = check_wal_level(client).await?;
        if wal_level == "logical" {
            result.pass(Section::Permissions, CheckResult::pass("wal_level", "wal_level = logical"));
        } else {
            result.fail(
                Section::Permissions,
                CheckResult::fail("wal_level", format!("wal_level = {}", wal_level)),
                "Replication slots with the pgoutput plugin need wal_level = logical.",
                vec![
                    "ALTER SYSTEM SET wal_level = logical; then restart the server".to_string(),
                    "On managed services, enable logical replication in the parameter group".to_string(),
                ],
            );
        }
    }

    if streams.is_empty() {
        return Ok(());
    }
    let tables = check_table_select_permissions(client, streams).await?;
    if tables.all_accessible() {
        result.pass(
            Section::Permissions,
            CheckResult::pass("select", format!("SELECT granted on {} table(s)", tables.accessible.len())),
        );
    }
    for table in &tables.inaccessible {
        result.fail(
            Section::Permissions,
            CheckResult::fail("select", format!("No SELECT permission on {}", table)),
            "Snapshot and incremental reads scan the table directly.",
            vec![format!("GRANT SELECT ON {} TO <user>;", table)],
        );
    }
    for table in &tables.missing {
        result.fail(
            Section::Permissions,
            CheckResult::fail("select", format!("Table {} does not exist", table)),
            "Every stream in the catalog must exist in the source.",
            vec!["Remove the stream from the catalog or create the table".to_string()],
        );
    }
    Ok(())
}

async fn check_replication_objects(
    result: &mut PreflightResult,
    client: Arc<tokio_postgres::Client>,
    config: &SourceConfig,
    cdc_tables: &[StreamDescriptor],
) -> Result<()> {
    let replication = &config.replication;
    let catalog = PgSlotCatalog::new(client);

    match catalog.find_slot(&replication.slot_name).await? {
        Some(slot) if slot.plugin != replication.plugin => result.fail(
            Section::Replication,
            CheckResult::fail(
                "slot",
                format!("Slot '{}' uses plugin '{}'", slot.name, slot.plugin),
            ),
            format!("The connector decodes '{}' output only.", replication.plugin),
            vec![format!(
                "SELECT pg_drop_replication_slot('{}'); then recreate it with '{}'",
                slot.name, replication.plugin
            )],
        ),
        Some(slot) if slot.active => result.fail(
            Section::Replication,
            CheckResult::fail("slot", format!("Slot '{}' is in use", slot.name))
                .with_details(format!("active pid {:?}", slot.active_pid)),
            "A slot has exactly one consumer; the connector never preempts it.",
            vec!["Stop the other consumer, or configure a different slot_name".to_string()],
        ),
        Some(slot) => result.pass(
            Section::Replication,
            CheckResult::pass("slot", format!("Slot '{}' exists with plugin '{}'", slot.name, slot.plugin))
                .with_details(format!(
                    "confirmed flush {}",
                    slot.confirmed_flush
                        .map(|l| l.to_string())
                        .unwrap_or_else(|| "none".to_string())
                )),
        ),
        None if replication.auto_create => result.pass(
            Section::Replication,
            CheckResult::pass("slot", format!("Slot '{}' will be created on first read", replication.slot_name)),
        ),
        None => result.fail(
            Section::Replication,
            CheckResult::fail("slot", format!("Slot '{}' does not exist", replication.slot_name)),
            "CDC streams read from a pre-provisioned logical replication slot.",
            vec![
                format!(
                    "SELECT pg_create_logical_replication_slot('{}', '{}');",
                    replication.slot_name, replication.plugin
                ),
                "Set replication.auto_create = true".to_string(),
            ],
        ),
    }

    match catalog.find_publication(&replication.publication).await? {
        Some(publication) => {
            let missing: Vec<String> = cdc_tables
                .iter()
                .filter(|t| !publication.covers(t))
                .map(|t| t.to_string())
                .collect();
            if missing.is_empty() {
                result.pass(
                    Section::Replication,
                    CheckResult::pass(
                        "publication",
                        format!("Publication '{}' covers all CDC tables", publication.name),
                    ),
                );
            } else {
                result.fail(
                    Section::Replication,
                    CheckResult::fail(
                        "publication",
                        format!("Publication '{}' is missing {}", publication.name, missing.join(", ")),
                    ),
                    "Changes of tables outside the publication are never streamed.",
                    vec![format!(
                        "ALTER PUBLICATION {} ADD TABLE {};",
                        publication.name,
                        missing.join(", ")
                    )],
                );
            }
        }
        None if replication.auto_create => result.pass(
            Section::Replication,
            CheckResult::pass(
                "publication",
                format!("Publication '{}' will be created on first read", replication.publication),
            ),
        ),
        None => result.fail(
            Section::Replication,
            CheckResult::fail(
                "publication",
                format!("Publication '{}' does not exist", replication.publication),
            ),
            "The pgoutput plugin streams only tables in the named publication.",
            vec![format!("CREATE PUBLICATION {} FOR TABLE <tables>;", replication.publication)],
        ),
    }

    for table in cdc_tables {
        let Some(identity) = catalog.table_identity(table).await? else {
            continue;
        };
        if identity.is_adequate() {
            result.pass(
                Section::Replication,
                CheckResult::pass(
                    "replica_identity",
                    format!("{} replica identity {}", table, identity.replica_identity),
                ),
            );
        } else {
            let target = if identity.has_primary_key { "DEFAULT" } else { "FULL" };
            result.fail(
                Section::Replication,
                CheckResult::fail(
                    "replica_identity",
                    format!("{} replica identity {} is not decodable", table, identity.replica_identity),
                ),
                "Updates and deletes need a primary key or a full row image.",
                vec![format!("ALTER TABLE {} REPLICA IDENTITY {};", table, target)],
            );
        }
    }
    Ok(())
}
