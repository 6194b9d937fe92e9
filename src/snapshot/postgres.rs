// ABOUTME: TableSource over a tokio-postgres client
// ABOUTME: Keyset-paginated scans returning each row as its JSON image

use async_trait::async_trait;
use std::sync::Arc;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use super::{PageRequest, TableInfo, TableSource};
use crate::catalog::StreamDescriptor;
use crate::error::{Result, SourceError};
use crate::utils::{quote_ident, validate_postgres_identifier};
use crate::wal::{Lsn, RowImage};

pub struct PgTableSource {
    client: Arc<Client>,
}

impl PgTableSource {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

fn qualified(table: &StreamDescriptor) -> Result<String> {
    validate_postgres_identifier(&table.namespace)?;
    validate_postgres_identifier(&table.name)?;
    Ok(format!("{}.{}", quote_ident(&table.namespace), quote_ident(&table.name)))
}

fn column_list(alias: &str, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{}.{}", alias, quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build the page query and its jsonb parameters.
///
/// Bound values are passed as JSON objects and cast back to the table's row
/// type with `jsonb_populate_record`, so comparisons use the column types
/// rather than their JSON renderings.
pub(crate) fn build_page_query(request: &PageRequest) -> Result<(String, Vec<serde_json::Value>)> {
    let table = qualified(&request.table)?;
    let mut from = vec![format!("{} AS t", table)];
    let mut filters = Vec::new();
    let mut params = Vec::new();

    if let Some(after) = &request.after {
        params.push(serde_json::Value::Object(after.clone()));
        from.push(format!(
            "jsonb_populate_record(NULL::{}, ${}::jsonb) AS k",
            table,
            params.len()
        ));
        filters.push(format!(
            "({}) > ({})",
            column_list("t", &request.order_by),
            column_list("k", &request.order_by)
        ));
    }
    if let Some((column, value)) = &request.lower_bound {
        let mut bound = RowImage::new();
        bound.insert(column.clone(), value.clone());
        params.push(serde_json::Value::Object(bound));
        from.push(format!(
            "jsonb_populate_record(NULL::{}, ${}::jsonb) AS lb",
            table,
            params.len()
        ));
        filters.push(format!("t.{col} >= lb.{col}", col = quote_ident(column)));
    }
    if let Some(column) = &request.require_not_null {
        filters.push(format!("t.{} IS NOT NULL", quote_ident(column)));
    }

    let mut sql = format!("SELECT to_jsonb(t) FROM {}", from.join(", "));
    if !filters.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&filters.join(" AND "));
    }
    sql.push_str(&format!(
        " ORDER BY {} LIMIT {}",
        column_list("t", &request.order_by),
        request.limit
    ));
    Ok((sql, params))
}

#[async_trait]
impl TableSource for PgTableSource {
    async fn describe(&self, table: &StreamDescriptor) -> Result<Option<TableInfo>> {
        let columns: Vec<String> = self
            .client
            .query(
                "SELECT a.attname::text
                 FROM pg_attribute a
                 JOIN pg_class c ON c.oid = a.attrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname = $1
                   AND c.relname = $2
                   AND a.attnum > 0
                   AND NOT a.attisdropped
                 ORDER BY a.attnum",
                &[&table.namespace, &table.name],
            )
            .await?
            .iter()
            .map(|row| row.get(0))
            .collect();
        if columns.is_empty() {
            return Ok(None);
        }

        let primary_key: Vec<String> = self
            .client
            .query(
                "SELECT a.attname::text
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE i.indisprimary
                   AND n.nspname = $1
                   AND c.relname = $2
                 ORDER BY array_position(i.indkey::int2[], a.attnum)",
                &[&table.namespace, &table.name],
            )
            .await?
            .iter()
            .map(|row| row.get(0))
            .collect();

        Ok(Some(TableInfo { columns, primary_key }))
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<RowImage>> {
        let (sql, params) = build_page_query(request)?;
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        tracing::trace!("Page query for {}: {}", request.table, sql);
        let rows = self.client.query(&sql, &refs).await?;

        rows.iter()
            .map(|row| match row.try_get::<_, serde_json::Value>(0)? {
                serde_json::Value::Object(image) => Ok(image),
                other => Err(SourceError::decode(format!(
                    "row of {} did not render as an object: {}",
                    request.table, other
                ))),
            })
            .collect()
    }

    async fn current_wal_lsn(&self) -> Result<Lsn> {
        let row = self
            .client
            .query_one("SELECT pg_current_wal_lsn()::text", &[])
            .await?;
        let text: String = row.get(0);
        text.parse::<Lsn>()
            .map_err(|e| SourceError::decode(format!("server returned {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> PageRequest {
        PageRequest {
            table: StreamDescriptor::new("public", "events"),
            order_by: vec!["updated_at".into(), "id".into()],
            after: None,
            lower_bound: None,
            require_not_null: None,
            limit: 101,
        }
    }

    #[test]
    fn test_first_page_query_has_no_bounds() {
        let (sql, params) = build_page_query(&request()).unwrap();
        assert_eq!(
            sql,
            "SELECT to_jsonb(t) FROM \"public\".\"events\" AS t \
             ORDER BY t.\"updated_at\", t.\"id\" LIMIT 101"
        );
        assert!(params.is_empty());
    }

    #[test]
    fn test_keyset_and_lower_bound_are_parameterized() {
        let mut req = request();
        let mut after = RowImage::new();
        after.insert("updated_at".into(), json!("2024-01-01T00:00:00"));
        after.insert("id".into(), json!(7));
        req.after = Some(after);
        req.lower_bound = Some(("updated_at".into(), json!("2023-12-31T00:00:00")));
        req.require_not_null = Some("updated_at".into());

        let (sql, params) = build_page_query(&req).unwrap();
        assert!(sql.contains("jsonb_populate_record(NULL::\"public\".\"events\", $1::jsonb) AS k"));
        assert!(sql.contains("jsonb_populate_record(NULL::\"public\".\"events\", $2::jsonb) AS lb"));
        assert!(sql.contains("(t.\"updated_at\", t.\"id\") > (k.\"updated_at\", k.\"id\")"));
        assert!(sql.contains("t.\"updated_at\" >= lb.\"updated_at\""));
        assert!(sql.contains("t.\"updated_at\" IS NOT NULL"));
        assert_eq!(params.len(), 2);
        assert_eq!(params[1]["updated_at"], "2023-12-31T00:00:00");
    }

    #[test]
    fn test_invalid_table_name_rejected() {
        let mut req = request();
        req.table = StreamDescriptor::new("public", "events; DROP TABLE x");
        assert!(matches!(build_page_query(&req), Err(SourceError::Config { .. })));
    }

    #[tokio::test]
    #[ignore]
    async fn test_current_wal_lsn_is_nonzero() {
        let url = std::env::var("TEST_SOURCE_URL").unwrap();
        let client = crate::postgres::connect(&url).await.unwrap();
        let source = PgTableSource::new(Arc::new(client));
        assert!(source.current_wal_lsn().await.unwrap() > Lsn::ZERO);
    }
}
