//! Schema-typed commit of the fact table
//!
//! The table is written under a fixed column → type mapping. Replacement is
//! staged: rows go into a fresh staging table and the swap (drop old, rename
//! staging, create indexes) happens in the same transaction, so a failed run
//! leaves the previous table untouched.

use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::info;
use uuid::Uuid;

use crate::error::{EtlError, Result};
use crate::merge::{FactRow, MasterTable};

/// Postgres limit on bind parameters per statement
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Text,
    /// Bounded by the longest normalized code in the table
    CodeText,
    Double,
    /// Booleans stored as small integers
    SmallInt,
}

impl ColumnType {
    fn sql(self, code_width: usize) -> String {
        match self {
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::Text => "VARCHAR(255)".to_string(),
            ColumnType::CodeText => format!("VARCHAR({})", code_width),
            ColumnType::Double => "DOUBLE PRECISION".to_string(),
            ColumnType::SmallInt => "SMALLINT".to_string(),
        }
    }
}

/// Destination columns, in `FactRow` field order
pub const MASTER_COLUMNS: &[(&str, ColumnType)] = &[
    ("project_id", ColumnType::Integer),
    ("thematic", ColumnType::Text),
    ("partner_id", ColumnType::Integer),
    ("country_name", ColumnType::Text),
    ("nuts_0", ColumnType::Text),
    ("nuts_1", ColumnType::Text),
    ("nuts_2", ColumnType::Text),
    ("nuts_3", ColumnType::Text),
    ("partner_lgt", ColumnType::Double),
    ("partner_lat", ColumnType::Double),
    ("is_leader", ColumnType::SmallInt),
    ("is_ext_nuts", ColumnType::SmallInt),
    ("cca2", ColumnType::Text),
    ("lat", ColumnType::Double),
    ("lng", ColumnType::Double),
    ("period", ColumnType::Text),
    ("programme_id", ColumnType::Integer),
    ("programme_name", ColumnType::Text),
    ("program_type", ColumnType::Text),
    ("thematic_objective", ColumnType::CodeText),
    ("investment_priority", ColumnType::CodeText),
    ("project_start", ColumnType::Double),
    ("project_end", ColumnType::Double),
    ("budget", ColumnType::Double),
    ("nuts0_lat", ColumnType::Double),
    ("nuts0_lng", ColumnType::Double),
    ("nuts1_lat", ColumnType::Double),
    ("nuts1_lng", ColumnType::Double),
    ("nuts2_lat", ColumnType::Double),
    ("nuts2_lng", ColumnType::Double),
    ("nuts3_lat", ColumnType::Double),
    ("nuts3_lng", ColumnType::Double),
];

/// Columns downstream dashboards filter and group on
pub const INDEXED_COLUMNS: &[&str] = &[
    "project_id",
    "thematic",
    "partner_id",
    "country_name",
    "nuts_0",
    "nuts_1",
    "nuts_2",
    "nuts_3",
    "period",
    "programme_id",
    "programme_name",
    "program_type",
    "thematic_objective",
    "investment_priority",
];

pub fn create_table_sql(table: &str, code_width: usize) -> String {
    let columns: Vec<String> = MASTER_COLUMNS
        .iter()
        .map(|(name, ty)| format!("{} {}", name, ty.sql(code_width)))
        .collect();
    format!("CREATE TABLE {} ({})", table, columns.join(", "))
}

pub fn index_sql(table: &str) -> Vec<String> {
    INDEXED_COLUMNS
        .iter()
        .map(|column| format!("CREATE INDEX {table}_{column}_idx ON {table} ({column})"))
        .collect()
}

fn insert_prefix(table: &str) -> String {
    let names: Vec<&str> = MASTER_COLUMNS.iter().map(|(name, _)| *name).collect();
    format!("INSERT INTO {} ({}) ", table, names.join(", "))
}

fn staging_name(table: &str) -> String {
    let run = Uuid::new_v4().simple().to_string();
    format!("{}_staging_{}", table, &run[..8])
}

/// Rows per INSERT, capped so one statement stays under the bind limit
fn batch_size(requested: usize) -> usize {
    requested.clamp(1, MAX_BIND_PARAMS / MASTER_COLUMNS.len())
}

fn push_row(mut b: sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>, row: &FactRow) {
    b.push_bind(row.project_id.0)
        .push_bind(row.thematic.clone())
        .push_bind(row.partner_id)
        .push_bind(row.country_name.clone())
        .push_bind(row.nuts_0.clone())
        .push_bind(row.nuts_1.clone())
        .push_bind(row.nuts_2.clone())
        .push_bind(row.nuts_3.clone())
        .push_bind(row.partner_lgt)
        .push_bind(row.partner_lat)
        .push_bind(row.is_leader)
        .push_bind(row.is_ext_nuts)
        .push_bind(row.cca2.clone())
        .push_bind(row.lat)
        .push_bind(row.lng)
        .push_bind(row.period.clone())
        .push_bind(row.programme_id.map(|id| id.0))
        .push_bind(row.programme_name.clone())
        .push_bind(row.program_type.clone())
        .push_bind(row.thematic_objective.clone())
        .push_bind(row.investment_priority.clone())
        .push_bind(row.project_start)
        .push_bind(row.project_end)
        .push_bind(row.budget)
        .push_bind(row.nuts0_lat)
        .push_bind(row.nuts0_lng)
        .push_bind(row.nuts1_lat)
        .push_bind(row.nuts1_lng)
        .push_bind(row.nuts2_lat)
        .push_bind(row.nuts2_lng)
        .push_bind(row.nuts3_lat)
        .push_bind(row.nuts3_lng);
}

/// Replace `table` with the contents of `master`, indexes included.
/// Returns the number of rows written.
pub async fn replace_master(
    pool: &PgPool,
    master: &MasterTable,
    table: &str,
    batch_rows: usize,
) -> Result<u64> {
    let code_width = master.code_width();
    let staging = staging_name(table);
    let on_err = || EtlError::destination(table);

    info!(table, staging = %staging, code_width, "replacing destination table");

    let mut tx = pool.begin().await.map_err(on_err())?;

    sqlx::query(&create_table_sql(&staging, code_width))
        .execute(&mut *tx)
        .await
        .map_err(on_err())?;

    let mut written = 0u64;
    for chunk in master.rows.chunks(batch_size(batch_rows)) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(insert_prefix(&staging));
        builder.push_values(chunk, push_row);
        let result = builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(on_err())?;
        written += result.rows_affected();
    }

    sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
        .execute(&mut *tx)
        .await
        .map_err(on_err())?;
    sqlx::query(&format!("ALTER TABLE {} RENAME TO {}", staging, table))
        .execute(&mut *tx)
        .await
        .map_err(on_err())?;
    for ddl in index_sql(table) {
        sqlx::query(&ddl).execute(&mut *tx).await.map_err(on_err())?;
    }

    tx.commit().await.map_err(on_err())?;
    info!(table, rows = written, "destination table replaced");
    Ok(written)
}
