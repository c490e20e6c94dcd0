//! Source store reader
//!
//! Every table is read with an explicit column list, cast to the types the
//! pipeline expects, and ordered by its key columns so that "first seen"
//! means the same thing on every run. A missing table or column fails the
//! whole run before anything is written.

use sqlx::PgPool;
use tracing::info;

use crate::eav::{AttributeTable, EavRow, EavTable, Keywords, Source, Strand, TermDictionary, TermId};
use crate::error::{EtlError, Result};
use crate::lookup::NutsLabels;

/// `keep_programme`
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ProgrammeRow {
    pub id: Option<i64>,
    pub programme_type: Option<String>,
    pub title: Option<String>,
    pub use_for_statistics: Option<bool>,
}

/// `kamut_project`; `project_start`/`project_end` are epoch seconds, 0 = unset
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ProjectRow {
    pub pid: Option<i64>,
    pub programme_id: Option<i64>,
    pub budget: Option<f64>,
    pub project_start: Option<i64>,
    pub project_end: Option<i64>,
}

/// `keep_programme_type`
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ProgrammeTypeRow {
    pub programme_type: Option<String>,
    pub period: Option<String>,
}

/// `kamut_partner`; `geocoding_x` is longitude, `geocoding_y` latitude
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PartnerRow {
    pub pid: Option<i64>,
    pub project_id: Option<i64>,
    pub partnership_type: Option<i16>,
    pub country: Option<String>,
    pub region_0: Option<String>,
    pub region_1: Option<String>,
    pub region_2: Option<String>,
    pub region_3: Option<String>,
    pub is_ext_nuts: Option<i16>,
    pub geocoding_x: Option<f64>,
    pub geocoding_y: Option<f64>,
}

/// `kamut_sotoip`
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SotoipRow {
    pub programme_id: Option<i64>,
    pub thematic_objective: Option<String>,
    pub investment_priority: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct TermRow {
    tid: Option<i64>,
    name: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct NutsRow {
    nuts_id: Option<String>,
    description: Option<String>,
}

/// Everything one run reads from the source store
#[derive(Debug, Default, Clone)]
pub struct SourceTables {
    pub programmes: Vec<ProgrammeRow>,
    pub projects: Vec<ProjectRow>,
    pub programme_types: Vec<ProgrammeTypeRow>,
    pub partners: Vec<PartnerRow>,
    pub sotoip: Vec<SotoipRow>,
    pub terms: TermDictionary,
    pub strand: EavTable<Strand>,
    pub source: EavTable<Source>,
    pub keywords: EavTable<Keywords>,
    pub nuts_labels: NutsLabels,
}

const PROGRAMMES_SQL: &str = r#"
    SELECT id::BIGINT AS id,
           "type"::TEXT AS programme_type,
           title::TEXT AS title,
           (use_for_statistics::INTEGER = 1) AS use_for_statistics
    FROM keep_programme
    ORDER BY id
"#;

const PROJECTS_SQL: &str = r#"
    SELECT pid::BIGINT AS pid,
           programme_id::BIGINT AS programme_id,
           budget::DOUBLE PRECISION AS budget,
           project_start::BIGINT AS project_start,
           project_end::BIGINT AS project_end
    FROM kamut_project
    ORDER BY pid
"#;

const PROGRAMME_TYPES_SQL: &str = r#"
    SELECT "type"::TEXT AS programme_type,
           period::TEXT AS period
    FROM keep_programme_type
    ORDER BY "type", period
"#;

const PARTNERS_SQL: &str = r#"
    SELECT pid::BIGINT AS pid,
           project_id::BIGINT AS project_id,
           partnership_type::INTEGER::SMALLINT AS partnership_type,
           country::TEXT AS country,
           region_0::TEXT AS region_0,
           region_1::TEXT AS region_1,
           region_2::TEXT AS region_2,
           region_3::TEXT AS region_3,
           is_ext_nuts::INTEGER::SMALLINT AS is_ext_nuts,
           geocoding_x::DOUBLE PRECISION AS geocoding_x,
           geocoding_y::DOUBLE PRECISION AS geocoding_y
    FROM kamut_partner
    ORDER BY project_id, pid
"#;

const SOTOIP_SQL: &str = r#"
    SELECT programme_id::BIGINT AS programme_id,
           thematic_objective::TEXT AS thematic_objective,
           investment_priority::TEXT AS investment_priority
    FROM kamut_sotoip
    ORDER BY programme_id, thematic_objective, investment_priority
"#;

const TERMS_SQL: &str = r#"
    SELECT tid::BIGINT AS tid, name::TEXT AS name
    FROM taxonomy_term_data
    ORDER BY tid
"#;

const NUTS_SQL: &str = r#"
    SELECT nuts_id::TEXT AS nuts_id, description::TEXT AS description
    FROM keep_nuts
    ORDER BY nuts_id
"#;

fn eav_sql<A: AttributeTable>() -> String {
    format!(
        "SELECT entity_type::TEXT AS entity_type, entity_id::BIGINT AS entity_id, \
         {col}::BIGINT AS value FROM {table} ORDER BY entity_type, entity_id, {col}",
        col = A::VALUE_COLUMN,
        table = A::TABLE
    )
}

async fn fetch<T>(pool: &PgPool, table: &'static str, sql: &str) -> Result<Vec<T>>
where
    T: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
{
    let rows: Vec<T> = sqlx::query_as(sql)
        .fetch_all(pool)
        .await
        .map_err(EtlError::source_schema(table))?;
    info!(table, rows = rows.len(), "loaded source table");
    Ok(rows)
}

async fn fetch_eav<A: AttributeTable>(pool: &PgPool) -> Result<EavTable<A>> {
    let rows: Vec<EavRow> = fetch(pool, A::TABLE, &eav_sql::<A>()).await?;
    Ok(EavTable::new(rows))
}

impl SourceTables {
    /// Read every table the pipeline needs. Sequential: one blocking batch.
    pub async fn load(pool: &PgPool) -> Result<Self> {
        let terms: Vec<TermRow> = fetch(pool, "taxonomy_term_data", TERMS_SQL).await?;
        let nuts: Vec<NutsRow> = fetch(pool, "keep_nuts", NUTS_SQL).await?;

        Ok(Self {
            programmes: fetch(pool, "keep_programme", PROGRAMMES_SQL).await?,
            projects: fetch(pool, "kamut_project", PROJECTS_SQL).await?,
            programme_types: fetch(pool, "keep_programme_type", PROGRAMME_TYPES_SQL).await?,
            partners: fetch(pool, "kamut_partner", PARTNERS_SQL).await?,
            sotoip: fetch(pool, "kamut_sotoip", SOTOIP_SQL).await?,
            terms: terms
                .into_iter()
                .filter_map(|t| Some((TermId(t.tid?), t.name?)))
                .collect(),
            strand: fetch_eav(pool).await?,
            source: fetch_eav(pool).await?,
            keywords: fetch_eav(pool).await?,
            nuts_labels: nuts
                .into_iter()
                .filter_map(|n| Some((n.nuts_id?, n.description?)))
                .collect(),
        })
    }
}
