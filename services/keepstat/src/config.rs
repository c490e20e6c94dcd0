use std::path::PathBuf;

use crate::error::{EtlError, Result};

/// Longest prefix whose `<prefix>_master_investment_priority_idx` index name
/// still fits Postgres' 63-byte identifier limit
pub const MAX_PREFIX_LEN: usize = 32;

/// Run configuration, read once from the environment (after `.env`)
#[derive(Debug, Clone)]
pub struct Config {
    pub source_db_url: String,
    pub dest_db_url: String,
    pub table_prefix: String,
    pub countries_path: PathBuf,
    pub nuts_coord_path: PathBuf,
    pub insert_batch_rows: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes `std::env::var`
    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let source_db_url = get("SOURCE_DB_URL")
            .ok_or_else(|| EtlError::Config("SOURCE_DB_URL env var missing".to_string()))?;
        let dest_db_url = get("DEST_DB_URL").unwrap_or_else(|| source_db_url.clone());

        let insert_batch_rows = match get("INSERT_BATCH_ROWS") {
            Some(raw) => raw.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| {
                EtlError::Config(format!("INSERT_BATCH_ROWS must be a positive integer, got '{}'", raw))
            })?,
            None => 1000,
        };

        let config = Self {
            source_db_url,
            dest_db_url,
            table_prefix: get("TABLE_PREFIX").unwrap_or_else(|| "superset".to_string()),
            countries_path: PathBuf::from(
                get("COUNTRIES_PATH").unwrap_or_else(|| "./data/countries.json".to_string()),
            ),
            nuts_coord_path: PathBuf::from(
                get("NUTS_COORD_PATH").unwrap_or_else(|| "./data/nuts_coord.csv".to_string()),
            ),
            insert_batch_rows,
        };
        config.validate_prefix()?;
        Ok(config)
    }

    /// Destination table replaced on every run
    pub fn master_table(&self) -> String {
        format!("{}_master", self.table_prefix)
    }

    /// The prefix ends up in DDL, so only identifier characters are accepted
    pub fn validate_prefix(&self) -> Result<()> {
        let ok = !self.table_prefix.is_empty()
            && self.table_prefix.len() <= MAX_PREFIX_LEN
            && self
                .table_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !self.table_prefix.starts_with(|c: char| c.is_ascii_digit());
        if ok {
            Ok(())
        } else {
            Err(EtlError::Config(format!(
                "TABLE_PREFIX '{}' is not a plain SQL identifier of at most {} characters",
                self.table_prefix, MAX_PREFIX_LEN
            )))
        }
    }
}
