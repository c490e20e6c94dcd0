//! Error taxonomy for a reconciliation run
//!
//! Only fatal conditions live here. Lookup misses and malformed codes are
//! not errors: they resolve to `None` and are counted in the run summary.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Error, Debug)]
pub enum EtlError {
    /// A required source table or column could not be read
    #[error("Source schema error reading '{table}': {source}")]
    SourceSchema {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// A reference dataset (country or NUTS centroids) is missing or unparsable
    #[error("Reference data error in {path}: {detail}")]
    ReferenceData { path: String, detail: String },

    /// Connectivity or type failure while replacing the destination table
    #[error("Destination write error for '{table}': {source}")]
    Destination {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EtlError {
    pub fn source_schema(table: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::SourceSchema { table, source }
    }

    pub fn destination(table: &str) -> impl FnOnce(sqlx::Error) -> Self + '_ {
        move |source| Self::Destination {
            table: table.to_string(),
            source,
        }
    }
}
