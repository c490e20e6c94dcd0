//! keepstat - Rebuilds the `<prefix>_master` statistics fact table
//!
//! Responsibilities:
//! - Read programme/project/partner tables and the EAV field tables
//! - Resolve taxonomy terms, NUTS labels and country/NUTS centroids
//! - Merge nine per-project projections into one wide fact table
//! - Replace the destination table in a single transaction
//!
//! CRITICAL: A run is DETERMINISTIC
//! Same source tables + same reference files = same fact table

mod assemble;
mod codes;
mod commit;
mod config;
mod eav;
mod error;
mod lookup;
mod merge;
mod pipeline;
mod source;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::lookup::ReferenceData;
use crate::pipeline::Pipeline;
use crate::source::SourceTables;

#[derive(Parser, Debug)]
#[command(name = "keepstat", about = "Rebuilds the KEEP statistics fact table")]
struct Args {
    /// Dry run - build and summarize the table without writing it
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Destination table prefix (overrides TABLE_PREFIX)
    #[arg(long)]
    prefix: Option<String>,

    /// Country centroid JSON (overrides COUNTRIES_PATH)
    #[arg(long)]
    countries: Option<PathBuf>,

    /// NUTS centroid CSV (overrides NUTS_COORD_PATH)
    #[arg(long)]
    nuts_coord: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(prefix) = args.prefix {
        config.table_prefix = prefix;
        config.validate_prefix()?;
    }
    if let Some(path) = args.countries {
        config.countries_path = path;
    }
    if let Some(path) = args.nuts_coord {
        config.nuts_coord_path = path;
    }

    let table = config.master_table();
    info!(
        table = %table,
        mode = if args.dry_run { "dry-run" } else { "live" },
        "starting reconciliation run"
    );

    let reference = ReferenceData::load(&config.countries_path, &config.nuts_coord_path)
        .await
        .context("Failed to load reference data")?;

    let source_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.source_db_url)
        .await
        .context("Failed to connect to source database")?;
    let sources = SourceTables::load(&source_pool).await?;
    source_pool.close().await;

    let master = Pipeline::new(reference).build(&sources);
    let fingerprint = master
        .fingerprint()
        .context("Failed to fingerprint fact table")?;

    info!(
        rows = master.rows.len(),
        projects = master.project_count(),
        budget_total = master.budget_total(),
        code_width = master.code_width(),
        nuts_label_misses = master.misses.nuts_labels,
        nuts_centroid_misses = master.misses.nuts_centroids,
        fingerprint = %fingerprint,
        "fact table built"
    );

    if args.dry_run {
        info!("dry run - destination table left unchanged");
        return Ok(());
    }

    let dest_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.dest_db_url)
        .await
        .context("Failed to connect to destination database")?;
    let written =
        commit::replace_master(&dest_pool, &master, &table, config.insert_batch_rows).await?;
    dest_pool.close().await;

    info!(table = %table, rows = written, fingerprint = %fingerprint, "run complete");
    Ok(())
}
