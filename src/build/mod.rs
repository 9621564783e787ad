//! Code implementing the `index` sub command: populating index tables from
//! the shards under an index prefix.

use std::sync::Arc;

use clap::Parser;
use itertools::Itertools;
use rayon::prelude::*;
use thousands::Separable;

use crate::catalog::{quote_ident, Catalog};
use crate::config::Config;
use crate::err::Error;
use crate::index::locus::Locus;
use crate::index::{key_tuples, record_locus, IndexSpec};
use crate::store::RecordStore;

/// Command line arguments for the `index` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Build index tables from the blob store", long_about = None)]
pub struct Args {
    /// Name of the index to build, `*` for all.
    pub name: String,
    /// Number of objects to index in parallel.
    #[arg(long)]
    pub workers: Option<usize>,
    /// Clear a stale build lock left behind by a crashed build.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

/// Main entry point for the `index` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let mut config = Config::from_env()?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow::anyhow!("building Tokio runtime failed: {}", e))?;
    let client = runtime.block_on(crate::common::s3::client_from_env())?;
    let store = Arc::new(RecordStore::new(Arc::new(crate::store::S3Blobs::new(
        client,
        config.s3_bucket.clone(),
    ))));
    drop(runtime);

    let catalog = Catalog::open(&config.database)?;
    let specs = if args.name == "*" {
        catalog.list()?
    } else {
        vec![catalog.get(&args.name)?]
    };
    drop(catalog);

    for spec in &specs {
        let summary = build_index(&config, &store, spec, args.force)?;
        tracing::info!(
            "index {}: {} row(s) from {} object(s), {} record(s) skipped",
            spec.name,
            summary.rows().separate_with_commas(),
            summary.objects.len().separate_with_commas(),
            summary.skipped().separate_with_commas(),
        );
        if !summary.ok() {
            return Err(Error::BuildFailed(summary.describe_failures()).into());
        }
    }

    Ok(())
}

/// Outcome of indexing a single object.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ObjectStatus {
    pub object: String,
    pub rows: u64,
    pub skipped: u64,
    pub error: Option<String>,
}

/// Outcome of one build pass over an index.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildSummary {
    pub index: String,
    pub objects: Vec<ObjectStatus>,
}

impl BuildSummary {
    /// Whether every object indexed cleanly.
    pub fn ok(&self) -> bool {
        self.objects.iter().all(|o| o.error.is_none())
    }

    pub fn rows(&self) -> u64 {
        self.objects.iter().map(|o| o.rows).sum()
    }

    pub fn skipped(&self) -> u64 {
        self.objects.iter().map(|o| o.skipped).sum()
    }

    /// One-line description of the failed objects.
    pub fn describe_failures(&self) -> String {
        let failed = self
            .objects
            .iter()
            .filter_map(|o| {
                o.error
                    .as_ref()
                    .map(|e| format!("{}: {}", o.object, e))
            })
            .join("; ");
        format!(
            "{} of {} object(s) failed for {}: {}",
            self.objects.iter().filter(|o| o.error.is_some()).count(),
            self.objects.len(),
            self.index,
            failed
        )
    }
}

/// Build one index from the current contents of its prefix.
///
/// Objects are indexed in parallel up to `config.workers`; each object's
/// rows replace its previous rows in one transaction, so a failed build can
/// be re-run. The `built` flag is only set after a fully clean pass.
pub fn build_index(
    config: &Config,
    store: &Arc<RecordStore>,
    spec: &IndexSpec,
    force: bool,
) -> Result<BuildSummary, Error> {
    let catalog = Catalog::open(&config.database)?;
    catalog.lock_build(&spec.name, force)?;
    let result = build_locked(config, store, spec, &catalog);
    catalog.unlock_build(&spec.name)?;
    result
}

fn build_locked(
    config: &Config,
    store: &Arc<RecordStore>,
    spec: &IndexSpec,
    catalog: &Catalog,
) -> Result<BuildSummary, Error> {
    catalog.set_built(&spec.name, false)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::BlobRead(format!("building Tokio runtime failed: {}", e)))?;
    let objects = runtime.block_on(store.list_shards(&spec.prefix, spec.compressed))?;
    drop(runtime);
    tracing::info!(
        "indexing {} object(s) under {}",
        objects.len().separate_with_commas(),
        spec.prefix
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()
        .map_err(|e| Error::BuildFailed(format!("building thread pool failed: {}", e)))?;
    let statuses: Vec<ObjectStatus> = pool.install(|| {
        objects
            .par_iter()
            .map(|object| match index_object(config, store, spec, &object.key) {
                Ok((rows, skipped)) => {
                    tracing::debug!(
                        "indexed {}: {} row(s), {} skipped",
                        object.key,
                        rows,
                        skipped
                    );
                    ObjectStatus {
                        object: object.key.clone(),
                        rows,
                        skipped,
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::warn!("indexing {} failed: {}", object.key, e);
                    ObjectStatus {
                        object: object.key.clone(),
                        rows: 0,
                        skipped: 0,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect()
    });

    let summary = BuildSummary {
        index: spec.name.clone(),
        objects: statuses,
    };
    if summary.ok() {
        catalog.set_built(&spec.name, true)?;
    }
    Ok(summary)
}

/// Scan one shard and replace its rows in the index table.
fn index_object(
    config: &Config,
    store: &Arc<RecordStore>,
    spec: &IndexSpec,
    object: &str,
) -> Result<(u64, u64), Error> {
    // Each worker drives its async scan with its own current-thread
    // scheduler and writes over its own database connection.
    let (rows, skipped) = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::BlobRead(format!("building Tokio runtime for {} failed: {}", object, e)))?
        .block_on(scan_object(store, spec, object))?;

    let mut catalog = Catalog::open(&config.database)?;
    insert_rows(&mut catalog, spec, object, &rows)?;
    Ok((rows.len() as u64, skipped))
}

/// One collapsed run of records destined for the index table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    pub keys: Vec<String>,
    pub locus: Option<Locus>,
    pub start_offset: u64,
    pub end_offset: u64,
}

/// Scan an object and collapse its records into index rows.
///
/// Returns the rows plus the number of skipped records (missing key or
/// locus fields). Records must arrive sorted by keys then locus; the
/// single-pass collapse relies on it.
pub async fn scan_object(
    store: &RecordStore,
    spec: &IndexSpec,
    object: &str,
) -> Result<(Vec<IndexRow>, u64), Error> {
    let parts = spec.schema.key_parts();
    let mut stream = store.stream_object(object, spec.compressed).await?;

    let mut rows = Vec::new();
    let mut open: Vec<IndexRow> = Vec::new();
    let mut skipped = 0u64;
    while let Some((start, end, line)) = stream.next_line().await? {
        if line.is_empty() {
            continue;
        }
        let record: serde_json::Value =
            serde_json::from_slice(line).map_err(|e| Error::CorruptShard {
                object: object.to_string(),
                reason: format!("invalid JSON at byte {}: {}", start, e),
            })?;

        let tuples = match key_tuples(&record, &parts) {
            Ok(tuples) => tuples,
            Err(part) => {
                tracing::trace!("record at {}:{} has no value for {}", object, start, part);
                skipped += 1;
                continue;
            }
        };
        let locus = match &spec.schema.locus {
            Some(part) => match record_locus(&record, part) {
                Some(locus) => Some(locus),
                None => {
                    tracing::trace!("record at {}:{} has no usable locus", object, start);
                    skipped += 1;
                    continue;
                }
            },
            None => None,
        };
        advance_runs(&mut open, &mut rows, tuples, locus, start, end);
    }
    rows.append(&mut open);

    Ok((rows, skipped))
}

/// Fold one record into the open runs: extend a run when the key tuple
/// matches and the locus touches it (`new.start <= current.end`), flush runs
/// the record no longer continues, and open new runs for unmatched tuples.
fn advance_runs(
    open: &mut Vec<IndexRow>,
    rows: &mut Vec<IndexRow>,
    tuples: Vec<Vec<String>>,
    locus: Option<Locus>,
    line_start: u64,
    line_end: u64,
) {
    let mut next_open = Vec::with_capacity(tuples.len());
    for tuple in tuples {
        match open.iter().position(|run| run.keys == tuple) {
            Some(i) => {
                let mut run = open.remove(i);
                let extends = match (&run.locus, &locus) {
                    (None, None) => true,
                    (Some(current), Some(new)) => {
                        current.chrom == new.chrom && new.start <= current.end
                    }
                    _ => false,
                };
                if extends {
                    if let (Some(current), Some(new)) = (run.locus.as_mut(), locus.as_ref()) {
                        current.start = current.start.min(new.start);
                        current.end = current.end.max(new.end);
                    }
                    run.end_offset = line_end;
                    next_open.push(run);
                } else {
                    rows.push(run);
                    next_open.push(IndexRow {
                        keys: tuple,
                        locus: locus.clone(),
                        start_offset: line_start,
                        end_offset: line_end,
                    });
                }
            }
            None => next_open.push(IndexRow {
                keys: tuple,
                locus: locus.clone(),
                start_offset: line_start,
                end_offset: line_end,
            }),
        }
    }
    // runs not continued by this record are complete
    rows.append(open);
    *open = next_open;
}

/// Replace all rows of `object` in one transaction (per-object idempotence).
pub fn insert_rows(
    catalog: &mut Catalog,
    spec: &IndexSpec,
    object: &str,
    rows: &[IndexRow],
) -> Result<(), Error> {
    let table = quote_ident(&spec.table_name);
    let n_keys = spec.schema.key_parts().len();
    let n_cols = n_keys + if spec.schema.is_locus() { 3 } else { 0 } + 3;

    let conn = catalog.conn_mut();
    let tx = conn.transaction()?;
    tx.execute(
        &format!("DELETE FROM {} WHERE \"object\" = ?1", table),
        rusqlite::params![object],
    )?;
    {
        let placeholders = (1..=n_cols).map(|i| format!("?{}", i)).join(", ");
        let mut stmt = tx.prepare(&format!("INSERT INTO {} VALUES ({})", table, placeholders))?;
        for row in rows {
            let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(n_cols);
            for key in &row.keys {
                values.push(key.clone().into());
            }
            if let Some(locus) = &row.locus {
                values.push(locus.chrom.clone().into());
                values.push((locus.start as i64).into());
                values.push((locus.end as i64).into());
            }
            values.push(object.to_string().into());
            values.push((row.start_offset as i64).into());
            values.push((row.end_offset as i64).into());
            stmt.execute(rusqlite::params_from_iter(values))?;
        }
    }
    tx.commit()?;
    Ok(())
}
