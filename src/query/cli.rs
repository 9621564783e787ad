//! The `query`, `count`, `match`, and `all` sub commands.

use std::io::Write;
use std::sync::Arc;

use clap::Parser;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::index::locus::{GeneResolver, GffGeneResolver};
use crate::query::{parse_query_args, Engine};
use crate::store::{RecordStore, S3Blobs};

/// Command line arguments for the `query` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Stream records matching a query as NDJSON", long_about = None)]
pub struct QueryArgs {
    /// Index to query.
    pub index: String,
    /// One value per schema key, optionally followed by a locus.
    pub values: Vec<String>,
    /// Optional cap on the number of emitted records.
    #[arg(long)]
    pub limit: Option<u64>,
}

/// Command line arguments for the `count` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Estimate the number of matching records", long_about = None)]
pub struct CountArgs {
    /// Index to query.
    pub index: String,
    /// One value per schema key, optionally followed by a locus.
    pub values: Vec<String>,
}

/// Command line arguments for the `match` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "List distinct first-key values by prefix", long_about = None)]
pub struct MatchArgs {
    /// Index to list.
    pub index: String,
    /// Key prefix to match.
    pub prefix: String,
}

/// Command line arguments for the `all` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Stream every record of an index", long_about = None)]
pub struct AllArgs {
    /// Index to stream.
    pub index: String,
}

async fn open_store(config: &Config) -> Result<Arc<RecordStore>, anyhow::Error> {
    let client = crate::common::s3::client_from_env().await?;
    Ok(Arc::new(RecordStore::new(Arc::new(S3Blobs::new(
        client,
        config.s3_bucket.clone(),
    )))))
}

fn gene_resolver(config: &Config) -> Option<GffGeneResolver> {
    config.genes_uri.clone().map(GffGeneResolver::new)
}

/// Stream a cursor to stdout, page by page, as NDJSON.
async fn stream_to_stdout(
    engine: &Engine<'_>,
    spec: &crate::index::IndexSpec,
    cursor: &mut crate::query::Cursor,
) -> Result<(), anyhow::Error> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    loop {
        let page = engine.fetch_page(spec, cursor).await?;
        for record in &page.records {
            writeln!(out, "{}", record)?;
        }
        if page.done {
            break;
        }
    }
    Ok(())
}

/// Main entry point for the `query` sub command.
pub fn run_query(args_common: &crate::common::Args, args: &QueryArgs) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let config = Config::from_env()?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let store = open_store(&config).await?;
        let catalog = Catalog::open(&config.database)?;
        let engine = Engine {
            config: &config,
            catalog: &catalog,
            store: &store,
        };

        let resolver = gene_resolver(&config);
        let spec = catalog.get(&args.index)?;
        let (keys, locus) = parse_query_args(
            &spec,
            &args.values,
            resolver.as_ref().map(|r| r as &dyn GeneResolver),
        )?;
        let (spec, mut cursor) = engine.plan(&args.index, keys, locus, args.values.clone())?;
        cursor.limit = args.limit;

        stream_to_stdout(&engine, &spec, &mut cursor).await
    })
}

/// Main entry point for the `count` sub command.
pub fn run_count(args_common: &crate::common::Args, args: &CountArgs) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let config = Config::from_env()?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let store = open_store(&config).await?;
        let catalog = Catalog::open(&config.database)?;
        let engine = Engine {
            config: &config,
            catalog: &catalog,
            store: &store,
        };

        let resolver = gene_resolver(&config);
        let spec = catalog.get(&args.index)?;
        let (keys, locus) = parse_query_args(
            &spec,
            &args.values,
            resolver.as_ref().map(|r| r as &dyn GeneResolver),
        )?;
        let count = engine.count(&args.index, keys, locus).await?;
        println!("{}", count);
        Ok(())
    })
}

/// Main entry point for the `match` sub command.
pub fn run_match(args_common: &crate::common::Args, args: &MatchArgs) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let config = Config::from_env()?;
    let catalog = Catalog::open(&config.database)?;
    let values = super::stats::match_keys(&catalog, &config, &args.index, &args.prefix)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for value in values {
        writeln!(out, "{}", value)?;
    }
    Ok(())
}

/// Main entry point for the `all` sub command.
pub fn run_all(args_common: &crate::common::Args, args: &AllArgs) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let config = Config::from_env()?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let store = open_store(&config).await?;
        let catalog = Catalog::open(&config.database)?;
        let engine = Engine {
            config: &config,
            catalog: &catalog,
            store: &store,
        };

        let (spec, mut cursor) = engine.plan_all(&args.index)?;
        stream_to_stdout(&engine, &spec, &mut cursor).await
    })
}
