//! BioIndex main executable

pub mod build;
pub mod catalog;
pub mod common;
pub mod compress;
pub mod config;
pub mod create;
pub mod err;
pub mod export;
pub mod index;
pub mod query;
pub mod server;
pub mod store;

use clap::{Parser, Subcommand};
use console::{Emoji, Term};

/// CLI parser based on clap.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "BioIndex heavy lifting",
    long_about = "Builds and queries byte-range indexes over sorted NDJSON shards in S3"
)]
struct Cli {
    /// Commonly used arguments
    #[command(flatten)]
    common: common::Args,

    /// The sub command to run
    #[command(subcommand)]
    command: Commands,
}

/// Enum supporting the parsing of top-level commands.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or replace an index definition.
    Create(create::Args),
    /// Build index tables from the blob store.
    Index(build::Args),
    /// Stream records matching a query as NDJSON.
    Query(query::cli::QueryArgs),
    /// Estimate the number of records matching a query.
    Count(query::cli::CountArgs),
    /// List distinct first-key values beginning with a prefix.
    Match(query::cli::MatchArgs),
    /// Stream every record of an index.
    All(query::cli::AllArgs),
    /// Emit the index descriptions for the GraphQL layer.
    BuildSchema(export::Args),
    /// Run the REST API server.
    Serve(server::Args),
    /// Compress the shards of an index to BGZF.
    Compress(compress::CompressArgs),
    /// Restore plain shards from their BGZF copies.
    Decompress(compress::DecompressArgs),
    /// Delete the uncompressed shards of a compressed index.
    RemoveUncompressedFiles(compress::RemoveArgs),
    /// Flip the compressed flag of an index.
    UpdateCompressedStatus(compress::StatusArgs),
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Build a tracing subscriber according to the configuration in `cli.common`.
    let collector = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(match cli.common.verbose.log_level() {
            Some(level) => match level {
                log::Level::Error => tracing::Level::ERROR,
                log::Level::Warn => tracing::Level::WARN,
                log::Level::Info => tracing::Level::INFO,
                log::Level::Debug => tracing::Level::DEBUG,
                log::Level::Trace => tracing::Level::TRACE,
            },
            None => tracing::Level::INFO,
        })
        .compact()
        .finish();

    // Install collector and go into sub commands.
    let term = Term::stderr();
    tracing::subscriber::with_default(collector, || {
        match &cli.command {
            Commands::Create(args) => create::run(&cli.common, args)?,
            Commands::Index(args) => build::run(&cli.common, args)?,
            Commands::Query(args) => query::cli::run_query(&cli.common, args)?,
            Commands::Count(args) => query::cli::run_count(&cli.common, args)?,
            Commands::Match(args) => query::cli::run_match(&cli.common, args)?,
            Commands::All(args) => query::cli::run_all(&cli.common, args)?,
            Commands::BuildSchema(args) => export::run(&cli.common, args)?,
            Commands::Serve(args) => server::run(&cli.common, args)?,
            Commands::Compress(args) => compress::run_compress(&cli.common, args)?,
            Commands::Decompress(args) => compress::run_decompress(&cli.common, args)?,
            Commands::RemoveUncompressedFiles(args) => {
                compress::run_remove_uncompressed(&cli.common, args)?
            }
            Commands::UpdateCompressedStatus(args) => {
                compress::run_update_status(&cli.common, args)?
            }
        }

        Ok::<(), anyhow::Error>(())
    })?;
    term.write_line(&format!("All done. Have a nice day!{}", Emoji(" 😃", "")))?;

    Ok(())
}
