//! The `create` sub command: declare or replace an index.

use clap::Parser;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::index::schema::KeySpec;
use crate::index::IndexSpec;

/// Command line arguments for the `create` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Create or replace an index definition", long_about = None)]
pub struct Args {
    /// Name of the index.
    pub name: String,
    /// S3 key prefix the index covers (a trailing `/` is added when missing).
    pub prefix: String,
    /// Textual key schema, e.g. `phenotype,chromosome:position`.
    pub schema: String,
    /// Schema name exposed to the GraphQL layer; defaults to the index name.
    #[arg(long)]
    pub schema_name: Option<String>,
}

/// Main entry point for the `create` sub command.
///
/// Replaces any existing index of the same name and drops its table, so the
/// next build starts from empty.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let config = Config::from_env()?;
    let key_spec = KeySpec::parse(&args.schema)?;
    let schema_name = args.schema_name.as_deref().unwrap_or(&args.name);
    let spec = IndexSpec::new(&args.name, schema_name, &args.prefix, key_spec);

    let mut catalog = Catalog::open(&config.database)?;
    catalog.put(&spec)?;
    tracing::info!(
        "created index {} over {} with schema {}",
        spec.name,
        spec.prefix,
        spec.schema
    );

    Ok(())
}
