//! Code supporting the `serve` sub command.

use std::sync::Arc;

use actix_web::web::Data;
use clap::Parser;
use tracing::info;

use crate::config::Config;
use crate::index::locus::{GeneResolver, GffGeneResolver};
use crate::query::cont::Continuations;
use crate::store::{RecordStore, S3Blobs};

pub mod rest;

/// Shared state of the REST server.
///
/// Continuation tokens live here, in process memory: all server workers of
/// one process share them, and a deployment must route continuation
/// follow-ups to the same process.
pub struct WebServerData {
    pub config: Config,
    pub store: Arc<RecordStore>,
    pub continuations: Continuations,
    pub resolver: Option<Box<dyn GeneResolver>>,
}

/// Command line arguments for the `serve` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run the REST API server", long_about = None)]
pub struct Args {
    /// IP to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_host: String,
    /// Port to listen on.
    #[arg(long, default_value_t = 5000)]
    pub port: u16,
}

/// Main entry point for the `serve` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    info!("args_common = {:?}", &args_common);
    info!("args = {:?}", &args);

    let config = Config::from_env()?;
    // resolve the S3 client and catalog eagerly so misconfiguration fails
    // at startup rather than on the first request
    let client = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(crate::common::s3::client_from_env())?;
    let store = Arc::new(RecordStore::new(Arc::new(S3Blobs::new(
        client,
        config.s3_bucket.clone(),
    ))));
    crate::catalog::Catalog::open(&config.database)?;

    let resolver: Option<Box<dyn GeneResolver>> = config
        .genes_uri
        .clone()
        .map(|uri| Box::new(GffGeneResolver::new(uri)) as Box<dyn GeneResolver>);
    let data = Data::new(WebServerData {
        continuations: Continuations::new(config.cont_timeout),
        config,
        store,
        resolver,
    });

    info!(
        "Launching server main on http://{}:{} ...",
        args.listen_host, args.port
    );
    rest::main(args, data)?;

    Ok(())
}
