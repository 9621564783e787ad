//! BGZF lifecycle sub commands: `compress`, `decompress`,
//! `remove-uncompressed-files`, and `update-compressed-status`.

use clap::Parser;
use thousands::Separable;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::store::{bgzf, BlobStore, S3Blobs};

/// Command line arguments for the `compress` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Compress the shards of an index to BGZF", long_about = None)]
pub struct CompressArgs {
    /// Index whose shards to compress.
    pub index: String,
    /// S3 prefix to process; must fall under the index's prefix.
    pub path: String,
}

/// Command line arguments for the `decompress` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Restore plain shards from their BGZF copies", long_about = None)]
pub struct DecompressArgs {
    /// Index whose shards to restore.
    pub index: String,
    /// S3 prefix to process; must fall under the index's prefix.
    pub path: String,
}

/// Command line arguments for the `remove-uncompressed-files` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Delete the plain shards of a compressed index", long_about = None)]
pub struct RemoveArgs {
    /// Index whose plain shards to delete.
    pub index: String,
    /// S3 prefix to process; must fall under the index's prefix.
    pub path: String,
}

/// Command line arguments for the `update-compressed-status` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Flip the compressed flag of an index", long_about = None)]
pub struct StatusArgs {
    /// Index to update.
    pub index: String,
    /// S3 prefix the change refers to; must fall under the index's prefix.
    pub path: String,
    /// Mark the index as BGZF-compressed.
    #[arg(short = 'c', long = "compress", default_value_t = false)]
    pub compress: bool,
    /// Mark the index as uncompressed.
    #[arg(long = "no-compress", default_value_t = false)]
    pub no_compress: bool,
}

/// Resolve and validate the prefix a lifecycle verb operates on.
fn resolve_prefix(catalog: &Catalog, index: &str, path: &str) -> Result<String, anyhow::Error> {
    let spec = catalog.get(index)?;
    if path.is_empty() || path == "/" {
        return Ok(spec.prefix);
    }
    let path = if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    };
    if !path.starts_with(&spec.prefix) {
        anyhow::bail!(
            "path {:?} is outside the prefix {:?} of index {}",
            path,
            spec.prefix,
            index
        );
    }
    Ok(path)
}

async fn open_blobs(config: &Config) -> Result<S3Blobs, anyhow::Error> {
    let client = crate::common::s3::client_from_env().await?;
    Ok(S3Blobs::new(client, config.s3_bucket.clone()))
}

fn is_plain(key: &str) -> bool {
    !key.ends_with(".gz") && !key.ends_with(".gzi")
}

/// Main entry point for the `compress` sub command.
pub fn run_compress(
    args_common: &crate::common::Args,
    args: &CompressArgs,
) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let config = Config::from_env()?;
    let catalog = Catalog::open(&config.database)?;
    let prefix = resolve_prefix(&catalog, &args.index, &args.path)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let blobs = open_blobs(&config).await?;
        let objects = blobs.list(&prefix).await?;
        let staging = tempfile::tempdir()
            .map_err(|e| anyhow::anyhow!("could not create staging directory: {}", e))?;

        let mut compressed = 0u64;
        for object in objects.iter().filter(|o| is_plain(&o.key)) {
            let plain = staging.path().join("shard");
            let packed = staging.path().join("shard.gz");
            blobs.download(&object.key, &plain).await?;
            let gzi = bgzf::compress_file(&plain, &packed)?;
            let gz_key = format!("{}.gz", object.key);
            blobs.put_file(&gz_key, &packed).await?;
            blobs
                .put_bytes(&bgzf::gzi_key(&gz_key), gzi.to_bytes())
                .await?;
            tracing::debug!("compressed {} ({} bytes)", object.key, object.size);
            compressed += 1;
        }
        tracing::info!(
            "compressed {} object(s) under {}",
            compressed.separate_with_commas(),
            prefix
        );
        Ok::<(), anyhow::Error>(())
    })
}

/// Main entry point for the `decompress` sub command.
pub fn run_decompress(
    args_common: &crate::common::Args,
    args: &DecompressArgs,
) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let config = Config::from_env()?;
    let catalog = Catalog::open(&config.database)?;
    let prefix = resolve_prefix(&catalog, &args.index, &args.path)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let blobs = open_blobs(&config).await?;
        let objects = blobs.list(&prefix).await?;
        let staging = tempfile::tempdir()
            .map_err(|e| anyhow::anyhow!("could not create staging directory: {}", e))?;

        let mut restored = 0u64;
        for object in objects.iter().filter(|o| o.key.ends_with(".gz")) {
            let packed = staging.path().join("shard.gz");
            let plain = staging.path().join("shard");
            blobs.download(&object.key, &packed).await?;
            bgzf::decompress_file(&packed, &plain)?;
            let plain_key = object.key.trim_end_matches(".gz");
            blobs.put_file(plain_key, &plain).await?;
            restored += 1;
        }
        tracing::info!(
            "restored {} object(s) under {}",
            restored.separate_with_commas(),
            prefix
        );
        Ok::<(), anyhow::Error>(())
    })
}

/// Main entry point for the `remove-uncompressed-files` sub command.
pub fn run_remove_uncompressed(
    args_common: &crate::common::Args,
    args: &RemoveArgs,
) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let config = Config::from_env()?;
    let catalog = Catalog::open(&config.database)?;
    let spec = catalog.get(&args.index)?;
    if !spec.compressed {
        anyhow::bail!(
            "index {} is not marked compressed; refusing to delete its shards",
            args.index
        );
    }
    let prefix = resolve_prefix(&catalog, &args.index, &args.path)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let blobs = open_blobs(&config).await?;
        let objects = blobs.list(&prefix).await?;
        let mut removed = 0u64;
        for object in objects.iter().filter(|o| is_plain(&o.key)) {
            blobs.delete(&object.key).await?;
            removed += 1;
        }
        tracing::info!(
            "removed {} uncompressed object(s) under {}",
            removed.separate_with_commas(),
            prefix
        );
        Ok::<(), anyhow::Error>(())
    })
}

/// Main entry point for the `update-compressed-status` sub command.
pub fn run_update_status(
    args_common: &crate::common::Args,
    args: &StatusArgs,
) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    if args.compress == args.no_compress {
        anyhow::bail!("pass exactly one of -c/--compress or --no-compress");
    }
    let config = Config::from_env()?;
    let catalog = Catalog::open(&config.database)?;
    resolve_prefix(&catalog, &args.index, &args.path)?;
    catalog.set_compressed(&args.index, args.compress)?;
    tracing::info!(
        "index {} marked compressed = {}",
        args.index,
        args.compress
    );
    Ok(())
}
