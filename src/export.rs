//! The `build-schema` sub command: emit the index descriptions consumed by
//! the GraphQL collaborator.

use std::io::Write;

use clap::Parser;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::index::IndexSpec;

/// Command line arguments for the `build-schema` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Emit index descriptions for the GraphQL layer", long_about = None)]
pub struct Args {
    /// Write to the configured GRAPHQL_SCHEMA path instead of stdout.
    #[arg(long, default_value_t = false)]
    pub save: bool,
    /// Write to an explicit output file.
    #[arg(long)]
    pub out: Option<std::path::PathBuf>,
}

/// JSON description of one index.
fn describe(spec: &IndexSpec) -> serde_json::Value {
    serde_json::json!({
        "name": spec.name,
        "schemaName": spec.schema_name,
        "prefix": spec.prefix,
        "schema": spec.schema.to_string(),
        "keys": spec.schema.key_parts().iter().map(|p| p.fields.clone()).collect::<Vec<_>>(),
        "locus": spec.schema.locus.as_ref().map(|l| l.to_string()),
        "built": spec.built,
        "compressed": spec.compressed,
    })
}

/// Main entry point for the `build-schema` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let config = Config::from_env()?;
    let catalog = Catalog::open(&config.database)?;
    let descriptions: Vec<serde_json::Value> = catalog.list()?.iter().map(describe).collect();
    let document = serde_json::json!({
        "version": crate::common::VERSION,
        "indexes": descriptions,
    });
    let rendered = serde_json::to_string_pretty(&document)?;

    let out_path = match (&args.out, args.save) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => Some(std::path::PathBuf::from(
            config.graphql_schema.as_deref().ok_or_else(|| {
                anyhow::anyhow!("--save requires GRAPHQL_SCHEMA to be configured")
            })?,
        )),
        (None, false) => None,
    };
    match out_path {
        Some(path) => {
            std::fs::write(&path, rendered)
                .map_err(|e| anyhow::anyhow!("could not write {:?}: {}", path, e))?;
            tracing::info!("wrote schema descriptions to {:?}", path);
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            writeln!(out, "{}", rendered)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::index::schema::KeySpec;
    use crate::index::IndexSpec;

    #[test]
    fn describe_index() {
        let spec = IndexSpec::new(
            "assoc",
            "Associations",
            "assoc/",
            KeySpec::parse("phenotype,chromosome:position").unwrap(),
        );

        let description = super::describe(&spec);

        assert_eq!(description["name"], "assoc");
        assert_eq!(description["schemaName"], "Associations");
        assert_eq!(description["schema"], "phenotype,chromosome:position");
        assert_eq!(description["keys"][0][0], "phenotype");
        assert_eq!(description["locus"], "chromosome:position");
        assert_eq!(description["built"], false);
    }
}
