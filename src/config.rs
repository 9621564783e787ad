//! Runtime configuration, materialized once by the front-ends and passed to
//! the catalog, record store, and planner explicitly.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default response byte budget (2 MiB).
pub const DEFAULT_RESPONSE_LIMIT: u64 = 2 * 1024 * 1024;
/// Default bound on `match` listings.
pub const DEFAULT_MATCH_LIMIT: u64 = 100;
/// Default number of records sampled for `count` estimates.
pub const DEFAULT_SAMPLE_LIMIT: usize = 500;
/// Default number of objects indexed in parallel by a build.
pub const DEFAULT_WORKERS: usize = 8;
/// Default idle timeout for continuation tokens (30 minutes).
pub const DEFAULT_CONT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Scoped configuration for one process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bucket holding the NDJSON shards.
    pub s3_bucket: String,
    /// Path of the SQLite database holding the catalog and index tables.
    pub database: PathBuf,
    /// Byte budget per query response.
    pub response_limit: u64,
    /// Maximal number of values returned by `match`.
    pub match_limit: u64,
    /// Number of records sampled for `count` estimates.
    pub sample_limit: usize,
    /// Maximal gap between slices that still get stitched into one read.
    pub stitch_gap: u64,
    /// Number of objects indexed in parallel.
    pub workers: usize,
    /// Idle timeout of continuation tokens.
    pub cont_timeout: Duration,
    /// Optional path of a GFF3 gene set for gene-name loci.
    pub genes_uri: Option<String>,
    /// Optional output path for `build-schema --save`.
    pub graphql_schema: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            s3_bucket: String::new(),
            database: PathBuf::from("bio.db"),
            response_limit: DEFAULT_RESPONSE_LIMIT,
            match_limit: DEFAULT_MATCH_LIMIT,
            sample_limit: DEFAULT_SAMPLE_LIMIT,
            stitch_gap: 0,
            workers: DEFAULT_WORKERS,
            cont_timeout: DEFAULT_CONT_TIMEOUT,
            genes_uri: None,
            graphql_schema: None,
        }
    }
}

impl Config {
    /// Materialize the configuration from the process environment.
    ///
    /// `S3_BUCKET` is required. The database defaults to `<BIO_SCHEMA>.db`
    /// (schema name `bio`) unless `BIOINDEX_DB` names an explicit path.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let s3_bucket = std::env::var("S3_BUCKET")
            .map_err(|_| anyhow::anyhow!("S3_BUCKET must be set"))?;
        let database = match std::env::var("BIOINDEX_DB") {
            Ok(path) => PathBuf::from(path),
            Err(_) => {
                let schema = std::env::var("BIO_SCHEMA").unwrap_or_else(|_| "bio".to_string());
                PathBuf::from(format!("{}.db", schema))
            }
        };

        Ok(Self {
            s3_bucket,
            database,
            response_limit: env_bytes("RESPONSE_LIMIT", DEFAULT_RESPONSE_LIMIT)?,
            match_limit: env_parse("MATCH_LIMIT", DEFAULT_MATCH_LIMIT)?,
            sample_limit: env_parse("SAMPLE_LIMIT", DEFAULT_SAMPLE_LIMIT)?,
            stitch_gap: env_parse("STITCH_GAP", 0)?,
            workers: env_parse("WORKERS", DEFAULT_WORKERS)?,
            cont_timeout: Duration::from_secs(env_parse(
                "CONT_TIMEOUT_SECS",
                DEFAULT_CONT_TIMEOUT.as_secs(),
            )?),
            genes_uri: std::env::var("GENES_URI").ok(),
            graphql_schema: std::env::var("GRAPHQL_SCHEMA").ok(),
        })
    }
}

/// Parse an optional environment variable, falling back to `default`.
fn env_parse<T>(key: &str, default: T) -> Result<T, anyhow::Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("could not parse {}={:?}: {}", key, value, e)),
        Err(_) => Ok(default),
    }
}

/// Parse a byte-size environment variable (`2MiB`, `2097152`, ...).
fn env_bytes(key: &str, default: u64) -> Result<u64, anyhow::Error> {
    match std::env::var(key) {
        Ok(value) => bytesize::ByteSize::from_str(&value)
            .map(|b| b.as_u64())
            .map_err(|e| anyhow::anyhow!("could not parse {}={:?}: {}", key, value, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let config = super::Config::default();

        assert_eq!(config.response_limit, 2 * 1024 * 1024);
        assert_eq!(config.match_limit, 100);
        assert_eq!(config.sample_limit, 500);
        assert_eq!(config.workers, 8);
        assert_eq!(config.stitch_gap, 0);
    }

    #[rstest::rstest]
    #[case("1024", 1024)]
    #[case("2MiB", 2 * 1024 * 1024)]
    fn parse_byte_sizes(#[case] text: &str, #[case] expected: u64) {
        let parsed: bytesize::ByteSize = text.parse().expect("parseable");
        assert_eq!(parsed.as_u64(), expected);
    }
}
