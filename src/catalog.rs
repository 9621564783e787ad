//! The index catalog and the relational index tables.

use std::path::Path;

use itertools::Itertools;
use rusqlite::{params, Connection, OptionalExtension};

use crate::err::Error;
use crate::index::schema::KeySpec;
use crate::index::IndexSpec;

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quoted column name of the `i`-th key position.
pub fn key_column(i: usize) -> String {
    quote_ident(&format!("key{}", i))
}

const CATALOG_DDL: &str = "
CREATE TABLE IF NOT EXISTS indexes (
    name        TEXT PRIMARY KEY,
    schema_name TEXT NOT NULL,
    prefix      TEXT NOT NULL,
    schema      TEXT NOT NULL,
    table_name  TEXT NOT NULL,
    built       INTEGER NOT NULL DEFAULT 0,
    compressed  INTEGER NOT NULL DEFAULT 0,
    building    INTEGER NOT NULL DEFAULT 0,
    built_at    TEXT
);
";

/// Handle on the catalog database.
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Open (creating on demand) the catalog database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        let _mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.busy_timeout(std::time::Duration::from_secs(600))?;
        conn.execute_batch(CATALOG_DDL)?;
        Ok(Self { conn })
    }

    /// The underlying connection, for read-only statements.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// The underlying connection, for transactional writes.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Atomically replace the spec for `spec.name`, dropping any previous
    /// index table and recreating it empty.
    pub fn put(&mut self, spec: &IndexSpec) -> Result<(), Error> {
        let tx = self.conn.transaction()?;
        if let Some(prev) = get_in(&tx, &spec.name)? {
            tx.execute_batch(&format!(
                "DROP TABLE IF EXISTS {}",
                quote_ident(&prev.table_name)
            ))?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO indexes \
             (name, schema_name, prefix, schema, table_name, built, compressed, building, built_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, 0, NULL)",
            params![
                spec.name,
                spec.schema_name,
                spec.prefix,
                spec.schema.to_string(),
                spec.table_name,
                spec.compressed,
            ],
        )?;
        tx.execute_batch(&create_table_sql(spec))?;
        tx.commit()?;
        Ok(())
    }

    /// Look up an index by name.
    pub fn get(&self, name: &str) -> Result<IndexSpec, Error> {
        get_in(&self.conn, name)?.ok_or_else(|| Error::UnknownIndex(name.to_string()))
    }

    /// All indexes, ordered by name.
    pub fn list(&self) -> Result<Vec<IndexSpec>, Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM indexes ORDER BY name")?;
        let specs = stmt
            .query_map([], spec_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(specs)
    }

    /// Remove an index and its table.
    pub fn drop(&mut self, name: &str) -> Result<(), Error> {
        let spec = self.get(name)?;
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM indexes WHERE name = ?1", params![name])?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {}",
            quote_ident(&spec.table_name)
        ))?;
        tx.commit()?;
        Ok(())
    }

    /// Flag an index as (not) cleanly built.
    pub fn set_built(&self, name: &str, built: bool) -> Result<(), Error> {
        let built_at = built.then(|| chrono::Utc::now().to_rfc3339());
        let changed = self.conn.execute(
            "UPDATE indexes SET built = ?2, built_at = ?3 WHERE name = ?1",
            params![name, built, built_at],
        )?;
        if changed == 0 {
            return Err(Error::UnknownIndex(name.to_string()));
        }
        Ok(())
    }

    /// Flag an index as (not) BGZF-compressed.
    pub fn set_compressed(&self, name: &str, compressed: bool) -> Result<(), Error> {
        let changed = self.conn.execute(
            "UPDATE indexes SET compressed = ?2 WHERE name = ?1",
            params![name, compressed],
        )?;
        if changed == 0 {
            return Err(Error::UnknownIndex(name.to_string()));
        }
        Ok(())
    }

    /// Take the build lock of an index; two builds of the same index must
    /// not run concurrently. `force` clears a stale lock.
    pub fn lock_build(&self, name: &str, force: bool) -> Result<(), Error> {
        self.get(name)?;
        let sql = if force {
            "UPDATE indexes SET building = 1 WHERE name = ?1"
        } else {
            "UPDATE indexes SET building = 1 WHERE name = ?1 AND building = 0"
        };
        let changed = self.conn.execute(sql, params![name])?;
        if changed == 0 {
            return Err(Error::BuildFailed(format!(
                "another build of {} is in progress (use --force to override)",
                name
            )));
        }
        Ok(())
    }

    /// Release the build lock of an index.
    pub fn unlock_build(&self, name: &str) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE indexes SET building = 0 WHERE name = ?1",
            params![name],
        )?;
        Ok(())
    }
}

fn get_in(conn: &Connection, name: &str) -> Result<Option<IndexSpec>, Error> {
    let spec = conn
        .query_row(
            "SELECT * FROM indexes WHERE name = ?1",
            params![name],
            spec_from_row,
        )
        .optional()?;
    Ok(spec)
}

fn spec_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexSpec> {
    let name: String = row.get("name")?;
    let schema_text: String = row.get("schema")?;
    let schema = KeySpec::parse(&schema_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("index {}: {}", name, e).into(),
        )
    })?;
    let built_at: Option<String> = row.get("built_at")?;
    Ok(IndexSpec {
        name,
        schema_name: row.get("schema_name")?,
        prefix: row.get("prefix")?,
        schema,
        table_name: row.get("table_name")?,
        built: row.get("built")?,
        compressed: row.get("compressed")?,
        built_at: built_at.and_then(|t| {
            chrono::DateTime::parse_from_rfc3339(&t)
                .ok()
                .map(|t| t.with_timezone(&chrono::Utc))
        }),
    })
}

/// Quoted columns of an index table, in DDL/insertion order.
pub fn row_columns(spec: &IndexSpec) -> Vec<String> {
    let n_keys = spec.schema.key_parts().len();
    let mut cols: Vec<String> = (0..n_keys).map(key_column).collect();
    if spec.schema.is_locus() {
        cols.push("\"chrom\"".to_string());
        cols.push("\"begin\"".to_string());
        cols.push("\"end\"".to_string());
    }
    cols.push("\"object\"".to_string());
    cols.push("\"start_offset\"".to_string());
    cols.push("\"end_offset\"".to_string());
    cols
}

/// DDL of the index table and its two B-tree indexes.
fn create_table_sql(spec: &IndexSpec) -> String {
    let table = quote_ident(&spec.table_name);
    let n_keys = spec.schema.key_parts().len();
    let key_cols = (0..n_keys).map(key_column).collect_vec();

    let mut columns = key_cols
        .iter()
        .map(|c| format!("{} TEXT NOT NULL", c))
        .collect_vec();
    if spec.schema.is_locus() {
        columns.push("\"chrom\" TEXT NOT NULL".to_string());
        columns.push("\"begin\" INTEGER NOT NULL".to_string());
        columns.push("\"end\" INTEGER NOT NULL".to_string());
    }
    columns.push("\"object\" TEXT NOT NULL".to_string());
    columns.push("\"start_offset\" INTEGER NOT NULL".to_string());
    columns.push("\"end_offset\" INTEGER NOT NULL".to_string());

    let mut sql = format!(
        "DROP TABLE IF EXISTS {table};\nCREATE TABLE {table} ({});\n",
        columns.join(", "),
        table = table,
    );
    // composite lookup index over (keys, chrom, end) for locus predicates
    if spec.schema.is_locus() {
        let lookup_cols = key_cols
            .iter()
            .cloned()
            .chain(["\"chrom\"".to_string(), "\"end\"".to_string()])
            .join(", ");
        sql.push_str(&format!(
            "CREATE INDEX {} ON {} ({});\n",
            quote_ident(&format!("{}__lookup", spec.table_name)),
            table,
            lookup_cols,
        ));
    }
    // keys-only index for prefix-match listings
    if n_keys > 0 {
        sql.push_str(&format!(
            "CREATE INDEX {} ON {} ({});\n",
            quote_ident(&format!("{}__keys", spec.table_name)),
            table,
            key_cols.iter().join(", "),
        ));
    }
    sql
}
