//! Approximate record counts and key-prefix listings.

use crate::catalog::{quote_ident, Catalog};
use crate::config::Config;
use crate::err::Error;
use crate::index::locus::Locus;
use crate::store::split_lines;

use super::Engine;

/// Cap on the bytes fetched while sampling records for a count estimate.
const SAMPLE_BYTES: u64 = 1 << 18;

impl<'a> Engine<'a> {
    /// Approximate number of records matching a query.
    ///
    /// Samples up to `config.sample_limit` records from the leading slices
    /// for a mean record size and estimates `total_bytes / mean`; exact when
    /// the sample covered every matching byte.
    pub async fn count(
        &self,
        index: &str,
        keys: Vec<String>,
        locus: Option<Locus>,
    ) -> Result<u64, Error> {
        let (spec, cursor) = self.plan(index, keys, locus, Vec::new())?;
        if cursor.bytes_total == 0 {
            return Ok(0);
        }

        let mut sampled_records: u64 = 0;
        let mut sampled_bytes: u64 = 0;
        let mut fetched: u64 = 0;
        let mut exhausted = true;
        for slice in &cursor.slices {
            let budget_left = SAMPLE_BYTES.saturating_sub(fetched);
            if budget_left == 0 || sampled_records >= self.config.sample_limit as u64 {
                exhausted = false;
                break;
            }
            let take_end = slice.end.min(slice.start + budget_left);
            let bytes = self
                .store
                .read(&slice.object, slice.start, take_end, spec.compressed)
                .await?;
            let at_end = take_end == slice.end;
            let (lines, consumed_to) = split_lines(slice.start, &bytes, at_end);
            sampled_records += lines.len() as u64;
            sampled_bytes += consumed_to - slice.start;
            fetched += bytes.len() as u64;
            if !at_end {
                exhausted = false;
                break;
            }
        }

        if exhausted {
            // every matching byte was read; the count is exact
            return Ok(sampled_records);
        }
        if sampled_records == 0 {
            return Ok(0);
        }
        let mean = sampled_bytes as f64 / sampled_records as f64;
        Ok((cursor.bytes_total as f64 / mean).round() as u64)
    }
}

/// Distinct values of the first key part beginning with `prefix`, in
/// lexicographic order, bounded by `config.match_limit`.
pub fn match_keys(
    catalog: &Catalog,
    config: &Config,
    index: &str,
    prefix: &str,
) -> Result<Vec<String>, Error> {
    let spec = catalog.get(index)?;
    if spec.schema.key_parts().is_empty() {
        return Ok(Vec::new());
    }
    let table = quote_ident(&spec.table_name);
    let escaped = prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    let sql = format!(
        "SELECT DISTINCT \"key0\" FROM {} WHERE \"key0\" LIKE ?1 ESCAPE '\\' \
         ORDER BY \"key0\" LIMIT ?2",
        table
    );
    let mut stmt = catalog.conn().prepare(&sql)?;
    let values = stmt
        .query_map(
            rusqlite::params![format!("{}%", escaped), config.match_limit as i64],
            |row| row.get(0),
        )?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(values)
}
