//! Query planning and budgeted streaming execution.

pub mod cli;
pub mod cont;
pub mod stats;

use std::collections::VecDeque;
use std::time::Instant;

use serde_json::Value;

use crate::catalog::{key_column, quote_ident, row_columns, Catalog};
use crate::config::Config;
use crate::err::Error;
use crate::index::locus::{parse_locus, GeneResolver, Locus};
use crate::index::{key_value_string, record_locus, IndexSpec};
use crate::store::{split_lines, RecordStore};

/// Upper bound on the bytes fetched per ranged read while streaming.
const READ_CHUNK: u64 = 1 << 18;

/// A ranged read against one shard.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Slice {
    pub object: String,
    pub start: u64,
    pub end: u64,
}

/// The predicate a query carries: one value per key part plus an optional
/// query region.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Filter {
    pub keys: Vec<String>,
    pub locus: Option<Locus>,
}

/// Cursor of an in-progress query; everything needed to resume streaming.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Cursor {
    pub index: String,
    /// Residual slices; the front one starts at the next unread line.
    pub slices: VecDeque<Slice>,
    /// `None` streams everything (the `all` verb).
    pub filter: Option<Filter>,
    /// Residual record limit, if the caller set one.
    pub limit: Option<u64>,
    pub page: u32,
    pub bytes_total: u64,
    pub bytes_read: u64,
    /// The raw query values, echoed back in responses.
    pub q: Vec<String>,
}

/// One page of streamed results.
#[derive(Debug)]
pub struct Page {
    pub records: Vec<Value>,
    /// Whether the cursor is exhausted (no continuation needed).
    pub done: bool,
    pub fetch_seconds: f64,
}

/// Query engine facade over the catalog and the record store.
pub struct Engine<'a> {
    pub config: &'a Config,
    pub catalog: &'a Catalog,
    pub store: &'a RecordStore,
}

impl<'a> Engine<'a> {
    /// Compile a query into an initial cursor.
    ///
    /// Exactly one value per key part must be provided; the locus is
    /// optional and only allowed on locus indexes.
    pub fn plan(
        &self,
        index: &str,
        keys: Vec<String>,
        locus: Option<Locus>,
        q: Vec<String>,
    ) -> Result<(IndexSpec, Cursor), Error> {
        let spec = self.catalog.get(index)?;
        let arity = spec.schema.arity();
        if keys.len() != arity {
            return Err(Error::ArityMismatch {
                expected: arity,
                actual: keys.len(),
            });
        }
        if locus.is_some() && !spec.schema.is_locus() {
            return Err(Error::InvalidLocus(format!(
                "index {} has no locus",
                index
            )));
        }
        let filter = Filter { keys, locus };
        let slices = self.select_slices(&spec, Some(&filter))?;
        let cursor = self.cursor_for(index, slices, Some(filter), q);
        Ok((spec, cursor))
    }

    /// Compile a cursor streaming every record of the index.
    pub fn plan_all(&self, index: &str) -> Result<(IndexSpec, Cursor), Error> {
        let spec = self.catalog.get(index)?;
        let slices = self.select_slices(&spec, None)?;
        let cursor = self.cursor_for(index, slices, None, Vec::new());
        Ok((spec, cursor))
    }

    fn cursor_for(
        &self,
        index: &str,
        slices: Vec<Slice>,
        filter: Option<Filter>,
        q: Vec<String>,
    ) -> Cursor {
        let slices = coalesce(slices, self.config.stitch_gap);
        let bytes_total = slices.iter().map(|s| s.end - s.start).sum();
        Cursor {
            index: index.to_string(),
            slices,
            filter,
            limit: None,
            page: 0,
            bytes_total,
            bytes_read: 0,
            q,
        }
    }

    /// Select the matching index rows as ordered slices.
    pub(crate) fn select_slices(
        &self,
        spec: &IndexSpec,
        filter: Option<&Filter>,
    ) -> Result<Vec<Slice>, Error> {
        let table = quote_ident(&spec.table_name);
        let mut sql = format!(
            "SELECT DISTINCT {} FROM {}",
            row_columns(spec).join(", "),
            table
        );

        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        let mut predicates: Vec<String> = Vec::new();
        if let Some(filter) = filter {
            for (i, key) in filter.keys.iter().enumerate() {
                predicates.push(format!("{} = ?{}", key_column(i), values.len() + 1));
                values.push(key.clone().into());
            }
            if let Some(region) = &filter.locus {
                predicates.push(format!("\"chrom\" = ?{}", values.len() + 1));
                values.push(region.chrom.clone().into());
                predicates.push(format!(
                    "NOT (\"end\" <= ?{} OR \"begin\" >= ?{})",
                    values.len() + 1,
                    values.len() + 2
                ));
                values.push((region.start as i64).into());
                values.push((region.end as i64).into());
            }
        }
        if !predicates.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicates.join(" AND "));
        }

        let mut order: Vec<String> = (0..spec.schema.key_parts().len()).map(key_column).collect();
        if spec.schema.is_locus() {
            order.push("\"chrom\"".to_string());
            order.push("\"begin\"".to_string());
        }
        order.push("\"object\"".to_string());
        order.push("\"start_offset\"".to_string());
        sql.push_str(&format!(" ORDER BY {}", order.join(", ")));

        let mut stmt = self.catalog.conn().prepare(&sql)?;
        let slices = stmt
            .query_map(rusqlite::params_from_iter(values), |row| {
                Ok(Slice {
                    object: row.get("object")?,
                    start: row.get::<_, i64>("start_offset")? as u64,
                    end: row.get::<_, i64>("end_offset")? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(slices)
    }

    /// Stream the next page from `cursor`, honoring the byte budget.
    ///
    /// Reading stops at the next line boundary once the budget is exhausted
    /// and at least one record was emitted, so that following continuations
    /// to the end yields every matching record exactly once.
    pub async fn fetch_page(
        &self,
        spec: &IndexSpec,
        cursor: &mut Cursor,
    ) -> Result<Page, Error> {
        let started = Instant::now();
        let budget = self.config.response_limit;
        let chunk_size = self.config.response_limit.clamp(1, READ_CHUNK);
        let mut records = Vec::new();
        let mut page_bytes: u64 = 0;
        let mut limit_hit = false;
        if cursor.limit == Some(0) {
            cursor.slices.clear();
        }

        'stream: while !cursor.slices.is_empty() {
            let slice = cursor.slices[0].clone();
            // grow the chunk until it contains at least one complete line
            let mut chunk_end = (slice.start + chunk_size).min(slice.end);
            let (bytes, at_end) = loop {
                let bytes = self
                    .store
                    .read(&slice.object, slice.start, chunk_end, spec.compressed)
                    .await?;
                let at_end = chunk_end == slice.end;
                if at_end || bytes.contains(&b'\n') {
                    break (bytes, at_end);
                }
                chunk_end = (chunk_end + chunk_size).min(slice.end);
            };
            page_bytes += bytes.len() as u64;

            let (lines, next_start) = split_lines(slice.start, &bytes, at_end);
            // progress counts consumed bytes; a partial trailing line rolls
            // into the next chunk
            cursor.bytes_read += next_start - slice.start;
            for (offset, line) in lines {
                if line.is_empty() {
                    continue;
                }
                let record: Value =
                    serde_json::from_slice(line).map_err(|e| Error::CorruptShard {
                        object: slice.object.clone(),
                        reason: format!("invalid JSON at byte {}: {}", offset, e),
                    })?;
                if record_matches(spec, cursor.filter.as_ref(), &record) {
                    records.push(record);
                    if let Some(limit) = cursor.limit.as_mut() {
                        *limit -= 1;
                        if *limit == 0 {
                            limit_hit = true;
                            break;
                        }
                    }
                }
            }

            if limit_hit {
                cursor.slices.clear();
                break;
            }
            if next_start >= slice.end {
                cursor.slices.pop_front();
            } else {
                cursor.slices[0].start = next_start;
            }
            if page_bytes >= budget && !records.is_empty() && !cursor.slices.is_empty() {
                break 'stream;
            }
        }

        cursor.page += 1;
        Ok(Page {
            records,
            done: cursor.slices.is_empty(),
            fetch_seconds: started.elapsed().as_secs_f64(),
        })
    }
}

/// Merge sort-adjacent slices of the same object whose byte ranges touch
/// (or sit within `gap` bytes of each other), minimizing ranged-GET count.
pub fn coalesce(slices: Vec<Slice>, gap: u64) -> VecDeque<Slice> {
    let mut out: VecDeque<Slice> = VecDeque::new();
    for slice in slices {
        if let Some(last) = out.back_mut() {
            if last.object == slice.object
                && slice.start >= last.start
                && slice.start <= last.end + gap
            {
                last.end = last.end.max(slice.end);
                continue;
            }
        }
        out.push_back(slice);
    }
    out
}

/// Re-verify a streamed record against the filter: exact key equality (any
/// interchangeable alternative may match) and locus overlap.
pub fn record_matches(spec: &IndexSpec, filter: Option<&Filter>, record: &Value) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let parts = spec.schema.key_parts();
    for (part, want) in parts.iter().zip(&filter.keys) {
        let found = part.fields.iter().any(|field| {
            record
                .get(field)
                .map_or(false, |v| !v.is_null() && key_value_string(v) == *want)
        });
        if !found {
            return false;
        }
    }
    if let Some(region) = &filter.locus {
        let Some(part) = &spec.schema.locus else {
            return false;
        };
        match record_locus(record, part) {
            Some(locus) if locus.overlaps(region) => {}
            _ => return false,
        }
    }
    true
}

/// Split raw query values into keys and an optional trailing locus per the
/// schema's arity.
pub fn parse_query_args(
    spec: &IndexSpec,
    raw: &[String],
    resolver: Option<&dyn GeneResolver>,
) -> Result<(Vec<String>, Option<Locus>), Error> {
    let arity = spec.schema.arity();
    let keys = if raw.len() == arity {
        (raw.to_vec(), None)
    } else if raw.len() == arity + 1 && spec.schema.is_locus() {
        let locus = parse_locus(&raw[arity], resolver)?;
        (raw[..arity].to_vec(), Some(locus))
    } else {
        return Err(Error::ArityMismatch {
            expected: arity,
            actual: raw.len(),
        });
    };
    if let Some(i) = keys.0.iter().position(|k| k.is_empty()) {
        return Err(Error::MissingKey(spec.schema.key_parts()[i].to_string()));
    }
    Ok(keys)
}


#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::test_support::{build_fixture, drain};
    use super::{coalesce, Engine, Slice};
    use crate::err::Error;

    #[test]
    fn coalesce_merges_adjacent_slices() {
        let slices = vec![
            Slice {
                object: "a".into(),
                start: 0,
                end: 10,
            },
            Slice {
                object: "a".into(),
                start: 10,
                end: 30,
            },
            Slice {
                object: "a".into(),
                start: 40,
                end: 50,
            },
            Slice {
                object: "b".into(),
                start: 50,
                end: 60,
            },
        ];

        let merged: Vec<Slice> = coalesce(slices, 0).into_iter().collect();
        assert_eq!(
            merged,
            vec![
                Slice {
                    object: "a".into(),
                    start: 0,
                    end: 30
                },
                Slice {
                    object: "a".into(),
                    start: 40,
                    end: 50
                },
                Slice {
                    object: "b".into(),
                    start: 50,
                    end: 60
                },
            ]
        );
    }

    #[test]
    fn coalesce_spans_small_gaps() {
        let slices = vec![
            Slice {
                object: "a".into(),
                start: 0,
                end: 10,
            },
            Slice {
                object: "a".into(),
                start: 12,
                end: 20,
            },
        ];

        assert_eq!(coalesce(slices.clone(), 4).len(), 1);
        assert_eq!(coalesce(slices, 0).len(), 2);
    }

    #[test]
    fn coalesce_keeps_rewinds_apart() {
        // a later key group may revisit earlier offsets of the same object
        let slices = vec![
            Slice {
                object: "a".into(),
                start: 100,
                end: 200,
            },
            Slice {
                object: "a".into(),
                start: 0,
                end: 50,
            },
        ];

        assert_eq!(coalesce(slices, 0).len(), 2);
    }

    #[test]
    fn scenario_a_exact_index() {
        let fixture = build_fixture(
            "varId",
            &[(
                "t/chr8.json",
                &[
                    r#"{"varId":"8:1:A:T","beta":0.1}"#,
                    r#"{"varId":"8:2:C:G","beta":0.2}"#,
                ][..],
            )],
        );

        let records = drain(&fixture, &["8:1:A:T"], None);
        assert_eq!(records, vec![json!({"varId": "8:1:A:T", "beta": 0.1})]);

        assert!(drain(&fixture, &["8:9:T:A"], None).is_empty());
    }

    #[test]
    fn scenario_b_key_and_region() {
        let fixture = build_fixture(
            "phenotype,chromosome:position",
            &[(
                "t/chr8.json",
                &[
                    r#"{"phenotype":"BMI","chromosome":"8","position":150}"#,
                    r#"{"phenotype":"T2D","chromosome":"8","position":100}"#,
                    r#"{"phenotype":"T2D","chromosome":"8","position":200}"#,
                ][..],
            )],
        );

        let records = drain(&fixture, &["T2D"], Some("8:50-150"));
        assert_eq!(
            records,
            vec![json!({"phenotype": "T2D", "chromosome": "8", "position": 100})]
        );
    }

    #[test]
    fn scenario_c_overlapping_ranges() {
        let fixture = build_fixture(
            "phenotype,chromosome:start-end",
            &[(
                "t/chr8.json",
                &[r#"{"phenotype":"T2D","chromosome":"8","start":100,"end":300}"#][..],
            )],
        );

        assert_eq!(drain(&fixture, &["T2D"], Some("8:200-250")).len(), 1);
        assert!(drain(&fixture, &["T2D"], Some("8:400-500")).is_empty());
    }

    #[test]
    fn scenario_d_continuation_chain() {
        let lines: Vec<String> = (0..50)
            .map(|i| format!(r#"{{"phenotype":"T2D","chromosome":"8","position":{}}}"#, 1000 + i * 10))
            .collect();
        let line_refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let mut fixture = build_fixture(
            "phenotype,chromosome:position",
            &[("t/chr8.json", &line_refs[..])],
        );
        let unbounded = drain(&fixture, &["T2D"], None);
        assert_eq!(unbounded.len(), 50);

        // budget smaller than the total matching bytes: multiple pages, no
        // record lost or duplicated, order preserved
        fixture.config.response_limit = 200;
        let catalog = fixture.catalog();
        let engine = Engine {
            config: &fixture.config,
            catalog: &catalog,
            store: &fixture.store,
        };
        let (spec, mut cursor) = engine
            .plan(
                "idx",
                vec!["T2D".to_string()],
                None,
                vec!["T2D".to_string()],
            )
            .unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut pages = 0;
        let mut chained = Vec::new();
        runtime.block_on(async {
            loop {
                let page = engine.fetch_page(&spec, &mut cursor).await.unwrap();
                assert!(!page.records.is_empty());
                chained.extend(page.records);
                pages += 1;
                if page.done {
                    break;
                }
            }
        });

        assert!(pages > 1, "expected a truncated response");
        assert_eq!(chained, unbounded);
        assert_eq!(cursor.bytes_read, cursor.bytes_total);
    }

    #[test]
    fn record_limit_stops_early() {
        let lines: Vec<String> = (0..20)
            .map(|i| format!(r#"{{"varId":"8:{}:A:T"}}"#, i))
            .collect();
        let line_refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let fixture = build_fixture("varId", &[("t/chr8.json", &line_refs[..])]);

        let catalog = fixture.catalog();
        let engine = Engine {
            config: &fixture.config,
            catalog: &catalog,
            store: &fixture.store,
        };
        let (spec, mut cursor) = engine.plan_all("idx").unwrap();
        cursor.limit = Some(5);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let page = runtime
            .block_on(engine.fetch_page(&spec, &mut cursor))
            .unwrap();

        assert_eq!(page.records.len(), 5);
        assert!(page.done);
    }

    #[test]
    fn interchangeable_keys_match_either_value() {
        let fixture = build_fixture(
            "gene|ensemblId",
            &[(
                "t/genes.json",
                &[
                    r#"{"gene":"SLC30A8","ensemblId":"ENSG00000164756"}"#,
                    r#"{"gene":"TCF7L2","ensemblId":null}"#,
                ][..],
            )],
        );

        // both alternatives of the first record reach it
        assert_eq!(drain(&fixture, &["SLC30A8"], None).len(), 1);
        assert_eq!(drain(&fixture, &["ENSG00000164756"], None).len(), 1);
        // null alternative still finds the record by the other key
        assert_eq!(drain(&fixture, &["TCF7L2"], None).len(), 1);
    }

    #[test]
    fn all_streams_everything_in_order() {
        let fixture = build_fixture(
            "phenotype,chromosome:position",
            &[
                (
                    "t/part-1.json",
                    &[
                        r#"{"phenotype":"BMI","chromosome":"8","position":10}"#,
                        r#"{"phenotype":"T2D","chromosome":"8","position":20}"#,
                    ][..],
                ),
                (
                    "t/part-2.json",
                    &[r#"{"phenotype":"LDL","chromosome":"1","position":5}"#][..],
                ),
            ],
        );

        let catalog = fixture.catalog();
        let engine = Engine {
            config: &fixture.config,
            catalog: &catalog,
            store: &fixture.store,
        };
        let (spec, mut cursor) = engine.plan_all("idx").unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let page = runtime
            .block_on(engine.fetch_page(&spec, &mut cursor))
            .unwrap();

        let phenotypes: Vec<String> = page
            .records
            .iter()
            .map(|r| r["phenotype"].as_str().unwrap().to_string())
            .collect();
        // ordered by key tuple first
        assert_eq!(phenotypes, vec!["BMI", "LDL", "T2D"]);
    }

    #[test]
    fn arity_and_locus_validation() {
        let fixture = build_fixture(
            "phenotype,chromosome:position",
            &[(
                "t/chr8.json",
                &[r#"{"phenotype":"T2D","chromosome":"8","position":1}"#][..],
            )],
        );
        let catalog = fixture.catalog();
        let engine = Engine {
            config: &fixture.config,
            catalog: &catalog,
            store: &fixture.store,
        };

        assert!(matches!(
            engine.plan("idx", vec![], None, vec![]),
            Err(Error::ArityMismatch {
                expected: 1,
                actual: 0
            })
        ));
        assert!(matches!(
            engine.plan("nope", vec!["T2D".into()], None, vec![]),
            Err(Error::UnknownIndex(_))
        ));
    }

    #[test]
    fn scenario_f_compressed_index_returns_identical_records() {
        use std::sync::Arc;

        use crate::catalog::Catalog;
        use crate::config::Config;
        use crate::index::schema::KeySpec;
        use crate::index::IndexSpec;
        use crate::store::{bgzf, mem::MemBlobs, RecordStore};

        let lines: Vec<String> = (0..200)
            .map(|i| {
                format!(
                    r#"{{"phenotype":"T2D","chromosome":"8","position":{}}}"#,
                    100 + i
                )
            })
            .collect();
        let line_refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();

        // reference results from a plain build of the same shard
        let plain_fixture = build_fixture(
            "phenotype,chromosome:position",
            &[("t/shard.json", &line_refs[..])],
        );
        let expected = drain(&plain_fixture, &["T2D"], Some("8:150-160"));
        assert_eq!(expected.len(), 11);

        // the same shard, BGZF-compressed with its .gzi sibling
        let tmp_dir = temp_testdir::TempDir::default();
        let mut plain_bytes = Vec::new();
        for line in &lines {
            plain_bytes.extend_from_slice(line.as_bytes());
            plain_bytes.push(b'\n');
        }
        let plain_path = tmp_dir.join("shard.json");
        let gz_path = tmp_dir.join("shard.json.gz");
        std::fs::write(&plain_path, &plain_bytes).unwrap();
        let gzi = bgzf::compress_file(&plain_path, &gz_path).unwrap();

        let mut blobs = MemBlobs::default();
        blobs.insert("t/shard.json.gz", std::fs::read(&gz_path).unwrap());
        blobs.insert("t/shard.json.gz.gzi", gzi.to_bytes());
        let store = Arc::new(RecordStore::new(Arc::new(blobs)));

        let config = Config {
            database: tmp_dir.join("bio.db"),
            workers: 2,
            ..Config::default()
        };
        let mut spec = IndexSpec::new(
            "idx",
            "idx",
            "t/",
            KeySpec::parse("phenotype,chromosome:position").unwrap(),
        );
        spec.compressed = true;
        let mut catalog = Catalog::open(&config.database).unwrap();
        catalog.put(&spec).unwrap();
        drop(catalog);
        let summary = crate::build::build_index(&config, &store, &spec, false).unwrap();
        assert!(summary.ok(), "build failed: {:?}", summary);

        let catalog = Catalog::open(&config.database).unwrap();
        let engine = Engine {
            config: &config,
            catalog: &catalog,
            store: &store,
        };
        let (spec, mut cursor) = engine
            .plan(
                "idx",
                vec!["T2D".to_string()],
                Some(crate::index::locus::Locus {
                    chrom: "8".into(),
                    start: 150,
                    end: 161,
                }),
                vec![],
            )
            .unwrap();
        assert!(spec.compressed);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let page = runtime
            .block_on(engine.fetch_page(&spec, &mut cursor))
            .unwrap();

        assert_eq!(page.records, expected);
    }

    #[test]
    fn rebuild_is_idempotent() {
        let fixture = build_fixture(
            "phenotype,chromosome:position",
            &[(
                "t/chr8.json",
                &[
                    r#"{"phenotype":"T2D","chromosome":"8","position":100}"#,
                    r#"{"phenotype":"T2D","chromosome":"8","position":101}"#,
                ][..],
            )],
        );

        let dump = |catalog: &crate::catalog::Catalog| -> Vec<(String, i64, i64)> {
            let mut stmt = catalog
                .conn()
                .prepare(
                    "SELECT \"key0\", \"start_offset\", \"end_offset\" FROM \"bio_idx\" \
                     ORDER BY \"key0\", \"start_offset\"",
                )
                .unwrap();
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                .unwrap()
                .collect::<Result<Vec<_>, _>>()
                .unwrap()
        };

        let before = dump(&fixture.catalog());
        let summary =
            crate::build::build_index(&fixture.config, &fixture.store, &fixture.spec, false)
                .unwrap();
        assert!(summary.ok());
        let after = dump(&fixture.catalog());

        assert_eq!(before, after);
    }
}
