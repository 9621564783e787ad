//! Index specifications and record-level key/locus extraction.

pub mod locus;
pub mod schema;

use itertools::Itertools;
use serde_json::Value;

use crate::common::canonical_chrom;

use self::locus::Locus;
use self::schema::{KeyPart, KeySpec, LocusPart};

/// Catalog entry describing one index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    /// Unique name of the index.
    pub name: String,
    /// Name under which the GraphQL layer exposes the index; opaque here.
    pub schema_name: String,
    /// S3 key prefix of the shards, always ending in `/`.
    pub prefix: String,
    /// Key schema of the index.
    pub schema: KeySpec,
    /// Name of the relational table holding the index rows.
    pub table_name: String,
    /// Whether the last build pass completed cleanly.
    pub built: bool,
    /// Whether the shards are BGZF-compressed.
    pub compressed: bool,
    /// When the index was last built cleanly.
    pub built_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl IndexSpec {
    /// Create a fresh, unbuilt spec, normalizing the prefix to end in `/`.
    pub fn new(name: &str, schema_name: &str, prefix: &str, schema: KeySpec) -> Self {
        let prefix = if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{}/", prefix)
        };
        Self {
            name: name.to_string(),
            schema_name: schema_name.to_string(),
            prefix,
            schema,
            table_name: table_name_for(name),
            built: false,
            compressed: false,
            built_at: None,
        }
    }
}

/// Derive the relational table name for an index.
pub fn table_name_for(index: &str) -> String {
    let mut out = String::from("bio_");
    for ch in index.chars() {
        out.push(if ch.is_ascii_alphanumeric() {
            ch.to_ascii_lowercase()
        } else {
            '_'
        });
    }
    out
}

/// Canonical string form of a cardinal JSON value.
pub fn key_value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// A record field, treating JSON `null` as absent.
fn field<'a>(record: &'a Value, name: &str) -> Option<&'a Value> {
    record.get(name).filter(|v| !v.is_null())
}

/// Integer position from a JSON field value.
fn field_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// All key tuples a record contributes: the cartesian product over the
/// non-null alternatives of each interchangeable part. `Err` names the part
/// with no usable value.
pub fn key_tuples(record: &Value, parts: &[KeyPart]) -> Result<Vec<Vec<String>>, String> {
    let mut per_part: Vec<Vec<String>> = Vec::with_capacity(parts.len());
    for part in parts {
        let mut values: Vec<String> = part
            .fields
            .iter()
            .filter_map(|f| field(record, f).map(key_value_string))
            .collect();
        values.sort();
        values.dedup();
        if values.is_empty() {
            return Err(part.fields.join("|"));
        }
        per_part.push(values);
    }
    Ok(per_part.into_iter().multi_cartesian_product().collect())
}

/// The locus of a record under `part`, if its fields are present and sane.
pub fn record_locus(record: &Value, part: &LocusPart) -> Option<Locus> {
    match part {
        LocusPart::Point { chrom, pos } => {
            let chrom = canonical_chrom(&key_value_string(field(record, chrom)?));
            let pos = field_u64(field(record, pos)?)?;
            Some(Locus {
                chrom,
                start: pos,
                end: pos + 1,
            })
        }
        LocusPart::Region { chrom, start, end } => {
            let chrom = canonical_chrom(&key_value_string(field(record, chrom)?));
            let start = field_u64(field(record, start)?)?;
            let end = field_u64(field(record, end)?)?;
            if end < start {
                return None;
            }
            Some(Locus { chrom, start, end })
        }
        LocusPart::TemplatePoint { field: name, .. } => {
            let value = key_value_string(field(record, name)?);
            locus::parse_template_value(&value, false).ok()
        }
        LocusPart::TemplateRegion { field: name, .. } => {
            let value = key_value_string(field(record, name)?);
            locus::parse_template_value(&value, true).ok()
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::schema::KeySpec;
    use super::{key_tuples, record_locus, table_name_for};
    use crate::index::locus::Locus;

    #[rstest::rstest]
    #[case("t2d", "bio_t2d")]
    #[case("Assoc/T2D", "bio_assoc_t2d")]
    #[case("genes-37", "bio_genes_37")]
    fn table_names(#[case] index: &str, #[case] expected: &str) {
        assert_eq!(table_name_for(index), expected);
    }

    #[test]
    fn key_tuples_simple() {
        let spec = KeySpec::parse("phenotype,chromosome:position").unwrap();
        let record = json!({"phenotype": "T2D", "chromosome": "8", "position": 100});

        let tuples = key_tuples(&record, &spec.key_parts()).unwrap();
        assert_eq!(tuples, vec![vec!["T2D".to_string()]]);
    }

    #[test]
    fn key_tuples_numbers_stringified() {
        let spec = KeySpec::parse("cohort").unwrap();
        let record = json!({"cohort": 42});

        let tuples = key_tuples(&record, &spec.key_parts()).unwrap();
        assert_eq!(tuples, vec![vec!["42".to_string()]]);
    }

    #[test]
    fn key_tuples_interchangeable() {
        let spec = KeySpec::parse("gene|ensemblId").unwrap();
        let parts = spec.key_parts();

        let only_first = json!({"gene": "SLC30A8", "ensemblId": null});
        assert_eq!(
            key_tuples(&only_first, &parts).unwrap(),
            vec![vec!["SLC30A8".to_string()]]
        );

        let both = json!({"gene": "SLC30A8", "ensemblId": "ENSG00000164756"});
        let tuples = key_tuples(&both, &parts).unwrap();
        assert_eq!(tuples.len(), 2);
        assert!(tuples.contains(&vec!["SLC30A8".to_string()]));
        assert!(tuples.contains(&vec!["ENSG00000164756".to_string()]));
    }

    #[test]
    fn key_tuples_missing_key() {
        let spec = KeySpec::parse("phenotype").unwrap();
        let record = json!({"other": 1});

        assert_eq!(
            key_tuples(&record, &spec.key_parts()),
            Err("phenotype".to_string())
        );
    }

    #[test]
    fn record_locus_point() {
        let spec = KeySpec::parse("phenotype,chromosome:position").unwrap();
        let record = json!({"phenotype": "T2D", "chromosome": "chr8", "position": 100});

        assert_eq!(
            record_locus(&record, spec.locus.as_ref().unwrap()),
            Some(Locus {
                chrom: "8".into(),
                start: 100,
                end: 101
            })
        );
    }

    #[test]
    fn record_locus_region_is_half_open() {
        let spec = KeySpec::parse("phenotype,chromosome:start-end").unwrap();
        let record = json!({"phenotype": "T2D", "chromosome": "8", "start": 100, "end": 300});

        assert_eq!(
            record_locus(&record, spec.locus.as_ref().unwrap()),
            Some(Locus {
                chrom: "8".into(),
                start: 100,
                end: 300
            })
        );
    }

    #[test]
    fn record_locus_template() {
        let spec = KeySpec::parse("varId=$chrom:$pos").unwrap();
        let record = json!({"varId": "8:118184783:C:T"});

        assert_eq!(
            record_locus(&record, spec.locus.as_ref().unwrap()),
            Some(Locus {
                chrom: "8".into(),
                start: 118184783,
                end: 118184784
            })
        );
    }

    #[test]
    fn record_locus_missing_field() {
        let spec = KeySpec::parse("phenotype,chromosome:position").unwrap();
        let record = json!({"phenotype": "T2D", "chromosome": "8"});

        assert_eq!(record_locus(&record, spec.locus.as_ref().unwrap()), None);
    }
}
