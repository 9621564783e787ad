//! Parsing of locus query strings and gene-name resolution.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::common::{canonical_chrom, normalize_chrom};
use crate::err::Error;

/// Sentinel end coordinate for whole-chromosome loci.
pub const MAX_POS: u64 = i64::MAX as u64;

/// Half-open genomic interval.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Locus {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
}

impl Locus {
    /// Whether this interval overlaps `other` (same chromosome, half-open).
    pub fn overlaps(&self, other: &Locus) -> bool {
        self.chrom == other.chrom && self.start < other.end && other.start < self.end
    }
}

impl std::fmt::Display for Locus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.end == MAX_POS {
            write!(f, "{}", self.chrom)
        } else {
            write!(f, "{}:{}-{}", self.chrom, self.start, self.end)
        }
    }
}

/// Collaborator resolving gene names to half-open regions.
pub trait GeneResolver: Send + Sync {
    /// Resolve a gene symbol to `(chromosome, start, end)`.
    fn resolve(&self, name: &str) -> Option<(String, u64, u64)>;
}

fn locus_re() -> &'static Regex {
    static LOCUS_RE: OnceLock<Regex> = OnceLock::new();
    LOCUS_RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:chr)?([0-9]{1,2}|XY|X|Y|MT|M)(?::([0-9]+)(?:-([0-9]+))?)?$")
            .expect("static locus regex")
    })
}

fn parse_pos(text: &str, locus: &str) -> Result<u64, Error> {
    text.parse()
        .map_err(|_| Error::InvalidLocus(locus.to_string()))
}

/// Parse a query locus: `chr`, `chr:pos`, or `chr:start-end`, else a gene
/// name handed to `resolver`.
///
/// Positions are 1-based inclusive on both ends and normalized to half-open.
pub fn parse_locus(text: &str, resolver: Option<&dyn GeneResolver>) -> Result<Locus, Error> {
    let text = text.trim();
    if let Some(caps) = locus_re().captures(text) {
        let chrom =
            normalize_chrom(&caps[1]).ok_or_else(|| Error::InvalidLocus(text.to_string()))?;
        return match (caps.get(2), caps.get(3)) {
            (None, _) => Ok(Locus {
                chrom,
                start: 0,
                end: MAX_POS,
            }),
            (Some(pos), None) => {
                let pos = parse_pos(pos.as_str(), text)?;
                Ok(Locus {
                    chrom,
                    start: pos,
                    end: pos + 1,
                })
            }
            (Some(start), Some(end)) => {
                let start = parse_pos(start.as_str(), text)?;
                let end = parse_pos(end.as_str(), text)?;
                if end < start {
                    return Err(Error::InvalidLocus(text.to_string()));
                }
                Ok(Locus {
                    chrom,
                    start,
                    end: end + 1,
                })
            }
        };
    }
    if text.contains(':') {
        return Err(Error::InvalidLocus(text.to_string()));
    }
    match resolver.and_then(|r| r.resolve(text)) {
        Some((chrom, start, end)) => Ok(Locus {
            chrom: canonical_chrom(&chrom),
            start,
            end,
        }),
        None => Err(Error::UnknownLocus(text.to_string())),
    }
}

/// Parse a record's template-locus field value, e.g. `8:118184783:C:T` for a
/// `$chrom:$pos` template. Segments past the positions are ignored; positions
/// use the 1-based inclusive convention of query loci.
pub fn parse_template_value(text: &str, range: bool) -> Result<Locus, Error> {
    let mut segments = text.splitn(3, ':');
    let chrom_raw = segments
        .next()
        .ok_or_else(|| Error::InvalidLocus(text.to_string()))?;
    let pos_raw = segments
        .next()
        .ok_or_else(|| Error::InvalidLocus(text.to_string()))?;
    let chrom = canonical_chrom(chrom_raw);
    if chrom.is_empty() {
        return Err(Error::InvalidLocus(text.to_string()));
    }
    if range {
        let (start, end) = pos_raw
            .split_once('-')
            .ok_or_else(|| Error::InvalidLocus(text.to_string()))?;
        let start = parse_pos(start, text)?;
        let end = parse_pos(end, text)?;
        if end < start {
            return Err(Error::InvalidLocus(text.to_string()));
        }
        Ok(Locus {
            chrom,
            start,
            end: end + 1,
        })
    } else {
        let pos = parse_pos(pos_raw, text)?;
        Ok(Locus {
            chrom,
            start: pos,
            end: pos + 1,
        })
    }
}

/// Gene resolver backed by a GFF3 gene set, loaded lazily on first use.
pub struct GffGeneResolver {
    path: String,
    genes: OnceLock<HashMap<String, (String, u64, u64)>>,
}

impl GffGeneResolver {
    pub fn new(path: String) -> Self {
        Self {
            path,
            genes: OnceLock::new(),
        }
    }
}

impl GeneResolver for GffGeneResolver {
    fn resolve(&self, name: &str) -> Option<(String, u64, u64)> {
        let genes = self.genes.get_or_init(|| match load_genes(&self.path) {
            Ok(genes) => {
                tracing::debug!("loaded {} gene(s) from {}", genes.len(), self.path);
                genes
            }
            Err(e) => {
                tracing::warn!("could not load gene set from {}: {}", self.path, e);
                HashMap::new()
            }
        });
        genes.get(&name.to_ascii_uppercase()).cloned()
    }
}

/// Read `gene` features from a GFF3 file into a symbol lookup.
fn load_genes(path: &str) -> Result<HashMap<String, (String, u64, u64)>, anyhow::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .comment(Some(b'#'))
        .has_headers(false)
        .flexible(true)
        .from_reader(crate::common::io::open_read_maybe_gz(path)?);

    let mut genes = HashMap::new();
    for result in reader.records() {
        let row = result?;
        if row.len() < 9 || &row[2] != "gene" {
            continue;
        }
        let chrom = canonical_chrom(&row[0]);
        let start: u64 = match row[3].parse() {
            Ok(start) => start,
            Err(_) => continue,
        };
        let end: u64 = match row[4].parse() {
            Ok(end) => end,
            Err(_) => continue,
        };
        if let Some(symbol) = gene_symbol(&row[8]) {
            // GFF coordinates are 1-based inclusive on both ends
            genes.insert(symbol.to_ascii_uppercase(), (chrom, start, end + 1));
        }
    }
    Ok(genes)
}

/// Pull a gene symbol out of a GFF3 attribute column.
fn gene_symbol(attributes: &str) -> Option<String> {
    for attr in attributes.split(';') {
        if let Some((key, value)) = attr.trim().split_once('=') {
            if key == "Name" || key == "gene_name" {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{parse_locus, parse_template_value, GeneResolver, Locus, MAX_POS};
    use crate::err::Error;

    struct StubResolver;

    impl GeneResolver for StubResolver {
        fn resolve(&self, name: &str) -> Option<(String, u64, u64)> {
            (name == "SLC30A8").then(|| ("8".to_string(), 117962462, 118261114))
        }
    }

    #[rstest::rstest]
    #[case("8", "8", 0, MAX_POS)]
    #[case("chr8", "8", 0, MAX_POS)]
    #[case("8:100", "8", 100, 101)]
    #[case("8:100-200", "8", 100, 201)]
    #[case("chrX:5-5", "X", 5, 6)]
    #[case("mt:3", "MT", 3, 4)]
    fn parse_positional(
        #[case] text: &str,
        #[case] chrom: &str,
        #[case] start: u64,
        #[case] end: u64,
    ) {
        let locus = parse_locus(text, None).unwrap();

        assert_eq!(
            locus,
            Locus {
                chrom: chrom.into(),
                start,
                end
            }
        );
    }

    #[rstest::rstest]
    #[case("8:abc")]
    #[case("8:200-100")]
    #[case("23:100")]
    #[case("8:100-200-300")]
    fn parse_invalid(#[case] text: &str) {
        assert!(matches!(
            parse_locus(text, None),
            Err(Error::InvalidLocus(_))
        ));
    }

    #[test]
    fn gene_name_resolution() {
        let locus = parse_locus("SLC30A8", Some(&StubResolver)).unwrap();

        assert_eq!(locus.chrom, "8");
        assert_eq!(locus.start, 117962462);
    }

    #[test]
    fn gene_name_without_resolver() {
        assert!(matches!(
            parse_locus("SLC30A8", None),
            Err(Error::UnknownLocus(_))
        ));
    }

    #[test]
    fn unknown_gene_name() {
        assert!(matches!(
            parse_locus("NOTAGENE", Some(&StubResolver)),
            Err(Error::UnknownLocus(_))
        ));
    }

    #[rstest::rstest]
    #[case("8:118184783:C:T", false, "8", 118184783, 118184784)]
    #[case("8:100", false, "8", 100, 101)]
    #[case("chr8:100-200", true, "8", 100, 201)]
    fn template_values(
        #[case] text: &str,
        #[case] range: bool,
        #[case] chrom: &str,
        #[case] start: u64,
        #[case] end: u64,
    ) {
        let locus = parse_template_value(text, range).unwrap();

        assert_eq!(
            locus,
            Locus {
                chrom: chrom.into(),
                start,
                end
            }
        );
    }

    #[test]
    fn template_value_kind_mismatch() {
        assert!(parse_template_value("8:100", true).is_err());
    }

    #[rstest::rstest]
    #[case(100, 200, 150, 250, true)]
    #[case(100, 200, 200, 300, false)]
    #[case(100, 301, 200, 251, true)]
    #[case(100, 301, 400, 501, false)]
    fn overlaps(
        #[case] a_start: u64,
        #[case] a_end: u64,
        #[case] b_start: u64,
        #[case] b_end: u64,
        #[case] expected: bool,
    ) {
        let a = Locus {
            chrom: "8".into(),
            start: a_start,
            end: a_end,
        };
        let b = Locus {
            chrom: "8".into(),
            start: b_start,
            end: b_end,
        };

        assert_eq!(a.overlaps(&b), expected);
        assert_eq!(b.overlaps(&a), expected);
    }
}
