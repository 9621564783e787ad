//! Parsing of textual index schemas into key specifications.
//!
//! A schema is a comma-separated list of key parts with an optional trailing
//! locus, e.g. `phenotype,chromosome:position`. Key parts may join
//! interchangeable field names with `|`; the locus may instead be a field
//! template such as `varId=$chrom:$pos`, in which case the field is also an
//! exact key.

use crate::err::Error;

/// One equality key position: a single field name or interchangeable
/// alternatives joined by `|`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPart {
    /// Field names; one of them must be present and non-null per record.
    pub fields: Vec<String>,
}

impl KeyPart {
    fn parse(text: &str) -> Result<Self, Error> {
        let fields: Vec<String> = text.split('|').map(|f| f.trim().to_string()).collect();
        if fields.iter().any(|f| f.is_empty()) {
            return Err(Error::MalformedSchema(format!(
                "empty key part in {:?}",
                text
            )));
        }
        Ok(Self { fields })
    }
}

impl std::fmt::Display for KeyPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fields.join("|"))
    }
}

/// The locus definition of a schema, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocusPart {
    /// `chrom:pos`: point locus over two record fields.
    Point { chrom: String, pos: String },
    /// `chrom:start-end`: half-open range over three record fields.
    Region {
        chrom: String,
        start: String,
        end: String,
    },
    /// `field=$chrom:$pos`: the field is also an exact key; its value
    /// carries the point locus.
    TemplatePoint {
        field: String,
        chrom: String,
        pos: String,
    },
    /// `field=$chrom:$start-$end`: likewise, with a range locus.
    TemplateRegion {
        field: String,
        chrom: String,
        start: String,
        end: String,
    },
}

impl LocusPart {
    /// The exact-key field a template locus contributes, if any.
    pub fn template_field(&self) -> Option<&str> {
        match self {
            LocusPart::TemplatePoint { field, .. } | LocusPart::TemplateRegion { field, .. } => {
                Some(field)
            }
            _ => None,
        }
    }

    /// Whether the locus spans a range rather than a single position.
    pub fn is_range(&self) -> bool {
        matches!(
            self,
            LocusPart::Region { .. } | LocusPart::TemplateRegion { .. }
        )
    }
}

impl std::fmt::Display for LocusPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocusPart::Point { chrom, pos } => write!(f, "{}:{}", chrom, pos),
            LocusPart::Region { chrom, start, end } => {
                write!(f, "{}:{}-{}", chrom, start, end)
            }
            LocusPart::TemplatePoint { field, chrom, pos } => {
                write!(f, "{}=${}:${}", field, chrom, pos)
            }
            LocusPart::TemplateRegion {
                field,
                chrom,
                start,
                end,
            } => write!(f, "{}=${}:${}-${}", field, chrom, start, end),
        }
    }
}

/// An ordered list of key parts with an optional trailing locus.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeySpec {
    /// Equality keys, not counting the exact key a template locus adds.
    pub keys: Vec<KeyPart>,
    /// Optional locus, always the last schema part.
    pub locus: Option<LocusPart>,
}

impl KeySpec {
    /// Parse a textual schema.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut keys = Vec::new();
        let mut locus: Option<LocusPart> = None;
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(Error::MalformedSchema(format!(
                    "empty part in schema {:?}",
                    text
                )));
            }
            if locus.is_some() {
                return Err(Error::MalformedSchema(format!(
                    "the locus part must come last, but {:?} follows it",
                    part
                )));
            }
            if let Some((field, template)) = part.split_once('=') {
                locus = Some(Self::parse_template(field.trim(), template.trim())?);
            } else if part.contains(':') {
                locus = Some(Self::parse_locus_part(part)?);
            } else {
                keys.push(KeyPart::parse(part)?);
            }
        }
        if keys.is_empty() && locus.is_none() {
            return Err(Error::MalformedSchema("empty schema".to_string()));
        }
        Ok(Self { keys, locus })
    }

    fn parse_locus_part(part: &str) -> Result<LocusPart, Error> {
        let (chrom, rest) = part
            .split_once(':')
            .ok_or_else(|| Error::MalformedSchema(format!("invalid locus part {:?}", part)))?;
        if chrom.is_empty() || rest.is_empty() {
            return Err(Error::MalformedSchema(format!(
                "invalid locus part {:?}",
                part
            )));
        }
        match rest.split_once('-') {
            Some((start, end)) => {
                if start.is_empty() || end.is_empty() {
                    return Err(Error::MalformedSchema(format!(
                        "invalid locus part {:?}",
                        part
                    )));
                }
                Ok(LocusPart::Region {
                    chrom: chrom.to_string(),
                    start: start.to_string(),
                    end: end.to_string(),
                })
            }
            None => Ok(LocusPart::Point {
                chrom: chrom.to_string(),
                pos: rest.to_string(),
            }),
        }
    }

    fn parse_template(field: &str, template: &str) -> Result<LocusPart, Error> {
        if field.is_empty() {
            return Err(Error::MalformedSchema(
                "template locus with empty field name".to_string(),
            ));
        }
        let (chrom, rest) = template.split_once(':').ok_or_else(|| {
            Error::MalformedSchema(format!(
                "template locus {:?} must look like $chrom:$pos",
                template
            ))
        })?;
        let chrom = Self::placeholder(chrom)?;
        match rest.split_once('-') {
            Some((start, end)) => Ok(LocusPart::TemplateRegion {
                field: field.to_string(),
                chrom,
                start: Self::placeholder(start)?,
                end: Self::placeholder(end)?,
            }),
            None => Ok(LocusPart::TemplatePoint {
                field: field.to_string(),
                chrom,
                pos: Self::placeholder(rest)?,
            }),
        }
    }

    fn placeholder(text: &str) -> Result<String, Error> {
        match text.strip_prefix('$') {
            Some(name) if !name.is_empty() => Ok(name.to_string()),
            _ => Err(Error::MalformedSchema(format!(
                "template placeholder {:?} must start with '$'",
                text
            ))),
        }
    }

    /// All equality key positions, including the exact key a template locus
    /// contributes as its final position.
    pub fn key_parts(&self) -> Vec<KeyPart> {
        let mut parts = self.keys.clone();
        if let Some(field) = self.locus.as_ref().and_then(|l| l.template_field()) {
            parts.push(KeyPart {
                fields: vec![field.to_string()],
            });
        }
        parts
    }

    /// Number of key values a query must supply.
    pub fn arity(&self) -> usize {
        self.keys.len()
            + usize::from(
                self.locus
                    .as_ref()
                    .and_then(|l| l.template_field())
                    .is_some(),
            )
    }

    /// Whether the schema carries a locus.
    pub fn is_locus(&self) -> bool {
        self.locus.is_some()
    }
}

impl std::fmt::Display for KeySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts: Vec<String> = self.keys.iter().map(|k| k.to_string()).collect();
        if let Some(locus) = &self.locus {
            parts.push(locus.to_string());
        }
        write!(f, "{}", parts.join(","))
    }
}

impl std::str::FromStr for KeySpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{KeySpec, LocusPart};

    #[test]
    fn parse_exact_single_key() {
        let spec = KeySpec::parse("varId").unwrap();

        assert_eq!(spec.arity(), 1);
        assert!(!spec.is_locus());
        assert_eq!(spec.key_parts()[0].fields, vec!["varId"]);
    }

    #[test]
    fn parse_key_and_point_locus() {
        let spec = KeySpec::parse("phenotype,chromosome:position").unwrap();

        assert_eq!(spec.arity(), 1);
        assert_eq!(
            spec.locus,
            Some(LocusPart::Point {
                chrom: "chromosome".into(),
                pos: "position".into()
            })
        );
    }

    #[test]
    fn parse_keys_and_region_locus() {
        let spec = KeySpec::parse("phenotype,ancestry,chromosome:start-end").unwrap();

        assert_eq!(spec.arity(), 2);
        assert!(spec.locus.as_ref().unwrap().is_range());
    }

    #[test]
    fn parse_interchangeable_keys() {
        let spec = KeySpec::parse("gene|ensemblId,chromosome:position").unwrap();

        assert_eq!(spec.keys[0].fields, vec!["gene", "ensemblId"]);
    }

    #[test]
    fn parse_template_locus_is_also_a_key() {
        let spec = KeySpec::parse("varId=$chrom:$pos").unwrap();

        assert_eq!(spec.arity(), 1);
        assert_eq!(spec.key_parts()[0].fields, vec!["varId"]);
        assert_eq!(
            spec.locus.as_ref().unwrap().template_field(),
            Some("varId")
        );
        assert!(!spec.locus.as_ref().unwrap().is_range());
    }

    #[test]
    fn parse_template_region() {
        let spec = KeySpec::parse("region=$chrom:$start-$end").unwrap();

        assert!(spec.locus.as_ref().unwrap().is_range());
        assert_eq!(spec.arity(), 1);
    }

    #[rstest::rstest]
    #[case("chromosome:position,phenotype")]
    #[case("a,,b")]
    #[case("a|")]
    #[case("chrom:pos,other:field")]
    #[case(":pos")]
    #[case("chrom:")]
    #[case("chrom:start-")]
    #[case("name=$c")]
    #[case("name=c:p")]
    #[case("name=$c:p")]
    #[case("")]
    fn parse_errors(#[case] text: &str) {
        assert!(KeySpec::parse(text).is_err(), "{:?} should not parse", text);
    }

    #[rstest::rstest]
    #[case("varId")]
    #[case("phenotype,chromosome:position")]
    #[case("phenotype,ancestry,chromosome:start-end")]
    #[case("gene|ensemblId")]
    #[case("varId=$chrom:$pos")]
    #[case("region=$chrom:$start-$end")]
    fn display_round_trip(#[case] text: &str) {
        let spec = KeySpec::parse(text).unwrap();

        assert_eq!(spec.to_string(), text);
        assert_eq!(KeySpec::parse(&spec.to_string()).unwrap(), spec);
    }
}
