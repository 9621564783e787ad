//! Common functionality.

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

pub mod io;
pub mod s3;

/// Commonly used command line arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Verbosity of the program
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: Verbosity::new(0, 0),
        }
    }
}

/// Definition of canonical chromosome names.
pub const CHROMS: &[&str] = &[
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17",
    "18", "19", "20", "21", "22", "X", "Y", "XY", "MT",
];

/// Normalize a chromosome name, rejecting anything outside the canon.
///
/// Accepts `1`-`22`, `X`, `Y`, `XY`, `MT` case-insensitively, tolerates a
/// `chr` prefix, and maps `M` to `MT`.
pub fn normalize_chrom(raw: &str) -> Option<String> {
    let canon = canonical_chrom(raw);
    CHROMS.contains(&canon.as_str()).then_some(canon)
}

/// Canonical form of a chromosome-like value without validating it.
///
/// Used on record fields, where unusual contigs must still compare equal to
/// themselves across build and query.
pub fn canonical_chrom(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = if trimmed.len() > 3 && trimmed[..3].eq_ignore_ascii_case("chr") {
        &trimmed[3..]
    } else {
        trimmed
    };
    let upper = stripped.to_ascii_uppercase();
    if upper == "M" {
        "MT".to_string()
    } else {
        upper
    }
}

/// The version of the `bioindex` package.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    #[rstest::rstest]
    #[case("8", Some("8"))]
    #[case("chr8", Some("8"))]
    #[case("CHRX", Some("X"))]
    #[case("x", Some("X"))]
    #[case("mt", Some("MT"))]
    #[case("m", Some("MT"))]
    #[case("chrM", Some("MT"))]
    #[case("xy", Some("XY"))]
    #[case("22", Some("22"))]
    #[case("23", None)]
    #[case("chr", None)]
    #[case("SLC30A8", None)]
    fn normalize_chrom(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(
            super::normalize_chrom(raw),
            expected.map(|s| s.to_string())
        );
    }

    #[test]
    fn canonical_chrom_keeps_unknown_contigs() {
        assert_eq!(super::canonical_chrom("chrUn_gl000220"), "UN_GL000220");
    }
}
