//! Error taxonomy shared by the index, store, build, and query layers.

/// Errors surfaced by the engine. Each kind carries a short human message
/// (via `Display`) and a stable machine code (via [`Error::code`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed schema: {0}")]
    MalformedSchema(String),
    #[error("unknown index: {0}")]
    UnknownIndex(String),
    #[error("invalid locus: {0}")]
    InvalidLocus(String),
    #[error("unknown locus: {0}")]
    UnknownLocus(String),
    #[error("record is missing key field {0}")]
    MissingKey(String),
    #[error("expected {expected} query value(s), got {actual}")]
    ArityMismatch { expected: usize, actual: usize },
    #[error("blob read failed: {0}")]
    BlobRead(String),
    #[error("corrupt shard {object}: {reason}")]
    CorruptShard { object: String, reason: String },
    #[error("build failed: {0}")]
    BuildFailed(String),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("continuation token expired")]
    ExpiredToken,
    #[error("invalid continuation token")]
    InvalidToken,
}

impl Error {
    /// Stable machine-readable code for each error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::MalformedSchema(_) => "malformed_schema",
            Error::UnknownIndex(_) => "unknown_index",
            Error::InvalidLocus(_) => "invalid_locus",
            Error::UnknownLocus(_) => "unknown_locus",
            Error::MissingKey(_) => "missing_key",
            Error::ArityMismatch { .. } => "arity_mismatch",
            Error::BlobRead(_) => "blob_read_error",
            Error::CorruptShard { .. } => "corrupt_shard",
            Error::BuildFailed(_) => "build_failed",
            Error::Db(_) => "db_error",
            Error::ExpiredToken => "expired_token",
            Error::InvalidToken => "invalid_token",
        }
    }

    /// HTTP status the REST layer maps this error to.
    pub fn status(&self) -> u16 {
        match self {
            Error::MalformedSchema(_)
            | Error::InvalidLocus(_)
            | Error::UnknownLocus(_)
            | Error::MissingKey(_)
            | Error::ArityMismatch { .. } => 400,
            Error::UnknownIndex(_) | Error::InvalidToken => 404,
            Error::ExpiredToken => 410,
            Error::BlobRead(_) | Error::CorruptShard { .. } => 502,
            Error::BuildFailed(_) | Error::Db(_) => 500,
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::Error;

    #[rstest::rstest]
    #[case(Error::UnknownIndex("genes".into()), "unknown_index", 404)]
    #[case(Error::ExpiredToken, "expired_token", 410)]
    #[case(Error::InvalidToken, "invalid_token", 404)]
    #[case(Error::BlobRead("timeout".into()), "blob_read_error", 502)]
    #[case(Error::ArityMismatch { expected: 2, actual: 1 }, "arity_mismatch", 400)]
    fn code_and_status(#[case] err: Error, #[case] code: &str, #[case] status: u16) {
        assert_eq!(err.code(), code);
        assert_eq!(err.status(), status);
    }
}
