use std::path::PathBuf;

use thiserror::Error;

use crate::types::UserId;

/// Failures surfaced by ingestion, storage and inference.
///
/// Per-record and per-group variants are absorbed by the pipeline; only
/// `Enumeration`, `SourceRead` and `Storage` end a run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("found records with different user ids: {expected}, {found}")]
    CrossUserMismatch { expected: UserId, found: UserId },

    #[error("no usable records in group")]
    EmptyGroup,

    #[error("cannot open source collection {}: {source}", path.display())]
    Enumeration {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read source {name}: {source}")]
    SourceRead {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("incompatible schema for table {table}: {reason}")]
    Schema { table: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no location calc named {0}")]
    UnknownCalc(String),

    #[error("region source error: {0}")]
    Region(String),

    #[error("pipeline task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Whether the error only affects the group being parsed.
    pub fn is_group_local(&self) -> bool {
        matches!(
            self,
            Error::MalformedInput(_) | Error::CrossUserMismatch { .. } | Error::EmptyGroup
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_local_errors_are_classified() {
        assert!(Error::EmptyGroup.is_group_local());
        assert!(
            Error::CrossUserMismatch {
                expected: 7,
                found: 8
            }
            .is_group_local()
        );
        assert!(!Error::Config("bad".into()).is_group_local());
        assert!(
            !Error::Storage(rusqlite::Error::InvalidQuery).is_group_local()
        );
    }

    #[test]
    fn mismatch_message_names_both_ids() {
        let msg = Error::CrossUserMismatch {
            expected: 7,
            found: 8,
        }
        .to_string();
        assert!(msg.contains('7') && msg.contains('8'), "{msg}");
    }
}
