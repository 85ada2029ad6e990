//! Error types shared by the extractor, snapshot writer and estimator.

use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

/// Fatal conditions. Malformed log lines never surface here; they are
/// skipped and counted by the extractor.
#[derive(Error, Debug)]
pub enum CostError {
    /// Sessions directory does not exist or is not a directory
    #[error("sessions directory not found: {}", .0.display())]
    SessionsDirMissing(PathBuf),

    /// Sessions directory exists but cannot be listed
    #[error("cannot read sessions directory {}: {source}", .path.display())]
    SessionsDirUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No stored snapshot for the requested date
    #[error(
        "no snapshot for {date} in {}; run `agentcost snapshot` first",
        .dir.display()
    )]
    SnapshotMissing { date: NaiveDate, dir: PathBuf },

    /// Stored snapshot exists but cannot be read back
    #[error("corrupt snapshot {}: {source}", .path.display())]
    SnapshotCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Snapshot writer invoked without a connected data stream
    #[error("no session listing supplied; pipe JSON on stdin or pass --input <file>")]
    NoInput,

    /// Snapshot writer received nothing but whitespace
    #[error("session listing is empty")]
    EmptyPayload,

    /// Snapshot writer received something that is not a session listing
    #[error("malformed session listing: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    /// Bad flag value or flag combination
    #[error("{0}")]
    InvalidArgument(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error outside of payload parsing (snapshot files, reports)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CostError {
    /// Process exit code for this error. Usage mistakes exit 2, missing or
    /// broken data exits 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            CostError::NoInput | CostError::EmptyPayload | CostError::InvalidArgument(_) => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, CostError>;
