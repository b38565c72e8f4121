use std::path::PathBuf;

/// Errors that can abort a run before or during construction.
///
/// Per-tile failures (network, local I/O) never produce one of these; they
/// are recorded in the ledger and counted by the reporter instead. This type
/// is reserved for input validation and for the handful of fatal conditions
/// in which the run cannot proceed at all.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("invalid bounding box: west={west} south={south} east={east} north={north}")]
    InvalidBBox {
        west: f64,
        south: f64,
        east: f64,
        north: f64,
    },

    #[error("invalid zoom range [{min_zoom}, {max_zoom}]: must satisfy 0 <= min <= max <= 23")]
    InvalidZoomRange { min_zoom: u8, max_zoom: u8 },

    #[error("invalid thread count: {0} (must be >= 1)")]
    InvalidThreadCount(usize),

    #[error("url template '{0}' contains no recognized placeholder ({{z}}, {{x}}, {{y}}, {{q}})")]
    InvalidUrlTemplate(String),

    #[error("failed to open progress ledger at {path}: {source}")]
    LedgerOpen {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("ledger schema_version {found} is newer than this binary supports ({supported})")]
    LedgerSchemaTooNew { found: i64, supported: i64 },

    #[error("failed to open sink at {path}: {source}")]
    SinkOpen {
        path: PathBuf,
        #[source]
        source: SinkOpenError,
    },

    #[error("fatal error: {0}")]
    Fatal(String),
}

/// Narrower cause for [`HarvestError::SinkOpen`], kept separate so callers
/// can match on it (e.g. to distinguish "disk full" from "database locked").
#[derive(Debug, thiserror::Error)]
pub enum SinkOpenError {
    #[error(transparent)]
    Sqlite(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HarvestError>;
