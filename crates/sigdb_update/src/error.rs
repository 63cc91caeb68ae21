//! Error types surfaced by the update engine.

use std::path::PathBuf;

use sigdb_cvd::CvdError;
use url::Url;

/// Errors produced by the low level fetcher.
///
/// Note that HTTP-level outcomes such as 304 or 404 are *not* errors; they are
/// reported through [`crate::fetch::DownloadOutcome`]. Only transport and
/// local I/O failures end up here.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("failed to initialize the HTTP client")]
    ClientInit(#[source] reqwest::Error),

    #[error("transport error while retrieving {url}")]
    Transport {
        url: Url,
        #[source]
        source: reqwest::Error,
    },

    #[error("can't create download file {path}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors produced by TXT record lookups.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("failed to initialize the DNS resolver")]
    Init(#[source] hickory_resolver::error::ResolveError),

    #[error("TXT lookup for {name} failed")]
    Lookup {
        name: String,
        #[source]
        source: hickory_resolver::error::ResolveError,
    },
}

/// Error returned by a [`crate::patch::DiffApplier`] implementation.
#[derive(Debug, thiserror::Error)]
#[error("failed to apply patch: {0}")]
pub struct DiffError(pub String);

/// Errors of the update engine proper.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("connection error")]
    Connection(#[source] DownloadError),

    #[error("failed to retrieve {0}")]
    FailedGet(String),

    #[error("downloaded file is empty")]
    EmptyFile,

    #[error("downloaded database archive failed verification")]
    BadArchive(#[source] CvdError),

    #[error("mirror {0} is not synchronized")]
    MirrorNotSync(Url),

    #[error("database update failed: {0}")]
    FailedUpdate(String),

    #[error("directory error: {0}")]
    Directory(PathBuf),

    #[error("can't access database directory entry {path}")]
    DbDirAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("post-download validation failed: {0}")]
    TestFail(String),
}

impl UpdateError {
    /// Whether the patch loop may retry after this error. Only transient
    /// transport failures and failed GETs qualify; everything else aborts the
    /// incremental path immediately.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpdateError::Connection(_) | UpdateError::FailedGet(_)
        )
    }
}
