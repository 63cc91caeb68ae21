//! Remote header probe and local database probe.

use chrono::{DateTime, Utc};
use sigdb_cvd::{CvdHeader, HEADER_SIZE};
use url::Url;

use crate::config::UpdateConfig;
use crate::fetch::{fetch_to_memory, DownloadOutcome, FetchRequest};
use crate::UpdateError;

/// Result of probing a remote database header.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// The first 512 bytes parsed as a header.
    Header(CvdHeader),
    /// The server answered 304 to our `If-Modified-Since` date.
    UpToDate,
}

/// Retrieves and parses the header of `db_file` on `server`.
///
/// Only the byte range `0..512` is requested, and regardless of how much the
/// server actually sends, no more than [`HEADER_SIZE`] bytes are ever
/// buffered. A response shorter than the header, or one containing a
/// non-printable byte within it, is classified as malformed.
pub(crate) async fn remote_header(
    config: &UpdateConfig,
    db_file: &str,
    if_modified_since: Option<DateTime<Utc>>,
    server: &Url,
) -> Result<ProbeOutcome, UpdateError> {
    let url = join_server(server, db_file)?;
    tracing::debug!(%url, "reading database header");

    // The range request keeps a compliant server from sending more than the
    // header; the byte bound keeps a non-compliant one from making us buffer
    // more than the header.
    let request = FetchRequest {
        url,
        if_modified_since,
        range: Some((0, (HEADER_SIZE - 1) as u64)),
        max_bytes: Some(HEADER_SIZE as u64),
        allow_redirect: true,
    };

    let (outcome, body) = fetch_to_memory(config, &request)
        .await
        .map_err(UpdateError::Connection)?;
    match outcome {
        DownloadOutcome::Ok(_) => {}
        DownloadOutcome::UpToDate => return Ok(ProbeOutcome::UpToDate),
        DownloadOutcome::NotFound
        | DownloadOutcome::OriginTimeout
        | DownloadOutcome::HttpOther(_) => {
            return Err(UpdateError::FailedGet(db_file.to_owned()));
        }
    }

    if body.len() < HEADER_SIZE {
        tracing::warn!(db_file, "malformed database header (too short)");
        return Err(UpdateError::FailedGet(db_file.to_owned()));
    }

    match CvdHeader::parse(&body[..HEADER_SIZE]) {
        Ok(header) => Ok(ProbeOutcome::Header(header)),
        Err(err) => {
            tracing::warn!(db_file, error = %err, "malformed database header");
            Err(UpdateError::FailedGet(db_file.to_owned()))
        }
    }
}

/// The installed copy of a database, if any.
#[derive(Debug, Clone)]
pub struct LocalDatabase {
    /// File name within the database directory (`<db>.cvd` or `<db>.cld`).
    pub file_name: String,
    /// Parsed header of the installed archive.
    pub header: CvdHeader,
}

impl LocalDatabase {
    /// Build time of the installed archive, used as the `If-Modified-Since`
    /// date of remote probes.
    pub(crate) fn build_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.header.build_epoch as i64, 0)
    }
}

/// Looks for `<db>.cvd`, then `<db>.cld`, in the database directory and
/// parses the header of whichever exists first. A present but unparseable
/// archive is reported as absent; the caller will fall back to a full
/// download.
pub(crate) fn local_database(config: &UpdateConfig, database: &str) -> Option<LocalDatabase> {
    for extension in ["cvd", "cld"] {
        let file_name = format!("{database}.{extension}");
        let path = config.database_dir.join(&file_name);
        if !path.is_file() {
            continue;
        }

        return match CvdHeader::read_from_file(&path) {
            Ok(header) => Some(LocalDatabase { file_name, header }),
            Err(err) => {
                tracing::warn!(file = %path.display(), error = %err, "can't parse local database header");
                None
            }
        };
    }
    None
}

/// Joins `server` and a file name into a request URL.
pub(crate) fn join_server(server: &Url, file: &str) -> Result<Url, UpdateError> {
    // Treat the server URL as a directory regardless of a trailing slash.
    let base = if server.path().ends_with('/') {
        server.clone()
    } else {
        let mut server = server.clone();
        server.set_path(&format!("{}/", server.path()));
        server
    };
    base.join(file)
        .map_err(|_| UpdateError::FailedGet(file.to_owned()))
}
