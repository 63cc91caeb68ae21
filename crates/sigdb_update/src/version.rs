//! Version oracle: determines the latest advertised remote version of a
//! database.
//!
//! Three providers are consulted in order, each one a fallible source of a
//! candidate version: the primary DNS update info record, the per-database
//! fallback TXT record, and finally an HTTP probe of the remote archive
//! header. DNS failures are soft (logged, next provider tried); only the
//! final HTTP fallback can fail the resolution.

use chrono::{DateTime, Utc};
use url::Url;

use crate::config::UpdateConfig;
use crate::dns::{text_record_field, txt_field, TxtResolver, RECORD_TIME_FIELD};
use crate::probe::{remote_header, ProbeOutcome};
use crate::UpdateError;

/// Resolution result for a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    /// A newer-or-equal version is advertised under `file_name` on the
    /// server.
    Available {
        /// Advertised version.
        version: u32,
        /// File name to download (`<db>.cvd`, or `<db>.cld` from a private
        /// mirror).
        file_name: String,
    },
    /// The server answered 304 against our stored build time.
    UpToDate,
}

/// Candidate version from the primary update info record, when the database
/// is listed there and the field is numeric.
fn version_from_update_info(database: &str, record: &str) -> Option<u32> {
    let Some(field) = text_record_field(database) else {
        tracing::debug!(database, "database isn't listed in the DNS update info record");
        return None;
    };
    let Some(raw) = txt_field(record, field) else {
        tracing::warn!(database, "invalid DNS update info record, falling back");
        return None;
    };
    match raw.parse::<u32>() {
        Ok(version) if version > 0 => {
            tracing::debug!(database, version, "version from DNS update info record");
            Some(version)
        }
        _ => {
            tracing::warn!(database, "broken database version in TXT record, falling back");
            None
        }
    }
}

/// Candidate version from the `<db>.cvd.<zone>` fallback record. The record
/// carries a publication timestamp; records older than the configured maximum
/// age are ignored.
async fn version_from_fallback_record(
    config: &UpdateConfig,
    resolver: &dyn TxtResolver,
    database: &str,
) -> Option<u32> {
    let name = format!("{database}.cvd.{}", config.dns_zone);
    let record = match resolver.query_txt(&name).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            tracing::warn!(name = name.as_str(), "no TXT record for database");
            return None;
        }
        Err(err) => {
            tracing::warn!(name = name.as_str(), error = %err, "TXT lookup failed, falling back");
            return None;
        }
    };

    let record_time: i64 = match txt_field(&record, RECORD_TIME_FIELD).map(str::parse) {
        Some(Ok(time)) => time,
        _ => {
            tracing::warn!(name = name.as_str(), "no recordtime field in TXT record");
            return None;
        }
    };
    let age = Utc::now().timestamp() - record_time;
    if age > config.dns_record_max_age.as_secs() as i64 {
        tracing::warn!(name = name.as_str(), age, "DNS record is stale");
        return None;
    }

    match txt_field(&record, 0).map(str::parse) {
        Some(Ok(version)) if version > 0 => {
            tracing::debug!(database, version, "version from fallback TXT record");
            Some(version)
        }
        _ => {
            tracing::warn!(name = name.as_str(), "broken database version in TXT record");
            None
        }
    }
}

/// Determines the latest advertised version of `database` on `server`.
pub(crate) async fn resolve_remote_version(
    config: &UpdateConfig,
    resolver: &dyn TxtResolver,
    database: &str,
    if_modified_since: Option<DateTime<Utc>>,
    dns_update_info: Option<&str>,
    server: &Url,
    private_mirror: bool,
) -> Result<RemoteStatus, UpdateError> {
    let cvd_file = format!("{database}.cvd");
    let cld_file = format!("{database}.cld");

    // DNS providers only apply to official mirrors, and the fallback record
    // is only consulted when an update info record was supplied but did not
    // cover this database.
    if !private_mirror {
        if let Some(record) = dns_update_info {
            let version = match version_from_update_info(database, record) {
                Some(version) => Some(version),
                None => version_from_fallback_record(config, resolver, database).await,
            };
            if let Some(version) = version {
                return Ok(RemoteStatus::Available {
                    version,
                    file_name: cvd_file,
                });
            }
        }
    }

    // HTTP fallback: read the version out of the remote archive header. A
    // private mirror distributes live archives, so probe the CLD first and
    // only fall back to the CVD when that fails outright.
    let (outcome, is_cld) = if private_mirror {
        match remote_header(config, &cld_file, if_modified_since, server).await {
            Ok(outcome) => (outcome, true),
            Err(err) => {
                tracing::debug!(database, error = %err, "no CLD on private mirror, trying CVD");
                (
                    remote_header(config, &cvd_file, if_modified_since, server).await?,
                    false,
                )
            }
        }
    } else {
        (
            remote_header(config, &cvd_file, if_modified_since, server).await?,
            false,
        )
    };

    match outcome {
        ProbeOutcome::Header(header) => {
            tracing::debug!(database, version = header.version, "version obtained via HTTP");
            Ok(RemoteStatus::Available {
                version: header.version,
                file_name: if is_cld { cld_file } else { cvd_file },
            })
        }
        ProbeOutcome::UpToDate => {
            tracing::debug!(database, "up to date according to HTTP response code");
            Ok(RemoteStatus::UpToDate)
        }
    }
}
