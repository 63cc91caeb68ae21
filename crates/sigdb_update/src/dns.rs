//! TXT record plumbing for version discovery.
//!
//! The distribution service advertises database versions through DNS before
//! HTTP is ever touched: a primary "update info" TXT record carries the
//! versions of the well-known databases in fixed colon-delimited fields, and
//! a per-database fallback record (`<db>.cvd.<zone>`) carries the version and
//! a publication timestamp. Resolver plumbing itself is an injected
//! capability so the engine can be driven without network access.

use async_trait::async_trait;
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;

use crate::error::DnsError;

/// Field index of the publication timestamp in the per-database fallback
/// record.
pub(crate) const RECORD_TIME_FIELD: usize = 3;

/// Performs TXT lookups. The engine only ever needs the textual record
/// content of the first TXT answer.
#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// Looks up `name` and returns the first TXT record, or `None` when the
    /// name exists but has no TXT records.
    async fn query_txt(&self, name: &str) -> Result<Option<String>, DnsError>;
}

/// [`TxtResolver`] backed by the system resolver configuration.
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    /// Creates a resolver from `/etc/resolv.conf` (or the platform
    /// equivalent).
    pub fn from_system_conf() -> Result<SystemResolver, DnsError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(DnsError::Init)?;
        Ok(SystemResolver { resolver })
    }
}

#[async_trait]
impl TxtResolver for SystemResolver {
    async fn query_txt(&self, name: &str) -> Result<Option<String>, DnsError> {
        let lookup = match self.resolver.txt_lookup(name).await {
            Ok(lookup) => lookup,
            Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                return Ok(None);
            }
            Err(source) => {
                return Err(DnsError::Lookup {
                    name: name.to_owned(),
                    source,
                });
            }
        };

        let record = lookup.iter().next().map(|txt| {
            txt.txt_data()
                .iter()
                .map(|data| String::from_utf8_lossy(data).into_owned())
                .collect::<String>()
        });
        Ok(record)
    }
}

/// Field index of `database` in the primary update info record, or `None`
/// for databases that are not listed there.
pub(crate) fn text_record_field(database: &str) -> Option<usize> {
    match database {
        "main" => Some(1),
        "daily" => Some(2),
        "safebrowsing" => Some(6),
        "bytecode" => Some(7),
        _ => None,
    }
}

/// Extracts the colon-delimited field at `index` from a TXT record.
pub(crate) fn txt_field(record: &str, index: usize) -> Option<&str> {
    record.split(':').nth(index)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn field_indices_for_known_databases() {
        assert_eq!(text_record_field("main"), Some(1));
        assert_eq!(text_record_field("daily"), Some(2));
        assert_eq!(text_record_field("safebrowsing"), Some(6));
        assert_eq!(text_record_field("bytecode"), Some(7));
        assert_eq!(text_record_field("custom"), None);
    }

    #[test]
    fn txt_field_extraction() {
        let record = "0.1.0:62:27000:1627666260:1:90:49192:331";
        assert_eq!(txt_field(record, 0), Some("0.1.0"));
        assert_eq!(txt_field(record, 2), Some("27000"));
        assert_eq!(txt_field(record, 7), Some("331"));
        assert_eq!(txt_field(record, 8), None);
    }
}
