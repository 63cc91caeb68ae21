#![deny(missing_docs)]

//! Keeps a local directory of signature databases synchronized with a remote
//! distribution service.
//!
//! For every named database (`main`, `daily`, `bytecode`, ...) the engine
//! answers one question: is a newer version available, and if so, how is it
//! obtained and installed with minimal bandwidth and without ever leaving the
//! on-disk state corrupt?
//!
//! The pipeline per database:
//!
//! 1. probe the installed archive for its version and build time;
//! 2. resolve the latest advertised remote version through DNS TXT records,
//!    falling back to a ranged HTTP probe of the remote archive header;
//! 3. obtain the new version, either as a full archive download or as a
//!    sequence of differential patches applied to an unpacked working copy
//!    which is then repacked into a live archive;
//! 4. verify, optionally run a caller-supplied validation callback, and
//!    atomically rename the result into the database directory.
//!
//! # Example
//!
//! ```no_run
//! use sigdb_update::{DatabaseUpdater, SystemResolver, UpdateConfig};
//! use url::Url;
//!
//! # struct NoopDiffer;
//! # impl sigdb_update::DiffApplier for NoopDiffer {
//! #     fn apply(&self, _: &std::path::Path, _: &std::path::Path) -> Result<(), sigdb_update::DiffError> {
//! #         Ok(())
//! #     }
//! # }
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = UpdateConfig::builder("/tmp", "/var/lib/sigdb").build()?;
//! let updater = DatabaseUpdater::new(
//!     config,
//!     Box::new(SystemResolver::from_system_conf()?),
//!     Box::new(NoopDiffer),
//! );
//!
//! let server = Url::parse("https://database.sigdb.net")?;
//! let report = updater
//!     .update_database("daily", None, &server, false, true)
//!     .await?;
//! println!("{:?}", report);
//! # Ok(())
//! # }
//! ```

mod config;
mod dns;
mod download;
mod error;
mod fetch;
mod patch;
mod probe;
mod repack;
mod update;
mod version;

#[cfg(test)]
mod test_utils;

pub use config::{
    ConfigError, DownloadCompleteCallback, ProxySettings, UpdateConfig, UpdateConfigBuilder,
};
pub use dns::{SystemResolver, TxtResolver};
pub use error::{DiffError, DnsError, DownloadError, UpdateError};
pub use fetch::{fetch_to_file, fetch_to_memory, DownloadOutcome, FetchRequest};
pub use patch::DiffApplier;
pub use probe::{LocalDatabase, ProbeOutcome};
pub use update::{DatabaseReport, DatabaseUpdater};
pub use version::RemoteStatus;

/// Functionality level implemented by this engine. Databases requiring a
/// higher level still install, but a warning is emitted because the consumer
/// may not understand all of their signatures.
pub const FUNCTIONALITY_LEVEL: u32 = 90;
