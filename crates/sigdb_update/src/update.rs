//! Per-database update orchestration.
//!
//! [`DatabaseUpdater`] wires the version oracle, the transports and the
//! incremental patch machinery together and owns the install step: a verified
//! archive is atomically renamed into the database directory, the superseded
//! variant is removed, and on every failure path the previously installed
//! file is left untouched.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fs_err as fs;
use sigdb_cvd::CvdHeader;
use url::Url;

use crate::config::UpdateConfig;
use crate::dns::TxtResolver;
use crate::download::{download_full, FullOutcome};
use crate::fetch::{fetch_to_file, DownloadOutcome, FetchRequest};
use crate::patch::{run_patch_sequence, seed_scratch_dir, DiffApplier};
use crate::probe::{local_database, LocalDatabase};
use crate::repack::build_local_archive;
use crate::version::{resolve_remote_version, RemoteStatus};
use crate::{UpdateError, FUNCTIONALITY_LEVEL};

/// Result of a database update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseReport {
    /// Installed file name within the database directory, when one exists.
    pub file_name: Option<String>,
    /// Signature count of the installed archive.
    pub signature_count: u32,
    /// Whether this call installed a new version.
    pub updated: bool,
}

impl DatabaseReport {
    fn up_to_date(local: &LocalDatabase) -> DatabaseReport {
        tracing::info!(
            file = %local.file_name,
            version = local.header.version,
            sigs = local.header.signature_count,
            functionality_level = local.header.functionality_level,
            builder = %local.header.builder,
            "database is up to date"
        );
        DatabaseReport {
            file_name: Some(local.file_name.clone()),
            signature_count: local.header.signature_count,
            updated: false,
        }
    }

    /// Report for the mirror-one-behind no-op: the installed database stays
    /// in place, so it is what the caller gets back. Only a fresh install
    /// has nothing to report.
    fn mirror_behind(local: Option<&LocalDatabase>) -> DatabaseReport {
        match local {
            Some(local) => DatabaseReport::up_to_date(local),
            None => DatabaseReport {
                file_name: None,
                signature_count: 0,
                updated: false,
            },
        }
    }
}

/// Produces a unique, not-yet-created path for a temporary download. The
/// first writer creates it with exclusive-create semantics.
pub(crate) fn unique_temp_path(dir: &Path, database: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nonce = COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(
        "sigdb-{database}-{}-{nonce}.tmp",
        std::process::id()
    ))
}

/// Removes the owned temporary file on drop unless the file was promoted
/// into the database directory first.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> TempFileGuard {
        TempFileGuard { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn rename(&mut self, to: PathBuf) -> Result<(), UpdateError> {
        fs::rename(&self.path, &to).map_err(|source| UpdateError::DbDirAccess {
            path: to.clone(),
            source,
        })?;
        self.path = to;
        Ok(())
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Synchronizes local signature databases with a distribution service, one
/// database per call.
pub struct DatabaseUpdater {
    config: UpdateConfig,
    resolver: Box<dyn TxtResolver>,
    differ: Box<dyn DiffApplier>,
}

impl DatabaseUpdater {
    /// Creates an updater from a frozen configuration and the injected DNS
    /// and patch capabilities.
    pub fn new(
        config: UpdateConfig,
        resolver: Box<dyn TxtResolver>,
        differ: Box<dyn DiffApplier>,
    ) -> DatabaseUpdater {
        DatabaseUpdater {
            config,
            resolver,
            differ,
        }
    }

    /// The configuration this updater runs with.
    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Updates `database` from `server`.
    ///
    /// The remote version is resolved through DNS and/or an HTTP header
    /// probe; when a newer version exists it is obtained either as a full
    /// archive or, when `scripted_updates` is enabled and a local archive
    /// exists, as a sequence of differential patches applied to an unpacked
    /// working copy and repacked into a live archive.
    pub async fn update_database(
        &self,
        database: &str,
        dns_update_info: Option<&str>,
        server: &Url,
        private_mirror: bool,
        scripted_updates: bool,
    ) -> Result<DatabaseReport, UpdateError> {
        let local = local_database(&self.config, database);
        let if_modified_since = local.as_ref().and_then(LocalDatabase::build_time);
        let local_version = local.as_ref().map_or(0, |db| db.header.version);

        let status = resolve_remote_version(
            &self.config,
            self.resolver.as_ref(),
            database,
            if_modified_since,
            dns_update_info,
            server,
            private_mirror,
        )
        .await?;

        let (remote_version, remote_file) = match status {
            RemoteStatus::UpToDate => {
                let Some(local) = &local else {
                    tracing::error!(
                        database,
                        "server claims we're up to date, but there is no local database"
                    );
                    return Err(UpdateError::FailedGet(database.to_owned()));
                };
                return Ok(DatabaseReport::up_to_date(local));
            }
            RemoteStatus::Available { version, file_name } => (version, file_name),
        };

        if remote_version <= local_version {
            let local = local.as_ref().expect("a local version implies a local database");
            return Ok(DatabaseReport::up_to_date(local));
        }

        if local_version == 0 {
            tracing::info!(database, remote_version, "database available for download");
        } else {
            tracing::info!(
                database,
                local_version,
                remote_version,
                "database available for update"
            );
        }

        let mut tmp = TempFileGuard::new(unique_temp_path(&self.config.temp_dir, database));

        let new_file = if local.is_none() || !scripted_updates {
            match download_full(&self.config, &remote_file, tmp.path(), server, remote_version)
                .await?
            {
                FullOutcome::Ready(_) => remote_file.clone(),
                FullOutcome::MirrorBehind => {
                    return Ok(DatabaseReport::mirror_behind(local.as_ref()));
                }
            }
        } else {
            match self
                .incremental_update(database, server, local_version, remote_version, tmp.path())
                .await
            {
                Ok(()) => format!("{database}.cld"),
                Err(err) => {
                    if matches!(err, UpdateError::EmptyFile) {
                        tracing::debug!(
                            database,
                            "empty patch script, downloading {remote_file} instead"
                        );
                    } else {
                        tracing::warn!(
                            database,
                            error = %err,
                            "incremental update failed, trying to download {remote_file}"
                        );
                    }
                    match download_full(
                        &self.config,
                        &remote_file,
                        tmp.path(),
                        server,
                        remote_version,
                    )
                    .await?
                    {
                        FullOutcome::Ready(_) => remote_file.clone(),
                        FullOutcome::MirrorBehind => {
                            return Ok(DatabaseReport::mirror_behind(local.as_ref()));
                        }
                    }
                }
            }
        };

        self.run_download_complete_callback(&mut tmp, &new_file)?;
        let installed = self.install(tmp, &new_file)?;

        // Remove the superseded variant, e.g. the old CVD after an update
        // produced a CLD.
        if let Some(local) = &local {
            if local.file_name != new_file {
                let old = self.config.database_dir.join(&local.file_name);
                if let Err(err) = fs::remove_file(&old) {
                    tracing::warn!(
                        file = %old.display(),
                        error = %err,
                        "can't remove the old database file, please remove it manually"
                    );
                }
            }
        }

        let header = CvdHeader::read_from_file(&installed).map_err(|err| {
            tracing::error!(file = %installed.display(), "can't parse new database");
            UpdateError::BadArchive(err)
        })?;
        tracing::info!(
            file = new_file.as_str(),
            version = header.version,
            sigs = header.signature_count,
            functionality_level = header.functionality_level,
            builder = %header.builder,
            "database updated"
        );
        warn_if_outdated(&header);

        Ok(DatabaseReport {
            file_name: Some(new_file),
            signature_count: header.signature_count,
            updated: true,
        })
    }

    /// Updates a database from a user-supplied URL. Freshness is tracked by
    /// file modification time rather than archive headers, and the payload
    /// may be any database file the engine knows how to count signatures in.
    pub async fn update_custom_database(&self, url: &str) -> Result<DatabaseReport, UpdateError> {
        let mut tmp = TempFileGuard::new(unique_temp_path(&self.config.temp_dir, "custom"));

        let database_name = if let Some(source) = strip_file_scheme(url) {
            let name = custom_database_name(url, source)?;
            let source_mtime = fs::metadata(source)
                .and_then(|meta| meta.modified())
                .map_err(|_| {
                    tracing::error!(source, "custom database file is missing");
                    UpdateError::FailedUpdate(format!("custom database {source} is missing"))
                })?;
            let local_mtime = fs::metadata(self.config.database_dir.join(&name))
                .and_then(|meta| meta.modified())
                .ok();

            if local_mtime.is_some_and(|local| source_mtime <= local) {
                tracing::info!(database = name.as_str(), "custom database is up to date");
                return Ok(DatabaseReport {
                    file_name: Some(name),
                    signature_count: 0,
                    updated: false,
                });
            }

            let mut reader = fs::File::open(source).map_err(|err| UpdateError::File {
                path: PathBuf::from(source),
                source: err,
            })?;
            let mut writer = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(tmp.path())
                .map_err(|err| UpdateError::File {
                    path: tmp.path().to_path_buf(),
                    source: err,
                })?;
            std::io::copy(&mut reader, &mut writer).map_err(|err| UpdateError::File {
                path: tmp.path().to_path_buf(),
                source: err,
            })?;
            name
        } else {
            let parsed = Url::parse(url)
                .map_err(|_| UpdateError::FailedUpdate(format!("incorrect URL {url}")))?;
            let name = custom_database_name(url, parsed.path())?;

            let if_modified_since = fs::metadata(self.config.database_dir.join(&name))
                .and_then(|meta| meta.modified())
                .ok()
                .map(chrono::DateTime::from);

            let request = FetchRequest {
                url: parsed,
                if_modified_since,
                range: None,
                max_bytes: None,
                allow_redirect: true,
            };
            let outcome = fetch_to_file(&self.config, &request, tmp.path())
                .await
                .map_err(UpdateError::Connection)?;
            match outcome {
                DownloadOutcome::Ok(_) => {}
                DownloadOutcome::UpToDate => {
                    tracing::info!(database = name.as_str(), "custom database is up to date");
                    return Ok(DatabaseReport {
                        file_name: Some(name),
                        signature_count: 0,
                        updated: false,
                    });
                }
                _ => {
                    tracing::warn!(database = name.as_str(), url, "can't download custom database");
                    return Err(UpdateError::FailedGet(name));
                }
            }
            name
        };

        self.run_download_complete_callback(&mut tmp, &database_name)?;
        let installed = self.install(tmp, &database_name)?;

        let signature_count = count_signatures(&installed, &database_name)?;
        tracing::info!(
            database = database_name.as_str(),
            sigs = signature_count,
            "custom database updated"
        );

        Ok(DatabaseReport {
            file_name: Some(database_name),
            signature_count,
            updated: true,
        })
    }

    async fn incremental_update(
        &self,
        database: &str,
        server: &Url,
        local_version: u32,
        remote_version: u32,
        tmp: &Path,
    ) -> Result<(), UpdateError> {
        // The scratch working copy lives for exactly this function; the
        // handle removes it on every exit path.
        let scratch = tempfile::Builder::new()
            .prefix(&format!("sigdb-{database}-patch-"))
            .tempdir_in(&self.config.temp_dir)
            .map_err(|_| UpdateError::Directory(self.config.temp_dir.clone()))?;

        seed_scratch_dir(&self.config, database, scratch.path())?;
        run_patch_sequence(
            &self.config,
            self.differ.as_ref(),
            database,
            scratch.path(),
            server,
            local_version,
            remote_version,
        )
        .await?;
        build_local_archive(&self.config, scratch.path(), database, tmp)
    }

    /// Runs the optional post-download validator against the temp file. The
    /// file is first suffixed with the real database name so validators that
    /// dispatch on the extension can load it.
    fn run_download_complete_callback(
        &self,
        tmp: &mut TempFileGuard,
        new_file: &str,
    ) -> Result<(), UpdateError> {
        let Some(callback) = &self.config.download_complete_callback else {
            return Ok(());
        };

        let mut suffixed = tmp
            .path()
            .file_name()
            .expect("temp files always have a file name")
            .to_os_string();
        suffixed.push(format!("-{new_file}"));
        tmp.rename(tmp.path().with_file_name(suffixed))?;

        tracing::debug!("running download complete callback");
        callback(tmp.path()).inspect_err(|err| {
            tracing::debug!(error = %err, "download complete callback failed");
        })
    }

    /// Atomically promotes the validated temp file into the database
    /// directory.
    fn install(&self, tmp: TempFileGuard, new_file: &str) -> Result<PathBuf, UpdateError> {
        let dest = self.config.database_dir.join(new_file);

        #[cfg(windows)]
        {
            // Windows refuses to rename onto an existing file.
            if dest.is_file() {
                fs::remove_file(&dest).map_err(|source| UpdateError::DbDirAccess {
                    path: dest.clone(),
                    source,
                })?;
            }
        }

        fs::rename(tmp.path(), &dest).map_err(|source| UpdateError::DbDirAccess {
            path: dest.clone(),
            source,
        })?;
        tmp.disarm();
        Ok(dest)
    }
}

fn warn_if_outdated(header: &CvdHeader) {
    if FUNCTIONALITY_LEVEL < header.functionality_level {
        tracing::warn!(
            current = FUNCTIONALITY_LEVEL,
            recommended = header.functionality_level,
            "this installation is outdated for the new database"
        );
    }
}

fn strip_file_scheme(url: &str) -> Option<&str> {
    const SCHEME: &str = "file://";
    if url.len() > SCHEME.len() && url[..SCHEME.len()].eq_ignore_ascii_case(SCHEME) {
        Some(&url[SCHEME.len()..])
    } else {
        None
    }
}

/// Derives the database file name from the final path component of a custom
/// URL. Anything shorter than a one character stem plus extension is
/// rejected.
fn custom_database_name(url: &str, path: &str) -> Result<String, UpdateError> {
    let separator = if cfg!(windows) && strip_file_scheme(url).is_some() {
        '\\'
    } else {
        '/'
    };
    let name = path.rsplit(separator).next().unwrap_or("");
    if name.len() < ".ext".len() + 1 {
        tracing::error!(url, "incorrect custom database URL");
        return Err(UpdateError::FailedUpdate(format!("incorrect URL {url}")));
    }
    Ok(name.to_owned())
}

/// Signature count of an installed database file: archive headers know their
/// own count, compiled bytecode counts as one signature, and plain-text
/// databases carry one signature per line.
fn count_signatures(installed: &Path, name: &str) -> Result<u32, UpdateError> {
    let lowered = name.to_ascii_lowercase();
    if lowered.ends_with(".cvd") || lowered.ends_with(".cld") {
        let header = CvdHeader::read_from_file(installed).map_err(|err| {
            tracing::error!(file = %installed.display(), "can't parse new database");
            UpdateError::BadArchive(err)
        })?;
        warn_if_outdated(&header);
        Ok(header.signature_count)
    } else if lowered.ends_with(".cbc") {
        Ok(1)
    } else {
        let contents = fs::read(installed).map_err(|source| UpdateError::File {
            path: installed.to_path_buf(),
            source,
        })?;
        Ok(contents.iter().filter(|byte| **byte == b'\n').count() as u32)
    }
}
