//! Incremental update: differential patch download and application.
//!
//! Patches transform an unpacked working copy of the currently installed
//! archive, one version at a time, in strictly ascending order. The working
//! copy lives in a scratch directory under the configured temp directory;
//! every file is addressed through that explicit directory handle, never
//! through the process working directory.

use std::path::Path;

use fs_err as fs;
use url::Url;

use crate::config::UpdateConfig;
use crate::error::DiffError;
use crate::fetch::{fetch_to_file, DownloadOutcome, FetchRequest};
use crate::probe::join_server;
use crate::UpdateError;

/// Applies a single differential patch to a working copy.
///
/// The patch file format is opaque to the update engine; implementations
/// interpret `patch` and rewrite files inside `workdir` accordingly.
pub trait DiffApplier: Send + Sync {
    /// Applies `patch` to the working copy rooted at `workdir`.
    fn apply(&self, workdir: &Path, patch: &Path) -> Result<(), DiffError>;
}

/// Seeds `scratch` with the unpacked contents of the installed archive.
///
/// Incremental update is impossible without a local archive; that case is a
/// directory error the caller turns into a full-download fallback.
pub(crate) fn seed_scratch_dir(
    config: &UpdateConfig,
    database: &str,
    scratch: &Path,
) -> Result<(), UpdateError> {
    let archive = ["cvd", "cld"]
        .iter()
        .map(|ext| config.database_dir.join(format!("{database}.{ext}")))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            tracing::error!(database, "can't find local CVD or CLD to patch");
            UpdateError::Directory(config.database_dir.clone())
        })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(scratch, std::fs::Permissions::from_mode(0o755))
            .map_err(|_| UpdateError::Directory(scratch.to_path_buf()))?;
    }

    sigdb_cvd::unpack_archive(&archive, scratch).map_err(|err| {
        tracing::error!(archive = %archive.display(), error = %err, "can't unpack local archive");
        UpdateError::Directory(scratch.to_path_buf())
    })
}

/// Downloads and applies the patch taking the working copy to `version`.
async fn download_patch(
    config: &UpdateConfig,
    differ: &dyn DiffApplier,
    database: &str,
    scratch: &Path,
    version: u32,
    server: &Url,
) -> Result<(), UpdateError> {
    let patch_name = format!("{database}-{version}.cdiff");
    let url = join_server(server, &patch_name)?;
    let patch_file = scratch.join(&patch_name);

    let outcome = fetch_to_file(config, &FetchRequest::new(url), &patch_file)
        .await
        .map_err(UpdateError::Connection)?;
    match outcome {
        DownloadOutcome::Ok(0) => {
            tracing::info!(
                patch = patch_name.as_str(),
                "empty patch script, need to download entire database"
            );
            let _ = fs::remove_file(&patch_file);
            return Err(UpdateError::EmptyFile);
        }
        DownloadOutcome::Ok(_) => {}
        _ => {
            tracing::warn!(patch = patch_name.as_str(), "can't download patch");
            return Err(UpdateError::FailedGet(patch_name));
        }
    }

    let applied = differ.apply(scratch, &patch_file);
    let _ = fs::remove_file(&patch_file);
    applied.map_err(|err| {
        tracing::error!(patch = patch_name.as_str(), error = %err, "can't apply patch");
        UpdateError::FailedUpdate(err.to_string())
    })
}

/// Brings the working copy from `local_version` to `remote_version` by
/// applying every intermediate patch in ascending order.
///
/// Each patch download is retried up to the configured attempt count on
/// transient failures; any other error aborts the sequence immediately.
pub(crate) async fn run_patch_sequence(
    config: &UpdateConfig,
    differ: &dyn DiffApplier,
    database: &str,
    scratch: &Path,
    server: &Url,
    local_version: u32,
    remote_version: u32,
) -> Result<(), UpdateError> {
    for version in (local_version + 1)..=remote_version {
        let mut last_error = None;
        for attempt in 1..=config.max_attempts {
            match download_patch(config, differ, database, scratch, version, server).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(err) if err.is_retryable() => {
                    tracing::debug!(database, version, attempt, "retrying patch download");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        if let Some(err) = last_error {
            return Err(err);
        }
    }
    Ok(())
}
