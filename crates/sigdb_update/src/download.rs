//! Full archive download and verification.

use std::path::{Path, PathBuf};

use fs_err as fs;
use sigdb_cvd::CvdHeader;
use url::Url;

use crate::config::UpdateConfig;
use crate::fetch::{fetch_to_file, DownloadOutcome, FetchRequest};
use crate::probe::join_server;
use crate::UpdateError;

/// Result of a full archive download.
#[derive(Debug)]
pub(crate) enum FullOutcome {
    /// `tmp` holds a verified archive of at least the expected version.
    Ready(CvdHeader),
    /// The mirror serves the version directly preceding the advertised one;
    /// treated as a no-op by the caller.
    MirrorBehind,
}

/// The archive verifier dispatches on the file extension, so the temp file is
/// renamed to carry the remote file's extension for the duration of the
/// verification and renamed back afterwards.
struct ExtensionRename<'a> {
    original: &'a Path,
    renamed: PathBuf,
}

impl<'a> ExtensionRename<'a> {
    fn apply(original: &'a Path, extension: &str) -> Result<ExtensionRename<'a>, UpdateError> {
        let renamed = original.with_extension(extension);
        fs::rename(original, &renamed).map_err(|source| UpdateError::DbDirAccess {
            path: renamed.clone(),
            source,
        })?;
        Ok(ExtensionRename { original, renamed })
    }

    fn restore(self) -> Result<(), UpdateError> {
        fs::rename(&self.renamed, self.original).map_err(|source| UpdateError::DbDirAccess {
            path: self.original.to_path_buf(),
            source,
        })
    }
}

/// Downloads `remote_file` from `server` into `tmp`, verifies it and checks
/// its version against the advertised one.
///
/// On any failure, and on the mirror-behind no-op, `tmp` is removed.
pub(crate) async fn download_full(
    config: &UpdateConfig,
    remote_file: &str,
    tmp: &Path,
    server: &Url,
    expected_version: u32,
) -> Result<FullOutcome, UpdateError> {
    let url = join_server(server, remote_file)?;

    let outcome = fetch_to_file(config, &FetchRequest::new(url.clone()), tmp)
        .await
        .map_err(UpdateError::Connection)?;
    match outcome {
        DownloadOutcome::Ok(_) => {}
        _ => {
            tracing::warn!(%url, "can't download {remote_file}");
            return Err(UpdateError::FailedGet(remote_file.to_owned()));
        }
    }

    let extension = remote_file.rsplit('.').next().unwrap_or("cvd");
    let header = match verify_with_extension(tmp, extension) {
        Ok(header) => header,
        Err(err) => {
            let _ = fs::remove_file(tmp);
            let _ = fs::remove_file(tmp.with_extension(extension));
            return Err(err);
        }
    };

    if header.version < expected_version {
        tracing::warn!(server = %server, "mirror is not synchronized");
        let _ = fs::remove_file(tmp);
        if header.version + 1 < expected_version {
            tracing::error!(
                "downloaded database version is more than 1 version older than advertised"
            );
            return Err(UpdateError::MirrorNotSync(server.clone()));
        }
        return Ok(FullOutcome::MirrorBehind);
    }

    Ok(FullOutcome::Ready(header))
}

fn verify_with_extension(tmp: &Path, extension: &str) -> Result<CvdHeader, UpdateError> {
    let rename = ExtensionRename::apply(tmp, extension)?;
    let verified = sigdb_cvd::verify_archive(&rename.renamed);
    let restore = rename.restore();

    let header = verified.map_err(|err| {
        tracing::error!(error = %err, "downloaded database failed verification");
        UpdateError::BadArchive(err)
    })?;
    restore?;
    Ok(header)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{test_config, unique_temp_path, write_database, StaticMirror};
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[tokio::test]
    async fn download_and_verify() {
        let served = TempDir::new().unwrap();
        write_database(served.path(), "main", "cvd", 27, 100, 60);
        let server = StaticMirror::new(served.path()).await;
        let temp = TempDir::new().unwrap();

        let config = test_config(&temp, &TempDir::new().unwrap());
        let tmp = unique_temp_path(temp.path(), "main");

        let outcome = download_full(&config, "main.cvd", &tmp, &server.url(), 27)
            .await
            .unwrap();
        assert_matches!(outcome, FullOutcome::Ready(header) if header.version == 27);
        assert!(tmp.is_file());
    }

    #[tokio::test]
    async fn newer_than_advertised_is_fine() {
        let served = TempDir::new().unwrap();
        write_database(served.path(), "main", "cvd", 30, 100, 60);
        let server = StaticMirror::new(served.path()).await;
        let temp = TempDir::new().unwrap();

        let config = test_config(&temp, &TempDir::new().unwrap());
        let tmp = unique_temp_path(temp.path(), "main");

        let outcome = download_full(&config, "main.cvd", &tmp, &server.url(), 27)
            .await
            .unwrap();
        assert_matches!(outcome, FullOutcome::Ready(_));
    }

    #[tokio::test]
    async fn one_behind_is_a_noop() {
        let served = TempDir::new().unwrap();
        write_database(served.path(), "main", "cvd", 49, 100, 60);
        let server = StaticMirror::new(served.path()).await;
        let temp = TempDir::new().unwrap();

        let config = test_config(&temp, &TempDir::new().unwrap());
        let tmp = unique_temp_path(temp.path(), "main");

        let outcome = download_full(&config, "main.cvd", &tmp, &server.url(), 50)
            .await
            .unwrap();
        assert_matches!(outcome, FullOutcome::MirrorBehind);
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn two_behind_is_fatal() {
        let served = TempDir::new().unwrap();
        write_database(served.path(), "main", "cvd", 48, 100, 60);
        let server = StaticMirror::new(served.path()).await;
        let temp = TempDir::new().unwrap();

        let config = test_config(&temp, &TempDir::new().unwrap());
        let tmp = unique_temp_path(temp.path(), "main");

        let result = download_full(&config, "main.cvd", &tmp, &server.url(), 50).await;
        assert_matches!(result, Err(UpdateError::MirrorNotSync(_)));
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn corrupt_archive_is_rejected_and_removed() {
        let served = TempDir::new().unwrap();
        fs_err::write(served.path().join("main.cvd"), vec![b'A'; 2048]).unwrap();
        let server = StaticMirror::new(served.path()).await;
        let temp = TempDir::new().unwrap();

        let config = test_config(&temp, &TempDir::new().unwrap());
        let tmp = unique_temp_path(temp.path(), "main");

        let result = download_full(&config, "main.cvd", &tmp, &server.url(), 1).await;
        assert_matches!(result, Err(UpdateError::BadArchive(_)));
        assert!(!tmp.exists());
        assert!(!tmp.with_extension("cvd").exists());
    }
}
