//! Shared fixtures for the test suites: a static HTTP mirror serving a
//! directory, archive fixtures, and stub implementations of the injected
//! capabilities.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use axum::routing::get_service;
use md5::Md5;
use sigdb_cvd::CvdHeader;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tower_http::services::ServeDir;
use url::Url;

use crate::config::UpdateConfig;
use crate::dns::TxtResolver;
use crate::error::{DiffError, DnsError};
use crate::patch::DiffApplier;

pub(crate) use crate::update::unique_temp_path;

/// Serves a directory over HTTP on a random localhost port, with support for
/// range and conditional requests.
pub(crate) struct StaticMirror {
    local_addr: SocketAddr,
    shutdown_sender: Option<oneshot::Sender<()>>,
}

impl StaticMirror {
    pub(crate) async fn new(path: impl AsRef<Path>) -> StaticMirror {
        let service = get_service(ServeDir::new(path.as_ref().to_path_buf()));
        let app = axum::Router::new().fallback_service(service);

        // A random port so tests can run in parallel.
        let addr = SocketAddr::new([127, 0, 0, 1].into(), 0);
        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        let local_addr = listener.local_addr().unwrap();

        let (tx, rx) = oneshot::channel();
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                rx.await.ok();
            })
            .into_future();
        drop(tokio::spawn(server));

        StaticMirror {
            local_addr,
            shutdown_sender: Some(tx),
        }
    }

    pub(crate) fn url(&self) -> Url {
        Url::parse(&format!("http://localhost:{}/", self.local_addr.port())).unwrap()
    }
}

impl Drop for StaticMirror {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_sender.take() {
            let _ = tx.send(());
        }
    }
}

/// A configuration with short timeouts rooted in the given directories.
pub(crate) fn test_config(temp: &TempDir, db_dir: &TempDir) -> UpdateConfig {
    UpdateConfig::builder(temp.path(), db_dir.path())
        .max_attempts(2)
        .connect_timeout(std::time::Duration::from_secs(5))
        .request_timeout(std::time::Duration::from_secs(10))
        .build()
        .unwrap()
}

pub(crate) fn archive_header(version: u32, sigs: u32, fl: u32, epoch: u64) -> CvdHeader {
    CvdHeader {
        build_time: "17 Mar 2021 10-34 -0400".to_owned(),
        version,
        signature_count: sigs,
        functionality_level: fl,
        body_digest: None,
        builder_signature: None,
        builder: "test-builder".to_owned(),
        build_epoch: epoch,
    }
}

fn append_bytes(tar: &mut tar::Builder<&mut Vec<u8>>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, name, data).unwrap();
}

/// Writes a complete, verifiable `<database>.<extension>` archive fixture
/// into `dir` and returns its path.
pub(crate) fn write_database(
    dir: &Path,
    database: &str,
    extension: &str,
    version: u32,
    sigs: u32,
    fl: u32,
) -> PathBuf {
    write_database_with_epoch(dir, database, extension, version, sigs, fl, 1_615_991_640)
}

pub(crate) fn write_database_with_epoch(
    dir: &Path,
    database: &str,
    extension: &str,
    version: u32,
    sigs: u32,
    fl: u32,
    epoch: u64,
) -> PathBuf {
    let mut header = archive_header(version, sigs, fl, epoch);

    // The .info file inside the body carries the same header line, just as a
    // published archive would.
    let info_line = {
        let block = header.to_block().unwrap();
        let mut line = std::str::from_utf8(&block).unwrap().trim_end().to_owned();
        line.push('\n');
        line
    };

    let mut body = Vec::new();
    {
        let mut tar = tar::Builder::new(&mut body);
        append_bytes(&mut tar, "COPYING", b"redistribution terms go here");
        append_bytes(&mut tar, &format!("{database}.info"), info_line.as_bytes());
        append_bytes(
            &mut tar,
            &format!("{database}.ndb"),
            format!("signature body for version {version}\n").as_bytes(),
        );
        tar.finish().unwrap();
    }

    use digest::Digest;
    header.body_digest = Some(format!("{:x}", Md5::digest(&body)));
    header.builder_signature = Some("dGVzdC1zaWduYXR1cmU".to_owned());

    let mut contents = header.to_block().unwrap().to_vec();
    contents.extend_from_slice(&body);

    let path = dir.join(format!("{database}.{extension}"));
    fs_err::write(&path, contents).unwrap();
    path
}

/// [`TxtResolver`] answering from a fixed table.
pub(crate) struct StubResolver {
    records: HashMap<String, String>,
}

impl StubResolver {
    pub(crate) fn empty() -> StubResolver {
        StubResolver {
            records: HashMap::new(),
        }
    }

    pub(crate) fn with_record(name: &str, record: impl Into<String>) -> StubResolver {
        let mut records = HashMap::new();
        records.insert(name.to_owned(), record.into());
        StubResolver { records }
    }
}

#[async_trait]
impl TxtResolver for StubResolver {
    async fn query_txt(&self, name: &str) -> Result<Option<String>, DnsError> {
        Ok(self.records.get(name).cloned())
    }
}

/// [`DiffApplier`] that records the patch payloads it was handed.
#[derive(Default)]
pub(crate) struct RecordingDiffApplier {
    applied: Mutex<Vec<Vec<u8>>>,
    fail: bool,
}

impl RecordingDiffApplier {
    pub(crate) fn failing() -> RecordingDiffApplier {
        RecordingDiffApplier {
            applied: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub(crate) fn applied(&self) -> Vec<Vec<u8>> {
        self.applied.lock().unwrap().clone()
    }
}

impl DiffApplier for RecordingDiffApplier {
    fn apply(&self, _workdir: &Path, patch: &Path) -> Result<(), DiffError> {
        let payload =
            fs_err::read(patch).map_err(|err| DiffError(format!("can't read patch: {err}")))?;
        if self.fail {
            return Err(DiffError("stub applier configured to fail".to_owned()));
        }
        self.applied.lock().unwrap().push(payload);
        Ok(())
    }
}

/// [`DiffApplier`] that treats the patch payload as the target version and
/// rewrites the working copy's `.info` header line accordingly, the way a
/// real patch script ends up bumping the version of the working copy.
pub(crate) struct InfoRewritingDiffApplier;

impl DiffApplier for InfoRewritingDiffApplier {
    fn apply(&self, workdir: &Path, patch: &Path) -> Result<(), DiffError> {
        let payload = fs_err::read_to_string(patch)
            .map_err(|err| DiffError(format!("can't read patch: {err}")))?;
        let version: u32 = payload
            .trim()
            .parse()
            .map_err(|_| DiffError("patch payload is not a version".to_owned()))?;

        let info = fs_err::read_dir(workdir)
            .map_err(|err| DiffError(err.to_string()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .find(|path| path.extension().is_some_and(|ext| ext == "info"))
            .ok_or_else(|| DiffError("no .info file in working copy".to_owned()))?;

        let block = archive_header(version, 500, 60, 1_615_991_640)
            .to_block()
            .map_err(|err| DiffError(err.to_string()))?;
        let mut line = std::str::from_utf8(&block).unwrap().trim_end().to_owned();
        line.push('\n');
        fs_err::write(&info, line).map_err(|err| DiffError(err.to_string()))?;
        Ok(())
    }
}
