//! Single-request HTTP fetcher.
//!
//! This is the one chokepoint that normalizes proxying, TLS, timeouts, byte
//! ranges and conditional requests, so the rest of the engine consumes a
//! single uniform capability. Outcomes are a tagged variant; raw HTTP status
//! codes never escape this module.

use std::path::Path;

use chrono::{DateTime, Utc};
use reqwest::header;
use reqwest::redirect::Policy;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::config::UpdateConfig;
use crate::error::DownloadError;

/// Maximum number of redirects followed when redirects are allowed.
const MAX_REDIRECTS: usize = 3;

/// Normalized result of a single fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// HTTP 200/206; the payload was written and is this many bytes long.
    Ok(u64),
    /// HTTP 304 in response to `If-Modified-Since`; nothing was written.
    UpToDate,
    /// HTTP 404.
    NotFound,
    /// HTTP 522: the CDN could not reach the origin server.
    OriginTimeout,
    /// Any other HTTP status.
    HttpOther(u16),
}

/// Parameters of a single fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// The URL to retrieve.
    pub url: Url,
    /// When set, issue a conditional GET; a 304 response yields
    /// [`DownloadOutcome::UpToDate`].
    pub if_modified_since: Option<DateTime<Utc>>,
    /// Inclusive byte range to request. The server is free to answer 200
    /// instead of 206; both are treated as success.
    pub range: Option<(u64, u64)>,
    /// Upper bound on the number of payload bytes read. Bytes beyond the
    /// bound are never buffered or written, so a server that ignores a
    /// `Range` header cannot drive unbounded memory or disk use.
    pub max_bytes: Option<u64>,
    /// Whether to follow up to [`MAX_REDIRECTS`] redirects.
    pub allow_redirect: bool,
}

impl FetchRequest {
    /// A plain GET of `url` with redirects enabled.
    pub fn new(url: Url) -> FetchRequest {
        FetchRequest {
            url,
            if_modified_since: None,
            range: None,
            max_bytes: None,
            allow_redirect: true,
        }
    }

    fn http_like(&self) -> bool {
        self.url.scheme().starts_with("http")
    }
}

fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Builds a client for a single request, mirroring the per-call transport
/// handle of the configuration: user agent, timeouts, redirect policy, local
/// bind address and proxy tunneling.
fn build_client(
    config: &UpdateConfig,
    allow_redirect: bool,
) -> Result<reqwest::Client, DownloadError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .redirect(if allow_redirect {
            Policy::limited(MAX_REDIRECTS)
        } else {
            Policy::none()
        });

    if let Some(address) = config.local_ip {
        builder = builder.local_address(address);
    }

    if let Some(proxy) = &config.proxy {
        let mut tunnel = reqwest::Proxy::all(format!("http://{}:{}", proxy.host, proxy.port))
            .map_err(DownloadError::ClientInit)?;
        if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
            tunnel = tunnel.basic_auth(username, password);
        }
        builder = builder.proxy(tunnel);
    }

    builder.build().map_err(DownloadError::ClientInit)
}

async fn send(
    config: &UpdateConfig,
    request: &FetchRequest,
) -> Result<Result<reqwest::Response, DownloadOutcome>, DownloadError> {
    let client = build_client(config, request.allow_redirect)?;

    let mut builder = client.get(request.url.clone());
    if request.http_like() {
        builder = builder.header(header::CONNECTION, "close");
    }
    if let Some(since) = request.if_modified_since {
        builder = builder.header(header::IF_MODIFIED_SINCE, http_date(since));
    }
    if let Some((first, last)) = request.range {
        builder = builder.header(header::RANGE, format!("bytes={first}-{last}"));
    }

    let response = builder.send().await.map_err(|source| {
        tracing::warn!(url = %request.url, error = %source, "download failed");
        DownloadError::Transport {
            url: request.url.clone(),
            source,
        }
    })?;

    let outcome = match response.status().as_u16() {
        200 | 206 => return Ok(Ok(response)),
        304 => DownloadOutcome::UpToDate,
        404 => {
            tracing::warn!(url = %request.url, "file not found on server");
            DownloadOutcome::NotFound
        }
        522 => {
            tracing::warn!(
                url = %request.url,
                "origin connection time-out: the CDN was unable to reach the origin web server"
            );
            DownloadOutcome::OriginTimeout
        }
        code => {
            tracing::warn!(url = %request.url, code, "unexpected response from server");
            DownloadOutcome::HttpOther(code)
        }
    };
    Ok(Err(outcome))
}

/// Retrieves the payload into memory.
///
/// The buffer is only meaningful when the outcome is [`DownloadOutcome::Ok`];
/// for every other outcome it is empty.
pub async fn fetch_to_memory(
    config: &UpdateConfig,
    request: &FetchRequest,
) -> Result<(DownloadOutcome, Vec<u8>), DownloadError> {
    tracing::debug!(url = %request.url, "retrieving into memory");

    let mut response = match send(config, request).await? {
        Ok(response) => response,
        Err(outcome) => return Ok((outcome, Vec::new())),
    };

    let mut buffer = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|source| {
        DownloadError::Transport {
            url: request.url.clone(),
            source,
        }
    })? {
        buffer.extend_from_slice(&chunk);
        if let Some(max) = request.max_bytes {
            if buffer.len() as u64 >= max {
                buffer.truncate(max as usize);
                break;
            }
        }
    }

    Ok((DownloadOutcome::Ok(buffer.len() as u64), buffer))
}

/// Retrieves the payload into a newly created file at `dest`.
///
/// The destination is opened with exclusive-create semantics and bytes are
/// written as they arrive. On any non-success outcome, including transport
/// errors mid-stream, the partial file is removed.
pub async fn fetch_to_file(
    config: &UpdateConfig,
    request: &FetchRequest,
    dest: &Path,
) -> Result<DownloadOutcome, DownloadError> {
    tracing::debug!(url = %request.url, dest = %dest.display(), "retrieving into file");

    let mut response = match send(config, request).await? {
        Ok(response) => response,
        Err(outcome) => return Ok(outcome),
    };

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .await
        .map_err(|source| DownloadError::CreateFile {
            path: dest.to_path_buf(),
            source,
        })?;

    let mut written: u64 = 0;
    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(source) => {
                drop(file);
                let _ = fs_err::remove_file(dest);
                return Err(DownloadError::Transport {
                    url: request.url.clone(),
                    source,
                });
            }
        };
        let take = request
            .max_bytes
            .map_or(chunk.len(), |max| ((max - written).min(chunk.len() as u64)) as usize);
        if let Err(source) = file.write_all(&chunk[..take]).await {
            drop(file);
            let _ = fs_err::remove_file(dest);
            return Err(DownloadError::Io(source));
        }
        written += take as u64;
        if request.max_bytes.is_some_and(|max| written >= max) {
            break;
        }
    }

    file.flush().await?;
    Ok(DownloadOutcome::Ok(written))
}
