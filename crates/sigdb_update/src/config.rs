//! Engine configuration.
//!
//! The configuration is an immutable value constructed once through
//! [`UpdateConfigBuilder`] and passed down by reference; per-call parameters
//! (database name, server, mirror flags) stay on the call path.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::UpdateError;

/// Validator invoked with the path of a fully downloaded archive before it is
/// installed. A non-success return aborts the install with the callback's
/// error.
pub type DownloadCompleteCallback =
    Arc<dyn Fn(&Path) -> Result<(), UpdateError> + Send + Sync>;

/// HTTP proxy settings. The proxy is used via CONNECT tunneling.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Proxy host name or address.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Optional basic-auth user name.
    pub username: Option<String>,
    /// Optional basic-auth password.
    pub password: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum ConfigError {
    #[error("proxy port must not be 0")]
    InvalidProxyPort,

    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,

    #[error("local_ip is not a valid IP address: {0}")]
    InvalidLocalIp(String),
}

/// Immutable engine configuration.
#[derive(Clone)]
pub struct UpdateConfig {
    pub(crate) local_ip: Option<IpAddr>,
    pub(crate) user_agent: String,
    pub(crate) proxy: Option<ProxySettings>,
    pub(crate) temp_dir: PathBuf,
    pub(crate) database_dir: PathBuf,
    pub(crate) max_attempts: u32,
    pub(crate) connect_timeout: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) compress_local_db: bool,
    pub(crate) dns_zone: String,
    pub(crate) dns_record_max_age: Duration,
    pub(crate) download_complete_callback: Option<DownloadCompleteCallback>,
}

impl fmt::Debug for UpdateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateConfig")
            .field("local_ip", &self.local_ip)
            .field("user_agent", &self.user_agent)
            .field("proxy", &self.proxy)
            .field("temp_dir", &self.temp_dir)
            .field("database_dir", &self.database_dir)
            .field("max_attempts", &self.max_attempts)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("compress_local_db", &self.compress_local_db)
            .field("dns_zone", &self.dns_zone)
            .field("dns_record_max_age", &self.dns_record_max_age)
            .field(
                "download_complete_callback",
                &self.download_complete_callback.as_ref().map(|_| "..."),
            )
            .finish()
    }
}

fn default_user_agent() -> String {
    format!(
        "sigdb/{} (OS: {}, ARCH: {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    )
}

impl UpdateConfig {
    /// Starts building a configuration rooted at the given temp and database
    /// directories.
    pub fn builder(
        temp_dir: impl Into<PathBuf>,
        database_dir: impl Into<PathBuf>,
    ) -> UpdateConfigBuilder {
        UpdateConfigBuilder {
            local_ip: None,
            user_agent: None,
            proxy: None,
            temp_dir: temp_dir.into(),
            database_dir: database_dir.into(),
            max_attempts: 3,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            compress_local_db: false,
            dns_zone: "sigdb.net".to_owned(),
            dns_record_max_age: Duration::from_secs(3 * 60 * 60),
            download_complete_callback: None,
        }
    }

    /// Directory for temporary downloads and scratch working copies.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Directory holding the installed databases.
    pub fn database_dir(&self) -> &Path {
        &self.database_dir
    }
}

/// Builder for [`UpdateConfig`].
pub struct UpdateConfigBuilder {
    local_ip: Option<IpAddr>,
    user_agent: Option<String>,
    proxy: Option<ProxySettings>,
    temp_dir: PathBuf,
    database_dir: PathBuf,
    max_attempts: u32,
    connect_timeout: Duration,
    request_timeout: Duration,
    compress_local_db: bool,
    dns_zone: String,
    dns_record_max_age: Duration,
    download_complete_callback: Option<DownloadCompleteCallback>,
}

impl UpdateConfigBuilder {
    /// Binds outbound connections to the given local address. IPv6 addresses
    /// are recognized by the presence of `:` in the textual form.
    pub fn local_ip(mut self, address: &str) -> Result<Self, ConfigError> {
        let parsed = address
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidLocalIp(address.to_owned()))?;
        self.local_ip = Some(parsed);
        Ok(self)
    }

    /// Overrides the default `sigdb/<version> (OS: .., ARCH: ..)` user agent.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Routes requests through an HTTP proxy.
    pub fn proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Retry count for transient patch download failures.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Timeout for establishing a connection.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Overall timeout for a single request.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Whether locally rebuilt archives are gzip compressed.
    pub fn compress_local_db(mut self, compress: bool) -> Self {
        self.compress_local_db = compress;
        self
    }

    /// DNS zone queried for per-database fallback TXT records
    /// (`<db>.cvd.<zone>`).
    pub fn dns_zone(mut self, zone: impl Into<String>) -> Self {
        self.dns_zone = zone.into();
        self
    }

    /// Maximum age of the per-database fallback TXT record before it is
    /// considered stale and ignored.
    pub fn dns_record_max_age(mut self, max_age: Duration) -> Self {
        self.dns_record_max_age = max_age;
        self
    }

    /// Installs a validation callback run against every fully downloaded
    /// archive before it replaces the installed file.
    pub fn download_complete_callback(mut self, callback: DownloadCompleteCallback) -> Self {
        self.download_complete_callback = Some(callback);
        self
    }

    /// Validates and freezes the configuration.
    pub fn build(self) -> Result<UpdateConfig, ConfigError> {
        if let Some(proxy) = &self.proxy {
            if proxy.port == 0 {
                return Err(ConfigError::InvalidProxyPort);
            }
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts);
        }

        Ok(UpdateConfig {
            local_ip: self.local_ip,
            user_agent: self.user_agent.unwrap_or_else(default_user_agent),
            proxy: self.proxy,
            temp_dir: self.temp_dir,
            database_dir: self.database_dir,
            max_attempts: self.max_attempts,
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            compress_local_db: self.compress_local_db,
            dns_zone: self.dns_zone,
            dns_record_max_age: self.dns_record_max_age,
            download_complete_callback: self.download_complete_callback,
        })
    }
}
