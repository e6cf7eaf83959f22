//! Listener settings for the HTTP binding.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::ensure;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub host: String,
    /// 0 lets the OS pick; [`NetworkModule::start`](super::NetworkModule::start)
    /// returns the bound port.
    pub port: u16,
    pub tls: Option<TlsConfig>,
    /// `*` allows any origin.
    pub cors_origins: Vec<String>,
    /// Whole HTTP exchange, the Method Domain included.
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
}

/// PEM files for HTTPS.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            tls: None,
            cors_origins: vec!["*".into()],
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 1 << 20,
        }
    }
}

impl NetworkConfig {
    /// `host:port` as handed to the listener.
    #[must_use]
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// The URL peers and applications use to reach this listener.
    #[must_use]
    pub fn point_of_access(&self, advertised_host: &str) -> String {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        format!("{scheme}://{advertised_host}:{}", self.port)
    }

    /// # Errors
    ///
    /// Empty host, zero body limit or timeout, or TLS files that do not exist.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.host.is_empty(), "listener host is empty");
        ensure!(self.max_body_bytes > 0, "max_body_bytes must be positive");
        ensure!(!self.request_timeout.is_zero(), "request_timeout must be positive");
        if let Some(tls) = &self.tls {
            for path in [&tls.cert_path, &tls.key_path] {
                ensure!(path.is_file(), "TLS file {} not found", path.display());
            }
        }
        Ok(())
    }
}
