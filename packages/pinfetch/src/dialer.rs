//! # Pinned Dialer
//!
//! Establishes connections to the exact address a [ValidatedTarget] was
//! validated against. The hostname is never handed to a resolver again,
//! it is only used for the `Host` header and for TLS server name
//! verification.
//!
//! Each connection is a dedicated HTTP client where the validated hostname
//! is overridden to resolve to the pinned address. Proxies and automatic
//! redirects are disabled, a proxy would perform its own resolution of the
//! hostname and redirects must go back through validation.

use std::{
    error::Error as StdError,
    io,
    net::SocketAddr,
    time::Duration,
};

use bytes::Bytes;
use http::{HeaderMap, Method};
use thiserror::Error;
use url::Url;

use crate::validator::ValidatedTarget;

/// Errors that can occur when connecting to a validated target
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Remote refused the connection
    #[error("connection to {address} was refused")]
    Refused {
        /// Address that refused the connection
        address: SocketAddr,
    },

    /// Connecting or receiving the response took too long
    #[error("connection to {address} timed out")]
    Timeout {
        /// Address that was being connected to
        address: SocketAddr,
    },

    /// TLS certificate did not verify for the hostname
    #[error("tls verification for {hostname} failed: {message}")]
    TlsVerifyFailed {
        /// Hostname the certificate was verified against
        hostname: String,
        /// Error reported by the TLS implementation
        message: String,
    },

    /// Request URL does not match the target the connection is pinned to
    #[error("{url} does not match the pinned target {hostname}:{port}")]
    TargetMismatch {
        /// Requested URL
        url: String,
        /// Hostname the connection is pinned to
        hostname: String,
        /// Port the connection is pinned to
        port: u16,
    },

    /// Failed to create the HTTP client
    #[error("failed to create http client")]
    Client(#[source] reqwest::Error),

    /// Any other error while performing the request
    #[error("request to {address} failed")]
    Request {
        /// Address that was connected to
        address: SocketAddr,
        /// Underlying error
        #[source]
        source: reqwest::Error,
    },
}

impl ConnectError {
    /// Whether the error is a transient fault that may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectError::Refused { .. } | ConnectError::Timeout { .. }
        )
    }
}

/// Creates connections pinned to validated addresses
#[derive(Debug, Clone)]
pub struct PinnedDialer {
    connect_timeout: Duration,
    request_timeout: Duration,
    user_agent: String,
}

impl PinnedDialer {
    /// Create a new dialer
    pub fn new(connect_timeout: Duration, request_timeout: Duration, user_agent: String) -> Self {
        Self {
            connect_timeout,
            request_timeout,
            user_agent,
        }
    }

    /// Create a connection to `target` on `port`
    ///
    /// The connection will only ever dial the chosen address of the target,
    /// when `use_tls` is set the server certificate is verified against the
    /// target hostname
    pub fn connect(
        &self,
        target: &ValidatedTarget,
        port: u16,
        use_tls: bool,
    ) -> Result<PinnedConnection, ConnectError> {
        let address = SocketAddr::new(target.chosen_address().ip(), port);

        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .https_only(use_tls)
            .user_agent(self.user_agent.as_str())
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .pool_max_idle_per_host(0);

        // IP literal hosts are dialed directly and need no override
        if target.hostname().as_ip().is_none() {
            builder = builder.resolve_to_addrs(target.hostname().as_str(), &[address]);
        }

        let client = builder.build().map_err(ConnectError::Client)?;

        tracing::debug!(
            hostname = %target.hostname(),
            %address,
            use_tls,
            "created pinned connection"
        );

        Ok(PinnedConnection {
            client,
            target: target.clone(),
            address,
            use_tls,
        })
    }
}

/// Connection pinned to a single validated (hostname, address, port)
#[derive(Debug)]
pub struct PinnedConnection {
    client: reqwest::Client,
    target: ValidatedTarget,
    address: SocketAddr,
    use_tls: bool,
}

impl PinnedConnection {
    /// Address the connection dials
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Target the connection was created for
    pub fn target(&self) -> &ValidatedTarget {
        &self.target
    }

    /// Send a request over the connection
    ///
    /// The `url` must have the pinned hostname, port and a scheme matching
    /// the TLS mode of the connection
    pub async fn send(
        &self,
        method: Method,
        url: &Url,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response, ConnectError> {
        let scheme_matches = match url.scheme() {
            "https" => self.use_tls,
            "http" => !self.use_tls,
            _ => false,
        };

        if !scheme_matches
            || !self.target.hostname().matches_url(url)
            || url.port_or_known_default() != Some(self.address.port())
        {
            return Err(ConnectError::TargetMismatch {
                url: url.to_string(),
                hostname: self.target.hostname().to_string(),
                port: self.address.port(),
            });
        }

        let mut request = self.client.request(method, url.clone()).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }

        request
            .send()
            .await
            .map_err(|error| self.classify_error(error))
    }

    fn classify_error(&self, error: reqwest::Error) -> ConnectError {
        if error.is_timeout() {
            return ConnectError::Timeout {
                address: self.address,
            };
        }

        match inspect_cause(&error) {
            Some(Cause::Tls(message)) => ConnectError::TlsVerifyFailed {
                hostname: self.target.hostname().to_string(),
                message,
            },
            Some(Cause::Refused) => ConnectError::Refused {
                address: self.address,
            },
            Some(Cause::TimedOut) => ConnectError::Timeout {
                address: self.address,
            },
            None => ConnectError::Request {
                address: self.address,
                source: error,
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Cause {
    Tls(String),
    Refused,
    TimedOut,
}

/// Walk the error sources looking for a TLS or socket level cause
fn inspect_cause(error: &(dyn StdError + 'static)) -> Option<Cause> {
    std::iter::successors(Some(error), |&error| error.source()).find_map(inspect_error)
}

fn inspect_error(error: &(dyn StdError + 'static)) -> Option<Cause> {
    if let Some(tls) = error.downcast_ref::<rustls::Error>() {
        return Some(Cause::Tls(tls.to_string()));
    }

    let io = error.downcast_ref::<io::Error>()?;

    // io errors hide their payload from `source` and may wrap further io errors
    if let Some(cause) = io.get_ref().and_then(|inner| inspect_error(inner)) {
        return Some(cause);
    }

    match io.kind() {
        io::ErrorKind::ConnectionRefused => Some(Cause::Refused),
        io::ErrorKind::TimedOut => Some(Cause::TimedOut),
        _ => None,
    }
}
