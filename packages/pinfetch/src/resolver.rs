//! # Resolver
//!
//! Hostname resolution. Returns every address the underlying mechanism
//! provides for a name, in the order it provided them, so that the policy
//! gets to see all of them

use std::{
    fmt::Display,
    future::Future,
    io,
    net::IpAddr,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use url::{Host, Url};

/// Maximum length of a full domain name
const MAX_NAME_LENGTH: usize = 253;

/// Maximum length of a single label within a domain name
const MAX_LABEL_LENGTH: usize = 63;

/// Domain resolution trait, the underlying mechanism used to turn a name
/// into addresses. Allows using a mock domain resolver for tests
pub trait DomainResolver: Send + Sync {
    /// Resolve all addresses for `host`
    ///
    /// Errors of kind [io::ErrorKind::TimedOut] are reported as timeouts,
    /// all other errors are treated as the name not being found
    fn resolve_domain(&self, host: &str) -> impl Future<Output = io::Result<Vec<IpAddr>>> + Send;
}

/// Resolver using the system resolver through tokio
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioDomainResolver;

impl DomainResolver for TokioDomainResolver {
    async fn resolve_domain(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addresses = tokio::net::lookup_host((host, 0)).await?;
        Ok(addresses.map(|address| address.ip()).collect())
    }
}

/// Errors that can occur while resolving a hostname
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionError {
    /// Name did not resolve to any address
    #[error("failed to resolve {hostname}: {message}")]
    NameNotFound {
        /// Hostname that failed to resolve
        hostname: String,
        /// Description of the failure from the resolver
        message: String,
    },

    /// Resolution did not complete in time
    #[error("timed out resolving {hostname} after {}ms", timeout.as_millis())]
    Timeout {
        /// Hostname that was being resolved
        hostname: String,
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// Name is not a syntactically valid hostname
    #[error("malformed hostname {hostname:?}: {reason}")]
    MalformedName {
        /// The malformed hostname
        hostname: String,
        /// Why the name was rejected
        reason: &'static str,
    },
}

/// Hostname captured from a URL
///
/// Names are stored exactly as they appear in the parsed URL (lowercase),
/// hosts that are IP literals keep their parsed address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Hostname {
    name: String,
    #[serde(skip)]
    literal: Option<IpAddr>,
}

impl Hostname {
    /// Parse a hostname from a string, IP literals are accepted with or
    /// without IPv6 brackets
    pub fn parse(value: &str) -> Result<Hostname, ResolutionError> {
        let bare = value
            .strip_prefix('[')
            .and_then(|value| value.strip_suffix(']'))
            .unwrap_or(value);

        if let Ok(address) = bare.parse::<IpAddr>() {
            return Ok(Hostname {
                name: address.to_string(),
                literal: Some(address),
            });
        }

        let name = value.to_ascii_lowercase();
        validate_name(&name).map_err(|reason| ResolutionError::MalformedName {
            hostname: value.to_string(),
            reason,
        })?;

        Ok(Hostname {
            name,
            literal: None,
        })
    }

    /// Capture the hostname of `url`
    pub fn from_url(url: &Url) -> Result<Hostname, ResolutionError> {
        match url.host() {
            Some(Host::Domain(domain)) => Self::parse(domain),
            Some(Host::Ipv4(address)) => Ok(Self::from_ip(IpAddr::V4(address))),
            Some(Host::Ipv6(address)) => Ok(Self::from_ip(IpAddr::V6(address))),
            None => Err(ResolutionError::MalformedName {
                hostname: String::new(),
                reason: "url has no host",
            }),
        }
    }

    fn from_ip(address: IpAddr) -> Hostname {
        Hostname {
            name: address.to_string(),
            literal: Some(address),
        }
    }

    /// The hostname as a string
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Address when the hostname is an IP literal
    pub fn as_ip(&self) -> Option<IpAddr> {
        self.literal
    }

    /// Whether `url` targets exactly this hostname
    pub fn matches_url(&self, url: &Url) -> bool {
        match (url.host(), self.literal) {
            (Some(Host::Domain(domain)), None) => domain.eq_ignore_ascii_case(&self.name),
            (Some(Host::Ipv4(address)), Some(literal)) => IpAddr::V4(address) == literal,
            (Some(Host::Ipv6(address)), Some(literal)) => IpAddr::V6(address) == literal,
            _ => false,
        }
    }
}

impl Display for Hostname {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

fn validate_name(name: &str) -> Result<(), &'static str> {
    // A single trailing dot marks a fully qualified name
    let name = name.strip_suffix('.').unwrap_or(name);

    if name.is_empty() {
        return Err("name is empty");
    }

    if name.len() > MAX_NAME_LENGTH {
        return Err("name is longer than 253 characters");
    }

    for label in name.split('.') {
        if label.is_empty() {
            return Err("name contains an empty label");
        }

        if label.len() > MAX_LABEL_LENGTH {
            return Err("label is longer than 63 characters");
        }

        if !label
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
        {
            return Err("label contains invalid characters");
        }

        if label.starts_with('-') || label.ends_with('-') {
            return Err("label starts or ends with a hyphen");
        }
    }

    Ok(())
}

/// Address family of a resolved address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

/// Where a resolved address came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordKind {
    /// IPv4 address record
    A,
    /// IPv6 address record
    Aaaa,
    /// The hostname was itself an IP literal, no lookup was performed
    Literal,
}

/// Address resolved for a hostname
///
/// Only produced by the [Resolver], there is no way to construct one from
/// user supplied input
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAddress {
    address: IpAddr,
    record: RecordKind,
    hostname: Hostname,
}

impl ResolvedAddress {
    fn resolved(hostname: &Hostname, address: IpAddr) -> Self {
        let record = match address {
            IpAddr::V4(_) => RecordKind::A,
            IpAddr::V6(_) => RecordKind::Aaaa,
        };

        Self {
            address,
            record,
            hostname: hostname.clone(),
        }
    }

    /// The resolved address
    pub fn ip(&self) -> IpAddr {
        self.address
    }

    /// Family of the address
    pub fn family(&self) -> AddressFamily {
        match self.address {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// Record kind the address came from
    pub fn record(&self) -> RecordKind {
        self.record
    }

    /// Hostname the address was resolved for
    pub fn hostname(&self) -> &Hostname {
        &self.hostname
    }
}

/// Every address resolved for a hostname during one resolution
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionResult {
    hostname: Hostname,
    addresses: Vec<ResolvedAddress>,
    resolved_at: DateTime<Utc>,
}

impl ResolutionResult {
    /// Hostname that was resolved
    pub fn hostname(&self) -> &Hostname {
        &self.hostname
    }

    /// Addresses in resolution order, never empty
    pub fn addresses(&self) -> &[ResolvedAddress] {
        &self.addresses
    }

    /// When the resolution completed
    pub fn resolved_at(&self) -> DateTime<Utc> {
        self.resolved_at
    }
}

/// Resolves hostnames through a [DomainResolver] enforcing a timeout
#[derive(Debug, Clone)]
pub struct Resolver<D = TokioDomainResolver> {
    inner: D,
    timeout: Duration,
}

impl Resolver {
    /// Resolver using the system resolver
    pub fn new(timeout: Duration) -> Self {
        Self::with_resolver(TokioDomainResolver, timeout)
    }
}

impl<D: DomainResolver> Resolver<D> {
    /// Resolver using the provided underlying mechanism
    pub fn with_resolver(inner: D, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// The underlying resolution mechanism
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Resolve every address for `hostname`
    ///
    /// IP literals resolve to themselves without performing a lookup
    #[tracing::instrument(skip_all, fields(hostname = %hostname))]
    pub async fn resolve(&self, hostname: &Hostname) -> Result<ResolutionResult, ResolutionError> {
        if let Some(address) = hostname.as_ip() {
            return Ok(ResolutionResult {
                hostname: hostname.clone(),
                addresses: vec![ResolvedAddress {
                    address,
                    record: RecordKind::Literal,
                    hostname: hostname.clone(),
                }],
                resolved_at: Utc::now(),
            });
        }

        let lookup = self.inner.resolve_domain(hostname.as_str());
        let addresses = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(addresses)) => addresses,
            Ok(Err(error)) if error.kind() == io::ErrorKind::TimedOut => {
                return Err(ResolutionError::Timeout {
                    hostname: hostname.to_string(),
                    timeout: self.timeout,
                });
            }
            Ok(Err(error)) => {
                tracing::debug!(?error, "failed to resolve hostname");
                return Err(ResolutionError::NameNotFound {
                    hostname: hostname.to_string(),
                    message: error.to_string(),
                });
            }
            Err(_) => {
                return Err(ResolutionError::Timeout {
                    hostname: hostname.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        if addresses.is_empty() {
            return Err(ResolutionError::NameNotFound {
                hostname: hostname.to_string(),
                message: "no addresses returned".to_string(),
            });
        }

        tracing::debug!(?addresses, "resolved hostname");

        Ok(ResolutionResult {
            hostname: hostname.clone(),
            addresses: addresses
                .into_iter()
                .map(|address| ResolvedAddress::resolved(hostname, address))
                .collect(),
            resolved_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::{DomainResolver, Hostname, RecordKind, ResolutionError, Resolver};
    use std::{io, net::IpAddr, time::Duration};

    struct MockDomainResolver;

    impl DomainResolver for MockDomainResolver {
        async fn resolve_domain(&self, host: &str) -> io::Result<Vec<IpAddr>> {
            match host {
                "dual.example.com" => Ok(vec![
                    "2001:db8::1".parse().unwrap(),
                    "93.184.216.34".parse().unwrap(),
                    "2001:db8::1".parse().unwrap(),
                ]),
                "empty.example.com" => Ok(vec![]),
                "slow.example.com" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(vec![])
                }
                "timeout.example.com" => Err(io::Error::from(io::ErrorKind::TimedOut)),
                _ => Err(io::Error::new(io::ErrorKind::NotFound, "nxdomain")),
            }
        }
    }

    fn resolver() -> Resolver<MockDomainResolver> {
        Resolver::with_resolver(MockDomainResolver, Duration::from_millis(100))
    }

    /// Every address is kept in order, no deduplication or family filtering
    #[tokio::test]
    async fn test_resolve_all_addresses() {
        let hostname = Hostname::parse("dual.example.com").unwrap();
        let result = resolver().resolve(&hostname).await.unwrap();

        let records: Vec<_> = result
            .addresses()
            .iter()
            .map(|address| (address.ip().to_string(), address.record()))
            .collect();

        assert_eq!(
            records,
            vec![
                ("2001:db8::1".to_string(), RecordKind::Aaaa),
                ("93.184.216.34".to_string(), RecordKind::A),
                ("2001:db8::1".to_string(), RecordKind::Aaaa),
            ]
        );
        assert!(
            result
                .addresses()
                .iter()
                .all(|address| address.hostname() == &hostname)
        );
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let hostname = Hostname::parse("[::1]").unwrap();
        let result = resolver().resolve(&hostname).await.unwrap();

        assert_eq!(result.addresses().len(), 1);
        assert_eq!(result.addresses()[0].record(), RecordKind::Literal);
        assert_eq!(
            result.addresses()[0].ip(),
            "::1".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_resolve_not_found() {
        let hostname = Hostname::parse("missing.example.com").unwrap();
        let error = resolver().resolve(&hostname).await.unwrap_err();
        assert!(matches!(error, ResolutionError::NameNotFound { .. }));

        let hostname = Hostname::parse("empty.example.com").unwrap();
        let error = resolver().resolve(&hostname).await.unwrap_err();
        assert!(matches!(error, ResolutionError::NameNotFound { .. }));
    }

    #[tokio::test]
    async fn test_resolve_timeout() {
        let hostname = Hostname::parse("slow.example.com").unwrap();
        let error = resolver().resolve(&hostname).await.unwrap_err();
        assert!(matches!(error, ResolutionError::Timeout { .. }));

        let hostname = Hostname::parse("timeout.example.com").unwrap();
        let error = resolver().resolve(&hostname).await.unwrap_err();
        assert!(matches!(error, ResolutionError::Timeout { .. }));
    }

    #[test]
    fn test_malformed_names() {
        let long_label = "a".repeat(64);
        let long_name = ["abcdefghi"; 26].join(".");

        for name in [
            "",
            ".",
            "example..com",
            "-example.com",
            "example-.com",
            "exa mple.com",
            "example.com/path",
            long_label.as_str(),
            long_name.as_str(),
        ] {
            assert!(
                matches!(
                    Hostname::parse(name),
                    Err(ResolutionError::MalformedName { .. })
                ),
                "{name:?}"
            );
        }
    }

    #[test]
    fn test_valid_names() {
        for name in ["example.com", "example.com.", "_srv.example.com", "localhost"] {
            assert!(Hostname::parse(name).is_ok(), "{name:?}");
        }

        assert_eq!(Hostname::parse("EXAMPLE.com").unwrap().as_str(), "example.com");
    }

    #[test]
    fn test_matches_url() {
        let hostname = Hostname::parse("example.com").unwrap();
        assert!(hostname.matches_url(&"https://example.com/a".parse().unwrap()));
        assert!(!hostname.matches_url(&"https://example.org/a".parse().unwrap()));
        assert!(!hostname.matches_url(&"https://example.com./a".parse().unwrap()));

        let hostname = Hostname::parse("::1").unwrap();
        assert!(hostname.matches_url(&"http://[::1]:8080/".parse().unwrap()));
        assert!(!hostname.matches_url(&"http://127.0.0.1/".parse().unwrap()));
    }
}
