//! # Configuration
//!
//! Options controlling a [SafeFetcher](crate::SafeFetcher), loadable from
//! JSON or from environment variables

use std::{
    collections::BTreeSet,
    num::ParseIntError,
    str::{FromStr, ParseBoolError},
    time::Duration,
};

use ipnet::{AddrParseError, IpNet};
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use thiserror::Error;

use crate::policy::PolicyConfig;

/// Default user agent sent with requests
pub const DEFAULT_USER_AGENT: &str = concat!("pinfetch/", env!("CARGO_PKG_VERSION"));

/// Options for fetching
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Maximum number of redirects to follow
    ///
    /// Default: 5
    pub max_redirects: usize,

    /// Time allowed for resolving a hostname
    ///
    /// Default: 5s
    #[serde(rename = "resolution_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub resolution_timeout: Duration,

    /// Time allowed for establishing a connection
    ///
    /// Default: 5s
    #[serde(rename = "connect_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,

    /// Time allowed for a single request to complete, from connecting to
    /// reading the end of the response body
    ///
    /// Default: 30s
    #[serde(rename = "request_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,

    /// URL schemes that may be fetched
    ///
    /// Default: http, https
    pub allowed_schemes: BTreeSet<String>,

    /// Whether a redirect may move from https to a non TLS scheme
    ///
    /// Default: false
    pub allow_https_downgrade: bool,

    /// User agent sent with requests
    pub user_agent: String,

    /// Address policy configuration
    pub policy: PolicyConfig,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_redirects: 5,
            resolution_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            allowed_schemes: ["http".to_string(), "https".to_string()].into(),
            allow_https_downgrade: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            policy: PolicyConfig::default(),
        }
    }
}

/// Errors that could occur when loading the configuration
#[derive(Debug, Error)]
pub enum FetchOptionsError {
    /// Provided max redirects was an invalid number
    #[error("PINFETCH_MAX_REDIRECTS must be a number: {0}")]
    InvalidMaxRedirects(<usize as FromStr>::Err),
    /// Provided resolution timeout was an invalid number
    #[error("PINFETCH_RESOLUTION_TIMEOUT_MS must be a number in milliseconds: {0}")]
    InvalidResolutionTimeout(ParseIntError),
    /// Provided connect timeout was an invalid number
    #[error("PINFETCH_CONNECT_TIMEOUT_MS must be a number in milliseconds: {0}")]
    InvalidConnectTimeout(ParseIntError),
    /// Provided request timeout was an invalid number
    #[error("PINFETCH_REQUEST_TIMEOUT_MS must be a number in milliseconds: {0}")]
    InvalidRequestTimeout(ParseIntError),
    /// Provided downgrade flag was not a boolean
    #[error("PINFETCH_ALLOW_HTTPS_DOWNGRADE must be true or false: {0}")]
    InvalidAllowHttpsDowngrade(ParseBoolError),
    /// Provided allow list contained an invalid network
    #[error("PINFETCH_POLICY_ALLOW must be a comma separated list of CIDR ranges: {0}")]
    InvalidPolicyAllow(AddrParseError),
    /// Provided deny list contained an invalid network
    #[error("PINFETCH_POLICY_DENY must be a comma separated list of CIDR ranges: {0}")]
    InvalidPolicyDeny(AddrParseError),
}

impl FetchOptions {
    /// Load fetch options from environment variables, variables that are
    /// not set keep their default value
    pub fn from_env() -> Result<FetchOptions, FetchOptionsError> {
        let mut options = FetchOptions::default();

        if let Ok(max_redirects) = std::env::var("PINFETCH_MAX_REDIRECTS") {
            options.max_redirects = max_redirects
                .parse::<usize>()
                .map_err(FetchOptionsError::InvalidMaxRedirects)?;
        }

        if let Ok(timeout) = std::env::var("PINFETCH_RESOLUTION_TIMEOUT_MS") {
            let timeout = timeout
                .parse::<u64>()
                .map_err(FetchOptionsError::InvalidResolutionTimeout)?;
            options.resolution_timeout = Duration::from_millis(timeout);
        }

        if let Ok(timeout) = std::env::var("PINFETCH_CONNECT_TIMEOUT_MS") {
            let timeout = timeout
                .parse::<u64>()
                .map_err(FetchOptionsError::InvalidConnectTimeout)?;
            options.connect_timeout = Duration::from_millis(timeout);
        }

        if let Ok(timeout) = std::env::var("PINFETCH_REQUEST_TIMEOUT_MS") {
            let timeout = timeout
                .parse::<u64>()
                .map_err(FetchOptionsError::InvalidRequestTimeout)?;
            options.request_timeout = Duration::from_millis(timeout);
        }

        if let Ok(schemes) = std::env::var("PINFETCH_ALLOWED_SCHEMES") {
            options.allowed_schemes = split_list(&schemes)
                .map(|scheme| scheme.to_ascii_lowercase())
                .collect();
        }

        if let Ok(allow_downgrade) = std::env::var("PINFETCH_ALLOW_HTTPS_DOWNGRADE") {
            options.allow_https_downgrade = allow_downgrade
                .parse::<bool>()
                .map_err(FetchOptionsError::InvalidAllowHttpsDowngrade)?;
        }

        if let Ok(user_agent) = std::env::var("PINFETCH_USER_AGENT") {
            options.user_agent = user_agent;
        }

        if let Ok(allow) = std::env::var("PINFETCH_POLICY_ALLOW") {
            options.policy.allow =
                parse_networks(&allow).map_err(FetchOptionsError::InvalidPolicyAllow)?;
        }

        if let Ok(deny) = std::env::var("PINFETCH_POLICY_DENY") {
            options.policy.deny =
                parse_networks(&deny).map_err(FetchOptionsError::InvalidPolicyDeny)?;
        }

        if let Ok(hostnames) = std::env::var("PINFETCH_POLICY_DENY_HOSTNAMES") {
            options.policy.denied_hostnames =
                split_list(&hostnames).map(str::to_string).collect();
        }

        Ok(options)
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Parse a comma separated list of networks, single addresses are
/// accepted as host networks
fn parse_networks(value: &str) -> Result<Vec<IpNet>, AddrParseError> {
    split_list(value)
        .map(|network| match network.parse::<std::net::IpAddr>() {
            Ok(address) => Ok(IpNet::from(address)),
            Err(_) => network.parse::<IpNet>(),
        })
        .collect()
}
