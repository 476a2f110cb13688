//! # Errors
//!
//! Fetch errors fall into two categories that must never be confused,
//! [FetchError::SsrfRejected] is a security decision and must not be
//! retried, [FetchError::FetchFailed] covers faults that may be transient

use std::fmt::Display;

use itertools::Itertools;
use serde::Serialize;
use thiserror::Error;

use crate::{
    dialer::ConnectError,
    policy::{DenyReason, PolicyVerdict},
    resolver::ResolutionError,
};

/// Errors that can occur when fetching
#[derive(Debug, Error)]
pub enum FetchError {
    /// Request was rejected by the SSRF policy
    #[error("request rejected: {0}")]
    SsrfRejected(Rejection),

    /// Request could not be completed
    #[error("fetch failed: {0}")]
    FetchFailed(FetchFailure),
}

impl FetchError {
    /// Whether a caller may retry the fetch
    ///
    /// Rejections are never retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::SsrfRejected(_) => false,
            FetchError::FetchFailed(failure) => failure.is_transient(),
        }
    }

    /// The rejection when the fetch was rejected
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            FetchError::SsrfRejected(rejection) => Some(rejection),
            FetchError::FetchFailed(_) => None,
        }
    }
}

impl From<Rejection> for FetchError {
    fn from(value: Rejection) -> Self {
        Self::SsrfRejected(value)
    }
}

impl From<FetchFailure> for FetchError {
    fn from(value: FetchFailure) -> Self {
        Self::FetchFailed(value)
    }
}

/// Security decisions that stopped a fetch
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    /// Hostname resolved to at least one denied address
    #[error("{hostname} resolved to denied addresses: {}", DeniedVerdicts(verdicts))]
    AddressDenied {
        /// Hostname that was rejected
        hostname: String,
        /// Verdict for every resolved address
        verdicts: Vec<PolicyVerdict>,
    },

    /// Hostname is on the deny list
    #[error("hostname {hostname} is denied by {entry} ({reason})")]
    HostnameDenied {
        /// Hostname that was rejected
        hostname: String,
        /// Deny list entry that matched
        entry: String,
        /// Category of the entry
        reason: DenyReason,
    },

    /// Redirect chain exceeded the maximum number of redirects
    #[error("too many redirects (max {max})")]
    TooManyRedirects {
        /// Maximum number of redirects
        max: usize,
    },

    /// URL scheme is not allowed
    #[error("scheme {scheme} is not allowed")]
    SchemeNotAllowed {
        /// The disallowed scheme
        scheme: String,
    },

    /// Redirect would move from TLS to plain text
    #[error("redirect from {from} to {to} would downgrade from https")]
    DowngradeRejected {
        /// URL that issued the redirect
        from: String,
        /// URL that was redirected to
        to: String,
    },
}

impl Rejection {
    /// Categories of every denied address or hostname in the rejection
    pub fn reasons(&self) -> Vec<DenyReason> {
        match self {
            Rejection::AddressDenied { verdicts, .. } => verdicts
                .iter()
                .filter_map(|verdict| verdict.denied_reason)
                .unique()
                .collect(),
            Rejection::HostnameDenied { reason, .. } => vec![*reason],
            _ => Vec::new(),
        }
    }
}

/// Formats only the denied verdicts of a list
struct DeniedVerdicts<'a>(&'a [PolicyVerdict]);

impl Display for DeniedVerdicts<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let denied = self
            .0
            .iter()
            .filter(|verdict| !verdict.is_allowed())
            .join(", ");
        f.write_str(&denied)
    }
}

/// Faults that stopped a fetch
#[derive(Debug, Error)]
pub enum FetchFailure {
    /// Hostname could not be resolved
    #[error(transparent)]
    Resolution(ResolutionError),

    /// Connection or request failed
    #[error(transparent)]
    Connect(ConnectError),

    /// URL could not be parsed or used
    #[error("invalid url {url}: {reason}")]
    InvalidUrl {
        /// The offending URL
        url: String,
        /// Why it is invalid
        reason: String,
    },

    /// Failed to read the response body
    #[error("failed to read response body")]
    ResponseBody(#[source] reqwest::Error),

    /// Fetch did not complete before its deadline
    #[error("fetch deadline exceeded")]
    DeadlineExceeded,
}

impl FetchFailure {
    /// Whether the failure may succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            FetchFailure::Resolution(error) => {
                !matches!(error, ResolutionError::MalformedName { .. })
            }
            FetchFailure::Connect(error) => error.is_transient(),
            FetchFailure::InvalidUrl { .. } => false,
            FetchFailure::ResponseBody(_) => true,
            FetchFailure::DeadlineExceeded => true,
        }
    }
}
