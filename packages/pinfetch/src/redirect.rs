//! # Redirect Guard
//!
//! Decides whether a redirect response may be followed. A redirect target
//! is never trusted because an earlier hop was, the fetcher sends every
//! followed target back through validation and a fresh pinned connection

use std::collections::BTreeSet;

use bytes::Bytes;
use http::{
    HeaderMap, Method, StatusCode,
    header::{AUTHORIZATION, COOKIE, LOCATION, PROXY_AUTHORIZATION},
};
use url::Url;

use crate::error::{FetchError, FetchFailure, Rejection};

/// Request that will be sent for the next hop
#[derive(Debug, Clone)]
pub struct HopRequest {
    /// Target of the hop
    pub url: Url,
    /// Request method
    pub method: Method,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Option<Bytes>,
}

/// Decision for a response
#[derive(Debug)]
pub enum RedirectDecision {
    /// Response is not a followable redirect, it is the final response
    Final,
    /// Response is a redirect that should be followed with this request
    Follow(HopRequest),
}

/// Enforces the redirect policy for a fetch
#[derive(Debug, Clone)]
pub struct RedirectGuard {
    max_redirects: usize,
    allowed_schemes: BTreeSet<String>,
    allow_https_downgrade: bool,
}

impl RedirectGuard {
    /// Create a new guard
    pub fn new(
        max_redirects: usize,
        allowed_schemes: BTreeSet<String>,
        allow_https_downgrade: bool,
    ) -> Self {
        Self {
            max_redirects,
            allowed_schemes,
            allow_https_downgrade,
        }
    }

    /// Maximum number of redirects that will be followed
    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    /// Ensure the scheme of `url` is allowed
    pub fn check_scheme(&self, url: &Url) -> Result<(), Rejection> {
        if !self.allowed_schemes.contains(url.scheme()) {
            return Err(Rejection::SchemeNotAllowed {
                scheme: url.scheme().to_string(),
            });
        }

        Ok(())
    }

    /// Decide what to do with a response to `request`, `followed` is the
    /// number of redirects already followed for this fetch
    pub fn next_hop(
        &self,
        request: &HopRequest,
        status: StatusCode,
        headers: &HeaderMap,
        followed: usize,
    ) -> Result<RedirectDecision, FetchError> {
        if !is_followed_status(status) {
            return Ok(RedirectDecision::Final);
        }

        // Redirect statuses without a location cannot be followed
        let Some(location) = headers.get(LOCATION) else {
            return Ok(RedirectDecision::Final);
        };

        if followed >= self.max_redirects {
            return Err(FetchError::SsrfRejected(Rejection::TooManyRedirects {
                max: self.max_redirects,
            }));
        }

        let location = location.to_str().map_err(|_| {
            FetchError::FetchFailed(FetchFailure::InvalidUrl {
                url: String::from_utf8_lossy(location.as_bytes()).into_owned(),
                reason: "location header is not valid text".to_string(),
            })
        })?;

        // Relative locations resolve against the current url
        let next = request.url.join(location).map_err(|error| {
            FetchError::FetchFailed(FetchFailure::InvalidUrl {
                url: location.to_string(),
                reason: error.to_string(),
            })
        })?;

        self.check_scheme(&next)?;

        let downgrade = request.url.scheme() == "https" && next.scheme() != "https";
        if downgrade && !self.allow_https_downgrade {
            return Err(FetchError::SsrfRejected(Rejection::DowngradeRejected {
                from: request.url.to_string(),
                to: next.to_string(),
            }));
        }

        let (method, body) = match status {
            StatusCode::SEE_OTHER => (downgrade_method(&request.method), None),
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND if request.method == Method::POST => {
                (Method::GET, None)
            }
            _ => (request.method.clone(), request.body.clone()),
        };

        let mut headers = request.headers.clone();

        // Credentials are not carried to another origin
        if next.origin() != request.url.origin() {
            headers.remove(AUTHORIZATION);
            headers.remove(COOKIE);
            headers.remove(PROXY_AUTHORIZATION);
        }

        if body.is_none() {
            headers.remove(http::header::CONTENT_LENGTH);
            headers.remove(http::header::CONTENT_TYPE);
        }

        Ok(RedirectDecision::Follow(HopRequest {
            url: next,
            method,
            headers,
            body,
        }))
    }
}

fn is_followed_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// 303 responses are fetched with GET, HEAD is kept as is
fn downgrade_method(method: &Method) -> Method {
    if method == Method::HEAD {
        Method::HEAD
    } else {
        Method::GET
    }
}
