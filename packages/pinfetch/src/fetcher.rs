//! # Safe Fetcher
//!
//! Orchestrates validation, pinned connections and redirect handling into
//! a single fetch. Every hop of a fetch is recorded as a [FetchAttempt] and
//! reported to an [AttemptObserver]

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header::HOST};
use serde::Serialize;
use url::Url;

use crate::{
    config::FetchOptions,
    dialer::PinnedDialer,
    error::{FetchError, FetchFailure, Rejection},
    policy::AddressPolicy,
    redirect::{HopRequest, RedirectDecision, RedirectGuard},
    resolver::{DomainResolver, Hostname, Resolver, TokioDomainResolver},
    validator::{RejectReason, ValidationOutcome, Validator},
};

/// Request to fetch
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// URL to fetch, validated before use
    pub url: String,
    /// Request method
    pub method: Method,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Option<Bytes>,
}

impl FetchRequest {
    /// Create a request using `method` for `url`
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a GET request for `url`
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Add a header to the request
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the request body
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Final response of a fetch
#[derive(Debug)]
pub struct FetchResponse {
    /// Response status
    pub status: StatusCode,
    /// URL the response was fetched from, after redirects
    pub url: Url,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
    /// Address the response was received from
    pub remote_addr: SocketAddr,
    /// Every hop of the fetch in order
    pub attempts: Vec<FetchAttempt>,
}

/// One hop of a fetch
#[derive(Debug, Clone, Serialize)]
pub struct FetchAttempt {
    /// URL requested by this hop
    pub url: String,
    /// Method used for this hop
    pub method: String,
    /// Hostname of the URL
    pub hostname: Option<String>,
    /// Validation outcome, absent when the hop failed before validation
    pub validation: Option<ValidationOutcome>,
    /// Address the request was sent to
    pub remote_addr: Option<SocketAddr>,
    /// Response status
    pub status: Option<u16>,
    /// Redirect target followed from this hop
    pub redirect_to: Option<String>,
    /// Error that ended the fetch at this hop
    pub error: Option<String>,
    /// When the hop started
    pub started_at: DateTime<Utc>,
}

impl FetchAttempt {
    fn start(request: &HopRequest) -> Self {
        Self {
            url: request.url.to_string(),
            method: request.method.to_string(),
            hostname: request.url.host_str().map(str::to_string),
            validation: None,
            remote_addr: None,
            status: None,
            redirect_to: None,
            error: None,
            started_at: Utc::now(),
        }
    }

    /// Attempt for a URL that could not be parsed, nothing was validated
    /// or sent
    fn unparsed(url: &str, method: &Method) -> Self {
        Self {
            url: url.to_string(),
            method: method.to_string(),
            hostname: None,
            validation: None,
            remote_addr: None,
            status: None,
            redirect_to: None,
            error: None,
            started_at: Utc::now(),
        }
    }

    /// Whether validation of this hop succeeded
    pub fn is_validated(&self) -> bool {
        self.validation
            .as_ref()
            .is_some_and(ValidationOutcome::is_validated)
    }
}

/// Receives every [FetchAttempt] as it completes
pub trait AttemptObserver: Send + Sync {
    /// Called once for each completed attempt
    fn on_attempt(&self, attempt: &FetchAttempt);
}

/// Observer emitting attempts as tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl AttemptObserver for TracingObserver {
    fn on_attempt(&self, attempt: &FetchAttempt) {
        let address = match &attempt.validation {
            Some(ValidationOutcome::Validated(target)) => Some(target.chosen_address().ip()),
            _ => None,
        };

        match &attempt.validation {
            Some(ValidationOutcome::Rejected { reason, .. }) => {
                tracing::warn!(
                    url = %attempt.url,
                    hostname = ?attempt.hostname,
                    ?reason,
                    error = ?attempt.error,
                    "fetch attempt rejected"
                );
            }
            _ => {
                tracing::info!(
                    url = %attempt.url,
                    method = %attempt.method,
                    hostname = ?attempt.hostname,
                    ?address,
                    remote_addr = ?attempt.remote_addr,
                    status = ?attempt.status,
                    redirect_to = ?attempt.redirect_to,
                    error = ?attempt.error,
                    "fetch attempt"
                );
            }
        }
    }
}

/// Fetches URLs only after validating them, connecting to exactly the
/// address that was validated and validating every redirect again
pub struct SafeFetcher<D = TokioDomainResolver> {
    validator: Validator<D>,
    dialer: PinnedDialer,
    guard: RedirectGuard,
    observer: Arc<dyn AttemptObserver>,
}

impl Default for SafeFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SafeFetcher {
    /// Create a fetcher with the default options
    pub fn new() -> Self {
        Self::from_options(FetchOptions::default())
    }

    /// Create a fetcher from the provided options using the system resolver
    pub fn from_options(options: FetchOptions) -> Self {
        Self::with_resolver(options, TokioDomainResolver)
    }
}

impl<D: DomainResolver> SafeFetcher<D> {
    /// Create a fetcher from the provided options using `resolver` for
    /// hostname resolution
    pub fn with_resolver(options: FetchOptions, resolver: D) -> Self {
        let policy = AddressPolicy::from_config(&options.policy);
        let validator = Validator::new(
            Resolver::with_resolver(resolver, options.resolution_timeout),
            Arc::new(policy),
        );
        let dialer = PinnedDialer::new(
            options.connect_timeout,
            options.request_timeout,
            options.user_agent,
        );
        let guard = RedirectGuard::new(
            options.max_redirects,
            options.allowed_schemes,
            options.allow_https_downgrade,
        );

        Self {
            validator,
            dialer,
            guard,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Replace the address policy
    pub fn with_policy(self, policy: AddressPolicy) -> Self {
        let Self {
            validator,
            dialer,
            guard,
            observer,
        } = self;

        Self {
            validator: validator.with_policy(Arc::new(policy)),
            dialer,
            guard,
            observer,
        }
    }

    /// Replace the attempt observer
    pub fn with_observer<O: AttemptObserver + 'static>(mut self, observer: O) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Validator used by the fetcher
    pub fn validator(&self) -> &Validator<D> {
        &self.validator
    }

    /// Validate `url` without fetching it
    ///
    /// The outcome is informational, fetching always validates again
    pub async fn check(&self, url: &str) -> Result<ValidationOutcome, FetchError> {
        let url = parse_url(url)?;
        self.guard.check_scheme(&url)?;

        let hostname = Hostname::from_url(&url).map_err(FetchFailure::Resolution)?;
        Ok(self.validator.validate(&hostname).await)
    }

    /// GET the provided `url`
    pub async fn get(&self, url: &str) -> Result<FetchResponse, FetchError> {
        self.fetch(FetchRequest::get(url)).await
    }

    /// Fetch `request` failing with [FetchFailure::DeadlineExceeded] when
    /// the fetch has not completed by `deadline`
    pub async fn fetch_with_deadline(
        &self,
        request: FetchRequest,
        deadline: tokio::time::Instant,
    ) -> Result<FetchResponse, FetchError> {
        tokio::time::timeout_at(deadline, self.fetch(request))
            .await
            .map_err(|_| FetchFailure::DeadlineExceeded)?
    }

    /// Fetch `request`, following redirects
    #[tracing::instrument(skip_all, fields(url = %request.url, method = %request.method))]
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let mut attempts = Vec::new();

        let url = match parse_url(&request.url) {
            Ok(value) => value,
            Err(failure) => {
                let error = FetchError::from(failure);
                let attempt = FetchAttempt::unparsed(&request.url, &request.method);
                self.complete_attempt(&mut attempts, attempt, Some(&error));
                return Err(error);
            }
        };

        let mut headers = request.headers;
        // Host always comes from the validated url
        headers.remove(HOST);

        let mut hop = HopRequest {
            url,
            method: request.method,
            headers,
            body: request.body,
        };

        let mut followed = 0;

        loop {
            let mut attempt = FetchAttempt::start(&hop);

            let result = self.execute_hop(&hop, &mut attempt).await;
            let (response, remote_addr) = match result {
                Ok(value) => value,
                Err(error) => {
                    self.complete_attempt(&mut attempts, attempt, Some(&error));
                    return Err(error);
                }
            };

            let status = response.status();
            attempt.status = Some(status.as_u16());

            let decision = match self
                .guard
                .next_hop(&hop, status, response.headers(), followed)
            {
                Ok(value) => value,
                Err(error) => {
                    self.complete_attempt(&mut attempts, attempt, Some(&error));
                    return Err(error);
                }
            };

            match decision {
                RedirectDecision::Follow(next) => {
                    tracing::debug!(location = %next.url, %status, "following redirect");
                    attempt.redirect_to = Some(next.url.to_string());
                    self.complete_attempt(&mut attempts, attempt, None);

                    followed += 1;
                    hop = next;
                }

                RedirectDecision::Final => {
                    let headers = response.headers().clone();

                    let body = match response.bytes().await {
                        Ok(value) => value,
                        Err(cause) => {
                            let error =
                                FetchError::FetchFailed(FetchFailure::ResponseBody(cause));
                            self.complete_attempt(&mut attempts, attempt, Some(&error));
                            return Err(error);
                        }
                    };

                    self.complete_attempt(&mut attempts, attempt, None);

                    return Ok(FetchResponse {
                        status,
                        url: hop.url,
                        headers,
                        body,
                        remote_addr,
                        attempts,
                    });
                }
            }
        }
    }

    /// Validate, connect and send a single hop
    async fn execute_hop(
        &self,
        hop: &HopRequest,
        attempt: &mut FetchAttempt,
    ) -> Result<(reqwest::Response, SocketAddr), FetchError> {
        self.guard.check_scheme(&hop.url)?;

        let hostname = Hostname::from_url(&hop.url).map_err(FetchFailure::Resolution)?;
        let port = hop
            .url
            .port_or_known_default()
            .ok_or_else(|| FetchFailure::InvalidUrl {
                url: hop.url.to_string(),
                reason: "unable to determine port".to_string(),
            })?;

        let outcome = self.validator.validate(&hostname).await;
        attempt.validation = Some(outcome.clone());

        let target = match outcome {
            ValidationOutcome::Validated(target) => target,
            ValidationOutcome::Rejected { hostname, reason } => {
                return Err(rejection_error(&hostname, reason));
            }
        };

        let use_tls = hop.url.scheme() == "https";
        let connection = self
            .dialer
            .connect(&target, port, use_tls)
            .map_err(FetchFailure::Connect)?;

        attempt.remote_addr = Some(connection.address());

        let response = connection
            .send(
                hop.method.clone(),
                &hop.url,
                hop.headers.clone(),
                hop.body.clone(),
            )
            .await
            .map_err(FetchFailure::Connect)?;

        let remote_addr = response.remote_addr().unwrap_or(connection.address());
        attempt.remote_addr = Some(remote_addr);

        Ok((response, remote_addr))
    }

    fn complete_attempt(
        &self,
        attempts: &mut Vec<FetchAttempt>,
        mut attempt: FetchAttempt,
        error: Option<&FetchError>,
    ) {
        attempt.error = error.map(|error| error.to_string());
        self.observer.on_attempt(&attempt);
        attempts.push(attempt);
    }
}

fn parse_url(url: &str) -> Result<Url, FetchFailure> {
    Url::parse(url).map_err(|error| FetchFailure::InvalidUrl {
        url: url.to_string(),
        reason: error.to_string(),
    })
}

fn rejection_error(hostname: &Hostname, reason: RejectReason) -> FetchError {
    match reason {
        // Failing to resolve is a fault, not a security decision
        RejectReason::Resolution { error } => {
            FetchError::FetchFailed(FetchFailure::Resolution(error))
        }
        RejectReason::DeniedHostname { entry, reason } => {
            FetchError::SsrfRejected(Rejection::HostnameDenied {
                hostname: hostname.to_string(),
                entry,
                reason,
            })
        }
        RejectReason::Policy { verdicts } => FetchError::SsrfRejected(Rejection::AddressDenied {
            hostname: hostname.to_string(),
            verdicts,
        }),
    }
}
