#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Pinfetch
//!
//! HTTP fetching that is safe against server side request forgery. A URL is
//! validated by resolving its hostname once and checking every resolved
//! address against an [AddressPolicy]. The connection is then made to
//! exactly the address that was validated, so the hostname cannot resolve
//! to something else between the check and the connection. Redirects go
//! through the same validation and pinning as the first request.
//!
//! ```no_run
//! # async fn run() -> Result<(), pinfetch::FetchError> {
//! let fetcher = pinfetch::SafeFetcher::new();
//! let response = fetcher.get("https://example.com/").await?;
//! println!("{} from {}", response.status, response.remote_addr);
//! # Ok(())
//! # }
//! ```
//!
//! ## Environment Variables
//!
//! Loaded by [FetchOptions::from_env]
//!
//! * `PINFETCH_MAX_REDIRECTS` - Maximum number of redirects to follow
//! * `PINFETCH_RESOLUTION_TIMEOUT_MS` - Timeout for resolving a hostname
//! * `PINFETCH_CONNECT_TIMEOUT_MS` - Timeout for establishing a connection
//! * `PINFETCH_REQUEST_TIMEOUT_MS` - Timeout for a single request including its body
//! * `PINFETCH_ALLOWED_SCHEMES` - Comma separated URL schemes that may be fetched
//! * `PINFETCH_ALLOW_HTTPS_DOWNGRADE` - Whether redirects may leave https
//! * `PINFETCH_USER_AGENT` - User agent sent with requests
//! * `PINFETCH_POLICY_ALLOW` - Comma separated networks that are always allowed
//! * `PINFETCH_POLICY_DENY` - Comma separated networks that are additionally denied
//! * `PINFETCH_POLICY_DENY_HOSTNAMES` - Comma separated hostnames that are denied

pub mod config;
pub mod dialer;
pub mod error;
pub mod fetcher;
pub mod policy;
pub mod redirect;
pub mod resolver;
pub mod validator;

pub use config::{FetchOptions, FetchOptionsError};
pub use error::{FetchError, FetchFailure, Rejection};
pub use fetcher::{
    AttemptObserver, FetchAttempt, FetchRequest, FetchResponse, SafeFetcher, TracingObserver,
};
pub use policy::{AddressPolicy, DenyReason, PolicyConfig, PolicyVerdict};
pub use resolver::{DomainResolver, Hostname, TokioDomainResolver};
pub use url::Url;
pub use validator::{ValidatedTarget, ValidationOutcome, Validator};

/// Fetch `url` with the provided `options` using the system resolver
pub async fn fetch(url: &str, options: FetchOptions) -> Result<FetchResponse, FetchError> {
    SafeFetcher::from_options(options).get(url).await
}
