//! # Validator
//!
//! Resolves a hostname exactly once and evaluates every resolved address
//! against the [AddressPolicy]. A hostname is only validated when every one
//! of its addresses is allowed.
//!
//! The product of a successful validation is a [ValidatedTarget], the only
//! value the [PinnedDialer](crate::dialer::PinnedDialer) will connect to

use std::sync::Arc;

use serde::Serialize;

use crate::{
    policy::{AddressPolicy, DenyReason, PolicyVerdict},
    resolver::{
        DomainResolver, Hostname, ResolutionError, ResolutionResult, ResolvedAddress, Resolver,
        TokioDomainResolver,
    },
};

/// Hostname together with the address it was validated against
///
/// Has no public constructor, the only way to obtain one is from
/// [Validator::validate]
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedTarget {
    hostname: Hostname,
    chosen: ResolvedAddress,
    #[serde(skip)]
    resolution: ResolutionResult,
}

impl ValidatedTarget {
    /// Hostname that was validated
    pub fn hostname(&self) -> &Hostname {
        &self.hostname
    }

    /// Address chosen for the connection
    pub fn chosen_address(&self) -> &ResolvedAddress {
        &self.chosen
    }

    /// Full resolution the validation was performed against
    pub fn resolution(&self) -> &ResolutionResult {
        &self.resolution
    }
}

/// Why a hostname was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// Hostname could not be resolved
    Resolution {
        /// Underlying resolution error
        error: ResolutionError,
    },

    /// Hostname itself is on the deny list
    DeniedHostname {
        /// Deny list entry that matched
        entry: String,
        /// Category of the entry
        reason: DenyReason,
    },

    /// One or more resolved addresses were denied, contains the verdict
    /// for every resolved address (including allowed ones)
    Policy {
        /// Verdicts in resolution order
        verdicts: Vec<PolicyVerdict>,
    },
}

/// Outcome of validating a hostname
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// Every resolved address was allowed
    Validated(ValidatedTarget),

    /// The hostname must not be connected to
    Rejected {
        /// Hostname that was rejected
        hostname: Hostname,
        /// Reason for the rejection
        reason: RejectReason,
    },
}

impl ValidationOutcome {
    /// Whether the hostname was validated
    pub fn is_validated(&self) -> bool {
        matches!(self, ValidationOutcome::Validated(_))
    }

    /// Hostname the outcome is for
    pub fn hostname(&self) -> &Hostname {
        match self {
            ValidationOutcome::Validated(target) => target.hostname(),
            ValidationOutcome::Rejected { hostname, .. } => hostname,
        }
    }
}

/// Combines a [Resolver] with an [AddressPolicy]
#[derive(Debug, Clone)]
pub struct Validator<D = TokioDomainResolver> {
    resolver: Resolver<D>,
    policy: Arc<AddressPolicy>,
}

impl<D: DomainResolver> Validator<D> {
    /// Create a validator from its parts
    pub fn new(resolver: Resolver<D>, policy: Arc<AddressPolicy>) -> Self {
        Self { resolver, policy }
    }

    /// Replace the policy used by the validator
    pub fn with_policy(mut self, policy: Arc<AddressPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Policy used by the validator
    pub fn policy(&self) -> &AddressPolicy {
        &self.policy
    }

    /// Resolver used by the validator
    pub fn resolver(&self) -> &Resolver<D> {
        &self.resolver
    }

    /// Validate `hostname`
    ///
    /// Performs exactly one resolution, the first address in resolution
    /// order is chosen when every address is allowed
    #[tracing::instrument(skip_all, fields(hostname = %hostname))]
    pub async fn validate(&self, hostname: &Hostname) -> ValidationOutcome {
        if let Some((entry, reason)) = self.policy.evaluate_hostname(hostname.as_str()) {
            tracing::warn!(%entry, %reason, "hostname is on the deny list");
            return ValidationOutcome::Rejected {
                hostname: hostname.clone(),
                reason: RejectReason::DeniedHostname {
                    entry: entry.to_string(),
                    reason,
                },
            };
        }

        let resolution = match self.resolver.resolve(hostname).await {
            Ok(value) => value,
            // Consider resolution failure as a not allowed address
            Err(error) => {
                tracing::debug!(%error, "hostname failed to resolve");
                return ValidationOutcome::Rejected {
                    hostname: hostname.clone(),
                    reason: RejectReason::Resolution { error },
                };
            }
        };

        let verdicts: Vec<PolicyVerdict> = resolution
            .addresses()
            .iter()
            .map(|address| self.policy.evaluate(address.ip()))
            .collect();

        if verdicts.iter().any(|verdict| !verdict.is_allowed()) {
            tracing::warn!(?verdicts, "hostname resolved to a denied address");
            return ValidationOutcome::Rejected {
                hostname: hostname.clone(),
                reason: RejectReason::Policy { verdicts },
            };
        }

        // Resolution results are never empty
        let Some(chosen) = resolution.addresses().first().cloned() else {
            return ValidationOutcome::Rejected {
                hostname: hostname.clone(),
                reason: RejectReason::Policy { verdicts },
            };
        };

        tracing::debug!(address = %chosen.ip(), "hostname validated");

        ValidationOutcome::Validated(ValidatedTarget {
            hostname: hostname.clone(),
            chosen,
            resolution,
        })
    }
}
