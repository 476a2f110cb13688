#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Pinfetch Rebind
//!
//! In process DNS rebinding resolver. Names under the target domain resolve
//! to the "valid" address the first time they are queried and to the
//! "internal" address on every query after that, reproducing the attack
//! where a hostname passes validation and then points somewhere else by
//! the time the connection is made.
//!
//! Static records are answered ahead of the rebinding logic and every other
//! name is delegated to an upstream [DomainResolver]

use std::{collections::HashMap, io, net::IpAddr};

use pinfetch::{DomainResolver, TokioDomainResolver};
use tokio::sync::Mutex;

mod records;

pub use records::{RecordConfig, RecordType, StaticAnswer, StaticRecords};

use records::normalize_name;

/// Resolver answering differently on the first and later queries of a name
pub struct RebindingResolver<U = TokioDomainResolver> {
    domain: String,
    valid: IpAddr,
    internal: IpAddr,
    records: StaticRecords,
    upstream: U,
    /// Number of queries received per name
    queries: Mutex<HashMap<String, usize>>,
}

impl RebindingResolver {
    /// Create a resolver rebinding names under `domain`, other names are
    /// resolved by the system resolver
    pub fn new(domain: &str, valid: IpAddr, internal: IpAddr) -> Self {
        Self::with_upstream(domain, valid, internal, TokioDomainResolver)
    }
}

impl<U: DomainResolver> RebindingResolver<U> {
    /// Create a resolver rebinding names under `domain`, other names are
    /// resolved by `upstream`
    pub fn with_upstream(domain: &str, valid: IpAddr, internal: IpAddr, upstream: U) -> Self {
        Self {
            domain: normalize_name(domain),
            valid,
            internal,
            records: StaticRecords::default(),
            upstream,
            queries: Default::default(),
        }
    }

    /// Set the static records answered ahead of rebinding
    pub fn with_records(mut self, records: StaticRecords) -> Self {
        self.records = records;
        self
    }

    /// Target domain
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Number of queries received for `name`
    pub async fn query_count(&self, name: &str) -> usize {
        let queries = self.queries.lock().await;
        queries
            .get(&normalize_name(name))
            .copied()
            .unwrap_or_default()
    }

    /// Forget every query, the next query of each name is answered as new
    pub async fn reset(&self) {
        self.queries.lock().await.clear();
    }

    fn is_target(&self, name: &str) -> bool {
        name == self.domain
            || name
                .strip_suffix(self.domain.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'))
    }

    /// Answer a query for a name under the target domain
    async fn rebind(&self, name: &str) -> IpAddr {
        let previous = {
            let mut queries = self.queries.lock().await;
            let count = queries.entry(name.to_string()).or_default();
            *count += 1;
            *count - 1
        };

        let (address, state) = if previous == 0 {
            (self.valid, "NEW")
        } else {
            (self.internal, "RETURNING")
        };

        tracing::info!(domain = %name, response = %address, state, "answered rebinding query");
        address
    }

    /// Resolve a name that has no static records
    async fn resolve_dynamic(&self, name: &str) -> io::Result<Vec<IpAddr>> {
        if self.is_target(name) {
            return Ok(vec![self.rebind(name).await]);
        }

        *self
            .queries
            .lock()
            .await
            .entry(name.to_string())
            .or_default() += 1;

        let addresses = self.upstream.resolve_domain(name).await?;
        tracing::info!(domain = %name, response = ?addresses, "proxied query upstream");
        Ok(addresses)
    }
}

impl<U: DomainResolver> DomainResolver for RebindingResolver<U> {
    async fn resolve_domain(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let name = normalize_name(host);

        match self.records.lookup(&name) {
            Some(StaticAnswer::Addresses(addresses)) => {
                *self
                    .queries
                    .lock()
                    .await
                    .entry(name.clone())
                    .or_default() += 1;

                tracing::info!(domain = %name, response = ?addresses, "answered static query");
                Ok(addresses)
            }
            Some(StaticAnswer::Alias(target)) => {
                tracing::info!(domain = %name, %target, "following static alias");
                self.resolve_dynamic(&target).await
            }
            // Names with only non address records fall through
            Some(StaticAnswer::NoAddresses) | None => self.resolve_dynamic(&name).await,
        }
    }
}
