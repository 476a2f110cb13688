//! # Address Policy
//!
//! Decides whether a resolved address is safe to connect to. The policy is
//! plain data: an allowlist of networks checked first, followed by a list of
//! denied networks each tagged with the reason they are denied.
//!
//! The built-in deny list covers loopback, link-local, private ranges, cloud
//! metadata endpoints, unspecified, multicast and reserved ranges. IPv6
//! translation prefixes (NAT64, 6to4, IPv4-compatible) are denied outright
//! and the IPv4 address they carry is reported when it hits a narrower rule.

use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr},
};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Category of a denied address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenyReason {
    /// Loopback (`127.0.0.0/8`, `::1`)
    Loopback,
    /// Link-local (`169.254.0.0/16`, `fe80::/10`)
    LinkLocal,
    /// Private or internal ranges (RFC 1918, RFC 6598, ULA)
    PrivateRange,
    /// Cloud instance metadata services
    MetadataAddress,
    /// Unspecified / "this network" addresses
    Unspecified,
    /// Multicast ranges
    Multicast,
    /// Reserved for future use, including broadcast
    Reserved,
    /// Added to the deny list by the operator
    ExplicitDenyList,
}

impl Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DenyReason::Loopback => "loopback",
            DenyReason::LinkLocal => "link-local",
            DenyReason::PrivateRange => "private-range",
            DenyReason::MetadataAddress => "metadata-address",
            DenyReason::Unspecified => "unspecified",
            DenyReason::Multicast => "multicast",
            DenyReason::Reserved => "reserved",
            DenyReason::ExplicitDenyList => "explicit-deny-list",
        })
    }
}

/// Single deny list entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PolicyRule {
    /// Network covered by the rule
    pub network: IpNet,
    /// Reason reported for addresses within the network
    pub reason: DenyReason,
}

impl PolicyRule {
    /// Create a new rule
    pub fn new(network: IpNet, reason: DenyReason) -> Self {
        Self { network, reason }
    }
}

/// Built-in deny list, first match wins so the metadata entries come
/// before the broader ranges that also contain them
const DEFAULT_DENY_LIST: &[(&str, DenyReason)] = &[
    // AWS, GCP, Azure, OpenStack
    ("169.254.169.254/32", DenyReason::MetadataAddress),
    // Alibaba Cloud
    ("100.100.100.200/32", DenyReason::MetadataAddress),
    // AWS (IPv6)
    ("fd00:ec2::254/128", DenyReason::MetadataAddress),
    ("0.0.0.0/8", DenyReason::Unspecified),
    ("::/128", DenyReason::Unspecified),
    ("127.0.0.0/8", DenyReason::Loopback),
    ("::1/128", DenyReason::Loopback),
    // IPv4-compatible (deprecated)
    ("::/96", DenyReason::Reserved),
    ("169.254.0.0/16", DenyReason::LinkLocal),
    ("fe80::/10", DenyReason::LinkLocal),
    ("10.0.0.0/8", DenyReason::PrivateRange),
    ("172.16.0.0/12", DenyReason::PrivateRange),
    ("192.168.0.0/16", DenyReason::PrivateRange),
    // Shared address space (carrier grade NAT)
    ("100.64.0.0/10", DenyReason::PrivateRange),
    ("fc00::/7", DenyReason::PrivateRange),
    // NAT64 local use
    ("64:ff9b:1::/48", DenyReason::PrivateRange),
    // NAT64 well known prefix
    ("64:ff9b::/96", DenyReason::Reserved),
    // 6to4
    ("2002::/16", DenyReason::Reserved),
    // Discard only
    ("100::/64", DenyReason::Reserved),
    // IETF protocol assignments
    ("192.0.0.0/24", DenyReason::Reserved),
    // Benchmarking
    ("198.18.0.0/15", DenyReason::Reserved),
    ("224.0.0.0/4", DenyReason::Multicast),
    ("ff00::/8", DenyReason::Multicast),
    ("240.0.0.0/4", DenyReason::Reserved),
];

/// Hostnames of metadata services, rejected before any resolution happens
const METADATA_HOSTNAMES: &[&str] = &[
    "metadata.google.internal",
    "metadata.goog",
    "metadata.azure.internal",
    // AWS alternate (EC2-Classic)
    "instance-data",
];

/// Configuration for an [AddressPolicy]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Whether the built-in deny list and metadata hostnames are included
    ///
    /// Default: true
    pub include_defaults: bool,
    /// Networks that are always allowed, checked before any deny rule
    pub allow: Vec<IpNet>,
    /// Additional networks to deny
    pub deny: Vec<IpNet>,
    /// Additional hostnames to deny (subdomains are also denied)
    pub denied_hostnames: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            include_defaults: true,
            allow: Vec::new(),
            deny: Vec::new(),
            denied_hostnames: Vec::new(),
        }
    }
}

/// Result of evaluating a single address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PolicyVerdict {
    /// Address that was evaluated
    pub address: IpAddr,
    /// Reason the address was denied, [None] when allowed
    pub denied_reason: Option<DenyReason>,
}

impl PolicyVerdict {
    /// Whether the address is allowed
    pub fn is_allowed(&self) -> bool {
        self.denied_reason.is_none()
    }
}

impl Display for PolicyVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.denied_reason {
            Some(reason) => write!(f, "{} denied ({reason})", self.address),
            None => write!(f, "{} allowed", self.address),
        }
    }
}

/// Policy deciding which addresses may be connected to
///
/// Evaluation is pure, the policy is immutable once built and can be
/// shared between any number of concurrent fetches
#[derive(Debug, Clone)]
pub struct AddressPolicy {
    allow: Vec<IpNet>,
    deny: Vec<PolicyRule>,
    denied_hostnames: Vec<(String, DenyReason)>,
}

impl Default for AddressPolicy {
    fn default() -> Self {
        Self::from_config(&PolicyConfig::default())
    }
}

impl AddressPolicy {
    /// Policy with no rules at all, every address is allowed
    pub fn empty() -> Self {
        Self {
            allow: Vec::new(),
            deny: Vec::new(),
            denied_hostnames: Vec::new(),
        }
    }

    /// Create a policy from the provided `config`
    pub fn from_config(config: &PolicyConfig) -> Self {
        let mut policy = Self::empty();

        if config.include_defaults {
            policy.deny.extend(default_rules());
            policy.denied_hostnames.extend(
                METADATA_HOSTNAMES
                    .iter()
                    .map(|host| (host.to_string(), DenyReason::MetadataAddress)),
            );
        }

        policy.allow.extend(config.allow.iter().copied());
        policy.deny.extend(
            config
                .deny
                .iter()
                .map(|network| PolicyRule::new(*network, DenyReason::ExplicitDenyList)),
        );
        policy.denied_hostnames.extend(
            config
                .denied_hostnames
                .iter()
                .map(|host| (normalize_hostname(host), DenyReason::ExplicitDenyList)),
        );

        policy
    }

    /// Add a network that is allowed regardless of the deny list
    pub fn with_allowed(mut self, network: IpNet) -> Self {
        self.allow.push(network);
        self
    }

    /// Add a network to deny as [DenyReason::ExplicitDenyList]
    pub fn with_denied(self, network: IpNet) -> Self {
        self.with_rule(PolicyRule::new(network, DenyReason::ExplicitDenyList))
    }

    /// Append a deny rule
    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.deny.push(rule);
        self
    }

    /// Add a hostname to deny as [DenyReason::ExplicitDenyList]
    pub fn with_denied_hostname(mut self, hostname: &str) -> Self {
        self.denied_hostnames
            .push((normalize_hostname(hostname), DenyReason::ExplicitDenyList));
        self
    }

    /// Deny rules in evaluation order
    pub fn rules(&self) -> &[PolicyRule] {
        &self.deny
    }

    /// Evaluate a single `address` against the policy
    ///
    /// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are evaluated as the
    /// IPv4 address they embed. NAT64 and 6to4 addresses report the reason
    /// of the IPv4 address they carry when that address is denied, and the
    /// reason of their own prefix otherwise
    pub fn evaluate(&self, address: IpAddr) -> PolicyVerdict {
        let canonical = address.to_canonical();

        if self
            .allow
            .iter()
            .any(|network| network.contains(&address) || network.contains(&canonical))
        {
            return PolicyVerdict {
                address,
                denied_reason: None,
            };
        }

        let denied_reason = embedded_ipv4(address)
            .and_then(|embedded| self.deny_reason(IpAddr::V4(embedded)))
            .or_else(|| self.deny_reason(canonical))
            .or_else(|| self.deny_reason(address));

        PolicyVerdict {
            address,
            denied_reason,
        }
    }

    fn deny_reason(&self, address: IpAddr) -> Option<DenyReason> {
        self.deny
            .iter()
            .find(|rule| rule.network.contains(&address))
            .map(|rule| rule.reason)
    }

    /// Check the `hostname` itself against the denied hostnames, matches
    /// the hostname and any of its subdomains
    pub fn evaluate_hostname(&self, hostname: &str) -> Option<(&str, DenyReason)> {
        let hostname = normalize_hostname(hostname);

        self.denied_hostnames
            .iter()
            .find(|(denied, _)| {
                hostname == *denied
                    || hostname
                        .strip_suffix(denied.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            })
            .map(|(denied, reason)| (denied.as_str(), *reason))
    }
}

fn default_rules() -> impl Iterator<Item = PolicyRule> {
    DEFAULT_DENY_LIST.iter().filter_map(|(network, reason)| {
        network
            .parse::<IpNet>()
            .ok()
            .map(|network| PolicyRule::new(network, *reason))
    })
}

/// IPv4 address carried by a NAT64 (`64:ff9b::/96`) or 6to4 (`2002::/16`)
/// address
fn embedded_ipv4(address: IpAddr) -> Option<Ipv4Addr> {
    let IpAddr::V6(address) = address else {
        return None;
    };

    let octets = address.octets();
    match address.segments() {
        [0x64, 0xff9b, 0, 0, 0, 0, _, _] => {
            Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]))
        }
        [0x2002, ..] => Some(Ipv4Addr::new(octets[2], octets[3], octets[4], octets[5])),
        _ => None,
    }
}

fn normalize_hostname(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod test {
    use super::{AddressPolicy, DEFAULT_DENY_LIST, DenyReason, PolicyConfig, default_rules};
    use std::net::IpAddr;

    fn reason(policy: &AddressPolicy, address: &str) -> Option<DenyReason> {
        policy
            .evaluate(address.parse::<IpAddr>().unwrap())
            .denied_reason
    }

    #[test]
    fn test_default_rules_all_parse() {
        assert_eq!(default_rules().count(), DEFAULT_DENY_LIST.len());
    }

    #[test]
    fn test_denied_ranges() {
        let policy = AddressPolicy::default();

        for (address, expected) in [
            ("127.0.0.1", DenyReason::Loopback),
            ("127.255.255.255", DenyReason::Loopback),
            ("::1", DenyReason::Loopback),
            ("169.254.1.1", DenyReason::LinkLocal),
            ("fe80::1", DenyReason::LinkLocal),
            ("fe80::abcd:1234", DenyReason::LinkLocal),
            ("10.0.0.1", DenyReason::PrivateRange),
            ("10.255.255.255", DenyReason::PrivateRange),
            ("172.16.0.1", DenyReason::PrivateRange),
            ("172.31.255.255", DenyReason::PrivateRange),
            ("192.168.0.1", DenyReason::PrivateRange),
            ("100.64.0.1", DenyReason::PrivateRange),
            ("fc00::1", DenyReason::PrivateRange),
            ("fd12:3456:789a::1", DenyReason::PrivateRange),
            ("169.254.169.254", DenyReason::MetadataAddress),
            ("100.100.100.200", DenyReason::MetadataAddress),
            ("fd00:ec2::254", DenyReason::MetadataAddress),
            ("0.0.0.0", DenyReason::Unspecified),
            ("0.1.2.3", DenyReason::Unspecified),
            ("::", DenyReason::Unspecified),
            ("224.0.0.1", DenyReason::Multicast),
            ("239.255.255.250", DenyReason::Multicast),
            ("ff02::1", DenyReason::Multicast),
            ("240.0.0.1", DenyReason::Reserved),
            ("255.255.255.255", DenyReason::Reserved),
            ("198.18.0.1", DenyReason::Reserved),
            ("198.19.255.255", DenyReason::Reserved),
            ("192.0.0.8", DenyReason::Reserved),
            ("100::1", DenyReason::Reserved),
            ("::7f00:1", DenyReason::Reserved),
            ("::a9fe:a9fe", DenyReason::Reserved),
            ("64:ff9b:1::a00:1", DenyReason::PrivateRange),
        ] {
            assert_eq!(reason(&policy, address), Some(expected), "{address}");
        }
    }

    #[test]
    fn test_public_addresses_allowed() {
        let policy = AddressPolicy::default();

        for address in [
            "93.184.216.34",
            "1.1.1.1",
            "8.8.8.8",
            "172.15.0.1",
            "172.32.0.1",
            "2001:4860:4860::8888",
        ] {
            let verdict = policy.evaluate(address.parse().unwrap());
            assert!(verdict.is_allowed(), "{address}");
        }
    }

    /// Mapped forms must not bypass the IPv4 rules
    #[test]
    fn test_ipv4_mapped_ipv6() {
        let policy = AddressPolicy::default();

        assert_eq!(
            reason(&policy, "::ffff:127.0.0.1"),
            Some(DenyReason::Loopback)
        );
        assert_eq!(
            reason(&policy, "::ffff:7f00:1"),
            Some(DenyReason::Loopback)
        );
        assert_eq!(
            reason(&policy, "::ffff:169.254.169.254"),
            Some(DenyReason::MetadataAddress)
        );
        assert_eq!(
            reason(&policy, "::ffff:192.168.1.1"),
            Some(DenyReason::PrivateRange)
        );
        assert_eq!(reason(&policy, "::ffff:93.184.216.34"), None);
    }

    /// Translation prefixes report the IPv4 address they carry
    #[test]
    fn test_embedded_ipv4() {
        let policy = AddressPolicy::default();

        for (address, expected) in [
            ("64:ff9b::a9fe:a9fe", DenyReason::MetadataAddress),
            ("64:ff9b::169.254.169.254", DenyReason::MetadataAddress),
            ("64:ff9b::7f00:1", DenyReason::Loopback),
            ("64:ff9b::c0a8:101", DenyReason::PrivateRange),
            ("2002:7f00:1::1", DenyReason::Loopback),
            ("2002:a9fe:a9fe::", DenyReason::MetadataAddress),
            ("2002:a00:1:1::1", DenyReason::PrivateRange),
            // Public IPv4 inside still falls under the prefix itself
            ("64:ff9b::5db8:d822", DenyReason::Reserved),
            ("2002:5db8:d822::1", DenyReason::Reserved),
        ] {
            assert_eq!(reason(&policy, address), Some(expected), "{address}");
        }
    }

    #[test]
    fn test_embedded_ipv4_without_defaults() {
        let policy = AddressPolicy::empty().with_denied("93.184.216.0/24".parse().unwrap());

        assert_eq!(
            reason(&policy, "64:ff9b::5db8:d822"),
            Some(DenyReason::ExplicitDenyList)
        );
        assert_eq!(
            reason(&policy, "2002:5db8:d822::1"),
            Some(DenyReason::ExplicitDenyList)
        );
        assert_eq!(reason(&policy, "64:ff9b::808:808"), None);
    }

    #[test]
    fn test_allowlist_overrides_deny_list() {
        let policy = AddressPolicy::default().with_allowed("127.0.0.1/32".parse().unwrap());

        assert_eq!(reason(&policy, "127.0.0.1"), None);
        assert_eq!(reason(&policy, "127.0.0.2"), Some(DenyReason::Loopback));
    }

    #[test]
    fn test_explicit_deny() {
        let policy = AddressPolicy::default().with_denied("93.184.216.0/24".parse().unwrap());

        assert_eq!(
            reason(&policy, "93.184.216.34"),
            Some(DenyReason::ExplicitDenyList)
        );
        assert_eq!(reason(&policy, "93.184.217.34"), None);
    }

    #[test]
    fn test_from_config() {
        let config = PolicyConfig {
            include_defaults: false,
            allow: vec![],
            deny: vec!["8.8.8.0/24".parse().unwrap()],
            denied_hostnames: vec!["Internal.Example.com".to_string()],
        };
        let policy = AddressPolicy::from_config(&config);

        // Defaults are not present
        assert_eq!(reason(&policy, "127.0.0.1"), None);
        assert_eq!(
            reason(&policy, "8.8.8.8"),
            Some(DenyReason::ExplicitDenyList)
        );
        assert_eq!(
            policy.evaluate_hostname("api.internal.example.com"),
            Some(("internal.example.com", DenyReason::ExplicitDenyList))
        );
        assert_eq!(policy.evaluate_hostname("metadata.google.internal"), None);
    }

    #[test]
    fn test_hostname_deny_list() {
        let policy = AddressPolicy::default();

        for host in [
            "metadata.google.internal",
            "METADATA.GOOGLE.INTERNAL",
            "metadata.google.internal.",
            "sub.metadata.google.internal",
            "metadata.azure.internal",
            "instance-data",
        ] {
            let (_, reason) = policy.evaluate_hostname(host).expect(host);
            assert_eq!(reason, DenyReason::MetadataAddress);
        }

        assert!(policy.evaluate_hostname("example.com").is_none());
        // Suffix without a label boundary is not a subdomain
        assert!(policy.evaluate_hostname("notinstance-data").is_none());
    }

    #[test]
    fn test_config_deserialize() {
        let config: PolicyConfig = serde_json::from_str(
            r#"{"allow": ["127.0.0.1/32"], "deny": ["203.0.113.0/24"]}"#,
        )
        .unwrap();

        assert!(config.include_defaults);
        assert_eq!(config.allow.len(), 1);
        assert_eq!(config.deny.len(), 1);
    }
}
