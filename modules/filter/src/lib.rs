//! Network-topology filtering: subnet sets and domain lists deciding which
//! connection records are kept for import.
//!
//! All predicates return `true` when the input is *filtered out*. They are
//! pure and safe to call from concurrent pipeline workers; the filter is
//! read-only after construction.

use ipnet::IpNet;
use serde::Deserialize;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid CIDR or IP in filter configuration: {0:?}")]
    InvalidCidr(String),
    #[error("invalid domain in filter configuration: {0:?}")]
    InvalidDomain(String),
}

/// Raw filter options as they appear in the configuration file.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub internal_subnets: Vec<String>,
    #[serde(default)]
    pub always_included_subnets: Vec<String>,
    #[serde(default)]
    pub never_included_subnets: Vec<String>,
    #[serde(default)]
    pub always_included_domains: Vec<String>,
    #[serde(default)]
    pub never_included_domains: Vec<String>,
    #[serde(default)]
    pub filter_external_to_internal: bool,
}

/// CIDRs that are excluded from analysis no matter what the user configures:
/// current host, loopback, link-local, multicast, broadcast, unspecified.
pub fn mandatory_never_included() -> &'static [&'static str] {
    &[
        "0.0.0.0/32",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "224.0.0.0/4",
        "255.255.255.255/32",
        "::1/128",
        "::/128",
        "fe80::/10",
        "ff00::/8",
        "ff02::2/128",
    ]
}

/// Ordered set of CIDR ranges with IPv4/IPv6 point-in-range membership.
#[derive(Debug, Clone, Default)]
pub struct SubnetSet {
    nets: Vec<IpNet>,
}

impl SubnetSet {
    pub fn parse(entries: &[String]) -> Result<Self, FilterError> {
        let mut nets = Vec::with_capacity(entries.len());
        for entry in entries {
            nets.push(parse_subnet(entry)?);
        }
        Ok(SubnetSet { nets })
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let canonical = canonical_ip(ip);
        self.nets.iter().any(|net| match (net, canonical) {
            (IpNet::V4(n), IpAddr::V4(v4)) => n.contains(&v4),
            (IpNet::V6(n), IpAddr::V6(v6)) => n.contains(&v6),
            _ => false,
        })
    }
}

// Accept bare addresses as host routes so config entries like "ff02::2" work.
fn parse_subnet(entry: &str) -> Result<IpNet, FilterError> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    if let Ok(ip) = entry.parse::<IpAddr>() {
        let prefix = if ip.is_ipv4() { 32 } else { 128 };
        return IpNet::new(ip, prefix).map_err(|_| FilterError::InvalidCidr(entry.to_string()));
    }
    Err(FilterError::InvalidCidr(entry.to_string()))
}

// IPv4-mapped IPv6 addresses compare as their embedded IPv4 address.
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

/// Compiled filter policy. See the predicate docs for rule ordering.
#[derive(Debug, Clone)]
pub struct Filter {
    internal: SubnetSet,
    always_included: SubnetSet,
    never_included: SubnetSet,
    always_included_domains: Vec<String>,
    never_included_domains: Vec<String>,
    filter_external_to_internal: bool,
}

impl Filter {
    /// Compile a filter from configuration. The mandatory never-include
    /// subnets are merged in regardless of what the user supplied.
    pub fn from_spec(spec: &FilterSpec) -> Result<Self, FilterError> {
        for domain in spec
            .always_included_domains
            .iter()
            .chain(spec.never_included_domains.iter())
        {
            if domain.is_empty() || domain.chars().any(char::is_whitespace) {
                return Err(FilterError::InvalidDomain(domain.clone()));
            }
        }

        let mut never = spec.never_included_subnets.clone();
        for entry in mandatory_never_included() {
            if !never.iter().any(|have| have == entry) {
                never.push((*entry).to_string());
            }
        }

        Ok(Filter {
            internal: SubnetSet::parse(&spec.internal_subnets)?,
            always_included: SubnetSet::parse(&spec.always_included_subnets)?,
            never_included: SubnetSet::parse(&never)?,
            always_included_domains: spec.always_included_domains.clone(),
            never_included_domains: spec.never_included_domains.clone(),
            filter_external_to_internal: spec.filter_external_to_internal,
        })
    }

    pub fn is_internal(&self, ip: IpAddr) -> bool {
        self.internal.contains(ip)
    }

    /// Single-address exclusion: always-include wins, then never-include.
    pub fn filter_single_ip(&self, ip: IpAddr) -> bool {
        if self.always_included.contains(ip) {
            return false;
        }
        self.never_included.contains(ip)
    }

    /// Ordinary connection pairs. Rules, in order:
    /// 1. keep if either endpoint is always-included
    /// 2. drop if either endpoint is never-included
    /// 3. keep if no internal subnets are configured
    /// 4. drop if both endpoints are internal
    /// 5. drop if both endpoints are external
    /// 6. drop external->internal when configured to
    /// 7. keep otherwise
    pub fn filter_conn_pair(&self, src: IpAddr, dst: IpAddr) -> bool {
        if self.always_included.contains(src) || self.always_included.contains(dst) {
            return false;
        }
        if self.never_included.contains(src) || self.never_included.contains(dst) {
            return true;
        }
        if self.internal.is_empty() {
            return false;
        }
        let src_internal = self.internal.contains(src);
        let dst_internal = self.internal.contains(dst);
        if src_internal && dst_internal {
            return true;
        }
        if !src_internal && !dst_internal {
            return true;
        }
        if self.filter_external_to_internal && !src_internal && dst_internal {
            return true;
        }
        false
    }

    /// DNS pairs keep internal-to-internal traffic so tunnelling through an
    /// internal resolver stays analysable; otherwise same as conn pairs.
    pub fn filter_dns_pair(&self, src: IpAddr, dst: IpAddr) -> bool {
        if self.always_included.contains(src) || self.always_included.contains(dst) {
            return false;
        }
        if self.never_included.contains(src) || self.never_included.contains(dst) {
            return true;
        }
        if self.internal.is_empty() {
            return false;
        }
        let src_internal = self.internal.contains(src);
        let dst_internal = self.internal.contains(dst);
        if !src_internal && !dst_internal {
            return true;
        }
        if self.filter_external_to_internal && !src_internal && dst_internal {
            return true;
        }
        false
    }

    /// Proxy-tolerant HTTP variant: always/never lists, then drop only when
    /// both endpoints are external.
    pub fn filter_conn_pair_for_http(&self, src: IpAddr, dst: IpAddr) -> bool {
        if self.always_included.contains(src) || self.always_included.contains(dst) {
            return false;
        }
        if self.never_included.contains(src) || self.never_included.contains(dst) {
            return true;
        }
        let src_internal = self.internal.contains(src);
        let dst_internal = self.internal.contains(dst);
        !src_internal && !dst_internal
    }

    /// SNI records are kept only when the source is internal.
    pub fn filter_sni_pair(&self, src: IpAddr) -> bool {
        !self.internal.contains(src)
    }

    /// Domain exclusion: always-include list wins, then never-include.
    pub fn filter_domain(&self, domain: &str) -> bool {
        if contains_domain(&self.always_included_domains, domain) {
            return false;
        }
        contains_domain(&self.never_included_domains, domain)
    }
}

/// Exact match, or wildcard suffix match for entries like `*.example.com`
/// (which also matches the bare apex `example.com`).
fn contains_domain(domains: &[String], host: &str) -> bool {
    for entry in domains {
        if entry.contains('*') {
            let wildcard = entry.trim_start_matches('*');
            if host.ends_with(wildcard) {
                return true;
            }
            if host == wildcard.trim_start_matches('.') {
                return true;
            }
        } else if host == entry {
            return true;
        }
    }
    false
}
