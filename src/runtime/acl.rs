//! Access control lists
//!
//! An address matches an ACL when it matches at least one include entry and
//! no exclude entry. Host entries are looked up through a [`HostResolver`],
//! which answers from memory; [`DnsCache`] is refreshed off the request path.

use anyhow::Context;
use futures::future::join_all;
use ipnet::IpNet;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::time::timeout;

use crate::interpreter::CompileError;

/// Time allowed for one host lookup during a refresh.
pub const DNS_TIMEOUT: Duration = Duration::from_secs(2);

/// Name resolution used by host entries. Called while a request is being
/// evaluated, so implementations must not block.
pub trait HostResolver: Send + Sync {
    /// Addresses for `host`; empty when the name is not resolved.
    fn resolve(&self, host: &str) -> Vec<IpAddr>;
}

/// Snapshot of resolved ACL host names.
///
/// Lookups read the snapshot only. [`DnsCache::refresh`] resolves names
/// with `tokio::net::lookup_host` under a timeout; a failed lookup keeps the
/// previous addresses.
#[derive(Debug)]
pub struct DnsCache {
    entries: RwLock<HashMap<String, Vec<IpAddr>>>,
    timeout: Duration,
}

impl DnsCache {
    /// Empty cache with a per-lookup timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Pin `host` to `addresses`.
    pub fn insert(&self, host: &str, addresses: Vec<IpAddr>) {
        self.entries
            .write()
            .insert(host.to_ascii_lowercase(), addresses);
    }

    /// Number of resolved names.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing has been resolved yet.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Resolve every name concurrently, returning how many resolved.
    pub async fn refresh<'a>(&self, hosts: impl IntoIterator<Item = &'a str>) -> usize {
        let lookups = hosts
            .into_iter()
            .map(|host| async move { (host, self.lookup(host).await) });
        let mut resolved = 0;
        for (host, outcome) in join_all(lookups).await {
            match outcome {
                Ok(addresses) if !addresses.is_empty() => {
                    self.insert(host, addresses);
                    resolved += 1;
                }
                Ok(_) => tracing::debug!(host, "acl host resolved to nothing"),
                Err(err) => tracing::warn!(host, error = %format!("{err:#}"), "acl host lookup failed"),
            }
        }
        resolved
    }

    async fn lookup(&self, host: &str) -> anyhow::Result<Vec<IpAddr>> {
        let addresses = timeout(self.timeout, lookup_host((host, 0)))
            .await
            .with_context(|| format!("lookup of {host} timed out"))?
            .with_context(|| format!("lookup of {host} failed"))?;
        let mut ips: Vec<IpAddr> = addresses.map(|addr| addr.ip()).collect();
        ips.sort();
        ips.dedup();
        Ok(ips)
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(DNS_TIMEOUT)
    }
}

impl HostResolver for DnsCache {
    fn resolve(&self, host: &str) -> Vec<IpAddr> {
        self.entries
            .read()
            .get(&host.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }
}

/// One ACL line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclEntry {
    /// Host name resolved through the ACL's resolver.
    Host {
        /// Name to resolve.
        name: String,
        /// Ignorable entries never match when resolution fails.
        ignorable: bool,
    },
    /// Single address.
    Address(IpAddr),
    /// Network prefix.
    Subnet(IpNet),
}

impl AclEntry {
    /// Host entry.
    pub fn host(name: impl Into<String>, ignorable: bool) -> Self {
        AclEntry::Host {
            name: name.into(),
            ignorable,
        }
    }

    /// Literal address entry.
    pub fn address(text: &str) -> Result<Self, CompileError> {
        text.trim()
            .parse::<IpAddr>()
            .map(AclEntry::Address)
            .map_err(|_| CompileError::InvalidLiteral {
                kind: "ip address",
                text: text.to_string(),
            })
    }

    /// `address/prefix` entry.
    pub fn subnet(text: &str) -> Result<Self, CompileError> {
        let invalid = || CompileError::InvalidLiteral {
            kind: "subnet",
            text: text.to_string(),
        };
        let (addr, prefix) = text.trim().split_once('/').ok_or_else(invalid)?;
        let network: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.trim().parse().map_err(|_| invalid())?;
        IpNet::new(network, prefix)
            .map(AclEntry::Subnet)
            .map_err(|_| invalid())
    }

    /// Classify raw entry text: `a/b` is a subnet, a parseable address is an
    /// address, anything else is a host name.
    pub fn parse(text: &str, ignorable: bool) -> Result<Self, CompileError> {
        if text.contains('/') {
            Self::subnet(text)
        } else if text.trim().parse::<IpAddr>().is_ok() {
            Self::address(text)
        } else {
            Ok(Self::host(text.trim(), ignorable))
        }
    }

    /// Entry text as written.
    pub fn name(&self) -> String {
        match self {
            AclEntry::Host { name, .. } => name.clone(),
            AclEntry::Address(addr) => addr.to_string(),
            AclEntry::Subnet(net) => net.to_string(),
        }
    }

    /// Match outcome, or `None` when a host entry did not resolve.
    fn check(&self, client: IpAddr, resolver: &dyn HostResolver) -> Option<bool> {
        match self {
            AclEntry::Address(addr) => Some(*addr == client),
            AclEntry::Subnet(net) => Some(net.contains(&client)),
            AclEntry::Host { name, ignorable } => {
                let addresses = resolver.resolve(name);
                if addresses.is_empty() {
                    if *ignorable { Some(false) } else { None }
                } else {
                    Some(addresses.contains(&client))
                }
            }
        }
    }
}

/// Immutable, named access list.
#[derive(Clone)]
pub struct Acl {
    name: String,
    include: Vec<AclEntry>,
    exclude: Vec<AclEntry>,
    resolver: Arc<dyn HostResolver>,
}

impl Acl {
    /// ACL name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Include entries in declaration order.
    pub fn include(&self) -> &[AclEntry] {
        &self.include
    }

    /// Exclude entries in declaration order.
    pub fn exclude(&self) -> &[AclEntry] {
        &self.exclude
    }

    /// Host names referenced by any entry.
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.include
            .iter()
            .chain(&self.exclude)
            .filter_map(|entry| match entry {
                AclEntry::Host { name, .. } => Some(name.as_str()),
                _ => None,
            })
    }

    /// Match using the resolver bound at build time.
    pub fn is_match(&self, client: IpAddr) -> bool {
        self.is_match_with(client, self.resolver.as_ref())
    }

    /// Match using an explicit resolver.
    ///
    /// A non-ignorable host that fails to resolve fails open: it counts as a
    /// match among the includes and as no match among the excludes.
    pub fn is_match_with(&self, client: IpAddr, resolver: &dyn HostResolver) -> bool {
        let included = self
            .include
            .iter()
            .any(|entry| entry.check(client, resolver).unwrap_or(true));
        if !included {
            return false;
        }
        !self
            .exclude
            .iter()
            .any(|entry| entry.check(client, resolver).unwrap_or(false))
    }
}

impl fmt::Debug for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acl")
            .field("name", &self.name)
            .field("include", &self.include)
            .field("exclude", &self.exclude)
            .finish()
    }
}

/// Accumulates entries, then produces an [`Acl`].
#[derive(Default)]
pub struct AclBuilder {
    include: Vec<AclEntry>,
    exclude: Vec<AclEntry>,
    resolver: Option<Arc<dyn HostResolver>>,
}

impl AclBuilder {
    /// Empty builder; host entries stay unresolved unless a resolver is set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific resolver for host entries.
    pub fn resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Add an include entry.
    pub fn include(mut self, entry: AclEntry) -> Self {
        self.include.push(entry);
        self
    }

    /// Add an exclude entry.
    pub fn exclude(mut self, entry: AclEntry) -> Self {
        self.exclude.push(entry);
        self
    }

    /// Add an entry to the list selected by `negated`.
    pub fn entry(self, entry: AclEntry, negated: bool) -> Self {
        if negated {
            self.exclude(entry)
        } else {
            self.include(entry)
        }
    }

    /// Bind the name and freeze.
    pub fn build(self, name: impl Into<String>) -> Acl {
        Acl {
            name: name.into(),
            include: self.include,
            exclude: self.exclude,
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(DnsCache::default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedResolver(HashMap<&'static str, Vec<IpAddr>>);

    impl HostResolver for FixedResolver {
        fn resolve(&self, host: &str) -> Vec<IpAddr> {
            self.0.get(host).cloned().unwrap_or_default()
        }
    }

    fn resolver() -> Arc<dyn HostResolver> {
        let mut map = HashMap::new();
        map.insert("cdn.example", vec!["198.51.100.4".parse().unwrap()]);
        Arc::new(FixedResolver(map))
    }

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    #[test]
    fn subnet_include_with_unresolvable_exclude() {
        let acl = AclBuilder::new()
            .resolver(resolver())
            .include(AclEntry::parse("10.0.0.0/8", false).unwrap())
            .exclude(AclEntry::parse("badhost.example", false).unwrap())
            .build("office");

        assert!(acl.is_match(ip("10.1.2.3")));
        assert!(!acl.is_match(ip("203.0.113.1")));
    }

    #[test]
    fn unresolvable_include_fails_open_unless_ignorable() {
        let open = AclBuilder::new()
            .resolver(resolver())
            .include(AclEntry::host("missing.example", false))
            .build("open");
        let closed = AclBuilder::new()
            .resolver(resolver())
            .include(AclEntry::host("missing.example", true))
            .build("closed");

        assert!(open.is_match(ip("192.0.2.1")));
        assert!(!closed.is_match(ip("192.0.2.1")));
    }

    #[test]
    fn resolved_host_matches_only_its_addresses() {
        let acl = AclBuilder::new()
            .resolver(resolver())
            .include(AclEntry::host("cdn.example", false))
            .build("cdn");
        assert!(acl.is_match(ip("198.51.100.4")));
        assert!(!acl.is_match(ip("198.51.100.5")));
    }

    #[test]
    fn exclude_overrides_include() {
        let acl = AclBuilder::new()
            .entry(AclEntry::parse("192.168.0.0/16", false).unwrap(), false)
            .entry(AclEntry::parse("192.168.1.10", false).unwrap(), true)
            .build("lan");
        assert!(acl.is_match(ip("192.168.7.1")));
        assert!(!acl.is_match(ip("192.168.1.10")));
    }

    #[test]
    fn ipv6_prefixes_and_family_mismatch() {
        let entry = AclEntry::subnet("2001:db8::/32").unwrap();
        let acl = AclBuilder::new().include(entry).build("v6");
        assert!(acl.is_match(ip("2001:db8::1")));
        assert!(!acl.is_match(ip("2001:db9::1")));
        assert!(!acl.is_match(ip("10.0.0.1")));
    }

    #[test]
    fn malformed_subnets_are_rejected() {
        assert!(AclEntry::subnet("10.0.0.0/33").is_err());
        assert!(AclEntry::subnet("10.0.0/8x").is_err());
        assert!(AclEntry::subnet("10.0.0.0").is_err());
    }

    #[test]
    fn zero_prefix_matches_whole_family() {
        let acl = AclBuilder::new()
            .include(AclEntry::subnet("0.0.0.0/0").unwrap())
            .build("any");
        assert!(acl.is_match(ip("203.0.113.9")));
    }

    #[test]
    fn dns_cache_answers_from_its_snapshot() {
        let dns = Arc::new(DnsCache::default());
        let acl = AclBuilder::new()
            .resolver(dns.clone())
            .include(AclEntry::host("Gateway.Internal", false))
            .exclude(AclEntry::host("old.internal", true))
            .build("gateway");
        assert_eq!(acl.hosts().collect::<Vec<_>>(), ["Gateway.Internal", "old.internal"]);

        // nothing resolved yet: the include fails open
        assert!(acl.is_match(ip("192.0.2.1")));

        dns.insert("gateway.internal", vec![ip("10.9.9.9")]);
        assert!(acl.is_match(ip("10.9.9.9")));
        assert!(!acl.is_match(ip("192.0.2.1")));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_addresses() {
        let dns = DnsCache::new(Duration::from_millis(500));
        dns.insert("gone.invalid", vec![ip("10.0.0.1")]);

        let resolved = dns.refresh(["127.0.0.1", "gone.invalid"]).await;
        assert_eq!(resolved, 1);
        assert_eq!(dns.len(), 2);
        assert_eq!(dns.resolve("127.0.0.1"), [ip("127.0.0.1")]);
        assert_eq!(dns.resolve("gone.invalid"), [ip("10.0.0.1")]);
    }
}
