//! DNS resolution abstraction used by the target parser.
//!
//! Wraps `trust-dns-resolver`'s async resolver behind a small trait so tests can substitute a
//! fixed host→address table instead of touching the network.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveError;
use trust_dns_resolver::TokioAsyncResolver;

/// Resolves a hostname to a single address. Implementations should prefer IPv4 when both
/// families are available.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, hostname: &str) -> Result<IpAddr, ResolveError>;
}

/// Production resolver: `trust-dns-resolver`'s Tokio-async client over the system configuration.
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf() -> Result<Self, ResolveError> {
        let inner = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Ok(Self { inner })
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, hostname: &str) -> Result<IpAddr, ResolveError> {
        let response = self.inner.lookup_ip(hostname).await?;
        response
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| response.iter().next())
            .ok_or_else(|| ResolveError::from(trust_dns_resolver::error::ResolveErrorKind::Message(
                "no addresses returned",
            )))
    }
}

/// Fixed host→address table, for unit and property tests.
#[derive(Default)]
pub struct StaticResolver {
    table: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hostname: impl Into<String>, ip: IpAddr) -> Self {
        self.table.insert(hostname.into(), ip);
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, hostname: &str) -> Result<IpAddr, ResolveError> {
        self.table.get(hostname).copied().ok_or_else(|| {
            ResolveError::from(trust_dns_resolver::error::ResolveErrorKind::Message(
                "host not found in static resolver table",
            ))
        })
    }
}
