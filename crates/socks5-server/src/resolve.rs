//! Turning hostnames from SOCKS requests into candidate addresses.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use socks5_proto::SocksStatus;
use thiserror::Error;

/// An error from a [`Resolver`].
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ResolveError {
    /// The name can't be looked up at all.
    #[error("Invalid hostname {0:?}")]
    InvalidName(String),

    /// The lookup worked, but there were no addresses for the name.
    #[error("No addresses found for {0:?}")]
    NotFound(String),

    /// The lookup itself failed.
    #[error("Unable to resolve {host:?}: {source}")]
    Lookup {
        /// The name we tried to resolve.
        host: String,
        /// The underlying error.
        #[source]
        source: Arc<io::Error>,
    },
}

impl ResolveError {
    /// Return the SOCKS status that reports this error to a client.
    ///
    /// A name that is malformed is an address problem; anything else means
    /// the host can't be reached.
    pub fn socks_status(&self) -> SocksStatus {
        match self {
            ResolveError::InvalidName(_) => SocksStatus::ADDRTYPE_NOT_SUPPORTED,
            ResolveError::NotFound(_) | ResolveError::Lookup { .. } => {
                SocksStatus::HOST_UNREACHABLE
            }
        }
    }
}

/// Something that can look up the addresses of a host.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Look up `host`, returning one or more IPv4 or IPv6 addresses in
    /// the order they should be tried.
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

#[async_trait]
impl<R: Resolver + ?Sized> Resolver for Arc<R> {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        (**self).lookup_ip(host).await
    }
}

/// A [`Resolver`] that asks the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if host.is_empty() || host.contains('\0') {
            return Err(ResolveError::InvalidName(host.to_string()));
        }
        let found = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::InvalidInput => ResolveError::InvalidName(host.to_string()),
                _ => ResolveError::Lookup {
                    host: host.to_string(),
                    source: Arc::new(e),
                },
            })?;

        // getaddrinfo hands back one entry per socket type; keep the first
        // of each address.
        let mut addrs: Vec<IpAddr> = Vec::new();
        for sa in found {
            if !addrs.contains(&sa.ip()) {
                addrs.push(sa.ip());
            }
        }
        if addrs.is_empty() {
            return Err(ResolveError::NotFound(host.to_string()));
        }
        Ok(addrs)
    }
}

/// A [`Resolver`] that returns the results of another resolver in a
/// random order.
///
/// This spreads connections over all the addresses of a host, rather
/// than always trying the first one.
#[derive(Clone, Debug, Default)]
pub struct ShuffleResolver<R> {
    /// The resolver doing the actual lookups.
    inner: R,
}

impl<R> ShuffleResolver<R> {
    /// Wrap `inner` so that its answers come back shuffled.
    pub fn new(inner: R) -> Self {
        ShuffleResolver { inner }
    }

    /// Return the wrapped resolver.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[async_trait]
impl<R: Resolver> Resolver for ShuffleResolver<R> {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let mut addrs = self.inner.lookup_ip(host).await?;
        addrs.shuffle(&mut rand::thread_rng());
        Ok(addrs)
    }
}
