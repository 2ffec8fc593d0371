//! Turning site addresses into canonical key store names

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use tracing::{debug, warn};

pub trait SiteResolver: Send + Sync {
    /// First socket address `address` resolves to, if any
    fn resolve(&self, address: &str) -> Option<SocketAddr>;

    /// Every address that belongs to this host
    fn host_addresses(&self) -> Vec<IpAddr>;
}

/// Resolver backed by the system resolver and the host's interfaces
#[derive(Debug, Clone, Default)]
pub struct SystemResolver {
    local_addresses: Vec<IpAddr>,
}

impl SystemResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `addresses` as belonging to this host as well
    pub fn with_local_addresses(addresses: Vec<IpAddr>) -> Self {
        Self {
            local_addresses: addresses,
        }
    }
}

impl SiteResolver for SystemResolver {
    fn resolve(&self, address: &str) -> Option<SocketAddr> {
        match address.to_socket_addrs() {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                debug!(address, error = %e, "Address does not resolve, using it as a name");
                None
            }
        }
    }

    fn host_addresses(&self) -> Vec<IpAddr> {
        let mut addresses = match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces.iter().map(|iface| iface.ip()).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list network interfaces");
                Vec::new()
            }
        };
        addresses.extend(self.local_addresses.iter().copied());
        addresses
    }
}

/// Name of the key store for `destination` as seen from `site`.
///
/// A destination that shares this site's port and resolves to another of
/// this host's addresses is the same machine reached by a different route,
/// so it is renamed to this site's own address.
pub fn keystore_name(
    resolver: &dyn SiteResolver,
    site: Option<SocketAddr>,
    destination: &str,
) -> String {
    let Some(mut resolved) = resolver.resolve(destination) else {
        return destination.to_string();
    };

    if let Some(site) = site {
        if resolved.port() == site.port()
            && resolved.ip() != site.ip()
            && resolver.host_addresses().contains(&resolved.ip())
        {
            resolved.set_ip(site.ip());
        }
    }
    resolved.to_string()
}
