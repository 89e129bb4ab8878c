//! A `reqwest::dns::Resolve` that serves validated public addresses out of
//! the shared `DnsCache`, so outbound HTTP requests reconnect to the exact
//! addresses `target_filter::validate_target` already checked instead of
//! re-resolving (and possibly being rebound) at connect time.
//!
//! Grounded on `aether-proxy::safe_dns::SafeDnsResolver`.

use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};

use crate::target_filter::{self, DnsCache};

pub struct SafeDnsResolver {
    dns_cache: Arc<DnsCache>,
}

impl SafeDnsResolver {
    pub fn new(dns_cache: Arc<DnsCache>) -> Self {
        Self { dns_cache }
    }
}

impl Resolve for SafeDnsResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let dns_cache = Arc::clone(&self.dns_cache);
        Box::pin(async move {
            let host = name.as_str();

            if let Some(addrs) = dns_cache.get_by_host(host).await {
                let socket_addrs: Vec<SocketAddr> = (*addrs).clone();
                return Ok(Box::new(socket_addrs.into_iter()) as Addrs);
            }

            let addr_str = format!("{host}:0");
            let resolved: Vec<SocketAddr> = tokio::net::lookup_host(&addr_str)
                .await
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })?
                .filter(|addr| !target_filter::is_private_ip(&addr.ip()))
                .collect();

            if resolved.is_empty() {
                return Err(Box::new(std::io::Error::other(format!(
                    "all resolved addresses for {host} are private/reserved"
                ))) as Box<dyn std::error::Error + Send + Sync>);
            }

            Ok(Box::new(resolved.into_iter()) as Addrs)
        })
    }
}
