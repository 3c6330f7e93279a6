//! DNS resolution with the [`DnsResolver`] type.

use std::io;
use std::net::IpAddr;

use hickory_resolver::error::ResolveError;
use hickory_resolver::lookup_ip::LookupIp;
use hickory_resolver::proto::rr::rdata::SRV;

/// One row of an `SRV` lookup, already stripped of its DNS-specific wrapper.
#[derive(Debug, Clone)]
pub struct SrvRecord {
    /// Lower values are preferred.
    pub priority: u16,
    /// Relative weight among records sharing a priority. Not used for
    /// ordering by the dispatch core, but kept for completeness.
    pub weight: u16,
    /// Target hostname, without the trailing root dot.
    pub target: String,
    /// Target port.
    pub port: u16,
}

impl From<&SRV> for SrvRecord {
    fn from(srv: &SRV) -> Self {
        SrvRecord {
            priority: srv.priority(),
            weight: srv.weight(),
            target: srv.target().to_utf8().trim_end_matches('.').to_string(),
            port: srv.port(),
        }
    }
}

/// A DNS resolver backed by [hickory-dns](https://github.com/hickory-dns/hickory-dns).
pub struct DnsResolver {
    dns_resolver: hickory_resolver::TokioAsyncResolver,
}

impl DnsResolver {
    async fn lookup(&self, host: &str) -> std::result::Result<LookupIp, ResolveError> {
        self.dns_resolver.lookup_ip(host).await
    }

    /// Resolves a hostname to a single address, preferring whatever the
    /// resolver ranks first.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, io::Error> {
        Ok(self
            .lookup(host)
            .await
            .map_err(|err| io::Error::other(format!("Failed to lookup DNS: {}", err)))?
            .iter()
            .next()
            .ok_or_else(|| io::Error::other(format!("No address found for {host}")))?)
    }

    /// Resolves a hostname to every address on record.
    pub async fn resolve_all(&self, host: &str) -> Result<Vec<IpAddr>, io::Error> {
        let result = self
            .lookup(host)
            .await
            .map_err(|err| io::Error::other(format!("Failed to lookup DNS: {}", err)))?;

        Ok(result.iter().collect())
    }

    /// Resolves `_service._proto.domain`-style `SRV` records.
    pub async fn resolve_srv(&self, name: &str) -> Result<Vec<SrvRecord>, io::Error> {
        let lookup = self
            .dns_resolver
            .srv_lookup(name)
            .await
            .map_err(|err| io::Error::other(format!("Failed to lookup SRV: {}", err)))?;

        Ok(lookup.iter().map(SrvRecord::from).collect())
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self {
            dns_resolver: hickory_resolver::AsyncResolver::tokio_from_system_conf()
                .expect("Failed to get DNS resolver"),
        }
    }
}
