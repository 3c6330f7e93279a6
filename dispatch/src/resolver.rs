//! URI to hop resolution (§4.4): static tables, global outgoing proxy, IP
//! literals, then DNS SRV/A, each narrowed by protocol preference.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use util::{ArcStr, DnsResolver};

use crate::error::{Error, Result};
use crate::leg::{Destination, Leg, LegCriteria, LegRegistry};
use crate::message::{SipUri, TransportProtocol, UriScheme};

/// One row of a prioritised hop list: `prio = -1` for anything not sourced
/// from DNS SRV (static table, outgoing proxy, IP literal, A fallback).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopCandidate {
    pub prio: i32,
    pub proto: TransportProtocol,
    pub host: ArcStr,
    pub port: u16,
}

impl HopCandidate {
    pub fn static_hop(proto: TransportProtocol, host: impl Into<ArcStr>, port: u16) -> Self {
        Self {
            prio: -1,
            proto,
            host: host.into(),
            port,
        }
    }
}

/// `domain -> [HopCandidate]`, looked up by longest matching suffix then a
/// catch-all (§3 `DomainMap`).
#[derive(Debug, Clone, Default)]
pub struct DomainMap {
    entries: HashMap<String, Vec<HopCandidate>>,
}

impl DomainMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an already-expanded candidate list under `domain`
    /// (`domain` may itself be `"*"` for the catch-all, or `"*.suffix"`).
    pub fn insert(&mut self, domain: impl Into<String>, candidates: Vec<HopCandidate>) {
        self.entries.insert(domain.into(), candidates);
    }

    /// Registers the normalised string form `"[proto:]host[:port]"`,
    /// expanding it to one [`HopCandidate`] per protocol: both `udp` and
    /// `tcp` if no `proto:` prefix was given, or just the named one.
    pub fn insert_str(&mut self, domain: impl Into<String>, spec: &str, default_port: u16) {
        let candidates = parse_static_hop_spec(spec, default_port);
        self.insert(domain, candidates);
    }

    /// Longest-suffix lookup: exact domain, then `*.parent(domain)`
    /// iteratively, then the catch-all `"*"`.
    pub fn lookup(&self, domain: &str) -> Option<&[HopCandidate]> {
        for key in lookup_keys(domain) {
            if let Some(hits) = self.entries.get(&key) {
                return Some(hits);
            }
        }
        None
    }
}

fn lookup_keys(domain: &str) -> Vec<String> {
    let mut keys = vec![domain.to_string()];
    let labels: Vec<&str> = domain.split('.').collect();
    for i in 1..labels.len() {
        keys.push(format!("*.{}", labels[i..].join(".")));
    }
    keys.push("*".to_string());
    keys
}

/// Parses `"[proto:]host[:port]"` into one candidate per protocol.
fn parse_static_hop_spec(spec: &str, default_port: u16) -> Vec<HopCandidate> {
    let (proto, rest) = match spec.split_once(':') {
        Some((p, rest)) if TransportProtocol::from_str(p).is_ok() => {
            (Some(TransportProtocol::from_str(p).unwrap()), rest)
        }
        _ => (None, spec),
    };
    let (host, port) = match rest.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
            (h, p.parse().unwrap_or(default_port))
        }
        _ => (rest, default_port),
    };
    match proto {
        Some(p) => vec![HopCandidate::static_hop(p, host, port)],
        None => vec![
            HopCandidate::static_hop(TransportProtocol::Udp, host, port),
            HopCandidate::static_hop(TransportProtocol::Tcp, host, port),
        ],
    }
}

/// Default port for a scheme, per §4.4 / §9 (configurable for `sips`).
#[derive(Debug, Clone, Copy)]
pub struct PortDefaults {
    pub sip: u16,
    pub sips: u16,
}

impl Default for PortDefaults {
    fn default() -> Self {
        Self {
            sip: 5060,
            sips: 5061,
        }
    }
}

/// Stand-in for the external DNS/SRV collaborator (§6): `resolve_uri` is
/// generic over anything providing these two async lookups, so tests can
/// substitute a deterministic stub (Testable Property 5).
#[async_trait::async_trait]
pub trait HopDns: Send + Sync {
    async fn srv(&self, name: &str) -> Result<Vec<(i32, ArcStr, u16)>>;
    async fn a(&self, domain: &str) -> Result<Ipv4Addr>;
}

/// Adapts [`util::DnsResolver`] to [`HopDns`].
pub struct SystemDns {
    resolver: DnsResolver,
}

impl SystemDns {
    pub fn new(resolver: DnsResolver) -> Self {
        Self { resolver }
    }
}

#[async_trait::async_trait]
impl HopDns for SystemDns {
    async fn srv(&self, name: &str) -> Result<Vec<(i32, ArcStr, u16)>> {
        let records = self
            .resolver
            .resolve_srv(name)
            .await
            .map_err(|e| Error::Dns(e.to_string()))?;
        Ok(records
            .into_iter()
            .map(|r| (r.priority as i32, ArcStr::from(r.target), r.port))
            .collect())
    }

    async fn a(&self, domain: &str) -> Result<Ipv4Addr> {
        let addr = self
            .resolver
            .resolve(domain)
            .await
            .map_err(|e| Error::Dns(e.to_string()))?;
        match addr {
            std::net::IpAddr::V4(v4) => Ok(v4),
            std::net::IpAddr::V6(_) => Err(Error::Dns(format!("{domain} resolved to IPv6 only"))),
        }
    }
}

/// Static configuration the resolver needs beyond the DNS collaborator.
#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    pub domain2proxy: DomainMap,
    pub outgoing_proxy: Option<Vec<HopCandidate>>,
    pub ports: PortDefaults,
}

/// Output of a successful resolution: parallel `(leg, dst)` pairs, head
/// first, per invariant 1 of the data model.
pub type ResolvedHops = Vec<(Arc<dyn Leg>, Destination)>;

fn protocol_preference(uri: &SipUri) -> Vec<TransportProtocol> {
    if uri.scheme == UriScheme::Sips {
        return vec![TransportProtocol::Tcp];
    }
    if let Some(t) = &uri.transport_param {
        if let Ok(p) = TransportProtocol::from_str(t) {
            return vec![p];
        }
    }
    vec![TransportProtocol::Udp, TransportProtocol::Tcp]
}

fn intersect_preserving_order(
    preferred: &[TransportProtocol],
    allowed: &[TransportProtocol],
) -> Vec<TransportProtocol> {
    if allowed.is_empty() {
        return preferred.to_vec();
    }
    allowed
        .iter()
        .filter(|p| preferred.contains(p))
        .copied()
        .collect()
}

fn is_ipv4_literal(domain: &str) -> Option<Ipv4Addr> {
    domain.parse().ok()
}

fn reverse_in_addr_arpa(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("{d}.{c}.{b}.{a}.in-addr.arpa")
}

/// Resolves a SIP URI to a prioritised, leg-matched list of destinations
/// (§4.4). `allowed_proto` restricts (and orders) acceptable protocols;
/// `allowed_legs` restricts which legs may be chosen from (empty = all
/// registered legs).
pub async fn resolve_uri(
    uri_str: &str,
    config: &ResolverConfig,
    legs: &LegRegistry,
    dns: &dyn HopDns,
    allowed_proto: &[TransportProtocol],
    allowed_legs: Option<&[Arc<dyn Leg>]>,
) -> Result<ResolvedHops> {
    let uri = SipUri::parse(uri_str)?;
    let domain = uri.domain.clone().ok_or(Error::HostUnreachable)?;

    let preferred = protocol_preference(&uri);
    let protos = intersect_preserving_order(&preferred, allowed_proto);
    if protos.is_empty() {
        return Err(Error::NoProtoOpt);
    }

    let default_port = match uri.scheme {
        UriScheme::Sips => config.ports.sips,
        UriScheme::Sip => config.ports.sip,
    };
    let port_override = uri.port;

    let ip_literal = is_ipv4_literal(domain.trim_end_matches('.'));
    let lookup_domain = match ip_literal {
        Some(ip) => reverse_in_addr_arpa(ip),
        None => domain.trim_end_matches('.').to_string(),
    };

    let mut candidates: Vec<HopCandidate> = Vec::new();

    // 1. static per-domain table.
    if let Some(hits) = config.domain2proxy.lookup(&lookup_domain) {
        candidates.extend(hits.iter().cloned());
    }

    // 2. global outgoing proxy.
    if candidates.is_empty() {
        if let Some(proxy) = &config.outgoing_proxy {
            candidates.extend(proxy.iter().cloned());
        }
    }

    // 3. embedded IP literal.
    if candidates.is_empty() {
        if let Some(ip) = ip_literal {
            let port = port_override.unwrap_or(default_port);
            for proto in &protos {
                candidates.push(HopCandidate::static_hop(*proto, ip.to_string(), port));
            }
        }
    }

    // 4. DNS SRV, falling back to A.
    if candidates.is_empty() {
        let mut srv_hits = Vec::new();
        for proto in &protos {
            let name = format!("_sip._{}.{}", proto.as_str(), domain.trim_end_matches('.'));
            if let Ok(rows) = dns.srv(&name).await {
                for (prio, target, port) in rows {
                    srv_hits.push(HopCandidate {
                        prio,
                        proto: *proto,
                        host: target,
                        port,
                    });
                }
            }
        }
        if !srv_hits.is_empty() {
            candidates = srv_hits;
        } else {
            let ip = dns.a(domain.trim_end_matches('.')).await?;
            let port = port_override.unwrap_or(default_port);
            for proto in &protos {
                candidates.push(HopCandidate::static_hop(*proto, ip.to_string(), port));
            }
        }
    }

    // Finalisation: stable sort by prio (ties keep DNS/insertion order),
    // then keep only candidates a leg can actually reach.
    candidates.sort_by_key(|c| c.prio);

    let criteria = LegCriteria::default();
    let mut resolved = Vec::new();
    for c in &candidates {
        let dst = Destination::new(c.proto, c.host.clone(), c.port);
        let pool: Vec<Arc<dyn Leg>> = match allowed_legs {
            Some(subset) => subset.to_vec(),
            None => legs.get_legs(&criteria),
        };
        let found = pool.into_iter().find(|l| {
            l.proto() == dst.proto && l.can_deliver_to(&dst)
        });
        if let Some(leg) = found {
            resolved.push((leg, dst));
        }
    }

    if resolved.is_empty() {
        return Err(Error::HostUnreachable);
    }

    Ok(resolved)
}
