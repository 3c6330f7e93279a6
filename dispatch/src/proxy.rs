//! Stateless-proxy forwarder (§4.6, §4.7): layered on top of the
//! dispatcher, it routes by `Via`/`Route` rather than transaction state
//! and rewrites `Contact` so replies come back through us.

use std::str::FromStr;
use std::sync::Arc;

use md5::{Digest, Md5};
use tokio::time::Instant;
use util::ArcStr;

use crate::dispatcher::{DeliverOpts, Dispatcher};
use crate::error::{Error, Result};
use crate::leg::{Destination, Leg, LegCriteria};
use crate::message::{Packet, SipMethod, TransportProtocol};
use crate::nat::NatHelper;
use crate::registrar::{Registrar, RegistrarOutcome};
use crate::resolver::{HopDns, PortDefaults};

const MARKER: &[u8] = b"MARKER";

/// Pluggable `Contact` rewrite transform (§4.7): bijective on inputs
/// containing `@`, and `decode` must fail closed on anything that isn't
/// one of its own tokens.
pub trait ContactRewriter: Send + Sync {
    fn encode(&self, user_host: &str) -> String;
    fn decode(&self, token: &str) -> Option<String>;
}

/// Default rewriter: an XOR stream cipher keyed by the MD5 of every leg's
/// `proto:addr:port`, concatenated in sorted order, applied to
/// `user@host` plus a literal trailer marker so `decode` can recognise a
/// token that isn't one of ours.
pub struct XorCipherRewriter {
    key: Vec<u8>,
}

impl XorCipherRewriter {
    pub fn from_legs(legs: &[Arc<dyn Leg>]) -> Self {
        let mut parts: Vec<String> = legs
            .iter()
            .map(|l| format!("{}:{}:{}", l.proto(), l.addr(), l.port()))
            .collect();
        parts.sort();
        let mut hasher = Md5::new();
        hasher.update(parts.join(",").as_bytes());
        Self {
            key: hasher.finalize().to_vec(),
        }
    }

    fn xor(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ self.key[i % self.key.len()])
            .collect()
    }
}

impl ContactRewriter for XorCipherRewriter {
    fn encode(&self, user_host: &str) -> String {
        let mut data = user_host.as_bytes().to_vec();
        data.extend_from_slice(MARKER);
        hex::encode(self.xor(&data))
    }

    fn decode(&self, token: &str) -> Option<String> {
        let raw = hex::decode(token).ok()?;
        let data = self.xor(&raw);
        if data.len() < MARKER.len() {
            return None;
        }
        let (body, marker) = data.split_at(data.len() - MARKER.len());
        if marker != MARKER {
            return None;
        }
        String::from_utf8(body.to_vec()).ok()
    }
}

fn rewrite_one_contact(raw: &str, rewriter: &dyn ContactRewriter, outgoing_leg: &dyn Leg) -> ArcStr {
    let (scheme_at, scheme_len) = if let Some(pos) = raw.find("sips:") {
        (pos, 5)
    } else if let Some(pos) = raw.find("sip:") {
        (pos, 4)
    } else {
        return ArcStr::from(raw);
    };
    let after_scheme = scheme_at + scheme_len;
    let rest = &raw[after_scheme..];
    let stop = rest.find(['>', ';']).unwrap_or(rest.len());
    let userhost = &rest[..stop];
    let prefix = &raw[..after_scheme];
    let suffix = &rest[stop..];

    let Some((user, host)) = userhost.split_once('@') else {
        return ArcStr::from(raw);
    };

    if !user.is_empty() && user.chars().all(|c| c.is_ascii_hexdigit()) {
        if let Some(original) = rewriter.decode(user) {
            return ArcStr::from(format!("{prefix}{original}{suffix}"));
        }
    }

    let token = rewriter.encode(&format!("{user}@{host}"));
    ArcStr::from(format!(
        "{prefix}{token}@{}:{}{suffix}",
        outgoing_leg.addr(),
        outgoing_leg.port()
    ))
}

fn rewrite_contacts(packet: &mut dyn Packet, rewriter: &dyn ContactRewriter, outgoing_leg: &dyn Leg) {
    let rewritten: Vec<ArcStr> = packet
        .contacts()
        .iter()
        .map(|c| rewrite_one_contact(c, rewriter, outgoing_leg))
        .collect();
    packet.set_contacts(rewritten);
}

fn split_host_port_default(s: &str, default_port: u16) -> (&str, u16) {
    match s.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (host, port.parse().unwrap_or(default_port))
        }
        _ => (s, default_port),
    }
}

struct ParsedVia {
    proto: TransportProtocol,
    host: String,
    port: u16,
    received: Option<(String, Option<u16>)>,
}

/// Parses a top `Via`, defaulting the sent-by port per `ports` (§9: a
/// `TCP`-speaking hop, the only way this core reaches a `sips` peer,
/// defaults to the `sips` port rather than unconditionally `5060`).
fn parse_top_via(via: &str, ports: &PortDefaults) -> Option<ParsedVia> {
    let mut parts = via.trim().splitn(2, char::is_whitespace);
    let sent_protocol = parts.next()?;
    let proto_token = sent_protocol.rsplit('/').next()?;
    let proto = TransportProtocol::from_str(proto_token).ok()?;
    let default_port = match proto {
        TransportProtocol::Tcp => ports.sips,
        TransportProtocol::Udp => ports.sip,
    };

    let rest = parts.next()?.trim();
    let mut segments = rest.split(';');
    let hostport = segments.next()?.trim();
    let (host, port) = split_host_port_default(hostport, default_port);

    let mut received = None;
    for seg in segments {
        if let Some(v) = seg.trim().strip_prefix("received=") {
            let (rhost, rport) = split_host_port_default(v, port);
            received = Some((rhost.to_string(), Some(rport)));
        }
    }

    Some(ParsedVia {
        proto,
        host: host.to_string(),
        port,
        received,
    })
}

/// Extracts `host[:port]` from a raw `Route`/`Record-Route` header value
/// of the form `<sip[s]:host[:port][;params]>`.
fn route_hostport(raw: &str) -> Option<(String, u16)> {
    let trimmed = raw.trim().trim_start_matches('<').trim_end_matches('>');
    let uri = crate::message::SipUri::parse(trimmed).ok()?;
    let host = uri.domain?.to_string();
    let port = uri.port.unwrap_or(5060);
    Some((host, port))
}

/// Configuration for a [`ProxyForwarder`]: built once, reused for every
/// inbound packet.
pub struct ProxyForwarder {
    registrar: Option<Box<dyn Registrar>>,
    nat: Option<Box<dyn NatHelper>>,
    rewriter: Box<dyn ContactRewriter>,
    ports: PortDefaults,
}

impl ProxyForwarder {
    pub fn new(rewriter: Box<dyn ContactRewriter>) -> Self {
        Self {
            registrar: None,
            nat: None,
            rewriter,
            ports: PortDefaults::default(),
        }
    }

    pub fn with_registrar(mut self, registrar: Box<dyn Registrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn with_nat(mut self, nat: Box<dyn NatHelper>) -> Self {
        self.nat = Some(nat);
        self
    }

    pub fn with_ports(mut self, ports: PortDefaults) -> Self {
        self.ports = ports;
        self
    }

    /// Runs one inbound packet through the forwarder (§4.6). `dns` backs
    /// the ad-hoc `dns_host2ip` lookups the response/request paths need
    /// beyond what `resolve_uri` already does.
    pub async fn forward(
        &mut self,
        mut packet: Box<dyn Packet>,
        incoming_leg: Arc<dyn Leg>,
        dispatcher: &mut Dispatcher,
        dns: &dyn HopDns,
        now: Instant,
    ) -> Result<()> {
        if packet.is_request() && packet.method() == SipMethod::Register {
            if let Some(registrar) = self.registrar.as_mut() {
                if matches!(registrar.handle_register(packet.as_mut()), RegistrarOutcome::Handled) {
                    return Ok(());
                }
            }
        }

        if incoming_leg.forward_incoming(packet.as_mut()).is_err() {
            return Ok(());
        }

        let (mut outgoing_leg, mut candidates): (Option<Arc<dyn Leg>>, Vec<Destination>) =
            if packet.is_response() {
                match self.route_response(packet.as_ref(), dispatcher, dns).await? {
                    Some((leg, dst)) => (Some(leg), vec![dst]),
                    None => return Ok(()),
                }
            } else {
                self.route_request(packet.as_mut(), incoming_leg.as_ref(), dispatcher, dns)
                    .await?
            };

        if outgoing_leg.is_none() {
            let legs = dispatcher.legs();
            let criteria = LegCriteria::default();
            let prefer_tcp = incoming_leg.proto() == TransportProtocol::Tcp;
            let mut chosen: Option<Arc<dyn Leg>> = None;
            let mut chosen_dst: Option<Destination> = None;
            for dst in &candidates {
                let matches = legs.find_legs_for(dst, &criteria);
                let pick = if prefer_tcp {
                    matches
                        .iter()
                        .find(|l| l.proto() == TransportProtocol::Tcp)
                        .or_else(|| matches.first())
                } else {
                    matches.first()
                };
                if let Some(leg) = pick {
                    chosen = Some(leg.clone());
                    chosen_dst = Some(dst.clone());
                    break;
                }
            }
            match (chosen, chosen_dst) {
                (Some(leg), Some(dst)) => {
                    outgoing_leg = Some(leg);
                    candidates = vec![dst];
                }
                _ => return Err(Error::HostUnreachable),
            }
        }

        let outgoing_leg = outgoing_leg.ok_or(Error::HostUnreachable)?;
        let dst = candidates.into_iter().next().ok_or(Error::HostUnreachable)?;

        rewrite_contacts(packet.as_mut(), self.rewriter.as_ref(), outgoing_leg.as_ref());

        if outgoing_leg
            .forward_outgoing(packet.as_mut(), incoming_leg.as_ref())
            .is_err()
        {
            return Ok(());
        }

        if let Some(nat) = self.nat.as_ref() {
            nat.rewrite(packet.as_mut(), outgoing_leg.as_ref())?;
        }

        dispatcher
            .deliver(
                packet,
                DeliverOpts {
                    do_retransmits: Some(false),
                    pinned: Some(vec![(outgoing_leg, dst)]),
                    ..Default::default()
                },
                now,
            )
            .await;

        Ok(())
    }

    /// Builds `dst_addr` from the top `Via`'s own host:port, resolved to an
    /// IP, and never from `received=` (§4.6). `received=`, when present,
    /// only narrows which outgoing leg may carry the response: the leg's
    /// address must match `received` and it must be able to reach
    /// `dst_addr`. If no leg survives that filter, the response is dropped
    /// (`Ok(None)`) rather than sent somewhere the Via didn't ask for.
    async fn route_response(
        &self,
        packet: &dyn Packet,
        dispatcher: &Dispatcher,
        dns: &dyn HopDns,
    ) -> Result<Option<(Arc<dyn Leg>, Destination)>> {
        let via = packet.top_via().ok_or(Error::Invalid("response with no Via".into()))?;
        let parsed = parse_top_via(&via, &self.ports).ok_or(Error::Invalid("unparseable Via".into()))?;

        let ip = if parsed.host.parse::<std::net::Ipv4Addr>().is_ok() {
            parsed.host.clone()
        } else {
            dns.a(&parsed.host).await?.to_string()
        };
        let dst = Destination::new(parsed.proto, ip, parsed.port);

        let candidates = dispatcher.legs().get_legs(&LegCriteria::default());
        let leg = match &parsed.received {
            Some((received_host, _)) => candidates
                .into_iter()
                .find(|l| l.addr().as_ref() == received_host.as_str() && l.can_deliver_to(&dst)),
            None => candidates.into_iter().find(|l| l.can_deliver_to(&dst)),
        };

        Ok(leg.map(|leg| (leg, dst)))
    }

    async fn route_request(
        &self,
        packet: &mut dyn Packet,
        incoming_leg: &dyn Leg,
        dispatcher: &mut Dispatcher,
        dns: &dyn HopDns,
    ) -> Result<(Option<Arc<dyn Leg>>, Vec<Destination>)> {
        let mut outgoing_leg = None;
        let mut dsts: Vec<Destination> = Vec::new();

        if let Some(route) = packet.top_route() {
            if let Some((host, port)) = route_hostport(&route) {
                let own = dispatcher
                    .legs()
                    .get_legs(&LegCriteria::default())
                    .into_iter()
                    .find(|l| l.addr().as_ref() == host.as_str() && l.port() == port);
                if let Some(leg) = own {
                    outgoing_leg = Some(leg);
                    packet.pop_route();
                    if let Some(next_route) = packet.top_route() {
                        if let Some((h, p)) = route_hostport(&next_route) {
                            dsts.push(Destination::new(TransportProtocol::Udp, h, p));
                        }
                    }
                } else if let Some((h, p)) = route_hostport(&route) {
                    dsts.push(Destination::new(TransportProtocol::Udp, h, p));
                }
            }
        }

        if dsts.is_empty() {
            // No Route header left a hop for us, so fall back to the
            // request-URI. If a Route already pinned `outgoing_leg`,
            // restrict resolution to that leg so the chosen destination
            // stays reachable through it.
            let uri = packet.uri().ok_or(Error::HostUnreachable)?;
            let allowed: Vec<TransportProtocol> = if incoming_leg.proto() == TransportProtocol::Tcp {
                vec![TransportProtocol::Tcp, TransportProtocol::Udp]
            } else {
                vec![]
            };
            let pinned_pool = outgoing_leg.clone().map(|l| vec![l]);
            let resolved = dispatcher
                .resolve_uri(&uri, &allowed, pinned_pool.as_deref())
                .await?;
            for (leg, dst) in resolved {
                if outgoing_leg.is_none() {
                    outgoing_leg = Some(leg);
                }
                if dst.host.parse::<std::net::Ipv4Addr>().is_ok() {
                    dsts.push(dst);
                } else {
                    let ip = dns.a(&dst.host).await?;
                    dsts.push(Destination::new(dst.proto, ip.to_string(), dst.port));
                }
            }
        }

        Ok((outgoing_leg, dsts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leg::DeliverResult;
    use crate::message::StatusCode;
    use std::net::{Ipv4Addr, SocketAddr};

    #[derive(Debug)]
    struct StubLeg {
        proto: TransportProtocol,
        addr: ArcStr,
        port: u16,
    }

    #[async_trait::async_trait]
    impl Leg for StubLeg {
        fn proto(&self) -> TransportProtocol {
            self.proto
        }
        fn addr(&self) -> ArcStr {
            self.addr.clone()
        }
        fn port(&self) -> u16 {
            self.port
        }
        fn contact(&self) -> ArcStr {
            ArcStr::from(format!("{}:{}", self.addr, self.port))
        }
        fn fd(&self) -> Option<std::os::fd::RawFd> {
            None
        }
        fn can_deliver_to(&self, dst: &Destination) -> bool {
            dst.proto == self.proto
        }
        async fn deliver(&self, _bytes: &[u8], _dst: &Destination) -> DeliverResult {
            Ok(())
        }
        async fn receive(&self) -> Result<Option<(Box<dyn Packet>, SocketAddr)>> {
            Ok(None)
        }
    }

    fn legs() -> Vec<Arc<dyn Leg>> {
        vec![Arc::new(StubLeg {
            proto: TransportProtocol::Udp,
            addr: ArcStr::from("10.0.0.1"),
            port: 5060,
        })]
    }

    #[test]
    fn contact_rewrite_round_trips() {
        let rewriter = XorCipherRewriter::from_legs(&legs());
        let token = rewriter.encode("alice@192.0.2.1");
        assert_eq!(rewriter.decode(&token).as_deref(), Some("alice@192.0.2.1"));
    }

    #[test]
    fn contact_rewrite_rejects_foreign_tokens() {
        let rewriter = XorCipherRewriter::from_legs(&legs());
        assert_eq!(rewriter.decode("deadbeef"), None);
    }

    #[test]
    fn rewrite_one_contact_round_trips_in_header() {
        let rewriter = XorCipherRewriter::from_legs(&legs());
        let leg = StubLeg {
            proto: TransportProtocol::Udp,
            addr: ArcStr::from("198.51.100.9"),
            port: 5080,
        };
        let raw = "<sip:alice@192.0.2.1:5060>";
        let rewritten = rewrite_one_contact(raw, &rewriter, &leg);
        assert!(rewritten.contains("198.51.100.9:5080"));

        let decoded = rewrite_one_contact(&rewritten, &rewriter, &leg);
        assert!(decoded.contains("alice@192.0.2.1"));
    }

    #[test]
    fn via_parsing_extracts_received() {
        let via = "SIP/2.0/UDP host.example.com:5060;branch=z9hG4bK1;received=203.0.113.9";
        let parsed = parse_top_via(via, &PortDefaults::default()).unwrap();
        assert_eq!(parsed.proto, TransportProtocol::Udp);
        assert_eq!(parsed.host, "host.example.com");
        assert_eq!(parsed.port, 5060);
        assert_eq!(parsed.received.unwrap().0, "203.0.113.9");
    }

    #[test]
    fn via_with_no_port_defaults_by_proto() {
        let udp = parse_top_via(
            "SIP/2.0/UDP host.example.com;branch=z9hG4bK1",
            &PortDefaults::default(),
        )
        .unwrap();
        assert_eq!(udp.port, 5060);

        let tcp = parse_top_via(
            "SIP/2.0/TCP host.example.com;branch=z9hG4bK1",
            &PortDefaults::default(),
        )
        .unwrap();
        assert_eq!(tcp.port, 5061);
    }

    #[derive(Debug)]
    struct StubResponsePacket {
        via: ArcStr,
    }

    impl Packet for StubResponsePacket {
        fn is_request(&self) -> bool {
            false
        }
        fn method(&self) -> SipMethod {
            SipMethod::Invite
        }
        fn code(&self) -> Option<StatusCode> {
            Some(StatusCode(200))
        }
        fn cseq(&self) -> u32 {
            1
        }
        fn cseq_method(&self) -> SipMethod {
            SipMethod::Invite
        }
        fn call_id(&self) -> ArcStr {
            ArcStr::from("c1")
        }
        fn uri(&self) -> Option<ArcStr> {
            None
        }
        fn tid(&self) -> ArcStr {
            ArcStr::from("tid1")
        }
        fn top_via(&self) -> Option<ArcStr> {
            Some(self.via.clone())
        }
        fn top_route(&self) -> Option<ArcStr> {
            None
        }
        fn pop_route(&mut self) {}
        fn contacts(&self) -> Vec<ArcStr> {
            vec![]
        }
        fn set_contacts(&mut self, _: Vec<ArcStr>) {}
        fn dump(&self) -> Vec<u8> {
            b"SIP/2.0 200 OK".to_vec()
        }
    }

    struct StubDns {
        a: Ipv4Addr,
    }

    #[async_trait::async_trait]
    impl HopDns for StubDns {
        async fn srv(&self, _name: &str) -> Result<Vec<(i32, ArcStr, u16)>> {
            Ok(vec![])
        }
        async fn a(&self, _domain: &str) -> Result<Ipv4Addr> {
            Ok(self.a)
        }
    }

    fn dispatcher_with(legs: Vec<Arc<dyn Leg>>) -> Dispatcher {
        Dispatcher::builder().with_legs(legs).build()
    }

    #[tokio::test]
    async fn route_response_builds_dst_from_via_not_received() {
        let leg: Arc<dyn Leg> = Arc::new(StubLeg {
            proto: TransportProtocol::Udp,
            addr: ArcStr::from("203.0.113.9"),
            port: 5060,
        });
        let dispatcher = dispatcher_with(vec![leg.clone()]);
        let dns = StubDns {
            a: "192.0.2.50".parse().unwrap(),
        };
        let packet = StubResponsePacket {
            via: ArcStr::from(
                "SIP/2.0/UDP 192.0.2.50:5060;branch=z9hG4bK1;received=203.0.113.9",
            ),
        };
        let forwarder = ProxyForwarder::new(Box::new(XorCipherRewriter::from_legs(&[leg.clone()])));
        let (chosen, dst) = forwarder
            .route_response(&packet, &dispatcher, &dns)
            .await
            .unwrap()
            .unwrap();
        // dst_addr comes from the Via host (192.0.2.50), never from `received=`.
        assert_eq!(dst.host.as_ref(), "192.0.2.50");
        assert_eq!(dst.port, 5060);
        // but only a leg whose own address matches `received=` is eligible.
        assert!(Arc::ptr_eq(&chosen, &leg));
    }

    #[tokio::test]
    async fn route_response_drops_when_no_leg_matches_received() {
        let leg: Arc<dyn Leg> = Arc::new(StubLeg {
            proto: TransportProtocol::Udp,
            addr: ArcStr::from("10.0.0.1"),
            port: 5060,
        });
        let dispatcher = dispatcher_with(vec![leg.clone()]);
        let dns = StubDns {
            a: "192.0.2.50".parse().unwrap(),
        };
        let packet = StubResponsePacket {
            via: ArcStr::from(
                "SIP/2.0/UDP 192.0.2.50:5060;branch=z9hG4bK1;received=203.0.113.9",
            ),
        };
        let forwarder = ProxyForwarder::new(Box::new(XorCipherRewriter::from_legs(&[leg])));
        let result = forwarder
            .route_response(&packet, &dispatcher, &dns)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
