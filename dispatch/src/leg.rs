//! Leg registry: the set of bound transport endpoints the dispatcher can
//! send through or receive from (§4.3).

pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use util::ArcStr;

use crate::error::Result;
use crate::message::{Packet, TransportProtocol};

/// A filter string a candidate must match, e.g. `"192.0.2.5"` or a bare
/// hostname already resolved to dotted-quad form by the resolver.
pub type Addr = ArcStr;

/// A resolved hop candidate, kept as `proto:host:port` components rather
/// than a [`SocketAddr`] — the host may still be a hostname (e.g. an SRV
/// target) that the leg, not the resolver, is responsible for turning into
/// an address at send time (scenario S1 keeps the SRV target name in
/// `dst_addr` rather than eagerly resolving it to an IP).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub proto: TransportProtocol,
    pub host: ArcStr,
    pub port: u16,
}

impl Destination {
    pub fn new(proto: TransportProtocol, host: impl Into<ArcStr>, port: u16) -> Self {
        Self {
            proto,
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.proto, self.host, self.port)
    }
}

/// Criteria for [`LegRegistry::get_legs`]; all present fields must match
/// (conjunctive). Empty criteria matches everything.
#[derive(Debug, Clone, Default)]
pub struct LegCriteria {
    pub addr: Option<ArcStr>,
    pub port: Option<u16>,
    pub proto: Option<TransportProtocol>,
}

impl LegCriteria {
    pub fn matches(&self, leg: &dyn Leg) -> bool {
        if let Some(addr) = &self.addr {
            if leg.addr() != *addr {
                return false;
            }
        }
        if let Some(port) = self.port {
            if leg.port() != port {
                return false;
            }
        }
        if let Some(proto) = self.proto {
            if leg.proto() != proto {
                return false;
            }
        }
        true
    }
}

/// Outcome of a `deliver` attempt, handed to the queue's completion path.
pub type DeliverResult = std::result::Result<(), std::io::Error>;

/// A bound transport endpoint: a UDP socket or a TCP listener/connection
/// (§1, §3, §6). This is the interface the core consumes; socket I/O, TCP
/// framing and `Via` injection live on the implementation, not here.
#[async_trait::async_trait]
pub trait Leg: std::fmt::Debug + Send + Sync {
    /// Transport protocol this leg speaks.
    fn proto(&self) -> TransportProtocol;
    /// Bound local address.
    fn addr(&self) -> ArcStr;
    /// Bound local port.
    fn port(&self) -> u16;
    /// The `Contact` host:port this leg advertises to the outside world.
    fn contact(&self) -> ArcStr;
    /// Raw file descriptor, for event-loop registration; `None` for legs
    /// with no pollable FD of their own (e.g. a leg multiplexed over
    /// another's FD).
    fn fd(&self) -> Option<std::os::fd::RawFd>;

    /// Whether this leg can reach the given destination. `addr`/`port` may
    /// be unset in the criteria to mean "any".
    fn can_deliver_to(&self, dst: &Destination) -> bool;

    /// Sends already-serialised `bytes` to `dst`. Success for UDP is
    /// immediate; for TCP it means the bytes were handed to the socket
    /// (connect may still be in flight internally). Bytes rather than a
    /// `Packet` so the response cache can replay a stored wire image
    /// without re-parsing it.
    async fn deliver(&self, bytes: &[u8], dst: &Destination) -> DeliverResult;

    /// Reads one datagram/frame, if any is ready. `None` means nothing
    /// useful arrived yet (partial TCP read, or a listening socket that
    /// spawned a new connection leg) and the caller should take no further
    /// action.
    async fn receive(&self) -> Result<Option<(Box<dyn Packet>, SocketAddr)>>;

    /// Stateless-proxy hook run on an inbound packet before routing
    /// decisions are made (adds `Record-Route`, etc).
    fn forward_incoming(&self, packet: &mut dyn Packet) -> Result<()> {
        let _ = packet;
        Ok(())
    }

    /// Stateless-proxy hook run on an outbound (forwarded) packet just
    /// before it is handed to `deliver`.
    fn forward_outgoing(&self, packet: &mut dyn Packet, incoming_leg: &dyn Leg) -> Result<()> {
        let _ = (packet, incoming_leg);
        Ok(())
    }
}

/// Registers/removes legs and wires their FDs into an event loop (§4.3).
///
/// Invariant 5 of the data model: a leg is never present in the registry
/// without its FD registered, when it has one — `add_leg`/`remove_leg` are
/// the only mutators and both keep that in lock-step.
pub struct LegRegistry {
    legs: Vec<Arc<dyn Leg>>,
}

impl Default for LegRegistry {
    fn default() -> Self {
        Self { legs: Vec::new() }
    }
}

impl LegRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an already-constructed leg and, if it has an FD, installs
    /// a read handler on `event_loop` that calls `on_receive` whenever the
    /// leg reports readiness.
    pub fn add_leg(&mut self, leg: Arc<dyn Leg>) {
        log::debug!(
            "registering leg {}:{}:{}",
            leg.proto(),
            leg.addr(),
            leg.port()
        );
        self.legs.push(leg);
    }

    /// Removes legs by identity (pointer equality on the trait object).
    pub fn remove_leg(&mut self, leg: &Arc<dyn Leg>) {
        self.legs.retain(|l| !Arc::ptr_eq(l, leg));
    }

    pub fn get_legs(&self, criteria: &LegCriteria) -> Vec<Arc<dyn Leg>> {
        self.legs
            .iter()
            .filter(|l| criteria.matches(l.as_ref()))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Leg>> {
        self.legs.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty()
    }

    /// Legs (in registration order) matching `criteria` that can also
    /// physically reach `dst` (§9): returns every match rather than just the
    /// first, letting callers take the head if that's all they need.
    pub fn find_legs_for(&self, dst: &Destination, criteria: &LegCriteria) -> Vec<Arc<dyn Leg>> {
        self.legs
            .iter()
            .filter(|l| criteria.matches(l.as_ref()) && l.can_deliver_to(dst))
            .cloned()
            .collect()
    }
}
