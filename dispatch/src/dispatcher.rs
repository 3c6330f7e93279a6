//! The dispatcher core (§4.5): orchestrates resolve → send → retransmit →
//! fail for every queue entry, demultiplexes inbound packets, and answers
//! retransmitted requests straight from the response cache.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::Instant;
use util::{ArcStr, DnsResolver};

use crate::error::{Error, Result};
use crate::leg::{Destination, Leg, LegCriteria, LegRegistry};
use crate::message::Packet;
use crate::queue::{Callback, DeliveryQueue, QueueEntry};
use crate::resolver::{resolve_uri, HopDns, ResolverConfig, SystemDns};
use crate::response_cache::ResponseCache;
use crate::timing::schedule_for;

/// Receives packets the dispatcher could not answer from the response
/// cache. Modelled as a trait rather than a bare closure so a stateful
/// upper layer (e.g. a transaction table) can be plugged in directly, the
/// way `set_receiver(cb|object)` is phrased in the external-interface list.
pub trait Receiver: Send {
    fn receive(&mut self, packet: Box<dyn Packet>, leg: Arc<dyn Leg>, from: SocketAddr);
}

impl<F> Receiver for F
where
    F: FnMut(Box<dyn Packet>, Arc<dyn Leg>, SocketAddr) + Send,
{
    fn receive(&mut self, packet: Box<dyn Packet>, leg: Arc<dyn Leg>, from: SocketAddr) {
        (self)(packet, leg, from)
    }
}

/// Per-call override of the dispatcher's delivery behaviour.
#[derive(Default)]
pub struct DeliverOpts {
    /// Overrides the dispatcher-wide `do_retransmits` default for this one
    /// entry; the stateless-proxy forwarder sets this to `Some(false)`.
    pub do_retransmits: Option<bool>,
    /// Protocols the resolver may choose among; empty means no restriction.
    pub allowed_proto: Vec<crate::message::TransportProtocol>,
    /// Pre-resolved `(leg, dst)` pairs, bypassing the resolver entirely —
    /// used for responses (which reply to a known peer) and proxy
    /// forwarding (which has already picked a hop).
    pub pinned: Option<Vec<(Arc<dyn Leg>, Destination)>>,
    /// Cancellation key; defaults to the packet's `tid`.
    pub id: Option<ArcStr>,
    /// Completion callback.
    pub callback: Option<Callback>,
}

/// Constructs a [`Dispatcher`]: fluent `with_*` setters, fallible-or-not
/// parts resolved at `build()` time.
pub struct DispatcherBuilder {
    legs: Vec<Arc<dyn Leg>>,
    resolver_config: ResolverConfig,
    do_retransmits: bool,
    dns: Option<Arc<dyn HopDns>>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            legs: Vec::new(),
            resolver_config: ResolverConfig::default(),
            do_retransmits: true,
            dns: None,
        }
    }
}

impl DispatcherBuilder {
    pub fn with_leg(mut self, leg: Arc<dyn Leg>) -> Self {
        self.legs.push(leg);
        self
    }

    pub fn with_legs(mut self, legs: impl IntoIterator<Item = Arc<dyn Leg>>) -> Self {
        self.legs.extend(legs);
        self
    }

    pub fn with_resolver_config(mut self, config: ResolverConfig) -> Self {
        self.resolver_config = config;
        self
    }

    pub fn with_do_retransmits(mut self, do_retransmits: bool) -> Self {
        self.do_retransmits = do_retransmits;
        self
    }

    pub fn with_dns(mut self, dns: Arc<dyn HopDns>) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn build(self) -> Dispatcher {
        let mut legs = LegRegistry::new();
        for leg in self.legs {
            legs.add_leg(leg);
        }
        Dispatcher {
            legs,
            queue: DeliveryQueue::new(),
            response_cache: ResponseCache::new(),
            resolver_config: self.resolver_config,
            dns: self
                .dns
                .unwrap_or_else(|| Arc::new(SystemDns::new(DnsResolver::default()))),
            do_retransmits: self.do_retransmits,
            receiver: None,
        }
    }
}

/// The dispatcher core. Owns the leg registry, delivery queue and response
/// cache outright and carries no internal lock of its own (§5): callers
/// that need to share one `Dispatcher` across tasks serialise access
/// externally (e.g. a single `tokio::sync::Mutex` held for the duration of
/// each top-level call), which is what makes "single-threaded cooperative,
/// no internal locking" hold in an async runtime.
pub struct Dispatcher {
    legs: LegRegistry,
    queue: DeliveryQueue,
    response_cache: ResponseCache,
    resolver_config: ResolverConfig,
    dns: Arc<dyn HopDns>,
    do_retransmits: bool,
    receiver: Option<Box<dyn Receiver>>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    pub fn set_receiver(&mut self, receiver: Box<dyn Receiver>) {
        self.receiver = Some(receiver);
    }

    pub fn add_leg(&mut self, leg: Arc<dyn Leg>) {
        self.legs.add_leg(leg);
    }

    pub fn remove_leg(&mut self, leg: &Arc<dyn Leg>) {
        self.legs.remove_leg(leg);
    }

    pub fn get_legs(&self, criteria: &LegCriteria) -> Vec<Arc<dyn Leg>> {
        self.legs.get_legs(criteria)
    }

    pub fn legs(&self) -> &LegRegistry {
        &self.legs
    }

    pub fn resolver_config(&self) -> &ResolverConfig {
        &self.resolver_config
    }

    pub fn resolver_config_mut(&mut self) -> &mut ResolverConfig {
        &mut self.resolver_config
    }

    /// `resolve_uri` as a public operation (§6), for callers that want hop
    /// selection without going through a full `deliver`.
    #[tracing::instrument(skip(self, uri_str, allowed_proto, allowed_legs), fields(uri = %uri_str))]
    pub async fn resolve_uri(
        &self,
        uri_str: &str,
        allowed_proto: &[crate::message::TransportProtocol],
        allowed_legs: Option<&[Arc<dyn Leg>]>,
    ) -> Result<Vec<(Arc<dyn Leg>, Destination)>> {
        resolve_uri(
            uri_str,
            &self.resolver_config,
            &self.legs,
            self.dns.as_ref(),
            allowed_proto,
            allowed_legs,
        )
        .await
    }

    /// Resolves a bare hostname to an IPv4 address (§6 `dns_host2ip`), for
    /// callers that need host2ip without the full hop-selection pipeline
    /// (the stateless-proxy forwarder's `Via`/`Route` handling does).
    pub async fn dns_host2ip(&self, host: &str) -> Result<std::net::Ipv4Addr> {
        self.dns.a(host).await
    }

    /// Queries `_sip._<proto>.<domain>` SRV records for each protocol in
    /// `protos` (§6 `dns_domain2srv`).
    pub async fn dns_domain2srv(
        &self,
        domain: &str,
        protos: &[crate::message::TransportProtocol],
    ) -> Result<Vec<(i32, ArcStr, u16)>> {
        let mut rows = Vec::new();
        for proto in protos {
            let name = format!("_sip._{}.{}", proto.as_str(), domain);
            rows.extend(self.dns.srv(&name).await?);
        }
        Ok(rows)
    }

    /// Submits `packet` for delivery (§4.5 `deliver`). Returns the
    /// cancellation id the entry was queued under.
    #[tracing::instrument(skip(self, packet, opts, now), fields(tid = %packet.tid()))]
    pub async fn deliver(
        &mut self,
        packet: Box<dyn Packet>,
        opts: DeliverOpts,
        now: Instant,
    ) -> ArcStr {
        if packet.is_response() {
            self.response_cache.insert(packet.as_ref(), now);
        }

        let id = opts.id.clone().unwrap_or_else(|| packet.tid());
        let do_retransmits = opts.do_retransmits.unwrap_or(self.do_retransmits);
        let retransmits = if do_retransmits {
            schedule_for(packet.as_ref())
        } else {
            None
        };

        let mut entry = QueueEntry::new(id.clone(), packet, retransmits, now);
        entry.allowed_proto = opts.allowed_proto;
        if let Some(pinned) = opts.pinned {
            entry.targets = pinned;
        }
        if let Some(cb) = opts.callback {
            entry = entry.with_callback(cb);
        }

        let index = self.queue.push(entry);
        self.__deliver(index, now).await;
        id
    }

    /// Drives one entry through resolution (if needed) and a send attempt
    /// (§4.5 `__deliver`).
    async fn __deliver(&mut self, index: usize, now: Instant) {
        let needs_resolve = match self.queue.get(index) {
            Some(e) => e.is_unresolved(),
            None => return,
        };

        if needs_resolve {
            let uri = match self.queue.get(index).and_then(|e| e.packet.uri()) {
                Some(u) => u,
                None => {
                    let mut entry = self.queue.remove(index);
                    entry.notify(Some(Error::HostUnreachable));
                    return;
                }
            };
            let allowed_proto = self.queue.get(index).unwrap().allowed_proto.clone();

            let resolved = resolve_uri(
                &uri,
                &self.resolver_config,
                &self.legs,
                self.dns.as_ref(),
                &allowed_proto,
                None,
            )
            .await;

            match resolved {
                Ok(hops) => {
                    if let Some(entry) = self.queue.get_mut(index) {
                        entry.targets = hops;
                    } else {
                        return;
                    }
                }
                Err(e) => {
                    let mut entry = self.queue.remove(index);
                    entry.notify(Some(e));
                    return;
                }
            }
        }

        let (leg, dst) = match self.queue.get(index).and_then(|e| e.head()) {
            Some((leg, dst)) => (leg.clone(), dst.clone()),
            None => {
                let mut entry = self.queue.remove(index);
                entry.notify(Some(Error::HostUnreachable));
                return;
            }
        };

        let bytes = match self.queue.get(index) {
            Some(e) => e.packet.dump(),
            None => return,
        };

        let send_result = leg.deliver(&bytes, &dst).await;

        let has_retransmits = match self.queue.get(index) {
            Some(e) => e.retransmits.is_some(),
            None => return, // cancelled while the send was in flight
        };

        match send_result {
            Ok(()) => {
                // Success never fires the completion callback (§4.5/§9):
                // only errors and timeouts do. A single-shot entry is done;
                // one with retransmits stays queued until cancelled or
                // until the 64*T1 sentinel elapses.
                if !has_retransmits {
                    self.queue.remove(index);
                }
            }
            Err(e) => {
                if has_retransmits {
                    if let Some(entry) = self.queue.get_mut(index) {
                        // advance past the failed candidate so the next
                        // retransmit targets the next resolved hop, per
                        // the candidate-advancing behaviour called out in
                        // the purpose overview.
                        if entry.targets.len() > 1 {
                            entry.targets.remove(0);
                        }
                        entry.notify(Some(Error::Io(e)));
                    }
                } else {
                    let mut entry = self.queue.remove(index);
                    entry.notify(Some(Error::Io(e)));
                }
            }
        }
    }

    /// Cancels every queued entry matching `id`. Idempotent (Testable
    /// Property 7); no callback fires for the cancelled entries.
    pub fn cancel_delivery(&mut self, id: &str) {
        self.queue.cancel(id);
    }

    /// Demultiplexes an inbound packet (§4.5 `receive`): requests with a
    /// cached response are answered immediately without reaching the
    /// receiver; everything else is handed to the registered receiver, or
    /// dropped silently if none is set.
    #[tracing::instrument(skip(self, packet, leg, now, from), fields(from = %from))]
    pub async fn receive(
        &mut self,
        packet: Box<dyn Packet>,
        leg: Arc<dyn Leg>,
        from: SocketAddr,
        now: Instant,
    ) {
        if packet.is_request() {
            if let Some(cached) = self.response_cache.lookup(packet.as_ref(), now) {
                let dst = Destination::new(leg.proto(), ArcStr::from(from.ip().to_string()), from.port());
                let bytes = cached.to_vec();
                if let Err(e) = leg.deliver(&bytes, &dst).await {
                    log::warn!("failed to replay cached response to {from}: {e}");
                }
                tracing::debug!("answered retransmitted request from the response cache");
                return;
            }
        }

        if let Some(receiver) = self.receiver.as_mut() {
            receiver.receive(packet, leg, from);
        } else {
            log::trace!("dropping packet with no receiver set");
        }
    }

    /// Periodic (nominally 1 Hz) sweep (§4.5 `queue_expire`): fires
    /// retransmits whose timer has come due, times out entries whose 64*T1
    /// sentinel has elapsed, and evicts stale response-cache entries.
    /// Returns the earliest pending expiry, for opportunistic rescheduling
    /// of the next wake.
    #[tracing::instrument(skip(self))]
    pub async fn queue_expire(&mut self, now: Instant) -> Option<Instant> {
        let mut min_expire: Option<Instant> = None;

        let indices: Vec<usize> = self.queue.indices_desc().collect();
        for index in indices {
            let outcome = {
                let entry = match self.queue.get_mut(index) {
                    Some(e) => e,
                    None => continue,
                };
                let schedule = match entry.retransmits.as_mut() {
                    Some(s) => s,
                    None => continue,
                };
                let elapsed = if now >= entry.created_at {
                    now - entry.created_at
                } else {
                    std::time::Duration::ZERO
                };
                let popped = schedule.pop_due(elapsed);
                ExpireOutcome {
                    due: !popped.is_empty(),
                    timed_out: schedule.is_empty(),
                    created_at: entry.created_at,
                }
            };

            if outcome.timed_out {
                let mut entry = self.queue.remove(index);
                entry.notify(Some(Error::TimedOut));
                continue;
            }

            if outcome.due {
                self.__deliver(index, now).await;
            }

            if let Some(entry) = self.queue.get(index) {
                if let Some(head) = entry.retransmits.as_ref().and_then(|s| s.head()) {
                    let at = outcome.created_at + head;
                    min_expire = Some(min_expire.map_or(at, |m| m.min(at)));
                }
            }
        }

        if let Some(t) = self.response_cache.sweep(now) {
            min_expire = Some(min_expire.map_or(t, |m| m.min(t)));
        }

        min_expire
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

struct ExpireOutcome {
    due: bool,
    timed_out: bool,
    created_at: Instant,
}
