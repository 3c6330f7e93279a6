//! SIP dispatch core (§1): leg registry, retransmit-aware delivery queue,
//! hop-selection URI resolver, stateless response cache, and an optional
//! stateless-proxy forwarding layer on top. Packet parsing/serialisation,
//! transport I/O and the event-loop primitive are external collaborators;
//! this crate specifies the slice of each it actually consumes.

pub mod dispatcher;
pub mod error;
pub mod eventloop;
pub mod leg;
pub mod message;
pub mod nat;
pub mod proxy;
pub mod queue;
pub mod registrar;
pub mod resolver;
pub mod response_cache;
pub mod timing;

pub use dispatcher::{DeliverOpts, Dispatcher, DispatcherBuilder, Receiver};
pub use error::{Error, Result};
pub use eventloop::{EventLoop, Timer, TokioEventLoop};
pub use leg::{Destination, Leg, LegCriteria, LegRegistry};
pub use message::{Packet, SipMethod, SipUri, StatusCode, TransportProtocol, UriScheme};
pub use nat::{NatHelper, NoNat};
pub use proxy::{ContactRewriter, ProxyForwarder, XorCipherRewriter};
pub use queue::{Callback, DeliveryQueue, QueueEntry};
pub use registrar::{Registrar, RegistrarOutcome};
pub use resolver::{resolve_uri, DomainMap, HopCandidate, HopDns, PortDefaults, ResolverConfig, ResolvedHops, SystemDns};
pub use response_cache::ResponseCache;
pub use timing::{schedule_for, Schedule, T1, T2, TIMER_F};
