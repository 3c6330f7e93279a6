//! Registrar interface (§1, §4.6): external collaborator that may claim
//! inbound `REGISTER` requests before the stateless-proxy forwarder runs.

use crate::message::Packet;

/// Outcome of offering a `REGISTER` request to the registrar.
pub enum RegistrarOutcome {
    /// The registrar answered the request; the forwarder must stop.
    Handled,
    /// The registrar declined; the forwarder proceeds as normal.
    Declined,
}

/// Handles `REGISTER` requests ahead of the stateless-proxy forwarder
/// (§4.6 step 1). Only the interface consumed by the forwarder is
/// specified; registration storage, expiry and challenge/auth are entirely
/// the registrar's own business.
pub trait Registrar: Send + Sync {
    fn handle_register(&mut self, packet: &mut dyn Packet) -> RegistrarOutcome;
}
