//! NAT helper interface (§1, §6): external collaborator that rewrites SDP
//! bodies for the stateless-proxy forwarder's `do_nat` hook. Only the
//! interface the core calls is specified here.

use crate::error::Result;
use crate::message::Packet;

/// SDP-rewriting hook run after Contact rewriting and after
/// `leg.forward_outgoing`, as the last step before the packet is handed to
/// `deliver` (§4.6 "Finalise").
pub trait NatHelper: Send + Sync {
    /// Rewrites `packet`'s SDP body (if any) in place, given the leg it is
    /// about to be forwarded through.
    fn rewrite(&self, packet: &mut dyn Packet, outgoing_leg: &dyn crate::leg::Leg) -> Result<()>;
}

/// A no-op NAT helper, used when no NAT traversal is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNat;

impl NatHelper for NoNat {
    fn rewrite(&self, _packet: &mut dyn Packet, _outgoing_leg: &dyn crate::leg::Leg) -> Result<()> {
        Ok(())
    }
}
