//! RFC 3261 §17 retransmit timing.
//!
//! Derives the retransmit schedule for a packet from its kind and method.
//! The schedule is a list of absolute instants; everything but the last
//! entry is a firing instant, the last is the hard 64*T1 expiry sentinel
//! (see [`Schedule`]).

use std::time::Duration;

use crate::message::{Packet, StatusCode};

/// Initial retransmit interval estimate.
pub const T1: Duration = Duration::from_millis(500);
/// Cap on the doubling interval for everything except INVITE requests.
pub const T2: Duration = Duration::from_secs(4);
/// Hard ceiling on any one queue entry's lifetime: timer F / 64*T1.
pub const TIMER_F: Duration = Duration::from_secs(32);

/// A retransmit schedule: absolute instants (relative to the clock passed
/// to [`schedule_for`], typically `tokio::time::Instant`).
///
/// The last element is never a firing instant — it is the 64*T1 expiry
/// sentinel (invariant 2 of the data model this mirrors). A packet with no
/// retransmits at all has no `Schedule`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    /// Firing instants followed by the trailing expiry sentinel, measured
    /// in milliseconds since the entry's creation so the type stays
    /// clock-agnostic.
    instants: Vec<Duration>,
}

impl Schedule {
    /// Firing instants only, excluding the trailing sentinel.
    pub fn firings(&self) -> &[Duration] {
        &self.instants[..self.instants.len() - 1]
    }

    /// The hard expiry, 64*T1 after creation.
    pub fn expiry(&self) -> Duration {
        *self.instants.last().expect("schedule is never empty")
    }

    /// All instants including the trailing sentinel, head-first.
    pub fn as_slice(&self) -> &[Duration] {
        &self.instants
    }

    /// Removes and returns every instant strictly before `elapsed`. Used by
    /// the periodic expiry sweep; the sentinel is popped like any other
    /// entry once it elapses, which the caller treats as final timeout.
    pub fn pop_due(&mut self, elapsed: Duration) -> Vec<Duration> {
        let split = self.instants.partition_point(|t| *t < elapsed);
        self.instants.drain(..split).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.instants.is_empty()
    }

    pub fn head(&self) -> Option<Duration> {
        self.instants.first().copied()
    }
}

/// Whether/how a given retransmit cap applies to a schedule: `None` means
/// doubling is uncapped (INVITE requests only), `Some(cap)` means doubling
/// saturates at `cap`.
fn generate(t2: Option<Duration>) -> Schedule {
    let mut to = T1;
    let mut rtm = to;
    let expire = TIMER_F;
    let mut instants = Vec::new();
    while rtm < expire {
        instants.push(rtm);
        to = match t2 {
            Some(cap) => std::cmp::min(to * 2, cap),
            None => to * 2,
        };
        rtm += to;
    }
    instants.push(expire);
    Schedule { instants }
}

/// Computes the retransmit schedule for a packet per the timing rules, or
/// `None` if the packet never retransmits (`ACK` requests, provisional or
/// non-INVITE final responses).
pub fn schedule_for(packet: &dyn Packet) -> Option<Schedule> {
    if packet.is_request() {
        let method = packet.method();
        if method.is_ack() {
            return None;
        }
        if method == crate::message::SipMethod::Invite {
            return Some(generate(None));
        }
        return Some(generate(Some(T2)));
    }

    // Response: only a final response to an INVITE retransmits (waiting
    // for the ACK that stops it).
    let code = packet.code().unwrap_or(StatusCode(0));
    if code.is_final() && packet.cseq_method() == crate::message::SipMethod::Invite {
        return Some(generate(Some(T2)));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipMethod;
    use util::ArcStr;

    #[derive(Debug)]
    struct FakePacket {
        is_request: bool,
        method: SipMethod,
        code: Option<StatusCode>,
        cseq_method: SipMethod,
    }

    impl Packet for FakePacket {
        fn is_request(&self) -> bool {
            self.is_request
        }
        fn method(&self) -> SipMethod {
            self.method.clone()
        }
        fn code(&self) -> Option<StatusCode> {
            self.code
        }
        fn cseq(&self) -> u32 {
            1
        }
        fn cseq_method(&self) -> SipMethod {
            self.cseq_method.clone()
        }
        fn call_id(&self) -> ArcStr {
            ArcStr::from("c1")
        }
        fn uri(&self) -> Option<ArcStr> {
            None
        }
        fn tid(&self) -> ArcStr {
            ArcStr::from("t1")
        }
        fn top_via(&self) -> Option<ArcStr> {
            None
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
            vec![]
        }
    }

    fn secs(xs: &[f64]) -> Vec<Duration> {
        xs.iter().map(|s| Duration::from_secs_f64(*s)).collect()
    }

    #[test]
    fn invite_request_schedule_is_uncapped() {
        let pkt = FakePacket {
            is_request: true,
            method: SipMethod::Invite,
            code: None,
            cseq_method: SipMethod::Invite,
        };
        let schedule = schedule_for(&pkt).expect("invite retransmits");
        let want = secs(&[0.5, 1.5, 3.5, 7.5, 15.5, 31.5]);
        for (got, want) in schedule.firings().iter().zip(&want) {
            assert!(
                (got.as_secs_f64() - want.as_secs_f64()).abs() < 0.001,
                "{got:?} != {want:?}"
            );
        }
        assert_eq!(schedule.firings().len(), want.len());
        assert!((schedule.expiry().as_secs_f64() - 32.0).abs() < 0.001);
    }

    #[test]
    fn non_invite_request_schedule_is_capped_at_t2() {
        let pkt = FakePacket {
            is_request: true,
            method: SipMethod::Bye,
            code: None,
            cseq_method: SipMethod::Bye,
        };
        let schedule = schedule_for(&pkt).expect("bye retransmits");
        let want = secs(&[0.5, 1.5, 3.5, 7.5, 11.5, 15.5, 19.5, 23.5, 27.5, 31.5]);
        for (got, want) in schedule.firings().iter().zip(&want) {
            assert!((got.as_secs_f64() - want.as_secs_f64()).abs() < 0.001);
        }
        assert_eq!(schedule.firings().len(), want.len());
    }

    #[test]
    fn ack_never_retransmits() {
        let pkt = FakePacket {
            is_request: true,
            method: SipMethod::Ack,
            code: None,
            cseq_method: SipMethod::Invite,
        };
        assert!(schedule_for(&pkt).is_none());
    }

    #[test]
    fn provisional_response_never_retransmits() {
        let pkt = FakePacket {
            is_request: false,
            method: SipMethod::Invite,
            code: Some(StatusCode(100)),
            cseq_method: SipMethod::Invite,
        };
        assert!(schedule_for(&pkt).is_none());
    }

    #[test]
    fn final_invite_response_retransmits_capped() {
        let pkt = FakePacket {
            is_request: false,
            method: SipMethod::Invite,
            code: Some(StatusCode(200)),
            cseq_method: SipMethod::Invite,
        };
        assert!(schedule_for(&pkt).is_some());
    }

    #[test]
    fn final_non_invite_response_never_retransmits() {
        let pkt = FakePacket {
            is_request: false,
            method: SipMethod::Bye,
            code: Some(StatusCode(200)),
            cseq_method: SipMethod::Bye,
        };
        assert!(schedule_for(&pkt).is_none());
    }

    #[test]
    fn schedule_is_strictly_increasing() {
        let schedule = generate(None);
        for pair in schedule.as_slice().windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
