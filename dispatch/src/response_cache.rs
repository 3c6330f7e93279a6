//! Stateless response retransmission cache, keyed by `CSeq\0Call-ID` (§4.2).

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use util::ArcStr;

use crate::message::Packet;

/// Lifetime of a cached response: ~64*T1.
pub const CACHE_TTL: Duration = Duration::from_secs(32);

fn cache_key(cseq: u32, cseq_method: &str, call_id: &str) -> ArcStr {
    ArcStr::from(format!("{cseq} {cseq_method}\0{call_id}"))
}

struct Entry {
    packet: Vec<u8>,
    expire_at: Instant,
}

/// `(cseq,call-id) -> serialised response + expiry`.
///
/// Re-inserting a key overwrites its expiry (invariant 4): this is a plain
/// `HashMap`, not an LRU, because the upper bound on cardinality is the
/// number of in-flight transactions, already small by construction.
#[derive(Default)]
pub struct ResponseCache {
    entries: HashMap<ArcStr, Entry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a response into the cache, keyed by its own `CSeq`/`Call-ID`.
    pub fn insert(&mut self, response: &dyn Packet, now: Instant) {
        let key = cache_key(
            response.cseq(),
            &response.cseq_method().to_string(),
            &response.call_id(),
        );
        self.entries.insert(
            key,
            Entry {
                packet: response.dump(),
                expire_at: now + CACHE_TTL,
            },
        );
    }

    /// Looks up a cached response for a request's `(CSeq,Call-ID)`.
    ///
    /// Returns the serialised bytes rather than a `Packet`, mirroring that
    /// the cache stores wire bytes (re-parsing is the caller's business,
    /// normally it just hands the bytes straight back to a leg).
    pub fn lookup(&self, request: &dyn Packet, now: Instant) -> Option<&[u8]> {
        let key = cache_key(
            request.cseq(),
            &request.cseq_method().to_string(),
            &request.call_id(),
        );
        self.entries.get(&key).and_then(|e| {
            if e.expire_at > now {
                Some(e.packet.as_slice())
            } else {
                None
            }
        })
    }

    /// Evicts every entry whose expiry has passed; returns the minimum
    /// remaining expiry for the caller's wake-scheduling.
    pub fn sweep(&mut self, now: Instant) -> Option<Instant> {
        self.entries.retain(|_, e| e.expire_at > now);
        self.entries.values().map(|e| e.expire_at).min()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{SipMethod, StatusCode};

    #[derive(Debug)]
    struct FakePacket {
        is_request: bool,
        cseq: u32,
        cseq_method: SipMethod,
        call_id: ArcStr,
        body: Vec<u8>,
    }

    impl Packet for FakePacket {
        fn is_request(&self) -> bool {
            self.is_request
        }
        fn method(&self) -> SipMethod {
            self.cseq_method.clone()
        }
        fn code(&self) -> Option<StatusCode> {
            if self.is_request {
                None
            } else {
                Some(StatusCode(200))
            }
        }
        fn cseq(&self) -> u32 {
            self.cseq
        }
        fn cseq_method(&self) -> SipMethod {
            self.cseq_method.clone()
        }
        fn call_id(&self) -> ArcStr {
            self.call_id.clone()
        }
        fn uri(&self) -> Option<ArcStr> {
            None
        }
        fn tid(&self) -> ArcStr {
            ArcStr::from("t")
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
            self.body.clone()
        }
    }

    #[tokio::test]
    async fn round_trip_and_expiry() {
        let mut cache = ResponseCache::new();
        let now = Instant::now();
        let response = FakePacket {
            is_request: false,
            cseq: 1,
            cseq_method: SipMethod::Invite,
            call_id: ArcStr::from("c1"),
            body: b"SIP/2.0 200 OK".to_vec(),
        };
        cache.insert(&response, now);

        let request = FakePacket {
            is_request: true,
            cseq: 1,
            cseq_method: SipMethod::Invite,
            call_id: ArcStr::from("c1"),
            body: b"INVITE sip:a@b SIP/2.0".to_vec(),
        };
        assert_eq!(
            cache.lookup(&request, now),
            Some(b"SIP/2.0 200 OK".as_slice())
        );

        // still alive just under the ttl
        assert!(cache
            .lookup(&request, now + CACHE_TTL - Duration::from_millis(1))
            .is_some());

        // expired
        assert!(cache
            .lookup(&request, now + CACHE_TTL + Duration::from_millis(1))
            .is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_expired_entries() {
        let mut cache = ResponseCache::new();
        let now = Instant::now();
        let response = FakePacket {
            is_request: false,
            cseq: 1,
            cseq_method: SipMethod::Invite,
            call_id: ArcStr::from("c1"),
            body: vec![],
        };
        cache.insert(&response, now);
        assert_eq!(cache.len(), 1);
        cache.sweep(now + CACHE_TTL + Duration::from_secs(1));
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn reinsert_overwrites_expiry() {
        let mut cache = ResponseCache::new();
        let now = Instant::now();
        let response = FakePacket {
            is_request: false,
            cseq: 1,
            cseq_method: SipMethod::Invite,
            call_id: ArcStr::from("c1"),
            body: vec![1],
        };
        cache.insert(&response, now);
        let response2 = FakePacket {
            body: vec![2],
            ..response
        };
        cache.insert(&response2, now + Duration::from_secs(10));
        assert_eq!(cache.len(), 1);
        let request = FakePacket {
            is_request: true,
            cseq: 1,
            cseq_method: SipMethod::Invite,
            call_id: ArcStr::from("c1"),
            body: vec![],
        };
        assert_eq!(
            cache.lookup(&request, now + CACHE_TTL + Duration::from_millis(1)),
            Some([2].as_slice())
        );
    }
}
