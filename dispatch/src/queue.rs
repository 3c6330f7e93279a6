//! The delivery queue: one [`QueueEntry`] per in-flight send, its
//! candidate list, retransmit schedule and completion callback (§3, §4.5).

use std::sync::Arc;

use tokio::time::Instant;
use util::ArcStr;

use crate::error::Error;
use crate::leg::{Destination, Leg};
use crate::message::{Packet, TransportProtocol};
use crate::timing::Schedule;

/// Completion callback invoked exactly once per terminal transition of a
/// [`QueueEntry`] (§4.5's state diagram): `Ok(())` on a definite send
/// success with no retransmits left pending, `Err(e)` otherwise.
///
/// Modelled as a single boxed closure (§9: "no runtime reflection is
/// needed" for the dynamic callback-target question) rather than a tagged
/// enum of callback kinds.
pub type Callback = Box<dyn FnMut(Option<&Error>, &QueueEntry) + Send>;

/// One in-flight delivery (§3 `QueueEntry`).
pub struct QueueEntry {
    /// Cancellation key; defaults to the packet's `tid`.
    pub id: ArcStr,
    /// Owning reference to the packet being (re)sent.
    pub packet: Box<dyn Packet>,
    /// Ordered `(leg, dst)` pairs; head is the current target. Empty until
    /// resolved.
    pub targets: Vec<(Arc<dyn Leg>, Destination)>,
    /// Retransmit schedule; `None` means single-shot (no retransmit).
    pub retransmits: Option<Schedule>,
    /// Protocols the resolver may choose among, if resolution is still
    /// pending when this entry is constructed.
    pub allowed_proto: Vec<TransportProtocol>,
    /// Clock origin the schedule's offsets are measured from.
    pub created_at: Instant,
    callback: Option<Callback>,
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("id", &self.id)
            .field("targets", &self.targets)
            .field("retransmits", &self.retransmits)
            .finish()
    }
}

impl QueueEntry {
    pub fn new(
        id: ArcStr,
        packet: Box<dyn Packet>,
        retransmits: Option<Schedule>,
        created_at: Instant,
    ) -> Self {
        Self {
            id,
            packet,
            targets: Vec::new(),
            retransmits,
            allowed_proto: Vec::new(),
            created_at,
            callback: None,
        }
    }

    pub fn with_callback(mut self, cb: Callback) -> Self {
        self.callback = Some(cb);
        self
    }

    /// Whether the resolver has not yet supplied a `(leg, dst)` pair.
    pub fn is_unresolved(&self) -> bool {
        self.targets.is_empty()
    }

    /// Current head target, if resolved.
    pub fn head(&self) -> Option<&(Arc<dyn Leg>, Destination)> {
        self.targets.first()
    }

    /// Notifies the completion callback, if one was registered, without
    /// consuming it — an error with retransmits still pending can notify
    /// more than once before the entry finally terminates. Terminal
    /// notifications are simply the last one the caller issues before
    /// removing the entry from the queue.
    pub fn notify(&mut self, error: Option<Error>) {
        if let Some(mut cb) = self.callback.take() {
            cb(error.as_ref(), self);
            self.callback = Some(cb);
        }
    }
}

/// The full set of in-flight entries, exclusively owned and mutated by the
/// dispatcher on its single loop thread (§5).
#[derive(Default)]
pub struct DeliveryQueue {
    entries: Vec<QueueEntry>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: QueueEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&QueueEntry> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut QueueEntry> {
        self.entries.get_mut(index)
    }

    /// Removes the entry at `index` without firing its callback (caller's
    /// responsibility to have already done so, if appropriate).
    pub fn remove(&mut self, index: usize) -> QueueEntry {
        self.entries.remove(index)
    }

    /// Removes and fires `ETIMEDOUT`/none-error callbacks for every entry
    /// matching `id` (§4.5 `cancel_delivery`). Idempotent: a second call
    /// with the same id matches nothing and is a no-op (Testable Property
    /// 7). No callback fires for cancellation itself — cancellation is a
    /// silent drop, matching §5's "guaranteed no further callbacks".
    pub fn cancel(&mut self, id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.id.as_ref() != id);
        before - self.entries.len()
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> {
        0..self.entries.len()
    }

    /// Indices in descending order, safe to process with removals: a
    /// removal at index *i* never invalidates an index below *i*.
    pub fn indices_desc(&self) -> impl Iterator<Item = usize> {
        (0..self.entries.len()).rev()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{SipMethod, StatusCode};

    #[derive(Debug)]
    struct NopPacket;

    impl Packet for NopPacket {
        fn is_request(&self) -> bool {
            true
        }
        fn method(&self) -> SipMethod {
            SipMethod::Bye
        }
        fn code(&self) -> Option<StatusCode> {
            None
        }
        fn cseq(&self) -> u32 {
            1
        }
        fn cseq_method(&self) -> SipMethod {
            SipMethod::Bye
        }
        fn call_id(&self) -> ArcStr {
            ArcStr::from("c")
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

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let mut queue = DeliveryQueue::new();
        queue.push(QueueEntry::new(
            ArcStr::from("t1"),
            Box::new(NopPacket),
            None,
            Instant::now(),
        ));
        assert_eq!(queue.cancel("t1"), 1);
        assert_eq!(queue.cancel("t1"), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn notify_can_fire_more_than_once() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        let mut entry = QueueEntry::new(ArcStr::from("t1"), Box::new(NopPacket), None, Instant::now())
            .with_callback(Box::new(move |_err, _entry| {
                count2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }));
        entry.notify(None);
        entry.notify(Some(Error::TimedOut));
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
