//! Index bookkeeping for the two halves of a channel's message queues.
//!
//! Indices grow monotonically and are reduced modulo the queue depth only
//! when a slot offset is needed, so occupancy is always a subtraction. The
//! producer side owns `put`, the consumer side owns `get`; each side only
//! ever learns the other's index by pulling it.

use std::collections::VecDeque;

use super::{
    error::{Error, Result},
    wire::SLOT_HEADER_LEN,
};

/// Our outbound ring: slots we reserve, fill and publish for the peer.
///
/// `acked <= put <= reserved <= acked + depth` holds at all times.
pub struct Outbound<C> {
    depth: u64,
    payload_size: usize,
    reserved: u64,
    put: u64,
    acked: u64,
    /// Ready flags for `put..reserved`.
    ready: VecDeque<bool>,
    /// Acknowledgment callouts for `acked..reserved`.
    callouts: VecDeque<Option<C>>,
}

impl<C> Outbound<C> {
    pub fn new(depth: u32, payload_size: usize) -> Self {
        Self {
            depth: depth as u64,
            payload_size,
            reserved: 0,
            put: 0,
            acked: 0,
            ready: VecDeque::new(),
            callouts: VecDeque::new(),
        }
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn entry_size(&self) -> usize {
        SLOT_HEADER_LEN + self.payload_size
    }

    pub fn region_len(&self) -> usize {
        self.entry_size() * self.depth as usize
    }

    pub fn put(&self) -> u64 {
        self.put
    }

    pub fn acked(&self) -> u64 {
        self.acked
    }

    pub fn offset(&self, seq: u64) -> usize {
        (seq % self.depth) as usize * self.entry_size()
    }

    /// Claims the next free slot.
    pub fn reserve(&mut self) -> Result<u64> {
        if self.reserved - self.acked >= self.depth {
            return Err(Error::QueueFull);
        }
        let seq = self.reserved;
        self.reserved += 1;
        self.ready.push_back(false);
        self.callouts.push_back(None);
        Ok(seq)
    }

    /// Marks a reserved slot as written. Returns the new put index when it
    /// moved, which happens once every earlier slot is ready too.
    pub fn mark_ready(&mut self, seq: u64, callout: Option<C>) -> Option<u64> {
        if seq < self.put || seq >= self.reserved {
            return None;
        }
        self.ready[(seq - self.put) as usize] = true;
        self.callouts[(seq - self.acked) as usize] = callout;
        let before = self.put;
        while self.ready.front() == Some(&true) {
            self.ready.pop_front();
            self.put += 1;
        }
        (self.put != before).then_some(self.put)
    }

    /// Records the peer's get index and hands back the callouts of every
    /// slot it passed. A get beyond our put is bogus and ignored.
    pub fn acknowledge(&mut self, get: u64) -> Vec<C> {
        if get <= self.acked || get > self.put {
            return Vec::new();
        }
        let passed = (get - self.acked) as usize;
        self.acked = get;
        self.callouts.drain(..passed).flatten().collect()
    }

    /// Empties the callout list, for a channel that is going away.
    pub fn take_callouts(&mut self) -> Vec<C> {
        let callouts = self.callouts.drain(..).flatten().collect();
        self.callouts
            .extend((self.acked..self.reserved).map(|_| None));
        callouts
    }
}

/// The peer's ring as seen by us, the consumer.
///
/// `get <= next <= remote_put <= get + depth` holds at all times.
pub struct Inbound {
    depth: u64,
    payload_size: usize,
    remote_put: u64,
    next: u64,
    get: u64,
    /// Acknowledged flags for `get..next`.
    done: VecDeque<bool>,
}

impl Inbound {
    pub fn new(depth: u32, payload_size: usize) -> Self {
        Self {
            depth: depth as u64,
            payload_size,
            remote_put: 0,
            next: 0,
            get: 0,
            done: VecDeque::new(),
        }
    }

    pub fn entry_size(&self) -> usize {
        SLOT_HEADER_LEN + self.payload_size
    }

    pub fn offset(&self, seq: u64) -> usize {
        (seq % self.depth) as usize * self.entry_size()
    }

    pub fn get(&self) -> u64 {
        self.get
    }

    pub fn remote_put(&self) -> u64 {
        self.remote_put
    }

    /// Records the peer's put index. Values that would break occupancy
    /// bounds are stale or bogus and ignored.
    pub fn update_put(&mut self, put: u64) -> bool {
        if put <= self.remote_put || put - self.get > self.depth {
            return false;
        }
        self.remote_put = put;
        true
    }

    /// Messages published but not yet handed to a worker.
    pub fn undelivered(&self) -> u64 {
        self.remote_put - self.next
    }

    /// Hands out the next message in put order.
    pub fn take_next(&mut self) -> Option<u64> {
        if self.next >= self.remote_put {
            return None;
        }
        let seq = self.next;
        self.next += 1;
        self.done.push_back(false);
        Some(seq)
    }

    /// Gives a message back undelivered so the next worker retries it. Only
    /// the most recently taken message can be returned.
    pub fn untake(&mut self, seq: u64) -> bool {
        if seq + 1 != self.next || self.done.back() != Some(&false) {
            return false;
        }
        self.next -= 1;
        self.done.pop_back();
        true
    }

    /// Acknowledges a delivered message. Returns the new get index when it
    /// moved; acknowledging twice, or something never handed out, is a no-op.
    pub fn acknowledge(&mut self, seq: u64) -> Option<u64> {
        if seq < self.get || seq >= self.next {
            return None;
        }
        let idx = (seq - self.get) as usize;
        if self.done[idx] {
            return None;
        }
        self.done[idx] = true;
        let before = self.get;
        while self.done.front() == Some(&true) {
            self.done.pop_front();
            self.get += 1;
        }
        (self.get != before).then_some(self.get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_frees_up_after_acknowledgment() {
        let mut out: Outbound<()> = Outbound::new(4, 8);
        for expected in 0..4 {
            let seq = out.reserve().unwrap();
            assert_eq!(seq, expected);
            assert_eq!(out.mark_ready(seq, None), Some(expected + 1));
        }
        assert_eq!(out.reserve(), Err(Error::QueueFull));
        out.acknowledge(1);
        assert_eq!(out.reserve(), Ok(4));
        assert_eq!(out.reserve(), Err(Error::QueueFull));
    }

    #[test]
    fn put_waits_for_earlier_slots() {
        let mut out: Outbound<()> = Outbound::new(8, 8);
        let a = out.reserve().unwrap();
        let b = out.reserve().unwrap();
        let c = out.reserve().unwrap();
        assert_eq!(out.mark_ready(c, None), None);
        assert_eq!(out.mark_ready(b, None), None);
        assert_eq!(out.put(), 0);
        assert_eq!(out.mark_ready(a, None), Some(3));
    }

    #[test]
    fn callouts_fire_when_passed_and_only_once() {
        let mut out: Outbound<&'static str> = Outbound::new(4, 8);
        for name in ["a", "b", "c"] {
            let seq = out.reserve().unwrap();
            out.mark_ready(seq, Some(name));
        }
        assert_eq!(out.acknowledge(2), vec!["a", "b"]);
        assert!(out.acknowledge(2).is_empty());
        // beyond put
        assert!(out.acknowledge(9).is_empty());
        assert_eq!(out.acked(), 2);
        assert_eq!(out.take_callouts(), vec!["c"]);
        assert!(out.take_callouts().is_empty());
    }

    #[test]
    fn slots_wrap_around() {
        let out: Outbound<()> = Outbound::new(4, 16);
        assert_eq!(out.entry_size(), SLOT_HEADER_LEN + 16);
        assert_eq!(out.offset(1), out.entry_size());
        assert_eq!(out.offset(5), out.entry_size());
        assert_eq!(out.region_len(), 4 * out.entry_size());
    }

    #[test]
    fn consumer_takes_in_put_order() {
        let mut inb = Inbound::new(4, 8);
        assert!(inb.update_put(3));
        assert_eq!(inb.undelivered(), 3);
        assert_eq!(inb.take_next(), Some(0));
        assert_eq!(inb.take_next(), Some(1));
        assert_eq!(inb.take_next(), Some(2));
        assert_eq!(inb.take_next(), None);
    }

    #[test]
    fn get_advances_over_contiguous_acknowledgments() {
        let mut inb = Inbound::new(4, 8);
        inb.update_put(3);
        let (a, b, c) = (
            inb.take_next().unwrap(),
            inb.take_next().unwrap(),
            inb.take_next().unwrap(),
        );
        assert_eq!(inb.acknowledge(b), None);
        assert_eq!(inb.acknowledge(a), Some(2));
        // second acknowledgment is a no-op
        assert_eq!(inb.acknowledge(a), None);
        assert_eq!(inb.acknowledge(c), Some(3));
        assert_eq!(inb.acknowledge(c), None);
        assert_eq!(inb.get(), inb.remote_put());
    }

    #[test]
    fn undelivered_messages_cannot_be_acknowledged() {
        let mut inb = Inbound::new(4, 8);
        inb.update_put(2);
        assert_eq!(inb.acknowledge(0), None);
        assert_eq!(inb.get(), 0);
    }

    #[test]
    fn bogus_put_is_ignored() {
        let mut inb = Inbound::new(4, 8);
        assert!(!inb.update_put(5));
        assert!(inb.update_put(4));
        assert!(!inb.update_put(2));
        assert_eq!(inb.remote_put(), 4);
    }

    #[test]
    fn untake_returns_the_last_message() {
        let mut inb = Inbound::new(4, 8);
        inb.update_put(2);
        let a = inb.take_next().unwrap();
        let b = inb.take_next().unwrap();
        assert!(!inb.untake(a));
        assert!(inb.untake(b));
        assert_eq!(inb.take_next(), Some(b));
    }
}
