//! Acknowledgement tracking and bounded retransmission over UDP.
//!
//! Every tracked datagram is remembered under its destination address and
//! sequence number until the matching `Ack` arrives. Entries whose deadline
//! has passed are handed back for resending until their retry budget is
//! spent, after which they are dropped without further escalation. This
//! gives at-least-once delivery; receivers are expected to tolerate
//! duplicates.

use crate::config::RETRY_BUDGET;
use log::debug;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Identity of a tracked datagram.
///
/// Equality and hashing cover the full destination `SocketAddr` (ip and
/// port) plus the sequence number, so the same sequence sent to two peers
/// is tracked twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub addr: SocketAddr,
    pub seq: u64,
}

#[derive(Debug, Clone)]
pub struct PendingAck {
    pub payload: Vec<u8>,
    pub deadline: Instant,
    pub retries_left: u32,
}

#[derive(Debug)]
pub struct Dispatcher {
    next_seq: u64,
    pending: HashMap<PendingKey, PendingAck>,
    retry_interval: Duration,
    retry_budget: u32,
    dropped: u64,
}

impl Dispatcher {
    pub fn new(retry_interval: Duration) -> Self {
        Self::with_budget(retry_interval, RETRY_BUDGET)
    }

    pub fn with_budget(retry_interval: Duration, retry_budget: u32) -> Self {
        Self {
            next_seq: 1,
            pending: HashMap::new(),
            retry_interval: retry_interval.max(Duration::from_millis(1)),
            retry_budget,
            dropped: 0,
        }
    }

    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Highest sequence handed out so far, 0 before the first.
    pub fn last_sequence(&self) -> u64 {
        self.next_seq - 1
    }

    /// Continues numbering after `seq`, so a promoted node never reuses a
    /// sequence its peers may still hold acknowledgements for.
    pub fn resume_after(&mut self, seq: u64) {
        self.next_seq = self.next_seq.max(seq + 1);
    }

    pub fn track(&mut self, addr: SocketAddr, seq: u64, payload: Vec<u8>) {
        self.track_at(addr, seq, payload, Instant::now());
    }

    pub fn track_at(&mut self, addr: SocketAddr, seq: u64, payload: Vec<u8>, now: Instant) {
        self.pending.insert(
            PendingKey { addr, seq },
            PendingAck {
                payload,
                deadline: now + self.retry_interval,
                retries_left: self.retry_budget,
            },
        );
    }

    /// Clears the entry acknowledged by `addr`. Returns false for unknown
    /// or already cleared entries.
    pub fn ack(&mut self, addr: SocketAddr, seq: u64) -> bool {
        self.pending.remove(&PendingKey { addr, seq }).is_some()
    }

    /// Drops everything still waiting on `addr`.
    pub fn forget(&mut self, addr: SocketAddr) -> usize {
        let before = self.pending.len();
        self.pending.retain(|key, _| key.addr != addr);
        before - self.pending.len()
    }

    /// Collects the datagrams due for another attempt at `now`.
    pub fn due_retries(&mut self, now: Instant) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut due = Vec::new();
        let mut exhausted = Vec::new();

        for (key, entry) in self.pending.iter_mut() {
            if now < entry.deadline {
                continue;
            }
            if entry.retries_left == 0 {
                exhausted.push(*key);
                continue;
            }
            entry.retries_left -= 1;
            entry.deadline = now + self.retry_interval;
            due.push((key.addr, entry.payload.clone()));
        }

        for key in exhausted {
            self.pending.remove(&key);
            self.dropped += 1;
            debug!("Giving up on seq {} to {}", key.seq, key.addr);
        }

        due
    }

    pub fn has_pending(&self, addr: SocketAddr, seq: u64) -> bool {
        self.pending.contains_key(&PendingKey { addr, seq })
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Entries abandoned after exhausting their retries.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_sequences_increase() {
        let mut dispatcher = Dispatcher::new(Duration::from_millis(20));
        assert_eq!(dispatcher.last_sequence(), 0);
        let a = dispatcher.next_sequence();
        let b = dispatcher.next_sequence();
        assert_eq!(a, 1);
        assert!(b > a);
        assert_eq!(dispatcher.last_sequence(), b);
    }

    #[test]
    fn test_resume_after_never_goes_back() {
        let mut dispatcher = Dispatcher::new(Duration::from_millis(20));
        dispatcher.resume_after(100);
        assert_eq!(dispatcher.next_sequence(), 101);
        dispatcher.resume_after(5);
        assert_eq!(dispatcher.next_sequence(), 102);
    }

    #[test]
    fn test_ack_clears_entry() {
        let mut dispatcher = Dispatcher::new(Duration::from_millis(20));
        dispatcher.track(addr(1), 1, vec![1]);
        assert!(dispatcher.has_pending(addr(1), 1));
        assert!(dispatcher.ack(addr(1), 1));
        assert!(!dispatcher.has_pending(addr(1), 1));
        assert!(!dispatcher.ack(addr(1), 1));
    }

    #[test]
    fn test_ack_is_keyed_by_address() {
        let mut dispatcher = Dispatcher::new(Duration::from_millis(20));
        dispatcher.track(addr(1), 7, vec![1]);
        dispatcher.track(addr(2), 7, vec![1]);

        assert!(!dispatcher.ack(addr(3), 7));
        assert!(dispatcher.ack(addr(2), 7));
        assert!(dispatcher.has_pending(addr(1), 7));
    }

    #[test]
    fn test_nothing_due_before_deadline() {
        let mut dispatcher = Dispatcher::new(Duration::from_millis(20));
        let now = Instant::now();
        dispatcher.track_at(addr(1), 1, vec![9], now);
        assert!(dispatcher.due_retries(now + Duration::from_millis(5)).is_empty());

        let due = dispatcher.due_retries(now + Duration::from_millis(20));
        assert_eq!(due, vec![(addr(1), vec![9])]);
    }

    #[test]
    fn test_retry_budget_then_drop() {
        let interval = Duration::from_millis(10);
        let mut dispatcher = Dispatcher::with_budget(interval, 3);
        let mut now = Instant::now();
        dispatcher.track_at(addr(1), 1, vec![1, 2, 3], now);

        let mut resent = 0;
        for _ in 0..10 {
            now += interval;
            resent += dispatcher.due_retries(now).len();
        }

        assert_eq!(resent, 3);
        assert_eq!(dispatcher.pending_len(), 0);
        assert_eq!(dispatcher.dropped(), 1);
    }

    #[test]
    fn test_forget_address() {
        let mut dispatcher = Dispatcher::new(Duration::from_millis(20));
        dispatcher.track(addr(1), 1, vec![]);
        dispatcher.track(addr(1), 2, vec![]);
        dispatcher.track(addr(2), 3, vec![]);

        assert_eq!(dispatcher.forget(addr(1)), 2);
        assert_eq!(dispatcher.pending_len(), 1);
        assert!(dispatcher.has_pending(addr(2), 3));
    }
}
