use crate::protocol::{OutLine, MAX_OUT_LINE};
use core::fmt::Write;
use heapless::Deque;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use tracing::{debug, trace};

/// Number of sent lines retained for `REPLAY` / `GET,evt`.
pub const REPLAY_N: usize = 64;
/// Smallest burst the token bucket will hold, so a zero or tiny rate still
/// lets a short burst out at startup.
pub const MIN_BURST_BYTES: u32 = 256;

// ",eid=4294967295" plus the newline
const EID_SUFFIX_MAX: usize = 16;

const_assert!(REPLAY_N.is_power_of_two());
const_assert!(MAX_OUT_LINE > EID_SUFFIX_MAX + 64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    /// Safety state and command replies: never rate limited, never paused.
    P0,
    P1,
    P2,
}

/// Continuous-refill byte budget for P1/P2 traffic.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f32,
    capacity: f32,
    rate_bytes_per_s: f32,
    last_refill_ms: u64,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_s: u32, now_ms: u64) -> Self {
        let capacity = Self::capacity_for(rate_bytes_per_s);
        Self {
            tokens: capacity,
            capacity,
            rate_bytes_per_s: rate_bytes_per_s as f32,
            last_refill_ms: now_ms,
        }
    }

    fn capacity_for(rate_bytes_per_s: u32) -> f32 {
        rate_bytes_per_s.max(MIN_BURST_BYTES) as f32
    }

    pub fn set_rate(&mut self, rate_bytes_per_s: u32, now_ms: u64) {
        self.refill(now_ms);
        self.rate_bytes_per_s = rate_bytes_per_s as f32;
        self.capacity = Self::capacity_for(rate_bytes_per_s);
        self.tokens = self.tokens.min(self.capacity);
    }

    pub fn refill(&mut self, now_ms: u64) {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        self.last_refill_ms = self.last_refill_ms.max(now_ms);
        let gained = elapsed_ms as f32 * self.rate_bytes_per_s / 1000.0;
        self.tokens = (self.tokens + gained).min(self.capacity);
    }

    /// Take `cost` bytes if available. Leaves the bucket untouched otherwise.
    pub fn try_take(&mut self, cost: usize) -> bool {
        let cost = cost as f32;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f32 {
        self.tokens
    }

    pub fn capacity(&self) -> f32 {
        self.capacity
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayEntry {
    pub eid: u32,
    pub line: OutLine,
}

/// Fixed-capacity ring of the most recent sent lines, oldest evicted first.
/// Entries are always in ascending eid order.
#[derive(Debug, Default)]
pub struct ReplayRing {
    entries: Deque<ReplayEntry, REPLAY_N>,
}

impl ReplayRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ReplayEntry) {
        debug_assert!(
            self.entries.back().is_none_or(|last| last.eid < entry.eid),
            "replay ring must stay in ascending eid order"
        );
        if self.entries.is_full() {
            self.entries.pop_front();
        }
        let _ = self.entries.push_back(entry);
    }

    pub fn get(&self, eid: u32) -> Option<&ReplayEntry> {
        self.entries.iter().find(|entry| entry.eid == eid)
    }

    pub fn since(&self, since_eid: u32) -> impl Iterator<Item = &ReplayEntry> {
        self.entries.iter().filter(move |entry| entry.eid > since_eid)
    }

    pub fn oldest_eid(&self) -> Option<u32> {
        self.entries.front().map(|entry| entry.eid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OutboundStats {
    pub sent: u32,
    pub dropped: u32,
    pub suppressed_paused: u32,
    pub oversize: u32,
    pub replayed: u32,
}

/// Assigns event ids, applies the transmit budget and keeps the replay ring.
/// Lines accumulate in an outbox that the transport drains once per tick.
#[derive(Debug)]
pub struct OutboundScheduler {
    last_eid: u32,
    bucket: TokenBucket,
    ring: ReplayRing,
    paused: bool,
    outbox: alloc::vec::Vec<OutLine>,
    stats: OutboundStats,
}

impl OutboundScheduler {
    pub fn new(tx_bytes_per_s: u32, now_ms: u64) -> Self {
        Self {
            last_eid: 0,
            bucket: TokenBucket::new(tx_bytes_per_s, now_ms),
            ring: ReplayRing::new(),
            paused: false,
            outbox: alloc::vec::Vec::new(),
            stats: OutboundStats::default(),
        }
    }

    fn estimated_cost(&self, body: &str) -> usize {
        let next = self.last_eid.wrapping_add(1);
        let digits = next.checked_ilog10().unwrap_or(0) as usize + 1;
        body.len() + ",eid=".len() + digits + 1
    }

    /// Send one message. Returns the eid it went out with, or `None` if it
    /// was paused, dropped by the budget, or too long to frame.
    pub fn send(&mut self, priority: Priority, body: &str, now_ms: u64) -> Option<u32> {
        if priority > Priority::P0 {
            if self.paused {
                self.stats.suppressed_paused = self.stats.suppressed_paused.saturating_add(1);
                return None;
            }
            self.bucket.refill(now_ms);
            if !self.bucket.try_take(self.estimated_cost(body)) {
                self.stats.dropped = self.stats.dropped.saturating_add(1);
                trace!(body, "tx budget exhausted, dropping");
                return None;
            }
        }

        let eid = self.last_eid.wrapping_add(1);
        let mut line = OutLine::new();
        if write!(line, "{},eid={}", body, eid).is_err() {
            self.stats.oversize = self.stats.oversize.saturating_add(1);
            debug!(len = body.len(), "outbound line too long, dropping");
            return None;
        }

        self.last_eid = eid;
        self.ring.push(ReplayEntry { eid, line });
        self.outbox.push(line);
        self.stats.sent = self.stats.sent.saturating_add(1);
        Some(eid)
    }

    /// Re-send a single retained entry verbatim. `false` if it fell out of
    /// the ring (or never existed).
    pub fn replay_one(&mut self, eid: u32) -> bool {
        match self.ring.get(eid) {
            Some(entry) => {
                self.outbox.push(entry.line);
                self.stats.replayed = self.stats.replayed.saturating_add(1);
                true
            }
            None => false,
        }
    }

    /// Re-send every retained entry newer than `since_eid`, oldest first.
    pub fn replay_since(&mut self, since_eid: u32) -> usize {
        let before = self.outbox.len();
        self.outbox.extend(self.ring.since(since_eid).map(|entry| entry.line));
        let count = self.outbox.len() - before;
        self.stats.replayed = self.stats.replayed.saturating_add(count as u32);
        count
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_rate(&mut self, tx_bytes_per_s: u32, now_ms: u64) {
        self.bucket.set_rate(tx_bytes_per_s, now_ms);
    }

    pub fn take_outbound(&mut self) -> alloc::vec::Vec<OutLine> {
        core::mem::take(&mut self.outbox)
    }

    pub fn last_eid(&self) -> u32 {
        self.last_eid
    }

    pub fn ring(&self) -> &ReplayRing {
        &self.ring
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    pub fn stats(&self) -> &OutboundStats {
        &self.stats
    }
}

/// Remembers the last published value so a publisher only fires on change.
#[derive(Debug, Clone, Default)]
pub struct EdgePublisher<T> {
    last: Option<T>,
}

impl<T: PartialEq + Copy> EdgePublisher<T> {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// `true` if `value` differs from the last one seen (or none was seen).
    pub fn changed(&mut self, value: T) -> bool {
        if self.last == Some(value) {
            return false;
        }
        self.last = Some(value);
        true
    }

    pub fn last(&self) -> Option<T> {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// A received outbound line split into its parts, for clients and tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedLine {
    pub kind: alloc::string::String,
    pub fields: alloc::vec::Vec<alloc::string::String>,
    pub eid: Option<u32>,
}

impl ParsedLine {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }
        let mut parts: alloc::vec::Vec<&str> = line.split(',').collect();
        let eid = parts
            .last()
            .and_then(|last| last.strip_prefix("eid="))
            .and_then(|eid| eid.parse().ok());
        if eid.is_some() {
            parts.pop();
        }
        let kind = parts.first().copied().unwrap_or_default().into();
        let fields = parts.iter().skip(1).map(|field| (*field).into()).collect();
        Some(Self { kind, fields, eid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_refills_up_to_capacity() {
        let mut bucket = TokenBucket::new(1000, 0);
        assert!(bucket.try_take(1000));
        assert_eq!(bucket.tokens(), 0.0);

        bucket.refill(500);
        assert!((bucket.tokens() - 500.0).abs() < 1e-3);

        bucket.refill(60_000);
        assert_eq!(bucket.tokens(), bucket.capacity());
    }

    #[test]
    fn test_bucket_clock_going_backwards_is_ignored() {
        let mut bucket = TokenBucket::new(1000, 5_000);
        assert!(bucket.try_take(1000));
        bucket.refill(4_000);
        assert_eq!(bucket.tokens(), 0.0);
    }

    #[test]
    fn test_ring_evicts_oldest_first() {
        let mut ring = ReplayRing::new();
        for eid in 1..=(REPLAY_N as u32 + 3) {
            let mut line = OutLine::new();
            let _ = write!(line, "TIME,{},eid={}", eid, eid);
            ring.push(ReplayEntry { eid, line });
        }
        assert_eq!(ring.len(), REPLAY_N);
        assert_eq!(ring.oldest_eid(), Some(4));
        assert!(ring.get(3).is_none());
    }

    #[test]
    fn test_edge_publisher_fires_once_per_change() {
        let mut edge = EdgePublisher::new();
        assert!(edge.changed(1));
        assert!(!edge.changed(1));
        assert!(edge.changed(2));
        assert!(edge.changed(1));
    }

    #[test]
    fn test_parsed_line_splits_eid() {
        let parsed = ParsedLine::parse("PONG,4,eid=12\n").unwrap();
        assert_eq!(parsed.kind, "PONG");
        assert_eq!(parsed.fields, alloc::vec!["4".to_string()]);
        assert_eq!(parsed.eid, Some(12));
    }
}
