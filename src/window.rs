//! Transmit window control for the reliable transport.
//!
//! Implements the slow-start/congestion-avoidance algorithm specified
//! for the L2TP reliable control transport (RFC 2661 §5.8 / RFC 3931
//! §4.2), together with the Ns/Nr sequence counters the window is keyed
//! from.

use std::cmp::Ordering;

use crate::seq::{seq_compare, seq_increment};

/// Sequence counters and transmit window state.
///
/// `cwnd` is the congestion window, `thresh` the slow-start threshold,
/// `nacks` the acknowledgement count used in congestion avoidance, and
/// `ntx` the number of messages in flight. While `cwnd < thresh` the
/// window grows by one per ack (slow start); at or above it, by one per
/// `cwnd` acks (congestion avoidance).
#[derive(Debug, Default, Clone)]
pub struct SlowStartState {
    ns: u16,
    nr: u16,
    cwnd: u16,
    thresh: u16,
    nacks: u16,
    ntx: u16,
}

impl SlowStartState {
    /// Reset the window for a new transmit window size.
    pub fn reset(&mut self, tx_window: u16) {
        self.cwnd = 1;
        self.thresh = tx_window;
        self.nacks = 0;
        self.ntx = 0;
    }

    /// Whether the window permits another transmission.
    pub fn can_send(&self) -> bool {
        self.ntx < self.cwnd
    }

    /// Account for a transmission.
    ///
    /// # Panics
    ///
    /// Panics if the window is closed; callers must check [`can_send`]
    /// first.
    ///
    /// [`can_send`]: Self::can_send
    pub fn on_send(&mut self) {
        assert!(self.can_send(), "on_send() called when tx window is closed");
        self.ntx += 1;
    }

    /// Account for an acknowledgement, growing the window.
    ///
    /// Acks arriving with nothing in flight are ignored: some peers echo
    /// acks that cross with our own.
    pub fn on_ack(&mut self, max_tx_window: u16) {
        if self.ntx > 0 {
            if self.cwnd < max_tx_window {
                if self.cwnd < self.thresh {
                    // slow start
                    self.cwnd += 1;
                } else {
                    // congestion avoidance
                    self.nacks += 1;
                    if self.nacks >= self.cwnd {
                        self.nacks = 0;
                        self.cwnd += 1;
                    }
                }
            }
            self.ntx -= 1;
        }
    }

    /// Collapse the window after a retransmission.
    ///
    /// If `cwnd` was already 1 the threshold drops to 0 and the next ack
    /// enters congestion avoidance immediately, as RFC 3931 §4.2
    /// prescribes.
    pub fn on_retransmit(&mut self) {
        self.thresh = self.cwnd / 2;
        self.cwnd = 1;
    }

    /// Advance the next-expected receive sequence number.
    pub fn increment_nr(&mut self) {
        self.nr = seq_increment(self.nr);
    }

    /// Advance the next-send sequence number.
    pub fn increment_ns(&mut self) {
        self.ns = seq_increment(self.ns);
    }

    /// A message whose ns equals our nr is the next packet in sequence.
    pub fn msg_is_in_sequence(&self, msg_ns: u16) -> bool {
        seq_compare(self.nr, msg_ns) == Ordering::Equal
    }

    /// A message whose ns is behind our nr is stale or duplicated.
    pub fn msg_is_stale(&self, msg_ns: u16) -> bool {
        seq_compare(msg_ns, self.nr) == Ordering::Less
    }

    /// Next-send sequence number.
    pub fn ns(&self) -> u16 {
        self.ns
    }

    /// Next-expected receive sequence number.
    pub fn nr(&self) -> u16 {
        self.nr
    }

    /// Current congestion window.
    pub fn cwnd(&self) -> u16 {
        self.cwnd
    }

    /// Current slow-start threshold.
    pub fn thresh(&self) -> u16 {
        self.thresh
    }
}
