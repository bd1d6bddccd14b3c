//! Sequence number arithmetic for the reliable transport.
//!
//! L2TP control messages carry 16-bit Ns/Nr values which wrap at the
//! 16-bit boundary. Comparison treats the sequence space as a circle
//! split at 2^15: two values more than half the space apart are ordered
//! with the numerically lower one ahead, as specified by RFC 2661 and
//! RFC 3931.

use std::cmp::Ordering;

/// Increment a sequence number, wrapping at the 16-bit boundary.
pub fn seq_increment(seq: u16) -> u16 {
    seq.wrapping_add(1)
}

/// Compare two sequence numbers on the wrapping 16-bit circle.
///
/// Returns [`Ordering::Greater`] when `seq1` is ahead of `seq2`,
/// [`Ordering::Less`] when it is behind, and [`Ordering::Equal`] when
/// the two are the same value. The wrapping delta decides: deltas below
/// 0x8000 mean `seq1` is ahead.
pub fn seq_compare(seq1: u16, seq2: u16) -> Ordering {
    let delta = seq1.wrapping_sub(seq2);
    if delta == 0 {
        Ordering::Equal
    } else if delta < 0x8000 {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}
