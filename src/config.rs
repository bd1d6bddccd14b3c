//! Transport configuration.
//!
//! Tunable parameters governing the reliable transport algorithm. Out of
//! range values are restored to sane defaults rather than rejected, so a
//! transport can always be constructed from user-supplied settings.

use std::time::Duration;

/// L2TP protocol version spoken on the control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// L2TPv2 (RFC 2661).
    V2,
    /// L2TPv3 (RFC 3931).
    V3,
    /// L2TPv3 falling back to v2-compatible UDP encapsulation.
    V3Fallback,
}

/// Control connection identifier.
///
/// L2TPv2 tunnel IDs occupy the low 16 bits; L2TPv3 control connection
/// IDs use the full 32-bit space.
pub type ControlConnId = u32;

/// Tunable parameters for the reliable transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Duration to wait after the last message receipt before sending a
    /// HELLO keepalive. Zero disables HELLO transmission.
    pub hello_timeout: Duration,
    /// Maximum number of messages sent to the peer without having
    /// received an acknowledgement.
    pub tx_window_size: u16,
    /// Maximum number of retransmits of an unacknowledged message.
    pub max_retries: u32,
    /// Duration to wait before the first retransmit. Subsequent
    /// retransmits back off exponentially as per RFC 3931. Zero is
    /// restored to the default of one second.
    pub retry_timeout: Duration,
    /// Duration to wait before explicitly acking a received message.
    /// Most messages are implicitly acked by control protocol responses.
    /// Zero is restored to the default of 100 ms.
    pub ack_timeout: Duration,
    /// Protocol version, which selects the explicit ack form (ZLB for
    /// v2, an Ack-typed message for v3).
    pub version: ProtocolVersion,
    /// The peer's control connection ID, stamped into synthesized ack
    /// and HELLO messages.
    pub peer_control_conn_id: ControlConnId,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::ZERO,
            tx_window_size: 4,
            max_retries: 3,
            retry_timeout: Duration::from_secs(1),
            ack_timeout: Duration::from_millis(100),
            version: ProtocolVersion::V2,
            peer_control_conn_id: 0,
        }
    }
}

impl TransportConfig {
    /// Restore out-of-range values to their defaults.
    ///
    /// A zero window, retry timeout, or ack timeout cannot drive the
    /// algorithm; a zero hello timeout is valid and disables HELLO.
    pub(crate) fn sanitise(&mut self) {
        let defaults = Self::default();
        if self.tx_window_size == 0 {
            self.tx_window_size = defaults.tx_window_size;
        }
        if self.retry_timeout.is_zero() {
            self.retry_timeout = defaults.retry_timeout;
        }
        if self.ack_timeout.is_zero() {
            self.ack_timeout = defaults.ack_timeout;
        }
    }
}
