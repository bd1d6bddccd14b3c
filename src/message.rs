//! Control message abstraction.
//!
//! The transport is agnostic to the concrete AVP wire codec: it moves
//! opaque control messages that expose their transport sequence numbers
//! and type. The [`ControlMessage`] trait captures that contract,
//! including synthesis of the explicit acknowledgements (ZLB for
//! L2TPv2, Ack-typed messages for L2TPv3) and HELLO keepalives the
//! transport originates itself.

use thiserror::Error;

use crate::config::{ControlConnId, ProtocolVersion};

/// L2TP control message types (RFC 2661 §6 / RFC 3931 §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Start-Control-Connection-Request.
    Sccrq,
    /// Start-Control-Connection-Reply.
    Sccrp,
    /// Start-Control-Connection-Connected.
    Scccn,
    /// Stop-Control-Connection-Notification.
    StopCcn,
    /// Hello keepalive.
    Hello,
    /// Outgoing-Call-Request.
    Ocrq,
    /// Outgoing-Call-Reply.
    Ocrp,
    /// Outgoing-Call-Connected.
    Ocrn,
    /// Incoming-Call-Request.
    Icrq,
    /// Incoming-Call-Reply.
    Icrp,
    /// Incoming-Call-Connected.
    Iccn,
    /// Call-Disconnect-Notify.
    Cdn,
    /// WAN-Error-Notify.
    Wen,
    /// Set-Link-Info.
    Sli,
    /// Explicit acknowledgement (L2TPv3); a v2 ZLB reports this type
    /// too so the transport treats both ack forms uniformly.
    Ack,
}

impl MessageType {
    /// Map a wire message type value to the enum.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(MessageType::Sccrq),
            2 => Some(MessageType::Sccrp),
            3 => Some(MessageType::Scccn),
            4 => Some(MessageType::StopCcn),
            6 => Some(MessageType::Hello),
            7 => Some(MessageType::Ocrq),
            8 => Some(MessageType::Ocrp),
            9 => Some(MessageType::Ocrn),
            10 => Some(MessageType::Icrq),
            11 => Some(MessageType::Icrp),
            12 => Some(MessageType::Iccn),
            14 => Some(MessageType::Cdn),
            15 => Some(MessageType::Wen),
            16 => Some(MessageType::Sli),
            20 => Some(MessageType::Ack),
            _ => None,
        }
    }

    /// The wire message type value.
    pub fn as_u16(self) -> u16 {
        match self {
            MessageType::Sccrq => 1,
            MessageType::Sccrp => 2,
            MessageType::Scccn => 3,
            MessageType::StopCcn => 4,
            MessageType::Hello => 6,
            MessageType::Ocrq => 7,
            MessageType::Ocrp => 8,
            MessageType::Ocrn => 9,
            MessageType::Icrq => 10,
            MessageType::Icrp => 11,
            MessageType::Iccn => 12,
            MessageType::Cdn => 14,
            MessageType::Wen => 15,
            MessageType::Sli => 16,
            MessageType::Ack => 20,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Sccrq => "SCCRQ",
            MessageType::Sccrp => "SCCRP",
            MessageType::Scccn => "SCCCN",
            MessageType::StopCcn => "StopCCN",
            MessageType::Hello => "HELLO",
            MessageType::Ocrq => "OCRQ",
            MessageType::Ocrp => "OCRP",
            MessageType::Ocrn => "OCRN",
            MessageType::Icrq => "ICRQ",
            MessageType::Icrp => "ICRP",
            MessageType::Iccn => "ICCN",
            MessageType::Cdn => "CDN",
            MessageType::Wen => "WEN",
            MessageType::Sli => "SLI",
            MessageType::Ack => "ACK",
        };
        write!(f, "{name}")
    }
}

/// Errors raised by message encoding, decoding, and synthesis.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// The buffer ended before the message did.
    #[error("short buffer: need {need} bytes, have {have}")]
    ShortBuffer {
        /// Bytes required to continue.
        need: usize,
        /// Bytes remaining in the buffer.
        have: usize,
    },

    /// The message failed structural validation.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The wire message type value is not part of the control namespace.
    #[error("unsupported message type {0}")]
    UnsupportedType(u16),
}

/// Contract between the transport and a concrete control message codec.
///
/// Implementations own the wire format; the transport only reads and
/// stamps the transport header fields and asks the codec to synthesize
/// the messages it originates itself.
pub trait ControlMessage: Send + Sized + 'static {
    /// The message's send sequence number.
    fn ns(&self) -> u16;

    /// The message's next-expected receive sequence number.
    fn nr(&self) -> u16;

    /// Stamp the transport sequence numbers into the header.
    fn set_transport_seq_num(&mut self, ns: u16, nr: u16);

    /// The control message type.
    fn message_type(&self) -> MessageType;

    /// Serialize the message for transmission.
    fn to_bytes(&self) -> Result<Vec<u8>, MessageError>;

    /// Parse a received datagram into control messages.
    ///
    /// A single datagram may carry more than one message; a parse
    /// failure anywhere discards the whole buffer.
    fn parse_buffer(buf: &[u8]) -> Result<Vec<Self>, MessageError>;

    /// Synthesize an explicit acknowledgement addressed to the peer:
    /// a ZLB for [`ProtocolVersion::V2`], an Ack-typed message
    /// otherwise. Sequence numbers are stamped by the transport before
    /// transmission.
    fn new_ack(
        version: ProtocolVersion,
        peer_control_conn_id: ControlConnId,
    ) -> Result<Self, MessageError>;

    /// Synthesize a HELLO keepalive, or `None` if the codec does not
    /// provide one. Transports with a hello timeout configured send the
    /// result through the normal reliable path.
    fn new_hello(
        version: ProtocolVersion,
        peer_control_conn_id: ControlConnId,
    ) -> Option<Self> {
        let _ = (version, peer_control_conn_id);
        None
    }
}
