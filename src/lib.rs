//! # l2tp-transport
//!
//! Reliable control-message transport for L2TP (RFC 2661 / RFC 3931).
//!
//! L2TP control connections run over an unreliable datagram substrate
//! (UDP or L2TP-over-IP) but require in-order, at-least-once delivery of
//! control messages. This crate implements the reliable delivery
//! algorithm both RFCs specify: piggybacked Ns/Nr sequence numbers, a
//! sliding transmit window governed by slow-start/congestion-avoidance,
//! exponentially backed-off retransmission, and delayed explicit
//! acknowledgements (ZLB messages for v2, Ack-typed messages for v3).
//!
//! # Architecture
//!
//! The transport sits between a datagram socket and the L2TP control
//! protocol state machine:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Control protocol state machine        │
//! │   (SCCRQ/SCCRP/…, ICRQ/ICRP/…)          │
//! ├─────────────────────────────────────────┤
//! │   Reliable transport                    │  ← this crate
//! │   Ns/Nr, tx window, retransmit, acks    │
//! ├─────────────────────────────────────────┤
//! │   Control plane socket (UDP / IP)       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! All mutable transport state lives in a single reactor task; user
//! calls and the socket reader communicate with it over channels. One
//! transport instance serves one peer.
//!
//! # Key Types
//!
//! - [`Transport`]: the transport handle ([`send`], [`recv`],
//!   [`reconfigure`], [`close`])
//! - [`ControlMessage`]: the contract a concrete message codec
//!   implements
//! - [`ControlPlane`]: the datagram socket handle the transport owns
//! - [`TransportConfig`]: window size, retry budget, and timer settings
//! - [`SlowStartState`]: the sequence counters and transmit window
//!
//! [`send`]: Transport::send
//! [`recv`]: Transport::recv
//! [`reconfigure`]: Transport::reconfigure
//! [`close`]: Transport::close
//!
//! # Example
//!
//! ```ignore
//! use l2tp_transport::{ControlPlane, Transport, TransportConfig};
//!
//! let cp = ControlPlane::connect(local_addr, peer_addr).await?;
//! let transport = Transport::<MyMessage>::new(cp, TransportConfig::default());
//!
//! transport.send(sccrq).await?;          // resolves on peer ack
//! let reply = transport.recv().await?;   // next in-sequence message
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod message;
mod seq;
mod socket;
mod timer;
mod transport;
mod window;

pub use config::{ControlConnId, ProtocolVersion, TransportConfig};
pub use error::TransportError;
pub use message::{ControlMessage, MessageError, MessageType};
pub use seq::{seq_compare, seq_increment};
pub use socket::{ControlPlane, DEFAULT_RECV_BUFFER_SIZE};
pub use transport::Transport;
pub use window::SlowStartState;
