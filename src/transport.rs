//! Reliable transport engine.
//!
//! Implements the RFC 2661/RFC 3931 reliable delivery algorithm for
//! control messages: a single reactor task owns the transmit, ack, and
//! receive queues and multiplexes five event sources (user requests,
//! inbound frames, retry fires, the HELLO timer, and the delayed-ack
//! timer). A companion reader task blocks on the socket and forwards
//! raw frames. User-facing calls communicate with the reactor over
//! channels only; no queue is ever touched from two tasks.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::message::{ControlMessage, MessageType};
use crate::seq::{seq_compare, seq_increment};
use crate::socket::{ControlPlane, DEFAULT_RECV_BUFFER_SIZE};
use crate::timer::EventTimer;
use crate::window::SlowStartState;

type CompletionResult = Result<(), TransportError>;

/// A control message in flight, wrapped with its transport bookkeeping.
struct PendingMessage<M> {
    /// Reactor-assigned identity; retry timers refer to records by id so
    /// a fire for an already-completed record simply fails to resolve.
    id: u64,
    msg: M,
    /// Retransmissions so far, bounded by `max_retries`.
    retries: u32,
    /// Single-shot completion signal to the submitter. `None` once
    /// completed, or from the start for transport-originated records
    /// (HELLO), which complete silently.
    complete_tx: Option<oneshot::Sender<CompletionResult>>,
    /// The pending retry timer task, aborted on completion.
    retry_timer: Option<JoinHandle<()>>,
}

impl<M> PendingMessage<M> {
    fn new(msg: M, complete_tx: oneshot::Sender<CompletionResult>) -> Self {
        Self {
            id: 0,
            msg,
            retries: 0,
            complete_tx: Some(complete_tx),
            retry_timer: None,
        }
    }

    fn internal(msg: M) -> Self {
        Self {
            id: 0,
            msg,
            retries: 0,
            complete_tx: None,
            retry_timer: None,
        }
    }

    /// Deliver the completion signal, at most once, cancelling the
    /// retry timer.
    fn complete(&mut self, result: CompletionResult) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        if let Some(tx) = self.complete_tx.take() {
            let _ = tx.send(result);
        }
    }
}

/// Requests from user-facing calls to the reactor.
enum TransportRequest<M> {
    Send(PendingMessage<M>),
    Close,
}

/// A raw frame read from the control-plane socket.
struct RawFrame {
    data: Vec<u8>,
    addr: SocketAddr,
}

/// Reliable transport for L2TP control messages.
///
/// One transport serves one peer. Cloneless by design: share it behind
/// an [`Arc`] when several tasks send or receive concurrently.
///
/// Created by [`Transport::new`], which spawns the reactor and reader
/// tasks; must be constructed within a tokio runtime.
pub struct Transport<M: ControlMessage> {
    req_tx: mpsc::Sender<TransportRequest<M>>,
    recv_rx: Mutex<mpsc::Receiver<M>>,
    config: Arc<RwLock<TransportConfig>>,
}

impl<M: ControlMessage> Transport<M> {
    /// Create a reliable transport over the given control plane.
    ///
    /// The configuration is sanitised: out-of-range values are restored
    /// to defaults rather than rejected. The transport takes exclusive
    /// ownership of the socket and closes it on shutdown.
    pub fn new(cp: ControlPlane, mut cfg: TransportConfig) -> Self {
        cfg.sanitise();

        let mut slow_start = SlowStartState::default();
        slow_start.reset(cfg.tx_window_size);

        let config = Arc::new(RwLock::new(cfg));
        let cp = Arc::new(cp);

        let (req_tx, req_rx) = mpsc::channel(1);
        let (cp_tx, cp_rx) = mpsc::channel(1);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (recv_tx, recv_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(run_reader(Arc::clone(&cp), cp_tx, shutdown_rx));

        let runner = TransportRunner {
            slow_start,
            config: Arc::clone(&config),
            cp,
            hello_timer: EventTimer::new(),
            ack_timer: EventTimer::new(),
            req_rx,
            cp_rx,
            retry_rx,
            retry_tx,
            recv_tx,
            reader_shutdown: Some(shutdown_tx),
            rx_queue: Vec::new(),
            tx_queue: VecDeque::new(),
            ack_queue: Vec::new(),
            next_record_id: 0,
        };
        tokio::spawn(runner.run());

        Self {
            req_tx,
            recv_rx: Mutex::new(recv_rx),
            config,
        }
    }

    /// Send a control message reliably.
    ///
    /// Resolves once the peer has acknowledged the message, or with a
    /// terminal error once the transport has failed; failure means the
    /// parent tunnel should be torn down.
    pub async fn send(&self, msg: M) -> Result<(), TransportError> {
        let (complete_tx, complete_rx) = oneshot::channel();
        let record = PendingMessage::new(msg, complete_tx);
        self.req_tx
            .send(TransportRequest::Send(record))
            .await
            .map_err(|_| TransportError::Down)?;
        complete_rx.await.map_err(|_| TransportError::Down)?
    }

    /// Receive the next in-sequence control message from the peer.
    ///
    /// Acknowledgement messages are consumed by the transport and never
    /// surface here. Messages are delivered strictly in peer Ns order.
    pub async fn recv(&self) -> Result<M, TransportError> {
        let mut recv_rx = self.recv_rx.lock().await;
        recv_rx.recv().await.ok_or(TransportError::Down)
    }

    /// Replace the transport configuration.
    ///
    /// The new configuration is sanitised and takes effect from the
    /// next transport event.
    pub fn reconfigure(&self, mut cfg: TransportConfig) {
        cfg.sanitise();
        *self.config.write() = cfg;
    }

    /// The current (sanitised) transport configuration.
    pub fn get_config(&self) -> TransportConfig {
        self.config.read().clone()
    }

    /// Shut the transport down.
    ///
    /// Outstanding sends complete with [`TransportError::Down`], blocked
    /// receivers are released, and the socket is closed.
    pub async fn close(&self) {
        let _ = self.req_tx.send(TransportRequest::Close).await;
    }
}

/// Reader task: blocking socket reads, forwarded to the reactor.
///
/// Exits on read error (dropping its channel end, which the reactor
/// treats as an infrastructure failure) or on the shutdown signal.
async fn run_reader(
    cp: Arc<ControlPlane>,
    cp_tx: mpsc::Sender<RawFrame>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut buf = vec![0u8; DEFAULT_RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            result = cp.read_from(&mut buf) => match result {
                Ok((n, addr)) => {
                    let frame = RawFrame {
                        data: buf[..n].to_vec(),
                        addr,
                    };
                    if cp_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "control plane read failed");
                    return;
                }
            },
            _ = &mut shutdown_rx => return,
        }
    }
}

/// The reactor: sole owner of all mutable transport state.
struct TransportRunner<M: ControlMessage> {
    slow_start: SlowStartState,
    config: Arc<RwLock<TransportConfig>>,
    cp: Arc<ControlPlane>,
    hello_timer: EventTimer,
    ack_timer: EventTimer,
    req_rx: mpsc::Receiver<TransportRequest<M>>,
    cp_rx: mpsc::Receiver<RawFrame>,
    retry_rx: mpsc::UnboundedReceiver<u64>,
    retry_tx: mpsc::UnboundedSender<u64>,
    recv_tx: mpsc::Sender<M>,
    reader_shutdown: Option<oneshot::Sender<()>>,
    /// Parsed inbound messages awaiting in-order delivery.
    rx_queue: Vec<M>,
    /// Pending sends awaiting window space. FIFO.
    tx_queue: VecDeque<PendingMessage<M>>,
    /// Sent messages awaiting peer acknowledgement, ordered by Ns at
    /// send time.
    ack_queue: Vec<PendingMessage<M>>,
    next_record_id: u64,
}

impl<M: ControlMessage> TransportRunner<M> {
    /// The reactor loop: exactly one event serviced per turn. Any error
    /// that is not a per-frame failure collapses the transport.
    async fn run(mut self) {
        loop {
            tokio::select! {
                req = self.req_rx.recv() => match req {
                    Some(TransportRequest::Send(record)) => {
                        self.enqueue(record);
                        if let Err(err) = self.process_tx_queue().await {
                            self.down(err);
                            return;
                        }
                    }
                    Some(TransportRequest::Close) | None => {
                        self.down(TransportError::Down);
                        return;
                    }
                },
                frame = self.cp_rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = self.handle_frame(frame).await {
                            self.down(err);
                            return;
                        }
                    }
                    None => {
                        // The reader only exits unprompted on a socket
                        // read failure.
                        self.down(TransportError::Io(
                            "control plane read failed".to_string(),
                        ));
                        return;
                    }
                },
                Some(id) = self.retry_rx.recv() => {
                    if let Err(err) = self.handle_retry(id).await {
                        self.down(err);
                        return;
                    }
                },
                _ = self.hello_timer.fired() => {
                    if let Err(err) = self.send_hello().await {
                        self.down(err);
                        return;
                    }
                },
                _ = self.ack_timer.fired() => {
                    if let Err(err) = self.send_explicit_ack().await {
                        self.down(err);
                        return;
                    }
                },
            }
        }
    }

    fn enqueue(&mut self, mut record: PendingMessage<M>) {
        record.id = self.next_record_id;
        self.next_record_id = self.next_record_id.wrapping_add(1);
        self.tx_queue.push_back(record);
    }

    /// Parse and sequence-check an inbound frame, then feed the ack,
    /// tx, and rx queues. Parse and sequence failures drop the whole
    /// datagram without failing the transport.
    async fn handle_frame(&mut self, frame: RawFrame) -> Result<(), TransportError> {
        let messages = match self.recv_frame(&frame) {
            Ok(messages) => messages,
            Err(err) => {
                debug!(peer = %frame.addr, error = %err, "dropping control frame");
                return Ok(());
            }
        };

        for msg in messages {
            let peer_nr = msg.nr();
            self.rx_queue.push(msg);

            // Dequeueing acked sends may open the window for further
            // transmits.
            if self.process_ack_queue(peer_nr) {
                self.process_tx_queue().await?;
            }
        }

        self.process_rx_queue().await
    }

    /// Parse a raw frame into messages and validate their Nr values:
    /// the peer must not acknowledge beyond what we have actually sent.
    /// A violation anywhere discards the whole batch.
    fn recv_frame(&self, frame: &RawFrame) -> Result<Vec<M>, TransportError> {
        let messages = M::parse_buffer(&frame.data)?;
        for msg in &messages {
            if seq_compare(msg.nr(), seq_increment(self.slow_start.ns())) == Ordering::Greater {
                return Err(TransportError::SequenceCheck {
                    nr: msg.nr(),
                    ns: self.slow_start.ns(),
                });
            }
        }
        Ok(messages)
    }

    /// A retry fire for a record that still sits in the ack queue.
    /// Records complete out from under their timers; an id that no
    /// longer resolves is ignored.
    async fn handle_retry(&mut self, id: u64) -> Result<(), TransportError> {
        let Some(idx) = self.ack_queue.iter().position(|record| record.id == id) else {
            return Ok(());
        };
        let mut record = self.ack_queue.remove(idx);
        match self.retransmit(&mut record).await {
            Ok(()) => {
                // Still awaiting acknowledgement: back into the queue at
                // its old position to preserve Ns ordering.
                self.ack_queue.insert(idx, record);
                Ok(())
            }
            Err(err) => {
                record.complete(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Retransmit a record, collapsing the congestion window, or give
    /// up once the retry budget is exhausted.
    async fn retransmit(&mut self, record: &mut PendingMessage<M>) -> Result<(), TransportError> {
        record.retries += 1;
        let max_retries = self.config.read().max_retries;
        if record.retries >= max_retries {
            return Err(TransportError::TransmitFailed(
                record.msg.message_type(),
                max_retries,
            ));
        }
        debug!(retries = record.retries, "retransmitting control message");
        self.send_record(record).await?;
        self.slow_start.on_retransmit();
        Ok(())
    }

    /// Drain the tx queue head while the window is open. A send failure
    /// completes the failing record and collapses the transport.
    async fn process_tx_queue(&mut self) -> Result<(), TransportError> {
        loop {
            if !self.slow_start.can_send() {
                // Window closed: the remainder stays queued. Not an
                // error condition.
                return Ok(());
            }
            let Some(mut record) = self.tx_queue.pop_front() else {
                return Ok(());
            };
            match self.send_record(&mut record).await {
                Ok(()) => {
                    self.ack_queue.push(record);
                    self.slow_start.on_send();
                }
                Err(err) => {
                    record.complete(Err(err.clone()));
                    return Err(err);
                }
            }
        }
    }

    /// Stamp, serialize, and transmit one record, then schedule its
    /// retry timer at `retry_timeout * 2^retries`.
    async fn send_record(&mut self, record: &mut PendingMessage<M>) -> Result<(), TransportError> {
        let is_retransmit = record.retries > 0;

        // A retransmission keeps its original ns; the nr is refreshed
        // either way so the retransmit carries current ack state.
        if is_retransmit {
            let ns = record.msg.ns();
            record.msg.set_transport_seq_num(ns, self.slow_start.nr());
        } else {
            record
                .msg
                .set_transport_seq_num(self.slow_start.ns(), self.slow_start.nr());
        }

        let bytes = record.msg.to_bytes()?;
        self.cp.write(&bytes).await?;

        // The message just carried our nr: any pending delayed ack is
        // now covered.
        self.ack_timer.stop();
        self.reset_hello_timer();
        if record.msg.message_type() != MessageType::Ack && !is_retransmit {
            self.slow_start.increment_ns();
        }

        let delay = self.scale_retry_timeout(record.retries);
        let retry_tx = self.retry_tx.clone();
        let id = record.id;
        if let Some(old) = record.retry_timer.take() {
            old.abort();
        }
        record.retry_timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            let _ = retry_tx.send(id);
        }));

        Ok(())
    }

    /// Exponential retry backoff as per RFC 2661/RFC 3931.
    fn scale_retry_timeout(&self, retries: u32) -> Duration {
        let retry_timeout = self.config.read().retry_timeout;
        retry_timeout.saturating_mul(1u32.checked_shl(retries).unwrap_or(u32::MAX))
    }

    /// Complete every queued send whose Ns the peer's nr value covers.
    /// Returns whether anything was dequeued (and the window may have
    /// opened).
    fn process_ack_queue(&mut self, peer_nr: u16) -> bool {
        let max_window = self.config.read().tx_window_size;
        let mut found = false;
        let mut i = 0;
        while i < self.ack_queue.len() {
            if seq_compare(peer_nr, self.ack_queue[i].msg.ns()) == Ordering::Greater {
                let mut record = self.ack_queue.remove(i);
                self.slow_start.on_ack(max_window);
                record.complete(Ok(()));
                found = true;
            } else {
                i += 1;
            }
        }
        found
    }

    /// Drain the rx queue of deliverable messages. Out-of-order future
    /// messages stay queued until the gap fills; we give up once a full
    /// scan finds nothing in sequence or stale.
    async fn process_rx_queue(&mut self) -> Result<(), TransportError> {
        while self.dequeue_rx_message().await? {}
        Ok(())
    }

    async fn dequeue_rx_message(&mut self) -> Result<bool, TransportError> {
        let mut i = 0;
        while i < self.rx_queue.len() {
            let ns = self.rx_queue[i].ns();
            if self.slow_start.msg_is_in_sequence(ns) || self.slow_start.msg_is_stale(ns) {
                let msg = self.rx_queue.remove(i);
                // Acks serve the transport's own bookkeeping; they are
                // consumed here, never delivered, and do not advance nr.
                if msg.message_type() != MessageType::Ack {
                    self.recv_message(msg).await?;
                }
                return Ok(true);
            }
            i += 1;
        }
        Ok(false)
    }

    /// Deliver an in-sequence message upstream, or ack a stale one.
    ///
    /// The upstream write suspends cooperatively when the receiver is
    /// slow; backpressure reaches the peer via the undrained rx queue
    /// and, eventually, its closed window.
    async fn recv_message(&mut self, msg: M) -> Result<(), TransportError> {
        if self.slow_start.msg_is_in_sequence(msg.ns()) {
            self.reset_ack_timer();
            self.reset_hello_timer();
            self.slow_start.increment_nr();
            if self.recv_tx.send(msg).await.is_err() {
                // Receiver handle dropped: nobody is listening any more.
                return Err(TransportError::Down);
            }
        } else if self.slow_start.msg_is_stale(msg.ns()) {
            debug!(ns = msg.ns(), "stale control message, acking");
            self.send_explicit_ack().await?;
        }
        Ok(())
    }

    /// Transmit an explicit acknowledgement: a ZLB for L2TPv2, an
    /// Ack-typed message for L2TPv3. No record, no retry, and no Ns
    /// consumption.
    async fn send_explicit_ack(&mut self) -> Result<(), TransportError> {
        let (version, peer_id) = {
            let cfg = self.config.read();
            (cfg.version, cfg.peer_control_conn_id)
        };
        let mut msg = M::new_ack(version, peer_id)?;
        msg.set_transport_seq_num(self.slow_start.ns(), self.slow_start.nr());
        let bytes = msg.to_bytes()?;
        self.cp.write(&bytes).await?;
        self.ack_timer.stop();
        self.reset_hello_timer();
        Ok(())
    }

    /// HELLO timer fire: submit a keepalive through the normal reliable
    /// path, so it consumes an Ns and is retried like any other control
    /// message. A codec without HELLO support makes this a no-op.
    async fn send_hello(&mut self) -> Result<(), TransportError> {
        let (version, peer_id) = {
            let cfg = self.config.read();
            (cfg.version, cfg.peer_control_conn_id)
        };
        let Some(hello) = M::new_hello(version, peer_id) else {
            return Ok(());
        };
        debug!("sending HELLO keepalive");
        let record = PendingMessage::internal(hello);
        self.enqueue(record);
        self.process_tx_queue().await
    }

    fn reset_ack_timer(&mut self) {
        let ack_timeout = self.config.read().ack_timeout;
        self.ack_timer.reset(ack_timeout);
    }

    fn reset_hello_timer(&mut self) {
        let hello_timeout = self.config.read().hello_timeout;
        if !hello_timeout.is_zero() {
            self.hello_timer.reset(hello_timeout);
        }
    }

    /// Terminal collapse: every outstanding record completes with `err`,
    /// pending inbound is discarded, timers stop, and the reader is told
    /// to exit. The caller returns from the loop afterwards, which
    /// closes the upstream channel and releases the socket.
    fn down(&mut self, err: TransportError) {
        warn!(error = %err, "transport down");

        self.rx_queue.clear();

        for mut record in self.tx_queue.drain(..) {
            record.complete(Err(err.clone()));
        }
        for mut record in self.ack_queue.drain(..) {
            record.complete(Err(err.clone()));
        }

        self.hello_timer.stop();
        self.ack_timer.stop();

        if let Some(shutdown) = self.reader_shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControlConnId, ProtocolVersion};
    use crate::message::MessageError;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    /// Test codec: length-prefixed frames so one datagram can carry
    /// several messages.
    ///
    /// Layout per message, all fields big-endian:
    /// `len(2) | type(2) | ns(2) | nr(2) | conn_id(4) | payload(len-12)`.
    #[derive(Debug, Clone, PartialEq)]
    struct TestMessage {
        mtype: MessageType,
        ns: u16,
        nr: u16,
        conn_id: u32,
        payload: Vec<u8>,
    }

    const TEST_HEADER_LEN: usize = 12;

    impl TestMessage {
        fn data(mtype: MessageType, payload: &[u8]) -> Self {
            Self {
                mtype,
                ns: 0,
                nr: 0,
                conn_id: 0,
                payload: payload.to_vec(),
            }
        }

        fn with_seq(mtype: MessageType, ns: u16, nr: u16, payload: &[u8]) -> Self {
            Self {
                mtype,
                ns,
                nr,
                conn_id: 0,
                payload: payload.to_vec(),
            }
        }
    }

    impl ControlMessage for TestMessage {
        fn ns(&self) -> u16 {
            self.ns
        }

        fn nr(&self) -> u16 {
            self.nr
        }

        fn set_transport_seq_num(&mut self, ns: u16, nr: u16) {
            self.ns = ns;
            self.nr = nr;
        }

        fn message_type(&self) -> MessageType {
            self.mtype
        }

        fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
            let len = TEST_HEADER_LEN + self.payload.len();
            let mut bytes = Vec::with_capacity(len);
            bytes.extend_from_slice(&(len as u16).to_be_bytes());
            bytes.extend_from_slice(&self.mtype.as_u16().to_be_bytes());
            bytes.extend_from_slice(&self.ns.to_be_bytes());
            bytes.extend_from_slice(&self.nr.to_be_bytes());
            bytes.extend_from_slice(&self.conn_id.to_be_bytes());
            bytes.extend_from_slice(&self.payload);
            Ok(bytes)
        }

        fn parse_buffer(buf: &[u8]) -> Result<Vec<Self>, MessageError> {
            let mut messages = Vec::new();
            let mut rest = buf;
            while !rest.is_empty() {
                if rest.len() < TEST_HEADER_LEN {
                    return Err(MessageError::ShortBuffer {
                        need: TEST_HEADER_LEN,
                        have: rest.len(),
                    });
                }
                let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                if len < TEST_HEADER_LEN {
                    return Err(MessageError::Malformed(format!(
                        "message length {len} below header size"
                    )));
                }
                if rest.len() < len {
                    return Err(MessageError::ShortBuffer {
                        need: len,
                        have: rest.len(),
                    });
                }
                let raw_type = u16::from_be_bytes([rest[2], rest[3]]);
                let mtype = MessageType::from_u16(raw_type)
                    .ok_or(MessageError::UnsupportedType(raw_type))?;
                messages.push(TestMessage {
                    mtype,
                    ns: u16::from_be_bytes([rest[4], rest[5]]),
                    nr: u16::from_be_bytes([rest[6], rest[7]]),
                    conn_id: u32::from_be_bytes([rest[8], rest[9], rest[10], rest[11]]),
                    payload: rest[TEST_HEADER_LEN..len].to_vec(),
                });
                rest = &rest[len..];
            }
            Ok(messages)
        }

        fn new_ack(
            _version: ProtocolVersion,
            peer_control_conn_id: ControlConnId,
        ) -> Result<Self, MessageError> {
            Ok(TestMessage {
                mtype: MessageType::Ack,
                ns: 0,
                nr: 0,
                conn_id: peer_control_conn_id,
                payload: Vec::new(),
            })
        }

        fn new_hello(
            _version: ProtocolVersion,
            peer_control_conn_id: ControlConnId,
        ) -> Option<Self> {
            Some(TestMessage {
                mtype: MessageType::Hello,
                ns: 0,
                nr: 0,
                conn_id: peer_control_conn_id,
                payload: Vec::new(),
            })
        }
    }

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn transport_pair(
        cfg: TransportConfig,
    ) -> (Arc<Transport<TestMessage>>, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let cp = ControlPlane::connect("127.0.0.1:0".parse().unwrap(), peer_addr)
            .await
            .unwrap();
        peer.connect(cp.local_addr().unwrap()).await.unwrap();

        (Arc::new(Transport::new(cp, cfg)), peer)
    }

    async fn peer_recv(peer: &UdpSocket) -> Vec<TestMessage> {
        let mut buf = [0u8; DEFAULT_RECV_BUFFER_SIZE];
        let n = timeout(TEST_TIMEOUT, peer.recv(&mut buf))
            .await
            .expect("timed out waiting for a frame from the transport")
            .unwrap();
        TestMessage::parse_buffer(&buf[..n]).unwrap()
    }

    /// Read frames until one carrying a non-ack message arrives.
    async fn peer_recv_non_ack(peer: &UdpSocket) -> TestMessage {
        loop {
            for msg in peer_recv(peer).await {
                if msg.mtype != MessageType::Ack {
                    return msg;
                }
            }
        }
    }

    async fn peer_send(peer: &UdpSocket, msg: &TestMessage) {
        peer.send(&msg.to_bytes().unwrap()).await.unwrap();
    }

    fn ack(ns: u16, nr: u16) -> TestMessage {
        TestMessage::with_seq(MessageType::Ack, ns, nr, b"")
    }

    #[tokio::test]
    async fn test_open_close() {
        let (xport, _peer) = transport_pair(TransportConfig::default()).await;

        // Give the reactor and reader a chance to run so uninitialised
        // state would get tripped over.
        sleep(Duration::from_millis(1)).await;

        xport.close().await;

        let err = xport
            .send(TestMessage::data(MessageType::Icrq, b"late"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Down);

        let err = timeout(TEST_TIMEOUT, xport.recv()).await.unwrap().unwrap_err();
        assert_eq!(err, TransportError::Down);
    }

    #[tokio::test]
    async fn test_first_send_stamps_sequence_numbers() {
        let (xport, peer) = transport_pair(TransportConfig::default()).await;

        let sender = tokio::spawn({
            let xport = Arc::clone(&xport);
            async move { xport.send(TestMessage::data(MessageType::Icrq, b"payload")).await }
        });

        let msgs = peer_recv(&peer).await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].mtype, MessageType::Icrq);
        assert_eq!(msgs[0].ns, 0);
        assert_eq!(msgs[0].nr, 0);

        // Ack it so the send resolves.
        peer_send(&peer, &ack(0, 1)).await;
        timeout(TEST_TIMEOUT, sender).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_retransmit_preserves_ns_and_refreshes_nr() {
        let cfg = TransportConfig {
            retry_timeout: Duration::from_millis(50),
            ack_timeout: Duration::from_millis(10),
            max_retries: 5,
            ..Default::default()
        };
        let (xport, peer) = transport_pair(cfg).await;

        let sender = tokio::spawn({
            let xport = Arc::clone(&xport);
            async move { xport.send(TestMessage::data(MessageType::Icrq, b"first")).await }
        });

        let first = peer_recv_non_ack(&peer).await;
        assert_eq!((first.ns, first.nr), (0, 0));

        // Deliver a peer message without acking ours: the transport's nr
        // advances to 1 while our message stays unacknowledged.
        peer_send(&peer, &TestMessage::with_seq(MessageType::Icrp, 0, 0, b"reply")).await;
        let delivered = timeout(TEST_TIMEOUT, xport.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.payload, b"reply");

        // The retransmission keeps ns 0 but carries the refreshed nr.
        let retrans = peer_recv_non_ack(&peer).await;
        assert_eq!(retrans.mtype, MessageType::Icrq);
        assert_eq!((retrans.ns, retrans.nr), (0, 1));

        peer_send(&peer, &ack(0, 1)).await;
        timeout(TEST_TIMEOUT, sender).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_nr_drops_whole_batch() {
        let (xport, peer) = transport_pair(TransportConfig::default()).await;

        // nr 5 acknowledges far beyond our ns of 0: the datagram must be
        // dropped and the transport's nr left untouched.
        peer_send(
            &peer,
            &TestMessage::with_seq(MessageType::Icrq, 0, 5, b"bogus"),
        )
        .await;

        // A subsequent valid message with ns 0 is still in sequence,
        // proving the dropped frame advanced nothing.
        peer_send(&peer, &TestMessage::with_seq(MessageType::Icrq, 0, 0, b"ok")).await;

        let delivered = timeout(TEST_TIMEOUT, xport.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.payload, b"ok");
    }

    #[tokio::test]
    async fn test_in_sequence_advances_nr_and_stale_elicits_ack() {
        let cfg = TransportConfig {
            ack_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let (xport, peer) = transport_pair(cfg).await;

        peer_send(&peer, &TestMessage::with_seq(MessageType::Icrq, 0, 0, b"one")).await;
        let delivered = timeout(TEST_TIMEOUT, xport.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.payload, b"one");

        // The delayed ack confirms nr advanced to 1.
        let delayed = peer_recv(&peer).await;
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].mtype, MessageType::Ack);
        assert_eq!(delayed[0].nr, 1);

        // A duplicate of ns 0 is stale: it is not delivered again and
        // elicits an immediate explicit ack.
        peer_send(&peer, &TestMessage::with_seq(MessageType::Icrq, 0, 0, b"one")).await;
        let explicit = peer_recv(&peer).await;
        assert_eq!(explicit.len(), 1);
        assert_eq!(explicit[0].mtype, MessageType::Ack);
        assert_eq!(explicit[0].nr, 1);
    }

    #[tokio::test]
    async fn test_concurrent_sends_complete_in_submission_order() {
        let (xport, peer) = transport_pair(TransportConfig::default()).await;

        // Cooperative peer: ack every message as it arrives.
        let acker = tokio::spawn(async move {
            let mut acked = 0u32;
            while acked < 3 {
                for msg in peer_recv(&peer).await {
                    if msg.mtype == MessageType::Ack {
                        continue;
                    }
                    peer_send(&peer, &ack(0, seq_increment(msg.ns))).await;
                    acked += 1;
                }
            }
        });

        let (order_tx, mut order_rx) = mpsc::unbounded_channel();
        let mut senders = Vec::new();
        for i in 0..3u32 {
            let xport = Arc::clone(&xport);
            let order_tx = order_tx.clone();
            senders.push(tokio::spawn(async move {
                let payload = [i as u8];
                xport
                    .send(TestMessage::data(MessageType::Icrq, &payload))
                    .await
                    .unwrap();
                order_tx.send(i).unwrap();
            }));
            // Stagger submissions so the FIFO order under test is
            // well defined.
            sleep(Duration::from_millis(5)).await;
        }

        for sender in senders {
            timeout(TEST_TIMEOUT, sender).await.unwrap().unwrap();
        }
        timeout(TEST_TIMEOUT, acker).await.unwrap().unwrap();

        let mut order = Vec::new();
        while let Ok(i) = order_rx.try_recv() {
            order.push(i);
        }
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_collapses_transport() {
        let cfg = TransportConfig {
            retry_timeout: Duration::from_millis(10),
            max_retries: 2,
            ..Default::default()
        };
        // The peer never acks anything.
        let (xport, _peer) = transport_pair(cfg).await;

        let err = timeout(
            TEST_TIMEOUT,
            xport.send(TestMessage::data(MessageType::Icrq, b"doomed")),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err, TransportError::TransmitFailed(MessageType::Icrq, 2));

        // The collapse is terminal: both directions now fail.
        let err = timeout(TEST_TIMEOUT, xport.recv()).await.unwrap().unwrap_err();
        assert_eq!(err, TransportError::Down);
        let err = xport
            .send(TestMessage::data(MessageType::Icrq, b"after"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Down);
    }

    #[tokio::test]
    async fn test_hello_keepalive_after_idle() {
        let cfg = TransportConfig {
            hello_timeout: Duration::from_millis(20),
            ack_timeout: Duration::from_millis(5),
            ..Default::default()
        };
        let (xport, peer) = transport_pair(cfg).await;

        // Activity arms the hello timer.
        let sender = tokio::spawn({
            let xport = Arc::clone(&xport);
            async move { xport.send(TestMessage::data(MessageType::Icrq, b"start")).await }
        });
        let first = peer_recv_non_ack(&peer).await;
        peer_send(&peer, &ack(0, seq_increment(first.ns))).await;
        timeout(TEST_TIMEOUT, sender).await.unwrap().unwrap().unwrap();

        // After the idle interval a HELLO arrives through the normal
        // reliable path, consuming the next ns.
        let hello = peer_recv_non_ack(&peer).await;
        assert_eq!(hello.mtype, MessageType::Hello);
        assert_eq!(hello.ns, 1);
        peer_send(&peer, &ack(0, seq_increment(hello.ns))).await;
    }

    #[tokio::test]
    async fn test_config_sanitised_on_new_and_reconfigure() {
        let cfg = TransportConfig {
            tx_window_size: 0,
            ..Default::default()
        };
        let (xport, _peer) = transport_pair(cfg).await;
        assert_eq!(xport.get_config().tx_window_size, 4);

        xport.reconfigure(TransportConfig {
            retry_timeout: Duration::ZERO,
            tx_window_size: 8,
            ..Default::default()
        });
        let cfg = xport.get_config();
        assert_eq!(cfg.retry_timeout, Duration::from_secs(1));
        assert_eq!(cfg.tx_window_size, 8);
    }

    #[tokio::test]
    async fn test_out_of_order_future_message_held_until_gap_fills() {
        let (xport, peer) = transport_pair(TransportConfig::default()).await;

        // ns 1 arrives first: it is neither in sequence nor stale, so it
        // waits in the rx queue.
        peer_send(&peer, &TestMessage::with_seq(MessageType::Icrp, 1, 0, b"second")).await;
        peer_send(&peer, &TestMessage::with_seq(MessageType::Icrq, 0, 0, b"first")).await;

        let first = timeout(TEST_TIMEOUT, xport.recv()).await.unwrap().unwrap();
        assert_eq!(first.payload, b"first");
        let second = timeout(TEST_TIMEOUT, xport.recv()).await.unwrap().unwrap();
        assert_eq!(second.payload, b"second");
    }
}
