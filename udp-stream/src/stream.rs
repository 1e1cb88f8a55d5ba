//! The stream engine: one established connection.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │  send(bytes) / recv()           (never block)
//!      ▼
//!  Stream ── Arc<Shared> ───────────────────────────────┐
//!              ├── Mutex<SendBuffer>   (seq, offset, go-back-N)
//!              ├── Mutex<RecvBuffer>   (rcv_nxt, rwnd)
//!              ├── atomics: ack number, windows, force-send, state, exit flags
//!              └── LossySocket (one ephemeral port per stream)
//!                    ▲                         │
//!        sender task │ wake: Notify            │ receiver task
//!   (build + send segments,          (decode, apply ACKs, accept
//!    retransmit, EXIT)                in-order data, flag replies)
//! ```
//!
//! The two locks are never held together and never across an `.await`.
//! Everything the workers tell each other goes through the atomics and the
//! `wake` notification.
//!
//! # Teardown
//!
//! Closing (locally via [`Stream::close`] / drop, or because the peer sent
//! EXIT) first drains the send buffer, then sends EXIT and repeats it until
//! the peer acknowledges `exit_seq + 1`.  Once both EXITs are acknowledged
//! the stream is CLOSED; it lingers briefly to re-ack duplicate EXITs and
//! the workers stop.  Retry and idle budgets bound every wait.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::handshake::{self, Negotiated, Rendezvous, Role};
use crate::negotiator::{Acceptor, Connector};
use crate::receiver::{Delivery, RecvBuffer};
use crate::segment::{flags, Segment};
use crate::sender::SendBuffer;
use crate::socket::LossySocket;
use crate::state::ConnectionState;

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// A reliable, ordered byte stream to one peer.
///
/// Obtain one with [`Stream::connect`] (active open) or [`Stream::accept`]
/// (passive open).  Both sides are symmetric once established.
#[derive(Debug)]
pub struct Stream {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

/// Counters describing a stream's traffic so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub segments_sent: u64,
    pub segments_received: u64,
    /// Times the go-back-N timer fired and the window was resent.
    pub retransmit_timeouts: u64,
    pub malformed_dropped: u64,
    /// Datagrams discarded by the loss simulator.
    pub simulated_drops: u64,
}

impl Stream {
    /// Active open towards `connector`.
    pub async fn connect(connector: &Connector, config: StreamConfig) -> Result<Self> {
        Self::open(Rendezvous::Connect(connector), config).await
    }

    /// Passive open: wait on `acceptor` for the next SYN.
    pub async fn accept(acceptor: &Acceptor, config: StreamConfig) -> Result<Self> {
        Self::open(Rendezvous::Accept(acceptor), config).await
    }

    async fn open(rendezvous: Rendezvous<'_>, config: StreamConfig) -> Result<Self> {
        let (socket, negotiated) = handshake::open(rendezvous, &config).await?;
        Ok(Self::init(socket, negotiated, config))
    }

    /// Build the shared state and start both workers.
    fn init(socket: LossySocket, negotiated: Negotiated, config: StreamConfig) -> Self {
        let shared = Arc::new(Shared::new(socket, negotiated, config));

        let sender = tokio::spawn(SenderWorker::new(Arc::clone(&shared)).run());
        let receiver = tokio::spawn(run_receiver(Arc::clone(&shared)));

        Self {
            shared,
            workers: vec![sender, receiver],
        }
    }

    /// Queue `data` for delivery.
    ///
    /// Never blocks.  Fails with [`StreamError::BufferFull`] (queuing nothing)
    /// when the send buffer cannot hold all of `data`, and with
    /// [`StreamError::ConnectionClosed`] once this side has sent EXIT.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let result = self.try_queue(data);
        self.shared.wake.notify_one();
        result
    }

    fn try_queue(&self, data: &[u8]) -> Result<()> {
        if self.state().is_finished() {
            return Err(StreamError::ConnectionClosed);
        }
        // Sealed under the same lock that assigns the EXIT sequence number.
        self.shared.with_send(|s| s.push(data))?
    }

    /// Queue all of `data`, waiting for buffer space as acknowledgements
    /// free it.
    pub async fn send_all(&self, data: &[u8]) -> Result<()> {
        let heartbeat = self.shared.config.timers.heartbeat;
        let mut rest = data;
        while !rest.is_empty() {
            let room = self.shared.with_send(|s| s.free())?.min(rest.len());
            if room > 0 {
                self.send(&rest[..room])?;
                rest = &rest[room..];
                continue;
            }
            if self.state().is_finished() {
                return Err(StreamError::ConnectionClosed);
            }
            let _ = tokio::time::timeout(heartbeat, self.shared.writable.notified()).await;
        }
        Ok(())
    }

    /// Take everything received so far (possibly nothing).  Never blocks.
    pub fn recv(&self) -> Vec<u8> {
        let drained = self.shared.with_recv(|r| {
            let data = r.drain();
            self.shared.publish(r);
            data
        });
        let Ok(data) = drained else {
            return Vec::new();
        };
        if !data.is_empty() {
            // Tell the peer the window has reopened.
            self.shared.force_send.store(true, Ordering::Release);
            self.shared.wake.notify_one();
        }
        data
    }

    /// Wait until received data is buffered or the stream has closed.
    pub async fn readable(&self) {
        let heartbeat = self.shared.config.timers.heartbeat;
        while self.available() == 0 && !self.state().is_finished() {
            let _ = tokio::time::timeout(heartbeat, self.shared.readable.notified()).await;
        }
    }

    /// Start a graceful close without giving up the stream.
    ///
    /// Data already queued is still delivered and incoming data can still be
    /// read; writes fail with [`StreamError::ConnectionClosed`] once the send
    /// buffer has drained and EXIT has taken the next sequence number.
    pub fn shutdown(&self) {
        self.shared.begin_close();
    }

    /// Close gracefully and wait for both workers to stop.
    ///
    /// Returns [`StreamError::CloseTimeout`] if the peer never completed the
    /// EXIT exchange within the retry budget.
    pub async fn close(mut self) -> Result<()> {
        self.shared.begin_close();
        let mut panicked = false;
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                log::error!("[stream] worker failed: {e}");
                panicked = true;
            }
        }
        if panicked {
            return Err(StreamError::ConnectionClosed);
        }
        if self.shared.handshake_failed.load(Ordering::Acquire) {
            return Err(StreamError::HandshakeTimeout {
                attempts: self.shared.config.timers.max_handshake_attempts,
            });
        }
        if self.shared.close_timed_out.load(Ordering::Acquire) {
            return Err(StreamError::CloseTimeout);
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn role(&self) -> Role {
        self.shared.negotiated.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.socket.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.socket.peer()
    }

    /// Next in-order sequence number expected from the peer.
    pub fn ack_number(&self) -> u32 {
        self.shared.ack_number.load(Ordering::Acquire)
    }

    /// Oldest unacknowledged sequence number of our own stream.
    pub fn send_base(&self) -> u32 {
        self.shared.with_send(|s| s.base()).unwrap_or_default()
    }

    /// Bytes on the wire awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.shared.with_send(|s| s.in_flight()).unwrap_or_default()
    }

    /// Bytes held in the send buffer (unacknowledged or unsent).
    pub fn buffered(&self) -> usize {
        self.shared.with_send(|s| s.len()).unwrap_or_default()
    }

    /// Bytes received and waiting for [`Stream::recv`].
    pub fn available(&self) -> usize {
        self.shared.with_recv(|r| r.len()).unwrap_or_default()
    }

    /// Receive window we advertise.
    pub fn local_window(&self) -> u32 {
        self.shared.self_rwnd.load(Ordering::Acquire)
    }

    /// Receive window the peer last advertised.
    pub fn peer_window(&self) -> u32 {
        self.shared.other_rwnd.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StreamStats {
        let c = &self.shared.counters;
        StreamStats {
            segments_sent: c.sent.load(Ordering::Relaxed),
            segments_received: c.received.load(Ordering::Relaxed),
            retransmit_timeouts: self
                .shared
                .with_send(|s| s.retransmit_timeouts())
                .unwrap_or_default(),
            malformed_dropped: c.malformed.load(Ordering::Relaxed),
            simulated_drops: self.shared.socket.loss_counts().0,
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Workers finish the close on their own; every wait is bounded.
        self.shared.begin_close();
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    malformed: AtomicU64,
}

#[derive(Debug)]
struct Shared {
    socket: LossySocket,
    config: StreamConfig,
    negotiated: Negotiated,
    epoch: Instant,

    state: AtomicU8,
    send: Mutex<SendBuffer>,
    recv: Mutex<RecvBuffer>,

    /// Mirror of `RecvBuffer::ack_number` readable without the recv lock.
    /// Only written with the recv lock held (see [`Shared::publish`]).
    ack_number: AtomicU32,
    /// Mirror of `RecvBuffer::window`, written like `ack_number`.
    self_rwnd: AtomicU32,
    other_rwnd: AtomicU32,
    /// Send an ack-bearing segment even if there is no data.
    force_send: AtomicBool,
    terminating: AtomicBool,
    /// Any non-SYN segment has arrived from the peer.
    peer_heard: AtomicBool,
    last_inbound_ms: AtomicU64,

    exit_acked: AtomicBool,
    peer_exited: AtomicBool,
    close_timed_out: AtomicBool,
    handshake_failed: AtomicBool,

    /// Sender worker wake-up.
    wake: Notify,
    readable: Notify,
    writable: Notify,
    counters: Counters,
}

impl Shared {
    fn new(socket: LossySocket, negotiated: Negotiated, config: StreamConfig) -> Self {
        let send = SendBuffer::new(
            negotiated.send_base(),
            config.buffer_capacity,
            config.timers.retransmit_timeout,
        );
        let recv = RecvBuffer::new(negotiated.ack_number(), config.buffer_capacity);
        let self_rwnd = recv.window();

        Self {
            socket,
            negotiated,
            epoch: Instant::now(),
            state: AtomicU8::new(ConnectionState::Established.as_u8()),
            send: Mutex::new(send),
            recv: Mutex::new(recv),
            ack_number: AtomicU32::new(negotiated.ack_number()),
            self_rwnd: AtomicU32::new(self_rwnd),
            other_rwnd: AtomicU32::new(negotiated.peer_window),
            // The initiator's first segment completes the handshake.
            force_send: AtomicBool::new(negotiated.role == Role::Initiator),
            terminating: AtomicBool::new(false),
            peer_heard: AtomicBool::new(false),
            last_inbound_ms: AtomicU64::new(0),
            exit_acked: AtomicBool::new(false),
            peer_exited: AtomicBool::new(false),
            close_timed_out: AtomicBool::new(false),
            handshake_failed: AtomicBool::new(false),
            wake: Notify::new(),
            readable: Notify::new(),
            writable: Notify::new(),
            counters: Counters::default(),
            config,
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        let old = ConnectionState::from_u8(self.state.swap(state.as_u8(), Ordering::AcqRel));
        if old != state {
            log::info!("[stream] {} {old} → {state}", self.socket.local_addr());
        }
        if state == ConnectionState::Closed {
            self.readable.notify_one();
            self.writable.notify_one();
        }
    }

    /// ESTABLISHED → CLOSING; a no-op in any other state.
    fn enter_closing(&self) -> bool {
        let moved = self
            .state
            .compare_exchange(
                ConnectionState::Established.as_u8(),
                ConnectionState::Closing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if moved {
            log::info!(
                "[stream] {} {} → {}",
                self.socket.local_addr(),
                ConnectionState::Established,
                ConnectionState::Closing
            );
        }
        moved
    }

    fn begin_close(&self) {
        self.enter_closing();
        self.wake.notify_one();
    }

    /// Stop both workers now.
    fn terminate(&self) {
        self.terminating.store(true, Ordering::Release);
        self.set_state(ConnectionState::Closed);
        self.wake.notify_one();
    }

    fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// Copy the receive buffer's ACK number and window into the atomics the
    /// sender reads.  Must be called with the recv lock held, so the last
    /// value stored always matches the buffer.
    fn publish(&self, recv: &RecvBuffer) {
        self.ack_number.store(recv.ack_number(), Ordering::Release);
        self.self_rwnd.store(recv.window(), Ordering::Release);
    }

    fn with_send<R>(&self, f: impl FnOnce(&mut SendBuffer) -> R) -> Result<R> {
        Ok(f(&mut *lock(&self.send)?))
    }

    fn with_recv<R>(&self, f: impl FnOnce(&mut RecvBuffer) -> R) -> Result<R> {
        Ok(f(&mut *lock(&self.recv)?))
    }

    fn millis(&self, at: Instant) -> u64 {
        u64::try_from(at.saturating_duration_since(self.epoch).as_millis()).unwrap_or(u64::MAX)
    }

    fn last_inbound(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_inbound_ms.load(Ordering::Acquire))
    }

    /// Header for an outbound segment carrying our current ACK and window.
    fn outbound(&self, sequence: u32) -> Segment {
        Segment::new(
            sequence,
            self.ack_number.load(Ordering::Acquire),
            self.self_rwnd.load(Ordering::Acquire),
        )
        .with_flag(flags::ACK)
    }

    async fn transmit(&self, seg: &Segment) {
        match self.socket.send(&seg.encode()).await {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                log::debug!("[stream] → {seg}");
            }
            Err(e) => log::warn!("[stream] send failed ({e}); treating as loss"),
        }
    }

    // -----------------------------------------------------------------------
    // Inbound processing (receiver task)
    // -----------------------------------------------------------------------

    fn on_segment(&self, seg: Segment) -> Result<()> {
        let now = Instant::now();
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.last_inbound_ms.store(self.millis(now), Ordering::Release);
        self.other_rwnd.store(seg.window, Ordering::Release);
        log::debug!("[stream] ← {seg}");

        let mut reply = false;

        if seg.is_syn() {
            // A repeated SYN+ACK means our first ACK was lost.
            if self.negotiated.role == Role::Initiator && seg.is_ack() {
                self.force_send.store(true, Ordering::Release);
            }
            self.wake.notify_one();
            return Ok(());
        }
        self.peer_heard.store(true, Ordering::Release);

        if seg.is_ack() {
            let (acked, exit_seq) =
                self.with_send(|s| (s.on_ack(seg.ack, now), s.exit_sequence()))?;
            if acked > 0 {
                log::debug!("[stream] ← ACK ack={} (+{acked} bytes)", seg.ack);
                self.writable.notify_one();
            }
            if exit_seq.is_some_and(|exit| seg.ack == exit.wrapping_add(1))
                && !self.exit_acked.swap(true, Ordering::AcqRel)
            {
                log::debug!("[stream] ← ACK of EXIT");
            }
        }

        if !seg.is_empty() {
            reply = true;
            if self.peer_exited.load(Ordering::Acquire) {
                log::debug!("[stream] discarding {} bytes after peer EXIT", seg.len());
            } else {
                let delivery = self.with_recv(|r| {
                    let d = r.on_segment(seg.sequence, seg.payload());
                    self.publish(r);
                    d
                })?;
                match delivery {
                    Delivery::Accepted => self.readable.notify_one(),
                    other => log::debug!("[stream] dropped seq={} ({other:?})", seg.sequence),
                }
            }
        }

        if seg.is_exit() {
            reply = true;
            let fresh = self.with_recv(|r| {
                let fresh = r.on_exit(seg.sequence);
                self.publish(r);
                fresh
            })?;
            if fresh {
                self.peer_exited.store(true, Ordering::Release);
                log::debug!("[stream] ← EXIT seq={}", seg.sequence);
                self.enter_closing();
                self.readable.notify_one();
            }
        }

        // Flagless empty segment: zero-window probe.
        if seg.flags() == 0 && seg.is_empty() {
            reply = true;
        }

        if reply {
            self.force_send.store(true, Ordering::Release);
        }
        self.wake.notify_one();
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|_| StreamError::ConnectionClosed)
}

/// Stops the connection if a worker unwinds, so the other one and the
/// application do not wait on it forever.
struct PanicGuard<'a> {
    shared: &'a Shared,
    worker: &'static str,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            log::error!("[stream] {} worker panicked; terminating", self.worker);
            self.shared.terminate();
        }
    }
}

// ---------------------------------------------------------------------------
// Receiver task
// ---------------------------------------------------------------------------

async fn run_receiver(shared: Arc<Shared>) {
    let _guard = PanicGuard {
        shared: &shared,
        worker: "receiver",
    };
    let timeout = shared.config.timers.recv_timeout;

    while !shared.is_terminating() {
        let bytes = match shared.socket.recv(Some(timeout)).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("[stream] receive failed: {e}");
                tokio::time::sleep(timeout).await;
                continue;
            }
        };
        if bytes.is_empty() {
            continue;
        }
        if shared.socket.last_received_from() != shared.socket.peer() {
            log::debug!(
                "[stream] ignoring datagram from {:?}",
                shared.socket.last_received_from()
            );
            continue;
        }
        let seg = match Segment::decode(&bytes) {
            Ok(seg) => seg,
            Err(e) => {
                shared.counters.malformed.fetch_add(1, Ordering::Relaxed);
                log::warn!("[stream] dropping {e}");
                continue;
            }
        };
        if shared.on_segment(seg).is_err() {
            shared.terminate();
            break;
        }
    }
    log::debug!("[stream] receiver stopped");
}

// ---------------------------------------------------------------------------
// Sender task
// ---------------------------------------------------------------------------

/// Sender-private bookkeeping for retransmitting SYN+ACK and EXIT.
struct SenderWorker {
    shared: Arc<Shared>,
    synack_attempts: u32,
    synack_sent_at: Instant,
    last_probe: Instant,
    closing_since: Option<Instant>,
    exit_attempts: u32,
    exit_seq: Option<u32>,
    exit_sent_at: Option<Instant>,
    completed_at: Option<Instant>,
}

/// What the closing logic wants the loop to do next.
enum CloseStep {
    Continue,
    Finished,
}

impl SenderWorker {
    fn new(shared: Arc<Shared>) -> Self {
        let now = Instant::now();
        Self {
            shared,
            synack_attempts: 1,
            synack_sent_at: now,
            last_probe: now,
            closing_since: None,
            exit_attempts: 0,
            exit_seq: None,
            exit_sent_at: None,
            completed_at: None,
        }
    }

    async fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let _guard = PanicGuard {
            shared: &shared,
            worker: "sender",
        };
        let heartbeat = shared.config.timers.heartbeat;

        while !shared.is_terminating() {
            let now = Instant::now();
            let step = match self.tick(now).await {
                Ok(step) => step,
                Err(e) => {
                    log::error!("[stream] sender stopping: {e}");
                    CloseStep::Finished
                }
            };
            if let CloseStep::Finished = step {
                shared.terminate();
                break;
            }
            // Wake on new data, inbound segments, or the heartbeat.
            let _ = tokio::time::timeout(heartbeat, shared.wake.notified()).await;
        }
        log::debug!("[stream] sender stopped");
    }

    async fn tick(&mut self, now: Instant) -> Result<CloseStep> {
        let shared = Arc::clone(&self.shared);

        if shared.with_send(|s| s.poll_retransmit(now))? {
            log::debug!("[stream] timeout; going back to base");
        }

        if let CloseStep::Finished = self.repeat_syn_ack(now).await {
            return Ok(CloseStep::Finished);
        }

        self.flush(now).await?;
        self.probe(now).await?;

        if shared.state() == ConnectionState::Closing
            || (shared.state() == ConnectionState::Closed && self.completed_at.is_some())
        {
            return self.drive_close(now).await;
        }
        Ok(CloseStep::Continue)
    }

    /// Send every segment the windows allow, plus one pure ACK if forced.
    async fn flush(&mut self, now: Instant) -> Result<()> {
        let shared = &self.shared;
        let window_limit = shared.config.window_limit;
        let max_payload = shared.config.effective_max_payload();

        loop {
            let force = shared.force_send.swap(false, Ordering::AcqRel);
            let peer_window = shared.other_rwnd.load(Ordering::Acquire);
            let (seq, payload) =
                shared.with_send(|s| s.next_payload(peer_window, window_limit, max_payload, now))?;
            if payload.is_empty() && !force {
                return Ok(());
            }
            let pure_ack = payload.is_empty();
            let seg = shared.outbound(seq).with_payload(payload)?;
            shared.transmit(&seg).await;
            if pure_ack {
                return Ok(());
            }
        }
    }

    /// Zero-window probe: a flagless empty segment the peer must answer.
    async fn probe(&mut self, now: Instant) -> Result<()> {
        let shared = &self.shared;
        if shared.other_rwnd.load(Ordering::Acquire) != 0 {
            return Ok(());
        }
        let (idle, waiting, seq) =
            shared.with_send(|s| (s.in_flight() == 0, s.unsent() > 0, s.next_sequence()))?;
        let rto = shared.config.timers.retransmit_timeout;
        if idle && waiting && now.saturating_duration_since(self.last_probe) >= rto {
            self.last_probe = now;
            let mut seg = shared.outbound(seq);
            seg.clear_flag(flags::ACK);
            log::debug!("[stream] → window probe");
            shared.transmit(&seg).await;
        }
        Ok(())
    }

    /// Responder only: repeat SYN+ACK until the peer is heard from.
    async fn repeat_syn_ack(&mut self, now: Instant) -> CloseStep {
        let shared = &self.shared;
        if shared.negotiated.role != Role::Responder || shared.peer_heard.load(Ordering::Acquire) {
            return CloseStep::Continue;
        }
        let timers = &shared.config.timers;
        if now.saturating_duration_since(self.synack_sent_at) < timers.retransmit_timeout {
            return CloseStep::Continue;
        }
        if self.synack_attempts >= timers.max_handshake_attempts {
            log::warn!(
                "[stream] peer silent after {} SYN+ACK(s); giving up",
                self.synack_attempts
            );
            shared.handshake_failed.store(true, Ordering::Release);
            return CloseStep::Finished;
        }
        self.synack_attempts += 1;
        self.synack_sent_at = now;
        let seg = shared.negotiated.syn_ack(shared.self_rwnd.load(Ordering::Acquire));
        shared.transmit(&seg).await;
        CloseStep::Continue
    }

    async fn drive_close(&mut self, now: Instant) -> Result<CloseStep> {
        let shared = Arc::clone(&self.shared);
        let timers = &shared.config.timers;

        if let Some(done) = self.completed_at {
            if now.saturating_duration_since(done) >= timers.linger {
                return Ok(CloseStep::Finished);
            }
            return Ok(CloseStep::Continue);
        }

        let since = *self.closing_since.get_or_insert(now);
        let heard = shared.last_inbound().max(since);
        if now.saturating_duration_since(heard) > timers.idle_close_limit() {
            return Ok(self.give_up("peer silent while closing"));
        }

        match self.exit_seq {
            None => {
                // Sealing and the application's push share the send lock, so
                // no byte can be queued behind the EXIT sequence number.
                if let Some(exit_seq) = shared.with_send(|s| s.seal())? {
                    self.exit_seq = Some(exit_seq);
                    self.send_exit(exit_seq, now).await;
                }
            }
            Some(exit_seq) if !shared.exit_acked.load(Ordering::Acquire) => {
                let last = self.exit_sent_at.unwrap_or(now);
                if now.saturating_duration_since(last) >= timers.retransmit_timeout {
                    if self.exit_attempts >= timers.max_exit_attempts {
                        return Ok(self.give_up("EXIT never acknowledged"));
                    }
                    self.send_exit(exit_seq, now).await;
                }
            }
            Some(_) => {}
        }

        if shared.exit_acked.load(Ordering::Acquire) && shared.peer_exited.load(Ordering::Acquire) {
            self.completed_at = Some(now);
            shared.set_state(ConnectionState::Closed);
        }
        Ok(CloseStep::Continue)
    }

    async fn send_exit(&mut self, exit_seq: u32, now: Instant) {
        self.exit_attempts += 1;
        self.exit_sent_at = Some(now);
        let seg = self.shared.outbound(exit_seq).with_flag(flags::EXIT);
        log::debug!("[stream] → EXIT seq={exit_seq} (attempt {})", self.exit_attempts);
        self.shared.transmit(&seg).await;
    }

    fn give_up(&mut self, why: &str) -> CloseStep {
        log::warn!("[stream] {why}; closing unilaterally");
        self.shared.close_timed_out.store(true, Ordering::Release);
        CloseStep::Finished
    }
}
