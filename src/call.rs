//! The per-call object and its lifecycle.
//!
//! A `Call` is one in-flight RPC. The dispatch layer guarantees at most
//! one receive handler runs per call at a time, so packet ingest takes
//! `&mut self`; the fields the transmit worker reads concurrently are
//! published through the shared [`CallOutlook`].

use crate::congestion::{AckSummary, CongestMode};
use crate::peer::Peer;
use crate::rtt::RttRing;
use crate::seq::{Seq, Serial};
use crate::wire::{AckReason, Packet, RX_PROTOCOL_ERROR};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ── Windowing tunables ─────────────────────────────────────────────────────

/// Maximum transmit window, and the ceiling for a peer-advertised rwind.
pub const TX_MAX_WINDOW: u32 = 128;

/// Sender maximum segment size.
pub const TX_SMSS: usize = crate::wire::JUMBO_DATALEN;

/// Size of the selective-ACK ring bitmap. Must exceed the receive window
/// so `seq % SACK_SIZE` is injective within it.
pub const SACK_SIZE: usize = 256;

/// Default receive window width.
pub const RX_WINSIZE_DEFAULT: u32 = 255;

/// Initial peer transmit window assumed before the first ackinfo.
const TX_WINSIZE_INITIAL: u32 = 16;

/// Initial congestion window for the configured SMSS (RFC 3390), also
/// used by the congestion idle reset.
pub(crate) fn initial_cwnd() -> u32 {
    if TX_SMSS > 2190 {
        2
    } else if TX_SMSS > 1095 {
        3
    } else {
        4
    }
}

/// Which end of the RPC this call is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSide {
    Client,
    Server,
}

/// Call phases. Monotone toward `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallState {
    ClientSendRequest,
    ClientAwaitReply,
    ClientRecvReply,
    ServerRecvRequest,
    ServerSendReply,
    ServerAwaitAck,
    Complete,
}

/// Local error classification surfaced with a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    /// Protocol violation detected locally (EBADMSG).
    BadMessage,
    /// The peer aborted the call (ECONNABORTED).
    ConnectionAborted,
    /// The peer appears to have lost the call to an address change
    /// (ENETRESET).
    NetworkReset,
    /// The call was displaced by a newer call on its channel (ESHUTDOWN).
    Shutdown,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallError::BadMessage => "bad message",
            CallError::ConnectionAborted => "connection aborted",
            CallError::NetworkReset => "network reset",
            CallError::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Why a call reached `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCompletion {
    Succeeded,
    RemotelyAborted { abort_code: u32, error: CallError },
    LocallyAborted { abort_code: u32, error: CallError },
}

/// Per-concept atomic flags, readable from the transmit worker.
#[derive(Debug, Default)]
pub struct CallFlags {
    /// The last DATA packet of the incoming stream has been seen.
    pub rx_last: AtomicBool,
    /// Hard-ack rotation has taken the LAST outgoing DATA buffer.
    pub tx_last: AtomicBool,
    /// Every queued DATA packet has been hard-acked.
    pub tx_all_acked: AtomicBool,
    /// The resend timer expired since congestion management last ran.
    pub retrans_timeout: AtomicBool,
    /// The call was displaced by a newer call on its channel.
    pub is_dead: AtomicBool,
}

/// The slice of call state the transmit worker may read concurrently
/// with packet ingest: receive window, hard-ack cursor, congestion
/// window, and the peer-advertised transmit window.
#[derive(Debug)]
pub struct CallOutlook {
    /// Packed receive window: `wtop << 32 | window`.
    ackr_window: AtomicU64,
    acks_hard_ack: AtomicU32,
    cong_cwnd: AtomicU32,
    cong_extra: AtomicU32,
    tx_winsize: AtomicU32,
    pub flags: CallFlags,
}

impl CallOutlook {
    fn new() -> Self {
        Self {
            ackr_window: AtomicU64::new(1 << 32 | 1),
            acks_hard_ack: AtomicU32::new(0),
            cong_cwnd: AtomicU32::new(initial_cwnd()),
            cong_extra: AtomicU32::new(0),
            tx_winsize: AtomicU32::new(TX_WINSIZE_INITIAL),
            flags: CallFlags::default(),
        }
    }

    /// The receive window as `(window, wtop)`: the next expected
    /// in-order seq and one past the highest seq accepted.
    pub fn rx_window(&self) -> (Seq, Seq) {
        let packed = self.ackr_window.load(Ordering::Acquire);
        (Seq(packed as u32), Seq((packed >> 32) as u32))
    }

    /// Publish a new receive window. Release-ordered so a reader that
    /// observes the advance also observes the queued packet.
    pub(crate) fn set_rx_window(&self, window: Seq, wtop: Seq) {
        let packed = (wtop.0 as u64) << 32 | window.0 as u64;
        self.ackr_window.store(packed, Ordering::Release);
    }

    /// Highest fully-acknowledged outgoing seq.
    pub fn hard_ack(&self) -> Seq {
        Seq(self.acks_hard_ack.load(Ordering::Acquire))
    }

    pub(crate) fn set_hard_ack(&self, to: Seq) {
        self.acks_hard_ack.store(to.0, Ordering::Release);
    }

    pub fn cwnd(&self) -> u32 {
        self.cong_cwnd.load(Ordering::Acquire)
    }

    pub(crate) fn set_cwnd(&self, cwnd: u32) {
        self.cong_cwnd.store(cwnd, Ordering::Release);
    }

    /// Extra unsent DATA packets the transmit worker may push to tickle
    /// the peer's ACK state.
    pub fn cong_extra(&self) -> u32 {
        self.cong_extra.load(Ordering::Acquire)
    }

    pub(crate) fn bump_cong_extra(&self) {
        self.cong_extra.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn clamp_cong_extra(&self, max: u32) {
        self.cong_extra.fetch_min(max, Ordering::AcqRel);
    }

    pub(crate) fn clear_cong_extra(&self) {
        self.cong_extra.store(0, Ordering::Release);
    }

    /// Peer-advertised receive window.
    pub fn tx_winsize(&self) -> u32 {
        self.tx_winsize.load(Ordering::Acquire)
    }

    pub(crate) fn set_tx_winsize(&self, winsize: u32) {
        self.tx_winsize.store(winsize, Ordering::Release);
    }
}

/// A transmit buffer tag tracked by the call: its sequence number and
/// whether it closes the outgoing stream. Payload bytes live with the
/// transmit engine.
#[derive(Debug, Clone, Copy)]
pub struct TxBuf {
    pub seq: Seq,
    pub last: bool,
}

/// Counters kept per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallStats {
    pub rx_data: u64,
    pub rx_data_reqack: u64,
    pub rx_data_jumbo: u64,
    /// Indexed by ACK reason code; unknown reasons land in slot 0.
    pub rx_acks: [u64; 10],
}

/// Deadlines owned by the external timer layer, re-armed by the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallTimers {
    pub expect_rx_by: Option<Instant>,
    pub expect_req_by: Option<Instant>,
    pub resend_at: Option<Instant>,
    pub delay_ack_at: Option<Instant>,
}

/// Every external effect the call engine can cause, injected by the
/// surrounding transport so the engine can run headless under test.
pub trait CallDriver {
    /// Transmit an ACK with `reason`, responding to packet `serial`.
    fn send_ack(&mut self, reason: AckReason, serial: Serial);
    /// Ask the ACK scheduler for a delayed ACK covering `serial`.
    fn propose_delay_ack(&mut self, serial: Serial);
    /// Ask the ACK scheduler for a PING probe.
    fn propose_ping(&mut self, serial: Serial);
    /// Queue an outgoing ABORT carrying `abort_code`.
    fn send_abort(&mut self, abort_code: u32);
    /// Retransmission requested by congestion management.
    fn resend(&mut self);
    /// Wake the transmit worker (window or congestion state changed).
    fn wake_tx(&mut self);
    /// Wake the socket side (data queued or call completed).
    fn notify_socket(&mut self);
    /// Pull the call timer forward to `deadline`.
    fn reduce_call_timer(&mut self, deadline: Instant, now: Instant);
    /// Detach the call from its connection channel. Called with the
    /// socket's incoming lock held by contract.
    fn disconnect(&mut self);
    /// Obtain a privately-owned packet for in-place decryption when the
    /// security index is nonzero. `None` drops the packet.
    fn unshare(&mut self, packet: Packet) -> Option<Packet> {
        Some(packet)
    }
}

/// One in-flight RPC.
pub struct Call<D: CallDriver> {
    pub(crate) debug_id: u32,
    pub(crate) side: CallSide,
    pub(crate) state: CallState,
    pub(crate) completion: Option<CallCompletion>,
    pub(crate) driver: D,
    pub(crate) peer: Arc<Peer>,
    pub(crate) outlook: Arc<CallOutlook>,

    // ── Receive side ─────────────────────────────────────────────────
    pub(crate) service_id: u16,
    pub(crate) rx_serial: Serial,
    pub(crate) rx_highest_seq: Seq,
    pub(crate) rx_winsize: u32,
    /// In-order packets awaiting the socket layer.
    pub(crate) rx_queue: VecDeque<Packet>,
    /// Out-of-order holding area, ascending by seq.
    pub(crate) rx_oos_queue: VecDeque<Packet>,
    pub(crate) sack_table: Box<[u8; SACK_SIZE]>,
    pub(crate) ackr_nr_unacked: u32,
    /// Reason of an outstanding deferred-ACK proposal, if any.
    pub(crate) ackr_proposed: Option<AckReason>,
    pub(crate) nr_jumbo_bad: u32,

    // ── Transmit bookkeeping ─────────────────────────────────────────
    pub(crate) tx_queue: VecDeque<TxBuf>,
    pub(crate) tx_top: Seq,
    pub(crate) tx_last_sent: Instant,
    pub(crate) tx_phase: bool,
    pub(crate) acks_first_seq: Seq,
    pub(crate) acks_prev_seq: Seq,
    pub(crate) acks_lowest_nak: Seq,
    pub(crate) acks_highest_serial: Serial,
    pub(crate) acks_latest_ts: Option<Instant>,

    // ── Congestion ───────────────────────────────────────────────────
    pub(crate) cong_mode: CongestMode,
    pub(crate) cong_ssthresh: u32,
    pub(crate) cong_cumul_acks: u8,
    pub(crate) cong_dup_acks: u8,
    pub(crate) cong_tstamp: Instant,

    pub(crate) rtt: RttRing,

    pub(crate) next_rx_timo: Option<Duration>,
    pub(crate) next_req_timo: Option<Duration>,
    pub timers: CallTimers,

    pub(crate) stats: CallStats,
}

impl<D: CallDriver> Call<D> {
    pub fn new(debug_id: u32, side: CallSide, peer: Arc<Peer>, driver: D) -> Call<D> {
        let now = Instant::now();
        Call {
            debug_id,
            side,
            state: match side {
                CallSide::Client => CallState::ClientSendRequest,
                CallSide::Server => CallState::ServerRecvRequest,
            },
            completion: None,
            driver,
            peer,
            outlook: Arc::new(CallOutlook::new()),
            service_id: 0,
            rx_serial: Serial(0),
            rx_highest_seq: Seq(0),
            rx_winsize: RX_WINSIZE_DEFAULT,
            rx_queue: VecDeque::new(),
            rx_oos_queue: VecDeque::new(),
            sack_table: Box::new([0u8; SACK_SIZE]),
            ackr_nr_unacked: 0,
            ackr_proposed: None,
            nr_jumbo_bad: 0,
            tx_queue: VecDeque::new(),
            tx_top: Seq(0),
            tx_last_sent: now,
            tx_phase: true,
            acks_first_seq: Seq(0),
            acks_prev_seq: Seq(0),
            acks_lowest_nak: Seq(0),
            acks_highest_serial: Serial(0),
            acks_latest_ts: None,
            cong_mode: CongestMode::SlowStart,
            cong_ssthresh: TX_MAX_WINDOW,
            cong_cumul_acks: 0,
            cong_dup_acks: 0,
            cong_tstamp: now,
            rtt: RttRing::new(),
            next_rx_timo: None,
            next_req_timo: None,
            timers: CallTimers::default(),
            stats: CallStats::default(),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn side(&self) -> CallSide {
        self.side
    }

    pub fn completion(&self) -> Option<CallCompletion> {
        self.completion
    }

    pub fn is_complete(&self) -> bool {
        self.state >= CallState::Complete
    }

    /// Shared handle for the transmit worker.
    pub fn outlook(&self) -> Arc<CallOutlook> {
        self.outlook.clone()
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    pub fn service_id(&self) -> u16 {
        self.service_id
    }

    /// Highest seq observed in any DATA packet.
    pub fn rx_highest_seq(&self) -> Seq {
        self.rx_highest_seq
    }

    pub fn tx_top(&self) -> Seq {
        self.tx_top
    }

    /// True while the call is still transmitting its outgoing stream.
    pub fn in_tx_phase(&self) -> bool {
        self.tx_phase
    }

    /// In-order packets delivered but not yet acknowledged to the peer.
    pub fn unacked_packets(&self) -> u32 {
        self.ackr_nr_unacked
    }

    pub fn congestion_mode(&self) -> CongestMode {
        self.cong_mode
    }

    /// Arrival time of the most recent valid ACK.
    pub fn acks_latest_ts(&self) -> Option<Instant> {
        self.acks_latest_ts
    }

    pub(crate) fn hard_ack(&self) -> Seq {
        self.outlook.hard_ack()
    }

    pub fn set_rx_winsize(&mut self, winsize: u32) {
        debug_assert!((winsize as usize) < SACK_SIZE);
        self.rx_winsize = winsize;
    }

    /// Arm the idle timeout: a packet is expected within `timo`.
    pub fn set_next_rx_timeout(&mut self, timo: Option<Duration>) {
        self.next_rx_timo = timo;
    }

    /// Arm the request timeout used while receiving a request.
    pub fn set_next_req_timeout(&mut self, timo: Option<Duration>) {
        self.next_req_timo = timo;
    }

    // ── Transmit-side surface ────────────────────────────────────────

    /// Record one outgoing DATA buffer queued by the transmit engine.
    /// Returns the seq assigned to it. The TX_LAST flag is raised by
    /// hard-ack rotation once the peer has taken the final buffer, not
    /// here.
    pub fn queue_tx(&mut self, last: bool) -> Seq {
        self.tx_top += 1;
        self.tx_queue.push_back(TxBuf {
            seq: self.tx_top,
            last,
        });
        self.tx_top
    }

    /// Record a transmission instant for the congestion idle check.
    pub fn note_transmit(&mut self, at: Instant) {
        self.tx_last_sent = at;
    }

    /// The resend timer expired; congestion management picks this up on
    /// the next ACK.
    pub fn note_retrans_timeout(&mut self) {
        self.outlook
            .flags
            .retrans_timeout
            .store(true, Ordering::Release);
    }

    /// Track an RTT probe for `serial` sent at `sent_at`. Returns false
    /// if no probe slot was free.
    pub fn note_rtt_probe(&mut self, serial: Serial, sent_at: Instant) -> bool {
        self.rtt.arm(serial, sent_at)
    }

    // ── Socket-side surface ──────────────────────────────────────────

    /// Take the next in-order packet, if any.
    pub fn dequeue_rx(&mut self) -> Option<Packet> {
        self.rx_queue.pop_front()
    }

    // ── Completion ───────────────────────────────────────────────────

    /// Make the call terminal. The first completion wins; later attempts
    /// are ignored. Returns whether this call did it.
    pub(crate) fn set_completion(&mut self, completion: CallCompletion) -> bool {
        if self.state >= CallState::Complete {
            return false;
        }
        log::debug!("call {} complete: {:?}", self.debug_id, completion);
        self.state = CallState::Complete;
        self.completion = Some(completion);
        self.driver.notify_socket();
        true
    }

    pub(crate) fn completed(&mut self) {
        self.set_completion(CallCompletion::Succeeded);
    }

    /// Locally abort the call. Returns true if the completion was
    /// recorded (and an ABORT packet should go out).
    pub(crate) fn abort_call(
        &mut self,
        why: &'static str,
        seq: Seq,
        abort_code: u32,
        error: CallError,
    ) -> bool {
        log::debug!(
            "call {} abort {} seq={} code={:#x}",
            self.debug_id,
            why,
            seq,
            abort_code
        );
        self.set_completion(CallCompletion::LocallyAborted { abort_code, error })
    }

    /// Abort on a locally-detected protocol violation and queue the
    /// outgoing ABORT.
    pub(crate) fn proto_abort(&mut self, why: &'static str, seq: Seq) {
        if self.abort_call(why, seq, RX_PROTOCOL_ERROR, CallError::BadMessage) {
            self.driver.send_abort(RX_PROTOCOL_ERROR);
        }
    }

    // ── Phase controller ─────────────────────────────────────────────

    /// End the transmission phase of the call: we got a final ACK, an
    /// ACKALL, or the first DATA packet of a reply.
    pub(crate) fn end_tx_phase(&mut self, reply_begun: bool, abort_why: &'static str) -> bool {
        debug_assert!(self.outlook.flags.tx_last.load(Ordering::Acquire));

        match self.state {
            CallState::ClientSendRequest | CallState::ClientAwaitReply => {
                self.state = if reply_begun {
                    CallState::ClientRecvReply
                } else {
                    CallState::ClientAwaitReply
                };
                log::trace!("call {} tx phase over: {:?}", self.debug_id, self.state);
                true
            }
            CallState::ServerAwaitAck => {
                self.completed();
                true
            }
            state => {
                log::debug!("call {} end_tx in bad state {:?}", self.debug_id, state);
                self.proto_abort(abort_why, self.tx_top);
                false
            }
        }
    }

    /// Begin the reply reception phase: the first reply DATA implicitly
    /// hard-acks every request packet we sent.
    pub(crate) fn receiving_reply(&mut self) -> bool {
        let top = self.tx_top;

        if self.ackr_proposed.is_some() {
            // A deferred ACK is pending; the reply supersedes resend and
            // delay-ack deadlines.
            self.timers.resend_at = None;
            self.timers.delay_ack_at = None;
            log::trace!("call {} timers parked for reply", self.debug_id);
        }

        if !self.outlook.flags.tx_last.load(Ordering::Acquire) {
            let mut summary = AckSummary::default();
            if !self.rotate_tx_window(top, &mut summary) {
                self.proto_abort("TXL", top);
                return false;
            }
        }
        if !self.end_tx_phase(true, "ETD") {
            return false;
        }
        self.tx_phase = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{client_call, server_call, Emitted};

    #[test]
    fn new_call_window_starts_at_one() {
        let call = client_call();
        let (window, wtop) = call.outlook.rx_window();
        assert_eq!(window, Seq(1));
        assert_eq!(wtop, Seq(1));
        assert_eq!(call.hard_ack(), Seq(0));
        assert_eq!(call.state(), CallState::ClientSendRequest);
    }

    #[test]
    fn queue_tx_advances_top() {
        let mut call = client_call();
        assert_eq!(call.queue_tx(false), Seq(1));
        assert_eq!(call.queue_tx(false), Seq(2));
        assert_eq!(call.queue_tx(true), Seq(3));
        assert_eq!(call.tx_top(), Seq(3));
        // The LAST buffer is queued, but TX_LAST waits for rotation.
        assert!(!call.outlook.flags.tx_last.load(Ordering::Acquire));
    }

    #[test]
    fn end_tx_phase_without_reply_awaits_it() {
        let mut call = client_call();
        call.queue_tx(true);
        call.outlook.flags.tx_last.store(true, Ordering::Release);
        assert!(call.end_tx_phase(false, "ETA"));
        assert_eq!(call.state(), CallState::ClientAwaitReply);
    }

    #[test]
    fn end_tx_phase_with_reply_begins_reception() {
        let mut call = client_call();
        call.queue_tx(true);
        call.outlook.flags.tx_last.store(true, Ordering::Release);
        assert!(call.end_tx_phase(true, "ETD"));
        assert_eq!(call.state(), CallState::ClientRecvReply);
    }

    #[test]
    fn end_tx_phase_completes_server_awaiting_ack() {
        let mut call = server_call();
        call.state = CallState::ServerAwaitAck;
        call.queue_tx(true);
        call.outlook.flags.tx_last.store(true, Ordering::Release);
        assert!(call.end_tx_phase(false, "ETL"));
        assert_eq!(call.completion(), Some(CallCompletion::Succeeded));
    }

    #[test]
    fn end_tx_phase_in_bad_state_aborts() {
        let mut call = server_call();
        call.state = CallState::ServerRecvRequest;
        call.queue_tx(true);
        call.outlook.flags.tx_last.store(true, Ordering::Release);
        assert!(!call.end_tx_phase(false, "ETA"));
        assert_eq!(
            call.completion(),
            Some(CallCompletion::LocallyAborted {
                abort_code: RX_PROTOCOL_ERROR,
                error: CallError::BadMessage,
            })
        );
        assert!(call
            .driver()
            .events
            .contains(&Emitted::Abort { code: RX_PROTOCOL_ERROR }));
    }

    #[test]
    fn receiving_reply_rotates_and_changes_state() {
        let mut call = client_call();
        call.queue_tx(false);
        call.queue_tx(true);
        assert!(call.receiving_reply());
        assert_eq!(call.state(), CallState::ClientRecvReply);
        assert!(!call.in_tx_phase());
        assert_eq!(call.hard_ack(), Seq(2));
    }

    #[test]
    fn receiving_reply_with_nothing_queued_aborts() {
        let mut call = client_call();
        // No DATA was ever queued, so rotation cannot reach a LAST
        // packet and the reply is a protocol violation.
        assert!(!call.receiving_reply());
        assert_eq!(
            call.completion(),
            Some(CallCompletion::LocallyAborted {
                abort_code: RX_PROTOCOL_ERROR,
                error: CallError::BadMessage,
            })
        );
    }

    #[test]
    fn receiving_reply_parks_timers_when_ack_pending() {
        let mut call = client_call();
        call.queue_tx(true);
        call.ackr_proposed = Some(AckReason::Delay);
        call.timers.resend_at = Some(Instant::now());
        call.timers.delay_ack_at = Some(Instant::now());
        assert!(call.receiving_reply());
        assert_eq!(call.timers.resend_at, None);
        assert_eq!(call.timers.delay_ack_at, None);
    }

    #[test]
    fn first_completion_wins() {
        let mut call = client_call();
        assert!(call.set_completion(CallCompletion::Succeeded));
        assert!(!call.set_completion(CallCompletion::LocallyAborted {
            abort_code: RX_PROTOCOL_ERROR,
            error: CallError::BadMessage,
        }));
        assert_eq!(call.completion(), Some(CallCompletion::Succeeded));
        assert!(call.is_complete());
    }

    #[test]
    fn outlook_window_roundtrips_packed_pair() {
        let call = client_call();
        call.outlook.set_rx_window(Seq(0xdead), Seq(0xbeef));
        assert_eq!(call.outlook.rx_window(), (Seq(0xdead), Seq(0xbeef)));
    }
}
