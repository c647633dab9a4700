//! Receive-side call engine for an RxRPC transport.
//!
//! One [`Call`] models one in-flight RPC. The surrounding transport
//! demultiplexes UDP datagrams, decodes the wire header, and hands each
//! packet to [`Call::receive`]; the engine then:
//!
//! - reorders DATA into a sliding receive window `[window, wtop)` with a
//!   selective-ACK bitmap, splitting jumbograms into their subpackets;
//! - rotates the transmit window on hard ACKs and walks the call's
//!   send/await/receive phases;
//! - runs TCP-style congestion control [RFC 5681] over the send window;
//! - completes RTT probes against the shared [`Peer`] estimator;
//! - records remote aborts and locally-detected protocol violations.
//!
//! Transmission, timers, crypto and socket delivery stay outside: the
//! engine reaches them through the injected [`CallDriver`], so it can be
//! driven headless. Sequence numbers and serials wrap and compare
//! circularly ([`Seq`], [`Serial`]).

mod ack;
mod call;
mod congestion;
mod peer;
mod receive;
mod rtt;
mod seq;
mod wire;

pub use call::{
    Call, CallCompletion, CallDriver, CallError, CallOutlook, CallSide, CallState, CallStats,
    CallTimers, TxBuf, RX_WINSIZE_DEFAULT, SACK_SIZE, TX_MAX_WINDOW, TX_SMSS,
};
pub use congestion::CongestMode;
pub use peer::Peer;
pub use seq::{Seq, Serial};
pub use wire::{
    flags, AckInfo, AckPacket, AckReason, JumboHeader, Packet, PacketType, WireHeader,
    ACK_INFO_LEN, ACK_PACKET_LEN, JUMBO_DATALEN, JUMBO_HEADER_LEN, JUMBO_SUBPKTLEN, RX_CALL_DEAD,
    RX_PROTOCOL_ERROR, RX_USER_ABORT, WIRE_HEADER_LEN,
};
