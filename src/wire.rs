//! RxRPC wire formats: header structs, packet flags, ACK reasons.
//!
//! Every packet starts with the 28-byte wire header (all fields
//! big-endian):
//!   [4 epoch][4 cid][4 callNumber][4 seq][4 serial]
//!   [1 type][1 flags][1 userStatus][1 securityIndex][2 _rsvd][2 serviceId]
//!
//! An ACK body is an 18-byte ackpacket:
//!   [2 bufferSpace][2 maxSkew][4 firstPacket][4 previousPacket]
//!   [4 serial][1 reason][1 nAcks]
//! followed by `nAcks` ACK/NAK bytes, 3 pad bytes, and an optional
//! 16-byte ackinfo trailer:
//!   [4 rxMTU][4 maxMTU][4 rwind][4 jumbo_max]
//!
//! A jumbo DATA packet is a run of 1412-byte subpackets, each followed by
//! a 4-byte jumbo header [1 flags][1 pad][2 _rsvd], with the carrier's
//! trailing data as the final segment.

use crate::seq::{Seq, Serial};
use anyhow::{bail, Result};
use bytes::Bytes;
use std::time::Instant;

/// Wire header length.
pub const WIRE_HEADER_LEN: usize = 28;

/// Fixed ackpacket body length (excluding the soft-ACK array).
pub const ACK_PACKET_LEN: usize = 18;

/// Optional ackinfo trailer length.
pub const ACK_INFO_LEN: usize = 16;

/// Jumbo subpacket trailer length.
pub const JUMBO_HEADER_LEN: usize = 4;

/// Data bytes carried by each non-final jumbo segment.
pub const JUMBO_DATALEN: usize = 1412;

/// Jumbo segment stride: data plus the appended jumbo header.
pub const JUMBO_SUBPKTLEN: usize = JUMBO_DATALEN + JUMBO_HEADER_LEN;

/// Packet types dispatched by the call engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data,
    Ack,
    Busy,
    Abort,
    AckAll,
}

impl PacketType {
    pub fn from_u8(ty: u8) -> Option<PacketType> {
        match ty {
            1 => Some(PacketType::Data),
            2 => Some(PacketType::Ack),
            3 => Some(PacketType::Busy),
            4 => Some(PacketType::Abort),
            5 => Some(PacketType::AckAll),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            PacketType::Data => 1,
            PacketType::Ack => 2,
            PacketType::Busy => 3,
            PacketType::Abort => 4,
            PacketType::AckAll => 5,
        }
    }
}

/// Wire header flag bits.
pub mod flags {
    pub const CLIENT_INITIATED: u8 = 0x01;
    pub const REQUEST_ACK: u8 = 0x02;
    pub const LAST_PACKET: u8 = 0x04;
    pub const MORE_PACKETS: u8 = 0x08;
    pub const JUMBO_PACKET: u8 = 0x20;
}

/// Reasons carried in an ackpacket, and chosen for outgoing ACKs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReason {
    Requested,
    Duplicate,
    OutOfSequence,
    ExceedsWindow,
    NoSpace,
    Ping,
    PingResponse,
    Delay,
    Idle,
}

impl AckReason {
    pub fn from_u8(reason: u8) -> Option<AckReason> {
        match reason {
            1 => Some(AckReason::Requested),
            2 => Some(AckReason::Duplicate),
            3 => Some(AckReason::OutOfSequence),
            4 => Some(AckReason::ExceedsWindow),
            5 => Some(AckReason::NoSpace),
            6 => Some(AckReason::Ping),
            7 => Some(AckReason::PingResponse),
            8 => Some(AckReason::Delay),
            9 => Some(AckReason::Idle),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            AckReason::Requested => 1,
            AckReason::Duplicate => 2,
            AckReason::OutOfSequence => 3,
            AckReason::ExceedsWindow => 4,
            AckReason::NoSpace => 5,
            AckReason::Ping => 6,
            AckReason::PingResponse => 7,
            AckReason::Delay => 8,
            AckReason::Idle => 9,
        }
    }
}

/// Soft-ACK array byte: positive acknowledgement.
pub const SACK_ACK: u8 = 1;
/// Soft-ACK array byte: negative acknowledgement.
pub const SACK_NACK: u8 = 0;

/// Rx abort codes (32-bit two's complement on the wire).
pub const RX_CALL_DEAD: u32 = (-1i32) as u32;
pub const RX_PROTOCOL_ERROR: u32 = (-5i32) as u32;
pub const RX_USER_ABORT: u32 = (-6i32) as u32;

/// The decoded 28-byte wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub epoch: u32,
    pub cid: u32,
    pub call_number: u32,
    pub seq: Seq,
    pub serial: Serial,
    pub ptype: u8,
    pub flags: u8,
    pub user_status: u8,
    pub security_index: u8,
    pub _rsvd: u16,
    pub service_id: u16,
}

impl WireHeader {
    /// Parse a wire header from the start of a datagram.
    pub fn parse(data: &[u8]) -> Result<WireHeader> {
        if data.len() < WIRE_HEADER_LEN {
            bail!("datagram too short for wire header: {} bytes", data.len());
        }
        Ok(WireHeader {
            epoch: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            cid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            call_number: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            seq: Seq(u32::from_be_bytes([data[12], data[13], data[14], data[15]])),
            serial: Serial(u32::from_be_bytes([data[16], data[17], data[18], data[19]])),
            ptype: data[20],
            flags: data[21],
            user_status: data[22],
            security_index: data[23],
            _rsvd: u16::from_be_bytes([data[24], data[25]]),
            service_id: u16::from_be_bytes([data[26], data[27]]),
        })
    }

    /// Serialize to the wire layout.
    pub fn to_bytes(&self) -> [u8; WIRE_HEADER_LEN] {
        let mut buf = [0u8; WIRE_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.epoch.to_be_bytes());
        buf[4..8].copy_from_slice(&self.cid.to_be_bytes());
        buf[8..12].copy_from_slice(&self.call_number.to_be_bytes());
        buf[12..16].copy_from_slice(&self.seq.0.to_be_bytes());
        buf[16..20].copy_from_slice(&self.serial.0.to_be_bytes());
        buf[20] = self.ptype;
        buf[21] = self.flags;
        buf[22] = self.user_status;
        buf[23] = self.security_index;
        buf[24..26].copy_from_slice(&self._rsvd.to_be_bytes());
        buf[26..28].copy_from_slice(&self.service_id.to_be_bytes());
        buf
    }
}

/// The fixed part of an ACK packet body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPacket {
    pub buffer_space: u16,
    pub max_skew: u16,
    pub first_packet: Seq,
    pub previous_packet: Seq,
    /// Serial of the packet this ACK responds to (0 if unsolicited).
    pub serial: Serial,
    pub reason: u8,
    pub n_acks: u8,
}

impl AckPacket {
    pub fn parse(data: &[u8]) -> Result<AckPacket> {
        if data.len() < ACK_PACKET_LEN {
            bail!("short ackpacket: {} bytes", data.len());
        }
        Ok(AckPacket {
            buffer_space: u16::from_be_bytes([data[0], data[1]]),
            max_skew: u16::from_be_bytes([data[2], data[3]]),
            first_packet: Seq(u32::from_be_bytes([data[4], data[5], data[6], data[7]])),
            previous_packet: Seq(u32::from_be_bytes([data[8], data[9], data[10], data[11]])),
            serial: Serial(u32::from_be_bytes([data[12], data[13], data[14], data[15]])),
            reason: data[16],
            n_acks: data[17],
        })
    }

    pub fn to_bytes(&self) -> [u8; ACK_PACKET_LEN] {
        let mut buf = [0u8; ACK_PACKET_LEN];
        buf[0..2].copy_from_slice(&self.buffer_space.to_be_bytes());
        buf[2..4].copy_from_slice(&self.max_skew.to_be_bytes());
        buf[4..8].copy_from_slice(&self.first_packet.0.to_be_bytes());
        buf[8..12].copy_from_slice(&self.previous_packet.0.to_be_bytes());
        buf[12..16].copy_from_slice(&self.serial.0.to_be_bytes());
        buf[16] = self.reason;
        buf[17] = self.n_acks;
        buf
    }
}

/// The optional trailer of an ACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckInfo {
    pub rx_mtu: u32,
    pub max_mtu: u32,
    pub rwind: u32,
    pub jumbo_max: u32,
}

impl AckInfo {
    pub fn parse(data: &[u8]) -> Result<AckInfo> {
        if data.len() < ACK_INFO_LEN {
            bail!("short ackinfo: {} bytes", data.len());
        }
        Ok(AckInfo {
            rx_mtu: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            max_mtu: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            rwind: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            jumbo_max: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; ACK_INFO_LEN] {
        let mut buf = [0u8; ACK_INFO_LEN];
        buf[0..4].copy_from_slice(&self.rx_mtu.to_be_bytes());
        buf[4..8].copy_from_slice(&self.max_mtu.to_be_bytes());
        buf[8..12].copy_from_slice(&self.rwind.to_be_bytes());
        buf[12..16].copy_from_slice(&self.jumbo_max.to_be_bytes());
        buf
    }
}

/// The 4-byte header appended to each non-final jumbo segment. Its flags
/// become the wire-header flags of the *next* subpacket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumboHeader {
    pub flags: u8,
    pub _rsvd: u16,
}

impl JumboHeader {
    pub fn parse(data: &[u8]) -> Result<JumboHeader> {
        if data.len() < JUMBO_HEADER_LEN {
            bail!("short jumbo header: {} bytes", data.len());
        }
        Ok(JumboHeader {
            flags: data[0],
            _rsvd: u16::from_be_bytes([data[2], data[3]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; JUMBO_HEADER_LEN] {
        let mut buf = [0u8; JUMBO_HEADER_LEN];
        buf[0] = self.flags;
        buf[2..4].copy_from_slice(&self._rsvd.to_be_bytes());
        buf
    }
}

/// A received packet handed to the call engine by the dispatch layer:
/// the decoded header, the whole datagram, and a payload subrange view.
///
/// Cloning shares the underlying datagram; the jumbo splitter relies on
/// this to hand out per-subpacket views without copying.
#[derive(Debug, Clone)]
pub struct Packet {
    pub hdr: WireHeader,
    data: Bytes,
    offset: usize,
    len: usize,
    /// Arrival time, stamped by the dispatch layer.
    pub tstamp: Instant,
}

impl Packet {
    /// Decode a datagram into a packet. The payload view initially covers
    /// everything after the wire header.
    pub fn parse(data: Bytes, tstamp: Instant) -> Result<Packet> {
        let hdr = WireHeader::parse(&data)?;
        let len = data.len() - WIRE_HEADER_LEN;
        Ok(Packet {
            hdr,
            data,
            offset: WIRE_HEADER_LEN,
            len,
            tstamp,
        })
    }

    /// The whole datagram, wire header included.
    pub fn datagram(&self) -> &[u8] {
        &self.data
    }

    pub fn datagram_len(&self) -> usize {
        self.data.len()
    }

    /// The current payload view.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    /// A clone of this packet viewing `len` bytes at absolute datagram
    /// offset `offset`.
    pub(crate) fn subrange(&self, offset: usize, len: usize) -> Packet {
        debug_assert!(offset + len <= self.data.len());
        Packet {
            hdr: self.hdr,
            data: self.data.clone(),
            offset,
            len,
            tstamp: self.tstamp,
        }
    }

    /// Narrow this packet's payload view in place.
    pub(crate) fn set_view(&mut self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.data.len());
        self.offset = offset;
        self.len = len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> WireHeader {
        WireHeader {
            epoch: 0x12345678,
            cid: 0x9abcdef0,
            call_number: 7,
            seq: Seq(42),
            serial: Serial(99),
            ptype: PacketType::Data.to_u8(),
            flags: flags::LAST_PACKET | flags::REQUEST_ACK,
            user_status: 0,
            security_index: 2,
            _rsvd: 0,
            service_id: 2034,
        }
    }

    #[test]
    fn wire_header_roundtrip() {
        let hdr = header();
        let bytes = hdr.to_bytes();
        assert_eq!(bytes.len(), WIRE_HEADER_LEN);
        let parsed = WireHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn wire_header_too_short() {
        assert!(WireHeader::parse(&[0u8; WIRE_HEADER_LEN - 1]).is_err());
    }

    #[test]
    fn ackpacket_roundtrip() {
        let ack = AckPacket {
            buffer_space: 64,
            max_skew: 0,
            first_packet: Seq(5),
            previous_packet: Seq(9),
            serial: Serial(1234),
            reason: AckReason::Ping.to_u8(),
            n_acks: 4,
        };
        let parsed = AckPacket::parse(&ack.to_bytes()).unwrap();
        assert_eq!(parsed, ack);
    }

    #[test]
    fn ackinfo_roundtrip() {
        let info = AckInfo {
            rx_mtu: 1444,
            max_mtu: 1444,
            rwind: 128,
            jumbo_max: 4,
        };
        assert_eq!(AckInfo::parse(&info.to_bytes()).unwrap(), info);
    }

    #[test]
    fn jumbo_header_roundtrip() {
        let jhdr = JumboHeader {
            flags: flags::JUMBO_PACKET,
            _rsvd: 0xbeef,
        };
        assert_eq!(JumboHeader::parse(&jhdr.to_bytes()).unwrap(), jhdr);
    }

    #[test]
    fn packet_payload_view() {
        let mut buf = header().to_bytes().to_vec();
        buf.extend_from_slice(b"hello rx");
        let pkt = Packet::parse(Bytes::from(buf), Instant::now()).unwrap();
        assert_eq!(pkt.payload(), b"hello rx");
        assert_eq!(pkt.datagram_len(), WIRE_HEADER_LEN + 8);

        let sub = pkt.subrange(WIRE_HEADER_LEN + 6, 2);
        assert_eq!(sub.payload(), b"rx");
        assert_eq!(sub.hdr, pkt.hdr);
    }

    #[test]
    fn abort_code_wire_values() {
        assert_eq!(RX_CALL_DEAD, 0xffff_ffff);
        assert_eq!(RX_PROTOCOL_ERROR, 0xffff_fffb);
    }

    #[test]
    fn ack_reason_codes_roundtrip() {
        for code in 1..=9u8 {
            let reason = AckReason::from_u8(code).unwrap();
            assert_eq!(reason.to_u8(), code);
        }
        assert_eq!(AckReason::from_u8(0), None);
        assert_eq!(AckReason::from_u8(10), None);
    }
}
