//! ACK ingest: hard-ack rotation of the transmit window, soft-ACK
//! decoding, RTT probe completion, and the regression filter that keeps
//! stale ACKs from rewinding the call.
//!
//! `firstPacket` is the first soft-ACK'd/NAK'd seq in the ACK array;
//! everything before it is hard-acked and may be discarded. The transmit
//! phase is over once every packet is hard-acked.

use crate::call::{Call, CallCompletion, CallDriver, CallError, CallSide, CallState, TX_MAX_WINDOW};
use crate::congestion::AckSummary;
use crate::rtt::RttRx;
use crate::seq::{Seq, Serial};
use crate::wire::{
    flags, AckInfo, AckPacket, AckReason, Packet, ACK_INFO_LEN, ACK_PACKET_LEN, SACK_ACK,
    WIRE_HEADER_LEN,
};
use std::sync::atomic::Ordering;

impl<D: CallDriver> Call<D> {
    /// Apply a hard ACK by advancing the transmit window to `to`.
    /// Returns true if the rotation took the LAST buffer.
    pub(crate) fn rotate_tx_window(&mut self, to: Seq, summary: &mut AckSummary) -> bool {
        let hard_ack = self.hard_ack();
        let mut rot_last = false;

        for txb in self.tx_queue.iter() {
            if txb.seq.before_eq(hard_ack) {
                continue;
            }
            if txb.seq.after(to) {
                break;
            }
            summary.nr_rot_new_acks += 1;
            if txb.last {
                self.outlook.flags.tx_last.store(true, Ordering::Release);
                rot_last = true;
            }
            if txb.seq == to {
                break;
            }
        }

        if rot_last {
            self.outlook
                .flags
                .tx_all_acked
                .store(true, Ordering::Release);
        }

        // Retired buffers are dropped; nothing below the hard ack is
        // ever needed again.
        while self
            .tx_queue
            .front()
            .map_or(false, |txb| txb.seq.before_eq(to))
        {
            self.tx_queue.pop_front();
        }

        if self.acks_lowest_nak == hard_ack {
            self.acks_lowest_nak = to;
        } else if to.after(self.acks_lowest_nak) {
            summary.new_low_nack = true;
            self.acks_lowest_nak = to;
        }

        self.outlook.set_hard_ack(to);
        log::trace!(
            "call {} tx rotate to={} last={}",
            self.debug_id,
            to,
            rot_last
        );
        self.driver.wake_tx();
        rot_last
    }

    /// True if the ACK does not regress the ack state conveyed by
    /// preceding ACKs.
    fn is_ack_valid(&self, first_pkt: Seq, prev_pkt: Seq) -> bool {
        let base = self.acks_first_seq;

        if first_pkt.after(base) {
            return true; // The window advanced.
        }
        if first_pkt.before(base) {
            return false; // firstPacket regressed.
        }
        if prev_pkt.after_eq(self.acks_prev_seq) {
            return true; // previousPacket hasn't regressed.
        }

        // Some implementations put a serial number in previousPacket.
        if prev_pkt.after_eq(base + self.outlook.tx_winsize()) {
            return false;
        }
        true
    }

    /// Decode the soft-ACK array starting at sequence `seq`.
    fn receive_soft_acks(&mut self, acks: &[u8], seq: Seq, summary: &mut AckSummary) {
        for (i, &byte) in acks.iter().enumerate() {
            if byte == SACK_ACK {
                summary.nr_acks += 1;
                summary.nr_new_acks += 1;
            } else {
                let nak_seq = seq + i as u32;
                if !summary.saw_nacks && self.acks_lowest_nak != nak_seq {
                    self.acks_lowest_nak = nak_seq;
                    summary.new_low_nack = true;
                }
                summary.saw_nacks = true;
            }
        }
    }

    /// Absorb the rwind and MTU sizes appended to an ACK.
    fn receive_ackinfo(&mut self, serial: Serial, info: &AckInfo) {
        log::trace!(
            "Rx ACK {} info rx={} max={} rwind={} jm={}",
            serial,
            info.rx_mtu,
            info.max_mtu,
            info.rwind,
            info.jumbo_max
        );

        let mut wake = false;
        let rwind = info.rwind.min(TX_MAX_WINDOW);
        if self.outlook.tx_winsize() != rwind {
            if rwind > self.outlook.tx_winsize() {
                wake = true;
            }
            log::debug!(
                "call {} rwind {} -> {}",
                self.debug_id,
                self.outlook.tx_winsize(),
                rwind
            );
            self.outlook.set_tx_winsize(rwind);
        }

        if self.cong_ssthresh > rwind {
            self.cong_ssthresh = rwind;
        }

        let mtu = info.rx_mtu.min(info.max_mtu);
        self.peer.update_mtu(mtu);

        if wake {
            self.driver.wake_tx();
        }
    }

    /// Process an ACK packet.
    pub(crate) fn receive_ack(&mut self, pkt: Packet) {
        let mut summary = AckSummary::default();
        let dgram = pkt.datagram();
        let mut offset = WIRE_HEADER_LEN;

        let ack = match AckPacket::parse(&dgram[offset..]) {
            Ok(ack) => ack,
            Err(_) => return self.proto_abort("XAK", Seq(0)),
        };
        offset += ACK_PACKET_LEN;

        let ack_serial = pkt.hdr.serial;
        let acked_serial = ack.serial;
        let first_soft_ack = ack.first_packet;
        let prev_pkt = ack.previous_packet;
        let hard_ack = first_soft_ack - 1;
        let nr_acks = ack.n_acks as u32;
        let reason = AckReason::from_u8(ack.reason);

        log::trace!(
            "Rx ACK {} acked={} first={} prev={} reason={:?} n={}",
            ack_serial,
            acked_serial,
            first_soft_ack,
            prev_pkt,
            reason,
            nr_acks
        );
        self.stats.rx_acks[if ack.reason <= 9 { ack.reason as usize } else { 0 }] += 1;

        match reason {
            Some(AckReason::PingResponse) => {
                self.complete_rtt_probe(pkt.tstamp, acked_serial, RttRx::PingResponse);
            }
            Some(AckReason::Requested) => {
                self.complete_rtt_probe(pkt.tstamp, acked_serial, RttRx::RequestedAck);
            }
            _ => {
                if acked_serial != Serial(0) {
                    self.complete_rtt_probe(pkt.tstamp, acked_serial, RttRx::Cancel);
                }
            }
        }

        if reason == Some(AckReason::Ping) {
            self.driver.send_ack(AckReason::PingResponse, ack_serial);
        } else if pkt.hdr.flags & flags::REQUEST_ACK != 0 {
            self.driver.send_ack(AckReason::Requested, ack_serial);
        }

        // An EXCEEDS_WINDOW ACK shaped like a response to a brand-new
        // call means the server lost our call to a NAT address change.
        if reason == Some(AckReason::ExceedsWindow)
            && first_soft_ack == Seq(1)
            && prev_pkt == Seq(0)
            && self.side == CallSide::Client
        {
            self.set_completion(CallCompletion::RemotelyAborted {
                abort_code: 0,
                error: CallError::NetworkReset,
            });
            return;
        }

        // OUT_OF_SEQUENCE can mean the same, as long as nothing of ours
        // was ever hard-acked.
        if reason == Some(AckReason::OutOfSequence)
            && first_soft_ack == Seq(1)
            && prev_pkt == Seq(0)
            && self.hard_ack() == Seq(0)
            && self.side == CallSide::Client
        {
            self.set_completion(CallCompletion::RemotelyAborted {
                abort_code: 0,
                error: CallError::NetworkReset,
            });
            return;
        }

        // Discard any out-of-order or duplicate ACKs.
        if !self.is_ack_valid(first_soft_ack, prev_pkt) {
            log::debug!(
                "call {} discard stale ACK {} first={}/{} prev={}/{}",
                self.debug_id,
                ack_serial,
                first_soft_ack,
                self.acks_first_seq,
                prev_pkt,
                self.acks_prev_seq
            );
            return;
        }

        let ioffset = offset + nr_acks as usize + 3;
        let info = if dgram.len() >= ioffset + ACK_INFO_LEN {
            match AckInfo::parse(&dgram[ioffset..]) {
                Ok(info) => Some(info),
                Err(_) => return self.proto_abort("XAI", Seq(0)),
            }
        } else {
            None
        };

        self.acks_latest_ts = Some(pkt.tstamp);
        self.acks_first_seq = first_soft_ack;
        self.acks_prev_seq = prev_pkt;

        if reason != Some(AckReason::Ping) && acked_serial.after(self.acks_highest_serial) {
            self.acks_highest_serial = acked_serial;
        }

        if let Some(info) = info.filter(|info| info.rx_mtu != 0) {
            self.receive_ackinfo(ack_serial, &info);
        }

        if first_soft_ack == Seq(0) {
            return self.proto_abort("AK0", Seq(0));
        }

        // Ignore ACKs unless we are or have just been transmitting.
        match self.state {
            CallState::ClientSendRequest
            | CallState::ClientAwaitReply
            | CallState::ServerSendReply
            | CallState::ServerAwaitAck => {}
            _ => return,
        }

        if hard_ack.before(self.hard_ack()) || hard_ack.after(self.tx_top) {
            return self.proto_abort("AKW", Seq(0));
        }
        if nr_acks > self.tx_top.sub(hard_ack) {
            return self.proto_abort("AKN", Seq(0));
        }

        if hard_ack.after(self.hard_ack()) && self.rotate_tx_window(hard_ack, &mut summary) {
            self.end_tx_phase(false, "ETA");
            return;
        }

        if nr_acks > 0 {
            if offset + nr_acks as usize > dgram.len() {
                return self.proto_abort("XSA", Seq(0));
            }
            let acks = &dgram[offset..offset + nr_acks as usize];
            self.receive_soft_acks(acks, first_soft_ack, &mut summary);
        }

        if self.outlook.flags.tx_last.load(Ordering::Acquire)
            && summary.nr_acks == self.tx_top.sub(hard_ack)
            && self.side == CallSide::Client
        {
            // Everything we sent is accounted for but no reply has
            // arrived; probe in case it was lost.
            self.driver.propose_ping(ack_serial);
        }

        self.congestion_management(pkt.tstamp, &mut summary, acked_serial);
    }

    /// Process an ACKALL packet: the peer took the whole transmit
    /// window.
    pub(crate) fn receive_ackall(&mut self, pkt: Packet) {
        log::trace!("Rx ACKALL {}", pkt.hdr.serial);
        let mut summary = AckSummary::default();
        if self.rotate_tx_window(self.tx_top, &mut summary) {
            self.end_tx_phase(false, "ETL");
        }
    }
}
