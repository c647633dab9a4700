//! Ingest of received packets: classification, jumbo splitting, and the
//! sliding receive window.
//!
//! The dispatch layer routes each datagram to its call and hands it in
//! here. DATA packets are reordered into the window `[window, wtop)`;
//! everything else fans out to the ACK, ABORT and ACKALL handlers.

use crate::call::{Call, CallCompletion, CallDriver, CallError, CallState, SACK_SIZE};
use crate::seq::{Seq, Serial};
use crate::wire::{
    flags, AckReason, JumboHeader, Packet, PacketType, JUMBO_DATALEN, JUMBO_HEADER_LEN,
    JUMBO_SUBPKTLEN, RX_CALL_DEAD, WIRE_HEADER_LEN,
};
use std::sync::atomic::Ordering;

impl<D: CallDriver> Call<D> {
    /// Process one packet belonging to this call.
    pub fn receive(&mut self, pkt: Packet) {
        if pkt.hdr.service_id != self.service_id {
            self.service_id = pkt.hdr.service_id;
        }
        if pkt.hdr.serial.after(self.rx_serial) {
            self.rx_serial = pkt.hdr.serial;
        }

        if self.is_complete() {
            log::trace!("call {} complete, drop {}", self.debug_id, pkt.hdr.serial);
            return;
        }

        self.receive_call_packet(pkt);
    }

    fn receive_call_packet(&mut self, pkt: Packet) {
        // Any traffic restarts the idle clock.
        if let Some(timo) = self.next_rx_timo {
            let now = pkt.tstamp;
            let expect_rx_by = now + timo;
            self.timers.expect_rx_by = Some(expect_rx_by);
            self.driver.reduce_call_timer(expect_rx_by, now);
        }

        match PacketType::from_u8(pkt.hdr.ptype) {
            Some(PacketType::Data) => self.receive_data(pkt),
            Some(PacketType::Ack) => self.receive_ack(pkt),
            Some(PacketType::Busy) => {
                // The retry and lifespan timers take care of business.
                log::trace!("Rx BUSY {}", pkt.hdr.serial);
            }
            Some(PacketType::Abort) => self.receive_abort(pkt),
            Some(PacketType::AckAll) => self.receive_ackall(pkt),
            None => log::trace!("Rx unknown packet type {}", pkt.hdr.ptype),
        }
    }

    /// Process a DATA packet: split jumbograms and run each unit through
    /// the receive window.
    fn receive_data(&mut self, mut pkt: Packet) {
        log::trace!(
            "Rx DATA {} seq={} flags={:02x}",
            pkt.hdr.serial,
            pkt.hdr.seq,
            pkt.hdr.flags
        );

        let state = self.state;

        // In-place decryption needs a privately owned buffer.
        if pkt.hdr.security_index != 0 {
            pkt = match self.driver.unshare(pkt) {
                Some(pkt) => pkt,
                None => return,
            };
        }

        if state == CallState::ServerRecvRequest {
            if let Some(timo) = self.next_req_timo {
                let now = pkt.tstamp;
                let expect_req_by = now + timo;
                self.timers.expect_req_by = Some(expect_req_by);
                self.driver.reduce_call_timer(expect_req_by, now);
            }
        }

        let seq0 = pkt.hdr.seq;

        // Received data implicitly ACKs all of the request packets we
        // sent when we're acting as a client.
        if matches!(
            state,
            CallState::ClientSendRequest | CallState::ClientAwaitReply
        ) && !self.receiving_reply()
        {
            // Call aborted; fall through to the socket notification.
        } else if !self.split_jumbo(pkt) {
            self.proto_abort("VLD", seq0);
        }

        self.driver.notify_socket();
    }

    /// Split a jumbo carrier into per-subpacket views and file each one.
    /// Returns false on a malformed carrier.
    fn split_jumbo(&mut self, mut pkt: Packet) -> bool {
        let mut offset = WIRE_HEADER_LEN;
        let mut len = pkt.datagram_len() - WIRE_HEADER_LEN;

        while pkt.hdr.flags & flags::JUMBO_PACKET != 0 {
            if len < JUMBO_SUBPKTLEN {
                return false;
            }
            if pkt.hdr.flags & flags::LAST_PACKET != 0 {
                return false;
            }
            let jhdr_off = offset + JUMBO_DATALEN;
            let jhdr =
                match JumboHeader::parse(&pkt.datagram()[jhdr_off..jhdr_off + JUMBO_HEADER_LEN]) {
                    Ok(jhdr) => jhdr,
                    Err(_) => return false,
                };

            let sub = pkt.subrange(offset, JUMBO_DATALEN);
            self.receive_data_one(sub);

            // The jumbo header describes the next subpacket.
            pkt.hdr.flags = jhdr.flags;
            pkt.hdr._rsvd = jhdr._rsvd;
            pkt.hdr.seq += 1;
            pkt.hdr.serial += 1;
            offset += JUMBO_SUBPKTLEN;
            len -= JUMBO_SUBPKTLEN;
        }

        pkt.set_view(offset, len);
        self.receive_data_one(pkt);
        true
    }

    /// Run one DATA unit through the receive window.
    fn receive_data_one(&mut self, pkt: Packet) {
        let serial = pkt.hdr.serial;
        let seq = pkt.hdr.seq;
        let is_last = pkt.hdr.flags & flags::LAST_PACKET != 0;
        let is_jumbo = pkt.hdr.flags & flags::JUMBO_PACKET != 0;
        let (mut window, mut wtop) = self.outlook.rx_window();
        let wlimit = window + (self.rx_winsize - 1);

        self.stats.rx_data += 1;
        if pkt.hdr.flags & flags::REQUEST_ACK != 0 {
            self.stats.rx_data_reqack += 1;
        }
        if is_jumbo {
            self.stats.rx_data_jumbo += 1;
        }

        if is_last {
            // Only one seq may carry the LAST flag, and it must stay at
            // the top of the window.
            if self.outlook.flags.rx_last.swap(true, Ordering::AcqRel) && seq + 1 != wtop {
                self.proto_abort("LSN", seq);
                return;
            }
        } else if self.outlook.flags.rx_last.load(Ordering::Acquire) && seq.after_eq(wtop) {
            log::warn!(
                "call {} packet beyond last: seq={} window={}-{} wlimit={}",
                self.debug_id,
                seq,
                window,
                wtop,
                wlimit
            );
            self.proto_abort("LSA", seq);
            return;
        }

        if seq.after(self.rx_highest_seq) {
            self.rx_highest_seq = seq;
        }

        if is_jumbo && self.nr_jumbo_bad > 3 {
            // Tell the peer we take no more jumbograms on this call.
            self.finish_data(Some(AckReason::NoSpace), serial);
            return;
        }

        if seq.before(window) {
            self.finish_data(Some(AckReason::Duplicate), serial);
            return;
        }
        if seq.after(wlimit) {
            self.finish_data(Some(AckReason::ExceedsWindow), serial);
            return;
        }

        if seq == window {
            let ack_reason = if pkt.hdr.flags & flags::REQUEST_ACK != 0 {
                Some(AckReason::Requested)
            } else if !self.rx_oos_queue.is_empty() {
                // Send an immediate ACK if we fill in a hole.
                Some(AckReason::Delay)
            } else {
                self.ackr_nr_unacked += 1;
                None
            };

            window += 1;
            if window.after(wtop) {
                wtop = window;
            }

            self.queue_rx(pkt, window, wtop, false);

            // Drain now-contiguous packets from the holding area.
            let mut reset_from: Option<Seq> = None;
            while let Some(head) = self.rx_oos_queue.front() {
                if head.hdr.seq.after(window) {
                    break;
                }
                let oos = self.rx_oos_queue.pop_front().expect("peeked entry");
                if reset_from.is_none() {
                    reset_from = Some(oos.hdr.seq);
                }
                window += 1;
                self.queue_rx(oos, window, wtop, true);
            }

            // Sweep the SACK bits the window just passed.
            if let Some(mut from) = reset_from {
                while from.before(window) {
                    self.sack_table[from.0 as usize % SACK_SIZE] = 0;
                    from += 1;
                }
            }

            self.finish_data(ack_reason, serial);
        } else {
            // Out of order, inside the window.
            let idx = seq.0 as usize % SACK_SIZE;
            let fresh = self.sack_table[idx] == 0;
            if fresh {
                self.sack_table[idx] = 1;
            }

            if (seq + 1).after(wtop) {
                wtop = seq + 1;
                self.outlook.set_rx_window(window, wtop);
            }

            if !fresh {
                self.receive_dup_data(seq, is_jumbo);
                self.finish_data(Some(AckReason::Duplicate), serial);
                return;
            }

            let pos = self
                .rx_oos_queue
                .iter()
                .position(|p| p.hdr.seq.after(seq))
                .unwrap_or(self.rx_oos_queue.len());
            log::trace!("call {} oos seq={} serial={}", self.debug_id, seq, serial);
            self.rx_oos_queue.insert(pos, pkt);

            self.finish_data(Some(AckReason::OutOfSequence), serial);
        }
    }

    /// Deliver a packet to the in-order queue and publish the window
    /// behind it.
    fn queue_rx(&mut self, pkt: Packet, window: Seq, wtop: Seq, from_oos: bool) {
        log::trace!(
            "call {} queue{} seq={} serial={}",
            self.debug_id,
            if from_oos { " oos" } else { "" },
            pkt.hdr.seq,
            pkt.hdr.serial
        );
        self.rx_queue.push_back(pkt);
        self.outlook.set_rx_window(window, wtop);
    }

    /// Out-of-sequence duplicate accounting. Only duplicates whose
    /// carrier is a jumbogram count toward the per-call budget; past
    /// three the call refuses further jumbograms.
    fn receive_dup_data(&mut self, seq: Seq, is_jumbo: bool) {
        if !is_jumbo {
            return;
        }
        self.nr_jumbo_bad += 1;
        log::debug!(
            "call {} duplicate jumbo data seq={} ({} bad)",
            self.debug_id,
            seq,
            self.nr_jumbo_bad
        );
    }

    /// Emit the ACK a DATA unit earned, or fall back to a delayed one.
    fn finish_data(&mut self, reason: Option<AckReason>, serial: Serial) {
        match reason {
            Some(reason) => self.driver.send_ack(reason, serial),
            None => {
                self.ackr_proposed = Some(AckReason::Delay);
                self.driver.propose_delay_ack(serial);
            }
        }
    }

    /// Process a received ABORT: the peer gave up on the call.
    fn receive_abort(&mut self, pkt: Packet) {
        let payload = pkt.payload();
        let abort_code = if payload.len() >= 4 {
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
        } else {
            RX_CALL_DEAD
        };
        log::trace!("Rx ABORT {} code={:#x}", pkt.hdr.serial, abort_code);

        self.set_completion(CallCompletion::RemotelyAborted {
            abort_code,
            error: CallError::ConnectionAborted,
        });
    }

    /// A packet for a newer call arrived on this call's channel: the
    /// peer has moved on, so terminate this call (server side only).
    pub fn implicit_end_call(&mut self, pkt: Packet) {
        if self.is_complete() {
            return;
        }

        self.outlook.flags.is_dead.store(true, Ordering::Release);

        // Present the packet to the call we're terminating to make sure
        // it gets flushed out.
        self.receive(pkt);

        match self.state {
            CallState::ServerAwaitAck => self.completed(),
            CallState::Complete => {}
            state => {
                log::debug!("call {} improper termination in {:?}", self.debug_id, state);
                if self.abort_call("IMP", Seq(0), RX_CALL_DEAD, CallError::Shutdown) {
                    self.driver.send_abort(RX_CALL_DEAD);
                }
            }
        }

        self.driver.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::RX_WINSIZE_DEFAULT;
    use crate::testutil::{
        client_call, data_packet, jumbo_packet, packet_from, server_call, Emitted, MockDriver,
    };
    use crate::wire::RX_PROTOCOL_ERROR;
    use std::time::Duration;

    fn rx_window(call: &Call<MockDriver>) -> (Seq, Seq) {
        call.outlook().rx_window()
    }

    #[test]
    fn in_order_stream_with_last_packet() {
        let mut call = server_call();
        for seq in 1..=4u32 {
            let f = if seq == 4 { flags::LAST_PACKET } else { 0 };
            call.receive(data_packet(seq, seq, f, b"payload"));
        }

        assert_eq!(rx_window(&call), (Seq(5), Seq(5)));
        assert!(call.outlook().flags.rx_last.load(Ordering::Acquire));
        assert_eq!(call.rx_highest_seq(), Seq(4));
        assert_eq!(call.stats().rx_data, 4);

        let mut seqs = Vec::new();
        while let Some(pkt) = call.dequeue_rx() {
            seqs.push(pkt.hdr.seq.0);
        }
        assert_eq!(seqs, vec![1, 2, 3, 4]);

        // Nothing demanded an immediate ACK; all four proposed delays.
        assert_eq!(call.unacked_packets(), 4);
        assert_eq!(
            call.driver()
                .events
                .iter()
                .filter(|e| matches!(e, Emitted::DelayAck { .. }))
                .count(),
            4
        );
    }

    #[test]
    fn hole_fill_drains_the_oos_queue_and_sacks() {
        let mut call = server_call();
        call.receive(data_packet(1, 1, 0, b"a"));
        assert_eq!(rx_window(&call), (Seq(2), Seq(2)));

        call.receive(data_packet(3, 2, 0, b"c"));
        assert_eq!(rx_window(&call), (Seq(2), Seq(4)));
        assert_eq!(call.sack_table[3], 1);
        assert!(call
            .driver()
            .events
            .contains(&Emitted::Ack { reason: AckReason::OutOfSequence, serial: Serial(2) }));

        call.receive(data_packet(4, 3, 0, b"d"));
        assert_eq!(rx_window(&call), (Seq(2), Seq(5)));
        assert_eq!(call.sack_table[4], 1);
        assert_eq!(call.rx_oos_queue.len(), 2);

        // Filling the hole drains everything and clears the SACK bits.
        call.receive(data_packet(2, 4, 0, b"b"));
        assert_eq!(rx_window(&call), (Seq(5), Seq(5)));
        assert!(call.rx_oos_queue.is_empty());
        assert_eq!(call.sack_table[2], 0);
        assert_eq!(call.sack_table[3], 0);
        assert_eq!(call.sack_table[4], 0);
        assert!(call
            .driver()
            .events
            .contains(&Emitted::Ack { reason: AckReason::Delay, serial: Serial(4) }));

        let mut seqs = Vec::new();
        while let Some(pkt) = call.dequeue_rx() {
            seqs.push(pkt.hdr.seq.0);
        }
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn shuffled_arrival_still_delivers_in_order() {
        use rand::seq::SliceRandom;

        let mut order: Vec<u32> = (1..=20).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut call = server_call();
        for (serial, &seq) in order.iter().enumerate() {
            call.receive(data_packet(seq, serial as u32 + 1, 0, b"x"));
        }

        assert_eq!(rx_window(&call), (Seq(21), Seq(21)));
        let mut seqs = Vec::new();
        while let Some(pkt) = call.dequeue_rx() {
            seqs.push(pkt.hdr.seq.0);
        }
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
        assert_eq!(seqs.len(), 20);
        assert!(call.sack_table.iter().all(|&b| b == 0));
    }

    #[test]
    fn request_ack_flag_earns_an_immediate_ack() {
        let mut call = server_call();
        call.receive(data_packet(1, 9, flags::REQUEST_ACK, b"a"));
        assert!(call
            .driver()
            .events
            .contains(&Emitted::Ack { reason: AckReason::Requested, serial: Serial(9) }));
        assert_eq!(call.stats().rx_data_reqack, 1);
    }

    #[test]
    fn duplicate_below_window_is_acked_duplicate() {
        let mut call = server_call();
        call.receive(data_packet(2, 1, 0, b"x")); // oos
        call.receive(data_packet(1, 2, 0, b"x"));
        assert_eq!(rx_window(&call), (Seq(3), Seq(3)));

        call.receive(data_packet(2, 3, 0, b"x"));
        assert!(call
            .driver()
            .events
            .contains(&Emitted::Ack { reason: AckReason::Duplicate, serial: Serial(3) }));
        assert_eq!(call.nr_jumbo_bad, 0);
        assert_eq!(rx_window(&call), (Seq(3), Seq(3)));
    }

    #[test]
    fn beyond_window_is_refused() {
        let mut call = server_call();
        let beyond = RX_WINSIZE_DEFAULT + 1;
        call.receive(data_packet(beyond, 1, 0, b"x"));
        assert!(call
            .driver()
            .events
            .contains(&Emitted::Ack { reason: AckReason::ExceedsWindow, serial: Serial(1) }));
        assert_eq!(rx_window(&call), (Seq(1), Seq(1)));
        assert!(call.dequeue_rx().is_none());
    }

    #[test]
    fn oos_duplicate_in_jumbo_counts_toward_the_budget() {
        let mut call = server_call();
        // Two-segment jumbo at seq 3/4 while the window still expects 1:
        // both subpackets are out of order; a second copy duplicates
        // them inside a jumbo carrier.
        call.receive(jumbo_packet(3, 10, 2, 0));
        assert_eq!(call.nr_jumbo_bad, 0);
        call.receive(jumbo_packet(3, 12, 2, 0));
        // Only the leading subpacket still carries the jumbo flag.
        assert_eq!(call.nr_jumbo_bad, 1);
    }

    #[test]
    fn too_many_bad_jumbos_stop_jumbo_acceptance() {
        let mut call = server_call();
        // One out-of-order jumbo, then four duplicate copies of it.
        for serial in 0..5u32 {
            call.receive(jumbo_packet(3, 10 + serial, 2, 0));
        }
        assert_eq!(call.nr_jumbo_bad, 4);

        // The budget is blown: the next jumbo's leading subpacket is
        // refused outright with NOSPACE and nothing gets queued.
        call.receive(jumbo_packet(5, 20, 2, 0));
        assert!(call
            .driver()
            .events
            .contains(&Emitted::Ack { reason: AckReason::NoSpace, serial: Serial(20) }));
        assert_eq!(call.sack_table[5], 0);
        assert!(call.dequeue_rx().is_none());
    }

    #[test]
    fn second_last_packet_with_other_seq_aborts() {
        let mut call = server_call();
        call.receive(data_packet(1, 1, 0, b"a"));
        call.receive(data_packet(2, 2, flags::LAST_PACKET, b"b"));
        call.receive(data_packet(4, 3, flags::LAST_PACKET, b"d"));
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
    fn data_past_the_last_packet_aborts() {
        let mut call = server_call();
        call.receive(data_packet(1, 1, 0, b"a"));
        call.receive(data_packet(2, 2, flags::LAST_PACKET, b"b"));
        call.receive(data_packet(5, 3, 0, b"x"));
        assert_eq!(
            call.completion(),
            Some(CallCompletion::LocallyAborted {
                abort_code: RX_PROTOCOL_ERROR,
                error: CallError::BadMessage,
            })
        );
    }

    #[test]
    fn jumbo_splits_into_sequential_subpackets() {
        let mut call = server_call();
        call.receive(jumbo_packet(1, 7, 3, 0));

        assert_eq!(rx_window(&call), (Seq(4), Seq(4)));
        let first = call.dequeue_rx().unwrap();
        assert_eq!(first.hdr.seq, Seq(1));
        assert_eq!(first.hdr.serial, Serial(7));
        assert_eq!(first.payload().len(), JUMBO_DATALEN);
        let second = call.dequeue_rx().unwrap();
        assert_eq!(second.hdr.seq, Seq(2));
        assert_eq!(second.hdr.serial, Serial(8));
        let third = call.dequeue_rx().unwrap();
        assert_eq!(third.hdr.seq, Seq(3));
        assert_eq!(third.hdr.serial, Serial(9));
        assert_ne!(third.payload().len(), JUMBO_DATALEN);
        assert_eq!(call.stats().rx_data_jumbo, 2);
    }

    #[test]
    fn jumbo_with_last_flag_mid_carrier_aborts() {
        let mut call = server_call();
        let mut pkt = jumbo_packet(1, 7, 2, 0);
        pkt.hdr.flags |= flags::LAST_PACKET;
        call.receive(pkt);
        assert_eq!(
            call.completion(),
            Some(CallCompletion::LocallyAborted {
                abort_code: RX_PROTOCOL_ERROR,
                error: CallError::BadMessage,
            })
        );
    }

    #[test]
    fn truncated_jumbo_aborts() {
        let mut call = server_call();
        let mut hdr = data_packet(1, 1, 0, b"").hdr;
        hdr.flags = flags::JUMBO_PACKET;
        let pkt = packet_from(hdr, &vec![0u8; JUMBO_SUBPKTLEN - 1]);
        call.receive(pkt);
        assert_eq!(
            call.completion(),
            Some(CallCompletion::LocallyAborted {
                abort_code: RX_PROTOCOL_ERROR,
                error: CallError::BadMessage,
            })
        );
    }

    #[test]
    fn first_reply_data_ends_the_client_tx_phase() {
        let mut call = client_call();
        call.queue_tx(false);
        call.queue_tx(true);

        call.receive(data_packet(1, 1, 0, b"reply"));
        assert_eq!(call.state(), CallState::ClientRecvReply);
        assert_eq!(call.hard_ack(), Seq(2));
        assert_eq!(rx_window(&call), (Seq(2), Seq(2)));
        assert!(call.driver().events.contains(&Emitted::NotifySocket));
    }

    #[test]
    fn reply_data_with_nothing_sent_aborts_but_notifies() {
        let mut call = client_call();
        call.receive(data_packet(1, 1, 0, b"reply"));
        assert!(call.is_complete());
        assert!(call.driver().events.contains(&Emitted::NotifySocket));
        // The reply itself was not queued.
        assert!(call.dequeue_rx().is_none());
    }

    #[test]
    fn abort_packet_completes_remotely_aborted() {
        let mut call = server_call();
        let code = 17u32;
        call.receive(crate::testutil::abort_packet(3, code));
        assert_eq!(
            call.completion(),
            Some(CallCompletion::RemotelyAborted {
                abort_code: code,
                error: CallError::ConnectionAborted,
            })
        );
    }

    #[test]
    fn short_abort_body_defaults_to_call_dead() {
        let mut call = server_call();
        let mut hdr = data_packet(0, 3, 0, b"").hdr;
        hdr.ptype = PacketType::Abort.to_u8();
        call.receive(packet_from(hdr, &[0u8; 2]));
        assert_eq!(
            call.completion(),
            Some(CallCompletion::RemotelyAborted {
                abort_code: RX_CALL_DEAD,
                error: CallError::ConnectionAborted,
            })
        );
    }

    #[test]
    fn packets_after_completion_are_dropped() {
        let mut call = server_call();
        call.receive(crate::testutil::abort_packet(1, 1));
        assert!(call.is_complete());

        let events_before = call.driver().events.len();
        call.receive(data_packet(1, 2, 0, b"late"));
        assert_eq!(call.driver().events.len(), events_before);
        assert!(call.dequeue_rx().is_none());
        assert_eq!(call.stats().rx_data, 0);
    }

    #[test]
    fn busy_packets_are_ignored() {
        let mut call = client_call();
        let mut hdr = data_packet(0, 4, 0, b"").hdr;
        hdr.ptype = PacketType::Busy.to_u8();
        call.receive(packet_from(hdr, &[]));
        assert!(call.driver().events.is_empty());
        assert_eq!(call.state(), CallState::ClientSendRequest);
    }

    #[test]
    fn any_packet_rearms_the_idle_timer() {
        let mut call = server_call();
        call.set_next_rx_timeout(Some(Duration::from_secs(20)));
        call.receive(data_packet(1, 1, 0, b"a"));
        assert!(call.timers.expect_rx_by.is_some());
        assert!(call.driver().events.contains(&Emitted::TimerSet));
    }

    #[test]
    fn request_data_rearms_the_request_timer() {
        let mut call = server_call();
        call.set_next_req_timeout(Some(Duration::from_secs(1)));
        call.receive(data_packet(1, 1, 0, b"a"));
        assert!(call.timers.expect_req_by.is_some());
    }

    #[test]
    fn newer_serial_and_service_id_are_adopted() {
        let mut call = server_call();
        call.receive(data_packet(1, 10, 0, b"a"));
        assert_eq!(call.rx_serial, Serial(10));
        assert_eq!(call.service_id(), 2034);
        // An older serial does not regress the high-water mark.
        call.receive(data_packet(2, 5, 0, b"b"));
        assert_eq!(call.rx_serial, Serial(10));
    }

    #[test]
    fn security_index_routes_through_unshare() {
        let mut call = server_call();
        let mut hdr = data_packet(1, 1, 0, b"").hdr;
        hdr.security_index = 2;
        call.receive(packet_from(hdr, b"ciphertext"));
        assert_eq!(call.driver().unshared, 1);
        // The packet was still delivered after unsharing.
        assert_eq!(rx_window(&call).0, Seq(2));
    }

    #[test]
    fn implicit_end_completes_a_server_call_awaiting_ack() {
        let mut call = server_call();
        call.state = CallState::ServerAwaitAck;
        call.queue_tx(true);
        call.implicit_end_call(data_packet(1, 50, 0, b"new call"));
        assert_eq!(call.completion(), Some(CallCompletion::Succeeded));
        assert!(call.outlook().flags.is_dead.load(Ordering::Acquire));
        assert!(call.driver().events.contains(&Emitted::Disconnect));
    }

    #[test]
    fn implicit_end_aborts_an_unfinished_server_call() {
        let mut call = server_call();
        call.state = CallState::ServerSendReply;
        call.implicit_end_call(data_packet(1, 50, 0, b"new call"));
        assert_eq!(
            call.completion(),
            Some(CallCompletion::LocallyAborted {
                abort_code: RX_CALL_DEAD,
                error: CallError::Shutdown,
            })
        );
        assert!(call.driver().events.contains(&Emitted::Abort { code: RX_CALL_DEAD }));
        assert!(call.driver().events.contains(&Emitted::Disconnect));
    }
}
