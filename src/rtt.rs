//! RTT probe tracking.
//!
//! The transmit side arms a probe when it sends a packet whose ACK will
//! carry the packet's serial back (a PING or a REQUEST_ACK DATA). The
//! receive side matches the acked serial against the ring and feeds the
//! measured sample to the peer. A slot is a small typed state machine:
//! free, or holding a pending probe.

use crate::call::{Call, CallDriver};
use crate::peer::Peer;
use crate::seq::Serial;
use std::time::Instant;

/// Number of probes that can be outstanding at once.
pub(crate) const RTT_RING_SIZE: usize = 4;

#[derive(Debug, Clone, Copy)]
pub(crate) enum RttSlot {
    Free,
    Pending { serial: Serial, sent_at: Instant },
}

/// What kind of ACK is completing (or cancelling) a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RttRx {
    PingResponse,
    RequestedAck,
    /// The acked serial arrived on an ACK reason that does not time the
    /// path; the probe is retired without a sample.
    Cancel,
}

#[derive(Debug)]
pub(crate) struct RttRing {
    slots: [RttSlot; RTT_RING_SIZE],
}

impl RttRing {
    pub(crate) fn new() -> Self {
        Self {
            slots: [RttSlot::Free; RTT_RING_SIZE],
        }
    }

    /// Claim a free slot for a probe. Returns false if all slots hold
    /// pending probes.
    pub(crate) fn arm(&mut self, serial: Serial, sent_at: Instant) -> bool {
        for slot in self.slots.iter_mut() {
            if matches!(slot, RttSlot::Free) {
                *slot = RttSlot::Pending { serial, sent_at };
                return true;
            }
        }
        false
    }

    pub(crate) fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, RttSlot::Pending { .. }))
            .count()
    }

    /// Match `acked_serial` against the pending probes. The matching
    /// probe is completed (sampled into `peer` unless `why` is a
    /// cancellation); probes older than `acked_serial` are retired as
    /// obsolete without a sample. Returns whether a probe matched.
    fn complete(
        &mut self,
        resp_time: Instant,
        acked_serial: Serial,
        why: RttRx,
        peer: &Peer,
    ) -> bool {
        let mut matched = false;

        for slot in self.slots.iter_mut() {
            let RttSlot::Pending { serial, sent_at } = *slot else {
                continue;
            };

            if serial == acked_serial {
                *slot = RttSlot::Free;
                if why == RttRx::Cancel {
                    log::trace!("rtt probe {} cancelled", serial);
                } else {
                    let sample = resp_time.saturating_duration_since(sent_at);
                    log::trace!("rtt probe {} done ({:?}): {:?}", serial, why, sample);
                    peer.add_rtt(sample);
                }
                matched = true;
            } else if acked_serial.after(serial) {
                log::trace!("rtt probe {} obsoleted by {}", serial, acked_serial);
                *slot = RttSlot::Free;
            }
        }

        matched
    }
}

impl<D: CallDriver> Call<D> {
    /// Complete, cancel, or retire RTT probes against an acked serial.
    pub(crate) fn complete_rtt_probe(
        &mut self,
        resp_time: Instant,
        acked_serial: Serial,
        why: RttRx,
    ) {
        if !self.rtt.complete(resp_time, acked_serial, why, &self.peer) {
            log::trace!("rtt: no probe matches serial {}", acked_serial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::client_call;
    use std::time::Duration;

    #[test]
    fn matched_probe_feeds_the_peer() {
        let mut call = client_call();
        let t0 = Instant::now();
        assert!(call.note_rtt_probe(Serial(100), t0));
        assert_eq!(call.rtt.pending(), 1);

        call.complete_rtt_probe(t0 + Duration::from_millis(40), Serial(100), RttRx::PingResponse);
        assert_eq!(call.rtt.pending(), 0);
        assert_eq!(call.peer().rtt_count(), 1);
        assert_eq!(call.peer().srtt(), Duration::from_millis(40));
    }

    #[test]
    fn cancelled_probe_frees_slot_without_sample() {
        let mut call = client_call();
        let t0 = Instant::now();
        call.note_rtt_probe(Serial(7), t0);
        call.complete_rtt_probe(t0 + Duration::from_millis(10), Serial(7), RttRx::Cancel);
        assert_eq!(call.rtt.pending(), 0);
        assert_eq!(call.peer().rtt_count(), 0);
    }

    #[test]
    fn older_probes_are_retired_as_obsolete() {
        let mut call = client_call();
        let t0 = Instant::now();
        call.note_rtt_probe(Serial(5), t0);
        call.note_rtt_probe(Serial(9), t0);

        // Serial 9 answered; serial 5 will never be, free its slot too.
        call.complete_rtt_probe(t0 + Duration::from_millis(25), Serial(9), RttRx::RequestedAck);
        assert_eq!(call.rtt.pending(), 0);
        assert_eq!(call.peer().rtt_count(), 1);
    }

    #[test]
    fn unmatched_serial_leaves_newer_probes_pending() {
        let mut call = client_call();
        let t0 = Instant::now();
        call.note_rtt_probe(Serial(20), t0);
        call.complete_rtt_probe(t0, Serial(10), RttRx::PingResponse);
        assert_eq!(call.rtt.pending(), 1);
        assert_eq!(call.peer().rtt_count(), 0);
    }

    #[test]
    fn ring_holds_a_bounded_number_of_probes() {
        let mut call = client_call();
        let t0 = Instant::now();
        for i in 0..RTT_RING_SIZE {
            assert!(call.note_rtt_probe(Serial(i as u32 + 1), t0));
        }
        assert!(!call.note_rtt_probe(Serial(99), t0));
    }
}
