//! TCP-style congestion management over the transmit window [RFC 5681].
//!
//! Driven once per processed ACK with a summary of what the ACK conveyed.
//! The congestion window is published through the call outlook for the
//! transmit worker; retransmission is signalled through the driver.

use crate::call::{initial_cwnd, Call, CallDriver, TX_MAX_WINDOW};
use crate::seq::Serial;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Congestion control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestMode {
    SlowStart,
    CongestAvoidance,
    PacketLoss,
    FastRetransmit,
}

/// What one ACK told us, accumulated across rotation and soft-ACK
/// decoding.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct AckSummary {
    /// Soft-ACK bytes that were positive acknowledgements.
    pub nr_acks: u32,
    pub nr_new_acks: u32,
    /// Buffers newly retired by hard-ack rotation.
    pub nr_rot_new_acks: u32,
    pub saw_nacks: bool,
    /// The lowest NAK moved forward: the peer made progress.
    pub new_low_nack: bool,
    pub retrans_timeo: bool,
    pub flight_size: u32,
}

impl<D: CallDriver> Call<D> {
    /// Run the congestion state machine for one ACK received at `at`.
    pub(crate) fn congestion_management(
        &mut self,
        at: Instant,
        summary: &mut AckSummary,
        acked_serial: Serial,
    ) {
        let mut cwnd = self.outlook.cwnd();
        let mut cumulative_acks = self.cong_cumul_acks as u32;
        let mut resend = false;
        let mut keep_cumulative = false;

        summary.flight_size = self
            .tx_top
            .sub(self.hard_ack())
            .saturating_sub(summary.nr_acks);

        if self
            .outlook
            .flags
            .retrans_timeout
            .swap(false, Ordering::AcqRel)
        {
            summary.retrans_timeo = true;
            self.cong_ssthresh = (summary.flight_size / 2).max(2);
            cwnd = 1;
            if cwnd >= self.cong_ssthresh && self.cong_mode == CongestMode::SlowStart {
                self.cong_mode = CongestMode::CongestAvoidance;
                self.cong_tstamp = at;
                cumulative_acks = 0;
            }
        }

        cumulative_acks += summary.nr_new_acks + summary.nr_rot_new_acks;
        if cumulative_acks > 255 {
            cumulative_acks = 255;
        }

        // Nothing transmitted for more than one SRTT: the window no
        // longer reflects the path, start over.
        if matches!(
            self.cong_mode,
            CongestMode::SlowStart | CongestMode::CongestAvoidance
        ) && self.peer.rtt_count() > 0
            && at > self.tx_last_sent + self.peer.srtt()
        {
            log::debug!("call {} congestion idle reset", self.debug_id);
            self.cong_mode = CongestMode::SlowStart;
            cwnd = initial_cwnd();
        }

        match self.cong_mode {
            CongestMode::SlowStart => {
                if summary.saw_nacks {
                    self.packet_loss_detected(summary);
                    keep_cumulative = true;
                } else {
                    if cumulative_acks > 0 {
                        cwnd += 1;
                    }
                    if cwnd >= self.cong_ssthresh {
                        self.cong_mode = CongestMode::CongestAvoidance;
                        self.cong_tstamp = at;
                    }
                }
            }

            CongestMode::CongestAvoidance => {
                if summary.saw_nacks {
                    self.packet_loss_detected(summary);
                    keep_cumulative = true;
                } else if self.peer.rtt_count() == 0 {
                    // No RTT samples yet; leave the window alone.
                } else if at < self.cong_tstamp + self.peer.srtt() {
                    keep_cumulative = true;
                } else {
                    // One RTT period filled; grow if the window was used.
                    self.cong_tstamp = at;
                    if cumulative_acks >= cwnd {
                        cwnd += 1;
                    }
                }
            }

            CongestMode::PacketLoss => {
                if !summary.saw_nacks {
                    self.resume_normality(cwnd, at);
                } else if summary.new_low_nack {
                    self.cong_dup_acks = 1;
                    self.outlook.clamp_cong_extra(1);
                    self.send_extra_data(summary);
                    keep_cumulative = true;
                } else {
                    self.cong_dup_acks = self.cong_dup_acks.saturating_add(1);
                    if self.cong_dup_acks < 3 {
                        self.send_extra_data(summary);
                        keep_cumulative = true;
                    } else {
                        log::debug!("call {} begin fast retransmission", self.debug_id);
                        self.cong_mode = CongestMode::FastRetransmit;
                        self.cong_ssthresh = (summary.flight_size / 2).max(2);
                        cwnd = self.cong_ssthresh + 3;
                        self.outlook.clear_cong_extra();
                        self.cong_dup_acks = 0;
                        resend = true;
                    }
                }
            }

            CongestMode::FastRetransmit => {
                if !summary.new_low_nack {
                    if summary.nr_new_acks == 0 {
                        cwnd += 1;
                    }
                    self.cong_dup_acks = self.cong_dup_acks.saturating_add(1);
                    if self.cong_dup_acks == 2 {
                        log::debug!("call {} retransmit again", self.debug_id);
                        self.cong_dup_acks = 0;
                        resend = true;
                    }
                } else {
                    cwnd = self.cong_ssthresh;
                    if !summary.saw_nacks {
                        self.resume_normality(cwnd, at);
                    }
                }
            }
        }

        if !keep_cumulative {
            cumulative_acks = 0;
        }
        if cwnd > TX_MAX_WINDOW {
            cwnd = TX_MAX_WINDOW;
        }
        self.outlook.set_cwnd(cwnd);
        self.cong_cumul_acks = cumulative_acks.min(255) as u8;
        log::trace!(
            "call {} congest mode={:?} cwnd={} ssthresh={} cumul={} dup={} acked={}",
            self.debug_id,
            self.cong_mode,
            cwnd,
            self.cong_ssthresh,
            cumulative_acks,
            self.cong_dup_acks,
            acked_serial
        );
        if resend {
            self.driver.resend();
        }
    }

    fn packet_loss_detected(&mut self, summary: &AckSummary) {
        log::debug!("call {} saw nacks, packet loss", self.debug_id);
        self.cong_mode = CongestMode::PacketLoss;
        self.cong_dup_acks = 0;
        self.send_extra_data(summary);
    }

    fn resume_normality(&mut self, cwnd: u32, at: Instant) {
        log::debug!("call {} nacks cleared", self.debug_id);
        self.cong_dup_acks = 0;
        self.outlook.clear_cong_extra();
        self.cong_tstamp = at;
        self.cong_mode = if cwnd < self.cong_ssthresh {
            CongestMode::SlowStart
        } else {
            CongestMode::CongestAvoidance
        };
    }

    /// Let the transmit worker push some previously unsent DATA to
    /// advance the peer's ACK state.
    fn send_extra_data(&mut self, summary: &AckSummary) {
        if self.outlook.flags.tx_last.load(Ordering::Acquire)
            || summary.nr_acks != self.tx_top.sub(self.hard_ack())
        {
            self.outlook.bump_cong_extra();
            self.driver.wake_tx();
        }
    }
}
