// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP member bookkeeping: one [`Member`] per sender a session currently
//! knows about (spec.md §3, "RTP member"). Sequence/jitter tracking follows
//! [RFC 3550 Appendix A.1], as the original `rtp_update_seq` does (see
//! `SPEC_FULL.md` §3).
//!
//! [RFC 3550 Appendix A.1]: https://datatracker.ietf.org/doc/html/rfc3550#appendix-A.1

use std::net::SocketAddr;
use std::time::Instant;

const RTP_SEQ_MOD: u32 = 1 << 16;
const MAX_DROPOUT: i32 = 3000;
const MAX_MISORDER: i32 = 100;
const MIN_SEQUENTIAL: u32 = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemberKind {
    /// A primary- or repair-session RTP data source.
    RtpData,
    /// A member known only from RTCP (e.g. a CSRC seen in SDES before any
    /// RTP packet arrived).
    RtcpOnly,
}

/// XR statistics snapshot, standard and post-error-repair variants
/// (spec.md §3, "optional pointers to XR statistics").
#[derive(Copy, Clone, Debug, Default)]
pub struct XrStats {
    pub cum_loss: u32,
    pub fraction_loss: u8,
    pub jitter: u32,
}

/// `(type, subtype, ssrc, src_addr, src_port, cname)` plus per-sender
/// statistics (spec.md §3, "RTP member").
pub struct Member {
    pub kind: MemberKind,
    pub ssrc: u32,
    pub addr: SocketAddr,
    pub cname: String,

    pub received: u64,
    pub cycles: u32,
    pub max_seq: u16,
    pub base_seq: u32,
    pub bad_seq: u32,
    pub transit: i32,
    pub jitter: f64,
    pub seqjumps: u32,
    pub initseq_count: u32,
    pub out_of_order: u64,
    pub last_arrival: Option<Instant>,

    pub xr: Option<XrStats>,
    pub xr_post_er: Option<XrStats>,

    probation: u32,
}

impl Member {
    /// `new_data_source`/upcall-triggered member creation: seeds sequence
    /// tracking from the first observed sequence number per RFC 3550
    /// §A.1's `init_seq`.
    pub fn new(kind: MemberKind, ssrc: u32, addr: SocketAddr, cname: String, seq: u16) -> Self {
        let mut m = Self {
            kind,
            ssrc,
            addr,
            cname,
            received: 0,
            cycles: 0,
            max_seq: seq,
            base_seq: u32::from(seq),
            bad_seq: RTP_SEQ_MOD + 1,
            transit: 0,
            jitter: 0.0,
            seqjumps: 0,
            initseq_count: 1,
            out_of_order: 0,
            last_arrival: None,
            xr: None,
            xr_post_er: None,
            probation: MIN_SEQUENTIAL,
        };
        m.received = 1;
        m
    }

    fn init_seq(&mut self, seq: u16) {
        self.base_seq = u32::from(seq);
        self.max_seq = seq;
        self.bad_seq = RTP_SEQ_MOD + 1;
        self.cycles = 0;
        self.received = 0;
        self.received += 1;
    }

    /// RFC 3550 Appendix A.1 `update_seq`, extended with the
    /// out-of-order/seqjump counters spec.md's member fields name.
    /// Returns `true` if the packet should be counted as received (i.e. is
    /// not a probationary misorder that got rejected).
    pub fn update_seq(&mut self, seq: u16) -> bool {
        let udelta = seq.wrapping_sub(self.max_seq);
        if self.probation > 0 {
            if seq == self.max_seq.wrapping_add(1) {
                self.probation -= 1;
                self.max_seq = seq;
                if self.probation == 0 {
                    self.init_seq(seq);
                    return true;
                }
            } else {
                self.probation = MIN_SEQUENTIAL - 1;
                self.max_seq = seq;
            }
            self.received += 1;
            return true;
        }
        if u32::from(udelta) < MAX_DROPOUT as u32 {
            if u32::from(seq) < u32::from(self.max_seq) {
                // Sequence number wrapped.
                self.cycles += 1;
            }
            self.max_seq = seq;
        } else if u32::from(udelta) <= (RTP_SEQ_MOD - MAX_MISORDER as u32) {
            // Bad sequence jump. Accept it only after seeing it twice in a
            // row, per RFC 3550 Appendix A.1.
            self.out_of_order += 1;
            if u32::from(seq) == self.bad_seq {
                self.seqjumps += 1;
                self.init_seq(seq);
            } else {
                self.bad_seq = (u32::from(seq).wrapping_add(1)) & (RTP_SEQ_MOD - 1);
                return false;
            }
        } else {
            // Duplicate or misordered within the acceptable window.
            self.out_of_order += 1;
        }
        self.received += 1;
        true
    }

    /// RFC 3550 §A.8 `update_jitter`: interarrival jitter estimate, updated
    /// in 1/16 fractional steps.
    pub fn update_jitter(&mut self, transit: i32) {
        let d = (transit - self.transit).abs() as f64;
        self.transit = transit;
        self.jitter += (d - self.jitter) / 16.0;
    }

    /// The extended highest sequence number received: `cycles << 16 | max_seq`.
    pub fn extended_max_seq(&self) -> u32 {
        (self.cycles << 16) | u32::from(self.max_seq)
    }

    /// Expected packet count since `base_seq`, used to compute loss
    /// fraction for receiver reports.
    pub fn expected(&self) -> u32 {
        self.extended_max_seq().wrapping_sub(self.base_seq).wrapping_add(1)
    }

    pub fn lost(&self) -> i64 {
        i64::from(self.expected()) - self.received as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5000)
    }

    #[test]
    fn sequential_packets_accumulate() {
        let mut m = Member::new(MemberKind::RtpData, 1, addr(), "c".into(), 100);
        assert!(m.update_seq(101));
        assert!(m.update_seq(102));
        assert_eq!(m.max_seq, 102);
        assert_eq!(m.cycles, 0);
    }

    #[test]
    fn wraparound_increments_cycles() {
        let mut m = Member::new(MemberKind::RtpData, 1, addr(), "c".into(), 0xFFFE);
        m.probation = 0;
        assert!(m.update_seq(0xFFFF));
        assert!(m.update_seq(0x0000));
        assert_eq!(m.cycles, 1);
        assert_eq!(m.extended_max_seq(), 0x1_0000);
    }

    #[test]
    fn large_jump_requires_two_in_a_row() {
        let mut m = Member::new(MemberKind::RtpData, 1, addr(), "c".into(), 100);
        m.probation = 0;
        // A single huge jump is rejected...
        assert!(!m.update_seq(40000));
        // ...but accepted once seen twice in a row.
        assert!(m.update_seq(40000));
        assert_eq!(m.max_seq, 40000);
        assert_eq!(m.seqjumps, 1);
    }
}
