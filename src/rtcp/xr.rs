// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTCP Extended Reports ([RFC 3611]) blocks this control plane cares
//! about: Post-Error-Repair Loss RLE, Multicast Acquisition, and Diagnostic
//! Counters (spec.md §6 "RTCP XR"), each gated by a per-channel
//! [`crate::config::XrConfig`] flag.
//!
//! [RFC 3611]: https://datatracker.ietf.org/doc/html/rfc3611

use bytes::{BufMut, BytesMut};

pub const BT_LOSS_RLE: u8 = 1;
pub const BT_MULTICAST_ACQUISITION: u8 = 15; // Cisco private extension range.
pub const BT_DIAGNOSTIC_COUNTERS: u8 = 16;
pub const BT_POST_ER_LOSS_RLE: u8 = 17;

/// Multicast Acquisition statistics: when the receiver joined relative to
/// the nearest preceding RTCP SR, used to compute channel-change latency.
#[derive(Copy, Clone, Debug, Default)]
pub struct MulticastAcquisition {
    pub ssrc: u32,
    pub join_rtp_ts: u32,
    pub first_mcast_seq: u16,
    pub mcast_first_repair_seq: u16,
}

/// Diagnostic Counters: coarse application-level counters piggybacked for
/// visibility without a dedicated CLI round-trip.
#[derive(Copy, Clone, Debug, Default)]
pub struct DiagnosticCounters {
    pub ssrc: u32,
    pub discards: u32,
    pub dups: u32,
}

/// A post-error-repair loss run-length-encoded chunk, one per contiguous
/// run of received (`1`) or lost-then-repaired (`0`) packets since the
/// report base sequence.
#[derive(Copy, Clone, Debug, Default)]
pub struct PostErLossRle {
    pub ssrc: u32,
    pub begin_seq: u16,
    pub end_seq: u16,
    pub chunks: u16,
}

/// One XR report block, tagged by block type, written as a fixed-size
/// record (RFC 3611 §4's general block header plus a block-specific,
/// fixed-width body -- this crate never emits variable-length RLE chunk
/// lists longer than a single chunk since the dataplane's gap reports
/// already summarize runs for us).
#[derive(Copy, Clone, Debug)]
pub enum XrBlock {
    PostErLossRle(PostErLossRle),
    MulticastAcquisition(MulticastAcquisition),
    DiagnosticCounters(DiagnosticCounters),
}

impl XrBlock {
    pub fn write(&self, buf: &mut BytesMut) {
        match self {
            XrBlock::PostErLossRle(b) => {
                buf.put_u8(BT_POST_ER_LOSS_RLE);
                buf.put_u8(0); // reserved/thinning.
                buf.put_u16(3); // block length in words.
                buf.put_u32(b.ssrc);
                buf.put_u16(b.begin_seq);
                buf.put_u16(b.end_seq);
                buf.put_u16(b.chunks);
                buf.put_u16(0); // padding to a whole number of words.
            }
            XrBlock::MulticastAcquisition(b) => {
                buf.put_u8(BT_MULTICAST_ACQUISITION);
                buf.put_u8(0);
                buf.put_u16(3);
                buf.put_u32(b.ssrc);
                buf.put_u32(b.join_rtp_ts);
                buf.put_u16(b.first_mcast_seq);
                buf.put_u16(b.mcast_first_repair_seq);
            }
            XrBlock::DiagnosticCounters(b) => {
                buf.put_u8(BT_DIAGNOSTIC_COUNTERS);
                buf.put_u8(0);
                buf.put_u16(3);
                buf.put_u32(b.ssrc);
                buf.put_u32(b.discards);
                buf.put_u32(b.dups);
            }
        }
    }
}

/// A full XR report: the common RTCP header, the reporter's own SSRC, and
/// zero or more blocks.
pub struct XrReport {
    pub ssrc: u32,
    pub blocks: Vec<XrBlock>,
}

impl XrReport {
    pub fn write(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::new();
        body.put_u32(self.ssrc);
        for b in &self.blocks {
            b.write(&mut body);
        }
        let words = (body.len() / 4) as u16;
        super::Header::write(super::PT_XR, 0, words, buf);
        buf.extend_from_slice(&body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_header_declares_the_written_word_count() {
        let report = XrReport {
            ssrc: 0x1234,
            blocks: vec![
                XrBlock::PostErLossRle(PostErLossRle { ssrc: 1, begin_seq: 0, end_seq: 10, chunks: 1 }),
                XrBlock::DiagnosticCounters(DiagnosticCounters { ssrc: 1, discards: 2, dups: 0 }),
            ],
        };
        let mut buf = BytesMut::new();
        report.write(&mut buf);
        // 1 header word + (1 ssrc word + 4 block words) + (1 ssrc word + 3 block words)
        let declared_words = u16::from_be_bytes([buf[2], buf[3]]);
        assert_eq!(declared_words as usize, buf.len() / 4 - 1);
    }

    #[test]
    fn each_block_advertises_three_words_of_body() {
        let mut buf = BytesMut::new();
        XrBlock::MulticastAcquisition(MulticastAcquisition::default()).write(&mut buf);
        assert_eq!(buf[0], BT_MULTICAST_ACQUISITION);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 3);
        assert_eq!(buf.len(), 4 + 3 * 4);
    }
}
