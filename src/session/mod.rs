// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The two concrete RTP session flavours (spec.md §4.2, §4.3): primary
//! (SSM or PTP) and repair. Both hold a [`crate::rtp::SessionBase`] by
//! value and implement [`crate::rtp::RtpSessionOps`]; this module holds the
//! compound-RTCP-report construction the two share.

pub mod primary;
pub mod repair;

use crate::rtcp::{Packet, ReceiverReport, ReportBlock, SenderReport};
use crate::rtp::member::Member;
use crate::rtp::SessionBase;
use crate::time::NtpTimestamp;

/// Session-level reconciliation state, shared by primary and repair
/// sessions (spec.md §3: repair session-state is "identical to primary's").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    InactiveWaitFirst,
    Active,
    Inactive,
    Error,
    Shutdown,
}

fn report_block_for(member: &Member, lsr: u32, dlsr: u32) -> ReportBlock {
    let expected = member.expected();
    let lost = member.lost().clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
    let fraction_lost = if expected == 0 {
        0
    } else {
        ((lost.max(0) as u64 * 256) / u64::from(expected.max(1))).min(255) as u8
    };
    ReportBlock {
        ssrc: member.ssrc,
        fraction_lost,
        cumulative_lost: (lost.max(0)) as u32 & 0x00FF_FFFF,
        extended_highest_seq: member.extended_max_seq(),
        jitter: member.jitter as u32,
        lsr,
        dlsr,
    }
}

/// Builds the SR-or-RR sub-packet plus per-member report blocks common to
/// every session flavour (spec.md §4.1 "construct_report"): an SR if the
/// session has a transmit socket and has sent since the last report, an RR
/// otherwise.
pub fn build_report_packet(
    base: &SessionBase,
    we_sent: bool,
    rtp_timestamp: u32,
) -> Packet {
    let reports: Vec<ReportBlock> = base
        .members
        .iter()
        .filter_map(|m| m.as_ref())
        .map(|m| report_block_for(m, 0, 0))
        .collect();

    if we_sent {
        Packet::SenderReport(SenderReport {
            ssrc: base.local.ssrc,
            ntp_timestamp: NtpTimestamp::now().0,
            rtp_timestamp,
            packet_count: base.stats.packets_sent as u32,
            octet_count: (base.stats.packets_sent as f64 * base.stats.avg_packet_size) as u32,
            reports,
        })
    } else {
        Packet::ReceiverReport(ReceiverReport {
            ssrc: base.local.ssrc,
            reports,
        })
    }
}
