// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration surfaces, per spec.md §6 "Configuration". Parsing a
//! config file into these structs is out of scope (spec.md §1): the
//! external front-end builds them and passes them into the constructors
//! named in §4.

use std::net::SocketAddr;

/// `sig_mode`: process-wide NAT/signalling mode selection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SigMode {
    Normal,
    Mux,
    StunClient,
}

/// RTCP bandwidth allocation, drives `rtcp_may_send` and the report
/// interval (spec.md §4.1, "RTCP send policy").
#[derive(Copy, Clone, Debug, Default)]
pub struct RtcpBandwidthConfig {
    pub sender_bw_bps: u32,
    pub receiver_bw_bps: u32,
    pub per_receiver_bw_bps: u32,
}

impl RtcpBandwidthConfig {
    /// `rtcp_may_send` requires non-zero allocated bandwidth.
    pub fn has_bandwidth(&self) -> bool {
        self.sender_bw_bps != 0 || self.receiver_bw_bps != 0
    }
}

/// `primary_rtcp_xr_*`: per-channel XR block toggles (spec.md §6).
#[derive(Copy, Clone, Debug, Default)]
pub struct XrConfig {
    pub loss_rle: bool,
    pub per_loss_rle: bool,
    pub stat_flags: bool,
    pub multicast_acq: bool,
    pub diagnostic_counters: bool,
    pub rsize: bool,
}

impl XrConfig {
    pub fn any_enabled(&self) -> bool {
        self.loss_rle
            || self.per_loss_rle
            || self.stat_flags
            || self.multicast_acq
            || self.diagnostic_counters
    }
}

/// Per-channel configuration (spec.md §3 "Channel").
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub primary_dest_addr: SocketAddr,
    pub primary_src_addr: Option<SocketAddr>,
    pub primary_recv_rtcp_port: u16,
    pub primary_send_rtcp_port: u16,
    pub repair_dest_addr: Option<SocketAddr>,
    pub repair_recv_rtcp_port: u16,
    pub repair_send_rtcp_port: u16,
    pub feedback_target_addr: Option<SocketAddr>,
    pub dscp: u8,
    pub rtcp_rsize: bool,

    pub er_enabled: bool,
    pub rcc_enabled: bool,
    pub fec_enabled: bool,

    pub primary_rtcp_bw: RtcpBandwidthConfig,
    pub repair_rtcp_bw: RtcpBandwidthConfig,
    pub xr: XrConfig,

    pub rcc_min_fill_msec: u32,
    pub rcc_max_fill_msec: u32,
    pub max_fastfill_msec: u32,
    pub max_recv_bw_rcc_bps: u32,
    pub max_recv_bw_er_bps: u32,
    pub use_rcc_bw_for_er: bool,
    /// Bandwidth reserved for the FEC streams, subtracted from
    /// `max_recv_bw_rcc_bps` before it goes on the wire (spec.md §4.4
    /// "Receive-bandwidth accounting"). Only meaningful when `fec_enabled`.
    pub fec_recv_bw_bps: u32,
    /// The three fastfill vector entries (`start`/`abort`/`done` dataplane
    /// hooks) the channel was bound with. Fast-fill admission requires all
    /// three to be set (spec.md §4.4 "Fast-fill admission").
    pub fastfill_start_set: bool,
    pub fastfill_abort_set: bool,
    pub fastfill_done_set: bool,

    pub er_policer_enabled: bool,
    pub er_policer_rate: f64,
    pub er_policer_burst: u32,

    pub bye_delay: std::time::Duration,

    pub cname: String,
}

impl ChannelConfig {
    /// `max_recv_bw_rcc = config.max_recv_bw_rcc - fec_recv_bw`, floored at
    /// 0, but forced to 1 bps if the raw configured value was non-zero so
    /// the server still learns RCC is wanted even when the FEC reservation
    /// eats the whole budget (spec.md §4.4 "Receive-bandwidth accounting").
    pub fn effective_rcc_recv_bw_bps(&self) -> u32 {
        if self.max_recv_bw_rcc_bps == 0 {
            return 0;
        }
        let fec = if self.fec_enabled { self.fec_recv_bw_bps } else { 0 };
        self.max_recv_bw_rcc_bps.saturating_sub(fec).max(1)
    }

    /// Fast-fill is only admitted if the channel has all three fastfill
    /// vector entries set (spec.md §4.4 "Fast-fill admission").
    pub fn fastfill_admitted(&self) -> bool {
        self.fastfill_start_set && self.fastfill_abort_set && self.fastfill_done_set
    }
}

/// Process-wide configuration (spec.md §6, values marked "process-wide").
#[derive(Copy, Clone, Debug)]
pub struct GlobalConfig {
    pub sig_mode: SigMode,
    pub max_concurrent_rcc: u32,
    pub socket_rcvbuf_bytes: u32,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            sig_mode: SigMode::Normal,
            max_concurrent_rcc: 2000,
            socket_rcvbuf_bytes: 256 * 1024,
        }
    }
}
