// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP session base (spec.md §4.1): the report-interval algorithm, the
//! member table, the member-timeout sweep, and BYE emission shared by the
//! primary and repair sessions. `PrimarySsm`, `PrimaryPtp`, and `Repair`
//! each hold a [`SessionBase`] by value and implement [`RtpSessionOps`] for
//! the behaviour spec.md §4.1 says they override: `construct_report`,
//! `update_stats`, `update_receiver_stats`, `process_upcall_event`,
//! `shutdown_allow_byes`, `delete_member`, and (repair only)
//! `primary_pktflow_src_update`/`send_to_rtcp_socket`.
//!
//! This is the Rust substitute for the derived-class macros spec.md §9
//! calls out (`RTP_PTP_INFO`, `SSM_RSI_RCVR_METHODS`): a trait implemented
//! by each session flavour instead of a hand-rolled vtable.

pub mod member;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::{RtcpBandwidthConfig, XrConfig};
use crate::error::Error;
use crate::ids::MemberId;
use member::{Member, MemberKind};

/// The RFC 3550 §6.3.1 compensation factor applied to the randomised
/// report interval so that the average interval converges on the nominal
/// one despite the uniform jitter.
const COMPENSATION: f64 = 1.0 / 1.21828;
/// Minimum RTCP report interval for a member that has not yet sent data.
const MIN_INTERVAL_SECS: f64 = 5.0;

/// Local source: own SSRC, CNAME, and the sockets used to send.
pub struct LocalSource {
    pub ssrc: u32,
    pub cname: String,
    pub send_addr: SocketAddr,
}

/// RTCP transmit/receive statistics shared by every session flavour
/// (spec.md §3, "RTP session (base)").
#[derive(Default, Clone, Copy, Debug)]
pub struct RtcpStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub avg_packet_size: f64,
    pub malformed_packets: u64,
}

/// `(rate, last_session_size_estimate)`-style bookkeeping the base session
/// needs to compute `rtcp_report_interval`.
pub struct SessionBase {
    pub local: LocalSource,
    pub members: Vec<Option<Member>>,
    pub senders: Vec<MemberId>,
    pub rtcp_bw: RtcpBandwidthConfig,
    pub xr: XrConfig,
    pub stats: RtcpStats,
    pub next_send_ts: Instant,
    pub last_received_ts: Option<Instant>,
    has_transmit_socket: bool,
}

impl SessionBase {
    pub fn new(cname: String, send_addr: SocketAddr, rtcp_bw: RtcpBandwidthConfig, xr: XrConfig, has_transmit_socket: bool) -> Self {
        let ssrc = rand::thread_rng().gen::<u32>();
        Self {
            local: LocalSource { ssrc, cname, send_addr },
            members: Vec::new(),
            senders: Vec::new(),
            rtcp_bw,
            xr,
            stats: RtcpStats::default(),
            next_send_ts: Instant::now(),
            last_received_ts: None,
            has_transmit_socket,
        }
    }

    /// `create_local_source(selection_mode, member_id)`: the repair
    /// session's local SSRC is caller-supplied rather than random
    /// (spec.md §4.3), so this takes it explicitly.
    pub fn with_local_ssrc(mut self, ssrc: u32) -> Self {
        self.local.ssrc = ssrc;
        self
    }

    /// `rtcp_may_send`: true iff the session has non-zero allocated RTCP
    /// bandwidth and a valid transmit socket (spec.md §4.1).
    pub fn rtcp_may_send(&self) -> bool {
        self.rtcp_bw.has_bandwidth() && self.has_transmit_socket
    }

    /// `new_data_source(source_id) -> {Success, SsrcExists, MemberResourceFail, ...}`
    pub fn new_data_source(
        &mut self,
        kind: MemberKind,
        ssrc: u32,
        addr: SocketAddr,
        cname: String,
        seq: u16,
    ) -> Result<MemberId, NewSourceError> {
        if self.find_member(ssrc).is_some() {
            return Err(NewSourceError::SsrcExists);
        }
        let member = Member::new(kind, ssrc, addr, cname, seq);
        let id = self.insert_member(member);
        Ok(id)
    }

    fn insert_member(&mut self, member: Member) -> MemberId {
        if let Some(slot) = self.members.iter().position(|m| m.is_none()) {
            self.members[slot] = Some(member);
            MemberId(slot as u16)
        } else {
            self.members.push(Some(member));
            MemberId((self.members.len() - 1) as u16)
        }
    }

    pub fn find_member(&self, ssrc: u32) -> Option<MemberId> {
        self.members.iter().enumerate().find_map(|(i, m)| {
            m.as_ref()
                .filter(|m| m.ssrc == ssrc)
                .map(|_| MemberId(i as u16))
        })
    }

    /// `lookup_member(member_id) -> member|NotFound`
    pub fn lookup_member(&self, id: MemberId) -> Option<&Member> {
        self.members.get(id.0 as usize).and_then(|m| m.as_ref())
    }

    pub fn lookup_member_mut(&mut self, id: MemberId) -> Option<&mut Member> {
        self.members.get_mut(id.0 as usize).and_then(|m| m.as_mut())
    }

    /// `remove_member_by_id` / `delete_member`: the base-class removal that
    /// derived sessions wrap with their own IPC side effects (spec.md
    /// §4.3 "delete_member override").
    pub fn remove_member_by_id(&mut self, id: MemberId) -> Option<Member> {
        self.senders.retain(|&s| s != id);
        self.members.get_mut(id.0 as usize).and_then(|slot| slot.take())
    }

    pub fn member_ids(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.members
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.as_ref().map(|_| MemberId(i as u16)))
    }

    pub fn member_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_some()).count()
    }

    /// RFC 3550 §6.3.1 report interval, jittered uniformly in
    /// `[0.5, 1.5] x interval`, floored per the "we_sent"-weighted minimum
    /// (spec.md §4.1: "standard RFC-3550 randomised interval; jitter
    /// applied uniformly in [0.5, 1.5]x interval").
    pub fn rtcp_report_interval(&self, we_sent: bool, avg_rtcp_size: f64) -> Duration {
        let members = (self.member_count().max(1)) as f64;
        let senders = self.senders.len() as f64;
        let rtcp_bw = f64::from(self.rtcp_bw.receiver_bw_bps.max(self.rtcp_bw.sender_bw_bps)).max(1.0);

        let (n, bw_fraction) = if !we_sent || senders <= members * 0.25 {
            if !we_sent {
                (members, 1.0)
            } else {
                (members - senders, 0.75)
            }
        } else {
            (senders, 0.25)
        };
        let n = n.max(1.0);

        let avg_size = avg_rtcp_size.max(28.0);
        let t_min = if we_sent { MIN_INTERVAL_SECS / 2.0 } else { MIN_INTERVAL_SECS };
        let interval = (n * avg_size) / (rtcp_bw * bw_fraction);
        let interval = interval.max(t_min);
        let interval = interval * COMPENSATION;

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(0.5..1.5);
        Duration::from_secs_f64((interval * jitter).max(0.0))
    }

    /// `session_timeout_{slist,glist}`: sweeps the member table for senders
    /// that have gone silent for `5 x report interval` (RFC 3550 §6.3.5)
    /// and removes them, yielding the removed ids so the caller can run its
    /// own `delete_member` override (dataplane IPC, SSRC filter bookkeeping
    /// etc.) on each.
    pub fn session_timeout(&mut self, now: Instant, timeout: Duration) -> Vec<MemberId> {
        let mut timed_out = Vec::new();
        for id in self.member_ids().collect::<Vec<_>>() {
            if let Some(m) = self.lookup_member(id) {
                let stale = match m.last_arrival {
                    Some(last) => now.saturating_duration_since(last) > timeout,
                    None => false,
                };
                if stale {
                    timed_out.push(id);
                }
            }
        }
        timed_out
    }

    /// Schedules the next send-report deadline, never negative (spec.md
    /// §4.2: "never negative — floor at 0").
    pub fn schedule_next_send(&mut self, now: Instant, interval: Duration) {
        self.next_send_ts = now + interval;
    }

    pub fn time_until_next_send(&self, now: Instant) -> Duration {
        self.next_send_ts.saturating_duration_since(now)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NewSourceError {
    SsrcExists,
    MemberResourceFail,
}

/// The capability set spec.md §2 describes: `{construct_report,
/// update_stats, update_receiver_stats, process_upcall_event,
/// shutdown_allow_byes, delete_member, primary_pktflow_src_update,
/// send_to_rtcp_socket}`. Not every method is meaningful for every
/// implementor; primary sessions no-op `primary_pktflow_src_update` since
/// only the repair session installs an SSRC filter in response to it.
pub trait RtpSessionOps {
    fn base(&self) -> &SessionBase;
    fn base_mut(&mut self) -> &mut SessionBase;

    /// `construct_report(source, buf, len, extras, reset_xr) -> byte_count_or_zero`
    fn construct_report(&mut self, now: Instant, reset_xr: bool) -> Vec<u8>;

    /// `update_stats(reset_xr)`
    fn update_stats(&mut self, reset_xr: bool);

    /// `update_receiver_stats(member, reset_xr)`
    fn update_receiver_stats(&mut self, member: MemberId, reset_xr: bool) -> Result<(), Error>;

    /// `shutdown_allow_byes`
    fn shutdown_allow_byes(&mut self) -> Result<(), Error>;

    /// `delete_member`
    fn delete_member(&mut self, member: MemberId, ctx: RemoveContext) -> Result<(), Error>;

    /// `primary_pktflow_src_update(source_id)`: a no-op on the primary
    /// session itself; overridden meaningfully only by the repair session.
    /// Takes the elected source's SSRC rather than a [`MemberId`], since
    /// member ids are local to each session's own member table.
    fn primary_pktflow_src_update(&mut self, _ssrc: u32) -> Result<(), Error> {
        Ok(())
    }

    /// `send_to_rtcp_socket`
    fn send_to_rtcp_socket(&mut self, buf: &[u8]) -> std::io::Result<()>;
}

/// Replaces the global "recursive delete" flag (spec.md §9): callers pass
/// down whether a `delete_member` was triggered by a user/API action or by
/// a dataplane upcall so the repair session's override can decide whether
/// to re-enter the dataplane with its own delete IPC.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RemoveContext {
    UserInitiated,
    FromUpcall,
}
