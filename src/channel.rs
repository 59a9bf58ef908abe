// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The channel aggregate (spec.md §3 "Channel"): the primary and repair
//! sessions, the four NAT bindings, the RCC state machine, the gap
//! reporter/policer, and the lifecycle (bind, BYE countdown, unbind) that
//! ties them together.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ChannelConfig;
use crate::dataplane::{DataplaneIpc, DataplaneLock, StreamId};
use crate::diag::{warn_throttled, FaultLog};
use crate::gap_reporter::{GapReporter, GapReporterCounters};
use crate::ids::{ChannelId, GraphId, NatBindingKind};
use crate::nat::NatBindings;
use crate::rcc::{self, RccHooks};
use crate::rtp::RtpSessionOps;
use crate::session::primary::{PrimaryMode, PrimarySession, RccSignal};
use crate::session::repair::RepairSession;
use crate::upcall::{UpcallEvent, UpcallPayload};

/// Snapshot of the counters the CLI's "clear counters" resets (spec.md §7).
#[derive(Copy, Clone, Debug, Default)]
pub struct ChannelCounters {
    pub gap_reporter: GapReporterCounters,
    pub rcc_attempts: u64,
    pub rcc_successes: u64,
    pub rcc_aborts: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Bound,
    /// BYEs sent, waiting out `bye_delay` before the dataplane resources are
    /// actually torn down (spec.md §4.2 "shutdown_allow_byes").
    ShuttingDown,
    Unbound,
}

/// A channel-level event a front-end would otherwise receive through
/// `chan_event_cb` (spec.md §4.2). Queued rather than delivered through a
/// callback pointer; see [`Channel::take_events`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    NewSource,
}

pub struct Channel<D: DataplaneIpc> {
    pub id: ChannelId,
    pub config: ChannelConfig,
    pub primary: PrimarySession<D>,
    pub repair: RepairSession<D>,
    pub nat: NatBindings,
    pub rcc: rcc::Fsm,
    pub gap_reporter: GapReporter,
    pub fault_log: FaultLog,
    pub graph_id: Option<GraphId>,
    pub lifecycle: LifecycleState,
    bye_deadline: Option<Instant>,
    er_enabled_override: bool,
    counters: ChannelCounters,
    pending_events: Vec<ChannelEvent>,
    /// Set once an NCSI APP packet has been sent for the current burst;
    /// cleared when a new RCC attempt starts. The dataplane can redeliver
    /// `BurstDone` after a generation-number hiccup, and NCSI must only go
    /// out once per burst.
    ncsi_sent: bool,
}

impl<D: DataplaneIpc> Channel<D> {
    pub fn new(
        id: ChannelId,
        config: ChannelConfig,
        dataplane: Arc<DataplaneLock<D>>,
        primary_stream: StreamId,
        repair_stream: StreamId,
        repair_local_ssrc: u32,
    ) -> Self {
        let primary = PrimarySession::new(
            PrimaryMode::Ssm,
            config.cname.clone(),
            config.primary_dest_addr,
            config.primary_rtcp_bw,
            config.xr,
            primary_stream,
            dataplane.clone(),
            config.primary_send_rtcp_port != 0,
        );
        let repair = RepairSession::new(
            config.cname.clone(),
            config
                .repair_dest_addr
                .unwrap_or(config.primary_dest_addr),
            config.repair_rtcp_bw,
            Default::default(),
            repair_local_ssrc,
            repair_stream,
            dataplane,
            config.repair_send_rtcp_port != 0,
        );
        let gap_reporter = GapReporter::new(
            config.er_policer_enabled,
            config.er_policer_rate,
            config.er_policer_burst,
            repair_local_ssrc,
            0,
        );
        let rcc = rcc::Fsm::new(config.rcc_enabled);
        Self {
            id,
            config,
            primary,
            repair,
            nat: NatBindings::new(),
            rcc,
            gap_reporter,
            fault_log: FaultLog::new(),
            graph_id: None,
            lifecycle: LifecycleState::Bound,
            bye_deadline: None,
            er_enabled_override: false,
            counters: ChannelCounters::default(),
            pending_events: Vec::new(),
            ncsi_sent: false,
        }
    }

    pub fn counters(&self) -> ChannelCounters {
        let mut c = self.counters;
        c.gap_reporter = self.gap_reporter.counters();
        c
    }

    /// `clear_counters`: resets visible counters without disturbing
    /// protocol state (spec.md §7).
    pub fn clear_counters(&mut self) {
        self.counters = ChannelCounters::default();
        self.gap_reporter = GapReporter::new(
            self.config.er_policer_enabled,
            self.config.er_policer_rate,
            self.config.er_policer_burst,
            self.repair.base.local.ssrc,
            0,
        );
    }

    /// Delivers a NAT binding-resolution result to the corresponding
    /// binding, driving `NatBindingComplete` into the RCC FSM only for the
    /// primary RTCP binding's completion edge (spec.md §8 scenario 6).
    pub fn nat_resolved(&mut self, kind: NatBindingKind, addr: std::net::SocketAddr) {
        let became_complete = match kind {
            NatBindingKind::PrimaryRtp => self.nat.primary_rtp.resolve(addr),
            NatBindingKind::PrimaryRtcp => self.nat.primary_rtcp.resolve(addr),
            NatBindingKind::RepairRtp => self.nat.repair_rtp.resolve(addr),
            NatBindingKind::RepairRtcp => self.nat.repair_rtcp.resolve(addr),
        };
        if kind == NatBindingKind::PrimaryRtcp && became_complete {
            self.counters.rcc_attempts += 1;
            self.ncsi_sent = false;
            let mut rcc = std::mem::replace(&mut self.rcc, rcc::Fsm::new(false));
            rcc.deliver_event(rcc::Event::NatBindingComplete, self);
            self.rcc = rcc;
        }
    }

    /// Dispatches a dataplane upcall to the primary session: forwards any
    /// [`RccSignal`] to the RCC FSM, notifies the repair session of a new
    /// pktflow source, and surfaces `NEW_SOURCE` to the channel's pending
    /// event queue when the pktflow source's address/port changed (spec.md
    /// §4.2/§4.4 "upcall handling").
    pub fn handle_primary_upcall(&mut self, event: UpcallEvent) {
        let outcome = self.primary.process_upcall_event(event);
        if let Some(signal) = outcome.rcc_signal {
            self.dispatch_rcc_signal(signal);
        }
        if let Some(UpcallPayload::Ncsi {
            first_mcast_seq_number,
            first_mcast_recv_time_msec,
        }) = outcome.ncsi
        {
            self.send_ncsi(first_mcast_seq_number, first_mcast_recv_time_msec);
        }
        if outcome.new_source {
            self.pending_events.push(ChannelEvent::NewSource);
            if let Some(key) = self.primary.pktflow_key() {
                if let Err(err) = self.repair.primary_pktflow_src_update(key.ssrc) {
                    warn_throttled!(
                        self.fault_log,
                        &format!("{:?}:repair_pktflow_follow", self.id),
                        "repair session failed to follow new pktflow source: {}",
                        err
                    );
                }
            }
        }
    }

    /// Dispatches a dataplane upcall to the repair session (spec.md §4.3
    /// "Source reconciliation (upcall event)"). A reconciliation failure is
    /// logged; the session itself has already moved to `Error` by the time
    /// this returns.
    pub fn handle_repair_upcall(&mut self, event: UpcallEvent) {
        if let Err(err) = self.repair.process_upcall_event(event) {
            warn_throttled!(
                self.fault_log,
                &format!("{:?}:repair_reconcile", self.id),
                "repair session upcall reconciliation failed: {}",
                err
            );
        }
    }

    /// Drains the channel-level events accumulated since the last call
    /// (spec.md §4.2 "the channel's `chan_event_cb`, if registered, is
    /// invoked with `NEW_SOURCE`"). A front-end polls or registers against
    /// this instead of a C-style callback pointer.
    pub fn take_events(&mut self) -> Vec<ChannelEvent> {
        std::mem::take(&mut self.pending_events)
    }

    /// Sends the `NCSI` APP packet on the primary session (spec.md §4.4
    /// "NCSI emission"), once per burst (`vqec_sm.c`'s redelivery quirk: a
    /// repeated `BurstDone` after a generation hiccup must not re-send it).
    fn send_ncsi(&mut self, first_mcast_seq_number: u16, first_mcast_recv_time_msec: u32) {
        use crate::rtcp::app::{AppPacket, NcsiParams, NAME_NCSI};
        use crate::rtcp::{write_compound, Packet};

        if self.ncsi_sent {
            return;
        }
        self.ncsi_sent = true;
        let ncsi = NcsiParams {
            first_mcast_seq_number,
            first_mcast_recv_time_msec,
        };
        let app = AppPacket {
            subtype: 0,
            ssrc: self.primary.base.local.ssrc,
            name: NAME_NCSI,
            payload: ncsi.encode(),
        };
        let compound = write_compound(&[Packet::App(app)]);
        let _ = self.primary.send_to_rtcp_socket(&compound);
    }

    fn dispatch_rcc_signal(&mut self, signal: RccSignal) {
        let event = match signal {
            RccSignal::ValidAppReceived => rcc::Event::ReceiveValidApp,
            RccSignal::InvalidAppReceived => rcc::Event::ReceiveInvalidApp,
            RccSignal::NullAppReceived => rcc::Event::ReceiveNullApp,
            RccSignal::PrimaryInactive => rcc::Event::RccInternalErr,
        };
        let mut rcc = std::mem::replace(&mut self.rcc, rcc::Fsm::new(false));
        rcc.deliver_event(event, self);
        self.rcc = rcc;
        if rcc::State::FinSuccess == self.rcc.state() {
            self.counters.rcc_successes += 1;
        } else if rcc::State::Abort == self.rcc.state() {
            self.counters.rcc_aborts += 1;
        }
    }

    /// `shutdown_allow_byes`: starts the BYE countdown; the caller is
    /// expected to poll [`Channel::bye_countdown_elapsed`] before actually
    /// tearing down dataplane resources (spec.md §4.2).
    pub fn begin_shutdown(&mut self, now: Instant) -> Result<(), crate::error::Error> {
        self.primary.shutdown_allow_byes()?;
        self.repair.shutdown_allow_byes()?;
        self.lifecycle = LifecycleState::ShuttingDown;
        self.bye_deadline = Some(now + self.config.bye_delay);
        Ok(())
    }

    pub fn bye_countdown_elapsed(&self, now: Instant) -> bool {
        matches!(self.bye_deadline, Some(deadline) if now >= deadline)
    }

    pub fn finish_unbind(&mut self) {
        self.lifecycle = LifecycleState::Unbound;
    }

    pub fn er_enabled(&self) -> bool {
        self.config.er_enabled || self.er_enabled_override
    }
}

impl<D: DataplaneIpc> RccHooks for Channel<D> {
    fn send_pli_nak(&mut self) {
        use crate::rtcp::app::{AppPacket, PliiParams, NAME_PLII};
        use crate::rtcp::nack::Pli;
        use crate::rtcp::{write_compound, Packet};

        let plii = PliiParams {
            min_rcc_fill_msec: self.config.rcc_min_fill_msec,
            max_rcc_fill_msec: self.config.rcc_max_fill_msec,
            do_fastfill: self.config.fastfill_admitted(),
            maximum_recv_bw_bps: self.config.effective_rcc_recv_bw_bps(),
            maximum_fastfill_time_msec: self.config.max_fastfill_msec,
        };
        let app = AppPacket {
            subtype: 0,
            ssrc: self.primary.base.local.ssrc,
            name: NAME_PLII,
            payload: plii.encode(),
        };
        let pli = Pli {
            sender_ssrc: self.primary.base.local.ssrc,
            // `ssrc_media_sender = 0` always, spec.md §4.4.
            media_ssrc: 0,
        };
        let compound = write_compound(&[Packet::Pli(pli), Packet::App(app)]);
        let _ = self.primary.send_to_rtcp_socket(&compound);
    }

    fn rcc_abort_notify(&mut self) {
        // Enable ER immediately rather than waiting for the RCC-disabled
        // steady state (spec.md §4.4 "abort handling"); there is no
        // dedicated dataplane abort call in this IPC surface (spec.md §1,
        // dataplane internals out of scope), so this is the control plane's
        // entire reaction.
        self.er_enabled_override = true;
        // `vqec_chan_rcc_abort` also cancels the repair session's pending
        // send-report timer so a report armed mid-burst doesn't fire right
        // after the abort; reschedule it to a normal steady-state interval.
        let interval = self.repair.base.rtcp_report_interval(false, 0.0);
        self.repair.base.schedule_next_send(Instant::now(), interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RtcpBandwidthConfig, XrConfig};
    use crate::dataplane::mock::MockDataplane;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn cfg() -> ChannelConfig {
        ChannelConfig {
            primary_dest_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 1, 1, 1)), 5000),
            primary_src_addr: None,
            primary_recv_rtcp_port: 5001,
            primary_send_rtcp_port: 5001,
            repair_dest_addr: None,
            repair_recv_rtcp_port: 6001,
            repair_send_rtcp_port: 6001,
            feedback_target_addr: None,
            dscp: 0,
            rtcp_rsize: false,
            er_enabled: false,
            rcc_enabled: true,
            fec_enabled: false,
            primary_rtcp_bw: RtcpBandwidthConfig::default(),
            repair_rtcp_bw: RtcpBandwidthConfig::default(),
            xr: XrConfig::default(),
            rcc_min_fill_msec: 0,
            rcc_max_fill_msec: 2000,
            max_fastfill_msec: 0,
            max_recv_bw_rcc_bps: 4_000_000,
            max_recv_bw_er_bps: 2_000_000,
            use_rcc_bw_for_er: false,
            fec_recv_bw_bps: 0,
            fastfill_start_set: false,
            fastfill_abort_set: false,
            fastfill_done_set: false,
            er_policer_enabled: false,
            er_policer_rate: 0.0,
            er_policer_burst: 0,
            bye_delay: Duration::from_secs(5),
            cname: "c@example".into(),
        }
    }

    fn channel() -> Channel<MockDataplane> {
        Channel::new(
            ChannelId(1),
            cfg(),
            Arc::new(DataplaneLock::new(MockDataplane::default())),
            StreamId(1),
            StreamId(2),
            0xBEEF_0000,
        )
    }

    #[test]
    fn only_primary_rtcp_binding_drives_rcc_fsm() {
        let mut c = channel();
        let mut rcc = std::mem::replace(&mut c.rcc, rcc::Fsm::new(true));
        rcc.deliver_event(rcc::Event::RapidChannelChange, &mut c);
        c.rcc = rcc;
        assert_eq!(c.rcc.state(), rcc::State::WaitApp);

        // RTP binding resolves first; the FSM must not react.
        c.nat_resolved(NatBindingKind::PrimaryRtp, SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1,2,3,4)), 9000));
        assert_eq!(c.rcc.state(), rcc::State::WaitApp);

        // The RTCP binding's completion is what fires NatBindingComplete.
        c.nat_resolved(NatBindingKind::PrimaryRtcp, SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1,2,3,4)), 9001));
        assert_eq!(c.rcc.state(), rcc::State::WaitApp);
        assert!(c.rcc.nakpli_sent_time().is_some());
    }

    #[test]
    fn clear_counters_resets_gap_reporter_without_touching_protocol_state() {
        let mut c = channel();
        c.clear_counters();
        assert_eq!(c.counters().gap_reporter.generic_nack_counter, 0);
    }

    #[test]
    fn rcc_abort_enables_er_and_reschedules_repair_report() {
        let mut c = channel();
        // Put the repair session's report right on the cusp of firing so a
        // stale abort reschedule would be observable.
        c.repair.base.schedule_next_send(Instant::now(), Duration::from_millis(0));
        assert!(!c.er_enabled());

        <Channel<MockDataplane> as RccHooks>::rcc_abort_notify(&mut c);

        assert!(c.er_enabled());
        assert!(c.repair.base.time_until_next_send(Instant::now()) > Duration::from_millis(0));
    }

    #[test]
    fn burst_done_sends_ncsi_once_per_burst() {
        use crate::upcall::{UpcallEvent, UpcallKind, UpcallPayload};

        let mut c = channel();
        assert!(!c.ncsi_sent);
        c.handle_primary_upcall(UpcallEvent::with_payload(
            UpcallKind::BurstDone,
            0,
            UpcallPayload::Ncsi {
                first_mcast_seq_number: 42,
                first_mcast_recv_time_msec: 1000,
            },
        ));
        assert!(c.ncsi_sent);

        // A redelivered BurstDone (generation hiccup) must not flip anything
        // back or re-trigger a send; the flag stays set until the next RCC
        // attempt clears it.
        c.handle_primary_upcall(UpcallEvent::with_payload(
            UpcallKind::BurstDone,
            1,
            UpcallPayload::Ncsi {
                first_mcast_seq_number: 43,
                first_mcast_recv_time_msec: 1100,
            },
        ));
        assert!(c.ncsi_sent);

        // A fresh RCC attempt (primary RTCP NAT binding completing again)
        // clears the per-burst flag.
        c.nat_resolved(NatBindingKind::PrimaryRtcp, SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 9001));
        assert!(!c.ncsi_sent);
    }

    #[test]
    fn repair_upcall_reconciles_its_own_source_table() {
        use crate::dataplane::{SourceEntry, SourceKey, SourceState};
        use crate::upcall::{UpcallEvent, UpcallKind};
        use std::time::Instant;

        let mut c = channel();
        c.repair.dataplane.with(|d| {
            d.tables.insert(
                StreamId(2),
                vec![SourceEntry {
                    key: SourceKey {
                        ssrc: 9,
                        src_addr: IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)),
                        src_port: 7000,
                    },
                    state: SourceState::Active,
                    pktflow_permitted: false,
                    buffer_for_failover: false,
                    thresh_cnt: 0,
                    last_rx_time: Instant::now(),
                    session_rtp_seq_num_offset: 0,
                }],
            )
        });
        c.handle_repair_upcall(UpcallEvent::new(UpcallKind::SourceTableChanged, 0));
        assert!(c.repair.base.find_member(9).is_some());
    }
}
