// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The primary session (spec.md §4.2): receives the multicast/unicast media
//! stream, reconciles the dataplane source table against the control
//! plane's member table, and drives the RCC FSM's `NatBindingComplete` /
//! `ReceiveValidApp` / timeout events via the channel that owns it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{RtcpBandwidthConfig, XrConfig};
use crate::dataplane::{
    DataplaneIpc, DataplaneLock, SourceEntry, SourceKey, SourceState, StreamId,
};
use crate::error::{wrap, Error, ErrorInt, IpcCause, ResourceCause};
use crate::ids::MemberId;
use crate::rtp::member::MemberKind;
use crate::rtp::{NewSourceError, RemoveContext, RtpSessionOps, SessionBase};
use crate::socket::RtcpSocket;
use crate::upcall::{GenerationOutcome, GenerationTracker, UpcallEvent, UpcallKind};

use super::{build_report_packet, SessionState};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrimaryMode {
    Ssm,
    Ptp,
}

/// Fires when `process_upcall_event` wants the channel to push an event
/// into the RCC FSM, since `rcc::Fsm` lives on the channel, not the session
/// (spec.md §9: no back-pointer from session to channel).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RccSignal {
    ValidAppReceived,
    InvalidAppReceived,
    NullAppReceived,
    PrimaryInactive,
}

/// What a source-table upcall produced, for the channel to act on: an RCC
/// signal to forward to the FSM, and/or a pktflow-source change the channel
/// should surface as `NEW_SOURCE` (spec.md §4.2 "when the pktflow source
/// changes address or port").
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct UpcallOutcome {
    pub rcc_signal: Option<RccSignal>,
    pub new_source: bool,
    /// Set on `BurstDone`, carrying the payload verbatim for the channel to
    /// turn into an NCSI APP packet (spec.md §4.4 "NCSI emission").
    pub ncsi: Option<crate::upcall::UpcallPayload>,
}

pub struct PrimarySession<D: DataplaneIpc> {
    pub mode: PrimaryMode,
    pub base: SessionBase,
    pub stream_id: StreamId,
    pub dataplane: Arc<DataplaneLock<D>>,
    pub current_src: Option<MemberId>,
    pub generation: GenerationTracker,
    pub socket: Option<RtcpSocket>,
    pub state: SessionState,
    /// `(ssrc, src_addr, src_port)` of the currently-installed pktflow
    /// source, as last reported by the dataplane (spec.md §4.2 "pktflow
    /// mismatch" rules).
    pktflow: Option<SourceKey>,
    /// The stored pktflow entry's `thresh_cnt` as of the last reconcile
    /// pass, so a later increment (dataplane-side resync) can be detected.
    last_thresh_cnt: u32,
    shutting_down: bool,
    /// Set once `shutdown_allow_byes` has run: further
    /// `update_receiver_stats` calls return the last cached numbers instead
    /// of re-entering the dataplane, since the stream id may already be
    /// invalidated on the dataplane side (`eva/rtp_era_recv.c`'s
    /// `rtp_update_receiver_stats`).
    stats_cached: bool,
    last_error: Option<Error>,
}

impl<D: DataplaneIpc> PrimarySession<D> {
    pub fn new(
        mode: PrimaryMode,
        cname: String,
        send_addr: SocketAddr,
        rtcp_bw: RtcpBandwidthConfig,
        xr: XrConfig,
        stream_id: StreamId,
        dataplane: Arc<DataplaneLock<D>>,
        has_transmit_socket: bool,
    ) -> Self {
        Self {
            mode,
            base: SessionBase::new(cname, send_addr, rtcp_bw, xr, has_transmit_socket),
            stream_id,
            dataplane,
            current_src: None,
            generation: GenerationTracker::new(),
            socket: None,
            state: SessionState::InactiveWaitFirst,
            pktflow: None,
            last_thresh_cnt: 0,
            shutting_down: false,
            stats_cached: false,
            last_error: None,
        }
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pktflow_key(&self) -> Option<SourceKey> {
        self.pktflow
    }

    /// `install_new_pktflow_src`: grants pktflow permission to the
    /// dataplane source entry just admitted and splices its sequence-number
    /// offset into the corresponding member so RFC 3550 stats continue
    /// uninterrupted across the switch (spec.md §4.2 "source admission").
    pub fn install_new_pktflow_src(
        &mut self,
        member: MemberId,
        entry: &SourceEntry,
    ) -> Result<(), Error> {
        let offset = self
            .dataplane
            .with(|d| d.src_permit_pktflow(self.stream_id, entry.key))
            .map_err(|status| ipc_err(IpcCause::PermitFlow, status))?;
        if let Some(m) = self.base.lookup_member_mut(member) {
            m.base_seq = m.base_seq.wrapping_add(i64::from(offset) as u32);
        }
        self.current_src = Some(member);
        Ok(())
    }

    /// `enter_error_state`: on any promote IPC error, every dataplane source
    /// with `pktflow_permitted` set is deleted and the cached pktflow source
    /// is cleared (spec.md §4.2 "On any other RTP failure or any dataplane
    /// error"), then the session's own state machine moves to `Error` -- a
    /// recovery point, not a stop point (spec.md §7): the next upcall may
    /// bring it back to `Active`.
    pub fn enter_error_state(&mut self, err: Error) {
        log::warn!("primary session entering error state: {}", err);
        if let Ok(table) = self.dataplane.with(|d| d.src_get_table(self.stream_id)) {
            for entry in table.iter().filter(|e| e.pktflow_permitted) {
                let _ = self.dataplane.with(|d| d.src_delete(self.stream_id, entry.key));
            }
        }
        self.pktflow = None;
        self.state = SessionState::Error;
        self.last_error = Some(err);
    }

    /// Admits a dataplane source entry as a member and grants it pktflow
    /// permission. `SSRC_EXISTS` from `new_data_source` is treated as
    /// success per spec.md §4.2: the member is already there.
    fn promote_source(&mut self, entry: &SourceEntry) -> Result<(MemberId, bool), Error> {
        let member = match self.base.new_data_source(
            MemberKind::RtpData,
            entry.key.ssrc,
            SocketAddr::new(entry.key.src_addr, entry.key.src_port),
            self.base.local.cname.clone(),
            0,
        ) {
            Ok(id) => id,
            Err(NewSourceError::SsrcExists) => self
                .base
                .find_member(entry.key.ssrc)
                .expect("SsrcExists implies the member is present"),
            Err(NewSourceError::MemberResourceFail) => {
                return Err(wrap!(ErrorInt::ResourceExhaustion {
                    channel_id: None,
                    cause: ResourceCause::MemberPool,
                    description: "no free member slot for promoted source".into(),
                }));
            }
        };
        self.install_new_pktflow_src(member, entry)?;
        let changed = self.pktflow != Some(entry.key);
        self.pktflow = Some(entry.key);
        self.last_thresh_cnt = entry.thresh_cnt;
        Ok((member, changed))
    }

    /// Picks the source to fail over to: most recent by `last_rx_time` for
    /// SSM, by the dataplane's `buffer_for_failover` flag for point-to-point
    /// (spec.md §4.2 "elect most recent active (SSM: by last_rx_time;
    /// unicast: by 'failover' flag)").
    fn pick_active<'a>(&self, table: &'a [SourceEntry]) -> Option<&'a SourceEntry> {
        let active = table.iter().filter(|e| e.state == SourceState::Active);
        match self.mode {
            PrimaryMode::Ssm => active.max_by_key(|e| e.last_rx_time),
            PrimaryMode::Ptp => {
                let mut active: Vec<_> = active.collect();
                active.sort_by_key(|e| e.last_rx_time);
                active
                    .iter()
                    .rev()
                    .find(|e| e.buffer_for_failover)
                    .or_else(|| active.last())
                    .copied()
            }
        }
    }

    /// Elects the best active candidate and, if it differs from the
    /// previously-installed source, removes that old member from the RTP
    /// table (spec.md §8 scenario 4: "member A removed, member B added").
    fn elect_most_recent_active(&mut self, table: &[SourceEntry]) -> bool {
        match self.pick_active(table) {
            None => {
                self.state = SessionState::Inactive;
                false
            }
            Some(entry) => {
                let old_src = self.current_src;
                match self.promote_source(entry) {
                    Ok((new_member, changed)) => {
                        self.state = SessionState::Active;
                        if let Some(old) = old_src {
                            if old != new_member {
                                let _ = self.delete_member(old, RemoveContext::FromUpcall);
                            }
                        }
                        changed
                    }
                    Err(err) => {
                        self.enter_error_state(err);
                        false
                    }
                }
            }
        }
    }

    /// `process_upcall_event(source_table)` (spec.md §4.2): reconciles the
    /// dataplane source table against this session's own state machine.
    /// Returns whether the pktflow source changed address/port, for the
    /// caller to surface as `NEW_SOURCE`.
    fn reconcile_source_table(&mut self, table: &[SourceEntry]) -> bool {
        match self.state {
            SessionState::Shutdown => {
                log::error!("primary session received a source-table upcall after shutdown");
                false
            }
            SessionState::Error => false,
            SessionState::InactiveWaitFirst => match table {
                [] => false,
                [entry] if entry.state == SourceState::Active && entry.pktflow_permitted => {
                    match self.promote_source(entry) {
                        Ok((_, changed)) => {
                            self.state = SessionState::Active;
                            changed
                        }
                        Err(err) => {
                            self.enter_error_state(err);
                            false
                        }
                    }
                }
                [entry] => {
                    // Promote but do not add to RTP; thresh_cnt resets.
                    self.pktflow = Some(entry.key);
                    self.last_thresh_cnt = 0;
                    self.state = SessionState::Inactive;
                    false
                }
                _ => self.elect_most_recent_active(table),
            },
            SessionState::Active => {
                let stored = self.pktflow;
                match table.iter().find(|e| e.pktflow_permitted) {
                    Some(entry) if Some(entry.key) == stored => {
                        if entry.state == SourceState::Inactive {
                            self.elect_most_recent_active(table)
                        } else if entry.thresh_cnt != self.last_thresh_cnt {
                            match self.promote_source(entry) {
                                Ok((_, changed)) => changed,
                                Err(err) => {
                                    self.enter_error_state(err);
                                    false
                                }
                            }
                        } else {
                            false
                        }
                    }
                    Some(entry) if entry.state == SourceState::Active => {
                        // Dataplane moved pktflow permission to a different
                        // entry than the one this session last tracked.
                        log::warn!(
                            "dataplane granted pktflow to a different source than the \
                             one this session is tracking; re-electing"
                        );
                        let old_src = self.current_src;
                        match self.promote_source(entry) {
                            Ok((new_member, changed)) => {
                                if let Some(old) = old_src {
                                    if old != new_member {
                                        let _ = self.delete_member(old, RemoveContext::FromUpcall);
                                    }
                                }
                                changed
                            }
                            Err(err) => {
                                self.enter_error_state(err);
                                false
                            }
                        }
                    }
                    Some(_) => {
                        // The newly-permitted entry isn't active either; fall
                        // back to electing from the rest of the table.
                        self.elect_most_recent_active(table)
                    }
                    None => {
                        log::warn!(
                            "primary session's stored pktflow source is no longer in the \
                             dataplane table; attempting re-election"
                        );
                        self.elect_most_recent_active(table)
                    }
                }
            }
            SessionState::Inactive => self.elect_most_recent_active(table),
        }
    }

    /// Processes one dataplane upcall against this session's own state.
    /// `SourceTableChanged` drives a full source-table reconciliation pass
    /// (spec.md §4.2); other kinds are translated straight into an
    /// [`RccSignal`] for the channel's RCC FSM. Repeated or out-of-order
    /// generations (per [`GenerationTracker`]) are swallowed here and never
    /// reach either path twice.
    pub fn process_upcall_event(&mut self, event: UpcallEvent) -> UpcallOutcome {
        match self.generation.classify(event.generation) {
            GenerationOutcome::Repeated => return UpcallOutcome::default(),
            GenerationOutcome::Lost { missed } => {
                log::warn!(
                    "primary session missed {} upcall generation(s) before {:?}",
                    missed,
                    event.kind
                );
            }
            GenerationOutcome::InOrder => {}
        }
        match event.kind {
            UpcallKind::PrimaryInactive => UpcallOutcome {
                rcc_signal: Some(RccSignal::PrimaryInactive),
                new_source: false,
                ncsi: None,
            },
            UpcallKind::BurstDone => UpcallOutcome {
                rcc_signal: None,
                new_source: false,
                ncsi: event.payload,
            },
            UpcallKind::SourceTableChanged => {
                let table = match self.dataplane.with(|d| d.src_get_table(self.stream_id)) {
                    Ok(table) => table,
                    Err(status) => {
                        self.enter_error_state(ipc_err(IpcCause::GetSrcTable, status));
                        return UpcallOutcome::default();
                    }
                };
                UpcallOutcome {
                    rcc_signal: None,
                    new_source: self.reconcile_source_table(&table),
                    ncsi: None,
                }
            }
            _ => UpcallOutcome::default(),
        }
    }

    /// `shutdown_allow_byes` returning a BYE-carrying compound has to wait
    /// for the channel to pick the BYE-delay timer value; here we only mark
    /// intent so `delete_member`/destruction logic knows not to re-enter the
    /// dataplane gratuitously.
    fn mark_shutting_down(&mut self) {
        self.shutting_down = true;
        self.stats_cached = true;
        self.state = SessionState::Shutdown;
    }
}

impl<D: DataplaneIpc> RtpSessionOps for PrimarySession<D> {
    fn base(&self) -> &SessionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SessionBase {
        &mut self.base
    }

    fn construct_report(&mut self, _now: Instant, _reset_xr: bool) -> Vec<u8> {
        if !self.base.rtcp_may_send() {
            return Vec::new();
        }
        let we_sent = self.base.stats.packets_sent > 0;
        let pkt = build_report_packet(&self.base, we_sent, 0);
        crate::rtcp::write_compound(&[pkt]).to_vec()
    }

    fn update_stats(&mut self, _reset_xr: bool) {
        // Per-member stats are updated inline as RTP packets arrive
        // (`Member::update_seq`/`update_jitter`); nothing session-wide to do
        // here beyond what XR reset would touch, which is out of scope for
        // a primary session (primary never emits XR, spec.md §4.1).
    }

    fn update_receiver_stats(&mut self, member: MemberId, reset_xr: bool) -> Result<(), Error> {
        if self.stats_cached {
            return Ok(());
        }
        let info = self
            .dataplane
            .with(|d| {
                d.src_get_info(
                    self.stream_id,
                    self.base
                        .lookup_member(member)
                        .map(|m| crate::dataplane::source_key(m.ssrc, m.addr))
                        .ok_or(crate::dataplane::IpcStatus::NotFound)?,
                    reset_xr,
                )
            })
            .map_err(|status| ipc_err(IpcCause::GetSrcInfo, status))?;
        if let Some(m) = self.base.lookup_member_mut(member) {
            m.received = info.received;
            m.cycles = info.cycles;
            m.max_seq = info.max_seq;
            m.base_seq = info.base_seq;
            m.bad_seq = info.bad_seq;
            m.jitter = f64::from(info.jitter);
            m.out_of_order = info.out_of_order;
        }
        Ok(())
    }

    fn shutdown_allow_byes(&mut self) -> Result<(), Error> {
        self.mark_shutting_down();
        Ok(())
    }

    fn delete_member(&mut self, member: MemberId, ctx: RemoveContext) -> Result<(), Error> {
        if let Some(m) = self.base.lookup_member(member) {
            if ctx == RemoveContext::UserInitiated {
                let key = crate::dataplane::source_key(m.ssrc, m.addr);
                self.dataplane
                    .with(|d| d.src_delete(self.stream_id, key))
                    .map_err(|status| ipc_err(IpcCause::DeleteSrc, status))?;
            }
        }
        self.base.remove_member_by_id(member);
        if self.current_src == Some(member) {
            self.current_src = None;
        }
        Ok(())
    }

    fn send_to_rtcp_socket(&mut self, _buf: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
}

fn ipc_err(cause: IpcCause, status: crate::dataplane::IpcStatus) -> Error {
    wrap!(ErrorInt::Ipc {
        channel_id: None,
        cause,
        description: format!("{:?}", status),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::mock::MockDataplane;
    use crate::dataplane::SourceKey;
    use std::net::{IpAddr, Ipv4Addr};

    fn send_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5000)
    }

    fn session() -> PrimarySession<MockDataplane> {
        PrimarySession::new(
            PrimaryMode::Ssm,
            "cname".into(),
            send_addr(),
            RtcpBandwidthConfig::default(),
            XrConfig::default(),
            StreamId(1),
            Arc::new(DataplaneLock::new(MockDataplane::default())),
            false,
        )
    }

    #[test]
    fn install_new_pktflow_src_grants_permission_and_tracks_current() {
        let mut s = session();
        let member = s
            .base
            .new_data_source(MemberKind::RtpData, 42, send_addr(), "c".into(), 100)
            .unwrap();
        let key = SourceKey {
            ssrc: 42,
            src_addr: send_addr().ip(),
            src_port: send_addr().port(),
        };
        let entry = SourceEntry {
            key,
            state: SourceState::Active,
            pktflow_permitted: false,
            buffer_for_failover: false,
            thresh_cnt: 0,
            last_rx_time: Instant::now(),
            session_rtp_seq_num_offset: 0,
        };
        s.install_new_pktflow_src(member, &entry).unwrap();
        assert_eq!(s.current_src, Some(member));
    }

    #[test]
    fn install_new_pktflow_src_surfaces_ipc_failure() {
        let mut s = session();
        s.dataplane.with(|d| d.fail_next_permit = true);
        let member = s
            .base
            .new_data_source(MemberKind::RtpData, 42, send_addr(), "c".into(), 100)
            .unwrap();
        let key = SourceKey {
            ssrc: 42,
            src_addr: send_addr().ip(),
            src_port: send_addr().port(),
        };
        let entry = SourceEntry {
            key,
            state: SourceState::Active,
            pktflow_permitted: false,
            buffer_for_failover: false,
            thresh_cnt: 0,
            last_rx_time: Instant::now(),
            session_rtp_seq_num_offset: 0,
        };
        let err = s.install_new_pktflow_src(member, &entry).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Ipc);
    }

    #[test]
    fn repeated_upcall_generation_is_swallowed() {
        let mut s = session();
        let ev = UpcallEvent::new(UpcallKind::PrimaryInactive, 0);
        assert_eq!(
            s.process_upcall_event(ev).rcc_signal,
            Some(RccSignal::PrimaryInactive)
        );
        assert_eq!(s.process_upcall_event(ev).rcc_signal, None);
    }

    #[test]
    fn delete_member_removes_from_base_and_clears_current_src() {
        let mut s = session();
        let member = s
            .base
            .new_data_source(MemberKind::RtpData, 7, send_addr(), "c".into(), 1)
            .unwrap();
        s.current_src = Some(member);
        s.delete_member(member, RemoveContext::FromUpcall).unwrap();
        assert!(s.base.lookup_member(member).is_none());
        assert_eq!(s.current_src, None);
    }

    fn entry(ssrc: u32, addr: SocketAddr, state: SourceState, pktflow_permitted: bool) -> SourceEntry {
        SourceEntry {
            key: SourceKey { ssrc, src_addr: addr.ip(), src_port: addr.port() },
            state,
            pktflow_permitted,
            buffer_for_failover: false,
            thresh_cnt: 0,
            last_rx_time: Instant::now(),
            session_rtp_seq_num_offset: 0,
        }
    }

    #[test]
    fn scenario_4_source_failover_elects_new_active_source() {
        let mut s = session();
        let a_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 5000);
        let b_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 5)), 5000);

        s.dataplane.with(|d| {
            d.tables.insert(
                StreamId(1),
                vec![entry(0xA, a_addr, SourceState::Active, true)],
            )
        });
        let table = s.dataplane.with(|d| d.src_get_table(StreamId(1)).unwrap());
        assert!(s.reconcile_source_table(&table));
        assert_eq!(s.state, SessionState::Active);
        let member_a = s.base.find_member(0xA).unwrap();

        // Primary goes Inactive for A, B comes up Active with pktflow granted.
        s.dataplane.with(|d| {
            d.tables.insert(
                StreamId(1),
                vec![
                    entry(0xA, a_addr, SourceState::Inactive, false),
                    entry(0xB, b_addr, SourceState::Active, true),
                ],
            )
        });
        let table = s.dataplane.with(|d| d.src_get_table(StreamId(1)).unwrap());
        let new_source = s.reconcile_source_table(&table);
        assert!(new_source);
        assert_eq!(s.state, SessionState::Active);
        assert!(s.base.find_member(0xB).is_some());
        assert!(s.base.lookup_member(member_a).is_none());
    }

    #[test]
    fn inactive_wait_first_ignores_empty_table() {
        let mut s = session();
        assert!(!s.reconcile_source_table(&[]));
        assert_eq!(s.state, SessionState::InactiveWaitFirst);
    }

    #[test]
    fn promote_ipc_failure_enters_error_and_clears_pktflow() {
        let mut s = session();
        s.dataplane.with(|d| d.fail_next_permit = true);
        let a_addr = send_addr();
        let table = vec![entry(0x1, a_addr, SourceState::Active, true)];
        assert!(!s.reconcile_source_table(&table));
        assert_eq!(s.state, SessionState::Error);
        assert!(s.pktflow_key().is_none());
    }
}
