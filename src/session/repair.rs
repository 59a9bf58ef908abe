// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The repair session (spec.md §4.3): receives error-repair/RCC-burst RTP
//! from the feedback target, tracks a bounded cache of known sources, and
//! installs an SSRC filter once the primary session picks a source to
//! follow so only that source's repair packets are admitted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{RtcpBandwidthConfig, XrConfig};
use crate::dataplane::{
    source_key, DataplaneIpc, DataplaneLock, SourceEntry, SourceKey, StreamId, MAX_KNOWN_SOURCES,
};
use crate::error::{wrap, Error, ErrorInt, IpcCause, ResourceCause};
use crate::ids::MemberId;
use crate::rtcp::app::PpddParams;
use crate::rtp::member::MemberKind;
use crate::rtp::{NewSourceError, RemoveContext, RtpSessionOps, SessionBase};
use crate::upcall::{GenerationOutcome, GenerationTracker, UpcallEvent, UpcallKind};

use super::{build_report_packet, SessionState};

/// Counts each key's multiplicity so two tables can be compared as
/// multisets (spec.md §4.3 "the local cache must compare equal to the
/// dataplane table (multiset equality on the key tuple)") without requiring
/// `Ord` on [`SourceKey`].
fn key_multiset(keys: impl Iterator<Item = SourceKey>) -> HashMap<SourceKey, usize> {
    let mut counts = HashMap::new();
    for k in keys {
        *counts.entry(k).or_insert(0) += 1;
    }
    counts
}

/// The RCC burst-fill parameters a `PPDD` APP payload carries, handed back
/// to the channel so it can drive the RCC FSM and fast-fill accounting
/// (spec.md §4.3 step 3).
#[derive(Copy, Clone, Debug, Default)]
pub struct RccFillUpdate {
    pub act_rcc_fill_msec: Option<u32>,
    pub start_seq: Option<u16>,
    pub start_rtp_ts: Option<u32>,
}

impl From<PpddParams> for RccFillUpdate {
    fn from(p: PpddParams) -> Self {
        RccFillUpdate {
            act_rcc_fill_msec: p.act_rcc_fill_msec,
            start_seq: p.start_seq,
            start_rtp_ts: p.start_rtp_ts,
        }
    }
}

pub struct RepairSession<D: DataplaneIpc> {
    pub base: SessionBase,
    pub stream_id: StreamId,
    pub dataplane: Arc<DataplaneLock<D>>,
    /// `src_ids[0..MAX_KNOWN_SOURCES-1]`: the bounded dataplane source
    /// cache spec.md §3 names for the repair session specifically.
    pub known_sources: Vec<SourceEntry>,
    pub filter_ssrc: Option<u32>,
    pub state: SessionState,
    generation: GenerationTracker,
    /// Set once `shutdown_allow_byes` has run; see
    /// `PrimarySession`'s field of the same name.
    stats_cached: bool,
    last_error: Option<Error>,
}

impl<D: DataplaneIpc> RepairSession<D> {
    pub fn new(
        cname: String,
        send_addr: SocketAddr,
        rtcp_bw: RtcpBandwidthConfig,
        xr: XrConfig,
        local_ssrc: u32,
        stream_id: StreamId,
        dataplane: Arc<DataplaneLock<D>>,
        has_transmit_socket: bool,
    ) -> Self {
        Self {
            base: SessionBase::new(cname, send_addr, rtcp_bw, xr, has_transmit_socket)
                .with_local_ssrc(local_ssrc),
            stream_id,
            dataplane,
            known_sources: Vec::new(),
            filter_ssrc: None,
            state: SessionState::InactiveWaitFirst,
            generation: GenerationTracker::new(),
            stats_cached: false,
            last_error: None,
        }
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Refreshes `known_sources` from the dataplane's repair-stream table,
    /// truncating to [`MAX_KNOWN_SOURCES`] and logging how many entries
    /// were dropped if the dataplane reported more (spec.md §3 "Repair
    /// session" bound).
    pub fn refresh_known_sources(&mut self) -> Result<(), Error> {
        let mut table = self
            .dataplane
            .with(|d| d.src_get_table(self.stream_id))
            .map_err(|status| ipc_err(IpcCause::GetSrcTable, status))?;
        if table.len() > MAX_KNOWN_SOURCES {
            log::warn!(
                "repair session dataplane reported {} sources, truncating to {}",
                table.len(),
                MAX_KNOWN_SOURCES
            );
            table.truncate(MAX_KNOWN_SOURCES);
        }
        self.known_sources = table;
        Ok(())
    }

    /// `primary_pktflow_src_update(source_id)`: the repair session's
    /// override (spec.md §4.3) -- installs an SSRC filter on the repair
    /// stream, then: (1) removes RTP members no longer present in the
    /// filtered table, (2) admits table entries not yet known, (3) verifies
    /// the member table now multiset-equals the filtered table, and (4)
    /// records the filter. Any dataplane IPC failure along the way
    /// transitions the session to `Error` and clears the filter.
    pub fn install_ssrc_filter(&mut self, ssrc: u32) -> Result<(), Error> {
        if self.filter_ssrc == Some(ssrc) {
            return Ok(());
        }
        let table = match self.dataplane.with(|d| d.add_ssrc_filter(self.stream_id, ssrc)) {
            Ok(table) => table,
            Err(status) => {
                let err = ipc_err(IpcCause::Ssrc, status);
                self.enter_error_state(err.clone());
                return Err(err);
            }
        };

        let stale: Vec<MemberId> = self
            .base
            .member_ids()
            .filter(|&id| {
                self.base
                    .lookup_member(id)
                    .map(|m| !table.iter().any(|e| e.key == source_key(m.ssrc, m.addr)))
                    .unwrap_or(false)
            })
            .collect();
        for id in stale {
            self.delete_member(id, RemoveContext::FromUpcall)?;
        }

        if let Err(err) = self.admit_new_sources(&table) {
            self.enter_error_state(err.clone());
            return Err(err);
        }

        if !self.member_table_matches(&table) {
            let err = wrap!(ErrorInt::StateMismatch {
                channel_id: None,
                description: "repair member table disagrees with dataplane after ssrc filter \
                    install"
                    .into(),
            });
            self.enter_error_state(err.clone());
            return Err(err);
        }

        self.known_sources = table;
        self.filter_ssrc = Some(ssrc);
        self.state = SessionState::Active;
        Ok(())
    }

    pub fn remove_ssrc_filter(&mut self) -> Result<(), Error> {
        if self.filter_ssrc.is_none() {
            return Ok(());
        }
        self.dataplane
            .with(|d| d.del_ssrc_filter(self.stream_id))
            .map_err(|status| ipc_err(IpcCause::Ssrc, status))?;
        self.filter_ssrc = None;
        Ok(())
    }

    /// `enter_error_state`: clears the installed filter, per spec.md §4.3
    /// "Failure in any dataplane IPC in this routine transitions to Error
    /// and clears the filter."
    fn enter_error_state(&mut self, err: Error) {
        log::warn!("repair session entering error state: {}", err);
        self.filter_ssrc = None;
        self.state = SessionState::Error;
        self.last_error = Some(err);
    }

    /// Admits every table entry not already present as an RTP member
    /// (spec.md §4.3 "new entries ... are added via `new_data_source`").
    fn admit_new_sources(&mut self, table: &[SourceEntry]) -> Result<(), Error> {
        for entry in table {
            if self.base.find_member(entry.key.ssrc).is_some() {
                continue;
            }
            match self.base.new_data_source(
                MemberKind::RtpData,
                entry.key.ssrc,
                SocketAddr::new(entry.key.src_addr, entry.key.src_port),
                self.base.local.cname.clone(),
                0,
            ) {
                Ok(_) | Err(NewSourceError::SsrcExists) => {}
                Err(NewSourceError::MemberResourceFail) => {
                    return Err(wrap!(ErrorInt::ResourceExhaustion {
                        channel_id: None,
                        cause: ResourceCause::MaxSources,
                        description: format!(
                            "MAXSOURCES admitting {:08x} into repair member table",
                            entry.key.ssrc
                        ),
                    }));
                }
            }
        }
        Ok(())
    }

    /// Multiset-compares the RTP member table's source keys against a
    /// dataplane table (spec.md §4.3 "the local cache must compare equal to
    /// the dataplane table").
    fn member_table_matches(&self, table: &[SourceEntry]) -> bool {
        let member_keys = key_multiset(
            self.base
                .member_ids()
                .filter_map(|id| self.base.lookup_member(id))
                .map(|m| source_key(m.ssrc, m.addr)),
        );
        let table_keys = key_multiset(table.iter().map(|e| e.key));
        member_keys == table_keys
    }

    /// `Source reconciliation (upcall event)` (spec.md §4.3): every table
    /// entry must match the installed SSRC filter, if any; duplicate SSRCs
    /// with differing source addresses are rejected; new entries are
    /// admitted; and the cache must multiset-equal the table afterward, with
    /// one re-fetch retry before giving up.
    pub fn reconcile_source_table(&mut self, table: &[SourceEntry]) -> Result<(), Error> {
        self.reconcile_pass(table, true)
    }

    fn reconcile_pass(&mut self, table: &[SourceEntry], allow_retry: bool) -> Result<(), Error> {
        if let Some(filter) = self.filter_ssrc {
            if let Some(bad) = table.iter().find(|e| e.key.ssrc != filter) {
                let err = wrap!(ErrorInt::StateMismatch {
                    channel_id: None,
                    description: format!(
                        "source {:08x} does not match installed ssrc filter {:08x}",
                        bad.key.ssrc, filter
                    ),
                });
                self.enter_error_state(err.clone());
                return Err(err);
            }
        }

        for (i, a) in table.iter().enumerate() {
            for b in &table[i + 1..] {
                if a.key.ssrc == b.key.ssrc
                    && (a.key.src_addr, a.key.src_port) != (b.key.src_addr, b.key.src_port)
                {
                    let err = wrap!(ErrorInt::StateMismatch {
                        channel_id: None,
                        description: format!(
                            "duplicate ssrc {:08x} with differing source address in \
                                dataplane table",
                            a.key.ssrc
                        ),
                    });
                    self.enter_error_state(err.clone());
                    return Err(err);
                }
            }
        }

        if let Err(err) = self.admit_new_sources(table) {
            self.enter_error_state(err.clone());
            return Err(err);
        }

        self.known_sources = table.to_vec();
        if !self.member_table_matches(table) {
            if allow_retry {
                return match self.dataplane.with(|d| d.src_get_table(self.stream_id)) {
                    Ok(fresh) => self.reconcile_pass(&fresh, false),
                    Err(status) => {
                        let err = ipc_err(IpcCause::GetSrcTable, status);
                        self.enter_error_state(err.clone());
                        Err(err)
                    }
                };
            }
            let err = wrap!(ErrorInt::StateMismatch {
                channel_id: None,
                description: "repair session cache/table disagree after one re-fetch retry"
                    .into(),
            });
            self.enter_error_state(err.clone());
            return Err(err);
        }

        self.state = SessionState::Active;
        Ok(())
    }

    /// Processes a dataplane upcall targeting the repair stream: a
    /// `SourceTableChanged` event drives [`Self::reconcile_source_table`]
    /// against a freshly fetched table; other kinds are ignored here (they
    /// are the primary session's concern). Repeated or out-of-order
    /// generations are swallowed, mirroring `PrimarySession::process_upcall_event`.
    pub fn process_upcall_event(&mut self, event: UpcallEvent) -> Result<(), Error> {
        match self.generation.classify(event.generation) {
            GenerationOutcome::Repeated => return Ok(()),
            GenerationOutcome::Lost { missed } => {
                log::warn!(
                    "repair session missed {} upcall generation(s) before {:?}",
                    missed,
                    event.kind
                );
            }
            GenerationOutcome::InOrder => {}
        }
        if event.kind != UpcallKind::SourceTableChanged {
            return Ok(());
        }
        let table = self
            .dataplane
            .with(|d| d.src_get_table(self.stream_id))
            .map_err(|status| ipc_err(IpcCause::GetSrcTable, status))?;
        self.reconcile_source_table(&table)
    }

    /// Decodes a `PPDD` APP payload into the burst-fill parameters the
    /// channel needs; any malformed TLV is a protocol violation, per
    /// `PpddParams::decode`'s own contract.
    pub fn process_ppdd(&self, payload: &[u8]) -> Result<RccFillUpdate, Error> {
        PpddParams::decode(payload).map(RccFillUpdate::from)
    }
}

impl<D: DataplaneIpc> RtpSessionOps for RepairSession<D> {
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

    fn update_stats(&mut self, _reset_xr: bool) {}

    fn update_receiver_stats(&mut self, member: MemberId, reset_xr: bool) -> Result<(), Error> {
        if self.stats_cached {
            return Ok(());
        }
        let key = match self.base.lookup_member(member) {
            Some(m) => source_key(m.ssrc, m.addr),
            None => return Ok(()),
        };
        let info = self
            .dataplane
            .with(|d| d.src_get_info(self.stream_id, key, reset_xr))
            .map_err(|status| ipc_err(IpcCause::GetSrcInfo, status))?;
        if let Some(m) = self.base.lookup_member_mut(member) {
            m.received = info.received;
            m.jitter = f64::from(info.jitter);
        }
        Ok(())
    }

    fn shutdown_allow_byes(&mut self) -> Result<(), Error> {
        self.stats_cached = true;
        self.remove_ssrc_filter()
    }

    /// Overrides the base removal with the repair session's own IPC: a
    /// `src_delete` call only fires for `RemoveContext::UserInitiated`, so a
    /// dataplane upcall that re-enters `delete_member` for the same member
    /// naturally arrives with `FromUpcall` and skips IPC on its own.
    fn delete_member(&mut self, member: MemberId, ctx: RemoveContext) -> Result<(), Error> {
        let result = (|| {
            if ctx == RemoveContext::UserInitiated {
                if let Some(m) = self.base.lookup_member(member) {
                    let key = source_key(m.ssrc, m.addr);
                    self.dataplane
                        .with(|d| d.src_delete(self.stream_id, key))
                        .map_err(|status| ipc_err(IpcCause::DeleteSrc, status))?;
                }
            }
            Ok(())
        })();
        self.base.remove_member_by_id(member);
        result
    }

    fn primary_pktflow_src_update(&mut self, ssrc: u32) -> Result<(), Error> {
        self.install_ssrc_filter(ssrc)
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
    use crate::dataplane::{SourceKey, SourceState};
    use crate::rtp::member::MemberKind;
    use std::net::{IpAddr, Ipv4Addr};

    fn send_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6000)
    }

    fn session() -> RepairSession<MockDataplane> {
        RepairSession::new(
            "cname".into(),
            send_addr(),
            RtcpBandwidthConfig::default(),
            XrConfig::default(),
            0xAAAA_AAAA,
            StreamId(2),
            Arc::new(DataplaneLock::new(MockDataplane::default())),
            false,
        )
    }

    #[test]
    fn install_ssrc_filter_is_idempotent_for_same_ssrc() {
        let mut s = session();
        s.install_ssrc_filter(7).unwrap();
        assert_eq!(s.filter_ssrc, Some(7));
        // Second call with the same ssrc is a no-op, not a second IPC call.
        s.dataplane.with(|d| d.fail_next_filter = true);
        s.install_ssrc_filter(7).unwrap();
    }

    #[test]
    fn install_ssrc_filter_surfaces_ipc_error() {
        let mut s = session();
        s.dataplane.with(|d| d.fail_next_filter = true);
        let err = s.install_ssrc_filter(7).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Ipc);
    }

    #[test]
    fn refresh_known_sources_truncates_to_bound() {
        let mut s = session();
        let table: Vec<SourceEntry> = (0..MAX_KNOWN_SOURCES + 2)
            .map(|i| SourceEntry {
                key: SourceKey {
                    ssrc: i as u32,
                    src_addr: send_addr().ip(),
                    src_port: send_addr().port(),
                },
                state: SourceState::Active,
                pktflow_permitted: false,
                buffer_for_failover: false,
                thresh_cnt: 0,
                last_rx_time: Instant::now(),
                session_rtp_seq_num_offset: 0,
            })
            .collect();
        s.dataplane.with(|d| {
            d.tables.insert(StreamId(2), table);
        });
        s.refresh_known_sources().unwrap();
        assert_eq!(s.known_sources.len(), MAX_KNOWN_SOURCES);
    }

    #[test]
    fn process_ppdd_decodes_fill_params() {
        let s = session();
        let params = PpddParams {
            act_rcc_fill_msec: Some(250),
            start_seq: Some(10),
            start_rtp_ts: Some(90000),
            raw_tlvs: Vec::new(),
        };
        let update = s.process_ppdd(&params.encode()).unwrap();
        assert_eq!(update.act_rcc_fill_msec, Some(250));
        assert_eq!(update.start_seq, Some(10));
    }

    #[test]
    fn delete_member_from_upcall_skips_ipc() {
        let mut s = session();
        let member = s
            .base
            .new_data_source(MemberKind::RtpData, 99, send_addr(), "c".into(), 1)
            .unwrap();
        // FromUpcall must not attempt IPC (which would fail since the mock
        // table is empty for this stream/key) -- only UserInitiated does.
        s.delete_member(member, RemoveContext::FromUpcall).unwrap();
        assert!(s.base.lookup_member(member).is_none());
    }

    #[test]
    fn source_table_changed_upcall_admits_new_member() {
        let mut s = session();
        s.dataplane.with(|d| {
            d.tables.insert(
                StreamId(2),
                vec![SourceEntry {
                    key: SourceKey { ssrc: 5, src_addr: send_addr().ip(), src_port: send_addr().port() },
                    state: SourceState::Active,
                    pktflow_permitted: false,
                    buffer_for_failover: false,
                    thresh_cnt: 0,
                    last_rx_time: Instant::now(),
                    session_rtp_seq_num_offset: 0,
                }],
            )
        });
        let event = UpcallEvent::new(UpcallKind::SourceTableChanged, 0);
        s.process_upcall_event(event).unwrap();
        assert!(s.base.find_member(5).is_some());
        assert_eq!(s.state, SessionState::Active);
    }

    #[test]
    fn scenario_5_ssrc_filter_install_prunes_stale_members_without_ipc() {
        let mut s = session();
        let a = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 1)), 6000);
        let b = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 2)), 6000);
        let c = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 3)), 6000);
        s.base.new_data_source(MemberKind::RtpData, 0xA, a, "c".into(), 1).unwrap();
        s.base.new_data_source(MemberKind::RtpData, 0xB, b, "c".into(), 1).unwrap();
        s.base.new_data_source(MemberKind::RtpData, 0xC, c, "c".into(), 1).unwrap();

        // add_ssrc_filter(A) returns a post-filter table containing only A.
        s.dataplane.with(|d| {
            d.tables.insert(
                StreamId(2),
                vec![SourceEntry {
                    key: SourceKey { ssrc: 0xA, src_addr: a.ip(), src_port: a.port() },
                    state: SourceState::Active,
                    pktflow_permitted: true,
                    buffer_for_failover: false,
                    thresh_cnt: 0,
                    last_rx_time: Instant::now(),
                    session_rtp_seq_num_offset: 0,
                }],
            )
        });
        // No dataplane delete IPC should be issued for B or C; if the
        // recursive-delete suppression failed, this would be exercised and
        // the mock's table wouldn't change underneath us regardless, so we
        // assert directly on the resulting member/filter state instead.
        s.install_ssrc_filter(0xA).unwrap();

        assert!(s.base.find_member(0xA).is_some());
        assert!(s.base.find_member(0xB).is_none());
        assert!(s.base.find_member(0xC).is_none());
        assert_eq!(s.filter_ssrc, Some(0xA));
        assert_eq!(s.state, SessionState::Active);
    }

    #[test]
    fn non_source_table_upcall_is_ignored() {
        let mut s = session();
        let event = UpcallEvent::new(UpcallKind::BurstDone, 0);
        s.process_upcall_event(event).unwrap();
        assert_eq!(s.state, SessionState::InactiveWaitFirst);
    }
}
