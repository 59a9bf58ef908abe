// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The dataplane IPC boundary (spec.md §6 "Dataplane IPC (consumed)").
//!
//! The dataplane itself is out of scope (spec.md §1): here it is a trait,
//! [`DataplaneIpc`], so the reconciliation, gap-reporter, and RCC logic in
//! this crate can be exercised against a [`MockDataplane`] without a real
//! dataplane process. Every call is synchronous but may block (spec.md §5);
//! callers are expected to hold [`DataplaneLock`] for the duration.

use std::net::{IpAddr, SocketAddr};

use parking_lot::Mutex;

pub use crate::ids::StreamId;

/// `src_ids[0..MAX_KNOWN_SOURCES-1]`: the repair session's bounded source
/// cache (spec.md §3, "Repair session").
pub const MAX_KNOWN_SOURCES: usize = 3;

/// `FCI_MAX`: the max number of Generic NACK FCIs in a single gap report
/// round (spec.md §4.5). Implementation-defined, "≥ 16".
pub const FCI_MAX: usize = 64;

/// The dataplane's per-source key: `(ssrc, ipv4.src_addr, ipv4.src_port)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub ssrc: u32,
    pub src_addr: IpAddr,
    pub src_port: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SourceState {
    Active,
    Inactive,
}

/// A dataplane source-table entry, as observed by the control plane
/// (spec.md §3, "Dataplane source table entry").
#[derive(Clone, Debug, PartialEq)]
pub struct SourceEntry {
    pub key: SourceKey,
    pub state: SourceState,
    pub pktflow_permitted: bool,
    pub buffer_for_failover: bool,
    pub thresh_cnt: u32,
    pub last_rx_time: std::time::Instant,
    pub session_rtp_seq_num_offset: i16,
}

/// Per-source receiver statistics returned by `get_src_info`.
#[derive(Copy, Clone, Debug, Default)]
pub struct SrcInfo {
    pub received: u64,
    pub cycles: u32,
    pub max_seq: u16,
    pub base_seq: u32,
    pub bad_seq: u32,
    pub jitter: u32,
    pub out_of_order: u64,
}

/// `(start_seq, extent)`: a run of lost sequence numbers, as the dataplane
/// reports loss (spec.md §4.5 "Gap harvesting"). `extent` is the count of
/// additional lost sequence numbers after `start_seq` (so the run covers
/// `start_seq ..= start_seq + extent`, modulo 2^32, truncated to u16 seq
/// space by the caller).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GapEntry {
    pub start_seq: u16,
    pub extent: u16,
}

/// Bounded list of gaps returned by a single `get_gap_report` call.
#[derive(Clone, Debug, Default)]
pub struct GapReport {
    pub gaps: Vec<GapEntry>,
}

/// RCC burst/backfill status, as reported by `get_rcc_status`.
#[derive(Copy, Clone, Debug, Default)]
pub struct RccStatus {
    pub actual_fill_msec: u32,
    pub current_fill_msec: u32,
}

/// A uniform, non-`Ok` dataplane status. Each fallible [`DataplaneIpc`]
/// method returns `Result<T, IpcStatus>`; callers translate a non-`Ok`
/// status into an [`crate::error::Error`] of kind
/// [`crate::error::ErrorKind::Ipc`] via [`crate::error::IpcCause`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IpcStatus {
    NotFound,
    InvalidArgs,
    SsrcExists,
    MaxSources,
    MemberResourceFail,
    Other,
}

/// The dataplane IPC surface consumed by the control plane (spec.md §6).
///
/// Implementations must be safe to call while [`DataplaneLock`] is held;
/// the core never calls into the dataplane without holding it (spec.md §5).
pub trait DataplaneIpc: Send {
    fn src_get_info(
        &mut self,
        stream_id: StreamId,
        key: SourceKey,
        reset_xr: bool,
    ) -> Result<SrcInfo, IpcStatus>;

    fn src_get_table(&mut self, stream_id: StreamId) -> Result<Vec<SourceEntry>, IpcStatus>;

    fn src_delete(&mut self, stream_id: StreamId, key: SourceKey) -> Result<(), IpcStatus>;

    /// Returns the RTP sequence-number offset needed to splice the newly
    /// permitted source's sequence space onto the previous one.
    fn src_permit_pktflow(
        &mut self,
        stream_id: StreamId,
        key: SourceKey,
    ) -> Result<i16, IpcStatus>;

    fn add_ssrc_filter(
        &mut self,
        stream_id: StreamId,
        ssrc: u32,
    ) -> Result<Vec<SourceEntry>, IpcStatus>;

    fn del_ssrc_filter(&mut self, stream_id: StreamId) -> Result<(), IpcStatus>;

    fn get_gap_report(&mut self, stream_id: StreamId) -> Result<GapReport, IpcStatus>;

    fn get_rcc_status(&mut self, stream_id: StreamId) -> Result<RccStatus, IpcStatus>;
}

/// The process-wide lock serialising all dataplane IPC (spec.md §5): "a
/// single global lock is acquired around any IPC into the dataplane so that
/// upcalls delivered from dataplane context see a consistent control-plane
/// state."
pub struct DataplaneLock<D: DataplaneIpc> {
    inner: Mutex<D>,
}

impl<D: DataplaneIpc> DataplaneLock<D> {
    pub fn new(ipc: D) -> Self {
        Self {
            inner: Mutex::new(ipc),
        }
    }

    /// Runs `f` with exclusive access to the dataplane IPC handle.
    pub fn with<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }
}

/// `(orig_src << 32) | orig_port`: the primary session-identifier derived
/// from the original source address/port (spec.md §4.2 "Creation
/// contract").
pub fn session_id(orig_src: u32, orig_port: u16) -> u64 {
    (u64::from(orig_src) << 32) | u64::from(orig_port)
}

/// Builds a [`SourceKey`] from a socket address and ssrc, the shape every
/// reconciliation routine needs before calling into [`DataplaneIpc`].
pub fn source_key(ssrc: u32, addr: SocketAddr) -> SourceKey {
    SourceKey {
        ssrc,
        src_addr: addr.ip(),
        src_port: addr.port(),
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    //! A deterministic, in-memory stand-in for a real dataplane, driven by
    //! tests of the reconciliation and gap-reporter logic.

    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct MockDataplane {
        pub tables: HashMap<StreamId, Vec<SourceEntry>>,
        pub gap_reports: HashMap<StreamId, GapReport>,
        pub infos: HashMap<(StreamId, SourceKey), SrcInfo>,
        pub fail_next_permit: bool,
        pub fail_next_filter: bool,
        pub pktflow_offset: i16,
    }

    impl DataplaneIpc for MockDataplane {
        fn src_get_info(
            &mut self,
            stream_id: StreamId,
            key: SourceKey,
            _reset_xr: bool,
        ) -> Result<SrcInfo, IpcStatus> {
            self.infos
                .get(&(stream_id, key))
                .copied()
                .ok_or(IpcStatus::NotFound)
        }

        fn src_get_table(&mut self, stream_id: StreamId) -> Result<Vec<SourceEntry>, IpcStatus> {
            Ok(self.tables.get(&stream_id).cloned().unwrap_or_default())
        }

        fn src_delete(&mut self, stream_id: StreamId, key: SourceKey) -> Result<(), IpcStatus> {
            if let Some(table) = self.tables.get_mut(&stream_id) {
                let before = table.len();
                table.retain(|e| e.key != key);
                if table.len() == before {
                    return Err(IpcStatus::NotFound);
                }
            }
            Ok(())
        }

        fn src_permit_pktflow(
            &mut self,
            stream_id: StreamId,
            key: SourceKey,
        ) -> Result<i16, IpcStatus> {
            if self.fail_next_permit {
                self.fail_next_permit = false;
                return Err(IpcStatus::Other);
            }
            if let Some(table) = self.tables.get_mut(&stream_id) {
                if let Some(e) = table.iter_mut().find(|e| e.key == key) {
                    e.pktflow_permitted = true;
                }
            }
            Ok(self.pktflow_offset)
        }

        fn add_ssrc_filter(
            &mut self,
            stream_id: StreamId,
            ssrc: u32,
        ) -> Result<Vec<SourceEntry>, IpcStatus> {
            if self.fail_next_filter {
                self.fail_next_filter = false;
                return Err(IpcStatus::Other);
            }
            let table = self.tables.get(&stream_id).cloned().unwrap_or_default();
            let filtered: Vec<_> = table.into_iter().filter(|e| e.key.ssrc == ssrc).collect();
            self.tables.insert(stream_id, filtered.clone());
            Ok(filtered)
        }

        fn del_ssrc_filter(&mut self, _stream_id: StreamId) -> Result<(), IpcStatus> {
            Ok(())
        }

        fn get_gap_report(&mut self, stream_id: StreamId) -> Result<GapReport, IpcStatus> {
            Ok(self.gap_reports.remove(&stream_id).unwrap_or_default())
        }

        fn get_rcc_status(&mut self, _stream_id: StreamId) -> Result<RccStatus, IpcStatus> {
            Ok(RccStatus::default())
        }
    }
}
