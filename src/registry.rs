// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The global channel registry (spec.md §9's `g_channel_module` substitute):
//! a single process-wide table mapping [`ChannelId`] to [`Channel`], plus
//! the process-wide "concurrent RCC" accounting that has to be visible
//! across every channel rather than living on one.

use std::collections::HashMap;

use crate::channel::Channel;
use crate::config::GlobalConfig;
use crate::dataplane::DataplaneIpc;
use crate::error::{bail, Error, ErrorInt, ResourceCause};
use crate::ids::ChannelId;

/// Owns every live channel and the process-wide config/counters spec.md §9
/// stores in file-scope globals (`g_channel_module`,
/// `s_rtp_era_error_cause`). A single [`Registry`] is meant to be the one
/// instance a process constructs, held behind whatever synchronisation the
/// embedding binary needs -- this crate itself stays synchronisation-free
/// beyond [`crate::dataplane::DataplaneLock`], per spec.md §5.
pub struct Registry<D: DataplaneIpc> {
    config: GlobalConfig,
    channels: HashMap<ChannelId, Channel<D>>,
    next_id: u32,
    concurrent_rcc: u32,
    last_rtp_era_error: Option<Error>,
}

impl<D: DataplaneIpc> Registry<D> {
    pub fn new(config: GlobalConfig) -> Self {
        Self {
            config,
            channels: HashMap::new(),
            next_id: 1,
            concurrent_rcc: 0,
            last_rtp_era_error: None,
        }
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Allocates a fresh [`ChannelId`] and inserts `build`'s channel under
    /// it. `build` receives the id so it can thread it through the channel
    /// it constructs.
    pub fn insert(&mut self, build: impl FnOnce(ChannelId) -> Channel<D>) -> ChannelId {
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        let chan = build(id);
        self.channels.insert(id, chan);
        id
    }

    pub fn remove(&mut self, id: ChannelId) -> Option<Channel<D>> {
        self.channels.remove(&id)
    }

    /// `chanid_to_chan`.
    pub fn get(&self, id: ChannelId) -> Option<&Channel<D>> {
        self.channels.get(&id)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel<D>> {
        self.channels.get_mut(&id)
    }

    pub fn channel_ids(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.keys().copied()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Admits a new RCC attempt against `max_concurrent_rcc`
    /// (spec.md §6 "process-wide"). Returns the `ResourceExhaustion` error
    /// the caller should feed into the channel's own RCC-abort path rather
    /// than starting the FSM at all.
    pub fn admit_rcc_attempt(&mut self) -> Result<(), Error> {
        if self.concurrent_rcc >= self.config.max_concurrent_rcc {
            bail!(ErrorInt::ResourceExhaustion {
                channel_id: None,
                cause: ResourceCause::MaxSources,
                description: format!(
                    "max_concurrent_rcc={} already in flight",
                    self.config.max_concurrent_rcc
                ),
            });
        }
        self.concurrent_rcc += 1;
        Ok(())
    }

    pub fn release_rcc_attempt(&mut self) {
        self.concurrent_rcc = self.concurrent_rcc.saturating_sub(1);
    }

    pub fn concurrent_rcc(&self) -> u32 {
        self.concurrent_rcc
    }

    /// `s_rtp_era_error_cause`: the last RTP-era-wide error, independent of
    /// any one channel, surfaced for diagnostics.
    pub fn set_last_rtp_era_error(&mut self, err: Error) {
        self.last_rtp_era_error = Some(err);
    }

    pub fn last_rtp_era_error(&self) -> Option<&Error> {
        self.last_rtp_era_error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, RtcpBandwidthConfig, XrConfig};
    use crate::dataplane::{mock::MockDataplane, DataplaneLock, StreamId};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;

    fn chan_config() -> ChannelConfig {
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
            max_recv_bw_rcc_bps: 1,
            max_recv_bw_er_bps: 1,
            use_rcc_bw_for_er: false,
            fec_recv_bw_bps: 0,
            fastfill_start_set: false,
            fastfill_abort_set: false,
            fastfill_done_set: false,
            er_policer_enabled: false,
            er_policer_rate: 0.0,
            er_policer_burst: 0,
            bye_delay: Duration::from_secs(1),
            cname: "c".into(),
        }
    }

    #[test]
    fn insert_assigns_increasing_ids() {
        let mut reg: Registry<MockDataplane> = Registry::new(GlobalConfig::default());
        let dataplane = Arc::new(DataplaneLock::new(MockDataplane::default()));
        let id1 = reg.insert(|id| {
            Channel::new(id, chan_config(), dataplane.clone(), StreamId(1), StreamId(2), 1)
        });
        let id2 = reg.insert(|id| {
            Channel::new(id, chan_config(), dataplane.clone(), StreamId(3), StreamId(4), 2)
        });
        assert_ne!(id1, id2);
        assert_eq!(reg.channel_count(), 2);
    }

    #[test]
    fn admit_rcc_attempt_respects_max_concurrent() {
        let mut cfg = GlobalConfig::default();
        cfg.max_concurrent_rcc = 1;
        let mut reg: Registry<MockDataplane> = Registry::new(cfg);
        reg.admit_rcc_attempt().unwrap();
        let err = reg.admit_rcc_attempt().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhaustion);
        reg.release_rcc_attempt();
        reg.admit_rcc_attempt().unwrap();
    }
}
