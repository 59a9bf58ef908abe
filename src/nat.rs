// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! NAT binding coordinator (spec.md §4 "NAT binding coordinator (shim to
//! NAT module)"). The STUN codec and the NAT module's own resolution logic
//! are external collaborators (spec.md §1); this is the shim surface the
//! channel holds four instances of (primary rtp/rtcp, repair rtp/rtcp) and
//! the events it raises into the RCC FSM.

use std::net::SocketAddr;

use crate::ids::NatBindingKind;

/// One of the channel's four NAT bindings, each with a "complete" flag
/// (spec.md §3, "Channel").
#[derive(Clone, Debug)]
pub struct NatBinding {
    pub kind: NatBindingKind,
    pub mapped_addr: Option<SocketAddr>,
    pub complete: bool,
}

impl NatBinding {
    pub fn new(kind: NatBindingKind) -> Self {
        Self {
            kind,
            mapped_addr: None,
            complete: false,
        }
    }

    /// Applies a STUN binding-response result. Returns `true` if this call
    /// is the one that flipped `complete` from false to true (the RTP/RTCP
    /// binding-completion edge the RCC FSM cares about -- spec.md §8
    /// scenario 6: "rtp_nat_update ... FSM does not fire" vs
    /// "rtcp_nat_update ... FSM receives NatBindingComplete exactly once").
    pub fn resolve(&mut self, mapped_addr: SocketAddr) -> bool {
        let became_complete = !self.complete;
        self.mapped_addr = Some(mapped_addr);
        self.complete = true;
        became_complete
    }
}

/// The four NAT bindings a channel owns. Only the RTCP bindings feed the
/// RCC FSM's `NatBindingComplete` event (spec.md §8 scenario 6); the RTP
/// bindings exist purely for PUBPORTS publication once resolved.
pub struct NatBindings {
    pub primary_rtp: NatBinding,
    pub primary_rtcp: NatBinding,
    pub repair_rtp: NatBinding,
    pub repair_rtcp: NatBinding,
}

impl NatBindings {
    pub fn new() -> Self {
        Self {
            primary_rtp: NatBinding::new(NatBindingKind::PrimaryRtp),
            primary_rtcp: NatBinding::new(NatBindingKind::PrimaryRtcp),
            repair_rtp: NatBinding::new(NatBindingKind::RepairRtp),
            repair_rtcp: NatBinding::new(NatBindingKind::RepairRtcp),
        }
    }

    /// The PUBPORTS attribute's `(rtp_port, rtcp_port)` pair for the
    /// `primary` flag's chosen stream (spec.md §4.1 "PUBPORTS extension").
    pub fn pubports_pair(&self, primary: bool) -> Option<(u16, u16)> {
        let (rtp, rtcp) = if primary {
            (&self.primary_rtp, &self.primary_rtcp)
        } else {
            (&self.repair_rtp, &self.repair_rtcp)
        };
        match (rtp.mapped_addr, rtcp.mapped_addr) {
            (Some(r), Some(c)) => Some((r.port(), c.port())),
            _ => None,
        }
    }
}

impl Default for NatBindings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), port)
    }

    #[test]
    fn scenario_6_only_rtcp_binding_signals_completion() {
        let mut b = NatBindings::new();
        // Resolving the RTP binding completes it, but the FSM only acts on
        // the RTCP binding's completion edge (spec.md §8 scenario 6).
        assert!(b.primary_rtp.resolve(addr(5000)));
        let became_complete = b.primary_rtcp.resolve(addr(5001));
        assert!(became_complete);
        assert!(b.primary_rtcp.complete);
    }

    #[test]
    fn resolve_is_idempotent_after_first_completion() {
        let mut binding = NatBinding::new(NatBindingKind::PrimaryRtcp);
        assert!(binding.resolve(addr(100)));
        assert!(!binding.resolve(addr(200)));
    }
}
