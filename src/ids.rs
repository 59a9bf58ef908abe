// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Opaque identifiers threaded through the control plane instead of raw
//! pointers. Per spec.md §9 ("cyclic ownership"): members hold no pointer
//! back to their session, sessions hold no pointer back to their channel —
//! everything is resolved through a handle and the module-global registry.

use std::fmt;

/// Identifies a live channel in the global channel registry
/// ([`crate::registry::Registry`]).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub(crate) u32);

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan#{}", self.0)
    }
}

/// A small handle into a session's flat member vector. `u16` is enough: the
/// repair session's source cache is bounded by
/// [`crate::dataplane::MAX_KNOWN_SOURCES`] and the primary session never
/// carries more than a handful of live senders at once.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId(pub(crate) u16);

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member#{}", self.0)
    }
}

/// Identifies a bound output tuner attached to a channel.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct TunerId(pub u32);

impl fmt::Debug for TunerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tuner#{}", self.0)
    }
}

/// One of the four dataplane input streams a channel owns.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Primary,
    Repair,
    Fec0,
    Fec1,
}

/// A dataplane input-stream id, scoped to a [`StreamKind`].
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// A dataplane graph id (one per dataplane worker the channel is bound to).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GraphId(pub u32);

/// One of the four NAT bindings (primary rtp/rtcp, repair rtp/rtcp) a channel
/// may hold, each tracked via the NAT module shim (spec.md §4, "NAT binding
/// coordinator").
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NatBindingKind {
    PrimaryRtp,
    PrimaryRtcp,
    RepairRtp,
    RepairRtcp,
}
