// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Control plane for a rapid-channel-change (RCC) / error-repair RTP video
//! receiver: RTP/RTCP session and member tables, control-plane/dataplane
//! source reconciliation, the RCC state machine, the gap-reporter error
//! policer, NAT binding coordination, and the non-standard RTCP extensions
//! (`PUBPORTS`, `PLII`, `NCSI`, XR) a deployed peer expects.
//!
//! This crate owns only the decision-making: the dataplane that actually
//! moves RTP packets, and the STUN/NAT resolution itself, are external
//! collaborators reached through the [`dataplane::DataplaneIpc`] trait and
//! the [`nat`] module's shim types respectively. See `DESIGN.md` for how
//! each module is grounded.

pub mod channel;
pub mod config;
pub mod dataplane;
pub mod diag;
pub mod error;
pub mod gap_reporter;
pub mod ids;
pub mod nat;
pub mod policer;
pub mod rcc;
pub mod registry;
pub mod rtcp;
pub mod rtp;
pub mod session;
pub mod socket;
pub mod time;
pub mod upcall;

pub use error::{Error, ErrorKind};
pub use ids::ChannelId;
