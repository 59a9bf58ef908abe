// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the control plane.
//!
//! Mirrors the shape used throughout this crate's RTSP-client sibling: a
//! cheaply-`Clone`-able [`Error`] wrapping an `Arc<ErrorInt>` so that it can
//! be stashed on a session (e.g. the last IPC failure cause) without forcing
//! callers to choose between `Clone` and owning the full backtrace-ish
//! context. There is no panic or `unwrap` in non-test code anywhere in this
//! crate; every fallible boundary returns `Result<_, Error>`.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::ids::{ChannelId, MemberId};

/// Opaque error type. See [`ErrorInt`] for the variants; they're private so
/// callers match on [`Error::kind`] instead of the internal representation.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the coarse-grained kind from spec.md's error-handling table.
    pub fn kind(&self) -> ErrorKind {
        self.0.kind()
    }
}

/// The six error kinds from the error-handling design: each names a raise
/// condition and a handling policy, not a concrete type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgs,
    Ipc,
    ResourceExhaustion,
    ProtocolViolation,
    StateMismatch,
    FatalResource,
}

#[derive(Debug)]
pub(crate) enum ErrorInt {
    /// Null pointers, out-of-range enums, malformed inputs at an API boundary.
    InvalidArgs { description: String },

    /// A dataplane IPC call returned a non-`Ok` status.
    Ipc {
        channel_id: Option<ChannelId>,
        cause: IpcCause,
        description: String,
    },

    /// Pool allocation failure / too many sources.
    ResourceExhaustion {
        channel_id: Option<ChannelId>,
        cause: ResourceCause,
        description: String,
    },

    /// Bad RTCP length, bad version, unexpected attribute, APP parse failure.
    ProtocolViolation {
        channel_id: Option<ChannelId>,
        member_id: Option<MemberId>,
        description: String,
    },

    /// Control-plane and dataplane source tables disagree.
    StateMismatch {
        channel_id: Option<ChannelId>,
        description: String,
    },

    /// Timer creation or socket bind failure during session init.
    FatalResource { description: String },
}

impl ErrorInt {
    fn kind(&self) -> ErrorKind {
        match self {
            ErrorInt::InvalidArgs { .. } => ErrorKind::InvalidArgs,
            ErrorInt::Ipc { .. } => ErrorKind::Ipc,
            ErrorInt::ResourceExhaustion { .. } => ErrorKind::ResourceExhaustion,
            ErrorInt::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            ErrorInt::StateMismatch { .. } => ErrorKind::StateMismatch,
            ErrorInt::FatalResource { .. } => ErrorKind::FatalResource,
        }
    }
}

/// Named IPC failure causes used for the per-channel error counters (§7,
/// "per-channel error counters exposed through the CLI").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IpcCause {
    PermitFlow,
    Ssrc,
    GetSrcInfo,
    GetSrcTable,
    DeleteSrc,
    GapReport,
    RccStatus,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceCause {
    MaxSources,
    MemberPool,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &*self.0 {
            ErrorInt::InvalidArgs { description } => write!(f, "invalid args: {}", description),
            ErrorInt::Ipc {
                channel_id,
                cause,
                description,
            } => write!(
                f,
                "dataplane ipc error {:?} on {:?}: {}",
                cause, channel_id, description
            ),
            ErrorInt::ResourceExhaustion {
                channel_id,
                cause,
                description,
            } => write!(
                f,
                "resource exhaustion {:?} on {:?}: {}",
                cause, channel_id, description
            ),
            ErrorInt::ProtocolViolation {
                channel_id,
                member_id,
                description,
            } => write!(
                f,
                "protocol violation on {:?}/{:?}: {}",
                channel_id, member_id, description
            ),
            ErrorInt::StateMismatch {
                channel_id,
                description,
            } => write!(f, "cp/dp state mismatch on {:?}: {}", channel_id, description),
            ErrorInt::FatalResource { description } => {
                write!(f, "fatal resource error: {}", description)
            }
        }
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl std::error::Error for Error {}

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub(crate) use bail;
pub(crate) use wrap;
