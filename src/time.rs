// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wall-clock and monotonic time helpers.
//!
//! The control plane schedules almost everything off
//! [`std::time::Instant`], but RTCP Sender Reports carry a wallclock NTP
//! timestamp ([RFC 3550 §4]) that has to be formattable for logging. This
//! mirrors the sibling RTSP client's `WallTime`/`NtpTimestamp` types.
//!
//! [RFC 3550 §4]: https://datatracker.ietf.org/doc/html/rfc3550#section-4

use std::fmt::{Debug, Display};

pub const UNIX_EPOCH: NtpTimestamp = NtpTimestamp((2_208_988_800) << 32);

/// A wallclock time represented using the 64-bit fixed-point NTP format:
/// the top 32 bits are seconds since 1900-01-01, the bottom 32 bits are a
/// binary fraction of a second.
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    /// Builds an NTP timestamp from the current wall clock.
    pub fn now() -> Self {
        let now = time::get_time();
        let secs = (now.sec as u64).wrapping_add(2_208_988_800);
        let frac = (((now.nsec as u64) << 32) / 1_000_000_000) & 0xFFFF_FFFF;
        NtpTimestamp((secs << 32) | frac)
    }
}

impl Display for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let since_epoch = self.0.wrapping_sub(UNIX_EPOCH.0);
        let sec_since_epoch = (since_epoch >> 32) as i64;
        let tm = time::at(time::Timespec {
            sec: sec_since_epoch,
            nsec: 0,
        });
        let ms = ((since_epoch & 0xFFFF_FFFF) * 1_000) >> 32;
        write!(
            f,
            "{}.{:03}Z",
            tm.strftime("%FT%T").map_err(|_| std::fmt::Error)?,
            ms,
        )
    }
}

impl Debug for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} /* {} */", self.0, self)
    }
}

/// A wall time taken from the local machine's realtime clock, used only in
/// diagnostics (log lines, RCC log ring entries).
#[derive(Copy, Clone, Debug)]
pub struct WallTime(time::Timespec);

impl WallTime {
    pub fn now() -> Self {
        Self(time::get_time())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(
            &time::at(self.0)
                .strftime("%FT%T")
                .map_err(|_| std::fmt::Error)?,
            f,
        )
    }
}
