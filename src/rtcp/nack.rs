// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RFC 4585 Generic NACK (§6.2.1) and Picture Loss Indication (§6.3.1), the
//! two feedback messages the gap reporter (spec.md §4.5) and the RCC state
//! machine (spec.md §4.4) emit.

use bytes::{Buf, BufMut, BytesMut};

use super::Header;
use crate::error::{wrap, Error, ErrorInt};

/// One `(PID, BLP)` pair: `pid` is the lost packet's sequence number, `blp`
/// is a bitmask covering 16 further sequence numbers immediately following
/// `pid` (spec.md §4.5's "FCI" and §9's load-bearing bit-order note: bit 0
/// is the MSB, corresponding to `pid + 1`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NackPair {
    pub pid: u16,
    pub blp: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GenericNack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub pairs: Vec<NackPair>,
}

impl GenericNack {
    pub(super) fn parse(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() < 8 || (payload.len() - 8) % 4 != 0 {
            return Err(bad_len("malformed Generic NACK"));
        }
        let mut b = payload;
        let sender_ssrc = b.get_u32();
        let media_ssrc = b.get_u32();
        let mut pairs = Vec::with_capacity(b.remaining() / 4);
        while b.has_remaining() {
            let pid = b.get_u16();
            let blp = b.get_u16();
            pairs.push(NackPair { pid, blp });
        }
        Ok(GenericNack {
            sender_ssrc,
            media_ssrc,
            pairs,
        })
    }

    pub(super) fn write(&self, buf: &mut BytesMut) {
        let words = (2 + self.pairs.len()) as u16;
        Header::write(super::PT_RTPFB, super::FMT_GENERIC_NACK, words, buf);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        for p in &self.pairs {
            buf.put_u16(p.pid);
            buf.put_u16(p.blp);
        }
    }
}

/// `ssrc_media_sender = 0` always, per spec.md §4.4's PLI-NAK payload rule.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Pli {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

impl Pli {
    pub(super) fn parse(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() < 8 {
            return Err(bad_len("malformed PLI"));
        }
        let mut b = payload;
        Ok(Pli {
            sender_ssrc: b.get_u32(),
            media_ssrc: b.get_u32(),
        })
    }

    pub(super) fn write(&self, buf: &mut BytesMut) {
        Header::write(super::PT_PSFB, super::FMT_PLI, 2, buf);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
    }
}

fn bad_len(description: &str) -> Error {
    wrap!(ErrorInt::ProtocolViolation {
        channel_id: None,
        member_id: None,
        description: description.to_string(),
    })
}

/// Greedily groups a flat, ascending (mod 2^32) list of lost sequence
/// numbers into Generic NACK FCIs, per spec.md §4.5:
///
/// * The current FCI is keyed by `pid`, the smallest sequence number it
///   covers.
/// * A sequence `s` fits the current FCI iff `s == pid` or
///   `1 <= s - pid <= 16` (mod 2^16 arithmetic, since these are RTP
///   sequence numbers).
/// * Bit `k` of the mask corresponds to `pid + k + 1`, with bit 0 as the
///   MSB: `bitmask |= 1 << (16 - (s - pid))`.
///
/// `FCI_MAX` truncation is the caller's responsibility (this returns every
/// FCI the input implies); see [`crate::dataplane::FCI_MAX`].
pub fn build_fcis(seqs: &[u16]) -> Vec<NackPair> {
    let mut out = Vec::new();
    let mut current: Option<(u16, u16)> = None; // (pid, blp)
    for &s in seqs {
        match current {
            None => current = Some((s, 0)),
            Some((pid, blp)) => {
                let delta = s.wrapping_sub(pid);
                if s == pid {
                    // duplicate, ignore
                } else if delta >= 1 && delta <= 16 {
                    let bit = 16 - delta;
                    current = Some((pid, blp | (1 << bit)));
                } else {
                    out.push(NackPair { pid, blp });
                    current = Some((s, 0));
                }
            }
        }
    }
    if let Some((pid, blp)) = current {
        out.push(NackPair { pid, blp });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraparound_run_groups_into_single_fci() {
        // A contiguous lost run wrapping across 0xFFFF -> 0x0000 still
        // groups into one FCI (policer interaction is exercised in
        // gap_reporter's own tests, not here).
        let seqs: Vec<u16> = (65528u32..=65535)
            .chain(0..=1)
            .map(|s| s as u16)
            .collect();
        let fcis = build_fcis(&seqs);
        assert_eq!(fcis.len(), 1);
        assert_eq!(fcis[0].pid, 65528);
        // 65529..65535 and 0,1 all fit within pid+1..pid+16 (mod 2^16).
    }

    #[test]
    fn scenario_3_seq_wrap_fci_grouping() {
        // Gaps {(65528,0),(0,3),(5,0),(20,0),(36,0)} expand to:
        // 65528, 0,1,2,3, 5, 20, 36
        let seqs: Vec<u16> = vec![65528, 0, 1, 2, 3, 5, 20, 36];
        let fcis = build_fcis(&seqs);
        // FCI #1 covers 65528..=5 (delta 5-65528 mod 2^16 = 13, within 16).
        assert_eq!(fcis[0].pid, 65528);
        let expect_bits = |offsets: &[u16]| -> u16 {
            offsets.iter().fold(0u16, |acc, &d| acc | (1 << (16 - d)))
        };
        assert_eq!(fcis[0].blp, expect_bits(&[8, 9, 10, 11, 13]));
        // 20 is more than 16 past 5, so it starts FCI #2; 36 is exactly
        // 16 past 20, fitting in the same FCI.
        assert_eq!(fcis[1].pid, 20);
        assert_eq!(fcis[1].blp, expect_bits(&[16]));
    }

    #[test]
    fn single_sequence_emits_one_fci_with_zero_mask() {
        let fcis = build_fcis(&[42]);
        assert_eq!(fcis, vec![NackPair { pid: 42, blp: 0 }]);
    }

    #[test]
    fn nack_round_trips() {
        let nack = GenericNack {
            sender_ssrc: 1,
            media_ssrc: 2,
            pairs: vec![NackPair { pid: 10, blp: 0x8001 }],
        };
        let mut buf = BytesMut::new();
        nack.write(&mut buf);
        let parsed = GenericNack::parse(&buf[4..]).unwrap();
        assert_eq!(parsed, nack);
    }
}
