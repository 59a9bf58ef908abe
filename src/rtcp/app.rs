// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTCP-APP sub-packet handling (spec.md §4.3, §4.4, §6): the `PPDD` RCC
//! parameter blob (decoded by an external TLV decoder we only call
//! through), and the `PLII`/`NCSI` TLV payloads this crate both encodes and
//! decodes.

use bytes::{Buf, BufMut, BytesMut};

use super::Header;
use crate::error::{wrap, Error, ErrorInt};

pub const NAME_PPDD: [u8; 4] = *b"PPDD";
pub const NAME_PLII: [u8; 4] = *b"PLII";
pub const NAME_NCSI: [u8; 4] = *b"NCSI";

/// A generic decoded RTCP-APP sub-packet: `(ssrc, name, payload)`.
#[derive(Clone, Debug)]
pub struct AppPacket {
    pub subtype: u8,
    pub ssrc: u32,
    pub name: [u8; 4],
    pub payload: Vec<u8>,
}

impl AppPacket {
    pub(super) fn parse(subtype: u8, payload: &[u8]) -> Result<Self, Error> {
        if payload.len() < 8 {
            return Err(bad_len("APP shorter than 8-byte fixed part"));
        }
        let mut b = payload;
        let ssrc = b.get_u32();
        let mut name = [0u8; 4];
        name.copy_from_slice(&b[..4]);
        b.advance(4);
        Ok(AppPacket {
            subtype,
            ssrc,
            name,
            payload: b.to_vec(),
        })
    }

    pub(super) fn write(&self, buf: &mut BytesMut) {
        let words = (8 + self.payload.len()).div_ceil(4) as u16;
        Header::write(super::PT_APP, self.subtype, words - 1, buf);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.name);
        buf.put_slice(&self.payload);
        super::pad_to_word(buf);
    }

    pub fn is_named(&self, name: [u8; 4]) -> bool {
        self.name == name
    }
}

fn bad_len(description: &str) -> Error {
    wrap!(ErrorInt::ProtocolViolation {
        channel_id: None,
        member_id: None,
        description: description.to_string(),
    })
}

/// `RTCP-APP PLII` TLVs (spec.md §4.4 "PLI-NAK payload"): the server-bound
/// RCC parameter set sent alongside the PSFB-PLI requesting a burst.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PliiParams {
    pub min_rcc_fill_msec: u32,
    pub max_rcc_fill_msec: u32,
    pub do_fastfill: bool,
    pub maximum_recv_bw_bps: u32,
    pub maximum_fastfill_time_msec: u32,
}

const TLV_MIN_FILL: u8 = 1;
const TLV_MAX_FILL: u8 = 2;
const TLV_DO_FASTFILL: u8 = 3;
const TLV_MAX_RECV_BW: u8 = 4;
const TLV_MAX_FASTFILL_TIME: u8 = 5;

impl PliiParams {
    /// Encodes as a sequence of `(tag: u8, len: u8, value)` TLVs, each value
    /// stored big-endian as the wire-format note in spec.md §6 describes
    /// ("the encoder converts at serialisation").
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_u32_tlv(&mut out, TLV_MIN_FILL, self.min_rcc_fill_msec);
        push_u32_tlv(&mut out, TLV_MAX_FILL, self.max_rcc_fill_msec);
        push_u32_tlv(&mut out, TLV_DO_FASTFILL, self.do_fastfill as u32);
        push_u32_tlv(&mut out, TLV_MAX_RECV_BW, self.maximum_recv_bw_bps);
        push_u32_tlv(&mut out, TLV_MAX_FASTFILL_TIME, self.maximum_fastfill_time_msec);
        out
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, Error> {
        let mut out = Self::default();
        while !payload.is_empty() {
            let (tag, value, rest) = pop_u32_tlv(payload)?;
            payload = rest;
            match tag {
                TLV_MIN_FILL => out.min_rcc_fill_msec = value,
                TLV_MAX_FILL => out.max_rcc_fill_msec = value,
                TLV_DO_FASTFILL => out.do_fastfill = value != 0,
                TLV_MAX_RECV_BW => out.maximum_recv_bw_bps = value,
                TLV_MAX_FASTFILL_TIME => out.maximum_fastfill_time_msec = value,
                _ => {} // unknown TLVs are ignored, not fatal.
            }
        }
        Ok(out)
    }
}

/// `RTCP-APP NCSI` TLVs (spec.md §4.4 "NCSI emission").
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NcsiParams {
    pub first_mcast_seq_number: u16,
    pub first_mcast_recv_time_msec: u32,
}

const TLV_FIRST_SEQ: u8 = 1;
const TLV_FIRST_RECV_TIME: u8 = 2;

impl NcsiParams {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_u32_tlv(&mut out, TLV_FIRST_SEQ, u32::from(self.first_mcast_seq_number));
        push_u32_tlv(&mut out, TLV_FIRST_RECV_TIME, self.first_mcast_recv_time_msec);
        out
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, Error> {
        let mut out = Self::default();
        while !payload.is_empty() {
            let (tag, value, rest) = pop_u32_tlv(payload)?;
            payload = rest;
            match tag {
                TLV_FIRST_SEQ => out.first_mcast_seq_number = value as u16,
                TLV_FIRST_RECV_TIME => out.first_mcast_recv_time_msec = value,
                _ => {}
            }
        }
        Ok(out)
    }
}

fn push_u32_tlv(out: &mut Vec<u8>, tag: u8, value: u32) {
    out.push(tag);
    out.push(4);
    out.extend_from_slice(&value.to_be_bytes());
}

fn pop_u32_tlv(b: &[u8]) -> Result<(u8, u32, &[u8]), Error> {
    if b.len() < 2 {
        return Err(bad_len("truncated TLV header"));
    }
    let tag = b[0];
    let len = usize::from(b[1]);
    if b.len() < 2 + len || len != 4 {
        return Err(bad_len("truncated or malformed TLV value"));
    }
    let value = u32::from_be_bytes([b[2], b[3], b[4], b[5]]);
    Ok((tag, value, &b[2 + len..]))
}

/// A decoded `PPDD` payload, as `ppdd_tlv_decode_allocate` produces (spec.md
/// §4.3 step 3). The decoder itself is an external collaborator (spec.md
/// §1); this just carries the generic `(tag, value)` pairs it would hand
/// back, keyed by the RCC fields the channel's process routine consumes.
#[derive(Clone, Debug, Default)]
pub struct PpddParams {
    pub act_rcc_fill_msec: Option<u32>,
    pub start_seq: Option<u16>,
    pub start_rtp_ts: Option<u32>,
    pub raw_tlvs: Vec<(u8, Vec<u8>)>,
}

const TLV_ACT_FILL: u8 = 1;
const TLV_START_SEQ: u8 = 2;
const TLV_START_TS: u8 = 3;

impl PpddParams {
    /// Stand-in for `ppdd_tlv_decode_allocate`: permissive, unknown-tag
    /// tolerant TLV decode. Malformed length fields are a hard error so the
    /// caller can take the same `BadLen`/`Unexp` path spec.md §4.3 step 1
    /// names.
    pub fn decode(mut payload: &[u8]) -> Result<Self, Error> {
        let mut out = Self::default();
        while !payload.is_empty() {
            if payload.len() < 2 {
                return Err(bad_len("truncated PPDD TLV header"));
            }
            let tag = payload[0];
            let len = usize::from(payload[1]);
            if payload.len() < 2 + len {
                return Err(bad_len("truncated PPDD TLV value"));
            }
            let value = &payload[2..2 + len];
            match (tag, len) {
                (TLV_ACT_FILL, 4) => {
                    out.act_rcc_fill_msec = Some(u32::from_be_bytes(value.try_into().unwrap()))
                }
                (TLV_START_SEQ, 2) => {
                    out.start_seq = Some(u16::from_be_bytes(value.try_into().unwrap()))
                }
                (TLV_START_TS, 4) => {
                    out.start_rtp_ts = Some(u32::from_be_bytes(value.try_into().unwrap()))
                }
                _ => out.raw_tlvs.push((tag, value.to_vec())),
            }
            payload = &payload[2 + len..];
        }
        Ok(out)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(v) = self.act_rcc_fill_msec {
            push_u32_tlv(&mut out, TLV_ACT_FILL, v);
        }
        if let Some(v) = self.start_seq {
            out.push(TLV_START_SEQ);
            out.push(2);
            out.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(v) = self.start_rtp_ts {
            push_u32_tlv(&mut out, TLV_START_TS, v);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plii_round_trips() {
        let p = PliiParams {
            min_rcc_fill_msec: 100,
            max_rcc_fill_msec: 1000,
            do_fastfill: false,
            maximum_recv_bw_bps: 4_000_000,
            maximum_fastfill_time_msec: 0,
        };
        let encoded = p.encode();
        let decoded = PliiParams::decode(&encoded).unwrap();
        assert_eq!(p, decoded);
    }

    #[test]
    fn ncsi_round_trips() {
        let p = NcsiParams {
            first_mcast_seq_number: 4242,
            first_mcast_recv_time_msec: 123_456,
        };
        let decoded = NcsiParams::decode(&p.encode()).unwrap();
        assert_eq!(p, decoded);
    }

    #[test]
    fn ppdd_decodes_known_and_preserves_unknown_tlvs() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&[TLV_ACT_FILL, 4]);
        raw.extend_from_slice(&500u32.to_be_bytes());
        raw.extend_from_slice(&[9, 2, 0xAB, 0xCD]); // unknown tag
        let decoded = PpddParams::decode(&raw).unwrap();
        assert_eq!(decoded.act_rcc_fill_msec, Some(500));
        assert_eq!(decoded.raw_tlvs, vec![(9, vec![0xAB, 0xCD])]);
    }

    #[test]
    fn ppdd_rejects_truncated_tlv() {
        assert!(PpddParams::decode(&[TLV_ACT_FILL, 4, 0, 0]).is_err());
    }
}
