// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTCP parsing/construction: standard [RFC 3550]/[RFC 4585] packet types
//! plus the non-standard extensions spec.md §6/§8.2 names: PUBPORTS, the
//! `PPDD`/`PLII`/`NCSI` APP payloads, Generic NACK FCIs, and XR blocks.
//!
//! [RFC 3550]: https://datatracker.ietf.org/doc/html/rfc3550
//! [RFC 4585]: https://datatracker.ietf.org/doc/html/rfc4585

pub mod app;
pub mod nack;
pub mod pubports;
pub mod xr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pretty_hex::PrettyHex;

use crate::error::{wrap, Error, ErrorInt};

pub const VERSION: u8 = 2;

pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;
pub const PT_APP: u8 = 204;
pub const PT_RTPFB: u8 = 205;
pub const PT_PSFB: u8 = 206;
pub const PT_XR: u8 = 207;

/// RTPFB "Feedback Message Type" for Generic NACK (RFC 4585 §6.2.1).
pub const FMT_GENERIC_NACK: u8 = 1;
/// PSFB "Feedback Message Type" for Picture Loss Indication (RFC 4585 §6.3.1).
pub const FMT_PLI: u8 = 1;

/// A single reception report block, common to SR and RR (RFC 3550 §6.4.1/2).
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: u32, // 24-bit signed-ish count, stored widened
    pub extended_highest_seq: u32,
    pub jitter: u32,
    pub lsr: u32,
    pub dlsr: u32,
}

impl ReportBlock {
    const LEN: usize = 24;

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        let lost24 = self.cumulative_lost & 0x00FF_FFFF;
        buf.put_u8(self.fraction_lost);
        buf.put_u8(((lost24 >> 16) & 0xFF) as u8);
        buf.put_u8(((lost24 >> 8) & 0xFF) as u8);
        buf.put_u8((lost24 & 0xFF) as u8);
        buf.put_u32(self.extended_highest_seq);
        buf.put_u32(self.jitter);
        buf.put_u32(self.lsr);
        buf.put_u32(self.dlsr);
    }

    fn parse(mut b: &[u8]) -> Option<(Self, &[u8])> {
        if b.len() < Self::LEN {
            return None;
        }
        let ssrc = b.get_u32();
        let fraction_lost = b.get_u8();
        let lost = (u32::from(b.get_u8()) << 16) | (u32::from(b.get_u8()) << 8) | u32::from(b.get_u8());
        let extended_highest_seq = b.get_u32();
        let jitter = b.get_u32();
        let lsr = b.get_u32();
        let dlsr = b.get_u32();
        Some((
            ReportBlock {
                ssrc,
                fraction_lost,
                cumulative_lost: lost,
                extended_highest_seq,
                jitter,
                lsr,
                dlsr,
            },
            b,
        ))
    }
}

#[derive(Clone, Debug, Default)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReportBlock>,
}

#[derive(Clone, Debug, Default)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReportBlock>,
}

#[derive(Clone, Debug, Default)]
pub struct Bye {
    pub ssrcs: Vec<u32>,
    pub reason: Option<String>,
}

/// A parsed RTCP sub-packet. `Unknown` preserves the payload type for
/// logging, matching the sibling RTSP client's own `rtcp::Packet::Unknown`.
#[derive(Clone, Debug)]
pub enum Packet {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    Bye(Bye),
    App(app::AppPacket),
    GenericNack(nack::GenericNack),
    Pli(nack::Pli),
    PubPorts(pubports::PubPorts),
    Unknown { payload_type: u8 },
}

/// The fixed 4-byte RTCP common header (RFC 3550 §6.1).
struct Header {
    version: u8,
    padding: bool,
    count: u8,
    payload_type: u8,
    length_words: u16,
}

impl Header {
    const LEN: usize = 4;

    fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < Self::LEN {
            return None;
        }
        let b0 = b[0];
        Some(Header {
            version: b0 >> 6,
            padding: (b0 & 0x20) != 0,
            count: b0 & 0x1F,
            payload_type: b[1],
            length_words: u16::from_be_bytes([b[2], b[3]]),
        })
    }

    fn write(payload_type: u8, count: u8, length_words: u16, buf: &mut BytesMut) {
        buf.put_u8((VERSION << 6) | (count & 0x1F));
        buf.put_u8(payload_type);
        buf.put_u16(length_words);
    }
}

impl Packet {
    /// Parses one RTCP sub-packet from the front of `data`, returning the
    /// remaining bytes. Mirrors the sibling RTSP client's
    /// `rtcp::Packet::parse`, extended with the non-standard types this
    /// control plane must understand.
    pub fn parse(data: &[u8]) -> Result<(Packet, &[u8]), Error> {
        let hdr = Header::parse(data).ok_or_else(|| {
            log::debug!("short RTCP header:\n{:?}", data.hex_dump());
            wrap_proto("RTCP packet shorter than 4-byte header")
        })?;
        if hdr.version != VERSION {
            log::debug!("bad RTCP version {}:\n{:?}", hdr.version, data.hex_dump());
            return Err(wrap_proto("bad RTCP version"));
        }
        let total_len = (usize::from(hdr.length_words) + 1) * 4;
        if data.len() < total_len {
            log::debug!(
                "RTCP length_words={} exceeds buffer:\n{:?}",
                hdr.length_words,
                data.hex_dump()
            );
            return Err(wrap_proto("RTCP length exceeds buffer"));
        }
        let (body, rest) = data.split_at(total_len);
        let mut payload = &body[Header::LEN..];
        if hdr.padding {
            if let Some(&pad) = payload.last() {
                if usize::from(pad) <= payload.len() {
                    payload = &payload[..payload.len() - usize::from(pad)];
                }
            }
        }

        let pkt = match hdr.payload_type {
            PT_SR => {
                if payload.len() < 20 {
                    return Err(wrap_proto("SR shorter than fixed part"));
                }
                let mut b = payload;
                let ssrc = b.get_u32();
                let ntp_timestamp = b.get_u64();
                let rtp_timestamp = b.get_u32();
                let packet_count = b.get_u32();
                let octet_count = b.get_u32();
                let mut reports = Vec::with_capacity(usize::from(hdr.count));
                let mut rest_b = b;
                for _ in 0..hdr.count {
                    match ReportBlock::parse(rest_b) {
                        Some((rb, r)) => {
                            reports.push(rb);
                            rest_b = r;
                        }
                        None => return Err(wrap_proto("truncated SR report block")),
                    }
                }
                Packet::SenderReport(SenderReport {
                    ssrc,
                    ntp_timestamp,
                    rtp_timestamp,
                    packet_count,
                    octet_count,
                    reports,
                })
            }
            PT_RR => {
                if payload.len() < 4 {
                    return Err(wrap_proto("RR shorter than fixed part"));
                }
                let mut b = payload;
                let ssrc = b.get_u32();
                let mut reports = Vec::with_capacity(usize::from(hdr.count));
                let mut rest_b = b;
                for _ in 0..hdr.count {
                    match ReportBlock::parse(rest_b) {
                        Some((rb, r)) => {
                            reports.push(rb);
                            rest_b = r;
                        }
                        None => return Err(wrap_proto("truncated RR report block")),
                    }
                }
                Packet::ReceiverReport(ReceiverReport { ssrc, reports })
            }
            PT_BYE => {
                let mut b = payload;
                let mut ssrcs = Vec::with_capacity(usize::from(hdr.count));
                for _ in 0..hdr.count {
                    if b.remaining() < 4 {
                        return Err(wrap_proto("truncated BYE"));
                    }
                    ssrcs.push(b.get_u32());
                }
                let reason = if b.has_remaining() {
                    let len = usize::from(b.get_u8());
                    if b.remaining() < len {
                        None
                    } else {
                        let s = String::from_utf8_lossy(&b[..len]).into_owned();
                        Some(s)
                    }
                } else {
                    None
                };
                Packet::Bye(Bye { ssrcs, reason })
            }
            PT_APP => app::AppPacket::parse(hdr.count, payload).map(Packet::App)?,
            PT_RTPFB if hdr.count == FMT_GENERIC_NACK => {
                nack::GenericNack::parse(payload).map(Packet::GenericNack)?
            }
            PT_PSFB if hdr.count == FMT_PLI => Packet::Pli(nack::Pli::parse(payload)?),
            pubports::PT_PUBPORTS => Packet::PubPorts(pubports::PubPorts::parse(payload)?),
            _ => Packet::Unknown {
                payload_type: hdr.payload_type,
            },
        };
        Ok((pkt, rest))
    }

    /// Serialises this sub-packet, appending to `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        match self {
            Packet::SenderReport(sr) => {
                let len_words = (6 + sr.reports.len() * (ReportBlock::LEN / 4)) as u16;
                Header::write(PT_SR, sr.reports.len() as u8, len_words, buf);
                buf.put_u32(sr.ssrc);
                buf.put_u64(sr.ntp_timestamp);
                buf.put_u32(sr.rtp_timestamp);
                buf.put_u32(sr.packet_count);
                buf.put_u32(sr.octet_count);
                for rb in &sr.reports {
                    rb.write(buf);
                }
            }
            Packet::ReceiverReport(rr) => {
                let len_words = (1 + rr.reports.len() * (ReportBlock::LEN / 4)) as u16;
                Header::write(PT_RR, rr.reports.len() as u8, len_words, buf);
                buf.put_u32(rr.ssrc);
                for rb in &rr.reports {
                    rb.write(buf);
                }
            }
            Packet::Bye(bye) => {
                let reason_bytes = bye.reason.as_deref().map(str::as_bytes);
                let reason_len = reason_bytes.map_or(0, |r| 1 + r.len());
                let words = (bye.ssrcs.len() * 4 + reason_len).div_ceil(4) as u16;
                Header::write(PT_BYE, bye.ssrcs.len() as u8, words, buf);
                for &s in &bye.ssrcs {
                    buf.put_u32(s);
                }
                if let Some(r) = reason_bytes {
                    buf.put_u8(r.len() as u8);
                    buf.put_slice(r);
                }
                pad_to_word(buf);
            }
            Packet::App(app) => app.write(buf),
            Packet::GenericNack(nack) => nack.write(buf),
            Packet::Pli(pli) => pli.write(buf),
            Packet::PubPorts(pp) => pp.write(buf),
            Packet::Unknown { .. } => {}
        }
    }
}

fn pad_to_word(buf: &mut BytesMut) {
    while buf.len() % 4 != 0 {
        buf.put_u8(0);
    }
}

fn wrap_proto(description: &str) -> Error {
    wrap!(ErrorInt::ProtocolViolation {
        channel_id: None,
        member_id: None,
        description: description.to_string(),
    })
}

/// Serialises a compound RTCP packet (one or more sub-packets
/// back-to-back, as RFC 3550 §6.1 requires for a valid compound).
pub fn write_compound(packets: &[Packet]) -> Bytes {
    let mut buf = BytesMut::new();
    for p in packets {
        p.write(&mut buf);
    }
    buf.freeze()
}

/// Parses every sub-packet out of a compound RTCP datagram.
pub fn parse_compound(mut data: &[u8]) -> Result<Vec<Packet>, Error> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let (pkt, rest) = Packet::parse(data)?;
        out.push(pkt);
        data = rest;
    }
    Ok(out)
}
