// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The private PUBPORTS RTCP attribute (spec.md §4.1, §6): publishes the
//! client's externally-visible RTP/RTCP ports discovered via NAT.
//!
//! **Known wire quirk, preserved intentionally** (spec.md §9 "Open
//! questions"): `rtp_port`/`rtcp_port` are written in host byte order on
//! the wire, unlike every other address/port attribute in this protocol
//! family (which convert to network order). Do not "fix" this — a
//! corrected encoder would fail to interoperate with deployed peers.

use bytes::{Buf, BufMut, BytesMut};

use super::Header;
use crate::error::{wrap, Error, ErrorInt};

/// PT is implementation-defined per spec.md §6 ("type=0x8027?-impl-defined").
pub const PT_PUBPORTS: u8 = 0xA7;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PubPorts {
    pub ssrc_media_sender: u32,
    /// Written verbatim in host order -- see module docs.
    pub rtp_port_host_order: u16,
    /// Written verbatim in host order -- see module docs.
    pub rtcp_port_host_order: u16,
}

impl PubPorts {
    const LEN: usize = 8;

    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() < Self::LEN {
            return Err(wrap!(ErrorInt::ProtocolViolation {
                channel_id: None,
                member_id: None,
                description: "truncated PUBPORTS attribute".to_string(),
            }));
        }
        let mut b = payload;
        let ssrc_media_sender = b.get_u32();
        // Host-order on the wire: read with native_endian semantics by
        // reconstructing from the same byte layout the sender used.
        let rtp_port_host_order = u16::from_ne_bytes([b[0], b[1]]);
        let rtcp_port_host_order = u16::from_ne_bytes([b[2], b[3]]);
        Ok(PubPorts {
            ssrc_media_sender,
            rtp_port_host_order,
            rtcp_port_host_order,
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        Header::write(PT_PUBPORTS, 0, 1, buf);
        buf.put_u32(self.ssrc_media_sender);
        buf.extend_from_slice(&self.rtp_port_host_order.to_ne_bytes());
        buf.extend_from_slice(&self.rtcp_port_host_order.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_in_host_order() {
        let pp = PubPorts {
            ssrc_media_sender: 0xDEAD_BEEF,
            rtp_port_host_order: 40000,
            rtcp_port_host_order: 40001,
        };
        let mut buf = BytesMut::new();
        pp.write(&mut buf);
        let parsed = PubPorts::parse(&buf[4..]).unwrap();
        assert_eq!(parsed, pp);
    }
}
