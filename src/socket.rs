// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The RTCP transmit socket (spec.md §6 "Dataplane sockets"), bound and
//! connected the way the sibling RTSP client pairs its RTP/RTCP UDP
//! sockets (`UdpPair`). Inbound RTCP never arrives through this socket
//! directly in this crate's model -- it is delivered as a dataplane upcall
//! -- so this type only ever sends.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

pub struct RtcpSocket(UdpSocket);

impl RtcpSocket {
    /// Binds `local` and connects to `remote` so that `try_send` never
    /// needs the destination repeated per call.
    pub async fn connect(local: SocketAddr, remote: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        Ok(Self(socket))
    }

    /// Sends `buf` without blocking. A full kernel send queue drops the
    /// report rather than stall the caller -- consistent with RTCP's own
    /// tolerance for an occasional lost report (spec.md §4.1).
    pub fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_send(buf)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }
}
