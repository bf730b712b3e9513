// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

use std::net::IpAddr;

use smoltcp::wire::{
    EthernetFrame, EthernetProtocol, IpProtocol as Protocol, Ipv4Packet, Ipv6Packet, TcpPacket,
};
use thiserror::Error;

use super::capture::LinkLayer;

/// Linux cooked (SLL) header is fixed 16 bytes; the ethertype sits in the
/// last two.
const SLL_HEADER_LEN: usize = 16;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame too short")]
    Short,
    #[error("unsupported layer stack")]
    UnknownLayer,
    #[error("malformed packet")]
    Malformed,
}

/// Borrowed view of one decoded TCP segment. Valid only until the next
/// frame is read from the capture handle.
#[derive(Debug)]
pub struct SegmentView<'a> {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub fin: bool,
    pub rst: bool,
    pub payload: &'a [u8],
}

/// Fixed-order single-pass decoder: link layer, then IPv4 or IPv6, then
/// TCP. Built once per capture handle and reused for every frame.
pub struct PacketDecoder {
    link: LinkLayer,
}

impl PacketDecoder {
    pub fn new(link: LinkLayer) -> Self {
        PacketDecoder { link }
    }

    pub fn decode<'a>(&self, frame: &'a [u8]) -> Result<SegmentView<'a>, DecodeError> {
        let ip = match self.link {
            LinkLayer::Ethernet => {
                let frame = EthernetFrame::new_checked(frame).map_err(|_| DecodeError::Short)?;
                match frame.ethertype() {
                    EthernetProtocol::Ipv4 | EthernetProtocol::Ipv6 => frame.payload(),
                    _ => return Err(DecodeError::UnknownLayer),
                }
            }
            LinkLayer::LinuxSll => {
                if frame.len() < SLL_HEADER_LEN {
                    return Err(DecodeError::Short);
                }
                let ethertype = u16::from_be_bytes([frame[14], frame[15]]);
                match ethertype {
                    ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => &frame[SLL_HEADER_LEN..],
                    _ => return Err(DecodeError::UnknownLayer),
                }
            }
            LinkLayer::Raw => frame,
        };
        decode_ip(ip)
    }
}

fn decode_ip(buf: &[u8]) -> Result<SegmentView<'_>, DecodeError> {
    if buf.is_empty() {
        return Err(DecodeError::Short);
    }
    match buf[0] >> 4 {
        4 => {
            let packet = Ipv4Packet::new_checked(buf).map_err(|_| DecodeError::Malformed)?;
            if packet.protocol() != Protocol::Tcp {
                return Err(DecodeError::UnknownLayer);
            }
            decode_tcp(
                packet.src_addr().0.into(),
                packet.dst_addr().0.into(),
                packet.payload(),
            )
        }
        6 => {
            let packet = Ipv6Packet::new_checked(buf).map_err(|_| DecodeError::Malformed)?;
            if packet.next_header() != Protocol::Tcp {
                return Err(DecodeError::UnknownLayer);
            }
            decode_tcp(
                packet.src_addr().0.into(),
                packet.dst_addr().0.into(),
                packet.payload(),
            )
        }
        _ => Err(DecodeError::UnknownLayer),
    }
}

fn decode_tcp(src_ip: IpAddr, dst_ip: IpAddr, buf: &[u8]) -> Result<SegmentView<'_>, DecodeError> {
    let tcp = TcpPacket::new_checked(buf).map_err(|_| DecodeError::Malformed)?;
    Ok(SegmentView {
        src_ip,
        dst_ip,
        src_port: tcp.src_port(),
        dst_port: tcp.dst_port(),
        seq: tcp.seq_number().0 as u32,
        fin: tcp.fin(),
        rst: tcp.rst(),
        payload: tcp.payload(),
    })
}

#[cfg(test)]
mod tests {
    use super::{DecodeError, LinkLayer, PacketDecoder};

    /// Hand-assembled IPv4 + TCP segment carrying `payload`.
    pub(crate) fn build_ipv4_tcp(
        src: [u8; 4],
        dst: [u8; 4],
        src_port: u16,
        dst_port: u16,
        seq: u32,
        payload: &[u8],
    ) -> Vec<u8> {
        let total_len = 20 + 20 + payload.len();
        let mut buf = Vec::with_capacity(total_len);
        // IPv4 header, no options
        buf.push(0x45);
        buf.push(0);
        buf.extend_from_slice(&(total_len as u16).to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]); // id, flags
        buf.push(64); // ttl
        buf.push(6); // tcp
        buf.extend_from_slice(&[0, 0]); // checksum (unchecked)
        buf.extend_from_slice(&src);
        buf.extend_from_slice(&dst);
        // TCP header, no options
        buf.extend_from_slice(&src_port.to_be_bytes());
        buf.extend_from_slice(&dst_port.to_be_bytes());
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]); // ack
        buf.push(5 << 4); // data offset
        buf.push(0x18); // psh|ack
        buf.extend_from_slice(&[0xff, 0xff]); // window
        buf.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn decodes_raw_ipv4_tcp() {
        let frame = build_ipv4_tcp([10, 0, 0, 22], [10, 0, 0, 23], 44444, 27017, 1000, b"hello");
        let decoder = PacketDecoder::new(LinkLayer::Raw);
        let view = decoder.decode(&frame).unwrap();
        assert_eq!(view.src_ip, "10.0.0.22".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(view.dst_ip, "10.0.0.23".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(view.src_port, 44444);
        assert_eq!(view.dst_port, 27017);
        assert_eq!(view.seq, 1000);
        assert_eq!(view.payload, b"hello");
    }

    #[test]
    fn decodes_sll_wrapped_ipv4() {
        let inner = build_ipv4_tcp([10, 0, 0, 22], [10, 0, 0, 23], 44444, 3306, 7, b"x");
        let mut frame = vec![0u8; 14];
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        frame.extend_from_slice(&inner);
        let decoder = PacketDecoder::new(LinkLayer::LinuxSll);
        let view = decoder.decode(&frame).unwrap();
        assert_eq!(view.dst_port, 3306);
        assert_eq!(view.payload, b"x");
    }

    #[test]
    fn non_tcp_is_not_fatal() {
        let mut frame = build_ipv4_tcp([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, 0, b"");
        frame[9] = 17; // udp
        let decoder = PacketDecoder::new(LinkLayer::Raw);
        match decoder.decode(&frame) {
            Err(DecodeError::UnknownLayer) => (),
            other => panic!("expected UnknownLayer, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        let decoder = PacketDecoder::new(LinkLayer::Raw);
        assert!(decoder.decode(&[0x45, 0x00, 0x00]).is_err());
        assert!(decoder.decode(&[]).is_err());
    }
}
