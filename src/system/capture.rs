// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use pcap::{Active, Capture, Offline};
use thiserror::Error;

use crate::configuration::{CaptureOptions, SourceType};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open capture source: {0}")]
    Unavailable(#[source] pcap::Error),
    #[error("capture filter rejected: {0}")]
    FilterRejected(#[source] pcap::Error),
    #[error("capture read failed: {0}")]
    Read(#[source] pcap::Error),
    #[error("offline capture requires capture.pcap_file")]
    MissingPcapFile,
}

/// Link layer the capture handle produces frames in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    /// Linux cooked capture, what libpcap uses for the "any" device.
    LinuxSll,
    /// Raw IP, no link header.
    Raw,
}

/// Result of one read from the capture handle.
pub enum Captured<'a> {
    Frame {
        data: &'a [u8],
        timestamp: DateTime<Utc>,
        truncated: bool,
    },
    /// Poll timeout on a live handle; lets the caller check for shutdown.
    TimedOut,
    /// End of an offline file.
    Eof,
}

/// A capture handle in one of the three recognized modes: live libpcap,
/// live with an explicitly sized kernel ring (`af_packet`), or an offline
/// pcap file.
pub enum CaptureSource {
    Live(Capture<Active>),
    Offline(Capture<Offline>),
}

impl CaptureSource {
    pub fn open(options: &CaptureOptions) -> Result<Self, CaptureError> {
        match options.source_type {
            SourceType::Pcap | SourceType::AfPacket => {
                let mut inactive = Capture::from_device(options.device.as_str())
                    .map_err(CaptureError::Unavailable)?
                    .promisc(true)
                    .snaplen(options.snaplen)
                    .timeout(1000);
                if let SourceType::AfPacket = options.source_type {
                    inactive = inactive.buffer_size(options.bufsize_mb.saturating_mul(1024 * 1024));
                }
                let capture = inactive.open().map_err(CaptureError::Unavailable)?;
                Ok(CaptureSource::Live(capture))
            }
            SourceType::Offline => {
                let path = options
                    .pcap_file
                    .as_ref()
                    .ok_or(CaptureError::MissingPcapFile)?;
                let capture = Capture::from_file(path).map_err(CaptureError::Unavailable)?;
                Ok(CaptureSource::Offline(capture))
            }
        }
    }

    /// Install a BPF program on the handle.
    pub fn set_filter(&mut self, program: &str) -> Result<(), CaptureError> {
        match self {
            CaptureSource::Live(capture) => capture.filter(program, true),
            CaptureSource::Offline(capture) => capture.filter(program, true),
        }
        .map_err(CaptureError::FilterRejected)
    }

    pub fn datalink(&self) -> LinkLayer {
        let linktype = match self {
            CaptureSource::Live(capture) => capture.get_datalink(),
            CaptureSource::Offline(capture) => capture.get_datalink(),
        };
        match linktype.0 {
            1 => LinkLayer::Ethernet,
            113 => LinkLayer::LinuxSll,
            12 | 101 => LinkLayer::Raw,
            other => {
                tracing::warn!(linktype = other, "unexpected datalink, assuming ethernet");
                LinkLayer::Ethernet
            }
        }
    }

    /// Read the next frame. Blocks up to the poll timeout on live handles.
    pub fn next_frame(&mut self) -> Result<Captured<'_>, CaptureError> {
        let packet = match self {
            CaptureSource::Live(capture) => capture.next_packet(),
            CaptureSource::Offline(capture) => capture.next_packet(),
        };
        match packet {
            Ok(packet) => {
                let header = *packet.header;
                let since_epoch = Duration::from_secs(header.ts.tv_sec.max(0) as u64)
                    + Duration::from_micros(header.ts.tv_usec.max(0) as u64);
                Ok(Captured::Frame {
                    data: packet.data,
                    timestamp: DateTime::<Utc>::from(UNIX_EPOCH + since_epoch),
                    truncated: header.caplen < header.len,
                })
            }
            Err(pcap::Error::TimeoutExpired) => Ok(Captured::TimedOut),
            Err(pcap::Error::NoMorePackets) => Ok(Captured::Eof),
            Err(error) => Err(CaptureError::Read(error)),
        }
    }

    /// Kernel capture statistics. Only meaningful for live handles;
    /// offline captures report nothing.
    pub fn stats(&mut self) -> Option<pcap::Stat> {
        match self {
            CaptureSource::Live(capture) => capture.stats().ok(),
            CaptureSource::Offline(_) => None,
        }
    }
}
