// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

use std::{fmt, net::IpAddr};

/// TCP 4-tuple identifying one direction of a connection.
///
/// The tuple in the opposite direction is `reverse()`; both map onto the
/// same `canonical()` form, which is what the flow map is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowTuple {
    pub fn new(src_ip: IpAddr, dst_ip: IpAddr, src_port: u16, dst_port: u16) -> Self {
        FlowTuple {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        }
    }

    pub fn reverse(self) -> Self {
        FlowTuple {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    /// Orientation-independent form, identical for both halves of a
    /// connection.
    pub fn canonical(self) -> Self {
        if (self.src_ip, self.src_port) <= (self.dst_ip, self.dst_port) {
            self
        } else {
            self.reverse()
        }
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port,
        )
    }
}
