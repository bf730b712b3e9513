// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

use chrono::{DateTime, Utc};

use super::flow::FlowTuple;

/// One decoded TCP segment, owned.
///
/// The decoder yields borrowed views into the capture buffer; the capture
/// thread copies the payload into a `Segment` before handing it over the
/// channel to the assembler, because the underlying frame is only valid
/// until the next read.
#[derive(Debug, Clone)]
pub struct Segment {
    pub tuple: FlowTuple,
    pub seq: u32,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub fin: bool,
    pub rst: bool,
    pub truncated: bool,
}
