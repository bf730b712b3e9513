// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

//! Flow demultiplexer and TCP reassembler.
//!
//! One logical connection per canonical flow tuple, two half-connections
//! per connection. Processing starts with the first segment seen; there
//! is no wait for a handshake, because long-lived database connections
//! frequently pre-date the agent. Segments are delivered downstream in
//! strictly increasing sequence order per direction; a sequence hole that
//! outlives `flush_timeout` is skipped and surfaces as a message
//! boundary with a skipped-byte count.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::{
    messages::{flow::FlowTuple, segment::Segment},
    protocols::ParserFactory,
    publish::Publish,
    system::stream::{Direction, StreamHandle},
    utility::metrics,
};

/// Flush sweep cadence in packets, besides the timer.
const FLUSH_PACKET_INTERVAL: u64 = 1000;
/// Out-of-order buffer bounds per half-connection. Segments beyond these
/// are dropped and later reported as gaps.
const MAX_PENDING_SEGMENTS: usize = 64;
const MAX_PENDING_BYTES: usize = 4 * 1024 * 1024;

struct PendingSegment {
    payload: Vec<u8>,
    timestamp: DateTime<Utc>,
}

struct Half {
    next_seq: Option<u32>,
    pending: BTreeMap<u32, PendingSegment>,
    pending_bytes: usize,
    last_segment: Instant,
    fin: bool,
}

impl Half {
    fn new(now: Instant) -> Self {
        Half {
            next_seq: None,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            last_segment: now,
            fin: false,
        }
    }

    /// Buffered segment closest to the sequence cursor, smallest signed
    /// distance first; `wrapping_sub` keeps this correct across sequence
    /// wraparound.
    fn closest_pending(&self, next: u32) -> Option<u32> {
        self.pending
            .keys()
            .copied()
            .min_by_key(|&seq| seq.wrapping_sub(next) as i32)
    }

    fn remove_pending(&mut self, seq: u32) -> Option<PendingSegment> {
        let segment = self.pending.remove(&seq)?;
        self.pending_bytes -= segment.payload.len();
        Some(segment)
    }

    fn buffer(&mut self, seq: u32, payload: Vec<u8>, timestamp: DateTime<Utc>) -> bool {
        if self.pending.len() >= MAX_PENDING_SEGMENTS
            || self.pending_bytes + payload.len() > MAX_PENDING_BYTES
        {
            return false;
        }
        self.pending_bytes += payload.len();
        self.pending.insert(seq, PendingSegment { payload, timestamp });
        true
    }
}

struct Connection {
    /// Flow as first seen; direction of later segments is relative to it.
    tuple: FlowTuple,
    stream: StreamHandle,
    halves: [Half; 2],
    last_activity: Instant,
    task: JoinHandle<()>,
}

pub struct Assembler<P> {
    factory: Arc<ParserFactory<P>>,
    connections: HashMap<FlowTuple, Connection>,
    flush_timeout: Duration,
    close_timeout: Duration,
    packets_since_flush: u64,
}

impl<P: Publish + Clone> Assembler<P> {
    pub fn new(factory: ParserFactory<P>, flush_timeout: Duration, close_timeout: Duration) -> Self {
        Assembler {
            factory: Arc::new(factory),
            connections: HashMap::new(),
            flush_timeout,
            close_timeout,
            packets_since_flush: 0,
        }
    }

    pub async fn handle_segment(&mut self, segment: Segment) {
        let now = Instant::now();
        let tuple = segment.tuple;
        let key = tuple.canonical();
        let seq = segment.seq;
        let timestamp = segment.timestamp;
        let fin = segment.fin;
        let rst = segment.rst;
        let payload = segment.payload;

        let factory = &self.factory;
        let connection = self.connections.entry(key).or_insert_with(|| {
            metrics::inc("streams.started");
            tracing::debug!(flow = tracing::field::display(&tuple), "new connection");
            let (stream, messages) = StreamHandle::new(tuple);
            let parser = factory.new_parser(tuple);
            Connection {
                tuple,
                stream,
                halves: [Half::new(now), Half::new(now)],
                last_activity: now,
                task: tokio::spawn(parser.run(messages)),
            }
        });
        connection.last_activity = now;

        let dir = if tuple == connection.tuple {
            Direction::Forward
        } else {
            Direction::Reverse
        };
        let Connection { stream, halves, .. } = connection;
        let half = &mut halves[dir.index()];
        half.last_segment = now;
        if fin || rst {
            half.fin = true;
        }

        if !payload.is_empty() {
            match half.next_seq {
                None => {
                    half.next_seq = Some(seq.wrapping_add(payload.len() as u32));
                    stream.deliver(dir, payload, timestamp, 0).await;
                }
                Some(next) => {
                    let diff = seq.wrapping_sub(next) as i32;
                    if diff == 0 {
                        half.next_seq = Some(next.wrapping_add(payload.len() as u32));
                        stream.deliver(dir, payload, timestamp, 0).await;
                        drain_in_order(half, stream, dir).await;
                    } else if diff < 0 {
                        // retransmission; deliver only the unseen tail
                        let overlap = (-diff) as usize;
                        if overlap >= payload.len() {
                            metrics::inc("sniffer.packets_dropped");
                        } else {
                            let fresh = payload[overlap..].to_vec();
                            half.next_seq = Some(next.wrapping_add(fresh.len() as u32));
                            stream.deliver(dir, fresh, timestamp, 0).await;
                            drain_in_order(half, stream, dir).await;
                        }
                    } else if !half.buffer(seq, payload, timestamp) {
                        metrics::inc("sniffer.packets_dropped");
                        tracing::trace!(
                            flow = tracing::field::display(&tuple),
                            "out-of-order buffer full, dropping segment",
                        );
                    }
                }
            }
        }

        if rst || (halves[0].fin && halves[1].fin) {
            tracing::debug!(flow = tracing::field::display(&tuple), "connection closed");
            self.close(key);
        }

        self.packets_since_flush += 1;
        if self.packets_since_flush >= FLUSH_PACKET_INTERVAL {
            self.packets_since_flush = 0;
            self.flush().await;
        }
    }

    /// Periodic sweep: skip over sequence holes older than the flush
    /// timeout and close connections idle past the close timeout.
    pub async fn flush(&mut self) {
        let now = Instant::now();
        let mut idle = Vec::new();
        for (key, connection) in &mut self.connections {
            if now.duration_since(connection.last_activity) >= self.close_timeout {
                idle.push(*key);
                continue;
            }
            let Connection { stream, halves, .. } = connection;
            for (index, half) in halves.iter_mut().enumerate() {
                if half.pending.is_empty()
                    || now.duration_since(half.last_segment) < self.flush_timeout
                {
                    continue;
                }
                let dir = if index == 0 {
                    Direction::Forward
                } else {
                    Direction::Reverse
                };
                skip_gap(half, stream, dir).await;
            }
        }
        for key in idle {
            tracing::debug!(
                flow = tracing::field::display(&key),
                "closing idle connection",
            );
            self.close(key);
        }
    }

    fn close(&mut self, key: FlowTuple) {
        if let Some(connection) = self.connections.remove(&key) {
            metrics::inc("streams.complete");
            // dropping the stream handle terminates the message stream;
            // the parser task finishes on its own
            drop(connection.stream);
            drop(connection.task);
        }
    }

    /// Close every connection and wait for the parser tasks to finish.
    pub async fn shutdown(mut self) {
        let connections = std::mem::take(&mut self.connections);
        for (_, connection) in connections {
            metrics::inc("streams.complete");
            drop(connection.stream);
            let _ = connection.task.await;
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Deliver buffered segments that became contiguous after the cursor
/// advanced.
async fn drain_in_order(half: &mut Half, stream: &mut StreamHandle, dir: Direction) {
    while let Some(next) = half.next_seq {
        let seq = match half.closest_pending(next) {
            Some(seq) if (seq.wrapping_sub(next) as i32) <= 0 => seq,
            _ => return,
        };
        let segment = match half.remove_pending(seq) {
            Some(segment) => segment,
            None => return,
        };
        let overlap = next.wrapping_sub(seq) as usize;
        if overlap >= segment.payload.len() {
            metrics::inc("sniffer.packets_dropped");
            continue;
        }
        let fresh = segment.payload[overlap..].to_vec();
        half.next_seq = Some(next.wrapping_add(fresh.len() as u32));
        stream.deliver(dir, fresh, segment.timestamp, 0).await;
    }
}

/// Jump the sequence cursor over a hole to the closest buffered segment,
/// reporting the skipped byte count downstream, then drain whatever is
/// now contiguous.
async fn skip_gap(half: &mut Half, stream: &mut StreamHandle, dir: Direction) {
    let next = match half.next_seq {
        Some(next) => next,
        None => return,
    };
    let seq = match half.closest_pending(next) {
        Some(seq) => seq,
        None => return,
    };
    let segment = match half.remove_pending(seq) {
        Some(segment) => segment,
        None => return,
    };
    let skipped = seq.wrapping_sub(next) as i32;
    if skipped <= 0 {
        // overlap rather than a hole; treat as a late retransmission
        let overlap = (-skipped) as usize;
        if overlap >= segment.payload.len() {
            metrics::inc("sniffer.packets_dropped");
            return;
        }
        let fresh = segment.payload[overlap..].to_vec();
        half.next_seq = Some(next.wrapping_add(fresh.len() as u32));
        stream.deliver(dir, fresh, segment.timestamp, 0).await;
        drain_in_order(half, stream, dir).await;
        return;
    }
    metrics::add("sniffer.bytes_skipped", skipped as u64);
    tracing::debug!(skipped, "sequence hole skipped");
    half.next_seq = Some(seq.wrapping_add(segment.payload.len() as u32));
    stream
        .deliver(dir, segment.payload, segment.timestamp, skipped as u64)
        .await;
    drain_in_order(half, stream, dir).await;
}
