// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

//! Wiring of the capture front end to the assembler.
//!
//! The capture handle lives on a dedicated OS thread doing blocking
//! reads; decoded segments cross into the async world over a bounded
//! channel. The assembler task owns the flow map and is the only thing
//! that touches it; per-connection parsers are spawned from there.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use tokio::sync::mpsc;

use crate::{
    configuration::CaptureOptions,
    messages::segment::Segment,
    protocols::ParserFactory,
    publish::Publish,
    utility::metrics,
};

use super::{
    capture::{CaptureError, CaptureSource, Captured},
    decoder::PacketDecoder,
    reassembly::Assembler,
};

/// Segments in flight between the capture thread and the assembler.
const SEGMENT_CHANNEL_DEPTH: usize = 1024;
/// A half-connection silent longer than this is closed.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3600);

pub struct Sniffer<P> {
    capture: CaptureSource,
    decoder: PacketDecoder,
    assembler: Assembler<P>,
    running: Arc<AtomicBool>,
}

impl<P: Publish + Clone> Sniffer<P> {
    /// Open the capture source and install the consumer's BPF filter.
    pub fn new(
        options: &CaptureOptions,
        factory: ParserFactory<P>,
        running: Arc<AtomicBool>,
    ) -> Result<Self, CaptureError> {
        let mut capture = CaptureSource::open(options)?;
        let filter = factory.bpf_filter();
        capture.set_filter(&filter)?;
        tracing::info!(
            filter = tracing::field::display(&filter),
            "capture source open",
        );
        let decoder = PacketDecoder::new(capture.datalink());
        let assembler = Assembler::new(
            factory,
            Duration::from_secs(options.flush_timeout_sec.max(1)),
            CLOSE_TIMEOUT,
        );
        Ok(Sniffer {
            capture,
            decoder,
            assembler,
            running,
        })
    }

    /// Run until the capture source is exhausted (offline) or `running`
    /// is cleared (live). Consumes the sniffer; all connection streams
    /// are drained before returning.
    pub async fn run(self) {
        let Sniffer {
            capture,
            decoder,
            mut assembler,
            running,
        } = self;

        let (tx, mut rx) = mpsc::channel::<Segment>(SEGMENT_CHANNEL_DEPTH);
        let reader = thread::spawn(move || capture_loop(capture, decoder, tx, running));

        let mut flush_tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                segment = rx.recv() => match segment {
                    Some(segment) => assembler.handle_segment(segment).await,
                    None => break,
                },
                _ = flush_tick.tick() => assembler.flush().await,
            }
        }
        assembler.shutdown().await;
        let _ = reader.join();
    }
}

fn capture_loop(
    mut capture: CaptureSource,
    decoder: PacketDecoder,
    tx: mpsc::Sender<Segment>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        match capture.next_frame() {
            Ok(Captured::Frame {
                data,
                timestamp,
                truncated,
            }) => match decoder.decode(data) {
                Ok(view) => {
                    if view.payload.is_empty() && !view.fin && !view.rst {
                        continue;
                    }
                    metrics::inc("sniffer.parsed_packets");
                    if truncated {
                        metrics::inc("sniffer.truncated_packets");
                    }
                    let segment = Segment {
                        tuple: crate::messages::flow::FlowTuple::new(
                            view.src_ip,
                            view.dst_ip,
                            view.src_port,
                            view.dst_port,
                        ),
                        seq: view.seq,
                        payload: view.payload.to_vec(),
                        timestamp,
                        fin: view.fin,
                        rst: view.rst,
                        truncated,
                    };
                    if tx.blocking_send(segment).is_err() {
                        // assembler is gone, nothing left to feed
                        break;
                    }
                }
                Err(error) => {
                    metrics::inc("sniffer.unparseable_packets");
                    tracing::trace!(
                        error = tracing::field::display(&error),
                        head = tracing::field::display(hex::encode(&data[..data.len().min(32)])),
                        "skipping undecodable frame",
                    );
                }
            },
            Ok(Captured::TimedOut) => continue,
            Ok(Captured::Eof) => break,
            Err(error) => {
                tracing::warn!(
                    error = tracing::field::display(&error),
                    "capture read error",
                );
            }
        }
    }
    if let Some(stat) = capture.stats() {
        tracing::info!(
            received = stat.received,
            dropped = stat.dropped,
            if_dropped = stat.if_dropped,
            "capture statistics",
        );
    }
}
