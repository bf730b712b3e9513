// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

//! Backpressure boundary between the parsers and the outside world.
//!
//! `publish` never blocks: when the queue is full the event is dropped
//! and the caller learns about it from the return value. If ingestion
//! cannot keep up with the wire, it is better to drop events than
//! packets.

use std::{
    io::{BufWriter, Write},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::utility::metrics;

/// Serialized-event sink. Implementations must not block the caller.
pub trait Publish: Send + Sync + 'static {
    /// Hand one serialized event to the sink. Returns whether the event
    /// was accepted; `false` means it was dropped on overload.
    fn publish(&self, event: Vec<u8>) -> bool;
}

/// Bounded in-memory queue drained by a background task that writes
/// newline-delimited JSON to stdout, flushing once per second.
#[derive(Clone)]
pub struct BufferedPublisher {
    tx: mpsc::Sender<Vec<u8>>,
    samplerate: u64,
    seen: Arc<AtomicU64>,
}

impl BufferedPublisher {
    pub fn spawn(depth: usize, samplerate: u64) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        tokio::spawn(run_stdout_sink(rx));
        BufferedPublisher {
            tx,
            samplerate: samplerate.max(1),
            seen: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Publish for BufferedPublisher {
    fn publish(&self, event: Vec<u8>) -> bool {
        if self.samplerate > 1 {
            let seen = self.seen.fetch_add(1, Ordering::Relaxed);
            if seen % self.samplerate != 0 {
                metrics::inc("publish.events_sampled_out");
                return true;
            }
        }
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                metrics::inc("publish.events_dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                metrics::inc("publish.event_errors");
                false
            }
        }
    }
}

async fn run_stdout_sink(mut rx: mpsc::Receiver<Vec<u8>>) {
    let mut writer = BufWriter::new(std::io::stdout());
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    let written = writer
                        .write_all(&event)
                        .and_then(|()| writer.write_all(b"\n"));
                    match written {
                        Ok(()) => metrics::inc("publish.events_published"),
                        Err(error) => {
                            tracing::warn!(
                                error = tracing::field::display(&error),
                                "failed to write event",
                            );
                            metrics::inc("publish.event_errors");
                        }
                    }
                }
                None => {
                    let _ = writer.flush();
                    break;
                }
            },
            _ = tick.tick() => {
                let _ = writer.flush();
            }
        }
    }
}
