// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

//! Directional framing between the reassembler and a protocol consumer.
//!
//! A [`Message`] is a maximal run of in-order, same-direction bytes: the
//! consumer reads it lazily while the reassembler is still appending to
//! it. A direction change, a sequence gap, or connection close terminates
//! the current message, and the read side observes EOF. The channels in
//! between are bounded, so a slow consumer backpressures the assembler
//! and, transitively, the capture thread.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::messages::flow::FlowTuple;

/// Buffered bursts per open message.
const MESSAGE_BUFFER_DEPTH: usize = 32;
/// Open-but-unread messages per connection.
const MESSAGE_CHANNEL_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("message ended after {0} bytes of a partial read")]
    UnexpectedEof(usize),
}

/// Which half-connection a burst belongs to, relative to the tuple the
/// connection was first seen with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::Forward => 0,
            Direction::Reverse => 1,
        }
    }
}

/// One directional message, read as a lazy byte stream.
pub struct Message {
    flow: FlowTuple,
    timestamp: DateTime<Utc>,
    rx: mpsc::Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    offset: usize,
}

impl Message {
    fn new(flow: FlowTuple, timestamp: DateTime<Utc>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Message {
            flow,
            timestamp,
            rx,
            chunk: Vec::new(),
            offset: 0,
        }
    }

    /// Flow tuple oriented for the direction this message travelled in.
    pub fn flow(&self) -> FlowTuple {
        self.flow
    }

    /// Capture timestamp of the first segment of this message.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Read up to `buf.len()` bytes, waiting for more reassembled data if
    /// none is buffered. Returns 0 exactly when the message is closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> usize {
        while self.offset == self.chunk.len() {
            match self.rx.recv().await {
                Some(chunk) => {
                    self.chunk = chunk;
                    self.offset = 0;
                }
                None => return 0,
            }
        }
        let n = (self.chunk.len() - self.offset).min(buf.len());
        buf[..n].copy_from_slice(&self.chunk[self.offset..self.offset + n]);
        self.offset += n;
        n
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        let mut read = 0;
        while read < buf.len() {
            let n = self.read(&mut buf[read..]).await;
            if n == 0 {
                return Err(StreamError::UnexpectedEof(read));
            }
            read += n;
        }
        Ok(())
    }

    /// Consume the message to its end, returning the number of bytes
    /// discarded. Used to realign on the next message boundary after a
    /// parse error.
    pub async fn drain(&mut self) -> u64 {
        let mut discarded = 0u64;
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf).await;
            if n == 0 {
                return discarded;
            }
            discarded += n as u64;
        }
    }
}

/// The finite sequence of messages of one connection, in arrival order.
pub struct MessageStream {
    rx: mpsc::Receiver<Message>,
}

impl MessageStream {
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

struct OpenMessage {
    dir: Direction,
    bytes: mpsc::Sender<Vec<u8>>,
}

/// Write side of the framing layer, owned by the reassembler.
pub struct StreamHandle {
    tuple: FlowTuple,
    messages: mpsc::Sender<Message>,
    current: Option<OpenMessage>,
}

impl StreamHandle {
    /// Create the framing pair for one connection. `tuple` is the flow as
    /// first seen; `Direction::Forward` bursts carry it as-is,
    /// `Direction::Reverse` bursts carry the reversed tuple.
    pub fn new(tuple: FlowTuple) -> (Self, MessageStream) {
        let (tx, rx) = mpsc::channel(MESSAGE_CHANNEL_DEPTH);
        let handle = StreamHandle {
            tuple,
            messages: tx,
            current: None,
        };
        (handle, MessageStream { rx })
    }

    fn oriented(&self, dir: Direction) -> FlowTuple {
        match dir {
            Direction::Forward => self.tuple,
            Direction::Reverse => self.tuple.reverse(),
        }
    }

    /// Deliver one reassembled burst. Appends to the open message when the
    /// direction matches and no bytes were skipped; otherwise closes the
    /// open message and starts a new one.
    pub async fn deliver(
        &mut self,
        dir: Direction,
        bytes: Vec<u8>,
        timestamp: DateTime<Utc>,
        skipped: u64,
    ) {
        if skipped == 0 {
            if let Some(open) = &self.current {
                if open.dir == dir {
                    let _ = open.bytes.send(bytes).await;
                    return;
                }
            }
        }
        // closes the previous message, if any
        self.current = None;
        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER_DEPTH);
        let message = Message::new(self.oriented(dir), timestamp, rx);
        if self.messages.send(message).await.is_err() {
            // consumer is gone; the connection keeps draining into nothing
            return;
        }
        let _ = tx.send(bytes).await;
        self.current = Some(OpenMessage { dir, bytes: tx });
    }

    /// Terminate the message stream. Dropping the handle is equivalent.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::{Direction, StreamHandle};
    use crate::messages::flow::FlowTuple;

    fn flow() -> FlowTuple {
        FlowTuple::new(
            "10.0.0.22".parse().unwrap(),
            "10.0.0.23".parse().unwrap(),
            44444,
            27017,
        )
    }

    #[tokio::test]
    async fn same_direction_bursts_coalesce() {
        let (mut handle, mut stream) = StreamHandle::new(flow());
        let ts = chrono::Utc::now();
        handle.deliver(Direction::Forward, b"hello ".to_vec(), ts, 0).await;
        handle.deliver(Direction::Forward, b"world".to_vec(), ts, 0).await;
        handle.close();

        let mut message = stream.next().await.unwrap();
        assert_eq!(message.flow(), flow());
        let mut buf = [0u8; 64];
        let mut collected = Vec::new();
        loop {
            let n = message.read(&mut buf).await;
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"hello world");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn direction_change_is_a_message_boundary() {
        let (mut handle, mut stream) = StreamHandle::new(flow());
        let ts = chrono::Utc::now();
        handle.deliver(Direction::Forward, b"request".to_vec(), ts, 0).await;
        handle.deliver(Direction::Reverse, b"response".to_vec(), ts, 0).await;
        handle.close();

        let mut first = stream.next().await.unwrap();
        assert_eq!(first.flow(), flow());
        assert_eq!(first.drain().await, 7);
        // a drained message stays at EOF
        assert_eq!(first.read(&mut [0u8; 8]).await, 0);

        let mut second = stream.next().await.unwrap();
        assert_eq!(second.flow(), flow().reverse());
        assert_eq!(second.drain().await, 8);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn skipped_bytes_open_a_new_message() {
        let (mut handle, mut stream) = StreamHandle::new(flow());
        let ts = chrono::Utc::now();
        handle.deliver(Direction::Forward, b"first".to_vec(), ts, 0).await;
        handle.deliver(Direction::Forward, b"second".to_vec(), ts, 100).await;
        handle.close();

        let mut first = stream.next().await.unwrap();
        assert_eq!(first.drain().await, 5);
        let mut second = stream.next().await.unwrap();
        assert_eq!(second.drain().await, 6);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn read_exact_reports_partial_reads() {
        let (mut handle, mut stream) = StreamHandle::new(flow());
        let ts = chrono::Utc::now();
        handle.deliver(Direction::Forward, b"abc".to_vec(), ts, 0).await;
        handle.close();

        let mut message = stream.next().await.unwrap();
        let mut buf = [0u8; 8];
        match message.read_exact(&mut buf).await {
            Err(super::StreamError::UnexpectedEof(read)) => assert_eq!(read, 3),
            Ok(()) => panic!("read_exact should not satisfy an 8 byte read"),
        }
    }
}
