// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

//! MySQL text-protocol consumer.
//!
//! The request side records `COM_QUERY` statements; the response side is
//! a three-state machine over result-set packets. Column-definition
//! packets are counted against the column count announced by the first
//! response packet, so servers negotiating `CLIENT_DEPRECATE_EOF` (no
//! EOF between definitions and rows) are classified correctly even when
//! a row happens to begin with byte 0x03.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    messages::flow::FlowTuple,
    publish::Publish,
    system::stream::{Message, MessageStream},
    utility::metrics,
};

use super::{safe_buffer, serialize_timestamp, ParseError};

pub const COM_QUERY: u8 = 0x03;
const OK: u8 = 0x00;
const EOF: u8 = 0xFE;
const ERR: u8 = 0xFF;

const PACKET_HEADER_LENGTH: usize = 4;
const MAX_PAYLOAD_LENGTH: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub port: u16,
}

impl Default for Options {
    fn default() -> Self {
        Options { port: 3306 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryEvent {
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub server_ip: String,
    pub query: String,
    /// Seconds between the query and the end of its result set.
    pub query_time: f64,
    pub rows_sent: u64,
    pub columns_sent: u64,
    pub error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
}

impl Default for QueryEvent {
    fn default() -> Self {
        QueryEvent {
            timestamp: DateTime::<Utc>::from(std::time::UNIX_EPOCH),
            client_ip: String::new(),
            server_ip: String::new(),
            query: String::new(),
            query_time: 0.0,
            rows_sent: 0,
            columns_sent: 0,
            error: false,
            error_code: None,
        }
    }
}

struct MySqlPacket {
    payload: Vec<u8>,
    #[allow(dead_code)]
    sequence_id: u8,
}

impl MySqlPacket {
    fn first_payload_byte(&self) -> u8 {
        self.payload[0]
    }

    fn is_eof(&self) -> bool {
        self.first_payload_byte() == EOF && self.payload.len() < 9
    }

    /// Read one framed packet: 3-byte little-endian payload length, one
    /// sequence byte, then the payload. `Ok(None)` means the message
    /// ended cleanly between packets.
    async fn read_from(message: &mut Message) -> Result<Option<Self>, ParseError> {
        let mut header = [0u8; PACKET_HEADER_LENGTH];
        let first = message.read(&mut header).await;
        if first == 0 {
            return Ok(None);
        }
        let mut read = first;
        while read < PACKET_HEADER_LENGTH {
            let n = message.read(&mut header[read..]).await;
            if n == 0 {
                return Err(ParseError::Malformed("truncated packet header"));
            }
            read += n;
        }
        let payload_length =
            header[0] as usize + ((header[1] as usize) << 8) + ((header[2] as usize) << 16);
        if payload_length == 0 {
            return Err(ParseError::InvalidLength(0));
        }
        let mut payload = safe_buffer(payload_length, MAX_PAYLOAD_LENGTH)?;
        message.read_exact(&mut payload).await?;
        Ok(Some(MySqlPacket {
            payload,
            sequence_id: header[3],
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseState {
    ChompFirstPacket,
    ChompColumnDefs { expected: u64, seen: u64 },
    ChompRows,
}

pub struct Parser<P> {
    options: Options,
    /// Oriented so that `dst_port == options.port`.
    flow: FlowTuple,
    current: QueryEvent,
    state: ResponseState,
    publisher: P,
}

impl<P: Publish> Parser<P> {
    pub fn new(options: Options, publisher: P, flow: FlowTuple) -> Self {
        let flow = if flow.dst_port == options.port {
            flow
        } else {
            flow.reverse()
        };
        Parser {
            options,
            flow,
            current: QueryEvent::default(),
            state: ResponseState::ChompFirstPacket,
            publisher,
        }
    }

    pub async fn run(mut self, mut stream: MessageStream) {
        while let Some(mut message) = stream.next().await {
            let to_server = message.flow().dst_port == self.options.port;
            let result = if to_server {
                self.parse_request(&mut message).await
            } else {
                self.parse_response(&mut message).await
            };
            if let Err(error) = result {
                metrics::inc("mysql.parse_errors");
                tracing::debug!(
                    flow = tracing::field::display(&self.flow),
                    error = tracing::field::display(&error),
                    "parse error, discarding rest of message",
                );
                message.drain().await;
            }
        }
        tracing::debug!(
            flow = tracing::field::display(&self.flow),
            "message stream closed",
        );
    }

    async fn parse_request(&mut self, message: &mut Message) -> Result<(), ParseError> {
        loop {
            let packet = match MySqlPacket::read_from(message).await? {
                Some(packet) => packet,
                None => return Ok(()),
            };
            metrics::inc("mysql.requests_parsed");
            self.handle_request_packet(&packet, message.timestamp());
        }
    }

    async fn parse_response(&mut self, message: &mut Message) -> Result<(), ParseError> {
        loop {
            let packet = match MySqlPacket::read_from(message).await? {
                Some(packet) => packet,
                None => return Ok(()),
            };
            metrics::inc("mysql.responses_parsed");
            self.handle_response_packet(&packet, message.timestamp())?;
        }
    }

    fn handle_request_packet(&mut self, packet: &MySqlPacket, timestamp: DateTime<Utc>) {
        if packet.first_payload_byte() == COM_QUERY {
            self.current.query = String::from_utf8_lossy(&packet.payload[1..]).into_owned();
            self.current.timestamp = timestamp;
        } else {
            tracing::debug!(
                command = packet.first_payload_byte(),
                "skipping non-QUERY command",
            );
        }
    }

    fn handle_response_packet(
        &mut self,
        packet: &MySqlPacket,
        timestamp: DateTime<Utc>,
    ) -> Result<(), ParseError> {
        match self.state {
            ResponseState::ChompFirstPacket => match packet.first_payload_byte() {
                OK => self.complete(timestamp),
                ERR => {
                    self.record_error(packet);
                    self.complete(timestamp);
                }
                _ if packet.is_eof() => (),
                first => {
                    let columns = read_length_encoded_integer(first, &packet.payload[1..])?;
                    self.current.columns_sent = columns;
                    self.state = ResponseState::ChompColumnDefs {
                        expected: columns,
                        seen: 0,
                    };
                }
            },
            ResponseState::ChompColumnDefs { expected, seen } => {
                if packet.first_payload_byte() == ERR {
                    self.record_error(packet);
                    self.complete(timestamp);
                } else if seen < expected {
                    // still inside the definition run; the byte 0x03 here
                    // is the length prefix of "def", but counting makes
                    // the classification independent of the payload
                    self.state = ResponseState::ChompColumnDefs {
                        expected,
                        seen: seen + 1,
                    };
                } else if packet.is_eof() {
                    // legacy delimiter between definitions and rows
                    self.state = ResponseState::ChompRows;
                } else if packet.first_payload_byte() == OK {
                    self.complete(timestamp);
                } else {
                    // CLIENT_DEPRECATE_EOF: straight into the first row
                    self.current.rows_sent += 1;
                    self.state = ResponseState::ChompRows;
                }
            }
            ResponseState::ChompRows => match packet.first_payload_byte() {
                OK | EOF => self.complete(timestamp),
                ERR => {
                    self.record_error(packet);
                    self.complete(timestamp);
                }
                _ => self.current.rows_sent += 1,
            },
        }
        Ok(())
    }

    fn record_error(&mut self, packet: &MySqlPacket) {
        self.current.error = true;
        if packet.payload.len() >= 3 {
            self.current.error_code =
                Some(u16::from_le_bytes([packet.payload[1], packet.payload[2]]));
        }
    }

    fn complete(&mut self, timestamp: DateTime<Utc>) {
        let mut event = std::mem::take(&mut self.current);
        self.state = ResponseState::ChompFirstPacket;
        event.client_ip = self.flow.src_ip.to_string();
        event.server_ip = self.flow.dst_ip.to_string();
        // a completion with no observed COM_QUERY has no meaningful start
        if event.timestamp != DateTime::<Utc>::from(std::time::UNIX_EPOCH) {
            let elapsed = timestamp.signed_duration_since(event.timestamp);
            if elapsed > chrono::Duration::zero() {
                event.query_time = elapsed.num_microseconds().unwrap_or(0) as f64 / 1_000_000.0;
            }
        }
        metrics::inc("mysql.events_submitted");
        match serde_json::to_vec(&event) {
            Ok(bytes) => {
                if !self.publisher.publish(bytes) {
                    metrics::inc("mysql.events_dropped");
                }
            }
            Err(error) => {
                tracing::warn!(
                    error = tracing::field::display(&error),
                    "failed to serialize query event",
                );
                metrics::inc("mysql.events_dropped");
            }
        }
    }
}

/// <https://dev.mysql.com/doc/internals/en/integer.html>
fn read_length_encoded_integer(first: u8, rest: &[u8]) -> Result<u64, ParseError> {
    let take = |n: usize| -> Result<&[u8], ParseError> {
        rest.get(..n)
            .ok_or(ParseError::Malformed("short length-encoded integer"))
    };
    match first {
        0..=0xFB => Ok(first as u64),
        0xFC => {
            let b = take(2)?;
            Ok(u16::from_le_bytes([b[0], b[1]]) as u64)
        }
        0xFD => {
            let b = take(3)?;
            Ok(b[0] as u64 + ((b[1] as u64) << 8) + ((b[2] as u64) << 16))
        }
        0xFE => {
            let b = take(8)?;
            Ok(u64::from_le_bytes([
                b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            ]))
        }
        _ => Err(ParseError::Malformed("invalid length-encoded integer")),
    }
}
