// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

//! MongoDB wire-protocol consumer.
//!
//! One parser per connection, driven by the connection's message stream.
//! Requests that expect a reply are parked in the [`QCache`] keyed by
//! request id; each `OP_REPLY` is correlated back by its `responseTo`
//! field to compute the duration and attach response metadata. See
//! <https://docs.mongodb.com/manual/reference/mongodb-wire-protocol/>.

mod qcache;
pub mod queryshape;

pub use self::qcache::QCache;

use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    messages::flow::FlowTuple,
    publish::Publish,
    system::stream::{Message, MessageStream},
    utility::metrics,
};

use super::{safe_buffer, serialize_timestamp, ParseError};

pub const OP_REPLY: i32 = 1;
pub const OP_MSG: i32 = 1000;
pub const OP_UPDATE: i32 = 2001;
pub const OP_INSERT: i32 = 2002;
pub const OP_QUERY: i32 = 2004;
pub const OP_GET_MORE: i32 = 2005;
pub const OP_DELETE: i32 = 2006;
pub const OP_COMMAND: i32 = 2010;
pub const OP_COMMANDREPLY: i32 = 2011;

const HEADER_LENGTH: usize = 16;
/// Deliberately loose cap above the 16 MiB BSON document limit. Any wire
/// message claiming more than this is treated as garbage.
const MAX_MESSAGE_LENGTH: usize = 32 * 1024 * 1024;
/// Serialized command payloads are bounded to this many bytes.
const MAX_COMMAND_LENGTH: usize = 500;
const TRUNCATION_SUFFIX: &str = " ...";
const QUERY_CACHE_SIZE: usize = 128;

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub port: u16,
}

impl Default for Options {
    fn default() -> Self {
        Options { port: 27017 }
    }
}

/// The exported per-query record.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub server_ip: String,
    pub database: String,
    pub collection: String,
    pub namespace: String,
    pub command_type: String,
    pub command: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub normalized_query: String,
    pub duration_ms: f64,
    pub request_id: i32,
    pub request_length: u32,
    pub response_length: u32,
    pub nreturned: i64,
    pub ninserted: i64,
}

impl Default for Event {
    fn default() -> Self {
        Event {
            timestamp: DateTime::<Utc>::from(std::time::UNIX_EPOCH),
            client_ip: String::new(),
            server_ip: String::new(),
            database: String::new(),
            collection: String::new(),
            namespace: String::new(),
            command_type: String::new(),
            command: String::new(),
            normalized_query: String::new(),
            duration_ms: 0.0,
            request_id: 0,
            request_length: 0,
            response_length: 0,
            nreturned: 0,
            ninserted: 0,
        }
    }
}

/// Standard 16-byte wire header, little-endian throughout.
#[derive(Debug, Clone, Copy)]
struct MsgHeader {
    message_length: i32,
    request_id: i32,
    response_to: i32,
    op_code: i32,
}

impl MsgHeader {
    /// Read the next header off the message. `Ok(None)` means the message
    /// ended cleanly at a header boundary.
    async fn read_from(message: &mut Message) -> Result<Option<Self>, ParseError> {
        let mut buf = [0u8; HEADER_LENGTH];
        let first = message.read(&mut buf).await;
        if first == 0 {
            return Ok(None);
        }
        let mut read = first;
        while read < HEADER_LENGTH {
            let n = message.read(&mut buf[read..]).await;
            if n == 0 {
                return Err(ParseError::Malformed("truncated header"));
            }
            read += n;
        }
        let header = MsgHeader {
            message_length: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            request_id: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            response_to: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            op_code: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        };
        if header.message_length < HEADER_LENGTH as i32 {
            return Err(ParseError::InvalidLength(header.message_length as i64));
        }
        Ok(Some(header))
    }

    fn payload_length(&self) -> usize {
        self.message_length as usize - HEADER_LENGTH
    }
}

/// Little-endian cursor over a wire message payload.
struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        PayloadReader { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        if self.remaining() < len {
            return Err(ParseError::Malformed("payload too short"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_i32(&mut self) -> Result<i32, ParseError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64, ParseError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_cstring(&mut self) -> Result<String, ParseError> {
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(nul) => {
                self.pos += nul + 1;
                Ok(String::from_utf8_lossy(&rest[..nul]).into_owned())
            }
            None => Err(ParseError::Malformed("unterminated cstring")),
        }
    }

    /// Slice out one length-prefixed BSON document without decoding it.
    fn document_bytes(&mut self) -> Result<&'a [u8], ParseError> {
        if self.remaining() < 4 {
            return Err(ParseError::Malformed("payload too short"));
        }
        let b = &self.data[self.pos..self.pos + 4];
        let len = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        if len < 5 || len as usize > self.remaining() {
            return Err(ParseError::InvalidLength(len as i64));
        }
        self.take(len as usize)
    }

    fn read_document(&mut self) -> Result<Document, ParseError> {
        let bytes = self.document_bytes()?;
        Ok(Document::from_reader(&mut &bytes[..])?)
    }
}

pub struct Parser<P> {
    options: Options,
    /// Oriented so that `dst_port == options.port`, regardless of which
    /// half-connection was captured first.
    flow: FlowTuple,
    qcache: QCache,
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
            qcache: QCache::new(QUERY_CACHE_SIZE),
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
                metrics::inc("mongodb.parse_errors");
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
            let header = match MsgHeader::read_from(message).await? {
                Some(header) => header,
                None => return Ok(()),
            };
            let mut data = safe_buffer(header.payload_length(), MAX_MESSAGE_LENGTH)?;
            message.read_exact(&mut data).await?;
            metrics::inc("mongodb.requests_parsed");
            let timestamp = message.timestamp();
            match header.op_code {
                OP_QUERY => self.on_query(&header, &data, timestamp)?,
                OP_GET_MORE => self.on_get_more(&header, &data, timestamp)?,
                OP_INSERT => self.on_insert(&header, &data, timestamp)?,
                OP_UPDATE => self.on_update(&header, &data, timestamp)?,
                OP_DELETE => self.on_delete(&header, &data, timestamp)?,
                OP_COMMAND | OP_COMMANDREPLY | OP_MSG => {
                    tracing::debug!(
                        opcode = header.op_code,
                        "skipping undecoded command-protocol message",
                    );
                }
                other => {
                    tracing::debug!(opcode = other, "skipping unhandled opcode");
                }
            }
        }
    }

    async fn parse_response(&mut self, message: &mut Message) -> Result<(), ParseError> {
        loop {
            let header = match MsgHeader::read_from(message).await? {
                Some(header) => header,
                None => return Ok(()),
            };
            let mut data = safe_buffer(header.payload_length(), MAX_MESSAGE_LENGTH)?;
            message.read_exact(&mut data).await?;
            metrics::inc("mongodb.responses_parsed");
            if header.op_code != OP_REPLY {
                tracing::debug!(opcode = header.op_code, "skipping non-reply response");
                continue;
            }
            self.on_reply(&header, &data, message.timestamp())?;
        }
    }

    fn on_query(
        &mut self,
        header: &MsgHeader,
        data: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<(), ParseError> {
        let mut r = PayloadReader::new(data);
        let _flags = r.read_i32()?;
        let namespace = r.read_cstring()?;
        let _number_to_skip = r.read_i32()?;
        let _number_to_return = r.read_i32()?;
        let document = r.read_document()?;

        let (database, default_collection) = split_namespace(&namespace);
        let (command_type, collection) = classify_command(&document, default_collection);
        let command = truncate_command(serde_json::to_string(
            &Bson::Document(document.clone()).into_relaxed_extjson(),
        )?);

        let event = Event {
            timestamp,
            client_ip: self.flow.src_ip.to_string(),
            server_ip: self.flow.dst_ip.to_string(),
            database: database.to_string(),
            collection,
            namespace,
            command_type,
            command,
            normalized_query: queryshape::shape(&document),
            request_id: header.request_id,
            request_length: header.message_length as u32,
            ..Event::default()
        };
        self.cache_pending(header.request_id, event);
        Ok(())
    }

    fn on_get_more(
        &mut self,
        header: &MsgHeader,
        data: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<(), ParseError> {
        let mut r = PayloadReader::new(data);
        let _zero = r.read_i32()?;
        let namespace = r.read_cstring()?;
        let _number_to_return = r.read_i32()?;
        let cursor_id = r.read_i64()?;

        let (database, collection) = split_namespace(&namespace);
        let command = bson::doc! { "getMore": cursor_id, "collection": collection };
        let event = Event {
            timestamp,
            client_ip: self.flow.src_ip.to_string(),
            server_ip: self.flow.dst_ip.to_string(),
            database: database.to_string(),
            collection: collection.to_string(),
            namespace: namespace.clone(),
            command_type: "getMore".to_string(),
            command: truncate_command(serde_json::to_string(
                &Bson::Document(command).into_relaxed_extjson(),
            )?),
            request_id: header.request_id,
            request_length: header.message_length as u32,
            ..Event::default()
        };
        self.cache_pending(header.request_id, event);
        Ok(())
    }

    fn on_insert(
        &mut self,
        header: &MsgHeader,
        data: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<(), ParseError> {
        let mut r = PayloadReader::new(data);
        let _flags = r.read_i32()?;
        let namespace = r.read_cstring()?;
        // count documents without decoding them
        let mut documents = 0i64;
        while r.remaining() > 0 {
            r.document_bytes()?;
            documents += 1;
        }

        let (database, collection) = split_namespace(&namespace);
        let event = Event {
            timestamp,
            client_ip: self.flow.src_ip.to_string(),
            server_ip: self.flow.dst_ip.to_string(),
            database: database.to_string(),
            collection: collection.to_string(),
            namespace: namespace.clone(),
            command_type: "insert".to_string(),
            ninserted: documents,
            request_id: header.request_id,
            request_length: header.message_length as u32,
            ..Event::default()
        };
        self.submit(event);
        Ok(())
    }

    fn on_update(
        &mut self,
        header: &MsgHeader,
        data: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<(), ParseError> {
        let mut r = PayloadReader::new(data);
        let _zero = r.read_i32()?;
        let namespace = r.read_cstring()?;
        let _flags = r.read_i32()?;
        let selector = r.read_document()?;
        let _update = r.read_document()?;
        self.submit_write(header, timestamp, namespace, "update", selector)
    }

    fn on_delete(
        &mut self,
        header: &MsgHeader,
        data: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<(), ParseError> {
        let mut r = PayloadReader::new(data);
        let _zero = r.read_i32()?;
        let namespace = r.read_cstring()?;
        let _flags = r.read_i32()?;
        let selector = r.read_document()?;
        self.submit_write(header, timestamp, namespace, "delete", selector)
    }

    /// Publish a fire-and-forget old-style write: no reply is expected,
    /// so the event goes out immediately with zero duration.
    fn submit_write(
        &mut self,
        header: &MsgHeader,
        timestamp: DateTime<Utc>,
        namespace: String,
        command_type: &str,
        selector: Document,
    ) -> Result<(), ParseError> {
        let (database, collection) = split_namespace(&namespace);
        let event = Event {
            timestamp,
            client_ip: self.flow.src_ip.to_string(),
            server_ip: self.flow.dst_ip.to_string(),
            database: database.to_string(),
            collection: collection.to_string(),
            namespace: namespace.clone(),
            command_type: command_type.to_string(),
            command: truncate_command(serde_json::to_string(
                &Bson::Document(selector.clone()).into_relaxed_extjson(),
            )?),
            normalized_query: queryshape::shape(&selector),
            request_id: header.request_id,
            request_length: header.message_length as u32,
            ..Event::default()
        };
        self.submit(event);
        Ok(())
    }

    fn on_reply(
        &mut self,
        header: &MsgHeader,
        data: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<(), ParseError> {
        let mut r = PayloadReader::new(data);
        let _response_flags = r.read_i32()?;
        let _cursor_id = r.read_i64()?;
        let _starting_from = r.read_i32()?;
        let number_returned = r.read_i32()?;

        let mut event = match self.qcache.pop(header.response_to) {
            Some(event) => event,
            None => {
                metrics::inc("mongodb.unmatched_responses");
                tracing::debug!(
                    response_to = header.response_to,
                    "reply without a pending request",
                );
                return Ok(());
            }
        };
        event.response_length = header.message_length as u32;
        event.nreturned = number_returned as i64;

        let elapsed = timestamp.signed_duration_since(event.timestamp);
        if elapsed < chrono::Duration::zero() {
            tracing::debug!(
                flow = tracing::field::display(&self.flow),
                request_id = event.request_id,
                "reply timestamped before its request",
            );
            event.duration_ms = 0.0;
        } else {
            event.duration_ms = elapsed.num_microseconds().unwrap_or(0) as f64 / 1000.0;
        }

        // The first reply document refines the counts: an acknowledged
        // insert carries the inserted count in `n`, a find reply carries
        // its batch in `cursor.firstBatch`.
        if number_returned > 0 && r.remaining() > 0 {
            if let Ok(first) = r.read_document() {
                if event.command_type == "insert" {
                    if let Some(n) = numeric(first.get("n")) {
                        event.ninserted = n;
                    }
                }
                if let Some(Bson::Document(cursor)) = first.get("cursor") {
                    if let Some(Bson::Array(batch)) = cursor.get("firstBatch") {
                        event.nreturned = batch.len() as i64;
                    }
                }
            }
        }

        self.submit(event);
        Ok(())
    }

    fn cache_pending(&mut self, request_id: i32, event: Event) {
        if self.qcache.add(request_id, event) {
            metrics::inc("mongodb.qcache_evictions");
        }
    }

    fn submit(&mut self, event: Event) {
        metrics::inc("mongodb.events_submitted");
        match serde_json::to_vec(&event) {
            Ok(bytes) => {
                if !self.publisher.publish(bytes) {
                    metrics::inc("mongodb.events_dropped");
                }
            }
            Err(error) => {
                tracing::warn!(
                    error = tracing::field::display(&error),
                    "failed to serialize event",
                );
                metrics::inc("mongodb.events_dropped");
            }
        }
    }
}

/// Known command keys, checked in priority order. `findAndModify` must
/// precede `update` because a findAndModify document also carries an
/// `update` field.
const COMMAND_PRIORITY: &[&str] = &[
    "findAndModify",
    "insert",
    "update",
    "delete",
    "find",
    "count",
    "distinct",
    "aggregate",
    "mapReduce",
    "getMore",
    "getLastError",
    "getPrevError",
    "eval",
];

/// Determine the normalized command type and the effective collection
/// name for an OP_QUERY document.
fn classify_command(document: &Document, default_collection: &str) -> (String, String) {
    for &key in COMMAND_PRIORITY {
        if let Some(value) = document.get(key) {
            return (
                key.to_string(),
                command_collection(document, key, value, default_collection),
            );
        }
    }
    if document.len() == 1 {
        if let Some((key, value)) = document.iter().next() {
            return (
                key.clone(),
                command_collection(document, key, value, default_collection),
            );
        }
    }
    ("command".to_string(), default_collection.to_string())
}

fn command_collection(
    document: &Document,
    command_key: &str,
    command_value: &Bson,
    default_collection: &str,
) -> String {
    if command_key == "getMore" {
        if let Some(Bson::String(collection)) = document.get("collection") {
            return collection.clone();
        }
    }
    if let Bson::String(collection) = command_value {
        return collection.clone();
    }
    default_collection.to_string()
}

/// Split `dbname.collectionname` on the first dot. The collection is
/// empty when there is no dot.
fn split_namespace(namespace: &str) -> (&str, &str) {
    match namespace.find('.') {
        Some(dot) => (&namespace[..dot], &namespace[dot + 1..]),
        None => (namespace, ""),
    }
}

fn numeric(value: Option<&Bson>) -> Option<i64> {
    match value {
        Some(Bson::Int32(n)) => Some(*n as i64),
        Some(Bson::Int64(n)) => Some(*n),
        Some(Bson::Double(n)) => Some(*n as i64),
        _ => None,
    }
}

/// Bound the serialized command to `MAX_COMMAND_LENGTH` bytes; anything
/// longer is cut at 496 and marked with a literal `" ..."`.
fn truncate_command(mut command: String) -> String {
    if command.len() <= MAX_COMMAND_LENGTH {
        return command;
    }
    let mut cut = MAX_COMMAND_LENGTH - TRUNCATION_SUFFIX.len();
    while !command.is_char_boundary(cut) {
        cut -= 1;
    }
    command.truncate(cut);
    command.push_str(TRUNCATION_SUFFIX);
    command
}
