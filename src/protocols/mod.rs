// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

pub mod mongodb;
pub mod mysql;

use thiserror::Error;

use crate::{
    messages::flow::FlowTuple,
    publish::Publish,
    system::stream::{MessageStream, StreamError},
};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid length field {0}")]
    InvalidLength(i64),
    #[error("buffer of {requested} bytes exceeds the {cap} byte cap")]
    OversizedBuffer { requested: usize, cap: usize },
    #[error("message truncated: {0}")]
    Truncated(#[from] StreamError),
    #[error("malformed document: {0}")]
    Document(#[from] bson::de::Error),
    #[error("failed to serialize event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

/// Serialize event timestamps as RFC 3339 UTC with a `Z` suffix,
/// sub-second digits only when present.
pub(crate) fn serialize_timestamp<S>(
    timestamp: &chrono::DateTime<chrono::Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let formatted = timestamp.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true);
    serializer.serialize_str(&formatted)
}

/// Allocate a payload buffer of `len` bytes, but only after checking the
/// length against `cap`. Length fields come straight off the wire; an
/// unchecked allocation would let a single bad packet take the process
/// down.
pub fn safe_buffer(len: usize, cap: usize) -> Result<Vec<u8>, ParseError> {
    if len > cap {
        return Err(ParseError::OversizedBuffer {
            requested: len,
            cap,
        });
    }
    Ok(vec![0u8; len])
}

/// Per-protocol consumer factory. One parser is produced per connection;
/// the factory also contributes the BPF filter the capture handle runs.
pub enum ParserFactory<P> {
    MongoDb {
        options: mongodb::Options,
        publisher: P,
    },
    MySql {
        options: mysql::Options,
        publisher: P,
    },
}

impl<P: Publish + Clone> ParserFactory<P> {
    pub fn bpf_filter(&self) -> String {
        let port = match self {
            ParserFactory::MongoDb { options, .. } => options.port,
            ParserFactory::MySql { options, .. } => options.port,
        };
        format!("tcp port {}", port)
    }

    pub fn new_parser(&self, flow: FlowTuple) -> ProtocolParser<P> {
        match self {
            ParserFactory::MongoDb { options, publisher } => {
                ProtocolParser::MongoDb(mongodb::Parser::new(*options, publisher.clone(), flow))
            }
            ParserFactory::MySql { options, publisher } => {
                ProtocolParser::MySql(mysql::Parser::new(*options, publisher.clone(), flow))
            }
        }
    }
}

/// A per-connection protocol consumer.
pub enum ProtocolParser<P> {
    MongoDb(mongodb::Parser<P>),
    MySql(mysql::Parser<P>),
}

impl<P: Publish> ProtocolParser<P> {
    /// Drive the consumer over its connection's message stream until the
    /// stream terminates.
    pub async fn run(self, stream: MessageStream) {
        match self {
            ProtocolParser::MongoDb(parser) => parser.run(stream).await,
            ProtocolParser::MySql(parser) => parser.run(stream).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{safe_buffer, ParseError};

    #[test]
    fn safe_buffer_enforces_the_cap() {
        assert_eq!(safe_buffer(16, 1024).unwrap().len(), 16);
        assert_eq!(safe_buffer(1024, 1024).unwrap().len(), 1024);
        match safe_buffer(1025, 1024) {
            Err(ParseError::OversizedBuffer { requested, cap }) => {
                assert_eq!(requested, 1025);
                assert_eq!(cap, 1024);
            }
            _ => panic!("expected OversizedBuffer"),
        }
    }
}
