// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

//! End-to-end tests: synthesized TCP segments through the reassembler,
//! the framing layer and a protocol parser, asserting on the emitted
//! events.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bson::{doc, Document};
use chrono::{DateTime, Utc};

use tcpagent::{
    messages::{flow::FlowTuple, segment::Segment},
    protocols::{mongodb, mysql, ParserFactory},
    publish::Publish,
    system::reassembly::Assembler,
};

const OP_QUERY: i32 = 2004;
const OP_REPLY: i32 = 1;
const OP_INSERT: i32 = 2002;

#[derive(Clone, Default)]
struct TestSink(Arc<Mutex<Vec<Vec<u8>>>>);

impl Publish for TestSink {
    fn publish(&self, event: Vec<u8>) -> bool {
        self.0.lock().unwrap().push(event);
        true
    }
}

impl TestSink {
    fn events(&self) -> Vec<serde_json::Value> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).unwrap())
            .collect()
    }
}

fn timestamp() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2006-01-02T15:04:05Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn client_flow(server_port: u16) -> FlowTuple {
    FlowTuple::new(
        "10.0.0.22".parse().unwrap(),
        "10.0.0.23".parse().unwrap(),
        44444,
        server_port,
    )
}

fn segment(tuple: FlowTuple, seq: u32, payload: &[u8]) -> Segment {
    Segment {
        tuple,
        seq,
        payload: payload.to_vec(),
        timestamp: timestamp(),
        fin: false,
        rst: false,
        truncated: false,
    }
}

fn mongodb_assembler(sink: &TestSink) -> Assembler<TestSink> {
    Assembler::new(
        ParserFactory::MongoDb {
            options: mongodb::Options::default(),
            publisher: sink.clone(),
        },
        Duration::from_secs(0),
        Duration::from_secs(3600),
    )
}

fn mysql_assembler(sink: &TestSink) -> Assembler<TestSink> {
    Assembler::new(
        ParserFactory::MySql {
            options: mysql::Options::default(),
            publisher: sink.clone(),
        },
        Duration::from_secs(0),
        Duration::from_secs(3600),
    )
}

fn document_bytes(document: &Document) -> Vec<u8> {
    let mut bytes = Vec::new();
    document.to_writer(&mut bytes).unwrap();
    bytes
}

fn gen_query(namespace: &str, document: &Document, request_id: i32) -> Vec<u8> {
    let serialized = document_bytes(document);
    let length = 16 + 4 + namespace.len() + 1 + 8 + serialized.len();
    let mut bytes = Vec::with_capacity(length);
    bytes.extend_from_slice(&(length as i32).to_le_bytes());
    bytes.extend_from_slice(&request_id.to_le_bytes());
    bytes.extend_from_slice(&0i32.to_le_bytes());
    bytes.extend_from_slice(&OP_QUERY.to_le_bytes());
    bytes.extend_from_slice(&0i32.to_le_bytes()); // flags
    bytes.extend_from_slice(namespace.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(&0i32.to_le_bytes()); // numberToSkip
    bytes.extend_from_slice(&0i32.to_le_bytes()); // numberToReturn
    bytes.extend_from_slice(&serialized);
    bytes
}

fn gen_reply(response_to: i32, documents: &[Document]) -> Vec<u8> {
    let serialized: Vec<u8> = documents.iter().flat_map(document_bytes).collect();
    let length = 16 + 20 + serialized.len();
    let mut bytes = Vec::with_capacity(length);
    bytes.extend_from_slice(&(length as i32).to_le_bytes());
    bytes.extend_from_slice(&0i32.to_le_bytes());
    bytes.extend_from_slice(&response_to.to_le_bytes());
    bytes.extend_from_slice(&OP_REPLY.to_le_bytes());
    bytes.extend_from_slice(&0i32.to_le_bytes()); // responseFlags
    bytes.extend_from_slice(&0i64.to_le_bytes()); // cursorID
    bytes.extend_from_slice(&0i32.to_le_bytes()); // startingFrom
    bytes.extend_from_slice(&(documents.len() as i32).to_le_bytes());
    bytes.extend_from_slice(&serialized);
    bytes
}

fn gen_old_insert(namespace: &str, documents: &[Document], request_id: i32) -> Vec<u8> {
    let serialized: Vec<u8> = documents.iter().flat_map(document_bytes).collect();
    let length = 16 + 4 + namespace.len() + 1 + serialized.len();
    let mut bytes = Vec::with_capacity(length);
    bytes.extend_from_slice(&(length as i32).to_le_bytes());
    bytes.extend_from_slice(&request_id.to_le_bytes());
    bytes.extend_from_slice(&0i32.to_le_bytes());
    bytes.extend_from_slice(&OP_INSERT.to_le_bytes());
    bytes.extend_from_slice(&0i32.to_le_bytes()); // flags
    bytes.extend_from_slice(namespace.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(&serialized);
    bytes
}

fn mysql_packet(sequence_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + payload.len());
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
    bytes.push(sequence_id);
    bytes.extend_from_slice(payload);
    bytes
}

#[tokio::test]
async fn find_request_and_reply_produce_one_event() {
    let sink = TestSink::default();
    let mut assembler = mongodb_assembler(&sink);
    let flow = client_flow(27017);

    let find = doc! {
        "find": "collection0",
        "filter": { "rating": { "$gte": 9 }, "cuisine": "italian" },
    };
    let request = gen_query("db.$cmd", &find, 11);
    let reply = gen_reply(11, &[doc! {}]);

    assembler.handle_segment(segment(flow, 1000, &request)).await;
    assembler
        .handle_segment(segment(flow.reverse(), 5000, &reply))
        .await;
    assembler.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event["command_type"], "find");
    assert_eq!(event["collection"], "collection0");
    assert_eq!(event["database"], "db");
    assert_eq!(event["namespace"], "db.$cmd");
    assert_eq!(event["client_ip"], "10.0.0.22");
    assert_eq!(event["server_ip"], "10.0.0.23");
    assert_eq!(event["request_id"], 11);
    assert_eq!(event["nreturned"], 1);
    assert_eq!(event["ninserted"], 0);
    assert_eq!(event["duration_ms"], 0.0);
    assert_eq!(event["request_length"], request.len() as u64);
    assert_eq!(event["response_length"], reply.len() as u64);
    assert_eq!(event["timestamp"], "2006-01-02T15:04:05Z");
    assert_eq!(
        event["command"],
        r#"{"filter":{"cuisine":"italian","rating":{"$gte":9}},"find":"collection0"}"#,
    );
    assert_eq!(
        event["normalized_query"],
        r#"{"filter":{"cuisine":1,"rating":{"$gte":1}},"find":1}"#,
    );
}

#[tokio::test]
async fn get_more_collection_comes_from_the_payload() {
    let sink = TestSink::default();
    let mut assembler = mongodb_assembler(&sink);
    let flow = client_flow(27017);

    let get_more = doc! {
        "getMore": 0i64,
        "collection": "restaurant",
        "batchSize": 100,
        "maxTimeMS": 1000,
    };
    let request = gen_query("db.$cmd", &get_more, 21);
    let reply = gen_reply(21, &[doc! {}]);

    assembler.handle_segment(segment(flow, 1000, &request)).await;
    assembler
        .handle_segment(segment(flow.reverse(), 5000, &reply))
        .await;
    assembler.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["command_type"], "getMore");
    assert_eq!(events[0]["collection"], "restaurant");
    assert_eq!(events[0]["database"], "db");
}

#[tokio::test]
async fn long_insert_command_truncates_to_500_bytes() {
    let sink = TestSink::default();
    let mut assembler = mongodb_assembler(&sink);
    let flow = client_flow(27017);

    let insert = doc! {
        "insert": "collection0",
        "documents": [ { "key": "x".repeat(2048) } ],
    };
    let request = gen_query("db.$cmd", &insert, 31);
    let reply = gen_reply(31, &[doc! { "n": 1 }]);

    assembler.handle_segment(segment(flow, 1000, &request)).await;
    assembler
        .handle_segment(segment(flow.reverse(), 5000, &reply))
        .await;
    assembler.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    let command = events[0]["command"].as_str().unwrap();
    assert_eq!(command.len(), 500);
    assert!(command.ends_with(" ..."));
    assert_eq!(events[0]["command_type"], "insert");
    assert_eq!(events[0]["ninserted"], 1);
}

#[tokio::test]
async fn orphan_reply_emits_no_event() {
    let sink = TestSink::default();
    let mut assembler = mongodb_assembler(&sink);
    let flow = client_flow(27017);

    let reply = gen_reply(1, &[doc! {}]);
    assembler
        .handle_segment(segment(flow.reverse(), 5000, &reply))
        .await;
    assembler.shutdown().await;

    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn old_style_insert_publishes_immediately() {
    let sink = TestSink::default();
    let mut assembler = mongodb_assembler(&sink);
    let flow = client_flow(27017);

    let insert = gen_old_insert("db.collection0", &[doc! { "a": "b" }], 41);
    assembler.handle_segment(segment(flow, 1000, &insert)).await;
    assembler.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event["command_type"], "insert");
    assert_eq!(event["ninserted"], 1);
    assert_eq!(event["duration_ms"], 0.0);
    assert_eq!(event["collection"], "collection0");
    assert_eq!(event["database"], "db");
    assert_eq!(event["namespace"], "db.collection0");
    assert_eq!(event["client_ip"], "10.0.0.22");
    assert_eq!(event["server_ip"], "10.0.0.23");
    assert_eq!(event["timestamp"], "2006-01-02T15:04:05Z");
}

#[tokio::test]
async fn direction_is_consistent_when_the_server_half_is_seen_first() {
    let sink = TestSink::default();
    let mut assembler = mongodb_assembler(&sink);
    let flow = client_flow(27017);

    // the reply half of some earlier exchange is captured first
    let stale_reply = gen_reply(7, &[doc! {}]);
    assembler
        .handle_segment(segment(flow.reverse(), 5000, &stale_reply))
        .await;

    let request = gen_query("db.$cmd", &doc! { "find": "c0", "filter": {} }, 8);
    let reply = gen_reply(8, &[doc! {}]);
    assembler
        .handle_segment(segment(flow, 1000, &request))
        .await;
    assembler
        .handle_segment(segment(
            flow.reverse(),
            5000 + stale_reply.len() as u32,
            &reply,
        ))
        .await;
    assembler.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["client_ip"], "10.0.0.22");
    assert_eq!(events[0]["server_ip"], "10.0.0.23");
    assert_eq!(events[0]["request_id"], 8);
}

#[tokio::test]
async fn out_of_order_segments_are_reassembled() {
    let sink = TestSink::default();
    let mut assembler = mongodb_assembler(&sink);
    let flow = client_flow(27017);

    let request = gen_query("db.$cmd", &doc! { "find": "c0", "filter": {} }, 51);
    let reply = gen_reply(51, &[doc! {}]);
    let (head, rest) = request.split_at(20);
    let (middle, tail) = rest.split_at(10);

    // the head establishes the cursor, then the tail overtakes the middle
    assembler.handle_segment(segment(flow, 1000, head)).await;
    assembler
        .handle_segment(segment(flow, 1030, tail))
        .await;
    assembler
        .handle_segment(segment(flow, 1020, middle))
        .await;
    assembler
        .handle_segment(segment(flow.reverse(), 5000, &reply))
        .await;
    assembler.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["command_type"], "find");
}

#[tokio::test]
async fn a_lost_segment_surfaces_as_a_gap_and_parsing_realigns() {
    let sink = TestSink::default();
    let mut assembler = mongodb_assembler(&sink);
    let flow = client_flow(27017);

    let first_request = gen_query("db.$cmd", &doc! { "find": "a", "filter": {} }, 61);
    let second_request = gen_query("db.$cmd", &doc! { "find": "b", "filter": {} }, 62);
    let first_reply = gen_reply(61, &[doc! {}]);
    let second_reply = gen_reply(62, &[doc! {}]);

    assembler
        .handle_segment(segment(flow, 1000, &first_request))
        .await;
    assembler
        .handle_segment(segment(
            flow,
            1000 + first_request.len() as u32,
            &second_request,
        ))
        .await;

    // the first reply loses its tail; the second arrives out of order
    // beyond the hole
    let server_seq = 5000u32;
    assembler
        .handle_segment(segment(flow.reverse(), server_seq, &first_reply[..20]))
        .await;
    assembler
        .handle_segment(segment(
            flow.reverse(),
            server_seq + first_reply.len() as u32,
            &second_reply,
        ))
        .await;
    // flush_timeout is zero in tests, so the sweep skips the hole now
    assembler.flush().await;
    assert_eq!(assembler.connection_count(), 1);
    assembler.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["request_id"], 62);
}

#[tokio::test]
async fn a_request_split_mid_header_still_parses() {
    let sink = TestSink::default();
    let mut assembler = mongodb_assembler(&sink);
    let flow = client_flow(27017);

    let request = gen_query("db.$cmd", &doc! { "find": "c0", "filter": {} }, 71);
    let reply = gen_reply(71, &[doc! {}]);
    let (head, tail) = request.split_at(10);

    assembler.handle_segment(segment(flow, 1000, head)).await;
    assembler
        .handle_segment(segment(flow, 1000 + head.len() as u32, tail))
        .await;
    assembler
        .handle_segment(segment(flow.reverse(), 5000, &reply))
        .await;
    assembler.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["command_type"], "find");
    assert_eq!(events[0]["request_id"], 71);
}

#[tokio::test]
async fn retransmitted_segments_do_not_duplicate_events() {
    let sink = TestSink::default();
    let mut assembler = mongodb_assembler(&sink);
    let flow = client_flow(27017);

    let request = gen_query("db.$cmd", &doc! { "find": "c0", "filter": {} }, 81);
    let reply = gen_reply(81, &[doc! {}]);

    assembler.handle_segment(segment(flow, 1000, &request)).await;
    // full retransmission, then a partial one overlapping the tail
    assembler.handle_segment(segment(flow, 1000, &request)).await;
    let tail_offset = request.len() as u32 - 10;
    assembler
        .handle_segment(segment(flow, 1000 + tail_offset, &request[tail_offset as usize..]))
        .await;
    assembler
        .handle_segment(segment(flow.reverse(), 5000, &reply))
        .await;
    assembler.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["request_id"], 81);
}

#[tokio::test]
async fn events_of_one_connection_are_emitted_in_reply_order() {
    let sink = TestSink::default();
    let mut assembler = mongodb_assembler(&sink);
    let flow = client_flow(27017);

    let first_request = gen_query("db.$cmd", &doc! { "find": "a", "filter": {} }, 91);
    let second_request = gen_query("db.$cmd", &doc! { "find": "b", "filter": {} }, 92);
    let first_reply = gen_reply(91, &[doc! {}]);
    let second_reply = gen_reply(92, &[doc! {}]);

    assembler
        .handle_segment(segment(flow, 1000, &first_request))
        .await;
    assembler
        .handle_segment(segment(
            flow,
            1000 + first_request.len() as u32,
            &second_request,
        ))
        .await;
    assembler
        .handle_segment(segment(flow.reverse(), 5000, &first_reply))
        .await;
    assembler
        .handle_segment(segment(
            flow.reverse(),
            5000 + first_reply.len() as u32,
            &second_reply,
        ))
        .await;
    assembler.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["request_id"], 91);
    assert_eq!(events[1]["request_id"], 92);
}

#[tokio::test]
async fn mysql_response_split_across_segments_still_parses() {
    let sink = TestSink::default();
    let mut assembler = mysql_assembler(&sink);
    let flow = client_flow(3306);

    let query = mysql_packet(0, b"\x03SELECT 1");
    assembler.handle_segment(segment(flow, 1000, &query)).await;

    let mut response = Vec::new();
    response.extend_from_slice(&mysql_packet(1, &[0x01]));
    response.extend_from_slice(&mysql_packet(2, &[0x03, b'd', b'e', b'f', b'1']));
    response.extend_from_slice(&mysql_packet(3, &[0xFE, 0, 0, 0, 0]));
    response.extend_from_slice(&mysql_packet(4, &[0x01, b'1']));
    response.extend_from_slice(&mysql_packet(5, &[0xFE, 0, 0, 0, 0]));

    // cut mid-packet; the parser must resume across the boundary
    let (head, tail) = response.split_at(response.len() / 2);
    assembler
        .handle_segment(segment(flow.reverse(), 5000, head))
        .await;
    assembler
        .handle_segment(segment(flow.reverse(), 5000 + head.len() as u32, tail))
        .await;
    assembler.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["rows_sent"], 1);
    assert_eq!(events[0]["columns_sent"], 1);
}

#[tokio::test]
async fn random_garbage_never_panics_the_pipeline() {
    use rand::RngCore;

    let sink = TestSink::default();
    let mut assembler = mongodb_assembler(&sink);
    let mut rng = rand::thread_rng();

    for connection in 0..16u16 {
        let flow = FlowTuple::new(
            "10.0.0.22".parse().unwrap(),
            "10.0.0.23".parse().unwrap(),
            40000 + connection,
            27017,
        );
        let mut seq = 1000u32;
        for _ in 0..4 {
            let mut payload = vec![0u8; 16 + (rng.next_u32() as usize % 256)];
            rng.fill_bytes(&mut payload);
            let len = payload.len() as u32;
            assembler.handle_segment(segment(flow, seq, &payload)).await;
            seq = seq.wrapping_add(len);
        }
    }
    assembler.shutdown().await;
}

#[tokio::test]
async fn mysql_select_with_three_rows() {
    let sink = TestSink::default();
    let mut assembler = mysql_assembler(&sink);
    let flow = client_flow(3306);

    let query = mysql_packet(0, b"\x03SELECT 1");
    assembler.handle_segment(segment(flow, 1000, &query)).await;

    let mut response = Vec::new();
    response.extend_from_slice(&mysql_packet(1, &[0x01])); // one column
    response.extend_from_slice(&mysql_packet(2, &[0x03, b'd', b'e', b'f', b'1'])); // col def
    response.extend_from_slice(&mysql_packet(3, &[0xFE, 0, 0, 0, 0])); // eof
    response.extend_from_slice(&mysql_packet(4, &[0x01, b'1'])); // rows
    response.extend_from_slice(&mysql_packet(5, &[0x01, b'2']));
    response.extend_from_slice(&mysql_packet(6, &[0x01, b'3']));
    response.extend_from_slice(&mysql_packet(7, &[0xFE, 0, 0, 0, 0])); // eof
    assembler
        .handle_segment(segment(flow.reverse(), 5000, &response))
        .await;
    assembler.shutdown().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event["query"], "SELECT 1");
    assert_eq!(event["rows_sent"], 3);
    assert_eq!(event["columns_sent"], 1);
    assert_eq!(event["error"], false);
    assert_eq!(event["client_ip"], "10.0.0.22");
    assert_eq!(event["server_ip"], "10.0.0.23");
}

#[tokio::test]
async fn mysql_empty_packet_is_a_parse_error_not_a_crash() {
    let sink = TestSink::default();
    let mut assembler = mysql_assembler(&sink);
    let flow = client_flow(3306);

    // zero payload length is rejected, rest of the message is discarded
    let mut bytes = mysql_packet(0, &[]);
    bytes.extend_from_slice(&mysql_packet(1, b"\x03SELECT 1"));
    assembler.handle_segment(segment(flow, 1000, &bytes)).await;
    assembler.shutdown().await;

    assert!(sink.events().is_empty());
}
