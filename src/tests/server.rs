use crate::enums::{OpCode, Rcode, RecordType};
use crate::models::{Response, RuleResult};
use crate::resourcerecord::Record;
use crate::rules::{QtypeFilter, RuleMatcher, ALL_QTYPES};
use crate::server::{Blueprint, NameServer, RawNameServer};
use crate::Message;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const IP: &str = "127.0.0.1";

fn question(name: &str) -> Message {
    Message::question(1, name, RecordType::A)
}

/// A server covering the different handler return shapes.
fn result_shape_server() -> RawNameServer {
    let mut server = NameServer::new("tests");

    server
        .rule("dummy.com", [RecordType::A], |query| {
            Ok(Record::a(&query.name, IP)?.into())
        })
        .expect("failed to register rule");

    server
        .rule("none-response.com", [RecordType::A], |_query| {
            Ok(RuleResult::None)
        })
        .expect("failed to register rule");

    server
        .rule("response-response.com", [RecordType::A], |query| {
            let mut response = Response::new();
            response.answers.push(Record::a(&query.name, IP)?);
            Ok(response.into())
        })
        .expect("failed to register rule");

    server
        .rule("record-response.com", [RecordType::A], |query| {
            Ok(Record::a(&query.name, IP)?.into())
        })
        .expect("failed to register rule");

    server
        .rule("multi-record-response.com", [RecordType::A], |query| {
            Ok(vec![
                Record::a(&query.name, IP)?,
                Record::a(&query.name, IP)?,
            ]
            .into())
        })
        .expect("failed to register rule");

    RawNameServer::new(server)
}

#[test]
fn test_none_response() {
    let server = result_shape_server();
    let reply = server
        .process_message(&question("none-response.com"))
        .expect("processing should not error");
    assert_eq!(reply.header.rcode(), Rcode::NoError);
    assert!(reply.answers.is_empty());
}

#[test]
fn test_response_response() {
    let server = result_shape_server();
    let reply = server
        .process_message(&question("response-response.com"))
        .expect("processing should not error");
    assert_eq!(reply.answers.len(), 1);
    assert_eq!(reply.answers[0].record_type, RecordType::A);
    assert_eq!(reply.answers[0].name, b"response-response.com".to_vec());
}

#[test]
fn test_record_response() {
    let server = result_shape_server();
    let reply = server
        .process_message(&question("record-response.com"))
        .expect("processing should not error");
    assert_eq!(reply.answers.len(), 1);
    assert_eq!(reply.answers[0].record_type, RecordType::A);
    assert_eq!(reply.answers[0].rdata, vec![127, 0, 0, 1]);
}

#[test]
fn test_multi_record_response() {
    let server = result_shape_server();
    let reply = server
        .process_message(&question("multi-record-response.com"))
        .expect("processing should not error");
    assert_eq!(reply.answers.len(), 2);
    for record in &reply.answers {
        assert_eq!(record.record_type, RecordType::A);
        assert_eq!(record.name, b"multi-record-response.com".to_vec());
    }
}

#[test]
fn test_nxdomain_on_no_match() {
    let server = result_shape_server();
    let reply = server
        .process_message(&question("miss.example.com"))
        .expect("processing should not error");
    assert_eq!(reply.header.rcode(), Rcode::NameError);
    assert!(reply.answers.is_empty());
}

#[test]
fn test_first_match_wins() {
    let first_calls = Arc::new(AtomicUsize::new(0));
    let second_calls = Arc::new(AtomicUsize::new(0));

    let mut server = NameServer::new("tests");
    let calls = first_calls.clone();
    server
        .rule("overlap.com", [RecordType::A], move |query| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Record::a(&query.name, "10.0.0.1")?.into())
        })
        .expect("failed to register rule");
    let calls = second_calls.clone();
    server
        .rule("overlap.com", [RecordType::A], move |query| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Record::a(&query.name, "10.0.0.2")?.into())
        })
        .expect("failed to register rule");

    let server = RawNameServer::new(server);
    let reply = server
        .process_message(&question("overlap.com"))
        .expect("processing should not error");

    assert_eq!(reply.answers[0].rdata, vec![10, 0, 0, 1]);
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
}

// Protocol edge handling
// ----------------------------------------------------------------------------

#[test]
fn test_non_query_opcode_not_implemented() {
    let server = result_shape_server();
    let mut message = question("dummy.com");
    message.header.set_opcode(OpCode::Status);

    let reply = server
        .process_message(&message)
        .expect("processing should not error");
    assert_eq!(reply.header.rcode(), Rcode::NotImplemented);
    assert!(reply.answers.is_empty());
}

#[test]
fn test_multi_question_refused() {
    let server = result_shape_server();
    let mut message = question("dummy.com");
    message.header.qdcount = 2;

    let reply = server
        .process_message(&message)
        .expect("processing should not error");
    assert_eq!(reply.header.rcode(), Rcode::Refused);
}

#[test]
fn test_zero_question_refused() {
    let server = result_shape_server();
    let mut message = question("dummy.com");
    message.header.qdcount = 0;
    message.question = None;

    let reply = server
        .process_message(&message)
        .expect("processing should not error");
    assert_eq!(reply.header.rcode(), Rcode::Refused);
}

#[test]
fn test_unknown_qtype_format_error() {
    let server = result_shape_server();
    let mut message = question("dummy.com");
    if let Some(question) = &mut message.question {
        question.qtype = RecordType::InvalidType;
    }

    let reply = server
        .process_message(&message)
        .expect("processing should not error");
    assert_eq!(reply.header.rcode(), Rcode::FormatError);
}

// Blueprints
// ----------------------------------------------------------------------------

fn blueprint_server() -> RawNameServer {
    let mut server = NameServer::new("test_blueprint");
    let mut blueprint_1 = Blueprint::new("blueprint_1");
    let mut blueprint_2 = Blueprint::new("blueprint_2");
    let mut blueprint_3 = Blueprint::new("blueprint_3");

    server
        .rule("s.com", [RecordType::A], |query| {
            Ok(Record::a(&query.name, IP)?.into())
        })
        .expect("failed to register rule");
    blueprint_1
        .rule("b1.com", [RecordType::A], |query| {
            Ok(Record::a(&query.name, IP)?.into())
        })
        .expect("failed to register rule");
    blueprint_2
        .rule("b2.com", [RecordType::A], |query| {
            Ok(Record::a(&query.name, IP)?.into())
        })
        .expect("failed to register rule");
    blueprint_3
        .rule("b3.b2.com", [RecordType::A], |query| {
            Ok(Record::a(&query.name, IP)?.into())
        })
        .expect("failed to register rule");

    // nested registration happens inside-out
    blueprint_2
        .register_blueprint(
            blueprint_3,
            RuleMatcher::zone("b3.b2.com"),
            QtypeFilter::from(&*ALL_QTYPES),
        )
        .expect("failed to register blueprint");
    server
        .register_blueprint(
            blueprint_1,
            RuleMatcher::zone("b1.com"),
            QtypeFilter::from(&*ALL_QTYPES),
        )
        .expect("failed to register blueprint");
    server
        .register_blueprint(
            blueprint_2,
            RuleMatcher::zone("b2.com"),
            QtypeFilter::from(&*ALL_QTYPES),
        )
        .expect("failed to register blueprint");

    RawNameServer::new(server)
}

#[test]
fn test_blueprint_responses() {
    let server = blueprint_server();
    for name in ["s.com", "b1.com", "b2.com", "b3.b2.com"] {
        let reply = server
            .process_message(&question(name))
            .expect("processing should not error");
        assert_eq!(reply.answers.len(), 1, "{name} should have answered");
        assert_eq!(reply.answers[0].record_type, RecordType::A);
        assert_eq!(reply.answers[0].name, name.as_bytes().to_vec());
    }
}

#[test]
fn test_blueprint_nxdomain() {
    let server = blueprint_server();
    for name in ["miss.s.com", "miss.b1.com", "miss.b2.com", "miss.b3.b2.com"] {
        let reply = server
            .process_message(&question(name))
            .expect("processing should not error");
        assert!(reply.answers.is_empty());
        assert_eq!(reply.header.rcode(), Rcode::NameError, "{name}");
    }
}

// Sub-servers
// ----------------------------------------------------------------------------

struct SubServerFixture {
    server: RawNameServer,
    parent_before_query: Arc<AtomicUsize>,
    sub1_before_query: Arc<AtomicUsize>,
    sub2_before_query: Arc<AtomicUsize>,
    sub2_after_query: Arc<AtomicUsize>,
}

fn subserver_fixture() -> SubServerFixture {
    let mut nameserver = NameServer::new("test_subserver");
    let mut subserver_1 = NameServer::new("subserver_1");
    let mut subserver_2 = NameServer::new("subserver_2");

    nameserver
        .rule("s.com", [RecordType::A], |query| {
            Ok(Record::a(&query.name, IP)?.into())
        })
        .expect("failed to register rule");
    subserver_1
        .rule("sub1.com", [RecordType::A], |query| {
            Ok(Record::a(&query.name, IP)?.into())
        })
        .expect("failed to register rule");
    subserver_2
        .rule("sub2.com", [RecordType::A], |query| {
            Ok(Record::a(&query.name, IP)?.into())
        })
        .expect("failed to register rule");

    let parent_before_query = Arc::new(AtomicUsize::new(0));
    let count = parent_before_query.clone();
    nameserver.register_before_query(move |_query| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(RuleResult::None)
    });

    let sub1_before_query = Arc::new(AtomicUsize::new(0));
    let count = sub1_before_query.clone();
    subserver_1.register_before_query(move |_query| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(RuleResult::None)
    });

    let sub2_before_query = Arc::new(AtomicUsize::new(0));
    let count = sub2_before_query.clone();
    subserver_2.register_before_query(move |_query| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(RuleResult::None)
    });
    let sub2_after_query = Arc::new(AtomicUsize::new(0));
    let count = sub2_after_query.clone();
    subserver_2.register_after_query(move |response| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(response)
    });

    nameserver
        .register_subserver(
            subserver_1,
            RuleMatcher::zone("sub1.com"),
            QtypeFilter::Any,
        )
        .expect("failed to register subserver");
    nameserver
        .register_subserver(
            subserver_2,
            RuleMatcher::zone("sub2.com"),
            QtypeFilter::Any,
        )
        .expect("failed to register subserver");

    SubServerFixture {
        server: RawNameServer::new(nameserver),
        parent_before_query,
        sub1_before_query,
        sub2_before_query,
        sub2_after_query,
    }
}

#[test]
fn test_subserver_responses() {
    let fixture = subserver_fixture();
    for name in ["s.com", "sub1.com", "sub2.com"] {
        let reply = fixture
            .server
            .process_message(&question(name))
            .expect("processing should not error");
        assert_eq!(reply.answers.len(), 1, "{name} should have answered");
        assert_eq!(reply.answers[0].name, name.as_bytes().to_vec());
    }
}

#[test]
fn test_subserver_nxdomain_propagates() {
    let fixture = subserver_fixture();
    let reply = fixture
        .server
        .process_message(&question("miss.sub2.com"))
        .expect("processing should not error");
    assert!(reply.answers.is_empty());
    assert_eq!(reply.header.rcode(), Rcode::NameError);
}

#[test]
fn test_subserver_hooks_are_scoped() {
    let fixture = subserver_fixture();

    for _ in 0..5 {
        fixture
            .server
            .process_message(&question("sub2.com"))
            .expect("processing should not error");
    }

    // the parent's hooks see every query, only the matched sub-server's
    // hooks fire
    assert_eq!(fixture.parent_before_query.load(Ordering::SeqCst), 5);
    assert_eq!(fixture.sub1_before_query.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.sub2_before_query.load(Ordering::SeqCst), 5);
    assert_eq!(fixture.sub2_after_query.load(Ordering::SeqCst), 5);

    fixture
        .server
        .process_message(&question("s.com"))
        .expect("processing should not error");
    assert_eq!(fixture.parent_before_query.load(Ordering::SeqCst), 6);
    assert_eq!(fixture.sub2_before_query.load(Ordering::SeqCst), 5);
}
