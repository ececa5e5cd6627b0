use crate::enums::{Rcode, RecordType};
use crate::middleware::coerce_to_response;
use crate::models::{Query, Response, RuleResult};
use crate::resourcerecord::Record;
use crate::server::{NameServer, RawNameServer};
use crate::Message;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("error for testing")]
struct ErrorForTesting;

#[derive(Debug, Error)]
#[error("another error for testing")]
struct AnotherError;

#[derive(Debug, Error)]
#[error("wrapper: {source}")]
struct WrapperError {
    #[source]
    source: ErrorForTesting,
}

fn sample_record() -> Record {
    Record::a("example.com", "127.0.0.1").expect("failed to build record")
}

fn question(name: &str) -> Message {
    Message::question(1, name, RecordType::A)
}

// Coercion
// ----------------------------------------------------------------------------

#[test]
fn test_coerce_none() {
    let response = coerce_to_response(RuleResult::None);
    assert!(response.answers.is_empty());
    assert_eq!(response.error_code, Rcode::NoError);
}

#[test]
fn test_coerce_record() {
    let response = coerce_to_response(RuleResult::from(sample_record()));
    assert_eq!(response.answers, vec![sample_record()]);
    assert_eq!(response.error_code, Rcode::NoError);
}

#[test]
fn test_coerce_record_list() {
    let response = coerce_to_response(RuleResult::from(vec![sample_record(), sample_record()]));
    assert_eq!(response.answers.len(), 2);
}

#[test]
fn test_coerce_response_passthrough() {
    let original = Response::with_error_code(Rcode::Refused);
    let response = coerce_to_response(RuleResult::from(original.clone()));
    assert_eq!(response, original);
}

// Exception handling
// ----------------------------------------------------------------------------

#[test]
fn test_exception_handler_called_once_per_query() {
    let mut server = NameServer::new("test");
    server
        .rule("throw-error.com", [RecordType::A], |_query| {
            Err(ErrorForTesting.into())
        })
        .expect("failed to register rule");

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    server.register_exception_handler::<ErrorForTesting, _>(move |_query, _error| {
        handler_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Response::with_error_code(Rcode::ServFail))
    });

    let server = RawNameServer::new(server);
    let reply = server
        .process_message(&question("throw-error.com"))
        .expect("processing should not error");

    assert_eq!(reply.header.rcode(), Rcode::ServFail);
    assert!(reply.answers.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unhandled_error_defaults_to_servfail() {
    let mut server = NameServer::new("test");
    server
        .rule("throw-error.com", [RecordType::A], |_query| {
            Err(ErrorForTesting.into())
        })
        .expect("failed to register rule");

    let server = RawNameServer::new(server);
    let reply = server
        .process_message(&question("throw-error.com"))
        .expect("processing should not error");
    assert_eq!(reply.header.rcode(), Rcode::ServFail);
}

#[test]
fn test_exception_handler_matches_source_chain() {
    // only the inner error type is registered, the wrapper should still
    // land on its handler via the source chain
    let mut server = NameServer::new("test");
    server
        .rule("throw-error.com", [RecordType::A], |_query| {
            Err(WrapperError {
                source: ErrorForTesting,
            }
            .into())
        })
        .expect("failed to register rule");

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    server.register_exception_handler::<ErrorForTesting, _>(move |_query, _error| {
        handler_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Response::with_error_code(Rcode::Refused))
    });

    let server = RawNameServer::new(server);
    let reply = server
        .process_message(&question("throw-error.com"))
        .expect("processing should not error");
    assert_eq!(reply.header.rcode(), Rcode::Refused);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_most_specific_registration_wins() {
    // both the wrapper and its source are registered, the wrapper is the
    // outermost error so its handler runs
    let mut server = NameServer::new("test");
    server
        .rule("throw-error.com", [RecordType::A], |_query| {
            Err(WrapperError {
                source: ErrorForTesting,
            }
            .into())
        })
        .expect("failed to register rule");

    server.register_exception_handler::<ErrorForTesting, _>(|_query, _error| {
        Ok(Response::with_error_code(Rcode::ServFail))
    });
    server.register_exception_handler::<WrapperError, _>(|_query, _error| {
        Ok(Response::with_error_code(Rcode::Refused))
    });

    let server = RawNameServer::new(server);
    let reply = server
        .process_message(&question("throw-error.com"))
        .expect("processing should not error");
    assert_eq!(reply.header.rcode(), Rcode::Refused);
}

#[test]
fn test_reregistration_replaces_handler() {
    let mut server = NameServer::new("test");
    server
        .rule("throw-error.com", [RecordType::A], |_query| {
            Err(ErrorForTesting.into())
        })
        .expect("failed to register rule");

    server.register_exception_handler::<ErrorForTesting, _>(|_query, _error| {
        Ok(Response::with_error_code(Rcode::ServFail))
    });
    server.register_exception_handler::<ErrorForTesting, _>(|_query, _error| {
        Ok(Response::with_error_code(Rcode::Refused))
    });

    let server = RawNameServer::new(server);
    let reply = server
        .process_message(&question("throw-error.com"))
        .expect("processing should not error");
    assert_eq!(reply.header.rcode(), Rcode::Refused);
}

#[test]
fn test_bad_exception_handler_caught_by_raw_layer() {
    let mut server = NameServer::new("test");
    server
        .rule("throw-another-error.com", [RecordType::A], |_query| {
            Err(AnotherError.into())
        })
        .expect("failed to register rule");

    // this handler is itself broken
    server.register_exception_handler::<AnotherError, _>(|_query, _error| {
        Err(ErrorForTesting.into())
    });

    let raw_calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = raw_calls.clone();
    server.register_raw_exception_handler::<ErrorForTesting, _>(move |message, _error| {
        handler_calls.fetch_add(1, Ordering::SeqCst);
        let mut reply = message.reply();
        reply.header.set_rcode(Rcode::ServFail);
        Ok(reply)
    });

    let server = RawNameServer::new(server);
    let reply = server
        .process_message(&question("throw-another-error.com"))
        .expect("processing should not error");
    assert_eq!(reply.header.rcode(), Rcode::ServFail);
    assert_eq!(raw_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_bad_exception_handler_without_raw_handler() {
    let mut server = NameServer::new("test");
    server
        .rule("throw-another-error.com", [RecordType::A], |_query| {
            Err(AnotherError.into())
        })
        .expect("failed to register rule");
    server.register_exception_handler::<AnotherError, _>(|_query, _error| {
        Err(ErrorForTesting.into())
    });

    let server = RawNameServer::new(server);
    let reply = server
        .process_message(&question("throw-another-error.com"))
        .expect("processing should not error");
    // the default raw handler builds an empty SERVFAIL reply
    assert_eq!(reply.header.rcode(), Rcode::ServFail);
    assert!(reply.answers.is_empty());
}

// Hooks
// ----------------------------------------------------------------------------

struct HookCounters {
    before_first_query: Arc<AtomicUsize>,
    before_query: Arc<AtomicUsize>,
    after_query: Arc<AtomicUsize>,
}

fn register_counting_hooks(server: &mut NameServer) -> HookCounters {
    let counters = HookCounters {
        before_first_query: Arc::new(AtomicUsize::new(0)),
        before_query: Arc::new(AtomicUsize::new(0)),
        after_query: Arc::new(AtomicUsize::new(0)),
    };

    let count = counters.before_first_query.clone();
    server.register_before_first_query(move || {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let count = counters.before_query.clone();
    server.register_before_query(move |_query| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(RuleResult::None)
    });
    let count = counters.after_query.clone();
    server.register_after_query(move |response| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(response)
    });

    counters
}

#[test]
fn test_hook_call_counts() {
    let mut server = NameServer::new("test");
    server
        .rule("dummy.com", [RecordType::A], |query| {
            Ok(Record::a(&query.name, "127.0.0.1")?.into())
        })
        .expect("failed to register rule");
    let counters = register_counting_hooks(&mut server);

    let server = RawNameServer::new(server);
    for _ in 0..5 {
        let reply = server
            .process_message(&question("dummy.com"))
            .expect("processing should not error");
        assert_eq!(reply.answers.len(), 1);
    }

    assert_eq!(counters.before_first_query.load(Ordering::SeqCst), 1);
    assert_eq!(counters.before_query.load(Ordering::SeqCst), 5);
    assert_eq!(counters.after_query.load(Ordering::SeqCst), 5);
}

#[test]
fn test_before_query_short_circuits_dispatch() {
    let rule_calls = Arc::new(AtomicUsize::new(0));

    let mut server = NameServer::new("test");
    let calls = rule_calls.clone();
    server
        .rule("dummy.com", [RecordType::A], move |query| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Record::a(&query.name, "127.0.0.1")?.into())
        })
        .expect("failed to register rule");

    server.register_before_query(|_query| {
        Ok(RuleResult::from(
            Record::a("hook.example.com", "10.0.0.1").expect("failed to build record"),
        ))
    });

    let after_calls = Arc::new(AtomicUsize::new(0));
    let calls = after_calls.clone();
    server.register_after_query(move |response| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(response)
    });

    let server = RawNameServer::new(server);
    let reply = server
        .process_message(&question("dummy.com"))
        .expect("processing should not error");

    assert_eq!(reply.answers.len(), 1);
    assert_eq!(rule_calls.load(Ordering::SeqCst), 0);
    // after_query hooks run on short-circuited responses too
    assert_eq!(after_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_after_query_pipes_in_order() {
    let mut server = NameServer::new("test");
    server
        .rule("dummy.com", [RecordType::A], |query| {
            Ok(Record::a(&query.name, "127.0.0.1")?.into())
        })
        .expect("failed to register rule");

    server.register_after_query(|mut response| {
        response
            .answers
            .push(Record::a("first.example.com", "10.0.0.1")?);
        Ok(response)
    });
    server.register_after_query(|mut response| {
        response
            .answers
            .push(Record::a("second.example.com", "10.0.0.2")?);
        Ok(response)
    });

    let server = RawNameServer::new(server);
    let reply = server
        .process_message(&question("dummy.com"))
        .expect("processing should not error");
    assert_eq!(reply.answers.len(), 3);
    assert_eq!(reply.answers[1].name, b"first.example.com".to_vec());
    assert_eq!(reply.answers[2].name, b"second.example.com".to_vec());
}

#[test]
fn test_failed_before_first_query_runs_only_once() {
    let bfq_calls = Arc::new(AtomicUsize::new(0));

    let mut server = NameServer::new("test");
    server
        .rule("dummy.com", [RecordType::A], |query| {
            Ok(Record::a(&query.name, "127.0.0.1")?.into())
        })
        .expect("failed to register rule");

    let calls = bfq_calls.clone();
    server.register_before_first_query(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(ErrorForTesting.into())
    });
    // never reached, the first hook fails
    let calls = bfq_calls.clone();
    server.register_before_first_query(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let server = RawNameServer::new(server);

    // first query surfaces the hook failure as SERVFAIL
    let reply = server
        .process_message(&question("dummy.com"))
        .expect("processing should not error");
    assert_eq!(reply.header.rcode(), Rcode::ServFail);
    assert_eq!(bfq_calls.load(Ordering::SeqCst), 1);

    // later queries process normally, the latch never re-fires
    let reply = server
        .process_message(&question("dummy.com"))
        .expect("processing should not error");
    assert_eq!(reply.header.rcode(), Rcode::NoError);
    assert_eq!(reply.answers.len(), 1);
    assert_eq!(bfq_calls.load(Ordering::SeqCst), 1);
}
