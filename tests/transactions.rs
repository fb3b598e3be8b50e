//! Correlator behaviour against the transactions declared in `specs/wired.xml`

#![allow(clippy::unwrap_used, clippy::panic)]

use p7_protocol::protocol::transaction::Delivery;
use p7_protocol::{Correlator, Message, ProtocolError, Specification};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn spec() -> Arc<Specification> {
    Arc::new(Specification::from_xml(include_str!("../specs/wired.xml")).unwrap())
}

fn reply(spec: &Arc<Specification>, name: &str, id: u32) -> Message {
    let mut message = Message::new(spec, name).unwrap();
    message.set_transaction_id(id).unwrap();
    message
}

fn list_directory(spec: &Arc<Specification>) -> Message {
    Message::new(spec, "wired.file.list_directory")
        .unwrap()
        .with("wired.file.path", "/")
        .unwrap()
}

#[test]
fn test_listing_completes_on_done_from_another_thread() {
    let spec = spec();
    let correlator = Arc::new(Correlator::new());
    let mut request = list_directory(&spec);
    let waiter = correlator.begin(&mut request).unwrap();
    let id = request.transaction_id().unwrap();
    assert_eq!(waiter.id(), id);

    let feeder = {
        let correlator = Arc::clone(&correlator);
        let spec = Arc::clone(&spec);
        thread::spawn(move || {
            for _ in 0..5 {
                assert!(matches!(
                    correlator.receive(reply(&spec, "wired.file.file_list", id)),
                    Delivery::Consumed
                ));
            }
            correlator.receive(reply(&spec, "wired.file.file_list.done", id));
        })
    };

    let replies = waiter.wait_all(WAIT).unwrap();
    feeder.join().unwrap();
    assert_eq!(replies.len(), 6);
    assert_eq!(replies.last().unwrap().name(), "wired.file.file_list.done");
    assert_eq!(correlator.pending(), 0);
}

#[test]
fn test_empty_listing_and_error_branch() {
    let spec = spec();
    let correlator = Correlator::new();

    let mut empty = list_directory(&spec);
    let waiter = correlator.begin(&mut empty).unwrap();
    correlator.receive(reply(&spec, "wired.file.file_list.done", waiter.id()));
    assert_eq!(waiter.wait_all(WAIT).unwrap().len(), 1);

    let mut missing = list_directory(&spec);
    let waiter = correlator.begin(&mut missing).unwrap();
    correlator.receive(reply(&spec, "wired.error", waiter.id()));
    assert_eq!(waiter.wait(WAIT).unwrap().name(), "wired.error");
}

#[test]
fn test_error_after_entries_fails_the_transaction() {
    let spec = spec();
    let correlator = Correlator::new();
    let mut request = list_directory(&spec);
    let waiter = correlator.begin(&mut request).unwrap();

    correlator.receive(reply(&spec, "wired.file.file_list", waiter.id()));
    correlator.receive(reply(&spec, "wired.error", waiter.id()));

    match waiter.wait_all(WAIT) {
        Err(ProtocolError::CorrelationFailure { expected, received }) => {
            assert_eq!(expected, "wired.file.list_directory");
            assert_eq!(received, "wired.error");
        }
        other => panic!("expected correlation failure, got {other:?}"),
    }
    assert_eq!(correlator.pending(), 0);
}

#[test]
fn test_ping_expects_exactly_one_reply() {
    let spec = spec();
    let correlator = Correlator::new();
    let mut ping = Message::new(&spec, "wired.send_ping").unwrap();
    let waiter = correlator.begin(&mut ping).unwrap();
    let id = waiter.id();

    correlator.receive(reply(&spec, "wired.ping", id));
    assert!(waiter.is_complete());
    assert_eq!(waiter.wait(WAIT).unwrap().name(), "wired.ping");

    // A second reply finds nothing pending.
    assert!(matches!(
        correlator.receive(reply(&spec, "wired.ping", id)),
        Delivery::Orphaned(_)
    ));
}

#[test]
fn test_unsolicited_messages_pass_through() {
    let spec = spec();
    let correlator = Correlator::new();
    let leave = Message::new(&spec, "wired.chat.user_leave")
        .unwrap()
        .with("wired.chat.id", 1u32)
        .unwrap()
        .with("wired.user.id", 7u32)
        .unwrap();
    match correlator.receive(leave) {
        Delivery::Unmatched(message) => assert_eq!(message.name(), "wired.chat.user_leave"),
        other => panic!("push message was not passed through: {other:?}"),
    }
}

#[test]
fn test_ping_from_the_server_is_not_a_reply() {
    let spec = spec();
    let correlator = Correlator::new();
    match correlator.receive(reply(&spec, "wired.send_ping", 9)) {
        Delivery::Unmatched(message) => assert_eq!(message.transaction_id(), Some(9)),
        other => panic!("server request was not passed through: {other:?}"),
    }
}

#[test]
fn test_messages_without_transactions_cannot_begin() {
    let spec = spec();
    let correlator = Correlator::new();
    let mut say = Message::new(&spec, "wired.chat.say").unwrap();
    assert!(matches!(
        correlator.begin(&mut say),
        Err(ProtocolError::UnknownTransaction(name)) if name == "wired.chat.say"
    ));
    assert_eq!(say.transaction_id(), None);
}

#[test]
fn test_timeout_then_late_reply_is_discarded() {
    let spec = spec();
    let correlator = Correlator::new();
    let mut info = Message::new(&spec, "wired.client_info").unwrap();
    let waiter = correlator.begin(&mut info).unwrap();
    let id = waiter.id();

    assert!(matches!(
        waiter.wait_all(Duration::from_millis(20)),
        Err(ProtocolError::Timeout)
    ));
    assert_eq!(correlator.pending(), 0);
    match correlator.receive(reply(&spec, "wired.server_info", id)) {
        Delivery::Orphaned(late) => assert_eq!(late.name(), "wired.server_info"),
        other => panic!("late reply was not discarded: {other:?}"),
    }
}

#[test]
fn test_cancel_and_abandon() {
    let spec = spec();
    let correlator = Correlator::new();
    let (tx, rx) = mpsc::channel();

    let mut nick = Message::new(&spec, "wired.user.set_nick").unwrap();
    let cancelled = correlator
        .begin_with_callback(&mut nick, |_| panic!("cancelled transaction completed"))
        .unwrap();
    assert!(correlator.cancel(cancelled));
    assert!(!correlator.cancel(cancelled));

    let mut status = Message::new(&spec, "wired.user.set_status").unwrap();
    correlator
        .begin_with_callback(&mut status, move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();
    correlator.abandon_all();
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert_eq!(correlator.pending(), 0);
}

#[test]
fn test_concurrent_waiters_get_their_own_replies() {
    let spec = spec();
    let correlator = Arc::new(Correlator::new());

    let mut ids = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let mut ping = Message::new(&spec, "wired.send_ping").unwrap();
        let waiter = correlator.begin(&mut ping).unwrap();
        ids.push(waiter.id());
        handles.push(thread::spawn(move || {
            let id = waiter.id();
            let reply = waiter.wait(WAIT).unwrap();
            assert_eq!(reply.transaction_id(), Some(id));
        }));
    }

    for id in ids.into_iter().rev() {
        correlator.receive(reply(&spec, "wired.ping", id));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(correlator.pending(), 0);
}
