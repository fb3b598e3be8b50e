//! Request/reply correlation.
//!
//! A message whose type has a transaction definition gets a fresh id in
//! `wired.transaction`. Replies carrying that id are checked against the definition's
//! reply grammar and collected until the grammar is satisfied, at which point the waiter
//! (or callback) receives every reply in arrival order.
//!
//! Failures are reported through the same slot:
//! - a reply the grammar does not allow ends the transaction with `CorrelationFailure`
//! - a wait that outlives its timeout ends with `Timeout`
//! - [`Correlator::abandon_all`] ends everything with `ConnectionClosed`

use crate::core::message::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::spec::TransactionDefinition;
use crate::utils::metrics::global_metrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Outcome handed to a waiter or callback.
pub type Outcome = Result<Vec<Message>>;

type Callback = Box<dyn FnOnce(Outcome) + Send + 'static>;

#[derive(Default)]
struct SlotState {
    outcome: Option<Outcome>,
    callback: Option<Callback>,
    done: bool,
}

/// One-shot completion shared by a pending transaction and whoever waits on it.
#[derive(Default)]
struct CompletionSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl CompletionSlot {
    fn with_callback(callback: Callback) -> Self {
        Self {
            state: Mutex::new(SlotState {
                callback: Some(callback),
                ..SlotState::default()
            }),
            ready: Condvar::new(),
        }
    }

    /// First completion wins; later ones are dropped.
    fn complete(&self, outcome: Outcome) {
        let callback = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.done {
                return;
            }
            state.done = true;
            match state.callback.take() {
                Some(callback) => Some(callback),
                None => {
                    state.outcome = Some(outcome);
                    self.ready.notify_all();
                    return;
                }
            }
        };
        // Callbacks run outside the lock so they may start new transactions.
        if let Some(callback) = callback {
            callback(outcome);
        }
    }
}

struct Pending {
    definition: TransactionDefinition,
    counts: HashMap<String, u32>,
    replies: Vec<Message>,
    slot: Arc<CompletionSlot>,
}

type PendingTable = Arc<Mutex<HashMap<u32, Pending>>>;

/// Result of offering an incoming message to the correlator.
#[derive(Debug)]
pub enum Delivery {
    /// Carries no transaction id, or opens a transaction of the peer's; dispatch it
    /// normally.
    Unmatched(Message),
    /// Stamped with an id nothing is waiting on, typically a reply that arrived after its
    /// timeout. Discard it.
    Orphaned(Message),
    /// Taken as a reply.
    Consumed,
}

/// Per-connection table of open transactions.
pub struct Correlator {
    next_id: AtomicU32,
    pending: PendingTable,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn open(&self, message: &mut Message, slot: Arc<CompletionSlot>) -> Result<u32> {
        let definition = message
            .spec()
            .transaction(message.name())
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownTransaction(message.name().to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        message.set_transaction_id(id)?;

        let mut pending = self
            .pending
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;
        pending.insert(
            id,
            Pending {
                definition,
                counts: HashMap::new(),
                replies: Vec::new(),
                slot,
            },
        );
        global_metrics().transaction_started();
        trace!(id, message = message.name(), "Opened transaction");
        Ok(id)
    }

    /// Assign a transaction id to `message` and return a handle to wait for its replies.
    pub fn begin(&self, message: &mut Message) -> Result<Waiter> {
        let slot = Arc::new(CompletionSlot::default());
        let id = self.open(message, Arc::clone(&slot))?;
        Ok(Waiter {
            id,
            slot,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Like [`Correlator::begin`], but `callback` is invoked on the thread that completes
    /// the transaction instead of blocking a waiter. Returns the transaction id.
    pub fn begin_with_callback<F>(&self, message: &mut Message, callback: F) -> Result<u32>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        let slot = Arc::new(CompletionSlot::with_callback(Box::new(callback)));
        self.open(message, slot)
    }

    /// Offer an incoming message. Replies to pending transactions are consumed.
    pub fn receive(&self, message: Message) -> Delivery {
        let Some(id) = message.transaction_id() else {
            return Delivery::Unmatched(message);
        };

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = pending.get_mut(&id) else {
            if message.spec().transaction(message.name()).is_some() {
                return Delivery::Unmatched(message);
            }
            debug!(id, message = message.name(), "Discarding reply to no pending transaction");
            return Delivery::Orphaned(message);
        };

        let name = message.name().to_string();
        if !entry.definition.accepts(&name, &entry.counts) {
            let (slot, expected) = match pending.remove(&id) {
                Some(entry) => (entry.slot, entry.definition.message),
                None => return Delivery::Consumed,
            };
            drop(pending);
            warn!(id, %expected, received = %name, "Reply does not fit the transaction");
            global_metrics().transaction_failed();
            slot.complete(Err(ProtocolError::CorrelationFailure {
                expected,
                received: name,
            }));
            return Delivery::Consumed;
        }

        *entry.counts.entry(name).or_insert(0) += 1;
        entry.replies.push(message);

        if entry.definition.is_satisfied(&entry.counts) {
            if let Some(done) = pending.remove(&id) {
                drop(pending);
                trace!(id, replies = done.replies.len(), "Transaction complete");
                global_metrics().transaction_completed();
                done.slot.complete(Ok(done.replies));
            }
        }
        Delivery::Consumed
    }

    /// Fail every open transaction with `ConnectionClosed`.
    pub fn abandon_all(&self) {
        let drained: Vec<(u32, Pending)> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Abandoning open transactions");
        }
        for (_, entry) in drained {
            global_metrics().transaction_failed();
            entry.slot.complete(Err(ProtocolError::ConnectionClosed));
        }
    }

    /// Drop an open transaction without completing it. Returns whether it was open.
    pub fn cancel(&self, id: u32) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Number of open transactions.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Blocking handle on one open transaction. Dropping it closes the transaction.
pub struct Waiter {
    id: u32,
    slot: Arc<CompletionSlot>,
    pending: PendingTable,
}

impl Waiter {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the transaction has finished, successfully or not.
    pub fn is_complete(&self) -> bool {
        self.slot
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .done
    }

    /// Block until every expected reply arrived, returning them in arrival order.
    pub fn wait_all(self, timeout: Duration) -> Outcome {
        let state = self
            .slot
            .state
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;
        let (mut state, _) = self
            .slot
            .ready
            .wait_timeout_while(state, timeout, |s| s.outcome.is_none())
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;

        match state.outcome.take() {
            Some(outcome) => outcome,
            None => {
                state.done = true;
                drop(state);
                global_metrics().transaction_timed_out();
                debug!(id = self.id, ?timeout, "Transaction wait timed out");
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Block until the transaction completes and return the reply that completed it.
    pub fn wait(self, timeout: Duration) -> Result<Message> {
        self.wait_all(timeout)?.pop().ok_or_else(|| {
            ProtocolError::UnexpectedMessage("transaction completed without replies".into())
        })
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::spec::Specification;
    use std::sync::mpsc;

    const APP: &str = r#"<p7:protocol xmlns:p7="x" name="Test" version="1.0">
      <p7:fields>
        <p7:field name="wired.transaction" type="uint32" id="1000" />
        <p7:field name="test.path" type="string" id="1001" />
      </p7:fields>
      <p7:messages>
        <p7:message name="test.list" id="1000" />
        <p7:message name="test.entry" id="1001" />
        <p7:message name="test.done" id="1002" />
        <p7:message name="test.error" id="1003" />
        <p7:message name="test.other" id="1004" />
      </p7:messages>
      <p7:transactions>
        <p7:transaction message="test.list" originator="client" use="required">
          <p7:or>
            <p7:and>
              <p7:reply message="test.entry" count="*" use="optional" />
              <p7:reply message="test.done" count="1" use="required" />
            </p7:and>
            <p7:reply message="test.error" count="1" use="required" />
          </p7:or>
        </p7:transaction>
      </p7:transactions>
    </p7:protocol>"#;

    fn spec() -> Arc<Specification> {
        Arc::new(Specification::from_xml(APP).unwrap())
    }

    fn reply(spec: &Arc<Specification>, name: &str, id: u32) -> Message {
        let mut message = Message::new(spec, name).unwrap();
        message.set_transaction_id(id).unwrap();
        message
    }

    #[test]
    fn test_ids_increase_from_one() {
        let spec = spec();
        let correlator = Correlator::new();
        let mut first = Message::new(&spec, "test.list").unwrap();
        let mut second = Message::new(&spec, "test.list").unwrap();
        let a = correlator.begin(&mut first).unwrap();
        let b = correlator.begin(&mut second).unwrap();
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(first.transaction_id(), Some(1));
        assert_eq!(correlator.pending(), 2);
    }

    #[test]
    fn test_and_branch_collects_until_done() {
        let spec = spec();
        let correlator = Correlator::new();
        let mut request = Message::new(&spec, "test.list").unwrap();
        let waiter = correlator.begin(&mut request).unwrap();
        let id = waiter.id();

        for name in ["test.entry", "test.entry", "test.done"] {
            assert!(matches!(
                correlator.receive(reply(&spec, name, id)),
                Delivery::Consumed
            ));
        }
        let replies = waiter.wait_all(Duration::from_secs(1)).unwrap();
        let names: Vec<&str> = replies.iter().map(Message::name).collect();
        assert_eq!(names, ["test.entry", "test.entry", "test.done"]);
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn test_or_branch_error_completes() {
        let spec = spec();
        let correlator = Correlator::new();
        let mut request = Message::new(&spec, "test.list").unwrap();
        let waiter = correlator.begin(&mut request).unwrap();
        correlator.receive(reply(&spec, "test.error", waiter.id()));
        assert_eq!(
            waiter.wait(Duration::from_secs(1)).unwrap().name(),
            "test.error"
        );
    }

    #[test]
    fn test_unlisted_and_crossed_branch_fail() {
        let spec = spec();
        let correlator = Correlator::new();

        let mut request = Message::new(&spec, "test.list").unwrap();
        let waiter = correlator.begin(&mut request).unwrap();
        correlator.receive(reply(&spec, "test.other", waiter.id()));
        match waiter.wait(Duration::from_secs(1)) {
            Err(ProtocolError::CorrelationFailure { expected, received }) => {
                assert_eq!(expected, "test.list");
                assert_eq!(received, "test.other");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let mut request = Message::new(&spec, "test.list").unwrap();
        let waiter = correlator.begin(&mut request).unwrap();
        correlator.receive(reply(&spec, "test.entry", waiter.id()));
        correlator.receive(reply(&spec, "test.error", waiter.id()));
        assert!(matches!(
            waiter.wait(Duration::from_secs(1)),
            Err(ProtocolError::CorrelationFailure { .. })
        ));
    }

    #[test]
    fn test_timeout_is_distinct() {
        let spec = spec();
        let correlator = Correlator::new();
        let mut request = Message::new(&spec, "test.list").unwrap();
        let waiter = correlator.begin(&mut request).unwrap();
        let id = waiter.id();
        assert!(matches!(
            waiter.wait(Duration::from_millis(20)),
            Err(ProtocolError::Timeout)
        ));
        // A late reply no longer matches anything.
        assert!(matches!(
            correlator.receive(reply(&spec, "test.error", id)),
            Delivery::Orphaned(_)
        ));
    }

    #[test]
    fn test_stamped_request_from_peer_is_not_orphaned() {
        let spec = spec();
        let correlator = Correlator::new();
        assert!(matches!(
            correlator.receive(reply(&spec, "test.list", 77)),
            Delivery::Unmatched(_)
        ));
        assert!(matches!(
            correlator.receive(reply(&spec, "test.done", 77)),
            Delivery::Orphaned(_)
        ));
    }

    #[test]
    fn test_unmatched_and_unknown_transaction() {
        let spec = spec();
        let correlator = Correlator::new();
        let plain = Message::new(&spec, "test.other").unwrap();
        assert!(matches!(correlator.receive(plain), Delivery::Unmatched(_)));

        let mut other = Message::new(&spec, "test.other").unwrap();
        assert!(matches!(
            correlator.begin(&mut other),
            Err(ProtocolError::UnknownTransaction(_))
        ));
    }

    #[test]
    fn test_callback_and_abandon() {
        let spec = spec();
        let correlator = Correlator::new();
        let (tx, rx) = mpsc::channel();

        let mut request = Message::new(&spec, "test.list").unwrap();
        let id = correlator
            .begin_with_callback(&mut request, move |outcome| {
                tx.send(outcome.map(|r| r.len())).unwrap();
            })
            .unwrap();
        correlator.receive(reply(&spec, "test.done", id));
        assert_eq!(rx.recv().unwrap().unwrap(), 1);

        let mut request = Message::new(&spec, "test.list").unwrap();
        let waiter = correlator.begin(&mut request).unwrap();
        let handle = std::thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        correlator.abandon_all();
        assert!(matches!(
            handle.join().unwrap(),
            Err(ProtocolError::ConnectionClosed)
        ));
    }
}
