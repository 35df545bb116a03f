//! Request/response correlation on the worker side.
//!
//! Many virtual users share one transport connection to the coordinator.
//! Each outstanding request is registered in a [`CorrelationTable`] under
//! the caller's correlation id; the reply pump resolves the matching entry
//! when a `consume_testdata` message carrying that id arrives.
//!
//! The table lock is only held while inserting, resolving or removing an
//! entry, never across the wait itself, so callers wait independently.
//!
//! A correlation id may have at most one pending request. A second
//! registration while the first is outstanding is rejected with
//! [`SwarmError::DuplicateCorrelation`] instead of replacing the first
//! caller's wait.

use crate::protocol::{ConsumeTestdata, ProduceTestdata, Request, CONSUME_TESTDATA, PRODUCE_TESTDATA};
use crate::transport::{Inbox, Message, Transport};
use crate::{Result, SwarmError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct PendingEntry {
    token: u64,
    tx: Option<oneshot::Sender<Value>>,
}

/// Registry of in-flight requests, keyed by correlation id.
#[derive(Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<u64, PendingEntry>>,
    next_uid: AtomicU64,
    next_token: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a correlation id for a new caller.
    ///
    /// Ids are stable per caller and unique within this table.
    pub fn next_uid(&self) -> u64 {
        self.next_uid.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pending request for `uid`.
    ///
    /// The entry is removed when the returned [`PendingCall`] is dropped,
    /// whether or not a reply arrived.
    pub fn register(self: &Arc<Self>, uid: u64) -> Result<PendingCall> {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        {
            let mut pending = self.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(SwarmError::Transport {
                    message: "reply channel closed".to_string(),
                });
            }
            if pending.contains_key(&uid) {
                warn!("correlation id {} is already waiting for a reply", uid);
                return Err(SwarmError::DuplicateCorrelation { uid });
            }
            pending.insert(uid, PendingEntry { token, tx: Some(tx) });
        }

        Ok(PendingCall {
            uid,
            token,
            table: Arc::clone(self),
            rx: Some(rx),
        })
    }

    /// Resolve the pending request for `uid` with `response`.
    ///
    /// Returns `false` if nobody is waiting (late reply after a timeout, or
    /// a reply that was already delivered); such replies are dropped.
    pub fn resolve(&self, uid: u64, response: Value) -> bool {
        let tx = self.lock().get_mut(&uid).and_then(|entry| entry.tx.take());

        match tx {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!("dropping reply for correlation id {} without a pending request", uid);
                false
            }
        }
    }

    /// Route an inbound transport message; only `consume_testdata` is handled.
    pub fn handle_message(&self, message: Message) -> bool {
        if message.topic != CONSUME_TESTDATA {
            debug!("ignoring message \"{}\"", message.topic);
            return false;
        }

        match serde_json::from_value::<ConsumeTestdata>(message.data) {
            Ok(reply) => self.resolve(reply.uid, reply.response),
            Err(e) => {
                warn!("malformed {} message: {}", CONSUME_TESTDATA, e);
                false
            }
        }
    }

    /// Fail every outstanding wait and reject new registrations.
    pub fn close(&self) {
        let mut pending = self.lock();
        self.closed.store(true, Ordering::Release);
        for entry in pending.values_mut() {
            entry.tx.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn remove(&self, uid: u64, token: u64) {
        let mut pending = self.lock();
        if pending.get(&uid).map(|entry| entry.token) == Some(token) {
            pending.remove(&uid);
        }
    }

    /// Feed replies from `inbox` into this table until the inbox closes.
    pub fn spawn_reply_pump(self: &Arc<Self>, mut inbox: Inbox) -> tokio::task::JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                table.handle_message(message);
            }
            debug!("reply channel closed, failing {} pending requests", table.pending_count());
            table.close();
        })
    }
}

/// A registered, not yet answered request.
pub struct PendingCall {
    uid: u64,
    token: u64,
    table: Arc<CorrelationTable>,
    rx: Option<oneshot::Receiver<Value>>,
}

impl PendingCall {
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Wait for the reply, at most `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Value> {
        let rx = self.rx.take().ok_or_else(|| SwarmError::Transport {
            message: "reply already consumed".to_string(),
        })?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SwarmError::Transport {
                message: "reply channel closed before a response arrived".to_string(),
            }),
            Err(_) => Err(SwarmError::NoDataReceived { timeout }),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.table.remove(self.uid, self.token);
    }
}

/// Sends tagged requests over a transport and waits for the matching reply.
pub struct Requester {
    transport: Arc<dyn Transport>,
    table: Arc<CorrelationTable>,
    timeout: Duration,
}

impl Requester {
    pub fn new(transport: Arc<dyn Transport>, table: Arc<CorrelationTable>, timeout: Duration) -> Self {
        Self {
            transport,
            table,
            timeout,
        }
    }

    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    pub fn client_id(&self) -> &str {
        self.transport.client_id()
    }

    /// Issue `request` under correlation id `uid` and wait for its reply.
    pub async fn request(&self, uid: u64, request: Request) -> Result<Value> {
        let pending = self.table.register(uid)?;

        let body = ProduceTestdata {
            uid,
            cid: self.transport.client_id().to_string(),
            request,
        };
        self.transport
            .send(Message::new(PRODUCE_TESTDATA, serde_json::to_value(&body)?))
            .await?;

        pending.wait(self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_delivers_to_waiter() {
        let table = Arc::new(CorrelationTable::new());
        let pending = table.register(1).unwrap();

        assert!(table.resolve(1, json!({"data": 7})));

        let response = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response, json!({"data": 7}));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let table = Arc::new(CorrelationTable::new());
        let _first = table.register(5).unwrap();

        match table.register(5) {
            Err(SwarmError::DuplicateCorrelation { uid }) => assert_eq!(uid, 5),
            other => panic!("Expected DuplicateCorrelation, got: {:?}", other.map(|p| p.uid())),
        }
        assert_eq!(table.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let table = Arc::new(CorrelationTable::new());
        let pending = table.register(9).unwrap();

        let result = pending.wait(Duration::from_secs(10)).await;
        assert!(matches!(result, Err(SwarmError::NoDataReceived { .. })));
        assert_eq!(table.pending_count(), 0);

        // late reply is dropped
        assert!(!table.resolve(9, json!(null)));
    }

    #[tokio::test]
    async fn test_dropping_pending_call_releases_id() {
        let table = Arc::new(CorrelationTable::new());
        drop(table.register(3).unwrap());
        assert!(table.register(3).is_ok());
    }

    #[test]
    fn test_uids_are_unique() {
        let table = CorrelationTable::new();
        let a = table.next_uid();
        let b = table.next_uid();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_handle_message_ignores_other_topics() {
        let table = Arc::new(CorrelationTable::new());
        let _pending = table.register(1).unwrap();

        let message = Message::new("worker_report", json!({"uid": 1, "response": {}}));
        assert!(!table.handle_message(message));

        let message = Message::new(CONSUME_TESTDATA, json!({"uid": 1, "response": {"ok": true}}));
        assert!(table.handle_message(message));
    }

    #[tokio::test]
    async fn test_closed_table_rejects_new_requests() {
        let table = Arc::new(CorrelationTable::new());
        let pending = table.register(1).unwrap();

        table.close();
        assert!(table.is_closed());
        assert!(matches!(
            pending.wait(Duration::from_secs(1)).await,
            Err(SwarmError::Transport { .. })
        ));
        assert!(matches!(table.register(2), Err(SwarmError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_reply_pump_closes_table_when_inbox_ends() {
        let table = Arc::new(CorrelationTable::new());
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let pump = table.spawn_reply_pump(rx);

        drop(tx);
        pump.await.unwrap();
        assert!(table.is_closed());
    }
}
