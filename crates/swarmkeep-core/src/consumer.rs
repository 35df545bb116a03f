//! Worker-side API used by scenarios.
//!
//! A [`Worker`] owns the connection-wide correlation table and the task that
//! feeds replies into it. Every virtual user gets its own
//! [`TestdataConsumer`] with a stable correlation id, so concurrent users
//! never see each other's replies.

use crate::config::ConsumerOptions;
use crate::correlation::{CorrelationTable, Requester};
use crate::events::{EventRole, EventSink, RequestEvent, TracingEventSink};
use crate::protocol::{
    KeystoreAction, KeystoreResponse, MessageKind, Request, TestdataAction, TestdataPayload,
    TestdataResponse,
};
use crate::transport::{Inbox, Transport};
use crate::{Result, SwarmError};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// One worker process's connection to the coordinator.
pub struct Worker {
    requester: Arc<Requester>,
    events: Arc<dyn EventSink>,
    options: ConsumerOptions,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("client_id", &self.requester.client_id())
            .field("options", &self.options)
            .finish()
    }
}

impl Worker {
    /// Wrap a connected transport endpoint and start reading replies.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        transport: impl Transport,
        inbox: Inbox,
        options: ConsumerOptions,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let table = Arc::new(CorrelationTable::new());
        let pump = table.spawn_reply_pump(inbox);
        let requester = Arc::new(Requester::new(
            Arc::new(transport),
            table,
            options.request_timeout,
        ));

        Self {
            requester,
            events,
            options,
            pump,
        }
    }

    /// Default options, events logged through `tracing`.
    pub fn with_defaults(transport: impl Transport, inbox: Inbox) -> Self {
        Self::new(
            transport,
            inbox,
            ConsumerOptions::default(),
            Arc::new(TracingEventSink),
        )
    }

    pub fn client_id(&self) -> &str {
        self.requester.client_id()
    }

    /// Requests currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.requester.table().pending_count()
    }

    /// Create a consumer for one virtual user running scenario `identifier`.
    pub fn consumer(&self, identifier: impl Into<String>) -> TestdataConsumer {
        let consumer = TestdataConsumer {
            identifier: identifier.into(),
            uid: self.requester.table().next_uid(),
            requester: Arc::clone(&self.requester),
            events: Arc::clone(&self.events),
            poll_interval: self.options.poll_interval,
        };
        debug!("{}: consumer uid={}", consumer.identifier, consumer.uid);
        consumer
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Per-user handle for testdata and keystore requests.
///
/// Calls on one consumer are expected to be sequential; issuing a second
/// call while one is pending fails with
/// [`SwarmError::DuplicateCorrelation`].
pub struct TestdataConsumer {
    identifier: String,
    uid: u64,
    requester: Arc<Requester>,
    events: Arc<dyn EventSink>,
    poll_interval: std::time::Duration,
}

impl std::fmt::Debug for TestdataConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestdataConsumer")
            .field("identifier", &self.identifier)
            .field("uid", &self.uid)
            .finish()
    }
}

impl TestdataConsumer {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Fetch the next iteration's variables.
    ///
    /// Returns `None` when the coordinator answers `stop`.
    pub async fn testdata(&self) -> Result<Option<TestdataPayload>> {
        let started = Instant::now();
        let result = self.fetch_testdata().await;

        self.record(
            MessageKind::Testdata,
            None,
            None,
            started,
            result.as_ref().err(),
        );
        result
    }

    async fn fetch_testdata(&self) -> Result<Option<TestdataPayload>> {
        let value = self
            .requester
            .request(self.uid, Request::testdata(self.identifier.as_str()))
            .await?;

        let response: TestdataResponse =
            serde_json::from_value(value).map_err(|e| SwarmError::MalformedResponse {
                message: format!("testdata response: {}", e),
            })?;

        match response.testdata_action() {
            Some(TestdataAction::Consume) => Ok(Some(response.data.unwrap_or_default())),
            Some(TestdataAction::Stop) => Ok(None),
            None => Err(SwarmError::UnknownTestdataAction(response.action)),
        }
    }

    /// Value stored under `key`, `None` if absent.
    pub async fn keystore_get(&self, key: &str) -> Result<Option<Value>> {
        let value = self.keystore(KeystoreAction::Get, key, None).await?;
        Ok((!value.is_null()).then_some(value))
    }

    pub async fn keystore_set(&self, key: &str, value: Value) -> Result<()> {
        self.keystore(KeystoreAction::Set, key, Some(value)).await?;
        Ok(())
    }

    /// Increment the integer under `key` by `step` and return the new value.
    pub async fn keystore_inc(&self, key: &str, step: i64) -> Result<i64> {
        let value = self
            .keystore(KeystoreAction::Inc, key, Some(Value::from(step)))
            .await?;

        value.as_i64().ok_or_else(|| SwarmError::MalformedResponse {
            message: format!("inc on \"{}\" returned {}", key, value),
        })
    }

    /// Append `value` to the list under `key`.
    pub async fn keystore_push(&self, key: &str, value: Value) -> Result<()> {
        self.keystore(KeystoreAction::Push, key, Some(value)).await?;
        Ok(())
    }

    /// Remove and return the head of the list under `key`.
    ///
    /// Polls every poll interval while the list is empty or absent. With
    /// `wait` set, gives up with [`SwarmError::PopTimeout`] once that much
    /// time has passed; without it, polls until a value shows up.
    ///
    /// Only the first attempt surfaces retryable errors; later ones count as
    /// an empty poll.
    pub async fn keystore_pop(&self, key: &str, wait: Option<std::time::Duration>) -> Result<Value> {
        let started = Instant::now();
        let mut first = true;

        loop {
            let value = match self.keystore(KeystoreAction::Pop, key, None).await {
                Ok(value) => value,
                Err(e) if !first && e.is_retryable() => {
                    debug!("retrying pop on \"{}\" after: {}", key, e);
                    Value::Null
                }
                Err(e) => return Err(e),
            };
            first = false;

            if !value.is_null() {
                return Ok(value);
            }

            if let Some(wait) = wait {
                if started.elapsed() >= wait {
                    return Err(SwarmError::PopTimeout {
                        key: key.to_string(),
                        wait,
                    });
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn keystore_del(&self, key: &str) -> Result<()> {
        self.keystore(KeystoreAction::Del, key, None).await?;
        Ok(())
    }

    async fn keystore(&self, action: KeystoreAction, key: &str, data: Option<Value>) -> Result<Value> {
        let started = Instant::now();
        let request = Request::keystore(self.identifier.as_str(), action, key, data);
        let result = self.keystore_request(action, key, request).await;

        self.record(
            MessageKind::Keystore,
            Some(action.as_str()),
            Some(key),
            started,
            result.as_ref().err(),
        );
        result
    }

    async fn keystore_request(
        &self,
        action: KeystoreAction,
        key: &str,
        request: Request,
    ) -> Result<Value> {
        let value = self.requester.request(self.uid, request).await?;

        let response: KeystoreResponse =
            serde_json::from_value(value).map_err(|e| SwarmError::MalformedResponse {
                message: format!("keystore response: {}", e),
            })?;

        match response.error {
            Some(message) => Err(SwarmError::Keystore {
                action: action.as_str().to_string(),
                key: key.to_string(),
                message,
            }),
            None => Ok(response.data),
        }
    }

    fn record(
        &self,
        kind: MessageKind,
        action: Option<&str>,
        key: Option<&str>,
        started: Instant,
        error: Option<&SwarmError>,
    ) {
        self.events.record(RequestEvent {
            kind: Some(kind),
            role: EventRole::Consumer,
            identifier: self.identifier.clone(),
            action: action.map(String::from),
            key: key.map(String::from),
            response_time: started.elapsed(),
            error: error.map(|e| e.to_string()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::protocol::{ConsumeTestdata, ProduceTestdata, CONSUME_TESTDATA};
    use crate::transport::{LocalHub, Message};
    use serde_json::json;
    use std::time::Duration;

    /// Answers every request with `reply(request)`.
    async fn spawn_responder<F>(hub: &LocalHub, mut inbox: Inbox, reply: F)
    where
        F: Fn(&Request) -> Value + Send + 'static,
    {
        let coordinator = hub.coordinator();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                let body: ProduceTestdata = serde_json::from_value(message.data).unwrap();
                let response = ConsumeTestdata {
                    uid: body.uid,
                    response: reply(&body.request),
                };
                coordinator
                    .send(Message::to_client(
                        CONSUME_TESTDATA,
                        serde_json::to_value(response).unwrap(),
                        body.cid,
                    ))
                    .await
                    .unwrap();
            }
        });
    }

    async fn worker_with(
        options: ConsumerOptions,
        reply: impl Fn(&Request) -> Value + Send + 'static,
    ) -> (Worker, Arc<MemoryEventSink>) {
        let (hub, coordinator_inbox) = LocalHub::new();
        spawn_responder(&hub, coordinator_inbox, reply).await;
        let (transport, inbox) = hub.connect_worker().await;
        let events = Arc::new(MemoryEventSink::new());
        let worker = Worker::new(transport, inbox, options, events.clone());
        (worker, events)
    }

    #[tokio::test]
    async fn test_testdata_consume_and_stop() {
        let (worker, events) = worker_with(ConsumerOptions::default(), |request| {
            if request.identifier == "Done" {
                json!({"action": "stop"})
            } else {
                json!({"action": "consume", "data": {"variables": {"id": 1}, "alias": 1}})
            }
        })
        .await;

        let payload = worker.consumer("Run").testdata().await.unwrap().unwrap();
        assert_eq!(payload.variables["id"], json!(1));
        assert_eq!(payload.aliases["alias"], json!(1));

        assert!(worker.consumer("Done").testdata().await.unwrap().is_none());
        assert_eq!(events.events().len(), 2);
        assert!(events.failures().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_testdata_action_is_error() {
        let (worker, events) =
            worker_with(ConsumerOptions::default(), |_| json!({"action": "pause"})).await;

        let result = worker.consumer("Run").testdata().await;
        assert!(matches!(result, Err(SwarmError::UnknownTestdataAction(ref a)) if a == "pause"));
        assert_eq!(events.failures().len(), 1);
    }

    #[tokio::test]
    async fn test_keystore_error_is_surfaced() {
        let (worker, events) = worker_with(ConsumerOptions::default(), |request| {
            json!({"action": request.action, "key": request.key, "data": null, "error": "boom"})
        })
        .await;

        let result = worker.consumer("Run").keystore_inc("counter", 1).await;
        match result {
            Err(SwarmError::Keystore { action, key, message }) => {
                assert_eq!(action, "inc");
                assert_eq!(key, "counter");
                assert_eq!(message, "boom");
            }
            other => panic!("expected keystore error, got {:?}", other),
        }

        let failures = events.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name(), "Run counter");
    }

    #[tokio::test]
    async fn test_keystore_get_maps_null_to_none() {
        let (worker, _) = worker_with(ConsumerOptions::default(), |request| {
            let data = if request.key.as_deref() == Some("present") {
                json!("v")
            } else {
                Value::Null
            };
            json!({"action": "get", "key": request.key, "data": data, "error": null})
        })
        .await;

        let consumer = worker.consumer("Run");
        assert_eq!(consumer.keystore_get("present").await.unwrap(), Some(json!("v")));
        assert_eq!(consumer.keystore_get("absent").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_times_out_after_wait() {
        let options = ConsumerOptions {
            request_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        };
        let (worker, _) = worker_with(options, |_| {
            json!({"action": "pop", "key": "q", "data": null, "error": null})
        })
        .await;

        let result = worker
            .consumer("Run")
            .keystore_pop("q", Some(Duration::from_millis(350)))
            .await;
        assert!(matches!(result, Err(SwarmError::PopTimeout { ref key, .. }) if key == "q"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_without_reply() {
        let (hub, _coordinator_inbox) = LocalHub::new();
        let (transport, inbox) = hub.connect_worker().await;
        let worker = Worker::new(
            transport,
            inbox,
            ConsumerOptions::default(),
            Arc::new(MemoryEventSink::new()),
        );

        let result = worker.consumer("Run").testdata().await;
        assert!(matches!(result, Err(SwarmError::NoDataReceived { .. })));
        assert_eq!(worker.pending_count(), 0);
    }

    /// Pop replies: empty, silence, then `"job"`.
    fn spawn_pop_responder(hub: &LocalHub, mut inbox: Inbox, skip_first: bool) {
        let coordinator = hub.coordinator();
        tokio::spawn(async move {
            let mut calls = 0;
            while let Some(message) = inbox.recv().await {
                calls += 1;
                let data = match (calls, skip_first) {
                    (1, true) => continue,
                    (1, false) => Value::Null,
                    (2, _) => continue,
                    _ => json!("job"),
                };
                let body: ProduceTestdata = serde_json::from_value(message.data).unwrap();
                let response = ConsumeTestdata {
                    uid: body.uid,
                    response: json!({"action": "pop", "key": "q", "data": data, "error": null}),
                };
                coordinator
                    .send(Message::to_client(
                        CONSUME_TESTDATA,
                        serde_json::to_value(response).unwrap(),
                        body.cid,
                    ))
                    .await
                    .unwrap();
            }
        });
    }

    async fn pop_worker(skip_first: bool) -> Worker {
        let (hub, coordinator_inbox) = LocalHub::new();
        spawn_pop_responder(&hub, coordinator_inbox, skip_first);
        let (transport, inbox) = hub.connect_worker().await;
        Worker::new(
            transport,
            inbox,
            ConsumerOptions {
                request_timeout: Duration::from_secs(1),
                poll_interval: Duration::from_millis(100),
            },
            Arc::new(MemoryEventSink::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_keeps_polling_after_missed_reply() {
        let worker = pop_worker(false).await;

        let value = worker.consumer("Run").keystore_pop("q", None).await.unwrap();
        assert_eq!(value, json!("job"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_first_missed_reply_is_error() {
        let worker = pop_worker(true).await;

        let result = worker.consumer("Run").keystore_pop("q", None).await;
        assert!(matches!(result, Err(SwarmError::NoDataReceived { .. })));
    }

    #[tokio::test]
    async fn test_consumers_get_distinct_uids() {
        let (worker, _) = worker_with(ConsumerOptions::default(), |_| json!({})).await;
        let a = worker.consumer("Run");
        let b = worker.consumer("Run");
        assert_ne!(a.uid(), b.uid());
    }
}
