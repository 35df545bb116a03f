//! Coordinator-side request dispatch and run lifecycle.
//!
//! All coordinator state (keystore, iteration counters, persistence flag)
//! lives behind a single lock, held for the whole handle-and-reply cycle of
//! each request. Every well-formed `produce_testdata` message gets exactly
//! one `consume_testdata` reply, addressed to the sender's client id, even
//! when handling failed.

use crate::events::{EventRole, EventSink, RequestEvent, TracingEventSink};
use crate::keystore::Keystore;
use crate::protocol::{ConsumeTestdata, MessageKind, Request, CONSUME_TESTDATA, PRODUCE_TESTDATA};
use crate::testdata::{Persister, TestdataProducer};
use crate::transport::{Inbox, Message, Transport};
use crate::{Result, SwarmError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// `produce_testdata` body with the request left unparsed.
#[derive(Deserialize)]
struct ProduceEnvelope {
    uid: u64,
    cid: String,
    #[serde(default)]
    request: Value,
}

struct CoordinatorState {
    keystore: Keystore,
    producer: TestdataProducer,
    persister: Persister,
    requests_handled: u64,
}

/// Point-in-time view of coordinator state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatus {
    pub keystore_keys: usize,
    pub iterations: BTreeMap<String, u64>,
    pub requests_handled: u64,
    pub has_persisted: bool,
}

/// Serves keystore and testdata requests from all workers.
pub struct Coordinator {
    state: Mutex<CoordinatorState>,
    transport: Arc<dyn Transport>,
    events: Arc<dyn EventSink>,
}

impl Coordinator {
    pub fn new(transport: Arc<dyn Transport>, producer: TestdataProducer, persister: Persister) -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                keystore: Keystore::new(),
                producer,
                persister,
                requests_handled: 0,
            }),
            transport,
            events: Arc::new(TracingEventSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Handle inbound messages one at a time until the inbox closes.
    pub async fn serve(self: Arc<Self>, mut inbox: Inbox) {
        info!("coordinator serving requests");

        while let Some(message) = inbox.recv().await {
            if message.topic != PRODUCE_TESTDATA {
                debug!("ignoring message \"{}\"", message.topic);
                continue;
            }
            if let Err(e) = self.handle_message(message).await {
                error!("failed to handle request: {}", e);
            }
        }

        info!("coordinator inbox closed");
    }

    /// Handle one `produce_testdata` message and send its reply.
    ///
    /// Only a message without a usable `uid`/`cid` is an error here; any
    /// request behind a valid envelope is answered, malformed or not.
    pub async fn handle_message(&self, message: Message) -> Result<()> {
        let envelope: ProduceEnvelope =
            serde_json::from_value(message.data).map_err(|e| SwarmError::Json {
                message: format!("malformed {} message: {}", PRODUCE_TESTDATA, e),
                source: Some(e),
            })?;

        let mut state = self.state.lock().await;
        let started = Instant::now();
        let request = Request::deserialize(&envelope.request);
        let (response, error) = match &request {
            Ok(request) => Self::dispatch(&mut state, request),
            Err(e) => {
                let message = format!("malformed request: {}", e);
                error!("{}", message);
                (json!({}), Some(message))
            }
        };
        state.requests_handled += 1;

        self.record(
            request.as_ref().ok().and_then(Request::kind),
            &envelope.request,
            started,
            error,
        );

        let reply = ConsumeTestdata {
            uid: envelope.uid,
            response,
        };
        self.transport
            .send(Message::to_client(
                CONSUME_TESTDATA,
                serde_json::to_value(&reply)?,
                envelope.cid,
            ))
            .await
    }

    /// Apply a request to coordinator state. Returns the response body and
    /// the error text, if any.
    fn dispatch(state: &mut CoordinatorState, request: &Request) -> (Value, Option<String>) {
        match request.kind() {
            Some(MessageKind::Keystore) => {
                let response = state.keystore.handle(request);
                let error = response.error.clone();
                (serde_json::to_value(&response).unwrap_or(Value::Null), error)
            }
            Some(MessageKind::Testdata) => {
                let response = state.producer.handle(request);
                (serde_json::to_value(&response).unwrap_or(Value::Null), None)
            }
            None => {
                let message = format!("received unknown message \"{}\"", request.message);
                error!("{}", message);
                (json!({}), Some(message))
            }
        }
    }

    /// Fields are read from the raw request so unparsable ones still name the event.
    fn record(&self, kind: Option<MessageKind>, raw: &Value, started: Instant, error: Option<String>) {
        let field = |name: &str| raw.get(name).and_then(Value::as_str).map(String::from);

        self.events.record(RequestEvent {
            kind,
            role: EventRole::Producer,
            identifier: field("identifier").unwrap_or_default(),
            action: field("action"),
            key: field("key"),
            response_time: started.elapsed(),
            error,
        });
    }

    /// Persist generator state once, then reset iteration counters.
    ///
    /// Counters are reset even if persisting failed.
    pub async fn on_test_stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let result = Self::persist(&mut state);
        state.producer.reset_iterations();
        info!("test stopped, iteration counters reset");
        result
    }

    /// Final shutdown. Persists unless already done for this run.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::persist(&mut state)
    }

    fn persist(state: &mut CoordinatorState) -> Result<()> {
        let snapshot = state.producer.snapshot();
        match state.persister.persist(&snapshot) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("failed to persist variable state: {}", e);
                Err(e)
            }
        }
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let state = self.state.lock().await;
        CoordinatorStatus {
            keystore_keys: state.keystore.len(),
            iterations: state
                .producer
                .iterations()
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            requests_handled: state.requests_handled,
            has_persisted: state.persister.has_persisted(),
        }
    }

    /// Current keystore value for `key`, for inspection.
    pub async fn keystore_value(&self, key: &str) -> Option<Value> {
        self.state.lock().await.keystore.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::protocol::{KeystoreAction, ProduceTestdata};
    use crate::testdata::{ScenarioDefinition, TestdataProducer};
    use crate::transport::LocalHub;
    use std::collections::HashMap;

    fn produce(uid: u64, cid: &str, request: Request) -> Message {
        let mut message = Message::new(
            PRODUCE_TESTDATA,
            serde_json::to_value(ProduceTestdata {
                uid,
                cid: cid.to_string(),
                request,
            })
            .unwrap(),
        );
        message.node_id = Some(cid.to_string());
        message
    }

    async fn setup() -> (Coordinator, Inbox, String, Arc<MemoryEventSink>) {
        let (hub, _coordinator_inbox) = LocalHub::new();
        let (worker, worker_inbox) = hub.connect_worker().await;
        let events = Arc::new(MemoryEventSink::new());
        let producer = TestdataProducer::new(vec![ScenarioDefinition::new("Run", 1)], HashMap::new());
        let coordinator = Coordinator::new(Arc::new(hub.coordinator()), producer, Persister::disabled())
            .with_events(events.clone());
        (coordinator, worker_inbox, worker.client_id().to_string(), events)
    }

    async fn reply(inbox: &mut Inbox) -> ConsumeTestdata {
        let message = inbox.recv().await.unwrap();
        assert_eq!(message.topic, CONSUME_TESTDATA);
        serde_json::from_value(message.data).unwrap()
    }

    #[tokio::test]
    async fn test_keystore_request_gets_reply_with_uid() {
        let (coordinator, mut inbox, cid, events) = setup().await;

        let request = Request::keystore("Run", KeystoreAction::Inc, "n", None);
        coordinator.handle_message(produce(7, &cid, request)).await.unwrap();

        let reply = reply(&mut inbox).await;
        assert_eq!(reply.uid, 7);
        assert_eq!(reply.response["data"], json!(1));
        assert_eq!(reply.response["error"], Value::Null);
        assert_eq!(coordinator.keystore_value("n").await, Some(json!(1)));
        assert_eq!(events.events()[0].role, EventRole::Producer);
    }

    #[tokio::test]
    async fn test_unknown_kind_gets_empty_reply() {
        let (coordinator, mut inbox, cid, events) = setup().await;

        let request = Request {
            message: "metrics".into(),
            identifier: "Run".into(),
            action: None,
            key: None,
            data: None,
        };
        coordinator.handle_message(produce(3, &cid, request)).await.unwrap();

        let reply = reply(&mut inbox).await;
        assert_eq!(reply.uid, 3);
        assert_eq!(reply.response, json!({}));

        let failures = events.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, None);
        assert_eq!(failures[0].identifier, "Run");
    }

    #[tokio::test]
    async fn test_malformed_request_still_gets_reply() {
        let (coordinator, mut inbox, cid, events) = setup().await;

        let mut message = Message::new(
            PRODUCE_TESTDATA,
            json!({"uid": 1, "cid": &cid, "request": {"identifier": "X"}}),
        );
        message.node_id = Some(cid.clone());
        coordinator.handle_message(message).await.unwrap();

        let reply = reply(&mut inbox).await;
        assert_eq!(reply.uid, 1);
        assert_eq!(reply.response, json!({}));
        assert_eq!(coordinator.status().await.requests_handled, 1);

        let failures = events.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].identifier, "X");
        assert!(failures[0].error.as_deref().unwrap().contains("malformed request"));
    }

    #[tokio::test]
    async fn test_keystore_error_still_replies() {
        let (coordinator, mut inbox, cid, events) = setup().await;

        let request = Request::keystore("Run", KeystoreAction::Pop, "q", None);
        coordinator
            .handle_message(produce(1, &cid, Request::keystore("Run", KeystoreAction::Set, "q", Some(json!(1)))))
            .await
            .unwrap();
        coordinator.handle_message(produce(2, &cid, request)).await.unwrap();

        reply(&mut inbox).await;
        let reply = reply(&mut inbox).await;
        assert_eq!(reply.uid, 2);
        assert!(reply.response["error"].as_str().unwrap().contains("not a list"));
        assert_eq!(events.failures().len(), 1);
    }

    #[tokio::test]
    async fn test_testdata_then_reset() {
        let (coordinator, mut inbox, cid, _) = setup().await;

        coordinator.handle_message(produce(1, &cid, Request::testdata("Run"))).await.unwrap();
        coordinator.handle_message(produce(1, &cid, Request::testdata("Run"))).await.unwrap();
        assert_eq!(reply(&mut inbox).await.response["action"], json!("consume"));
        assert_eq!(reply(&mut inbox).await.response["action"], json!("stop"));

        let status = coordinator.status().await;
        assert_eq!(status.iterations.get("Run"), Some(&1));
        assert_eq!(status.requests_handled, 2);

        coordinator.on_test_stop().await.unwrap();
        assert_eq!(coordinator.status().await.iterations.get("Run"), Some(&0));
    }

    #[tokio::test]
    async fn test_malformed_message_is_rejected() {
        let (coordinator, _inbox, _, _) = setup().await;
        let message = Message::new(PRODUCE_TESTDATA, json!({"uid": "x"}));
        assert!(coordinator.handle_message(message).await.is_err());
    }
}
