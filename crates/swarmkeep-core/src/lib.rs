//! Swarmkeep - testdata distribution and shared keystore for distributed load tests.
//!
//! A single coordinator hands out per-iteration test variables to the
//! virtual users running on many worker processes, and owns a small
//! key/value store those users share. Workers talk to the coordinator over
//! a [`Transport`]; every request carries a correlation id so many users can
//! share one connection.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use swarmkeep::{Coordinator, LocalHub, Persister, TestdataDefinition, Worker};
//!
//! #[tokio::main]
//! async fn main() -> swarmkeep::Result<()> {
//!     let definition = TestdataDefinition::from_file("testdata.json".as_ref())?;
//!     let (hub, inbox) = LocalHub::new();
//!
//!     let coordinator = Arc::new(Coordinator::new(
//!         Arc::new(hub.coordinator()),
//!         definition.into_producer(None)?,
//!         Persister::disabled(),
//!     ));
//!     tokio::spawn(coordinator.clone().serve(inbox));
//!
//!     let (transport, replies) = hub.connect_worker().await;
//!     let worker = Worker::with_defaults(transport, replies);
//!     let user = worker.consumer("Checkout");
//!
//!     while let Some(payload) = user.testdata().await? {
//!         let orders = user.keystore_inc("orders", 1).await?;
//!         println!("{:?} order #{}", payload.variables, orders);
//!     }
//!
//!     coordinator.on_test_stop().await
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod correlation;
pub mod error;
pub mod events;
pub mod keystore;
pub mod protocol;
pub mod testdata;
pub mod transport;

pub use config::{CommunicationConfig, ConsumerOptions, PersistConfig, PersistSettings};
pub use consumer::{TestdataConsumer, Worker};
pub use coordinator::{Coordinator, CoordinatorStatus};
pub use correlation::{CorrelationTable, PendingCall, Requester};
pub use error::{Result, SwarmError};
pub use events::{EventRole, EventSink, MemoryEventSink, RequestEvent, TracingEventSink};
pub use keystore::Keystore;
pub use protocol::{
    KeystoreAction, KeystoreResponse, MessageKind, Request, TestdataAction, TestdataPayload,
    TestdataResponse,
};
pub use testdata::{
    Persister, ScenarioDefinition, Snapshot, TestdataDefinition, TestdataProducer, VariableSource,
    VariableTable,
};
pub use transport::{
    Inbox, LocalHub, Message, TcpCoordinator, TcpCoordinatorHandle, TcpWorker, Transport,
};
