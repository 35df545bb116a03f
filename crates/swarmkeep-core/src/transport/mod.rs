//! Message transport between the coordinator and its workers.
//!
//! A transport moves named, addressed [`Message`]s. Inbound messages are
//! handed out through an [`Inbox`] created together with the transport;
//! outbound messages go through [`Transport::send`].
//!
//! # Addressing
//!
//! - Worker → coordinator: `node_id` is the sending worker's client id
//!   (filled in by the transport).
//! - Coordinator → worker: `node_id` names the destination worker.
//!
//! No ordering is guaranteed across senders.
//!
//! # Implementations
//!
//! - [`local`]: in-process hub over `tokio::sync::mpsc`
//! - [`tcp`]: length-prefixed JSON frames over TCP

pub mod frame;
pub mod local;
pub mod tcp;

pub use local::{LocalCoordinator, LocalHub, LocalWorker};
pub use tcp::{TcpCoordinator, TcpCoordinatorHandle, TcpWorker};

use crate::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Handshake topic a TCP worker sends first to announce its client id.
pub const CLIENT_READY: &str = "client_ready";

/// A named, addressed transport message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Message {
    /// Message for the coordinator; the transport stamps the sender id.
    pub fn new(topic: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            node_id: None,
            data,
        }
    }

    /// Message addressed to a specific worker.
    pub fn to_client(
        topic: impl Into<String>,
        data: serde_json::Value,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            node_id: Some(client_id.into()),
            data,
        }
    }
}

/// Receiving side of a transport endpoint.
pub type Inbox = mpsc::Receiver<Message>;

/// Sending side of a transport endpoint.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity of this endpoint, used by the coordinator to route replies.
    fn client_id(&self) -> &str;

    /// Send a message. Resolves once the message is handed to the channel,
    /// not when it is delivered.
    async fn send(&self, message: Message) -> Result<()>;
}
