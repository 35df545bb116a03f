//! In-process transport.
//!
//! Connects one coordinator endpoint and any number of worker endpoints
//! living in the same process through bounded `mpsc` channels. Used by the
//! test suites and by embedders that run coordinator and workers together.

use super::{Inbox, Message, Transport};
use crate::config::CommunicationConfig;
use crate::{Result, SwarmError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Client id used by the coordinator endpoint.
pub const LOCAL_COORDINATOR_ID: &str = "coordinator";

type Routes = Arc<RwLock<HashMap<String, mpsc::Sender<Message>>>>;

/// Router shared by all local endpoints.
#[derive(Clone)]
pub struct LocalHub {
    coordinator_tx: mpsc::Sender<Message>,
    workers: Routes,
}

impl LocalHub {
    /// Create a hub and the coordinator's inbox.
    pub fn new() -> (Self, Inbox) {
        let (coordinator_tx, coordinator_rx) = mpsc::channel(CommunicationConfig::INBOX_CAPACITY);
        (
            Self {
                coordinator_tx,
                workers: Arc::new(RwLock::new(HashMap::new())),
            },
            coordinator_rx,
        )
    }

    /// Transport used by the coordinator to reply to workers.
    pub fn coordinator(&self) -> LocalCoordinator {
        LocalCoordinator {
            workers: self.workers.clone(),
        }
    }

    /// Register a new worker endpoint with a fresh client id.
    pub async fn connect_worker(&self) -> (LocalWorker, Inbox) {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(CommunicationConfig::INBOX_CAPACITY);

        self.workers.write().await.insert(client_id.clone(), tx);
        debug!("local worker {} connected", client_id);

        (
            LocalWorker {
                client_id,
                coordinator_tx: self.coordinator_tx.clone(),
            },
            rx,
        )
    }

    /// Remove a worker; later replies addressed to it fail with `UnknownClient`.
    pub async fn disconnect_worker(&self, client_id: &str) {
        self.workers.write().await.remove(client_id);
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }
}

/// Coordinator side of a [`LocalHub`].
#[derive(Clone)]
pub struct LocalCoordinator {
    workers: Routes,
}

#[async_trait::async_trait]
impl Transport for LocalCoordinator {
    fn client_id(&self) -> &str {
        LOCAL_COORDINATOR_ID
    }

    async fn send(&self, message: Message) -> Result<()> {
        let client_id = message.node_id.clone().ok_or_else(|| SwarmError::Transport {
            message: format!("message \"{}\" has no destination", message.topic),
        })?;

        let tx = self
            .workers
            .read()
            .await
            .get(&client_id)
            .cloned()
            .ok_or_else(|| SwarmError::UnknownClient {
                client_id: client_id.clone(),
            })?;

        tx.send(message).await.map_err(|_| SwarmError::Transport {
            message: format!("worker {} inbox closed", client_id),
        })
    }
}

/// Worker side of a [`LocalHub`].
#[derive(Clone)]
pub struct LocalWorker {
    client_id: String,
    coordinator_tx: mpsc::Sender<Message>,
}

#[async_trait::async_trait]
impl Transport for LocalWorker {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn send(&self, mut message: Message) -> Result<()> {
        message.node_id = Some(self.client_id.clone());
        self.coordinator_tx
            .send(message)
            .await
            .map_err(|_| SwarmError::Transport {
                message: "coordinator inbox closed".to_string(),
            })
    }
}
