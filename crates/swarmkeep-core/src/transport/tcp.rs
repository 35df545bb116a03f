//! TCP transport.
//!
//! The coordinator listens for worker connections; each worker opens one
//! connection, announces its client id with a `client_ready` message and
//! then exchanges length-prefixed JSON messages (see [`super::frame`]).
//!
//! # Thread Safety
//!
//! Every accepted connection is served by its own reader task and writer
//! task. Replies are routed to the writer task by client id through a
//! bounded `mpsc` channel. Sends never wait: when a worker's queue is full
//! the reply is dropped, so a slow worker never blocks the coordinator loop.
//! The worker side serializes writes with a tokio `Mutex` around the
//! write half, allowing concurrent use from many virtual users.

use super::frame::{read_message, write_message};
use super::{Inbox, Message, Transport, CLIENT_READY};
use crate::config::CommunicationConfig;
use crate::{Result, SwarmError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Client id used by the TCP coordinator endpoint.
pub const TCP_COORDINATOR_ID: &str = "coordinator";

type Clients = Arc<RwLock<HashMap<String, mpsc::Sender<Message>>>>;

/// Handle to a running coordinator listener. Dropping shuts it down.
pub struct TcpCoordinatorHandle {
    addr: SocketAddr,
    clients: Clients,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl TcpCoordinatorHandle {
    /// Get the address the coordinator is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of workers that completed the handshake.
    pub async fn connected_clients(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Shut down the listener gracefully.
    ///
    /// Stops accepting new connections and signals all active connection
    /// handlers to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for TcpCoordinatorHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpCoordinatorHandle {
    fn client_id(&self) -> &str {
        TCP_COORDINATOR_ID
    }

    async fn send(&self, message: Message) -> Result<()> {
        let client_id = message.node_id.clone().ok_or_else(|| SwarmError::Transport {
            message: format!("message \"{}\" has no destination", message.topic),
        })?;

        let tx = self
            .clients
            .read()
            .await
            .get(&client_id)
            .cloned()
            .ok_or_else(|| SwarmError::UnknownClient {
                client_id: client_id.clone(),
            })?;

        // Never wait on a slow worker; its request times out on its side instead.
        tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(message) => {
                warn!(
                    "outbound queue for worker {} is full, dropping \"{}\"",
                    client_id, message.topic
                );
                SwarmError::Transport {
                    message: format!("outbound queue for worker {} is full", client_id),
                }
            }
            mpsc::error::TrySendError::Closed(_) => SwarmError::Transport {
                message: format!("connection to worker {} closed", client_id),
            },
        })
    }
}

/// Coordinator-side TCP listener.
pub struct TcpCoordinator;

impl TcpCoordinator {
    /// Start listening on `addr` (use port 0 for an OS-assigned port).
    ///
    /// Returns the handle, which doubles as the coordinator's [`Transport`],
    /// and the inbox receiving every worker message.
    pub async fn start(addr: SocketAddr) -> Result<(TcpCoordinatorHandle, Inbox)> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("coordinator listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let (inbox_tx, inbox_rx) = mpsc::channel(CommunicationConfig::INBOX_CAPACITY);
        let clients: Clients = Arc::new(RwLock::new(HashMap::new()));
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            clients.clone(),
            inbox_tx,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok((
            TcpCoordinatorHandle {
                addr,
                clients,
                shutdown_tx: Some(shutdown_tx),
                conn_shutdown_tx,
                task_handle: Some(task_handle),
            },
            inbox_rx,
        ))
    }

    async fn accept_loop(
        listener: TcpListener,
        clients: Clients,
        inbox_tx: mpsc::Sender<Message>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("coordinator listener shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= CommunicationConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting worker connection from {}: at max capacity ({})",
                                    peer_addr,
                                    CommunicationConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let clients = clients.clone();
                            let inbox_tx = inbox_tx.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("worker connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, clients, inbox_tx, &mut conn_shutdown).await {
                                    debug!("worker connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        clients: Clients,
        inbox_tx: mpsc::Sender<Message>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        let hello = match read_message(&mut reader).await? {
            Some(message) if message.topic == CLIENT_READY => message,
            Some(message) => {
                return Err(SwarmError::Validation {
                    field: "handshake".to_string(),
                    message: format!("expected {}, got {}", CLIENT_READY, message.topic),
                });
            }
            None => return Ok(()),
        };
        let client_id = hello.node_id.ok_or_else(|| SwarmError::Validation {
            field: "handshake".to_string(),
            message: "client_ready without client id".to_string(),
        })?;

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(CommunicationConfig::INBOX_CAPACITY);
        clients.write().await.insert(client_id.clone(), out_tx);
        info!("worker {} connected", client_id);

        let writer_task = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = write_message(&mut writer, &message).await {
                    debug!("write to worker failed: {}", e);
                    break;
                }
            }
        });

        let result = loop {
            let message = tokio::select! {
                result = read_message(&mut reader) => {
                    match result {
                        Ok(Some(message)) => message,
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    break Ok(());
                }
            };

            let message = Message {
                node_id: Some(client_id.clone()),
                ..message
            };
            if inbox_tx.send(message).await.is_err() {
                break Err(SwarmError::Transport {
                    message: "coordinator inbox closed".to_string(),
                });
            }
        };

        clients.write().await.remove(&client_id);
        writer_task.abort();
        info!("worker {} disconnected", client_id);

        result
    }
}

/// Worker-side TCP connection to the coordinator.
pub struct TcpWorker {
    client_id: String,
    addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for TcpWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpWorker")
            .field("client_id", &self.client_id)
            .field("addr", &self.addr)
            .finish()
    }
}

impl TcpWorker {
    /// Connect to the coordinator and announce a fresh client id.
    pub async fn connect(addr: SocketAddr) -> Result<(Self, Inbox)> {
        let lost = || SwarmError::ConnectionLost {
            addr: addr.to_string(),
        };

        let stream = tokio::time::timeout(
            CommunicationConfig::CONNECT_TIMEOUT,
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| lost())?
        .map_err(|_| lost())?;

        let client_id = uuid::Uuid::new_v4().to_string();
        let (mut reader, mut writer) = stream.into_split();

        let hello = Message {
            topic: CLIENT_READY.to_string(),
            node_id: Some(client_id.clone()),
            data: serde_json::Value::Null,
        };
        write_message(&mut writer, &hello).await.map_err(|_| lost())?;

        debug!("worker {} connected to {}", client_id, addr);

        let (inbox_tx, inbox_rx) = mpsc::channel(CommunicationConfig::INBOX_CAPACITY);
        let reader_task = tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(Some(message)) => {
                        if inbox_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("coordinator closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("failed to read from coordinator: {}", e);
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                client_id,
                addr,
                writer: Mutex::new(writer),
                reader_task,
            },
            inbox_rx,
        ))
    }

    /// Get the address of the coordinator.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for TcpWorker {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[async_trait::async_trait]
impl Transport for TcpWorker {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn send(&self, mut message: Message) -> Result<()> {
        message.node_id = Some(self.client_id.clone());

        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, &message)
            .await
            .map_err(|_| SwarmError::ConnectionLost {
                addr: self.addr.to_string(),
            })
    }
}
