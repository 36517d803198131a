//! WebSocket signaling relay.
//!
//! A viewer registers and gets a fresh session id; a source registers with
//! that id and is paired with the viewer. Negotiation and calibration
//! messages are then forwarded by `targetId` with `senderId` stamped by the
//! relay. The relay never looks inside descriptions or candidates.

use crate::signaling::protocol::{decode, encode, Role, SignalMessage};
use crate::utils::random_id;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("register first")]
    NotRegistered,
    #[error("already registered")]
    AlreadyRegistered,
    #[error("sources must name a session")]
    MissingSession,
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error("message has no targetId")]
    MissingTarget,
    #[error("{0} is not your peer")]
    UnknownTarget(String),
    #[error("unexpected {0} from a client")]
    Unexpected(String),
    #[error("malformed message")]
    Malformed,
}

struct Client {
    role: Option<Role>,
    session_id: Option<String>,
    outbound: mpsc::UnboundedSender<SignalMessage>,
}

struct SessionEntry {
    viewer: String,
    source: Option<String>,
    created_at: DateTime<Utc>,
}

impl SessionEntry {
    fn peer_of(&self, id: &str) -> Option<&str> {
        if self.viewer == id {
            self.source.as_deref()
        } else if self.source.as_deref() == Some(id) {
            Some(&self.viewer)
        } else {
            None
        }
    }
}

/// Connected clients and their sessions
#[derive(Default)]
pub struct Registry {
    clients: HashMap<String, Client>,
    sessions: HashMap<String, SessionEntry>,
}

impl Registry {
    pub fn connect(&mut self, id: String, outbound: mpsc::UnboundedSender<SignalMessage>) {
        self.clients.insert(
            id,
            Client {
                role: None,
                session_id: None,
                outbound,
            },
        );
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn deliver(&self, id: &str, message: SignalMessage) {
        match self.clients.get(id) {
            Some(client) => {
                if client.outbound.send(message).is_err() {
                    debug!(id, "client writer already gone");
                }
            }
            None => debug!(id, event = message.event_name(), "no such client"),
        }
    }

    /// Handles one text frame from client `id`. Errors are reported back to
    /// that client and never close the connection.
    pub fn on_text(&mut self, id: &str, raw: &str) {
        let result = match decode(raw) {
            Ok(message) => self.on_message(id, message),
            Err(err) => {
                warn!(id, %err, "malformed frame from client");
                Err(RelayError::Malformed)
            }
        };
        if let Err(err) = result {
            debug!(id, %err, "rejecting client message");
            self.deliver(
                id,
                SignalMessage::Error {
                    message: err.to_string(),
                },
            );
        }
    }

    pub fn on_message(&mut self, id: &str, message: SignalMessage) -> Result<(), RelayError> {
        match message {
            SignalMessage::Register { role, session_id } => self.register(id, role, session_id),
            message if message.is_peer_addressed() => self.forward(id, message),
            other => Err(RelayError::Unexpected(other.event_name().to_string())),
        }
    }

    fn register(&mut self, id: &str, role: Role, session_id: Option<String>) -> Result<(), RelayError> {
        let client = self.clients.get(id).ok_or(RelayError::NotRegistered)?;
        if client.role.is_some() {
            return Err(RelayError::AlreadyRegistered);
        }
        match role {
            Role::Viewer => {
                let session_id = random_id();
                self.sessions.insert(
                    session_id.clone(),
                    SessionEntry {
                        viewer: id.to_string(),
                        source: None,
                        created_at: Utc::now(),
                    },
                );
                self.bind(id, role, &session_id);
                info!(%session_id, viewer = id, "session opened");
                self.deliver(
                    id,
                    SignalMessage::SessionCreated {
                        session_id,
                        endpoint_id: id.to_string(),
                        peer_id: None,
                    },
                );
            }
            Role::Source => {
                let session_id = session_id.ok_or(RelayError::MissingSession)?;
                let entry = self
                    .sessions
                    .get_mut(&session_id)
                    .ok_or_else(|| RelayError::UnknownSession(session_id.clone()))?;
                let viewer = entry.viewer.clone();
                let replaced = entry.source.replace(id.to_string());

                // one source per session; the newcomer wins
                if let Some(old) = replaced {
                    info!(%session_id, old = %old, "replacing source");
                    if let Some(old_client) = self.clients.get_mut(&old) {
                        old_client.session_id = None;
                    }
                    self.deliver(&old, SignalMessage::PeerLeft);
                }
                self.bind(id, role, &session_id);
                info!(%session_id, source = id, "source joined");
                self.deliver(
                    id,
                    SignalMessage::SessionCreated {
                        session_id,
                        endpoint_id: id.to_string(),
                        peer_id: Some(viewer.clone()),
                    },
                );
                self.deliver(
                    &viewer,
                    SignalMessage::PeerJoined {
                        peer_id: id.to_string(),
                    },
                );
            }
        }
        Ok(())
    }

    fn bind(&mut self, id: &str, role: Role, session_id: &str) {
        if let Some(client) = self.clients.get_mut(id) {
            client.role = Some(role);
            client.session_id = Some(session_id.to_string());
        }
    }

    fn forward(&mut self, id: &str, message: SignalMessage) -> Result<(), RelayError> {
        let client = self.clients.get(id).ok_or(RelayError::NotRegistered)?;
        let session_id = client.session_id.as_deref().ok_or(RelayError::NotRegistered)?;
        let target = message.target_id().ok_or(RelayError::MissingTarget)?;
        let peer = self
            .sessions
            .get(session_id)
            .and_then(|entry| entry.peer_of(id))
            .filter(|peer| *peer == target)
            .ok_or_else(|| RelayError::UnknownTarget(target.to_string()))?
            .to_string();

        debug!(from = id, to = %peer, event = message.event_name(), "forwarding");
        self.deliver(&peer, message.with_sender(id));
        Ok(())
    }

    /// Connection gone. The peer learns through `peer-left`; a departing
    /// viewer takes its session with it.
    pub fn disconnect(&mut self, id: &str) {
        let Some(client) = self.clients.remove(id) else {
            return;
        };
        let Some(session_id) = client.session_id else {
            return;
        };
        match client.role {
            Some(Role::Viewer) => {
                if let Some(entry) = self.sessions.remove(&session_id) {
                    let age = Utc::now() - entry.created_at;
                    info!(%session_id, age_secs = age.num_seconds(), "session closed");
                    if let Some(source) = entry.source {
                        if let Some(source_client) = self.clients.get_mut(&source) {
                            source_client.session_id = None;
                        }
                        self.deliver(&source, SignalMessage::PeerLeft);
                    }
                }
            }
            Some(Role::Source) => {
                let viewer = match self.sessions.get_mut(&session_id) {
                    Some(entry) if entry.source.as_deref() == Some(id) => {
                        entry.source = None;
                        Some(entry.viewer.clone())
                    }
                    _ => None,
                };
                if let Some(viewer) = viewer {
                    info!(%session_id, source = id, "source left");
                    self.deliver(&viewer, SignalMessage::PeerLeft);
                }
            }
            None => {}
        }
    }
}

pub struct Relay {
    listener: TcpListener,
    registry: Arc<Mutex<Registry>>,
}

impl Relay {
    pub async fn bind(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry: Arc::new(Mutex::new(Registry::default())),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the task is dropped
    pub async fn run(self) -> std::io::Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "relay listening");
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(err) = serve(stream, addr, registry).await {
                    debug!(%addr, %err, "client connection ended with error");
                }
            });
        }
    }
}

async fn serve(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<Mutex<Registry>>,
) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();
    let (outbound, mut queue) = mpsc::unbounded_channel();
    let id = random_id();
    debug!(%addr, id, "client connected");
    registry.lock().await.connect(id.clone(), outbound);

    let result = async {
        loop {
            tokio::select! {
                message = queue.recv() => {
                    let Some(message) = message else { break };
                    write.send(Message::text(encode(&message)?)).await?;
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => registry.lock().await.on_text(&id, text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                },
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    registry.lock().await.disconnect(&id);
    debug!(%addr, id, "client disconnected");
    result
}
