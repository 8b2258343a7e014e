use std::time::Duration;

use archivist_core::{ConsensusNodeInfo, PublicKey};
use archivist_p2p::PushFrame;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};

use crate::SenderError;

/// Longest line accepted on a push socket.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Identifies one push connection. A node that is dropped and subscribed to
/// again gets a new id, so events from its old socket can be told apart.
pub type ConnectionId = u64;

/// What a push connection reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Data { from: PublicKey, body: Value },
    Disconnected { from: PublicKey, connection: ConnectionId },
}

/// Outbound half of an open push connection.
#[derive(Debug, Clone)]
pub struct PushHandle {
    public_key: PublicKey,
    connection: ConnectionId,
    outbound: mpsc::UnboundedSender<PushFrame>,
}

impl PushHandle {
    pub fn new(
        public_key: PublicKey,
        connection: ConnectionId,
        outbound: mpsc::UnboundedSender<PushFrame>,
    ) -> Self {
        PushHandle {
            public_key,
            connection,
            outbound,
        }
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Queues `frame`. Returns false once the connection is gone.
    pub fn send(&self, frame: PushFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

/// Opens push connections to consensus nodes.
#[async_trait]
pub trait PushConnector: Send + Sync {
    /// Connects to `node` and announces `archiver_key`. Incoming frames and
    /// the eventual disconnect, tagged with `connection`, are reported on
    /// `events`.
    async fn connect(
        &self,
        node: &ConsensusNodeInfo,
        archiver_key: &str,
        connection: ConnectionId,
        events: mpsc::UnboundedSender<PushEvent>,
    ) -> Result<PushHandle, SenderError>;
}

/// Newline-delimited JSON frames over TCP.
pub struct TcpPushConnector {
    connect_timeout: Duration,
}

impl TcpPushConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        TcpPushConnector { connect_timeout }
    }
}

#[async_trait]
impl PushConnector for TcpPushConnector {
    async fn connect(
        &self,
        node: &ConsensusNodeInfo,
        archiver_key: &str,
        connection: ConnectionId,
        events: mpsc::UnboundedSender<PushEvent>,
    ) -> Result<PushHandle, SenderError> {
        let addr = node.ip_port();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SenderError::Connect {
                addr: addr.clone(),
                reason: "timed out".into(),
            })?
            .map_err(|e| SenderError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
        let hello = PushFrame::ArchiverPublicKey(archiver_key.to_string()).encode()?;
        framed.send(hello).await.map_err(|e| SenderError::Connect {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;
        info!("push socket #{} open to {} ({})", connection, addr, node.public_key);

        let (tx, mut rx) = mpsc::unbounded_channel::<PushFrame>();
        let from = node.public_key.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = rx.recv() => {
                        let Some(frame) = outgoing else { break };
                        let line = match frame.encode() {
                            Ok(line) => line,
                            Err(e) => {
                                warn!("push socket {}: cannot encode frame: {}", addr, e);
                                continue;
                            }
                        };
                        if let Err(e) = framed.send(line).await {
                            warn!("push socket {}: send failed: {}", addr, e);
                            break;
                        }
                    }
                    incoming = framed.next() => match incoming {
                        Some(Ok(line)) => match PushFrame::decode(&line) {
                            Ok(PushFrame::Data(body)) => {
                                let _ = events.send(PushEvent::Data { from: from.clone(), body });
                            }
                            Ok(other) => debug!("push socket {}: ignoring {:?}", addr, other),
                            Err(e) => warn!("push socket {}: bad frame: {}", addr, e),
                        },
                        Some(Err(e)) => {
                            warn!("push socket {}: read failed: {}", addr, e);
                            break;
                        }
                        None => break,
                    },
                }
            }
            debug!("push socket #{} to {} closed", connection, addr);
            let _ = events.send(PushEvent::Disconnected { from, connection });
        });

        Ok(PushHandle::new(node.public_key.clone(), connection, tx))
    }
}
