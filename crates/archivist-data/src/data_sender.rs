// Data sender lifecycle
//
// One authoritative consensus node pushes cycles and state metadata to this
// archiver; optional extra nodes push the same feed as a fallback.
//
// INVARIANTS:
// 1. A sender's timers are cancelled before the sender is forgotten.
// 2. A replacement is never the node it replaces.
// 3. With fewer than two active nodes the current sender is kept.
// 4. Pushes from anyone but a registered sender never re-arm a timer.
// 5. A replacement is subscribed before the sender it replaces is dropped.
// 6. Whenever no authoritative sender exists, the retry timer is armed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use archivist_core::{ConsensusNodeInfo, DataRequest, DataResponse, DataType, PublicKey};
use archivist_crypto::{CryptoError, CryptoFacade};
use archivist_p2p::{NodeRegistry, PushFrame};
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::socket_client::{ConnectionId, PushConnector, PushEvent, PushHandle};
use crate::timers::{TimerFired, TimerKind, TimerRegistry};

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("cannot connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("no active node available to subscribe to")]
    NoCandidates,

    #[error("cannot encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("cannot tag request: {0}")]
    Crypto(#[from] CryptoError),
}

/// Why a push was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushRejected {
    #[error("push addressed to {0}")]
    WrongRecipient(String),

    #[error("push from {0} failed authentication")]
    BadTag(PublicKey),

    #[error("push from {0}, which is not a data sender")]
    UnknownSender(PublicKey),

    #[error("sender {sender} pushed {data_type}, which it was not asked for")]
    UnrequestedType { sender: PublicKey, data_type: String },

    #[error("malformed push: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub contact_padding: Duration,
    /// Cycle length assumed until a record has been seen.
    pub default_cycle_duration: Duration,
    pub replace_timeout: Duration,
    pub subscribe_to_more: bool,
    pub extra_senders: usize,
    /// Wait before trying again when no sender could be subscribed.
    pub retry_interval: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            contact_padding: Duration::from_millis(1000),
            default_cycle_duration: Duration::from_millis(30_000),
            replace_timeout: Duration::from_millis(3_600_000),
            subscribe_to_more: false,
            extra_senders: 1,
            retry_interval: Duration::from_millis(10_000),
        }
    }
}

/// Where the archiver's local data ends; sent with every subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataCursor {
    pub cycle: Option<u64>,
    pub state_metadata: Option<u64>,
}

impl DataCursor {
    fn requests(&self, types: &[DataType]) -> Vec<DataRequest> {
        types
            .iter()
            .map(|&data_type| DataRequest {
                data_type,
                last_data: match data_type {
                    DataType::Cycle => self.cycle,
                    DataType::StateMetadata => self.state_metadata,
                },
            })
            .collect()
    }
}

pub struct DataSender {
    pub node: ConsensusNodeInfo,
    pub types: Vec<DataType>,
    pub authoritative: bool,
    link: PushHandle,
}

/// Result of acting on a fired timer or a dropped connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderChange {
    /// The authoritative sender moved from `old` to `new`.
    Replaced { old: PublicKey, new: PublicKey },
    /// No alternative node exists; `kept` stays authoritative.
    Kept { kept: PublicKey },
    /// An extra sender was dropped.
    Dropped { old: PublicKey },
    /// A retry subscribed `new` as authoritative sender.
    Subscribed { new: PublicKey },
}

pub struct DataSenderManager {
    crypto: Arc<dyn CryptoFacade>,
    connector: Arc<dyn PushConnector>,
    events: mpsc::UnboundedSender<PushEvent>,
    timers: TimerRegistry,
    senders: HashMap<PublicKey, DataSender>,
    next_connection: ConnectionId,
    config: SenderConfig,
}

impl DataSenderManager {
    pub fn new(
        crypto: Arc<dyn CryptoFacade>,
        connector: Arc<dyn PushConnector>,
        events: mpsc::UnboundedSender<PushEvent>,
        timers: mpsc::UnboundedSender<TimerFired>,
        config: SenderConfig,
    ) -> Self {
        DataSenderManager {
            crypto,
            connector,
            events,
            timers: TimerRegistry::new(timers),
            senders: HashMap::new(),
            next_connection: 0,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    pub fn is_sender(&self, public_key: &str) -> bool {
        self.senders.contains_key(public_key)
    }

    pub fn get(&self, public_key: &str) -> Option<&DataSender> {
        self.senders.get(public_key)
    }

    pub fn authoritative(&self) -> Option<&DataSender> {
        self.senders.values().find(|s| s.authoritative)
    }

    pub fn extras(&self) -> usize {
        self.senders.values().filter(|s| !s.authoritative).count()
    }

    pub fn timer_armed(&self, public_key: &str, kind: TimerKind) -> bool {
        self.timers.is_armed(public_key, kind)
    }

    /// `1.5` cycles plus padding, using the default cycle length until the
    /// real one is known.
    pub fn contact_timeout(&self, cycle_duration: Option<Duration>) -> Duration {
        let cycle = cycle_duration.unwrap_or(self.config.default_cycle_duration);
        cycle.mul_f64(1.5) + self.config.contact_padding
    }

    /// Opens the push socket to `node` and sends it our data requests.
    pub async fn init_socket_client(
        &mut self,
        node: &ConsensusNodeInfo,
        authoritative: bool,
        cursor: DataCursor,
    ) -> Result<(), SenderError> {
        self.next_connection += 1;
        let link = self
            .connector
            .connect(
                node,
                self.crypto.public_key(),
                self.next_connection,
                self.events.clone(),
            )
            .await?;
        let types = DataType::ALL.to_vec();
        let request = json!({ "dataRequests": cursor.requests(&types) });
        let tagged = self.crypto.tag(request, &node.public_key)?;
        if !link.send(PushFrame::DataRequest(tagged)) {
            return Err(SenderError::Connect {
                addr: node.ip_port(),
                reason: "connection closed before subscribing".into(),
            });
        }
        self.senders.insert(
            node.public_key.clone(),
            DataSender {
                node: node.clone(),
                types,
                authoritative,
                link,
            },
        );
        info!(
            "subscribed to {} ({}) as {} sender from cycle {:?}",
            node.public_key,
            node.ip_port(),
            if authoritative { "authoritative" } else { "extra" },
            cursor.cycle
        );
        Ok(())
    }

    /// Subscribes to `node` and arms its timers.
    pub async fn add_data_sender(
        &mut self,
        node: &ConsensusNodeInfo,
        authoritative: bool,
        cursor: DataCursor,
        cycle_duration: Option<Duration>,
    ) -> Result<(), SenderError> {
        self.init_socket_client(node, authoritative, cursor).await?;
        self.create_contact_timeout(&node.public_key, cycle_duration);
        if authoritative {
            self.create_replace_timeout(&node.public_key);
        }
        Ok(())
    }

    pub fn create_contact_timeout(&mut self, public_key: &str, cycle_duration: Option<Duration>) {
        let after = self.contact_timeout(cycle_duration);
        self.timers.arm(public_key, TimerKind::Contact, after);
    }

    pub fn create_replace_timeout(&mut self, public_key: &str) {
        self.timers
            .arm(public_key, TimerKind::Replace, self.config.replace_timeout);
    }

    fn schedule_retry(&mut self) {
        let own = self.crypto.public_key().to_string();
        if !self.timers.is_armed(&own, TimerKind::Retry) {
            self.timers.arm(&own, TimerKind::Retry, self.config.retry_interval);
        }
    }

    pub fn retry_armed(&self) -> bool {
        self.timers.is_armed(self.crypto.public_key(), TimerKind::Retry)
    }

    /// Cancels the sender's timers, forgets it and tells the node.
    pub fn remove_data_sender(&mut self, public_key: &str) -> Option<DataSender> {
        self.timers.cancel_all(public_key);
        let sender = self.senders.remove(public_key)?;
        sender
            .link
            .send(PushFrame::Unsubscribe(self.crypto.public_key().to_string()));
        info!("unsubscribed from data sender {}", public_key);
        Some(sender)
    }

    /// Checks a `DATA` push and re-arms its sender's contact timer.
    pub fn accept_push(
        &mut self,
        body: &Value,
        cycle_duration: Option<Duration>,
    ) -> Result<DataResponse, PushRejected> {
        let recipient = body.get("recipient").and_then(Value::as_str).unwrap_or_default();
        if recipient != self.crypto.public_key() {
            return Err(PushRejected::WrongRecipient(recipient.to_string()));
        }
        let from = body
            .get("publicKey")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !self.crypto.authenticate(body) {
            return Err(PushRejected::BadTag(from));
        }
        let Some(sender) = self.senders.get(&from) else {
            return Err(PushRejected::UnknownSender(from));
        };
        let response: DataResponse =
            serde_json::from_value(body.clone()).map_err(|e| PushRejected::Malformed(e.to_string()))?;
        for key in response.responses.keys() {
            let allowed = key
                .parse::<DataType>()
                .is_ok_and(|ty| sender.types.contains(&ty));
            if !allowed {
                return Err(PushRejected::UnrequestedType {
                    sender: from,
                    data_type: key.clone(),
                });
            }
        }
        self.create_contact_timeout(&from, cycle_duration);
        Ok(response)
    }

    /// Swaps the authoritative sender `old` for a random other active node.
    /// If nobody else can be subscribed, `old` stays with fresh timers.
    pub async fn replace_data_sender(
        &mut self,
        old: &str,
        registry: &NodeRegistry,
        cursor: DataCursor,
        cycle_duration: Option<Duration>,
    ) -> Result<SenderChange, SenderError> {
        if registry.active_count() < 2 {
            warn!(
                "only {} active node(s), keeping data sender {}",
                registry.active_count(),
                old
            );
            self.keep_sender(old, cycle_duration);
            return Ok(SenderChange::Kept {
                kept: old.to_string(),
            });
        }

        let Some(next) = self.pick_other_than(registry, old) else {
            if let Some(new) = self.promote_extra() {
                self.remove_data_sender(old);
                return Ok(SenderChange::Replaced {
                    old: old.to_string(),
                    new,
                });
            }
            self.keep_sender(old, cycle_duration);
            return Err(SenderError::NoCandidates);
        };
        if let Err(e) = self.add_data_sender(&next, true, cursor, cycle_duration).await {
            warn!("cannot subscribe to {} in place of {}: {}", next.public_key, old, e);
            self.keep_sender(old, cycle_duration);
            return Err(e);
        }
        self.remove_data_sender(old);
        info!("data sender {} replaced by {}", old, next.public_key);
        Ok(SenderChange::Replaced {
            old: old.to_string(),
            new: next.public_key,
        })
    }

    /// Re-arms `old`'s timers, or the retry timer if `old` is already gone.
    fn keep_sender(&mut self, old: &str, cycle_duration: Option<Duration>) {
        if self.is_sender(old) {
            self.create_contact_timeout(old, cycle_duration);
            self.create_replace_timeout(old);
        } else if self.authoritative().is_none() {
            self.schedule_retry();
        }
    }

    /// Acts on a timer report. Stale reports are ignored.
    pub async fn handle_timer(
        &mut self,
        fired: TimerFired,
        registry: &NodeRegistry,
        cursor: DataCursor,
        cycle_duration: Option<Duration>,
    ) -> Option<SenderChange> {
        if !self.timers.take_fired(&fired) {
            return None;
        }
        if fired.kind == TimerKind::Retry {
            debug!("retrying data sender subscription");
            return match self.ensure_senders(registry, cursor, cycle_duration).await {
                Ok(()) => self
                    .authoritative()
                    .map(|s| SenderChange::Subscribed {
                        new: s.node.public_key.clone(),
                    }),
                Err(e) => {
                    warn!("data sender retry failed: {}", e);
                    None
                }
            };
        }
        debug!("{:?} timeout for data sender {}", fired.kind, fired.public_key);
        self.sender_failed(&fired.public_key, registry, cursor, cycle_duration)
            .await
    }

    /// Handles a push socket that closed underneath us. Only the sender's
    /// current connection counts; older sockets to the same node are ignored.
    pub async fn handle_disconnect(
        &mut self,
        public_key: &str,
        connection: ConnectionId,
        registry: &NodeRegistry,
        cursor: DataCursor,
        cycle_duration: Option<Duration>,
    ) -> Option<SenderChange> {
        let current = self.senders.get(public_key)?.link.connection();
        if current != connection {
            debug!(
                "ignoring close of superseded socket #{} to {} (current #{})",
                connection, public_key, current
            );
            return None;
        }
        warn!("push socket #{} to data sender {} dropped", connection, public_key);
        self.sender_failed(public_key, registry, cursor, cycle_duration)
            .await
    }

    /// Replaces a failed authoritative sender or drops a failed extra one.
    pub async fn sender_failed(
        &mut self,
        public_key: &str,
        registry: &NodeRegistry,
        cursor: DataCursor,
        cycle_duration: Option<Duration>,
    ) -> Option<SenderChange> {
        let authoritative = self.senders.get(public_key)?.authoritative;
        if !authoritative {
            self.remove_data_sender(public_key);
            self.top_up_extras(registry, public_key, cursor, cycle_duration)
                .await;
            return Some(SenderChange::Dropped {
                old: public_key.to_string(),
            });
        }
        match self
            .replace_data_sender(public_key, registry, cursor, cycle_duration)
            .await
        {
            Ok(change) => Some(change),
            Err(e) => {
                error!("cannot replace data sender {}: {}", public_key, e);
                None
            }
        }
    }

    /// Unsubscribes from senders the network removed. Returns true if the
    /// authoritative sender was among them.
    pub fn unsubscribe_removed(&mut self, removed: &[PublicKey]) -> bool {
        let mut lost_authoritative = false;
        for public_key in removed {
            if let Some(sender) = self.remove_data_sender(public_key) {
                lost_authoritative |= sender.authoritative;
            }
        }
        lost_authoritative
    }

    /// Makes sure an authoritative sender exists and, when configured, that
    /// enough extra senders are subscribed.
    pub async fn ensure_senders(
        &mut self,
        registry: &NodeRegistry,
        cursor: DataCursor,
        cycle_duration: Option<Duration>,
    ) -> Result<(), SenderError> {
        if self.authoritative().is_none() && self.promote_extra().is_none() {
            if let Err(e) = self.subscribe_authoritative(registry, cursor, cycle_duration).await {
                self.schedule_retry();
                return Err(e);
            }
        }
        self.timers
            .cancel(self.crypto.public_key(), TimerKind::Retry);
        self.top_up_extras(registry, "", cursor, cycle_duration)
            .await;
        Ok(())
    }

    async fn subscribe_authoritative(
        &mut self,
        registry: &NodeRegistry,
        cursor: DataCursor,
        cycle_duration: Option<Duration>,
    ) -> Result<(), SenderError> {
        let node = self
            .pick_other_than(registry, "")
            .ok_or(SenderError::NoCandidates)?;
        self.add_data_sender(&node, true, cursor, cycle_duration)
            .await
    }

    /// Subscribes extra senders up to the configured count, never choosing
    /// `excluded`.
    async fn top_up_extras(
        &mut self,
        registry: &NodeRegistry,
        excluded: &str,
        cursor: DataCursor,
        cycle_duration: Option<Duration>,
    ) {
        if !self.config.subscribe_to_more {
            return;
        }
        while self.extras() < self.config.extra_senders {
            let Some(node) = self.pick_other_than(registry, excluded) else {
                debug!("no more active nodes to subscribe to");
                return;
            };
            if let Err(e) = self
                .add_data_sender(&node, false, cursor, cycle_duration)
                .await
            {
                warn!("cannot subscribe to extra sender {}: {}", node.public_key, e);
                return;
            }
        }
    }

    /// A random active node that is neither `excluded` nor already a sender.
    fn pick_other_than(&self, registry: &NodeRegistry, excluded: &str) -> Option<ConsensusNodeInfo> {
        let candidates: Vec<ConsensusNodeInfo> = registry
            .get_active_list()
            .into_iter()
            .filter(|n| n.public_key != excluded && !self.senders.contains_key(&n.public_key))
            .collect();
        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    fn promote_extra(&mut self) -> Option<PublicKey> {
        let extra = self.senders.values_mut().find(|s| !s.authoritative)?;
        extra.authoritative = true;
        let promoted = extra.node.public_key.clone();
        info!("promoted extra data sender {}", promoted);
        self.create_replace_timeout(&promoted);
        Some(promoted)
    }

    /// Drops every sender and timer.
    pub fn clear(&mut self) {
        let keys: Vec<PublicKey> = self.senders.keys().cloned().collect();
        for key in keys {
            self.remove_data_sender(&key);
        }
        self.timers.clear();
    }
}
