// Archiver reactor
//
// Owns every piece of mutable archiver state and mutates it from a single
// task. Push sockets, timers, gossip debounces, reputation polls and ingress
// requests all reach it as messages.
//
// INVARIANTS:
// 1. Cycle records reach the node directory in ascending counter order.
// 2. No state is borrowed across a network call made on another task.
// 3. A counter is reconciled at most once.

use std::sync::Arc;
use std::time::Duration;

use archivist_core::{ArchiverNodeInfo, ConsensusNodeInfo, CycleRecord, PublicKey, StateMetaData};
use archivist_crypto::CryptoFacade;
use archivist_cycles::{CycleChainSync, CycleProcessor, MetadataCatchUp, SyncError};
use archivist_data::{
    DataCursor, DataSenderManager, PushConnector, PushEvent, PushRejected, SenderChange, TimerFired,
};
use archivist_p2p::membership::{now_ms, Q1_MARGIN};
use archivist_p2p::{
    lists_archiver, poll_reputations, until_next_q1, ArchiverClient, ArchiverList, GossipCoordinator,
    GossipPayload, GossipSender, Membership, PeerTransport, Reconciliation, Reputation,
};
use archivist_state::{ArchivedCycle, Persistence};
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::ArchiverConfig;

const COMMAND_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("archiver has stopped")]
    Stopped,
}

/// Requests into the reactor, each with its reply channel.
#[derive(Debug)]
pub enum Command {
    LatestCycles {
        count: usize,
        reply: oneshot::Sender<Vec<CycleRecord>>,
    },
    CycleRange {
        start: u64,
        end: u64,
        reply: oneshot::Sender<Vec<CycleRecord>>,
    },
    NodeList {
        reply: oneshot::Sender<Vec<ConsensusNodeInfo>>,
    },
    /// Peer archivers not currently marked down.
    Archivers {
        reply: oneshot::Sender<Vec<ArchiverNodeInfo>>,
    },
    FullArchive {
        start: u64,
        end: u64,
        reply: oneshot::Sender<Vec<ArchivedCycle>>,
    },
    Gossip {
        envelope: Value,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Status {
        reply: oneshot::Sender<ArchiverStatus>,
    },
    Shutdown,
}

/// Snapshot of the reactor's view, for operators and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiverStatus {
    pub cycle: Option<u64>,
    pub last_processed_metadata: Option<u64>,
    pub active_nodes: usize,
    pub authoritative_sender: Option<PublicKey>,
    pub data_senders: usize,
    pub archivers: Vec<(PublicKey, Option<Reputation>)>,
    pub joined: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinState {
    NotJoining,
    Joining { attempt: u32 },
    Joined,
}

/// Cloneable front door to a running [`Archiver`].
#[derive(Debug, Clone)]
pub struct ArchiverHandle {
    commands: mpsc::Sender<Command>,
}

impl ArchiverHandle {
    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, HandleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| HandleError::Stopped)?;
        rx.await.map_err(|_| HandleError::Stopped)
    }

    pub async fn latest_cycles(&self, count: usize) -> Result<Vec<CycleRecord>, HandleError> {
        self.ask(|reply| Command::LatestCycles { count, reply }).await
    }

    pub async fn cycle_range(&self, start: u64, end: u64) -> Result<Vec<CycleRecord>, HandleError> {
        self.ask(|reply| Command::CycleRange { start, end, reply })
            .await
    }

    pub async fn node_list(&self) -> Result<Vec<ConsensusNodeInfo>, HandleError> {
        self.ask(|reply| Command::NodeList { reply }).await
    }

    pub async fn archivers(&self) -> Result<Vec<ArchiverNodeInfo>, HandleError> {
        self.ask(|reply| Command::Archivers { reply }).await
    }

    /// Archived cycles with counters in `start..=end`, oldest first.
    pub async fn full_archive(&self, start: u64, end: u64) -> Result<Vec<ArchivedCycle>, HandleError> {
        self.ask(|reply| Command::FullArchive { start, end, reply })
            .await
    }

    /// Hands an inbound gossip envelope to the reactor.
    pub async fn gossip(&self, envelope: Value) -> Result<Result<(), String>, HandleError> {
        self.ask(|reply| Command::Gossip { envelope, reply }).await
    }

    pub async fn status(&self) -> Result<ArchiverStatus, HandleError> {
        self.ask(|reply| Command::Status { reply }).await
    }

    pub async fn shutdown(&self) -> Result<(), HandleError> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| HandleError::Stopped)
    }
}

pub struct Archiver {
    config: ArchiverConfig,
    crypto: Arc<dyn CryptoFacade>,
    store: Arc<dyn Persistence>,
    client: ArchiverClient,
    processor: CycleProcessor,
    senders: DataSenderManager,
    gossip: GossipCoordinator,
    gossip_sender: GossipSender,
    membership: Membership,
    join: JoinState,

    commands: mpsc::Receiver<Command>,
    pushes: mpsc::UnboundedReceiver<PushEvent>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    reconcile_tx: mpsc::UnboundedSender<u64>,
    reconcile_rx: mpsc::UnboundedReceiver<u64>,
    reputation_tx: mpsc::UnboundedSender<Vec<(PublicKey, Reputation)>>,
    reputation_rx: mpsc::UnboundedReceiver<Vec<(PublicKey, Reputation)>>,
    join_tx: mpsc::UnboundedSender<bool>,
    join_rx: mpsc::UnboundedReceiver<bool>,
}

impl Archiver {
    pub fn new(
        config: ArchiverConfig,
        crypto: Arc<dyn CryptoFacade>,
        store: Arc<dyn Persistence>,
        transport: Arc<dyn PeerTransport>,
        connector: Arc<dyn PushConnector>,
    ) -> (Archiver, ArchiverHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (push_tx, pushes) = mpsc::unbounded_channel();
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let (reconcile_tx, reconcile_rx) = mpsc::unbounded_channel();
        let (reputation_tx, reputation_rx) = mpsc::unbounded_channel();
        let (join_tx, join_rx) = mpsc::unbounded_channel();

        let client = ArchiverClient::new(
            transport,
            crypto.clone(),
            config.query_timeout(),
            config.bulk_query_timeout(),
        );
        let peers = config
            .bootstrap_archivers
            .iter()
            .filter(|a| a.public_key != crypto.public_key())
            .cloned();
        let processor = CycleProcessor::new(
            crypto.clone(),
            ArchiverList::from_archivers(peers),
            config.removed_nodes_history,
        );
        let senders = DataSenderManager::new(
            crypto.clone(),
            connector,
            push_tx,
            timer_tx,
            config.sender_config(),
        );
        let gossip = GossipCoordinator::new(crypto.clone(), config.gossip_config());
        let gossip_sender = GossipSender::new(client.clone(), crypto.public_key().to_string());
        let membership = Membership::new(
            client.clone(),
            crypto.clone(),
            config.node_info(crypto.public_key()),
        );

        let archiver = Archiver {
            config,
            crypto,
            store,
            client,
            processor,
            senders,
            gossip,
            gossip_sender,
            membership,
            join: JoinState::NotJoining,
            commands,
            pushes,
            timers,
            reconcile_tx,
            reconcile_rx,
            reputation_tx,
            reputation_rx,
            join_tx,
            join_rx,
        };
        (archiver, ArchiverHandle { commands: commands_tx })
    }

    fn cursor(&self) -> DataCursor {
        DataCursor {
            cycle: self.processor.current_counter(),
            state_metadata: self.processor.last_processed_metadata(),
        }
    }

    /// Syncs the chain and node list from the bootstrap archivers, catches up
    /// archived state metadata, then subscribes to a data sender.
    pub async fn bootstrap(&mut self) -> Result<(), SyncError> {
        let archivers = self.processor.archivers().archivers().to_vec();
        let sync = CycleChainSync::new(
            self.client.clone(),
            self.crypto.clone(),
            self.config.sync_config(),
        );
        let outcome = sync.run(&archivers, self.store.as_ref()).await?;
        self.processor
            .apply_bootstrap(outcome.records, &outcome.change, self.store.as_ref())
            .await;
        if self.config.metadata_catch_up {
            self.catch_up_metadata().await;
        }
        self.ensure_senders().await;
        Ok(())
    }

    async fn catch_up_metadata(&mut self) {
        let archivers = self.processor.archivers().up_archivers();
        let catch_up = MetadataCatchUp::new(self.client.clone());
        match catch_up.run(&archivers, self.store.as_ref()).await {
            Ok(Some(counter)) => self.processor.mark_metadata_processed(counter),
            Ok(None) => debug!("no state metadata to catch up"),
            Err(e) => warn!("state metadata catch-up failed: {}", e),
        }
    }

    async fn ensure_senders(&mut self) {
        let cursor = self.cursor();
        let duration = self.processor.current_duration();
        if let Err(e) = self
            .senders
            .ensure_senders(self.processor.registry(), cursor, duration)
            .await
        {
            error!("cannot subscribe to a data sender: {}", e);
        }
    }

    /// Processes messages until shut down.
    pub async fn run(mut self) {
        info!(
            "archiver {} running at cycle {:?}",
            self.crypto.public_key(),
            self.processor.current_counter()
        );
        if self.config.join_network {
            self.join = JoinState::Joining { attempt: 1 };
            self.spawn_join_attempt();
        }
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.pushes.recv() => self.handle_push(event).await,
                Some(fired) = self.timers.recv() => self.handle_timer(fired).await,
                Some(counter) = self.reconcile_rx.recv() => self.reconcile(counter).await,
                Some(results) = self.reputation_rx.recv() => {
                    self.processor.archivers_mut().record_reputations(results);
                }
                Some(joined) = self.join_rx.recv() => self.join_attempt_done(joined),
            }
        }
        self.leave_network().await;
        self.senders.clear();
        info!("archiver stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::LatestCycles { count, reply } => {
                let records = self
                    .store
                    .query_latest_cycle_records(count)
                    .await
                    .unwrap_or_else(|e| {
                        error!("cannot read latest {} cycles: {}", count, e);
                        Vec::new()
                    });
                let _ = reply.send(records);
            }
            Command::CycleRange { start, end, reply } => {
                let records = self
                    .store
                    .query_cycle_records_between(start, end)
                    .await
                    .unwrap_or_else(|e| {
                        error!("cannot read cycles {}..={}: {}", start, end, e);
                        Vec::new()
                    });
                let _ = reply.send(records);
            }
            Command::NodeList { reply } => {
                let _ = reply.send(self.processor.registry().get_active_list());
            }
            Command::Archivers { reply } => {
                let _ = reply.send(self.processor.archivers().up_archivers());
            }
            Command::FullArchive { start, end, reply } => {
                let _ = reply.send(self.archived_cycles(start, end).await);
            }
            Command::Gossip { envelope, reply } => {
                let _ = reply.send(self.receive_gossip(&envelope));
            }
            Command::Status { reply } => {
                let archivers = self.processor.archivers();
                let status = ArchiverStatus {
                    cycle: self.processor.current_counter(),
                    last_processed_metadata: self.processor.last_processed_metadata(),
                    active_nodes: self.processor.registry().active_count(),
                    authoritative_sender: self
                        .senders
                        .authoritative()
                        .map(|s| s.node.public_key.clone()),
                    data_senders: self.senders.len(),
                    archivers: archivers
                        .archivers()
                        .iter()
                        .map(|a| (a.public_key.clone(), archivers.reputation(&a.public_key)))
                        .collect(),
                    joined: self.join == JoinState::Joined,
                };
                let _ = reply.send(status);
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_push(&mut self, event: PushEvent) {
        let cursor = self.cursor();
        let duration = self.processor.current_duration();
        match event {
            PushEvent::Data { from, body } => match self.senders.accept_push(&body, duration) {
                Ok(response) => self.process_response(response).await,
                Err(PushRejected::BadTag(sender)) if self.senders.is_sender(&sender) => {
                    warn!("data sender {} failed authentication, unsubscribing", sender);
                    self.senders
                        .sender_failed(&sender, self.processor.registry(), cursor, duration)
                        .await;
                }
                Err(e) => debug!("dropped push from socket {}: {}", from, e),
            },
            PushEvent::Disconnected { from, connection } => {
                self.senders
                    .handle_disconnect(&from, connection, self.processor.registry(), cursor, duration)
                    .await;
            }
        }
    }

    async fn handle_timer(&mut self, fired: TimerFired) {
        let cursor = self.cursor();
        let duration = self.processor.current_duration();
        if let Some(change) = self
            .senders
            .handle_timer(fired, self.processor.registry(), cursor, duration)
            .await
        {
            debug!("data sender change: {:?}", change);
        }
    }

    async fn process_response(&mut self, response: archivist_core::DataResponse) {
        match response.cycles() {
            Ok(cycles) if !cycles.is_empty() => self.process_cycles(cycles).await,
            Ok(_) => {}
            Err(e) => warn!("malformed cycles from {}: {}", response.public_key, e),
        }
        match response.state_metadata() {
            Ok(items) if !items.is_empty() => self.process_state_metadata(&items).await,
            Ok(_) => {}
            Err(e) => warn!("malformed state metadata from {}: {}", response.public_key, e),
        }
    }

    async fn archived_cycles(&self, start: u64, end: u64) -> Vec<ArchivedCycle> {
        let records = match self.store.query_cycle_records_between(start, end).await {
            Ok(records) => records,
            Err(e) => {
                error!("cannot read cycles {}..={}: {}", start, end, e);
                return Vec::new();
            }
        };
        let mut archived = Vec::with_capacity(records.len());
        for record in records {
            match self.store.query_archived_cycle(&record.marker).await {
                Ok(Some(entry)) => archived.push(entry),
                Ok(None) => debug!("cycle {} has no archive entry", record.counter),
                Err(e) => {
                    error!("cannot read archive of cycle {}: {}", record.counter, e);
                    break;
                }
            }
        }
        archived
    }

    async fn process_cycles(&mut self, cycles: Vec<CycleRecord>) {
        let listed = cycles
            .iter()
            .any(|r| lists_archiver(r, self.crypto.public_key()));
        let report = self
            .processor
            .process_cycles(cycles, self.store.as_ref())
            .await;
        let lost_authoritative = self.senders.unsubscribe_removed(&report.removed_public_keys);
        if lost_authoritative || report.activated > 0 || self.senders.authoritative().is_none() {
            self.ensure_senders().await;
        }
        if report.advanced() {
            self.poll_reputations();
        }
        if listed && self.join != JoinState::Joined {
            info!("admitted to the archiver set at cycle {:?}", self.processor.current_counter());
            self.join = JoinState::Joined;
        }
    }

    async fn process_state_metadata(&mut self, items: &[StateMetaData]) {
        let hashes = self
            .processor
            .process_state_metadata(items, self.store.as_ref())
            .await;
        for hash in hashes {
            let counter = hash.counter;
            match self.gossip.build_envelope(GossipPayload::Hashes(hash)) {
                Ok(envelope) => self.send_gossip("gossip-hashes", envelope),
                Err(e) => error!("cannot sign hashes gossip for counter {}: {}", counter, e),
            }
        }
    }

    fn send_gossip(&self, route: &'static str, envelope: Value) {
        let sender = self.gossip_sender.clone();
        let peers = self.processor.archivers().archivers().to_vec();
        tokio::spawn(async move {
            let accepted = sender.send_gossip(route, envelope, &peers).await;
            debug!("{} accepted by {}/{} archivers", route, accepted, peers.len());
        });
    }

    fn receive_gossip(&mut self, raw: &Value) -> Result<(), String> {
        let archivers = self.processor.archivers();
        let envelope = self
            .gossip
            .open_envelope(raw, |pk| archivers.contains(pk))
            .map_err(|e| {
                debug!("rejected gossip: {}", e);
                e.to_string()
            })?;
        // Peers plus ourselves.
        let active_archivers = archivers.len() + 1;
        match envelope.payload {
            GossipPayload::Hashes(hashes) => {
                if let Some(counter) =
                    self.gossip
                        .add_hashes_gossip(&envelope.sender, hashes, active_archivers)
                {
                    let tx = self.reconcile_tx.clone();
                    let debounce = self.gossip.config().debounce;
                    tokio::spawn(async move {
                        tokio::time::sleep(debounce).await;
                        let _ = tx.send(counter);
                    });
                }
            }
        }
        Ok(())
    }

    async fn reconcile(&mut self, counter: u64) {
        let local = self.processor.local_hash(counter).cloned();
        match self.gossip.reconcile(counter, local.as_ref()) {
            Reconciliation::Override(majority) => {
                warn!("counter {}: adopting majority state metadata", counter);
                let item = StateMetaData::from_hash(&majority);
                self.processor
                    .process_state_metadata(&[item], self.store.as_ref())
                    .await;
                self.rotate_sender().await;
            }
            outcome => debug!("counter {}: reconciliation {:?}", counter, outcome),
        }
    }

    /// Replaces the authoritative sender after it fed us minority data.
    async fn rotate_sender(&mut self) {
        let Some(current) = self.senders.authoritative().map(|s| s.node.public_key.clone()) else {
            self.ensure_senders().await;
            return;
        };
        let cursor = self.cursor();
        let duration = self.processor.current_duration();
        match self
            .senders
            .replace_data_sender(&current, self.processor.registry(), cursor, duration)
            .await
        {
            Ok(SenderChange::Replaced { new, .. }) => info!("rotated data sender {} -> {}", current, new),
            Ok(other) => info!("data sender not rotated: {:?}", other),
            Err(e) => {
                error!("cannot rotate data sender {}: {}", current, e);
                self.ensure_senders().await;
            }
        }
    }

    fn poll_reputations(&self) {
        let client = self.client.clone();
        let archivers = self.processor.archivers().archivers().to_vec();
        if archivers.is_empty() {
            return;
        }
        let local = self.processor.current_counter();
        let max_lag = self.config.reputation_max_lag;
        let per_request: Duration = self.config.reputation_timeout();
        let tx = self.reputation_tx.clone();
        tokio::spawn(async move {
            let results = poll_reputations(&client, &archivers, local, max_lag, per_request).await;
            let _ = tx.send(results);
        });
    }

    /// Waits for the next first quarter, posts a join request, then after
    /// one cycle asks an up archiver whether we were listed.
    fn spawn_join_attempt(&self) {
        let membership = self.membership.clone();
        let nodes = self.processor.registry().get_active_list();
        let archivers = self.processor.archivers().up_archivers();
        let latest = self.processor.chain().latest().cloned();
        let cycle = self
            .processor
            .current_duration()
            .unwrap_or_else(|| self.config.default_cycle_duration());
        let tx = self.join_tx.clone();
        tokio::spawn(async move {
            let wait = latest
                .as_ref()
                .map_or(Q1_MARGIN, |record| until_next_q1(record, now_ms()));
            debug!("waiting {:?} for the first quarter before joining", wait);
            tokio::time::sleep(wait).await;
            if let Err(e) = membership.submit_join(&nodes).await {
                error!("cannot sign join request: {}", e);
            }
            tokio::time::sleep(cycle + Q1_MARGIN).await;
            let joined = membership
                .check_join_status(&archivers)
                .await
                .unwrap_or_else(|e| {
                    debug!("join status check failed: {}", e);
                    false
                });
            let _ = tx.send(joined);
        });
    }

    fn join_attempt_done(&mut self, joined: bool) {
        let JoinState::Joining { attempt } = self.join else {
            return;
        };
        if joined {
            info!("joined the archiver set after {} attempt(s)", attempt);
            self.join = JoinState::Joined;
            return;
        }
        let limit = self.config.max_join_attempts;
        if limit != 0 && attempt >= limit {
            error!("not admitted after {} join attempts, giving up", attempt);
            self.join = JoinState::NotJoining;
            return;
        }
        debug!("join attempt {} not yet reflected in the chain", attempt);
        self.join = JoinState::Joining { attempt: attempt + 1 };
        self.spawn_join_attempt();
    }

    /// Tells a random active node this archiver is going away.
    async fn leave_network(&self) {
        if self.join == JoinState::NotJoining {
            return;
        }
        let nodes = self.processor.registry().get_active_list();
        let Some(node) = nodes.choose(&mut rand::thread_rng()) else {
            warn!("no active node to send a leave request to");
            return;
        };
        if let Err(e) = self.membership.send_leave(node).await {
            warn!("leave request to {} failed: {}", node.ip_port(), e);
        }
    }
}
