use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::join_all;
use meshcache_rpc::Status;
use rand::seq::SliceRandom;
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use super::broadcast::{retransmit_limit, BroadcastQueue};
use super::messages::{GossipMessage, MessageKind};
use super::probe::{self, Probe};
use crate::config::GossipConfig;
use crate::membership::{
    Member,
    MembershipSnapshot,
    MembershipTable,
    MergeOutcome,
    NodeRecord,
    NodeState,
};
use crate::rpc::client::GossipClient;
use crate::rpc::network::RpcNetwork;
use crate::statistics::ClusterStatistics;

const EVENT_BACKLOG: usize = 1024;

/// Work handed to the gossip engine.
pub(crate) enum Event {
    /// A message received from a peer, the reply is sent back over the channel.
    Inbound {
        msg: GossipMessage,
        reply: oneshot::Sender<Result<GossipMessage, Status>>,
    },
    /// A reply to a message sent by this node.
    Reply(GossipMessage),
    /// The outcome of probing a peer.
    ProbeCompleted {
        node_id: String,
        incarnation: u64,
        acked: bool,
    },
    /// Stops the engine, optionally telling live peers we are leaving first.
    Shutdown {
        announce: bool,
        done: Option<oneshot::Sender<()>>,
    },
}

#[derive(Clone)]
/// A handle to the running gossip engine.
pub(crate) struct GossipHandle {
    events: flume::Sender<Event>,
    snapshots: watch::Receiver<Arc<MembershipSnapshot>>,
}

impl GossipHandle {
    /// The sender used to hand inbound messages to the engine.
    pub(crate) fn events(&self) -> flume::Sender<Event> {
        self.events.clone()
    }

    /// The latest published membership snapshot.
    pub(crate) fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Subscribes to membership snapshots.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<MembershipSnapshot>> {
        self.snapshots.clone()
    }

    /// Stops the engine and waits for it to finish.
    pub(crate) async fn shutdown(&self, announce: bool) {
        let (tx, rx) = oneshot::channel();
        let event = Event::Shutdown {
            announce,
            done: Some(tx),
        };

        if self.events.send_async(event).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Signals the engine to stop without waiting.
    pub(crate) fn shutdown_now(&self) {
        let _ = self.events.try_send(Event::Shutdown {
            announce: false,
            done: None,
        });
    }
}

/// The single writer of the membership table.
pub(crate) struct GossipEngine {
    cfg: GossipConfig,
    table: MembershipTable,
    broadcasts: BroadcastQueue,
    seeds: Vec<String>,
    network: RpcNetwork,
    statistics: ClusterStatistics,
    events_tx: flume::Sender<Event>,
    events: flume::Receiver<Event>,
    snapshot_tx: watch::Sender<Arc<MembershipSnapshot>>,
    probe_round: Vec<String>,
    last_join_attempt: Instant,
    dirty: bool,
}

impl GossipEngine {
    /// Creates a new engine whose table only contains this node.
    pub(crate) fn new(
        cfg: GossipConfig,
        me: Member,
        seeds: Vec<String>,
        network: RpcNetwork,
        statistics: ClusterStatistics,
    ) -> (Self, GossipHandle) {
        let table = MembershipTable::new(me);
        let (events_tx, events) = flume::bounded(EVENT_BACKLOG);
        let (snapshot_tx, snapshots) = watch::channel(Arc::new(table.snapshot()));

        let handle = GossipHandle {
            events: events_tx.clone(),
            snapshots,
        };

        let mut engine = Self {
            cfg,
            table,
            broadcasts: BroadcastQueue::default(),
            seeds,
            network,
            statistics,
            events_tx,
            events,
            snapshot_tx,
            probe_round: Vec::new(),
            last_join_attempt: Instant::now(),
            dirty: true,
        };
        engine.publish();

        (engine, handle)
    }

    #[inline]
    fn node_id(&self) -> &str {
        &self.table.me().node_id
    }

    /// Runs the protocol until shutdown.
    pub(crate) async fn run(mut self) {
        let mut interval = tokio::time::interval(self.cfg.gossip_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.join_cluster();

        let events = self.events.clone();
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(),
                event = events.recv_async() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(_) => break,
                    };

                    if let Event::Shutdown { announce, done } = event {
                        if announce {
                            self.announce_leave().await;
                        }
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                        break;
                    }

                    self.handle_event(event);
                },
            }

            self.publish();
        }

        info!(node_id = %self.node_id(), "Gossip engine stopped.");
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Inbound { msg, reply } => self.handle_inbound(msg, reply),
            Event::Reply(msg) => self.absorb(&msg),
            Event::ProbeCompleted {
                node_id,
                incarnation,
                acked,
            } => self.handle_probe_result(node_id, incarnation, acked),
            Event::Shutdown { .. } => {},
        }
    }

    fn handle_inbound(
        &mut self,
        msg: GossipMessage,
        reply: oneshot::Sender<Result<GossipMessage, Status>>,
    ) {
        self.absorb(&msg);

        let sender_id = msg.sender.node_id;
        match msg.kind {
            MessageKind::Probe => {
                debug!(
                    node_id = %self.node_id(),
                    target_node_id = %sender_id,
                    "Member is joining the cluster through this node."
                );

                let ack = GossipMessage::new(
                    self.table.me().to_record(),
                    MessageKind::ProbeAck,
                    self.table.records(),
                );
                let _ = reply.send(Ok(ack));
            },
            MessageKind::PingReq {
                target_id,
                target_addr,
            } => self.relay_ping(target_id, target_addr, reply),
            MessageKind::Ping
            | MessageKind::MembershipDelta
            | MessageKind::PingAck
            | MessageKind::ProbeAck => {
                let ack = self.message(MessageKind::PingAck, Some(&sender_id));
                let _ = reply.send(Ok(ack));
            },
        }
    }

    /// Pings the target on behalf of another member and relays the answer.
    fn relay_ping(
        &mut self,
        target_id: String,
        target_addr: String,
        reply: oneshot::Sender<Result<GossipMessage, Status>>,
    ) {
        let target_addr = match target_addr.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => {
                let _ = reply.send(Err(Status::invalid()));
                return;
            },
        };

        trace!(
            node_id = %self.node_id(),
            target_node_id = %target_id,
            target_addr = %target_addr,
            "Probing member on behalf of peer."
        );

        let ping = self.message(MessageKind::Ping, Some(&target_id));
        tokio::spawn(probe::relay_ping(
            target_addr,
            ping,
            self.cfg.direct_probe_timeout,
            self.network.clone(),
            self.events_tx.clone(),
            reply,
        ));
    }

    fn handle_probe_result(&mut self, node_id: String, incarnation: u64, acked: bool) {
        if acked {
            return;
        }

        if self.table.suspect(&node_id, incarnation, Instant::now()) {
            warn!(
                node_id = %self.node_id(),
                target_node_id = %node_id,
                incarnation = incarnation,
                "Member failed to answer probes and is now suspect."
            );
            self.broadcasts.push(node_id);
            self.dirty = true;
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();

        for node_id in self
            .table
            .expire_suspects(self.cfg.suspicion_timeout, now)
        {
            warn!(
                node_id = %self.node_id(),
                target_node_id = %node_id,
                "Suspect member did not refute in time and is now dead."
            );
            self.broadcasts.push(node_id);
            self.dirty = true;
        }

        for node_id in self.table.purge_dead(self.cfg.dead_node_retention, now) {
            debug!(
                node_id = %self.node_id(),
                target_node_id = %node_id,
                "Forgetting dead member."
            );
            self.broadcasts.remove(&node_id);
            self.dirty = true;
        }

        let isolated = self.table.live_peers().next().is_none();
        if isolated
            && now.saturating_duration_since(self.last_join_attempt)
                >= self.cfg.join_retry_interval
        {
            self.join_cluster();
        }

        if let Some(target) = self.next_probe_target() {
            self.start_probe(target);
        }
    }

    /// Picks the next peer of the current round, starting a new shuffled
    /// round once every peer has been probed.
    fn next_probe_target(&mut self) -> Option<Member> {
        for _ in 0..2 {
            while let Some(node_id) = self.probe_round.pop() {
                match self.table.get(&node_id) {
                    Some(member) if !member.is_dead() => return Some(member.clone()),
                    _ => continue,
                }
            }

            let mut round = self
                .table
                .live_peers()
                .map(|member| member.node_id.clone())
                .collect::<Vec<_>>();

            if round.is_empty() {
                return None;
            }

            round.shuffle(&mut rand::thread_rng());
            self.probe_round = round;
        }

        None
    }

    fn start_probe(&mut self, target: Member) {
        let ping = self.message(MessageKind::Ping, Some(&target.node_id));
        let ping_req = self.message(
            MessageKind::PingReq {
                target_id: target.node_id.clone(),
                target_addr: target.addr.to_string(),
            },
            None,
        );

        let candidates = self
            .table
            .live_peers()
            .filter(|member| {
                member.node_id != target.node_id && member.state == NodeState::Alive
            })
            .map(|member| member.addr)
            .collect::<Vec<_>>();
        let helpers = candidates
            .choose_multiple(&mut rand::thread_rng(), self.cfg.indirect_probes)
            .copied()
            .collect();

        trace!(
            node_id = %self.node_id(),
            target_node_id = %target.node_id,
            target_addr = %target.addr,
            "Probing member."
        );

        tokio::spawn(probe::run_probe(Probe {
            target_id: target.node_id,
            target_addr: target.addr,
            incarnation: target.incarnation,
            ping,
            ping_req,
            helpers,
            direct_timeout: self.cfg.direct_probe_timeout,
            total_timeout: self.cfg.probe_timeout,
            network: self.network.clone(),
            events: self.events_tx.clone(),
        }));
    }

    /// Contacts every seed node, the first reply seeds the membership table.
    fn join_cluster(&mut self) {
        self.last_join_attempt = Instant::now();
        if self.seeds.is_empty() {
            return;
        }

        debug!(
            node_id = %self.node_id(),
            num_seeds = self.seeds.len(),
            "Contacting seed nodes."
        );

        let msg = GossipMessage::new(
            self.table.me().to_record(),
            MessageKind::Probe,
            Vec::new(),
        );
        for seed in self.seeds.iter() {
            tokio::spawn(probe::join_seed(
                seed.clone(),
                self.table.me().addr,
                msg.clone(),
                self.cfg.probe_timeout,
                self.network.clone(),
                self.events_tx.clone(),
            ));
        }
    }

    /// Tells every live peer this node is leaving.
    async fn announce_leave(&mut self) {
        let record = self.table.mark_self_dead(Instant::now());
        let msg =
            GossipMessage::new(record.clone(), MessageKind::MembershipDelta, vec![record]);

        let peers = self
            .table
            .live_peers()
            .map(|member| member.addr)
            .collect::<Vec<_>>();

        let sends = peers.iter().map(|addr| {
            let client = GossipClient::new(
                self.network.get_or_connect(*addr),
                self.cfg.probe_timeout,
            );
            let msg = &msg;
            async move { client.send(msg).await }
        });

        let results = join_all(sends).await;
        let num_acked = results.iter().filter(|res| res.is_ok()).count();

        info!(
            node_id = %self.node_id(),
            num_peers = peers.len(),
            num_acked = num_acked,
            "Announced departure from the cluster."
        );
    }

    /// Builds an outgoing message with piggybacked membership changes.
    ///
    /// A peer we do not believe is alive always receives its own record
    /// so it gets the chance to refute.
    fn message(&mut self, kind: MessageKind, to: Option<&str>) -> GossipMessage {
        let limit =
            retransmit_limit(self.cfg.retransmit_multiplier, self.table.num_members());
        let mut payload = self
            .broadcasts
            .select(self.cfg.max_piggyback, limit)
            .into_iter()
            .filter_map(|node_id| self.table.record(&node_id))
            .collect::<Vec<_>>();

        if let Some(member) = to.and_then(|node_id| self.table.get(node_id)) {
            if member.state != NodeState::Alive
                && !payload.iter().any(|r| r.node_id == member.node_id)
            {
                payload.push(member.to_record());
            }
        }

        GossipMessage::new(self.table.me().to_record(), kind, payload)
    }

    /// Merges every record carried by a message from a peer.
    fn absorb(&mut self, msg: &GossipMessage) {
        let now = Instant::now();
        self.merge_record(&msg.sender, now);
        self.table.touch(&msg.sender.node_id, now);

        for record in msg.payload.iter() {
            self.merge_record(record, now);
        }
    }

    fn merge_record(&mut self, record: &NodeRecord, now: Instant) {
        let outcome = self.table.merge(record, now);

        match outcome {
            MergeOutcome::Inserted => info!(
                node_id = %self.node_id(),
                target_node_id = %record.node_id,
                target_addr = %record.addr,
                state = %record.state,
                "Discovered new member."
            ),
            MergeOutcome::Updated => match record.state {
                NodeState::Alive => info!(
                    node_id = %self.node_id(),
                    target_node_id = %record.node_id,
                    incarnation = record.incarnation,
                    "Member is alive."
                ),
                NodeState::Suspect => warn!(
                    node_id = %self.node_id(),
                    target_node_id = %record.node_id,
                    incarnation = record.incarnation,
                    "Member is suspected to have failed."
                ),
                NodeState::Dead => warn!(
                    node_id = %self.node_id(),
                    target_node_id = %record.node_id,
                    incarnation = record.incarnation,
                    "Member is dead."
                ),
            },
            MergeOutcome::Refuted => info!(
                node_id = %self.node_id(),
                rumour_state = %record.state,
                incarnation = self.table.me().incarnation,
                "Refuting rumour about this node."
            ),
            MergeOutcome::Invalid => warn!(
                node_id = %self.node_id(),
                target_node_id = %record.node_id,
                target_addr = %record.addr,
                "Ignoring member with an invalid address."
            ),
            MergeOutcome::Stale => trace!(
                node_id = %self.node_id(),
                target_node_id = %record.node_id,
                incarnation = record.incarnation,
                "Dropping stale record."
            ),
            MergeOutcome::Unchanged => {},
        }

        if outcome.is_change() {
            self.broadcasts.push(record.node_id.clone());
            self.dirty = true;
        }
    }

    /// Publishes a new snapshot if the table has changed.
    fn publish(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;

        let snapshot = self.table.snapshot();
        self.statistics
            .num_live_members
            .store(snapshot.count(NodeState::Alive) as u64, Ordering::Relaxed);
        self.statistics
            .num_suspect_members
            .store(snapshot.count(NodeState::Suspect) as u64, Ordering::Relaxed);
        self.statistics
            .num_dead_members
            .store(snapshot.count(NodeState::Dead) as u64, Ordering::Relaxed);

        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}
