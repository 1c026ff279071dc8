//! Node wiring and lifecycle.
//!
//! `Node::build` assembles the components; `Node::start` spawns the event
//! loops (epoch ticker, engine outbound, dispatcher inbound, transport
//! frames) and returns a [`NodeHandle`] for shutdown. The node starts
//! `Syncing` when it has peers and flips to `Serving` once a chain-segment
//! exchange comes back shorter than a full segment.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use triad_chain::{Blockchain, CHAIN_SEGMENT_LENGTH};
use triad_config::Config;
use triad_consensus::{
    bootstrap_genesis, BlockPool, ConsensusEngine, ConsensusError, ConsensusMessage, EngineConfig,
    EngineEvent, EpochClock, NodeStatus, SystemTimeSource, TimeSource,
};
use triad_crypto::PrivateKey;
use triad_mempool::{PoolConfig, TransactionPool};
use triad_p2p::{DispatchEvent, DispatcherConfig, PeerDispatcher, PeerId, PeerTransport};
use triad_statedb::{ConsensusRules, StateVersionManager};

use crate::reporter::{NoopReporter, ProofHashReporter, ShardReporter};

/// A running node's handle: status inspection and shutdown.
pub struct NodeHandle {
    engine: Arc<ConsensusEngine>,
    status: Arc<RwLock<NodeStatus>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    /// The node's current status.
    pub fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    /// Stops the engine and aborts the event loops.
    pub fn stop(&mut self) {
        self.engine.stop();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("node stopped");
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The assembled node, ready to start.
pub struct Node {
    config: Config,
    key: PrivateKey,
    status: Arc<RwLock<NodeStatus>>,
    mgr: Arc<StateVersionManager>,
    chain: Arc<Blockchain>,
    tx_pool: Arc<TransactionPool>,
    block_pool: Arc<BlockPool>,
    engine: Arc<ConsensusEngine>,
    dispatcher: Arc<PeerDispatcher>,
    engine_rx: mpsc::Receiver<EngineEvent>,
    dispatch_rx: mpsc::Receiver<DispatchEvent>,
    reporter: Arc<ProofHashReporter>,
    clock: Arc<EpochClock>,
}

impl Node {
    /// Builds a node from its config, key and transport, with the system
    /// clock and a no-op reporter.
    pub fn build(
        config: Config,
        key: PrivateKey,
        transport: Arc<dyn PeerTransport>,
    ) -> anyhow::Result<Self> {
        Self::build_with(
            config,
            key,
            transport,
            Arc::new(SystemTimeSource),
            Box::new(NoopReporter),
        )
    }

    /// Builds a node with an injected time source and reporter (tests,
    /// shard deployments).
    pub fn build_with(
        config: Config,
        key: PrivateKey,
        transport: Arc<dyn PeerTransport>,
        time: Arc<dyn TimeSource>,
        shard_reporter: Box<dyn ShardReporter>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let mgr = Arc::new(StateVersionManager::new());
        let whitelist = config.genesis.whitelist();
        let genesis = bootstrap_genesis(&mgr, &whitelist, config.genesis.timestamp)?;
        info!(hash = %genesis.hash.short(), validators = whitelist.len(), "genesis bootstrapped");

        let chain = Arc::new(Blockchain::new(genesis.clone())?);
        let block_pool = Arc::new(BlockPool::new(Arc::clone(&mgr), genesis));
        let tx_pool = Arc::new(TransactionPool::new(PoolConfig::default()));
        let clock = Arc::new(EpochClock::new(
            config.genesis.timestamp,
            config.consensus.epoch_ms,
            config.consensus.ntp_probe_interval_epochs,
            config.consensus.max_time_adjustment_ms,
            time,
        ));
        let status = Arc::new(RwLock::new(NodeStatus::Starting));

        let (engine_tx, engine_rx) = mpsc::channel(1024);
        let engine = Arc::new(ConsensusEngine::new(
            EngineConfig {
                min_num_validators: config.consensus.min_num_validators,
                max_consensus_states: config.consensus.max_consensus_states,
                strict_state_proof: config.lightweight.strict_state_proof,
            },
            key.clone(),
            Arc::clone(&mgr),
            Arc::new(ConsensusRules),
            Arc::clone(&chain),
            Arc::clone(&tx_pool),
            Arc::clone(&block_pool),
            Arc::clone(&clock),
            Arc::clone(&status),
            engine_tx,
        ));

        let (dispatch_tx, dispatch_rx) = mpsc::channel(1024);
        let clock_for_dispatch = Arc::clone(&clock);
        let dispatcher = Arc::new(PeerDispatcher::new(
            DispatcherConfig {
                data_proto_ver: config.chain.data_proto_ver.clone(),
                consensus_proto_ver: config.chain.consensus_proto_ver.clone(),
                message_window_ms: config.network.message_window_ms,
            },
            key.clone(),
            transport,
            dispatch_tx,
            Arc::new(move || clock_for_dispatch.now_ms()),
        )?);

        let reporter = Arc::new(ProofHashReporter::new(
            config.sharding.clone(),
            key.clone(),
            shard_reporter,
        ));

        Ok(Self {
            config,
            key,
            status,
            mgr,
            chain,
            tx_pool,
            block_pool,
            engine,
            dispatcher,
            engine_rx,
            dispatch_rx,
            reporter,
            clock,
        })
    }

    /// The chain log (for inspection).
    pub fn chain(&self) -> Arc<Blockchain> {
        Arc::clone(&self.chain)
    }

    /// The block pool (for inspection).
    pub fn block_pool(&self) -> Arc<BlockPool> {
        Arc::clone(&self.block_pool)
    }

    /// The state version manager (for inspection).
    pub fn version_manager(&self) -> Arc<StateVersionManager> {
        Arc::clone(&self.mgr)
    }

    /// The consensus engine (for inspection and manual driving in tests).
    pub fn engine(&self) -> Arc<ConsensusEngine> {
        Arc::clone(&self.engine)
    }

    /// Starts the event loops and the epoch ticker. `frames` is the stream
    /// of `(peer, frame)` pairs from the transport; pass `None` when the
    /// embedding process feeds the dispatcher itself.
    pub fn start(
        mut self,
        frames: Option<mpsc::UnboundedReceiver<(PeerId, String)>>,
    ) -> NodeHandle {
        let mut tasks = Vec::new();

        // Inbound frames.
        if let Some(mut frames) = frames {
            let dispatcher = Arc::clone(&self.dispatcher);
            tasks.push(tokio::spawn(async move {
                while let Some((from, frame)) = frames.recv().await {
                    if let Err(e) = dispatcher.handle_frame(from, &frame).await {
                        debug!(error = %e, "frame dropped");
                    }
                }
                debug!("frame loop ended");
            }));
        }

        self.engine.init();
        let has_peers = self.dispatcher.peer_count() > 0;
        *self.status.write() = if has_peers {
            NodeStatus::Syncing
        } else {
            NodeStatus::Serving
        };
        info!(status = %self.status.read(), "node starting");

        // Greet connected peers and, when syncing, fetch the first segment.
        {
            let dispatcher = Arc::clone(&self.dispatcher);
            let chain = Arc::clone(&self.chain);
            let syncing = has_peers;
            tasks.push(tokio::spawn(async move {
                dispatcher.greet_all().await;
                if syncing {
                    if let Err(e) = dispatcher.request_chain_segments(chain.last_block()).await {
                        warn!(error = %e, "initial segment request failed");
                    }
                }
            }));
        }

        // Epoch ticker.
        {
            let engine = Arc::clone(&self.engine);
            let epoch_ms = self.config.consensus.epoch_ms;
            tasks.push(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(std::time::Duration::from_millis(epoch_ms));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    engine.on_epoch_tick().await;
                }
            }));
        }

        // Engine outbound events.
        {
            let dispatcher = Arc::clone(&self.dispatcher);
            let reporter = Arc::clone(&self.reporter);
            let clock = Arc::clone(&self.clock);
            let mut engine_rx = self.engine_rx;
            tasks.push(tokio::spawn(async move {
                while let Some(event) = engine_rx.recv().await {
                    match event {
                        EngineEvent::Broadcast(message) => {
                            if let Err(e) = dispatcher.broadcast_consensus(message).await {
                                warn!(error = %e, "consensus broadcast failed");
                            }
                        }
                        EngineEvent::RequestChainSegments { last_block } => {
                            if let Err(e) = dispatcher.request_chain_segments(last_block).await {
                                warn!(error = %e, "segment request failed");
                            }
                        }
                        EngineEvent::Finalized(block) => {
                            reporter.on_finalized(&block, clock.now_ms()).await;
                        }
                    }
                }
                debug!("engine event loop ended");
            }));
        }

        // Dispatcher inbound events.
        {
            let engine = Arc::clone(&self.engine);
            let tx_pool = Arc::clone(&self.tx_pool);
            let dispatcher = Arc::clone(&self.dispatcher);
            let chain = Arc::clone(&self.chain);
            let status = Arc::clone(&self.status);
            let mut dispatch_rx = self.dispatch_rx;
            tasks.push(tokio::spawn(async move {
                while let Some(event) = dispatch_rx.recv().await {
                    Self::handle_dispatch_event(
                        event, &engine, &tx_pool, &dispatcher, &chain, &status,
                    )
                    .await;
                }
                debug!("dispatch event loop ended");
            }));
        }

        NodeHandle {
            engine: self.engine,
            status: self.status,
            tasks,
        }
    }

    async fn handle_dispatch_event(
        event: DispatchEvent,
        engine: &Arc<ConsensusEngine>,
        tx_pool: &Arc<TransactionPool>,
        dispatcher: &Arc<PeerDispatcher>,
        chain: &Arc<Blockchain>,
        status: &Arc<RwLock<NodeStatus>>,
    ) {
        match event {
            DispatchEvent::PeerReady { peer, address } => {
                debug!(peer = %peer, address = %address, "peer ready");
            }
            DispatchEvent::Consensus(ConsensusMessage::Proposal { block, proposal_tx }) => {
                match engine.handle_proposal(block, proposal_tx).await {
                    Ok(()) => {}
                    Err(ConsensusError::Duplicate(_)) => {}
                    Err(e) => debug!(error = %e, "proposal dropped"),
                }
            }
            DispatchEvent::Consensus(ConsensusMessage::Vote { vote_tx }) => {
                match engine.handle_vote(vote_tx).await {
                    Ok(()) => {}
                    Err(ConsensusError::Duplicate(_)) => {}
                    Err(e) => debug!(error = %e, "vote dropped"),
                }
            }
            DispatchEvent::Transactions(txs) => {
                for tx in txs {
                    let decision = tx_pool.admit(tx);
                    debug!(?decision, "inbound transaction");
                }
            }
            DispatchEvent::SegmentRequest { peer, last_block } => {
                Self::serve_segment(engine, dispatcher, chain, peer, last_block).await;
            }
            DispatchEvent::SegmentResponse {
                chain_segment,
                number,
                catch_up_info,
            } => {
                let caught_up = chain_segment.len() < CHAIN_SEGMENT_LENGTH;
                match engine.handle_chain_segment(chain_segment, catch_up_info).await {
                    Ok(()) => {
                        if caught_up && *status.read() == NodeStatus::Syncing {
                            *status.write() = NodeStatus::Serving;
                            info!(peer_tip = number, "caught up; now serving");
                        } else if !caught_up {
                            if let Err(e) = dispatcher
                                .request_chain_segments(chain.last_block())
                                .await
                            {
                                warn!(error = %e, "follow-up segment request failed");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "chain segment rejected"),
                }
            }
        }
    }

    async fn serve_segment(
        engine: &Arc<ConsensusEngine>,
        dispatcher: &Arc<PeerDispatcher>,
        chain: &Arc<Blockchain>,
        peer: PeerId,
        last_block: Option<triad_types::Block>,
    ) {
        let (segment, catch_up_info) = engine.chain_segment_for(last_block.as_ref());
        let number = chain.last_number();
        if let Err(e) = dispatcher
            .send_chain_segment(&peer, segment, number, catch_up_info)
            .await
        {
            debug!(peer = %peer, error = %e, "segment response not delivered");
        }
    }

    /// This node's validator address.
    pub fn address(&self) -> triad_types::Address {
        triad_types::Address::from(self.key.address())
    }
}
