//! The consensus engine.
//!
//! One engine instance drives one validator. The node feeds it epoch ticks
//! and inbound consensus messages; the engine emits broadcasts, catch-up
//! requests and finalization notices over its outbound channel. All
//! receive-path errors are returned to the caller, which logs and drops -
//! nothing on the receive path is allowed to escape the handler.
//!
//! State-version discipline: every pool block owns the version produced by
//! replaying it on top of its predecessor (`last_votes`, then transactions -
//! the proposal record itself lands when a child replays it). Verification
//! forks temp versions that release themselves on every early return.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use triad_chain::Blockchain;
use triad_crypto::PrivateKey;
use triad_mempool::TransactionPool;
use triad_statedb::{
    split_path, staking_deposit_path, DatabaseView, RuleEngine, StateVersionManager,
};
use triad_types::{Address, Block, H256, Stake, Transaction};

use crate::block_pool::BlockPool;
use crate::epoch::EpochClock;
use crate::proposer::select_proposer;
use crate::types::{
    build_proposal_tx, build_vote_tx, parse_proposal, BlockInfo, CatchUpEntry, ConsensusMessage,
    EngineStatus, NodeStatus,
};
use crate::{ConsensusError, Result};

/// Engine tuning knobs, lifted from the node configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum validator count for a proposal to be acceptable
    pub min_num_validators: usize,
    /// Consensus record retention window
    pub max_consensus_states: u64,
    /// Compare replayed state proof hashes against headers
    pub strict_state_proof: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_num_validators: 3,
            max_consensus_states: 10,
            strict_state_proof: true,
        }
    }
}

/// Events the engine emits toward the node.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Broadcast a consensus message to all peers
    Broadcast(ConsensusMessage),
    /// Ask every outbound peer for chain segments past our tip
    RequestChainSegments {
        /// Our current finalized tip, sent with the request
        last_block: Block,
    },
    /// A block was finalized (reporter hook)
    Finalized(Block),
}

/// Seeds the genesis state version (`final:0`): whitelist membership and
/// staking deposits for every genesis validator. Returns the genesis block.
pub fn bootstrap_genesis(
    mgr: &Arc<StateVersionManager>,
    whitelist: &BTreeMap<Address, Stake>,
    timestamp: u64,
) -> Result<Block> {
    mgr.clone_version("", "final:0")?;
    let mut tree = mgr
        .get_root("final:0")
        .ok_or_else(|| ConsensusError::Internal("genesis version vanished".into()))?;
    for (addr, stake) in whitelist {
        let mut whitelist_path = split_path("/values/consensus/whitelist");
        whitelist_path.push(addr.to_hex());
        tree = tree.set(&whitelist_path, serde_json::json!(true));

        let mut deposit = split_path("/values");
        deposit.extend(staking_deposit_path(addr));
        tree = tree.set(&deposit, serde_json::json!(stake));
    }
    mgr.set_root("final:0", tree)?;
    mgr.finalize("final:0")?;
    Ok(Block::genesis(whitelist.clone(), timestamp)?)
}

/// The consensus engine.
pub struct ConsensusEngine {
    config: EngineConfig,
    key: PrivateKey,
    address: Address,
    mgr: Arc<StateVersionManager>,
    rules: Arc<dyn RuleEngine>,
    chain: Arc<Blockchain>,
    tx_pool: Arc<TransactionPool>,
    block_pool: Arc<BlockPool>,
    clock: Arc<EpochClock>,
    status: RwLock<EngineStatus>,
    node_status: Arc<RwLock<NodeStatus>>,
    outbound: mpsc::Sender<EngineEvent>,
    current_epoch: AtomicU64,
    last_tx_ts: AtomicU64,
}

impl ConsensusEngine {
    /// Wires up an engine. The engine starts in `Starting`; call
    /// [`Self::init`] once the node finishes booting.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        key: PrivateKey,
        mgr: Arc<StateVersionManager>,
        rules: Arc<dyn RuleEngine>,
        chain: Arc<Blockchain>,
        tx_pool: Arc<TransactionPool>,
        block_pool: Arc<BlockPool>,
        clock: Arc<EpochClock>,
        node_status: Arc<RwLock<NodeStatus>>,
        outbound: mpsc::Sender<EngineEvent>,
    ) -> Self {
        let address = Address::from(key.address());
        Self {
            config,
            key,
            address,
            mgr,
            rules,
            chain,
            tx_pool,
            block_pool,
            clock,
            status: RwLock::new(EngineStatus::Starting),
            node_status,
            outbound,
            current_epoch: AtomicU64::new(0),
            last_tx_ts: AtomicU64::new(0),
        }
    }

    /// Transitions the engine to `Running`.
    pub fn init(&self) {
        *self.status.write() = EngineStatus::Running;
        info!(address = %self.address, "consensus engine running");
    }

    /// Stops the engine; the epoch tick becomes a no-op.
    pub fn stop(&self) {
        *self.status.write() = EngineStatus::Stopped;
        info!(address = %self.address, "consensus engine stopped");
    }

    /// Current engine status.
    pub fn status(&self) -> EngineStatus {
        *self.status.read()
    }

    /// This validator's address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The epoch the engine last acted in.
    pub fn epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::SeqCst)
    }

    fn serving(&self) -> bool {
        *self.status.read() == EngineStatus::Running
            && *self.node_status.read() == NodeStatus::Serving
    }

    /// Monotonically increasing transaction timestamp: consecutive
    /// unordered transactions from this key must not share a millisecond.
    fn next_tx_timestamp(&self) -> u64 {
        let now = self.clock.now_ms();
        let mut prev = self.last_tx_ts.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self.last_tx_ts.compare_exchange(
                prev,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// One epoch tick: finalize what can be finalized, refresh the clock
    /// adjustment, and propose when elected.
    pub async fn on_epoch_tick(&self) {
        if !self.serving() {
            trace!("epoch tick ignored while not serving");
            return;
        }

        if let Err(e) = self.try_finalize().await {
            error!(error = %e, "finalization halted this tick");
        }

        let epoch = self.clock.current_epoch();
        self.clock.maybe_probe(epoch);

        let previous = self.current_epoch.swap(epoch, Ordering::SeqCst);
        if epoch == previous {
            return;
        }
        if previous + 1 < epoch {
            debug!(previous, epoch, "merged late epoch tick");
        }
        if !self.block_pool.has_voted_at(previous) {
            debug!(epoch = previous, "previous epoch closed without our vote");
        }

        let (tip_block, _) = self.tip();
        let proposer = select_proposer(&tip_block.validators, &tip_block.last_votes_hash(), epoch);
        trace!(epoch, proposer = ?proposer, "epoch proposer");
        if proposer == Some(self.address) && !self.block_pool.has_voted_at(epoch) {
            if let Err(e) = self.propose(epoch).await {
                warn!(epoch, error = %e, "proposal attempt aborted");
            }
        }
    }

    /// The block and state version the next proposal extends: the tip of
    /// the longest notarized chain, or the finalized root.
    fn tip(&self) -> (Block, Option<BlockInfo>) {
        match self.block_pool.longest_notarized_tip() {
            Some(info) => (info.block.clone(), Some(info)),
            None => (self.block_pool.root(), None),
        }
    }

    async fn propose(&self, epoch: u64) -> Result<()> {
        let (block, proposal_tx) = self.construct_proposal(epoch)?;
        info!(
            number = block.number,
            epoch,
            hash = %block.hash.short(),
            txs = block.transactions.len(),
            "proposing block"
        );
        self.send(EngineEvent::Broadcast(ConsensusMessage::Proposal {
            block: block.clone(),
            proposal_tx: proposal_tx.clone(),
        }))
        .await;
        // Self-delivery runs the full verification path, registers the
        // block's state version and casts our vote.
        self.handle_proposal(block, proposal_tx).await
    }

    /// Builds a block extending the longest notarized chain. The temp
    /// version used here is discarded; self-delivery re-derives the state.
    pub fn construct_proposal(&self, epoch: u64) -> Result<(Block, Transaction)> {
        let (tip_block, tip_info) = self.tip();
        if tip_block.epoch >= epoch {
            return Err(ConsensusError::Stale(format!(
                "tip epoch {} has reached epoch {}",
                tip_block.epoch, epoch
            )));
        }
        let last_votes = tip_info
            .as_ref()
            .map(|i| i.last_votes_for_child())
            .unwrap_or_default();
        let base_version = self.version_of(&tip_block)?;
        let number = tip_block.number + 1;

        let temp = self.mgr.clone_to_temp(&base_version, "propose")?;
        let view = DatabaseView::new(
            Arc::clone(&self.mgr),
            temp.name(),
            number,
            Arc::clone(&self.rules),
        );

        if !view.execute_list(&last_votes) {
            return Err(ConsensusError::Internal(
                "carried last_votes failed to execute".into(),
            ));
        }

        // Transactions already included on the branch being extended.
        let mut chain_context: HashSet<H256> = HashSet::new();
        for hash in self.block_pool.extending_chain(&tip_block.hash) {
            if let Some(info) = self.block_pool.get(&hash) {
                chain_context.extend(info.block.transactions.iter().map(|tx| tx.hash));
            }
        }

        let candidates = self.tx_pool.valid_transactions(&chain_context, &view);
        let mut included = Vec::new();
        let mut invalid = Vec::new();
        let mut gas_amount_total = 0u64;
        let mut gas_cost_total = 0u64;
        for tx in candidates {
            if view.backup().is_err() {
                break;
            }
            let result = view.execute(&tx);
            if result.is_success() {
                gas_amount_total += result.gas_amount;
                gas_cost_total += result.gas_cost;
                included.push(tx);
            } else {
                trace!(tx = %tx.hash.short(), %result, "dropping failing transaction");
                let _ = view.restore();
                invalid.push(tx);
            }
        }
        if !invalid.is_empty() {
            self.tx_pool.remove_invalid(&invalid);
        }

        let state_proof_hash = if self.config.strict_state_proof {
            Some(view.state_proof("/")?)
        } else {
            None
        };
        let validators = self.validator_snapshot(&view, &tip_block);

        let block = Block::new(
            number,
            epoch,
            self.next_tx_timestamp(),
            tip_block.hash,
            self.address,
            validators,
            included,
            last_votes,
            gas_amount_total,
            gas_cost_total,
            state_proof_hash,
        )?;
        let proposal_tx = build_proposal_tx(
            &self.key,
            &block,
            self.config.max_consensus_states,
            self.next_tx_timestamp(),
        )?;
        Ok((block, proposal_tx))
    }

    /// The validator snapshot for a new block: whitelisted addresses with a
    /// positive staking balance, read from the branch state. Falls back to
    /// the extended block's snapshot when the whitelist subtree is empty.
    fn validator_snapshot(&self, view: &DatabaseView, tip: &Block) -> BTreeMap<Address, Stake> {
        let mut out = BTreeMap::new();
        let listed = match self.mgr.get_root(view.version()) {
            Some(tree) => tree
                .subtree(&split_path("/values/consensus/whitelist"))
                .children(&[]),
            None => Vec::new(),
        };
        for entry in listed {
            if let Ok(addr) = Address::from_str(&entry) {
                let whitelisted = view
                    .get_value(&format!("/consensus/whitelist/{}", entry))
                    .ok()
                    .flatten()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if !whitelisted {
                    continue;
                }
                if let Ok(stake) = view.get_staking_balance(&addr) {
                    if stake > 0 {
                        out.insert(addr, stake);
                    }
                }
            }
        }
        if out.is_empty() {
            return tip.validators.clone();
        }
        out
    }

    /// The state version name backing a block: the finalized version for
    /// the pool root, the registered version for pool blocks.
    fn version_of(&self, block: &Block) -> Result<String> {
        if block.hash == self.block_pool.root().hash {
            return self
                .mgr
                .final_version()
                .ok_or_else(|| ConsensusError::Internal("no finalized version".into()));
        }
        self.block_pool.state_version(&block.hash).ok_or_else(|| {
            ConsensusError::Internal(format!(
                "no state version for pool block {}",
                block.hash.short()
            ))
        })
    }

    /// Full verification ladder for an incoming proposal. On success the
    /// block enters the pool with its replayed state version, and the
    /// engine votes if it holds stake and has not voted this epoch.
    pub async fn handle_proposal(&self, block: Block, proposal_tx: Transaction) -> Result<()> {
        if !self.serving() {
            return Err(ConsensusError::NotReady("proposal ignored".into()));
        }

        proposal_tx.verify()?;
        let parsed = parse_proposal(&proposal_tx)?;
        if parsed.block_hash != block.hash {
            return Err(ConsensusError::Malformed(
                "proposal record does not match block hash".into(),
            ));
        }
        if parsed.number != block.number || parsed.proposer != block.proposer {
            return Err(ConsensusError::Malformed(
                "proposal record disagrees with block header".into(),
            ));
        }
        if proposal_tx.address != block.proposer {
            return Err(ConsensusError::Unauthorized(
                "proposal not signed by its proposer".into(),
            ));
        }
        block.validate_basic()?;

        if self.block_pool.has_seen_block(&block.hash) {
            return Err(ConsensusError::Duplicate(format!(
                "block {} already seen",
                block.hash.short()
            )));
        }
        // First-wins per (proposer, epoch): a second, different proposal
        // from the same proposer at the same epoch is a duplicate.
        if !self
            .block_pool
            .proposals_at_epoch(block.epoch, &block.proposer)
            .is_empty()
        {
            return Err(ConsensusError::Duplicate(format!(
                "proposer {} already proposed at epoch {}",
                block.proposer, block.epoch
            )));
        }

        let finalized_number = self.chain.last_number();
        if block.number <= finalized_number {
            debug!(
                number = block.number,
                finalized = finalized_number,
                "recorded proposal at or below the finalized number"
            );
            return Ok(());
        }

        let (tip_block, _) = self.tip();
        if block.number > tip_block.number + 1 {
            self.request_catch_up().await;
            return Err(ConsensusError::OutOfSync(format!(
                "proposal number {} is past our notarized tip {}",
                block.number, tip_block.number
            )));
        }

        let prev = match self.lookup_block(&block.last_hash) {
            Some(prev) => prev,
            None => {
                self.request_catch_up().await;
                return Err(ConsensusError::OutOfSync(format!(
                    "unknown predecessor {}",
                    block.last_hash.short()
                )));
            }
        };

        // Fold the carried votes into the predecessor before any staleness
        // verdict: even a proposal rejected below may carry the evidence
        // that notarizes its predecessor.
        self.ensure_predecessor_notarized(&block, &prev)?;

        if prev.epoch >= block.epoch {
            return Err(ConsensusError::Stale(format!(
                "epoch {} does not increase over predecessor epoch {}",
                block.epoch, prev.epoch
            )));
        }
        if block.epoch < self.current_epoch.load(Ordering::SeqCst) {
            return Err(ConsensusError::Stale(format!(
                "proposal epoch {} is behind current epoch {}",
                block.epoch,
                self.current_epoch.load(Ordering::SeqCst)
            )));
        }

        let expected =
            select_proposer(&prev.validators, &prev.last_votes_hash(), block.epoch);
        if expected != Some(block.proposer) {
            return Err(ConsensusError::Unauthorized(format!(
                "expected proposer {:?} at epoch {}, got {}",
                expected, block.epoch, block.proposer
            )));
        }
        if block.validators.len() < self.config.min_num_validators {
            return Err(ConsensusError::Unauthorized(format!(
                "{} validators is below the minimum {}",
                block.validators.len(),
                self.config.min_num_validators
            )));
        }

        // Replay the block on a temp fork of the predecessor state.
        let prev_version = self.version_of(&prev)?;
        let temp = self.mgr.clone_to_temp(&prev_version, "verify")?;
        let view = DatabaseView::new(
            Arc::clone(&self.mgr),
            temp.name(),
            block.number,
            Arc::clone(&self.rules),
        );
        if !view.execute_list(&block.last_votes) {
            return Err(ConsensusError::Inconsistent(
                "carried last_votes failed to replay".into(),
            ));
        }
        let mut gas_amount_total = 0u64;
        let mut gas_cost_total = 0u64;
        for tx in &block.transactions {
            let result = view.execute(tx);
            if !result.is_success() {
                return Err(ConsensusError::Inconsistent(format!(
                    "transaction {} failed to replay: {}",
                    tx.hash.short(),
                    result
                )));
            }
            gas_amount_total += result.gas_amount;
            gas_cost_total += result.gas_cost;
        }
        if gas_amount_total != block.gas_amount_total || gas_cost_total != block.gas_cost_total {
            return Err(ConsensusError::Inconsistent(format!(
                "gas totals mismatch: replayed ({}, {}), header ({}, {})",
                gas_amount_total, gas_cost_total, block.gas_amount_total, block.gas_cost_total
            )));
        }
        if self.config.strict_state_proof {
            let computed = view.state_proof("/")?;
            if block.state_proof_hash != Some(computed) {
                return Err(ConsensusError::Inconsistent(format!(
                    "state proof mismatch: computed {}",
                    computed.short()
                )));
            }
        }

        // The proposal record must execute on top of the replayed state,
        // but the stored version excludes it: the record lands when a child
        // replays this block's proposal in its last_votes.
        view.backup()?;
        let proposal_result = view.execute(&proposal_tx);
        if !proposal_result.is_success() {
            return Err(ConsensusError::Inconsistent(format!(
                "proposal record failed to execute: {}",
                proposal_result
            )));
        }
        view.restore()?;

        let version_name = format!("block:{}", block.hash.to_hex());
        temp.promote(&version_name)?;
        if !self.block_pool.add_seen_block(block.clone(), proposal_tx) {
            // Lost a race with an identical delivery; drop our version.
            let _ = self.mgr.delete(&version_name);
            return Err(ConsensusError::Duplicate(format!(
                "block {} raced into the pool",
                block.hash.short()
            )));
        }
        self.block_pool.register_state(block.hash, version_name);
        debug!(number = block.number, epoch = block.epoch, hash = %block.hash.short(), "accepted proposal");

        if block.validators.contains_key(&self.address)
            && !self.block_pool.has_voted_at(block.epoch)
        {
            self.vote_for(&block).await?;
        }
        Ok(())
    }

    /// A predecessor that is not yet notarized gets one chance: the carried
    /// `last_votes` are replayed on its own state and folded into its
    /// tally. Failing to cross two thirds rejects the proposal.
    fn ensure_predecessor_notarized(&self, block: &Block, prev: &Block) -> Result<()> {
        if prev.is_genesis() || prev.hash == self.block_pool.root().hash {
            return Ok(());
        }
        let info = self.block_pool.get(&prev.hash).ok_or_else(|| {
            ConsensusError::Internal("predecessor vanished from pool".into())
        })?;
        if info.notarized {
            return Ok(());
        }

        let prev_version = self.version_of(prev)?;
        let temp = self.mgr.clone_to_temp(&prev_version, "notarize")?;
        let view = DatabaseView::new(
            Arc::clone(&self.mgr),
            temp.name(),
            prev.number,
            Arc::clone(&self.rules),
        );
        if !view.execute_list(&block.last_votes) {
            return Err(ConsensusError::Inconsistent(
                "predecessor notarization votes failed to execute".into(),
            ));
        }
        drop(temp);

        for vote in &block.last_votes {
            self.block_pool.add_seen_vote(vote.clone());
        }
        let info = self
            .block_pool
            .get(&prev.hash)
            .ok_or_else(|| ConsensusError::Internal("predecessor vanished from pool".into()))?;
        if !info.notarized {
            return Err(ConsensusError::Unauthorized(format!(
                "predecessor {} not notarized (tally {} of {})",
                prev.hash.short(),
                info.tally,
                prev.total_stake()
            )));
        }
        Ok(())
    }

    /// Verifies an incoming vote by executing it on a temp fork of the
    /// voted block's state. Valid votes are admitted to the pool and
    /// rebroadcast.
    pub async fn handle_vote(&self, vote_tx: Transaction) -> Result<()> {
        if !self.serving() {
            return Err(ConsensusError::NotReady("vote ignored".into()));
        }
        vote_tx.verify()?;
        let parsed = crate::types::parse_vote(&vote_tx)?;
        if parsed.voter != vote_tx.address {
            return Err(ConsensusError::Unauthorized(
                "vote path does not match its signer".into(),
            ));
        }

        let info = match self.block_pool.get(&parsed.block_hash) {
            Some(info) => info,
            None => {
                if parsed.block_hash == self.block_pool.root().hash
                    || self.chain.has_block(&parsed.block_hash)
                {
                    // Late vote for an already finalized block.
                    return Ok(());
                }
                // Park it; it is folded in when the block arrives.
                trace!(hash = %parsed.block_hash.short(), "parking early vote");
                self.block_pool.add_seen_vote(vote_tx);
                return Ok(());
            }
        };
        if info.has_vote_from(&vote_tx.address) {
            return Err(ConsensusError::Duplicate(format!(
                "validator {} already voted for {}",
                vote_tx.address,
                parsed.block_hash.short()
            )));
        }
        if parsed.number != info.block.number {
            return Err(ConsensusError::Malformed(
                "vote number disagrees with the voted block".into(),
            ));
        }

        let version = self.version_of(&info.block)?;
        let temp = self.mgr.clone_to_temp(&version, "vote")?;
        let view = DatabaseView::new(
            Arc::clone(&self.mgr),
            temp.name(),
            info.block.number,
            Arc::clone(&self.rules),
        );
        let result = view.execute(&vote_tx);
        drop(temp);
        if !result.is_success() {
            return Err(ConsensusError::Unauthorized(format!(
                "vote failed to execute: {}",
                result
            )));
        }

        self.block_pool.add_seen_vote(vote_tx.clone());
        self.send(EngineEvent::Broadcast(ConsensusMessage::Vote { vote_tx }))
            .await;
        Ok(())
    }

    /// Casts this node's vote for a freshly accepted block.
    async fn vote_for(&self, block: &Block) -> Result<()> {
        let stake = match block.validators.get(&self.address) {
            Some(stake) => *stake,
            None => return Ok(()),
        };
        if !self.block_pool.record_epoch_vote(block.epoch, block.hash) {
            return Ok(());
        }
        let vote_tx = build_vote_tx(
            &self.key,
            block.number,
            &block.hash,
            stake,
            self.next_tx_timestamp(),
        )?;
        debug!(number = block.number, epoch = block.epoch, hash = %block.hash.short(), "casting vote");
        self.handle_vote(vote_tx).await
    }

    /// Applies the three-chain rule: when the longest notarized chain ends
    /// in three strictly consecutive epochs, everything strictly before the
    /// tip is finalized in number order.
    pub async fn try_finalize(&self) -> Result<()> {
        let chain_entries = self.block_pool.finalizable_chain();
        if chain_entries.len() < 3 {
            return Ok(());
        }
        let finalized_number = self.chain.last_number();
        for info in &chain_entries[..chain_entries.len() - 1] {
            let block = &info.block;
            if block.number <= finalized_number {
                continue;
            }
            // An append failure here is a consistency bug; stop finalizing
            // this tick rather than skipping ahead.
            self.chain.append(block.clone())?;

            let version = self.version_of(block)?;
            let final_name = format!("final:{}", block.number);
            self.mgr.transfer(&version, &final_name)?;
            self.mgr.finalize(&final_name)?;

            self.tx_pool.clean_up_for_new_block(block);
            self.block_pool.clean_up_after_finalization(block);
            info!(number = block.number, epoch = block.epoch, hash = %block.hash.short(), "finalized block");
            self.send(EngineEvent::Finalized(block.clone())).await;
        }
        Ok(())
    }

    /// Serves a catch-up request: a chain segment past the requester's tip
    /// plus our pool entries for DAG reconstruction.
    pub fn chain_segment_for(
        &self,
        requester_tip: Option<&Block>,
    ) -> (Vec<Block>, Vec<CatchUpEntry>) {
        let segment = self.chain.chain_segment(requester_tip);
        let catch_up: Vec<CatchUpEntry> =
            self.block_pool.entries().iter().map(CatchUpEntry::from).collect();
        (segment, catch_up)
    }

    /// Applies a received chain segment: validate linkage, replay the
    /// blocks on a temp fork of the finalized state, then promote it as the
    /// new finalized version. Pool fragments are fed back through the
    /// normal proposal/vote path. Best-effort: failures leave the prior
    /// finalized state intact.
    pub async fn handle_chain_segment(
        &self,
        segment: Vec<Block>,
        catch_up_info: Vec<CatchUpEntry>,
    ) -> Result<()> {
        if !segment.is_empty() {
            self.chain.validate_segment(&segment)?;

            let final_version = self
                .mgr
                .final_version()
                .ok_or_else(|| ConsensusError::Internal("no finalized version".into()))?;
            let temp = self.mgr.clone_to_temp(&final_version, "sync")?;
            for block in &segment {
                let view = DatabaseView::new(
                    Arc::clone(&self.mgr),
                    temp.name(),
                    block.number,
                    Arc::clone(&self.rules),
                );
                if !view.execute_list(&block.last_votes) || !view.execute_list(&block.transactions)
                {
                    return Err(ConsensusError::Inconsistent(format!(
                        "segment block {} failed to replay",
                        block.number
                    )));
                }
                if self.config.strict_state_proof {
                    if let Some(expected) = block.state_proof_hash {
                        let computed = view.state_proof("/")?;
                        if computed != expected {
                            return Err(ConsensusError::Inconsistent(format!(
                                "segment block {} proof mismatch",
                                block.number
                            )));
                        }
                    }
                }
            }

            let head = segment.last().expect("validated non-empty segment").clone();
            for block in segment {
                self.chain.append(block.clone())?;
                self.tx_pool.clean_up_for_new_block(&block);
            }
            let final_name = format!("final:{}", head.number);
            temp.promote(&final_name)?;
            self.mgr.finalize(&final_name)?;
            self.block_pool.clean_up_after_finalization(&head);
            info!(head = head.number, "applied chain segment");
        }

        for entry in catch_up_info {
            if let Some(proposal) = entry.proposal {
                if let Err(e) = self.handle_proposal(entry.block, proposal).await {
                    trace!(error = %e, "catch-up proposal not applied");
                }
            }
            for vote in entry.votes {
                if let Err(e) = self.handle_vote(vote).await {
                    trace!(error = %e, "catch-up vote not applied");
                }
            }
        }
        Ok(())
    }

    /// Looks up a block by hash: the pool, the pool root, or the chain.
    fn lookup_block(&self, hash: &H256) -> Option<Block> {
        if let Some(info) = self.block_pool.get(hash) {
            return Some(info.block);
        }
        let root = self.block_pool.root();
        if root.hash == *hash {
            return Some(root);
        }
        self.chain.block_by_hash(hash)
    }

    async fn request_catch_up(&self) {
        self.send(EngineEvent::RequestChainSegments {
            last_block: self.chain.last_block(),
        })
        .await;
    }

    async fn send(&self, event: EngineEvent) {
        if let Err(e) = self.outbound.send(event).await {
            error!(error = %e, "engine outbound channel closed");
        }
    }
}
