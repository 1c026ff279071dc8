//! Main transaction pool implementation.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, trace};

use triad_statedb::DatabaseView;
use triad_types::{Address, Block, H256, Transaction};

/// Pool capacity configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of transactions in the pool
    pub max_size: usize,
    /// Maximum queued transactions per account
    pub max_per_account: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_per_account: 64,
        }
    }
}

/// Outcome of [`TransactionPool::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    /// The transaction entered the pool
    Accepted,
    /// The transaction hash is already tracked
    Duplicate,
    /// The global pool is at capacity
    PoolFull,
    /// The sender's queue is at capacity
    PerAccountFull,
    /// The transaction failed structural or signature checks
    NotEligible,
}

#[derive(Default)]
struct Inner {
    /// Global fingerprint set for O(1) dedup
    tracker: HashSet<H256>,
    /// Nonce-ordered queues per account
    ordered: HashMap<Address, BTreeMap<i64, Transaction>>,
    /// Timestamp-ordered unordered lane per account; the hash breaks
    /// timestamp ties deterministically
    unordered: HashMap<Address, BTreeMap<(u64, H256), Transaction>>,
    total: usize,
}

impl Inner {
    fn account_len(&self, addr: &Address) -> usize {
        self.ordered.get(addr).map(|q| q.len()).unwrap_or(0)
            + self.unordered.get(addr).map(|q| q.len()).unwrap_or(0)
    }

    fn remove_hash(&mut self, addr: &Address, hash: &H256) {
        if !self.tracker.remove(hash) {
            return;
        }
        self.total -= 1;
        if let Some(q) = self.ordered.get_mut(addr) {
            q.retain(|_, tx| tx.hash != *hash);
            if q.is_empty() {
                self.ordered.remove(addr);
            }
        }
        if let Some(q) = self.unordered.get_mut(addr) {
            q.retain(|_, tx| tx.hash != *hash);
            if q.is_empty() {
                self.unordered.remove(addr);
            }
        }
    }
}

/// The transaction pool.
pub struct TransactionPool {
    inner: RwLock<Inner>,
    config: PoolConfig,
}

impl TransactionPool {
    /// Creates a pool with the given capacity bounds.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            config,
        }
    }

    /// Admits a transaction, reporting why when it does not enter.
    pub fn admit(&self, tx: Transaction) -> AdmitDecision {
        if tx.verify().is_err() {
            return AdmitDecision::NotEligible;
        }

        let mut inner = self.inner.write();
        if inner.tracker.contains(&tx.hash) {
            return AdmitDecision::Duplicate;
        }
        if inner.total >= self.config.max_size {
            return AdmitDecision::PoolFull;
        }
        if inner.account_len(&tx.address) >= self.config.max_per_account {
            return AdmitDecision::PerAccountFull;
        }

        trace!(tx = %tx.hash.short(), from = %tx.address, "admitted transaction");
        inner.tracker.insert(tx.hash);
        inner.total += 1;
        if tx.is_nonce_ordered() {
            inner
                .ordered
                .entry(tx.address)
                .or_default()
                .insert(tx.tx_body.nonce, tx);
        } else {
            inner
                .unordered
                .entry(tx.address)
                .or_default()
                .insert((tx.tx_body.timestamp, tx.hash), tx);
        }
        AdmitDecision::Accepted
    }

    /// Whether a transaction hash is tracked.
    pub fn has(&self, hash: &H256) -> bool {
        self.inner.read().tracker.contains(hash)
    }

    /// Number of tracked transactions.
    pub fn size(&self) -> usize {
        self.inner.read().total
    }

    /// Transactions eligible for the next block, in
    /// `(nonce ascending per account, timestamp ascending)` order.
    ///
    /// An ordered transaction is eligible only as part of a gap-free nonce
    /// run starting at the account's current nonce; `chain_context` filters
    /// transactions already included on the branch being extended.
    pub fn valid_transactions(
        &self,
        chain_context: &HashSet<H256>,
        view: &DatabaseView,
    ) -> Vec<Transaction> {
        let inner = self.inner.read();

        // Per-account candidate runs, nonce order first.
        let mut runs: Vec<Vec<Transaction>> = Vec::new();
        let mut accounts: Vec<&Address> = inner
            .ordered
            .keys()
            .chain(inner.unordered.keys())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        accounts.sort();

        for addr in accounts {
            let (account_nonce, account_ts) = view
                .get_account_nonce_and_timestamp(addr)
                .unwrap_or((0, 0));

            let mut run: Vec<Transaction> = Vec::new();
            if let Some(queue) = inner.ordered.get(addr) {
                let mut expected = account_nonce;
                for (nonce, tx) in queue.range(account_nonce..) {
                    if *nonce != expected {
                        break;
                    }
                    if !chain_context.contains(&tx.hash) {
                        run.push(tx.clone());
                    }
                    expected += 1;
                }
            }
            if let Some(queue) = inner.unordered.get(addr) {
                for ((ts, _), tx) in queue.iter() {
                    if *ts > account_ts && !chain_context.contains(&tx.hash) {
                        run.push(tx.clone());
                    }
                }
            }
            if !run.is_empty() {
                runs.push(run);
            }
        }

        // K-way merge by (timestamp, hash), preserving each run's order so
        // nonces stay ascending per account.
        let mut cursors: Vec<usize> = vec![0; runs.len()];
        let mut out = Vec::new();
        loop {
            let mut best: Option<(usize, u64, H256)> = None;
            for (i, run) in runs.iter().enumerate() {
                if let Some(tx) = run.get(cursors[i]) {
                    let key = (tx.timestamp(), tx.hash);
                    match best {
                        Some((_, ts, hash)) if (key.0, key.1) >= (ts, hash) => {}
                        _ => best = Some((i, key.0, key.1)),
                    }
                }
            }
            match best {
                Some((i, _, _)) => {
                    out.push(runs[i][cursors[i]].clone());
                    cursors[i] += 1;
                }
                None => break,
            }
        }
        out
    }

    /// Drops transactions that failed execution.
    pub fn remove_invalid(&self, txs: &[Transaction]) {
        let mut inner = self.inner.write();
        for tx in txs {
            inner.remove_hash(&tx.address, &tx.hash);
        }
        debug!(removed = txs.len(), remaining = inner.total, "removed invalid transactions");
    }

    /// Prunes the pool when a block finalizes: every included transaction is
    /// dropped, along with ordered transactions the included nonces made
    /// unexecutable.
    pub fn clean_up_for_new_block(&self, block: &Block) {
        let mut inner = self.inner.write();
        for tx in &block.transactions {
            inner.remove_hash(&tx.address, &tx.hash);
            if tx.is_nonce_ordered() {
                let stale: Vec<(i64, H256)> = inner
                    .ordered
                    .get(&tx.address)
                    .map(|q| {
                        q.range(..=tx.tx_body.nonce)
                            .map(|(n, t)| (*n, t.hash))
                            .collect()
                    })
                    .unwrap_or_default();
                for (_, hash) in stale {
                    inner.remove_hash(&tx.address, &hash);
                }
            }
        }
        debug!(
            block = block.number,
            remaining = inner.total,
            "pruned pool for finalized block"
        );
    }
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
