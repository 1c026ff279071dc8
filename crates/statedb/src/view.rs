//! Transaction execution views.
//!
//! A [`DatabaseView`] is bound to one state version and one block number.
//! It executes transactions against the version's tree: nonce and timestamp
//! admission, rule/owner checks per leaf write, then the writes themselves.
//! A failed transaction leaves the version untouched; a successful one
//! writes the new root back through the version manager.
//!
//! The version tree has four top-level namespaces - `values`, `rules`,
//! `owners`, `functions` - one per operation kind. Account bookkeeping
//! (nonce, last unordered timestamp) lives under `values/accounts/<addr>`.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use triad_types::{Address, H256, Operation, Stake, Transaction};

use crate::rules::{staking_balance, RuleEngine, RuleViolation, WriteContext, WriteKind};
use crate::tree::{split_path, StateInfo, StateTree};
use crate::versions::StateVersionManager;
use crate::Result;

/// Upper bound on leaf writes per transaction.
pub const MAX_TX_GAS: u64 = 1_000;

/// Execution result codes. `Success` is 0; everything else names the first
/// check that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ExecCode {
    /// The transaction executed and its writes are applied
    Success = 0,
    /// The operation shape is invalid (e.g. nested SET)
    Malformed = 1,
    /// Ordered nonce does not match the account nonce
    NonceMismatch = 2,
    /// Unordered timestamp is not newer than the account's last
    TimestampStale = 3,
    /// A write rule denied a leaf write
    RuleDenied = 4,
    /// The owner policy denied a leaf write
    OwnerDenied = 5,
    /// A function hook failed
    FunctionFailed = 6,
    /// The transaction exceeds the per-transaction gas bound
    GasExceeded = 7,
    /// A capacity bound was hit
    PoolFull = 8,
}

/// Outcome of executing a single transaction.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Result code; 0 on success
    pub code: ExecCode,
    /// Failure detail, absent on success
    pub error_message: Option<String>,
    /// Number of leaf writes performed (or that would have been)
    pub gas_amount: u64,
    /// `gas_amount * gas_price`
    pub gas_cost: u64,
}

impl ExecResult {
    fn success(gas_amount: u64, gas_cost: u64) -> Self {
        Self {
            code: ExecCode::Success,
            error_message: None,
            gas_amount,
            gas_cost,
        }
    }

    fn failure(code: ExecCode, message: impl Into<String>) -> Self {
        Self {
            code,
            error_message: Some(message.into()),
            gas_amount: 0,
            gas_cost: 0,
        }
    }

    /// Whether the transaction executed.
    pub fn is_success(&self) -> bool {
        self.code == ExecCode::Success
    }
}

impl fmt::Display for ExecResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_message {
            Some(msg) => write!(f, "{:?}: {}", self.code, msg),
            None => write!(f, "{:?} (gas {})", self.code, self.gas_amount),
        }
    }
}

/// A view over one state version at one block number.
///
/// The view trusts the carried `tx.address` - signature verification happens
/// once at the admission boundary (pool, block validation), not on every
/// replay.
pub struct DatabaseView {
    mgr: Arc<StateVersionManager>,
    version: String,
    block_number: u64,
    rules: Arc<dyn RuleEngine>,
    backup: Mutex<Option<StateTree>>,
}

impl DatabaseView {
    /// Binds a view to a version.
    pub fn new(
        mgr: Arc<StateVersionManager>,
        version: impl Into<String>,
        block_number: u64,
        rules: Arc<dyn RuleEngine>,
    ) -> Self {
        Self {
            mgr,
            version: version.into(),
            block_number,
            rules,
            backup: Mutex::new(None),
        }
    }

    /// The version this view writes to.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The block number transactions execute under.
    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    fn tree(&self) -> Result<StateTree> {
        self.mgr
            .get_root(&self.version)
            .ok_or_else(|| crate::StateDbError::UnknownVersion(self.version.clone()))
    }

    /// Executes one transaction. On success the writes are visible through
    /// the bound version; on failure the version is unchanged.
    pub fn execute(&self, tx: &Transaction) -> ExecResult {
        let tree = match self.tree() {
            Ok(t) => t,
            Err(e) => return ExecResult::failure(ExecCode::Malformed, e.to_string()),
        };

        let leaves: Vec<&Operation> = tx.tx_body.operation.leaves();
        for leaf in &leaves {
            if matches!(leaf, Operation::Set { .. }) {
                return ExecResult::failure(ExecCode::Malformed, "nested SET operation");
            }
        }
        let gas_amount = leaves.len() as u64;
        if gas_amount > MAX_TX_GAS {
            return ExecResult::failure(
                ExecCode::GasExceeded,
                format!("{} leaf writes exceed the bound of {}", gas_amount, MAX_TX_GAS),
            );
        }

        // Nonce / timestamp admission against the account record.
        let (account_nonce, account_timestamp) = read_account(&tree, &tx.address);
        if tx.is_nonce_ordered() {
            if tx.tx_body.nonce != account_nonce {
                return ExecResult::failure(
                    ExecCode::NonceMismatch,
                    format!(
                        "nonce {} does not match account nonce {}",
                        tx.tx_body.nonce, account_nonce
                    ),
                );
            }
        } else if tx.tx_body.timestamp <= account_timestamp {
            return ExecResult::failure(
                ExecCode::TimestampStale,
                format!(
                    "timestamp {} is not newer than account timestamp {}",
                    tx.tx_body.timestamp, account_timestamp
                ),
            );
        }

        // Apply leaves to a working copy; the version is only updated if
        // every leaf passes its rule check.
        let mut working = tree.clone();
        for leaf in &leaves {
            let (kind, ref_path, value) = match leaf {
                Operation::SetValue { ref_path, value } => (WriteKind::Value, ref_path, value),
                Operation::SetRule { ref_path, value } => (WriteKind::Rule, ref_path, value),
                Operation::SetFunction { ref_path, value } => {
                    (WriteKind::Function, ref_path, value)
                }
                Operation::SetOwner { ref_path, value } => (WriteKind::Owner, ref_path, value),
                Operation::Set { .. } => unreachable!("nested SET rejected above"),
            };
            let path = split_path(ref_path);
            let values_ns = working.subtree(&ns_path("values"));
            let owners_ns = working.subtree(&ns_path("owners"));
            let ctx = WriteContext {
                kind,
                path: &path,
                value,
                signer: tx.address,
                block_number: self.block_number,
                values: &values_ns,
                owners: &owners_ns,
            };
            if let Err(violation) = self.rules.check_write(&ctx) {
                let code = match violation {
                    RuleViolation::RuleDenied { .. } => ExecCode::RuleDenied,
                    RuleViolation::OwnerDenied { .. } => ExecCode::OwnerDenied,
                    RuleViolation::FunctionFailed { .. } => ExecCode::FunctionFailed,
                };
                trace!(tx = %tx.hash.short(), %violation, "write rejected");
                return ExecResult::failure(code, violation.to_string());
            }
            let mut full_path = ns_path(namespace(kind));
            full_path.extend(path);
            working = working.set(&full_path, value.clone());
        }

        // Account bookkeeping.
        let mut account = vec!["values".to_string(), "accounts".to_string(), tx.address.to_hex()];
        if tx.is_nonce_ordered() {
            account.push("nonce".to_string());
            working = working.set(&account, json!(account_nonce + 1));
        } else {
            account.push("timestamp".to_string());
            working = working.set(&account, json!(tx.tx_body.timestamp));
        }

        let gas_cost = gas_amount.saturating_mul(tx.tx_body.gas_price.unwrap_or(0));
        if let Err(e) = self.mgr.set_root(&self.version, working) {
            return ExecResult::failure(ExecCode::Malformed, e.to_string());
        }
        ExecResult::success(gas_amount, gas_cost)
    }

    /// Applies transactions in order; returns `false` as soon as one fails.
    /// Callers needing per-transaction atomicity wrap each in
    /// [`Self::backup`] / [`Self::restore`].
    pub fn execute_list(&self, txs: &[Transaction]) -> bool {
        for tx in txs {
            let result = self.execute(tx);
            if !result.is_success() {
                trace!(tx = %tx.hash.short(), %result, "execute_list aborted");
                return false;
            }
        }
        true
    }

    /// Snapshots the current tree for a later [`Self::restore`].
    pub fn backup(&self) -> Result<()> {
        let tree = self.tree()?;
        *self.backup.lock() = Some(tree);
        Ok(())
    }

    /// Restores the last [`Self::backup`]. No-op when none was taken.
    pub fn restore(&self) -> Result<()> {
        if let Some(tree) = self.backup.lock().take() {
            self.mgr.set_root(&self.version, tree)?;
        }
        Ok(())
    }

    /// Merkle-style digest at `path` (`"/"` for the whole state).
    pub fn state_proof(&self, path: &str) -> Result<H256> {
        let tree = self.tree()?;
        let segments = split_path(path);
        Ok(if segments.is_empty() {
            tree.proof_hash()
        } else {
            tree.proof_hash_at(&segments)
        })
    }

    /// Size and shape information at `path`.
    pub fn state_info(&self, path: &str) -> Result<Option<StateInfo>> {
        let tree = self.tree()?;
        Ok(tree.info(&split_path(path)))
    }

    /// Reads a value from the `values` namespace.
    pub fn get_value(&self, path: &str) -> Result<Option<Value>> {
        let tree = self.tree()?;
        let mut full = ns_path("values");
        full.extend(split_path(path));
        Ok(tree.get(&full))
    }

    /// The account's ordered nonce and last unordered timestamp.
    pub fn get_account_nonce_and_timestamp(&self, addr: &Address) -> Result<(i64, u64)> {
        let tree = self.tree()?;
        Ok(read_account(&tree, addr))
    }

    /// The staking balance summed for validator weight.
    pub fn get_staking_balance(&self, addr: &Address) -> Result<Stake> {
        let tree = self.tree()?;
        Ok(staking_balance(&tree.subtree(&ns_path("values")), addr))
    }
}

fn ns_path(ns: &str) -> Vec<String> {
    vec![ns.to_string()]
}

fn namespace(kind: WriteKind) -> &'static str {
    match kind {
        WriteKind::Value => "values",
        WriteKind::Rule => "rules",
        WriteKind::Function => "functions",
        WriteKind::Owner => "owners",
    }
}

fn read_account(tree: &StateTree, addr: &Address) -> (i64, u64) {
    let base = vec!["values".to_string(), "accounts".to_string(), addr.to_hex()];
    let mut nonce_path = base.clone();
    nonce_path.push("nonce".to_string());
    let nonce = tree
        .get(&nonce_path)
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let mut ts_path = base;
    ts_path.push("timestamp".to_string());
    let timestamp = tree.get(&ts_path).and_then(|v| v.as_u64()).unwrap_or(0);
    (nonce, timestamp)
}
