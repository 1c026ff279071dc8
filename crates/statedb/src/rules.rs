//! Write-rule and owner evaluation.
//!
//! Rule evaluation is a seam: the view asks a [`RuleEngine`] whether a
//! single leaf write is allowed, handing it the signer, the target path and
//! the current values tree. [`ConsensusRules`] is the built-in engine; it
//! hard-codes the consensus-critical paths (votes, proposals, staking) and
//! falls back to a nearest-owner policy everywhere else.

use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

use triad_types::{Address, Stake};

use crate::tree::{split_path, StateTree};

/// The kind of write being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// `SET_VALUE`
    Value,
    /// `SET_RULE`
    Rule,
    /// `SET_FUNCTION`
    Function,
    /// `SET_OWNER`
    Owner,
}

/// Everything a rule engine may consult for one leaf write.
pub struct WriteContext<'a> {
    /// The kind of write
    pub kind: WriteKind,
    /// Parsed target path
    pub path: &'a [String],
    /// The value being written; `Null` means delete
    pub value: &'a Value,
    /// Recovered signer of the transaction
    pub signer: Address,
    /// Number of the block the transaction executes under
    pub block_number: u64,
    /// Current values tree, for reads (balances, prior records)
    pub values: &'a StateTree,
    /// Current owners tree
    pub owners: &'a StateTree,
}

/// A rejected write.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleViolation {
    /// A write rule denied the operation
    #[error("rule denied at /{path}: {reason}")]
    RuleDenied {
        /// Joined target path
        path: String,
        /// Human-readable denial reason
        reason: String,
    },
    /// The owner policy denied the operation
    #[error("owner denied at /{path}: owned by {owner}")]
    OwnerDenied {
        /// Joined target path
        path: String,
        /// Owning address
        owner: String,
    },
    /// A function hook failed
    #[error("function failed at /{path}: {reason}")]
    FunctionFailed {
        /// Joined target path
        path: String,
        /// Failure reason
        reason: String,
    },
}

impl RuleViolation {
    fn denied(path: &[String], reason: impl Into<String>) -> Self {
        Self::RuleDenied {
            path: path.join("/"),
            reason: reason.into(),
        }
    }
}

/// The rule/owner evaluation seam consumed by [`crate::DatabaseView`].
pub trait RuleEngine: Send + Sync {
    /// Decides whether a single leaf write is permitted.
    fn check_write(&self, ctx: &WriteContext<'_>) -> Result<(), RuleViolation>;
}

/// Sums the staking balance recorded under `/staking/consensus/<addr>`.
///
/// Every numeric leaf in the subtree counts toward the balance; deposits are
/// written as `/staking/consensus/<addr>/<lockup_id>/value`.
pub fn staking_balance(values: &StateTree, addr: &Address) -> Stake {
    let base = vec![
        "staking".to_string(),
        "consensus".to_string(),
        addr.to_hex(),
    ];
    sum_numeric(values, &base)
}

fn sum_numeric(values: &StateTree, path: &[String]) -> Stake {
    let mut total = 0u64;
    if let Some(Value::Number(n)) = values.get(path) {
        total = total.saturating_add(n.as_u64().unwrap_or(0));
    }
    for child in values.children(path) {
        let mut sub = path.to_vec();
        sub.push(child);
        total = total.saturating_add(sum_numeric(values, &sub));
    }
    total
}

/// The built-in rule engine.
#[derive(Debug, Default)]
pub struct ConsensusRules;

impl ConsensusRules {
    /// Walks from the target path toward the root looking for the nearest
    /// `.owner` entry in the owners tree.
    fn nearest_owner(&self, owners: &StateTree, path: &[String]) -> Option<Address> {
        for len in (0..=path.len()).rev() {
            let mut probe = path[..len].to_vec();
            probe.push(".owner".to_string());
            if let Some(Value::String(s)) = owners.get(&probe) {
                if let Ok(addr) = Address::from_str(&s) {
                    return Some(addr);
                }
            }
        }
        None
    }

    fn check_consensus_write(&self, ctx: &WriteContext<'_>) -> Result<(), RuleViolation> {
        if ctx.kind != WriteKind::Value {
            return Err(RuleViolation::denied(
                ctx.path,
                "only value writes are allowed under /consensus",
            ));
        }
        // /consensus/number/<N>/<propose | voter addr>
        if ctx.path.len() >= 2 && ctx.path[1] == "number" {
            let number: u64 = ctx.path.get(2).and_then(|s| s.parse().ok()).ok_or_else(|| {
                RuleViolation::denied(ctx.path, "consensus record number is not numeric")
            })?;

            // Retiring old records: deletes of past numbers are open to any
            // validator; the proposer folds them into its proposal tx.
            if ctx.value.is_null() {
                if number < ctx.block_number {
                    return Ok(());
                }
                return Err(RuleViolation::denied(
                    ctx.path,
                    "cannot delete a current or future consensus record",
                ));
            }

            match ctx.path.get(3).map(|s| s.as_str()) {
                Some("propose") => {
                    let proposer = ctx
                        .value
                        .get("proposer")
                        .and_then(|v| v.as_str())
                        .and_then(|s| Address::from_str(s).ok())
                        .ok_or_else(|| {
                            RuleViolation::denied(ctx.path, "proposal record has no proposer")
                        })?;
                    if proposer != ctx.signer {
                        return Err(RuleViolation::denied(
                            ctx.path,
                            "proposal must be signed by its proposer",
                        ));
                    }
                    if ctx.values.get(ctx.path).is_some() {
                        return Err(RuleViolation::denied(ctx.path, "proposal already recorded"));
                    }
                    Ok(())
                }
                Some(voter) => {
                    let voter_addr = Address::from_str(voter).map_err(|_| {
                        RuleViolation::denied(ctx.path, "vote path is not an address")
                    })?;
                    if voter_addr != ctx.signer {
                        return Err(RuleViolation::denied(
                            ctx.path,
                            "vote must be signed by the voting validator",
                        ));
                    }
                    if ctx.values.get(ctx.path).is_some() {
                        return Err(RuleViolation::denied(ctx.path, "validator already voted"));
                    }
                    if ctx.value.get("block_hash").and_then(|v| v.as_str()).is_none() {
                        return Err(RuleViolation::denied(ctx.path, "vote has no block_hash"));
                    }
                    let claimed = ctx
                        .value
                        .get("stake")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    let balance = staking_balance(ctx.values, &voter_addr);
                    if claimed == 0 || claimed != balance {
                        return Err(RuleViolation::denied(
                            ctx.path,
                            format!("claimed stake {} does not match balance {}", claimed, balance),
                        ));
                    }
                    Ok(())
                }
                None => Err(RuleViolation::denied(
                    ctx.path,
                    "writes to /consensus/number/<N> itself are not allowed",
                )),
            }
        } else if ctx.path.get(1).map(|s| s.as_str()) == Some("whitelist") {
            // Whitelist membership is owner-gated.
            self.check_owned(ctx)
        } else {
            Err(RuleViolation::denied(
                ctx.path,
                "unrecognized consensus path",
            ))
        }
    }

    fn check_staking_write(&self, ctx: &WriteContext<'_>) -> Result<(), RuleViolation> {
        if ctx.kind != WriteKind::Value {
            return Err(RuleViolation::denied(
                ctx.path,
                "only value writes are allowed under /staking",
            ));
        }
        // /staking/consensus/<addr>/... is writable by <addr> alone.
        match ctx.path.get(2).and_then(|s| Address::from_str(s).ok()) {
            Some(owner) if owner == ctx.signer => Ok(()),
            Some(owner) => Err(RuleViolation::OwnerDenied {
                path: ctx.path.join("/"),
                owner: owner.to_hex(),
            }),
            None => Err(RuleViolation::denied(
                ctx.path,
                "staking path is not an address",
            )),
        }
    }

    fn check_owned(&self, ctx: &WriteContext<'_>) -> Result<(), RuleViolation> {
        match self.nearest_owner(ctx.owners, ctx.path) {
            Some(owner) if owner == ctx.signer => Ok(()),
            Some(owner) => Err(RuleViolation::OwnerDenied {
                path: ctx.path.join("/"),
                owner: owner.to_hex(),
            }),
            // Unowned territory: the write is allowed, and an owner write
            // claims the subtree.
            None => Ok(()),
        }
    }
}

impl RuleEngine for ConsensusRules {
    fn check_write(&self, ctx: &WriteContext<'_>) -> Result<(), RuleViolation> {
        match ctx.path.first().map(|s| s.as_str()) {
            Some("consensus") => self.check_consensus_write(ctx),
            Some("staking") => self.check_staking_write(ctx),
            _ => self.check_owned(ctx),
        }
    }
}

/// Path of the proposal record for block `number`.
pub fn proposal_path(number: u64) -> Vec<String> {
    split_path(&format!("/consensus/number/{}/propose", number))
}

/// Path of validator `addr`'s vote record for block `number`.
pub fn vote_path(number: u64, addr: &Address) -> Vec<String> {
    split_path(&format!("/consensus/number/{}/{}", number, addr.to_hex()))
}

/// Path of the whole consensus record for block `number`.
pub fn consensus_record_path(number: u64) -> Vec<String> {
    split_path(&format!("/consensus/number/{}", number))
}

/// Path of a staking deposit for `addr` under lockup 0.
pub fn staking_deposit_path(addr: &Address) -> Vec<String> {
    split_path(&format!("/staking/consensus/{}/0/value", addr.to_hex()))
}
