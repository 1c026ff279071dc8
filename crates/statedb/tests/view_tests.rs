//! Tests for transaction execution through database views.

use std::sync::Arc;

use serde_json::json;
use triad_crypto::PrivateKey;
use triad_statedb::{
    proposal_path, staking_deposit_path, vote_path, ConsensusRules, DatabaseView, ExecCode,
    StateVersionManager,
};
use triad_types::{Address, Operation, Transaction, TxBody};

const TS: u64 = 1_700_000_000_000;

struct Fixture {
    mgr: Arc<StateVersionManager>,
    key: PrivateKey,
}

impl Fixture {
    fn new() -> Self {
        let mgr = Arc::new(StateVersionManager::new());
        mgr.clone_version("", "final:0").unwrap();
        mgr.finalize("final:0").unwrap();
        Self {
            mgr,
            key: PrivateKey::random(),
        }
    }

    fn view(&self, block_number: u64) -> DatabaseView {
        DatabaseView::new(
            Arc::clone(&self.mgr),
            "final:0",
            block_number,
            Arc::new(ConsensusRules),
        )
    }

    fn tx(&self, op: Operation, nonce: i64, ts: u64) -> Transaction {
        Transaction::sign(TxBody::new(op, nonce, ts), &self.key).unwrap()
    }

    fn addr(&self) -> Address {
        self.key.address().into()
    }

    /// Seeds a staking deposit so the fixture key can vote.
    fn stake(&self, view: &DatabaseView, amount: u64) {
        let path = staking_deposit_path(&self.addr())
            .iter()
            .fold(String::new(), |acc, s| acc + "/" + s);
        let tx = self.tx(Operation::set_value(path, json!(amount)), 0, TS);
        assert!(view.execute(&tx).is_success());
    }
}

#[test]
fn execute_applies_value_writes() {
    let fx = Fixture::new();
    let view = fx.view(1);
    let tx = fx.tx(Operation::set_value("/apps/demo/x", json!(7)), 0, TS);

    let result = view.execute(&tx);
    assert!(result.is_success(), "{}", result);
    assert_eq!(result.gas_amount, 1);
    assert_eq!(view.get_value("/apps/demo/x").unwrap(), Some(json!(7)));
}

#[test]
fn nonce_must_match_account_sequence() {
    let fx = Fixture::new();
    let view = fx.view(1);

    let gap = fx.tx(Operation::set_value("/apps/demo/x", json!(1)), 5, TS);
    assert_eq!(view.execute(&gap).code, ExecCode::NonceMismatch);

    let first = fx.tx(Operation::set_value("/apps/demo/x", json!(1)), 0, TS);
    assert!(view.execute(&first).is_success());

    let replay = fx.tx(Operation::set_value("/apps/demo/x", json!(2)), 0, TS + 1);
    assert_eq!(view.execute(&replay).code, ExecCode::NonceMismatch);

    let (nonce, _) = view.get_account_nonce_and_timestamp(&fx.addr()).unwrap();
    assert_eq!(nonce, 1);
}

#[test]
fn unordered_transactions_need_fresh_timestamps() {
    let fx = Fixture::new();
    let view = fx.view(1);

    let a = fx.tx(Operation::set_value("/apps/demo/x", json!(1)), -1, TS);
    assert!(view.execute(&a).is_success());

    let stale = fx.tx(Operation::set_value("/apps/demo/x", json!(2)), -1, TS);
    assert_eq!(view.execute(&stale).code, ExecCode::TimestampStale);

    let fresh = fx.tx(Operation::set_value("/apps/demo/x", json!(3)), -1, TS + 1);
    assert!(view.execute(&fresh).is_success());
}

#[test]
fn failed_transaction_leaves_state_unchanged() {
    let fx = Fixture::new();
    let view = fx.view(1);
    let proof_before = view.state_proof("/").unwrap();

    // Batch where the second leaf violates the vote rule: nothing lands.
    let other = Address::new([9u8; 20]);
    let batch = fx.tx(
        Operation::Set {
            op_list: vec![
                Operation::set_value("/apps/demo/x", json!(1)),
                Operation::set_value(
                    format!("/consensus/number/1/{}", other.to_hex()),
                    json!({ "block_hash": "0xabc", "stake": 1 }),
                ),
            ],
        },
        0,
        TS,
    );
    let result = view.execute(&batch);
    assert_eq!(result.code, ExecCode::RuleDenied);
    assert_eq!(view.get_value("/apps/demo/x").unwrap(), None);
    assert_eq!(view.state_proof("/").unwrap(), proof_before);
}

#[test]
fn nested_set_is_malformed() {
    let fx = Fixture::new();
    let view = fx.view(1);
    let tx = fx.tx(
        Operation::Set {
            op_list: vec![Operation::Set { op_list: vec![] }],
        },
        0,
        TS,
    );
    assert_eq!(view.execute(&tx).code, ExecCode::Malformed);
}

#[test]
fn vote_rule_enforces_signer_stake_and_first_write() {
    let fx = Fixture::new();
    let view = fx.view(2);
    fx.stake(&view, 100_000);

    let vote_op = |stake: u64| {
        Operation::set_value(
            format!("/consensus/number/2/{}", fx.addr().to_hex()),
            json!({ "block_hash": "0x1234", "stake": stake }),
        )
    };

    // Claimed stake must match the staking balance.
    let wrong = fx.tx(vote_op(1), 1, TS);
    assert_eq!(view.execute(&wrong).code, ExecCode::RuleDenied);

    let good = fx.tx(vote_op(100_000), 1, TS);
    assert!(view.execute(&good).is_success());
    assert!(view
        .get_value(&format!("/consensus/number/2/{}", fx.addr().to_hex()))
        .unwrap()
        .is_some());

    // Double vote at the same number is denied by first-write.
    let dup = fx.tx(vote_op(100_000), 2, TS);
    assert_eq!(view.execute(&dup).code, ExecCode::RuleDenied);
}

#[test]
fn vote_for_other_validator_is_denied() {
    let fx = Fixture::new();
    let view = fx.view(2);
    fx.stake(&view, 100_000);

    let other = Address::new([7u8; 20]);
    let tx = fx.tx(
        Operation::set_value(
            format!("/consensus/number/2/{}", other.to_hex()),
            json!({ "block_hash": "0x1234", "stake": 100_000 }),
        ),
        1,
        TS,
    );
    assert_eq!(view.execute(&tx).code, ExecCode::RuleDenied);
}

#[test]
fn proposal_rule_enforces_proposer_and_first_write() {
    let fx = Fixture::new();
    let view = fx.view(3);

    let record = json!({ "proposer": fx.addr().to_hex(), "block_hash": "0xbeef" });
    let good = fx.tx(
        Operation::set_value("/consensus/number/3/propose", record.clone()),
        0,
        TS,
    );
    assert!(view.execute(&good).is_success());

    let dup = fx.tx(
        Operation::set_value("/consensus/number/3/propose", record),
        1,
        TS,
    );
    assert_eq!(view.execute(&dup).code, ExecCode::RuleDenied);

    let forged = fx.tx(
        Operation::set_value(
            "/consensus/number/4/propose",
            json!({ "proposer": Address::new([1u8; 20]).to_hex() }),
        ),
        2,
        TS,
    );
    assert_eq!(view.execute(&forged).code, ExecCode::RuleDenied);
}

#[test]
fn old_consensus_records_can_be_retired() {
    let fx = Fixture::new();
    let view = fx.view(12);

    let record = json!({ "proposer": fx.addr().to_hex() });
    let propose = fx.tx(
        Operation::set_value("/consensus/number/2/propose", record),
        0,
        TS,
    );
    assert!(view.execute(&propose).is_success());

    let retire = fx.tx(
        Operation::set_value("/consensus/number/2", serde_json::Value::Null),
        1,
        TS,
    );
    assert!(view.execute(&retire).is_success(), "retire old record");
    assert!(view.get_value("/consensus/number/2/propose").unwrap().is_none());

    // Current-number records cannot be retired.
    let current = fx.tx(
        Operation::set_value("/consensus/number/12", serde_json::Value::Null),
        2,
        TS,
    );
    assert_eq!(view.execute(&current).code, ExecCode::RuleDenied);
}

#[test]
fn owner_policy_gates_foreign_subtrees() {
    let fx = Fixture::new();
    let view = fx.view(1);

    let claim = fx.tx(
        Operation::SetOwner {
            ref_path: "/apps/mine/.owner".into(),
            value: json!(fx.addr().to_hex()),
        },
        0,
        TS,
    );
    assert!(view.execute(&claim).is_success());

    let intruder_key = PrivateKey::random();
    let intruder_tx = Transaction::sign(
        TxBody::new(Operation::set_value("/apps/mine/data", json!(1)), 0, TS),
        &intruder_key,
    )
    .unwrap();
    assert_eq!(view.execute(&intruder_tx).code, ExecCode::OwnerDenied);

    let own_write = fx.tx(Operation::set_value("/apps/mine/data", json!(1)), 1, TS);
    assert!(view.execute(&own_write).is_success());
}

#[test]
fn backup_restore_round_trip() {
    let fx = Fixture::new();
    let view = fx.view(1);

    let first = fx.tx(Operation::set_value("/apps/demo/x", json!(1)), 0, TS);
    assert!(view.execute(&first).is_success());
    view.backup().unwrap();

    let second = fx.tx(Operation::set_value("/apps/demo/y", json!(2)), 1, TS);
    assert!(view.execute(&second).is_success());
    assert_eq!(view.get_value("/apps/demo/y").unwrap(), Some(json!(2)));

    view.restore().unwrap();
    assert_eq!(view.get_value("/apps/demo/x").unwrap(), Some(json!(1)));
    assert_eq!(view.get_value("/apps/demo/y").unwrap(), None);
}

#[test]
fn execute_list_stops_at_first_failure() {
    let fx = Fixture::new();
    let view = fx.view(1);

    let txs = vec![
        fx.tx(Operation::set_value("/apps/demo/a", json!(1)), 0, TS),
        fx.tx(Operation::set_value("/apps/demo/b", json!(2)), 5, TS), // nonce gap
        fx.tx(Operation::set_value("/apps/demo/c", json!(3)), 1, TS),
    ];
    assert!(!view.execute_list(&txs));
    assert_eq!(view.get_value("/apps/demo/a").unwrap(), Some(json!(1)));
    assert_eq!(view.get_value("/apps/demo/c").unwrap(), None);
}

#[test]
fn path_helpers_shape() {
    let addr = Address::new([3u8; 20]);
    assert_eq!(proposal_path(4).join("/"), "consensus/number/4/propose");
    assert_eq!(
        vote_path(4, &addr).join("/"),
        format!("consensus/number/4/{}", addr.to_hex())
    );
}
