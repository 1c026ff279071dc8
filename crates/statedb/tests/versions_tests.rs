//! Tests for the state version manager lifecycle.

use std::sync::Arc;

use serde_json::json;
use triad_statedb::{split_path, StateTree, StateVersionManager};

fn manager_with_final() -> Arc<StateVersionManager> {
    let mgr = Arc::new(StateVersionManager::new());
    mgr.clone_version("", "final:0").unwrap();
    let tree = mgr
        .get_root("final:0")
        .unwrap()
        .set(&split_path("/values/base"), json!("genesis"));
    mgr.set_root("final:0", tree).unwrap();
    mgr.finalize("final:0").unwrap();
    mgr
}

#[test]
fn clone_observes_base_at_fork_time() {
    let mgr = manager_with_final();
    mgr.clone_version("final:0", "branch").unwrap();

    // Mutate the base after forking; the branch must not see it.
    let mutated = mgr
        .get_root("final:0")
        .unwrap()
        .set(&split_path("/values/late"), json!(1));
    mgr.set_root("final:0", mutated).unwrap();

    let branch = mgr.get_root("branch").unwrap();
    assert_eq!(branch.get(&split_path("/values/base")), Some(json!("genesis")));
    assert_eq!(branch.get(&split_path("/values/late")), None);
}

#[test]
fn clone_of_empty_base_is_empty() {
    let mgr = Arc::new(StateVersionManager::new());
    let root = mgr.clone_version("", "fresh").unwrap();
    assert!(root.is_empty());
}

#[test]
fn clone_rejects_unknown_base_and_duplicate_name() {
    let mgr = manager_with_final();
    assert!(mgr.clone_version("missing", "x").is_err());
    mgr.clone_version("final:0", "x").unwrap();
    assert!(mgr.clone_version("final:0", "x").is_err());
}

#[test]
fn finalize_evicts_previous_identity() {
    let mgr = manager_with_final();
    mgr.clone_version("final:0", "final:1").unwrap();
    mgr.finalize("final:1").unwrap();

    assert_eq!(mgr.final_version().as_deref(), Some("final:1"));
    assert!(!mgr.has_version("final:0"));
    assert_eq!(mgr.num_versions(), 1);
}

#[test]
fn delete_refuses_the_finalized_version() {
    let mgr = manager_with_final();
    assert!(mgr.delete("final:0").is_err());
    mgr.clone_version("final:0", "spare").unwrap();
    mgr.delete("spare").unwrap();
    assert_eq!(mgr.num_versions(), 1);
}

#[test]
fn transfer_rebinds_without_copying() {
    let mgr = manager_with_final();
    mgr.clone_version("final:0", "speculative").unwrap();
    let before: StateTree = mgr.get_root("speculative").unwrap();

    mgr.transfer("speculative", "final-candidate").unwrap();
    assert!(!mgr.has_version("speculative"));
    let after = mgr.get_root("final-candidate").unwrap();
    assert!(before.same_root(&after));
}

#[test]
fn temp_versions_release_on_drop() {
    let mgr = manager_with_final();
    {
        let temp = mgr.clone_to_temp("final:0", "verify").unwrap();
        assert!(mgr.has_version(temp.name()));
        assert_eq!(mgr.num_versions(), 2);
    }
    assert_eq!(mgr.num_versions(), 1);
}

#[test]
fn temp_versions_survive_promotion() {
    let mgr = manager_with_final();
    let temp = mgr.clone_to_temp("final:0", "verify").unwrap();
    temp.promote("block:abcd").unwrap();
    assert!(mgr.has_version("block:abcd"));
    assert_eq!(mgr.num_versions(), 2);
}

#[test]
fn no_leak_across_repeated_fork_finalize_cycles() {
    let mgr = manager_with_final();
    for i in 1..=50u64 {
        let name = format!("final:{}", i);
        mgr.clone_version(&mgr.final_version().unwrap(), &name).unwrap();
        // A temp fork per cycle, dropped unused, must not accumulate.
        let _probe = mgr.clone_to_temp(&name, "probe").unwrap();
        mgr.finalize(&name).unwrap();
    }
    assert_eq!(mgr.num_versions(), 1);
    assert_eq!(mgr.final_version().as_deref(), Some("final:50"));
}

#[test]
fn version_list_is_sorted() {
    let mgr = manager_with_final();
    mgr.clone_version("final:0", "b").unwrap();
    mgr.clone_version("final:0", "a").unwrap();
    assert_eq!(mgr.version_list(), vec!["a", "b", "final:0"]);
}
