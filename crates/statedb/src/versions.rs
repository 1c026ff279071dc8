//! Named state versions with copy-on-write forking.
//!
//! The manager holds a forest of named roots. Forking (`clone_version`,
//! `clone_to_temp`) is an `Arc` copy of the base root; the forked version
//! observes the base's contents at the moment of cloning and nothing after.
//! Exactly one version is *finalized* at any time; finalizing is a rename,
//! and the previous finalized identity is evicted (its physical nodes
//! survive for as long as other versions still reference them).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::tree::StateTree;
use crate::{Result, StateDbError};

struct VersionEntry {
    tree: StateTree,
    parent: Option<String>,
    temp: bool,
}

#[derive(Default)]
struct Inner {
    versions: HashMap<String, VersionEntry>,
    finalized: Option<String>,
}

/// Manager of named state versions.
#[derive(Default)]
pub struct StateVersionManager {
    inner: RwLock<Inner>,
    temp_counter: AtomicU64,
}

impl StateVersionManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy-on-write fork of `base` under `new_name`. An empty `base`
    /// produces an empty tree. Returns the forked root.
    pub fn clone_version(&self, base: &str, new_name: &str) -> Result<StateTree> {
        let mut inner = self.inner.write();
        if inner.versions.contains_key(new_name) {
            return Err(StateDbError::DuplicateVersion(new_name.to_string()));
        }
        let (tree, parent) = if base.is_empty() {
            (StateTree::new(), None)
        } else {
            let entry = inner
                .versions
                .get(base)
                .ok_or_else(|| StateDbError::UnknownVersion(base.to_string()))?;
            (entry.tree.clone(), Some(base.to_string()))
        };
        trace!(base = base, name = new_name, "forked state version");
        inner.versions.insert(
            new_name.to_string(),
            VersionEntry {
                tree: tree.clone(),
                parent,
                temp: false,
            },
        );
        Ok(tree)
    }

    /// Non-persistent fork used during validation. The returned guard
    /// deletes the version on drop unless it is promoted.
    pub fn clone_to_temp(self: &Arc<Self>, base: &str, prefix: &str) -> Result<TempVersion> {
        let seq = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}:{}", prefix, seq);
        {
            let mut inner = self.inner.write();
            if inner.versions.contains_key(&name) {
                return Err(StateDbError::DuplicateVersion(name));
            }
            let (tree, parent) = if base.is_empty() {
                (StateTree::new(), None)
            } else {
                let entry = inner
                    .versions
                    .get(base)
                    .ok_or_else(|| StateDbError::UnknownVersion(base.to_string()))?;
                (entry.tree.clone(), Some(base.to_string()))
            };
            inner.versions.insert(
                name.clone(),
                VersionEntry {
                    tree,
                    parent,
                    temp: true,
                },
            );
        }
        trace!(base = base, name = %name, "forked temp version");
        Ok(TempVersion {
            mgr: Arc::clone(self),
            name,
            live: true,
        })
    }

    /// Atomically promotes `name` to be the finalized version, evicting the
    /// previous finalized identity.
    pub fn finalize(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.versions.contains_key(name) {
            return Err(StateDbError::UnknownVersion(name.to_string()));
        }
        let previous = inner.finalized.take();
        inner.finalized = Some(name.to_string());
        if let Some(entry) = inner.versions.get_mut(name) {
            entry.temp = false;
        }
        if let Some(prev) = previous {
            if prev != name {
                inner.versions.remove(&prev);
                debug!(finalized = name, evicted = %prev, "finalized state version");
            }
        } else {
            debug!(finalized = name, "finalized state version");
        }
        Ok(())
    }

    /// Drops a version. Fails if it is currently finalized.
    pub fn delete(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.finalized.as_deref() == Some(name) {
            return Err(StateDbError::DeleteFinalized(name.to_string()));
        }
        if inner.versions.remove(name).is_none() {
            return Err(StateDbError::UnknownVersion(name.to_string()));
        }
        trace!(name = name, "deleted state version");
        Ok(())
    }

    /// Rebinds the physical tree of `src` under the name `dst` and removes
    /// `src`. Used when a speculative branch becomes the finalized chain.
    pub fn transfer(&self, src: &str, dst: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.versions.contains_key(dst) {
            return Err(StateDbError::DuplicateVersion(dst.to_string()));
        }
        let mut entry = inner
            .versions
            .remove(src)
            .ok_or_else(|| StateDbError::UnknownVersion(src.to_string()))?;
        entry.temp = false;
        inner.versions.insert(dst.to_string(), entry);
        if inner.finalized.as_deref() == Some(src) {
            inner.finalized = Some(dst.to_string());
        }
        trace!(src = src, dst = dst, "transferred state version");
        Ok(())
    }

    /// The root of a version, if it exists.
    pub fn get_root(&self, name: &str) -> Option<StateTree> {
        self.inner.read().versions.get(name).map(|e| e.tree.clone())
    }

    /// Replaces the root of an existing version. Views write back through
    /// this after a successful execution.
    pub fn set_root(&self, name: &str, tree: StateTree) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .versions
            .get_mut(name)
            .ok_or_else(|| StateDbError::UnknownVersion(name.to_string()))?;
        entry.tree = tree;
        Ok(())
    }

    /// The parent a version was forked from, if recorded and still known.
    pub fn parent_of(&self, name: &str) -> Option<String> {
        self.inner.read().versions.get(name).and_then(|e| e.parent.clone())
    }

    /// All version names, sorted.
    pub fn version_list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().versions.keys().cloned().collect();
        names.sort();
        names
    }

    /// The name of the finalized version.
    pub fn final_version(&self) -> Option<String> {
        self.inner.read().finalized.clone()
    }

    /// The root of the finalized version.
    pub fn final_root(&self) -> Result<StateTree> {
        let inner = self.inner.read();
        let name = inner.finalized.as_ref().ok_or(StateDbError::NoFinalVersion)?;
        inner
            .versions
            .get(name)
            .map(|e| e.tree.clone())
            .ok_or_else(|| StateDbError::UnknownVersion(name.clone()))
    }

    /// Number of live versions, temps included.
    pub fn num_versions(&self) -> usize {
        self.inner.read().versions.len()
    }

    /// Whether a version exists.
    pub fn has_version(&self, name: &str) -> bool {
        self.inner.read().versions.contains_key(name)
    }
}

/// RAII guard for a temp version: deletes it on drop unless promoted.
///
/// Every early-return path in proposal verification releases its fork
/// through this guard; a leaked temp version is a resource bug.
pub struct TempVersion {
    mgr: Arc<StateVersionManager>,
    name: String,
    live: bool,
}

impl TempVersion {
    /// The version name the guard owns.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the temp version to a persistent name, consuming the guard.
    /// The caller (typically the block pool) takes over the lifetime.
    pub fn promote(mut self, new_name: &str) -> Result<()> {
        self.mgr.transfer(&self.name, new_name)?;
        self.live = false;
        Ok(())
    }
}

impl Drop for TempVersion {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.mgr.delete(&self.name) {
                warn!(name = %self.name, error = %e, "failed to release temp version");
            }
        }
    }
}
