//! Structural patches and the worker-side mirror replica.
//!
//! The bridge replicates selected window state into the worker as a plain
//! JSON tree. Changes travel as [`PatchBatch`]es with monotonically
//! increasing ids; the replica applies them strictly in id order. A batch
//! arriving past a gap is buffered and the owner is told to request a full
//! resync instead of stalling forever on the missing id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One structural edit at a path inside the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    /// Object-key path from the root.
    pub path: Vec<String>,
    pub op: PatchValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PatchValue {
    Replace(Value),
    Remove,
}

/// An ordered batch of edits. Batches must be applied in `id` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchBatch {
    pub id: u64,
    pub patches: Vec<PatchOp>,
}

/// Compute the structural difference between two trees.
///
/// Objects are diffed key by key; arrays and scalars are replaced
/// wholesale. `diff(old, new)` applied to `old` yields `new`.
pub fn diff(old: &Value, new: &Value) -> Vec<PatchOp> {
    let mut out = Vec::new();
    diff_at(&mut Vec::new(), old, new, &mut out);
    out
}

fn diff_at(path: &mut Vec<String>, old: &Value, new: &Value, out: &mut Vec<PatchOp>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, new_val) in b {
                path.push(key.clone());
                match a.get(key) {
                    Some(old_val) => diff_at(path, old_val, new_val, out),
                    None => out.push(PatchOp {
                        path: path.clone(),
                        op: PatchValue::Replace(new_val.clone()),
                    }),
                }
                path.pop();
            }
            for key in a.keys() {
                if !b.contains_key(key) {
                    let mut p = path.clone();
                    p.push(key.clone());
                    out.push(PatchOp {
                        path: p,
                        op: PatchValue::Remove,
                    });
                }
            }
        }
        _ => out.push(PatchOp {
            path: path.clone(),
            op: PatchValue::Replace(new.clone()),
        }),
    }
}

/// Apply a single edit to a tree.
pub fn apply_op(tree: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    let Some((last, parents)) = op.path.split_last() else {
        // Empty path: replace the whole tree.
        return match &op.op {
            PatchValue::Replace(v) => {
                *tree = v.clone();
                Ok(())
            }
            PatchValue::Remove => Err(PatchError::InvalidPath(op.path.clone())),
        };
    };

    let mut cursor = tree;
    for key in parents {
        let obj = cursor
            .as_object_mut()
            .ok_or_else(|| PatchError::InvalidPath(op.path.clone()))?;
        cursor = obj
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let obj = cursor
        .as_object_mut()
        .ok_or_else(|| PatchError::InvalidPath(op.path.clone()))?;
    match &op.op {
        PatchValue::Replace(v) => {
            obj.insert(last.clone(), v.clone());
        }
        PatchValue::Remove => {
            obj.remove(last);
        }
    }
    Ok(())
}

/// Outcome of offering a batch to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied (possibly draining buffered successors too).
    Applied,
    /// Batch id already seen; ignored.
    Stale,
    /// Id gap: the batch was buffered and the sender should be asked for a
    /// full resync.
    ResyncNeeded,
}

/// Read-only shadow of window substate held by the worker.
///
/// The tree is never mutated directly; it only changes through applied
/// batches or a full resync.
pub struct MirrorReplica {
    tree: Value,
    next_id: u64,
    buffered: BTreeMap<u64, PatchBatch>,
    max_buffered: usize,
}

impl MirrorReplica {
    pub fn new() -> Self {
        Self {
            tree: Value::Object(Map::new()),
            next_id: 0,
            buffered: BTreeMap::new(),
            max_buffered: 32,
        }
    }

    /// Offer a batch. In-order batches apply immediately and drain any
    /// buffered successors; out-of-order batches buffer and demand resync.
    pub fn apply(&mut self, batch: PatchBatch) -> ApplyOutcome {
        if batch.id < self.next_id {
            log::debug!("mirror: stale batch {} (expecting {})", batch.id, self.next_id);
            return ApplyOutcome::Stale;
        }
        if batch.id > self.next_id {
            log::warn!(
                "mirror: gap detected, got batch {} while expecting {}",
                batch.id,
                self.next_id
            );
            self.buffered.insert(batch.id, batch);
            if self.buffered.len() > self.max_buffered {
                self.buffered.clear();
            }
            return ApplyOutcome::ResyncNeeded;
        }

        self.apply_in_order(batch);
        while let Some(next) = self.buffered.remove(&self.next_id) {
            self.apply_in_order(next);
        }
        ApplyOutcome::Applied
    }

    fn apply_in_order(&mut self, batch: PatchBatch) {
        for op in &batch.patches {
            if let Err(e) = apply_op(&mut self.tree, op) {
                log::warn!("mirror: dropping unapplicable patch in batch {}: {e}", batch.id);
            }
        }
        self.next_id = batch.id + 1;
    }

    /// Replace the whole tree with an authoritative snapshot and resume the
    /// id sequence after `id`.
    pub fn resync(&mut self, snapshot: Value, id: u64) {
        log::info!("mirror: resynced at id {id}");
        self.tree = snapshot;
        self.buffered.clear();
        self.next_id = id + 1;
    }

    pub fn tree(&self) -> &Value {
        &self.tree
    }

    /// Next batch id the replica will accept.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }
}

impl Default for MirrorReplica {
    fn default() -> Self {
        Self::new()
    }
}

/// Patch application errors.
#[derive(Debug, Clone)]
pub enum PatchError {
    InvalidPath(Vec<String>),
}

impl std::fmt::Display for PatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchError::InvalidPath(path) => {
                write!(f, "patch path not addressable: /{}", path.join("/"))
            }
        }
    }
}

impl std::error::Error for PatchError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(id: u64, patches: Vec<PatchOp>) -> PatchBatch {
        PatchBatch { id, patches }
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let v = json!({"a": 1, "b": {"c": true}});
        assert!(diff(&v, &v).is_empty());
    }

    #[test]
    fn test_diff_then_apply_converges() {
        let old = json!({"page": {"route": "/home", "title": "Home"}, "ui": {"theme": "dark"}});
        let new = json!({"page": {"route": "/notes", "title": "Notes", "dirty": true}, "ui": {}});

        let patches = diff(&old, &new);
        assert!(!patches.is_empty());

        let mut tree = old.clone();
        for op in &patches {
            apply_op(&mut tree, op).unwrap();
        }
        assert_eq!(tree, new);
    }

    #[test]
    fn test_diff_removed_key() {
        let old = json!({"a": 1, "b": 2});
        let new = json!({"a": 1});
        let patches = diff(&old, &new);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].path, vec!["b".to_string()]);
        assert_eq!(patches[0].op, PatchValue::Remove);
    }

    #[test]
    fn test_diff_replaces_arrays_wholesale() {
        let old = json!({"items": [1, 2, 3]});
        let new = json!({"items": [1, 2, 3, 4]});
        let patches = diff(&old, &new);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].op, PatchValue::Replace(json!([1, 2, 3, 4])));
    }

    #[test]
    fn test_apply_creates_missing_parents() {
        let mut tree = json!({});
        let op = PatchOp {
            path: vec!["a".into(), "b".into(), "c".into()],
            op: PatchValue::Replace(json!(42)),
        };
        apply_op(&mut tree, &op).unwrap();
        assert_eq!(tree, json!({"a": {"b": {"c": 42}}}));
    }

    #[test]
    fn test_apply_root_replace() {
        let mut tree = json!({"old": true});
        let op = PatchOp {
            path: vec![],
            op: PatchValue::Replace(json!({"new": true})),
        };
        apply_op(&mut tree, &op).unwrap();
        assert_eq!(tree, json!({"new": true}));
    }

    #[test]
    fn test_apply_through_scalar_fails() {
        let mut tree = json!({"a": 1});
        let op = PatchOp {
            path: vec!["a".into(), "b".into()],
            op: PatchValue::Replace(json!(2)),
        };
        assert!(apply_op(&mut tree, &op).is_err());
    }

    #[test]
    fn test_replica_applies_in_order() {
        let mut replica = MirrorReplica::new();

        let b0 = batch(
            0,
            vec![PatchOp {
                path: vec!["page".into()],
                op: PatchValue::Replace(json!({"route": "/home"})),
            }],
        );
        let b1 = batch(
            1,
            vec![PatchOp {
                path: vec!["page".into(), "route".into()],
                op: PatchValue::Replace(json!("/notes")),
            }],
        );

        assert_eq!(replica.apply(b0), ApplyOutcome::Applied);
        assert_eq!(replica.apply(b1), ApplyOutcome::Applied);
        assert_eq!(replica.tree(), &json!({"page": {"route": "/notes"}}));
        assert_eq!(replica.next_id(), 2);
    }

    #[test]
    fn test_replica_stale_batch_ignored() {
        let mut replica = MirrorReplica::new();
        assert_eq!(replica.apply(batch(0, vec![])), ApplyOutcome::Applied);
        assert_eq!(replica.apply(batch(0, vec![])), ApplyOutcome::Stale);
    }

    #[test]
    fn test_replica_gap_demands_resync_then_drains_buffer() {
        let mut replica = MirrorReplica::new();

        // Batch 0 lost; 1 and 2 arrive.
        assert_eq!(replica.apply(batch(1, vec![])), ApplyOutcome::ResyncNeeded);
        assert_eq!(replica.apply(batch(2, vec![])), ApplyOutcome::ResyncNeeded);

        // Resync snapshot supersedes the lost range; buffered batches past
        // the resync point are gone with it.
        replica.resync(json!({"page": {"route": "/home"}}), 2);
        assert_eq!(replica.next_id(), 3);
        assert_eq!(replica.tree(), &json!({"page": {"route": "/home"}}));

        assert_eq!(replica.apply(batch(3, vec![])), ApplyOutcome::Applied);
    }

    #[test]
    fn test_replica_buffered_successor_applies_after_gap_fill() {
        let mut replica = MirrorReplica::new();

        let b1 = batch(
            1,
            vec![PatchOp {
                path: vec!["b".into()],
                op: PatchValue::Replace(json!(2)),
            }],
        );
        assert_eq!(replica.apply(b1), ApplyOutcome::ResyncNeeded);

        // The missing batch 0 shows up late (delayed, not dropped): both
        // apply, in order.
        let b0 = batch(
            0,
            vec![PatchOp {
                path: vec!["a".into()],
                op: PatchValue::Replace(json!(1)),
            }],
        );
        assert_eq!(replica.apply(b0), ApplyOutcome::Applied);
        assert_eq!(replica.tree(), &json!({"a": 1, "b": 2}));
        assert_eq!(replica.next_id(), 2);
    }
}
