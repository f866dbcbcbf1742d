//! Object-graph traversal for cascading operations.
//!
//! A cascade follows every association whose [`CascadeStyle`] includes the
//! action, starting from one or more roots. Each instance is visited once
//! (by address), so cyclic graphs terminate. Orphan removal implies cascading
//! `Remove`.
//!
//! [`CascadeStyle`]: unitwork_core::CascadeStyle

use std::collections::HashSet;
use unitwork_core::{AssociationInfo, CascadeAction, SharedEntity, instance_id};

/// Does this association propagate `action`?
pub fn cascades(info: &AssociationInfo, action: CascadeAction) -> bool {
    info.cascade.includes(action)
        || (action == CascadeAction::Remove && info.cascade.orphan_removal)
}

/// Instances reachable from `roots` through cascading associations, roots
/// excluded, in depth-first pre-order.
///
/// Only in-memory contents are followed: uninitialized collections and
/// unresolved to-ones are skipped.
pub fn reachable(roots: &[SharedEntity], action: CascadeAction) -> Vec<SharedEntity> {
    let mut visited: HashSet<usize> = roots.iter().map(instance_id).collect();
    let mut stack: Vec<SharedEntity> = roots.iter().rev().cloned().collect();
    let mut found = Vec::new();

    while let Some(current) = stack.pop() {
        let mut children = Vec::new();
        for info in current.associations() {
            if !cascades(info, action) {
                continue;
            }
            let Some(view) = current.association(info.name) else {
                continue;
            };
            for target in view.targets {
                if visited.insert(instance_id(&target)) {
                    children.push(target);
                }
            }
        }
        for child in children.into_iter().rev() {
            found.push(std::sync::Arc::clone(&child));
            stack.push(child);
        }
    }

    tracing::trace!(action = ?action, count = found.len(), "Cascade walk complete");
    found
}
