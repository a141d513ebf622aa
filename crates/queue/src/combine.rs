//! Binding-context combiner: fuse adjacent homogeneous hook tasks into one
//! batched invocation.

use bosun_core::{BindingContext, Task};
use tracing::debug;

use crate::TaskQueue;

/// Walk the queue after `current` and fuse adjacent tasks of the same type,
/// hook and binding kind into one combined context list, removing the fused
/// peers from the queue. `stop_combine` terminates fusion before a candidate
/// is taken; Synchronization tasks whose `wait_for_synchronization` flag
/// differs from the current task's never fuse.
///
/// Returns `None` when nothing was fused; the caller then keeps the task's
/// own binding contexts.
pub fn combine_binding_context(
    queue: &TaskQueue,
    current: &Task,
    stop_combine: impl Fn(&Task) -> bool,
) -> Option<Vec<BindingContext>> {
    let cur = current.metadata();
    let mut combined = cur.binding_context.clone();
    let mut fused: Vec<u64> = Vec::new();

    let mut snapshot: Vec<Task> = Vec::new();
    queue.iterate(|t| snapshot.push(t.clone()));

    let mut walk = snapshot.iter().skip_while(|t| t.id() != current.id());
    // The current task itself, if still queued.
    walk.next();

    for t in walk {
        if t.task_type() != current.task_type() {
            break;
        }
        let m = t.metadata();
        if m.hook_name != cur.hook_name || m.binding_type != cur.binding_type {
            break;
        }
        if sync_wait_flags_differ(current, t) || stop_combine(t) {
            break;
        }
        combined.extend(m.binding_context.iter().cloned());
        fused.push(t.id());
    }

    if fused.is_empty() {
        return None;
    }
    queue.filter(|t| !fused.contains(&t.id()));
    debug!(
        queue = queue.name(),
        task = %current.describe(),
        fused = fused.len(),
        contexts = combined.len(),
        "combined binding contexts"
    );
    Some(combined)
}

/// Synchronization barrier guard: a task pair where either side carries a
/// kubernetes binding id and the wait flags disagree must not fuse.
fn sync_wait_flags_differ(a: &Task, b: &Task) -> bool {
    let (am, bm) = (a.metadata(), b.metadata());
    let either_sync = !am.kubernetes_binding_id.is_empty() || !bm.kubernetes_binding_id.is_empty();
    either_sync && am.wait_for_synchronization != bm.wait_for_synchronization
}
