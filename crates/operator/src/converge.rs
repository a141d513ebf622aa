//! Startup-converge tracking.

use std::sync::atomic::{AtomicBool, Ordering};

use bosun_core::{BindingType, TaskType};
use bosun_queue::TaskQueue;
use tracing::info;

#[derive(Debug, Default)]
pub struct ConvergeState {
    started: AtomicBool,
    done: AtomicBool,
}

impl ConvergeState {
    pub fn new() -> Self {
        ConvergeState::default()
    }

    pub fn startup_converge_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn startup_converge_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Re-evaluate the converge flags after a successful task.
    pub fn check(&self, main_queue: &TaskQueue) {
        let converge_tasks = converge_task_count(main_queue);
        if converge_tasks > 0 && !self.started.swap(true, Ordering::SeqCst) {
            info!("first converge started");
        }
        if self.started.load(Ordering::SeqCst)
            && converge_tasks == 0
            && !self.done.swap(true, Ordering::SeqCst)
        {
            info!("first converge finished; operator is ready");
        }
    }
}

/// Tasks that keep the converge machine busy: the module lifecycle task
/// types plus BeforeAll/AfterAll global hook runs.
pub fn is_converge_task(task_type: TaskType, binding: Option<BindingType>) -> bool {
    match task_type {
        TaskType::ModuleRun
        | TaskType::DiscoverModulesState
        | TaskType::ModuleDelete
        | TaskType::ModulePurge
        | TaskType::ModuleManagerRetry
        | TaskType::ReloadAllModules
        | TaskType::GlobalHookEnableKubernetesBindings
        | TaskType::GlobalHookEnableScheduleBindings => true,
        TaskType::GlobalHookRun => {
            matches!(binding, Some(BindingType::BeforeAll) | Some(BindingType::AfterAll))
        }
        _ => false,
    }
}

pub fn converge_task_count(queue: &TaskQueue) -> usize {
    let mut count = 0;
    queue.iterate(|t| {
        if is_converge_task(t.task_type(), t.metadata().binding_type) {
            count += 1;
        }
    });
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_core::{HookMetadata, Task};
    use bosun_queue::{TaskHandlerFn, TaskQueueSet, TaskResult};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn queue_with(tasks: Vec<Task>) -> (TaskQueueSet, TaskQueue) {
        let handler: TaskHandlerFn = Arc::new(|_t| Box::pin(async { TaskResult::success() }));
        let set = TaskQueueSet::new(CancellationToken::new());
        let q = set.new_named_queue("main", handler);
        for t in tasks {
            q.add_last(t);
        }
        (set, q)
    }

    fn hook_run(binding: BindingType) -> Task {
        Task::new(TaskType::GlobalHookRun).with_metadata(HookMetadata {
            binding_type: Some(binding),
            ..Default::default()
        })
    }

    #[test]
    fn converge_predicate_matches_lifecycle_tasks() {
        assert!(is_converge_task(TaskType::ModuleRun, None));
        assert!(is_converge_task(TaskType::ReloadAllModules, None));
        assert!(is_converge_task(TaskType::GlobalHookEnableKubernetesBindings, None));
        assert!(is_converge_task(TaskType::GlobalHookRun, Some(BindingType::BeforeAll)));
        assert!(is_converge_task(TaskType::GlobalHookRun, Some(BindingType::AfterAll)));
        assert!(!is_converge_task(TaskType::GlobalHookRun, Some(BindingType::Schedule)));
        assert!(!is_converge_task(TaskType::GlobalHookRun, Some(BindingType::OnKubernetesEvent)));
        assert!(!is_converge_task(TaskType::ModuleHookRun, None));
    }

    #[test]
    fn ready_iff_no_converge_tasks_left() {
        let (_set, q) = queue_with(vec![
            Task::new(TaskType::ModuleRun),
            hook_run(BindingType::OnKubernetesEvent),
        ]);
        let state = ConvergeState::new();
        state.check(&q);
        assert!(state.startup_converge_started());
        assert!(!state.startup_converge_done());

        // The ModuleRun drains; a plain kubernetes hook run does not hold
        // the converge open.
        q.filter(|t| t.task_type() != TaskType::ModuleRun);
        state.check(&q);
        assert!(state.startup_converge_done());
    }

    #[test]
    fn done_latches_once_set() {
        let (_set, q) = queue_with(vec![Task::new(TaskType::DiscoverModulesState)]);
        let state = ConvergeState::new();
        state.check(&q);
        q.filter(|_| false);
        state.check(&q);
        assert!(state.startup_converge_done());

        // New converge tasks later do not clear readiness.
        q.add_last(Task::new(TaskType::ReloadAllModules));
        state.check(&q);
        assert!(state.startup_converge_done());
    }
}
