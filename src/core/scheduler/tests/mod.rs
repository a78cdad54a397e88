mod resume;

use std::time::Duration;

use super::TaskScheduler;
use super::types::{TaskRecord, TaskStatus};
use crate::core::store::Store;
use crate::core::testing::TestEnv;

pub(super) fn scheduler(env: &TestEnv) -> TaskScheduler {
    TaskScheduler::new(env.store.clone(), env.orchestrator.clone(), &env.config)
}

/// Wait until the stored task satisfies `done`; panics after five seconds.
pub(super) async fn wait_for(
    store: &Store,
    id: &str,
    done: impl Fn(&TaskRecord) -> bool,
) -> TaskRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let task = store.get_task(id).await.unwrap().expect("task exists");
        if done(&task) {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} stuck in {:?}",
            task.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub(super) fn terminal(task: &TaskRecord) -> bool {
    task.status.is_terminal()
}

pub(super) fn parked(task: &TaskRecord) -> bool {
    task.status == TaskStatus::Running && task.pending_job().is_some()
}
