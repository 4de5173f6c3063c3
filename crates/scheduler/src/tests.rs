// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::{sync::Arc, time::Duration};

use dal::ID;
use models::{
    Data, DataOwner, Driver, DriverKind, Task, TaskGraph, TaskInput, TaskInstance, TaskOutput,
    TaskState,
};
use storage::{mem::MemoryStorage, DataStorage, MetadataStorage, Storage};

use crate::{policy::FifoPolicy, recovery::JobRecovery};

fn mem_store() -> Arc<dyn Storage> {
    Arc::new(MemoryStorage::new())
}

fn single_task_graph(task: Task) -> (ID, TaskGraph) {
    let id = task.id;
    let mut graph = TaskGraph::new();
    graph.add_task(task).unwrap();
    graph.mark_input_task(id).unwrap();
    graph.mark_output_task(id).unwrap();
    (id, graph)
}

async fn add_scheduler(store: &Arc<dyn Storage>) -> ID {
    let id = ID::new();
    store
        .add_driver(&Driver::new(
            id,
            DriverKind::Scheduler,
            Some("127.0.0.1:8080".to_owned()),
        ))
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn fifo_schedule_order() {
    let store = mem_store();
    let scheduler_id = add_scheduler(&store).await;
    let client_id = ID::new();

    let (task_1, graph_1) = single_task_graph(Task::new("task_1"));
    let job_id_1 = ID::new();
    store.add_job(job_id_1, client_id, &graph_1).await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;

    let (task_2, graph_2) = single_task_graph(Task::new("task_2"));
    let job_id_2 = ID::new();
    store.add_job(job_id_2, client_id, &graph_2).await.unwrap();

    let policy = FifoPolicy::new(scheduler_id, store.clone());

    // Schedule the earlier task
    let first = policy.schedule_next(ID::new(), "", None).await.unwrap();
    assert_eq!(first.map(|(task, _)| task), Some(task_1));

    // Schedule the later task
    let second = policy.schedule_next(ID::new(), "", None).await.unwrap();
    assert_eq!(second.map(|(task, _)| task), Some(task_2));

    store.remove_job(job_id_1).await.unwrap();
    store.remove_job(job_id_2).await.unwrap();

    // Schedule when no task available
    let third = policy.schedule_next(ID::new(), "", None).await.unwrap();
    assert!(third.is_none());
}

#[tokio::test]
async fn schedule_hard_locality() {
    let store = mem_store();
    let scheduler_id = add_scheduler(&store).await;

    let client_id = ID::new();
    store
        .add_driver(&Driver::new(client_id, DriverKind::Client, None))
        .await
        .unwrap();

    let mut data = Data::new(b"value".to_vec(), DataOwner::Driver(client_id));
    data.set_hard_locality(true);
    data.set_locality(vec!["127.0.0.1".to_owned()]);
    store.add_driver_data(client_id, &data).await.unwrap();

    let mut task = Task::new("task");
    task.add_input(TaskInput::data(data.id));
    task.add_output(TaskOutput::declared::<i64>());
    let (task_id, graph) = single_task_graph(task);
    let job_id = ID::new();
    store.add_job(job_id, client_id, &graph).await.unwrap();

    let policy = FifoPolicy::new(scheduler_id, store.clone());

    // Schedule with wrong address
    assert!(policy
        .schedule_next(ID::new(), "", None)
        .await
        .unwrap()
        .is_none());

    // Schedule with correct address
    let assigned = policy
        .schedule_next(ID::new(), "127.0.0.1", None)
        .await
        .unwrap();
    assert_eq!(assigned.map(|(task, _)| task), Some(task_id));
}

#[tokio::test]
async fn schedule_soft_locality() {
    let store = mem_store();
    let scheduler_id = add_scheduler(&store).await;

    let client_id = ID::new();
    store
        .add_driver(&Driver::new(client_id, DriverKind::Client, None))
        .await
        .unwrap();

    let mut data = Data::new(b"value".to_vec(), DataOwner::Driver(client_id));
    data.set_hard_locality(false);
    data.set_locality(vec!["127.0.0.1".to_owned()]);
    store.add_driver_data(client_id, &data).await.unwrap();

    let mut task = Task::new("task");
    task.add_input(TaskInput::data(data.id));
    task.add_output(TaskOutput::declared::<i64>());
    let (task_id, graph) = single_task_graph(task);
    store.add_job(ID::new(), client_id, &graph).await.unwrap();

    let policy = FifoPolicy::new(scheduler_id, store.clone());

    // A remote worker may still take the task; the constraint is advisory.
    let assigned = policy.schedule_next(ID::new(), "", None).await.unwrap();
    assert_eq!(assigned.map(|(task, _)| task), Some(task_id));
}

#[tokio::test]
async fn soft_locality_prefers_local_worker() {
    let store = mem_store();
    let scheduler_id = add_scheduler(&store).await;

    let client_id = ID::new();
    store
        .add_driver(&Driver::new(client_id, DriverKind::Client, None))
        .await
        .unwrap();

    // An unconstrained task submitted after a locality-pinned one: the
    // pinned task stays first for its host, while a remote worker gets the
    // unconstrained task in the first pass.
    let mut pinned_data = Data::new(b"value".to_vec(), DataOwner::Driver(client_id));
    pinned_data.set_locality(vec!["10.0.0.1".to_owned()]);
    store.add_driver_data(client_id, &pinned_data).await.unwrap();

    let mut pinned = Task::new("pinned");
    pinned.add_input(TaskInput::data(pinned_data.id));
    pinned.add_output(TaskOutput::declared::<i64>());
    let (pinned_id, pinned_graph) = single_task_graph(pinned);
    store.add_job(ID::new(), client_id, &pinned_graph).await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;

    let (free_id, free_graph) = single_task_graph(Task::new("free"));
    store.add_job(ID::new(), client_id, &free_graph).await.unwrap();

    let policy = FifoPolicy::new(scheduler_id, store.clone());

    let remote = policy.schedule_next(ID::new(), "", None).await.unwrap();
    assert_eq!(remote.map(|(task, _)| task), Some(free_id));

    let local = policy
        .schedule_next(ID::new(), "10.0.0.1", None)
        .await
        .unwrap();
    assert_eq!(local.map(|(task, _)| task), Some(pinned_id));
}

#[tokio::test]
async fn concurrent_dispatch_is_unique() {
    let store = mem_store();
    let scheduler_a = add_scheduler(&store).await;
    let scheduler_b = add_scheduler(&store).await;

    let (task_id, graph) = single_task_graph(Task::new("contended"));
    store.add_job(ID::new(), ID::new(), &graph).await.unwrap();

    let policy_a = FifoPolicy::new(scheduler_a, store.clone());
    let policy_b = FifoPolicy::new(scheduler_b, store.clone());

    let (ra, rb) = tokio::join!(
        policy_a.schedule_next(ID::new(), "", None),
        policy_b.schedule_next(ID::new(), "", None),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    // Exactly one scheduler wins the task; the other sees nothing left.
    match (ra, rb) {
        (Some((winner, _)), None) | (None, Some((winner, _))) => assert_eq!(winner, task_id),
        other => panic!("expected exactly one assignment, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_task_report_resets_promptly() {
    let store = mem_store();
    let scheduler_id = add_scheduler(&store).await;

    let (task_id, graph) = single_task_graph(Task::new("crashy"));
    store.add_job(ID::new(), ID::new(), &graph).await.unwrap();

    let policy = FifoPolicy::new(scheduler_id, store.clone());
    let worker = ID::new();

    let first = policy.schedule_next(worker, "", None).await.unwrap();
    assert!(first.is_some());

    // Without a failure report the task stays Running and nothing schedules.
    assert!(policy.schedule_next(worker, "", None).await.unwrap().is_none());

    // Reporting the failed task hands it straight back.
    let again = policy
        .schedule_next(worker, "", Some(task_id))
        .await
        .unwrap();
    assert_eq!(again.map(|(task, _)| task), Some(task_id));
}

#[tokio::test]
async fn recovery_single_task() {
    let store = mem_store();
    let client_id = ID::new();
    store
        .add_driver(&Driver::new(client_id, DriverKind::Client, None))
        .await
        .unwrap();

    let mut task = Task::new("task");
    task.add_input(TaskInput::literal(&10i64).unwrap());
    task.add_output(TaskOutput::declared::<i64>());
    let (task_id, graph) = single_task_graph(task);
    let job_id = ID::new();
    store.add_job(job_id, client_id, &graph).await.unwrap();

    // Set task as failed
    store.set_task_state(task_id, TaskState::Failed).await.unwrap();

    // Recover the job
    let mut recovery = JobRecovery::new(job_id, store.clone());
    recovery.compute().await.unwrap();
    assert_eq!(recovery.ready_tasks(), &[task_id]);
    assert!(recovery.pending_tasks().is_empty());

    assert_eq!(store.get_task(task_id).await.unwrap().state, TaskState::Ready);
}

#[tokio::test]
async fn recovery_single_task_with_data() {
    let store = mem_store();
    let client_id = ID::new();
    store
        .add_driver(&Driver::new(client_id, DriverKind::Client, None))
        .await
        .unwrap();

    let data = Data::new(b"data".to_vec(), DataOwner::Driver(client_id));
    store.add_driver_data(client_id, &data).await.unwrap();

    let mut task = Task::new("task");
    task.add_input(TaskInput::data(data.id));
    task.add_output(TaskOutput::declared::<i64>());
    let (task_id, graph) = single_task_graph(task);
    let job_id = ID::new();
    store.add_job(job_id, client_id, &graph).await.unwrap();

    store.set_task_state(task_id, TaskState::Failed).await.unwrap();

    let mut recovery = JobRecovery::new(job_id, store.clone());
    recovery.compute().await.unwrap();
    assert_eq!(recovery.ready_tasks(), &[task_id]);
    assert!(recovery.pending_tasks().is_empty());
}

#[tokio::test]
async fn recovery_single_task_with_persisted_data() {
    let store = mem_store();
    let client_id = ID::new();
    store
        .add_driver(&Driver::new(client_id, DriverKind::Client, None))
        .await
        .unwrap();

    let mut data = Data::new(b"data".to_vec(), DataOwner::Driver(client_id));
    data.set_persisted(true);
    store.add_driver_data(client_id, &data).await.unwrap();

    let mut task = Task::new("task");
    task.add_input(TaskInput::data(data.id));
    task.add_output(TaskOutput::declared::<i64>());
    let (task_id, graph) = single_task_graph(task);
    let job_id = ID::new();
    store.add_job(job_id, client_id, &graph).await.unwrap();

    store.set_task_state(task_id, TaskState::Failed).await.unwrap();

    let mut recovery = JobRecovery::new(job_id, store.clone());
    recovery.compute().await.unwrap();
    assert_eq!(recovery.ready_tasks(), &[task_id]);
    assert!(recovery.pending_tasks().is_empty());
}

#[tokio::test]
async fn recovery_waits_on_reset_upstream() {
    let store = mem_store();
    let client_id = ID::new();

    // parent succeeded and produced a non-persisted blob; child failed.
    let mut graph = TaskGraph::new();
    let mut parent = Task::new("parent");
    parent.add_input(TaskInput::literal(&1i64).unwrap());
    parent.add_output(TaskOutput::declared_tag(models::DATA_TYPE_TAG));
    let parent_id = parent.id;
    graph.add_task(parent).unwrap();

    let mut child = Task::new("child");
    child.add_input(TaskInput::literal(&0i64).unwrap());
    child.add_output(TaskOutput::declared::<i64>());
    let child_id = child.id;
    graph.add_task(child).unwrap();
    graph
        .add_task_input(
            child_id,
            TaskInput::OutputRef {
                task: parent_id,
                index: 0,
                type_tag: models::DATA_TYPE_TAG.to_owned(),
            },
        )
        .unwrap();

    let job_id = ID::new();
    store.add_job(job_id, client_id, &graph).await.unwrap();

    // The parent ran and produced a data blob that has since been GC'd.
    let worker = ID::new();
    let parent_instance = TaskInstance::new(parent_id, worker);
    store.task_dispatch(&parent_instance).await.unwrap();
    let gone = ID::new();
    store
        .task_finish(&parent_instance, &[TaskOutput::Data { id: gone }])
        .await
        .unwrap();

    // Child ran and failed.
    let child_instance = TaskInstance::new(child_id, worker);
    store.task_dispatch(&child_instance).await.unwrap();
    store.task_fail(&child_instance, "lost input").await.unwrap();

    let mut recovery = JobRecovery::new(job_id, store.clone());
    recovery.compute().await.unwrap();

    // The parent must rerun first; the child waits on it.
    assert_eq!(recovery.ready_tasks(), &[parent_id]);
    assert_eq!(recovery.pending_tasks(), &[child_id]);

    assert_eq!(
        store.get_task(parent_id).await.unwrap().state,
        TaskState::Ready
    );
    assert_eq!(
        store.get_task(child_id).await.unwrap().state,
        TaskState::Pending
    );
}
