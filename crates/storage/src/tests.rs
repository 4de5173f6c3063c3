// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use chrono::{Duration, Utc};
use dal::{FKey, StorageError, ID};
use models::{
    Data, DataOwner, Driver, DriverKind, JobStatus, Task, TaskGraph, TaskInput, TaskInstance,
    TaskOutput, TaskState,
};

use crate::{mem::MemoryStorage, reaper::reap, DataStorage, MetadataStorage, Storage};

fn single_task_graph(task: Task) -> (ID, TaskGraph) {
    let id = task.id;
    let mut graph = TaskGraph::new();
    graph.add_task(task).unwrap();
    graph.mark_input_task(id).unwrap();
    graph.mark_output_task(id).unwrap();
    (id, graph)
}

fn literal_task(name: &str) -> Task {
    let mut task = Task::new(name);
    task.add_input(TaskInput::literal(&10i64).unwrap());
    task.add_output(TaskOutput::declared::<i64>());
    task
}

#[tokio::test]
async fn add_job_marks_sources_ready() {
    let store = MemoryStorage::new();

    let mut graph = TaskGraph::new();
    let first = literal_task("first");
    let first_id = first.id;
    graph.add_task(first).unwrap();
    let mut second = Task::new("second");
    second.add_input(TaskInput::OutputRef {
        task: first_id,
        index: 0,
        type_tag: "int".to_owned(),
    });
    second.add_output(TaskOutput::declared::<i64>());
    let second_id = second.id;
    graph.add_task(second).unwrap();

    let job = ID::new();
    store.add_job(job, ID::new(), &graph).await.unwrap();

    assert_eq!(store.get_task(first_id).await.unwrap().state, TaskState::Ready);
    assert_eq!(
        store.get_task(second_id).await.unwrap().state,
        TaskState::Pending
    );
    assert_eq!(store.get_job_status(job).await.unwrap(), JobStatus::Running);
}

#[tokio::test]
async fn add_then_remove_job_restores_pre_state() {
    let store = MemoryStorage::new();
    let (task_id, graph) = single_task_graph(literal_task("only"));

    let job = ID::new();
    store.add_job(job, ID::new(), &graph).await.unwrap();

    // Data produced by the task is owned by it and must go with the job.
    let blob = Data::new(b"result".to_vec(), DataOwner::Task(task_id));
    let blob_id = blob.id;
    store.add_task_data(task_id, &blob).await.unwrap();

    store.remove_job(job).await.unwrap();

    assert!(matches!(
        store.get_job(job).await,
        Err(StorageError::KeyNotFound(_))
    ));
    assert!(matches!(
        store.get_task(task_id).await,
        Err(StorageError::KeyNotFound(_))
    ));
    assert!(matches!(
        store.get_data(blob_id).await,
        Err(StorageError::KeyNotFound(_))
    ));
}

#[tokio::test]
async fn task_finish_promotes_downstream() {
    let store = MemoryStorage::new();

    let mut graph = TaskGraph::new();
    let first = literal_task("first");
    let first_id = first.id;
    graph.add_task(first).unwrap();

    let mut second = Task::new("second");
    second.add_input(TaskInput::literal(&0i64).unwrap());
    second.add_output(TaskOutput::declared::<i64>());
    let second_id = second.id;
    graph.add_task(second).unwrap();
    graph
        .bind_task_output_to_task_input(first_id, 0, second_id, 0)
        .unwrap();

    let job = ID::new();
    store.add_job(job, ID::new(), &graph).await.unwrap();

    let worker = ID::new();
    let instance = TaskInstance::new(first_id, worker);
    store.task_dispatch(&instance).await.unwrap();

    assert_eq!(
        store.get_task(second_id).await.unwrap().state,
        TaskState::Pending
    );

    let output = TaskOutput::Value {
        type_tag: "int".to_owned(),
        value: models::encode_value(&100i64).unwrap(),
    };
    store.task_finish(&instance, &[output]).await.unwrap();

    assert_eq!(
        store.get_task(first_id).await.unwrap().state,
        TaskState::Succeeded
    );
    assert_eq!(
        store.get_task(second_id).await.unwrap().state,
        TaskState::Ready
    );
}

#[tokio::test]
async fn orphan_instance_reports_are_rejected() {
    let store = MemoryStorage::new();
    let (task_id, graph) = single_task_graph(literal_task("only"));
    store.add_job(ID::new(), ID::new(), &graph).await.unwrap();

    let worker = ID::new();
    let instance = TaskInstance::new(task_id, worker);
    store.task_dispatch(&instance).await.unwrap();

    // The worker goes dark; the task is reclaimed and re-dispatched.
    store.reclaim_task(task_id).await.unwrap();
    let fresh = TaskInstance::new(task_id, ID::new());
    store.task_dispatch(&fresh).await.unwrap();

    // The original worker coming back with a result must be turned away.
    let output = TaskOutput::Value {
        type_tag: "int".to_owned(),
        value: models::encode_value(&1i64).unwrap(),
    };
    assert!(matches!(
        store.task_finish(&instance, &[output]).await,
        Err(StorageError::PreconditionFailed(_))
    ));

    let task = store.get_task(task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Running);
    assert_eq!(task.retries, 1);
}

#[tokio::test]
async fn task_fail_honors_retry_policy() {
    let store = MemoryStorage::new();
    let (task_id, graph) = single_task_graph(literal_task("flaky").with_max_retries(1));
    store.add_job(ID::new(), ID::new(), &graph).await.unwrap();

    let worker = ID::new();

    let instance = TaskInstance::new(task_id, worker);
    store.task_dispatch(&instance).await.unwrap();
    store.task_fail(&instance, "boom").await.unwrap();

    let task = store.get_task(task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Ready);
    assert_eq!(task.retries, 1);
    assert_eq!(task.last_error.as_deref(), Some("boom"));

    let instance = TaskInstance::new(task_id, worker);
    store.task_dispatch(&instance).await.unwrap();
    store.task_fail(&instance, "boom again").await.unwrap();

    let task = store.get_task(task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
}

#[tokio::test]
async fn remove_data_refuses_while_referenced() {
    let store = MemoryStorage::new();

    let client = ID::new();
    let blob = Data::new(b"pinned".to_vec(), DataOwner::Driver(client));
    let blob_id = blob.id;
    store.add_driver_data(client, &blob).await.unwrap();

    let mut task = Task::new("reader");
    task.add_input(TaskInput::data(blob_id));
    task.add_output(TaskOutput::declared::<i64>());
    let (task_id, graph) = single_task_graph(task);
    store.add_job(ID::new(), client, &graph).await.unwrap();

    assert!(matches!(
        store.remove_data(blob_id).await,
        Err(StorageError::ConstraintViolation(_))
    ));

    store.set_task_state(task_id, TaskState::Succeeded).await.unwrap();
    store.remove_data(blob_id).await.unwrap();
}

#[tokio::test]
async fn dispatch_race_has_exactly_one_winner() {
    let store = Arc::new(MemoryStorage::new());
    let (task_id, graph) = single_task_graph(literal_task("contended"));
    store.add_job(ID::new(), ID::new(), &graph).await.unwrap();

    let a = TaskInstance::new(task_id, ID::new());
    let b = TaskInstance::new(task_id, ID::new());

    let (ra, rb) = tokio::join!(store.task_dispatch(&a), store.task_dispatch(&b));

    let winners = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = [ra, rb].into_iter().find(|r| r.is_err()).unwrap();
    assert!(matches!(loser, Err(StorageError::PreconditionFailed(_))));
}

#[tokio::test]
async fn reaper_reclaims_dead_workers_and_collects_dead_clients() {
    let store: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

    // A dead worker holding a running task.
    let worker_id = ID::new();
    let stale = Driver {
        id: FKey::from_id(worker_id),
        kind: DriverKind::Worker,
        address: Some("127.0.0.1:8001".into()),
        heartbeat: Utc::now() - Duration::seconds(3600),
    };
    store.add_driver(&stale).await.unwrap();

    let (task_id, graph) = single_task_graph(literal_task("interrupted"));
    store.add_job(ID::new(), ID::new(), &graph).await.unwrap();
    let instance = TaskInstance::new(task_id, worker_id);
    store.task_dispatch(&instance).await.unwrap();

    // A dead client owning a job plus one persisted and one scratch blob.
    let client_id = ID::new();
    let dead_client = Driver {
        id: FKey::from_id(client_id),
        kind: DriverKind::Client,
        address: None,
        heartbeat: Utc::now() - Duration::seconds(3600),
    };
    store.add_driver(&dead_client).await.unwrap();

    let (client_task, client_graph) = single_task_graph(literal_task("client_owned"));
    let client_job = ID::new();
    store.add_job(client_job, client_id, &client_graph).await.unwrap();
    store.set_task_state(client_task, TaskState::Succeeded).await.unwrap();

    let scratch = Data::new(b"scratch".to_vec(), DataOwner::Driver(client_id));
    let scratch_id = scratch.id;
    store.add_driver_data(client_id, &scratch).await.unwrap();

    let mut kept = Data::new(b"kept".to_vec(), DataOwner::Driver(client_id));
    kept.set_persisted(true);
    let kept_id = kept.id;
    store.add_driver_data(client_id, &kept).await.unwrap();

    let reclaimed = reap(&store).await.unwrap();
    assert_eq!(reclaimed, 1);

    let task = store.get_task(task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Ready);
    assert_eq!(task.retries, 1);

    assert!(matches!(
        store.get_job(client_job).await,
        Err(StorageError::KeyNotFound(_))
    ));
    assert!(matches!(
        store.get_data(scratch_id).await,
        Err(StorageError::KeyNotFound(_))
    ));
    assert!(store.get_data(kept_id).await.is_ok());
}

#[tokio::test]
async fn job_status_tracks_output_tasks() {
    let store = MemoryStorage::new();
    let (task_id, graph) = single_task_graph(literal_task("only"));
    let job = ID::new();
    store.add_job(job, ID::new(), &graph).await.unwrap();

    assert_eq!(store.get_job_status(job).await.unwrap(), JobStatus::Running);

    let instance = TaskInstance::new(task_id, ID::new());
    store.task_dispatch(&instance).await.unwrap();
    let output = TaskOutput::Value {
        type_tag: "int".to_owned(),
        value: models::encode_value(&5i64).unwrap(),
    };
    store.task_finish(&instance, &[output]).await.unwrap();

    assert_eq!(store.get_job_status(job).await.unwrap(), JobStatus::Succeeded);
}
