// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use dal::ID;
use models::{Data, DataOwner, Task, TaskGraph, TaskInput, TaskInstance, TaskOutput};
use proptest::prelude::*;
use storage::{mem::MemoryStorage, DataStorage, MetadataStorage, Storage};
use tokio::io::AsyncWriteExt;

use crate::{
    cache::LruCache,
    error::{ProtocolError, TaskExecutionError},
    pipe::{create_result_response, receive_message, send_message, ExecutorMessage,
        MAX_FRAME_SIZE},
    registry::{TaskContext, TaskRegistry},
    task_loop::{assemble_args, parse_outputs},
};

fn double(_context: &TaskContext, x: i64) -> Result<i64, String> {
    Ok(x * 2)
}

fn always_fails(_context: &TaskContext, _x: i64) -> Result<i64, String> {
    Err("nope".to_owned())
}

crate::register_task!(worker_test_lib, double(x: i64) -> i64);
crate::register_task!(worker_test_lib, always_fails(x: i64) -> i64);

fn test_context() -> TaskContext {
    let data: Arc<dyn DataStorage> = Arc::new(MemoryStorage::new());
    TaskContext::new(ID::new(), ID::new(), data, tokio::runtime::Handle::current())
}

#[tokio::test]
async fn pipe_message_response() {
    let (mut write_pipe, mut read_pipe) = tokio::io::duplex(1 << 16);

    let sample = vec![
        models::encode_value(&"test".to_owned()).unwrap(),
        models::encode_value(&3i64).unwrap(),
    ];
    let response = create_result_response(sample.clone());

    send_message(&mut write_pipe, &response).await.unwrap();

    let received = receive_message(&mut read_pipe).await.unwrap();
    let ExecutorMessage::Result(buffers) = received else {
        panic!("expected a result frame");
    };
    assert_eq!(buffers, sample);
    assert_eq!(
        models::decode_value::<String>(&buffers[0]).unwrap(),
        "test"
    );
    assert_eq!(models::decode_value::<i64>(&buffers[1]).unwrap(), 3);
}

#[tokio::test]
async fn pipe_eof_is_detected() {
    let (write_pipe, mut read_pipe) = tokio::io::duplex(64);
    drop(write_pipe);

    match receive_message(&mut read_pipe).await {
        Err(ProtocolError::PipeEof) => {}
        other => panic!("expected PipeEof, got {other:?}"),
    }
}

#[tokio::test]
async fn oversized_frames_are_rejected() {
    let (mut write_pipe, mut read_pipe) = tokio::io::duplex(64);

    let len = (MAX_FRAME_SIZE as u32) + 1;
    write_pipe.write_all(&len.to_le_bytes()).await.unwrap();

    match receive_message(&mut read_pipe).await {
        Err(ProtocolError::FrameTooLarge(_)) => {}
        other => panic!("expected FrameTooLarge, got {other:?}"),
    }
}

#[tokio::test]
async fn undecodable_payload_is_a_bad_frame() {
    let (mut write_pipe, mut read_pipe) = tokio::io::duplex(64);

    write_pipe.write_all(&3u32.to_le_bytes()).await.unwrap();
    write_pipe.write_all(b"zzz").await.unwrap();

    match receive_message(&mut read_pipe).await {
        Err(ProtocolError::BadFrame(_)) => {}
        other => panic!("expected BadFrame, got {other:?}"),
    }
}

proptest! {
    #[test]
    fn frame_round_trip(
        buffers in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..64),
            0..8,
        )
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (mut write_pipe, mut read_pipe) = tokio::io::duplex(1 << 20);
            let message = ExecutorMessage::Result(buffers.clone());
            send_message(&mut write_pipe, &message).await.unwrap();
            let received = receive_message(&mut read_pipe).await.unwrap();
            assert_eq!(received, message);
        });
    }
}

#[tokio::test]
async fn registry_resolves_registered_functions() {
    let registry = TaskRegistry::load(&["worker_test_lib".to_owned()]).unwrap();
    assert_eq!(registry.names(), vec!["always_fails", "double"]);

    let function = registry.get("double").unwrap();
    assert_eq!(function.input_types, &["int"][..]);
    assert_eq!(function.output_types, &["int"][..]);

    let context = test_context();
    let args = vec![models::encode_value(&21i64).unwrap()];
    let out = tokio::task::spawn_blocking(move || (function.call)(&context, &args))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(models::decode_value::<i64>(&out[0]).unwrap(), 42);
}

#[tokio::test]
async fn registry_rejects_unknown_libraries() {
    assert!(TaskRegistry::load(&["no_such_library".to_owned()]).is_err());
}

#[tokio::test]
async fn shim_reports_bad_arguments_and_task_errors() {
    let registry = TaskRegistry::load(&["worker_test_lib".to_owned()]).unwrap();

    let function = registry.get("double").unwrap();
    let context = test_context();
    let out = tokio::task::spawn_blocking(move || (function.call)(&context, &[]))
        .await
        .unwrap();
    assert!(matches!(out, Err(TaskExecutionError::ArgumentInvalid(_))));

    let function = registry.get("always_fails").unwrap();
    let context = test_context();
    let args = vec![models::encode_value(&1i64).unwrap()];
    let out = tokio::task::spawn_blocking(move || (function.call)(&context, &args))
        .await
        .unwrap();
    match out {
        Err(TaskExecutionError::TaskFailed(message)) => assert!(message.contains("nope")),
        other => panic!("expected TaskFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn assemble_args_covers_all_input_kinds() {
    let store: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let mut cache = LruCache::default();

    let client = ID::new();
    let blob = Data::new(b"blob-bytes".to_vec(), DataOwner::Driver(client));
    store.add_driver_data(client, &blob).await.unwrap();

    let mut graph = TaskGraph::new();
    let mut upstream = Task::new("upstream");
    upstream.add_input(TaskInput::literal(&1i64).unwrap());
    upstream.add_output(TaskOutput::declared::<i64>());
    let upstream_id = upstream.id;
    graph.add_task(upstream).unwrap();

    let mut consumer = Task::new("consumer");
    consumer.add_input(TaskInput::literal(&7i64).unwrap());
    consumer.add_input(TaskInput::data(blob.id));
    consumer.add_input(TaskInput::OutputRef {
        task: upstream_id,
        index: 0,
        type_tag: "int".to_owned(),
    });
    consumer.add_output(TaskOutput::declared::<i64>());
    let consumer_id = consumer.id;
    graph.add_task(consumer).unwrap();

    store.add_job(ID::new(), client, &graph).await.unwrap();

    // Run the upstream so its output is written.
    let instance = TaskInstance::new(upstream_id, ID::new());
    store.task_dispatch(&instance).await.unwrap();
    store
        .task_finish(
            &instance,
            &[TaskOutput::Value {
                type_tag: "int".to_owned(),
                value: models::encode_value(&99i64).unwrap(),
            }],
        )
        .await
        .unwrap();

    let consumer = store.get_task(consumer_id).await.unwrap();
    let buffers = assemble_args(&store, &consumer, &mut cache).await.unwrap();

    assert_eq!(buffers.len(), 3);
    assert_eq!(models::decode_value::<i64>(&buffers[0]).unwrap(), 7);
    assert_eq!(buffers[1], b"blob-bytes".to_vec());
    assert_eq!(models::decode_value::<i64>(&buffers[2]).unwrap(), 99);
}

#[tokio::test]
async fn parse_outputs_honors_declared_types() {
    let mut task = Task::new("producer");
    task.add_output(TaskOutput::declared::<i64>());
    task.add_output(TaskOutput::declared_tag(models::DATA_TYPE_TAG));

    let blob_id = ID::new();
    let buffers = vec![
        models::encode_value(&13i64).unwrap(),
        models::encode_value(&blob_id.as_uuid()).unwrap(),
    ];

    let outputs = parse_outputs(&task, &buffers).unwrap();
    assert_eq!(
        outputs[0],
        TaskOutput::Value {
            type_tag: "int".to_owned(),
            value: models::encode_value(&13i64).unwrap(),
        }
    );
    assert_eq!(outputs[1], TaskOutput::Data { id: blob_id });

    // Wrong arity is rejected.
    assert!(matches!(
        parse_outputs(&task, &buffers[..1]),
        Err(TaskExecutionError::OutputInvalid(_))
    ));

    // A data slot must contain a parseable UUID.
    let bad = vec![
        models::encode_value(&13i64).unwrap(),
        b"not-a-uuid".to_vec(),
    ];
    assert!(matches!(
        parse_outputs(&task, &bad),
        Err(TaskExecutionError::OutputInvalid(_))
    ));
}

#[tokio::test]
async fn task_context_round_trips_data() {
    let store = Arc::new(MemoryStorage::new());
    let data: Arc<dyn DataStorage> = store.clone();
    let context = TaskContext::new(ID::new(), ID::new(), data, tokio::runtime::Handle::current());

    let id = tokio::task::spawn_blocking(move || {
        let id = context.create_data(b"payload".to_vec()).unwrap();
        let bytes = context.get_data(id).unwrap();
        assert_eq!(bytes, b"payload".to_vec());
        id
    })
    .await
    .unwrap();

    let stored = store.get_data(id).await.unwrap();
    assert_eq!(stored.value, b"payload".to_vec());
}
