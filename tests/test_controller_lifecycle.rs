//! Context lifecycle, message routing and execution state.

mod common;

use std::time::Duration;

use common::{empty_program, eventually, CapturingFactory, Harness, ScriptedIo};
use sandbox_bridge::config::BufferConfig;
use sandbox_bridge::protocol::{
    ExecutionState, HeartbeatReport, HostMessage, SandboxMessage, TraceKind,
};
use sandbox_bridge::sandbox::{
    SandboxController, SandboxError, RESTART_DIAGNOSTIC, STOPPED_DIAGNOSTIC,
};
use serde_json::json;

fn harness() -> Harness<CapturingFactory> {
    Harness::new(
        CapturingFactory::default(),
        ScriptedIo::with_inputs(["x\n"]),
        empty_program(),
    )
}

fn controller(harness: &Harness<CapturingFactory>) -> SandboxController {
    SandboxController::new(BufferConfig::default(), harness.collaborators()).unwrap()
}

#[tokio::test]
async fn test_new_controller_spawns_idle_context() {
    let harness = harness();
    let controller = controller(&harness);

    assert_eq!(harness.factory.contexts().len(), 1);
    assert_eq!(controller.generation(), 1);
    assert_eq!(controller.execution_state(), ExecutionState::Disabled);
    assert!(controller.shared_buffers().is_none());
    assert!(harness.factory.latest().posted().is_empty());
}

#[tokio::test]
async fn test_start_posts_run_with_fresh_buffers() {
    let harness = harness();
    let controller = controller(&harness);

    controller.start(empty_program()).unwrap();
    let first = controller.shared_buffers().unwrap();
    controller.start(empty_program()).unwrap();
    let second = controller.shared_buffers().unwrap();

    let posted = harness.factory.latest().posted();
    assert_eq!(posted.len(), 2);
    assert!(posted.iter().all(|m| matches!(m, HostMessage::Run { .. })));
    assert!(!std::sync::Arc::ptr_eq(&first.stdin, &second.stdin));
    // The earlier run's buffers are released.
    assert!(first.stdin.receive().is_err());
    // Restarting a run does not replace the context.
    assert_eq!(controller.generation(), 1);
}

#[tokio::test]
async fn test_stop_then_start_has_empty_playback() {
    let harness = harness();
    let controller = controller(&harness);
    controller.start(empty_program()).unwrap();
    controller.handle_message(SandboxMessage::Stdin).await;
    assert_eq!(controller.playback().inputs().len(), 1);

    controller.stop().unwrap();
    assert_eq!(harness.io.stderr(), STOPPED_DIAGNOSTIC);
    assert_eq!(controller.execution_state(), ExecutionState::Disabled);
    assert_eq!(controller.generation(), 2);
    assert!(harness.factory.contexts()[0].is_terminated());

    controller.start(empty_program()).unwrap();
    assert!(controller.playback().is_empty());
    assert!(matches!(
        harness.factory.latest().posted().as_slice(),
        [HostMessage::Run { .. }]
    ));
}

#[tokio::test]
async fn test_restart_writes_its_own_diagnostic() {
    let harness = harness();
    let controller = controller(&harness);

    controller.restart().unwrap();

    assert_eq!(harness.io.stderr(), RESTART_DIAGNOSTIC);
    assert_eq!(controller.generation(), 2);
    assert_eq!(harness.observer.states(), vec![ExecutionState::Disabled]);
}

#[tokio::test]
async fn test_messages_from_retired_context_are_dropped() {
    let harness = harness();
    let controller = controller(&harness);
    let server = controller.clone();
    tokio::spawn(async move { server.serve().await });

    let retired = harness.factory.latest();
    controller.stop().unwrap();
    let current = harness.factory.latest();

    retired
        .outbox
        .send(SandboxMessage::Stdout {
            stdout: "ghost".into(),
        })
        .unwrap();
    current
        .outbox
        .send(SandboxMessage::Stdout {
            stdout: "alive".into(),
        })
        .unwrap();

    let io = harness.io.clone();
    eventually(|| io.stdout().contains("alive"), "current context output").await;
    assert_eq!(harness.io.stdout(), "alive");
}

#[tokio::test]
async fn test_ready_heartbeat_and_finished_drive_execution_state() {
    let harness = harness();
    let controller = controller(&harness);
    let mut heartbeats = controller.subscribe_heartbeats();

    controller.handle_message(SandboxMessage::Ready).await;
    assert_eq!(controller.execution_state(), ExecutionState::Ready);

    let report = HeartbeatReport {
        state: ExecutionState::Running,
        awaiting_program: false,
    };
    controller
        .handle_message(SandboxMessage::Heartbeat(report))
        .await;
    assert_eq!(controller.execution_state(), ExecutionState::Running);
    assert_eq!(heartbeats.recv().await.unwrap(), report);

    controller.handle_message(SandboxMessage::Finished).await;
    assert_eq!(controller.execution_state(), ExecutionState::Ready);
    assert_eq!(harness.observer.finished_count(), 1);
    assert_eq!(
        harness.observer.states(),
        vec![
            ExecutionState::Ready,
            ExecutionState::Running,
            ExecutionState::Ready
        ]
    );
}

#[tokio::test]
async fn test_output_and_traces_are_forwarded() {
    let harness = harness();
    let controller = controller(&harness);

    controller
        .handle_message(SandboxMessage::Stdout {
            stdout: "out".into(),
        })
        .await;
    controller
        .handle_message(SandboxMessage::Stderr {
            stderr: "err".into(),
        })
        .await;
    controller
        .handle_message(SandboxMessage::RuntimeCapture {
            payload: json!({"line": 3}),
        })
        .await;
    controller
        .handle_message(SandboxMessage::ModuleInfo {
            payload: json!({"module": "numpy"}),
        })
        .await;

    assert_eq!(harness.io.stdout(), "out");
    assert_eq!(harness.io.stderr(), "err");
    let traces = harness.observer.traces();
    assert_eq!(traces.len(), 2);
    assert_eq!(traces[0].kind, TraceKind::RuntimeCapture);
    assert_eq!(traces[0].payload, json!({"line": 3}));
    assert_eq!(traces[1].kind, TraceKind::ModuleInfo);
}

#[tokio::test]
async fn test_unrecognised_message_is_ignored() {
    let harness = harness();
    let controller = controller(&harness);

    let message = SandboxMessage::from_json(r#"{"type":"telemetry","cpu":0.4}"#).unwrap();
    assert_eq!(message, SandboxMessage::Unrecognised);
    controller.handle_message(message).await;

    assert_eq!(controller.execution_state(), ExecutionState::Disabled);
    assert!(harness.observer.states().is_empty());
    assert!(harness.io.stdout().is_empty());
    assert!(harness.io.stderr().is_empty());
}

#[tokio::test]
async fn test_load_module_and_heartbeat_are_posted() {
    let harness = harness();
    let controller = controller(&harness);

    controller.load_module("numpy").unwrap();
    controller.send_heartbeat().unwrap();

    let posted = harness.factory.latest().posted();
    assert!(matches!(
        posted.as_slice(),
        [HostMessage::LoadModule { name }, HostMessage::Heartbeat] if name == "numpy"
    ));
}

#[tokio::test]
async fn test_serve_returns_after_shutdown() {
    let harness = harness();
    let controller = controller(&harness);
    let handle = tokio::spawn(controller.clone().serve());

    controller.shutdown();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("serve kept running after shutdown")
        .unwrap();
    assert!(harness.factory.latest().is_terminated());
    assert!(matches!(
        controller.start(empty_program()),
        Err(SandboxError::NoContext)
    ));
}

#[tokio::test]
async fn test_serve_returns_when_last_handle_dropped() {
    let harness = harness();
    let controller = controller(&harness);
    let handle = tokio::spawn(controller.clone().serve());

    drop(controller);

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("serve kept running after the controller was dropped")
        .unwrap();
    assert!(harness.factory.latest().is_terminated());
}

#[tokio::test]
async fn test_stopped_context_is_not_reported_as_awaiting() {
    let harness = harness();
    let controller = controller(&harness);
    let mut heartbeats = controller.subscribe_heartbeats();
    let awaiting = HeartbeatReport {
        state: ExecutionState::Ready,
        awaiting_program: true,
    };

    controller.handle_message(SandboxMessage::Heartbeat(awaiting)).await;
    assert!(heartbeats.recv().await.unwrap().awaiting_program);

    controller.start(empty_program()).unwrap();
    controller.stop().unwrap();
    controller.handle_message(SandboxMessage::Heartbeat(awaiting)).await;
    assert!(!heartbeats.recv().await.unwrap().awaiting_program);

    // A forced restart brings back a context that needs its program.
    controller.restart().unwrap();
    controller.handle_message(SandboxMessage::Heartbeat(awaiting)).await;
    assert!(heartbeats.recv().await.unwrap().awaiting_program);
}
