//! Event Store Integration Tests
//!
//! Tests for event log format, append operations, and replay order.

use std::collections::BTreeMap;

use ferry::core::EventStore;
use ferry::domain::{
    DeclaredStep, Event, EventType, PipelineRun, ReleaseCoordinates, RunState, StepKind,
    StepStatus, Trigger,
};
use tempfile::TempDir;
use uuid::Uuid;

fn started_run(run_id: Uuid) -> PipelineRun {
    PipelineRun::new(
        run_id,
        "release".to_string(),
        Trigger::manual(),
        ReleaseCoordinates::new("x64-linux", "0.4.0", "stable").unwrap(),
        &[
            DeclaredStep {
                name: "build".to_string(),
                kind: StepKind::Build,
            },
            DeclaredStep {
                name: "package".to_string(),
                kind: StepKind::Package,
            },
        ],
    )
}

#[tokio::test]
async fn test_event_append_format() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open_in(temp.path(), run_id).await.unwrap();

    let event = Event::new(run_id, EventType::StepStarted, "Starting build", StepStatus::Running)
        .for_step(0, "build");
    store.append(&event).await.unwrap();

    // One JSON object per line
    let raw = std::fs::read_to_string(store.events_path()).unwrap();
    assert_eq!(raw.lines().count(), 1);

    let value: serde_json::Value = serde_json::from_str(raw.trim()).unwrap();
    assert_eq!(value["event_type"], "step_started");
    assert_eq!(value["status"], "running");
    assert_eq!(value["step"], "build");
    assert_eq!(value["step_index"], 0);
    assert!(value.get("outputs").is_none());
    assert!(value["timestamp"].as_str().unwrap().contains('T'));
}

#[tokio::test]
async fn test_event_replay_order() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open_in(temp.path(), run_id).await.unwrap();

    for i in 0..5 {
        let event = Event::new(
            run_id,
            EventType::StepStarted,
            format!("Step {} started", i),
            StepStatus::Running,
        )
        .for_step(i, format!("step{}", i));
        store.append(&event).await.unwrap();
    }

    let events = store.replay().await.unwrap();
    assert_eq!(events.len(), 5);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.step, Some(format!("step{}", i)));
        assert_eq!(event.step_index, Some(i));
    }
}

#[tokio::test]
async fn test_run_reconstruction_from_log() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open_in(temp.path(), run_id).await.unwrap();
    let template = started_run(run_id);

    let mut outputs = BTreeMap::new();
    outputs.insert("artifact".to_string(), "app".to_string());

    let events = [
        Event::new(run_id, EventType::RunStarted, "started", StepStatus::Running)
            .with_run_info(template.info()),
        Event::new(run_id, EventType::StepStarted, "build", StepStatus::Running)
            .for_step(0, "build"),
        Event::new(run_id, EventType::StepSucceeded, "build", StepStatus::Succeeded)
            .for_step(0, "build")
            .with_duration(1500)
            .with_outputs(outputs),
        Event::new(run_id, EventType::StepStarted, "package", StepStatus::Running)
            .for_step(1, "package"),
        Event::new(run_id, EventType::StepSucceeded, "package", StepStatus::Succeeded)
            .for_step(1, "package"),
        Event::new(run_id, EventType::RunSucceeded, "done", StepStatus::Succeeded),
    ];
    for event in &events {
        store.append(event).await.unwrap();
    }

    let run = store.load_run().await.unwrap().unwrap();
    assert_eq!(run.id, run_id);
    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.exit_code(), 0);
    assert_eq!(run.steps[0].duration_ms, Some(1500));
    assert_eq!(run.steps[0].attempts, 1);
    assert_eq!(run.outputs.get("build", "artifact"), Some("app"));
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn test_retry_events_count_attempts() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open_in(temp.path(), run_id).await.unwrap();

    store
        .append(
            &Event::new(run_id, EventType::RunStarted, "started", StepStatus::Running)
                .with_run_info(started_run(run_id).info()),
        )
        .await
        .unwrap();
    for attempt in 0..2 {
        store
            .append(
                &Event::new(run_id, EventType::StepStarted, "build", StepStatus::Running)
                    .for_step(0, "build"),
            )
            .await
            .unwrap();
        if attempt == 0 {
            store
                .append(
                    &Event::new(run_id, EventType::StepRetrying, "retry", StepStatus::Running)
                        .for_step(0, "build")
                        .with_error("network error".to_string()),
                )
                .await
                .unwrap();
        }
    }

    let run = store.load_run().await.unwrap().unwrap();
    assert_eq!(run.steps[0].attempts, 2);
    assert_eq!(run.state, RunState::Running { step: 0 });
    assert!(!run.is_finished());
}

#[tokio::test]
async fn test_event_types_serialization() {
    let event_types = [
        (EventType::RunStarted, "run_started"),
        (EventType::RunSucceeded, "run_succeeded"),
        (EventType::RunFailed, "run_failed"),
        (EventType::StepStarted, "step_started"),
        (EventType::StepSucceeded, "step_succeeded"),
        (EventType::StepFailed, "step_failed"),
        (EventType::StepRetrying, "step_retrying"),
        (EventType::StepSkipped, "step_skipped"),
    ];

    for (event_type, expected) in event_types {
        let json = serde_json::to_string(&event_type).unwrap();
        assert_eq!(json, format!("\"{}\"", expected));
    }
}
